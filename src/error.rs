//! Error types for quiz-forge operations.
//!
//! Defines error types for each subsystem:
//! - Queue service communication
//! - Page extraction and quiz generation
//! - Job manifests and result payloads
//! - Producer, aggregator and export stages
//!
//! The CLI boundary collapses all of these into a [`FailureClass`], which
//! decides the process exit status.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a queue gateway.
///
/// The three kinds are disjoint on purpose: callers retry `Transient` and
/// treat the other two as final for the current operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// The referenced queue or task does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request or a payload decoded from the queue was malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Network failure, timeout or an unexpected response from the service.
    #[error("Transient queue service error: {0}")]
    Transient(String),
}

impl GatewayError {
    /// Whether the operation may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// Whether the service reported the referenced resource as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for provider '{0}'")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

/// Content-level failures of the generation step.
///
/// None of these are retried: the unit is reported as a FAILURE result and
/// the worker moves on.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Unit '{path}' could not be read: {reason}")]
    UnreadableUnit { path: String, reason: String },

    #[error("Unit {unit_index} has no text to generate from")]
    EmptyUnit { unit_index: u32 },

    #[error("Generation service refused the request: {0}")]
    Refused(String),

    #[error("No question/answer pairs found in generation output")]
    NoPairs,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Errors raised while validating or splitting a source document.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Source not found: {0}")]
    NotFound(PathBuf),

    #[error("Source is not a file: {0}")]
    NotAFile(PathBuf),

    #[error("Source is not a PDF: {0}")]
    NotAPdf(PathBuf),

    #[error("Invalid or corrupted PDF '{path}': {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("PDF '{0}' has no pages")]
    NoPages(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while persisting or resolving job manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("No manifest found for job {0}")]
    NotFound(Uuid),

    #[error("No manifest references queue {0}")]
    NoJobForQueue(Uuid),

    #[error("Manifest for job {job_id} is inconsistent: {reason}")]
    Inconsistent { job_id: Uuid, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while reading or writing per-unit result payloads.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload file '{0}' does not exist")]
    Missing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors that abort a job submission.
///
/// Per-unit enqueue failures are not represented here: they are logged and
/// skipped by the producer.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Source rejected: {0}")]
    Source(#[from] ExtractError),

    #[error("Queue service error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Failed to persist manifest: {0}")]
    Manifest(#[from] ManifestError),
}

/// Errors that abort an aggregation run.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("Could not resolve manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Queue {0} no longer exists")]
    QueueNotFound(Uuid),

    #[error("Queue service error: {0}")]
    Gateway(GatewayError),

    #[error("Failed to write deck: {0}")]
    Export(#[from] ExportError),
}

/// Errors that can occur during deck export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that end a worker loop.
///
/// Individual task failures never surface here.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue {0} no longer exists")]
    QueueNotFound(Uuid),

    #[error("Queue service rejected the request: {0}")]
    Gateway(GatewayError),

    #[error("Failed to prepare results directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used for process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// A required input (source, manifest, config file, identifier) is missing or unusable.
    MissingInput,
    /// The queue service was unreachable or rejected the request.
    RemoteService,
    /// Anything else.
    Internal,
}

impl FailureClass {
    /// Process exit status for this class.
    pub fn exit_code(self) -> i32 {
        match self {
            FailureClass::MissingInput => 2,
            FailureClass::RemoteService => 3,
            FailureClass::Internal => 1,
        }
    }

    /// Classify an error by walking its source chain.
    pub fn of(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(class) = Self::classify(cause) {
                return class;
            }
        }
        FailureClass::Internal
    }

    fn classify(cause: &(dyn std::error::Error + 'static)) -> Option<Self> {
        if cause.is::<GatewayError>() {
            return Some(FailureClass::RemoteService);
        }
        if let Some(err) = cause.downcast_ref::<AggregateError>() {
            return Some(match err {
                AggregateError::QueueNotFound(_) | AggregateError::Gateway(_) => {
                    FailureClass::RemoteService
                }
                AggregateError::Manifest(_) => FailureClass::MissingInput,
                AggregateError::Export(_) => FailureClass::Internal,
            });
        }
        if let Some(err) = cause.downcast_ref::<WorkerError>() {
            return Some(match err {
                WorkerError::QueueNotFound(_) | WorkerError::Gateway(_) => {
                    FailureClass::RemoteService
                }
                WorkerError::Io(_) => FailureClass::Internal,
            });
        }
        if let Some(err) = cause.downcast_ref::<ProducerError>() {
            return Some(match err {
                ProducerError::Source(_) => FailureClass::MissingInput,
                ProducerError::Gateway(_) => FailureClass::RemoteService,
                ProducerError::Manifest(_) => FailureClass::Internal,
            });
        }
        if let Some(err) = cause.downcast_ref::<ManifestError>() {
            return Some(match err {
                ManifestError::NotFound(_) | ManifestError::NoJobForQueue(_) => {
                    FailureClass::MissingInput
                }
                _ => FailureClass::Internal,
            });
        }
        if cause.is::<ExtractError>() {
            return Some(FailureClass::MissingInput);
        }
        if cause.is::<ConfigError>() {
            return Some(FailureClass::MissingInput);
        }
        if cause.is::<uuid::Error>() {
            return Some(FailureClass::MissingInput);
        }
        None
    }
}
