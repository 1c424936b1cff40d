//! Messages exchanged with the queue service.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;

/// Job kind carried in every task this crate enqueues.
pub const GENERATE_QUIZ_JOB: &str = "generate_quiz";

/// A task as handed out by the queue. `params` is opaque to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTask {
    pub id: Uuid,
    pub params: String,
    pub priority: i32,
}

impl QueueTask {
    /// Decode the parameter payload.
    pub fn decode_params(&self) -> Result<TaskParams, GatewayError> {
        TaskParams::decode(&self.params)
    }
}

/// Outcome of a dequeue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued {
    Task(QueueTask),
    Empty,
}

/// Final status of a processed task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failure,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "SUCCESS"),
            ResultStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Recorded outcome of one task.
///
/// For `Success` the output is the path of the unit's payload file; for
/// `Failure` it is a diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: Uuid,
    pub output: String,
    pub status: ResultStatus,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Tasks without a result yet.
    pub pending_count: u64,
    /// Tasks with a result.
    pub completed_count: u64,
    pub has_pending: bool,
}

impl QueueStatus {
    /// Whether every expected task has a result and nothing is outstanding.
    pub fn is_complete(&self, expected: usize) -> bool {
        self.pending_count == 0 && self.completed_count == expected as u64
    }

    /// Percentage of completed tasks among all tasks the queue knows about.
    pub fn progress_percent(&self) -> f64 {
        let total = self.pending_count + self.completed_count;
        if total == 0 {
            return 0.0;
        }
        self.completed_count as f64 / total as f64 * 100.0
    }
}

/// Parameters a worker needs to process one unit.
///
/// Serialized to a JSON string when enqueued; decoded and validated when a
/// worker claims the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskParams {
    /// Job kind; always [`GENERATE_QUIZ_JOB`].
    pub job: String,
    pub job_id: Uuid,
    /// 1-based position of the unit in the source document.
    pub unit_index: u32,
    /// Location of the extracted unit.
    pub unit_ref: PathBuf,
    /// File name of the source document.
    pub source_name: String,
}

impl TaskParams {
    pub fn new(
        job_id: Uuid,
        unit_index: u32,
        unit_ref: impl Into<PathBuf>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            job: GENERATE_QUIZ_JOB.to_string(),
            job_id,
            unit_index,
            unit_ref: unit_ref.into(),
            source_name: source_name.into(),
        }
    }

    /// Encode for the queue's opaque params field.
    pub fn encode(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self)
            .map_err(|e| GatewayError::InvalidRequest(format!("cannot encode task params: {}", e)))
    }

    /// Decode and validate a params string.
    ///
    /// Any malformed or incomplete payload is an `InvalidRequest`.
    pub fn decode(raw: &str) -> Result<Self, GatewayError> {
        let params: TaskParams = serde_json::from_str(raw)
            .map_err(|e| GatewayError::InvalidRequest(format!("malformed task params: {}", e)))?;

        if params.job != GENERATE_QUIZ_JOB {
            return Err(GatewayError::InvalidRequest(format!(
                "unsupported job kind '{}'",
                params.job
            )));
        }
        if params.unit_index == 0 {
            return Err(GatewayError::InvalidRequest(
                "unit_index must be 1-based".to_string(),
            ));
        }
        if params.unit_ref.as_os_str().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "unit_ref cannot be empty".to_string(),
            ));
        }
        Ok(params)
    }
}
