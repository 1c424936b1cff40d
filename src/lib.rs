//! quiz_forge: distributed flashcard generation over a task queue.
//!
//! A producer splits a document into page tasks on a remote queue, workers
//! turn each page into question/answer pairs, and an aggregator merges the
//! results of a finished job into a CSV deck.

pub mod aggregator;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod generation;
pub mod llm;
pub mod manifest;
pub mod payload;
pub mod producer;
pub mod queue;
pub mod worker;

// Re-export commonly used error types
pub use error::{
    AggregateError, FailureClass, GatewayError, GenerationError, ManifestError, ProducerError,
    WorkerError,
};
