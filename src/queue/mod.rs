//! Remote task queue access.
//!
//! Producer, workers and aggregator never share memory; the queue service is
//! the only coordination point between them. This module defines the typed
//! contract they use to talk to it:
//!
//! - [`QueueGateway`]: create/enqueue/dequeue/submit/get-result/status
//! - [`HttpQueueGateway`]: the HTTP implementation used by the CLI
//! - [`InMemoryQueue`]: an in-process implementation with the same semantics
//!
//! # Architecture
//!
//! ```text
//!   producer ──enqueue──▶ ┌─────────────┐ ◀──dequeue/submit── worker 1..N
//!                         │ queue svc   │
//!   aggregator ──status──▶└─────────────┘
//!              ──get-result──▶
//! ```
//!
//! Claim exclusivity (no two workers dequeue the same task) is a property of
//! the queue service, not of any client in this crate.

pub mod http;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::GatewayError;

pub use http::HttpQueueGateway;
pub use memory::InMemoryQueue;
pub use types::{Dequeued, QueueStatus, QueueTask, ResultStatus, TaskParams, TaskResult};

/// Typed client for the remote queue service.
///
/// Empty queues and absent results are ordinary outcomes, not errors:
/// [`dequeue`](QueueGateway::dequeue) returns [`Dequeued::Empty`] and
/// [`get_result`](QueueGateway::get_result) returns `None`.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Create a queue and return its id.
    async fn create_queue(&self, name: &str) -> Result<Uuid, GatewayError>;

    /// Submit a task with an opaque parameter string. Lower priority values are served first.
    async fn enqueue(&self, queue_id: Uuid, params: &str, priority: i32)
        -> Result<Uuid, GatewayError>;

    /// Claim the next task, if any.
    async fn dequeue(&self, queue_id: Uuid) -> Result<Dequeued, GatewayError>;

    /// Record the outcome of a claimed task.
    async fn submit_result(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
        output: &str,
        status: ResultStatus,
    ) -> Result<(), GatewayError>;

    /// Fetch the recorded outcome of a task.
    async fn get_result(
        &self,
        queue_id: Uuid,
        task_id: Uuid,
    ) -> Result<Option<TaskResult>, GatewayError>;

    /// Snapshot of pending and completed counts.
    async fn get_status(&self, queue_id: Uuid) -> Result<QueueStatus, GatewayError>;
}
