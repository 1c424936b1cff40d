//! Task worker loop.
//!
//! A worker claims one task at a time from a single queue, runs the
//! generation step for it and reports SUCCESS or FAILURE. Any number of
//! workers may run against the same queue; claim exclusivity is provided by
//! the queue service.
//!
//! # State machine
//!
//! ```text
//!   Polling ──empty──▶ sleep(poll_interval) ──▶ Polling
//!      │
//!      └─task─▶ decode params ──bad──▶ report FAILURE ─┐
//!                    │                                 │
//!                    └─ok─▶ generate ──err──▶ FAILURE ─┤
//!                              │                       │
//!                              └─ok─▶ write payload ─▶ SUCCESS ─▶ Polling
//! ```
//!
//! Content failures are never retried. Reporting is retried on transient
//! queue errors with linear backoff; after the last attempt one best-effort
//! FAILURE carrying the transport error is submitted and the loop moves on.
//! Shutdown is observed between tasks, never in the middle of one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::AppConfig;
use crate::error::{GatewayError, WorkerError};
use crate::generation::{QuizGenerator, UnitInput};
use crate::payload::{write_payload, UnitPayload};
use crate::queue::{Dequeued, QueueGateway, QueueTask, ResultStatus};

/// Default worker id: `worker-{pid}`.
pub fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

/// Configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    /// Sleep after an empty dequeue or a transient dequeue error.
    pub poll_interval: Duration,
    /// Result submission attempts before giving up on a report.
    pub max_retries: u32,
    /// Delay schedule between submission attempts.
    pub retry_policy: BackoffPolicy,
    /// Stop at the first empty dequeue instead of polling forever.
    pub drain: bool,
    /// Where result payloads are written.
    pub results_dir: PathBuf,
}

impl WorkerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval: config.worker.poll_interval(),
            max_retries: config.worker.max_retries.max(1),
            retry_policy: config.worker.retry_policy(),
            drain: false,
            results_dir: config.storage.results_dir.clone(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_drain(mut self, drain: bool) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, policy: BackoffPolicy) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_policy = policy;
        self
    }
}

/// Counters for one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Tasks dequeued.
    pub claimed: u64,
    /// Tasks reported as SUCCESS.
    pub succeeded: u64,
    /// Tasks reported as FAILURE, including best-effort reports.
    pub failed: u64,
    /// Tasks whose intended report could not be delivered.
    pub report_failures: u64,
    /// Dequeue calls that returned no task.
    pub empty_polls: u64,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Shutdown,
    Drained,
}

/// Outcome of submitting one report.
enum Delivery {
    Delivered,
    /// Gave up; carries the last error.
    Undelivered(GatewayError),
}

/// Polling worker bound to one queue.
pub struct TaskWorker {
    queue_id: Uuid,
    gateway: Arc<dyn QueueGateway>,
    generator: Arc<dyn QuizGenerator>,
    options: WorkerOptions,
    shutdown_rx: broadcast::Receiver<()>,
    stats: WorkerStats,
}

impl TaskWorker {
    pub fn new(
        queue_id: Uuid,
        gateway: Arc<dyn QueueGateway>,
        generator: Arc<dyn QuizGenerator>,
        options: WorkerOptions,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue_id,
            gateway,
            generator,
            options,
            shutdown_rx,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.options.worker_id
    }

    /// Run until shutdown, drain or a fatal queue error.
    ///
    /// # Errors
    ///
    /// - `WorkerError::QueueNotFound` when the queue no longer exists
    /// - `WorkerError::Gateway` when the service rejects the dequeue request
    /// - `WorkerError::Io` when the results directory cannot be created
    pub async fn run(mut self) -> Result<(WorkerStats, StopReason), WorkerError> {
        tokio::fs::create_dir_all(&self.options.results_dir).await?;
        info!(
            worker_id = %self.options.worker_id,
            queue_id = %self.queue_id,
            generator = self.generator.name(),
            "Worker started"
        );

        let reason = loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.options.worker_id, "Worker received shutdown signal");
                    break StopReason::Shutdown;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.gateway.dequeue(self.queue_id).await {
                Ok(Dequeued::Task(task)) => self.process(task).await,
                Ok(Dequeued::Empty) => {
                    self.stats.empty_polls += 1;
                    if self.options.drain {
                        info!(worker_id = %self.options.worker_id, "Queue drained");
                        break StopReason::Drained;
                    }
                    debug!(worker_id = %self.options.worker_id, "No tasks available");
                    if self.pause(self.options.poll_interval).await {
                        break StopReason::Shutdown;
                    }
                }
                Err(GatewayError::NotFound(message)) => {
                    error!(
                        worker_id = %self.options.worker_id,
                        queue_id = %self.queue_id,
                        error = %message,
                        "Queue not found, stopping"
                    );
                    self.log_stats();
                    return Err(WorkerError::QueueNotFound(self.queue_id));
                }
                Err(e @ GatewayError::InvalidRequest(_)) => {
                    self.log_stats();
                    return Err(WorkerError::Gateway(e));
                }
                Err(e) => {
                    warn!(
                        worker_id = %self.options.worker_id,
                        error = %e,
                        "Failed to dequeue task, will retry"
                    );
                    if self.pause(self.options.poll_interval).await {
                        break StopReason::Shutdown;
                    }
                }
            }
        };

        self.log_stats();
        Ok((self.stats, reason))
    }

    /// Sleep unless shutdown arrives first. Returns true on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown_rx.recv() => true,
        }
    }

    fn log_stats(&self) {
        info!(
            worker_id = %self.options.worker_id,
            claimed = self.stats.claimed,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            report_failures = self.stats.report_failures,
            "Worker stopped"
        );
    }

    async fn process(&mut self, task: QueueTask) {
        self.stats.claimed += 1;
        let task_id = task.id;

        let params = match task.decode_params() {
            Ok(params) => params,
            Err(e) => {
                warn!(
                    worker_id = %self.options.worker_id,
                    task_id = %task_id,
                    error = %e,
                    "Malformed task parameters"
                );
                self.report(task_id, ResultStatus::Failure, &e.to_string()).await;
                return;
            }
        };

        info!(
            worker_id = %self.options.worker_id,
            task_id = %task_id,
            unit_index = params.unit_index,
            "Processing task"
        );

        let unit = UnitInput {
            job_id: params.job_id,
            unit_index: params.unit_index,
            unit_ref: params.unit_ref,
            source_name: params.source_name,
        };

        let items = match self.generator.generate(&unit).await {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    worker_id = %self.options.worker_id,
                    task_id = %task_id,
                    unit_index = unit.unit_index,
                    error = %e,
                    "Generation failed"
                );
                self.report(task_id, ResultStatus::Failure, &e.to_string()).await;
                return;
            }
        };

        let payload = UnitPayload::new(unit.job_id, unit.unit_index, unit.source_name, items);
        match write_payload(&self.options.results_dir, &payload).await {
            Ok(path) => {
                let output = path.to_string_lossy().into_owned();
                self.report(task_id, ResultStatus::Success, &output).await;
            }
            Err(e) => {
                error!(
                    worker_id = %self.options.worker_id,
                    task_id = %task_id,
                    error = %e,
                    "Failed to write result payload"
                );
                let diagnostic = format!("failed to write result payload: {}", e);
                self.report(task_id, ResultStatus::Failure, &diagnostic).await;
            }
        }
    }

    /// Report an outcome, falling back to one FAILURE report if delivery fails.
    async fn report(&mut self, task_id: Uuid, status: ResultStatus, output: &str) {
        let last_error = match self.submit_with_retry(task_id, status, output).await {
            Delivery::Delivered => {
                match status {
                    ResultStatus::Success => self.stats.succeeded += 1,
                    ResultStatus::Failure => self.stats.failed += 1,
                }
                debug!(
                    worker_id = %self.options.worker_id,
                    task_id = %task_id,
                    status = %status,
                    "Result submitted"
                );
                return;
            }
            Delivery::Undelivered(e) => e,
        };

        self.stats.report_failures += 1;
        error!(
            worker_id = %self.options.worker_id,
            task_id = %task_id,
            status = %status,
            error = %last_error,
            "Result submission failed"
        );
        if !last_error.is_transient() {
            return;
        }

        let diagnostic = format!(
            "result submission failed after {} attempts: {}",
            self.options.max_retries, last_error
        );
        match self
            .gateway
            .submit_result(self.queue_id, task_id, &diagnostic, ResultStatus::Failure)
            .await
        {
            Ok(()) => self.stats.failed += 1,
            Err(e) => warn!(
                worker_id = %self.options.worker_id,
                task_id = %task_id,
                error = %e,
                "Best-effort failure report was not delivered"
            ),
        }
    }

    async fn submit_with_retry(
        &self,
        task_id: Uuid,
        status: ResultStatus,
        output: &str,
    ) -> Delivery {
        let mut attempt = 1;
        loop {
            match self
                .gateway
                .submit_result(self.queue_id, task_id, output, status)
                .await
            {
                Ok(()) => return Delivery::Delivered,
                Err(e) if e.is_transient() && attempt < self.options.max_retries => {
                    let delay = self.options.retry_policy.delay_for_attempt(attempt);
                    warn!(
                        worker_id = %self.options.worker_id,
                        task_id = %task_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying result submission"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Delivery::Undelivered(e),
            }
        }
    }
}
