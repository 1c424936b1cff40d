//! Job aggregation.
//!
//! The aggregator resolves a job's manifest, waits until the queue reports
//! every expected task as resulted, fetches each result in manifest order,
//! merges the SUCCESS payloads in unit order and writes the deck.
//!
//! A run aborts when the manifest cannot be resolved, when the queue
//! disappears while waiting, or when the service rejects a status request
//! as invalid. Transient status errors are retried. Missing results, FAILURE
//! results and bad payloads lower the success ratio instead.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::AppConfig;
use crate::error::{AggregateError, GatewayError};
use crate::export::{write_deck, DeckRow};
use crate::manifest::{JobManifest, ManifestRef, ManifestStore};
use crate::payload::read_payload;
use crate::queue::{QueueGateway, QueueStatus, TaskResult};

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct AggregatorOptions {
    /// Delay schedule between status polls.
    pub poll_policy: BackoffPolicy,
    /// Directory for decks when no explicit path is given.
    pub output_dir: PathBuf,
    /// Explicit deck path.
    pub output_path: Option<PathBuf>,
    /// Display name reported with the deck.
    pub deck_name: String,
}

impl AggregatorOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_policy: config.aggregator.poll_policy(),
            output_dir: config.storage.output_dir.clone(),
            output_path: None,
            deck_name: config.deck.name.clone(),
        }
    }

    pub fn with_output_path(mut self, path: Option<PathBuf>) -> Self {
        self.output_path = path;
        self
    }

    fn deck_path(&self, job_id: Uuid) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join(format!("{}_deck.csv", job_id)))
    }
}

/// What the completion wait observed.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitReport {
    /// Status calls made, including failed ones.
    pub polls: u32,
    pub transient_errors: u32,
    /// Delays slept between polls, in order.
    pub delays: Vec<Duration>,
    /// The snapshot that satisfied the completion predicate.
    pub final_status: QueueStatus,
}

/// Results fetched for a job, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub results: Vec<TaskResult>,
    /// Task ids with no result or a failed lookup.
    pub missing: Vec<Uuid>,
}

/// Flashcards merged from SUCCESS payloads.
#[derive(Debug, Clone, Default)]
pub struct Merged {
    /// Rows in ascending unit order.
    pub rows: Vec<DeckRow>,
    pub units_represented: usize,
    pub failures: usize,
    pub bad_payloads: usize,
}

/// Final statistics of an aggregation run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregationSummary {
    pub job_id: Uuid,
    pub queue_id: Uuid,
    pub source_name: String,
    pub deck_name: String,
    pub deck_path: PathBuf,
    /// Results the job was waiting for.
    pub expected: usize,
    pub results_collected: usize,
    pub missing_results: usize,
    pub failed_units: usize,
    pub bad_payloads: usize,
    pub units_represented: usize,
    pub items: usize,
    /// Distinct units represented divided by expected results.
    pub success_ratio: f64,
}

/// Waits for, collects and merges a job's results.
pub struct ResultAggregator {
    gateway: Arc<dyn QueueGateway>,
    manifests: ManifestStore,
    options: AggregatorOptions,
}

impl ResultAggregator {
    pub fn new(
        gateway: Arc<dyn QueueGateway>,
        manifests: ManifestStore,
        options: AggregatorOptions,
    ) -> Self {
        Self {
            gateway,
            manifests,
            options,
        }
    }

    /// Aggregate a job end to end and write its deck.
    ///
    /// # Errors
    ///
    /// - `AggregateError::Manifest` if the manifest cannot be resolved
    /// - `AggregateError::QueueNotFound` if the queue disappears while waiting
    /// - `AggregateError::Gateway` if the service rejects a status request as
    ///   invalid; the wait stops at the first such error instead of retrying
    /// - `AggregateError::Export` if the deck cannot be written
    pub async fn aggregate(
        &self,
        reference: ManifestRef,
    ) -> Result<AggregationSummary, AggregateError> {
        let manifest = self.manifests.resolve(reference)?;
        info!(
            job_id = %manifest.job_id,
            queue_id = %manifest.queue_id,
            expected = manifest.expected_count(),
            "Aggregating job"
        );

        let wait = self.wait_for_completion(&manifest).await?;
        debug!(
            job_id = %manifest.job_id,
            polls = wait.polls,
            transient_errors = wait.transient_errors,
            "Job complete"
        );

        let collected = self.collect(&manifest).await;
        let merged = merge(&manifest, &collected).await;

        let deck_path = self.options.deck_path(manifest.job_id);
        let items = write_deck(&deck_path, &manifest.source_name, &merged.rows)?;

        let expected = manifest.expected_count();
        let summary = AggregationSummary {
            job_id: manifest.job_id,
            queue_id: manifest.queue_id,
            source_name: manifest.source_name.clone(),
            deck_name: self.options.deck_name.clone(),
            deck_path,
            expected,
            results_collected: collected.results.len(),
            missing_results: collected.missing.len(),
            failed_units: merged.failures,
            bad_payloads: merged.bad_payloads,
            units_represented: merged.units_represented,
            items,
            success_ratio: success_ratio(merged.units_represented, expected),
        };

        info!(
            job_id = %summary.job_id,
            deck = %summary.deck_path.display(),
            items = summary.items,
            units = summary.units_represented,
            expected = summary.expected,
            success_ratio = summary.success_ratio,
            "Aggregation finished"
        );
        Ok(summary)
    }

    /// Poll status until `pending == 0 && completed == expected`.
    ///
    /// Delays start at the policy's base and grow after every non-terminal
    /// poll or transient error, up to the policy's ceiling. There is no
    /// attempt limit.
    pub async fn wait_for_completion(
        &self,
        manifest: &JobManifest,
    ) -> Result<WaitReport, AggregateError> {
        let expected = manifest.expected_count();
        let mut delay = self.options.poll_policy.initial_delay();
        let mut report = WaitReport {
            polls: 0,
            transient_errors: 0,
            delays: Vec::new(),
            final_status: QueueStatus::default(),
        };

        loop {
            report.polls += 1;
            match self.gateway.get_status(manifest.queue_id).await {
                Ok(status) if status.is_complete(expected) => {
                    report.final_status = status;
                    return Ok(report);
                }
                Ok(status) => {
                    info!(
                        queue_id = %manifest.queue_id,
                        pending = status.pending_count,
                        completed = status.completed_count,
                        expected,
                        delay_ms = delay.as_millis() as u64,
                        "Waiting for tasks"
                    );
                }
                Err(GatewayError::NotFound(_)) => {
                    return Err(AggregateError::QueueNotFound(manifest.queue_id));
                }
                Err(e) if e.is_transient() => {
                    report.transient_errors += 1;
                    warn!(
                        queue_id = %manifest.queue_id,
                        attempt = report.polls,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Status poll failed, backing off"
                    );
                }
                Err(e) => return Err(AggregateError::Gateway(e)),
            }

            tokio::time::sleep(delay).await;
            report.delays.push(delay);
            delay = self.options.poll_policy.next_delay(delay);
        }
    }

    /// Fetch every manifest task's result in manifest order.
    pub async fn collect(&self, manifest: &JobManifest) -> Collected {
        let mut collected = Collected::default();
        for task_id in &manifest.task_ids {
            match self.gateway.get_result(manifest.queue_id, *task_id).await {
                Ok(Some(result)) => collected.results.push(result),
                Ok(None) => {
                    warn!(task_id = %task_id, "No result recorded for task, skipping");
                    collected.missing.push(*task_id);
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Failed to fetch result, skipping");
                    collected.missing.push(*task_id);
                }
            }
        }
        collected
    }
}

/// Load SUCCESS payloads and order their items by unit index.
pub async fn merge(manifest: &JobManifest, collected: &Collected) -> Merged {
    let mut merged = Merged::default();
    let mut units: Vec<(u32, Vec<DeckRow>)> = Vec::new();

    for result in &collected.results {
        if !result.is_success() {
            debug!(task_id = %result.task_id, diagnostic = %result.output, "Skipping failed unit");
            merged.failures += 1;
            continue;
        }

        let payload = match read_payload(std::path::Path::new(&result.output)).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %result.task_id, path = %result.output, error = %e, "Skipping unreadable payload");
                merged.bad_payloads += 1;
                continue;
            }
        };
        if payload.job_id != manifest.job_id {
            warn!(
                task_id = %result.task_id,
                payload_job = %payload.job_id,
                "Payload belongs to another job, skipping"
            );
            merged.bad_payloads += 1;
            continue;
        }

        let rows = payload
            .items
            .into_iter()
            .map(|pair| DeckRow {
                unit_index: payload.unit_index,
                pair,
            })
            .collect();
        units.push((payload.unit_index, rows));
    }

    // Stable sort keeps fetch order among duplicate unit indexes.
    units.sort_by_key(|(unit_index, _)| *unit_index);
    let distinct: BTreeSet<u32> = units
        .iter()
        .filter(|(_, rows)| !rows.is_empty())
        .map(|(unit_index, _)| *unit_index)
        .collect();
    merged.units_represented = distinct.len();
    merged.rows = units.into_iter().flat_map(|(_, rows)| rows).collect();
    merged
}

fn success_ratio(represented: usize, expected: usize) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    represented as f64 / expected as f64
}
