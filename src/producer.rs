//! Job submission.
//!
//! The producer validates a source, creates one queue for the job, enqueues
//! one task per unit with priority equal to the unit index, and persists the
//! manifest once every enqueue attempt has finished. A job without a
//! manifest does not exist as far as the aggregator is concerned.

use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{GatewayError, ProducerError};
use crate::extract::UnitSource;
use crate::manifest::{JobManifest, ManifestStore};
use crate::queue::{QueueGateway, TaskParams};

/// Prefix of generated queue names.
const QUEUE_NAME_PREFIX: &str = "pdf-";

/// Default queue name for a job: `pdf-` plus the first 8 characters of its id.
pub fn default_queue_name(job_id: Uuid) -> String {
    let simple = job_id.simple().to_string();
    format!("{}{}", QUEUE_NAME_PREFIX, &simple[..8])
}

/// Splits sources into tasks and records job manifests.
pub struct TaskProducer {
    gateway: Arc<dyn QueueGateway>,
    source: Arc<dyn UnitSource>,
    manifests: ManifestStore,
}

impl TaskProducer {
    pub fn new(
        gateway: Arc<dyn QueueGateway>,
        source: Arc<dyn UnitSource>,
        manifests: ManifestStore,
    ) -> Self {
        Self {
            gateway,
            source,
            manifests,
        }
    }

    /// Submit a source document as a new job and return its manifest.
    ///
    /// # Errors
    ///
    /// - `ProducerError::Source` if the source cannot be validated or split
    /// - `ProducerError::Gateway` if the queue cannot be created or no task is accepted
    /// - `ProducerError::Manifest` if the manifest cannot be written
    ///
    /// Individual enqueue failures are logged and the unit is left out of
    /// the manifest.
    pub async fn submit(
        &self,
        source_path: &Path,
        queue_name: Option<&str>,
    ) -> Result<JobManifest, ProducerError> {
        self.source.validate(source_path)?;

        let job_id = Uuid::new_v4();
        let source_name = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("source")
            .to_string();
        let queue_name = queue_name
            .map(str::to_string)
            .unwrap_or_else(|| default_queue_name(job_id));

        let queue_id = self.gateway.create_queue(&queue_name).await?;
        tracing::info!(
            job_id = %job_id,
            queue_id = %queue_id,
            queue_name = %queue_name,
            "Created queue"
        );

        let units = self.source.split(source_path, job_id)?;
        let mut manifest = JobManifest::new(job_id, queue_id, source_name.clone());
        manifest.total_units = units.len() as u32;

        let mut last_error: Option<GatewayError> = None;
        for (position, unit_ref) in units.iter().enumerate() {
            let unit_index = position as u32 + 1;
            let params = TaskParams::new(job_id, unit_index, unit_ref, source_name.clone());

            let outcome = match params.encode() {
                Ok(raw) => self.gateway.enqueue(queue_id, &raw, unit_index as i32).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(task_id) => {
                    tracing::debug!(
                        queue_id = %queue_id,
                        task_id = %task_id,
                        unit_index,
                        "Enqueued task"
                    );
                    manifest.task_ids.push(task_id);
                }
                Err(e) => {
                    tracing::warn!(
                        queue_id = %queue_id,
                        unit_index,
                        error = %e,
                        "Failed to enqueue unit, skipping"
                    );
                    last_error = Some(e);
                }
            }
        }

        if manifest.task_ids.is_empty() {
            return Err(ProducerError::Gateway(last_error.unwrap_or_else(|| {
                GatewayError::InvalidRequest("source produced no units".to_string())
            })));
        }

        let path = self.manifests.save(&manifest)?;
        tracing::info!(
            job_id = %job_id,
            queue_id = %queue_id,
            tasks = manifest.task_ids.len(),
            skipped = manifest.skipped_units(),
            manifest = %path.display(),
            "Job submitted"
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::extract::test_support::pdf_with_pages;
    use crate::extract::PdfPageSource;
    use crate::queue::{Dequeued, InMemoryQueue};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        queue: Arc<InMemoryQueue>,
        producer: TaskProducer,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let queue = Arc::new(InMemoryQueue::new());
            let producer = TaskProducer::new(
                queue.clone(),
                Arc::new(PdfPageSource::new(dir.path().join("pages"))),
                ManifestStore::new(dir.path().join("metadata")),
            );
            Self {
                dir,
                queue,
                producer,
            }
        }

        fn pdf(&self, name: &str, pages: &[&str]) -> std::path::PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, pdf_with_pages(pages)).unwrap();
            path
        }

        fn store(&self) -> ManifestStore {
            ManifestStore::new(self.dir.path().join("metadata"))
        }
    }

    #[test]
    fn test_default_queue_name() {
        let id = Uuid::parse_str("12345678-9abc-def0-1234-56789abcdef0").unwrap();
        assert_eq!(default_queue_name(id), "pdf-12345678");
    }

    #[tokio::test]
    async fn test_submit_three_pages() {
        let fx = Fixture::new();
        let pdf = fx.pdf("lecture.pdf", &["One", "Two", "Three"]);

        let manifest = fx.producer.submit(&pdf, None).await.expect("submitted");
        assert_eq!(manifest.task_ids.len(), 3);
        assert_eq!(manifest.total_units, 3);
        assert_eq!(manifest.expected_count(), 3);
        assert_eq!(manifest.source_name, "lecture.pdf");
        assert_eq!(fx.queue.queue_count(), 1);
        assert_eq!(fx.queue.pending_priorities(manifest.queue_id), vec![1, 2, 3]);
        assert_eq!(
            fx.queue.queue_name(manifest.queue_id),
            Some(default_queue_name(manifest.job_id))
        );

        let saved = fx.store().load(manifest.job_id).unwrap();
        assert_eq!(saved, manifest);
    }

    #[tokio::test]
    async fn test_task_ids_follow_unit_order() {
        let fx = Fixture::new();
        let pdf = fx.pdf("ordered.pdf", &["A", "B", "C", "D"]);
        let manifest = fx.producer.submit(&pdf, Some("custom")).await.unwrap();
        assert_eq!(fx.queue.queue_name(manifest.queue_id).as_deref(), Some("custom"));

        for (position, task_id) in manifest.task_ids.iter().enumerate() {
            let task = match fx.queue.dequeue(manifest.queue_id).await.unwrap() {
                Dequeued::Task(task) => task,
                Dequeued::Empty => panic!("queue drained early"),
            };
            assert_eq!(task.id, *task_id);
            let params = task.decode_params().unwrap();
            assert_eq!(params.unit_index as usize, position + 1);
            assert_eq!(params.job_id, manifest.job_id);
            assert_eq!(task.priority, params.unit_index as i32);
        }
    }

    #[tokio::test]
    async fn test_failed_enqueue_is_skipped() {
        let fx = Fixture::new();
        let pdf = fx.pdf("gaps.pdf", &["A", "B", "C"]);
        fx.queue.fail_enqueue_at(1);

        let manifest = fx.producer.submit(&pdf, None).await.unwrap();
        assert_eq!(manifest.total_units, 3);
        assert_eq!(manifest.task_ids.len(), 2);
        assert_eq!(manifest.expected_count(), 2);
        assert_eq!(manifest.skipped_units(), 1);
        assert_eq!(fx.queue.pending_priorities(manifest.queue_id), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_invalid_source_creates_nothing() {
        let fx = Fixture::new();
        let missing = fx.dir.path().join("missing.pdf");

        let err = fx.producer.submit(&missing, None).await.unwrap_err();
        assert!(matches!(err, ProducerError::Source(ExtractError::NotFound(_))));
        assert_eq!(fx.queue.queue_count(), 0);
        assert!(!fx.dir.path().join("metadata").exists());
    }

    #[tokio::test]
    async fn test_all_enqueues_failing_aborts_without_manifest() {
        let fx = Fixture::new();
        let pdf = fx.pdf("doomed.pdf", &["A", "B"]);
        fx.queue.fail_enqueue_at(0);
        fx.queue.fail_enqueue_at(1);

        let err = fx.producer.submit(&pdf, None).await.unwrap_err();
        assert!(matches!(err, ProducerError::Gateway(ref e) if e.is_transient()));
        let metadata = fx.dir.path().join("metadata");
        let manifests = std::fs::read_dir(&metadata)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(manifests, 0);
    }
}
