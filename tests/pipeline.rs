//! End-to-end job lifecycle tests.
//!
//! Producer, workers and aggregator run in one process against the in-memory
//! queue and the mock generator, so no network is required.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lopdf::{dictionary, Document, Object, Stream};
use quiz_forge::aggregator::{AggregationSummary, AggregatorOptions, ResultAggregator};
use quiz_forge::backoff::BackoffPolicy;
use quiz_forge::extract::PdfPageSource;
use quiz_forge::generation::{MockQuizGenerator, QuizGenerator};
use quiz_forge::manifest::{JobManifest, ManifestRef, ManifestStore};
use quiz_forge::payload::read_payload;
use quiz_forge::producer::TaskProducer;
use quiz_forge::queue::{InMemoryQueue, QueueGateway};
use quiz_forge::worker::{StopReason, TaskWorker, WorkerOptions, WorkerStats};
use quiz_forge::AggregateError;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Build a PDF with one Helvetica text line per page. Integration tests
/// cannot see the crate's `cfg(test)` helper of the same name.
fn pdf_with_pages(page_texts: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.4");
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut page_ids = Vec::new();
    for text in page_texts {
        let content = format!("BT /F1 12 Tf 72 720 Td ({}) Tj ET", text);
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        page_ids.push(doc.add_object(dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        }));
    }

    let kids: Vec<Object> = page_ids.iter().map(|&id| id.into()).collect();
    let pages_id = doc.add_object(dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => Object::Integer(page_texts.len() as i64),
    });
    for page_id in &page_ids {
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(*page_id) {
            dict.set("Parent", pages_id);
        }
    }
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

struct Harness {
    dir: TempDir,
    queue: Arc<InMemoryQueue>,
    // Held so worker shutdown receivers stay open.
    shutdown_tx: broadcast::Sender<()>,
}

impl Harness {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            dir: TempDir::new().unwrap(),
            queue: Arc::new(InMemoryQueue::new()),
            shutdown_tx,
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn manifests(&self) -> ManifestStore {
        ManifestStore::new(self.path("metadata"))
    }

    async fn submit(&self, name: &str, pages: &[&str]) -> JobManifest {
        let source = self.path(name);
        std::fs::write(&source, pdf_with_pages(pages)).unwrap();
        let producer = TaskProducer::new(
            self.queue.clone(),
            Arc::new(PdfPageSource::new(self.path("pages"))),
            self.manifests(),
        );
        producer.submit(&source, None).await.unwrap()
    }

    fn worker(
        &self,
        queue_id: uuid::Uuid,
        worker_id: &str,
        generator: Arc<dyn QuizGenerator>,
    ) -> TaskWorker {
        let options = WorkerOptions {
            worker_id: worker_id.to_string(),
            poll_interval: Duration::from_millis(5),
            max_retries: 3,
            retry_policy: BackoffPolicy::linear(Duration::from_millis(1), Duration::from_millis(5)),
            drain: true,
            results_dir: self.path("results"),
        };
        TaskWorker::new(
            queue_id,
            self.queue.clone(),
            generator,
            options,
            self.shutdown_tx.subscribe(),
        )
    }

    async fn run_workers(
        &self,
        queue_id: uuid::Uuid,
        count: usize,
        generator: Arc<dyn QuizGenerator>,
    ) -> Vec<WorkerStats> {
        let handles: Vec<_> = (0..count)
            .map(|i| {
                let worker = self.worker(queue_id, &format!("worker-{i}"), generator.clone());
                tokio::spawn(worker.run())
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let (stats, reason) = handle.await.unwrap().unwrap();
            assert_eq!(reason, StopReason::Drained);
            all.push(stats);
        }
        all
    }

    fn aggregator(&self) -> ResultAggregator {
        ResultAggregator::new(
            self.queue.clone(),
            self.manifests(),
            AggregatorOptions {
                poll_policy: BackoffPolicy::exponential(
                    Duration::from_millis(2),
                    2.0,
                    Duration::from_millis(20),
                ),
                output_dir: self.path("output"),
                output_path: None,
                deck_name: "Integration".to_string(),
            },
        )
    }
}

fn read_deck(path: &Path) -> Vec<(String, String, String)> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(headers, vec!["Question", "Answer", "Tags"]);
    reader
        .records()
        .map(|r| {
            let r = r.unwrap();
            (r[0].to_string(), r[1].to_string(), r[2].to_string())
        })
        .collect()
}

fn page_of(tag: &str) -> u32 {
    tag.rsplit('_').next().unwrap().parse().unwrap()
}

async fn payload_items(queue: &InMemoryQueue, manifest: &JobManifest) -> usize {
    let mut total = 0;
    for task_id in &manifest.task_ids {
        let result = queue
            .get_result(manifest.queue_id, *task_id)
            .await
            .unwrap()
            .unwrap();
        if result.is_success() {
            total += read_payload(Path::new(&result.output)).await.unwrap().items.len();
        }
    }
    total
}

#[tokio::test]
async fn test_three_pages_two_workers() {
    let h = Harness::new();
    let manifest = h.submit("lecture.pdf", &["Mitochondria", "Ribosomes", "Nucleus"]).await;
    assert_eq!(manifest.task_ids.len(), 3);
    assert_eq!(manifest.expected_count(), 3);
    assert_eq!(h.queue.pending_priorities(manifest.queue_id), vec![1, 2, 3]);

    let stats = h
        .run_workers(manifest.queue_id, 2, Arc::new(MockQuizGenerator::new(5)))
        .await;
    let claimed: u64 = stats.iter().map(|s| s.claimed).sum();
    let succeeded: u64 = stats.iter().map(|s| s.succeeded).sum();
    assert_eq!(claimed, 3, "each task is claimed exactly once");
    assert_eq!(succeeded, 3);

    let summary = h.aggregator().aggregate(ManifestRef::Job(manifest.job_id)).await.unwrap();
    assert_eq!(summary.expected, 3);
    assert_eq!(summary.units_represented, 3);
    assert_eq!(summary.failed_units, 0);
    assert_eq!(summary.missing_results, 0);
    assert_eq!(summary.success_ratio, 1.0);

    let rows = read_deck(&summary.deck_path);
    assert_eq!(rows.len(), summary.items);
    assert_eq!(rows.len(), payload_items(&h.queue, &manifest).await);
    let pages: Vec<u32> = rows.iter().map(|(_, _, tag)| page_of(tag)).collect();
    assert!(pages.windows(2).all(|w| w[0] <= w[1]), "rows follow page order");
    assert!(rows.iter().all(|(_, _, tag)| tag.starts_with("lecture_page_")));
}

#[tokio::test]
async fn test_content_failure_lowers_success_ratio() {
    let h = Harness::new();
    let manifest = h.submit("notes.pdf", &["Alpha", "Beta", "Gamma"]).await;

    let generator = Arc::new(MockQuizGenerator::new(5).with_failing_unit(2));
    let stats = h.run_workers(manifest.queue_id, 1, generator).await;
    assert_eq!(stats[0].succeeded, 2);
    assert_eq!(stats[0].failed, 1);

    let summary: AggregationSummary = h
        .aggregator()
        .aggregate(ManifestRef::Queue(manifest.queue_id))
        .await
        .unwrap();
    assert_eq!(summary.units_represented, 2);
    assert_eq!(summary.failed_units, 1);
    assert!((summary.success_ratio - 2.0 / 3.0).abs() < 1e-9);

    let rows = read_deck(&summary.deck_path);
    assert!(!rows.is_empty());
    assert!(rows.iter().all(|(_, _, tag)| page_of(tag) != 2));
}

#[tokio::test]
async fn test_aggregator_waits_for_late_workers() {
    let h = Harness::new();
    let manifest = h.submit("late.pdf", &["One", "Two"]).await;

    let aggregator = h.aggregator();
    let job_id = manifest.job_id;
    let waiting = tokio::spawn(async move { aggregator.aggregate(ManifestRef::Job(job_id)).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiting.is_finished(), "aggregator must wait while tasks are pending");

    h.run_workers(manifest.queue_id, 1, Arc::new(MockQuizGenerator::new(5)))
        .await;
    let summary = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("aggregator finishes after workers")
        .unwrap()
        .unwrap();
    assert_eq!(summary.units_represented, 2);
}

#[tokio::test]
async fn test_status_outages_do_not_fail_aggregation() {
    let h = Harness::new();
    let manifest = h.submit("flaky.pdf", &["One"]).await;
    h.run_workers(manifest.queue_id, 1, Arc::new(MockQuizGenerator::new(5)))
        .await;

    h.queue.fail_next_status(2);
    let summary = h.aggregator().aggregate(ManifestRef::Job(manifest.job_id)).await.unwrap();
    assert_eq!(summary.units_represented, 1);
}

#[tokio::test]
async fn test_deleted_queue_aborts_aggregation() {
    let h = Harness::new();
    let manifest = h.submit("gone.pdf", &["One"]).await;
    assert!(h.queue.delete_queue(manifest.queue_id));

    let err = h
        .aggregator()
        .aggregate(ManifestRef::Job(manifest.job_id))
        .await
        .unwrap_err();
    assert!(matches!(err, AggregateError::QueueNotFound(_)));
}

#[tokio::test]
async fn test_unknown_job_aborts_aggregation() {
    let h = Harness::new();
    let err = h
        .aggregator()
        .aggregate(ManifestRef::Queue(uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, AggregateError::Manifest(_)));
}
