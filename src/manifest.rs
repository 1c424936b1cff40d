//! Job manifests.
//!
//! The producer writes one manifest per job as `{job_id}_metadata.json` in the
//! metadata directory. It is the only shared state between the producer and
//! the aggregator besides the queue itself.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ManifestError;

const MANIFEST_SUFFIX: &str = "_metadata.json";

/// Durable record of one submitted job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobManifest {
    pub job_id: Uuid,
    pub queue_id: Uuid,
    /// File name of the source document.
    pub source_name: String,
    /// Ids of successfully enqueued tasks, in unit order.
    pub task_ids: Vec<Uuid>,
    /// Units the source was split into, including any that failed to enqueue.
    pub total_units: u32,
    pub created_at: DateTime<Utc>,
}

impl JobManifest {
    pub fn new(job_id: Uuid, queue_id: Uuid, source_name: impl Into<String>) -> Self {
        Self {
            job_id,
            queue_id,
            source_name: source_name.into(),
            task_ids: Vec::new(),
            total_units: 0,
            created_at: Utc::now(),
        }
    }

    /// Number of results the aggregator waits for.
    pub fn expected_count(&self) -> usize {
        self.task_ids.len()
    }

    /// Units that were split out but never enqueued.
    pub fn skipped_units(&self) -> usize {
        (self.total_units as usize).saturating_sub(self.task_ids.len())
    }

    fn check(&self) -> Result<(), ManifestError> {
        if self.task_ids.len() > self.total_units as usize {
            return Err(ManifestError::Inconsistent {
                job_id: self.job_id,
                reason: format!(
                    "{} task ids for {} units",
                    self.task_ids.len(),
                    self.total_units
                ),
            });
        }
        Ok(())
    }
}

/// How an aggregation run names its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestRef {
    Job(Uuid),
    Queue(Uuid),
}

/// Directory-backed manifest storage.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the manifest for `job_id`.
    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}{}", job_id, MANIFEST_SUFFIX))
    }

    /// Persist a manifest, replacing any previous version atomically.
    pub fn save(&self, manifest: &JobManifest) -> Result<PathBuf, ManifestError> {
        manifest.check()?;
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(manifest.job_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(manifest)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(job_id = %manifest.job_id, path = %path.display(), "Saved job manifest");
        Ok(path)
    }

    /// Load the manifest for `job_id`.
    pub fn load(&self, job_id: Uuid) -> Result<JobManifest, ManifestError> {
        let path = self.path_for(job_id);
        if !path.exists() {
            return Err(ManifestError::NotFound(job_id));
        }
        let content = std::fs::read_to_string(&path)?;
        let manifest: JobManifest = serde_json::from_str(&content)?;
        if manifest.job_id != job_id {
            return Err(ManifestError::Inconsistent {
                job_id,
                reason: format!("file records job id {}", manifest.job_id),
            });
        }
        manifest.check()?;
        Ok(manifest)
    }

    /// Find the manifest whose queue id matches.
    ///
    /// Files are scanned in name order and the first match wins. Unreadable or
    /// malformed files are skipped with a warning.
    pub fn find_by_queue(&self, queue_id: Uuid) -> Result<JobManifest, ManifestError> {
        if !self.dir.exists() {
            return Err(ManifestError::NoJobForQueue(queue_id));
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX))
            })
            .collect();
        paths.sort();

        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(ManifestError::from)
                .and_then(|content| Ok(serde_json::from_str::<JobManifest>(&content)?));
            match parsed {
                Ok(manifest) if manifest.queue_id == queue_id => return Ok(manifest),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable manifest");
                }
            }
        }

        Err(ManifestError::NoJobForQueue(queue_id))
    }

    /// Resolve a job or queue reference to its manifest.
    pub fn resolve(&self, reference: ManifestRef) -> Result<JobManifest, ManifestError> {
        match reference {
            ManifestRef::Job(job_id) => self.load(job_id),
            ManifestRef::Queue(queue_id) => self.find_by_queue(queue_id),
        }
    }
}
