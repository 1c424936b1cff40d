//! Per-unit result payloads.
//!
//! A worker writes one payload file per successfully processed unit and
//! reports its path as the task's SUCCESS output. The aggregator reads them
//! back and re-imposes unit order from the `unit_index` they carry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PayloadError;
use crate::generation::QaPair;

/// Generated flashcards for one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitPayload {
    pub job_id: Uuid,
    pub unit_index: u32,
    pub source_name: String,
    pub items: Vec<QaPair>,
    pub generated_at: DateTime<Utc>,
}

impl UnitPayload {
    pub fn new(job_id: Uuid, unit_index: u32, source_name: impl Into<String>, items: Vec<QaPair>) -> Self {
        Self {
            job_id,
            unit_index,
            source_name: source_name.into(),
            items,
            generated_at: Utc::now(),
        }
    }
}

/// Path of the payload for one unit.
pub fn payload_path(results_dir: &Path, job_id: Uuid, unit_index: u32) -> PathBuf {
    results_dir.join(format!("{}_page_{}_result.json", job_id, unit_index))
}

/// Write a payload via temp file and rename, returning its final path.
pub async fn write_payload(results_dir: &Path, payload: &UnitPayload) -> Result<PathBuf, PayloadError> {
    tokio::fs::create_dir_all(results_dir).await?;
    let path = payload_path(results_dir, payload.job_id, payload.unit_index);
    let tmp = path.with_extension("json.tmp");

    let json = serde_json::to_vec_pretty(payload)?;
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(path)
}

/// Read and decode a payload file.
pub async fn read_payload(path: &Path) -> Result<UnitPayload, PayloadError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PayloadError::Missing(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}
