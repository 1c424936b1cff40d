//! Anki-importable CSV decks.
//!
//! One row per flashcard with a fixed `Question,Answer,Tags` header. The tag
//! names the source and page so imported cards can be filtered per page.

use std::path::Path;

use serde::Serialize;

use crate::error::ExportError;
use crate::generation::{source_stem, QaPair};

pub const DECK_HEADER: [&str; 3] = ["Question", "Answer", "Tags"];

/// A flashcard with the unit it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckRow {
    pub unit_index: u32,
    pub pair: QaPair,
}

#[derive(Serialize)]
struct CsvRecord<'a> {
    #[serde(rename = "Question")]
    question: &'a str,
    #[serde(rename = "Answer")]
    answer: &'a str,
    #[serde(rename = "Tags")]
    tags: String,
}

/// Tag for cards from one page: `{source_stem}_page_{n}`, whitespace replaced by `_`.
pub fn page_tag(source_name: &str, unit_index: u32) -> String {
    let stem: String = source_stem(source_name)
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    format!("{}_page_{}", stem, unit_index)
}

/// Write rows to `path` in the given order, creating parent directories.
///
/// Returns the number of data rows written.
pub fn write_deck(path: &Path, source_name: &str, rows: &[DeckRow]) -> Result<usize, ExportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(DECK_HEADER)?;
    for row in rows {
        writer.serialize(CsvRecord {
            question: &row.pair.question,
            answer: &row.pair.answer,
            tags: page_tag(source_name, row.unit_index),
        })?;
    }
    writer.flush()?;

    tracing::debug!(path = %path.display(), rows = rows.len(), "Wrote deck");
    Ok(rows.len())
}
