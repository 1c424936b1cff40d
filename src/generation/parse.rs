//! Parsing of `Q: ... / A: ...` completions.

use regex::Regex;

use super::QaPair;
use crate::error::{GenerationError, LlmError};

/// Matches a question or answer marker at the start of a line, optionally
/// numbered or bulleted: `Q:`, `1. Q:`, `- Question:`, `**A:**`.
const MARKER_PATTERN: &str =
    r"(?i)^\s*(?:[-*•]\s*|\d+[.)]\s*)?\**\s*(q|question|a|answer)\s*\d*\s*[:.)]\**\s*(.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Question,
    Answer,
}

/// Line-oriented parser for flashcard completions.
///
/// Text after a marker continues onto following unmarked lines. A question
/// without an answer is dropped.
#[derive(Debug, Clone)]
pub struct QaParser {
    marker: Regex,
}

impl QaParser {
    pub fn new() -> Result<Self, GenerationError> {
        let marker = Regex::new(MARKER_PATTERN)
            .map_err(|e| LlmError::ParseError(format!("invalid flashcard pattern: {}", e)))?;
        Ok(Self { marker })
    }

    pub fn parse(&self, text: &str) -> Vec<QaPair> {
        let mut pairs = Vec::new();
        let mut question = String::new();
        let mut answer = String::new();
        let mut current: Option<Field> = None;

        for line in text.lines() {
            if let Some(caps) = self.marker.captures(line) {
                let kind = caps.get(1).map(|m| m.as_str().to_ascii_lowercase());
                let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
                match kind.as_deref() {
                    Some("q") | Some("question") => {
                        flush(&mut pairs, &mut question, &mut answer);
                        question.push_str(rest);
                        current = Some(Field::Question);
                    }
                    _ => {
                        answer.clear();
                        answer.push_str(rest);
                        current = Some(Field::Answer);
                    }
                }
                continue;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let target = match current {
                Some(Field::Question) => &mut question,
                Some(Field::Answer) => &mut answer,
                None => continue,
            };
            if !target.is_empty() {
                target.push(' ');
            }
            target.push_str(line);
        }
        flush(&mut pairs, &mut question, &mut answer);
        pairs
    }
}

fn flush(pairs: &mut Vec<QaPair>, question: &mut String, answer: &mut String) {
    let q = question.trim().trim_matches('*').trim();
    let a = answer.trim().trim_matches('*').trim();
    if !q.is_empty() && !a.is_empty() {
        pairs.push(QaPair::new(q, a));
    }
    question.clear();
    answer.clear();
}
