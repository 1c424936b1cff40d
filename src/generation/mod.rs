//! Quiz generation for one unit.
//!
//! A [`QuizGenerator`] turns the text of one page into question/answer
//! pairs. Every failure here is a content failure: the worker reports the
//! unit as FAILURE and moves on without retrying.

mod parse;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{LlmConfig, LlmProviderKind};
use crate::error::GenerationError;
use crate::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};

pub use parse::QaParser;

/// One flashcard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

impl QaPair {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

/// The unit a worker asks a generator to process.
#[derive(Debug, Clone)]
pub struct UnitInput {
    pub job_id: Uuid,
    pub unit_index: u32,
    pub unit_ref: PathBuf,
    pub source_name: String,
}

impl UnitInput {
    /// Read the unit's text, rejecting missing or blank units.
    pub async fn read_text(&self) -> Result<String, GenerationError> {
        let text = tokio::fs::read_to_string(&self.unit_ref)
            .await
            .map_err(|e| GenerationError::UnreadableUnit {
                path: self.unit_ref.display().to_string(),
                reason: e.to_string(),
            })?;
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyUnit {
                unit_index: self.unit_index,
            });
        }
        Ok(text)
    }
}

/// Produces question/answer pairs for a unit.
#[async_trait]
pub trait QuizGenerator: Send + Sync {
    async fn generate(&self, unit: &UnitInput) -> Result<Vec<QaPair>, GenerationError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

const SYSTEM_PROMPT: &str = "You are a tutor who writes concise study flashcards. \
Each flashcard tests one fact from the provided page. Do not invent facts that are not on the page.";

/// Build the user prompt for one page.
fn build_prompt(unit: &UnitInput, text: &str, max_questions: usize) -> String {
    format!(
        "Write up to {max} flashcards for page {page} of \"{source}\".\n\
         Use exactly this format for each flashcard, with nothing else in the reply:\n\
         Q: <question>\n\
         A: <answer>\n\n\
         Page text:\n{text}",
        max = max_questions,
        page = unit.unit_index,
        source = unit.source_name,
        text = text.trim(),
    )
}

/// Generator backed by a chat-completions provider.
pub struct LlmQuizGenerator {
    provider: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_questions: usize,
    parser: QaParser,
}

impl LlmQuizGenerator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        max_questions: usize,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            provider,
            model: model.into(),
            temperature: 0.3,
            max_questions: max_questions.max(1),
            parser: QaParser::new()?,
        })
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl QuizGenerator for LlmQuizGenerator {
    async fn generate(&self, unit: &UnitInput) -> Result<Vec<QaPair>, GenerationError> {
        let text = unit.read_text().await?;

        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(SYSTEM_PROMPT),
                Message::user(build_prompt(unit, &text, self.max_questions)),
            ],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(1500);

        let response = self.provider.generate(request).await?;
        let choice = response
            .choices
            .first()
            .ok_or_else(|| GenerationError::Refused("no choices in response".to_string()))?;
        if choice.finish_reason == "content_filter" {
            return Err(GenerationError::Refused(
                "completion blocked by content filter".to_string(),
            ));
        }
        if choice.message.content.trim().is_empty() {
            return Err(GenerationError::Refused("empty completion".to_string()));
        }

        let mut pairs = self.parser.parse(&choice.message.content);
        if pairs.is_empty() {
            return Err(GenerationError::NoPairs);
        }
        pairs.truncate(self.max_questions);

        tracing::debug!(
            job_id = %unit.job_id,
            unit_index = unit.unit_index,
            pairs = pairs.len(),
            "Generated flashcards"
        );
        Ok(pairs)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

/// Offline generator producing deterministic flashcards from the page text.
///
/// Each non-empty line of the page becomes one flashcard, up to the
/// configured maximum.
#[derive(Debug, Clone, Default)]
pub struct MockQuizGenerator {
    max_questions: usize,
    failing_units: HashSet<u32>,
}

impl MockQuizGenerator {
    pub fn new(max_questions: usize) -> Self {
        Self {
            max_questions: max_questions.max(1),
            failing_units: HashSet::new(),
        }
    }

    /// Refuse the given unit index with a content failure.
    pub fn with_failing_unit(mut self, unit_index: u32) -> Self {
        self.failing_units.insert(unit_index);
        self
    }
}

#[async_trait]
impl QuizGenerator for MockQuizGenerator {
    async fn generate(&self, unit: &UnitInput) -> Result<Vec<QaPair>, GenerationError> {
        if self.failing_units.contains(&unit.unit_index) {
            return Err(GenerationError::Refused(format!(
                "mock refusal for unit {}",
                unit.unit_index
            )));
        }

        let text = unit.read_text().await?;
        let stem = source_stem(&unit.source_name);
        let pairs: Vec<QaPair> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take(self.max_questions)
            .enumerate()
            .map(|(i, line)| {
                QaPair::new(
                    format!(
                        "[{} p{} #{}] What does the page state here?",
                        stem,
                        unit.unit_index,
                        i + 1
                    ),
                    line,
                )
            })
            .collect();

        if pairs.is_empty() {
            return Err(GenerationError::NoPairs);
        }
        Ok(pairs)
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// File stem of a source name, falling back to the full name.
pub fn source_stem(source_name: &str) -> String {
    Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(source_name)
        .to_string()
}

/// Build the generator selected by configuration.
pub fn build_generator(config: &LlmConfig) -> Result<Arc<dyn QuizGenerator>, GenerationError> {
    match config.provider {
        LlmProviderKind::Mock => Ok(Arc::new(MockQuizGenerator::new(
            config.max_questions_per_page,
        ))),
        LlmProviderKind::Openai => {
            let client = LiteLlmClient::from_config(config)?;
            let generator = LlmQuizGenerator::new(
                Arc::new(client),
                config.model.clone(),
                config.max_questions_per_page,
            )?
            .with_temperature(config.temperature);
            Ok(Arc::new(generator))
        }
    }
}
