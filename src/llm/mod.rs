//! LLM integration.
//!
//! The generation step talks to an OpenAI-compatible chat completions API
//! through the [`LlmProvider`] trait. [`LiteLlmClient`] is the HTTP
//! implementation; tests substitute scripted providers.

pub mod litellm;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
};
