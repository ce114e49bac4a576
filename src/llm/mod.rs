//! Chat-completion plumbing shared by every model-backed oracle.
//!
//! [`TrackerLlmClient`] wraps a [`ChatCompletionProvider`] (the OpenAI-backed
//! [`OpenAiChatProvider`] in production, recording fakes in tests) and reports
//! per-call latency and token usage through a metrics callback.

pub mod client;
pub mod error;
pub mod openai;
pub mod prompts;
pub mod provider;

pub use client::{ChatCompletionOptions, MetricsCallback, TrackerLlmClient};
pub use error::TrackerLlmError;
pub use openai::OpenAiChatProvider;
pub use provider::ChatCompletionProvider;
