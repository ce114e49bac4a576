use thiserror::Error;

use async_openai::error::OpenAIError;

#[derive(Debug, Error)]
pub enum TrackerLlmError {
    #[error("missing OpenAI API key; set MODEL_API_KEY or OPENAI_API_KEY")]
    MissingApiKey,
    #[error("missing default model configuration")]
    MissingDefaultModel,
    #[error("invalid chat completion request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    OpenAi(#[from] OpenAIError),
}
