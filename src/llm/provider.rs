use async_trait::async_trait;

use async_openai::error::OpenAIError;
use async_openai::types::{CreateChatCompletionRequest, CreateChatCompletionResponse};

/// Seam between the client and the HTTP transport.
#[async_trait]
pub trait ChatCompletionProvider: Send + Sync {
    async fn create_chat_completion(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, OpenAIError>;
}
