use async_openai::error::OpenAIError;
use async_openai::types::{CreateChatCompletionRequest, CreateChatCompletionResponse};
use async_openai::{Client, config::OpenAIConfig};
use async_trait::async_trait;
use serde_json::Value;

use crate::config::TrackerConfig;

use super::error::TrackerLlmError;
use super::provider::ChatCompletionProvider;

/// [`ChatCompletionProvider`] backed by any OpenAI-compatible endpoint.
#[derive(Clone, Debug)]
pub struct OpenAiChatProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiChatProvider {
    pub fn new(client: Client<OpenAIConfig>) -> Self {
        Self { client }
    }

    /// Build from the API key and `MODEL_CLIENT_OPTIONS` in `config`.
    pub fn from_config(config: &TrackerConfig) -> Result<Self, TrackerLlmError> {
        let api_key = config
            .model_api_key
            .clone()
            .ok_or(TrackerLlmError::MissingApiKey)?;

        let mut openai_config = OpenAIConfig::new().with_api_key(api_key);

        if let Some(options) = config.model_client_options.as_ref() {
            if let Some(api_base) =
                extract_string(options, &["api_base", "apiBase", "base_url", "baseURL"])
            {
                openai_config = openai_config.with_api_base(api_base);
            }

            if let Some(org_id) = extract_string(options, &["organization", "org_id", "orgId"]) {
                openai_config = openai_config.with_org_id(org_id);
            }

            if let Some(project_id) =
                extract_string(options, &["project", "project_id", "projectId"])
            {
                openai_config = openai_config.with_project_id(project_id);
            }
        }

        Ok(Self::new(Client::with_config(openai_config)))
    }
}

#[async_trait]
impl ChatCompletionProvider for OpenAiChatProvider {
    async fn create_chat_completion(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, OpenAIError> {
        self.client.chat().create(request).await
    }
}

fn extract_string(options: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| options.get(*key).and_then(Value::as_str))
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_api_key() {
        let config = TrackerConfig::default();
        let err = OpenAiChatProvider::from_config(&config).expect_err("no key configured");
        assert!(matches!(err, TrackerLlmError::MissingApiKey));
    }

    #[test]
    fn option_aliases_are_recognised() {
        let options = serde_json::json!({"baseURL": "http://localhost:8080/v1", "orgId": "org-1"});
        let options = options.as_object().unwrap();
        assert_eq!(
            extract_string(options, &["api_base", "apiBase", "base_url", "baseURL"]).as_deref(),
            Some("http://localhost:8080/v1")
        );
        assert_eq!(
            extract_string(options, &["organization", "org_id", "orgId"]).as_deref(),
            Some("org-1")
        );
        assert!(extract_string(options, &["project"]).is_none());
    }
}
