use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    ImageDetail, ImageUrl, ReasoningEffort, ResponseFormat,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::config::{LoggerCallback, TrackerConfig};

use super::error::TrackerLlmError;
use super::openai::OpenAiChatProvider;
use super::provider::ChatCompletionProvider;

/// Callback invoked after a successful completion to capture metrics.
pub type MetricsCallback =
    Arc<dyn Fn(&CreateChatCompletionResponse, Duration, Option<&str>) + Send + Sync + 'static>;

#[derive(Debug, Default, Clone)]
pub struct ChatCompletionOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_completion_tokens: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub seed: Option<i64>,
}

impl ChatCompletionOptions {
    /// Deterministic-leaning JSON mode for the given model.
    pub fn json(model: &str) -> Self {
        Self {
            model: Some(model.to_string()),
            temperature: Some(0.0),
            response_format: Some(ResponseFormat::JsonObject),
            ..Self::default()
        }
    }
}

pub struct TrackerLlmClient<P: ChatCompletionProvider> {
    provider: P,
    default_model: String,
    logger: Option<LoggerCallback>,
    metrics_callback: Option<MetricsCallback>,
}

impl<P> fmt::Debug for TrackerLlmClient<P>
where
    P: ChatCompletionProvider + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerLlmClient")
            .field("provider", &self.provider)
            .field("default_model", &self.default_model)
            .field("logger_attached", &self.logger.is_some())
            .field("metrics_callback", &self.metrics_callback.is_some())
            .finish()
    }
}

impl<P: ChatCompletionProvider> TrackerLlmClient<P> {
    pub fn new(default_model: impl Into<String>, provider: P) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
            logger: None,
            metrics_callback: None,
        }
    }

    pub fn with_logger(mut self, logger: Option<LoggerCallback>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics_callback(mut self, callback: Option<MetricsCallback>) -> Self {
        self.metrics_callback = callback;
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Access the underlying provider (primarily for testing).
    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn build_request(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        options: ChatCompletionOptions,
    ) -> Result<CreateChatCompletionRequest, TrackerLlmError> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        if model.trim().is_empty() {
            return Err(TrackerLlmError::MissingDefaultModel);
        }

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(model);
        builder.messages(messages);
        apply_options(&mut builder, options);

        builder
            .build()
            .map_err(|err| TrackerLlmError::InvalidRequest(err.to_string()))
    }

    pub async fn create_chat_completion(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        options: ChatCompletionOptions,
        function_name: Option<&str>,
    ) -> Result<CreateChatCompletionResponse, TrackerLlmError> {
        let request = self.build_request(messages, options)?;
        self.execute_request(request, function_name).await
    }

    /// System + user turn (with an optional PNG attached as a data URL),
    /// returning the first choice's text.
    pub async fn complete_text(
        &self,
        system: &str,
        user: &str,
        image_png: Option<&[u8]>,
        options: ChatCompletionOptions,
        function_name: Option<&str>,
    ) -> Result<Option<String>, TrackerLlmError> {
        let messages = vec![system_message(system), user_message(user, image_png)];
        let response = self
            .create_chat_completion(messages, options, function_name)
            .await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content))
    }

    async fn execute_request(
        &self,
        request: CreateChatCompletionRequest,
        function_name: Option<&str>,
    ) -> Result<CreateChatCompletionResponse, TrackerLlmError> {
        let model = request.model.clone();
        self.log_debug(&format!(
            "Sending chat completion request to model={} oracle={}",
            model,
            function_name.unwrap_or("n/a")
        ));

        let start = Instant::now();
        match self.provider.create_chat_completion(request).await {
            Ok(response) => {
                let elapsed = start.elapsed();
                if let Some(callback) = &self.metrics_callback {
                    callback(&response, elapsed, function_name);
                }
                self.log_debug(&format!(
                    "Chat completion succeeded: model={} duration={}ms",
                    model,
                    elapsed.as_millis()
                ));
                Ok(response)
            }
            Err(err) => {
                self.log_error(&format!(
                    "Chat completion failed for model={}: {}",
                    model, err
                ));
                Err(TrackerLlmError::OpenAi(err))
            }
        }
    }

    fn log_debug(&self, message: &str) {
        if let Some(logger) = &self.logger {
            logger(&format!("[llm][debug] {message}"));
        }
    }

    fn log_error(&self, message: &str) {
        if let Some(logger) = &self.logger {
            logger(&format!("[llm][error] {message}"));
        }
    }
}

impl TrackerLlmClient<OpenAiChatProvider> {
    /// Wire the OpenAI provider from `TrackerConfig`.
    pub fn from_config(
        config: &TrackerConfig,
        metrics_callback: Option<MetricsCallback>,
    ) -> Result<Self, TrackerLlmError> {
        let provider = OpenAiChatProvider::from_config(config)?;
        Ok(TrackerLlmClient::new(config.models.reasoning.clone(), provider)
            .with_logger(config.logger.clone())
            .with_metrics_callback(metrics_callback))
    }
}

fn system_message(text: &str) -> ChatCompletionRequestMessage {
    ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
        content: ChatCompletionRequestSystemMessageContent::Text(text.to_string()),
        name: None,
    })
}

fn user_message(text: &str, image_png: Option<&[u8]>) -> ChatCompletionRequestMessage {
    let content = match image_png {
        None => ChatCompletionRequestUserMessageContent::Text(text.to_string()),
        Some(png) => ChatCompletionRequestUserMessageContent::Array(vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: text.to_string(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: png_data_url(png),
                        detail: Some(ImageDetail::High),
                    },
                },
            ),
        ]),
    };
    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
        content,
        name: None,
    })
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(png))
}

fn apply_options(builder: &mut CreateChatCompletionRequestArgs, options: ChatCompletionOptions) {
    let ChatCompletionOptions {
        model: _,
        temperature,
        max_completion_tokens,
        response_format,
        reasoning_effort,
        seed,
    } = options;

    if let Some(temperature) = temperature {
        builder.temperature(temperature);
    }
    if let Some(max_completion_tokens) = max_completion_tokens {
        builder.max_completion_tokens(max_completion_tokens);
    }
    if let Some(response_format) = response_format {
        builder.response_format(response_format);
    }
    if let Some(reasoning_effort) = reasoning_effort {
        builder.reasoning_effort(reasoning_effort);
    }
    if let Some(seed) = seed {
        builder.seed(seed);
    }
}
