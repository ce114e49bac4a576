//! Chat-completion backed implementations of every oracle role.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::capture::Screenshot;
use crate::config::{ModelSelection, TrackerConfig};
use crate::llm::prompts;
use crate::llm::{
    ChatCompletionOptions, ChatCompletionProvider, MetricsCallback, OpenAiChatProvider,
    TrackerLlmClient, TrackerLlmError,
};
use crate::metrics::{OracleKind, OracleMetrics};

use super::types::{
    ExtractedFields, GenerationRequest, LanguageDecision, LanguageRequest, ReasoningDecision,
    RubricRequest, Verdict, VisionAnalysis,
};
use super::vision::is_input_objective;
use super::{
    EvaluationOracle, ExtractionOracle, LanguageOracle, OracleError, ReasoningOracle,
    ScriptGenerator, VisionOracle, parse_oracle_json,
};

/// Labels per analysis handed to the extraction oracle.
const EXTRACTION_LABEL_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct TabConfirmation {
    legitimate: bool,
}

/// Metrics callback feeding `sink`, keyed by the oracle kind passed as the
/// completion's function name.
pub fn metrics_recorder(sink: Arc<Mutex<OracleMetrics>>) -> MetricsCallback {
    Arc::new(move |response, elapsed, function| {
        let Some(kind) = function.and_then(OracleKind::parse) else {
            return;
        };
        let (prompt, completion) = response
            .usage
            .as_ref()
            .map(|usage| {
                (
                    u64::from(usage.prompt_tokens),
                    u64::from(usage.completion_tokens),
                )
            })
            .unwrap_or((0, 0));
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        match sink.lock() {
            Ok(mut metrics) => metrics.record(kind, prompt, completion, elapsed_ms),
            Err(_) => log::warn!("oracle metrics lock poisoned; dropping sample"),
        }
    })
}

pub struct LlmOracles<P: ChatCompletionProvider> {
    client: TrackerLlmClient<P>,
    models: ModelSelection,
}

impl<P> fmt::Debug for LlmOracles<P>
where
    P: ChatCompletionProvider + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmOracles")
            .field("client", &self.client)
            .field("models", &self.models)
            .finish()
    }
}

impl<P: ChatCompletionProvider> LlmOracles<P> {
    pub fn new(client: TrackerLlmClient<P>, models: ModelSelection) -> Self {
        Self { client, models }
    }

    pub fn client(&self) -> &TrackerLlmClient<P> {
        &self.client
    }

    async fn ask(
        &self,
        kind: OracleKind,
        model: &str,
        system: &str,
        user: &str,
        image_png: Option<&[u8]>,
    ) -> Result<String, OracleError> {
        self.client
            .complete_text(
                system,
                user,
                image_png,
                ChatCompletionOptions::json(model),
                Some(kind.as_str()),
            )
            .await?
            .filter(|text| !text.trim().is_empty())
            .ok_or(OracleError::EmptyResponse)
    }
}

impl LlmOracles<OpenAiChatProvider> {
    pub fn from_config(
        config: &TrackerConfig,
        metrics: Arc<Mutex<OracleMetrics>>,
    ) -> Result<Self, TrackerLlmError> {
        let client = TrackerLlmClient::from_config(config, Some(metrics_recorder(metrics)))?;
        Ok(Self::new(client, config.models.clone()))
    }
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, OracleError> {
    serde_json::to_value(value).map_err(|err| OracleError::Other(err.to_string()))
}

#[async_trait]
impl<P: ChatCompletionProvider> ReasoningOracle for LlmOracles<P> {
    async fn decide(&self, snapshot: &Value) -> Result<ReasoningDecision, OracleError> {
        let text = self
            .ask(
                OracleKind::Reasoning,
                &self.models.reasoning,
                &prompts::reasoning_system_prompt(),
                &prompts::reasoning_user_message(snapshot),
                None,
            )
            .await?;
        Ok(parse_oracle_json(OracleKind::Reasoning, &text)?)
    }
}

#[async_trait]
impl<P: ChatCompletionProvider> VisionOracle for LlmOracles<P> {
    async fn analyze(
        &self,
        screenshot: &Screenshot,
        objective: &str,
    ) -> Result<VisionAnalysis, OracleError> {
        let text = self
            .ask(
                OracleKind::Vision,
                &self.models.vision,
                &prompts::vision_system_prompt(is_input_objective(objective)),
                &prompts::vision_user_message(objective),
                Some(&screenshot.png),
            )
            .await?;
        let mut analysis: VisionAnalysis = parse_oracle_json(OracleKind::Vision, &text)?;
        analysis.fold = screenshot.fold;
        Ok(analysis)
    }

    async fn confirm_tab(
        &self,
        screenshot: &Screenshot,
        url: &str,
        carrier: &str,
    ) -> Result<bool, OracleError> {
        let text = self
            .ask(
                OracleKind::Vision,
                &self.models.vision,
                &prompts::tab_confirmation_system_prompt(),
                &prompts::tab_confirmation_user_message(url, carrier),
                Some(&screenshot.png),
            )
            .await?;
        let confirmation: TabConfirmation = parse_oracle_json(OracleKind::Vision, &text)?;
        Ok(confirmation.legitimate)
    }
}

#[async_trait]
impl<P: ChatCompletionProvider> LanguageOracle for LlmOracles<P> {
    async fn decide(&self, request: &LanguageRequest) -> Result<LanguageDecision, OracleError> {
        let payload = json!({
            "context": request.snapshot,
            "planner": to_payload(&request.reasoning)?,
            "vision": to_payload(&request.vision)?,
            "current_url": request.current_url,
            "carrier_link_text": request.carrier_link_text,
        });
        let text = self
            .ask(
                OracleKind::Language,
                &self.models.reasoning,
                &prompts::language_system_prompt(),
                &prompts::language_user_message(&payload),
                None,
            )
            .await?;
        Ok(parse_oracle_json(OracleKind::Language, &text)?)
    }
}

#[async_trait]
impl<P: ChatCompletionProvider> ScriptGenerator for LlmOracles<P> {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, OracleError> {
        self.ask(
            OracleKind::Generation,
            &self.models.reasoning,
            &prompts::generator_system_prompt(),
            &prompts::generator_user_message(&to_payload(request)?),
            None,
        )
        .await
    }
}

#[async_trait]
impl<P: ChatCompletionProvider> EvaluationOracle for LlmOracles<P> {
    async fn judge(&self, request: &RubricRequest) -> Result<Verdict, OracleError> {
        let text = self
            .ask(
                OracleKind::Evaluation,
                &self.models.evaluator,
                &prompts::rubric_system_prompt(),
                &prompts::rubric_user_message(&to_payload(request)?),
                None,
            )
            .await?;
        Ok(parse_oracle_json(OracleKind::Evaluation, &text)?)
    }
}

#[async_trait]
impl<P: ChatCompletionProvider> ExtractionOracle for LlmOracles<P> {
    async fn extract(&self, analyses: &[VisionAnalysis]) -> Result<ExtractedFields, OracleError> {
        let payload: Vec<Value> = analyses
            .iter()
            .map(|analysis| {
                json!({
                    "notes": analysis.notes,
                    "labels": analysis
                        .labels()
                        .take(EXTRACTION_LABEL_LIMIT)
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let text = self
            .ask(
                OracleKind::Extraction,
                &self.models.evaluator,
                &prompts::extraction_system_prompt(),
                &prompts::extraction_user_message(&Value::Array(payload)),
                None,
            )
            .await?;
        let fields: ExtractedFields = parse_oracle_json(OracleKind::Extraction, &text)?;
        Ok(fields.trimmed())
    }
}
