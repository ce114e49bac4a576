//! Decision oracles.
//!
//! Every judgment the tracker takes from a model goes through one of the
//! narrow traits below and comes back as a typed value. Model text is reduced
//! to its outermost JSON object (first `{` to last `}`) and deserialised
//! strictly; anything else is an [`OracleParseError`]. Outputs are advisory:
//! the orchestrator and evaluator decide what actually happened.

pub mod llm;
pub mod types;
pub mod vision;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::capture::Screenshot;
use crate::llm::TrackerLlmError;
use crate::metrics::OracleKind;

pub use types::{
    AdRecovery, ExtractedFields, GenerationRequest, InputGroup, LanguageDecision,
    LanguageRequest, ReasoningDecision, RubricRequest, Submission, SubmissionMethod, Verdict,
    VisionAnalysis, VisionElement,
};

#[derive(Debug, Error, Clone, PartialEq)]
#[error("{oracle} oracle returned unusable output: {reason}")]
pub struct OracleParseError {
    pub oracle: &'static str,
    pub reason: String,
    pub raw: String,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error(transparent)]
    Parse(#[from] OracleParseError),
    #[error("oracle transport failed: {0}")]
    Transport(#[from] TrackerLlmError),
    #[error("oracle returned no content")]
    EmptyResponse,
    #[error("{0}")]
    Other(String),
}

/// Slice from the first `{` to the last `}`, if both exist in order.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Strictly parse oracle text into `T`.
pub fn parse_oracle_json<T: DeserializeOwned>(
    kind: OracleKind,
    text: &str,
) -> Result<T, OracleParseError> {
    let failure = |reason: String| OracleParseError {
        oracle: kind.as_str(),
        reason,
        raw: text.to_string(),
    };
    let json = extract_json(text).ok_or_else(|| failure("no JSON object found".to_string()))?;
    serde_json::from_str(json).map_err(|err| failure(err.to_string()))
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// Propose the next milestone from a context snapshot.
    async fn decide(&self, snapshot: &Value) -> Result<ReasoningDecision, OracleError>;
}

#[async_trait]
pub trait VisionOracle: Send + Sync {
    async fn analyze(
        &self,
        screenshot: &Screenshot,
        objective: &str,
    ) -> Result<VisionAnalysis, OracleError>;

    /// Yes/no: does this freshly opened tab belong to the tracking flow?
    async fn confirm_tab(
        &self,
        screenshot: &Screenshot,
        url: &str,
        carrier: &str,
    ) -> Result<bool, OracleError>;
}

#[async_trait]
pub trait LanguageOracle: Send + Sync {
    async fn decide(&self, request: &LanguageRequest) -> Result<LanguageDecision, OracleError>;
}

/// Turns an instruction into raw action text for [`crate::instruction::compile`].
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, OracleError>;
}

#[async_trait]
pub trait EvaluationOracle: Send + Sync {
    async fn judge(&self, request: &RubricRequest) -> Result<Verdict, OracleError>;
}

#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn extract(&self, analyses: &[VisionAnalysis]) -> Result<ExtractedFields, OracleError>;
}

/// The full oracle set a run consults.
#[derive(Clone)]
pub struct Oracles {
    pub reasoning: Arc<dyn ReasoningOracle>,
    pub vision: Arc<dyn VisionOracle>,
    pub language: Arc<dyn LanguageOracle>,
    pub generator: Arc<dyn ScriptGenerator>,
    pub evaluator: Arc<dyn EvaluationOracle>,
    pub extractor: Arc<dyn ExtractionOracle>,
}

impl Oracles {
    /// Use one implementation for every role.
    pub fn uniform<T>(oracle: Arc<T>) -> Self
    where
        T: ReasoningOracle
            + VisionOracle
            + LanguageOracle
            + ScriptGenerator
            + EvaluationOracle
            + ExtractionOracle
            + 'static,
    {
        Self {
            reasoning: oracle.clone(),
            vision: oracle.clone(),
            language: oracle.clone(),
            generator: oracle.clone(),
            evaluator: oracle.clone(),
            extractor: oracle,
        }
    }
}
