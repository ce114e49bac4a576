//! Token and latency accounting per oracle role.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Oracle roles tracked when collecting metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleKind {
    Reasoning,
    Vision,
    Language,
    Evaluation,
    Generation,
    Extraction,
}

impl OracleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OracleKind::Reasoning => "reasoning",
            OracleKind::Vision => "vision",
            OracleKind::Language => "language",
            OracleKind::Evaluation => "evaluation",
            OracleKind::Generation => "generation",
            OracleKind::Extraction => "extraction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reasoning" => Some(OracleKind::Reasoning),
            "vision" => Some(OracleKind::Vision),
            "language" => Some(OracleKind::Language),
            "evaluation" => Some(OracleKind::Evaluation),
            "generation" => Some(OracleKind::Generation),
            "extraction" => Some(OracleKind::Extraction),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounters {
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub inference_time_ms: u64,
}

impl UsageCounters {
    fn add(&mut self, other: &UsageCounters) {
        self.calls += other.calls;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.inference_time_ms += other.inference_time_ms;
    }
}

/// Aggregated usage across every oracle consulted during a run.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OracleMetrics {
    pub reasoning: UsageCounters,
    pub vision: UsageCounters,
    pub language: UsageCounters,
    pub evaluation: UsageCounters,
    pub generation: UsageCounters,
    pub extraction: UsageCounters,
    pub total: UsageCounters,
}

impl OracleMetrics {
    pub fn merge(&mut self, other: &OracleMetrics) {
        self.reasoning.add(&other.reasoning);
        self.vision.add(&other.vision);
        self.language.add(&other.language);
        self.evaluation.add(&other.evaluation);
        self.generation.add(&other.generation);
        self.extraction.add(&other.extraction);
        self.total.add(&other.total);
    }

    /// Record one completed oracle call and update cumulative totals.
    pub fn record(
        &mut self,
        kind: OracleKind,
        prompt_tokens: u64,
        completion_tokens: u64,
        inference_time_ms: u64,
    ) {
        let sample = UsageCounters {
            calls: 1,
            prompt_tokens,
            completion_tokens,
            inference_time_ms,
        };
        self.counters_mut(kind).add(&sample);
        self.total.add(&sample);
    }

    pub fn counters(&self, kind: OracleKind) -> &UsageCounters {
        match kind {
            OracleKind::Reasoning => &self.reasoning,
            OracleKind::Vision => &self.vision,
            OracleKind::Language => &self.language,
            OracleKind::Evaluation => &self.evaluation,
            OracleKind::Generation => &self.generation,
            OracleKind::Extraction => &self.extraction,
        }
    }

    fn counters_mut(&mut self, kind: OracleKind) -> &mut UsageCounters {
        match kind {
            OracleKind::Reasoning => &mut self.reasoning,
            OracleKind::Vision => &mut self.vision,
            OracleKind::Language => &mut self.language,
            OracleKind::Evaluation => &mut self.evaluation,
            OracleKind::Generation => &mut self.generation,
            OracleKind::Extraction => &mut self.extraction,
        }
    }
}

/// Milliseconds elapsed since `start`, saturating at `u64::MAX`.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
