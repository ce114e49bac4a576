use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdRecovery {
    pub detected: bool,
    #[serde(default)]
    pub recovery_url: Option<String>,
    #[serde(default)]
    pub reset_to_milestone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningDecision {
    pub goal_achieved: bool,
    pub next_milestone: String,
    #[serde(default)]
    pub vision_objective: String,
    pub language_instruction: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub failure_analysis: Option<String>,
    #[serde(default)]
    pub ad_recovery: Option<AdRecovery>,
}

impl ReasoningDecision {
    /// The recovery request, if the oracle flagged a hijacked page.
    pub fn hijack(&self) -> Option<&AdRecovery> {
        self.ad_recovery.as_ref().filter(|recovery| recovery.detected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionElement {
    pub label: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMethod {
    EnterKey,
    ButtonClick,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub method: SubmissionMethod,
    #[serde(default)]
    pub button: Option<VisionElement>,
    #[serde(default)]
    pub button_distance: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

/// An input field paired with how to submit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputGroup {
    pub input: VisionElement,
    pub submission: Submission,
    #[serde(default)]
    pub relevance_score: f64,
    #[serde(default)]
    pub relevance_reasoning: String,
    /// Set once a DOM probe confirmed a text control at the coordinates.
    #[serde(default)]
    pub dom_validated: bool,
    /// Kept without DOM confirmation on confidence alone.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VisionAnalysis {
    pub found: bool,
    #[serde(default)]
    pub elements: Vec<VisionElement>,
    #[serde(default)]
    pub input_groups: Vec<InputGroup>,
    /// Groups the oracle proposed before filtering removed all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub original_input_groups: Vec<InputGroup>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub fold: usize,
    #[serde(default)]
    pub scroll_top: f64,
}

impl VisionAnalysis {
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.elements
            .iter()
            .map(|element| element.label.as_str())
            .chain(
                self.input_groups
                    .iter()
                    .map(|group| group.input.label.as_str()),
            )
    }

    /// Lowercased notes plus labels, for keyword checks.
    pub fn corpus(&self) -> String {
        let mut text = self.notes.to_lowercase();
        for label in self.labels() {
            text.push(' ');
            text.push_str(&label.to_lowercase());
        }
        text
    }

    pub fn mentions(&self, needle: &str) -> bool {
        !needle.is_empty() && self.corpus().contains(&needle.to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageDecision {
    pub needs_code: bool,
    #[serde(default)]
    pub needs_vision: bool,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub data_to_extract: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default)]
    pub voyage_number: String,
    #[serde(default)]
    pub arrival_date: String,
}

impl ExtractedFields {
    pub fn trimmed(self) -> Self {
        Self {
            voyage_number: self.voyage_number.trim().to_string(),
            arrival_date: self.arrival_date.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageRequest {
    pub snapshot: Value,
    pub reasoning: ReasoningDecision,
    pub vision: Vec<VisionAnalysis>,
    pub current_url: String,
    /// Visible text of the carrier link when vision found one on the hub.
    pub carrier_link_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub instruction: String,
    pub milestone: String,
    pub booking_id: String,
    pub current_url: String,
    pub vision: Vec<VisionAnalysis>,
    pub allowed_hosts: Vec<String>,
    pub previous_error: Option<String>,
    pub attempt: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RubricRequest {
    pub milestone: String,
    pub instruction: String,
    pub url_before: String,
    pub url_after: String,
    pub execution_success: bool,
    pub execution_error: Option<String>,
    pub analysis: Option<VisionAnalysis>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reasoning_requires_core_fields() {
        let parsed: Result<ReasoningDecision, _> = serde_json::from_value(json!({
            "goal_achieved": false,
            "next_milestone": "Reached hub site"
        }));
        assert!(parsed.is_err(), "language_instruction is mandatory");

        let decision: ReasoningDecision = serde_json::from_value(json!({
            "goal_achieved": false,
            "next_milestone": "Reached hub site",
            "language_instruction": "Go back to the hub",
            "ad_recovery": {"detected": true, "recovery_url": "http://seacargotracking.net/",
                            "reset_to_milestone": "Reached hub site"}
        }))
        .unwrap();
        let recovery = decision.hijack().expect("hijack flagged");
        assert_eq!(
            recovery.recovery_url.as_deref(),
            Some("http://seacargotracking.net/")
        );
    }

    #[test]
    fn undetected_recovery_is_not_a_hijack() {
        let decision: ReasoningDecision = serde_json::from_value(json!({
            "goal_achieved": false,
            "next_milestone": "Results displayed",
            "language_instruction": "Wait",
            "ad_recovery": {"detected": false}
        }))
        .unwrap();
        assert!(decision.hijack().is_none());
    }

    #[test]
    fn input_group_schema_parses() {
        let analysis: VisionAnalysis = serde_json::from_value(json!({
            "found": true,
            "input_groups": [{
                "input": {"label": "Booking No. input", "x": 400, "y": 300, "confidence": 0.95},
                "submission": {"method": "button_click",
                               "button": {"label": "Search", "x": 600, "y": 300, "confidence": 0.9},
                               "button_distance": 200, "reasoning": "adjacent"},
                "relevance_score": 0.9,
                "relevance_reasoning": "labelled booking"
            }],
            "notes": "Tracking form"
        }))
        .unwrap();
        assert_eq!(
            analysis.input_groups[0].submission.method,
            SubmissionMethod::ButtonClick
        );
        assert!(analysis.mentions("booking no"));
        assert!(!analysis.input_groups[0].dom_validated);
    }

    #[test]
    fn extracted_fields_trim() {
        let fields = ExtractedFields {
            voyage_number: "  YM MANDATE 0096W ".into(),
            arrival_date: "\n2025-02-28".into(),
        }
        .trimmed();
        assert_eq!(fields.voyage_number, "YM MANDATE 0096W");
        assert_eq!(fields.arrival_date, "2025-02-28");
    }
}
