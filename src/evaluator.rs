//! Decides whether a step actually reached its milestone.
//!
//! Deterministic evidence comes first (fatal pages, URL and keyword checks);
//! only the remaining cases go to the rubric oracle, and an oracle failure
//! falls back to success unless the page is fatal.

use crate::executor::ExecutionReport;
use crate::milestone::Milestone;
use crate::oracle::{EvaluationOracle, RubricRequest, VisionAnalysis};

pub const FATAL_URL_PREFIXES: &[&str] = &["chrome-error://", "about:blank"];

pub const RESULT_KEYWORDS: &[&str] = &[
    "tracking result",
    "track & trace",
    "b/l no.",
    "booking no.",
    "route",
    "voyage",
    "arrival",
    "vessel",
    "eta",
    "discharge",
];

pub const TRACKING_URL_KEYWORDS: &[&str] = &["track", "trace", "result", "search", "query"];

pub const NO_RESULT_MARKERS: &[&str] = &["no results found", "invalid booking", "not found"];

pub fn is_fatal_url(url: &str) -> bool {
    let url = url.trim().to_lowercase();
    FATAL_URL_PREFIXES
        .iter()
        .any(|prefix| url.starts_with(prefix))
}

fn has_result_keywords(analysis: &VisionAnalysis) -> bool {
    let corpus = analysis.corpus();
    RESULT_KEYWORDS.iter().any(|keyword| corpus.contains(keyword))
}

fn has_no_result_marker(analysis: &VisionAnalysis) -> bool {
    let corpus = analysis.corpus();
    NO_RESULT_MARKERS.iter().any(|marker| corpus.contains(marker))
}

fn is_tracking_url(url: &str) -> bool {
    let url = url.to_lowercase();
    TRACKING_URL_KEYWORDS
        .iter()
        .any(|keyword| url.contains(keyword))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub succeeded: bool,
    pub reasoning: String,
}

impl Evaluation {
    fn pass(reasoning: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            reasoning: reasoning.into(),
        }
    }

    fn fail(reasoning: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            reasoning: reasoning.into(),
        }
    }
}

/// Everything known about one attempted step.
#[derive(Debug, Clone)]
pub struct StepOutcome<'a> {
    pub milestone: Milestone,
    pub instruction: &'a str,
    pub action_required: bool,
    pub execution: Option<&'a ExecutionReport>,
    pub url_before: &'a str,
    pub url_after: &'a str,
    pub analysis: Option<&'a VisionAnalysis>,
}

pub struct StepEvaluator<'a> {
    oracle: &'a dyn EvaluationOracle,
    booking_id: String,
    carrier: String,
    hub_host: Option<String>,
}

impl<'a> StepEvaluator<'a> {
    pub fn new(
        oracle: &'a dyn EvaluationOracle,
        booking_id: &str,
        carrier: &str,
        hub_host: Option<String>,
    ) -> Self {
        Self {
            oracle,
            booking_id: booking_id.to_lowercase(),
            carrier: carrier.to_lowercase(),
            hub_host: hub_host.map(|host| host.to_lowercase()),
        }
    }

    /// URL evidence that a site milestone was reached.
    fn site_reached(&self, milestone: Milestone, url: &str) -> bool {
        let url = url.to_lowercase();
        let on_hub = self
            .hub_host
            .as_deref()
            .map(|host| url.contains(host))
            .unwrap_or(false);
        match milestone {
            Milestone::ReachedHub => on_hub,
            Milestone::ReachedCarrierSite => !on_hub && url.contains(&self.carrier),
            _ => false,
        }
    }

    pub async fn evaluate(&self, outcome: &StepOutcome<'_>) -> Evaluation {
        if is_fatal_url(outcome.url_after) {
            return Evaluation::fail(format!("landed on fatal page {}", outcome.url_after));
        }

        let executed_ok = outcome.execution.map(|report| report.success).unwrap_or(false);

        if outcome.milestone == Milestone::SubmittedTrackingQuery {
            return self.evaluate_submission(outcome, executed_ok);
        }

        if matches!(
            outcome.milestone,
            Milestone::ResultsDisplayed | Milestone::DataExtracted
        ) {
            if let Some(analysis) = outcome.analysis {
                let extracted = outcome
                    .execution
                    .map(|report| !report.results.is_empty())
                    .unwrap_or(false);
                if has_no_result_marker(analysis) {
                    return Evaluation::fail("page reports no results for the booking");
                }
                if !has_result_keywords(analysis) && !extracted {
                    return Evaluation::fail(format!(
                        "no tracking results visible: {}",
                        analysis.notes.trim()
                    ));
                }
            }
        }

        if !outcome.action_required {
            return Evaluation::pass("no action was required");
        }

        if !executed_ok && self.site_reached(outcome.milestone, outcome.url_after) {
            return Evaluation::pass("target site reached despite partial action errors");
        }

        let request = RubricRequest {
            milestone: outcome.milestone.id().to_string(),
            instruction: outcome.instruction.to_string(),
            url_before: outcome.url_before.to_string(),
            url_after: outcome.url_after.to_string(),
            execution_success: executed_ok,
            execution_error: outcome.execution.and_then(|report| report.error.clone()),
            analysis: outcome.analysis.cloned(),
        };
        match self.oracle.judge(&request).await {
            Ok(verdict) => Evaluation {
                succeeded: verdict.success,
                reasoning: verdict.reasoning,
            },
            Err(err) => {
                log::warn!("rubric oracle failed, accepting step: {err}");
                Evaluation::pass(format!("evaluation unavailable ({err}); page is not fatal"))
            }
        }
    }

    fn evaluate_submission(&self, outcome: &StepOutcome<'_>, executed_ok: bool) -> Evaluation {
        if !outcome.action_required {
            return Evaluation::fail("submitting the query requires an action");
        }
        if !executed_ok {
            return Evaluation::fail("submission action failed");
        }
        let analysis_evidence = outcome
            .analysis
            .map(|analysis| {
                (!self.booking_id.is_empty() && analysis.mentions(&self.booking_id))
                    || has_result_keywords(analysis)
            })
            .unwrap_or(false);
        if analysis_evidence {
            return Evaluation::pass("page shows the booking or tracking results");
        }
        if is_tracking_url(outcome.url_after) {
            return Evaluation::pass("URL points at a tracking result");
        }
        if outcome.url_before != outcome.url_after {
            return Evaluation::pass("page navigated after submission");
        }
        Evaluation::fail("no evidence the tracking query was submitted")
    }

    /// Local check for a replayed cached script.
    pub fn evaluate_replay(&self, milestone: Milestone, report: &ExecutionReport) -> Evaluation {
        if !report.success {
            return Evaluation::fail(format!(
                "cached script failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if is_fatal_url(&report.url_after) {
            return Evaluation::fail(format!("cached script ended on {}", report.url_after));
        }
        match milestone {
            Milestone::ReachedHub | Milestone::ReachedCarrierSite => {
                if self.site_reached(milestone, &report.url_after) {
                    Evaluation::pass("cached navigation reached the site")
                } else {
                    Evaluation::fail(format!("cached navigation ended on {}", report.url_after))
                }
            }
            Milestone::SubmittedTrackingQuery => {
                if is_tracking_url(&report.url_after) || report.url_changed() {
                    Evaluation::pass("cached submission reached a result page")
                } else {
                    Evaluation::fail("cached submission did not navigate")
                }
            }
            _ => Evaluation::pass("cached script executed"),
        }
    }
}
