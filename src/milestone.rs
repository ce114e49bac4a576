//! The tracking checkpoint taxonomy and its transition graph.
//!
//! A run walks a single linear template:
//!
//! ```text
//! start -> reached_hub -> reached_carrier_site -> [accessed_services]
//!       -> submitted_tracking_query -> results_displayed -> data_extracted
//! ```
//!
//! Only `accessed_services` is optional. Milestones are identified by their
//! stable snake_case id; human labels (with the carrier substituted) are what
//! the oracles see.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Marker used as "last achieved milestone" before anything was reached.
pub const START_MARKER: &str = "Starting automation";

/// Marker shown to oracles when the remaining queue is empty.
pub const GOAL_COMPLETION: &str = "Goal completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Milestone {
    ReachedHub,
    ReachedCarrierSite,
    AccessedServices,
    SubmittedTrackingQuery,
    ResultsDisplayed,
    DataExtracted,
}

impl Milestone {
    /// Template order.
    pub const ALL: [Milestone; 6] = [
        Milestone::ReachedHub,
        Milestone::ReachedCarrierSite,
        Milestone::AccessedServices,
        Milestone::SubmittedTrackingQuery,
        Milestone::ResultsDisplayed,
        Milestone::DataExtracted,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Milestone::ReachedHub => "reached_hub",
            Milestone::ReachedCarrierSite => "reached_carrier_site",
            Milestone::AccessedServices => "accessed_services",
            Milestone::SubmittedTrackingQuery => "submitted_tracking_query",
            Milestone::ResultsDisplayed => "results_displayed",
            Milestone::DataExtracted => "data_extracted",
        }
    }

    /// Human label with the carrier code substituted upper-case.
    pub fn label(self, carrier: &str) -> String {
        match self {
            Milestone::ReachedHub => "Reached hub site".to_string(),
            Milestone::ReachedCarrierSite => {
                format!("Reached {} website", carrier.to_ascii_uppercase())
            }
            Milestone::AccessedServices => "Accessed services section (if needed)".to_string(),
            Milestone::SubmittedTrackingQuery => {
                "Found booking ID input field, entered booking ID, and submitted tracking query"
                    .to_string()
            }
            Milestone::ResultsDisplayed => "Results displayed".to_string(),
            Milestone::DataExtracted => "Data extracted".to_string(),
        }
    }

    pub fn is_optional(self) -> bool {
        matches!(self, Milestone::AccessedServices)
    }

    pub fn position(self) -> usize {
        Milestone::ALL
            .iter()
            .position(|candidate| *candidate == self)
            .unwrap_or(0)
    }

    /// The template from `self` onward.
    pub fn template_from(self) -> Vec<Milestone> {
        Milestone::ALL[self.position()..].to_vec()
    }

    /// The template predecessor, `None` for the first milestone.
    pub fn predecessor(self) -> Option<Milestone> {
        self.position()
            .checked_sub(1)
            .map(|index| Milestone::ALL[index])
    }

    /// Resolve oracle text to a milestone. Accepts the stable id or the exact
    /// label (ASCII case-insensitive, surrounding whitespace ignored).
    pub fn parse(text: &str, carrier: &str) -> Option<Milestone> {
        let text = text.trim();
        Milestone::ALL.into_iter().find(|milestone| {
            milestone.id() == text || milestone.label(carrier).eq_ignore_ascii_case(text)
        })
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// The finite-state graph milestones advance through.
#[derive(Debug, Clone, Copy, Default)]
pub struct MilestoneGraph;

impl MilestoneGraph {
    /// Milestones reachable from `from` (`None` = start) in one transition:
    /// the next template entry plus whatever follows a run of optional ones.
    pub fn successors(from: Option<Milestone>) -> Vec<Milestone> {
        let start = from.map(|milestone| milestone.position() + 1).unwrap_or(0);
        let mut reachable = Vec::new();
        for milestone in Milestone::ALL.iter().skip(start) {
            reachable.push(*milestone);
            if !milestone.is_optional() {
                break;
            }
        }
        reachable
    }

    pub fn is_transition(from: Option<Milestone>, to: Milestone) -> bool {
        Self::successors(from).contains(&to)
    }

    /// Optional milestones passed over when moving `from` -> `to`.
    pub fn skipped(from: Option<Milestone>, to: Milestone) -> Vec<Milestone> {
        if !Self::is_transition(from, to) {
            return Vec::new();
        }
        Self::successors(from)
            .into_iter()
            .take_while(|milestone| *milestone != to)
            .collect()
    }
}
