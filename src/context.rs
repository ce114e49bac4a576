//! Per-run automation state.
//!
//! [`AutomationContext`] holds what one tracking run knows: the goal, the
//! milestones still ahead, the page it is on, a short history of steps and
//! the data extracted so far. Oracles see it through [`AutomationContext::snapshot`].

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use serde_json::{Value, json};

use crate::llm::prompts;
use crate::milestone::{GOAL_COMPLETION, Milestone, MilestoneGraph, START_MARKER};
use crate::oracle::VisionAnalysis;
use crate::recorder::StepRecord;

/// Steps kept in the sliding history window.
pub const HISTORY_LIMIT: usize = 6;

pub const VOYAGE_NUMBER: &str = "voyage_number";
pub const ARRIVAL_DATE: &str = "arrival_date";

/// Raised into the next reasoning call when recent steps keep failing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAlert {
    pub detected: bool,
    pub count: usize,
    pub pattern: String,
    pub recommendation: String,
}

#[derive(Debug, Clone)]
pub struct AutomationContext {
    goal: String,
    booking_id: String,
    carrier: String,
    remaining: Vec<Milestone>,
    last_achieved: Option<Milestone>,
    history: VecDeque<StepRecord>,
    extracted: BTreeMap<String, String>,
    pub current_url: String,
    pub previous_url: String,
    pub last_action: Option<String>,
    pub last_instruction: Option<String>,
    pub last_result: Option<Value>,
    pub screenshots_taken: usize,
    pub latest_vision: Vec<VisionAnalysis>,
    pub post_action_vision: Vec<VisionAnalysis>,
}

impl AutomationContext {
    pub fn new(booking_id: &str, carrier: &str) -> Self {
        let mut context = Self {
            goal: String::new(),
            booking_id: String::new(),
            carrier: String::new(),
            remaining: Vec::new(),
            last_achieved: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            extracted: BTreeMap::new(),
            current_url: String::new(),
            previous_url: String::new(),
            last_action: None,
            last_instruction: None,
            last_result: None,
            screenshots_taken: 0,
            latest_vision: Vec::new(),
            post_action_vision: Vec::new(),
        };
        context.set_goal(booking_id, carrier);
        context
    }

    /// Reset the goal and milestone queue for `booking_id` on `carrier`.
    pub fn set_goal(&mut self, booking_id: &str, carrier: &str) {
        self.booking_id = booking_id.trim().to_string();
        self.carrier = carrier.trim().to_lowercase();
        self.goal = format!(
            "Extract voyage number and arrival date for booking {}",
            self.booking_id
        );
        self.remaining = Milestone::ALL.to_vec();
        self.last_achieved = None;
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn booking_id(&self) -> &str {
        &self.booking_id
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    pub fn remaining(&self) -> &[Milestone] {
        &self.remaining
    }

    pub fn next_milestone(&self) -> Option<Milestone> {
        self.remaining.first().copied()
    }

    pub fn last_achieved(&self) -> Option<Milestone> {
        self.last_achieved
    }

    pub fn last_achieved_label(&self) -> String {
        self.last_achieved
            .map(|milestone| milestone.label(&self.carrier))
            .unwrap_or_else(|| START_MARKER.to_string())
    }

    pub fn next_milestone_label(&self) -> String {
        self.next_milestone()
            .map(|milestone| milestone.label(&self.carrier))
            .unwrap_or_else(|| GOAL_COMPLETION.to_string())
    }

    /// Clear per-step fields before an iteration.
    pub fn clear_stale(&mut self) {
        self.last_action = None;
        self.last_instruction = None;
        self.last_result = None;
        self.screenshots_taken = 0;
        self.latest_vision.clear();
        self.post_action_vision.clear();
    }

    /// Record `achieved` if the graph permits reaching it from the last
    /// achieved milestone and it is still pending. Optional milestones passed
    /// over go with it. Returns whether anything changed.
    pub fn update_milestone(&mut self, achieved: Milestone) -> bool {
        if !self.remaining.contains(&achieved)
            || !MilestoneGraph::is_transition(self.last_achieved, achieved)
        {
            log::debug!(
                "ignoring milestone {achieved}: not reachable from {:?}",
                self.last_achieved
            );
            return false;
        }
        let skipped = MilestoneGraph::skipped(self.last_achieved, achieved);
        self.remaining
            .retain(|milestone| *milestone != achieved && !skipped.contains(milestone));
        self.last_achieved = Some(achieved);
        true
    }

    /// Whether `milestone` may be attempted next.
    pub fn can_attempt(&self, milestone: Milestone) -> bool {
        self.remaining.contains(&milestone)
            && MilestoneGraph::is_transition(self.last_achieved, milestone)
    }

    /// Rewind the queue so `milestone` is next.
    pub fn reset_to(&mut self, milestone: Milestone) {
        self.remaining = milestone.template_from();
        self.last_achieved = milestone.predecessor();
    }

    pub fn push_history(&mut self, record: StepRecord) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    pub fn history(&self) -> impl Iterator<Item = &StepRecord> {
        self.history.iter()
    }

    /// Merge extracted values. Keys are never removed and blank values never
    /// replace a present one.
    pub fn merge_extracted<I, K, V>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        for (key, value) in values {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            self.extracted.insert(key.into(), value.to_string());
        }
    }

    pub fn extracted(&self) -> &BTreeMap<String, String> {
        &self.extracted
    }

    pub fn extracted_value(&self, field: &str) -> Option<&str> {
        self.extracted
            .get(field)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn goal_complete(&self) -> bool {
        self.extracted_value(VOYAGE_NUMBER).is_some() && self.extracted_value(ARRIVAL_DATE).is_some()
    }

    /// Two or more of the last three steps failing with errors.
    pub fn detect_repeated_failures(&self) -> Option<FailureAlert> {
        if self.history.len() < 2 {
            return None;
        }
        let count = self
            .history
            .iter()
            .rev()
            .take(3)
            .filter(|record| record.has_errors())
            .count();
        (count >= 2).then(|| FailureAlert {
            detected: true,
            count,
            pattern: "Multiple consecutive failures detected".to_string(),
            recommendation: "Switch to alternative approach immediately".to_string(),
        })
    }

    /// JSON view of the run for the oracles.
    pub fn snapshot(&self, failure_alert: Option<&FailureAlert>) -> Value {
        let history: Vec<Value> = self.history.iter().map(summarize_step).collect();
        let recent: Vec<Value> = self
            .history
            .iter()
            .rev()
            .take(3)
            .map(|record| {
                json!({
                    "step": record.step,
                    "operations": record.operations,
                    "errors": record.errors,
                })
            })
            .collect();

        let mut snapshot = json!({
            "goal": self.goal,
            "booking_id": self.booking_id,
            "carrier": self.carrier,
            "current_url": self.current_url,
            "previous_url": self.previous_url,
            "last_milestone": self.last_achieved_label(),
            "next_milestone": self.next_milestone_label(),
            "remaining_milestones": self
                .remaining
                .iter()
                .map(|milestone| milestone.label(&self.carrier))
                .collect::<Vec<_>>(),
            "last_action": self.last_action,
            "last_instruction": self.last_instruction,
            "last_result": self.last_result,
            "history": history,
            "recent_step_data": recent,
            "extracted_data": self.extracted,
            "post_action_vision": self
                .post_action_vision
                .iter()
                .map(|analysis| json!({"found": analysis.found, "notes": analysis.notes,
                    "labels": analysis.labels().take(10).collect::<Vec<_>>()}))
                .collect::<Vec<_>>(),
            "knowledge_base": prompts::knowledge_base(&self.carrier),
        });
        if let (Some(alert), Some(object)) = (failure_alert, snapshot.as_object_mut()) {
            object.insert(
                "failure_alert".to_string(),
                serde_json::to_value(alert).unwrap_or(Value::Null),
            );
        }
        snapshot
    }
}

fn summarize_step(record: &StepRecord) -> Value {
    json!({
        "step": record.step,
        "timestamp": record.timestamp,
        "operations": record.operations,
        "milestone": record.milestone,
        "url": record.current_url,
        "success": record.success,
        "error_count": record.errors.len(),
    })
}
