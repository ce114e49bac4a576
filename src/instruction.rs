//! Sandboxed browser instruction set.
//!
//! Generated actions are JSON documents of the form
//! `{"steps": [{"op": "click_at", "x": 120, "y": 340}, ...]}`. Nothing else is
//! executable: [`compile`] parses and validates a document against a
//! [`CompilePolicy`] before the executor ever sees it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const MAX_STEPS: usize = 20;
pub const MAX_WAIT_MS: u64 = 10_000;

/// Keys a `press_key` step may send.
pub const ALLOWED_KEYS: &[&str] = &[
    "Enter", "Tab", "Escape", "Backspace", "ArrowDown", "ArrowUp", "PageDown", "PageUp",
];

/// Fields an `extract` step may fill.
pub const EXTRACTABLE_FIELDS: &[&str] = &["voyage_number", "arrival_date"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Navigate {
        url: String,
    },
    ClickAt {
        x: f64,
        y: f64,
        #[serde(default)]
        expect_new_tab: bool,
    },
    ClickText {
        text: String,
        #[serde(default)]
        expect_new_tab: bool,
    },
    /// Optionally focus `(x, y)` first; `submit` presses Enter afterwards.
    Type {
        text: String,
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
        #[serde(default)]
        submit: bool,
    },
    PressKey {
        key: String,
    },
    Wait {
        ms: u64,
    },
    /// Read the value displayed next to `label` into `field`.
    Extract {
        field: String,
        label: String,
    },
    DismissPopups,
}

impl Instruction {
    /// Steps after which a new tab may appear.
    pub fn may_open_tab(&self) -> bool {
        matches!(
            self,
            Instruction::ClickAt { .. }
                | Instruction::ClickText { .. }
                | Instruction::Type { submit: true, .. }
                | Instruction::PressKey { .. }
        )
    }

    pub fn expects_new_tab(&self) -> bool {
        match self {
            Instruction::ClickAt { expect_new_tab, .. }
            | Instruction::ClickText { expect_new_tab, .. } => *expect_new_tab,
            _ => false,
        }
    }

    pub fn is_coordinate_click(&self) -> bool {
        matches!(self, Instruction::ClickAt { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Navigate { .. } => "navigate",
            Instruction::ClickAt { .. } => "click_at",
            Instruction::ClickText { .. } => "click_text",
            Instruction::Type { .. } => "type",
            Instruction::PressKey { .. } => "press_key",
            Instruction::Wait { .. } => "wait",
            Instruction::Extract { .. } => "extract",
            Instruction::DismissPopups => "dismiss_popups",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionScript {
    pub steps: Vec<Instruction>,
}

impl ActionScript {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompilePolicy {
    /// Hosts `navigate` may target (a host matches itself and its subdomains).
    pub allowed_hosts: Vec<String>,
}

impl CompilePolicy {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self { allowed_hosts }
    }

    pub fn allows_url(&self, raw: &str) -> bool {
        let Ok(url) = Url::parse(raw) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.allowed_hosts
            .iter()
            .any(|allowed| host == *allowed || host.ends_with(&format!(".{allowed}")))
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("no JSON object found in generated action")]
    MissingJson,
    #[error("generated action is not a valid instruction script: {0}")]
    Malformed(String),
    #[error("generated action has no steps")]
    Empty,
    #[error("generated action has {0} steps, more than the allowed maximum")]
    TooLong(usize),
    #[error("step {index} ({op}): {reason}")]
    InvalidStep {
        index: usize,
        op: &'static str,
        reason: String,
    },
    #[error("step {index}: navigation to {url} is not permitted")]
    ForbiddenNavigation { index: usize, url: String },
}

/// Parse and validate generated text into an [`ActionScript`].
pub fn compile(source: &str, policy: &CompilePolicy) -> Result<ActionScript, CompileError> {
    let json = crate::oracle::extract_json(source).ok_or(CompileError::MissingJson)?;
    let script: ActionScript =
        serde_json::from_str(json).map_err(|err| CompileError::Malformed(err.to_string()))?;
    validate(&script, policy)?;
    Ok(script)
}

/// Validate an already-typed script, e.g. one loaded from the cache.
pub fn validate(script: &ActionScript, policy: &CompilePolicy) -> Result<(), CompileError> {
    if script.steps.is_empty() {
        return Err(CompileError::Empty);
    }
    if script.steps.len() > MAX_STEPS {
        return Err(CompileError::TooLong(script.steps.len()));
    }

    for (index, step) in script.steps.iter().enumerate() {
        let invalid = |reason: &str| CompileError::InvalidStep {
            index,
            op: step.name(),
            reason: reason.to_string(),
        };
        match step {
            Instruction::Navigate { url } => {
                if !policy.allows_url(url) {
                    return Err(CompileError::ForbiddenNavigation {
                        index,
                        url: url.clone(),
                    });
                }
            }
            Instruction::ClickAt { x, y, .. } => {
                if !valid_coordinate(*x) || !valid_coordinate(*y) {
                    return Err(invalid("coordinates must be finite and non-negative"));
                }
            }
            Instruction::ClickText { text, .. } => {
                if text.trim().is_empty() {
                    return Err(invalid("link text must not be empty"));
                }
            }
            Instruction::Type { text, x, y, .. } => {
                if text.is_empty() {
                    return Err(invalid("text must not be empty"));
                }
                match (x, y) {
                    (Some(x), Some(y)) if !valid_coordinate(*x) || !valid_coordinate(*y) => {
                        return Err(invalid("focus coordinates must be finite and non-negative"));
                    }
                    (Some(_), None) | (None, Some(_)) => {
                        return Err(invalid("focus needs both x and y"));
                    }
                    _ => {}
                }
            }
            Instruction::PressKey { key } => {
                if !ALLOWED_KEYS.contains(&key.as_str()) {
                    return Err(invalid("key is not in the allowed set"));
                }
            }
            Instruction::Wait { ms } => {
                if *ms > MAX_WAIT_MS {
                    return Err(invalid("wait exceeds the maximum"));
                }
            }
            Instruction::Extract { field, label } => {
                if !EXTRACTABLE_FIELDS.contains(&field.as_str()) {
                    return Err(invalid("unknown field"));
                }
                if label.trim().is_empty() {
                    return Err(invalid("label must not be empty"));
                }
            }
            Instruction::DismissPopups => {}
        }
    }
    Ok(())
}

fn valid_coordinate(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CompilePolicy {
        CompilePolicy::new(vec!["seacargotracking.net".to_string()])
    }

    #[test]
    fn compiles_fenced_model_output() {
        let source = r#"Here you go:
```json
{"steps": [
  {"op": "type", "text": "SINI25432400", "x": 410, "y": 288, "submit": true},
  {"op": "wait", "ms": 500}
]}
```"#;
        let script = compile(source, &policy()).expect("compiles");
        assert_eq!(script.steps.len(), 2);
        assert_eq!(
            script.steps[0],
            Instruction::Type {
                text: "SINI25432400".into(),
                x: Some(410.0),
                y: Some(288.0),
                submit: true,
            }
        );
    }

    #[test]
    fn navigation_limited_to_allowed_hosts() {
        let ok = r#"{"steps":[{"op":"navigate","url":"http://www.seacargotracking.net/"}]}"#;
        assert!(compile(ok, &policy()).is_ok());

        let carrier = r#"{"steps":[{"op":"navigate","url":"https://www.hmm21.com/track"}]}"#;
        assert!(matches!(
            compile(carrier, &policy()),
            Err(CompileError::ForbiddenNavigation { index: 0, .. })
        ));

        let scheme = r#"{"steps":[{"op":"navigate","url":"javascript:alert(1)"}]}"#;
        assert!(matches!(
            compile(scheme, &policy()),
            Err(CompileError::ForbiddenNavigation { .. })
        ));
    }

    #[test]
    fn rejects_unknown_ops_and_bad_arguments() {
        let unknown = r#"{"steps":[{"op":"eval","code":"document.body.remove()"}]}"#;
        assert!(matches!(
            compile(unknown, &policy()),
            Err(CompileError::Malformed(_))
        ));

        let negative = r#"{"steps":[{"op":"click_at","x":-4,"y":10}]}"#;
        assert!(matches!(
            compile(negative, &policy()),
            Err(CompileError::InvalidStep { op: "click_at", .. })
        ));

        let key = r#"{"steps":[{"op":"press_key","key":"F12"}]}"#;
        assert!(compile(key, &policy()).is_err());

        let half_focus = r#"{"steps":[{"op":"type","text":"x","x":5}]}"#;
        assert!(compile(half_focus, &policy()).is_err());

        assert_eq!(
            compile(r#"{"steps":[]}"#, &policy()),
            Err(CompileError::Empty)
        );
        assert_eq!(compile("no json here", &policy()), Err(CompileError::MissingJson));
    }

    #[test]
    fn tab_opening_classification() {
        let click = Instruction::ClickAt {
            x: 1.0,
            y: 2.0,
            expect_new_tab: true,
        };
        assert!(click.may_open_tab());
        assert!(click.expects_new_tab());
        assert!(click.is_coordinate_click());
        assert!(!Instruction::Wait { ms: 1 }.may_open_tab());
        assert!(
            Instruction::Type {
                text: "a".into(),
                x: None,
                y: None,
                submit: true
            }
            .may_open_tab()
        );
    }
}
