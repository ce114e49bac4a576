//! Levelled, categorised logging for tracking runs.
//!
//! Lines go through the `log` facade under the `shiptrack` target, so
//! `env_logger` filtering applies. [`Verbosity`] gates what reaches it;
//! errors always pass.

use log::Level;
use serde_json::Value;

use crate::config::Verbosity;

const TARGET: &str = "shiptrack";

#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerLogger {
    verbose: Verbosity,
}

impl TrackerLogger {
    pub fn new(verbose: Verbosity) -> Self {
        Self { verbose }
    }

    pub fn enabled(&self, level: Level) -> bool {
        match level {
            Level::Error | Level::Warn => true,
            Level::Info => self.verbose.as_u8() >= 1,
            Level::Debug | Level::Trace => self.verbose.as_u8() >= 2,
        }
    }

    pub fn log(
        &self,
        level: Level,
        message: impl Into<String>,
        category: Option<&str>,
        auxiliary: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }
        let line = format_line(&message.into(), category, auxiliary.as_ref());
        log::log!(target: TARGET, level, "{line}");
    }

    pub fn error(&self, message: impl Into<String>, category: Option<&str>, auxiliary: Option<Value>) {
        self.log(Level::Error, message, category, auxiliary);
    }

    pub fn info(&self, message: impl Into<String>, category: Option<&str>, auxiliary: Option<Value>) {
        self.log(Level::Info, message, category, auxiliary);
    }

    pub fn debug(&self, message: impl Into<String>, category: Option<&str>, auxiliary: Option<Value>) {
        self.log(Level::Debug, message, category, auxiliary);
    }
}

/// `[category] message {payload}`; null payloads are dropped.
fn format_line(message: &str, category: Option<&str>, auxiliary: Option<&Value>) -> String {
    let mut line = match category {
        Some(category) => format!("[{category}] {message}"),
        None => message.to_string(),
    };
    if let Some(aux) = auxiliary.filter(|aux| !aux.is_null()) {
        line.push(' ');
        line.push_str(&aux.to_string());
    }
    line
}
