//! Per-run audit trail.
//!
//! Each run gets a `run_id` and two JSONL files under
//! `{log_dir}/{booking_id}/`: `complete.jsonl` with every operation and
//! `pipeline.jsonl` with one [`StepRecord`] per loop iteration. Write failures
//! are logged and never interrupt a run.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::metrics::elapsed_ms;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to prepare log directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error taxonomy shared by step records and execution reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Compilation,
    Execution,
    OracleParse,
    Oracle,
    NavigationHijack,
    FatalBrowser,
    Evaluation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    pub data: Value,
}

/// Immutable audit entry for one loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step: usize,
    pub timestamp: DateTime<Utc>,
    pub operations: Vec<String>,
    pub milestone: Option<String>,
    pub current_url: String,
    pub success: bool,
    pub errors: Vec<StepError>,
    pub duration_ms: u64,
}

impl StepRecord {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

struct OpenStep {
    step: usize,
    started: Instant,
    timestamp: DateTime<Utc>,
    operations: Vec<OperationRecord>,
}

pub struct RunRecorder {
    run_id: String,
    dir: PathBuf,
    save_screenshots: bool,
    current: Option<OpenStep>,
}

impl RunRecorder {
    /// Prepare `{log_dir}/{booking_id}`, discarding logs of earlier runs.
    pub async fn create(
        log_dir: &Path,
        booking_id: &str,
        save_screenshots: bool,
    ) -> Result<Self, RecorderError> {
        let dir = log_dir.join(sanitize_component(booking_id));
        if fs::metadata(&dir).await.is_ok() {
            if let Err(err) = fs::remove_dir_all(&dir).await {
                log::warn!("could not clear previous logs at {}: {err}", dir.display());
            }
        }
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| RecorderError::Prepare {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            run_id: Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string(),
            dir,
            save_screenshots,
            current: None,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn start_step(&mut self, step: usize) {
        self.current = Some(OpenStep {
            step,
            started: Instant::now(),
            timestamp: Utc::now(),
            operations: Vec::new(),
        });
    }

    pub fn log_operation(
        &mut self,
        operation: impl Into<String>,
        data: Value,
        success: bool,
        duration_ms: Option<u64>,
    ) {
        self.push(OperationRecord {
            operation: operation.into(),
            timestamp: Utc::now(),
            data,
            success,
            duration_ms,
            error_kind: None,
        });
    }

    pub fn log_error(&mut self, operation: impl Into<String>, kind: ErrorKind, data: Value) {
        self.push(OperationRecord {
            operation: operation.into(),
            timestamp: Utc::now(),
            data,
            success: false,
            duration_ms: None,
            error_kind: Some(kind),
        });
    }

    fn push(&mut self, record: OperationRecord) {
        if self.current.is_none() {
            self.start_step(0);
        }
        if let Some(step) = self.current.as_mut() {
            step.operations.push(record);
        }
    }

    /// Operations logged so far in the open step.
    pub fn current_operations(&self) -> &[OperationRecord] {
        self.current
            .as_ref()
            .map(|step| step.operations.as_slice())
            .unwrap_or(&[])
    }

    /// Close the open step, persist it and hand back its record.
    pub async fn end_step(
        &mut self,
        milestone: Option<String>,
        current_url: &str,
        success: bool,
    ) -> StepRecord {
        let open = self.current.take().unwrap_or_else(|| OpenStep {
            step: 0,
            started: Instant::now(),
            timestamp: Utc::now(),
            operations: Vec::new(),
        });

        let errors = open
            .operations
            .iter()
            .filter(|op| !op.success)
            .map(|op| StepError {
                operation: op.operation.clone(),
                kind: op.error_kind,
                data: op.data.clone(),
            })
            .collect();

        let record = StepRecord {
            run_id: self.run_id.clone(),
            step: open.step,
            timestamp: open.timestamp,
            operations: open
                .operations
                .iter()
                .map(|op| op.operation.clone())
                .collect(),
            milestone,
            current_url: current_url.to_string(),
            success,
            errors,
            duration_ms: elapsed_ms(open.started),
        };

        let mut complete = Vec::new();
        for op in &open.operations {
            let line = serde_json::json!({
                "run_id": self.run_id,
                "step": open.step,
                "operation": op,
            });
            complete.push(line.to_string());
        }
        self.append("complete.jsonl", &complete).await;
        if let Ok(line) = serde_json::to_string(&record) {
            self.append("pipeline.jsonl", &[line]).await;
        }

        record
    }

    pub async fn save_screenshot(&self, step: usize, label: &str, png: &[u8]) {
        if !self.save_screenshots {
            return;
        }
        let path = self
            .dir
            .join(format!("step{step:02}_{}.png", sanitize_component(label)));
        if let Err(err) = fs::write(&path, png).await {
            log::warn!("failed to save screenshot {}: {err}", path.display());
        }
    }

    async fn append(&self, file: &str, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let path = self.dir.join(file);
        let result = async {
            let mut handle = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            for line in lines {
                handle.write_all(line.as_bytes()).await?;
                handle.write_all(b"\n").await?;
            }
            handle.flush().await
        }
        .await;
        if let Err(err) = result {
            log::warn!("failed to append to {}: {err}", path.display());
        }
    }
}

/// Restrict a path component to `[A-Za-z0-9_-]`.
pub fn sanitize_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
