//! File-backed milestone cache.
//!
//! One JSON record per `(carrier, booking_id)` at
//! `{cache_dir}/{carrier}_{booking_id}.json`:
//!
//! ```json
//! {
//!   "cached_at": "2025-02-01T10:00:00Z",
//!   "milestones": {
//!     "reached_hub": {"cached_at": "...", "script": {"steps": [...]}, "operations": [...]}
//!   },
//!   "final_results": {"voyage_number": "...", "arrival_date": "...", "verification_scripts": [...], "cached_at": "..."}
//! }
//! ```
//!
//! The top-level `cached_at` is written once when the record is created and
//! gates the whole record: at or beyond the TTL every lookup misses. Saves are
//! unsynchronised read-modify-write cycles; concurrent writers for one key
//! resolve as last-write-wins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::instruction::ActionScript;
use crate::milestone::Milestone;
use crate::recorder::{OperationRecord, sanitize_component};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialise cache record: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedMilestone {
    pub cached_at: DateTime<Utc>,
    pub script: ActionScript,
    #[serde(default)]
    pub operations: Vec<OperationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResults {
    pub voyage_number: String,
    pub arrival_date: String,
    #[serde(default)]
    pub verification_scripts: Vec<ActionScript>,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Missing timestamps are treated as infinitely old.
    #[serde(default)]
    pub cached_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub milestones: BTreeMap<String, CachedMilestone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_results: Option<FinalResults>,
}

impl CacheRecord {
    fn is_fresh(&self, now: DateTime<Utc>, ttl_days: i64) -> bool {
        let created = self.cached_at.unwrap_or_else(epoch);
        let ttl = ChronoDuration::try_days(ttl_days).unwrap_or(ChronoDuration::MAX);
        now.signed_duration_since(created) < ttl
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Debug, Clone)]
pub struct MilestoneCache {
    dir: PathBuf,
    ttl_days: i64,
}

impl MilestoneCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_days: i64) -> Self {
        Self {
            dir: dir.into(),
            ttl_days,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, carrier: &str, booking_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            sanitize_component(&carrier.to_ascii_lowercase()),
            sanitize_component(booking_id)
        ))
    }

    /// Cached script for `milestone`, absent when missing, malformed or expired.
    pub async fn get(
        &self,
        carrier: &str,
        booking_id: &str,
        milestone: Milestone,
    ) -> Option<CachedMilestone> {
        let record = self.load_fresh(carrier, booking_id).await?;
        record.milestones.get(milestone.id()).cloned()
    }

    pub async fn get_final_results(&self, carrier: &str, booking_id: &str) -> Option<FinalResults> {
        self.load_fresh(carrier, booking_id).await?.final_results
    }

    /// Upsert one milestone without disturbing its siblings.
    pub async fn save_milestone(
        &self,
        carrier: &str,
        booking_id: &str,
        milestone: Milestone,
        script: &ActionScript,
        operations: &[OperationRecord],
    ) -> Result<(), CacheError> {
        let mut record = self.load_for_update(carrier, booking_id).await;
        record.milestones.insert(
            milestone.id().to_string(),
            CachedMilestone {
                cached_at: Utc::now(),
                script: script.clone(),
                operations: operations.to_vec(),
            },
        );
        self.write(carrier, booking_id, &record).await
    }

    pub async fn save_final_results(
        &self,
        carrier: &str,
        booking_id: &str,
        voyage_number: &str,
        arrival_date: &str,
        verification_scripts: &[ActionScript],
    ) -> Result<(), CacheError> {
        let mut record = self.load_for_update(carrier, booking_id).await;
        record.final_results = Some(FinalResults {
            voyage_number: voyage_number.to_string(),
            arrival_date: arrival_date.to_string(),
            verification_scripts: verification_scripts.to_vec(),
            cached_at: Utc::now(),
        });
        self.write(carrier, booking_id, &record).await
    }

    async fn read(&self, carrier: &str, booking_id: &str) -> Option<CacheRecord> {
        let path = self.path_for(carrier, booking_id);
        let raw = fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<CacheRecord>(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!("ignoring malformed cache record {}: {err}", path.display());
                None
            }
        }
    }

    async fn load_fresh(&self, carrier: &str, booking_id: &str) -> Option<CacheRecord> {
        let record = self.read(carrier, booking_id).await?;
        if record.is_fresh(Utc::now(), self.ttl_days) {
            Some(record)
        } else {
            log::debug!("cache record for {carrier}/{booking_id} expired");
            None
        }
    }

    /// The fresh record, or a new one stamped now. Expired and unstamped
    /// records are replaced wholesale.
    async fn load_for_update(&self, carrier: &str, booking_id: &str) -> CacheRecord {
        match self.load_fresh(carrier, booking_id).await {
            Some(record) => record,
            None => CacheRecord {
                cached_at: Some(Utc::now()),
                ..CacheRecord::default()
            },
        }
    }

    async fn write(
        &self,
        carrier: &str,
        booking_id: &str,
        record: &CacheRecord,
    ) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CacheError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let path = self.path_for(carrier, booking_id);
        let body = serde_json::to_string_pretty(record)?;
        fs::write(&path, body)
            .await
            .map_err(|source| CacheError::Io { path, source })
    }
}
