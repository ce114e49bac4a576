//! One tracking job end to end: recorder, browser session, milestone loop.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::browser::{BrowserError, DriverFactory};
use crate::cache::MilestoneCache;
use crate::config::TrackerConfig;
use crate::llm::TrackerLlmError;
use crate::logging::TrackerLogger;
use crate::metrics::OracleMetrics;
use crate::oracle::Oracles;
use crate::oracle::llm::LlmOracles;
use crate::orchestrator::{Orchestrator, RunOutcome, RunSettings};
use crate::recorder::{RecorderError, RunRecorder};
use crate::runtime::ChromiumoxideFactory;

const LOG_CATEGORY: &str = "service";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackRequest {
    #[serde(default)]
    pub booking_id: Option<String>,
    #[serde(default)]
    pub carrier: Option<String>,
    #[serde(default)]
    pub force_fresh: bool,
}

impl TrackRequest {
    pub fn new(booking_id: impl Into<String>) -> Self {
        Self {
            booking_id: Some(booking_id.into()),
            carrier: None,
            force_fresh: false,
        }
    }

    pub fn carrier(mut self, carrier: impl Into<String>) -> Self {
        self.carrier = Some(carrier.into());
        self
    }

    pub fn force_fresh(mut self, force_fresh: bool) -> Self {
        self.force_fresh = force_fresh;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackResponse {
    pub success: bool,
    pub booking_id: String,
    pub carrier: String,
    pub voyage_number: Option<String>,
    pub arrival_date: Option<String>,
    pub used_cache: bool,
    /// Seconds, rounded to two decimals.
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
    pub extracted_data: serde_json::Map<String, serde_json::Value>,
}

impl TrackResponse {
    fn from_outcome(booking_id: &str, carrier: &str, outcome: &RunOutcome, started: Instant) -> Self {
        let seconds = started.elapsed().as_secs_f64();
        Self {
            success: outcome.goal_complete,
            booking_id: booking_id.to_string(),
            carrier: carrier.to_string(),
            voyage_number: outcome.voyage_number().map(str::to_string),
            arrival_date: outcome.arrival_date().map(str::to_string),
            used_cache: outcome.used_cache,
            execution_time: (seconds * 100.0).round() / 100.0,
            timestamp: Utc::now(),
            extracted_data: outcome
                .extracted
                .iter()
                .map(|(key, value)| (key.clone(), json!(value)))
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Llm(#[from] TrackerLlmError),
}

/// Shared, explicitly constructed state for tracking jobs. Each call to
/// [`TrackingService::track`] gets its own browser session and orchestrator;
/// concurrent jobs share only the cache directory and the metrics.
pub struct TrackingService {
    config: TrackerConfig,
    cache: MilestoneCache,
    oracles: Oracles,
    factory: Arc<dyn DriverFactory>,
    logger: TrackerLogger,
    metrics: Arc<Mutex<OracleMetrics>>,
}

impl TrackingService {
    pub fn new(
        config: TrackerConfig,
        oracles: Oracles,
        factory: Arc<dyn DriverFactory>,
        metrics: Arc<Mutex<OracleMetrics>>,
    ) -> Self {
        let cache = MilestoneCache::new(config.cache_dir.clone(), config.cache_ttl_days);
        let logger = TrackerLogger::new(config.verbose);
        Self {
            config,
            cache,
            oracles,
            factory,
            logger,
            metrics,
        }
    }

    /// Production wiring: OpenAI-compatible oracles and a chromiumoxide browser.
    pub fn from_config(config: TrackerConfig) -> Result<Self, TrackError> {
        let metrics = Arc::new(Mutex::new(OracleMetrics::default()));
        let oracles = Oracles::uniform(Arc::new(LlmOracles::from_config(
            &config,
            Arc::clone(&metrics),
        )?));
        let factory: Arc<dyn DriverFactory> = Arc::new(ChromiumoxideFactory::new(&config.browser));
        Ok(Self::new(config, oracles, factory, metrics))
    }

    pub fn cache(&self) -> &MilestoneCache {
        &self.cache
    }

    /// Oracle usage accumulated over every job this service ran.
    pub fn metrics(&self) -> OracleMetrics {
        self.metrics
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }

    pub async fn track(&self, request: TrackRequest) -> Result<TrackResponse, TrackError> {
        let booking_id = request
            .booking_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TrackError::InvalidRequest("booking_id is required".to_string()))?
            .to_string();
        let carrier = request
            .carrier
            .as_deref()
            .map(str::trim)
            .filter(|carrier| !carrier.is_empty())
            .unwrap_or(&self.config.default_carrier)
            .to_ascii_lowercase();

        let started = Instant::now();
        self.logger.info(
            format!("tracking {booking_id} ({carrier})"),
            Some(LOG_CATEGORY),
            Some(json!({"force_fresh": request.force_fresh})),
        );

        let mut recorder = RunRecorder::create(
            &self.config.log_dir,
            &booking_id,
            self.config.save_screenshots,
        )
        .await?;
        let driver = self.factory.connect().await?;

        let mut settings = RunSettings::from_config(&self.config);
        settings.force_fresh = request.force_fresh;
        let orchestrator = Orchestrator::new(
            driver.as_ref(),
            &self.oracles,
            &self.cache,
            &self.logger,
            settings,
        );
        let outcome = orchestrator.run(&booking_id, &carrier, &mut recorder).await;

        if let Err(err) = driver.shutdown().await {
            log::warn!("browser shutdown failed: {err}");
        }
        let outcome = outcome?;

        let response = TrackResponse::from_outcome(&booking_id, &carrier, &outcome, started);
        self.logger.info(
            format!(
                "tracking {booking_id} finished: success={} in {:.2}s",
                response.success, response.execution_time
            ),
            Some(LOG_CATEGORY),
            Some(json!({
                "run_id": outcome.run_id,
                "steps": outcome.steps,
                "aborted": outcome.aborted,
                "metrics": self.metrics(),
            })),
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserDriver;
    use crate::capture::Screenshot;
    use crate::instruction::{ActionScript, Instruction};
    use crate::milestone::Milestone;
    use crate::oracle::{
        EvaluationOracle, ExtractedFields, ExtractionOracle, GenerationRequest, LanguageDecision,
        LanguageOracle, LanguageRequest, OracleError, ReasoningDecision, ReasoningOracle,
        RubricRequest, ScriptGenerator, Verdict, VisionAnalysis, VisionOracle,
    };
    use crate::testing::FakeBrowser;
    use async_trait::async_trait;
    use serde_json::Value;

    /// Fails every consultation and counts them.
    #[derive(Default)]
    struct Refuse {
        calls: Mutex<usize>,
    }

    impl Refuse {
        fn refuse<T>(&self) -> Result<T, OracleError> {
            *self.calls.lock().unwrap() += 1;
            Err(OracleError::Other("offline".into()))
        }
    }

    #[async_trait]
    impl ReasoningOracle for Refuse {
        async fn decide(&self, _: &Value) -> Result<ReasoningDecision, OracleError> {
            self.refuse()
        }
    }

    #[async_trait]
    impl VisionOracle for Refuse {
        async fn analyze(&self, _: &Screenshot, _: &str) -> Result<VisionAnalysis, OracleError> {
            self.refuse()
        }

        async fn confirm_tab(&self, _: &Screenshot, _: &str, _: &str) -> Result<bool, OracleError> {
            self.refuse()
        }
    }

    #[async_trait]
    impl LanguageOracle for Refuse {
        async fn decide(&self, _: &LanguageRequest) -> Result<LanguageDecision, OracleError> {
            self.refuse()
        }
    }

    #[async_trait]
    impl ScriptGenerator for Refuse {
        async fn generate(&self, _: &GenerationRequest) -> Result<String, OracleError> {
            self.refuse()
        }
    }

    #[async_trait]
    impl EvaluationOracle for Refuse {
        async fn judge(&self, _: &RubricRequest) -> Result<Verdict, OracleError> {
            self.refuse()
        }
    }

    #[async_trait]
    impl ExtractionOracle for Refuse {
        async fn extract(&self, _: &[VisionAnalysis]) -> Result<ExtractedFields, OracleError> {
            self.refuse()
        }
    }

    struct NoBrowser;

    #[async_trait]
    impl DriverFactory for NoBrowser {
        async fn connect(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
            Err(BrowserError::Message("no chrome here".into()))
        }
    }

    struct SharedFake(Arc<FakeBrowser>);

    #[async_trait]
    impl DriverFactory for SharedFake {
        async fn connect(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
            Ok(self.0.clone())
        }
    }

    fn service(
        dir: &std::path::Path,
        oracle: Arc<Refuse>,
        factory: Arc<dyn DriverFactory>,
    ) -> TrackingService {
        let mut config = TrackerConfig::default().without_delays();
        config.cache_dir = dir.join("cache");
        config.log_dir = dir.join("logs");
        config.max_folds = 1;
        TrackingService::new(config, Oracles::uniform(oracle), factory, Arc::default())
    }

    fn navigate(url: &str) -> ActionScript {
        ActionScript {
            steps: vec![Instruction::Navigate { url: url.into() }],
        }
    }

    #[tokio::test]
    async fn blank_booking_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), Arc::default(), Arc::new(NoBrowser));
        let err = service.track(TrackRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, TrackError::InvalidRequest(_)));

        let err = service
            .track(TrackRequest {
                booking_id: None,
                carrier: None,
                force_fresh: false,
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "booking_id is required");
    }

    #[tokio::test]
    async fn browser_connection_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path(), Arc::default(), Arc::new(NoBrowser));
        let err = service
            .track(TrackRequest::new("SINI25432400"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::Browser(_)));
    }

    #[tokio::test]
    async fn fully_cached_booking_answers_without_oracles() {
        let dir = tempfile::tempdir().unwrap();
        let refuse = Arc::new(Refuse::default());
        let browser = Arc::new(FakeBrowser::with_page("about:blank"));
        let service = service(dir.path(), Arc::clone(&refuse), Arc::new(SharedFake(browser)));

        let cache = service.cache();
        let scripts = [
            (Milestone::ReachedHub, navigate("http://seacargotracking.net/")),
            (Milestone::ReachedCarrierSite, navigate("https://www.hmm21.com/")),
            (Milestone::AccessedServices, ActionScript::default()),
            (
                Milestone::SubmittedTrackingQuery,
                navigate("https://www.hmm21.com/e-service/trackNTrace"),
            ),
            (Milestone::ResultsDisplayed, ActionScript::default()),
        ];
        for (milestone, script) in &scripts {
            cache
                .save_milestone("hmm", "SINI25432400", *milestone, script, &[])
                .await
                .unwrap();
        }
        cache
            .save_final_results("hmm", "SINI25432400", "YM MANDATE 0096W", "2025-02-28", &[])
            .await
            .unwrap();

        let response = service
            .track(TrackRequest::new(" SINI25432400 ").carrier("HMM"))
            .await
            .unwrap();
        assert!(response.success);
        assert!(response.used_cache);
        assert_eq!(response.booking_id, "SINI25432400");
        assert_eq!(response.carrier, "hmm");
        assert_eq!(response.voyage_number.as_deref(), Some("YM MANDATE 0096W"));
        assert_eq!(response.arrival_date.as_deref(), Some("2025-02-28"));
        assert_eq!(*refuse.calls.lock().unwrap(), 0);
        assert_eq!(service.metrics(), OracleMetrics::default());
    }
}
