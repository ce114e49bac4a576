//! A simulated hub and carrier site plus scripted oracles for the
//! end-to-end suites.
//!
//! Screenshots encode the URL they were taken of (`sim:{url}`) so the
//! scripted vision oracle can describe whatever page is active.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use shiptrack_rs::browser::{BrowserDriver, BrowserError, DriverFactory, PageId};
use shiptrack_rs::capture::Screenshot;
use shiptrack_rs::config::TrackerConfig;
use shiptrack_rs::milestone::Milestone;
use shiptrack_rs::oracle::{
    AdRecovery, EvaluationOracle, ExtractedFields, ExtractionOracle, GenerationRequest,
    LanguageDecision, LanguageOracle, LanguageRequest, OracleError, Oracles, ReasoningDecision,
    ReasoningOracle, RubricRequest, ScriptGenerator, Verdict, VisionAnalysis, VisionElement,
    VisionOracle,
};
use shiptrack_rs::service::TrackingService;

pub const BOOKING_ID: &str = "SINI25432400";
pub const VOYAGE: &str = "YM MANDATE 0096W";
pub const ARRIVAL: &str = "2025-02-28";

pub const HUB_URL: &str = "http://seacargotracking.net/";
pub const CARRIER_URL: &str = "https://www.hmm21.com/e-service/general/DashBoard.do";
pub const AD_URL: &str = "https://googleads.g.doubleclick.net/promo/landing";
pub const RESULT_URL: &str =
    "https://www.hmm21.com/e-service/general/trackNTrace/TrackNTrace.do?bkg=SINI25432400";
pub const LOGIN_URL: &str = "https://www.hmm21.com/e-service/login.do";

#[derive(Debug, Clone)]
struct SimPage {
    id: PageId,
    url: String,
    closed: bool,
}

#[derive(Debug, Default)]
struct SimState {
    pages: Vec<SimPage>,
    next_id: u32,
    navigations: Vec<String>,
    typed: Vec<String>,
}

/// Browser over a two-site world: clicking the hub opens the carrier site in
/// a new tab next to an ad tab, and pressing Enter on the carrier site
/// submits the query to `submit_url`.
#[derive(Debug)]
pub struct SimBrowser {
    state: Mutex<SimState>,
    submit_url: String,
}

impl SimBrowser {
    pub fn new(submit_url: &str) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            submit_url: submit_url.to_string(),
        }
    }

    pub fn open_pages(&self) -> Vec<(PageId, String)> {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .filter(|page| !page.closed)
            .map(|page| (page.id.clone(), page.url.clone()))
            .collect()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state.lock().unwrap().navigations.clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.state.lock().unwrap().typed.clone()
    }

    fn open(state: &mut SimState, url: &str) -> PageId {
        state.next_id += 1;
        let id = format!("sim-{}", state.next_id);
        state.pages.push(SimPage {
            id: id.clone(),
            url: url.to_string(),
            closed: false,
        });
        id
    }

    fn with_page<T>(
        &self,
        page: &PageId,
        f: impl FnOnce(&mut SimState, usize) -> T,
    ) -> Result<T, BrowserError> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .pages
            .iter()
            .position(|candidate| &candidate.id == page && !candidate.closed)
            .ok_or_else(|| BrowserError::PageNotFound(page.clone()))?;
        Ok(f(&mut state, index))
    }
}

#[async_trait]
impl BrowserDriver for SimBrowser {
    async fn pages(&self) -> Result<Vec<PageId>, BrowserError> {
        Ok(self.open_pages().into_iter().map(|(id, _)| id).collect())
    }

    async fn new_page(&self, url: &str) -> Result<PageId, BrowserError> {
        Ok(Self::open(&mut self.state.lock().unwrap(), url))
    }

    async fn url(&self, page: &PageId) -> Result<String, BrowserError> {
        self.with_page(page, |state, index| state.pages[index].url.clone())
    }

    async fn navigate(&self, page: &PageId, url: &str) -> Result<(), BrowserError> {
        self.with_page(page, |state, index| {
            state.pages[index].url = url.to_string();
            state.navigations.push(url.to_string());
        })
    }

    async fn click(&self, page: &PageId, _x: f64, _y: f64) -> Result<(), BrowserError> {
        self.with_page(page, |state, index| {
            if state.pages[index].url.contains("seacargotracking") {
                Self::open(state, CARRIER_URL);
                Self::open(state, AD_URL);
            }
        })
    }

    async fn type_text(&self, page: &PageId, text: &str) -> Result<(), BrowserError> {
        self.with_page(page, |state, _| state.typed.push(text.to_string()))
    }

    async fn press_key(&self, page: &PageId, key: &str) -> Result<(), BrowserError> {
        let submit_url = self.submit_url.clone();
        self.with_page(page, |state, index| {
            if key == "Enter" && state.pages[index].url.contains("hmm21") {
                state.pages[index].url = submit_url;
            }
        })
    }

    async fn evaluate(&self, page: &PageId, _expression: &str) -> Result<Value, BrowserError> {
        self.with_page(page, |_, _| Value::Null)
    }

    async fn screenshot(&self, page: &PageId) -> Result<Vec<u8>, BrowserError> {
        self.with_page(page, |state, index| {
            format!("sim:{}", state.pages[index].url).into_bytes()
        })
    }

    async fn wait_for_load(&self, page: &PageId, _timeout: Duration) -> Result<(), BrowserError> {
        self.with_page(page, |_, _| ())
    }

    async fn bring_to_front(&self, page: &PageId) -> Result<(), BrowserError> {
        self.with_page(page, |_, _| ())
    }

    async fn close_page(&self, page: &PageId) -> Result<(), BrowserError> {
        self.with_page(page, |state, index| state.pages[index].closed = true)
    }
}

/// Hands out a fresh simulated browser per job and keeps the last one.
pub struct SimFactory {
    submit_url: String,
    last: Mutex<Option<Arc<SimBrowser>>>,
}

impl SimFactory {
    pub fn new(submit_url: &str) -> Self {
        Self {
            submit_url: submit_url.to_string(),
            last: Mutex::new(None),
        }
    }

    pub fn last(&self) -> Option<Arc<SimBrowser>> {
        self.last.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverFactory for SimFactory {
    async fn connect(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
        let browser = Arc::new(SimBrowser::new(&self.submit_url));
        browser.new_page("about:blank").await?;
        *self.last.lock().unwrap() = Some(Arc::clone(&browser));
        Ok(browser)
    }
}

fn page_url(screenshot: &Screenshot) -> String {
    String::from_utf8_lossy(&screenshot.png)
        .trim_start_matches("sim:")
        .to_string()
}

/// Oracles that know how to drive the simulated world.
#[derive(Default)]
pub struct SiteOracles {
    calls: Mutex<HashMap<&'static str, usize>>,
    /// Reasoning call (1-based) that reports a hijacked page.
    hijack_on_call: Option<usize>,
}

impl SiteOracles {
    pub fn hijacking_on(call: usize) -> Self {
        Self {
            hijack_on_call: Some(call),
            ..Self::default()
        }
    }

    fn count(&self, kind: &'static str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let entry = calls.entry(kind).or_default();
        *entry += 1;
        *entry
    }

    pub fn calls(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl ReasoningOracle for SiteOracles {
    async fn decide(&self, snapshot: &Value) -> Result<ReasoningDecision, OracleError> {
        let call = self.count("reasoning");
        let carrier = snapshot["carrier"].as_str().unwrap_or("hmm").to_string();
        let mut next = snapshot["next_milestone"].as_str().unwrap_or("").to_string();
        if Milestone::parse(&next, &carrier) == Some(Milestone::AccessedServices) {
            next = Milestone::SubmittedTrackingQuery.label(&carrier);
        }
        let ad_recovery = (self.hijack_on_call == Some(call)).then(|| AdRecovery {
            detected: true,
            recovery_url: Some(HUB_URL.to_string()),
            reset_to_milestone: Some("Reached hub site".to_string()),
        });
        Ok(ReasoningDecision {
            goal_achieved: false,
            next_milestone: next.clone(),
            vision_objective: String::new(),
            language_instruction: format!("Work towards: {next}"),
            reasoning: Some("following the milestone template".into()),
            failure_analysis: None,
            ad_recovery,
        })
    }
}

#[async_trait]
impl VisionOracle for SiteOracles {
    async fn analyze(
        &self,
        screenshot: &Screenshot,
        _objective: &str,
    ) -> Result<VisionAnalysis, OracleError> {
        self.count("vision");
        let url = page_url(screenshot);
        let analysis = if url.contains("TrackNTrace") {
            VisionAnalysis {
                found: true,
                elements: vec![VisionElement {
                    label: VOYAGE.to_string(),
                    x: 420.0,
                    y: 380.0,
                    confidence: 0.9,
                }],
                notes: format!(
                    "Tracking result for {BOOKING_ID}: Vessel/Voyage {VOYAGE}, Arrival (ETA) {ARRIVAL}"
                ),
                ..VisionAnalysis::default()
            }
        } else if url.contains("login") {
            VisionAnalysis {
                notes: "Login page".to_string(),
                ..VisionAnalysis::default()
            }
        } else {
            VisionAnalysis {
                notes: format!("Page {url}"),
                ..VisionAnalysis::default()
            }
        };
        Ok(analysis)
    }

    async fn confirm_tab(&self, _: &Screenshot, _: &str, _: &str) -> Result<bool, OracleError> {
        self.count("confirm_tab");
        Ok(true)
    }
}

#[async_trait]
impl LanguageOracle for SiteOracles {
    async fn decide(&self, request: &LanguageRequest) -> Result<LanguageDecision, OracleError> {
        self.count("language");
        let carrier = request.snapshot["carrier"].as_str().unwrap_or("hmm");
        let milestone = Milestone::parse(&request.reasoning.next_milestone, carrier);
        let needs_code = !matches!(
            milestone,
            Some(Milestone::ResultsDisplayed | Milestone::DataExtracted)
        );
        Ok(LanguageDecision {
            needs_code,
            needs_vision: false,
            instruction: request.reasoning.language_instruction.clone(),
            expected_outcome: None,
            data_to_extract: Vec::new(),
        })
    }
}

#[async_trait]
impl ScriptGenerator for SiteOracles {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, OracleError> {
        self.count("generate");
        let script = match Milestone::parse(&request.milestone, "hmm") {
            Some(Milestone::ReachedHub) => json!([{"op": "navigate", "url": HUB_URL}]),
            Some(Milestone::ReachedCarrierSite) => {
                json!([{"op": "click_at", "x": 320, "y": 410, "expect_new_tab": true}])
            }
            Some(Milestone::SubmittedTrackingQuery) => json!([{
                "op": "type", "text": request.booking_id, "x": 400, "y": 300, "submit": true
            }]),
            _ => json!([{"op": "wait", "ms": 1}]),
        };
        Ok(format!("```json\n{}\n```", json!({"steps": script})))
    }
}

#[async_trait]
impl EvaluationOracle for SiteOracles {
    async fn judge(&self, _request: &RubricRequest) -> Result<Verdict, OracleError> {
        self.count("judge");
        Ok(Verdict {
            success: true,
            reasoning: "page matches the milestone".into(),
        })
    }
}

#[async_trait]
impl ExtractionOracle for SiteOracles {
    async fn extract(&self, analyses: &[VisionAnalysis]) -> Result<ExtractedFields, OracleError> {
        self.count("extract");
        if analyses
            .iter()
            .any(|analysis| analysis.mentions(VOYAGE))
        {
            Ok(ExtractedFields {
                voyage_number: VOYAGE.to_string(),
                arrival_date: ARRIVAL.to_string(),
            })
        } else {
            Ok(ExtractedFields::default())
        }
    }
}

pub fn test_config(dir: &Path) -> TrackerConfig {
    let mut config = TrackerConfig::default().without_delays();
    config.cache_dir = dir.join("cache");
    config.log_dir = dir.join("logs");
    config.max_folds = 1;
    config
}

pub fn service(
    config: TrackerConfig,
    oracles: Arc<SiteOracles>,
    factory: Arc<SimFactory>,
) -> TrackingService {
    TrackingService::new(config, Oracles::uniform(oracles), factory, Arc::default())
}

/// Every line of a JSONL log file.
pub fn read_jsonl(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
