//! The milestone loop.
//!
//! Each iteration targets the next pending milestone: replay a cached script
//! if one is fresh, otherwise plan with the reasoning oracle, look at the page
//! fold by fold, let the language oracle decide on an action, generate and
//! run it, then have the evaluator decide whether the milestone was really
//! reached. A run stops once both target fields are extracted, when the step
//! budget is spent, or when the browser goes away.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};

use crate::browser::{BrowserDriver, BrowserError, PageId};
use crate::cache::MilestoneCache;
use crate::capture::{Screenshot, capture_folds};
use crate::config::TrackerConfig;
use crate::context::{ARRIVAL_DATE, AutomationContext, VOYAGE_NUMBER};
use crate::dom;
use crate::evaluator::{StepEvaluator, StepOutcome, is_fatal_url};
use crate::executor::{ExecutionReport, ExecutorSettings, ScriptExecutor};
use crate::instruction::{ActionScript, CompilePolicy, compile, validate};
use crate::logging::TrackerLogger;
use crate::metrics::elapsed_ms;
use crate::milestone::Milestone;
use crate::oracle::vision::{
    adjust_for_scroll, carrier_link_text, filter_input_labels, is_hub_url, is_input_objective,
};
use crate::oracle::{
    AdRecovery, GenerationRequest, LanguageDecision, LanguageRequest, OracleError, Oracles,
    VisionAnalysis,
};
use crate::recorder::{ErrorKind, RunRecorder};
use crate::tabs::TabManager;

/// Generations tried before a milestone attempt is given up.
pub const COMPILE_ATTEMPTS: usize = 3;

const LOG_CATEGORY: &str = "orchestrator";

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_steps: usize,
    pub max_folds: usize,
    pub fold_settle: Duration,
    pub executor: ExecutorSettings,
    pub hub_url: String,
    pub hub_host: Option<String>,
    pub allowed_hosts: Vec<String>,
    /// Ignore cached scripts and final results.
    pub force_fresh: bool,
}

impl RunSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_folds: config.max_folds,
            fold_settle: config.fold_settle,
            executor: ExecutorSettings::from_config(config),
            hub_url: config.hub_url.clone(),
            hub_host: config.hub_host(),
            allowed_hosts: config.allowed_hosts.clone(),
            force_fresh: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub extracted: BTreeMap<String, String>,
    pub goal_complete: bool,
    pub used_cache: bool,
    pub steps: usize,
    pub remaining: Vec<Milestone>,
    pub last_milestone: Option<Milestone>,
    /// Why the run stopped early, if it did.
    pub aborted: Option<String>,
}

impl RunOutcome {
    pub fn voyage_number(&self) -> Option<&str> {
        self.extracted.get(VOYAGE_NUMBER).map(String::as_str)
    }

    pub fn arrival_date(&self) -> Option<&str> {
        self.extracted.get(ARRIVAL_DATE).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
struct StepResult {
    achieved: Option<Milestone>,
    success: bool,
}

impl StepResult {
    fn failed() -> Self {
        Self {
            achieved: None,
            success: false,
        }
    }

    fn achieved(milestone: Milestone) -> Self {
        Self {
            achieved: Some(milestone),
            success: true,
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    used_cache: bool,
    final_from_cache: bool,
    scripts: Vec<ActionScript>,
}

fn oracle_error_kind(err: &OracleError) -> ErrorKind {
    match err {
        OracleError::Parse(_) => ErrorKind::OracleParse,
        _ => ErrorKind::Oracle,
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// One analysis combining every fold, for evidence checks.
fn merge_analyses(analyses: &[VisionAnalysis]) -> Option<VisionAnalysis> {
    let first = analyses.first()?;
    let mut merged = VisionAnalysis {
        fold: first.fold,
        scroll_top: first.scroll_top,
        ..VisionAnalysis::default()
    };
    let mut notes = Vec::new();
    for analysis in analyses {
        merged.found |= analysis.found;
        merged.elements.extend(analysis.elements.iter().cloned());
        merged.input_groups.extend(analysis.input_groups.iter().cloned());
        if !analysis.notes.trim().is_empty() {
            notes.push(analysis.notes.trim().to_string());
        }
    }
    merged.notes = notes.join(" | ");
    Some(merged)
}

pub struct Orchestrator<'a> {
    driver: &'a dyn BrowserDriver,
    oracles: &'a Oracles,
    cache: &'a MilestoneCache,
    logger: &'a TrackerLogger,
    settings: RunSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        driver: &'a dyn BrowserDriver,
        oracles: &'a Oracles,
        cache: &'a MilestoneCache,
        logger: &'a TrackerLogger,
        settings: RunSettings,
    ) -> Self {
        Self {
            driver,
            oracles,
            cache,
            logger,
            settings,
        }
    }

    /// Drive one tracking job to completion, budget exhaustion or abort.
    /// Only a failure to obtain a start page is an error; a browser lost
    /// mid-run ends the run with whatever was extracted.
    pub async fn run(
        &self,
        booking_id: &str,
        carrier: &str,
        recorder: &mut RunRecorder,
    ) -> Result<RunOutcome, BrowserError> {
        let start = self.start_page().await?;
        let mut context = AutomationContext::new(booking_id, carrier);
        let mut tabs = TabManager::new(start, context.carrier());
        let mut state = RunState::default();
        let mut aborted = None;
        let mut steps = 0;
        context.current_url = self.driver.url(tabs.active()).await.unwrap_or_default();

        self.logger.info(
            format!("starting run for booking {booking_id} on {carrier}"),
            Some(LOG_CATEGORY),
            Some(json!({"run_id": recorder.run_id(), "force_fresh": self.settings.force_fresh})),
        );

        while steps < self.settings.max_steps && !context.goal_complete() {
            steps += 1;
            recorder.start_step(steps);
            context.clear_stale();

            let result = match self
                .step(steps, &mut context, &mut tabs, recorder, &mut state)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    recorder.log_error(
                        "browser",
                        ErrorKind::FatalBrowser,
                        json!({"error": err.to_string()}),
                    );
                    self.logger.error(
                        format!("browser lost at step {steps}: {err}"),
                        Some(LOG_CATEGORY),
                        None,
                    );
                    aborted = Some(err.to_string());
                    StepResult::failed()
                }
            };

            if aborted.is_none() {
                if let Ok(url) = self.driver.url(tabs.active()).await {
                    context.current_url = url;
                }
            }
            let label = result
                .achieved
                .map(|milestone| milestone.label(context.carrier()));
            let record = recorder
                .end_step(label, &context.current_url, result.success)
                .await;
            context.push_history(record);

            if aborted.is_some() {
                break;
            }
        }

        if context.goal_complete() && !state.final_from_cache {
            self.save_final_results(&context, &state).await;
        }

        let outcome = RunOutcome {
            run_id: recorder.run_id().to_string(),
            extracted: context.extracted().clone(),
            goal_complete: context.goal_complete(),
            used_cache: state.used_cache,
            steps,
            remaining: context.remaining().to_vec(),
            last_milestone: context.last_achieved(),
            aborted,
        };
        self.logger.info(
            format!(
                "run finished after {} step(s): goal_complete={} used_cache={}",
                outcome.steps, outcome.goal_complete, outcome.used_cache
            ),
            Some(LOG_CATEGORY),
            Some(json!({"extracted": outcome.extracted, "remaining": outcome.remaining})),
        );
        Ok(outcome)
    }

    async fn start_page(&self) -> Result<PageId, BrowserError> {
        match self.driver.pages().await?.into_iter().next() {
            Some(page) => Ok(page),
            None => self.driver.new_page("about:blank").await,
        }
    }

    async fn step(
        &self,
        step: usize,
        context: &mut AutomationContext,
        tabs: &mut TabManager,
        recorder: &mut RunRecorder,
        state: &mut RunState,
    ) -> Result<StepResult, BrowserError> {
        context.previous_url = context.current_url.clone();
        match self.driver.url(tabs.active()).await {
            Ok(url) => context.current_url = url,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => log::debug!("could not read current URL: {err}"),
        }

        if let Some(result) = self.adopt_final_results(context, recorder, state).await {
            return Ok(result);
        }
        if let Some(result) = self.replay_cached(context, tabs, recorder, state).await? {
            return Ok(result);
        }

        let alert = context.detect_repeated_failures();
        if let Some(alert) = &alert {
            recorder.log_operation("failure_alert", to_json(alert), true, None);
            self.logger.info(
                format!("{} recent failures; asking for a new approach", alert.count),
                Some(LOG_CATEGORY),
                None,
            );
        }
        let started = Instant::now();
        let decision = match self
            .oracles
            .reasoning
            .decide(&context.snapshot(alert.as_ref()))
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                recorder.log_error(
                    "reasoning",
                    oracle_error_kind(&err),
                    json!({"error": err.to_string()}),
                );
                return Ok(StepResult::failed());
            }
        };
        recorder.log_operation(
            "reasoning",
            to_json(&decision),
            true,
            Some(elapsed_ms(started)),
        );
        context.last_instruction = Some(decision.language_instruction.clone());

        if let Some(recovery) = decision.hijack() {
            return self.recover(context, tabs, recorder, recovery).await;
        }

        let proposed = Milestone::parse(&decision.next_milestone, context.carrier())
            .filter(|milestone| context.can_attempt(*milestone));
        let Some(target) = proposed.or_else(|| context.next_milestone()) else {
            return self.extract_only(step, context, tabs, recorder).await;
        };

        let shots = match self.capture(step, "pre", tabs.active(), recorder).await {
            Ok(shots) => shots,
            Err(err) => return self.browser_failure(recorder, "capture", err),
        };
        context.screenshots_taken = shots.len();

        let mut language_request = LanguageRequest {
            snapshot: context.snapshot(None),
            reasoning: decision.clone(),
            vision: Vec::new(),
            current_url: context.current_url.clone(),
            carrier_link_text: None,
        };
        let Some(first) = self.decide_language(&language_request, recorder).await else {
            return Ok(StepResult::failed());
        };

        let objective = if decision.vision_objective.trim().is_empty() {
            first.instruction.clone()
        } else {
            decision.vision_objective.clone()
        };
        let analyses = if first.needs_vision || !decision.vision_objective.trim().is_empty() {
            self.analyze(tabs.active(), &shots, &objective, true, recorder)
                .await?
        } else {
            Vec::new()
        };
        context.latest_vision = analyses.clone();

        let language = if analyses.is_empty() {
            first
        } else {
            language_request.vision = analyses.clone();
            if is_hub_url(&context.current_url, self.settings.hub_host.as_deref()) {
                language_request.carrier_link_text =
                    carrier_link_text(&analyses, context.carrier());
            }
            match self.decide_language(&language_request, recorder).await {
                Some(language) => language,
                None => return Ok(StepResult::failed()),
            }
        };

        let instruction = if language.instruction.trim().is_empty() {
            decision.language_instruction.clone()
        } else {
            language.instruction.clone()
        };
        context.last_instruction = Some(instruction.clone());

        let mut executed: Option<(ActionScript, ExecutionReport)> = None;
        if language.needs_code {
            let Some(script) = self
                .generate_script(target, &instruction, context, &analyses, recorder)
                .await
            else {
                return Ok(StepResult::failed());
            };
            let report = self.execute(tabs, &script, recorder).await?;
            context.merge_extracted(report.results.iter().map(|(k, v)| (k.clone(), v.as_str())));
            context.last_action = Some(script.to_json());
            context.last_result = Some(to_json(&report));
            executed = Some((script, report));
        }

        let url_after = match self.driver.url(tabs.active()).await {
            Ok(url) => url,
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => context.current_url.clone(),
        };

        let gated = matches!(
            target,
            Milestone::ResultsDisplayed | Milestone::DataExtracted
        );
        let mut post = Vec::new();
        if executed.is_some() || gated {
            match self.capture(step, "post", tabs.active(), recorder).await {
                Ok(shots) => {
                    let objective = format!(
                        "Describe the page after the '{}' step. Report any shipment tracking results (vessel, voyage, arrival, ETA, discharge) exactly as shown, or say what the page is instead.",
                        target.id()
                    );
                    post = self
                        .analyze(tabs.active(), &shots, &objective, false, recorder)
                        .await?;
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log::debug!("post-action capture failed: {err}"),
            }
            context.post_action_vision = post.clone();
        }

        let evidence = merge_analyses(&post).or_else(|| merge_analyses(&analyses));
        let evaluator = StepEvaluator::new(
            self.oracles.evaluator.as_ref(),
            context.booking_id(),
            context.carrier(),
            self.settings.hub_host.clone(),
        );
        let url_before = context.current_url.clone();
        let evaluation = evaluator
            .evaluate(&StepOutcome {
                milestone: target,
                instruction: &instruction,
                action_required: language.needs_code,
                execution: executed.as_ref().map(|(_, report)| report),
                url_before: &url_before,
                url_after: &url_after,
                analysis: evidence.as_ref(),
            })
            .await;
        context.current_url = url_after.clone();

        let evaluation_data = json!({
            "milestone": target.id(),
            "succeeded": evaluation.succeeded,
            "reasoning": evaluation.reasoning,
            "url": url_after,
        });
        if evaluation.succeeded {
            recorder.log_operation("evaluate", evaluation_data, true, None);
        } else {
            let kind = if is_fatal_url(&url_after) {
                ErrorKind::FatalBrowser
            } else {
                ErrorKind::Evaluation
            };
            recorder.log_error("evaluate", kind, evaluation_data);
        }

        let mut achieved = None;
        if evaluation.succeeded {
            let script = executed.map(|(script, _)| script).unwrap_or_default();
            if self.record_milestone(context, target, script, recorder, state).await {
                achieved = Some(target);
            }
        }

        let shows_results = post.iter().any(|analysis| {
            let corpus = analysis.corpus();
            crate::evaluator::RESULT_KEYWORDS
                .iter()
                .any(|keyword| corpus.contains(keyword))
        });
        if !context.goal_complete() && !post.is_empty() && (gated || shows_results) {
            self.extract_fields(context, &post, recorder).await;
        }
        // Extracted data implies the results were on screen.
        if context.goal_complete() {
            for milestone in [Milestone::ResultsDisplayed, Milestone::DataExtracted] {
                if self
                    .record_milestone(context, milestone, ActionScript::default(), recorder, state)
                    .await
                {
                    achieved = Some(milestone);
                }
            }
        }

        Ok(StepResult {
            achieved,
            success: evaluation.succeeded,
        })
    }

    /// Mark `milestone` achieved and cache the script that got there. Returns
    /// false when the milestone graph does not allow it from here.
    async fn record_milestone(
        &self,
        context: &mut AutomationContext,
        milestone: Milestone,
        script: ActionScript,
        recorder: &RunRecorder,
        state: &mut RunState,
    ) -> bool {
        if !context.update_milestone(milestone) {
            return false;
        }
        self.logger.info(
            format!("milestone reached: {}", milestone.label(context.carrier())),
            Some(LOG_CATEGORY),
            None,
        );
        if milestone != Milestone::DataExtracted {
            if let Err(err) = self
                .cache
                .save_milestone(
                    context.carrier(),
                    context.booking_id(),
                    milestone,
                    &script,
                    recorder.current_operations(),
                )
                .await
            {
                log::warn!("failed to cache milestone {milestone}: {err}");
            }
        }
        if !script.steps.is_empty() {
            state.scripts.push(script);
        }
        true
    }

    async fn adopt_final_results(
        &self,
        context: &mut AutomationContext,
        recorder: &mut RunRecorder,
        state: &mut RunState,
    ) -> Option<StepResult> {
        if self.settings.force_fresh || context.next_milestone() != Some(Milestone::DataExtracted)
        {
            return None;
        }
        let finals = self
            .cache
            .get_final_results(context.carrier(), context.booking_id())
            .await?;
        if finals.voyage_number.trim().is_empty() || finals.arrival_date.trim().is_empty() {
            return None;
        }
        context.merge_extracted([
            (VOYAGE_NUMBER, finals.voyage_number.as_str()),
            (ARRIVAL_DATE, finals.arrival_date.as_str()),
        ]);
        context.update_milestone(Milestone::DataExtracted);
        state.used_cache = true;
        state.final_from_cache = true;
        recorder.log_operation("final_results_cache", to_json(&finals), true, None);
        self.logger.info(
            "adopted cached final results",
            Some(LOG_CATEGORY),
            None,
        );
        Some(StepResult::achieved(Milestone::DataExtracted))
    }

    async fn replay_cached(
        &self,
        context: &mut AutomationContext,
        tabs: &mut TabManager,
        recorder: &mut RunRecorder,
        state: &mut RunState,
    ) -> Result<Option<StepResult>, BrowserError> {
        if self.settings.force_fresh {
            return Ok(None);
        }
        // An optional head without a cached script defers to its successor.
        let mut found = None;
        for milestone in context.remaining().iter().copied() {
            if let Some(cached) = self
                .cache
                .get(context.carrier(), context.booking_id(), milestone)
                .await
            {
                found = Some((milestone, cached));
                break;
            }
            if !milestone.is_optional() {
                break;
            }
        }
        let Some((head, cached)) = found else {
            return Ok(None);
        };

        // Records on disk get the same sandbox as generated scripts.
        if !cached.script.steps.is_empty() {
            let policy = CompilePolicy::new(self.settings.allowed_hosts.clone());
            if let Err(err) = validate(&cached.script, &policy) {
                recorder.log_error(
                    "cache_replay",
                    ErrorKind::Compilation,
                    json!({"milestone": head.id(), "error": err.to_string()}),
                );
                self.logger.error(
                    format!("cached script for {head} rejected: {err}"),
                    Some(LOG_CATEGORY),
                    None,
                );
                return Ok(None);
            }
        }

        let started = Instant::now();
        let executor = ScriptExecutor::new(
            self.driver,
            self.oracles.vision.as_ref(),
            self.settings.executor,
        );
        let report = executor.execute(tabs, &cached.script).await;
        if report.browser_lost {
            return Err(BrowserError::Disconnected(
                report.error.clone().unwrap_or_default(),
            ));
        }
        let evaluator = StepEvaluator::new(
            self.oracles.evaluator.as_ref(),
            context.booking_id(),
            context.carrier(),
            self.settings.hub_host.clone(),
        );
        let evaluation = evaluator.evaluate_replay(head, &report);
        let data = json!({
            "milestone": head.id(),
            "url": report.url_after,
            "validated": evaluation.succeeded,
            "reasoning": evaluation.reasoning,
        });
        if !report.url_after.is_empty() {
            context.current_url = report.url_after.clone();
        }

        if !evaluation.succeeded {
            recorder.log_operation("cache_replay", data, false, Some(elapsed_ms(started)));
            self.logger.debug(
                format!("cached script for {head} did not validate; consulting oracles"),
                Some(LOG_CATEGORY),
                None,
            );
            return Ok(None);
        }

        recorder.log_operation("cache_replay", data, true, Some(elapsed_ms(started)));
        context.merge_extracted(report.results.iter().map(|(k, v)| (k.clone(), v.as_str())));
        context.last_action = Some(cached.script.to_json());
        context.last_result = Some(to_json(&report));
        context.update_milestone(head);
        state.used_cache = true;
        if !cached.script.steps.is_empty() {
            state.scripts.push(cached.script);
        }
        self.logger.info(
            format!("replayed cached script for {head}"),
            Some(LOG_CATEGORY),
            None,
        );
        Ok(Some(StepResult::achieved(head)))
    }

    async fn recover(
        &self,
        context: &mut AutomationContext,
        tabs: &mut TabManager,
        recorder: &mut RunRecorder,
        recovery: &AdRecovery,
    ) -> Result<StepResult, BrowserError> {
        let target = recovery
            .reset_to_milestone
            .as_deref()
            .and_then(|text| Milestone::parse(text, context.carrier()))
            .unwrap_or(Milestone::ReachedHub);
        let policy = CompilePolicy::new(self.settings.allowed_hosts.clone());
        let url = recovery
            .recovery_url
            .as_deref()
            .filter(|url| policy.allows_url(url))
            .unwrap_or(self.settings.hub_url.as_str())
            .to_string();

        self.logger.info(
            format!("navigation hijack detected; returning to {url}"),
            Some(LOG_CATEGORY),
            None,
        );
        if let Err(err) = self.driver.navigate(tabs.active(), &url).await {
            if err.is_fatal() {
                return Err(err);
            }
            recorder.log_error(
                "ad_recovery",
                ErrorKind::NavigationHijack,
                json!({"url": url, "error": err.to_string()}),
            );
            return Ok(StepResult::failed());
        }
        if let Err(err) = self
            .driver
            .wait_for_load(tabs.active(), self.settings.executor.page_load_timeout)
            .await
        {
            if err.is_fatal() {
                return Err(err);
            }
        }

        context.reset_to(target);
        context.current_url = url.clone();
        recorder.log_operation(
            format!("Ad recovery to {}", target.label(context.carrier())),
            json!({"recovery_url": url, "reset_to_milestone": target.id()}),
            true,
            None,
        );
        Ok(StepResult {
            achieved: None,
            success: true,
        })
    }

    /// Every milestone is done but a field is missing: look again.
    async fn extract_only(
        &self,
        step: usize,
        context: &mut AutomationContext,
        tabs: &mut TabManager,
        recorder: &mut RunRecorder,
    ) -> Result<StepResult, BrowserError> {
        let shots = match self.capture(step, "extract", tabs.active(), recorder).await {
            Ok(shots) => shots,
            Err(err) => return self.browser_failure(recorder, "capture", err),
        };
        let analyses = self
            .analyze(
                tabs.active(),
                &shots,
                "Read the vessel/voyage and the arrival date shown on this tracking result.",
                false,
                recorder,
            )
            .await?;
        context.post_action_vision = analyses.clone();
        self.extract_fields(context, &analyses, recorder).await;
        Ok(StepResult {
            achieved: None,
            success: context.goal_complete(),
        })
    }

    async fn capture(
        &self,
        step: usize,
        label: &str,
        page: &PageId,
        recorder: &mut RunRecorder,
    ) -> Result<Vec<Screenshot>, BrowserError> {
        let shots = capture_folds(
            self.driver,
            page,
            self.settings.max_folds,
            self.settings.fold_settle,
        )
        .await?;
        for shot in &shots {
            recorder
                .save_screenshot(step, &format!("{label}_fold{}", shot.fold), &shot.png)
                .await;
        }
        Ok(shots)
    }

    /// Vision over each fold. Input objectives get the label filter, scroll
    /// adjustment and DOM cross-check; with `stop_on_found` the first fold
    /// that finds something ends the scan. Unparseable folds are skipped.
    async fn analyze(
        &self,
        page: &PageId,
        shots: &[Screenshot],
        objective: &str,
        stop_on_found: bool,
        recorder: &mut RunRecorder,
    ) -> Result<Vec<VisionAnalysis>, BrowserError> {
        let input_objective = is_input_objective(objective);
        let mut analyses = Vec::new();
        for shot in shots {
            let started = Instant::now();
            let mut analysis = match self.oracles.vision.analyze(shot, objective).await {
                Ok(analysis) => analysis,
                Err(err) => {
                    recorder.log_error(
                        "vision",
                        oracle_error_kind(&err),
                        json!({"fold": shot.fold, "error": err.to_string()}),
                    );
                    continue;
                }
            };
            analysis.fold = shot.fold;
            if input_objective {
                filter_input_labels(&mut analysis);
            }
            adjust_for_scroll(&mut analysis, shot.scroll_top);
            if input_objective {
                if let Err(err) = dom::validate_input_groups(self.driver, page, &mut analysis).await
                {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    log::debug!("DOM cross-check skipped: {err}");
                }
            }
            recorder.log_operation(
                "vision",
                json!({"fold": shot.fold, "objective": objective, "found": analysis.found,
                       "notes": analysis.notes}),
                true,
                Some(elapsed_ms(started)),
            );
            let found = analysis.found;
            analyses.push(analysis);
            if stop_on_found && found {
                break;
            }
        }
        Ok(analyses)
    }

    async fn decide_language(
        &self,
        request: &LanguageRequest,
        recorder: &mut RunRecorder,
    ) -> Option<LanguageDecision> {
        let started = Instant::now();
        match self.oracles.language.decide(request).await {
            Ok(decision) => {
                recorder.log_operation(
                    "language",
                    to_json(&decision),
                    true,
                    Some(elapsed_ms(started)),
                );
                Some(decision)
            }
            Err(err) => {
                recorder.log_error(
                    "language",
                    oracle_error_kind(&err),
                    json!({"error": err.to_string()}),
                );
                None
            }
        }
    }

    async fn generate_script(
        &self,
        target: Milestone,
        instruction: &str,
        context: &AutomationContext,
        analyses: &[VisionAnalysis],
        recorder: &mut RunRecorder,
    ) -> Option<ActionScript> {
        let policy = CompilePolicy::new(self.settings.allowed_hosts.clone());
        let mut previous_error = None;
        for attempt in 1..=COMPILE_ATTEMPTS {
            let request = GenerationRequest {
                instruction: instruction.to_string(),
                milestone: target.label(context.carrier()),
                booking_id: context.booking_id().to_string(),
                current_url: context.current_url.clone(),
                vision: analyses.to_vec(),
                allowed_hosts: self.settings.allowed_hosts.clone(),
                previous_error: previous_error.clone(),
                attempt,
            };
            let started = Instant::now();
            let source = match self.oracles.generator.generate(&request).await {
                Ok(source) => source,
                Err(err) => {
                    recorder.log_error(
                        "generate",
                        oracle_error_kind(&err),
                        json!({"attempt": attempt, "error": err.to_string()}),
                    );
                    previous_error = Some(err.to_string());
                    continue;
                }
            };
            match compile(&source, &policy) {
                Ok(script) => {
                    recorder.log_operation(
                        "generate",
                        json!({"attempt": attempt, "script": script}),
                        true,
                        Some(elapsed_ms(started)),
                    );
                    return Some(script);
                }
                Err(err) => {
                    recorder.log_error(
                        "compile",
                        ErrorKind::Compilation,
                        json!({"attempt": attempt, "error": err.to_string(), "source": source}),
                    );
                    previous_error = Some(err.to_string());
                }
            }
        }
        self.logger.info(
            format!("no runnable action for {target} after {COMPILE_ATTEMPTS} attempts"),
            Some(LOG_CATEGORY),
            None,
        );
        None
    }

    async fn execute(
        &self,
        tabs: &mut TabManager,
        script: &ActionScript,
        recorder: &mut RunRecorder,
    ) -> Result<ExecutionReport, BrowserError> {
        let started = Instant::now();
        let executor = ScriptExecutor::new(
            self.driver,
            self.oracles.vision.as_ref(),
            self.settings.executor,
        );
        let report = executor.execute(tabs, script).await;
        if report.browser_lost {
            return Err(BrowserError::Disconnected(
                report.error.clone().unwrap_or_default(),
            ));
        }
        let data = to_json(&report);
        if report.success {
            recorder.log_operation("execute", data, true, Some(elapsed_ms(started)));
        } else {
            recorder.log_error("execute", ErrorKind::Execution, data);
        }
        Ok(report)
    }

    async fn extract_fields(
        &self,
        context: &mut AutomationContext,
        analyses: &[VisionAnalysis],
        recorder: &mut RunRecorder,
    ) {
        let started = Instant::now();
        match self.oracles.extractor.extract(analyses).await {
            Ok(fields) => {
                context.merge_extracted([
                    (VOYAGE_NUMBER, fields.voyage_number.as_str()),
                    (ARRIVAL_DATE, fields.arrival_date.as_str()),
                ]);
                recorder.log_operation(
                    "extract_data",
                    to_json(&fields),
                    true,
                    Some(elapsed_ms(started)),
                );
            }
            Err(err) => {
                log::warn!("data extraction failed: {err}");
                recorder.log_error(
                    "extract_data",
                    oracle_error_kind(&err),
                    json!({"error": err.to_string()}),
                );
            }
        }
    }

    async fn save_final_results(&self, context: &AutomationContext, state: &RunState) {
        let (Some(voyage), Some(arrival)) = (
            context.extracted_value(VOYAGE_NUMBER),
            context.extracted_value(ARRIVAL_DATE),
        ) else {
            return;
        };
        if let Err(err) = self
            .cache
            .save_final_results(
                context.carrier(),
                context.booking_id(),
                voyage,
                arrival,
                &state.scripts,
            )
            .await
        {
            log::warn!("failed to cache final results: {err}");
        }
    }

    fn browser_failure(
        &self,
        recorder: &mut RunRecorder,
        operation: &str,
        err: BrowserError,
    ) -> Result<StepResult, BrowserError> {
        if err.is_fatal() {
            return Err(err);
        }
        recorder.log_error(
            operation,
            ErrorKind::Execution,
            json!({"error": err.to_string()}),
        );
        Ok(StepResult::failed())
    }
}
