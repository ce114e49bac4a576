//! Runs compiled action scripts against the active page.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::browser::{BrowserDriver, BrowserError, PageId};
use crate::config::TrackerConfig;
use crate::dom;
use crate::instruction::{ActionScript, Instruction, MAX_WAIT_MS};
use crate::oracle::VisionOracle;
use crate::recorder::ErrorKind;
use crate::tabs::TabManager;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorSettings {
    pub click_settle: Duration,
    pub action_settle: Duration,
    pub page_load_timeout: Duration,
}

impl ExecutorSettings {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            click_settle: config.click_settle,
            action_settle: config.action_settle,
            page_load_timeout: config.page_load_timeout,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}

/// Structured outcome of one script run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// The browser connection is gone; nothing further can run.
    pub browser_lost: bool,
    pub steps_run: usize,
    pub url_before: String,
    pub url_after: String,
    pub tabs_before: usize,
    pub tabs_after: usize,
    pub switched_to_new_page: bool,
    pub new_page: Option<PageId>,
    pub closed_tabs: Vec<PageId>,
    pub popup_dismissed: bool,
    /// Values read by `extract` steps.
    pub results: BTreeMap<String, String>,
    /// Non-fatal problems inside otherwise completed steps.
    pub warnings: Vec<String>,
}

impl ExecutionReport {
    pub fn url_changed(&self) -> bool {
        self.url_before != self.url_after
    }
}

pub struct ScriptExecutor<'a, D: BrowserDriver + ?Sized> {
    driver: &'a D,
    vision: &'a dyn VisionOracle,
    settings: ExecutorSettings,
}

impl<'a, D: BrowserDriver + ?Sized> ScriptExecutor<'a, D> {
    pub fn new(driver: &'a D, vision: &'a dyn VisionOracle, settings: ExecutorSettings) -> Self {
        Self {
            driver,
            vision,
            settings,
        }
    }

    /// Run every step in order, stopping at the first failure. Never errors:
    /// failures come back in the report.
    pub async fn execute(&self, tabs: &mut TabManager, script: &ActionScript) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        report.url_before = self.driver.url(tabs.active()).await.unwrap_or_default();
        report.tabs_before = self.driver.pages().await.map(|p| p.len()).unwrap_or(0);

        let outcome = self.run_steps(tabs, script, &mut report).await;
        match outcome {
            Ok(()) => report.success = true,
            Err(err) => {
                log::warn!("action failed after {} step(s): {err}", report.steps_run);
                report.browser_lost = err.is_fatal();
                report.error_kind = Some(if report.browser_lost {
                    ErrorKind::FatalBrowser
                } else {
                    ErrorKind::Execution
                });
                report.error = Some(err.to_string());
            }
        }

        if !report.browser_lost {
            report.url_after = self.driver.url(tabs.active()).await.unwrap_or_default();
            report.tabs_after = self.driver.pages().await.map(|p| p.len()).unwrap_or(0);
        }
        report
    }

    async fn run_steps(
        &self,
        tabs: &mut TabManager,
        script: &ActionScript,
        report: &mut ExecutionReport,
    ) -> Result<(), BrowserError> {
        for step in &script.steps {
            let before = self.driver.pages().await?;
            let prior_url = self.driver.url(tabs.active()).await?;

            self.run_step(tabs.active(), step, report).await?;
            report.steps_run += 1;

            if !step.may_open_tab() {
                continue;
            }
            let settle = if step.is_coordinate_click() {
                self.settings.click_settle
            } else {
                self.settings.action_settle
            };
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }

            let after = self.driver.pages().await?;
            if step.expects_new_tab() || after.len() > before.len() {
                let resolution = tabs
                    .resolve_new_tabs(
                        self.driver,
                        self.vision,
                        &before,
                        &prior_url,
                        step.expects_new_tab(),
                    )
                    .await?;
                report.closed_tabs.extend(resolution.closed);
                report.popup_dismissed |= resolution.popup_dismissed;
                if let Some(page) = resolution.switched_to {
                    report.switched_to_new_page = true;
                    report.new_page = Some(page);
                }
            }
            self.settle_load(tabs.active()).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        page: &PageId,
        step: &Instruction,
        report: &mut ExecutionReport,
    ) -> Result<(), BrowserError> {
        log::debug!("executing {} on {page}", step.name());
        match step {
            Instruction::Navigate { url } => {
                self.driver.navigate(page, url).await?;
                self.settle_load(page).await?;
            }
            Instruction::ClickAt { x, y, .. } => {
                let viewport_y = dom::reveal_point(self.driver, page, *y).await?;
                self.driver.click(page, *x, viewport_y).await?;
            }
            Instruction::ClickText { text, .. } => {
                if !dom::click_text(self.driver, page, text).await? {
                    return Err(BrowserError::Message(format!(
                        "no clickable element with text '{text}'"
                    )));
                }
            }
            Instruction::Type { text, x, y, submit } => {
                if let (Some(x), Some(y)) = (x, y) {
                    let viewport_y = dom::reveal_point(self.driver, page, *y).await?;
                    self.driver.click(page, *x, viewport_y).await?;
                }
                self.driver.type_text(page, text).await?;
                if *submit {
                    self.driver.press_key(page, "Enter").await?;
                }
            }
            Instruction::PressKey { key } => {
                self.driver.press_key(page, key).await?;
            }
            Instruction::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis((*ms).min(MAX_WAIT_MS))).await;
            }
            Instruction::Extract { field, label } => {
                match dom::extract_field(self.driver, page, label).await {
                    Ok(Some(value)) => {
                        report.results.insert(field.clone(), value);
                    }
                    Ok(None) => report
                        .warnings
                        .push(format!("no value found next to '{label}' for {field}")),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => report
                        .warnings
                        .push(format!("extracting {field} failed: {err}")),
                }
            }
            Instruction::DismissPopups => {
                report.popup_dismissed |= dom::dismiss_popups(self.driver, page).await?;
            }
        }
        Ok(())
    }

    async fn settle_load(&self, page: &PageId) -> Result<(), BrowserError> {
        match self
            .driver
            .wait_for_load(page, self.settings.page_load_timeout)
            .await
        {
            Ok(()) | Err(BrowserError::Timeout(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
