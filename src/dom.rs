//! Page-context helpers.
//!
//! The JavaScript lives in `scripts/*.js` and is bundled at compile time.
//! Parameterised scripts are function expressions invoked through
//! [`call_script`], which JSON-encodes every argument.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::browser::{BrowserDriver, BrowserError, PageId};
use crate::oracle::VisionAnalysis;
use crate::oracle::vision::FALLBACK_INPUT_LABELS;

pub const PAGE_METRICS_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/page_metrics.js"
));
pub const DISMISS_POPUPS_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/dismiss_popups.js"
));
pub const CORNER_BUTTON_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/corner_button.js"
));
pub const PROBE_INPUT_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/probe_input.js"
));
pub const CLICK_TEXT_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/click_text.js"
));
pub const EXTRACT_FIELD_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/extract_field.js"
));
pub const REVEAL_POINT_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/reveal_point.js"
));

/// Offsets tried around a vision coordinate, nearest first.
pub const PROBE_OFFSETS: [(f64, f64); 15] = [
    (0.0, 0.0),
    (5.0, 0.0),
    (-5.0, 0.0),
    (0.0, 5.0),
    (0.0, -5.0),
    (5.0, 5.0),
    (-5.0, -5.0),
    (10.0, 0.0),
    (-10.0, 0.0),
    (0.0, 10.0),
    (0.0, -10.0),
    (10.0, 5.0),
    (-10.0, 5.0),
    (5.0, 10.0),
    (-5.0, 10.0),
];

const ESCAPE_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PageMetrics {
    pub total_height: f64,
    pub viewport_height: f64,
    #[serde(default)]
    pub viewport_width: f64,
    #[serde(default)]
    pub scroll_top: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct Point {
    x: f64,
    y: f64,
}

#[derive(Debug, Deserialize)]
struct ProbeResult {
    matched: bool,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

#[derive(Debug, Default, Deserialize)]
struct PopupReport {
    #[serde(default)]
    dismissed: bool,
}

/// `(function)(arg, ...)` with each argument JSON-encoded.
pub fn call_script(function: &str, args: &[Value]) -> String {
    let args: Vec<String> = args.iter().map(Value::to_string).collect();
    format!(
        "({})({})",
        function.trim().trim_end_matches(';'),
        args.join(", ")
    )
}

pub async fn page_metrics<D>(driver: &D, page: &PageId) -> Result<PageMetrics, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    let value = driver.evaluate(page, PAGE_METRICS_SCRIPT).await?;
    serde_json::from_value(value)
        .map_err(|err| BrowserError::Message(format!("unexpected page metrics: {err}")))
}

pub async fn scroll_to<D>(driver: &D, page: &PageId, y: f64) -> Result<(), BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    driver
        .evaluate(page, &format!("window.scrollTo(0, {y}); window.scrollY"))
        .await
        .map(|_| ())
}

/// Scroll a page coordinate into view and return its viewport `y`.
pub async fn reveal_point<D>(driver: &D, page: &PageId, y: f64) -> Result<f64, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    let value = driver
        .evaluate(page, &call_script(REVEAL_POINT_SCRIPT, &[json!(y)]))
        .await?;
    Ok(value.as_f64().unwrap_or(y))
}

/// Escape, then the highest popup's close control, then a button in the
/// top-right viewport corner. Returns whether anything was dismissed.
pub async fn dismiss_popups<D>(driver: &D, page: &PageId) -> Result<bool, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    swallow(driver.press_key(page, "Escape").await)?;
    tokio::time::sleep(ESCAPE_SETTLE).await;

    let report = swallow(driver.evaluate(page, DISMISS_POPUPS_SCRIPT).await)?
        .and_then(|value| serde_json::from_value::<PopupReport>(value).ok())
        .unwrap_or_default();
    if report.dismissed {
        log::debug!("dismissed popup on {page}");
        return Ok(true);
    }

    let corner = swallow(driver.evaluate(page, CORNER_BUTTON_SCRIPT).await)?
        .and_then(|value| serde_json::from_value::<Point>(value).ok());
    if let Some(point) = corner {
        swallow(driver.click(page, point.x, point.y).await)?;
        log::debug!("clicked corner close button on {page}");
        return Ok(true);
    }
    Ok(false)
}

/// Click the element best matching `text`. `Ok(false)` when nothing matched.
pub async fn click_text<D>(driver: &D, page: &PageId, text: &str) -> Result<bool, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    let value = driver
        .evaluate(page, &call_script(CLICK_TEXT_SCRIPT, &[json!(text)]))
        .await?;
    match serde_json::from_value::<Point>(value) {
        Ok(point) => {
            driver.click(page, point.x, point.y).await?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

/// The value displayed next to `label`, if any.
pub async fn extract_field<D>(
    driver: &D,
    page: &PageId,
    label: &str,
) -> Result<Option<String>, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    let value = driver
        .evaluate(page, &call_script(EXTRACT_FIELD_SCRIPT, &[json!(label)]))
        .await?;
    Ok(value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string))
}

async fn probe_input<D>(
    driver: &D,
    page: &PageId,
    x: f64,
    y: f64,
) -> Result<Option<(f64, f64)>, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    let offsets: Vec<Value> = PROBE_OFFSETS.iter().map(|(dx, dy)| json!([dx, dy])).collect();
    let value = driver
        .evaluate(
            page,
            &call_script(PROBE_INPUT_SCRIPT, &[json!(x), json!(y), Value::Array(offsets)]),
        )
        .await?;
    let result: ProbeResult = serde_json::from_value(value)
        .map_err(|err| BrowserError::Message(format!("unexpected probe result: {err}")))?;
    Ok(result.matched.then_some((result.x, result.y)))
}

fn names_input(label: &str) -> bool {
    let label = label.to_lowercase();
    FALLBACK_INPUT_LABELS
        .iter()
        .any(|keyword| label.contains(keyword))
}

/// Cross-check every input group against the DOM.
///
/// Groups with a text control at (or near) their coordinate are nudged onto
/// it and marked `dom_validated`. Unconfirmed groups survive as `fallback`
/// only with confidence >= 0.9, relevance >= 0.8 and an input-like label; a
/// probe that errors keeps groups with confidence >= 0.9. If nothing
/// survives, the proposals move to `original_input_groups`.
pub async fn validate_input_groups<D>(
    driver: &D,
    page: &PageId,
    analysis: &mut VisionAnalysis,
) -> Result<(), BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    if analysis.input_groups.is_empty() {
        return Ok(());
    }
    let proposed = std::mem::take(&mut analysis.input_groups);
    let mut kept = Vec::with_capacity(proposed.len());

    for group in &proposed {
        let mut group = group.clone();
        let confidence = group.input.confidence;
        match probe_input(driver, page, group.input.x, group.input.y).await {
            Ok(Some((x, y))) => {
                group.input.x = x;
                group.input.y = y;
                group.dom_validated = true;
                kept.push(group);
            }
            Ok(None) => {
                if confidence >= 0.9
                    && group.relevance_score >= 0.8
                    && names_input(&group.input.label)
                {
                    group.fallback = true;
                    kept.push(group);
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::debug!("input probe failed for '{}': {err}", group.input.label);
                if confidence >= 0.9 {
                    group.fallback = true;
                    kept.push(group);
                }
            }
        }
    }

    if let Err(err) = scroll_to(driver, page, 0.0).await {
        if err.is_fatal() {
            return Err(err);
        }
    }

    if kept.is_empty() {
        analysis.original_input_groups = proposed;
        analysis.found = false;
    }
    analysis.input_groups = kept;
    Ok(())
}

/// Non-fatal failures become `None`; fatal ones propagate.
fn swallow<T>(result: Result<T, BrowserError>) -> Result<Option<T>, BrowserError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            log::debug!("popup handling step failed: {err}");
            Ok(None)
        }
    }
}
