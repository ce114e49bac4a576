//! Viewport-by-viewport page capture.

use std::time::Duration;

use crate::browser::{BrowserDriver, BrowserError, PageId};
use crate::dom;

/// One captured fold of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub fold: usize,
    /// Page offset of the fold's top edge in CSS pixels.
    pub scroll_top: f64,
}

/// Number of folds needed to cover `total_height`, at least one and at most `max_folds`.
pub fn fold_count(total_height: f64, viewport_height: f64, max_folds: usize) -> usize {
    if viewport_height <= 0.0 || total_height <= 0.0 {
        return 1;
    }
    let folds = (total_height / viewport_height).ceil() as usize;
    folds.clamp(1, max_folds.max(1))
}

/// Scroll offset of fold `index`; the last fold is pinned to the page bottom.
pub fn fold_offset(index: usize, total_height: f64, viewport_height: f64) -> f64 {
    let bottom = (total_height - viewport_height).max(0.0);
    (index as f64 * viewport_height).min(bottom)
}

/// Capture the page fold by fold, then scroll back to the top. Any non-fatal
/// failure degrades to a single viewport capture.
pub async fn capture_folds<D>(
    driver: &D,
    page: &PageId,
    max_folds: usize,
    settle: Duration,
) -> Result<Vec<Screenshot>, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    match capture_scrolled(driver, page, max_folds, settle).await {
        Ok(shots) => Ok(shots),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            log::debug!("multifold capture failed on {page}, using single screenshot: {err}");
            let _ = dom::scroll_to(driver, page, 0.0).await;
            let png = driver.screenshot(page).await?;
            Ok(vec![Screenshot {
                png,
                fold: 0,
                scroll_top: 0.0,
            }])
        }
    }
}

async fn capture_scrolled<D>(
    driver: &D,
    page: &PageId,
    max_folds: usize,
    settle: Duration,
) -> Result<Vec<Screenshot>, BrowserError>
where
    D: BrowserDriver + ?Sized,
{
    let metrics = dom::page_metrics(driver, page).await?;
    let folds = fold_count(metrics.total_height, metrics.viewport_height, max_folds);
    let mut shots = Vec::with_capacity(folds);

    for fold in 0..folds {
        let scroll_top = fold_offset(fold, metrics.total_height, metrics.viewport_height);
        dom::scroll_to(driver, page, scroll_top).await?;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        let png = driver.screenshot(page).await?;
        shots.push(Screenshot {
            png,
            fold,
            scroll_top,
        });
    }

    dom::scroll_to(driver, page, 0.0).await?;
    Ok(shots)
}
