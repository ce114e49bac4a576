//! Active-page ownership and new-tab validation.

use std::collections::HashSet;

use url::Url;

use crate::browser::{BrowserDriver, BrowserError, PageId};
use crate::capture::Screenshot;
use crate::dom;
use crate::oracle::VisionOracle;

/// URL fragments that mark a tab as an advertisement or tracker.
pub const AD_DENYLIST: &[&str] = &[
    "ads",
    "advert",
    "marketing",
    "promo",
    "offer",
    "survey",
    "feedback",
    "redirect",
    "click",
    "track",
    "doubleclick",
    "googleads",
    "googlesyndication",
    "mapsplatform",
];

/// Last two host labels with any `www.` dropped.
fn base_domain(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let labels: Vec<&str> = host.trim_start_matches("www.").split('.').collect();
    let start = labels.len().saturating_sub(2);
    Some(labels[start..].join("."))
}

/// Verdict from the URL alone; `None` means a visual check is needed.
pub fn url_verdict(prior_url: &str, candidate_url: &str, carrier: &str) -> Option<bool> {
    if let (Some(prior), Some(candidate)) = (base_domain(prior_url), base_domain(candidate_url)) {
        if prior == candidate {
            return Some(true);
        }
    }
    let candidate = candidate_url.to_lowercase();
    let carrier = carrier.trim().to_lowercase();
    if !carrier.is_empty() && candidate.contains(&carrier) {
        return Some(true);
    }
    if AD_DENYLIST.iter().any(|token| candidate.contains(token)) {
        return Some(false);
    }
    None
}

/// How the tabs that appeared during one action were handled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabResolution {
    pub new_tabs: Vec<PageId>,
    pub switched_to: Option<PageId>,
    pub closed: Vec<PageId>,
    pub popup_dismissed: bool,
}

/// Owns the single active page of a run.
#[derive(Debug, Clone)]
pub struct TabManager {
    active: PageId,
    carrier: String,
    popups_dismissed: HashSet<PageId>,
}

impl TabManager {
    pub fn new(active: PageId, carrier: impl Into<String>) -> Self {
        Self {
            active,
            carrier: carrier.into(),
            popups_dismissed: HashSet::new(),
        }
    }

    pub fn active(&self) -> &PageId {
        &self.active
    }

    pub fn carrier(&self) -> &str {
        &self.carrier
    }

    /// Same domain, then carrier token, then denylist, then the vision
    /// oracle. A check that cannot run allows the tab.
    pub async fn validate<D>(
        &self,
        driver: &D,
        vision: &dyn VisionOracle,
        prior_url: &str,
        candidate: &PageId,
    ) -> Result<bool, BrowserError>
    where
        D: BrowserDriver + ?Sized,
    {
        let url = driver.url(candidate).await?;
        if let Some(verdict) = url_verdict(prior_url, &url, &self.carrier) {
            log::debug!("tab {candidate} ({url}) judged by URL: valid={verdict}");
            return Ok(verdict);
        }

        let png = match driver.screenshot(candidate).await {
            Ok(png) => png,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::warn!("could not capture tab {candidate} for validation: {err}");
                return Ok(true);
            }
        };
        let screenshot = Screenshot {
            png,
            fold: 0,
            scroll_top: 0.0,
        };
        match vision.confirm_tab(&screenshot, &url, &self.carrier).await {
            Ok(valid) => Ok(valid),
            Err(err) => {
                log::warn!("tab validation oracle failed for {url}, allowing tab: {err}");
                Ok(true)
            }
        }
    }

    /// Make `page` active: bring it to front, close the previous page and
    /// dismiss popups on first visit. Returns the closed page.
    pub async fn switch_to<D>(
        &mut self,
        driver: &D,
        page: PageId,
    ) -> Result<(Option<PageId>, bool), BrowserError>
    where
        D: BrowserDriver + ?Sized,
    {
        driver.bring_to_front(&page).await?;
        let previous = std::mem::replace(&mut self.active, page);
        let mut closed = None;
        if previous != self.active {
            match driver.close_page(&previous).await {
                Ok(()) => closed = Some(previous),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log::warn!("failed to close previous page {previous}: {err}"),
            }
        }
        let dismissed = self.dismiss_popups_once(driver).await?;
        Ok((closed, dismissed))
    }

    /// Dismiss popups on the active page unless already done there.
    pub async fn dismiss_popups_once<D>(&mut self, driver: &D) -> Result<bool, BrowserError>
    where
        D: BrowserDriver + ?Sized,
    {
        if !self.popups_dismissed.insert(self.active.clone()) {
            return Ok(false);
        }
        dom::dismiss_popups(driver, &self.active).await
    }

    /// Apply the tab policy to the pages that appeared since `before`.
    ///
    /// With `explicit` the newest tab is tried first, then the others in
    /// creation order; otherwise creation order throughout. The first valid
    /// tab is adopted and every other new tab is closed. With no valid tab the
    /// current page stays active.
    pub async fn resolve_new_tabs<D>(
        &mut self,
        driver: &D,
        vision: &dyn VisionOracle,
        before: &[PageId],
        prior_url: &str,
        explicit: bool,
    ) -> Result<TabResolution, BrowserError>
    where
        D: BrowserDriver + ?Sized,
    {
        let after = driver.pages().await?;
        let new_tabs: Vec<PageId> = after
            .into_iter()
            .filter(|page| !before.contains(page))
            .collect();
        let mut resolution = TabResolution {
            new_tabs: new_tabs.clone(),
            ..TabResolution::default()
        };
        if new_tabs.is_empty() {
            return Ok(resolution);
        }

        let mut candidates = new_tabs.clone();
        if explicit {
            candidates.rotate_right(1);
        }

        let mut adopted = None;
        for candidate in &candidates {
            if self.validate(driver, vision, prior_url, candidate).await? {
                adopted = Some(candidate.clone());
                break;
            }
        }

        for page in new_tabs.iter().filter(|page| Some(*page) != adopted.as_ref()) {
            match driver.close_page(page).await {
                Ok(()) => resolution.closed.push(page.clone()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => log::warn!("failed to close rejected tab {page}: {err}"),
            }
        }

        if let Some(page) = adopted {
            log::info!("switching to validated tab {page}");
            let (closed, dismissed) = self.switch_to(driver, page.clone()).await?;
            resolution.closed.extend(closed);
            resolution.popup_dismissed = dismissed;
            resolution.switched_to = Some(page);
        } else {
            log::info!("no valid new tab; staying on {}", self.active);
        }
        Ok(resolution)
    }
}
