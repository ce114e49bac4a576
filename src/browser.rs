//! Browser control seam.
//!
//! Everything the tracker does to a browser goes through [`BrowserDriver`]:
//! the chromiumoxide runtime implements it for real Chrome, tests implement it
//! with scripted pages. Page handles are opaque [`PageId`] strings and
//! [`BrowserDriver::pages`] reports them in creation order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::BrowserConnection;

pub type PageId = String;

/// Launch arguments used when the tracker starts its own Chrome.
pub const DEFAULT_LAUNCH_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-dev-shm-usage",
    "--disable-blink-features=AutomationControlled",
    "--exclude-switches=enable-automation",
    "--disable-features=IsolateOrigins,site-per-process",
    "--allow-running-insecure-content",
    "--disable-gpu",
    "--disable-remote-fonts",
];

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser runtime error: {0}")]
    Message(String),
    #[error("browser runtime not initialized")]
    NotInitialized,
    #[error("browser connection lost: {0}")]
    Disconnected(String),
    #[error("page {0} not found")]
    PageNotFound(PageId),
    #[error("timed out after {0:?} waiting for page load")]
    Timeout(Duration),
}

impl BrowserError {
    /// Errors after which no further page operation can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrowserError::NotInitialized | BrowserError::Disconnected(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Normalised plan derived from [`BrowserConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchPlan {
    AttachCdp {
        url: String,
    },
    LaunchPersistent {
        chrome_executable: Option<PathBuf>,
        user_data_dir: Option<PathBuf>,
        headless: bool,
        args: Vec<String>,
        viewport: Viewport,
    },
}

impl LaunchPlan {
    pub fn from_connection(connection: &BrowserConnection) -> Self {
        match connection {
            BrowserConnection::AttachCdp { url } => LaunchPlan::AttachCdp { url: url.clone() },
            BrowserConnection::Launch {
                chrome_executable,
                user_data_dir,
                headless,
            } => LaunchPlan::LaunchPersistent {
                chrome_executable: chrome_executable.clone(),
                user_data_dir: user_data_dir.clone(),
                headless: *headless,
                args: DEFAULT_LAUNCH_ARGS.iter().map(|arg| arg.to_string()).collect(),
                viewport: Viewport::default(),
            },
        }
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open pages in creation order.
    async fn pages(&self) -> Result<Vec<PageId>, BrowserError>;

    async fn new_page(&self, url: &str) -> Result<PageId, BrowserError>;

    async fn url(&self, page: &PageId) -> Result<String, BrowserError>;

    async fn navigate(&self, page: &PageId, url: &str) -> Result<(), BrowserError>;

    /// Left click at viewport coordinates.
    async fn click(&self, page: &PageId, x: f64, y: f64) -> Result<(), BrowserError>;

    /// Insert text into the focused element.
    async fn type_text(&self, page: &PageId, text: &str) -> Result<(), BrowserError>;

    async fn press_key(&self, page: &PageId, key: &str) -> Result<(), BrowserError>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, page: &PageId, expression: &str) -> Result<JsonValue, BrowserError>;

    /// PNG bytes of the current viewport.
    async fn screenshot(&self, page: &PageId) -> Result<Vec<u8>, BrowserError>;

    async fn wait_for_load(&self, page: &PageId, timeout: Duration) -> Result<(), BrowserError>;

    async fn bring_to_front(&self, page: &PageId) -> Result<(), BrowserError>;

    async fn close_page(&self, page: &PageId) -> Result<(), BrowserError>;

    async fn shutdown(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

#[async_trait]
impl<T: BrowserDriver + ?Sized> BrowserDriver for Arc<T> {
    async fn pages(&self) -> Result<Vec<PageId>, BrowserError> {
        (**self).pages().await
    }

    async fn new_page(&self, url: &str) -> Result<PageId, BrowserError> {
        (**self).new_page(url).await
    }

    async fn url(&self, page: &PageId) -> Result<String, BrowserError> {
        (**self).url(page).await
    }

    async fn navigate(&self, page: &PageId, url: &str) -> Result<(), BrowserError> {
        (**self).navigate(page, url).await
    }

    async fn click(&self, page: &PageId, x: f64, y: f64) -> Result<(), BrowserError> {
        (**self).click(page, x, y).await
    }

    async fn type_text(&self, page: &PageId, text: &str) -> Result<(), BrowserError> {
        (**self).type_text(page, text).await
    }

    async fn press_key(&self, page: &PageId, key: &str) -> Result<(), BrowserError> {
        (**self).press_key(page, key).await
    }

    async fn evaluate(&self, page: &PageId, expression: &str) -> Result<JsonValue, BrowserError> {
        (**self).evaluate(page, expression).await
    }

    async fn screenshot(&self, page: &PageId) -> Result<Vec<u8>, BrowserError> {
        (**self).screenshot(page).await
    }

    async fn wait_for_load(&self, page: &PageId, timeout: Duration) -> Result<(), BrowserError> {
        (**self).wait_for_load(page, timeout).await
    }

    async fn bring_to_front(&self, page: &PageId) -> Result<(), BrowserError> {
        (**self).bring_to_front(page).await
    }

    async fn close_page(&self, page: &PageId) -> Result<(), BrowserError> {
        (**self).close_page(page).await
    }

    async fn shutdown(&self) -> Result<(), BrowserError> {
        (**self).shutdown().await
    }
}

/// Produces a connected driver per tracking run.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError>;
}
