//! Chromiumoxide-backed [`BrowserDriver`].
//!
//! Either attaches to a running Chrome over CDP (resolving the websocket
//! endpoint from `/json/version` for plain HTTP debugger URLs) or launches a
//! local Chrome with a persistent profile. Pages are tracked in an ordered
//! registry so callers see tabs in the order they were first observed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::input::{
        DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
    },
    cdp::browser_protocol::page::CaptureScreenshotFormat,
    layout::Point,
    page::{Page as ChromiumPage, ScreenshotParams},
};
use futures_util::StreamExt;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};

use crate::browser::{BrowserDriver, BrowserError, DriverFactory, LaunchPlan, PageId};
use crate::config::BrowserConnection;

pub struct ChromiumoxideDriver {
    state: Arc<Mutex<Option<RuntimeState>>>,
}

struct RuntimeState {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
    pages: HashMap<PageId, ChromiumPage>,
    order: Vec<PageId>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

impl ChromiumoxideDriver {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect according to `plan`. A second call is a no-op.
    pub async fn connect(&self, plan: &LaunchPlan) -> Result<(), BrowserError> {
        if self.state.lock().await.is_some() {
            return Ok(());
        }

        let (browser, handler) = match plan {
            LaunchPlan::AttachCdp { url } => {
                let endpoint = resolve_ws_endpoint(url).await?;
                log::info!("attaching to chrome at {endpoint}");
                Browser::connect(endpoint)
                    .await
                    .map_err(map_chromiumoxide_error)?
            }
            LaunchPlan::LaunchPersistent { .. } => {
                let config = build_config(plan)?;
                Browser::launch(config)
                    .await
                    .map_err(map_chromiumoxide_error)?
            }
        };

        let new_state = RuntimeState {
            browser: Arc::new(browser),
            handler: spawn_handler(handler),
            pages: HashMap::new(),
            order: Vec::new(),
        };

        {
            let mut guard = self.state.lock().await;
            if let Some(previous) = guard.replace(new_state) {
                cleanup_state(previous);
            }
        }

        self.refresh_pages().await?;
        Ok(())
    }

    async fn browser(&self) -> Result<Arc<Browser>, BrowserError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(BrowserError::NotInitialized)?;
        Ok(state.browser.clone())
    }

    async fn page(&self, page_id: &PageId) -> Result<ChromiumPage, BrowserError> {
        let cached = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().ok_or(BrowserError::NotInitialized)?;
            state.pages.get(page_id).cloned()
        };
        if let Some(page) = cached {
            return Ok(page);
        }
        self.refresh_pages().await?;
        let guard = self.state.lock().await;
        let state = guard.as_ref().ok_or(BrowserError::NotInitialized)?;
        state
            .pages
            .get(page_id)
            .cloned()
            .ok_or_else(|| BrowserError::PageNotFound(page_id.clone()))
    }

    /// Merge the browser's current targets into the ordered registry.
    async fn refresh_pages(&self) -> Result<Vec<PageId>, BrowserError> {
        let browser = self.browser().await?;
        let pages = match browser.pages().await {
            Ok(pages) => pages,
            Err(err) => return Err(self.classify(err).await),
        };

        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or(BrowserError::NotInitialized)?;

        let mut live = HashMap::new();
        for page in pages {
            live.insert(page.target_id().as_ref().to_string(), page);
        }

        state.order.retain(|id| live.contains_key(id));
        state.pages.retain(|id, _| live.contains_key(id));
        for (id, page) in live {
            if !state.order.contains(&id) {
                state.order.push(id.clone());
            }
            state.pages.entry(id).or_insert(page);
        }

        Ok(state.order.clone())
    }

    /// A failed operation on a dead browser is a disconnect, not a page error.
    async fn classify<E: std::fmt::Display>(&self, err: E) -> BrowserError {
        let browser = match self.browser().await {
            Ok(browser) => browser,
            Err(err) => return err,
        };
        match browser.version().await {
            Ok(_) => map_chromiumoxide_error(err),
            Err(_) => BrowserError::Disconnected(err.to_string()),
        }
    }

    pub async fn disconnect(&self) -> Result<(), BrowserError> {
        let state = {
            let mut guard = self.state.lock().await;
            guard.take()
        };
        if let Some(state) = state {
            cleanup_state(state);
        }
        Ok(())
    }
}

impl Default for ChromiumoxideDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowserDriver for ChromiumoxideDriver {
    async fn pages(&self) -> Result<Vec<PageId>, BrowserError> {
        self.refresh_pages().await
    }

    async fn new_page(&self, url: &str) -> Result<PageId, BrowserError> {
        let browser = self.browser().await?;
        let page = match browser.new_page(url).await {
            Ok(page) => page,
            Err(err) => return Err(self.classify(err).await),
        };
        let page_id = page.target_id().as_ref().to_string();

        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut() {
            if !state.order.contains(&page_id) {
                state.order.push(page_id.clone());
            }
            state.pages.insert(page_id.clone(), page);
        }
        Ok(page_id)
    }

    async fn url(&self, page_id: &PageId) -> Result<String, BrowserError> {
        let page = self.page(page_id).await?;
        match page.url().await {
            Ok(url) => Ok(url.unwrap_or_default()),
            Err(err) => Err(self.classify(err).await),
        }
    }

    async fn navigate(&self, page_id: &PageId, url: &str) -> Result<(), BrowserError> {
        let page = self.page(page_id).await?;
        if let Err(err) = page.goto(url).await {
            return Err(self.classify(err).await);
        }
        Ok(())
    }

    async fn click(&self, page_id: &PageId, x: f64, y: f64) -> Result<(), BrowserError> {
        let page = self.page(page_id).await?;
        if let Err(err) = page.click(Point { x, y }).await {
            return Err(self.classify(err).await);
        }
        Ok(())
    }

    async fn type_text(&self, page_id: &PageId, text: &str) -> Result<(), BrowserError> {
        let page = self.page(page_id).await?;
        if let Err(err) = page.execute(InsertTextParams::new(text)).await {
            return Err(self.classify(err).await);
        }
        Ok(())
    }

    async fn press_key(&self, page_id: &PageId, key: &str) -> Result<(), BrowserError> {
        let page = self.page(page_id).await?;
        let (code, text, virtual_key) = key_definition(key);

        let mut down = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyDown)
            .key(key.to_string())
            .code(code.to_string());
        if let Some(text) = text {
            down = down.text(text.to_string());
        }
        if let Some(vk) = virtual_key {
            down = down
                .windows_virtual_key_code(vk)
                .native_virtual_key_code(vk);
        }
        let down = down.build().map_err(BrowserError::Message)?;

        let mut up = DispatchKeyEventParams::builder()
            .r#type(DispatchKeyEventType::KeyUp)
            .key(key.to_string())
            .code(code.to_string());
        if let Some(vk) = virtual_key {
            up = up.windows_virtual_key_code(vk).native_virtual_key_code(vk);
        }
        let up = up.build().map_err(BrowserError::Message)?;

        if let Err(err) = page.execute(down).await {
            return Err(self.classify(err).await);
        }
        if let Err(err) = page.execute(up).await {
            return Err(self.classify(err).await);
        }
        Ok(())
    }

    async fn evaluate(&self, page_id: &PageId, expression: &str) -> Result<JsonValue, BrowserError> {
        let page = self.page(page_id).await?;
        match page.evaluate(expression).await {
            Ok(result) => Ok(result.value().cloned().unwrap_or(JsonValue::Null)),
            Err(err) => Err(self.classify(err).await),
        }
    }

    async fn screenshot(&self, page_id: &PageId) -> Result<Vec<u8>, BrowserError> {
        let page = self.page(page_id).await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        match page.screenshot(params).await {
            Ok(bytes) => Ok(bytes),
            Err(err) => Err(self.classify(err).await),
        }
    }

    async fn wait_for_load(&self, page_id: &PageId, timeout: Duration) -> Result<(), BrowserError> {
        let page = self.page(page_id).await?;
        let deadline = Instant::now() + timeout;
        loop {
            let ready = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|result| result.value().and_then(JsonValue::as_str).map(str::to_string));
            if matches!(ready.as_deref(), Some("interactive") | Some("complete")) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn bring_to_front(&self, page_id: &PageId) -> Result<(), BrowserError> {
        let page = self.page(page_id).await?;
        if let Err(err) = page.bring_to_front().await {
            return Err(self.classify(err).await);
        }
        Ok(())
    }

    async fn close_page(&self, page_id: &PageId) -> Result<(), BrowserError> {
        let page = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or(BrowserError::NotInitialized)?;
            state.order.retain(|id| id != page_id);
            state.pages.remove(page_id)
        };
        match page {
            Some(page) => match page.close().await {
                Ok(()) => Ok(()),
                Err(err) => Err(self.classify(err).await),
            },
            None => Err(BrowserError::PageNotFound(page_id.clone())),
        }
    }

    async fn shutdown(&self) -> Result<(), BrowserError> {
        self.disconnect().await
    }
}

/// Connects a fresh [`ChromiumoxideDriver`] for every tracking run.
#[derive(Debug, Clone)]
pub struct ChromiumoxideFactory {
    plan: LaunchPlan,
}

impl ChromiumoxideFactory {
    pub fn new(connection: &BrowserConnection) -> Self {
        Self {
            plan: LaunchPlan::from_connection(connection),
        }
    }
}

#[async_trait]
impl DriverFactory for ChromiumoxideFactory {
    async fn connect(&self) -> Result<Arc<dyn BrowserDriver>, BrowserError> {
        let driver = ChromiumoxideDriver::new();
        driver.connect(&self.plan).await?;
        Ok(Arc::new(driver))
    }
}

fn key_definition(key: &str) -> (&str, Option<&'static str>, Option<i64>) {
    match key {
        "Enter" => ("Enter", Some("\r"), Some(13)),
        "Tab" => ("Tab", Some("\t"), Some(9)),
        "Escape" => ("Escape", None, Some(27)),
        "Backspace" => ("Backspace", None, Some(8)),
        "ArrowDown" => ("ArrowDown", None, Some(40)),
        "ArrowUp" => ("ArrowUp", None, Some(38)),
        "PageDown" => ("PageDown", None, Some(34)),
        "PageUp" => ("PageUp", None, Some(33)),
        other => (other, None, None),
    }
}

async fn resolve_ws_endpoint(url: &str) -> Result<String, BrowserError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(url.to_string());
    }

    let endpoint = format!("{}/json/version", url.trim_end_matches('/'));
    let client = HttpClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|err| BrowserError::Message(format!("failed to build HTTP client: {err}")))?;
    let response = client
        .get(&endpoint)
        .send()
        .await
        .map_err(|err| BrowserError::Disconnected(format!("{endpoint}: {err}")))?;
    if !response.status().is_success() {
        return Err(BrowserError::Disconnected(format!(
            "{endpoint} returned {}",
            response.status()
        )));
    }
    let version: VersionResponse = response.json().await.map_err(|err| {
        BrowserError::Message(format!("failed to parse {endpoint} response: {err}"))
    })?;
    Ok(version.web_socket_debugger_url)
}

fn build_config(plan: &LaunchPlan) -> Result<BrowserConfig, BrowserError> {
    let LaunchPlan::LaunchPersistent {
        chrome_executable,
        user_data_dir,
        headless,
        args,
        viewport,
    } = plan
    else {
        return Err(BrowserError::Message(
            "launch configuration requested for a CDP attach plan".into(),
        ));
    };

    let mut builder = BrowserConfig::builder()
        .viewport(chromiumoxide::handler::viewport::Viewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: viewport.width >= viewport.height,
            has_touch: false,
        })
        .args(args.clone());

    if let Some(path) = chrome_executable {
        builder = builder.chrome_executable(path);
    }
    if let Some(dir) = user_data_dir {
        builder = builder.user_data_dir(dir);
    }
    if !*headless {
        builder = builder.with_head();
    }

    builder.build().map_err(BrowserError::Message)
}

fn map_chromiumoxide_error<E: std::fmt::Display>(err: E) -> BrowserError {
    BrowserError::Message(err.to_string())
}

fn spawn_handler(mut handler: chromiumoxide::handler::Handler) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                log::debug!("chromiumoxide handler error: {err}");
            }
        }
    })
}

fn cleanup_state(mut state: RuntimeState) {
    state.handler.abort();
    state.pages.clear();
    state.order.clear();
}
