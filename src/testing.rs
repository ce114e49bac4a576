//! Scripted in-memory browser for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::browser::{BrowserDriver, BrowserError, PageId};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    NewPage(String),
    Navigate(PageId, String),
    Click(PageId, f64, f64),
    Type(PageId, String),
    Key(PageId, String),
    Evaluate(PageId, String),
    Screenshot(PageId),
    BringToFront(PageId),
    Close(PageId),
}

/// What happens to the browser after a click or key press.
#[derive(Debug, Clone)]
pub enum Effect {
    OpenTab(String),
    Navigate(String),
}

#[derive(Debug, Clone)]
struct FakePage {
    id: PageId,
    url: String,
    closed: bool,
}

#[derive(Default)]
struct FakeState {
    pages: Vec<FakePage>,
    next_id: u32,
    calls: Vec<Call>,
    evaluate_rules: Vec<(String, VecDeque<Value>)>,
    click_effects: VecDeque<Effect>,
    key_effects: VecDeque<Effect>,
    disconnected: bool,
}

#[derive(Default)]
pub struct FakeBrowser {
    state: Mutex<FakeState>,
}

impl FakeBrowser {
    pub fn with_page(url: &str) -> Self {
        let browser = Self::default();
        browser.open(url);
        browser
    }

    /// Open a page without recording a call.
    pub fn open(&self, url: &str) -> PageId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("page-{}", state.next_id);
        state.pages.push(FakePage {
            id: id.clone(),
            url: url.to_string(),
            closed: false,
        });
        id
    }

    /// Answer evaluations containing `needle` with `values` in turn; the last
    /// value repeats.
    pub fn on_evaluate(&self, needle: &str, values: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .evaluate_rules
            .push((needle.to_string(), values.into()));
    }

    pub fn on_click(&self, effect: Effect) {
        self.state.lock().unwrap().click_effects.push_back(effect);
    }

    pub fn on_key(&self, effect: Effect) {
        self.state.lock().unwrap().key_effects.push_back(effect);
    }

    pub fn disconnect(&self) {
        self.state.lock().unwrap().disconnected = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn open_pages(&self) -> Vec<PageId> {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .filter(|page| !page.closed)
            .map(|page| page.id.clone())
            .collect()
    }

    fn with_state<T>(
        &self,
        page: Option<&PageId>,
        call: Option<Call>,
        f: impl FnOnce(&mut FakeState) -> T,
    ) -> Result<T, BrowserError> {
        let mut state = self.state.lock().unwrap();
        if state.disconnected {
            return Err(BrowserError::Disconnected("fake browser closed".into()));
        }
        if let Some(page) = page {
            if !state.pages.iter().any(|p| &p.id == page && !p.closed) {
                return Err(BrowserError::PageNotFound(page.clone()));
            }
        }
        if let Some(call) = call {
            state.calls.push(call);
        }
        Ok(f(&mut state))
    }
}

fn apply(state: &mut FakeState, page: &PageId, effect: Option<Effect>) {
    match effect {
        Some(Effect::OpenTab(url)) => {
            state.next_id += 1;
            let id = format!("page-{}", state.next_id);
            state.pages.push(FakePage {
                id,
                url,
                closed: false,
            });
        }
        Some(Effect::Navigate(url)) => {
            if let Some(current) = state.pages.iter_mut().find(|p| &p.id == page) {
                current.url = url;
            }
        }
        None => {}
    }
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn pages(&self) -> Result<Vec<PageId>, BrowserError> {
        self.with_state(None, None, |_| ())?;
        Ok(self.open_pages())
    }

    async fn new_page(&self, url: &str) -> Result<PageId, BrowserError> {
        self.with_state(None, Some(Call::NewPage(url.to_string())), |_| ())?;
        Ok(self.open(url))
    }

    async fn url(&self, page: &PageId) -> Result<String, BrowserError> {
        self.with_state(Some(page), None, |state| {
            state
                .pages
                .iter()
                .find(|p| &p.id == page)
                .map(|p| p.url.clone())
                .unwrap_or_default()
        })
    }

    async fn navigate(&self, page: &PageId, url: &str) -> Result<(), BrowserError> {
        self.with_state(
            Some(page),
            Some(Call::Navigate(page.clone(), url.to_string())),
            |state| apply(state, page, Some(Effect::Navigate(url.to_string()))),
        )
    }

    async fn click(&self, page: &PageId, x: f64, y: f64) -> Result<(), BrowserError> {
        self.with_state(Some(page), Some(Call::Click(page.clone(), x, y)), |state| {
            let effect = state.click_effects.pop_front();
            apply(state, page, effect);
        })
    }

    async fn type_text(&self, page: &PageId, text: &str) -> Result<(), BrowserError> {
        self.with_state(
            Some(page),
            Some(Call::Type(page.clone(), text.to_string())),
            |_| (),
        )
    }

    async fn press_key(&self, page: &PageId, key: &str) -> Result<(), BrowserError> {
        self.with_state(
            Some(page),
            Some(Call::Key(page.clone(), key.to_string())),
            |state| {
                if key != "Escape" {
                    let effect = state.key_effects.pop_front();
                    apply(state, page, effect);
                }
            },
        )
    }

    async fn evaluate(&self, page: &PageId, expression: &str) -> Result<Value, BrowserError> {
        self.with_state(
            Some(page),
            Some(Call::Evaluate(page.clone(), expression.to_string())),
            |state| {
                state
                    .evaluate_rules
                    .iter_mut()
                    .find(|(needle, _)| expression.contains(needle.as_str()))
                    .map(|(_, values)| {
                        if values.len() > 1 {
                            values.pop_front().unwrap_or(Value::Null)
                        } else {
                            values.front().cloned().unwrap_or(Value::Null)
                        }
                    })
                    .unwrap_or(Value::Null)
            },
        )
    }

    async fn screenshot(&self, page: &PageId) -> Result<Vec<u8>, BrowserError> {
        self.with_state(Some(page), Some(Call::Screenshot(page.clone())), |_| {
            vec![0x89, b'P', b'N', b'G']
        })
    }

    async fn wait_for_load(&self, page: &PageId, _timeout: Duration) -> Result<(), BrowserError> {
        self.with_state(Some(page), None, |_| ())
    }

    async fn bring_to_front(&self, page: &PageId) -> Result<(), BrowserError> {
        self.with_state(Some(page), Some(Call::BringToFront(page.clone())), |_| ())
    }

    async fn close_page(&self, page: &PageId) -> Result<(), BrowserError> {
        self.with_state(Some(page), Some(Call::Close(page.clone())), |state| {
            if let Some(current) = state.pages.iter_mut().find(|p| &p.id == page) {
                current.closed = true;
            }
        })
    }
}
