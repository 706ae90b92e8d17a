//! Test doubles for the browser seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::page::{PageDriver, ReadyPolicy, WaitTimedOut};
use crate::session::{BrowserBackend, BrowserContext, SessionOptions};

pub const BLANK: &str = "<html><body></body></html>";

/// A page that serves `before_submit` until Enter is pressed, then walks
/// through `frames` one per `html()` call, repeating the last one. `goto`
/// goes back to `before_submit`.
pub struct ScriptedPage {
    before_submit: String,
    frames: Vec<String>,
    visible_text: String,
    goto_delay: Option<Duration>,
    html_delay: Option<Duration>,
    goto_error: Option<String>,
    goto_wait_timeout: bool,
    submitted: AtomicBool,
    frame_calls: AtomicUsize,
    pub gotos: Mutex<Vec<(String, ReadyPolicy)>>,
    pub fills: Mutex<Vec<(String, String)>>,
    pub keys: Mutex<Vec<String>>,
    pub clicks: Mutex<Vec<String>>,
}

impl ScriptedPage {
    pub fn new(before_submit: &str, frames: Vec<String>) -> Self {
        Self {
            before_submit: before_submit.to_string(),
            frames,
            visible_text: String::new(),
            goto_delay: None,
            html_delay: None,
            goto_error: None,
            goto_wait_timeout: false,
            submitted: AtomicBool::new(false),
            frame_calls: AtomicUsize::new(0),
            gotos: Mutex::new(Vec::new()),
            fills: Mutex::new(Vec::new()),
            keys: Mutex::new(Vec::new()),
            clicks: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self::new(BLANK, vec![BLANK.to_string()]))
    }

    /// Serve `frames` straight away, as if the query was already submitted.
    pub fn submitted(frames: Vec<String>) -> Self {
        let page = Self::new(BLANK, frames);
        page.submitted.store(true, Ordering::SeqCst);
        page
    }

    pub fn with_visible_text(mut self, text: &str) -> Self {
        self.visible_text = text.to_string();
        self
    }

    pub fn with_goto_delay(mut self, delay: Duration) -> Self {
        self.goto_delay = Some(delay);
        self
    }

    /// Make every `html()` snapshot take `delay`.
    pub fn with_html_delay(mut self, delay: Duration) -> Self {
        self.html_delay = Some(delay);
        self
    }

    pub fn with_goto_error(mut self, reason: &str) -> Self {
        self.goto_error = Some(reason.to_string());
        self
    }

    /// Make `goto` fail the way a driver does when its own ready wait expires.
    pub fn with_goto_wait_timeout(mut self) -> Self {
        self.goto_wait_timeout = true;
        self
    }

    /// Number of post-submit snapshots taken so far.
    pub fn frame_calls(&self) -> usize {
        self.frame_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn goto(&self, url: &str, ready: ReadyPolicy, _timeout: Duration) -> Result<()> {
        self.gotos.lock().unwrap().push((url.to_string(), ready));
        // a fresh load shows the home page again
        self.submitted.store(false, Ordering::SeqCst);
        if let Some(delay) = self.goto_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = &self.goto_error {
            anyhow::bail!("{reason}");
        }
        if self.goto_wait_timeout {
            return Err(WaitTimedOut.into());
        }
        Ok(())
    }

    async fn html(&self) -> Result<String> {
        if let Some(delay) = self.html_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.submitted.load(Ordering::SeqCst) {
            return Ok(self.before_submit.clone());
        }
        let n = self.frame_calls.fetch_add(1, Ordering::SeqCst);
        let frame = self
            .frames
            .get(n)
            .or_else(|| self.frames.last())
            .cloned()
            .unwrap_or_else(|| BLANK.to_string());
        Ok(frame)
    }

    async fn visible_text(&self) -> Result<String> {
        Ok(self.visible_text.clone())
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        self.fills
            .lock()
            .unwrap()
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        self.keys.lock().unwrap().push(key.to_string());
        if key == "Enter" {
            self.submitted.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.clicks.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    async fn click_text(&self, selector: &str, needle: &str) -> Result<bool> {
        let html = self.html().await?;
        let found = crate::dom::Snapshot::parse(&html)
            .texts(selector)
            .iter()
            .any(|text| text.contains(needle));
        if found {
            self.clicks
                .lock()
                .unwrap()
                .push(format!("{selector} ~ {needle}"));
        }
        Ok(found)
    }
}

/// Backend handing out one shared [`ScriptedPage`] and counting lifecycle calls.
pub struct CountingBackend {
    page: Arc<ScriptedPage>,
    fail: Option<String>,
    pub launches: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    /// Threads that ran `open_page` and `close`, in call order.
    pub context_threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl CountingBackend {
    pub fn new(page: Arc<ScriptedPage>) -> Self {
        Self {
            page,
            fail: None,
            launches: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            context_threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail: Some(reason.to_string()),
            ..Self::new(ScriptedPage::empty())
        }
    }
}

impl BrowserBackend for CountingBackend {
    fn launch(&self, _options: &SessionOptions) -> Result<Box<dyn BrowserContext>> {
        if let Some(reason) = &self.fail {
            anyhow::bail!("{reason}");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingContext {
            page: self.page.clone(),
            closes: self.closes.clone(),
            threads: self.context_threads.clone(),
        }))
    }
}

struct CountingContext {
    page: Arc<ScriptedPage>,
    closes: Arc<AtomicUsize>,
    threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl CountingContext {
    fn note_thread(&self) {
        self.threads.lock().unwrap().push(std::thread::current().id());
    }
}

impl BrowserContext for CountingContext {
    fn open_page(&self, _options: &SessionOptions) -> Result<Arc<dyn PageDriver>> {
        self.note_thread();
        Ok(self.page.clone())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.note_thread();
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wrap `text` in a page that shows it as an answer, optionally with a
/// loading indicator next to it.
pub fn answer_frame(text: &str, loading: bool) -> String {
    let spinner = if loading {
        r#"<div class="loading-dots"></div>"#
    } else {
        ""
    };
    format!(
        r#"<html><body><main><div class="prose">{text}</div>{spinner}</main></body></html>"#
    )
}
