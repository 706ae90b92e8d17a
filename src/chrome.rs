//! Chrome implementation of the browser seams, over `headless_chrome`.
//!
//! `headless_chrome` talks CDP synchronously; every call made from the async
//! pipeline is moved onto the blocking pool.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::page::{PageDriver, ReadyPolicy, WaitTimedOut};
use crate::session::{BrowserBackend, BrowserContext, Profile, SessionOptions};

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    ]
});

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// How long the resource count must stay flat before the network counts as idle.
const NETWORK_QUIET: Duration = Duration::from_millis(500);
const IDLE_SAMPLE: Duration = Duration::from_millis(100);

/// headless_chrome drops the connection after this long without CDP traffic;
/// parked sessions sit idle between requests.
const BROWSER_IDLE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

pub struct ChromeBackend;

impl BrowserBackend for ChromeBackend {
    fn launch(&self, options: &SessionOptions) -> Result<Box<dyn BrowserContext>> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(DEFAULT_USER_AGENT);

        let mut args = vec![
            "--disable-blink-features=AutomationControlled".to_string(),
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-infobars".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            format!("--lang={}", options.locale),
            format!("--user-agent={user_agent}"),
        ];
        if options.headless {
            args.push("--headless=new".to_string());
        }

        let user_data_dir = match &options.profile {
            Profile::Ephemeral => {
                args.push("--incognito".to_string());
                None
            }
            Profile::Persistent(path) => {
                std::fs::create_dir_all(path)
                    .with_context(|| format!("creating profile dir {}", path.display()))?;
                Some(path.clone())
            }
        };

        debug!(?args, "launching chrome");

        let browser = Browser::new(LaunchOptions {
            // headless mode is selected through --headless=new above
            headless: false,
            window_size: Some(options.viewport),
            path: options.chrome_path.clone(),
            user_data_dir,
            idle_browser_timeout: BROWSER_IDLE_TIMEOUT,
            args: args.iter().map(OsStr::new).collect(),
            ..Default::default()
        })
        .context("starting chrome")?;

        Ok(Box::new(ChromeContext { browser }))
    }
}

struct ChromeContext {
    browser: Browser,
}

impl BrowserContext for ChromeContext {
    fn open_page(&self, options: &SessionOptions) -> Result<Arc<dyn PageDriver>> {
        let tab = self.browser.new_tab().context("opening tab")?;
        crate::stealth::prepare_tab(&tab, options)?;
        Ok(Arc::new(ChromePage { tab }))
    }

    fn close(self: Box<Self>) -> Result<()> {
        let tabs = self
            .browser
            .get_tabs()
            .lock()
            .map(|tabs| tabs.clone())
            .unwrap_or_default();
        for tab in tabs {
            let _ = tab.close(false);
        }
        // Dropping the Browser kills the process.
        drop(self.browser);
        Ok(())
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
}

impl ChromePage {
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .context("browser call panicked")?
    }
}

/// True when `err` is a bounded wait running out rather than a broken page.
fn is_wait_timeout(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<headless_chrome::util::Timeout>() || cause.is::<WaitTimedOut>())
}

fn wait_for_network_idle(tab: &Tab, deadline: Instant) -> Result<()> {
    let mut last_count = None;
    let mut quiet_since = Instant::now();

    loop {
        let count = tab
            .evaluate(
                "document.readyState === 'complete' ? performance.getEntriesByType('resource').length : -1",
                false,
            )?
            .value
            .and_then(|v| v.as_i64())
            .unwrap_or(-1);

        if count >= 0 && last_count == Some(count) {
            if quiet_since.elapsed() >= NETWORK_QUIET {
                return Ok(());
            }
        } else {
            last_count = Some(count);
            quiet_since = Instant::now();
        }

        if Instant::now() >= deadline {
            debug!("network did not go idle before the deadline");
            return Err(WaitTimedOut.into());
        }
        std::thread::sleep(IDLE_SAMPLE);
    }
}

#[async_trait]
impl PageDriver for ChromePage {
    async fn goto(&self, url: &str, ready: ReadyPolicy, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            let deadline = Instant::now() + timeout;
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)?;
            let waited = match ready {
                ReadyPolicy::DomContentLoaded => tab
                    .wait_for_element_with_custom_timeout("body", timeout)
                    .map(|_| ()),
                ReadyPolicy::NetworkIdle => tab
                    .wait_until_navigated()
                    .and_then(|_| wait_for_network_idle(tab, deadline)),
            };
            waited.map_err(|e| {
                if is_wait_timeout(&e) {
                    debug!("page wait ran out: {e:#}");
                    WaitTimedOut.into()
                } else {
                    e.context("waiting for the page to load")
                }
            })
        })
        .await
    }

    async fn html(&self) -> Result<String> {
        self.blocking(|tab| tab.get_content()).await
    }

    async fn visible_text(&self) -> Result<String> {
        self.blocking(|tab| {
            let value = tab
                .evaluate("document.body ? document.body.innerText : ''", false)?
                .value;
            Ok(value
                .as_ref()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        })
        .await
    }

    async fn fill(&self, selector: &str, text: &str) -> Result<()> {
        let selector = selector.to_string();
        // a literal newline would submit half the query
        let text = text.replace(['\r', '\n'], " ");
        self.blocking(move |tab| {
            let element = tab.find_element(&selector)?;
            element.click()?;
            tab.type_str(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |tab| {
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            tab.find_element(&selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn click_text(&self, selector: &str, needle: &str) -> Result<bool> {
        let script = format!(
            r#"
            (() => {{
                const needle = {needle};
                for (const el of document.querySelectorAll({selector})) {{
                    if ((el.textContent || '').includes(needle)) {{
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            needle = serde_json::to_string(needle)?,
            selector = serde_json::to_string(selector)?,
        );
        self.blocking(move |tab| {
            let value = tab.evaluate(&script, false)?.value;
            Ok(value.and_then(|v| v.as_bool()).unwrap_or(false))
        })
        .await
    }
}
