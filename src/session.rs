//! Browser session lifecycle.
//!
//! A [`Session`] is owned by exactly one in-flight request. When the request
//! ends the owner hands it back through [`SessionManager::release`] and picks
//! its fate: close it, or park a persistent-profile session so the next
//! request starts with the same cookies and login state.
//!
//! Two requests must never drive the same persistent profile at once (Chrome
//! holds a lock on the profile directory). The manager does not enforce this;
//! callers serialize persistent-profile requests themselves.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::page::{PageDriver, ReadyPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    /// Throwaway profile, discarded with the browser.
    Ephemeral,
    /// Profile directory reused across invocations.
    Persistent(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub profile: Profile,
    pub viewport: (u32, u32),
    pub locale: String,
    pub timezone: Option<String>,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            profile: Profile::Ephemeral,
            viewport: (1920, 1080),
            locale: "en-US".to_string(),
            timezone: None,
            headless: true,
            chrome_path: None,
        }
    }
}

/// Starts browser processes. Implementations may block.
pub trait BrowserBackend: Send + Sync {
    fn launch(&self, options: &SessionOptions) -> anyhow::Result<Box<dyn BrowserContext>>;
}

/// A running browser bound to one profile.
pub trait BrowserContext: Send + Sync {
    fn open_page(&self, options: &SessionOptions) -> anyhow::Result<Arc<dyn PageDriver>>;

    /// Tear down the context and its process.
    fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// What to do with a session once the request is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Close,
    KeepAlive,
}

pub struct Session {
    id: Uuid,
    options: SessionOptions,
    context: Option<Box<dyn BrowserContext>>,
    pages: Vec<Arc<dyn PageDriver>>,
    warm: bool,
}

impl Session {
    fn new(options: SessionOptions, context: Box<dyn BrowserContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            options,
            context: Some(context),
            pages: Vec::new(),
            warm: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.options.profile, Profile::Persistent(_))
    }

    /// True when the session was handed back from a previous request.
    pub fn is_warm(&self) -> bool {
        self.warm
    }

    /// Cold sessions wait for the network to settle; a warm one already has
    /// the page's assets cached.
    pub fn ready_policy(&self) -> ReadyPolicy {
        if self.warm {
            ReadyPolicy::DomContentLoaded
        } else {
            ReadyPolicy::NetworkIdle
        }
    }

    /// The session's working tab, opened on first use.
    pub async fn page(&mut self) -> Result<Arc<dyn PageDriver>, AgentError> {
        if let Some(page) = self.pages.first() {
            return Ok(page.clone());
        }
        let context = self
            .context
            .take()
            .ok_or_else(|| AgentError::Browser("session already closed".into()))?;
        let options = self.options.clone();
        let (context, opened) = tokio::task::spawn_blocking(move || {
            let opened = context.open_page(&options);
            (context, opened)
        })
        .await
        .map_err(|e| AgentError::browser("opening tab", format!("tab task aborted: {e}")))?;
        self.context = Some(context);

        let page = opened.map_err(|e| AgentError::browser("opening tab", format!("{e:#}")))?;
        self.pages.push(page.clone());
        Ok(page)
    }

    /// Tear the context down on the blocking pool.
    async fn close(&mut self) {
        self.pages.clear();
        let Some(context) = self.context.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || context.close()).await {
            Ok(Ok(())) => debug!(session = %self.id, "browser context closed"),
            Ok(Err(e)) => warn!(session = %self.id, "closing browser context failed: {e:#}"),
            Err(e) => warn!(session = %self.id, "close task failed: {e}"),
        }
    }

    fn close_now(&mut self) {
        self.pages.clear();
        if let Some(context) = self.context.take() {
            if let Err(e) = context.close() {
                warn!(session = %self.id, "closing browser context failed: {e:#}");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.context.is_some() {
            warn!(session = %self.id, "session dropped without release, closing browser");
            self.close_now();
        }
    }
}

pub struct SessionManager {
    backend: Arc<dyn BrowserBackend>,
    parked: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        Self {
            backend,
            parked: Mutex::new(None),
        }
    }

    /// Hand out a session for `options`, reusing a parked one for the same
    /// persistent profile when available.
    pub async fn acquire(&self, options: SessionOptions) -> Result<Session, AgentError> {
        if let Profile::Persistent(path) = &options.profile {
            let parked = self.parked.lock().await.take();
            match parked {
                Some(mut session) if session.options.profile == options.profile => {
                    info!(session = %session.id, profile = %path.display(), "♻️ reusing parked browser session");
                    session.warm = true;
                    return Ok(session);
                }
                Some(mut other) => {
                    info!(session = %other.id, "closing parked session for a different profile");
                    other.close().await;
                }
                None => {}
            }
        }

        let backend = self.backend.clone();
        let launch_options = options.clone();
        let context = tokio::task::spawn_blocking(move || backend.launch(&launch_options))
            .await
            .map_err(|e| AgentError::Launch(format!("launch task aborted: {e}")))?
            .map_err(|e| AgentError::Launch(format!("{e:#}")))?;

        let session = Session::new(options, context);
        info!(
            session = %session.id,
            persistent = session.is_persistent(),
            "🚀 browser session started"
        );
        Ok(session)
    }

    pub async fn release(&self, mut session: Session, release: Release) {
        match release {
            Release::KeepAlive if session.is_persistent() => {
                info!(session = %session.id, "parking persistent session for reuse");
                let previous = self.parked.lock().await.replace(session);
                if let Some(mut previous) = previous {
                    previous.close().await;
                }
            }
            Release::KeepAlive => {
                warn!(session = %session.id, "keep-alive requested for an ephemeral profile, closing instead");
                session.close().await;
            }
            Release::Close => session.close().await,
        }
    }

    /// Close any parked session.
    pub async fn shutdown(&self) {
        let parked = self.parked.lock().await.take();
        if let Some(mut session) = parked {
            info!(session = %session.id, "closing parked session on shutdown");
            session.close().await;
        }
    }

    pub async fn has_parked(&self) -> bool {
        self.parked.lock().await.is_some()
    }
}
