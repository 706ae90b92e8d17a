//! Runtime settings from the environment (and `.env`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::research::ResearchSettings;
use crate::selectors::SelectorSet;
use crate::session::{Profile, SessionOptions};

pub const DEFAULT_TARGET_URL: &str = "https://www.perplexity.ai/";
pub const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Debug, Clone)]
pub struct Settings {
    pub research: ResearchSettings,
    pub selectors: SelectorSet,
    /// Default budget for `ask`.
    pub ask_budget: Duration,
    /// Default budget for `deep_research`.
    pub research_budget: Duration,
    pub bind: SocketAddr,
    pub parser_api_url: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let target_url = get("COMET_TARGET_URL").unwrap_or_else(|| DEFAULT_TARGET_URL.to_string());
        reqwest::Url::parse(&target_url)
            .with_context(|| format!("COMET_TARGET_URL is not a valid url: {target_url}"))?;

        let profile = match get("COMET_PROFILE_DIR") {
            Some(dir) => Profile::Persistent(PathBuf::from(dir)),
            None => Profile::Ephemeral,
        };

        let viewport = match get("COMET_VIEWPORT") {
            Some(raw) => parse_viewport(&raw).context("COMET_VIEWPORT")?,
            None => (1920, 1080),
        };

        let session = SessionOptions {
            profile,
            viewport,
            locale: get("COMET_LOCALE").unwrap_or_else(|| "en-US".to_string()),
            timezone: get("COMET_TIMEZONE"),
            headless: parse_flag(get("COMET_HEADLESS"), true).context("COMET_HEADLESS")?,
            chrome_path: get("COMET_CHROME_PATH").map(PathBuf::from),
        };

        let selectors = match get("COMET_SELECTORS_FILE") {
            Some(path) => SelectorSet::load(PathBuf::from(path).as_path())?,
            None => SelectorSet::default(),
        };

        let bind = get("COMET_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse()
            .with_context(|| format!("COMET_BIND is not a socket address: {bind}"))?;

        Ok(Self {
            research: ResearchSettings {
                target_url,
                session,
                keep_alive: parse_flag(get("COMET_KEEP_ALIVE"), true).context("COMET_KEEP_ALIVE")?,
            },
            selectors,
            ask_budget: parse_secs(get("COMET_ASK_BUDGET_SECS"), 120).context("COMET_ASK_BUDGET_SECS")?,
            research_budget: parse_secs(get("COMET_RESEARCH_BUDGET_SECS"), 600)
                .context("COMET_RESEARCH_BUDGET_SECS")?,
            bind,
            parser_api_url: get("PARSER_API_URL"),
        })
    }
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`). stdout stays free
/// for the stdio transport and for printed results.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// "1280x800" -> (1280, 800)
pub fn parse_viewport(raw: &str) -> Result<(u32, u32)> {
    let Some((w, h)) = raw.split_once(['x', 'X']) else {
        bail!("expected WIDTHxHEIGHT, got {raw:?}");
    };
    let width: u32 = w.trim().parse().with_context(|| format!("bad width in {raw:?}"))?;
    let height: u32 = h.trim().parse().with_context(|| format!("bad height in {raw:?}"))?;
    if width == 0 || height == 0 {
        bail!("viewport must not be empty: {raw:?}");
    }
    Ok((width, height))
}

fn parse_flag(raw: Option<String>, default: bool) -> Result<bool> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got {other:?}"),
    }
}

fn parse_secs(raw: Option<String>, default: u64) -> Result<Duration> {
    let secs = match raw {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("expected whole seconds, got {raw:?}"))?,
        None => default,
    };
    if secs == 0 {
        bail!("budget must be at least one second");
    }
    Ok(Duration::from_secs(secs))
}
