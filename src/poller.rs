//! Convergence polling over an answer that is still being written.
//!
//! Every tick takes one snapshot of the page and reads the answer through all
//! selector tiers. The longest reading seen so far is kept; it never shrinks.
//! Polling stops once no loading indicator is visible and the kept text is
//! long enough, once a completion marker appears (deep research only), when
//! the tick budget runs out, or when the request is cancelled.

use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dom::Snapshot;
use crate::page::PageDriver;
use crate::selectors::SelectorSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollProfile {
    pub tick: Duration,
    /// The answer must be longer than this many characters to count as done.
    pub min_chars: usize,
    pub completion_markers: bool,
}

impl PollProfile {
    pub const DIRECT: Self = Self {
        tick: Duration::from_secs(3),
        min_chars: 100,
        completion_markers: false,
    };

    pub const DEEP_RESEARCH: Self = Self {
        tick: Duration::from_secs(10),
        min_chars: 500,
        completion_markers: true,
    };

    /// Ticks that fit in `budget`, at least one.
    pub fn max_ticks(&self, budget: Duration) -> u32 {
        let ticks = budget.as_millis() / self.tick.as_millis().max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub sampled_at: Instant,
    /// Index into the answer tier list that produced the text.
    pub tier: usize,
}

impl Candidate {
    pub fn chars(&self) -> usize {
        self.text.chars().count()
    }
}

/// What one snapshot said about the answer.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Sample {
    /// Longest tier reading and its tier.
    pub reading: Option<(String, usize)>,
    pub loading: bool,
    pub marker: Option<String>,
}

/// Read one snapshot through the selector tables.
pub fn sample(html: &str, selectors: &SelectorSet, markers: Option<&Regex>) -> Sample {
    let snapshot = Snapshot::parse(html);

    let mut reading: Option<(String, usize)> = None;
    for (tier, pattern) in selectors.answer_tiers.iter().enumerate() {
        let text = snapshot.joined_text(pattern);
        let len = text.chars().count();
        // equal lengths keep the more specific tier
        if len > 0 && reading.as_ref().map_or(true, |(t, _)| len > t.chars().count()) {
            reading = Some((text, tier));
        }
    }

    let marker = markers.and_then(|re| {
        selectors.completion_scopes.iter().find_map(|scope| {
            snapshot
                .texts(scope)
                .iter()
                .find_map(|text| re.find(text).map(|m| m.as_str().to_string()))
        })
    });

    Sample {
        reading,
        loading: snapshot.any_match(&selectors.loading_indicators),
        marker,
    }
}

/// Word-boundary matcher for any of `markers`. `None` when there are none.
pub fn marker_regex(markers: &[String]) -> Option<Regex> {
    if markers.is_empty() {
        return None;
    }
    let alternation = markers
        .iter()
        .map(|m| regex::escape(m))
        .collect::<Vec<_>>()
        .join("|");
    match Regex::new(&format!(r"\b(?:{alternation})\b")) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("completion markers disabled: {e}");
            None
        }
    }
}

#[derive(Debug)]
pub struct PollState {
    pub best: Option<Candidate>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub loading_detected: bool,
}

impl PollState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            best: None,
            attempts: 0,
            max_attempts,
            loading_detected: false,
        }
    }

    pub fn best_chars(&self) -> usize {
        self.best.as_ref().map_or(0, Candidate::chars)
    }

    /// Fold one tick's sample in. The best candidate is only replaced by a
    /// strictly longer one.
    pub fn observe(&mut self, sample: &Sample, at: Instant) {
        self.attempts += 1;
        self.loading_detected = sample.loading;
        if let Some((text, tier)) = &sample.reading {
            if text.chars().count() > self.best_chars() {
                self.best = Some(Candidate {
                    text: text.clone(),
                    sampled_at: at,
                    tier: *tier,
                });
            }
        }
    }

    /// Settled: nothing is loading and the answer is long enough.
    pub fn settled(&self, min_chars: usize) -> bool {
        !self.loading_detected && self.best_chars() > min_chars
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    CompletionMarker,
    BudgetExhausted,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// Best text seen. May be empty when nothing was ever extracted.
    pub text: String,
    pub converged: bool,
    pub ticks: u32,
    pub reason: StopReason,
}

pub async fn poll(
    page: &dyn PageDriver,
    selectors: &SelectorSet,
    profile: PollProfile,
    budget: Duration,
    cancel: &CancellationToken,
) -> PollOutcome {
    let markers = if profile.completion_markers {
        marker_regex(&selectors.completion_markers)
    } else {
        None
    };
    let mut state = PollState::new(profile.max_ticks(budget));
    // hard stop: slow snapshots must not stretch the poll past budget + one tick
    let deadline = Instant::now() + budget + profile.tick;
    info!(
        max_ticks = state.max_attempts,
        tick_secs = profile.tick.as_secs_f32(),
        "⏳ polling for answer"
    );

    let reason = loop {
        let wake = (Instant::now() + profile.tick).min(deadline);
        tokio::select! {
            _ = cancel.cancelled() => break StopReason::Cancelled,
            _ = tokio::time::sleep_until(wake) => {}
        }
        if Instant::now() >= deadline {
            break StopReason::BudgetExhausted;
        }

        let snapshot = tokio::select! {
            _ = cancel.cancelled() => break StopReason::Cancelled,
            snapshot = tokio::time::timeout_at(deadline, page.html()) => snapshot,
        };
        let Ok(snapshot) = snapshot else {
            state.attempts += 1;
            warn!(tick = state.attempts, "snapshot still pending at the deadline");
            break StopReason::BudgetExhausted;
        };

        match snapshot {
            Ok(html) => {
                let sample = sample(&html, selectors, markers.as_ref());
                state.observe(&sample, Instant::now());
                debug!(
                    tick = state.attempts,
                    best_chars = state.best_chars(),
                    tier = ?state.best.as_ref().map(|c| c.tier),
                    loading = state.loading_detected,
                    "poll tick"
                );
                if let Some(marker) = &sample.marker {
                    info!(tick = state.attempts, marker = %marker, "completion marker seen");
                    break StopReason::CompletionMarker;
                }
                if state.settled(profile.min_chars) {
                    break StopReason::Converged;
                }
            }
            Err(e) => {
                state.attempts += 1;
                warn!(tick = state.attempts, "snapshot failed, skipping tick: {e:#}");
            }
        }

        if state.exhausted() {
            break StopReason::BudgetExhausted;
        }
    };

    let converged = matches!(reason, StopReason::Converged | StopReason::CompletionMarker);
    if converged {
        info!(ticks = state.attempts, chars = state.best_chars(), ?reason, "✅ answer settled");
    } else {
        warn!(ticks = state.attempts, chars = state.best_chars(), ?reason, "polling stopped before the answer settled");
    }

    PollOutcome {
        text: state.best.map(|c| c.text).unwrap_or_default(),
        converged,
        ticks: state.attempts,
        reason,
    }
}
