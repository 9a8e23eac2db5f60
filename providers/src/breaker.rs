use cairn_core::config::BreakerConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Failing fast, requests rejected until the reset timeout elapses.
    Open,
    /// Probing recovery with live traffic.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// The windowed trigger needs at least this many samples.
    pub volume_threshold: usize,
    /// Rolling error percentage in [0, 100].
    pub error_pct_threshold: f32,
    pub reset_timeout: Duration,
    pub window_size: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            volume_threshold: 10,
            error_pct_threshold: 50.0,
            reset_timeout: Duration::from_secs(30),
            window_size: 20,
        }
    }
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(cfg: &BreakerConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            success_threshold: cfg.success_threshold,
            volume_threshold: cfg.volume_threshold,
            error_pct_threshold: cfg.error_pct_threshold,
            reset_timeout: Duration::from_millis(cfg.reset_timeout_ms),
            window_size: cfg.window_size,
        }
    }
}

impl BreakerSettings {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    /// Rolling outcome window: true = failure.
    window: VecDeque<bool>,
    last_state_change: Instant,
    retry_after_hint: Option<Duration>,
    transitions: Vec<Transition>,
}

/// Availability gate for a single provider. Two opening triggers:
/// consecutive failures reaching the threshold, or the rolling error
/// percentage crossing its threshold once the window holds enough
/// samples.
pub struct CircuitBreaker {
    provider: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            provider: provider.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                window: VecDeque::new(),
                last_state_change: Instant::now(),
                retry_after_hint: None,
                transitions: Vec::new(),
            }),
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_state_change = Instant::now();
        inner.transitions.push(Transition { from, to });
        info!(provider = self.provider.as_str(), ?from, ?to, "circuit state change");
    }

    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.last_state_change.elapsed() >= self.settings.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.settings.window_size {
            inner.window.pop_front();
        }
    }

    fn window_trips(&self, inner: &Inner) -> bool {
        if inner.window.len() < self.settings.volume_threshold {
            return false;
        }
        let failures = inner.window.iter().filter(|failed| **failed).count();
        let pct = failures as f32 / inner.window.len() as f32 * 100.0;
        pct >= self.settings.error_pct_threshold
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.push_outcome(&mut inner, false);
        inner.consecutive_failures = 0;
        inner.retry_after_hint = None;

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.settings.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
                inner.window.clear();
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.push_outcome(&mut inner, true);
        inner.consecutive_failures += 1;

        match inner.state {
            // Any failure during the probe re-opens immediately.
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.settings.failure_threshold
                    || self.window_trips(&inner)
                {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// A 429 counts as a failure and pins the provider-reported
    /// retry-after for callers to surface.
    pub fn note_rate_limited(&self, retry_after: Option<Duration>) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.retry_after_hint = retry_after;
        }
        self.record_failure();
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Suggested delay before the next attempt while open: the provider
    /// hint if any, otherwise the remaining reset timeout.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Open {
            return None;
        }
        inner.retry_after_hint.or_else(|| {
            self.settings
                .reset_timeout
                .checked_sub(inner.last_state_change.elapsed())
        })
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().unwrap().transitions.clone()
    }
}

/// One breaker per provider id.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn get_or_create(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.settings)))
            .clone()
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut out: Vec<(String, CircuitState)> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().current_state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
