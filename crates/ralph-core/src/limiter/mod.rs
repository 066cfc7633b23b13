//! Per-(provider, model) rate limiting.
//!
//! Each configured slot holds a counting admission limit plus an
//! exponential backoff window driven by rate-limit signals observed in
//! provider output. The limiter is opt-in: slot keys that were never
//! configured implicitly admit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Case-insensitive substrings that mark provider output as rate-limited.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate_limit_error",
    "rate_limit_exceeded",
    "429",
    "resource_exhausted",
    "too many requests",
    "rate limit",
    "overloaded",
];

const BACKOFF_BASE_SECS: f64 = 10.0;
const BACKOFF_MULTIPLIER: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 300.0;

/// Live state for one `(provider, model)` slot.
#[derive(Debug)]
struct SlotState {
    max_concurrent: usize,
    active_concurrent: usize,
    consecutive_rate_limits: u32,
    backoff_until: Option<Instant>,
}

/// Read-only snapshot of a slot, for `get_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotStatus {
    pub max_concurrent: usize,
    pub active_concurrent: usize,
    pub consecutive_rate_limits: u32,
    /// Seconds until the backoff window closes; zero when admitting.
    pub backoff_seconds: f64,
}

/// Counting semaphore + exponential backoff per provider slot.
#[derive(Debug, Default)]
pub struct RateLimiter {
    slots: Mutex<HashMap<String, SlotState>>,
}

/// Canonical slot key.
pub fn slot_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot with its concurrency ceiling. Re-configuring an
    /// existing slot updates the ceiling and keeps its counters.
    pub fn configure_slot(&self, provider: &str, model: &str, max_concurrent: usize) {
        let mut slots = self.lock();
        slots
            .entry(slot_key(provider, model))
            .and_modify(|s| s.max_concurrent = max_concurrent)
            .or_insert(SlotState {
                max_concurrent,
                active_concurrent: 0,
                consecutive_rate_limits: 0,
                backoff_until: None,
            });
    }

    /// Non-blocking acquire. Denies when the slot is at capacity or
    /// inside its backoff window. Unknown slots admit.
    pub fn try_acquire(&self, provider: &str, model: &str) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(&slot_key(provider, model)) else {
            return true;
        };
        if slot.active_concurrent >= slot.max_concurrent {
            return false;
        }
        if let Some(until) = slot.backoff_until {
            if Instant::now() < until {
                return false;
            }
        }
        slot.active_concurrent += 1;
        true
    }

    /// Release a previously acquired permit, saturating at zero.
    pub fn release(&self, provider: &str, model: &str) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&slot_key(provider, model)) {
            slot.active_concurrent = slot.active_concurrent.saturating_sub(1);
        }
    }

    /// Record a rate-limit signal for a slot, escalating its backoff.
    pub fn report_rate_limit(&self, provider: &str, model: &str) {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(&slot_key(provider, model)) else {
            return;
        };
        slot.consecutive_rate_limits += 1;
        let backoff = backoff_duration(slot.consecutive_rate_limits);
        slot.backoff_until = Some(Instant::now() + backoff);
        tracing::warn!(
            slot = %slot_key(provider, model),
            consecutive = slot.consecutive_rate_limits,
            backoff_secs = backoff.as_secs_f64(),
            "rate limit reported; backing off"
        );
    }

    /// Record a successful call, resetting the consecutive counter.
    pub fn report_success(&self, provider: &str, model: &str) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(&slot_key(provider, model)) {
            slot.consecutive_rate_limits = 0;
            slot.backoff_until = None;
        }
    }

    /// Keys of configured slots that would currently admit.
    pub fn get_available_slots(&self) -> Vec<String> {
        let slots = self.lock();
        let now = Instant::now();
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(_, s)| {
                s.active_concurrent < s.max_concurrent
                    && s.backoff_until.is_none_or(|until| now >= until)
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of every configured slot.
    pub fn get_status(&self) -> HashMap<String, SlotStatus> {
        let slots = self.lock();
        let now = Instant::now();
        slots
            .iter()
            .map(|(k, s)| {
                let backoff_seconds = s
                    .backoff_until
                    .map(|until| until.saturating_duration_since(now).as_secs_f64())
                    .unwrap_or(0.0);
                (
                    k.clone(),
                    SlotStatus {
                        max_concurrent: s.max_concurrent,
                        active_concurrent: s.active_concurrent,
                        consecutive_rate_limits: s.consecutive_rate_limits,
                        backoff_seconds,
                    },
                )
            })
            .collect()
    }

    /// Does the given provider output carry a rate-limit signal?
    pub fn is_rate_limited(text: &str) -> bool {
        let lower = text.to_ascii_lowercase();
        RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SlotState>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `min(cap, base * mult^(n-1))` with ±20% jitter.
fn backoff_duration(consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(16);
    let raw = BACKOFF_BASE_SECS * BACKOFF_MULTIPLIER.powi(exponent as i32);
    let capped = raw.min(BACKOFF_CAP_SECS);
    let jitter = 0.8 + 0.4 * rand::random::<f64>();
    Duration::from_secs_f64(capped * jitter)
}
