//! Cooldown and suppression bookkeeping for matched patterns.
//!
//! Each pattern key is either idle (no alert sent yet, or the cooldown has
//! elapsed) or cooling (an alert went out less than one cooldown ago). A match
//! while idle sends and reports how many matches were swallowed since the
//! previous send; a match while cooling only bumps the suppression counter.
//!
//! All keys share one mutex. Decisions are rare next to line throughput, so a
//! single lock keeps the bookkeeping trivially consistent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};

use crate::classifier::PatternRule;

/// Source of the current time for cooldown decisions.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for deterministic cooldown tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `delta`. Saturates at the maximum instant.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Jump the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-key alert bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertState {
    /// When the last alert for this key was sent.
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Matches swallowed since the last send.
    pub suppressed_count: u64,
}

/// Outcome of a single match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertDecision {
    /// Whether an alert should be dispatched now.
    pub send: bool,
    /// When sending: matches suppressed since the previous send.
    /// Otherwise: the suppression count after this match.
    pub suppressed: u64,
}

/// Decides whether a matched pattern should alert.
pub struct AlertManager {
    states: Mutex<HashMap<String, AlertState>>,
    default_cooldown: TimeDelta,
    clock: Arc<dyn Clock>,
}

impl AlertManager {
    /// Create a manager using the wall clock.
    pub fn new(default_cooldown: TimeDelta) -> Self {
        Self::with_clock(default_cooldown, Arc::new(SystemClock))
    }

    /// Create a manager reading time from `clock`.
    pub fn with_clock(default_cooldown: TimeDelta, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            default_cooldown,
            clock,
        }
    }

    /// Record a match for `rule` and decide whether it alerts.
    pub fn should_send(&self, rule: &PatternRule) -> AlertDecision {
        self.decide(rule.key(), rule.cooldown())
    }

    /// Record a match for `key` with an optional cooldown override.
    pub fn decide(&self, key: &str, cooldown: Option<TimeDelta>) -> AlertDecision {
        let cooldown = cooldown.unwrap_or(self.default_cooldown);
        let now = self.clock.now();

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.to_owned()).or_default();

        let cooling = state
            .last_sent_at
            .is_some_and(|last| now.signed_duration_since(last) < cooldown);

        if cooling {
            state.suppressed_count = state.suppressed_count.saturating_add(1);
            return AlertDecision {
                send: false,
                suppressed: state.suppressed_count,
            };
        }

        // A clock stepping backwards lands in the cooling branch above, so
        // last_sent_at never decreases.
        let reported = state.suppressed_count;
        state.last_sent_at = Some(now);
        state.suppressed_count = 0;
        AlertDecision {
            send: true,
            suppressed: reported,
        }
    }

    /// Current suppression count for `key`, without recording a match.
    pub fn suppression_count(&self, key: &str) -> u64 {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |state| state.suppressed_count)
    }

    /// Snapshot of the state for `key`, if it has ever matched.
    pub fn state(&self, key: &str) -> Option<AlertState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }
}
