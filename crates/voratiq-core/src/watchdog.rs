//! Watchdog state machine (§3, §4.5).
//!
//! This module owns only the state transitions; the actual timers
//! (silence/wall-clock deadlines, the `SIGSTOP`/`SIGCONT` delay, the
//! `SIGTERM`→`SIGKILL`→hard-abort escalation) are driven by the root
//! crate's `tokio`-based watchdog task, which calls into this state
//! machine on every stdout/stderr byte, every fatal-pattern match, and
//! every sandbox-denial line. All timestamps here are caller-supplied
//! milliseconds since an arbitrary epoch (typically `Instant::elapsed`),
//! keeping this module free of wall-clock reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Which condition caused the watchdog to fire. Once set on a
/// [`WatchdogState`], this is monotonic — it never changes or clears.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchdogTrigger {
    /// No stdout/stderr bytes since `last_output_at` for the silence
    /// timeout.
    Silence,
    /// The wall-clock cap elapsed since spawn.
    WallClock,
    /// A fatal-pattern string matched twice within the retry window.
    FatalPattern,
    /// A sandbox-denial counter reached the fail-fast threshold.
    SandboxDenial,
    /// An external caller (e.g. the lifecycle supervisor on `Ctrl-C`)
    /// requested cancellation; no watchdog condition actually fired.
    Cancelled,
}

/// An `(operation, target)` pair identifying one sandbox-denial counter,
/// e.g. `("connect", "registry.npmjs.org:443")`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DenialKey {
    /// The denied operation (e.g. `"connect"`, `"read"`).
    pub operation: String,
    /// The denied target (e.g. `host:port` or a path).
    pub target: String,
}

/// Per-`(operation, target)` denial bookkeeping (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialCounter {
    /// Number of hits observed since the counter last reset.
    pub count: u32,
    /// Timestamp (ms) of the first hit since the last reset.
    pub first_seen_ms: u64,
    /// Timestamp (ms) of the most recent hit.
    pub last_seen_ms: u64,
}

/// What the watchdog should do in response to a sandbox-denial hit (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialAction {
    /// First hit: record only, no visible action.
    Record,
    /// Second hit: write a warning banner to stderr.
    Warn,
    /// Third hit: `SIGSTOP` the process group, `SIGCONT` after a delay.
    Delay,
    /// Fourth hit: trigger [`WatchdogTrigger::SandboxDenial`].
    FailFast,
}

/// The full watchdog state for one launched process (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchdogState {
    /// When the process was spawned.
    pub started_at_ms: u64,
    /// Timestamp of the most recent stdout/stderr byte.
    pub last_output_at_ms: u64,
    /// Ordered timestamps of fatal-pattern matches.
    pub fatal_hits_ms: Vec<u64>,
    /// Per-`(operation, target)` sandbox-denial counters.
    pub denial_counters: HashMap<DenialKey, DenialCounter>,
    /// Which condition fired, if any. Monotonic once set.
    pub triggered: Option<WatchdogTrigger>,
}

impl WatchdogState {
    /// Start tracking a freshly spawned process at `started_at_ms`.
    #[must_use]
    pub fn new(started_at_ms: u64) -> Self {
        Self {
            started_at_ms,
            last_output_at_ms: started_at_ms,
            fatal_hits_ms: Vec::new(),
            denial_counters: HashMap::new(),
            triggered: None,
        }
    }

    /// Record a stdout/stderr byte, resetting the silence clock.
    pub fn record_output(&mut self, now_ms: u64) {
        self.last_output_at_ms = now_ms;
    }

    /// Whether `silence_timeout_ms` has elapsed since the last output.
    #[must_use]
    pub fn silence_elapsed(&self, now_ms: u64, silence_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_output_at_ms) >= silence_timeout_ms
    }

    /// Whether `wall_clock_cap_ms` has elapsed since spawn.
    #[must_use]
    pub fn wall_clock_elapsed(&self, now_ms: u64, wall_clock_cap_ms: u64) -> bool {
        now_ms.saturating_sub(self.started_at_ms) >= wall_clock_cap_ms
    }

    /// Record a fatal-pattern match. A single match does nothing; a second
    /// match within `window_ms` of the first returns `true` (the caller
    /// should then call [`Self::trigger`] with
    /// [`WatchdogTrigger::FatalPattern`]).
    pub fn record_fatal_hit(&mut self, now_ms: u64, window_ms: u64) -> bool {
        self.fatal_hits_ms.retain(|&t| now_ms.saturating_sub(t) <= window_ms);
        self.fatal_hits_ms.push(now_ms);
        self.fatal_hits_ms.len() >= 2
    }

    /// Record one sandbox-denial hit for `(operation, target)` and return
    /// the action the caller should take.
    ///
    /// Counters reset after `reset_window_ms` of inactivity. The `Warn`
    /// action fires on the second hit and `Delay` on the third regardless
    /// of spacing within the active window; only total inactivity resets
    /// the sequence.
    pub fn record_denial(
        &mut self,
        operation: &str,
        target: &str,
        now_ms: u64,
        reset_window_ms: u64,
    ) -> DenialAction {
        let key = DenialKey {
            operation: operation.to_owned(),
            target: target.to_owned(),
        };
        let counter = self.denial_counters.entry(key).or_insert(DenialCounter {
            count: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        });

        if now_ms.saturating_sub(counter.last_seen_ms) > reset_window_ms {
            counter.count = 0;
            counter.first_seen_ms = now_ms;
        }

        counter.count += 1;
        counter.last_seen_ms = now_ms;

        match counter.count {
            1 => DenialAction::Record,
            2 => DenialAction::Warn,
            3 => DenialAction::Delay,
            _ => DenialAction::FailFast,
        }
    }

    /// Set the trigger, if not already set. Returns `true` if this call
    /// actually set it (monotonicity: later calls are no-ops).
    pub fn trigger(&mut self, trigger: WatchdogTrigger) -> bool {
        if self.triggered.is_some() {
            return false;
        }
        self.triggered = Some(trigger);
        true
    }

    /// Whether the watchdog has already fired.
    #[must_use]
    pub const fn is_triggered(&self) -> bool {
        self.triggered.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_elapsed_respects_last_output() {
        let mut state = WatchdogState::new(0);
        state.record_output(1_000);
        assert!(!state.silence_elapsed(1_000 + 899_999, 900_000));
        assert!(state.silence_elapsed(1_000 + 900_000, 900_000));
    }

    #[test]
    fn wall_clock_elapsed_uses_start_time() {
        let state = WatchdogState::new(0);
        assert!(!state.wall_clock_elapsed(7_199_999, 7_200_000));
        assert!(state.wall_clock_elapsed(7_200_000, 7_200_000));
    }

    #[test]
    fn single_fatal_hit_does_not_trigger() {
        let mut state = WatchdogState::new(0);
        assert!(!state.record_fatal_hit(0, 60_000));
    }

    #[test]
    fn second_fatal_hit_within_window_triggers() {
        let mut state = WatchdogState::new(0);
        assert!(!state.record_fatal_hit(0, 60_000));
        assert!(state.record_fatal_hit(30_000, 60_000));
    }

    #[test]
    fn second_fatal_hit_outside_window_does_not_trigger() {
        let mut state = WatchdogState::new(0);
        assert!(!state.record_fatal_hit(0, 60_000));
        assert!(!state.record_fatal_hit(70_000, 60_000));
    }

    #[test]
    fn denial_escalation_sequence() {
        let mut state = WatchdogState::new(0);
        assert_eq!(
            state.record_denial("connect", "host:443", 0, 120_000),
            DenialAction::Record
        );
        assert_eq!(
            state.record_denial("connect", "host:443", 10_000, 120_000),
            DenialAction::Warn
        );
        assert_eq!(
            state.record_denial("connect", "host:443", 20_000, 120_000),
            DenialAction::Delay
        );
        assert_eq!(
            state.record_denial("connect", "host:443", 30_000, 120_000),
            DenialAction::FailFast
        );
    }

    #[test]
    fn denial_counter_resets_after_inactivity() {
        let mut state = WatchdogState::new(0);
        assert_eq!(
            state.record_denial("connect", "host:443", 0, 120_000),
            DenialAction::Record
        );
        assert_eq!(
            state.record_denial("connect", "host:443", 300_000, 120_000),
            DenialAction::Record
        );
    }

    #[test]
    fn distinct_targets_have_independent_counters() {
        let mut state = WatchdogState::new(0);
        assert_eq!(
            state.record_denial("connect", "a:443", 0, 120_000),
            DenialAction::Record
        );
        assert_eq!(
            state.record_denial("connect", "b:443", 0, 120_000),
            DenialAction::Record
        );
    }

    #[test]
    fn trigger_is_monotonic() {
        let mut state = WatchdogState::new(0);
        assert!(state.trigger(WatchdogTrigger::Silence));
        assert!(!state.trigger(WatchdogTrigger::WallClock));
        assert_eq!(state.triggered, Some(WatchdogTrigger::Silence));
    }

    #[test]
    fn cancelled_trigger_is_distinct_from_silence() {
        let mut state = WatchdogState::new(0);
        assert!(state.trigger(WatchdogTrigger::Cancelled));
        assert_eq!(state.triggered, Some(WatchdogTrigger::Cancelled));
        assert_ne!(state.triggered, Some(WatchdogTrigger::Silence));
    }
}
