//! The watchdog's live timers (§4.5, C5): drives a
//! [`voratiq_core::watchdog::WatchdogState`] from real wall-clock timers and
//! the launcher's output stream, and escalates `SIGTERM`→`SIGKILL`→hard-abort
//! on the process group via `nix::sys::signal`. The state machine itself
//! (triggers, denial escalation, monotonicity) lives in `voratiq-core`; this
//! module owns only the side effects.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::CancellationToken;

use voratiq_core::error::ProcessError;
use voratiq_core::watchdog::{DenialAction, WatchdogState, WatchdogTrigger};

use crate::launcher::{LaunchedAgent, OutputStream};

/// The tunables the watchdog enforces, drawn from `sandbox.yaml` (§4.5).
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Silence timeout in milliseconds (default 15 min).
    pub silence_timeout_ms: u64,
    /// Wall-clock cap in milliseconds (default 120 min).
    pub wall_clock_cap_ms: u64,
    /// Fatal-pattern retry window in milliseconds (default 60 s).
    pub fatal_pattern_window_ms: u64,
    /// Sandbox-denial counter reset window in milliseconds (default 120 s).
    pub denial_reset_window_ms: u64,
    /// `SIGSTOP`→`SIGCONT` delay on the third denial hit, in milliseconds.
    pub denial_stop_delay_ms: u64,
    /// Grace period between `SIGTERM` and `SIGKILL`, in milliseconds.
    pub term_grace_ms: u64,
    /// Grace period between `SIGKILL` and hard-abort, in milliseconds.
    pub hard_abort_ms: u64,
    /// Case-insensitive substrings that trigger the fatal-pattern watchdog
    /// for this agent's vendor.
    pub fatal_patterns: Vec<String>,
}

impl WatchdogConfig {
    /// Build a [`WatchdogConfig`] from the on-disk `sandbox.yaml` schema for
    /// one agent's vendor. `denial_warn_window_seconds` is part of the
    /// persisted schema but has no independent timer in the state machine
    /// (the warn/delay/fail-fast escalation is purely count-based, per
    /// [`WatchdogState::record_denial`]), so it is not carried over here.
    #[must_use]
    pub fn from_sandbox_config(
        config: &voratiq_core::config::SandboxConfig,
        provider: voratiq_core::model::VendorProvider,
    ) -> Self {
        Self {
            silence_timeout_ms: config.silence_timeout_seconds * 1_000,
            wall_clock_cap_ms: config.wall_clock_cap_seconds * 1_000,
            fatal_pattern_window_ms: config.fatal_pattern_window_seconds * 1_000,
            denial_reset_window_ms: config.denial_reset_window_seconds * 1_000,
            denial_stop_delay_ms: config.denial_stop_delay_ms,
            term_grace_ms: config.term_grace_seconds * 1_000,
            hard_abort_ms: config.hard_abort_seconds * 1_000,
            fatal_patterns: config.fatal_patterns.get(&provider).cloned().unwrap_or_default(),
        }
    }
}

/// How a supervised process ended.
#[derive(Debug)]
pub enum WatchdogOutcome {
    /// The child exited on its own before any trigger fired.
    ChildExited(std::process::ExitStatus),
    /// The watchdog fired and terminated the process group.
    Triggered {
        /// Which condition fired.
        trigger: WatchdogTrigger,
        /// Operator-facing reason, also written to the stderr banner.
        reason: String,
    },
}

/// Supervise `launched` until it exits or a watchdog condition fires.
///
/// # Errors
/// Returns [`ProcessError::HardAbortTimeout`] if the process does not exit
/// within the hard-abort grace period after `SIGKILL`.
pub async fn supervise(
    launched: &mut LaunchedAgent,
    config: &WatchdogConfig,
    agent_id: &str,
    stderr_log: &Path,
    cancel: &CancellationToken,
) -> Result<WatchdogOutcome, ProcessError> {
    let mut state = WatchdogState::new(0);
    let silence_timeout = Duration::from_millis(config.silence_timeout_ms);
    let wall_clock_cap = Duration::from_millis(config.wall_clock_cap_ms);

    loop {
        let now = now_ms(launched);
        let since_output = now.saturating_sub(state.last_output_at_ms);
        let since_start = now.saturating_sub(state.started_at_ms);
        let silence_remaining =
            silence_timeout.saturating_sub(Duration::from_millis(since_output));
        let wall_clock_remaining =
            wall_clock_cap.saturating_sub(Duration::from_millis(since_start));

        tokio::select! {
            status = launched.child.wait() => {
                return status.map(WatchdogOutcome::ChildExited).map_err(|e| {
                    tracing::warn!(error = %e, agent_id, "failed to wait on child process");
                    ProcessError::NonZeroExit { agent_id: agent_id.to_owned(), code: None }
                });
            }
            () = tokio::time::sleep(silence_remaining) => {
                let now_ms = now_ms(launched);
                if state.silence_elapsed(now_ms, config.silence_timeout_ms) {
                    state.trigger(WatchdogTrigger::Silence);
                    return escalate(launched, &state, config, agent_id, stderr_log,
                        "no output for the configured silence timeout").await;
                }
            }
            () = tokio::time::sleep(wall_clock_remaining) => {
                let now_ms = now_ms(launched);
                if state.wall_clock_elapsed(now_ms, config.wall_clock_cap_ms) {
                    state.trigger(WatchdogTrigger::WallClock);
                    return escalate(launched, &state, config, agent_id, stderr_log,
                        "wall-clock cap exceeded").await;
                }
            }
            event = launched.output_rx.recv() => {
                let Some(event) = event else { continue };
                let now_ms = event.at_ms;
                state.record_output(now_ms);

                if config.fatal_patterns.iter().any(|p| event.line.to_lowercase().contains(&p.to_lowercase()))
                    && state.record_fatal_hit(now_ms, config.fatal_pattern_window_ms)
                {
                    state.trigger(WatchdogTrigger::FatalPattern);
                    return escalate(launched, &state, config, agent_id, stderr_log,
                        "fatal pattern matched twice within the retry window").await;
                }

                if event.stream == OutputStream::Stderr
                    && let Some((operation, target)) = parse_sandbox_denial(&event.line)
                {
                    match state.record_denial(&operation, &target, now_ms, config.denial_reset_window_ms) {
                        DenialAction::Record => {}
                        DenialAction::Warn => {
                            write_banner(stderr_log, &format!("SandboxBackoff: WARN {operation} {target}")).await;
                        }
                        DenialAction::Delay => {
                            write_banner(stderr_log, &format!("SandboxBackoff: ERROR {operation} {target}")).await;
                            stop_and_resume(launched.process_group_id, config.denial_stop_delay_ms).await;
                        }
                        DenialAction::FailFast => {
                            state.trigger(WatchdogTrigger::SandboxDenial);
                            return escalate(launched, &state, config, agent_id, stderr_log,
                                &format!("sandbox denial backoff exhausted for {operation} {target}")).await;
                        }
                    }
                }
            }
            () = cancel.cancelled() => {
                state.trigger(WatchdogTrigger::Cancelled);
                return escalate(launched, &state, config, agent_id, stderr_log,
                    "external termination requested").await;
            }
        }
    }
}

fn now_ms(launched: &LaunchedAgent) -> u64 {
    u64::try_from(launched.spawned_at.elapsed().as_millis()).unwrap_or(u64::MAX)
}

async fn write_banner(stderr_log: &Path, line: &str) {
    if let Ok(mut file) = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(stderr_log)
        .await
    {
        let _ = file.write_all(line.as_bytes()).await;
        let _ = file.write_all(b"\n").await;
    }
}

async fn stop_and_resume(process_group_id: i32, delay_ms: u64) {
    let _ = signal::kill(Pid::from_raw(-process_group_id), Signal::SIGSTOP);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    let _ = signal::kill(Pid::from_raw(-process_group_id), Signal::SIGCONT);
}

async fn escalate(
    launched: &mut LaunchedAgent,
    state: &WatchdogState,
    config: &WatchdogConfig,
    agent_id: &str,
    stderr_log: &Path,
    reason: &str,
) -> Result<WatchdogOutcome, ProcessError> {
    let Some(trigger) = state.triggered else {
        unreachable!("escalate is only called after state.trigger() returns");
    };
    write_banner(stderr_log, &format!("[WATCHDOG: {}] {reason}", trigger_name(trigger))).await;

    let _ = signal::kill(Pid::from_raw(-launched.process_group_id), Signal::SIGTERM);
    if tokio::time::timeout(Duration::from_millis(config.term_grace_ms), launched.child.wait())
        .await
        .is_ok()
    {
        return Ok(WatchdogOutcome::Triggered {
            trigger,
            reason: reason.to_owned(),
        });
    }

    let _ = signal::kill(Pid::from_raw(-launched.process_group_id), Signal::SIGKILL);
    if tokio::time::timeout(Duration::from_millis(config.hard_abort_ms), launched.child.wait())
        .await
        .is_ok()
    {
        return Ok(WatchdogOutcome::Triggered {
            trigger,
            reason: reason.to_owned(),
        });
    }

    Err(ProcessError::HardAbortTimeout {
        agent_id: agent_id.to_owned(),
    })
}

const fn trigger_name(trigger: WatchdogTrigger) -> &'static str {
    match trigger {
        WatchdogTrigger::Silence => "SILENCE",
        WatchdogTrigger::WallClock => "WALL_CLOCK",
        WatchdogTrigger::FatalPattern => "FATAL_PATTERN",
        WatchdogTrigger::SandboxDenial => "SANDBOX_DENIAL",
        WatchdogTrigger::Cancelled => "CANCELLED",
    }
}

/// Parse a `[SandboxDebug] ... denied ... <host>:<port>` stderr line into
/// `(operation, target)`. Recognizes the two phrasings observed in vendor
/// CLI output: a config-rule denial (`"Denied by config rule: <target>"`,
/// operation implied as `connect`) and an explicit-operation denial
/// (`"<operation> denied: <target>"`).
#[must_use]
pub fn parse_sandbox_denial(line: &str) -> Option<(String, String)> {
    let marker = "[SandboxDebug]";
    let rest = line.strip_prefix(marker)?.trim();

    if let Some(target) = rest
        .strip_prefix("Denied by config rule:")
        .map(str::trim)
    {
        return Some(("connect".to_owned(), target.to_owned()));
    }

    let lower = rest.to_lowercase();
    let denied_at = lower.find("denied")?;
    let operation = rest[..denied_at].trim();
    let after_denied = &rest[denied_at + "denied".len()..];
    let target = after_denied.trim_start_matches([':', ' ']).trim();
    if operation.is_empty() || target.is_empty() {
        return None;
    }
    Some((operation.to_owned(), target.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_rule_denial() {
        let (op, target) =
            parse_sandbox_denial("[SandboxDebug] Denied by config rule: registry.npmjs.org:443")
                .unwrap();
        assert_eq!(op, "connect");
        assert_eq!(target, "registry.npmjs.org:443");
    }

    #[test]
    fn parses_explicit_operation_denial() {
        let (op, target) =
            parse_sandbox_denial("[SandboxDebug] connect denied: 10.0.0.1:8080").unwrap();
        assert_eq!(op, "connect");
        assert_eq!(target, "10.0.0.1:8080");
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert!(parse_sandbox_denial("hello world").is_none());
        assert!(parse_sandbox_denial("[SandboxDebug] starting up").is_none());
    }

    #[test]
    fn cancellation_is_labeled_distinctly_from_silence() {
        assert_eq!(trigger_name(WatchdogTrigger::Cancelled), "CANCELLED");
        assert_ne!(trigger_name(WatchdogTrigger::Cancelled), trigger_name(WatchdogTrigger::Silence));
    }
}
