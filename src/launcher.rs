//! The sandbox launcher (§4.4, C4): spawns the agent binary with a
//! redirected HOME/TMP, its own process group, and stdout/stderr tee'd to
//! artifact log files. Uses `tokio::process::Command` rather than a blocking
//! spawn so the watchdog can supervise output and timers on the same event
//! loop.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use voratiq_core::error::RuntimeError;

/// One line of output captured from the child, tagged with the stream it
/// came from and the millisecond timestamp (relative to an arbitrary
/// monotonic epoch) it arrived at. Fed to the watchdog state machine.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    /// Which stream the line came from.
    pub stream: OutputStream,
    /// The line's text, without the trailing newline.
    pub line: String,
    /// Milliseconds since the launcher's monotonic epoch.
    pub at_ms: u64,
}

/// Which stream an [`OutputEvent`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Everything the watchdog and run/review orchestrator need to supervise a
/// launched agent process.
pub struct LaunchedAgent {
    /// The child process handle. Killing it directly only affects the
    /// leader; prefer [`Self::process_group_id`] with `nix` signals to
    /// reach the whole group.
    pub child: Child,
    /// The process group id the child (and any descendants) run under.
    /// Equal to the child's pid when group creation succeeds.
    pub process_group_id: i32,
    /// Monotonic instant the process was spawned at, the watchdog's epoch.
    pub spawned_at: std::time::Instant,
    /// Receives one [`OutputEvent`] per line of stdout/stderr, in arrival
    /// order across both streams. Closes when both streams reach EOF.
    pub output_rx: mpsc::UnboundedReceiver<OutputEvent>,
}

/// Everything needed to spawn one agent invocation.
pub struct LaunchRequest<'a> {
    /// Absolute path to the agent binary.
    pub binary: &'a Path,
    /// Fully resolved argv (model substituted, extra args appended).
    pub argv: &'a [String],
    /// The agent's workspace directory; becomes the child's cwd.
    pub cwd: &'a Path,
    /// Auth staging's environment overrides, layered over a minimal base
    /// environment (`PATH` only).
    pub env_overrides: &'a BTreeMap<String, String>,
    /// Where captured stdout is tee'd, e.g. `artifacts/stdout.log`.
    pub stdout_log: &'a Path,
    /// Where captured stderr is tee'd, e.g. `artifacts/stderr.log`.
    pub stderr_log: &'a Path,
}

/// Reject hosts voratiq cannot sandbox-launch on. Process groups require
/// POSIX `setsid`; Windows is not supported (§9 — "fall back ... with a
/// documented loss of guarantee" does not apply here since voratiq has no
/// Windows launch path at all yet).
///
/// # Errors
/// Returns [`RuntimeError::PlatformUnsupported`] on non-Unix hosts.
pub fn platform_precheck() -> Result<(), RuntimeError> {
    if cfg!(unix) {
        Ok(())
    } else {
        Err(RuntimeError::PlatformUnsupported {
            detail: "sandboxed agent launch requires a POSIX host (setsid/process groups)"
                .to_owned(),
        })
    }
}

/// Resolve the platform sandboxing wrapper command, if one is configured.
///
/// `VORATIQ_SANDBOX_RUNNER` names a wrapper binary that is prepended to the
/// agent's own argv (e.g. a seccomp/landlock/sandbox-exec shim); unset falls
/// back to direct execution of the agent binary.
#[must_use]
pub fn resolve_runner() -> Option<PathBuf> {
    std::env::var_os("VORATIQ_SANDBOX_RUNNER").map(PathBuf::from)
}

/// Spawn `request` in its own process group, piping stdout/stderr through
/// tee tasks that persist each line to its artifact log and forward an
/// [`OutputEvent`] for the watchdog.
///
/// # Errors
/// Returns [`RuntimeError::SandboxStagingFailed`] if the log files cannot be
/// opened, or a spawn failure wrapped the same way.
pub async fn launch(request: &LaunchRequest<'_>) -> Result<LaunchedAgent, RuntimeError> {
    platform_precheck()?;

    let runner = resolve_runner();
    let (program, mut full_argv) = runner.map_or_else(
        || (request.binary.to_owned(), Vec::new()),
        |runner_path| (runner_path, vec![request.binary.to_string_lossy().into_owned()]),
    );
    full_argv.extend(request.argv.iter().cloned());

    let mut command = Command::new(&program);
    command
        .args(&full_argv)
        .current_dir(request.cwd)
        .env_clear()
        .env("PATH", std::env::var_os("PATH").unwrap_or_default())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in request.env_overrides {
        command.env(key, value);
    }
    new_process_group(&mut command);

    let spawned_at = std::time::Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| RuntimeError::SandboxStagingFailed {
            agent_id: String::new(),
            detail: format!("failed to spawn {}: {e}", program.display()),
        })?;

    let process_group_id = process_group_id_of(&child);

    let stdout = child
        .stdout
        .take()
        .expect("stdout was configured as piped");
    let stderr = child
        .stderr
        .take()
        .expect("stderr was configured as piped");

    let (tx, output_rx) = mpsc::unbounded_channel();

    let stdout_log = request.stdout_log.to_owned();
    let stderr_log = request.stderr_log.to_owned();
    let stdout_tx = tx.clone();
    let stderr_tx = tx;

    tokio::spawn(tee_stream(stdout, stdout_log, OutputStream::Stdout, spawned_at, stdout_tx));
    tokio::spawn(tee_stream(stderr, stderr_log, OutputStream::Stderr, spawned_at, stderr_tx));

    Ok(LaunchedAgent {
        child,
        process_group_id,
        spawned_at,
        output_rx,
    })
}

async fn tee_stream(
    reader: impl tokio::io::AsyncRead + Unpin,
    log_path: PathBuf,
    stream: OutputStream,
    spawned_at: std::time::Instant,
    tx: mpsc::UnboundedSender<OutputEvent>,
) {
    let Ok(mut log_file) = tokio::fs::File::create(&log_path).await else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = log_file.write_all(line.as_bytes()).await;
                let _ = log_file.write_all(b"\n").await;
                let _ = log_file.flush().await;
                let event = OutputEvent {
                    stream,
                    line,
                    at_ms: u64::try_from(spawned_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

#[cfg(unix)]
fn new_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt as _;
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn new_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn process_group_id_of(child: &Child) -> i32 {
    child.id().map_or(0, |pid| i32::try_from(pid).unwrap_or(0))
}

#[cfg(not(unix))]
fn process_group_id_of(_child: &Child) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_captures_stdout_and_exits_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let stdout_log = tmp.path().join("stdout.log");
        let stderr_log = tmp.path().join("stderr.log");
        let request = LaunchRequest {
            binary: Path::new("/bin/echo"),
            argv: &["hello".to_owned(), "world".to_owned()],
            cwd: tmp.path(),
            env_overrides: &BTreeMap::new(),
            stdout_log: &stdout_log,
            stderr_log: &stderr_log,
        };
        let mut launched = launch(&request).await.unwrap();
        let status = launched.child.wait().await.unwrap();
        assert!(status.success());

        let mut lines = Vec::new();
        while let Some(event) = launched.output_rx.recv().await {
            lines.push(event.line);
        }
        assert_eq!(lines, vec!["hello world".to_owned()]);
        assert_eq!(tokio::fs::read_to_string(&stdout_log).await.unwrap(), "hello world\n");
    }

    #[test]
    fn resolve_runner_reads_env_override() {
        // SAFETY: test-only env mutation, single-threaded test body.
        unsafe {
            std::env::set_var("VORATIQ_SANDBOX_RUNNER", "/usr/bin/sandbox-exec");
        }
        assert_eq!(resolve_runner(), Some(PathBuf::from("/usr/bin/sandbox-exec")));
        unsafe {
            std::env::remove_var("VORATIQ_SANDBOX_RUNNER");
        }
    }
}
