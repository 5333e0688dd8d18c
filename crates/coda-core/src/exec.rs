//! The sandboxed exec layer (C3, spec §4.3). Turns a parsed shell tool call
//! into an OS process with a working directory, a timeout, streamed
//! stdout/stderr, an abortable signal, and an exit code, behind a pluggable
//! sandbox abstraction.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT_MS: u32 = 10_000;
/// Grace period between SIGTERM and SIGKILL when tearing down a process group.
const KILL_GRACE: Duration = Duration::from_millis(2_000);
/// Conventional "killed by timeout/signal" exit code, mirroring shell's 128+signal.
const TIMEOUT_EXIT_CODE: i32 = 124;
const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone)]
pub struct ExecInput {
    pub cmd: Vec<String>,
    pub workdir: Option<PathBuf>,
    pub timeout_ms: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A chunk of live output, for streaming to the UI as it arrives.
#[derive(Debug, Clone)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// A cancellation handle shared between the agent loop and every tool
/// instance it constructs. Tools are built once and cloned freely (the
/// `Tool` trait requires `Clone`), but cancellation is scoped to a single
/// turn — so the handle wraps its token behind a lock and the agent loop
/// calls [`reset`](CancelHandle::reset) at the start of each turn to swap
/// in a fresh, not-yet-cancelled token before handing out `token()` clones
/// to that turn's tool calls (§4.6 cancellation).
#[derive(Debug, Clone)]
pub struct CancelHandle(std::sync::Arc<parking_lot::Mutex<CancellationToken>>);

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(parking_lot::Mutex::new(
            CancellationToken::new(),
        )))
    }

    /// Cancel whatever turn is currently using this handle.
    pub fn cancel(&self) {
        self.0.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.lock().is_cancelled()
    }

    /// Start a new turn: install a fresh token so a cancellation from a
    /// previous turn can't leak into this one.
    pub fn reset(&self) {
        *self.0.lock() = CancellationToken::new();
    }

    /// A clone of the token currently in effect, for passing into `exec`.
    pub(crate) fn token(&self) -> CancellationToken {
        self.0.lock().clone()
    }
}

/// The sandbox discriminator (§4.3 "Sandbox variants"). Both variants share
/// one call signature; callers select by constructing the matching value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sandbox {
    #[default]
    None,
    MacosSeatbelt,
}

/// A command needs a shell if it's a single full command line, or if any
/// element (tokenized) contains a shell operator (invariant 4).
pub fn requires_shell(cmd: &[String]) -> bool {
    crate::parser::requires_shell(cmd)
}

/// Spawn `input.cmd` under `sandbox`, stream output chunks through
/// `on_output`, and honor `cancel`. Never returns `Err` — OS/spawn failures
/// become a non-zero `exit_code` with the message in `stderr` (§4.3).
pub async fn exec(
    input: ExecInput,
    sandbox: Sandbox,
    cancel: CancellationToken,
    on_output: mpsc::UnboundedSender<OutputChunk>,
) -> ExecResult {
    let workdir = input
        .workdir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let writable_roots = [workdir.clone(), std::env::temp_dir()];

    let mut command = match build_command(&input.cmd, sandbox, &writable_roots) {
        Ok(cmd) => cmd,
        Err(message) => {
            return ExecResult {
                stdout: String::new(),
                stderr: message,
                exit_code: 127,
            };
        }
    };
    command
        .current_dir(&workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecResult {
                stdout: String::new(),
                stderr: format!("failed to spawn command: {e}"),
                exit_code: 127,
            };
        }
    };

    let timeout = Duration::from_millis(input.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS) as u64);
    run_to_completion(&mut child, timeout, cancel, on_output).await
}

fn build_command(
    cmd: &[String],
    sandbox: Sandbox,
    writable_roots: &[PathBuf],
) -> Result<Command, String> {
    if cmd.is_empty() {
        return Err("empty command".to_string());
    }

    let argv: Vec<String> = if requires_shell(cmd) {
        let line = if cmd.len() == 1 {
            cmd[0].clone()
        } else {
            cmd.join(" ")
        };
        vec!["/bin/sh".to_string(), "-c".to_string(), line]
    } else {
        cmd.to_vec()
    };

    match sandbox {
        Sandbox::None => {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]);
            Ok(command)
        }
        Sandbox::MacosSeatbelt => {
            let profile = seatbelt_profile(writable_roots);
            let mut command = Command::new("sandbox-exec");
            command.arg("-p").arg(profile);
            command.args(&argv);
            Ok(command)
        }
    }
}

/// A minimal Seatbelt profile restricting writes to `roots`, permitting
/// everything else. Real deployments would want a far stricter default-deny
/// profile; this mirrors the scope the spec asks for (writes confined to
/// `{cwd, system temp dir}`).
fn seatbelt_profile(roots: &[PathBuf]) -> String {
    let mut profile = String::from("(version 1)\n(allow default)\n(deny file-write*)\n");
    for root in roots {
        profile.push_str(&format!(
            "(allow file-write* (subpath \"{}\"))\n",
            root.display()
        ));
    }
    profile
}

async fn run_to_completion(
    child: &mut Child,
    timeout: Duration,
    cancel: CancellationToken,
    on_output: mpsc::UnboundedSender<OutputChunk>,
) -> ExecResult {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_tx = on_output.clone();
    let stdout_task = tokio::spawn(async move {
        let mut buf = String::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = stdout_tx.send(OutputChunk::Stdout(line.clone()));
            buf.push_str(&line);
            buf.push('\n');
        }
        buf
    });
    let stderr_tx = on_output;
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = stderr_tx.send(OutputChunk::Stderr(line.clone()));
            buf.push_str(&line);
            buf.push('\n');
        }
        buf
    });

    let pid = child.id();

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    let exit_code = match outcome {
        Outcome::Exited(Ok(status)) => status.code().unwrap_or(1),
        Outcome::Exited(Err(e)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            return ExecResult {
                stdout,
                stderr: format!("{stderr}\nwait() failed: {e}"),
                exit_code: 1,
            };
        }
        Outcome::TimedOut => {
            kill_process_group(pid, child).await;
            TIMEOUT_EXIT_CODE
        }
        Outcome::Cancelled => {
            kill_process_group(pid, child).await;
            CANCELLED_EXIT_CODE
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let mut stderr = stderr_task.await.unwrap_or_default();
    if exit_code == TIMEOUT_EXIT_CODE {
        stderr.push_str(&format!(
            "\ncommand timed out after {}ms\n",
            timeout.as_millis()
        ));
    }

    ExecResult {
        stdout,
        stderr,
        exit_code,
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Terminate the whole process group, not just the immediate child
/// (`setsid()` at spawn time makes the child's pid its own group id).
/// SIGTERM first, SIGKILL after a grace period if it's still alive.
#[cfg(unix)]
async fn kill_process_group(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
        tokio::select! {
            _ = child.wait() => return,
            _ = tokio::time::sleep(KILL_GRACE) => {}
        }
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn kill_process_group(_pid: Option<u32>, child: &mut Child) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_a_simple_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = exec(
            ExecInput {
                cmd: vec!["echo".to_string(), "hello".to_string()],
                workdir: None,
                timeout_ms: None,
            },
            Sandbox::None,
            CancellationToken::new(),
            tx,
        )
        .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_without_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = exec(
            ExecInput {
                cmd: vec!["false".to_string()],
                workdir: None,
                timeout_ms: None,
            },
            Sandbox::None,
            CancellationToken::new(),
            tx,
        )
        .await;
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn missing_binary_produces_nonzero_exit_not_panic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = exec(
            ExecInput {
                cmd: vec!["this-binary-does-not-exist-xyz".to_string()],
                workdir: None,
                timeout_ms: None,
            },
            Sandbox::None,
            CancellationToken::new(),
            tx,
        )
        .await;
        assert_ne!(result.exit_code, 0);
        assert!(!result.stderr.is_empty());
    }

    #[tokio::test]
    async fn timeout_kills_long_running_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = exec(
            ExecInput {
                cmd: vec!["sleep".to_string(), "5".to_string()],
                workdir: None,
                timeout_ms: Some(100),
            },
            Sandbox::None,
            CancellationToken::new(),
            tx,
        )
        .await;
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn cancel_terminates_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let result = exec(
            ExecInput {
                cmd: vec!["sleep".to_string(), "5".to_string()],
                workdir: None,
                timeout_ms: None,
            },
            Sandbox::None,
            cancel,
            tx,
        )
        .await;
        assert_eq!(result.exit_code, CANCELLED_EXIT_CODE);
    }

    #[test]
    fn requires_shell_matches_parser() {
        assert!(requires_shell(&["ls -la".to_string()]));
        assert!(!requires_shell(&["ls".to_string(), "-la".to_string()]));
        assert!(requires_shell(&["echo".to_string(), "a|b".to_string()]));
    }
}
