//! Single bounded command execution on an open connection.

use super::connection::RemoteConnection;
use serde::{Deserialize, Serialize};
use ssh2::{Channel, Session as Ssh2Session, Stream};
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

/// Grace period for the remote side to acknowledge a channel close after a timeout
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Why a command did not finish cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandError {
    NonZeroExit { code: i32 },
    TimedOut { after_ms: u64 },
    Failed { message: String },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::NonZeroExit { code } => write!(f, "process exited with status {}", code),
            CommandError::TimedOut { after_ms } => write!(f, "command timed out after {}ms", after_ms),
            CommandError::Failed { message } => write!(f, "command failed: {}", message),
        }
    }
}

/// Captured result of one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub error: Option<CommandError>,
    pub elapsed_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.error, Some(CommandError::TimedOut { .. }))
    }
}

/// How the remote invocation ended
#[derive(Debug)]
pub(crate) enum Completion {
    Exited(i32),
    /// Killed by a signal, no exit status was reported
    Signaled(String),
    TimedOut(Duration),
    Failed(String),
}

pub(crate) fn build_output(
    stdout: &[u8],
    stderr: &[u8],
    completion: Completion,
    elapsed: Duration,
) -> CommandOutput {
    let (exit_code, error) = match completion {
        Completion::Exited(0) => (Some(0), None),
        Completion::Exited(code) => (Some(code), Some(CommandError::NonZeroExit { code })),
        Completion::Signaled(signal) => (
            None,
            Some(CommandError::Failed {
                message: format!("process killed by signal {}", signal),
            }),
        ),
        Completion::TimedOut(after) => (
            None,
            Some(CommandError::TimedOut {
                after_ms: after.as_millis() as u64,
            }),
        ),
        Completion::Failed(message) => (Some(-1), Some(CommandError::Failed { message })),
    };

    CommandOutput {
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
        exit_code,
        error,
        elapsed_ms: elapsed.as_millis() as u64,
    }
}

/// An exit-signal takes precedence: servers report status 0 when none was sent.
pub(crate) fn exit_completion(signal: Option<String>, status: Result<i32, ssh2::Error>) -> Completion {
    match (signal, status) {
        (Some(signal), _) => Completion::Signaled(signal),
        (None, Ok(code)) => Completion::Exited(code),
        (None, Err(e)) => Completion::Failed(format!("No exit status: {}", e)),
    }
}

/// A started remote command, read without blocking
pub(crate) trait ExecChannel {
    /// `WouldBlock` when nothing is pending
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn is_eof(&self) -> bool;
    /// Close the channel within a short grace period
    fn abort(&mut self);
    /// Wait for the close and report how the command ended
    fn finish(&mut self) -> Completion;
}

struct SshExec<'a> {
    session: &'a Ssh2Session,
    channel: Channel,
    stderr: Stream,
}

impl ExecChannel for SshExec<'_> {
    fn read_stdout(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stderr.read(buf)
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn abort(&mut self) {
        self.session.set_blocking(true);
        self.session.set_timeout(CLOSE_GRACE.as_millis() as u32);
        let _ = self.channel.close();
        let _ = self.channel.wait_close();
        self.session.set_timeout(0);
    }

    fn finish(&mut self) -> Completion {
        self.session.set_blocking(true);
        if let Err(e) = self.channel.wait_close() {
            return Completion::Failed(format!("No exit status: {}", e));
        }
        let signal = self.channel.exit_signal().ok().and_then(|s| s.exit_signal);
        exit_completion(signal, self.channel.exit_status())
    }
}

/// Run `command` on `session`. A zero timeout waits indefinitely.
pub(crate) fn execute_blocking(session: &Ssh2Session, command: &str, timeout: Duration) -> CommandOutput {
    let started = Instant::now();

    session.set_blocking(true);
    let mut channel = match session.channel_session() {
        Ok(channel) => channel,
        Err(e) => {
            return build_output(
                &[],
                &[],
                Completion::Failed(format!("Failed to open channel: {}", e)),
                started.elapsed(),
            )
        }
    };
    if let Err(e) = channel.exec(command) {
        let _ = channel.close();
        return build_output(
            &[],
            &[],
            Completion::Failed(format!("Failed to start command: {}", e)),
            started.elapsed(),
        );
    }

    session.set_blocking(false);
    let stderr = channel.stderr();
    let mut exec = SshExec {
        session,
        channel,
        stderr,
    };
    run_exec(&mut exec, timeout, started)
}

/// Drain a started command until EOF or the deadline.
pub(crate) fn run_exec(channel: &mut dyn ExecChannel, timeout: Duration, started: Instant) -> CommandOutput {
    let deadline = (!timeout.is_zero()).then(|| started + timeout);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let mut progressed = false;

        match channel.read_stdout(&mut buf) {
            Ok(n) if n > 0 => {
                stdout.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                channel.abort();
                return build_output(
                    &stdout,
                    &stderr,
                    Completion::Failed(format!("stdout read failed: {}", e)),
                    started.elapsed(),
                );
            }
        }

        match channel.read_stderr(&mut buf) {
            Ok(n) if n > 0 => {
                stderr.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                channel.abort();
                return build_output(
                    &stdout,
                    &stderr,
                    Completion::Failed(format!("stderr read failed: {}", e)),
                    started.elapsed(),
                );
            }
        }

        if channel.is_eof() && !progressed {
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            // Tear the remote invocation down; the connection itself stays usable
            channel.abort();
            tracing::warn!("Command timed out after {:?}", timeout);
            return build_output(&stdout, &stderr, Completion::TimedOut(timeout), started.elapsed());
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    let completion = channel.finish();
    build_output(&stdout, &stderr, completion, started.elapsed())
}

/// Execute one command on an open connection with a deadline.
///
/// `timeout` of zero means no deadline; the caller is then responsible for
/// cancelling through its own means.
pub async fn execute_command(
    connection: &RemoteConnection,
    command: &str,
    timeout: Duration,
) -> CommandOutput {
    let session = connection.session().clone();
    let command = command.to_string();
    let host_id = connection.host_id().to_string();

    tracing::debug!("Executing command on host {}", host_id);
    match tokio::task::spawn_blocking(move || execute_blocking(&session, &command, timeout)).await {
        Ok(output) => output,
        Err(e) => build_output(
            &[],
            &[],
            Completion::Failed(format!("Execution task failed: {}", e)),
            Duration::ZERO,
        ),
    }
}
