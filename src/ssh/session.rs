//! Interactive shell sessions.
//!
//! Each `Session` owns one remote shell running on a pty. A dedicated blocking
//! worker drives the SSH channel in non-blocking mode: it applies writes and
//! resizes in call order, and forwards output and error bytes into bounded
//! channels that `read` and `read_error` poll with a timeout. Cancelling the
//! session's token stops the worker, whose release guard then closes the input
//! stream, the remote shell and the connection, in that order.

use super::connection::{connect_blocking, ConnectParams, RemoteConnection};
use crate::config::SessionSettings;
use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use ssh2::{Channel, PtyModeOpcode, PtyModes, Session as Ssh2Session, Stream};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const READ_BUF_BYTES: usize = 32 * 1024;
const IDLE_POLL: Duration = Duration::from_millis(2);
const COMMAND_QUEUE: usize = 1024;
/// Commands applied per worker iteration before output gets a turn
const COMMAND_BURST: usize = 32;
const TERMINAL_BAUD: u32 = 14_400;
/// Upper bound for a blocking control request such as a window change
const CONTROL_REQUEST_TIMEOUT_MS: u32 = 2_000;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub rows: u32,
    pub cols: u32,
}

impl PtySize {
    pub fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Result of a polling read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing arrived before the timeout. Not an error.
    NoData,
    Eof,
}

/// Blocking access to a running remote shell.
///
/// Reads must not block: they return `ErrorKind::WouldBlock` when nothing is
/// pending.
pub trait ShellTransport: Send {
    fn read_output(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn read_error(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_input(&mut self, data: &[u8]) -> std::io::Result<usize>;
    fn resize(&mut self, size: PtySize) -> EngineResult<()>;
    fn is_eof(&self) -> bool;
    fn close_input(&mut self);
    fn close_shell(&mut self);
    fn disconnect(&mut self);
}

/// Opens remote shells. Blocking; callers run it off the async runtime.
pub trait ShellConnector: Send + Sync {
    fn open_shell(&self, params: &ConnectParams, size: PtySize) -> EngineResult<Box<dyn ShellTransport>>;
}

/// `ShellConnector` over ssh2
#[derive(Debug, Clone)]
pub struct SshConnector {
    terminal_type: String,
}

impl SshConnector {
    pub fn new(terminal_type: impl Into<String>) -> Self {
        Self {
            terminal_type: terminal_type.into(),
        }
    }

    fn pty_modes() -> PtyModes {
        let mut modes = PtyModes::new();
        modes.set_boolean(PtyModeOpcode::ECHO, true);
        modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, TERMINAL_BAUD);
        modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, TERMINAL_BAUD);
        modes
    }

    /// Open a pty channel and start a shell on it, falling back to a login shell via exec.
    fn open_interactive_channel(&self, connection: &RemoteConnection, size: PtySize) -> EngineResult<Channel> {
        let session = connection.session();
        let open_channel = |label: &str| -> EngineResult<Channel> {
            tracing::debug!("Opening channel [{}] (host {})", label, connection.host_id());
            let mut ch = session
                .channel_session()
                .map_err(|e| EngineError::Ssh(format!("Failed to open channel [{}]: {}", label, e)))?;
            ch.request_pty(
                &self.terminal_type,
                Some(Self::pty_modes()),
                Some((size.cols, size.rows, 0, 0)),
            )
            .map_err(|e| EngineError::Ssh(format!("Failed to request PTY [{}]: {}", label, e)))?;
            Ok(ch)
        };

        let mut ch = open_channel("primary")?;
        match ch.shell() {
            Ok(()) => return Ok(ch),
            Err(e) => {
                tracing::debug!("Shell request refused (host {}): {}", connection.host_id(), e);
                let _ = ch.close();
            }
        }

        for cmd in ["/bin/bash -l", "/bin/sh -l"] {
            let mut ch = open_channel("fallback_exec")?;
            match ch.exec(cmd) {
                Ok(()) => {
                    tracing::debug!("Exec shell started with '{}' (host {})", cmd, connection.host_id());
                    return Ok(ch);
                }
                Err(_) => {
                    let _ = ch.close();
                }
            }
        }

        Err(EngineError::Ssh("Failed to start interactive shell".to_string()))
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new("xterm-256color")
    }
}

impl ShellConnector for SshConnector {
    fn open_shell(&self, params: &ConnectParams, size: PtySize) -> EngineResult<Box<dyn ShellTransport>> {
        let connection = connect_blocking(params)?;
        let channel = match self.open_interactive_channel(&connection, size) {
            Ok(channel) => channel,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };
        let stderr = channel.stderr();
        connection.session().set_blocking(false);

        Ok(Box::new(SshShell {
            connection: Some(connection),
            channel,
            stderr,
        }))
    }
}

struct SshShell {
    connection: Option<RemoteConnection>,
    channel: Channel,
    stderr: Stream,
}

impl SshShell {
    fn set_blocking(&self, blocking: bool) {
        if let Some(connection) = &self.connection {
            connection.session().set_blocking(blocking);
        }
    }
}

/// Run one blocking request under a deadline, then go back to non-blocking polling
fn bounded_request<T>(session: &Ssh2Session, request: impl FnOnce() -> T) -> T {
    session.set_blocking(true);
    session.set_timeout(CONTROL_REQUEST_TIMEOUT_MS);
    let result = request();
    session.set_timeout(0);
    session.set_blocking(false);
    result
}

impl ShellTransport for SshShell {
    fn read_output(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.channel.read(buf)
    }

    fn read_error(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stderr.read(buf)
    }

    fn write_input(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.channel.write(data)
    }

    fn resize(&mut self, size: PtySize) -> EngineResult<()> {
        let channel = &mut self.channel;
        let result = match &self.connection {
            Some(connection) => bounded_request(connection.session(), || {
                channel.request_pty_size(size.cols, size.rows, None, None)
            }),
            None => channel.request_pty_size(size.cols, size.rows, None, None),
        };
        result.map_err(|e| EngineError::Ssh(format!("Failed to resize PTY: {}", e)))
    }

    fn is_eof(&self) -> bool {
        self.channel.eof()
    }

    fn close_input(&mut self) {
        if let Some(connection) = &self.connection {
            connection.session().set_blocking(true);
            connection.session().set_timeout(2_000);
        }
        let _ = self.channel.send_eof();
    }

    fn close_shell(&mut self) {
        let _ = self.channel.close();
        let _ = self.channel.wait_close();
    }

    fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

static LAST_ID_NANOS: AtomicI64 = AtomicI64::new(0);

/// `<host-id>-<nanosecond timestamp>`, strictly increasing within the process.
pub fn next_session_id(host_id: &str) -> String {
    let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut last = LAST_ID_NANOS.load(Ordering::SeqCst);
    loop {
        let candidate = now.max(last + 1);
        match LAST_ID_NANOS.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return format!("{}-{}", host_id, candidate),
            Err(actual) => last = actual,
        }
    }
}

/// Session info for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub host_id: String,
    pub rows: u32,
    pub cols: u32,
    pub created_at: i64,
    pub idle_secs: u64,
    pub closed: bool,
}

enum SessionCommand {
    Write(Vec<u8>, oneshot::Sender<EngineResult<usize>>),
    Resize(PtySize, oneshot::Sender<EngineResult<()>>),
}

/// A live interactive shell
pub struct Session {
    id: String,
    host_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    last_activity: RwLock<Instant>,
    size: RwLock<PtySize>,
    commands: mpsc::Sender<SessionCommand>,
    output: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    errors: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    cancel: CancellationToken,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect, allocate a pty and start the session worker.
    pub async fn open(
        connector: Arc<dyn ShellConnector>,
        params: &ConnectParams,
        size: PtySize,
        settings: &SessionSettings,
    ) -> EngineResult<Session> {
        let host_id = params.host_id.clone();
        let open_params = params.clone();
        let transport = tokio::task::spawn_blocking(move || connector.open_shell(&open_params, size))
            .await?
            .map_err(|e| e.context(host_id.clone(), "open session"))?;

        Ok(Self::start(next_session_id(&host_id), host_id, transport, size, settings))
    }

    /// Wrap an already running shell. Must be called inside a tokio runtime.
    pub fn start(
        id: String,
        host_id: String,
        transport: Box<dyn ShellTransport>,
        size: PtySize,
        settings: &SessionSettings,
    ) -> Session {
        let buffer = settings.output_buffer.max(1);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (output_tx, output_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();

        let worker = Worker {
            guard: ReleaseGuard {
                session_id: id.clone(),
                transport,
            },
            commands: command_rx,
            output: output_tx,
            errors: error_tx,
            cancel: cancel.clone(),
            write_timeout: settings.write_timeout(),
        };
        let handle = tokio::task::spawn_blocking(move || worker.run());

        tracing::info!("Session {} started (host {})", id, host_id);

        Session {
            id,
            host_id,
            created_at: chrono::Utc::now(),
            last_activity: RwLock::new(Instant::now()),
            size: RwLock::new(size),
            commands: command_tx,
            output: AsyncMutex::new(output_rx),
            errors: AsyncMutex::new(error_rx),
            cancel,
            worker: AsyncMutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub fn size(&self) -> PtySize {
        *self.size.read()
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the session shuts down
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            id: self.id.clone(),
            host_id: self.host_id.clone(),
            rows: size.rows,
            cols: size.cols,
            created_at: self.created_at.timestamp(),
            idle_secs: self.idle_for(Instant::now()).as_secs(),
            closed: self.is_closed(),
        }
    }

    fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Forward bytes to the shell. Returns how many bytes the channel accepted,
    /// which may be fewer than `data.len()`.
    pub async fn write(&self, data: &[u8]) -> EngineResult<usize> {
        self.touch();
        if self.is_closed() {
            return Err(EngineError::SessionClosed(self.id.clone()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Write(data.to_vec(), reply_tx))
            .await
            .map_err(|_| EngineError::SessionClosed(self.id.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::SessionClosed(self.id.clone()))?
    }

    /// Wait up to `timeout` for terminal output.
    pub async fn read(&self, timeout: Duration) -> ReadOutcome {
        let mut rx = self.output.lock().await;
        let outcome = recv_with_timeout(&mut rx, timeout, &self.cancel).await;
        if matches!(outcome, ReadOutcome::Data(_)) {
            self.touch();
        }
        outcome
    }

    /// Wait up to `timeout` for bytes on the error stream.
    pub async fn read_error(&self, timeout: Duration) -> ReadOutcome {
        let mut rx = self.errors.lock().await;
        recv_with_timeout(&mut rx, timeout, &self.cancel).await
    }

    /// Store new dimensions and tell the remote side. The stored size is
    /// updated even when the request cannot be delivered.
    pub async fn resize(&self, rows: u32, cols: u32) -> EngineResult<()> {
        if rows == 0 || cols == 0 {
            return Err(EngineError::Protocol(format!(
                "Invalid terminal size {}x{}",
                rows, cols
            )));
        }
        let size = PtySize::new(rows, cols);
        *self.size.write() = size;
        self.touch();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Resize(size, reply_tx))
            .await
            .map_err(|_| EngineError::SessionClosed(self.id.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::SessionClosed(self.id.clone()))?
    }

    /// Cancel the session and wait until its resources are released. Idempotent.
    pub async fn close(&self) {
        let mut worker = self.worker.lock().await;
        self.cancel.cancel();
        if let Some(handle) = worker.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Session {} worker ended abnormally: {}", self.id, e);
            }
            tracing::info!("Session {} closed", self.id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Worker notices and runs its release guard
        self.cancel.cancel();
    }
}

async fn recv_with_timeout(
    rx: &mut mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ReadOutcome {
    if let Ok(data) = rx.try_recv() {
        return ReadOutcome::Data(data);
    }

    tokio::select! {
        received = tokio::time::timeout(timeout, rx.recv()) => match received {
            Ok(Some(data)) => ReadOutcome::Data(data),
            Ok(None) => ReadOutcome::Eof,
            Err(_) => ReadOutcome::NoData,
        },
        _ = cancel.cancelled() => match rx.try_recv() {
            Ok(data) => ReadOutcome::Data(data),
            Err(_) => ReadOutcome::Eof,
        },
    }
}

/// Owns the transport; dropping it releases input, shell and connection in order.
struct ReleaseGuard {
    session_id: String,
    transport: Box<dyn ShellTransport>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.transport.close_input();
        self.transport.close_shell();
        self.transport.disconnect();
        tracing::debug!("Session {} resources released", self.session_id);
    }
}

struct Worker {
    guard: ReleaseGuard,
    commands: mpsc::Receiver<SessionCommand>,
    output: mpsc::Sender<Vec<u8>>,
    errors: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    write_timeout: Duration,
}

enum Pump {
    Progressed,
    Idle,
    Failed,
}

impl Worker {
    fn run(mut self) {
        let id = self.guard.session_id.clone();
        let mut buf = vec![0u8; READ_BUF_BYTES];
        let mut pending_output: Option<Vec<u8>> = None;
        let mut pending_error: Option<Vec<u8>> = None;

        'io: loop {
            if self.cancel.is_cancelled() {
                tracing::debug!("Session {} cancelled", id);
                break;
            }

            for _ in 0..COMMAND_BURST {
                match self.commands.try_recv() {
                    Ok(SessionCommand::Write(data, reply)) => {
                        let _ = reply.send(self.write_input(&data));
                    }
                    Ok(SessionCommand::Resize(size, reply)) => {
                        let result = self.guard.transport.resize(size);
                        if let Err(e) = &result {
                            tracing::warn!("Session {}: {}", id, e);
                        }
                        let _ = reply.send(result);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        tracing::debug!("Session {} handle dropped", id);
                        break 'io;
                    }
                }
            }

            let mut progressed = false;

            match self.pump_output(&mut buf, &mut pending_output) {
                Pump::Progressed => progressed = true,
                Pump::Idle => {}
                Pump::Failed => break,
            }
            match self.pump_errors(&mut buf, &mut pending_error) {
                Pump::Progressed => progressed = true,
                Pump::Idle => {}
                Pump::Failed => break,
            }

            if !progressed
                && pending_output.is_none()
                && pending_error.is_none()
                && self.guard.transport.is_eof()
            {
                tracing::info!("Remote shell closed (session {})", id);
                break;
            }

            if !progressed {
                thread::sleep(IDLE_POLL);
            }
        }

        // Readers see the cancellation before the release guard runs
        self.cancel.cancel();
    }

    fn write_input(&mut self, data: &[u8]) -> EngineResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        loop {
            match self.guard.transport.write_input(data) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    if started.elapsed() >= self.write_timeout {
                        return Err(EngineError::Timeout {
                            operation: "session write".to_string(),
                            after: self.write_timeout,
                        });
                    }
                    if self.cancel.is_cancelled() {
                        return Err(EngineError::SessionClosed(self.guard.session_id.clone()));
                    }
                    thread::sleep(IDLE_POLL);
                }
                Err(e) => return Err(EngineError::Io(e)),
            }
        }
    }

    fn pump_output(&mut self, buf: &mut [u8], pending: &mut Option<Vec<u8>>) -> Pump {
        let Worker { guard, output, .. } = self;
        pump(&guard.session_id, output, pending, buf, |b| guard.transport.read_output(b))
    }

    fn pump_errors(&mut self, buf: &mut [u8], pending: &mut Option<Vec<u8>>) -> Pump {
        let Worker { guard, errors, .. } = self;
        pump(&guard.session_id, errors, pending, buf, |b| guard.transport.read_error(b))
    }
}

/// Move at most one chunk from the transport into `tx`. A chunk that does not
/// fit is parked in `pending` and nothing new is read until it is delivered.
fn pump(
    session_id: &str,
    tx: &mpsc::Sender<Vec<u8>>,
    pending: &mut Option<Vec<u8>>,
    buf: &mut [u8],
    mut read: impl FnMut(&mut [u8]) -> std::io::Result<usize>,
) -> Pump {
    if let Some(chunk) = pending.take() {
        return match tx.try_send(chunk) {
            Ok(()) => Pump::Progressed,
            Err(TrySendError::Full(chunk)) => {
                *pending = Some(chunk);
                Pump::Idle
            }
            // Nobody listens any more; drop the bytes
            Err(TrySendError::Closed(_)) => Pump::Idle,
        };
    }

    match read(buf) {
        Ok(0) => Pump::Idle,
        Ok(n) => {
            if let Err(TrySendError::Full(chunk)) = tx.try_send(buf[..n].to_vec()) {
                *pending = Some(chunk);
            }
            Pump::Progressed
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Pump::Idle,
        Err(e) => {
            tracing::warn!("Read error (session {}): {}", session_id, e);
            Pump::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::{FakeConnector, FakeShell};

    #[test]
    fn test_control_request_runs_under_deadline() {
        let session = Ssh2Session::new().unwrap();
        session.set_blocking(false);
        session.set_timeout(0);

        let seen = bounded_request(&session, || (session.is_blocking(), session.timeout()));
        assert_eq!(seen, (true, CONTROL_REQUEST_TIMEOUT_MS));
        assert!(!session.is_blocking());
        assert_eq!(session.timeout(), 0);
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            output_buffer: 4,
            write_timeout_ms: 200,
            ..Default::default()
        }
    }

    fn start(shell: &FakeShell) -> Session {
        Session::start(
            next_session_id("web-01"),
            "web-01".into(),
            shell.transport(),
            PtySize::default(),
            &settings(),
        )
    }

    #[test]
    fn test_session_ids_unique() {
        let a = next_session_id("web-01");
        let b = next_session_id("web-01");
        assert_ne!(a, b);
        assert!(a.starts_with("web-01-"));
    }

    #[tokio::test]
    async fn test_write_reaches_shell_in_order() {
        let shell = FakeShell::new();
        let session = start(&shell);

        assert_eq!(session.write(b"ls ").await.unwrap(), 3);
        assert_eq!(session.write(b"-la\n").await.unwrap(), 4);
        assert_eq!(shell.input(), b"ls -la\n");

        session.close().await;
    }

    #[tokio::test]
    async fn test_partial_write_is_reported() {
        let shell = FakeShell::new();
        shell.set_max_write(2);
        let session = start(&shell);

        assert_eq!(session.write(b"hello").await.unwrap(), 2);
        assert_eq!(shell.input(), b"he");

        session.close().await;
    }

    #[tokio::test]
    async fn test_read_returns_no_data_on_timeout() {
        let shell = FakeShell::new();
        let session = start(&shell);

        let outcome = session.read(Duration::from_millis(20)).await;
        assert_eq!(outcome, ReadOutcome::NoData);

        session.close().await;
    }

    #[tokio::test]
    async fn test_read_output_and_error_streams() {
        let shell = FakeShell::new();
        shell.push_output(b"$ ");
        shell.push_error(b"warning");
        let session = start(&shell);

        assert_eq!(
            session.read(Duration::from_secs(2)).await,
            ReadOutcome::Data(b"$ ".to_vec())
        );
        assert_eq!(
            session.read_error(Duration::from_secs(2)).await,
            ReadOutcome::Data(b"warning".to_vec())
        );

        session.close().await;
    }

    #[tokio::test]
    async fn test_remote_eof_delivers_buffered_output_first() {
        let shell = FakeShell::new();
        shell.push_output(b"bye\n");
        shell.set_eof();
        let session = start(&shell);

        assert_eq!(
            session.read(Duration::from_secs(2)).await,
            ReadOutcome::Data(b"bye\n".to_vec())
        );
        assert_eq!(session.read(Duration::from_secs(2)).await, ReadOutcome::Eof);
        session.close().await;
        assert_eq!(shell.released(), vec!["input", "shell", "connection"]);
    }

    #[tokio::test]
    async fn test_resize_stores_dims_even_when_request_fails() {
        let shell = FakeShell::new();
        shell.fail_resize();
        let session = start(&shell);

        assert!(session.resize(50, 132).await.is_err());
        assert_eq!(session.size(), PtySize::new(50, 132));
        assert!(!session.is_closed());

        session.close().await;
    }

    #[tokio::test]
    async fn test_resize_is_forwarded() {
        let shell = FakeShell::new();
        let session = start(&shell);

        session.resize(40, 100).await.unwrap();
        assert_eq!(shell.resizes(), vec![PtySize::new(40, 100)]);

        session.close().await;
    }

    #[tokio::test]
    async fn test_resize_rejects_zero() {
        let shell = FakeShell::new();
        let session = start(&shell);
        assert!(session.resize(0, 80).await.is_err());
        assert_eq!(session.size(), PtySize::default());
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_in_order_and_is_idempotent() {
        let shell = FakeShell::new();
        let session = start(&shell);

        session.close().await;
        assert!(session.is_closed());
        assert_eq!(shell.released(), vec!["input", "shell", "connection"]);

        session.close().await;
        assert_eq!(shell.released().len(), 3);

        assert!(matches!(
            session.write(b"x").await,
            Err(EngineError::SessionClosed(_))
        ));
        assert_eq!(session.read(Duration::from_millis(10)).await, ReadOutcome::Eof);
    }

    #[tokio::test]
    async fn test_output_backpressure_keeps_order() {
        let shell = FakeShell::new();
        for i in 0..20u8 {
            shell.push_output(&[i]);
        }
        let session = start(&shell);

        let mut seen = Vec::new();
        while seen.len() < 20 {
            match session.read(Duration::from_secs(2)).await {
                ReadOutcome::Data(data) => seen.extend(data),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(seen, (0..20u8).collect::<Vec<_>>());

        session.close().await;
    }

    #[tokio::test]
    async fn test_open_through_connector() {
        let connector = Arc::new(FakeConnector::new());
        let params = ConnectParams::new(
            "db-01",
            "10.0.0.5",
            22,
            "ops",
            crate::ssh::Credentials::password("pw"),
        );
        let session = Session::open(connector.clone(), &params, PtySize::new(30, 120), &settings())
            .await
            .unwrap();

        assert_eq!(session.host_id(), "db-01");
        assert!(session.id().starts_with("db-01-"));
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.last_size(), Some(PtySize::new(30, 120)));

        session.close().await;
    }

    #[tokio::test]
    async fn test_open_failure_carries_context() {
        let connector = Arc::new(FakeConnector::failing());
        let params = ConnectParams::new("db-01", "10.0.0.5", 22, "ops", Default::default());
        let err = Session::open(connector, &params, PtySize::default(), &settings())
            .await
            .err()
            .unwrap();

        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.to_string().contains("db-01"));
    }
}
