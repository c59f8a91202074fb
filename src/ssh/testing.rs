//! In-memory shells for exercising sessions without a server.

use super::connection::ConnectParams;
use super::session::{PtySize, ShellConnector, ShellTransport};
use crate::error::{EngineError, EngineResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct ShellState {
    input: Vec<u8>,
    output: VecDeque<Vec<u8>>,
    errors: VecDeque<Vec<u8>>,
    eof: bool,
    max_write: Option<usize>,
    fail_resize: bool,
    resizes: Vec<PtySize>,
    released: Vec<&'static str>,
}

/// Handle to a scripted shell; clones share state.
#[derive(Clone, Default)]
pub struct FakeShell {
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Box<dyn ShellTransport> {
        Box::new(self.clone())
    }

    pub fn push_output(&self, data: &[u8]) {
        self.state.lock().output.push_back(data.to_vec());
    }

    pub fn push_error(&self, data: &[u8]) {
        self.state.lock().errors.push_back(data.to_vec());
    }

    pub fn set_eof(&self) {
        self.state.lock().eof = true;
    }

    pub fn set_max_write(&self, max: usize) {
        self.state.lock().max_write = Some(max);
    }

    pub fn fail_resize(&self) {
        self.state.lock().fail_resize = true;
    }

    pub fn input(&self) -> Vec<u8> {
        self.state.lock().input.clone()
    }

    pub fn resizes(&self) -> Vec<PtySize> {
        self.state.lock().resizes.clone()
    }

    pub fn released(&self) -> Vec<&'static str> {
        self.state.lock().released.clone()
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released.contains(&"connection")
    }
}

fn pop_into(queue: &mut VecDeque<Vec<u8>>, buf: &mut [u8]) -> std::io::Result<usize> {
    match queue.pop_front() {
        Some(mut chunk) => {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                queue.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
        None => Err(Error::from(ErrorKind::WouldBlock)),
    }
}

impl ShellTransport for FakeShell {
    fn read_output(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock();
        if state.output.is_empty() && state.eof {
            return Ok(0);
        }
        pop_into(&mut state.output, buf)
    }

    fn read_error(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock();
        if state.errors.is_empty() && state.eof {
            return Ok(0);
        }
        pop_into(&mut state.errors, buf)
    }

    fn write_input(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock();
        let n = state.max_write.map_or(data.len(), |max| max.min(data.len()));
        state.input.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn resize(&mut self, size: PtySize) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.fail_resize {
            return Err(EngineError::Ssh("pty resize refused".into()));
        }
        state.resizes.push(size);
        Ok(())
    }

    fn is_eof(&self) -> bool {
        let state = self.state.lock();
        state.eof && state.output.is_empty() && state.errors.is_empty()
    }

    fn close_input(&mut self) {
        self.state.lock().released.push("input");
    }

    fn close_shell(&mut self) {
        self.state.lock().released.push("shell");
    }

    fn disconnect(&mut self) {
        self.state.lock().released.push("connection");
    }
}

/// Connector handing out `FakeShell`s
#[derive(Default)]
pub struct FakeConnector {
    fail: bool,
    opened: AtomicUsize,
    shells: Mutex<Vec<FakeShell>>,
    last_size: Mutex<Option<PtySize>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn last_size(&self) -> Option<PtySize> {
        *self.last_size.lock()
    }

    pub fn shells(&self) -> Vec<FakeShell> {
        self.shells.lock().clone()
    }
}

impl ShellConnector for FakeConnector {
    fn open_shell(&self, params: &ConnectParams, size: PtySize) -> EngineResult<Box<dyn ShellTransport>> {
        if self.fail {
            return Err(EngineError::Connection {
                host: params.endpoint(),
                message: "Connection refused".into(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_size.lock() = Some(size);
        let shell = FakeShell::new();
        self.shells.lock().push(shell.clone());
        Ok(shell.transport())
    }
}
