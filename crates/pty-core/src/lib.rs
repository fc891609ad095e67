//! PTY session trait
//!
//! The Live-Session Adapter drives sessions through this
//! trait rather than any concrete process library, so the gateway's backlog,
//! attach fan-out, and controller logic are independent of what actually
//! spawns the child (a real PTY today, an in-memory fake in tests).

use std::collections::HashMap;

use harness_protocol::SignalKind;
use thiserror::Error;
use tokio::sync::broadcast;

#[cfg(feature = "fake")]
pub mod fake;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to spawn process: {0}")]
    Spawn(String),
    #[error("failed to write to pty: {0}")]
    Write(String),
    #[error("failed to resize pty: {0}")]
    Resize(String),
    #[error("failed to signal pty: {0}")]
    Signal(String),
    #[error("pty already closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to launch: a concrete command and the environment/size to launch it with.
#[derive(Debug, Clone)]
pub struct PtySpec {
    pub cwd: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Terminal exit status, as reported by the child process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtyExitStatus {
    pub code: Option<i32>,
    /// POSIX signal number that terminated the process, if any.
    pub signal: Option<i32>,
}

/// An item delivered on a live session's output stream.
#[derive(Debug, Clone)]
pub enum PtyStreamItem {
    /// Raw bytes the child wrote to its PTY.
    Output(Vec<u8>),
    /// The child process has exited. Terminal — no further items follow.
    Exited(PtyExitStatus),
}

/// A live, attachable PTY-backed process.
///
/// `subscribe` may be called repeatedly and concurrently: each call returns
/// an independent receiver fed by the same broadcast of output, so the
/// gateway's adapter can hand one out per freshly-attaching connection while
/// it separately maintains the authoritative backlog ring and cursor.
pub trait LivePtySession: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PtyStreamItem>;
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
    fn signal(&self, kind: SignalKind) -> Result<(), PtyError>;
    /// Terminate the child and release PTY resources. Idempotent.
    fn close(&self) -> Result<(), PtyError>;
}

/// Factory that produces live sessions. Swappable so tests can spawn fakes
/// instead of real child processes.
pub trait PtyFactory: Send + Sync {
    fn spawn(&self, spec: PtySpec) -> Result<Box<dyn LivePtySession>, PtyError>;
}
