//! In-memory `PtyFactory`/`LivePtySession` used by gateway tests so the
//! session registry, backlog, and controller logic can be exercised without
//! a real child process.

use std::sync::Mutex;

use harness_protocol::SignalKind;
use tokio::sync::broadcast;

use crate::{LivePtySession, PtyError, PtyExitStatus, PtyFactory, PtySpec, PtyStreamItem};

/// Records everything sent to a fake session, for test assertions.
#[derive(Default)]
pub struct FakeCalls {
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub signals: Mutex<Vec<SignalKind>>,
    pub closed: Mutex<bool>,
}

pub struct FakePtySession {
    tx: broadcast::Sender<PtyStreamItem>,
    pub calls: std::sync::Arc<FakeCalls>,
}

impl FakePtySession {
    pub fn new() -> std::sync::Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        std::sync::Arc::new(Self {
            tx,
            calls: std::sync::Arc::new(FakeCalls::default()),
        })
    }

    /// Push output bytes as if the child wrote them.
    pub fn push_output(&self, bytes: &[u8]) {
        let _ = self.tx.send(PtyStreamItem::Output(bytes.to_vec()));
    }

    /// Simulate the child process exiting.
    pub fn push_exit(&self, status: PtyExitStatus) {
        let _ = self.tx.send(PtyStreamItem::Exited(status));
    }
}

impl LivePtySession for FakePtySession {
    fn subscribe(&self) -> broadcast::Receiver<PtyStreamItem> {
        self.tx.subscribe()
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.calls.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.calls.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    fn signal(&self, kind: SignalKind) -> Result<(), PtyError> {
        self.calls.signals.lock().unwrap().push(kind);
        Ok(())
    }

    fn close(&self) -> Result<(), PtyError> {
        *self.calls.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// Spawns [`FakePtySession`]s, handing the caller a clone of each one so
/// tests can drive output/exit after the adapter has taken ownership.
pub struct FakePtyFactory {
    pub spawned: Mutex<Vec<std::sync::Arc<FakePtySession>>>,
}

impl Default for FakePtyFactory {
    fn default() -> Self {
        Self {
            spawned: Mutex::new(Vec::new()),
        }
    }
}

impl PtyFactory for FakePtyFactory {
    fn spawn(&self, _spec: PtySpec) -> Result<Box<dyn LivePtySession>, PtyError> {
        let session = FakePtySession::new();
        self.spawned.lock().unwrap().push(session.clone());
        // LivePtySession requires an owned Box; FakePtySession is cheaply
        // represented via its Arc<FakeCalls>/broadcast::Sender internally,
        // so a thin wrapper forwards calls to the shared instance.
        Ok(Box::new(FakeHandle(session)))
    }
}

struct FakeHandle(std::sync::Arc<FakePtySession>);

impl LivePtySession for FakeHandle {
    fn subscribe(&self) -> broadcast::Receiver<PtyStreamItem> {
        self.0.subscribe()
    }
    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.0.write(data)
    }
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.0.resize(cols, rows)
    }
    fn signal(&self, kind: SignalKind) -> Result<(), PtyError> {
        self.0.signal(kind)
    }
    fn close(&self) -> Result<(), PtyError> {
        self.0.close()
    }
}
