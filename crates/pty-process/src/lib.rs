//! Real `LivePtySession`/`PtyFactory` backed by `portable-pty`.
//!
//! Each spawned session gets a background reader thread forwarding raw PTY
//! bytes onto a broadcast channel, and a background waiter thread that
//! converts the child's exit into a terminal `PtyStreamItem::Exited`. Both
//! threads are plain `std::thread`s (portable-pty's I/O handles are
//! synchronous) rather than tokio tasks — callers consume the broadcast
//! channel from async code via `subscribe()`.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use harness_protocol::SignalKind;
use harness_pty_core::{LivePtySession, PtyError, PtyExitStatus, PtyFactory, PtySpec, PtyStreamItem};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 4096;

pub struct RealPtyFactory;

impl PtyFactory for RealPtyFactory {
    fn spawn(&self, spec: PtySpec) -> Result<Box<dyn LivePtySession>, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        // The slave fd must be dropped in this process once the child owns it,
        // or reads on the master never see EOF.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Spawn(e.to_string()))?;

        let (tx, _rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let reader_tx = tx.clone();
        let reader_closed = closed.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = reader_tx.send(PtyStreamItem::Output(buf[..n].to_vec()));
                    }
                    Err(e) => {
                        if reader_closed.load(Ordering::Relaxed) {
                            break;
                        }
                        debug!(error = %e, "pty reader stopped");
                        break;
                    }
                }
            }
        });

        let waiter_tx = tx.clone();
        let waiter_child: Box<dyn Child + Send + Sync> = child;
        let child_for_kill = Arc::new(Mutex::new(Some(waiter_child)));
        let waiter_handle = child_for_kill.clone();
        let waiter_closed = closed.clone();
        std::thread::spawn(move || {
            let status = {
                let mut guard = waiter_handle.lock().unwrap();
                guard.as_mut().and_then(|c| c.wait().ok())
            };
            waiter_closed.store(true, Ordering::Relaxed);
            let exit = match status {
                Some(status) => PtyExitStatus {
                    code: status.exit_code().try_into().ok(),
                    signal: None,
                },
                None => PtyExitStatus::default(),
            };
            let _ = waiter_tx.send(PtyStreamItem::Exited(exit));
        });

        Ok(Box::new(RealPtySession {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: child_for_kill,
            tx,
            closed,
        }))
    }
}

struct RealPtySession {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Option<Box<dyn Child + Send + Sync>>>>,
    tx: broadcast::Sender<PtyStreamItem>,
    closed: Arc<AtomicBool>,
}

impl LivePtySession for RealPtySession {
    fn subscribe(&self) -> broadcast::Receiver<PtyStreamItem> {
        self.tx.subscribe()
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PtyError::Closed);
        }
        self.writer
            .lock()
            .unwrap()
            .write_all(data)
            .map_err(|e| PtyError::Write(e.to_string()))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    fn signal(&self, kind: SignalKind) -> Result<(), PtyError> {
        match kind {
            // Writing the terminal's INTR/EOF control characters lets the
            // kernel's line discipline deliver SIGINT/EOF to the foreground
            // process group, exactly as a real keyboard would.
            SignalKind::Interrupt => self.write(&[0x03]),
            SignalKind::Eof => self.write(&[0x04]),
            SignalKind::Terminate => {
                let mut guard = self.child.lock().unwrap();
                match guard.as_mut() {
                    Some(child) => child.kill().map_err(|e| PtyError::Signal(e.to_string())),
                    None => Ok(()),
                }
            }
        }
    }

    fn close(&self) -> Result<(), PtyError> {
        self.closed.store(true, Ordering::Relaxed);
        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to kill pty child on close");
            }
        }
        Ok(())
    }
}

/// Resolve the command used to launch a `terminal` agent, following the
/// platform precedence `SHELL → ComSpec → (cmd.exe on Windows else sh)`.
pub fn resolve_terminal_command_for_environment() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    if let Ok(comspec) = std::env::var("ComSpec") {
        if !comspec.is_empty() {
            return comspec;
        }
    }
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        "sh".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_command_prefers_shell_env() {
        std::env::set_var("SHELL", "/bin/zsh");
        assert_eq!(resolve_terminal_command_for_environment(), "/bin/zsh");
        std::env::remove_var("SHELL");
    }

    #[test]
    fn terminal_command_falls_back_to_comspec_then_sh() {
        std::env::remove_var("SHELL");
        std::env::remove_var("ComSpec");
        let resolved = resolve_terminal_command_for_environment();
        if cfg!(windows) {
            assert_eq!(resolved, "cmd.exe");
        } else {
            assert_eq!(resolved, "sh");
        }
    }
}
