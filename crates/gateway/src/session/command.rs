//! Commands accepted by a session actor.

use harness_protocol::SignalKind;
use harness_pty_core::{LivePtySession, PtyStreamItem};
use tokio::sync::oneshot;

use crate::errors::GatewayError;
use crate::session::{AttachResult, SessionSnapshot, TerminalSnapshot};
use crate::transition::Input as TransitionInput;

pub enum SessionCommand {
    /// Forwarded from the adapter's output broadcast by a background task.
    AdapterOutput(PtyStreamItem),

    Attach {
        reply: oneshot::Sender<AttachResult>,
    },
    /// `pty.detach` is informational — dropping the attach receiver is what
    /// actually stops delivery — but every command gets an ack.
    Detach {
        reply: oneshot::Sender<()>,
    },

    /// `pty.input` / raw terminal bytes. Silently dropped if `connection_id`
    /// is not the current controller.
    Input {
        connection_id: String,
        data: Vec<u8>,
    },
    Resize {
        connection_id: String,
        cols: u16,
        rows: u16,
    },
    Signal {
        connection_id: String,
        kind: SignalKind,
    },

    /// `session.respond` — like `Input` but rejected (not silently dropped)
    /// when the caller isn't the controller.
    Respond {
        connection_id: String,
        text: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Interrupt {
        connection_id: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },

    Claim {
        connection_id: String,
        controller_type: String,
        controller_id: String,
        takeover: bool,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    /// Returns `Ok(false)` if no controller was set (idempotent).
    Release {
        connection_id: String,
        reply: oneshot::Sender<Result<bool, GatewayError>>,
    },
    /// Implicit release on connection close — no reply, no error if mismatched.
    ReleaseByConnection {
        connection_id: String,
    },

    Status {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<TerminalSnapshot, GatewayError>>,
    },

    /// Telemetry-driven runtime status update.
    ApplyTransition {
        input: TransitionInput,
        attention_reason: Option<Option<String>>,
        last_event_at: Option<String>,
    },

    /// `pty.close` — terminates the child and tears the adapter down.
    Close {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    /// `session.remove` — forcibly evicts the session regardless of status.
    Remove {
        reply: oneshot::Sender<()>,
    },
    /// `pty.start` on a tombstoned id: reuse this actor with a fresh adapter
    /// instead of racing a DashMap replace against the tombstone timer.
    ReplaceAdapter {
        adapter: Box<dyn LivePtySession>,
        started_at: String,
        reply: oneshot::Sender<()>,
    },
}
