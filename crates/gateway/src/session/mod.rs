//! Session Registry + Live-Session Adapter.
//!
//! `SessionSnapshot` is the lock-free read-side view published via
//! `Arc<ArcSwap<SessionSnapshot>>`; mutation always goes through the actor
//! (`actor.rs`) so the invariants hold without a mutex.

pub mod actor;
pub mod command;

use harness_protocol::{AgentType, RuntimeStatus, Scope, SessionSummary};

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: String,
    pub conversation_id: String,
    pub directory_id: String,
    pub scope: Scope,
    pub agent_type: AgentType,
    pub status: RuntimeStatus,
    pub attention_reason: Option<String>,
    pub live: bool,
    pub started_at: String,
    pub last_event_at: Option<String>,
    pub exited_at: Option<String>,
}

impl SessionSnapshot {
    pub fn to_summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            directory_id: self.directory_id.clone(),
            scope: self.scope.clone(),
            agent_type: self.agent_type,
            status: self.status,
            attention_reason: self.attention_reason.clone(),
            live: self.live,
            started_at: self.started_at.clone(),
            last_event_at: self.last_event_at.clone(),
            exited_at: self.exited_at.clone(),
        }
    }
}

/// The connection currently permitted to mutate a session.
#[derive(Debug, Clone)]
pub struct Controller {
    pub controller_type: String,
    pub controller_id: String,
    pub connection_id: String,
}

/// Result of `session.snapshot`.
#[derive(Debug, Clone)]
pub struct TerminalSnapshot {
    pub text: String,
    pub stale: bool,
}

/// Result of `pty.attach`: the cursor as of attach time, backlog strictly
/// after the caller's `since_cursor`, and a receiver fed with every chunk
/// produced from this point on.
pub struct AttachResult {
    pub latest_cursor: u64,
    pub backlog: Vec<(u64, Vec<u8>)>,
    pub rx: tokio::sync::broadcast::Receiver<(u64, harness_pty_core::PtyStreamItem)>,
}
