//! Session actor: each live session runs as its own `tokio::spawn`ed task,
//! draining `SessionCommand`s sequentially so every mutation of its state is
//! linearized without a `Mutex`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use harness_protocol::{AgentType, DomainEvent, RuntimeStatus, Scope, SignalKind};
use harness_pty_core::{LivePtySession, PtyExitStatus, PtyStreamItem};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::errors::GatewayError;
use crate::persistence::Store;
use crate::session::command::SessionCommand;
use crate::session::{AttachResult, Controller, SessionSnapshot, TerminalSnapshot};
use crate::subscription::SubscriptionBus;
use crate::time::now_ts;
use crate::transition::{self, Input as TransitionInput};

const BACKLOG_CAPACITY: usize = 1000;
const SNAPSHOT_TAIL_BYTES: usize = 4096;
const ATTACH_BROADCAST_CAPACITY: usize = 1024;

/// Registry-wide session map, keyed by session id. Defined here (rather than
/// in `registry.rs`) so the actor can remove its own tombstoned entry at TTL
/// expiry without a circular module dependency.
pub type SessionMap = Arc<DashMap<String, SessionActorHandle>>;

#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionActorHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: String,
        conversation_id: String,
        directory_id: String,
        scope: Scope,
        agent_type: AgentType,
        adapter: Box<dyn LivePtySession>,
        store: Store,
        bus: Arc<SubscriptionBus>,
        tombstone_ttl_ms: u64,
        sessions: SessionMap,
    ) -> SessionActorHandle {
        let started_at = now_ts();
        let (command_tx, command_rx) = mpsc::channel(256);
        let (attach_tx, _) = broadcast::channel(ATTACH_BROADCAST_CAPACITY);

        let inner = Inner {
            id: id.clone(),
            conversation_id,
            directory_id,
            scope,
            agent_type,
            adapter: Some(adapter),
            controller: None,
            backlog: VecDeque::new(),
            latest_cursor: 0,
            attach_tx,
            status: RuntimeStatus::Running,
            attention_reason: None,
            last_event_at: None,
            started_at: started_at.clone(),
            exited_at: None,
            last_exit: None,
            self_tx: command_tx.clone(),
        };

        let snapshot = Arc::new(ArcSwap::from_pointee(inner.snapshot()));
        spawn_forwarder(inner.adapter.as_ref().unwrap(), command_tx.clone());

        let handle = SessionActorHandle {
            id: inner.id.clone(),
            command_tx: command_tx.clone(),
            snapshot: snapshot.clone(),
        };

        tokio::spawn(actor_loop(
            inner,
            command_rx,
            store,
            bus,
            snapshot,
            tombstone_ttl_ms,
            sessions,
        ));

        handle
    }

    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(component = "session_actor", session_id = %self.id, "actor channel closed");
        }
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }
}

/// Mutable state owned exclusively by the actor task.
struct Inner {
    id: String,
    conversation_id: String,
    directory_id: String,
    scope: Scope,
    agent_type: AgentType,
    adapter: Option<Box<dyn LivePtySession>>,
    controller: Option<Controller>,
    backlog: VecDeque<(u64, Vec<u8>)>,
    latest_cursor: u64,
    attach_tx: broadcast::Sender<(u64, PtyStreamItem)>,
    status: RuntimeStatus,
    attention_reason: Option<String>,
    last_event_at: Option<String>,
    started_at: String,
    exited_at: Option<String>,
    last_exit: Option<PtyExitStatus>,
    self_tx: mpsc::Sender<SessionCommand>,
}

impl Inner {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            directory_id: self.directory_id.clone(),
            scope: self.scope.clone(),
            agent_type: self.agent_type,
            status: self.status,
            attention_reason: self.attention_reason.clone(),
            live: self.status != RuntimeStatus::Exited,
            started_at: self.started_at.clone(),
            last_event_at: self.last_event_at.clone(),
            exited_at: self.exited_at.clone(),
        }
    }

    fn is_controller(&self, connection_id: &str) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|c| c.connection_id == connection_id)
    }

    fn push_backlog(&mut self, bytes: Vec<u8>) -> u64 {
        self.latest_cursor += 1;
        self.backlog.push_back((self.latest_cursor, bytes));
        while self.backlog.len() > BACKLOG_CAPACITY {
            self.backlog.pop_front();
        }
        self.latest_cursor
    }

    fn tail_snapshot_text(&self) -> String {
        let mut buf = Vec::new();
        for (_, chunk) in self.backlog.iter().rev() {
            buf.splice(0..0, chunk.iter().copied());
            if buf.len() >= SNAPSHOT_TAIL_BYTES {
                break;
            }
        }
        if buf.len() > SNAPSHOT_TAIL_BYTES {
            let start = buf.len() - SNAPSHOT_TAIL_BYTES;
            buf = buf[start..].to_vec();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn spawn_forwarder(adapter: &Box<dyn LivePtySession>, command_tx: mpsc::Sender<SessionCommand>) {
    let mut rx = adapter.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => {
                    if command_tx.send(SessionCommand::AdapterOutput(item)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    });
}

enum LoopOutcome {
    Continue,
    RemoveNow,
}

async fn actor_loop(
    mut inner: Inner,
    mut command_rx: mpsc::Receiver<SessionCommand>,
    store: Store,
    bus: Arc<SubscriptionBus>,
    snapshot_swap: Arc<ArcSwap<SessionSnapshot>>,
    tombstone_ttl_ms: u64,
    sessions: SessionMap,
) {
    publish_status(&inner, &store, &bus).await;
    snapshot_swap.store(Arc::new(inner.snapshot()));

    loop {
        let cmd = if inner.status == RuntimeStatus::Exited && tombstone_ttl_ms > 0 {
            tokio::select! {
                cmd = command_rx.recv() => cmd,
                _ = tokio::time::sleep(Duration::from_millis(tombstone_ttl_ms)) => {
                    info!(component = "session_actor", session_id = %inner.id, event = "session.tombstone_expired");
                    sessions.remove(&inner.id);
                    return;
                }
            }
        } else if inner.status == RuntimeStatus::Exited {
            sessions.remove(&inner.id);
            return;
        } else {
            command_rx.recv().await
        };

        let Some(cmd) = cmd else { return };

        match handle_command(&mut inner, cmd, &store, &bus).await {
            LoopOutcome::Continue => {}
            LoopOutcome::RemoveNow => {
                sessions.remove(&inner.id);
                return;
            }
        }

        snapshot_swap.store(Arc::new(inner.snapshot()));
    }
}

async fn publish_status(inner: &Inner, store: &Store, bus: &SubscriptionBus) {
    let live = inner.status != RuntimeStatus::Exited;
    if let Err(e) = store
        .set_runtime_status(
            inner.conversation_id.clone(),
            Some(inner.status),
            Some(live),
            Some(inner.attention_reason.clone()),
        )
        .await
    {
        warn!(component = "session_actor", session_id = %inner.id, error = %e, "failed to persist runtime status");
    }
    bus.publish(DomainEvent::SessionStatus {
        session_id: inner.id.clone(),
        conversation_id: inner.conversation_id.clone(),
        scope: inner.scope.clone(),
        status: inner.status,
        attention_reason: inner.attention_reason.clone(),
        live,
    });
}

async fn handle_command(
    inner: &mut Inner,
    cmd: SessionCommand,
    store: &Store,
    bus: &SubscriptionBus,
) -> LoopOutcome {
    match cmd {
        SessionCommand::AdapterOutput(PtyStreamItem::Output(bytes)) => {
            let cursor = inner.push_backlog(bytes.clone());
            bus.publish(DomainEvent::SessionOutput {
                session_id: inner.id.clone(),
                conversation_id: inner.conversation_id.clone(),
                scope: inner.scope.clone(),
                output_cursor: cursor,
                chunk_base64: BASE64.encode(&bytes),
            });
            let _ = inner.attach_tx.send((cursor, PtyStreamItem::Output(bytes)));
            inner.last_event_at = Some(now_ts());
        }
        SessionCommand::AdapterOutput(PtyStreamItem::Exited(status)) => {
            inner.status = transition::transition(inner.status, TransitionInput::AdapterExited);
            inner.exited_at = Some(now_ts());
            inner.last_exit = Some(status);
            let cursor = inner.latest_cursor + 1;
            inner.latest_cursor = cursor;
            let _ = inner.attach_tx.send((cursor, PtyStreamItem::Exited(status)));
            publish_status(inner, store, bus).await;
        }

        SessionCommand::Attach { reply } => {
            let backlog = inner.backlog.iter().cloned().collect();
            let rx = inner.attach_tx.subscribe();
            let _ = reply.send(AttachResult {
                latest_cursor: inner.latest_cursor,
                backlog,
                rx,
            });
        }
        SessionCommand::Detach { reply } => {
            let _ = reply.send(());
        }

        SessionCommand::Input { connection_id, data } => {
            if inner.is_controller(&connection_id) || inner.controller.is_none() {
                if let Some(adapter) = &inner.adapter {
                    let _ = adapter.write(&data);
                }
            }
        }
        SessionCommand::Resize { connection_id, cols, rows } => {
            if inner.is_controller(&connection_id) || inner.controller.is_none() {
                if let Some(adapter) = &inner.adapter {
                    let _ = adapter.resize(cols, rows);
                }
            }
        }
        SessionCommand::Signal { connection_id, kind } => {
            if inner.is_controller(&connection_id) || inner.controller.is_none() {
                if let Some(adapter) = &inner.adapter {
                    let _ = adapter.signal(kind);
                }
            }
        }

        SessionCommand::Respond { connection_id, text, reply } => {
            let _ = reply.send(require_controller_or(inner, &connection_id, || {
                if let Some(adapter) = &inner.adapter {
                    let mut data = text.into_bytes();
                    data.push(b'\n');
                    let _ = adapter.write(&data);
                }
            }));
        }
        SessionCommand::Interrupt { connection_id, reply } => {
            let _ = reply.send(require_controller_or(inner, &connection_id, || {
                if let Some(adapter) = &inner.adapter {
                    let _ = adapter.signal(SignalKind::Interrupt);
                }
            }));
        }

        SessionCommand::Claim { connection_id, controller_type, controller_id, takeover, reply } => {
            let allowed = match &inner.controller {
                None => true,
                Some(c) => takeover || c.connection_id == connection_id,
            };
            if allowed {
                inner.controller = Some(Controller {
                    controller_type,
                    controller_id,
                    connection_id,
                });
                let _ = reply.send(Ok(()));
            } else {
                let c = inner.controller.as_ref().unwrap();
                let _ = reply.send(Err(GatewayError::SessionClaimed {
                    controller_type: c.controller_type.clone(),
                    controller_id: c.controller_id.clone(),
                }));
            }
        }
        SessionCommand::Release { connection_id, reply } => {
            match &inner.controller {
                None => {
                    let _ = reply.send(Ok(false));
                }
                Some(c) if c.connection_id == connection_id => {
                    inner.controller = None;
                    let _ = reply.send(Ok(true));
                }
                Some(c) => {
                    let _ = reply.send(Err(GatewayError::SessionClaimed {
                        controller_type: c.controller_type.clone(),
                        controller_id: c.controller_id.clone(),
                    }));
                }
            }
        }
        SessionCommand::ReleaseByConnection { connection_id } => {
            if inner.is_controller(&connection_id) {
                inner.controller = None;
            }
        }

        SessionCommand::Status { reply } => {
            let _ = reply.send(inner.snapshot());
        }
        SessionCommand::Snapshot { reply } => {
            if inner.backlog.is_empty() && inner.adapter.is_none() {
                let _ = reply.send(Err(GatewayError::SessionSnapshotUnavailable));
            } else {
                let stale = inner.status == RuntimeStatus::Exited;
                let _ = reply.send(Ok(TerminalSnapshot {
                    text: inner.tail_snapshot_text(),
                    stale,
                }));
            }
        }

        SessionCommand::ApplyTransition { input, attention_reason, last_event_at } => {
            inner.status = transition::transition(inner.status, input);
            if let Some(reason) = attention_reason {
                inner.attention_reason = reason;
            }
            if let Some(ts) = last_event_at {
                inner.last_event_at = Some(ts);
            }
            publish_status(inner, store, bus).await;
        }

        SessionCommand::Close { reply } => {
            if let Some(adapter) = &inner.adapter {
                let _ = adapter.close();
            }
            let _ = reply.send(Ok(()));
        }
        SessionCommand::Remove { reply } => {
            if let Some(adapter) = &inner.adapter {
                let _ = adapter.close();
            }
            let _ = reply.send(());
            return LoopOutcome::RemoveNow;
        }
        SessionCommand::ReplaceAdapter { adapter, started_at, reply } => {
            inner.adapter = Some(adapter);
            inner.status = RuntimeStatus::Running;
            inner.attention_reason = None;
            inner.started_at = started_at;
            inner.exited_at = None;
            inner.last_exit = None;
            inner.controller = None;
            inner.backlog.clear();
            inner.latest_cursor = 0;
            spawn_forwarder(inner.adapter.as_ref().unwrap(), inner.self_tx.clone());
            publish_status(inner, store, bus).await;
            let _ = reply.send(());
        }
    }
    LoopOutcome::Continue
}

fn require_controller_or(inner: &Inner, connection_id: &str, action: impl FnOnce()) -> Result<(), GatewayError> {
    match &inner.controller {
        None => {
            action();
            Ok(())
        }
        Some(c) if c.connection_id == connection_id => {
            action();
            Ok(())
        }
        Some(c) => Err(GatewayError::SessionClaimed {
            controller_type: c.controller_type.clone(),
            controller_id: c.controller_id.clone(),
        }),
    }
}
