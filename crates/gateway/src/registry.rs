//! `SessionRegistry`: the public, async-friendly facade over the DashMap of
//! session actors. Every mutating operation round-trips through the
//! owning actor so invariants stay linearized; reads hit the lock-free
//! `ArcSwap` snapshot.

use std::sync::Arc;

use dashmap::DashMap;
use harness_protocol::{AgentType, RuntimeStatus, Scope, ScopeFilter, SessionSort, SessionSummary, SignalKind};
use harness_pty_core::{PtyFactory, PtySpec};
use tokio::sync::oneshot;

use crate::errors::GatewayError;
use crate::persistence::Store;
use crate::session::actor::{SessionActorHandle, SessionMap};
use crate::session::command::SessionCommand;
use crate::session::{AttachResult, TerminalSnapshot};
use crate::subscription::SubscriptionBus;
use crate::time::now_ts;
use crate::transition::Input as TransitionInput;

#[derive(Debug, Clone, Default)]
pub struct SessionListQuery {
    pub scope: ScopeFilter,
    pub directory_id: Option<String>,
    pub status: Option<RuntimeStatus>,
    pub live: Option<bool>,
    pub sort: Option<SessionSort>,
    pub limit: Option<usize>,
}

pub struct SessionRegistry {
    sessions: SessionMap,
    store: Store,
    bus: Arc<SubscriptionBus>,
    factory: Arc<dyn PtyFactory>,
    tombstone_ttl_ms: u64,
}

impl SessionRegistry {
    pub fn new(store: Store, bus: Arc<SubscriptionBus>, factory: Arc<dyn PtyFactory>, tombstone_ttl_ms: u64) -> Self {
        SessionRegistry {
            sessions: Arc::new(DashMap::new()),
            store,
            bus,
            factory,
            tombstone_ttl_ms,
        }
    }

    fn get(&self, session_id: &str) -> Result<SessionActorHandle, GatewayError> {
        self.sessions
            .get(session_id)
            .map(|r| r.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    fn get_live(&self, session_id: &str) -> Result<SessionActorHandle, GatewayError> {
        let handle = self.get(session_id)?;
        if handle.snapshot().status == RuntimeStatus::Exited {
            return Err(GatewayError::SessionNotLive);
        }
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_session(
        &self,
        session_id: String,
        conversation_id: String,
        directory_id: String,
        scope: Scope,
        agent_type: AgentType,
        spec: PtySpec,
    ) -> Result<SessionSummary, GatewayError> {
        let recycle = self
            .sessions
            .get(&session_id)
            .map(|r| r.clone())
            .filter(|h| h.snapshot().status == RuntimeStatus::Exited);

        if let Some(existing) = self.sessions.get(&session_id) {
            if existing.snapshot().status != RuntimeStatus::Exited {
                return Err(GatewayError::SessionAlreadyExists(session_id));
            }
        }

        let adapter = self
            .factory
            .spawn(spec)
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        if let Some(handle) = recycle {
            let (reply_tx, reply_rx) = oneshot::channel();
            handle
                .send(SessionCommand::ReplaceAdapter {
                    adapter,
                    started_at: now_ts(),
                    reply: reply_tx,
                })
                .await;
            reply_rx
                .await
                .map_err(|_| GatewayError::Internal("actor dropped reply".into()))?;
            return Ok(handle.snapshot().to_summary());
        }

        let handle = SessionActorHandle::spawn(
            session_id.clone(),
            conversation_id,
            directory_id,
            scope,
            agent_type,
            adapter,
            self.store.clone(),
            self.bus.clone(),
            self.tombstone_ttl_ms,
            self.sessions.clone(),
        );
        let summary = handle.snapshot().to_summary();
        self.sessions.insert(session_id, handle);
        Ok(summary)
    }

    pub async fn attach(&self, session_id: &str) -> Result<AttachResult, GatewayError> {
        let handle = self.get_live(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Attach { reply: tx }).await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))
    }

    pub async fn detach(&self, session_id: &str) -> Result<(), GatewayError> {
        let handle = self.get(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Detach { reply: tx }).await;
        let _ = rx.await;
        Ok(())
    }

    pub async fn input(&self, session_id: &str, connection_id: String, data: Vec<u8>) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        handle.send(SessionCommand::Input { connection_id, data }).await;
        Ok(())
    }

    pub async fn resize(&self, session_id: &str, connection_id: String, cols: u16, rows: u16) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        handle.send(SessionCommand::Resize { connection_id, cols, rows }).await;
        Ok(())
    }

    pub async fn signal(&self, session_id: &str, connection_id: String, kind: SignalKind) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        handle.send(SessionCommand::Signal { connection_id, kind }).await;
        Ok(())
    }

    pub async fn respond(&self, session_id: &str, connection_id: String, text: String) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Respond { connection_id, text, reply: tx }).await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))?
    }

    pub async fn interrupt(&self, session_id: &str, connection_id: String) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Interrupt { connection_id, reply: tx }).await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))?
    }

    pub async fn claim(
        &self,
        session_id: &str,
        connection_id: String,
        controller_type: String,
        controller_id: String,
        takeover: bool,
    ) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle
            .send(SessionCommand::Claim {
                connection_id,
                controller_type,
                controller_id,
                takeover,
                reply: tx,
            })
            .await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))?
    }

    pub async fn release(&self, session_id: &str, connection_id: String) -> Result<bool, GatewayError> {
        let handle = self.get_live(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Release { connection_id, reply: tx }).await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))?
    }

    /// Release every claim a closing connection held, across all sessions.
    pub async fn release_by_connection(&self, connection_id: &str) {
        let handles: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            handle
                .send(SessionCommand::ReleaseByConnection {
                    connection_id: connection_id.to_string(),
                })
                .await;
        }
    }

    pub async fn close(&self, session_id: &str) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Close { reply: tx }).await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))?
    }

    pub async fn remove(&self, session_id: &str) -> Result<(), GatewayError> {
        let handle = self.get(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Remove { reply: tx }).await;
        let _ = rx.await;
        Ok(())
    }

    pub fn status(&self, session_id: &str) -> Result<SessionSummary, GatewayError> {
        Ok(self.get(session_id)?.snapshot().to_summary())
    }

    pub async fn terminal_snapshot(&self, session_id: &str) -> Result<TerminalSnapshot, GatewayError> {
        let handle = self.get(session_id)?;
        let (tx, rx) = oneshot::channel();
        handle.send(SessionCommand::Snapshot { reply: tx }).await;
        rx.await.map_err(|_| GatewayError::Internal("actor dropped reply".into()))?
    }

    pub async fn apply_transition(
        &self,
        session_id: &str,
        input: TransitionInput,
        attention_reason: Option<Option<String>>,
        last_event_at: Option<String>,
    ) -> Result<(), GatewayError> {
        let handle = self.get_live(session_id)?;
        handle
            .send(SessionCommand::ApplyTransition { input, attention_reason, last_event_at })
            .await;
        Ok(())
    }

    pub fn list(&self, query: &SessionListQuery) -> Vec<SessionSummary> {
        let mut items: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|e| e.value().snapshot().to_summary())
            .filter(|s| {
                if let Some(t) = &query.scope.tenant_id {
                    if &s.scope.tenant_id != t {
                        return false;
                    }
                }
                if let Some(u) = &query.scope.user_id {
                    if &s.scope.user_id != u {
                        return false;
                    }
                }
                if let Some(w) = &query.scope.workspace_id {
                    if &s.scope.workspace_id != w {
                        return false;
                    }
                }
                if let Some(d) = &query.directory_id {
                    if &s.directory_id != d {
                        return false;
                    }
                }
                if let Some(status) = query.status {
                    if s.status != status {
                        return false;
                    }
                }
                if let Some(live) = query.live {
                    if s.live != live {
                        return false;
                    }
                }
                true
            })
            .collect();

        sort_session_summaries(&mut items, query.sort.unwrap_or(SessionSort::StartedDesc));

        if let Some(limit) = query.limit {
            items.truncate(limit);
        }
        items
    }
}

/// Orders session summaries for `session.list`: attention-first bucketing,
/// otherwise stable by the requested sort.
fn sort_session_summaries(items: &mut [SessionSummary], sort: SessionSort) {
    match sort {
        SessionSort::AttentionFirst => items.sort_by(|a, b| {
            attention_bucket(a)
                .cmp(&attention_bucket(b))
                .then_with(|| b.last_event_at.cmp(&a.last_event_at))
                .then_with(|| b.started_at.cmp(&a.started_at))
                .then_with(|| a.session_id.cmp(&b.session_id))
        }),
        SessionSort::StartedAsc => items.sort_by(|a, b| a.started_at.cmp(&b.started_at)),
        SessionSort::StartedDesc => items.sort_by(|a, b| b.started_at.cmp(&a.started_at)),
    }
}

fn attention_bucket(s: &SessionSummary) -> u8 {
    match s.status {
        RuntimeStatus::NeedsInput => 0,
        RuntimeStatus::Running => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_pty_core::fake::FakePtyFactory;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn scope() -> Scope {
        Scope {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            workspace_id: "w1".into(),
        }
    }

    fn spec() -> PtySpec {
        PtySpec {
            cwd: "/tmp".into(),
            program: "sh".into(),
            args: vec![],
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    async fn setup() -> (SessionRegistry, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let bus = Arc::new(SubscriptionBus::new(100));
        let factory = Arc::new(FakePtyFactory::default());
        (SessionRegistry::new(store, bus, factory, 50), dir)
    }

    #[tokio::test]
    async fn start_then_status_reports_running() {
        let (registry, _dir) = setup().await;
        registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();
        let status = registry.status("s1").unwrap();
        assert_eq!(status.status, RuntimeStatus::Running);
        assert!(status.live);
    }

    #[tokio::test]
    async fn starting_a_live_session_twice_conflicts() {
        let (registry, _dir) = setup().await;
        registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();
        let result = registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await;
        assert!(matches!(result, Err(GatewayError::SessionAlreadyExists(_))));
    }

    #[tokio::test]
    async fn controller_enforcement() {
        let (registry, _dir) = setup().await;
        registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();

        registry
            .claim("s1", "connA".into(), "agent".into(), "owner".into(), false)
            .await
            .unwrap();

        let result = registry.respond("s1", "connB".into(), "hello".into()).await;
        assert!(matches!(result, Err(GatewayError::SessionClaimed { .. })));

        registry
            .claim("s1", "connB".into(), "agent".into(), "taker".into(), true)
            .await
            .unwrap();
        registry.respond("s1", "connB".into(), "hello".into()).await.unwrap();
    }

    #[tokio::test]
    async fn release_with_no_controller_is_idempotent() {
        let (registry, _dir) = setup().await;
        registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();
        let released = registry.release("s1", "connA".into()).await.unwrap();
        assert!(!released);
    }

    #[tokio::test]
    async fn exited_session_is_tombstoned_then_removed_after_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let bus = Arc::new(SubscriptionBus::new(100));
        let factory = Arc::new(FakePtyFactory::default());
        let registry = SessionRegistry::new(store, bus, factory.clone(), 40);

        registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();
        let fake = factory.spawned.lock().unwrap()[0].clone();
        fake.push_exit(harness_pty_core::PtyExitStatus { code: Some(0), signal: None });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let status = registry.status("s1").unwrap();
        assert_eq!(status.status, RuntimeStatus::Exited);
        assert!(!status.live);
        assert!(matches!(
            registry.interrupt("s1", "connA".into()).await,
            Err(GatewayError::SessionNotLive)
        ));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(matches!(registry.status("s1"), Err(GatewayError::SessionNotFound(_))));

        registry
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();
        assert_eq!(registry.status("s1").unwrap().status, RuntimeStatus::Running);
    }
}
