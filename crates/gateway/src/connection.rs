//! Stream Protocol Codec: per-connection read/write tasks,
//! auth gating, and the attach/subscribe forwarder tasks that turn a
//! session's broadcast output and the subscription bus into wire envelopes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use harness_protocol::{ClientEnvelope, DomainEvent, ServerEnvelope};
use harness_pty_core::PtyStreamItem;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch;
use crate::errors::GatewayError;
use crate::launch_args::LaunchArgsInjector;
use crate::state::AppState;
use crate::subscription::StreamFilter as BusStreamFilter;

/// A connection's write side: a channel of pre-serialized lines plus the
/// byte counter that makes `maxConnectionBufferedBytes` mean something.
/// `queued_bytes` is incremented here, at enqueue time, and only ever
/// decremented by the writer once a line has actually gone out the socket —
/// so it always reflects bytes genuinely outstanding, not a per-message
/// round trip that resets to zero between writes.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
    max_buffered_bytes: usize,
}

impl OutboundSender {
    /// Serializes and enqueues `envelope`. Returns `false` if doing so would
    /// push outstanding bytes past the connection's budget or the writer has
    /// already gone away — the caller should treat the connection as dead.
    async fn send(&self, envelope: ServerEnvelope) -> bool {
        let Ok(mut line) = serde_json::to_vec(&envelope) else {
            return true;
        };
        line.push(b'\n');
        let outstanding = self.queued_bytes.load(Ordering::SeqCst);
        if outstanding + line.len() > self.max_buffered_bytes {
            warn!(
                component = "connection",
                event = "connection.buffer_overflow",
                outstanding,
                incoming = line.len(),
                error = %GatewayError::ConnectionBufferOverflow,
                "destroying connection, buffer exceeded"
            );
            return false;
        }
        self.queued_bytes.fetch_add(line.len(), Ordering::SeqCst);
        let len = line.len();
        if self.tx.send(line).await.is_err() {
            self.queued_bytes.fetch_sub(len, Ordering::SeqCst);
            return false;
        }
        true
    }
}

/// Per-connection bookkeeping the dispatch layer needs: who to attribute
/// `pty.input`/controller actions to, and the live forwarder tasks this
/// connection owns (so they can be torn down on disconnect or explicit
/// detach/unsubscribe).
pub struct ConnectionContext {
    pub connection_id: String,
    out_tx: OutboundSender,
    attachments: std::collections::HashMap<String, tokio::task::JoinHandle<()>>,
    event_subs: std::collections::HashMap<String, tokio::task::JoinHandle<()>>,
    stream_subs: std::collections::HashMap<String, tokio::task::JoinHandle<()>>,
}

impl ConnectionContext {
    fn new(connection_id: String, out_tx: OutboundSender) -> Self {
        ConnectionContext {
            connection_id,
            out_tx,
            attachments: std::collections::HashMap::new(),
            event_subs: std::collections::HashMap::new(),
            stream_subs: std::collections::HashMap::new(),
        }
    }

    pub async fn attach(
        &mut self,
        state: &AppState,
        session_id: &str,
        since_cursor: Option<u64>,
    ) -> Result<serde_json::Value, GatewayError> {
        let result = state.sessions.attach(session_id).await?;
        let floor = since_cursor.unwrap_or(0);
        let backlog: Vec<_> = result.backlog.into_iter().filter(|(cursor, _)| *cursor > floor).collect();

        let session_id_owned = session_id.to_string();
        let out_tx = self.out_tx.clone();
        let mut rx = result.rx;
        let handle = tokio::spawn(async move {
            while let Ok((cursor, item)) = rx.recv().await {
                let envelope = match item {
                    PtyStreamItem::Output(bytes) => ServerEnvelope::PtyOutput {
                        session_id: session_id_owned.clone(),
                        output_cursor: cursor,
                        chunk_base64: BASE64.encode(&bytes),
                    },
                    PtyStreamItem::Exited(status) => ServerEnvelope::PtyExit {
                        session_id: session_id_owned.clone(),
                        code: status.code,
                        signal: status.signal.map(|s| s.to_string()),
                    },
                };
                if !out_tx.send(envelope).await {
                    break;
                }
            }
        });
        if let Some(previous) = self.attachments.insert(session_id.to_string(), handle) {
            previous.abort();
        }

        Ok(serde_json::json!({
            "latestCursor": result.latest_cursor,
            "backlog": backlog
                .into_iter()
                .map(|(cursor, chunk)| serde_json::json!({ "cursor": cursor, "chunkBase64": BASE64.encode(&chunk) }))
                .collect::<Vec<_>>(),
        }))
    }

    pub async fn detach(&mut self, state: &AppState, session_id: &str) {
        if let Some(handle) = self.attachments.remove(session_id) {
            handle.abort();
        }
        let _ = state.sessions.detach(session_id).await;
    }

    /// `pty.subscribe-events`: forwards session-status and key-event
    /// telemetry concerning this one session as `pty.event` envelopes.
    pub fn subscribe_events(&mut self, state: &AppState, session_id: &str) -> Result<serde_json::Value, GatewayError> {
        let summary = state.sessions.status(session_id)?;
        let subscription_id = harness_protocol::new_id();
        let filter = BusStreamFilter {
            conversation_id: Some(summary.conversation_id.clone()),
            ..Default::default()
        };
        let mut rx = state.bus.subscribe(subscription_id.clone(), filter, state.bus.latest_cursor());

        let session_id_owned = session_id.to_string();
        let out_tx = self.out_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some((_, event)) = rx.recv().await {
                let matches = match &event {
                    DomainEvent::SessionStatus { session_id, .. } => session_id == &session_id_owned,
                    DomainEvent::SessionKeyEvent { session_id, .. } => session_id == &session_id_owned,
                    _ => false,
                };
                if !matches {
                    continue;
                }
                let payload = serde_json::to_value(&event).unwrap_or_default();
                let envelope = ServerEnvelope::PtyEvent {
                    session_id: session_id_owned.clone(),
                    event: payload,
                };
                if !out_tx.send(envelope).await {
                    break;
                }
            }
        });
        if let Some(previous) = self.event_subs.insert(session_id.to_string(), handle) {
            previous.abort();
        }
        Ok(serde_json::json!({ "subscribed": true }))
    }

    pub fn unsubscribe_events(&mut self, session_id: &str) {
        if let Some(handle) = self.event_subs.remove(session_id) {
            handle.abort();
        }
    }

    /// `stream.subscribe`: generic domain-event fan-out, filtered as the
    /// caller asked, replayed from `afterCursor` then kept live.
    pub fn subscribe_stream(&mut self, state: &AppState, filter: BusStreamFilter, after_cursor: u64) -> serde_json::Value {
        let subscription_id = harness_protocol::new_id();
        let mut rx = state.bus.subscribe(subscription_id.clone(), filter, after_cursor);

        let out_tx = self.out_tx.clone();
        let subscription_id_owned = subscription_id.clone();
        let handle = tokio::spawn(async move {
            while let Some((cursor, event)) = rx.recv().await {
                let envelope = ServerEnvelope::StreamEvent {
                    subscription_id: subscription_id_owned.clone(),
                    cursor,
                    event,
                };
                if !out_tx.send(envelope).await {
                    break;
                }
            }
        });
        self.stream_subs.insert(subscription_id.clone(), handle);
        serde_json::json!({ "subscriptionId": subscription_id })
    }

    pub fn unsubscribe_stream(&mut self, subscription_id: &str) {
        if let Some(handle) = self.stream_subs.remove(subscription_id) {
            handle.abort();
        }
    }

    fn teardown(&mut self, state: &AppState) {
        for (_, handle) in self.attachments.drain() {
            handle.abort();
        }
        for (_, handle) in self.event_subs.drain() {
            handle.abort();
        }
        for (_, handle) in self.stream_subs.drain() {
            handle.abort();
        }
        let sessions = state.sessions.clone();
        let connection_id = self.connection_id.clone();
        tokio::spawn(async move {
            sessions.release_by_connection(&connection_id).await;
        });
    }
}

/// Drives one TCP connection end to end: auth gate, line-delimited command
/// loop, and a dedicated serial writer task draining `out_rx` — the only
/// task that ever touches the socket's write half.
pub async fn handle_connection(
    socket: TcpStream,
    state: AppState,
    injector: Arc<LaunchArgsInjector>,
    max_buffered_bytes: usize,
) {
    let connection_id = harness_protocol::new_id();
    let (read_half, write_half) = socket.into_split();
    let (tx, out_rx) = mpsc::channel::<Vec<u8>>(256);
    let queued_bytes = Arc::new(AtomicUsize::new(0));
    let out_tx = OutboundSender {
        tx,
        queued_bytes: queued_bytes.clone(),
        max_buffered_bytes,
    };

    let writer_handle = tokio::spawn(writer_task(write_half, out_rx, queued_bytes));

    let mut conn = ConnectionContext::new(connection_id.clone(), out_tx.clone());
    let mut reader = BufReader::new(read_half).lines();
    let mut authenticated = state.config.auth_token.is_none();

    while let Ok(Some(line)) = reader.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let raw: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                debug!(component = "connection", connection_id = %connection_id, error = %e, "malformed client line");
                continue;
            }
        };
        let envelope: ClientEnvelope = match serde_json::from_value(raw.clone()) {
            Ok(e) => e,
            Err(e) => {
                // The outer `kind` and `request_id` parse fine even when the
                // flattened `CommandRequest`'s `type` doesn't — recover both
                // so an unknown command type still gets a scoped response
                // instead of the whole line being dropped as malformed.
                if raw.get("kind").and_then(|k| k.as_str()) == Some("command") {
                    if let Some(request_id) = raw.get("request_id").and_then(|v| v.as_str()).map(str::to_string) {
                        debug!(component = "connection", connection_id = %connection_id, error = %e, "unsupported command type");
                        let _ = out_tx
                            .send(ServerEnvelope::CommandError {
                                request_id,
                                message: GatewayError::UnsupportedCommandType.as_command_error_message(),
                            })
                            .await;
                        continue;
                    }
                }
                debug!(component = "connection", connection_id = %connection_id, error = %e, "malformed client line");
                continue;
            }
        };

        match envelope {
            ClientEnvelope::Auth { token } => {
                match &state.config.auth_token {
                    None => {
                        authenticated = true;
                        let _ = out_tx.send(ServerEnvelope::AuthOk).await;
                    }
                    Some(expected) if *expected == token => {
                        authenticated = true;
                        let _ = out_tx.send(ServerEnvelope::AuthOk).await;
                    }
                    Some(_) => {
                        let _ = out_tx
                            .send(ServerEnvelope::AuthFail {
                                reason: GatewayError::InvalidAuthToken.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
            _ if !authenticated => {
                let _ = out_tx
                    .send(ServerEnvelope::AuthFail {
                        reason: GatewayError::AuthenticationRequired.to_string(),
                    })
                    .await;
                break;
            }
            ClientEnvelope::Command { request_id, command } => {
                let result = dispatch::dispatch(&state, &mut conn, &injector, command).await;
                let envelope = match result {
                    Ok(value) => ServerEnvelope::CommandResult { request_id, result: value },
                    Err(e) => ServerEnvelope::CommandError {
                        request_id,
                        message: e.as_command_error_message(),
                    },
                };
                if !out_tx.send(envelope).await {
                    break;
                }
            }
            ClientEnvelope::PtyInput { session_id, data_base64 } => {
                if let Ok(data) = BASE64.decode(data_base64) {
                    let _ = state.sessions.input(&session_id, connection_id.clone(), data).await;
                }
            }
            ClientEnvelope::PtyResize { session_id, cols, rows } => {
                let _ = state.sessions.resize(&session_id, connection_id.clone(), cols, rows).await;
            }
            ClientEnvelope::PtySignal { session_id, kind } => {
                let _ = state.sessions.signal(&session_id, connection_id.clone(), kind).await;
            }
        }
    }

    conn.teardown(&state);
    writer_handle.abort();
    info!(component = "connection", connection_id = %connection_id, event = "connection.closed", "connection closed");
}

/// The only task touching the socket's write half. Budget enforcement
/// against `maxConnectionBufferedBytes` happens in `OutboundSender::send`, at
/// enqueue time, against the genuinely-outstanding `queued_bytes` counter —
/// this task just drains already-serialized lines and retires their share of
/// that counter once they've actually left the socket.
async fn writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    queued_bytes: Arc<AtomicUsize>,
) {
    while let Some(line) = out_rx.recv().await {
        let len = line.len();
        let result = write_half.write_all(&line).await;
        queued_bytes.fetch_sub(len, Ordering::SeqCst);
        if result.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_protocol::{AgentType, Scope};
    use harness_pty_core::fake::FakePtyFactory;
    use std::collections::HashMap;

    fn scope() -> Scope {
        Scope {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            workspace_id: "w1".into(),
        }
    }

    fn spec() -> harness_pty_core::PtySpec {
        harness_pty_core::PtySpec {
            cwd: "/tmp".into(),
            program: "sh".into(),
            args: vec![],
            env: HashMap::new(),
            cols: 80,
            rows: 24,
        }
    }

    fn test_sender(max_buffered_bytes: usize) -> (OutboundSender, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        (
            OutboundSender {
                tx,
                queued_bytes: Arc::new(AtomicUsize::new(0)),
                max_buffered_bytes,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn attach_replays_only_output_past_since_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::persistence::Store::open(dir.path()).await.unwrap();
        let bus = Arc::new(crate::subscription::SubscriptionBus::new(100));
        let factory = Arc::new(FakePtyFactory::default());
        let sessions = Arc::new(crate::registry::SessionRegistry::new(store.clone(), bus.clone(), factory.clone(), 50_000));
        let hooks = Arc::new(crate::hooks::HookDispatcher::new(vec![]));
        let config = Arc::new(crate::config::Config::resolve(crate::config::ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }));
        let state = AppState {
            config,
            store,
            bus,
            sessions,
            hooks,
            telemetry_tokens: Arc::new(dashmap::DashMap::new()),
        };

        state
            .sessions
            .start_session("s1".into(), "c1".into(), "d1".into(), scope(), AgentType::Terminal, spec())
            .await
            .unwrap();
        let fake = factory.spawned.lock().unwrap()[0].clone();
        fake.push_output(b"warmup-1");
        fake.push_output(b"warmup-2");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let (out_tx, _out_rx) = test_sender(8 * 1024 * 1024);
        let mut conn = ConnectionContext::new("conn1".into(), out_tx);
        let result = conn.attach(&state, "s1", Some(1)).await.unwrap();

        assert_eq!(result["latestCursor"], 2);
        let backlog = result["backlog"].as_array().unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0]["cursor"], 2);
        let decoded = BASE64.decode(backlog[0]["chunkBase64"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, b"warmup-2");
    }

    #[tokio::test]
    async fn send_destroys_connection_once_outstanding_bytes_exceed_budget() {
        // Each envelope serializes to 56 bytes; nothing drains the channel,
        // so the budget check sees all of them as still outstanding.
        let (out_tx, mut out_rx) = test_sender(150);
        let small = ServerEnvelope::CommandResult {
            request_id: "r1".into(),
            result: serde_json::json!({}),
        };
        assert!(out_tx.send(small.clone()).await);
        assert!(out_tx.send(small.clone()).await);
        // A third copy pushes outstanding bytes (still unread from the
        // channel, so never decremented) past the budget.
        assert!(!out_tx.send(small).await);
        assert!(out_rx.try_recv().is_ok());
    }
}
