//! Telemetry Ingestor: a second loopback HTTP listener that accepts
//! OTLP-shaped POSTs from launched codex agents and turns them into runtime
//! status updates.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use dashmap::DashMap;
use harness_protocol::{AdapterState, DomainEvent, DynValue, RuntimeStatus, TelemetryEvent, TelemetrySource};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::persistence::Store;
use crate::registry::SessionRegistry;
use crate::subscription::SubscriptionBus;
use crate::time::now_ts;
use crate::transition::Input as TransitionInput;

/// Dedup key for the "identical consecutive events" idempotence rule.
type DedupKey = (String, String, Option<String>, Option<String>);

#[derive(Clone)]
pub struct TelemetryState {
    pub store: Store,
    pub bus: Arc<SubscriptionBus>,
    pub sessions: Arc<SessionRegistry>,
    /// token -> session id, shared with the launch-args injector.
    pub tokens: Arc<DashMap<String, String>>,
    last_seen: Arc<DashMap<String, DedupKey>>,
}

impl TelemetryState {
    pub fn new(
        store: Store,
        bus: Arc<SubscriptionBus>,
        sessions: Arc<SessionRegistry>,
        tokens: Arc<DashMap<String, String>>,
    ) -> Self {
        TelemetryState {
            store,
            bus,
            sessions,
            tokens,
            last_seen: Arc::new(DashMap::new()),
        }
    }
}

pub fn router(state: TelemetryState) -> Router {
    Router::new()
        .route("/v1/:kind/:token", post(ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ingest(
    Path((kind, token)): Path<(String, String)>,
    State(state): State<TelemetryState>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let source = match kind.as_str() {
        "logs" => TelemetrySource::OtlpLog,
        "metrics" => TelemetrySource::OtlpMetric,
        "traces" => TelemetrySource::OtlpTrace,
        _ => return StatusCode::NOT_FOUND,
    };

    let Some(session_id) = state.tokens.get(&token).map(|r| r.clone()) else {
        return StatusCode::NOT_FOUND;
    };

    if body.is_empty() {
        return StatusCode::OK;
    }

    let payload: DynValue = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(component = "telemetry", error = %e, "malformed telemetry body");
            return StatusCode::BAD_REQUEST;
        }
    };

    let events = normalize(source, &payload);
    for event in events {
        handle_event(&state, &session_id, event).await;
    }

    StatusCode::OK
}

/// Decode one OTLP-shaped batch (or a history line's JSON object) into zero
/// or more normalized events.
fn normalize(source: TelemetrySource, payload: &DynValue) -> Vec<TelemetryEvent> {
    match source {
        TelemetrySource::OtlpLog => normalize_logs(payload),
        TelemetrySource::OtlpMetric => normalize_metrics(payload),
        TelemetrySource::OtlpTrace => normalize_traces(payload),
        TelemetrySource::History => normalize_history_line(payload).into_iter().collect(),
    }
}

fn normalize_logs(payload: &DynValue) -> Vec<TelemetryEvent> {
    let mut out = Vec::new();
    for record in log_records(payload) {
        let attrs = attributes(&record);
        let event_name = attrs
            .get("event.name")
            .and_then(DynValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let observed_at = record
            .get("timeUnixNano")
            .and_then(DynValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(now_ts);
        let provider_thread_id = attrs.get("session_id").and_then(DynValue::as_str).map(str::to_string);
        let summary = record.get("body").and_then(|b| b.get("stringValue")).and_then(DynValue::as_str).map(str::to_string);

        let kind = attrs.get("kind").and_then(DynValue::as_str);
        let status_hint = match kind {
            Some("response.completed") => Some(RuntimeStatus::Completed),
            Some("response.in_progress") => continue, // dropped in lifecycle-fast mode
            _ if event_name == "codex.user_prompt" => Some(RuntimeStatus::Running),
            _ if event_name.contains("needs-input") => Some(RuntimeStatus::NeedsInput),
            _ => None,
        };

        out.push(TelemetryEvent {
            source: TelemetrySource::OtlpLog,
            observed_at,
            event_name,
            severity: record.get("severityText").and_then(DynValue::as_str).map(str::to_string),
            summary,
            provider_thread_id,
            status_hint,
            payload: record,
        });
    }
    out
}

fn normalize_metrics(payload: &DynValue) -> Vec<TelemetryEvent> {
    let mut out = Vec::new();
    for metric in metric_points(payload) {
        let name = metric.get("name").and_then(DynValue::as_str).unwrap_or("unknown").to_string();
        let attrs = attributes(&metric);
        let status_hint = if name == "codex.turn.e2e_duration_ms" {
            Some(RuntimeStatus::Completed)
        } else {
            None
        };
        out.push(TelemetryEvent {
            source: TelemetrySource::OtlpMetric,
            observed_at: now_ts(),
            event_name: name,
            severity: None,
            summary: None,
            provider_thread_id: attrs.get("session_id").and_then(DynValue::as_str).map(str::to_string),
            status_hint,
            payload: metric,
        });
    }
    out
}

fn normalize_traces(payload: &DynValue) -> Vec<TelemetryEvent> {
    let mut out = Vec::new();
    for span in spans(payload) {
        let name = span.get("name").and_then(DynValue::as_str).unwrap_or("unknown").to_string();
        let attrs = attributes(&span);
        let status_hint = if name == "codex.websocket_event" {
            Some(RuntimeStatus::Running)
        } else {
            None
        };
        out.push(TelemetryEvent {
            source: TelemetrySource::OtlpTrace,
            observed_at: now_ts(),
            event_name: name,
            severity: None,
            summary: None,
            provider_thread_id: attrs.get("session_id").and_then(DynValue::as_str).map(str::to_string),
            status_hint,
            payload: span,
        });
    }
    out
}

pub(crate) fn normalize_history_line(payload: &DynValue) -> Option<TelemetryEvent> {
    let event_name = payload.get("type")?.as_str()?.to_string();
    let status_hint = match event_name.as_str() {
        "response.completed" => Some(RuntimeStatus::Completed),
        "user_prompt" => Some(RuntimeStatus::Running),
        _ => None,
    };
    Some(TelemetryEvent {
        source: TelemetrySource::History,
        observed_at: payload
            .get("timestamp")
            .and_then(DynValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(now_ts),
        event_name,
        severity: None,
        summary: payload.get("summary").and_then(DynValue::as_str).map(str::to_string),
        provider_thread_id: payload.get("session_id").and_then(DynValue::as_str).map(str::to_string),
        status_hint,
        payload: payload.clone(),
    })
}

fn log_records(payload: &DynValue) -> Vec<DynValue> {
    walk(payload, &["resourceLogs", "scopeLogs", "logRecords"])
}

fn metric_points(payload: &DynValue) -> Vec<DynValue> {
    walk(payload, &["resourceMetrics", "scopeMetrics", "metrics"])
}

fn spans(payload: &DynValue) -> Vec<DynValue> {
    walk(payload, &["resourceSpans", "scopeSpans", "spans"])
}

/// Walks a three-level OTLP `resourceX -> scopeX -> items` nesting.
fn walk(payload: &DynValue, path: &[&str]) -> Vec<DynValue> {
    let Some(top) = payload.get(path[0]).and_then(DynValue::as_array) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for resource in top {
        collect(resource, &path[1..], &mut out);
    }
    out
}

fn collect(node: &DynValue, path: &[&str], out: &mut Vec<DynValue>) {
    if path.is_empty() {
        out.push(node.clone());
        return;
    }
    if let Some(arr) = node.get(path[0]).and_then(DynValue::as_array) {
        for child in arr {
            collect(child, &path[1..], out);
        }
    }
}

fn attributes(node: &DynValue) -> HashMap<String, DynValue> {
    let mut out = HashMap::new();
    if let Some(attrs) = node.get("attributes").and_then(DynValue::as_array) {
        for attr in attrs {
            let Some(key) = attr.get("key").and_then(DynValue::as_str) else {
                continue;
            };
            let value = attr
                .get("value")
                .and_then(|v| v.get("stringValue").or_else(|| v.get("intValue")).or_else(|| v.get("boolValue")))
                .cloned()
                .unwrap_or(DynValue::Null);
            out.insert(key.to_string(), value);
        }
    }
    out
}

/// Resolves a `providerThreadId` to a live session id by scanning
/// non-archived conversations for a matching `adapterState.resumeSessionId`
/// — the history poller's binding path, since tailed lines carry no token.
pub(crate) async fn resolve_session_for_thread(state: &TelemetryState, thread_id: &str) -> Option<String> {
    let conversations = state.store.list_conversations(None, false).await.ok()?;
    let conversation_id = conversations
        .into_iter()
        .find(|c| {
            c.adapter_state
                .get("resumeSessionId")
                .and_then(DynValue::as_str)
                .is_some_and(|id| id == thread_id)
        })
        .map(|c| c.conversation_id)?;

    state
        .sessions
        .list(&crate::registry::SessionListQuery::default())
        .into_iter()
        .find(|s| s.conversation_id == conversation_id)
        .map(|s| s.session_id)
}

pub(crate) async fn handle_event(state: &TelemetryState, token_session_id: &str, event: TelemetryEvent) {
    let dedup_key = (
        event.observed_at.clone(),
        event.event_name.clone(),
        event.provider_thread_id.clone(),
        event.summary.clone(),
    );
    if state
        .last_seen
        .get(token_session_id)
        .is_some_and(|prev| *prev == dedup_key)
    {
        return;
    }
    state.last_seen.insert(token_session_id.to_string(), dedup_key);

    let Ok(summary) = state.sessions.status(token_session_id) else {
        warn!(component = "telemetry", session_id = %token_session_id, "telemetry for unknown session");
        return;
    };
    let conversation_id = summary.conversation_id.clone();

    if let Some(hint) = event.status_hint {
        let attention_reason = match hint {
            RuntimeStatus::NeedsInput => Some(Some(event.event_name.clone())),
            _ => Some(None),
        };
        let transition = state
            .sessions
            .apply_transition(
                token_session_id,
                TransitionInput::StatusHint(hint),
                attention_reason.clone(),
                Some(event.observed_at.clone()),
            )
            .await;
        match transition {
            Ok(()) => {
                let live = hint != RuntimeStatus::Exited;
                let _ = state
                    .store
                    .set_runtime_status(conversation_id.clone(), Some(hint), Some(live), attention_reason)
                    .await;
            }
            Err(e) => {
                debug!(component = "telemetry", session_id = %token_session_id, error = %e, "transition rejected, durable status left untouched");
            }
        }
    }

    if event.source != TelemetrySource::History {
        if let Some(thread_id) = &event.provider_thread_id {
            let mut patch = AdapterState::new();
            patch.insert("resumeSessionId".to_string(), DynValue::String(thread_id.clone()));
            patch.insert("lastObservedAt".to_string(), DynValue::String(event.observed_at.clone()));
            let _ = state.store.set_adapter_state(conversation_id.clone(), patch).await;
        }
    }

    state.bus.publish(DomainEvent::SessionKeyEvent {
        session_id: token_session_id.to_string(),
        event,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_extracts_otlp_log_records() {
        let payload = serde_json::json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [{"severityText": "INFO"}]
                }]
            }]
        });
        let records = log_records(&payload);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn attributes_reads_string_values() {
        let node = serde_json::json!({
            "attributes": [{"key": "event.name", "value": {"stringValue": "codex.user_prompt"}}]
        });
        let attrs = attributes(&node);
        assert_eq!(attrs.get("event.name").and_then(DynValue::as_str), Some("codex.user_prompt"));
    }

    #[test]
    fn response_completed_log_maps_to_completed_status() {
        let payload = serde_json::json!({
            "resourceLogs": [{"scopeLogs": [{"logRecords": [{
                "attributes": [{"key": "kind", "value": {"stringValue": "response.completed"}}]
            }]}]}]
        });
        let events = normalize_logs(&payload);
        assert_eq!(events[0].status_hint, Some(RuntimeStatus::Completed));
    }

    #[test]
    fn response_in_progress_is_dropped() {
        let payload = serde_json::json!({
            "resourceLogs": [{"scopeLogs": [{"logRecords": [{
                "attributes": [{"key": "kind", "value": {"stringValue": "response.in_progress"}}]
            }]}]}]
        });
        assert!(normalize_logs(&payload).is_empty());
    }

    #[test]
    fn turn_duration_metric_maps_to_completed() {
        let payload = serde_json::json!({
            "resourceMetrics": [{"scopeMetrics": [{"metrics": [{"name": "codex.turn.e2e_duration_ms"}]}]}]
        });
        let events = normalize_metrics(&payload);
        assert_eq!(events[0].status_hint, Some(RuntimeStatus::Completed));
    }

    fn key_event(status_hint: Option<RuntimeStatus>, observed_at: &str) -> TelemetryEvent {
        TelemetryEvent {
            source: TelemetrySource::Otlp,
            observed_at: observed_at.to_string(),
            event_name: "codex.response.completed".into(),
            severity: None,
            summary: None,
            provider_thread_id: None,
            status_hint,
            payload: DynValue::Null,
        }
    }

    /// A telemetry event arriving after a session has already exited must
    /// not resurrect its durable runtime status — exit is terminal until
    /// the session id is recycled.
    #[tokio::test]
    async fn late_event_after_exit_does_not_resurrect_durable_status() {
        use harness_protocol::{AgentType, Scope};
        use harness_pty_core::fake::FakePtyFactory;

        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let bus = Arc::new(SubscriptionBus::new(100));
        let factory = Arc::new(FakePtyFactory::default());
        let sessions = Arc::new(SessionRegistry::new(store.clone(), bus.clone(), factory.clone(), 50));

        let scope = Scope {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            workspace_id: "w1".into(),
        };
        let directory = store.upsert_directory(None, scope.clone(), "/tmp".into()).await.unwrap();
        let conversation = store
            .create_conversation(directory.directory_id.clone(), "session".into(), AgentType::Terminal, scope.clone())
            .await
            .unwrap();

        sessions
            .start_session(
                "s1".into(),
                conversation.conversation_id.clone(),
                directory.directory_id.clone(),
                scope,
                AgentType::Terminal,
                harness_pty_core::PtySpec {
                    cwd: "/tmp".into(),
                    program: "sh".into(),
                    args: vec![],
                    env: std::collections::HashMap::new(),
                    cols: 80,
                    rows: 24,
                },
            )
            .await
            .unwrap();

        let fake = factory.spawned.lock().unwrap()[0].clone();
        fake.push_exit(harness_pty_core::PtyExitStatus { code: Some(0), signal: None });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sessions.status("s1").unwrap().status, RuntimeStatus::Exited);

        let tokens = Arc::new(DashMap::new());
        tokens.insert("tok1".to_string(), "s1".to_string());
        let state = TelemetryState::new(store.clone(), bus, sessions, tokens);

        handle_event(&state, "s1", key_event(Some(RuntimeStatus::Completed), "2026-01-01T00:00:01Z")).await;

        let persisted = state.store.get_conversation(conversation.conversation_id).await.unwrap();
        assert_eq!(persisted.runtime_status, RuntimeStatus::Exited);
        assert!(!persisted.runtime_live);
    }
}
