//! Startup reconciliation: every non-archived conversation
//! gets a session auto-started on boot, resuming codex threads that already
//! have a `resumeSessionId` rather than starting fresh ones.

use harness_protocol::AgentType;
use harness_pty_core::PtySpec;
use tracing::warn;

use crate::launch_args::LaunchArgsInjector;
use crate::state::AppState;

pub async fn reconcile(state: &AppState, injector: &LaunchArgsInjector) {
    let conversations = match state.store.list_conversations(None, false).await {
        Ok(c) => c,
        Err(e) => {
            warn!(component = "startup", error = %e, "failed to list conversations for reconciliation");
            return;
        }
    };

    for conversation in conversations {
        let directory = match state.store.get_directory(conversation.directory_id.clone()).await {
            Ok(d) => d,
            Err(e) => {
                warn!(
                    component = "startup",
                    conversation_id = %conversation.conversation_id,
                    error = %e,
                    "skipping reconciliation, directory unavailable"
                );
                continue;
            }
        };

        let base_args = resume_args(&conversation);
        let plan = injector.build(conversation.agent_type, program_for(conversation.agent_type), base_args);
        let session_id = harness_protocol::new_id();
        if let Some(token) = &plan.token {
            state.telemetry_tokens.insert(token.clone(), session_id.clone());
        }

        let spec = PtySpec {
            cwd: directory.path,
            program: plan.program,
            args: plan.args,
            env: Default::default(),
            cols: 80,
            rows: 24,
        };

        let result = state
            .sessions
            .start_session(
                session_id,
                conversation.conversation_id.clone(),
                conversation.directory_id.clone(),
                conversation.scope.clone(),
                conversation.agent_type,
                spec,
            )
            .await;

        if let Err(e) = result {
            warn!(
                component = "startup",
                conversation_id = %conversation.conversation_id,
                error = %e,
                "failed to auto-start session on reconciliation"
            );
        }
    }
}

fn program_for(agent_type: AgentType) -> String {
    match agent_type {
        AgentType::Codex => "codex",
        AgentType::Claude => "claude",
        AgentType::Cursor => "cursor",
        AgentType::Terminal => "sh",
        AgentType::Critique => "critique",
    }
    .to_string()
}

fn resume_args(conversation: &harness_protocol::Conversation) -> Vec<String> {
    if conversation.agent_type != AgentType::Codex {
        return Vec::new();
    }
    match conversation.adapter_state.get("resumeSessionId").and_then(|v| v.as_str()) {
        Some(id) => vec!["resume".to_string(), id.to_string()],
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_protocol::Scope;
    use std::sync::Arc;

    #[tokio::test]
    async fn reconciliation_starts_a_session_per_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::persistence::Store::open(dir.path()).await.unwrap();
        let bus = Arc::new(crate::subscription::SubscriptionBus::new(100));
        let factory = Arc::new(harness_pty_core::fake::FakePtyFactory::default());
        let sessions = Arc::new(crate::registry::SessionRegistry::new(store.clone(), bus.clone(), factory, 30_000));
        let hooks = Arc::new(crate::hooks::HookDispatcher::new(vec![]));
        let config = Arc::new(crate::config::Config::resolve(crate::config::ConfigOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        }));

        let directory = store
            .upsert_directory(None, Scope::default(), dir.path().to_string_lossy().to_string())
            .await
            .unwrap();
        let conversation = store
            .create_conversation(
                directory.directory_id.clone(),
                "t".into(),
                AgentType::Terminal,
                Scope::default(),
            )
            .await
            .unwrap();

        let state = AppState {
            config,
            store,
            bus,
            sessions: sessions.clone(),
            hooks,
            telemetry_tokens: Arc::new(dashmap::DashMap::new()),
        };
        let injector = LaunchArgsInjector::new("127.0.0.1:8766".parse().unwrap(), true, true);

        reconcile(&state, &injector).await;

        let summary = sessions.list(&crate::registry::SessionListQuery::default());
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].conversation_id, conversation.conversation_id);
    }
}
