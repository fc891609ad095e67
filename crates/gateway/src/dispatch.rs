//! Command dispatch: turns a parsed `CommandRequest` into a
//! `command.result` payload or a `GatewayError`, performing the durable
//! mutation, the registry call, and the corresponding bus publish/hook
//! dispatch as one logical step.

use harness_protocol::{CommandRequest, DomainEvent};
use harness_pty_core::PtySpec;

use crate::connection::ConnectionContext;
use crate::errors::GatewayError;
use crate::launch_args::LaunchArgsInjector;
use crate::registry::SessionListQuery;
use crate::state::AppState;
use crate::subscription::StreamFilter as BusStreamFilter;

pub async fn dispatch(
    state: &AppState,
    conn: &mut ConnectionContext,
    injector: &LaunchArgsInjector,
    command: CommandRequest,
) -> Result<serde_json::Value, GatewayError> {
    match command {
        // -- Directories --
        CommandRequest::DirectoryUpsert { directory_id, scope, path } => {
            let directory = state.store.upsert_directory(directory_id, scope, path).await?;
            state.bus.publish(DomainEvent::DirectoryUpserted { directory: directory.clone() });
            state.hooks.dispatch(&DomainEvent::DirectoryUpserted { directory: directory.clone() });
            Ok(serde_json::to_value(directory).unwrap_or_default())
        }
        CommandRequest::DirectoryArchive { directory_id } => {
            let (directory, archived_conversations) = state.store.archive_directory(directory_id).await?;
            state.bus.publish(DomainEvent::DirectoryArchived { directory: directory.clone() });
            state.hooks.dispatch(&DomainEvent::DirectoryArchived { directory: directory.clone() });
            for conversation in archived_conversations {
                state.bus.publish(DomainEvent::ConversationArchived { conversation: conversation.clone() });
                state.hooks.dispatch(&DomainEvent::ConversationArchived { conversation });
            }
            Ok(serde_json::to_value(directory).unwrap_or_default())
        }
        CommandRequest::DirectoryList { filter, include_archived } => {
            let directories = state.store.list_directories(&filter, include_archived).await?;
            Ok(serde_json::to_value(directories).unwrap_or_default())
        }
        CommandRequest::DirectoryGitStatus { directory_id } => {
            let snapshot = state.store.get_directory_git_status(directory_id).await?;
            Ok(serde_json::to_value(snapshot).unwrap_or_default())
        }

        // -- Conversations --
        CommandRequest::ConversationCreate { directory_id, title, agent_type, scope } => {
            let conversation = state.store.create_conversation(directory_id, title, agent_type, scope).await?;
            state.bus.publish(DomainEvent::ConversationUpdated { conversation: conversation.clone() });
            state.hooks.dispatch(&DomainEvent::ConversationUpdated { conversation: conversation.clone() });
            Ok(serde_json::to_value(conversation).unwrap_or_default())
        }
        CommandRequest::ConversationUpdate { conversation_id, title } => {
            let conversation = state.store.update_conversation(conversation_id, title).await?;
            state.bus.publish(DomainEvent::ConversationUpdated { conversation: conversation.clone() });
            state.hooks.dispatch(&DomainEvent::ConversationUpdated { conversation: conversation.clone() });
            Ok(serde_json::to_value(conversation).unwrap_or_default())
        }
        CommandRequest::ConversationArchive { conversation_id } => {
            let conversation = state.store.archive_conversation(conversation_id).await?;
            state.bus.publish(DomainEvent::ConversationArchived { conversation: conversation.clone() });
            state.hooks.dispatch(&DomainEvent::ConversationArchived { conversation: conversation.clone() });
            Ok(serde_json::to_value(conversation).unwrap_or_default())
        }
        CommandRequest::ConversationDelete { conversation_id } => {
            state.store.delete_conversation(conversation_id).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        CommandRequest::ConversationList { directory_id, include_archived } => {
            let conversations = state.store.list_conversations(directory_id, include_archived).await?;
            Ok(serde_json::to_value(conversations).unwrap_or_default())
        }

        // -- Sessions (PTY lifecycle) --
        CommandRequest::PtyStart { conversation_id } => {
            let conversation = state.store.get_conversation(conversation_id.clone()).await?;
            let directory = state.store.get_directory(conversation.directory_id.clone()).await?;
            let session_id = harness_protocol::new_id();
            let base_args = codex_resume_args(&conversation);
            let plan = injector.build(conversation.agent_type, agent_program(conversation.agent_type), base_args);
            if let Some(token) = &plan.token {
                state.telemetry_tokens.insert(token.clone(), session_id.clone());
            }
            let spec = PtySpec {
                cwd: directory.path.clone(),
                program: plan.program,
                args: plan.args,
                env: Default::default(),
                cols: 80,
                rows: 24,
            };
            let summary = state
                .sessions
                .start_session(
                    session_id,
                    conversation_id,
                    conversation.directory_id,
                    conversation.scope,
                    conversation.agent_type,
                    spec,
                )
                .await?;
            Ok(serde_json::to_value(summary).unwrap_or_default())
        }
        CommandRequest::PtyAttach { session_id, since_cursor } => conn.attach(state, &session_id, since_cursor).await,
        CommandRequest::PtyDetach { session_id } => {
            conn.detach(state, &session_id).await;
            Ok(serde_json::json!({ "detached": true }))
        }
        CommandRequest::PtySubscribeEvents { session_id } => conn.subscribe_events(state, &session_id),
        CommandRequest::PtyUnsubscribeEvents { session_id } => {
            conn.unsubscribe_events(&session_id);
            Ok(serde_json::json!({ "unsubscribed": true }))
        }
        CommandRequest::PtyClose { session_id } => {
            state.sessions.close(&session_id).await?;
            Ok(serde_json::json!({ "closed": true }))
        }

        // -- Sessions (queries/control) --
        CommandRequest::SessionList { filter, directory_id, status, live, sort, limit } => {
            let query = SessionListQuery {
                scope: filter,
                directory_id,
                status,
                live,
                sort,
                limit: limit.map(|l| l as usize),
            };
            Ok(serde_json::to_value(state.sessions.list(&query)).unwrap_or_default())
        }
        CommandRequest::SessionStatus { session_id } => {
            Ok(serde_json::to_value(state.sessions.status(&session_id)?).unwrap_or_default())
        }
        CommandRequest::SessionSnapshot { session_id } => {
            let snapshot = state.sessions.terminal_snapshot(&session_id).await?;
            Ok(serde_json::json!({ "text": snapshot.text, "stale": snapshot.stale }))
        }
        CommandRequest::SessionRespond { session_id, text } => {
            state.sessions.respond(&session_id, conn.connection_id.clone(), text).await?;
            Ok(serde_json::json!({ "accepted": true }))
        }
        CommandRequest::SessionInterrupt { session_id } => {
            state.sessions.interrupt(&session_id, conn.connection_id.clone()).await?;
            Ok(serde_json::json!({ "accepted": true }))
        }
        CommandRequest::SessionClaim { session_id, controller_id, controller_type, takeover } => {
            state
                .sessions
                .claim(&session_id, conn.connection_id.clone(), controller_type, controller_id, takeover)
                .await?;
            Ok(serde_json::json!({ "claimed": true }))
        }
        CommandRequest::SessionRelease { session_id } => {
            let released = state.sessions.release(&session_id, conn.connection_id.clone()).await?;
            Ok(serde_json::json!({ "released": released }))
        }
        CommandRequest::SessionRemove { session_id } => {
            state.sessions.remove(&session_id).await?;
            Ok(serde_json::json!({ "removed": true }))
        }

        // -- Repositories --
        CommandRequest::RepositoryUpsert { repository_id, scope, name, remote_url, default_branch } => {
            let repository = state
                .store
                .upsert_repository(repository_id, scope, name, remote_url, default_branch)
                .await?;
            state.bus.publish(DomainEvent::RepositoryUpserted { repository: repository.clone() });
            state.hooks.dispatch(&DomainEvent::RepositoryUpserted { repository: repository.clone() });
            Ok(serde_json::to_value(repository).unwrap_or_default())
        }
        CommandRequest::RepositoryUpdate { repository_id, name, default_branch } => {
            let repository = state.store.update_repository(repository_id, name, default_branch).await?;
            state.bus.publish(DomainEvent::RepositoryUpserted { repository: repository.clone() });
            state.hooks.dispatch(&DomainEvent::RepositoryUpserted { repository: repository.clone() });
            Ok(serde_json::to_value(repository).unwrap_or_default())
        }
        CommandRequest::RepositoryArchive { repository_id } => {
            let repository = state.store.archive_repository(repository_id).await?;
            state.bus.publish(DomainEvent::RepositoryArchived { repository: repository.clone() });
            state.hooks.dispatch(&DomainEvent::RepositoryArchived { repository: repository.clone() });
            Ok(serde_json::to_value(repository).unwrap_or_default())
        }
        CommandRequest::RepositoryList { filter, include_archived } => {
            let repositories = state.store.list_repositories(&filter, include_archived).await?;
            Ok(serde_json::to_value(repositories).unwrap_or_default())
        }

        // -- Tasks --
        CommandRequest::TaskCreate { scope, repository_id, title, description } => {
            let task = state.store.create_task(scope, repository_id, title, description).await?;
            state.bus.publish(DomainEvent::TaskUpdated { task: task.clone() });
            state.hooks.dispatch(&DomainEvent::TaskUpdated { task: task.clone() });
            Ok(serde_json::to_value(task).unwrap_or_default())
        }
        CommandRequest::TaskUpdate { task_id, title, description } => {
            publish_task_update(state, state.store.update_task(task_id, title, description).await?)
        }
        CommandRequest::TaskArchive { task_id } => publish_task_update(state, state.store.archive_task(task_id).await?),
        CommandRequest::TaskDelete { task_id } => {
            state.store.delete_task(task_id).await?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        CommandRequest::TaskList { filter, repository_id, status } => {
            let tasks = state.store.list_tasks(&filter, repository_id, status).await?;
            Ok(serde_json::to_value(tasks).unwrap_or_default())
        }
        CommandRequest::TaskReady { task_id } => publish_task_update(state, state.store.task_ready(task_id).await?),
        CommandRequest::TaskClaim { task_id, controller_id, directory_id, branch_name, base_branch } => {
            publish_task_update(
                state,
                state.store.task_claim(task_id, controller_id, directory_id, branch_name, base_branch).await?,
            )
        }
        CommandRequest::TaskComplete { task_id } => publish_task_update(state, state.store.task_complete(task_id).await?),
        CommandRequest::TaskQueue { task_id } => publish_task_update(state, state.store.task_queue(task_id).await?),
        CommandRequest::TaskDraft { task_id } => publish_task_update(state, state.store.task_draft(task_id).await?),
        CommandRequest::TaskReorder { filter, ordered_task_ids } => {
            let tasks = state.store.task_reorder(filter, ordered_task_ids).await?;
            state.bus.publish(DomainEvent::TaskReordered { tasks: tasks.clone() });
            state.hooks.dispatch(&DomainEvent::TaskReordered { tasks: tasks.clone() });
            Ok(serde_json::to_value(tasks).unwrap_or_default())
        }
        CommandRequest::TaskSetLinear { task_id, linear } => {
            publish_task_update(state, state.store.task_set_linear(task_id, linear).await?)
        }

        // -- Streams --
        CommandRequest::StreamSubscribe { filter } => {
            let after_cursor = filter.after_cursor.unwrap_or(0);
            Ok(conn.subscribe_stream(state, to_bus_filter(filter), after_cursor))
        }
        CommandRequest::StreamUnsubscribe { subscription_id } => {
            conn.unsubscribe_stream(&subscription_id);
            Ok(serde_json::json!({ "unsubscribed": true }))
        }
    }
}

fn publish_task_update(state: &AppState, task: harness_protocol::Task) -> Result<serde_json::Value, GatewayError> {
    state.bus.publish(DomainEvent::TaskUpdated { task: task.clone() });
    state.hooks.dispatch(&DomainEvent::TaskUpdated { task: task.clone() });
    Ok(serde_json::to_value(task).unwrap_or_default())
}

fn to_bus_filter(filter: harness_protocol::StreamFilter) -> BusStreamFilter {
    BusStreamFilter {
        scope: harness_protocol::ScopeFilter {
            tenant_id: filter.tenant_id,
            user_id: filter.user_id,
            workspace_id: filter.workspace_id,
        },
        directory_id: filter.directory_id,
        conversation_id: filter.conversation_id,
        repository_id: filter.repository_id,
        task_id: filter.task_id,
        include_output: filter.include_output,
    }
}

fn agent_program(agent_type: harness_protocol::AgentType) -> String {
    use harness_protocol::AgentType::*;
    match agent_type {
        Codex => "codex",
        Claude => "claude",
        Cursor => "cursor",
        Terminal => "sh",
        Critique => "critique",
    }
    .to_string()
}

/// Codex conversations that already have a resumable thread id launch with
/// `resume <id>` instead of a fresh session, per the startup-reuse rule.
fn codex_resume_args(conversation: &harness_protocol::Conversation) -> Vec<String> {
    if conversation.agent_type != harness_protocol::AgentType::Codex {
        return Vec::new();
    }
    match conversation.adapter_state.get("resumeSessionId").and_then(|v| v.as_str()) {
        Some(id) => vec!["resume".to_string(), id.to_string()],
        None => Vec::new(),
    }
}

