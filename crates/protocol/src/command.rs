//! Command requests carried inside a `command` client envelope, and the
//! structured results a `command.result` envelope carries back.

use serde::{Deserialize, Serialize};

use crate::types::{AgentType, LinearMetadata, Scope, SessionSort, TaskStatus};

/// Filter for `directory.list`/`conversation.list`/`repository.list`/`task.list`/`session.list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CommandRequest {
    // -- Directories --
    DirectoryUpsert {
        directory_id: Option<String>,
        scope: Scope,
        path: String,
    },
    DirectoryArchive {
        directory_id: String,
    },
    DirectoryList {
        #[serde(flatten)]
        filter: ScopeFilter,
        include_archived: bool,
    },
    DirectoryGitStatus {
        directory_id: String,
    },

    // -- Conversations --
    ConversationCreate {
        directory_id: String,
        title: String,
        agent_type: AgentType,
        scope: Scope,
    },
    ConversationUpdate {
        conversation_id: String,
        title: Option<String>,
    },
    ConversationArchive {
        conversation_id: String,
    },
    ConversationDelete {
        conversation_id: String,
    },
    ConversationList {
        directory_id: Option<String>,
        include_archived: bool,
    },

    // -- Sessions (PTY lifecycle) --
    PtyStart {
        conversation_id: String,
    },
    PtyAttach {
        session_id: String,
        since_cursor: Option<u64>,
    },
    PtyDetach {
        session_id: String,
    },
    PtySubscribeEvents {
        session_id: String,
    },
    PtyUnsubscribeEvents {
        session_id: String,
    },
    PtyClose {
        session_id: String,
    },

    // -- Sessions (queries/control) --
    SessionList {
        #[serde(flatten)]
        filter: ScopeFilter,
        directory_id: Option<String>,
        status: Option<crate::types::RuntimeStatus>,
        live: Option<bool>,
        sort: Option<SessionSort>,
        limit: Option<u32>,
    },
    SessionStatus {
        session_id: String,
    },
    SessionSnapshot {
        session_id: String,
    },
    SessionRespond {
        session_id: String,
        text: String,
    },
    SessionInterrupt {
        session_id: String,
    },
    SessionClaim {
        session_id: String,
        controller_id: String,
        controller_type: String,
        takeover: bool,
    },
    SessionRelease {
        session_id: String,
    },
    SessionRemove {
        session_id: String,
    },

    // -- Repositories --
    RepositoryUpsert {
        repository_id: Option<String>,
        scope: Scope,
        name: String,
        remote_url: Option<String>,
        default_branch: Option<String>,
    },
    RepositoryUpdate {
        repository_id: String,
        name: Option<String>,
        default_branch: Option<String>,
    },
    RepositoryArchive {
        repository_id: String,
    },
    RepositoryList {
        #[serde(flatten)]
        filter: ScopeFilter,
        include_archived: bool,
    },

    // -- Tasks --
    TaskCreate {
        scope: Scope,
        repository_id: Option<String>,
        title: String,
        description: Option<String>,
    },
    TaskUpdate {
        task_id: String,
        title: Option<String>,
        description: Option<String>,
    },
    TaskArchive {
        task_id: String,
    },
    TaskDelete {
        task_id: String,
    },
    TaskList {
        #[serde(flatten)]
        filter: ScopeFilter,
        repository_id: Option<String>,
        status: Option<TaskStatus>,
    },
    TaskReady {
        task_id: String,
    },
    TaskClaim {
        task_id: String,
        controller_id: String,
        directory_id: String,
        branch_name: Option<String>,
        base_branch: Option<String>,
    },
    TaskComplete {
        task_id: String,
    },
    TaskQueue {
        task_id: String,
    },
    TaskDraft {
        task_id: String,
    },
    TaskReorder {
        #[serde(flatten)]
        filter: ScopeFilter,
        ordered_task_ids: Vec<String>,
    },
    TaskSetLinear {
        task_id: String,
        linear: Option<LinearMetadata>,
    },

    // -- Streams --
    StreamSubscribe {
        #[serde(flatten)]
        filter: StreamFilter,
    },
    StreamUnsubscribe {
        subscription_id: String,
    },
}

/// Filter attached to a `stream.subscribe` command — mirrors the
/// internal `Subscription` filter used by the bus, plus a replay cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamFilter {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub directory_id: Option<String>,
    pub conversation_id: Option<String>,
    pub repository_id: Option<String>,
    pub task_id: Option<String>,
    #[serde(default)]
    pub include_output: bool,
    pub after_cursor: Option<u64>,
}
