//! Observed events: the output of every durable mutation, matched against
//! subscription filters by the Subscription Bus and replayed from the
//! stream journal.

use serde::{Deserialize, Serialize};

use crate::types::{
    Conversation, Directory, DirectoryGitSnapshot, RuntimeStatus, Scope, Task,
};

/// One durable mutation, tagged by `kind`. Every successful mutator in the
/// Durable Store emits exactly one of these (task.reorder emits exactly one
/// `TaskReordered` batch, never one per row).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DomainEvent {
    DirectoryUpserted { directory: Directory },
    DirectoryArchived { directory: Directory },
    ConversationUpdated { conversation: Conversation },
    ConversationArchived { conversation: Conversation },
    SessionStatus {
        session_id: String,
        conversation_id: String,
        scope: Scope,
        status: RuntimeStatus,
        attention_reason: Option<String>,
        live: bool,
    },
    SessionKeyEvent {
        session_id: String,
        event: crate::types::TelemetryEvent,
    },
    RepositoryUpserted { repository: crate::types::Repository },
    RepositoryArchived { repository: crate::types::Repository },
    TaskUpdated { task: Task },
    TaskReordered { tasks: Vec<Task> },
    DirectoryGitUpdated { snapshot: DirectoryGitSnapshot },
    /// Raw PTY output, published only for `stream.subscribe` callers that
    /// opted into `includeOutput` — everyone else filters it out via
    /// `is_output()` before it ever reaches their channel.
    SessionOutput {
        session_id: String,
        conversation_id: String,
        scope: Scope,
        output_cursor: u64,
        chunk_base64: String,
    },
}

impl DomainEvent {
    /// The scope this event was produced under, used for filter matching.
    /// Directory/repository/task-scoped events carry their own scope triple;
    /// session events carry theirs explicitly.
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            DomainEvent::DirectoryUpserted { directory } | DomainEvent::DirectoryArchived { directory } => {
                Some(&directory.scope)
            }
            DomainEvent::ConversationUpdated { conversation }
            | DomainEvent::ConversationArchived { conversation } => Some(&conversation.scope),
            DomainEvent::SessionStatus { scope, .. } => Some(scope),
            DomainEvent::SessionOutput { scope, .. } => Some(scope),
            DomainEvent::RepositoryUpserted { repository } | DomainEvent::RepositoryArchived { repository } => {
                Some(&repository.scope)
            }
            DomainEvent::TaskUpdated { task } => Some(&task.scope),
            DomainEvent::TaskReordered { tasks } => tasks.first().map(|t| &t.scope),
            DomainEvent::DirectoryGitUpdated { .. } | DomainEvent::SessionKeyEvent { .. } => None,
        }
    }

    /// Directory id this event concerns, if any — used by filter matching.
    pub fn directory_id(&self) -> Option<&str> {
        match self {
            DomainEvent::DirectoryUpserted { directory } | DomainEvent::DirectoryArchived { directory } => {
                Some(&directory.directory_id)
            }
            DomainEvent::ConversationUpdated { conversation }
            | DomainEvent::ConversationArchived { conversation } => Some(&conversation.directory_id),
            DomainEvent::DirectoryGitUpdated { snapshot } => Some(&snapshot.directory_id),
            _ => None,
        }
    }

    /// Conversation id this event concerns, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ConversationUpdated { conversation }
            | DomainEvent::ConversationArchived { conversation } => Some(&conversation.conversation_id),
            DomainEvent::SessionStatus { conversation_id, .. } => Some(conversation_id),
            DomainEvent::SessionOutput { conversation_id, .. } => Some(conversation_id),
            _ => None,
        }
    }

    /// Whether any task in this event's payload matches `task_id` — used for
    /// `task.reorder`'s batch-matches-if-any-member-matches filter rule.
    pub fn matches_task(&self, task_id: &str) -> bool {
        match self {
            DomainEvent::TaskUpdated { task } => task.task_id == task_id,
            DomainEvent::TaskReordered { tasks } => tasks.iter().any(|t| t.task_id == task_id),
            _ => false,
        }
    }

    /// Repository id this event concerns, if any.
    pub fn repository_id(&self) -> Option<&str> {
        match self {
            DomainEvent::RepositoryUpserted { repository } | DomainEvent::RepositoryArchived { repository } => {
                Some(&repository.repository_id)
            }
            DomainEvent::TaskUpdated { task } => task.repository_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this event carries PTY output bytes — output is only ever
    /// published to the stream bus for subscribers who asked for it via
    /// `includeOutput`; `StreamFilter::matches` drops it for everyone else.
    pub fn is_output(&self) -> bool {
        matches!(self, DomainEvent::SessionOutput { .. })
    }
}
