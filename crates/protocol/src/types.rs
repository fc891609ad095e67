//! Core domain types shared across the protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Agent implementation bound to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Codex,
    Claude,
    Cursor,
    Terminal,
    Critique,
}

/// Derived runtime status for a conversation's live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    NeedsInput,
    Completed,
    Exited,
}

/// Sort order for `session.list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionSort {
    AttentionFirst,
    StartedAsc,
    StartedDesc,
}

/// Status of a backlog task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Draft,
    Ready,
    InProgress,
    Completed,
}

/// Scope triple carried on every durable row and every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub tenant_id: String,
    pub user_id: String,
    pub workspace_id: String,
}

/// A workspace-rooted filesystem path the gateway tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directory {
    pub directory_id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub path: String,
    pub created_at: String,
    pub archived_at: Option<String>,
}

/// An opaque JSON value, used for dynamic/extensible payloads.
pub type DynValue = serde_json::Value;

/// Adapter-specific resumption state, keyed by field name (e.g. codex's
/// `resumeSessionId`/`lastObservedAt`).
pub type AdapterState = HashMap<String, DynValue>;

/// An agent interaction bound to a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub directory_id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub title: String,
    pub agent_type: AgentType,
    pub adapter_state: AdapterState,
    pub runtime_status: RuntimeStatus,
    /// Canonical field — kept in lockstep with `runtime_status` by
    /// `set_runtime_status` so the two can never diverge. See DESIGN.md.
    pub runtime_status_model: RuntimeStatus,
    pub runtime_live: bool,
    pub archived_at: Option<String>,
}

/// Tracked remote/project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub repository_id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub name: String,
    pub remote_url: Option<String>,
    pub default_branch: Option<String>,
    pub metadata: DynValue,
    pub archived_at: Option<String>,
}

/// Linear-integration metadata attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearMetadata {
    pub issue_id: String,
    pub issue_identifier: String,
    pub url: String,
}

/// An ordered backlog item scoped to a repository or project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub repository_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub order_index: i64,
    pub claimed_by_controller_id: Option<String>,
    pub claimed_by_directory_id: Option<String>,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub linear: Option<LinearMetadata>,
    pub archived_at: Option<String>,
}

/// Cached git working-tree summary for a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSummary {
    pub branch: Option<String>,
    pub changed_files: u32,
    pub additions: u32,
    pub deletions: u32,
}

/// Cached repository-identity probe for a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitRepositoryProbe {
    pub normalized_remote_url: Option<String>,
    pub commit_count: Option<u64>,
    pub last_commit_at: Option<String>,
    pub short_commit_hash: Option<String>,
    pub inferred_name: Option<String>,
    pub default_branch: Option<String>,
}

/// The full snapshot the git-status monitor caches per directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryGitSnapshot {
    pub directory_id: String,
    pub summary: GitSummary,
    pub repository: Option<GitRepositoryProbe>,
    pub observed_at: String,
}

/// A telemetry source as ingested by the Telemetry Ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TelemetrySource {
    OtlpLog,
    OtlpMetric,
    OtlpTrace,
    History,
}

/// A normalized telemetry event, independent of its OTLP/history origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub source: TelemetrySource,
    pub observed_at: String,
    pub event_name: String,
    pub severity: Option<String>,
    pub summary: Option<String>,
    pub provider_thread_id: Option<String>,
    pub status_hint: Option<RuntimeStatus>,
    pub payload: DynValue,
}

/// Public-facing summary of a live session, as returned by `session.list`/`session.status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub conversation_id: String,
    pub directory_id: String,
    #[serde(flatten)]
    pub scope: Scope,
    pub agent_type: AgentType,
    pub status: RuntimeStatus,
    pub attention_reason: Option<String>,
    pub live: bool,
    pub started_at: String,
    pub last_event_at: Option<String>,
    pub exited_at: Option<String>,
}
