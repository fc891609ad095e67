//! Durable Store: transactional SQLite-backed persistence of
//! directories, conversations, repositories, tasks, and git snapshots.
//!
//! All writes funnel through a single-writer task (`PersistenceWriter`) so
//! readers — which open their own short-lived read-only connections —
//! never contend with the writer under SQLite's WAL journal mode.

use std::path::{Path, PathBuf};

use harness_protocol::{
    Conversation, Directory, DirectoryGitSnapshot, GitRepositoryProbe, GitSummary, LinearMetadata,
    Repository, RuntimeStatus, Scope, ScopeFilter, Task, TaskStatus,
};
use rusqlite::{params, Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::errors::GatewayError;
use crate::time::now_ts;

const WRITER_BATCH_SIZE: usize = 50;

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

pub enum PersistCommand {
    UpsertDirectory {
        directory_id: Option<String>,
        scope: Scope,
        path: String,
        reply: Reply<Directory>,
    },
    ArchiveDirectory {
        directory_id: String,
        reply: Reply<(Directory, Vec<Conversation>)>,
    },
    CreateConversation {
        directory_id: String,
        title: String,
        agent_type: harness_protocol::AgentType,
        scope: Scope,
        reply: Reply<Conversation>,
    },
    UpdateConversation {
        conversation_id: String,
        title: Option<String>,
        reply: Reply<Conversation>,
    },
    ArchiveConversation {
        conversation_id: String,
        reply: Reply<Conversation>,
    },
    DeleteConversation {
        conversation_id: String,
        reply: Reply<()>,
    },
    UpdateConversationRuntime {
        conversation_id: String,
        status: Option<RuntimeStatus>,
        live: Option<bool>,
        attention_reason: Option<Option<String>>,
        reply: Reply<Conversation>,
    },
    SetAdapterState {
        conversation_id: String,
        patch: harness_protocol::AdapterState,
        reply: Reply<Conversation>,
    },
    UpsertRepository {
        repository_id: Option<String>,
        scope: Scope,
        name: String,
        remote_url: Option<String>,
        default_branch: Option<String>,
        reply: Reply<Repository>,
    },
    UpdateRepository {
        repository_id: String,
        name: Option<String>,
        default_branch: Option<String>,
        reply: Reply<Repository>,
    },
    ArchiveRepository {
        repository_id: String,
        reply: Reply<Repository>,
    },
    CreateTask {
        scope: Scope,
        repository_id: Option<String>,
        title: String,
        description: Option<String>,
        reply: Reply<Task>,
    },
    UpdateTask {
        task_id: String,
        title: Option<String>,
        description: Option<String>,
        reply: Reply<Task>,
    },
    ArchiveTask {
        task_id: String,
        reply: Reply<Task>,
    },
    DeleteTask {
        task_id: String,
        reply: Reply<()>,
    },
    TaskReady {
        task_id: String,
        reply: Reply<Task>,
    },
    TaskClaim {
        task_id: String,
        controller_id: String,
        directory_id: String,
        branch_name: Option<String>,
        base_branch: Option<String>,
        reply: Reply<Task>,
    },
    TaskComplete {
        task_id: String,
        reply: Reply<Task>,
    },
    TaskQueue {
        task_id: String,
        reply: Reply<Task>,
    },
    TaskDraft {
        task_id: String,
        reply: Reply<Task>,
    },
    TaskReorder {
        filter: ScopeFilter,
        ordered_task_ids: Vec<String>,
        reply: Reply<Vec<Task>>,
    },
    TaskSetLinear {
        task_id: String,
        linear: Option<LinearMetadata>,
        reply: Reply<Task>,
    },
    UpsertDirectoryGitStatus {
        snapshot: DirectoryGitSnapshot,
        reply: Reply<Option<DirectoryGitSnapshot>>,
    },
}

/// Handle to the durable store. Cheap to clone; all clones share one writer.
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
    writer_tx: mpsc::Sender<PersistCommand>,
}

impl Store {
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("control-plane.sqlite");
        {
            let mut conn = Connection::open(&db_path)?;
            crate::migration_runner::run_migrations(&mut conn)?;
        }

        let (tx, rx) = mpsc::channel(1024);
        let writer_path = db_path.clone();
        tokio::spawn(async move {
            run_writer(writer_path, rx).await;
        });

        Ok(Store {
            db_path,
            writer_tx: tx,
        })
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> PersistCommand,
    ) -> Result<T, GatewayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.writer_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| GatewayError::Internal("persistence writer closed".into()))?;
        reply_rx
            .await
            .map_err(|_| GatewayError::Internal("persistence writer dropped reply".into()))?
    }

    fn read_conn(&self) -> Result<Connection, GatewayError> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(GatewayError::from)
    }

    // -- Directories --

    pub async fn upsert_directory(
        &self,
        directory_id: Option<String>,
        scope: Scope,
        path: String,
    ) -> Result<Directory, GatewayError> {
        self.send(|reply| PersistCommand::UpsertDirectory {
            directory_id,
            scope,
            path,
            reply,
        })
        .await
    }

    pub async fn archive_directory(
        &self,
        directory_id: String,
    ) -> Result<(Directory, Vec<Conversation>), GatewayError> {
        self.send(|reply| PersistCommand::ArchiveDirectory {
            directory_id,
            reply,
        })
        .await
    }

    pub async fn list_directories(
        &self,
        filter: &ScopeFilter,
        include_archived: bool,
    ) -> Result<Vec<Directory>, GatewayError> {
        let filter = filter.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            list_directories_sync(&conn, &filter, include_archived)
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    pub async fn get_directory(&self, directory_id: String) -> Result<Directory, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            find_directory(&conn, &directory_id)?.ok_or_else(|| GatewayError::DirectoryNotFound(directory_id.clone()))
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    // -- Conversations --

    pub async fn create_conversation(
        &self,
        directory_id: String,
        title: String,
        agent_type: harness_protocol::AgentType,
        scope: Scope,
    ) -> Result<Conversation, GatewayError> {
        self.send(|reply| PersistCommand::CreateConversation {
            directory_id,
            title,
            agent_type,
            scope,
            reply,
        })
        .await
    }

    pub async fn update_conversation(
        &self,
        conversation_id: String,
        title: Option<String>,
    ) -> Result<Conversation, GatewayError> {
        self.send(|reply| PersistCommand::UpdateConversation {
            conversation_id,
            title,
            reply,
        })
        .await
    }

    pub async fn archive_conversation(
        &self,
        conversation_id: String,
    ) -> Result<Conversation, GatewayError> {
        self.send(|reply| PersistCommand::ArchiveConversation {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn delete_conversation(&self, conversation_id: String) -> Result<(), GatewayError> {
        self.send(|reply| PersistCommand::DeleteConversation {
            conversation_id,
            reply,
        })
        .await
    }

    /// The single path that writes `runtime_status`/`runtime_status_model`,
    /// keeping the two fields in lockstep (see DESIGN.md Open Question).
    pub async fn set_runtime_status(
        &self,
        conversation_id: String,
        status: Option<RuntimeStatus>,
        live: Option<bool>,
        attention_reason: Option<Option<String>>,
    ) -> Result<Conversation, GatewayError> {
        self.send(|reply| PersistCommand::UpdateConversationRuntime {
            conversation_id,
            status,
            live,
            attention_reason,
            reply,
        })
        .await
    }

    /// Merges `patch` into `adapter_state`. Only called for codex
    /// conversations; other agent types never produce a patch.
    pub async fn set_adapter_state(
        &self,
        conversation_id: String,
        patch: harness_protocol::AdapterState,
    ) -> Result<Conversation, GatewayError> {
        self.send(|reply| PersistCommand::SetAdapterState {
            conversation_id,
            patch,
            reply,
        })
        .await
    }

    pub async fn list_conversations(
        &self,
        directory_id: Option<String>,
        include_archived: bool,
    ) -> Result<Vec<Conversation>, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            list_conversations_sync(&conn, directory_id.as_deref(), include_archived)
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    pub async fn get_conversation(&self, conversation_id: String) -> Result<Conversation, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            find_conversation(&conn, &conversation_id)?
                .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.clone()))
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    // -- Repositories --

    pub async fn upsert_repository(
        &self,
        repository_id: Option<String>,
        scope: Scope,
        name: String,
        remote_url: Option<String>,
        default_branch: Option<String>,
    ) -> Result<Repository, GatewayError> {
        self.send(|reply| PersistCommand::UpsertRepository {
            repository_id,
            scope,
            name,
            remote_url,
            default_branch,
            reply,
        })
        .await
    }

    pub async fn update_repository(
        &self,
        repository_id: String,
        name: Option<String>,
        default_branch: Option<String>,
    ) -> Result<Repository, GatewayError> {
        self.send(|reply| PersistCommand::UpdateRepository {
            repository_id,
            name,
            default_branch,
            reply,
        })
        .await
    }

    pub async fn archive_repository(&self, repository_id: String) -> Result<Repository, GatewayError> {
        self.send(|reply| PersistCommand::ArchiveRepository {
            repository_id,
            reply,
        })
        .await
    }

    pub async fn list_repositories(
        &self,
        filter: &ScopeFilter,
        include_archived: bool,
    ) -> Result<Vec<Repository>, GatewayError> {
        let filter = filter.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            list_repositories_sync(&conn, &filter, include_archived)
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    pub async fn get_repository(&self, repository_id: String) -> Result<Repository, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            find_repository(&conn, &repository_id)?
                .ok_or_else(|| GatewayError::RepositoryNotFound(repository_id.clone()))
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    // -- Tasks --

    #[allow(clippy::too_many_arguments)]
    pub async fn create_task(
        &self,
        scope: Scope,
        repository_id: Option<String>,
        title: String,
        description: Option<String>,
    ) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::CreateTask {
            scope,
            repository_id,
            title,
            description,
            reply,
        })
        .await
    }

    pub async fn update_task(
        &self,
        task_id: String,
        title: Option<String>,
        description: Option<String>,
    ) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::UpdateTask {
            task_id,
            title,
            description,
            reply,
        })
        .await
    }

    pub async fn archive_task(&self, task_id: String) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::ArchiveTask { task_id, reply }).await
    }

    pub async fn delete_task(&self, task_id: String) -> Result<(), GatewayError> {
        self.send(|reply| PersistCommand::DeleteTask { task_id, reply }).await
    }

    pub async fn task_ready(&self, task_id: String) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::TaskReady { task_id, reply }).await
    }

    pub async fn task_claim(
        &self,
        task_id: String,
        controller_id: String,
        directory_id: String,
        branch_name: Option<String>,
        base_branch: Option<String>,
    ) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::TaskClaim {
            task_id,
            controller_id,
            directory_id,
            branch_name,
            base_branch,
            reply,
        })
        .await
    }

    pub async fn task_complete(&self, task_id: String) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::TaskComplete { task_id, reply }).await
    }

    pub async fn task_queue(&self, task_id: String) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::TaskQueue { task_id, reply }).await
    }

    pub async fn task_draft(&self, task_id: String) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::TaskDraft { task_id, reply }).await
    }

    pub async fn task_reorder(
        &self,
        filter: ScopeFilter,
        ordered_task_ids: Vec<String>,
    ) -> Result<Vec<Task>, GatewayError> {
        self.send(|reply| PersistCommand::TaskReorder {
            filter,
            ordered_task_ids,
            reply,
        })
        .await
    }

    pub async fn task_set_linear(
        &self,
        task_id: String,
        linear: Option<LinearMetadata>,
    ) -> Result<Task, GatewayError> {
        self.send(|reply| PersistCommand::TaskSetLinear {
            task_id,
            linear,
            reply,
        })
        .await
    }

    pub async fn list_tasks(
        &self,
        filter: &ScopeFilter,
        repository_id: Option<String>,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, GatewayError> {
        let filter = filter.clone();
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            list_tasks_sync(&conn, &filter, repository_id.as_deref(), status)
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    pub async fn get_task(&self, task_id: String) -> Result<Task, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            find_task(&conn, &task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.clone()))
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    // -- Git status --

    pub async fn upsert_directory_git_status(
        &self,
        snapshot: DirectoryGitSnapshot,
    ) -> Result<Option<DirectoryGitSnapshot>, GatewayError> {
        self.send(|reply| PersistCommand::UpsertDirectoryGitStatus { snapshot, reply })
            .await
    }

    pub async fn get_directory_git_status(
        &self,
        directory_id: String,
    ) -> Result<Option<DirectoryGitSnapshot>, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            let mut stmt = conn.prepare("SELECT * FROM directory_git_status WHERE directory_id = ?1")?;
            let mut rows = stmt.query_map(params![directory_id], git_snapshot_from_row)?;
            Ok::<_, GatewayError>(rows.next().transpose()?)
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }

    pub async fn list_directory_git_statuses(&self) -> Result<Vec<DirectoryGitSnapshot>, GatewayError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            let mut stmt = conn.prepare("SELECT * FROM directory_git_status")?;
            let rows = stmt
                .query_map([], git_snapshot_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, GatewayError>(rows)
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn run_writer(db_path: PathBuf, mut rx: mpsc::Receiver<PersistCommand>) {
    let mut conn = match Connection::open(&db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(component = "persistence", event = "writer.open_failed", error = %e);
            return;
        }
    };

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while batch.len() < WRITER_BATCH_SIZE {
            match rx.try_recv() {
                Ok(cmd) => batch.push(cmd),
                Err(_) => break,
            }
        }
        flush_batch(&mut conn, batch);
    }
}

fn flush_batch(conn: &mut Connection, batch: Vec<PersistCommand>) {
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(e) => {
            error!(component = "persistence", event = "writer.tx_failed", error = %e);
            return;
        }
    };

    for cmd in batch {
        apply_command(&tx, cmd);
    }

    if let Err(e) = tx.commit() {
        error!(component = "persistence", event = "writer.commit_failed", error = %e);
    }
}

fn apply_command(conn: &Connection, cmd: PersistCommand) {
    match cmd {
        PersistCommand::UpsertDirectory {
            directory_id,
            scope,
            path,
            reply,
        } => {
            let _ = reply.send(upsert_directory_sync(conn, directory_id, scope, path));
        }
        PersistCommand::ArchiveDirectory { directory_id, reply } => {
            let _ = reply.send(archive_directory_sync(conn, &directory_id));
        }
        PersistCommand::CreateConversation {
            directory_id,
            title,
            agent_type,
            scope,
            reply,
        } => {
            let _ = reply.send(create_conversation_sync(conn, &directory_id, title, agent_type, scope));
        }
        PersistCommand::UpdateConversation {
            conversation_id,
            title,
            reply,
        } => {
            let _ = reply.send(update_conversation_sync(conn, &conversation_id, title));
        }
        PersistCommand::ArchiveConversation {
            conversation_id,
            reply,
        } => {
            let _ = reply.send(archive_conversation_sync(conn, &conversation_id));
        }
        PersistCommand::DeleteConversation {
            conversation_id,
            reply,
        } => {
            let result = conn
                .execute(
                    "DELETE FROM conversations WHERE conversation_id = ?1",
                    params![conversation_id],
                )
                .map(|_| ())
                .map_err(GatewayError::from);
            let _ = reply.send(result);
        }
        PersistCommand::UpdateConversationRuntime {
            conversation_id,
            status,
            live,
            attention_reason,
            reply,
        } => {
            let _ = reply.send(set_runtime_status_sync(
                conn,
                &conversation_id,
                status,
                live,
                attention_reason,
            ));
        }
        PersistCommand::SetAdapterState {
            conversation_id,
            patch,
            reply,
        } => {
            let _ = reply.send(set_adapter_state_sync(conn, &conversation_id, patch));
        }
        PersistCommand::UpsertRepository {
            repository_id,
            scope,
            name,
            remote_url,
            default_branch,
            reply,
        } => {
            let _ = reply.send(upsert_repository_sync(
                conn,
                repository_id,
                scope,
                name,
                remote_url,
                default_branch,
            ));
        }
        PersistCommand::UpdateRepository {
            repository_id,
            name,
            default_branch,
            reply,
        } => {
            let _ = reply.send(update_repository_sync(conn, &repository_id, name, default_branch));
        }
        PersistCommand::ArchiveRepository { repository_id, reply } => {
            let _ = reply.send(archive_repository_sync(conn, &repository_id));
        }
        PersistCommand::CreateTask {
            scope,
            repository_id,
            title,
            description,
            reply,
        } => {
            let _ = reply.send(create_task_sync(conn, scope, repository_id, title, description));
        }
        PersistCommand::UpdateTask {
            task_id,
            title,
            description,
            reply,
        } => {
            let _ = reply.send(update_task_sync(conn, &task_id, title, description));
        }
        PersistCommand::ArchiveTask { task_id, reply } => {
            let _ = reply.send(archive_task_sync(conn, &task_id));
        }
        PersistCommand::DeleteTask { task_id, reply } => {
            let result = conn
                .execute("DELETE FROM tasks WHERE task_id = ?1", params![task_id])
                .map(|_| ())
                .map_err(GatewayError::from);
            let _ = reply.send(result);
        }
        PersistCommand::TaskReady { task_id, reply } => {
            let _ = reply.send(set_task_status_sync(conn, &task_id, TaskStatus::Ready, None, true));
        }
        PersistCommand::TaskClaim {
            task_id,
            controller_id,
            directory_id,
            branch_name,
            base_branch,
            reply,
        } => {
            let _ = reply.send(task_claim_sync(
                conn,
                &task_id,
                controller_id,
                directory_id,
                branch_name,
                base_branch,
            ));
        }
        PersistCommand::TaskComplete { task_id, reply } => {
            let _ = reply.send(set_task_status_sync(conn, &task_id, TaskStatus::Completed, None, true));
        }
        PersistCommand::TaskQueue { task_id, reply } => {
            let _ = reply.send(set_task_status_sync(conn, &task_id, TaskStatus::Ready, None, true));
        }
        PersistCommand::TaskDraft { task_id, reply } => {
            let _ = reply.send(set_task_status_sync(conn, &task_id, TaskStatus::Draft, None, true));
        }
        PersistCommand::TaskReorder {
            filter,
            ordered_task_ids,
            reply,
        } => {
            let _ = reply.send(task_reorder_sync(conn, &filter, &ordered_task_ids));
        }
        PersistCommand::TaskSetLinear {
            task_id,
            linear,
            reply,
        } => {
            let _ = reply.send(task_set_linear_sync(conn, &task_id, linear));
        }
        PersistCommand::UpsertDirectoryGitStatus { snapshot, reply } => {
            let _ = reply.send(upsert_git_status_sync(conn, snapshot));
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn directory_from_row(row: &rusqlite::Row) -> rusqlite::Result<Directory> {
    Ok(Directory {
        directory_id: row.get("directory_id")?,
        scope: Scope {
            tenant_id: row.get("tenant_id")?,
            user_id: row.get("user_id")?,
            workspace_id: row.get("workspace_id")?,
        },
        path: row.get("path")?,
        created_at: row.get("created_at")?,
        archived_at: row.get("archived_at")?,
    })
}

fn conversation_from_row(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    let adapter_state_json: String = row.get("adapter_state")?;
    let runtime_status_str: String = row.get("runtime_status")?;
    let runtime_status_model_str: String = row.get("runtime_status_model")?;
    let agent_type_str: String = row.get("agent_type")?;
    Ok(Conversation {
        conversation_id: row.get("conversation_id")?,
        directory_id: row.get("directory_id")?,
        scope: Scope {
            tenant_id: row.get("tenant_id")?,
            user_id: row.get("user_id")?,
            workspace_id: row.get("workspace_id")?,
        },
        title: row.get("title")?,
        agent_type: parse_agent_type(&agent_type_str),
        adapter_state: serde_json::from_str(&adapter_state_json).unwrap_or_default(),
        runtime_status: parse_runtime_status(&runtime_status_str),
        runtime_status_model: parse_runtime_status(&runtime_status_model_str),
        runtime_live: row.get::<_, i64>("runtime_live")? != 0,
        archived_at: row.get("archived_at")?,
    })
}

fn repository_from_row(row: &rusqlite::Row) -> rusqlite::Result<Repository> {
    let metadata_json: String = row.get("metadata")?;
    Ok(Repository {
        repository_id: row.get("repository_id")?,
        scope: Scope {
            tenant_id: row.get("tenant_id")?,
            user_id: row.get("user_id")?,
            workspace_id: row.get("workspace_id")?,
        },
        name: row.get("name")?,
        remote_url: row.get("remote_url")?,
        default_branch: row.get("default_branch")?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null),
        archived_at: row.get("archived_at")?,
    })
}

fn task_from_row(row: &rusqlite::Row) -> rusqlite::Result<Task> {
    let status_str: String = row.get("status")?;
    let linear_issue_id: Option<String> = row.get("linear_issue_id")?;
    let linear = linear_issue_id.map(|issue_id| LinearMetadata {
        issue_id,
        issue_identifier: row.get("linear_issue_identifier").unwrap_or_default(),
        url: row.get("linear_url").unwrap_or_default(),
    });
    Ok(Task {
        task_id: row.get("task_id")?,
        scope: Scope {
            tenant_id: row.get("tenant_id")?,
            user_id: row.get("user_id")?,
            workspace_id: row.get("workspace_id")?,
        },
        repository_id: row.get("repository_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: parse_task_status(&status_str),
        order_index: row.get("order_index")?,
        claimed_by_controller_id: row.get("claimed_by_controller_id")?,
        claimed_by_directory_id: row.get("claimed_by_directory_id")?,
        branch_name: row.get("branch_name")?,
        base_branch: row.get("base_branch")?,
        linear,
        archived_at: row.get("archived_at")?,
    })
}

fn git_snapshot_from_row(row: &rusqlite::Row) -> rusqlite::Result<DirectoryGitSnapshot> {
    let commit_count: Option<i64> = row.get("commit_count")?;
    let has_repo = row.get::<_, Option<String>>("normalized_remote_url")?.is_some()
        || commit_count.is_some()
        || row.get::<_, Option<String>>("short_commit_hash")?.is_some();
    Ok(DirectoryGitSnapshot {
        directory_id: row.get("directory_id")?,
        summary: GitSummary {
            branch: row.get("branch")?,
            changed_files: row.get::<_, i64>("changed_files")? as u32,
            additions: row.get::<_, i64>("additions")? as u32,
            deletions: row.get::<_, i64>("deletions")? as u32,
        },
        repository: if has_repo {
            Some(GitRepositoryProbe {
                normalized_remote_url: row.get("normalized_remote_url")?,
                commit_count: commit_count.map(|c| c as u64),
                last_commit_at: row.get("last_commit_at")?,
                short_commit_hash: row.get("short_commit_hash")?,
                inferred_name: row.get("inferred_name")?,
                default_branch: row.get("default_branch")?,
            })
        } else {
            None
        },
        observed_at: row.get("observed_at")?,
    })
}

fn parse_agent_type(s: &str) -> harness_protocol::AgentType {
    use harness_protocol::AgentType::*;
    match s {
        "claude" => Claude,
        "cursor" => Cursor,
        "terminal" => Terminal,
        "critique" => Critique,
        _ => Codex,
    }
}

fn agent_type_str(t: harness_protocol::AgentType) -> &'static str {
    use harness_protocol::AgentType::*;
    match t {
        Codex => "codex",
        Claude => "claude",
        Cursor => "cursor",
        Terminal => "terminal",
        Critique => "critique",
    }
}

fn parse_runtime_status(s: &str) -> RuntimeStatus {
    use RuntimeStatus::*;
    match s {
        "running" => Running,
        "needs-input" | "needs_input" => NeedsInput,
        "completed" => Completed,
        _ => Exited,
    }
}

fn runtime_status_str(s: RuntimeStatus) -> &'static str {
    use RuntimeStatus::*;
    match s {
        Running => "running",
        NeedsInput => "needs-input",
        Completed => "completed",
        Exited => "exited",
    }
}

fn parse_task_status(s: &str) -> TaskStatus {
    use TaskStatus::*;
    match s {
        "ready" => Ready,
        "in-progress" | "in_progress" => InProgress,
        "completed" => Completed,
        _ => Draft,
    }
}

fn task_status_str(s: TaskStatus) -> &'static str {
    use TaskStatus::*;
    match s {
        Draft => "draft",
        Ready => "ready",
        InProgress => "in-progress",
        Completed => "completed",
    }
}

// ---------------------------------------------------------------------------
// Directory operations
// ---------------------------------------------------------------------------

fn upsert_directory_sync(
    conn: &Connection,
    directory_id: Option<String>,
    scope: Scope,
    path: String,
) -> Result<Directory, GatewayError> {
    if let Some(id) = &directory_id {
        if let Some(existing) = find_directory(conn, id)? {
            if existing.archived_at.is_some() && existing.scope != scope {
                return Err(GatewayError::DirectoryArchived(id.clone()));
            }
            conn.execute(
                "UPDATE directories SET path = ?1 WHERE directory_id = ?2",
                params![path, id],
            )?;
            return find_directory(conn, id)?.ok_or_else(|| GatewayError::DirectoryNotFound(id.clone()));
        }
    }

    let id = directory_id.unwrap_or_else(harness_protocol::new_id);
    let now = now_ts();
    conn.execute(
        "INSERT INTO directories (directory_id, tenant_id, user_id, workspace_id, path, created_at, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
        params![id, scope.tenant_id, scope.user_id, scope.workspace_id, path, now],
    )?;
    find_directory(conn, &id)?.ok_or_else(|| GatewayError::Internal("insert did not persist".into()))
}

fn find_directory(conn: &Connection, id: &str) -> Result<Option<Directory>, GatewayError> {
    let mut stmt = conn.prepare("SELECT * FROM directories WHERE directory_id = ?1")?;
    let mut rows = stmt.query_map(params![id], directory_from_row)?;
    Ok(rows.next().transpose()?)
}

fn archive_directory_sync(
    conn: &Connection,
    directory_id: &str,
) -> Result<(Directory, Vec<Conversation>), GatewayError> {
    let dir = find_directory(conn, directory_id)?
        .ok_or_else(|| GatewayError::DirectoryNotFound(directory_id.to_string()))?;

    if dir.archived_at.is_some() {
        return Ok((dir, Vec::new()));
    }

    let now = now_ts();
    conn.execute(
        "UPDATE directories SET archived_at = ?1 WHERE directory_id = ?2",
        params![now, directory_id],
    )?;

    let mut stmt = conn.prepare(
        "SELECT * FROM conversations WHERE directory_id = ?1 AND archived_at IS NULL",
    )?;
    let live: Vec<Conversation> = stmt
        .query_map(params![directory_id], conversation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for c in &live {
        conn.execute(
            "UPDATE conversations SET archived_at = ?1 WHERE conversation_id = ?2",
            params![now, c.conversation_id],
        )?;
    }

    let archived_dir = find_directory(conn, directory_id)?.unwrap();
    let archived_conversations = live
        .into_iter()
        .map(|mut c| {
            c.archived_at = Some(now.clone());
            c
        })
        .collect();

    Ok((archived_dir, archived_conversations))
}

fn list_directories_sync(
    conn: &Connection,
    filter: &ScopeFilter,
    include_archived: bool,
) -> Result<Vec<Directory>, GatewayError> {
    let mut sql = "SELECT * FROM directories WHERE 1=1".to_string();
    let mut clauses = Vec::new();
    if let Some(t) = &filter.tenant_id {
        clauses.push(format!("tenant_id = '{}'", escape(t)));
    }
    if let Some(u) = &filter.user_id {
        clauses.push(format!("user_id = '{}'", escape(u)));
    }
    if let Some(w) = &filter.workspace_id {
        clauses.push(format!("workspace_id = '{}'", escape(w)));
    }
    if !include_archived {
        clauses.push("archived_at IS NULL".to_string());
    }
    for c in clauses {
        sql.push_str(" AND ");
        sql.push_str(&c);
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], directory_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Minimal escaping for the scope-filter values we interpolate above — these
/// are server-generated ids/slugs, never raw user text, but quoting is
/// still defused defensively.
fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

// ---------------------------------------------------------------------------
// Conversation operations
// ---------------------------------------------------------------------------

fn create_conversation_sync(
    conn: &Connection,
    directory_id: &str,
    title: String,
    agent_type: harness_protocol::AgentType,
    scope: Scope,
) -> Result<Conversation, GatewayError> {
    let dir = find_directory(conn, directory_id)?
        .ok_or_else(|| GatewayError::DirectoryNotFound(directory_id.to_string()))?;
    if dir.archived_at.is_some() {
        return Err(GatewayError::DirectoryArchived(directory_id.to_string()));
    }

    let id = harness_protocol::new_id();
    conn.execute(
        "INSERT INTO conversations
            (conversation_id, directory_id, tenant_id, user_id, workspace_id, title, agent_type,
             adapter_state, runtime_status, runtime_status_model, runtime_live, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', 'exited', 'exited', 0, NULL)",
        params![
            id,
            directory_id,
            scope.tenant_id,
            scope.user_id,
            scope.workspace_id,
            title,
            agent_type_str(agent_type),
        ],
    )?;
    find_conversation(conn, &id)?.ok_or_else(|| GatewayError::Internal("insert did not persist".into()))
}

fn find_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>, GatewayError> {
    let mut stmt = conn.prepare("SELECT * FROM conversations WHERE conversation_id = ?1")?;
    let mut rows = stmt.query_map(params![id], conversation_from_row)?;
    Ok(rows.next().transpose()?)
}

fn update_conversation_sync(
    conn: &Connection,
    conversation_id: &str,
    title: Option<String>,
) -> Result<Conversation, GatewayError> {
    find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))?;
    if let Some(t) = title {
        conn.execute(
            "UPDATE conversations SET title = ?1 WHERE conversation_id = ?2",
            params![t, conversation_id],
        )?;
    }
    find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))
}

fn archive_conversation_sync(conn: &Connection, conversation_id: &str) -> Result<Conversation, GatewayError> {
    let conv = find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))?;
    if conv.archived_at.is_some() {
        return Ok(conv);
    }
    conn.execute(
        "UPDATE conversations SET archived_at = ?1 WHERE conversation_id = ?2",
        params![now_ts(), conversation_id],
    )?;
    find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))
}

fn set_runtime_status_sync(
    conn: &Connection,
    conversation_id: &str,
    status: Option<RuntimeStatus>,
    live: Option<bool>,
    attention_reason: Option<Option<String>>,
) -> Result<Conversation, GatewayError> {
    find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))?;

    if let Some(s) = status {
        conn.execute(
            "UPDATE conversations SET runtime_status = ?1, runtime_status_model = ?1 WHERE conversation_id = ?2",
            params![runtime_status_str(s), conversation_id],
        )?;
    }
    if let Some(l) = live {
        conn.execute(
            "UPDATE conversations SET runtime_live = ?1 WHERE conversation_id = ?2",
            params![l as i64, conversation_id],
        )?;
    }
    // attention_reason is tracked in-memory on SessionState; the durable
    // row only needs status/live. Accept the parameter so callers have one
    // call-site for the whole runtime-projection update.
    let _ = attention_reason;

    find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))
}

fn set_adapter_state_sync(
    conn: &Connection,
    conversation_id: &str,
    patch: harness_protocol::AdapterState,
) -> Result<Conversation, GatewayError> {
    let existing = find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))?;

    let mut merged = existing.adapter_state;
    merged.extend(patch);

    conn.execute(
        "UPDATE conversations SET adapter_state = ?1 WHERE conversation_id = ?2",
        params![serde_json::to_string(&merged).unwrap_or_default(), conversation_id],
    )?;

    find_conversation(conn, conversation_id)?
        .ok_or_else(|| GatewayError::ConversationNotFound(conversation_id.to_string()))
}

fn list_conversations_sync(
    conn: &Connection,
    directory_id: Option<&str>,
    include_archived: bool,
) -> Result<Vec<Conversation>, GatewayError> {
    let mut sql = "SELECT * FROM conversations WHERE 1=1".to_string();
    if let Some(d) = directory_id {
        sql.push_str(&format!(" AND directory_id = '{}'", escape(d)));
    }
    if !include_archived {
        sql.push_str(" AND archived_at IS NULL");
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], conversation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Repository operations
// ---------------------------------------------------------------------------

fn find_repository(conn: &Connection, id: &str) -> Result<Option<Repository>, GatewayError> {
    let mut stmt = conn.prepare("SELECT * FROM repositories WHERE repository_id = ?1")?;
    let mut rows = stmt.query_map(params![id], repository_from_row)?;
    Ok(rows.next().transpose()?)
}

fn upsert_repository_sync(
    conn: &Connection,
    repository_id: Option<String>,
    scope: Scope,
    name: String,
    remote_url: Option<String>,
    default_branch: Option<String>,
) -> Result<Repository, GatewayError> {
    if let Some(id) = &repository_id {
        if find_repository(conn, id)?.is_some() {
            conn.execute(
                "UPDATE repositories SET name = ?1, remote_url = ?2, default_branch = ?3 WHERE repository_id = ?4",
                params![name, remote_url, default_branch, id],
            )?;
            return find_repository(conn, id)?.ok_or_else(|| GatewayError::RepositoryNotFound(id.clone()));
        }
    }
    let id = repository_id.unwrap_or_else(harness_protocol::new_id);
    conn.execute(
        "INSERT INTO repositories (repository_id, tenant_id, user_id, workspace_id, name, remote_url, default_branch, metadata, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', NULL)",
        params![id, scope.tenant_id, scope.user_id, scope.workspace_id, name, remote_url, default_branch],
    )?;
    find_repository(conn, &id)?.ok_or_else(|| GatewayError::Internal("insert did not persist".into()))
}

fn update_repository_sync(
    conn: &Connection,
    repository_id: &str,
    name: Option<String>,
    default_branch: Option<String>,
) -> Result<Repository, GatewayError> {
    find_repository(conn, repository_id)?
        .ok_or_else(|| GatewayError::RepositoryNotFound(repository_id.to_string()))?;
    if let Some(n) = name {
        conn.execute(
            "UPDATE repositories SET name = ?1 WHERE repository_id = ?2",
            params![n, repository_id],
        )?;
    }
    if let Some(b) = default_branch {
        conn.execute(
            "UPDATE repositories SET default_branch = ?1 WHERE repository_id = ?2",
            params![b, repository_id],
        )?;
    }
    find_repository(conn, repository_id)?
        .ok_or_else(|| GatewayError::RepositoryNotFound(repository_id.to_string()))
}

fn archive_repository_sync(conn: &Connection, repository_id: &str) -> Result<Repository, GatewayError> {
    let repo = find_repository(conn, repository_id)?
        .ok_or_else(|| GatewayError::RepositoryNotFound(repository_id.to_string()))?;
    if repo.archived_at.is_some() {
        return Ok(repo);
    }
    conn.execute(
        "UPDATE repositories SET archived_at = ?1 WHERE repository_id = ?2",
        params![now_ts(), repository_id],
    )?;
    find_repository(conn, repository_id)?
        .ok_or_else(|| GatewayError::RepositoryNotFound(repository_id.to_string()))
}

fn list_repositories_sync(
    conn: &Connection,
    filter: &ScopeFilter,
    include_archived: bool,
) -> Result<Vec<Repository>, GatewayError> {
    let mut sql = "SELECT * FROM repositories WHERE 1=1".to_string();
    if let Some(t) = &filter.tenant_id {
        sql.push_str(&format!(" AND tenant_id = '{}'", escape(t)));
    }
    if let Some(u) = &filter.user_id {
        sql.push_str(&format!(" AND user_id = '{}'", escape(u)));
    }
    if let Some(w) = &filter.workspace_id {
        sql.push_str(&format!(" AND workspace_id = '{}'", escape(w)));
    }
    if !include_archived {
        sql.push_str(" AND archived_at IS NULL");
    }
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], repository_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Task operations
// ---------------------------------------------------------------------------

fn find_task(conn: &Connection, id: &str) -> Result<Option<Task>, GatewayError> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE task_id = ?1")?;
    let mut rows = stmt.query_map(params![id], task_from_row)?;
    Ok(rows.next().transpose()?)
}

fn create_task_sync(
    conn: &Connection,
    scope: Scope,
    repository_id: Option<String>,
    title: String,
    description: Option<String>,
) -> Result<Task, GatewayError> {
    let id = harness_protocol::new_id();
    let max_order: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(order_index), -1) FROM tasks WHERE tenant_id = ?1 AND user_id = ?2 AND workspace_id = ?3",
            params![scope.tenant_id, scope.user_id, scope.workspace_id],
            |r| r.get(0),
        )
        .unwrap_or(-1);
    conn.execute(
        "INSERT INTO tasks
            (task_id, tenant_id, user_id, workspace_id, repository_id, title, description,
             status, order_index, archived_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'draft', ?8, NULL)",
        params![
            id,
            scope.tenant_id,
            scope.user_id,
            scope.workspace_id,
            repository_id,
            title,
            description,
            max_order + 1,
        ],
    )?;
    find_task(conn, &id)?.ok_or_else(|| GatewayError::Internal("insert did not persist".into()))
}

fn update_task_sync(
    conn: &Connection,
    task_id: &str,
    title: Option<String>,
    description: Option<String>,
) -> Result<Task, GatewayError> {
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))?;
    if let Some(t) = title {
        conn.execute("UPDATE tasks SET title = ?1 WHERE task_id = ?2", params![t, task_id])?;
    }
    if let Some(d) = description {
        conn.execute(
            "UPDATE tasks SET description = ?1 WHERE task_id = ?2",
            params![d, task_id],
        )?;
    }
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))
}

fn archive_task_sync(conn: &Connection, task_id: &str) -> Result<Task, GatewayError> {
    let task = find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))?;
    if task.archived_at.is_some() {
        return Ok(task);
    }
    conn.execute(
        "UPDATE tasks SET archived_at = ?1 WHERE task_id = ?2",
        params![now_ts(), task_id],
    )?;
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))
}

/// Sets status and optionally clears the claim triple, preserving the
/// invariant `claimedByControllerId ≠ null ⇔ status = in-progress`.
fn set_task_status_sync(
    conn: &Connection,
    task_id: &str,
    status: TaskStatus,
    _unused: Option<()>,
    clear_claim: bool,
) -> Result<Task, GatewayError> {
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))?;
    if clear_claim {
        conn.execute(
            "UPDATE tasks SET status = ?1, claimed_by_controller_id = NULL, claimed_by_directory_id = NULL,
                branch_name = NULL, base_branch = NULL WHERE task_id = ?2",
            params![task_status_str(status), task_id],
        )?;
    } else {
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE task_id = ?2",
            params![task_status_str(status), task_id],
        )?;
    }
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))
}

fn task_claim_sync(
    conn: &Connection,
    task_id: &str,
    controller_id: String,
    directory_id: String,
    branch_name: Option<String>,
    base_branch: Option<String>,
) -> Result<Task, GatewayError> {
    let task = find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))?;
    if task.status != TaskStatus::Ready {
        return Err(GatewayError::TaskNotReadyToClaim(task_id.to_string()));
    }
    conn.execute(
        "UPDATE tasks SET status = 'in-progress', claimed_by_controller_id = ?1, claimed_by_directory_id = ?2,
            branch_name = ?3, base_branch = ?4 WHERE task_id = ?5",
        params![controller_id, directory_id, branch_name, base_branch, task_id],
    )?;
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))
}

fn task_set_linear_sync(
    conn: &Connection,
    task_id: &str,
    linear: Option<LinearMetadata>,
) -> Result<Task, GatewayError> {
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))?;
    match linear {
        Some(l) => conn.execute(
            "UPDATE tasks SET linear_issue_id = ?1, linear_issue_identifier = ?2, linear_url = ?3 WHERE task_id = ?4",
            params![l.issue_id, l.issue_identifier, l.url, task_id],
        )?,
        None => conn.execute(
            "UPDATE tasks SET linear_issue_id = NULL, linear_issue_identifier = NULL, linear_url = NULL WHERE task_id = ?1",
            params![task_id],
        )?,
    };
    find_task(conn, task_id)?.ok_or_else(|| GatewayError::TaskNotFound(task_id.to_string()))
}

fn task_reorder_sync(
    conn: &Connection,
    filter: &ScopeFilter,
    ordered_task_ids: &[String],
) -> Result<Vec<Task>, GatewayError> {
    let scoped = list_tasks_sync(conn, filter, None, None)?
        .into_iter()
        .filter(|t| t.archived_at.is_none())
        .collect::<Vec<_>>();

    let scoped_ids: std::collections::HashSet<&str> =
        scoped.iter().map(|t| t.task_id.as_str()).collect();
    let requested_ids: std::collections::HashSet<&str> =
        ordered_task_ids.iter().map(|s| s.as_str()).collect();

    if scoped_ids != requested_ids {
        return Err(GatewayError::Validation {
            field: "ordered_task_ids".to_string(),
            reason: "must equal exactly the set of non-archived tasks in scope".to_string(),
        });
    }

    for (index, id) in ordered_task_ids.iter().enumerate() {
        conn.execute(
            "UPDATE tasks SET order_index = ?1 WHERE task_id = ?2",
            params![index as i64, id],
        )?;
    }

    let mut result = Vec::with_capacity(ordered_task_ids.len());
    for id in ordered_task_ids {
        result.push(find_task(conn, id)?.ok_or_else(|| GatewayError::TaskNotFound(id.clone()))?);
    }
    Ok(result)
}

fn list_tasks_sync(
    conn: &Connection,
    filter: &ScopeFilter,
    repository_id: Option<&str>,
    status: Option<TaskStatus>,
) -> Result<Vec<Task>, GatewayError> {
    let mut sql = "SELECT * FROM tasks WHERE 1=1".to_string();
    if let Some(t) = &filter.tenant_id {
        sql.push_str(&format!(" AND tenant_id = '{}'", escape(t)));
    }
    if let Some(u) = &filter.user_id {
        sql.push_str(&format!(" AND user_id = '{}'", escape(u)));
    }
    if let Some(w) = &filter.workspace_id {
        sql.push_str(&format!(" AND workspace_id = '{}'", escape(w)));
    }
    if let Some(r) = repository_id {
        sql.push_str(&format!(" AND repository_id = '{}'", escape(r)));
    }
    if let Some(s) = status {
        sql.push_str(&format!(" AND status = '{}'", task_status_str(s)));
    }
    sql.push_str(" ORDER BY order_index ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], task_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Git status
// ---------------------------------------------------------------------------

fn upsert_git_status_sync(
    conn: &Connection,
    snapshot: DirectoryGitSnapshot,
) -> Result<Option<DirectoryGitSnapshot>, GatewayError> {
    let mut stmt = conn.prepare("SELECT * FROM directory_git_status WHERE directory_id = ?1")?;
    let existing = stmt
        .query_map(params![snapshot.directory_id], git_snapshot_from_row)?
        .next()
        .transpose()?;

    if let Some(existing) = &existing {
        if existing.summary == snapshot.summary && existing.repository == snapshot.repository {
            return Ok(None);
        }
    }

    let now = now_ts();
    let repo = snapshot.repository.as_ref();
    conn.execute(
        "INSERT INTO directory_git_status
            (directory_id, branch, changed_files, additions, deletions,
             normalized_remote_url, commit_count, last_commit_at, short_commit_hash, inferred_name, default_branch,
             observed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(directory_id) DO UPDATE SET
            branch = excluded.branch,
            changed_files = excluded.changed_files,
            additions = excluded.additions,
            deletions = excluded.deletions,
            normalized_remote_url = excluded.normalized_remote_url,
            commit_count = excluded.commit_count,
            last_commit_at = excluded.last_commit_at,
            short_commit_hash = excluded.short_commit_hash,
            inferred_name = excluded.inferred_name,
            default_branch = excluded.default_branch,
            observed_at = excluded.observed_at",
        params![
            snapshot.directory_id,
            snapshot.summary.branch,
            snapshot.summary.changed_files,
            snapshot.summary.additions,
            snapshot.summary.deletions,
            repo.and_then(|r| r.normalized_remote_url.clone()),
            repo.and_then(|r| r.commit_count).map(|c| c as i64),
            repo.and_then(|r| r.last_commit_at.clone()),
            repo.and_then(|r| r.short_commit_hash.clone()),
            repo.and_then(|r| r.inferred_name.clone()),
            repo.and_then(|r| r.default_branch.clone()),
            now,
        ],
    )?;

    Ok(Some(DirectoryGitSnapshot {
        observed_at: now,
        ..snapshot
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_protocol::AgentType;

    fn scope() -> Scope {
        Scope {
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            workspace_id: "w1".into(),
        }
    }

    async fn open_test_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn upsert_then_list_directory() {
        let (store, _dir) = open_test_store().await;
        let d = store
            .upsert_directory(None, scope(), "/tmp/project".into())
            .await
            .unwrap();
        let listed = store.list_directories(&ScopeFilter::default(), false).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].directory_id, d.directory_id);
    }

    #[tokio::test]
    async fn archive_directory_cascades_to_conversations() {
        let (store, _dir) = open_test_store().await;
        let d = store.upsert_directory(None, scope(), "/tmp/p".into()).await.unwrap();
        let c = store
            .create_conversation(d.directory_id.clone(), "conv".into(), AgentType::Codex, scope())
            .await
            .unwrap();

        let (archived_dir, cascaded) = store.archive_directory(d.directory_id.clone()).await.unwrap();
        assert!(archived_dir.archived_at.is_some());
        assert_eq!(cascaded.len(), 1);
        assert_eq!(cascaded[0].conversation_id, c.conversation_id);

        let conversations = store
            .list_conversations(Some(d.directory_id.clone()), true)
            .await
            .unwrap();
        assert!(conversations[0].archived_at.is_some());
    }

    #[tokio::test]
    async fn archive_directory_is_idempotent() {
        let (store, _dir) = open_test_store().await;
        let d = store.upsert_directory(None, scope(), "/tmp/p".into()).await.unwrap();
        store.archive_directory(d.directory_id.clone()).await.unwrap();
        let (_, cascaded_second_time) = store.archive_directory(d.directory_id.clone()).await.unwrap();
        assert!(cascaded_second_time.is_empty());
    }

    #[tokio::test]
    async fn new_conversation_under_archived_directory_is_rejected() {
        let (store, _dir) = open_test_store().await;
        let d = store.upsert_directory(None, scope(), "/tmp/p".into()).await.unwrap();
        store.archive_directory(d.directory_id.clone()).await.unwrap();
        let result = store
            .create_conversation(d.directory_id, "conv".into(), AgentType::Codex, scope())
            .await;
        assert!(matches!(result, Err(GatewayError::DirectoryArchived(_))));
    }

    #[tokio::test]
    async fn set_runtime_status_keeps_both_fields_in_lockstep() {
        let (store, _dir) = open_test_store().await;
        let d = store.upsert_directory(None, scope(), "/tmp/p".into()).await.unwrap();
        let c = store
            .create_conversation(d.directory_id, "conv".into(), AgentType::Codex, scope())
            .await
            .unwrap();
        let updated = store
            .set_runtime_status(c.conversation_id, Some(RuntimeStatus::NeedsInput), Some(true), None)
            .await
            .unwrap();
        assert_eq!(updated.runtime_status, RuntimeStatus::NeedsInput);
        assert_eq!(updated.runtime_status_model, RuntimeStatus::NeedsInput);
        assert!(updated.runtime_live);
    }

    #[tokio::test]
    async fn task_claim_requires_ready_status() {
        let (store, _dir) = open_test_store().await;
        let t = store.create_task(scope(), None, "do thing".into(), None).await.unwrap();
        let result = store
            .task_claim(t.task_id, "agent:1".into(), "dir-1".into(), None, None)
            .await;
        assert!(matches!(result, Err(GatewayError::TaskNotReadyToClaim(_))));
    }

    #[tokio::test]
    async fn task_reorder_sets_dense_order_index() {
        let (store, _dir) = open_test_store().await;
        let t1 = store.create_task(scope(), None, "a".into(), None).await.unwrap();
        let t2 = store.create_task(scope(), None, "b".into(), None).await.unwrap();
        let t3 = store.create_task(scope(), None, "c".into(), None).await.unwrap();

        let filter = ScopeFilter {
            tenant_id: Some("t1".into()),
            user_id: Some("u1".into()),
            workspace_id: Some("w1".into()),
        };
        let ordered = vec![t3.task_id.clone(), t1.task_id.clone(), t2.task_id.clone()];
        let result = store.task_reorder(filter, ordered.clone()).await.unwrap();
        assert_eq!(result.iter().map(|t| t.task_id.clone()).collect::<Vec<_>>(), ordered);
        assert_eq!(result[0].order_index, 0);
        assert_eq!(result[1].order_index, 1);
        assert_eq!(result[2].order_index, 2);
    }

    #[tokio::test]
    async fn task_reorder_rejects_mismatched_id_set() {
        let (store, _dir) = open_test_store().await;
        store.create_task(scope(), None, "a".into(), None).await.unwrap();
        let filter = ScopeFilter {
            tenant_id: Some("t1".into()),
            user_id: Some("u1".into()),
            workspace_id: Some("w1".into()),
        };
        let result = store.task_reorder(filter, vec!["does-not-exist".into()]).await;
        assert!(matches!(result, Err(GatewayError::Validation { .. })));
    }

    #[tokio::test]
    async fn git_status_upsert_dedupes_identical_snapshots() {
        let (store, _dir) = open_test_store().await;
        let d = store.upsert_directory(None, scope(), "/tmp/p".into()).await.unwrap();
        let snapshot = DirectoryGitSnapshot {
            directory_id: d.directory_id.clone(),
            summary: GitSummary {
                branch: Some("main".into()),
                changed_files: 1,
                additions: 2,
                deletions: 0,
            },
            repository: None,
            observed_at: "ignored".into(),
        };
        let first = store.upsert_directory_git_status(snapshot.clone()).await.unwrap();
        assert!(first.is_some());
        let second = store.upsert_directory_git_status(snapshot).await.unwrap();
        assert!(second.is_none());
    }
}
