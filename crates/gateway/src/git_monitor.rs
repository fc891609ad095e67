//! Git-Status Monitor: periodically probes every live directory's
//! working tree and persists a deduped snapshot.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness_protocol::{DomainEvent, GitRepositoryProbe, GitSummary, ScopeFilter};
use tokio::process::Command;
use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::config::Config;
use crate::persistence::Store;
use crate::subscription::SubscriptionBus;
use crate::time::now_ts;

/// Handle used to coalesce an external "something changed" signal (e.g. an
/// fs-watch event from the launcher) into the monitor's poll loop.
#[derive(Clone)]
pub struct GitMonitorHandle {
    trigger_tx: mpsc::Sender<String>,
}

impl GitMonitorHandle {
    pub fn trigger(&self, directory_id: String) {
        let _ = self.trigger_tx.try_send(directory_id);
    }
}

pub struct GitMonitor {
    store: Store,
    bus: Arc<SubscriptionBus>,
    config: Arc<Config>,
    trigger_rx: mpsc::Receiver<String>,
}

impl GitMonitor {
    pub fn new(store: Store, bus: Arc<SubscriptionBus>, config: Arc<Config>) -> (Self, GitMonitorHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(64);
        (
            GitMonitor { store, bus, config, trigger_rx },
            GitMonitorHandle { trigger_tx },
        )
    }

    pub async fn run(mut self) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut last_probed: HashMap<String, Instant> = HashMap::new();
        let mut interval_ms = self.config.poll_ms;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                    let directories = self
                        .store
                        .list_directories(&ScopeFilter::default(), false)
                        .await
                        .unwrap_or_default();

                    let mut handles = Vec::with_capacity(directories.len());
                    for dir in directories {
                        if last_probed
                            .get(&dir.directory_id)
                            .is_some_and(|t| t.elapsed() < Duration::from_millis(self.config.min_directory_refresh_ms))
                        {
                            continue;
                        }
                        last_probed.insert(dir.directory_id.clone(), Instant::now());
                        let permit = semaphore.clone();
                        let store = self.store.clone();
                        let bus = self.bus.clone();
                        handles.push(tokio::spawn(async move {
                            let _permit = permit.acquire_owned().await.ok();
                            probe_and_persist(&store, &bus, &dir.directory_id, &dir.path).await
                        }));
                    }

                    let mut changed = false;
                    for handle in handles {
                        if let Ok(true) = handle.await {
                            changed = true;
                        }
                    }
                    interval_ms = if changed { self.config.active_poll_ms } else { self.config.idle_poll_ms };
                }

                Some(directory_id) = self.trigger_rx.recv() => {
                    let mut pending = HashSet::from([directory_id]);
                    tokio::time::sleep(Duration::from_millis(self.config.trigger_debounce_ms)).await;
                    while let Ok(id) = self.trigger_rx.try_recv() {
                        pending.insert(id);
                    }
                    for id in pending {
                        if let Ok(dir) = self.store.get_directory(id.clone()).await {
                            probe_and_persist(&self.store, &self.bus, &dir.directory_id, &dir.path).await;
                        }
                    }
                    interval_ms = self.config.burst_poll_ms;
                }
            }
        }
    }
}

async fn probe_and_persist(store: &Store, bus: &SubscriptionBus, directory_id: &str, path: &str) -> bool {
    let Some((summary, repository)) = read_git_directory_snapshot(path).await else {
        return false;
    };
    let snapshot = harness_protocol::DirectoryGitSnapshot {
        directory_id: directory_id.to_string(),
        summary,
        repository,
        observed_at: now_ts(),
    };
    match store.upsert_directory_git_status(snapshot).await {
        Ok(Some(saved)) => {
            bus.publish(DomainEvent::DirectoryGitUpdated { snapshot: saved });
            true
        }
        Ok(None) => false,
        Err(e) => {
            warn!(component = "git_monitor", directory_id = %directory_id, error = %e, "failed to persist git snapshot");
            false
        }
    }
}

/// Probe one working tree. Returns `None` if `path` is not a git repository
/// (no `.git`, or `rev-parse` fails) — not an error condition.
pub async fn read_git_directory_snapshot(path: &str) -> Option<(GitSummary, Option<GitRepositoryProbe>)> {
    let branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await?;

    let porcelain = run_git(&["status", "--porcelain=v1"], path).await.unwrap_or_default();
    let changed_files = porcelain.lines().filter(|l| !l.is_empty()).count() as u32;

    let mut additions = 0u32;
    let mut deletions = 0u32;
    if let Some(numstat) = run_git(&["diff", "--numstat"], path).await {
        for line in numstat.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(a), Some(d)) = (fields.next(), fields.next()) {
                additions += a.parse().unwrap_or(0);
                deletions += d.parse().unwrap_or(0);
            }
        }
    }

    let summary = GitSummary {
        branch: Some(branch).filter(|b| b != "HEAD"),
        changed_files,
        additions,
        deletions,
    };

    let normalized_remote_url = run_git(&["remote", "get-url", "origin"], path).await;
    let commit_count = run_git(&["rev-list", "--count", "HEAD"], path)
        .await
        .and_then(|s| s.parse().ok());
    let last_commit_at = run_git(&["log", "-1", "--format=%ct"], path).await;
    let short_commit_hash = run_git(&["rev-parse", "--short", "HEAD"], path).await;
    let inferred_name = normalized_remote_url
        .as_deref()
        .and_then(infer_repo_name_from_remote)
        .or_else(|| path.rsplit('/').next().map(str::to_string));

    let repository = Some(GitRepositoryProbe {
        normalized_remote_url,
        commit_count,
        last_commit_at,
        short_commit_hash,
        inferred_name,
        default_branch: summary.branch.clone(),
    });

    Some((summary, repository))
}

fn infer_repo_name_from_remote(remote: &str) -> Option<String> {
    let trimmed = remote.trim_end_matches(".git").trim_end_matches('/');
    trimmed.rsplit(['/', ':']).next().map(str::to_string)
}

async fn run_git(args: &[&str], cwd: &str) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_repo_name_from_ssh_remote() {
        assert_eq!(
            infer_repo_name_from_remote("git@github.com:acme/widgets.git"),
            Some("widgets".to_string())
        );
    }

    #[test]
    fn infers_repo_name_from_https_remote() {
        assert_eq!(
            infer_repo_name_from_remote("https://github.com/acme/widgets"),
            Some("widgets".to_string())
        );
    }

    #[tokio::test]
    async fn non_repo_directory_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_git_directory_snapshot(dir.path().to_str().unwrap()).await;
        assert!(result.is_none());
    }
}
