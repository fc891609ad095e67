//! Lifecycle Hook Dispatcher: fans observed lifecycle events out to
//! configured webhooks. Each dispatch is a detached, best-effort task with
//! its own client timeout, never awaited by the caller that triggered it.

use std::time::Duration;

use harness_protocol::DomainEvent;
use tracing::warn;

use crate::config::WebhookConfig;

/// Lifecycle event categories a webhook subscribes to, by prefix
/// (`thread.`, `session.`, `turn.`, `input.`, `tool.`).
fn event_category(event: &DomainEvent) -> &'static str {
    match event {
        DomainEvent::SessionStatus { .. } => "session.status",
        DomainEvent::SessionKeyEvent { .. } => "session.key-event",
        DomainEvent::SessionOutput { .. } => "session.output",
        DomainEvent::ConversationUpdated { .. } | DomainEvent::ConversationArchived { .. } => "thread.updated",
        DomainEvent::TaskUpdated { .. } | DomainEvent::TaskReordered { .. } => "task.updated",
        DomainEvent::DirectoryUpserted { .. } | DomainEvent::DirectoryArchived { .. } => "directory.updated",
        DomainEvent::RepositoryUpserted { .. } | DomainEvent::RepositoryArchived { .. } => "repository.updated",
        DomainEvent::DirectoryGitUpdated { .. } => "directory.git-updated",
    }
}

const PEON_PING_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HookDispatcher {
    webhooks: Vec<WebhookConfig>,
    peon_ping_url: Option<String>,
}

impl HookDispatcher {
    pub fn new(webhooks: Vec<WebhookConfig>) -> Self {
        HookDispatcher {
            webhooks,
            peon_ping_url: None,
        }
    }

    pub fn with_peon_ping(mut self, url: Option<String>) -> Self {
        self.peon_ping_url = url;
        self
    }

    /// Fan `event` out to every webhook whose `event_types` list is empty or
    /// contains a matching prefix, plus the fixed peon-ping endpoint (which
    /// sees every event regardless of any webhook's filter). Best-effort, no
    /// retry.
    pub fn dispatch(&self, event: &DomainEvent) {
        if self.webhooks.is_empty() && self.peon_ping_url.is_none() {
            return;
        }
        let category = event_category(event);
        let payload = serde_json::json!({
            "category": category,
            "event": event,
        });

        for webhook in &self.webhooks {
            if !webhook.event_types.is_empty()
                && !webhook.event_types.iter().any(|prefix| category.starts_with(prefix.as_str()))
            {
                continue;
            }
            let url = webhook.url.clone();
            let timeout = webhook.timeout;
            let body = payload.clone();
            tokio::spawn(async move {
                deliver(&url, timeout, &body).await;
            });
        }

        if let Some(url) = self.peon_ping_url.clone() {
            let body = payload.clone();
            tokio::spawn(async move {
                deliver(&url, PEON_PING_TIMEOUT, &body).await;
            });
        }
    }
}

async fn deliver(url: &str, timeout: Duration, body: &serde_json::Value) {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(component = "hooks", url = %url, error = %e, "failed to build webhook client");
            return;
        }
    };
    if let Err(e) = client.post(url).json(body).send().await {
        warn!(component = "hooks", url = %url, error = %e, event = "hook.delivery_failed", "webhook delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_protocol::{Directory, Scope};

    #[test]
    fn no_webhooks_is_a_noop() {
        let dispatcher = HookDispatcher::new(vec![]);
        dispatcher.dispatch(&DomainEvent::DirectoryUpserted {
            directory: Directory {
                directory_id: "d1".into(),
                scope: Scope::default(),
                path: "/tmp".into(),
                created_at: "0Z".into(),
                archived_at: None,
            },
        });
    }

    #[tokio::test]
    async fn peon_ping_fires_even_with_no_webhooks_configured() {
        let dispatcher = HookDispatcher::new(vec![]).with_peon_ping(Some("http://127.0.0.1:1/ping".into()));
        dispatcher.dispatch(&DomainEvent::DirectoryUpserted {
            directory: Directory {
                directory_id: "d1".into(),
                scope: Scope::default(),
                path: "/tmp".into(),
                created_at: "0Z".into(),
                archived_at: None,
            },
        });
    }

    #[test]
    fn event_category_maps_directory_events() {
        let event = DomainEvent::DirectoryUpserted {
            directory: Directory {
                directory_id: "d1".into(),
                scope: Scope::default(),
                path: "/tmp".into(),
                created_at: "0Z".into(),
                archived_at: None,
            },
        };
        assert_eq!(event_category(&event), "directory.updated");
    }
}
