//! Subscription Bus: turns durable mutations into per-subscriber
//! envelopes, with a bounded, cursor-addressed replay journal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use harness_protocol::{DomainEvent, ScopeFilter};
use tokio::sync::mpsc;

/// What one subscriber asked to see.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub scope: ScopeFilter,
    pub directory_id: Option<String>,
    pub conversation_id: Option<String>,
    pub repository_id: Option<String>,
    pub task_id: Option<String>,
    pub include_output: bool,
}

impl StreamFilter {
    fn matches(&self, event: &DomainEvent) -> bool {
        if event.is_output() && !self.include_output {
            return false;
        }
        if let Some(scope) = event.scope() {
            if let Some(t) = &self.scope.tenant_id {
                if *t != scope.tenant_id {
                    return false;
                }
            }
            if let Some(u) = &self.scope.user_id {
                if *u != scope.user_id {
                    return false;
                }
            }
            if let Some(w) = &self.scope.workspace_id {
                if *w != scope.workspace_id {
                    return false;
                }
            }
        }
        if let Some(d) = &self.directory_id {
            if event.directory_id().is_some_and(|id| id != d) {
                return false;
            }
        }
        if let Some(c) = &self.conversation_id {
            if event.conversation_id().is_some_and(|id| id != c) {
                return false;
            }
        }
        if let Some(r) = &self.repository_id {
            if event.repository_id().is_some_and(|id| id != r) {
                return false;
            }
        }
        if let Some(t) = &self.task_id {
            if !event.matches_task(t) {
                return false;
            }
        }
        true
    }
}

struct JournalEntry {
    cursor: u64,
    event: DomainEvent,
}

/// One subscriber's registration: its filter and its delivery channel.
struct Subscriber {
    filter: StreamFilter,
    tx: mpsc::Sender<(u64, DomainEvent)>,
}

/// Bounded ring of observed events plus the live subscriber table.
pub struct SubscriptionBus {
    next_cursor: AtomicU64,
    journal: Mutex<VecDeque<JournalEntry>>,
    max_journal_entries: usize,
    subscribers: DashMap<String, Subscriber>,
}

impl SubscriptionBus {
    pub fn new(max_journal_entries: usize) -> Self {
        SubscriptionBus {
            next_cursor: AtomicU64::new(1),
            journal: Mutex::new(VecDeque::new()),
            max_journal_entries,
            subscribers: DashMap::new(),
        }
    }

    /// Publish one observed event. Appends to the journal and fans out to
    /// every matching subscriber. Slow subscribers are dropped rather than
    /// backpressuring the publisher.
    pub fn publish(&self, event: DomainEvent) -> u64 {
        let cursor = self.next_cursor.fetch_add(1, Ordering::SeqCst);

        {
            let mut journal = self.journal.lock().unwrap();
            journal.push_back(JournalEntry {
                cursor,
                event: event.clone(),
            });
            while journal.len() > self.max_journal_entries {
                journal.pop_front();
            }
        }

        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.value().filter.matches(&event) {
                continue;
            }
            if entry.value().tx.try_send((cursor, event.clone())).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }

        cursor
    }

    /// Register a subscription; returns its id and a receiver for future
    /// matching events. Replay of backlog strictly after `after_cursor` is
    /// delivered synchronously into the same channel before returning.
    pub fn subscribe(
        &self,
        subscription_id: String,
        filter: StreamFilter,
        after_cursor: u64,
    ) -> mpsc::Receiver<(u64, DomainEvent)> {
        let (tx, rx) = mpsc::channel(256);

        {
            let journal = self.journal.lock().unwrap();
            for entry in journal.iter() {
                if entry.cursor > after_cursor && filter.matches(&entry.event) {
                    let _ = tx.try_send((entry.cursor, entry.event.clone()));
                }
            }
        }

        self.subscribers.insert(subscription_id, Subscriber { filter, tx });
        rx
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.subscribers.remove(subscription_id);
    }

    pub fn latest_cursor(&self) -> u64 {
        self.next_cursor.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_protocol::{Directory, Scope};

    fn dir_event(tenant: &str) -> DomainEvent {
        DomainEvent::DirectoryUpserted {
            directory: Directory {
                directory_id: "d1".into(),
                scope: Scope {
                    tenant_id: tenant.into(),
                    user_id: "u1".into(),
                    workspace_id: "w1".into(),
                },
                path: "/tmp".into(),
                created_at: "0Z".into(),
                archived_at: None,
            },
        }
    }

    #[test]
    fn cursors_are_strictly_increasing() {
        let bus = SubscriptionBus::new(100);
        let c1 = bus.publish(dir_event("t1"));
        let c2 = bus.publish(dir_event("t1"));
        assert!(c2 > c1);
    }

    #[tokio::test]
    async fn subscriber_only_sees_matching_scope() {
        let bus = SubscriptionBus::new(100);
        let filter = StreamFilter {
            scope: ScopeFilter {
                tenant_id: Some("t1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut rx = bus.subscribe("sub1".into(), filter, 0);
        bus.publish(dir_event("t2"));
        bus.publish(dir_event("t1"));
        let (_, event) = rx.recv().await.unwrap();
        assert!(matches!(event, DomainEvent::DirectoryUpserted { directory } if directory.scope.tenant_id == "t1"));
    }

    #[tokio::test]
    async fn subscribe_replays_after_cursor() {
        let bus = SubscriptionBus::new(100);
        let c1 = bus.publish(dir_event("t1"));
        let _c2 = bus.publish(dir_event("t1"));
        let mut rx = bus.subscribe("sub1".into(), StreamFilter::default(), c1);
        let (cursor, _) = rx.recv().await.unwrap();
        assert_eq!(cursor, c1 + 1);
    }

    fn output_event() -> DomainEvent {
        DomainEvent::SessionOutput {
            session_id: "s1".into(),
            conversation_id: "c1".into(),
            scope: Scope {
                tenant_id: "t1".into(),
                user_id: "u1".into(),
                workspace_id: "w1".into(),
            },
            output_cursor: 1,
            chunk_base64: "aGk=".into(),
        }
    }

    #[tokio::test]
    async fn output_is_suppressed_unless_include_output_is_set() {
        let bus = SubscriptionBus::new(100);
        let mut rx = bus.subscribe("sub1".into(), StreamFilter::default(), 0);
        bus.publish(output_event());
        bus.publish(dir_event("t1"));
        let (_, event) = rx.recv().await.unwrap();
        assert!(matches!(event, DomainEvent::DirectoryUpserted { .. }));
    }

    #[tokio::test]
    async fn include_output_subscriber_receives_session_output() {
        let bus = SubscriptionBus::new(100);
        let filter = StreamFilter {
            include_output: true,
            ..Default::default()
        };
        let mut rx = bus.subscribe("sub1".into(), filter, 0);
        bus.publish(output_event());
        let (_, event) = rx.recv().await.unwrap();
        assert!(event.is_output());
    }

    #[test]
    fn journal_is_trimmed_to_max_entries() {
        let bus = SubscriptionBus::new(2);
        bus.publish(dir_event("t1"));
        bus.publish(dir_event("t1"));
        bus.publish(dir_event("t1"));
        assert_eq!(bus.journal.lock().unwrap().len(), 2);
    }
}
