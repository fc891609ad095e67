//! Shared application state, threaded by `Arc` into every connection task,
//! poller, and HTTP handler (teacher's `state.rs` `AppState` idiom).

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::Config;
use crate::hooks::HookDispatcher;
use crate::persistence::Store;
use crate::registry::SessionRegistry;
use crate::subscription::SubscriptionBus;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub bus: Arc<SubscriptionBus>,
    pub sessions: Arc<SessionRegistry>,
    pub hooks: Arc<HookDispatcher>,
    /// Telemetry token -> session id, populated by the launch-args injector
    /// at `pty.start`, removed when the session's tombstone expires.
    pub telemetry_tokens: Arc<DashMap<String, String>>,
}
