//! Layered configuration: CLI flags > environment variables > defaults.
//!
//! Resolved once at startup into an `Arc<Config>` and threaded through every
//! component by reference — nothing reads an environment variable once
//! `Config::resolve` has returned.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// One webhook the Lifecycle Hook Dispatcher fans events out to.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Event-type prefixes this webhook wants (e.g. `"session."`). Empty means all.
    pub event_types: Vec<String>,
    pub timeout: Duration,
}

/// Flags a caller may override; anything left `None` falls through to the
/// env var then the default.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub control_plane_bind: Option<SocketAddr>,
    pub telemetry_bind: Option<SocketAddr>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub control_plane_bind: SocketAddr,
    pub telemetry_bind: SocketAddr,
    pub auth_token: Option<String>,

    // Git-status monitor
    pub poll_ms: u64,
    pub active_poll_ms: u64,
    pub idle_poll_ms: u64,
    pub burst_poll_ms: u64,
    pub max_concurrency: usize,
    pub min_directory_refresh_ms: u64,
    pub trigger_debounce_ms: u64,

    // Session registry
    pub session_exit_tombstone_ttl_ms: u64,

    // Subscription bus
    pub max_stream_journal_entries: usize,

    // Connection backpressure
    pub max_connection_buffered_bytes: usize,

    // Lifecycle hooks
    pub webhooks: Vec<WebhookConfig>,
    /// Fixed "peon-ping" endpoint every lifecycle event is fanned out to,
    /// regardless of any webhook's `event_types` filter.
    pub peon_ping_url: Option<String>,

    // Codex history poller
    pub history_poller_path: Option<PathBuf>,
    pub history_poller_poll_ms: u64,
}

impl Config {
    pub fn resolve(overrides: ConfigOverrides) -> Self {
        let data_dir = overrides.data_dir.unwrap_or_else(|| crate::paths::init_data_dir(None));
        let control_plane_bind = overrides
            .control_plane_bind
            .or_else(|| env_socket_addr("HARNESS_GATEWAY_BIND_ADDR"))
            .unwrap_or_else(|| "127.0.0.1:8765".parse().unwrap());
        let telemetry_bind = overrides
            .telemetry_bind
            .or_else(|| env_socket_addr("HARNESS_GATEWAY_TELEMETRY_BIND_ADDR"))
            .unwrap_or_else(|| "127.0.0.1:8766".parse().unwrap());
        let auth_token = overrides
            .auth_token
            .or_else(|| std::env::var("HARNESS_GATEWAY_AUTH_TOKEN").ok());

        Config {
            data_dir,
            control_plane_bind,
            telemetry_bind,
            auth_token,
            poll_ms: env_u64("HARNESS_GATEWAY_GIT_POLL_MS", 2_000),
            active_poll_ms: env_u64("HARNESS_GATEWAY_GIT_ACTIVE_POLL_MS", 1_000),
            idle_poll_ms: env_u64("HARNESS_GATEWAY_GIT_IDLE_POLL_MS", 5_000),
            burst_poll_ms: env_u64("HARNESS_GATEWAY_GIT_BURST_POLL_MS", 250),
            max_concurrency: env_u64("HARNESS_GATEWAY_GIT_MAX_CONCURRENCY", 4) as usize,
            min_directory_refresh_ms: env_u64("HARNESS_GATEWAY_GIT_MIN_REFRESH_MS", 500),
            trigger_debounce_ms: env_u64("HARNESS_GATEWAY_GIT_TRIGGER_DEBOUNCE_MS", 150),
            session_exit_tombstone_ttl_ms: env_u64("HARNESS_GATEWAY_TOMBSTONE_TTL_MS", 30_000),
            max_stream_journal_entries: env_u64("HARNESS_GATEWAY_MAX_JOURNAL_ENTRIES", 1_000) as usize,
            max_connection_buffered_bytes: env_u64("HARNESS_GATEWAY_MAX_CONN_BUFFERED_BYTES", 8 * 1024 * 1024)
                as usize,
            webhooks: Vec::new(),
            peon_ping_url: std::env::var("HARNESS_GATEWAY_PEON_PING_URL").ok(),
            history_poller_path: std::env::var("HARNESS_GATEWAY_HISTORY_PATH").ok().map(PathBuf::from),
            history_poller_poll_ms: env_u64("HARNESS_GATEWAY_HISTORY_POLL_MS", 1_000),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_socket_addr(key: &str) -> Option<SocketAddr> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_overridden() {
        std::env::remove_var("HARNESS_GATEWAY_BIND_ADDR");
        let cfg = Config::resolve(ConfigOverrides {
            data_dir: Some(PathBuf::from("/tmp/harness-gateway-test")),
            ..Default::default()
        });
        assert_eq!(cfg.control_plane_bind.port(), 8765);
        assert_eq!(cfg.session_exit_tombstone_ttl_ms, 30_000);
    }

    #[test]
    fn explicit_override_wins_over_env() {
        std::env::set_var("HARNESS_GATEWAY_BIND_ADDR", "127.0.0.1:9999");
        let cfg = Config::resolve(ConfigOverrides {
            data_dir: Some(PathBuf::from("/tmp/harness-gateway-test2")),
            control_plane_bind: Some("127.0.0.1:1111".parse().unwrap()),
            ..Default::default()
        });
        assert_eq!(cfg.control_plane_bind.port(), 1111);
        std::env::remove_var("HARNESS_GATEWAY_BIND_ADDR");
    }
}
