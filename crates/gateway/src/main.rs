//! Harness Gateway binary: control-plane for PTY-backed agent sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use harness_gateway::config::{Config, ConfigOverrides};
use harness_gateway::hooks::HookDispatcher;
use harness_gateway::registry::SessionRegistry;
use harness_gateway::state::AppState;
use harness_gateway::{connection, git_monitor, history_poller, launch_args, logging, paths, persistence, startup, telemetry};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "harness-gateway", about = "Control-plane gateway for PTY-backed agent sessions", version = VERSION)]
struct Cli {
    #[arg(long, global = true, env = "HARNESS_GATEWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the control-plane and telemetry listeners.
    Start {
        #[arg(long, env = "HARNESS_GATEWAY_BIND_ADDR")]
        bind: Option<SocketAddr>,
        #[arg(long, env = "HARNESS_GATEWAY_TELEMETRY_BIND_ADDR")]
        telemetry_bind: Option<SocketAddr>,
        #[arg(long, env = "HARNESS_GATEWAY_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
    /// Probe an already-running instance.
    Status,
    /// Mint and persist a random loopback auth token.
    GenerateToken,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match &cli.command {
        Some(Command::Status) => return cmd_status(&data_dir),
        Some(Command::GenerateToken) => return cmd_generate_token(&data_dir),
        _ => {}
    }

    let overrides = match cli.command {
        Some(Command::Start { bind, telemetry_bind, auth_token }) => ConfigOverrides {
            data_dir: Some(data_dir.clone()),
            control_plane_bind: bind,
            telemetry_bind,
            auth_token,
        },
        _ => ConfigOverrides {
            data_dir: Some(data_dir),
            ..Default::default()
        },
    };
    let config = Arc::new(Config::resolve(overrides));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(config))
}

async fn async_main(config: Arc<Config>) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let logging_handle = logging::init_logging()?;
    let _log_guard = logging_handle.guard;

    info!(
        component = "gateway",
        event = "gateway.starting",
        run_id = %logging_handle.run_id,
        version = VERSION,
        pid = std::process::id(),
        data_dir = %config.data_dir.display(),
        "starting harness gateway"
    );

    let store = persistence::Store::open(&config.data_dir).await?;
    let bus = Arc::new(harness_gateway::subscription::SubscriptionBus::new(config.max_stream_journal_entries));
    let factory: Arc<dyn harness_pty_core::PtyFactory> = Arc::new(harness_pty_process::RealPtyFactory);
    let sessions = Arc::new(SessionRegistry::new(
        store.clone(),
        bus.clone(),
        factory,
        config.session_exit_tombstone_ttl_ms,
    ));
    let hooks = Arc::new(HookDispatcher::new(config.webhooks.clone()).with_peon_ping(config.peon_ping_url.clone()));
    let telemetry_tokens = Arc::new(dashmap::DashMap::new());

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        bus: bus.clone(),
        sessions: sessions.clone(),
        hooks,
        telemetry_tokens: telemetry_tokens.clone(),
    };

    let injector = Arc::new(launch_args::LaunchArgsInjector::new(config.telemetry_bind, true, true));

    startup::reconcile(&state, &injector).await;

    let (git_monitor, _git_monitor_handle) =
        git_monitor::GitMonitor::new(store.clone(), bus.clone(), config.clone());
    tokio::spawn(git_monitor.run());

    if let Some(history_path) = config.history_poller_path.clone() {
        let telemetry_state =
            telemetry::TelemetryState::new(store.clone(), bus.clone(), sessions.clone(), telemetry_tokens.clone());
        let poller = history_poller::HistoryPoller::new(history_path, config.history_poller_poll_ms, telemetry_state);
        tokio::spawn(poller.run());
    }

    let telemetry_state = telemetry::TelemetryState::new(store, bus, sessions, telemetry_tokens);
    let telemetry_app = telemetry::router(telemetry_state);
    let telemetry_listener = tokio::net::TcpListener::bind(config.telemetry_bind).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(telemetry_listener, telemetry_app).await {
            warn!(component = "gateway", error = %e, "telemetry listener exited");
        }
    });

    let control_plane_listener = tokio::net::TcpListener::bind(config.control_plane_bind).await?;
    info!(
        component = "gateway",
        event = "gateway.listening",
        control_plane_bind = %config.control_plane_bind,
        telemetry_bind = %config.telemetry_bind,
        "gateway ready"
    );
    write_pid_file();

    let max_buffered_bytes = config.max_connection_buffered_bytes;
    loop {
        tokio::select! {
            accept = control_plane_listener.accept() => {
                let (socket, peer_addr) = match accept {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(component = "gateway", error = %e, "failed to accept connection");
                        continue;
                    }
                };
                info!(component = "gateway", event = "connection.accepted", peer = %peer_addr, "accepted connection");
                let state = state.clone();
                let injector = injector.clone();
                tokio::spawn(connection::handle_connection(socket, state, injector, max_buffered_bytes));
            }
            _ = tokio::signal::ctrl_c() => {
                info!(component = "gateway", event = "gateway.shutdown", "received shutdown signal");
                break;
            }
        }
    }

    remove_pid_file();
    Ok(())
}

fn write_pid_file() {
    let pid_path = paths::pid_file_path();
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(component = "gateway", event = "gateway.pid_file.write_error", path = %pid_path.display(), error = %e, "failed to write PID file");
    }
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(paths::pid_file_path());
}

fn cmd_status(data_dir: &std::path::Path) -> anyhow::Result<()> {
    println!();
    println!("  Harness Gateway v{}", VERSION);
    println!("  Data dir: {}", data_dir.display());

    let pid_path = paths::pid_file_path();
    if pid_path.exists() {
        let pid = std::fs::read_to_string(&pid_path).unwrap_or_default();
        println!("  PID file: {} ({})", pid_path.display(), pid.trim());
    } else {
        println!("  PID file: not found");
    }

    let db_path = paths::db_path();
    if db_path.exists() {
        let size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database: {} ({} KB)", db_path.display(), size / 1024);
    } else {
        println!("  Database: not found");
    }
    println!();
    Ok(())
}

fn cmd_generate_token(data_dir: &std::path::Path) -> anyhow::Result<()> {
    let token = uuid::Uuid::new_v4().to_string();
    let token_path = paths::token_file_path();
    std::fs::create_dir_all(data_dir)?;
    std::fs::write(&token_path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&token_path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!();
    println!("  Auth token generated and saved to {}", token_path.display());
    println!();
    println!("  Token: {}", token);
    println!();
    println!("  Usage:");
    println!("    harness-gateway start --auth-token {}", token);
    println!();
    Ok(())
}
