//! webterm-server: persistent, resumable terminal sessions over WebSocket.
//!
//! Spawns shell/CLI processes on pseudo-terminals, keeps their output for
//! replay, and lets any number of browser viewers attach, detach and come
//! back later.

mod config;
mod git;
mod profiles;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use git::GitCli;
use profiles::ConfiguredProfiles;
use server::WebtermServer;
use session::{FileLogStore, JsonSessionStore, RuntimeDeps, SessionRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use webterm_core::WebtermResult;

/// Browser terminal session server
#[derive(Parser, Debug)]
#[command(name = "webterm-server", version, about = "Persistent browser terminal sessions")]
struct Cli {
    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.webterm/config.toml")]
    config: String,

    /// Directory for session records and logs
    #[arg(long)]
    data_dir: Option<String>,

    /// Working directory for profiles that do not set one
    #[arg(long)]
    default_cwd: Option<String>,

    /// Maximum concurrently running sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Disable git snapshots around submitted commands
    #[arg(long)]
    no_git: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting webterm-server");

    let overrides = CliOverrides {
        bind: cli.bind.clone(),
        port: cli.port,
        data_dir: cli.data_dir.clone(),
        max_sessions: cli.max_sessions,
        default_cwd: cli.default_cwd.clone(),
        disable_git: cli.no_git,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // Reconciliation happens here, before the listener exists.
    let registry = match open_registry(&server_config).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "failed to open session registry");
            std::process::exit(1);
        }
    };

    let server = Arc::new(WebtermServer::new(server_config, registry.clone()));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.notify_shutdown();
    registry.shutdown().await;
    info!("webterm-server stopped");
}

async fn open_registry(config: &ServerConfig) -> WebtermResult<SessionRegistry> {
    let sessions = Arc::new(JsonSessionStore::open(config.sessions_dir()).await?);
    let logs = Arc::new(FileLogStore::open(config.logs_dir()).await?);
    let deps = RuntimeDeps {
        sessions,
        logs,
        git: Arc::new(GitCli::new(config.runtime.git.command_timeout)),
        settings: config.runtime.clone(),
    };
    let profiles = Arc::new(ConfiguredProfiles::new(
        config.profiles.clone(),
        &config.default_shell,
        config.default_cwd.clone(),
    ));
    SessionRegistry::open(profiles, deps, config.default_cwd.clone(), config.max_sessions).await
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
