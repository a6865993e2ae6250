//! `phagentd`: the privileged agent process (spec §1, §2).
//!
//! Wires together the policy catalog, executor registry, change-log store,
//! restore-point manager, and policy engine, then serves the local IPC
//! transport until asked to shut down.

use std::process::ExitCode;

use clap::Parser;
use pha_agent::cli::{Cli, Command};
use pha_agent::{Agent, ConfigLoader};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    pha_process_hardening::pre_main_hardening();
    init_tracing();

    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_file(path);
    }
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Command::Serve) {
        Command::Doctor => run_doctor(&config).await,
        Command::Serve => run_serve(&config).await,
    }
}

async fn run_doctor(config: &pha_agent::AgentConfig) -> ExitCode {
    match pha_agent::doctor::run(config).await {
        Ok(report) => {
            print!("{report}");
            if report.ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("doctor failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(config: &pha_agent::AgentConfig) -> ExitCode {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "phagentd starting"
    );

    let agent = match Agent::start(config) {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "failed to start agent");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let serve_result = serve_transport(agent.engine.clone(), shutdown, config.listener_pool_size as usize).await;
    agent.shutdown().await;

    match serve_result {
        Ok(()) => {
            tracing::info!("phagentd stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "IPC transport failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
async fn serve_transport(
    engine: std::sync::Arc<pha_engine::PolicyEngine>,
    shutdown: CancellationToken,
    listener_pool_size: usize,
) -> std::io::Result<()> {
    pha_ipc::serve(engine, shutdown, listener_pool_size).await
}

#[cfg(not(windows))]
async fn serve_transport(
    engine: std::sync::Arc<pha_engine::PolicyEngine>,
    shutdown: CancellationToken,
    listener_pool_size: usize,
) -> std::io::Result<()> {
    let socket_path = default_socket_path();
    pha_ipc::serve(engine, &socket_path, shutdown, listener_pool_size).await
}

#[cfg(not(windows))]
fn default_socket_path() -> std::path::PathBuf {
    std::env::var_os("PHAGENT_SOCKET_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| {
            dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("phagentd.sock")
        })
}

/// Cancels `shutdown` on Ctrl-C (every platform) or SIGTERM (unix). The IPC
/// accept loop and every in-flight connection honor the same token (spec
/// §5).
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}
