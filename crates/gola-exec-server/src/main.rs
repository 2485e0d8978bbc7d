//! Network front end for the gola code execution service
//!
//! `serve` exposes the execution service over HTTP so that agents running in
//! other processes can submit tool-invocation envelopes. `run` executes a single
//! file from the command line and prints the structured result, which is handy
//! for checking provider setup on a new host.

mod routes;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gola_exec::{ConfigLoader, ExecutionService, Outcome};
use log::LevelFilter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Gola Exec - sandboxed code execution with provider fallback")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, default_value = "gola-exec.yaml", help = "Path to the execution service configuration")]
    config: PathBuf,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the execution API over HTTP
    Serve {
        #[clap(long, default_value = "127.0.0.1:3002")]
        bind_addr: String,
    },
    /// Execute a single source file and print the result as JSON
    Run {
        #[clap(long, short = 'L')]
        language: String,

        #[clap(long, short)]
        file: PathBuf,

        #[clap(long, help = "File whose contents are fed to the program's standard input")]
        stdin_file: Option<PathBuf>,

        #[clap(long, short, help = "Timeout in seconds (clamped to 1..=60)")]
        timeout: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    log::info!("Loading configuration from: {}", cli.config.display());
    let config = ConfigLoader::from_file(&cli.config).await?;
    let service = ExecutionService::from_config(&config)?;

    match cli.command {
        Commands::Serve { bind_addr } => serve(service, bind_addr).await,
        Commands::Run {
            language,
            file,
            stdin_file,
            timeout,
        } => {
            let outcome = run_once(&service, language, file, stdin_file, timeout).await?;
            service.shutdown().await;
            if outcome != Outcome::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(service: ExecutionService, bind_addr: String) -> Result<()> {
    let bind_socket_addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", bind_addr, e))?;

    let service = Arc::new(service);
    let router = routes::build_router(service.clone());
    let listener = TcpListener::bind(bind_socket_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", bind_socket_addr, e))?;

    log::info!("Starting gola-exec server on {}...", bind_socket_addr);
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }

    match Arc::try_unwrap(service) {
        Ok(service) => service.shutdown().await,
        Err(_) => log::warn!("Execution service still referenced at shutdown"),
    }
    log::info!("gola-exec server shut down gracefully.");
    Ok(())
}

async fn run_once(
    service: &ExecutionService,
    language: String,
    file: PathBuf,
    stdin_file: Option<PathBuf>,
    timeout: Option<i64>,
) -> Result<Outcome> {
    let source = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", file.display(), e))?;
    let stdin = match stdin_file {
        Some(path) => Some(
            tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?,
        ),
        None => None,
    };

    let request = service.request(language, source, timeout, stdin);
    let result = service.execute(request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.outcome)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            log::info!("Received SIGTERM, shutting down...");
        },
    }
}
