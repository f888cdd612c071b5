mod cli;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use cli::{CliArgs, Verbosity};
use fluux_server::config::ServerConfig;
use fluux_server::error::ServerError;
use fluux_server::xmpp_server::router::{log_packet, spawn_dispatchers, ChannelRouter};
use fluux_server::xmpp_server::XmppServer;

const DISPATCHER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Platform log directory:
///   Linux:   ~/.local/share/com.processone.fluux-server/logs/  (or $XDG_DATA_HOME)
///   macOS:   ~/Library/Application Support/com.processone.fluux-server/logs/
///   Windows: %LOCALAPPDATA%\com.processone.fluux-server\logs\
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("com.processone.fluux-server")
        .join("logs")
}

/// Initialize tracing:
/// - Always write to a daily-rotating log file
/// - Optionally add stderr output when --verbose is passed or RUST_LOG is set
fn init_logging(args: &CliArgs, config: &ServerConfig) -> (PathBuf, WorkerGuard) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| config.logging.directory.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_log_dir);

    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let level = &config.logging.level;
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!("fluux_server={level},warn"))
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-server.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if args.verbosity != Verbosity::Quiet || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if args.verbosity == Verbosity::Xmpp {
            EnvFilter::new(format!(
                "fluux_server={level},fluux_server::xmpp_server=trace,warn"
            ))
        } else {
            EnvFilter::new(format!("fluux_server={level},warn"))
        };

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    (log_dir, guard)
}

/// Returns when SIGINT or SIGTERM (Ctrl+C on Windows) is received.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

async fn run(config: ServerConfig) -> Result<(), ServerError> {
    let (router, queue) = ChannelRouter::new(config.server.router_queue_depth);
    let dispatchers = spawn_dispatchers(queue, config.server.router_workers, Arc::new(log_packet));

    let mut server = XmppServer::new(config, Arc::new(router));
    server.start().await?;

    if let Err(e) = shutdown_signal().await {
        error!("Failed to install signal handlers: {}", e);
    }

    info!("Shutting down");
    server.stop().await;
    // Dropping the server releases the last router handle, which lets the
    // dispatchers drain and exit.
    drop(server);

    let drain = futures_util::future::join_all(dispatchers);
    if tokio::time::timeout(DISPATCHER_DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("Packet dispatchers did not drain in time");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let mut config = match ServerConfig::load_from_file(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {} ({})", e, args.config_path.display());
            return ExitCode::FAILURE;
        }
    };
    if let Some(domain) = &args.domain {
        config.server.domain = domain.clone();
    }
    if let Some(bind_address) = &args.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    if args.check_config {
        eprintln!("Configuration OK: {}", args.config_path.display());
        return ExitCode::SUCCESS;
    }

    let (log_dir, _guard) = init_logging(&args, &config);
    eprintln!("Log file: {}", log_dir.display());

    info!(
        "Fluux server v{} starting for domain {}",
        cli::VERSION,
        config.server.domain
    );
    info!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);

    match run(config).await {
        Ok(()) => {
            info!("Server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Server failed: {}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
