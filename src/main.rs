use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omnisocks::config::ConfigHandle;
use omnisocks::resolver::DnsResolver;
use omnisocks::types::Mode;
use omnisocks::{api, mixed, server, tunnel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long shutdown waits for in-flight relays before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "omnisocks")]
#[command(about = "Support socks4, socks4a, socks5, socks5h, http proxy all in one", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Terminate tunnels from paired clients
    Server,
    /// Mixed proxy listener, forwarding through the paired server when one
    /// is configured
    Client,
}

fn init_logging(handle: &ConfigHandle) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log = handle.snapshot().log.clone();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if log.filename.is_empty() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
        return None;
    }

    let path = PathBuf::from(&log.filename);
    let dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "omnisocks.log".into());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let mut quit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = quit.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("install ctrl-c handler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let handle = ConfigHandle::load(&cli.config)
        .with_context(|| format!("load config {}", cli.config.display()))?;
    let _log_guard = init_logging(&handle);
    if let Err(err) = handle.spawn_watcher() {
        warn!(%err, "config watcher unavailable, hot reload disabled");
    }

    let snapshot = handle.snapshot();
    let mode = match cli.command {
        Some(Command::Server) => Mode::Server,
        Some(Command::Client) | None => {
            if snapshot.server_unset() {
                Mode::Direct
            } else {
                Mode::Client
            }
        }
    };
    info!(%mode, "starting");

    let resolver = Arc::new(DnsResolver::new());
    let dispatcher = tunnel::start(mode, resolver.clone());
    api::serve(snapshot.api.clone(), &resolver);

    match mode {
        Mode::Server => {
            let listener = Arc::new(
                server::Listener::bind(handle.clone(), dispatcher)
                    .await
                    .context("bind server listener")?,
            );
            tokio::spawn(listener.clone().run());
            wait_for_signal().await?;
            info!("received signal, exiting...");
            if let Err(err) = listener.shutdown(SHUTDOWN_GRACE).await {
                warn!(%err, "shutdown incomplete");
            }
        }
        Mode::Client | Mode::Direct => {
            let listener = Arc::new(
                mixed::Listener::bind(handle.clone(), dispatcher, resolver.clone())
                    .await
                    .context("bind mixed listener")?,
            );
            tokio::spawn(listener.clone().run());
            wait_for_signal().await?;
            info!("received signal, exiting...");
            if let Err(err) = listener.shutdown(SHUTDOWN_GRACE).await {
                warn!(%err, "shutdown incomplete");
            }
        }
    }
    Ok(())
}
