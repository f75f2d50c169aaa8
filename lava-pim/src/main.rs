//! pim - process information manager daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lava_pim::{process, PimConfig, PimServer};

#[derive(Debug, Parser)]
#[command(name = "pim", about = "Process Information Manager", disable_version_flag = true)]
struct Cli {
    /// Debug logging
    #[arg(short = '1')]
    debug: bool,
    /// Trace logging
    #[arg(short = '2')]
    trace: bool,
    /// Directory holding lsf.conf (default $LSF_ENVDIR or /etc)
    #[arg(short = 'd')]
    env_dir: Option<PathBuf>,
    /// Print the version and exit
    #[arg(short = 'V')]
    version: bool,
}

fn log_filter(debug: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match debug {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("lava_pim={level},pim={level}"))
    })
}

/// Flip the shutdown flag on SIGHUP, SIGTERM or SIGINT
fn spawn_signal_watch(tx: watch::Sender<bool>) -> Result<()> {
    let mut hup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = hup.recv() => "SIGHUP",
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        info!("{} received", name);
        let _ = tx.send(true);
    });
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        eprintln!("lava pim {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let env_dir = cli
        .env_dir
        .or_else(|| std::env::var_os("LSF_ENVDIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("/etc"));
    let mut config = PimConfig::load(&env_dir);
    if cli.trace {
        config.debug = 2;
    } else if cli.debug {
        config.debug = 1;
    }
    tracing_subscriber::fmt().with_env_filter(log_filter(config.debug)).init();

    let host = gethostname::gethostname().to_string_lossy().to_string();
    info!("Process Information Manager starting on host {}", host);

    let mut server = PimServer::bind(config, &host, process::detect())
        .await
        .context("Failed to open refresh port")?;

    let (tx, rx) = watch::channel(false);
    spawn_signal_watch(tx)?;
    server.run(rx).await.context("PIM main loop failed")?;
    Ok(())
}
