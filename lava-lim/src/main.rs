//! lim - load information manager daemon
//!
//! One sampling cycle per tick, peer load payloads from the UDP load port,
//! and the PIM kept alive as a child.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lava_lim::broadcast::{ClusterLoadTable, LoadBroadcast, LoadPublisher, UdpPublisher, MAX_DATAGRAM};
use lava_lim::elim::ChildProbeLauncher;
use lava_lim::metrics;
use lava_lim::supervisor::ChildSupervisor;
use lava_lim::{LimConfig, LimError, LoadEngine};

struct Lim {
    config: LimConfig,
    host_name: String,
    engine: LoadEngine,
    publisher: UdpPublisher,
    socket: UdpSocket,
    cluster: ClusterLoadTable,
    master_candidates: Vec<String>,
    master: Option<String>,
    started_at: i64,
    pim: Option<ChildSupervisor>,
}

impl Lim {
    async fn new(config: LimConfig) -> Result<Self> {
        let host_name = config.host_name();
        let platform = metrics::detect(Duration::from_secs(config.timing.rate_gap_secs));
        let engine = match LoadEngine::new(&config, platform, Box::new(ChildProbeLauncher)) {
            Ok(engine) => engine,
            Err(e @ LimError::IndexTableFull { .. }) => {
                error!("{}, exiting", e);
                return Err(e).context("Load index table exhausted");
            }
            Err(e) => return Err(e).context("Failed to initialise load engine"),
        };

        let publisher = UdpPublisher::new(&config.cluster.peers).context("Failed to open broadcast socket")?;
        let socket = UdpSocket::bind(("0.0.0.0", config.cluster.load_port))
            .await
            .with_context(|| format!("Failed to bind load port {}", config.cluster.load_port))?;
        let pim = ChildSupervisor::from_config(&config.pim);
        let master_candidates = config.master_candidates();

        info!(
            "{} ready: {} peers, load port {}, master {:?}",
            host_name,
            publisher.peers().len(),
            config.cluster.load_port,
            config.master_host()
        );

        Ok(Self {
            config,
            host_name,
            engine,
            publisher,
            socket,
            cluster: ClusterLoadTable::new(),
            master_candidates,
            master: None,
            started_at: chrono::Utc::now().timestamp(),
            pim,
        })
    }

    async fn run(&mut self) -> Result<()> {
        let mut tick = interval(Duration::from_secs(self.config.timing.sample_interval_secs));
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = tick.tick() => self.cycle(),

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.ingest(&buf[..n], from),
                    Err(e) => warn!("load port receive failed: {}", e),
                },

                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    break;
                }
            }
        }

        self.engine.shutdown();
        if let Some(pim) = self.pim.as_mut() {
            pim.shutdown();
        }
        info!("lim stopped");
        Ok(())
    }

    /// Re-elect the master from who has been heard from lately
    ///
    /// Until one staleness window has passed since startup the configured
    /// master keeps the role, since nobody could have been heard from yet.
    fn refresh_role(&mut self, now: i64) -> bool {
        let window = self.config.timing.master_stale_secs as i64;
        let master = if now - self.started_at < window {
            self.config.master_host().map(str::to_string)
        } else {
            self.cluster
                .elect_master(&self.master_candidates, &self.host_name, now - window)
                .map(str::to_string)
        };
        if master != self.master {
            info!("master is now {}", master.as_deref().unwrap_or("unknown"));
            self.master = master;
        }
        self.master.as_deref() == Some(self.host_name.as_str())
    }

    fn cycle(&mut self) {
        let now = chrono::Utc::now().timestamp();
        let is_master = self.refresh_role(now);
        if let Some(payload) = self.engine.run_cycle(now, is_master) {
            if let Err(e) = self.publisher.publish(&payload) {
                error!("Failed to broadcast load: {}", e);
            }
            self.cluster.record(payload);
        }
        if let Some(pim) = self.pim.as_mut() {
            pim.check(now);
        }
    }

    fn ingest(&mut self, bytes: &[u8], from: std::net::SocketAddr) {
        let payload = match LoadBroadcast::from_bytes(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("bad load payload from {}: {}", from, e);
                return;
            }
        };
        let now = chrono::Utc::now().timestamp();
        let is_master = self.refresh_role(now);
        let stored = self.engine.ingest_peer(&payload, is_master, now);
        debug!("load from {} seq {} ({} shared values)", payload.host, payload.seq, stored);
        if self.cluster.record(payload) {
            let busy = self.cluster.busy_hosts();
            if !busy.is_empty() {
                debug!("busy hosts: {:?}", busy);
            }
        }
    }
}

fn log_filter(debug: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match debug {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("lava_lim={level},lim={level}"))
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = LimConfig::load().context("Failed to load LIM configuration")?;
    tracing_subscriber::fmt().with_env_filter(log_filter(config.debug)).init();

    info!("lava lim {} starting", env!("CARGO_PKG_VERSION"));
    let mut lim = Lim::new(config).await.context("Failed to start lim")?;
    lim.run().await.context("lim main loop failed")
}
