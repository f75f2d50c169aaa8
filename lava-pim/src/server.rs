//! PIM main loop
//!
//! Scans on a fixed interval and on every refresh request. The loop checks
//! once per iteration that its parent is still alive and that no shutdown
//! was requested; a scan in progress always completes.

use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::PimConfig;
use crate::error::Result;
use crate::process::ProcessSource;
use crate::protocol::{read_header, write_header};
use crate::snapshot;

/// Longest a client may take to send its header
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PimServer {
    config: PimConfig,
    listener: TcpListener,
    port: u16,
    snapshot_path: PathBuf,
    source: Box<dyn ProcessSource>,
    watch_parent: bool,
}

/// True when our parent is init or no longer accepts signals
fn parent_gone() -> bool {
    let ppid = getppid();
    ppid.as_raw() <= 1 || kill(Pid::from_raw(ppid.as_raw()), None).is_err()
}

impl PimServer {
    /// Listen on an ephemeral TCP port; the port goes into every snapshot
    pub async fn bind(config: PimConfig, host: &str, source: Box<dyn ProcessSource>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let snapshot_path = config.snapshot_path(host);
        info!(
            "PIM on {} listening on port {}, snapshot {} via {}",
            host,
            port,
            snapshot_path.display(),
            source.name()
        );
        Ok(Self {
            watch_parent: config.check_parent,
            config,
            listener,
            port,
            snapshot_path,
            source,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn watch_parent(&mut self, enabled: bool) {
        self.watch_parent = enabled;
    }

    /// Scan and publish; returns the number of records written
    pub fn update(&mut self) -> Result<usize> {
        let started = Instant::now();
        let records = self.source.scan(self.config.max_procs)?;
        snapshot::publish(&self.snapshot_path, self.port, &records)?;
        debug!("process table updated: {} records in {:?}", records.len(), started.elapsed());
        Ok(records.len())
    }

    fn update_logged(&mut self) {
        if let Err(e) = self.update() {
            error!("process table update failed: {}", e);
        }
    }

    /// Serve until shutdown is signalled or the parent goes away
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.update_logged();
        let mut next_update = Instant::now() + self.config.update_interval;

        loop {
            if self.watch_parent && parent_gone() {
                info!("Parent gone, PIM exiting");
                return Ok(());
            }
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_update {
                self.update_logged();
                next_update = Instant::now() + self.config.update_interval;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("refresh connection from {}", peer);
                        self.serve(stream).await;
                        next_update = Instant::now() + self.config.update_interval;
                    }
                    Err(e) => error!("accept failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("shutdown channel closed");
                        break;
                    }
                }
                _ = sleep(self.config.sleep_time) => {}
            }
        }

        info!("PIM shutting down");
        Ok(())
    }

    async fn serve(&mut self, mut stream: TcpStream) {
        let header = match timeout(REQUEST_TIMEOUT, read_header(&mut stream)).await {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                error!("bad refresh request: {}", e);
                return;
            }
            Err(_) => {
                warn!("refresh request timed out");
                return;
            }
        };
        debug!("got op code {} pgid {}, updating now", header.op_code, header.reserved);

        self.update_logged();
        if let Err(e) = write_header(&mut stream, &header).await {
            error!("refresh reply failed: {}", e);
        }
    }
}
