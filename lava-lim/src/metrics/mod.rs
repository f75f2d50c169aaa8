//! Raw load collection
//!
//! Each platform strategy implements [`PlatformMetrics`]. A reading the
//! platform cannot produce comes back as `None`; the strategy has already
//! logged why. [`Collector`] turns a round of readings into a [`RawSample`],
//! substituting safe defaults so a missing data source never stops the
//! sampling loop.

pub mod procfs;
pub mod rate;
pub mod scripted;
pub mod shell;
pub mod tty;

use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use procfs::ProcfsMetrics;
pub use rate::RateTracker;
pub use scripted::ScriptedMetrics;
pub use shell::ShellToolMetrics;
pub use tty::TtyActivity;

/// 15 second, 1 minute and 15 minute run queue lengths
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueLengths {
    pub r15s: f64,
    pub r1m: f64,
    pub r15m: f64,
}

/// Capacities that only change when the host is reconfigured
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StaticInfo {
    pub max_mem_mb: u64,
    pub max_swap_mb: u64,
    pub max_tmp_mb: u64,
    pub model: String,
}

/// One platform's way of reading the built-in load sources
pub trait PlatformMetrics: Send {
    fn name(&self) -> &'static str;

    fn cpu_count(&mut self) -> Option<u32>;

    fn run_queue_lengths(&mut self) -> Option<QueueLengths>;

    /// Busy fraction of all CPUs since the previous call, in [0, 1]
    fn cpu_utilization(&mut self) -> Option<f64>;

    /// Pages in + out per second per CPU since the previous call
    fn paging_rate(&mut self) -> Option<f64>;

    /// KB transferred per second since the previous call
    fn io_rate(&mut self) -> Option<f64>;

    fn free_memory_kb(&mut self) -> Option<u64>;

    fn free_swap_kb(&mut self) -> Option<u64>;

    fn free_tmp_mb(&mut self) -> Option<u64>;

    fn tty_activity(&mut self) -> Option<TtyActivity>;

    fn static_info(&mut self) -> StaticInfo;
}

/// One round of built-in readings, in the units the load vector uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RawSample {
    pub run_queue: QueueLengths,
    pub ut: f64,
    pub pg: f64,
    pub io: f64,
    pub ls: f64,
    /// Seconds since the most recent terminal input
    pub it: f64,
    pub tmp_mb: f64,
    pub swp_mb: f64,
    pub mem_mb: f64,
}

/// Wraps a platform strategy and applies the unavailable-source defaults
pub struct Collector {
    platform: Box<dyn PlatformMetrics>,
}

impl Collector {
    pub fn new(platform: Box<dyn PlatformMetrics>) -> Self {
        info!("Using {} load collectors", platform.name());
        Self { platform }
    }

    pub fn platform_name(&self) -> &'static str {
        self.platform.name()
    }

    /// CPU count, never less than one
    pub fn cpu_count(&mut self) -> u32 {
        match self.platform.cpu_count() {
            Some(n) if n > 0 => n,
            _ => {
                warn!("{}: cannot determine CPU count, assuming 1", self.platform.name());
                1
            }
        }
    }

    pub fn static_info(&mut self) -> StaticInfo {
        self.platform.static_info()
    }

    /// Read every built-in source once
    pub fn sample(&mut self) -> RawSample {
        let run_queue = self.platform.run_queue_lengths().unwrap_or_default();
        let ut = self.platform.cpu_utilization().unwrap_or(0.0).clamp(0.0, 1.0);
        let pg = self.platform.paging_rate().unwrap_or(0.0).max(0.0);
        let io = self.platform.io_rate().unwrap_or(0.0).max(0.0);
        let tty = self.platform.tty_activity().unwrap_or_default();
        let tmp_mb = self.platform.free_tmp_mb().unwrap_or(0) as f64;
        let swp_mb = self.platform.free_swap_kb().unwrap_or(0) as f64 / 1024.0;
        let mem_mb = self.platform.free_memory_kb().unwrap_or(0) as f64 / 1024.0;

        let sample = RawSample {
            run_queue,
            ut,
            pg,
            io,
            ls: tty.sessions as f64,
            it: tty.idle_secs,
            tmp_mb,
            swp_mb,
            mem_mb,
        };
        debug!("raw sample: {:?}", sample);
        sample
    }
}

/// Procfs collectors where `/proc` is mounted, shell tools elsewhere
pub fn detect(rate_gap: Duration) -> Box<dyn PlatformMetrics> {
    if Path::new("/proc/loadavg").exists() {
        Box::new(ProcfsMetrics::new(rate_gap))
    } else {
        Box::new(ShellToolMetrics::new(rate_gap))
    }
}
