//! Linux collectors reading `/proc`

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::rate::RateTracker;
use super::tty::{self, TtyActivity};
use super::{PlatformMetrics, QueueLengths, StaticInfo};

/// Longest host model name we report
const MAX_MODEL_LEN: usize = 39;
const DEFAULT_CLK_TCK: f64 = 100.0;
const SECTOR_KB: f64 = 0.5;

/// Where the collectors look; overridable so tests can point at a fake tree
#[derive(Debug, Clone)]
pub struct ProcfsPaths {
    pub proc_root: PathBuf,
    pub tmp_dir: PathBuf,
    pub utmp: PathBuf,
    pub dev_dir: PathBuf,
}

impl Default for ProcfsPaths {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            tmp_dir: PathBuf::from("/tmp"),
            utmp: PathBuf::from("/var/run/utmp"),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

pub struct ProcfsMetrics {
    paths: ProcfsPaths,
    ncpus: u32,
    clk_tck: f64,
    cpu: RateTracker,
    paging: RateTracker,
    io: RateTracker,
}

impl ProcfsMetrics {
    pub fn new(rate_gap: Duration) -> Self {
        Self::with_paths(ProcfsPaths::default(), rate_gap)
    }

    pub fn with_paths(paths: ProcfsPaths, rate_gap: Duration) -> Self {
        let clk_tck = match nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK) {
            Ok(Some(ticks)) if ticks > 0 => ticks as f64,
            _ => DEFAULT_CLK_TCK,
        };
        let mut metrics = Self {
            paths,
            ncpus: 1,
            clk_tck,
            cpu: RateTracker::new(rate_gap),
            paging: RateTracker::new(rate_gap),
            io: RateTracker::new(rate_gap),
        };
        metrics.ncpus = metrics.cpu_count().unwrap_or(1).max(1);
        metrics
    }

    fn proc_file(&self, name: &str) -> PathBuf {
        self.paths.proc_root.join(name)
    }

    fn read(&self, name: &str) -> Option<String> {
        let path = self.proc_file(name);
        match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) => {
                error!("open {} failed: {}", path.display(), e);
                None
            }
        }
    }

    fn meminfo(&self) -> Option<HashMap<String, u64>> {
        self.read("meminfo").map(|content| parse_meminfo(&content))
    }

    fn rate_scale_cpu(&self) -> f64 {
        self.clk_tck * self.ncpus as f64
    }
}

impl PlatformMetrics for ProcfsMetrics {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn cpu_count(&mut self) -> Option<u32> {
        let content = self.read("cpuinfo")?;
        let count = content
            .lines()
            .filter(|line| line.starts_with("processor"))
            .count() as u32;
        (count > 0).then_some(count)
    }

    fn run_queue_lengths(&mut self) -> Option<QueueLengths> {
        let content = self.read("loadavg")?;
        let queues = parse_loadavg(&content);
        if queues.is_none() {
            error!("cannot parse {}", self.proc_file("loadavg").display());
        }
        queues
    }

    fn cpu_utilization(&mut self) -> Option<f64> {
        let content = self.read("stat")?;
        let Some(busy) = parse_cpu_busy_ticks(&content) else {
            error!("no cpu line in {}", self.proc_file("stat").display());
            return None;
        };
        let scale = self.rate_scale_cpu();
        let ut = self.cpu.update(busy, Instant::now(), scale).clamp(0.0, 1.0);
        debug!("cpu utilization {:.3} (busy ticks {})", ut, busy);
        Some(ut)
    }

    fn paging_rate(&mut self) -> Option<f64> {
        let content = self.read("vmstat")?;
        let Some(pages) = parse_swap_pages(&content) else {
            error!("no pswpin/pswpout in {}", self.proc_file("vmstat").display());
            return None;
        };
        let ncpus = self.ncpus as f64;
        Some(self.paging.update(pages, Instant::now(), ncpus))
    }

    fn io_rate(&mut self) -> Option<f64> {
        let content = self.read("diskstats")?;
        let sectors = disk_sectors(&content);
        Some(self.io.update(sectors, Instant::now(), 1.0) * SECTOR_KB)
    }

    fn free_memory_kb(&mut self) -> Option<u64> {
        let info = self.meminfo()?;
        let free = info.get("MemFree").copied().unwrap_or(0) + info.get("Cached").copied().unwrap_or(0);
        Some(free)
    }

    fn free_swap_kb(&mut self) -> Option<u64> {
        self.meminfo()?.get("SwapFree").copied()
    }

    fn free_tmp_mb(&mut self) -> Option<u64> {
        match nix::sys::statvfs::statvfs(&self.paths.tmp_dir) {
            Ok(fs) => Some(fs.blocks_available() as u64 * fs.fragment_size() as u64 / (1024 * 1024)),
            Err(e) => {
                error!("statvfs {} failed: {}", self.paths.tmp_dir.display(), e);
                None
            }
        }
    }

    fn tty_activity(&mut self) -> Option<TtyActivity> {
        let lines = match tty::read_utmp_lines(&self.paths.utmp) {
            Ok(lines) => lines,
            Err(e) => {
                error!("cannot read {}: {}", self.paths.utmp.display(), e);
                return None;
            }
        };
        let now = chrono::Utc::now().timestamp();
        Some(tty::idle_from_ages(tty::session_ages(&lines, &self.paths.dev_dir, now)))
    }

    fn static_info(&mut self) -> StaticInfo {
        let info = self.meminfo().unwrap_or_default();
        let max_tmp_mb = match nix::sys::statvfs::statvfs(&self.paths.tmp_dir) {
            Ok(fs) => fs.blocks() as u64 * fs.fragment_size() as u64 / (1024 * 1024),
            Err(e) => {
                warn!("statvfs {} failed: {}", self.paths.tmp_dir.display(), e);
                0
            }
        };
        StaticInfo {
            max_mem_mb: info.get("MemTotal").copied().unwrap_or(0) / 1024,
            max_swap_mb: info.get("SwapTotal").copied().unwrap_or(0) / 1024,
            max_tmp_mb,
            model: self.read("cpuinfo").map(|c| host_model(&c)).unwrap_or_default(),
        }
    }
}

fn parse_loadavg(content: &str) -> Option<QueueLengths> {
    let mut fields = content.split_whitespace().map(str::parse::<f64>);
    let r15s = fields.next()?.ok()?;
    let r1m = fields.next()?.ok()?;
    let r15m = fields.next()?.ok()?;
    Some(QueueLengths { r15s, r1m, r15m })
}

/// user + nice + system ticks from the aggregate cpu line
fn parse_cpu_busy_ticks(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let ticks: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(3)
        .filter_map(|t| t.parse().ok())
        .collect();
    (ticks.len() == 3).then(|| ticks.iter().sum())
}

fn parse_swap_pages(content: &str) -> Option<u64> {
    let mut pswpin = None;
    let mut pswpout = None;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next().and_then(|v| v.parse::<u64>().ok())) {
            (Some("pswpin"), Some(v)) => pswpin = Some(v),
            (Some("pswpout"), Some(v)) => pswpout = Some(v),
            _ => {}
        }
    }
    Some(pswpin? + pswpout?)
}

fn parse_meminfo(content: &str) -> HashMap<String, u64> {
    content
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim().to_string(), value))
        })
        .collect()
}

/// Sectors read + written over whole disks; partitions and virtual devices are skipped
fn disk_sectors(content: &str) -> u64 {
    let rows: Vec<(&str, u64)> = content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let read = fields[5].parse::<u64>().ok()?;
            let written = fields[9].parse::<u64>().ok()?;
            Some((fields[2], read + written))
        })
        .collect();

    rows.iter()
        .filter(|(name, _)| !["loop", "ram", "dm-", "zram"].iter().any(|p| name.starts_with(p)))
        .filter(|(name, _)| {
            !rows
                .iter()
                .any(|(other, _)| other != name && name.starts_with(other))
        })
        .map(|(_, sectors)| sectors)
        .sum()
}

/// Model string from cpu family, bogomips and model name
fn host_model(cpuinfo: &str) -> String {
    let mut family = String::new();
    let mut model = String::new();
    let mut bogomips = 0i64;

    for line in cpuinfo.lines() {
        let lower = line.to_ascii_lowercase();
        let value = line.split_once(':').map(|(_, v)| v.trim());
        if lower.starts_with("cpu\t") || lower.starts_with("cpu family") {
            if let Some(v) = value {
                family = strip_illegal(v);
            }
        }
        if line.contains("model") {
            if let Some(v) = value {
                model = strip_illegal(v);
            }
        }
        if lower.starts_with("bogomips") {
            if let Some(v) = value {
                bogomips = crate::resources::leading_number(v) as i64;
            }
        }
    }

    if family.is_empty() {
        return String::new();
    }

    let mut result = String::new();
    if family.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('x');
    }
    result.push_str(&family);
    result.truncate(MAX_MODEL_LEN - 14);
    if bogomips != 0 {
        result.push_str(&format!("_{bogomips}"));
        if !model.is_empty() {
            result.push('_');
            result.push_str(&model);
        }
    }
    result.chars().take(MAX_MODEL_LEN).collect()
}

fn strip_illegal(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Fake `/proc` tree for tests
#[cfg(test)]
pub(crate) fn fake_proc(dir: &std::path::Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        std::fs::write(dir.join(name), content).unwrap();
    }
}
