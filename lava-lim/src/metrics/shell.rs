//! Portable collectors: sysinfo for CPU and memory, shell tools for the rest
//!
//! Used where `/proc` is not available. Free space comes from `df -Pk`,
//! paging counters from `vmstat -s` and sessions from `who`.

use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, error, warn};

use super::rate::RateTracker;
use super::tty::{self, TtyActivity};
use super::{PlatformMetrics, QueueLengths, StaticInfo};

pub struct ShellToolMetrics {
    sys: System,
    tmp_dir: PathBuf,
    dev_dir: PathBuf,
    ncpus: u32,
    cpu_primed: bool,
    paging: RateTracker,
}

impl ShellToolMetrics {
    pub fn new(rate_gap: Duration) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        let ncpus = (sys.cpus().len() as u32).max(1);
        Self {
            sys,
            tmp_dir: PathBuf::from("/tmp"),
            dev_dir: PathBuf::from("/dev"),
            ncpus,
            cpu_primed: false,
            paging: RateTracker::new(rate_gap),
        }
    }
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => Some(String::from_utf8_lossy(&output.stdout).to_string()),
        Ok(output) => {
            error!("{} exited with {}", program, output.status);
            None
        }
        Err(e) => {
            error!("cannot run {}: {}", program, e);
            None
        }
    }
}

impl PlatformMetrics for ShellToolMetrics {
    fn name(&self) -> &'static str {
        "shell-tools"
    }

    fn cpu_count(&mut self) -> Option<u32> {
        self.sys.refresh_cpu();
        let count = self.sys.cpus().len() as u32;
        (count > 0).then_some(count)
    }

    fn run_queue_lengths(&mut self) -> Option<QueueLengths> {
        let load = System::load_average();
        Some(QueueLengths {
            r15s: load.one,
            r1m: load.five,
            r15m: load.fifteen,
        })
    }

    fn cpu_utilization(&mut self) -> Option<f64> {
        self.sys.refresh_cpu();
        // sysinfo needs two refreshes before usage means anything
        if !self.cpu_primed {
            self.cpu_primed = true;
            return Some(0.0);
        }
        let usage = self.sys.global_cpu_info().cpu_usage() as f64 / 100.0;
        Some(usage.clamp(0.0, 1.0))
    }

    fn paging_rate(&mut self) -> Option<f64> {
        let output = run_tool("vmstat", &["-s"])?;
        let Some(pages) = parse_vmstat_swapped(&output) else {
            warn!("vmstat -s reported no swap counters");
            return None;
        };
        let ncpus = self.ncpus as f64;
        Some(self.paging.update(pages, Instant::now(), ncpus))
    }

    fn io_rate(&mut self) -> Option<f64> {
        None
    }

    fn free_memory_kb(&mut self) -> Option<u64> {
        self.sys.refresh_memory();
        Some(self.sys.available_memory() / 1024)
    }

    fn free_swap_kb(&mut self) -> Option<u64> {
        self.sys.refresh_memory();
        Some(self.sys.free_swap() / 1024)
    }

    fn free_tmp_mb(&mut self) -> Option<u64> {
        let tmp = self.tmp_dir.to_string_lossy().to_string();
        let output = run_tool("df", &["-Pk", &tmp])?;
        parse_df(&output).map(|(_, avail_kb)| avail_kb / 1024)
    }

    fn tty_activity(&mut self) -> Option<TtyActivity> {
        let output = run_tool("who", &[])?;
        let lines = parse_who(&output);
        debug!("{} login sessions", lines.len());
        let now = chrono::Utc::now().timestamp();
        Some(tty::idle_from_ages(tty::session_ages(&lines, &self.dev_dir, now)))
    }

    fn static_info(&mut self) -> StaticInfo {
        self.sys.refresh_memory();
        let tmp = self.tmp_dir.to_string_lossy().to_string();
        let max_tmp_mb = run_tool("df", &["-Pk", &tmp])
            .and_then(|out| parse_df(&out))
            .map(|(total_kb, _)| total_kb / 1024)
            .unwrap_or(0);
        StaticInfo {
            max_mem_mb: self.sys.total_memory() / (1024 * 1024),
            max_swap_mb: self.sys.total_swap() / (1024 * 1024),
            max_tmp_mb,
            model: System::name().unwrap_or_default(),
        }
    }
}

/// (total KB, available KB) from POSIX `df -Pk` output
fn parse_df(output: &str) -> Option<(u64, u64)> {
    let line = output.lines().nth(1)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    Some((parts[1].parse().ok()?, parts[3].parse().ok()?))
}

fn parse_vmstat_swapped(output: &str) -> Option<u64> {
    let mut total = None;
    for line in output.lines() {
        let line = line.trim();
        if line.ends_with("pages swapped in") || line.ends_with("pages swapped out") {
            let count: u64 = line.split_whitespace().next()?.parse().ok()?;
            total = Some(total.unwrap_or(0) + count);
        }
    }
    total
}

fn parse_who(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df() {
        let output = "Filesystem     1024-blocks    Used Available Capacity Mounted on\n\
                      /dev/sda2        41152736 9876543  29163076      26% /\n";
        assert_eq!(parse_df(output), Some((41152736, 29163076)));
        assert_eq!(parse_df("Filesystem\n"), None);
    }

    #[test]
    fn test_parse_vmstat_swapped() {
        let output = "  8040228 K total memory\n       12 pages swapped in\n       30 pages swapped out\n";
        assert_eq!(parse_vmstat_swapped(output), Some(42));
        assert_eq!(parse_vmstat_swapped("  8040228 K total memory\n"), None);
    }

    #[test]
    fn test_parse_who() {
        let output = "alice    pts/0        2024-05-01 10:00 (10.0.0.5)\nbob      tty1         2024-05-01 09:12\n";
        assert_eq!(parse_who(output), vec!["pts/0", "tty1"]);
    }

    #[test]
    fn test_first_utilization_is_zero() {
        let mut metrics = ShellToolMetrics::new(Duration::from_secs(300));
        assert_eq!(metrics.cpu_utilization(), Some(0.0));
    }
}
