//! PIM configuration from the environment
//!
//! Values come from process environment variables, optionally seeded from
//! `<envdir>/lsf.conf`. Bad numbers are logged and replaced by the default.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

pub const DEFAULT_INFO_DIR: &str = "/tmp";
pub const DEFAULT_SLEEP_SECS: u64 = 3;
pub const DEFAULT_UPDATE_SECS: u64 = 30;
pub const DEFAULT_NPROC: usize = 16384;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PimConfig {
    /// Directory holding `pim.info.<host>`
    pub info_dir: PathBuf,
    /// Longest wait for a refresh request before the loop comes around
    pub sleep_time: Duration,
    pub update_interval: Duration,
    /// Most process records kept per scan
    pub max_procs: usize,
    pub debug: u8,
    /// Exit when the parent process is gone
    pub check_parent: bool,
}

impl Default for PimConfig {
    fn default() -> Self {
        Self {
            info_dir: PathBuf::from(DEFAULT_INFO_DIR),
            sleep_time: Duration::from_secs(DEFAULT_SLEEP_SECS),
            update_interval: Duration::from_secs(DEFAULT_UPDATE_SECS),
            max_procs: DEFAULT_NPROC,
            debug: 0,
            check_parent: true,
        }
    }
}

impl PimConfig {
    /// Seed the environment from `<env_dir>/lsf.conf` (if present), then read it
    pub fn load(env_dir: &Path) -> Self {
        let conf = env_dir.join("lsf.conf");
        match dotenvy::from_path(&conf) {
            Ok(()) => debug!("loaded {}", conf.display()),
            Err(e) => debug!("no environment file {}: {}", conf.display(), e),
        }
        Self::from_env()
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("LSF_PIM_INFODIR").filter(|d| !d.trim().is_empty()) {
            config.info_dir = PathBuf::from(dir.trim());
        }
        if let Some(secs) = number(&lookup, "LSF_PIM_SLEEPTIME", DEFAULT_SLEEP_SECS as i64, 1) {
            config.sleep_time = Duration::from_secs(secs as u64);
        }
        if let Some(secs) = number(&lookup, "LSF_PIM_UPDATE_INTERVAL", DEFAULT_UPDATE_SECS as i64, 0) {
            config.update_interval = Duration::from_secs(secs as u64);
        }
        if let Some(n) = number(&lookup, "LSF_PIM_NPROC", DEFAULT_NPROC as i64, 1) {
            config.max_procs = n as usize;
        }
        // Any setting turns debugging on
        if let Some(level) = lookup("LSF_LIM_DEBUG") {
            config.debug = level.trim().parse::<u8>().unwrap_or(1).clamp(1, 2);
        }
        config
    }

    pub fn snapshot_path(&self, host: &str) -> PathBuf {
        self.info_dir.join(format!("pim.info.{host}"))
    }
}

/// Parse an integer variable no smaller than `min`; invalid values give `default`
fn number<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str, default: i64, min: i64) -> Option<i64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<i64>() {
        Ok(v) if v >= min => Some(v),
        _ => {
            error!("{} value {} must be an integer >= {}, set to {}", key, raw, min, default);
            Some(default)
        }
    }
}
