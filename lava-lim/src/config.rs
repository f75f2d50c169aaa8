//! LIM configuration
//!
//! Loaded from a TOML file (`LAVA_LIM_CONFIG`, default `/etc/lava/lim.toml`).
//! A missing file yields the defaults so a bare host still reports the
//! built-in indices.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{LimError, Result};
use crate::index::{BuiltinIndex, DEFAULT_MAX_INDICES};
use crate::resources::ValueType;

pub const CONFIG_ENV: &str = "LAVA_LIM_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lava/lim.toml";

/// Shortest allowed spacing between two ELIM starts
pub const MIN_ELIM_BACKOFF_SECS: u64 = 90;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimConfig {
    pub host: HostConfig,
    pub cluster: ClusterConfig,
    pub timing: TimingConfig,
    /// Busy thresholds for built-in indices, keyed by index name
    pub thresholds: HashMap<String, f64>,
    pub extra_load: ExtraLoadConfig,
    pub resources: Vec<ResourceConfig>,
    pub shared: Vec<SharedConfig>,
    pub elim: ElimConfig,
    pub pim: PimConfig,
    /// 0 = info, 1 = debug, 2 = trace
    pub debug: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Overrides the system host name
    pub name: Option<String>,
    /// Overrides the detected CPU count
    pub ncpus: Option<i32>,
    /// Host model -> relative CPU speed factor
    pub models: HashMap<String, f64>,
    /// Run the ELIM on this host even without `elim.always_run`
    pub run_elim: bool,
    pub max_indices: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub hosts: Vec<String>,
    /// Defaults to the first entry of `hosts`
    pub master: Option<String>,
    pub load_port: u16,
    /// `host:port` destinations for load broadcasts
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub sample_interval_secs: u64,
    pub exchange_interval_secs: u64,
    /// A rate collector idle for longer than this restarts from a new baseline
    pub rate_gap_secs: u64,
    /// Shared values not refreshed within this many seconds revert to "-"; 0 disables
    pub shared_stale_secs: u64,
    /// Broadcast at least every N exchange intervals even without changes
    pub max_silent_exchanges: u32,
    /// A host not heard from for this long cannot hold the master role
    pub master_stale_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtraLoadConfig {
    /// Number of exchange intervals the contribution takes to decay
    pub window: u32,
    /// Per-index synthetic load added right after a dispatch
    pub values: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub interval: u32,
    #[serde(default = "default_true")]
    pub increasing: bool,
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    pub resource: String,
    pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElimConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    /// Run on every host regardless of `host.run_elim`
    pub always_run: bool,
    /// Remaining restarts; `None` means unlimited
    pub restarts: Option<u32>,
    pub backoff_secs: u64,
    pub poll_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PimConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub restart_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            name: None,
            ncpus: None,
            models: HashMap::new(),
            run_elim: false,
            max_indices: DEFAULT_MAX_INDICES,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            master: None,
            load_port: 7869,
            peers: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            exchange_interval_secs: 15,
            rate_gap_secs: 300,
            shared_stale_secs: 0,
            max_silent_exchanges: 8,
            master_stale_secs: 60,
        }
    }
}

impl Default for ElimConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            always_run: false,
            restarts: None,
            backoff_secs: MIN_ELIM_BACKOFF_SECS,
            poll_timeout_ms: 5,
        }
    }
}

impl Default for PimConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            restart_backoff_secs: 30,
        }
    }
}

impl LimConfig {
    /// Load from `LAVA_LIM_CONFIG` or the default location
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        info!("Loaded LIM config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: LimConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timing.sample_interval_secs == 0 {
            return Err(LimError::Config("timing.sample_interval_secs must be > 0".into()));
        }
        if self.timing.exchange_interval_secs < self.timing.sample_interval_secs {
            return Err(LimError::Config(
                "timing.exchange_interval_secs must not be shorter than the sample interval".into(),
            ));
        }
        if self.elim.backoff_secs < MIN_ELIM_BACKOFF_SECS {
            return Err(LimError::Config(format!(
                "elim.backoff_secs must be at least {MIN_ELIM_BACKOFF_SECS}"
            )));
        }

        for name in self.thresholds.keys().chain(self.extra_load.values.keys()) {
            if BuiltinIndex::from_name(name).is_none() {
                return Err(LimError::Config(format!("{name} is not a built-in load index")));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for res in &self.resources {
            if BuiltinIndex::from_name(&res.name).is_some() {
                return Err(LimError::Config(format!("{} shadows a built-in index", res.name)));
            }
            if !seen.insert(res.name.as_str()) {
                return Err(LimError::Config(format!("resource {} declared twice", res.name)));
            }
        }

        for shared in &self.shared {
            match self.resources.iter().find(|r| r.name == shared.resource) {
                Some(r) if r.shared => {}
                Some(_) => {
                    return Err(LimError::Config(format!(
                        "{} has host instances but is not declared shared",
                        shared.resource
                    )))
                }
                None => return Err(LimError::UnknownResource(shared.resource.clone())),
            }
            if shared.hosts.is_empty() {
                return Err(LimError::Config(format!("{} is shared by no host", shared.resource)));
            }
        }

        Ok(())
    }

    /// Host name this daemon reports as
    pub fn host_name(&self) -> String {
        self.host
            .name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string())
    }

    pub fn master_host(&self) -> Option<&str> {
        self.cluster
            .master
            .as_deref()
            .or_else(|| self.cluster.hosts.first().map(String::as_str))
    }

    pub fn is_master(&self, host: &str) -> bool {
        self.master_host() == Some(host)
    }

    /// Hosts in the order they take over the master role
    pub fn master_candidates(&self) -> Vec<String> {
        let mut order: Vec<String> = self.cluster.master.iter().cloned().collect();
        for host in &self.cluster.hosts {
            if !order.contains(host) {
                order.push(host.clone());
            }
        }
        order
    }

    /// Number of hosts in the cluster; a lone host counts as one
    pub fn cluster_size(&self) -> usize {
        self.cluster.hosts.len().max(1)
    }
}
