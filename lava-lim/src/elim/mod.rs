//! External load integrator
//!
//! Runs the site's ELIM probe, reads the values it reports and routes them
//! into shared resources or the load vector. The probe is optional: with no
//! dynamic non-built-in resources configured the integrator never leaves
//! [`ElimState::Idle`].
//!
//! Restarts are spaced by comparing timestamps, never by sleeping, and are
//! limited by an optional quota. Every cycle the probe is expected but not
//! running, the values it owns are reset to unknown.

pub mod parser;
pub mod process;
pub mod scripted;
pub mod signals;

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{ElimConfig, LimConfig};
use crate::index::LoadIndexVector;
use crate::resources::{leading_number, ResourceTable, ValueType};
use crate::shared::SharedResources;
use parser::ElimParser;
use process::{ProbeHandle, ProbeLauncher, ProbeRead, ProbeSpec};
use signals::SignalBlock;

pub use process::ChildProbeLauncher;
pub use scripted::ScriptedLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElimState {
    /// Nothing to probe, or this host does not run the probe
    Idle,
    /// The probe should be running and a start is due
    ShouldRun,
    Running,
    /// Waiting out the minimum spacing between starts
    Backoff,
    /// Restart quota used up
    Disabled,
}

/// The engine state the integrator writes into
pub struct ElimContext<'a> {
    pub table: &'a ResourceTable,
    pub indices: &'a mut LoadIndexVector,
    pub shared: &'a mut SharedResources,
}

pub struct ElimIntegrator {
    config: ElimConfig,
    local_host: String,
    /// This host is configured to run the probe at all
    host_runs_probe: bool,
    has_probed_resources: bool,
    launcher: Box<dyn ProbeLauncher>,
    probe: Option<Box<dyn ProbeHandle>>,
    parser: ElimParser,
    state: ElimState,
    selected: bool,
    last_master: bool,
    last_start: Option<i64>,
    launched_once: bool,
    restarts_left: Option<u32>,
    unknown_names: HashSet<String>,
}

impl ElimIntegrator {
    pub fn new(
        config: &LimConfig,
        table: &ResourceTable,
        local_host: &str,
        launcher: Box<dyn ProbeLauncher>,
    ) -> Self {
        let has_probed_resources = table.has_probed_resources();
        let host_runs_probe = config.host.run_elim || config.elim.always_run;
        if has_probed_resources && host_runs_probe && config.elim.program.is_none() {
            warn!("Dynamic resources configured but no elim.program set, values stay unknown");
        }
        Self {
            config: config.elim.clone(),
            local_host: local_host.to_string(),
            host_runs_probe,
            has_probed_resources,
            launcher,
            probe: None,
            parser: ElimParser::new(),
            state: ElimState::Idle,
            selected: false,
            last_master: false,
            last_start: None,
            launched_once: false,
            restarts_left: config.elim.restarts,
            unknown_names: HashSet::new(),
        }
    }

    pub fn state(&self) -> ElimState {
        self.state
    }

    pub fn probe_pid(&self) -> Option<u32> {
        self.probe.as_ref().map(|p| p.pid())
    }

    /// Run one integrator cycle; returns true when a probe was started
    pub fn poll(&mut self, now: i64, is_master: bool, ctx: &mut ElimContext<'_>) -> bool {
        if !self.should_run(is_master) || !self.has_probed_resources {
            self.state = ElimState::Idle;
            return false;
        }

        let mut started = false;
        if self.probe.is_none() && self.state != ElimState::Disabled {
            started = self.try_start(now, is_master, ctx);
        }

        if self.probe.is_none() {
            if self.state != ElimState::Disabled {
                self.state = ElimState::Backoff;
            }
            set_unknown_values(ctx);
            return started;
        }

        self.state = ElimState::Running;
        self.read_probe(now, is_master, ctx);
        started
    }

    /// Terminate the probe, if any
    pub fn shutdown(&mut self) {
        self.stop_probe("shutdown");
        self.state = ElimState::Idle;
    }

    /// Decide whether the probe belongs on this host this cycle
    ///
    /// A change of master role always takes the running probe down first so
    /// it restarts with the new role in its environment.
    fn should_run(&mut self, is_master: bool) -> bool {
        if is_master != self.last_master {
            self.last_master = is_master;
            if self.selected {
                info!(
                    "Role changed to {}, restarting ELIM",
                    if is_master { "master" } else { "non-master" }
                );
                self.stop_probe("role change");
                self.last_start = None;
                if self.host_runs_probe {
                    return true;
                }
                self.selected = false;
                return false;
            }
        }

        if self.selected && !self.host_runs_probe {
            self.stop_probe("no longer selected");
        }
        self.selected = self.host_runs_probe;
        self.selected
    }

    fn try_start(&mut self, now: i64, is_master: bool, ctx: &ElimContext<'_>) -> bool {
        let backoff = self.config.backoff_secs as i64;
        if let Some(last) = self.last_start {
            if now - last <= backoff {
                debug!("ELIM restart in {}s", backoff - (now - last));
                return false;
            }
        }

        let Some(program) = self.config.program.clone() else {
            return false;
        };

        if self.launched_once {
            match self.restarts_left {
                Some(0) => {
                    error!("ELIM restart quota exhausted, not restarting {}", program.display());
                    self.state = ElimState::Disabled;
                    return false;
                }
                Some(ref mut left) => *left -= 1,
                None => {}
            }
        }

        self.state = ElimState::ShouldRun;
        self.last_start = Some(now);
        self.launched_once = true;
        self.parser.reset();

        let spec = ProbeSpec {
            program,
            args: self.config.args.clone(),
            env: probe_env(ctx.table, &*ctx.shared, &*ctx.indices, is_master),
        };
        debug!("ELIM environment: {:?}", spec.env);

        match self.launcher.launch(&spec) {
            Ok(handle) => {
                info!("ELIM {} running as pid {}", spec.program.display(), handle.pid());
                self.probe = Some(handle);
                true
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    fn read_probe(&mut self, now: i64, is_master: bool, ctx: &mut ElimContext<'_>) {
        let timeout = Duration::from_millis(self.config.poll_timeout_ms);
        let Some(probe) = self.probe.as_mut() else {
            return;
        };

        match probe.read_available(timeout) {
            Ok(ProbeRead::NoData) => {}
            Ok(ProbeRead::Data(bytes)) => {
                let _block = match SignalBlock::new() {
                    Ok(block) => Some(block),
                    Err(e) => {
                        warn!("cannot block signals while reading ELIM: {}", e);
                        None
                    }
                };
                let feed = self.parser.feed(&bytes);
                for batch in feed.batches {
                    debug!("ELIM batch of {} values", batch.len());
                    for (name, value) in batch {
                        self.route(&name, &value, now, is_master, ctx);
                    }
                }
                if let Some(e) = feed.error {
                    error!("{}", e);
                    self.stop_probe("protocol error");
                    set_unknown_values(ctx);
                    self.state = ElimState::Backoff;
                }
            }
            Ok(ProbeRead::Closed) => {
                if self.parser.in_batch() {
                    error!("ELIM protocol error: output ended inside a batch");
                } else {
                    warn!("ELIM exited");
                }
                self.stop_probe("exited");
                set_unknown_values(ctx);
                self.state = ElimState::Backoff;
            }
            Err(e) => {
                error!("reading ELIM output failed: {}", e);
                self.stop_probe("read failure");
                set_unknown_values(ctx);
                self.state = ElimState::Backoff;
            }
        }
    }

    /// Shared resources first, then numeric load indices
    fn route(&mut self, name: &str, value: &str, now: i64, is_master: bool, ctx: &mut ElimContext<'_>) {
        debug!("ELIM {} = {}", name, value);
        let outcome = ctx
            .shared
            .report_value(ctx.table, name, &self.local_host, value, is_master, now);
        if outcome.handled() {
            return;
        }

        let Some(resource) = ctx.table.get(name) else {
            if self.unknown_names.insert(name.to_string()) {
                error!("Unknown index name {} from ELIM", name);
            }
            return;
        };
        if resource.value_type != ValueType::Numeric {
            return;
        }
        if let Some(pos) = ctx.indices.position(name) {
            ctx.indices.set_value(pos, leading_number(value));
        }
    }

    fn stop_probe(&mut self, reason: &str) {
        if let Some(mut probe) = self.probe.take() {
            info!("Stopping ELIM pid {} ({})", probe.pid(), reason);
            probe.terminate();
        }
        self.parser.reset();
    }
}

impl Drop for ElimIntegrator {
    fn drop(&mut self) {
        self.stop_probe("integrator dropped");
    }
}

/// Forget everything the probe vouched for
fn set_unknown_values(ctx: &mut ElimContext<'_>) {
    ctx.indices.set_external_unknown();
    let reset = ctx.shared.reset_owned_by_local();
    if reset > 0 {
        debug!("{} shared values reset to unknown", reset);
    }
}

/// Environment handed to the probe
pub fn probe_env(
    table: &ResourceTable,
    shared: &SharedResources,
    indices: &LoadIndexVector,
    is_master: bool,
) -> Vec<(String, String)> {
    let resources: Vec<&str> = table
        .iter()
        .filter(|r| r.is_probed())
        .filter(|r| {
            if !r.flags.shared {
                return true;
            }
            if !is_master && shared.is_shared_in_all_hosts(&r.name) {
                return false;
            }
            shared.local_instance(&r.name).is_some()
        })
        .map(|r| r.name.as_str())
        .collect();

    let mut elim_resources: Vec<&str> = indices
        .iter()
        .filter(|i| table.get(&i.name).map_or(true, |r| !r.flags.external))
        .map(|i| i.name.as_str())
        .collect();
    elim_resources.extend(
        shared
            .local_instances()
            .filter(|inst| {
                table
                    .get(&inst.resource)
                    .map_or(false, |r| !r.flags.external && r.interval > 0)
            })
            .map(|inst| inst.resource.as_str()),
    );

    vec![
        ("LSF_MASTER".to_string(), if is_master { "Y" } else { "N" }.to_string()),
        ("LSF_RESOURCES".to_string(), resources.join(" ")),
        ("LS_ELIM_RESOURCES".to_string(), elim_resources.join(" ")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{LoadIndex, INFINIT_LOAD};
    use crate::shared::UNKNOWN_VALUE;

    const CONFIG: &str = r#"
[host]
name = "hostA"
run_elim = true

[cluster]
hosts = ["hostA", "hostB", "hostC"]

[[resources]]
name = "licA"
dynamic = true
shared = true
interval = 30

[[resources]]
name = "scratch"
dynamic = true

[[shared]]
resource = "licA"
hosts = ["hostA", "hostB"]

[elim]
program = "/usr/libexec/lava/elim"
restarts = 1
"#;

    struct Fixture {
        table: ResourceTable,
        indices: LoadIndexVector,
        shared: SharedResources,
        launcher: ScriptedLauncher,
        elim: ElimIntegrator,
    }

    impl Fixture {
        fn new(config: &str) -> Self {
            let config = LimConfig::parse(config).unwrap();
            let table = ResourceTable::from_config(&config);
            let mut indices = LoadIndexVector::with_builtins(config.host.max_indices);
            for r in table.load_indices() {
                indices
                    .push_external(LoadIndex::external(&r.name, r.increasing, r.threshold))
                    .unwrap();
            }
            let shared = SharedResources::from_config(&config, "hostA");
            let launcher = ScriptedLauncher::new();
            let elim = ElimIntegrator::new(&config, &table, "hostA", Box::new(launcher.clone()));
            Self {
                table,
                indices,
                shared,
                launcher,
                elim,
            }
        }

        fn poll(&mut self, now: i64, is_master: bool) -> bool {
            let mut ctx = ElimContext {
                table: &self.table,
                indices: &mut self.indices,
                shared: &mut self.shared,
            };
            self.elim.poll(now, is_master, &mut ctx)
        }

        fn scratch(&self) -> f64 {
            let pos = self.indices.position("scratch").unwrap();
            self.indices.get(pos).unwrap().value
        }
    }

    fn env_value<'a>(spec: &'a ProbeSpec, key: &str) -> &'a str {
        spec.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap()
    }

    #[test]
    fn test_idle_without_probed_resources() {
        let mut f = Fixture::new("[host]\nrun_elim = true\n[elim]\nprogram = \"/bin/elim\"\n");
        assert!(!f.poll(0, true));
        assert_eq!(f.elim.state(), ElimState::Idle);
        assert!(f.launcher.launches().is_empty());
    }

    #[test]
    fn test_idle_when_host_does_not_run_probe() {
        let mut f = Fixture::new(&CONFIG.replace("run_elim = true", "run_elim = false"));
        f.poll(0, true);
        assert_eq!(f.elim.state(), ElimState::Idle);
        assert!(f.launcher.launches().is_empty());
    }

    #[test]
    fn test_start_passes_environment() {
        let mut f = Fixture::new(CONFIG);
        assert!(f.poll(100, true));
        assert_eq!(f.elim.state(), ElimState::Running);

        let launches = f.launcher.launches();
        assert_eq!(launches.len(), 1);
        let spec = &launches[0];
        assert_eq!(env_value(spec, "LSF_MASTER"), "Y");
        assert_eq!(env_value(spec, "LSF_RESOURCES"), "licA scratch");
        assert!(env_value(spec, "LS_ELIM_RESOURCES").starts_with("r15s r1m r15m"));
        assert!(env_value(spec, "LS_ELIM_RESOURCES").ends_with("mem scratch licA"));
    }

    #[test]
    fn test_values_are_routed() {
        let mut f = Fixture::new(CONFIG);
        f.poll(100, true);
        f.launcher.push_output(b"3 licA 5 scratch 12.5 bogus 1\n");
        f.poll(105, true);

        let lic = f.shared.local_instance("licA").unwrap();
        assert_eq!(lic.value, "5");
        assert_eq!(lic.update_host.as_deref(), Some("hostA"));
        assert_eq!(f.scratch(), 12.5);

        f.launcher.push_output(b"1 bogus 2\n");
        f.poll(110, true);
        assert_eq!(f.elim.unknown_names.len(), 1);
    }

    #[test]
    fn test_protocol_error_resets_values() {
        let mut f = Fixture::new(CONFIG);
        f.poll(100, true);
        f.launcher.push_output(b"2 licA 5 scratch 3\n");
        f.poll(105, true);
        assert_eq!(f.scratch(), 3.0);

        f.launcher.push_output(b"oops\n");
        f.poll(110, true);
        assert_eq!(f.elim.state(), ElimState::Backoff);
        assert_eq!(f.launcher.terminations(), 1);
        assert_eq!(f.scratch(), INFINIT_LOAD);
        assert_eq!(f.shared.local_instance("licA").unwrap().value, UNKNOWN_VALUE);
    }

    #[test]
    fn test_batch_before_protocol_error_is_routed() {
        let mut f = Fixture::new(CONFIG);
        f.poll(100, true);
        f.launcher.push_output(b"1 bogus 2\nx licA 5\n");
        f.poll(105, true);
        assert!(f.elim.unknown_names.contains("bogus"));
        assert_eq!(f.elim.state(), ElimState::Backoff);
        assert_eq!(f.launcher.terminations(), 1);
    }

    #[test]
    fn test_restart_spacing_boundaries() {
        let mut f = Fixture::new(&CONFIG.replace("restarts = 1", ""));
        assert!(f.poll(0, true));
        f.launcher.exit_probe();
        f.poll(1, true);

        assert!(!f.poll(30, true));
        assert!(!f.poll(90, true));
        assert_eq!(f.launcher.launches().len(), 1);
        assert!(f.poll(91, true));
        assert_eq!(f.launcher.launches().len(), 2);
    }

    #[test]
    fn test_failures_within_backoff_restart_once() {
        let mut f = Fixture::new(&CONFIG.replace("restarts = 1", ""));
        f.poll(0, true);
        f.launcher.exit_probe();
        f.poll(5, true);
        assert_eq!(f.elim.state(), ElimState::Backoff);

        // Still inside the window: no restart
        for t in (10..=90).step_by(5) {
            f.poll(t, true);
        }
        assert_eq!(f.launcher.launches().len(), 1);

        assert!(f.poll(91, true));
        f.launcher.exit_probe();
        f.poll(95, true);
        for t in (100..=180).step_by(5) {
            f.poll(t, true);
        }
        // One restart for the first failure, none yet for the second
        assert_eq!(f.launcher.launches().len(), 2);
        assert_eq!(f.elim.state(), ElimState::Backoff);
    }

    #[test]
    fn test_quota_exhaustion_disables() {
        let mut f = Fixture::new(CONFIG);
        f.poll(0, true);
        f.launcher.exit_probe();
        f.poll(1, true);
        assert!(f.poll(100, true));
        f.launcher.exit_probe();
        f.poll(101, true);
        assert!(!f.poll(300, true));
        assert_eq!(f.elim.state(), ElimState::Disabled);
        assert!(!f.poll(1000, true));
        assert_eq!(f.launcher.launches().len(), 2);
        assert_eq!(f.scratch(), INFINIT_LOAD);
    }

    #[test]
    fn test_launch_failure_backs_off() {
        let mut f = Fixture::new(&CONFIG.replace("restarts = 1", ""));
        f.launcher.fail_launches(1);
        assert!(!f.poll(0, true));
        assert_eq!(f.elim.state(), ElimState::Backoff);
        assert!(!f.poll(50, true));
        assert!(f.poll(91, true));
        assert_eq!(f.elim.state(), ElimState::Running);
    }

    #[test]
    fn test_role_change_restarts_probe() {
        let mut f = Fixture::new(&CONFIG.replace("restarts = 1", ""));
        assert!(f.poll(0, false));
        assert_eq!(env_value(&f.launcher.launches()[0], "LSF_MASTER"), "N");

        assert!(f.poll(10, true));
        assert_eq!(f.launcher.terminations(), 1);
        let launches = f.launcher.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(env_value(&launches[1], "LSF_MASTER"), "Y");
    }

    #[test]
    fn test_non_master_skips_resources_shared_by_everyone() {
        let config = CONFIG.replace(
            "hosts = [\"hostA\", \"hostB\"]",
            "hosts = [\"hostA\", \"hostB\", \"hostC\"]",
        );
        let f = Fixture::new(&config);
        let env = probe_env(&f.table, &f.shared, &f.indices, false);
        assert_eq!(env[1].1, "scratch");
        let env = probe_env(&f.table, &f.shared, &f.indices, true);
        assert_eq!(env[1].1, "licA scratch");
    }
}
