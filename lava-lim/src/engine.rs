//! Load index engine
//!
//! Every sampling cycle the engine reads the collectors and the ELIM. Once
//! per exchange interval it folds in the extra load of recent dispatches,
//! evaluates busy thresholds, handles lock expiry and decides whether the
//! load is worth broadcasting. After that it rescales the run queues for
//! local consumers, keeping the unscaled values as the raw view.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::broadcast::{timestamp, IndexValue, LoadBroadcast};
use crate::config::LimConfig;
use crate::elim::process::ProbeLauncher;
use crate::elim::{ElimContext, ElimIntegrator, ElimState};
use crate::error::Result;
use crate::host::HostLoadRecord;
use crate::index::{is_no_data, threshold_ok, BuiltinIndex, LoadIndex, LoadIndexVector, MIN_FLOAT16, NBUILTINDEX};
use crate::metrics::{Collector, PlatformMetrics, RawSample};
use crate::resources::ResourceTable;
use crate::shared::SharedResources;

/// Run queue length per CPU, scaled by the CPU speed factor
pub fn scaled_queue_length(raw: f64, cpu_factor: f64, ncpus: i64) -> f64 {
    let ncpus = if ncpus <= 0 { 1 } else { ncpus };
    let factor = if cpu_factor > 0.0 { cpu_factor } else { 1.0 };
    raw / (ncpus as f64 * factor)
}

/// Queue length beyond one runnable job per CPU; a fully loaded host reads 0
pub fn normalized_queue_excess(raw: f64, cpu_factor: f64, ncpus: i64) -> f64 {
    scaled_queue_length(raw, cpu_factor, ncpus) - 1.0
}

/// Resolve the CPU count: a configured override wins, invalid values become 1
fn resolve_cpus(configured: Option<i32>, collector: &mut Collector) -> u32 {
    match configured {
        Some(n) if n > 0 => n as u32,
        Some(n) => {
            warn!("Invalid ncpus {} configured, using 1", n);
            1
        }
        None => collector.cpu_count(),
    }
}

pub struct LoadEngine {
    host: HostLoadRecord,
    table: ResourceTable,
    shared: SharedResources,
    collector: Collector,
    elim: ElimIntegrator,
    exchange_interval: i64,
    shared_stale_secs: i64,
    max_silent_exchanges: u32,
    extra_load: [f64; NBUILTINDEX],
    window: u32,
    /// Dispatches still contributing extra load
    jobs_pending: u32,
    next_exchange: Option<i64>,
    must_send: bool,
    last_sent: Option<Vec<f64>>,
    silent_exchanges: u32,
    seq: u64,
    last_sample: RawSample,
}

impl LoadEngine {
    pub fn new(
        config: &LimConfig,
        platform: Box<dyn PlatformMetrics>,
        launcher: Box<dyn ProbeLauncher>,
    ) -> Result<Self> {
        let host_name = config.host_name();
        let mut collector = Collector::new(platform);
        let ncpus = resolve_cpus(config.host.ncpus, &mut collector);
        let info = collector.static_info();
        let cpu_factor = config.host.models.get(&info.model).copied().unwrap_or(1.0);

        let table = ResourceTable::from_config(config);
        let mut indices = LoadIndexVector::with_builtins(config.host.max_indices);
        for which in BuiltinIndex::ALL {
            if let Some(threshold) = table.get(which.name()).and_then(|r| r.threshold) {
                indices.builtin_mut(which).threshold = threshold;
            }
        }
        for resource in table.load_indices() {
            indices.push_external(LoadIndex::external(
                &resource.name,
                resource.increasing,
                resource.threshold,
            ))?;
        }

        // Bigger hosts need a bigger run queue move before it is news
        let extra_cpus = ncpus.saturating_sub(1) as f64;
        indices.builtin_mut(BuiltinIndex::R15s).exchange_threshold += 0.05 * extra_cpus;
        indices.builtin_mut(BuiltinIndex::R1m).exchange_threshold += 0.04 * extra_cpus;
        indices.builtin_mut(BuiltinIndex::R15m).exchange_threshold += 0.03 * extra_cpus;

        let mut extra_load = [0.0; NBUILTINDEX];
        for (name, value) in &config.extra_load.values {
            if let Some(which) = BuiltinIndex::from_name(name) {
                extra_load[which.position()] = *value;
            }
        }

        info!(
            "Host {} model {:?} ncpus {} cpu factor {} with {} load indices",
            host_name,
            info.model,
            ncpus,
            cpu_factor,
            indices.len()
        );

        let shared = SharedResources::from_config(config, &host_name);
        let elim = ElimIntegrator::new(config, &table, &host_name, launcher);
        let host = HostLoadRecord::new(&host_name, indices, ncpus, info, cpu_factor);

        Ok(Self {
            host,
            table,
            shared,
            collector,
            elim,
            exchange_interval: config.timing.exchange_interval_secs as i64,
            shared_stale_secs: config.timing.shared_stale_secs as i64,
            max_silent_exchanges: config.timing.max_silent_exchanges,
            extra_load,
            window: config.extra_load.window,
            jobs_pending: 0,
            next_exchange: None,
            must_send: false,
            last_sent: None,
            silent_exchanges: 0,
            seq: 0,
            last_sample: RawSample::default(),
        })
    }

    pub fn host(&self) -> &HostLoadRecord {
        &self.host
    }

    pub fn shared(&self) -> &SharedResources {
        &self.shared
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.table
    }

    pub fn elim_state(&self) -> ElimState {
        self.elim.state()
    }

    pub fn last_sample(&self) -> &RawSample {
        &self.last_sample
    }

    /// One sampling cycle; returns a payload when one is due for broadcast
    pub fn run_cycle(&mut self, now: i64, is_master: bool) -> Option<LoadBroadcast> {
        let mut ctx = ElimContext {
            table: &self.table,
            indices: &mut self.host.indices,
            shared: &mut self.shared,
        };
        if self.elim.poll(now, is_master, &mut ctx) {
            self.must_send = true;
        }
        self.shared.expire_stale(now, self.shared_stale_secs);

        let sample = self.collector.sample();
        self.last_sample = sample;
        let indices = &mut self.host.indices;
        indices.set(BuiltinIndex::It, sample.it);
        indices.set(BuiltinIndex::Pg, sample.pg);
        indices.set(BuiltinIndex::Io, sample.io);
        indices.set(BuiltinIndex::Swp, sample.swp_mb);
        indices.set(BuiltinIndex::Tmp, sample.tmp_mb);
        indices.set(BuiltinIndex::Mem, sample.mem_mb);

        if let Some(next) = self.next_exchange {
            if now < next {
                return None;
            }
        }

        self.apply_extra_load(&sample);
        let threshold_view = self.evaluate_thresholds();

        if self.host.lock.expire(now) {
            info!("User lock on {} expired", self.host.host_name);
            self.must_send = true;
        }

        let payload = self.maybe_broadcast(now, &threshold_view);
        self.finish_exchange();
        self.next_exchange = Some(now + self.exchange_interval);
        payload
    }

    fn apply_extra_load(&mut self, sample: &RawSample) {
        let factor = if self.jobs_pending > 0 && self.window > 0 {
            let factor = self.jobs_pending as f64 / self.window as f64;
            self.jobs_pending -= 1;
            factor
        } else {
            0.0
        };
        let extra = |which: BuiltinIndex| self.extra_load[which.position()] * factor;

        let queues = sample.run_queue;
        let updates = [
            (BuiltinIndex::R15s, queues.r15s + extra(BuiltinIndex::R15s)),
            (BuiltinIndex::R1m, queues.r1m + extra(BuiltinIndex::R1m)),
            (BuiltinIndex::R15m, queues.r15m + extra(BuiltinIndex::R15m)),
            (BuiltinIndex::Ut, (sample.ut + extra(BuiltinIndex::Ut)).min(1.0)),
            (BuiltinIndex::Pg, self.host.indices.value(BuiltinIndex::Pg) + extra(BuiltinIndex::Pg)),
            (BuiltinIndex::Ls, sample.ls),
            (BuiltinIndex::It, (self.host.indices.value(BuiltinIndex::It) + extra(BuiltinIndex::It)).max(0.0)),
            (BuiltinIndex::Swp, (self.host.indices.value(BuiltinIndex::Swp) + extra(BuiltinIndex::Swp)).max(0.0)),
            (BuiltinIndex::Tmp, (self.host.indices.value(BuiltinIndex::Tmp) + extra(BuiltinIndex::Tmp)).max(0.0)),
            (BuiltinIndex::Mem, (self.host.indices.value(BuiltinIndex::Mem) + extra(BuiltinIndex::Mem)).max(0.0)),
        ];
        for (which, value) in updates {
            self.host.indices.set(which, value);
        }
        if factor > 0.0 {
            debug!("extra load factor {:.3}, {} dispatches pending", factor, self.jobs_pending);
        }
    }

    /// Set busy bits; returns the values the thresholds were compared against
    fn evaluate_thresholds(&mut self) -> Vec<f64> {
        let ncpus = self.host.max_cpus as i64;
        let mut view = Vec::with_capacity(self.host.indices.len());

        for (pos, index) in self.host.indices.iter().enumerate() {
            let value = match BuiltinIndex::from_name(&index.name) {
                Some(which) if index.builtin && which.is_run_queue() => {
                    normalized_queue_excess(index.value, 1.0, ncpus)
                }
                _ => index.value,
            };
            view.push(value);

            // No data is not overload: the bit is cleared, not carried over
            if is_no_data(index.increasing, value) {
                self.host.busy.set(pos, false);
                continue;
            }
            self.host
                .busy
                .set(pos, !threshold_ok(index.increasing, value, index.threshold));
        }

        let was_busy = self.host.busy.is_busy();
        if self.host.busy.recompute() != was_busy {
            info!(
                "Host {} is now {} {:?}",
                self.host.host_name,
                if self.host.busy.is_busy() { "busy" } else { "ok" },
                self.host.busy_index_names()
            );
        }
        view
    }

    fn maybe_broadcast(&mut self, now: i64, view: &[f64]) -> Option<LoadBroadcast> {
        let changed = match &self.last_sent {
            None => true,
            Some(last) => self.host.indices.iter().zip(view).enumerate().any(|(pos, (index, value))| {
                let previous = last.get(pos).copied().unwrap_or(f64::NAN);
                !((value - previous).abs() <= index.exchange_threshold)
            }),
        };
        let overdue = self.silent_exchanges + 1 >= self.max_silent_exchanges.max(1);

        if !(self.must_send || changed || overdue) {
            self.silent_exchanges += 1;
            debug!("load unchanged, {} silent exchanges", self.silent_exchanges);
            return None;
        }

        self.seq += 1;
        self.must_send = false;
        self.silent_exchanges = 0;
        self.last_sent = Some(view.to_vec());

        Some(LoadBroadcast {
            host: self.host.host_name.clone(),
            seq: self.seq,
            timestamp: timestamp(now),
            status: self.host.status(),
            indices: self
                .host
                .indices
                .iter()
                .map(|i| IndexValue {
                    name: i.name.clone(),
                    value: i.value,
                })
                .collect(),
            shared: self.shared.values_owned_by_local(),
        })
    }

    /// Floor tiny built-in values and rescale the run queues for local readers
    fn finish_exchange(&mut self) {
        let ncpus = self.host.max_cpus as i64;
        let cpu_factor = self.host.cpu_factor;
        for (pos, index) in self.host.indices.iter_mut().enumerate() {
            if pos < NBUILTINDEX && index.value < MIN_FLOAT16 {
                index.value = 0.0;
            }
            let run_queue = BuiltinIndex::from_name(&index.name).map_or(false, |b| b.is_run_queue());
            if index.builtin && run_queue {
                index.raw = index.value;
                index.value = scaled_queue_length(index.raw, cpu_factor, ncpus);
            } else {
                index.raw = index.value;
            }
        }
    }

    /// Record a peer's shared values; the payload itself goes to the cluster table
    pub fn ingest_peer(&mut self, payload: &LoadBroadcast, is_master: bool, now: i64) -> usize {
        if payload.host == self.host.host_name {
            return 0;
        }
        let mut stored = 0;
        for (name, value) in &payload.shared {
            let outcome = self
                .shared
                .report_value(&self.table, name, &payload.host, value, is_master, now);
            debug!("{} = {} from {}: {:?}", name, value, payload.host, outcome);
            if outcome == crate::shared::ReportOutcome::Stored {
                stored += 1;
            }
        }
        stored
    }

    /// Lock the host for users, until `until` (unix seconds) or indefinitely
    pub fn lock_user(&mut self, until: Option<i64>) {
        self.host.lock.user = Some(until);
        self.must_send = true;
        info!("Host locked by user until {:?}", until);
    }

    pub fn unlock_user(&mut self) {
        if self.host.lock.user.take().is_some() {
            self.must_send = true;
            info!("User lock removed");
        }
    }

    pub fn lock_admin(&mut self) {
        if !self.host.lock.admin {
            self.host.lock.admin = true;
            self.must_send = true;
            info!("Host locked by administrator");
        }
    }

    pub fn unlock_admin(&mut self) {
        if self.host.lock.admin {
            self.host.lock.admin = false;
            self.must_send = true;
            info!("Administrator lock removed");
        }
    }

    /// A job was just sent here; its load shows up before the kernel sees it
    pub fn note_job_dispatched(&mut self) {
        self.jobs_pending = self.window;
    }

    /// Values keyed by index name, normalized view
    pub fn values(&self) -> HashMap<String, f64> {
        self.host
            .indices
            .iter()
            .map(|i| (i.name.clone(), i.value))
            .collect()
    }

    pub fn shutdown(&mut self) {
        self.elim.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ClusterLoadTable;
    use crate::elim::ScriptedLauncher;
    use crate::index::INFINIT_LOAD;
    use crate::metrics::{QueueLengths, ScriptedMetrics, StaticInfo};

    const BASE: &str = r#"
[host]
name = "hostA"
ncpus = 1

[cluster]
hosts = ["hostA", "hostB"]

[timing]
sample_interval_secs = 5
exchange_interval_secs = 15
max_silent_exchanges = 4
"#;

    fn engine(config: &str) -> (LoadEngine, ScriptedMetrics, ScriptedLauncher) {
        let config = LimConfig::parse(config).unwrap();
        let metrics = ScriptedMetrics::default();
        let launcher = ScriptedLauncher::new();
        let engine = LoadEngine::new(&config, Box::new(metrics.clone()), Box::new(launcher.clone())).unwrap();
        (engine, metrics, launcher)
    }

    fn value(engine: &LoadEngine, which: BuiltinIndex) -> f64 {
        engine.host().indices.value(which)
    }

    fn set_queues(metrics: &ScriptedMetrics, r: f64) {
        metrics.update(|m| {
            m.run_queue = Some(QueueLengths {
                r15s: r,
                r1m: r,
                r15m: r,
            })
        });
    }

    #[test]
    fn test_queue_normalization() {
        for r in [0.0, 0.5, 1.0, 3.25, 17.0] {
            assert_eq!(normalized_queue_excess(r, 1.0, 1), r - 1.0);
        }
        assert_eq!(scaled_queue_length(8.0, 2.0, 2), 2.0);
        assert_eq!(scaled_queue_length(3.0, 1.0, 0), 3.0);
        assert_eq!(scaled_queue_length(3.0, 0.0, -4), 3.0);
    }

    #[test]
    fn test_first_cycle_broadcasts() {
        let (mut engine, metrics, _) = engine(BASE);
        set_queues(&metrics, 2.0);
        let payload = engine.run_cycle(1_000, true).unwrap();
        assert_eq!(payload.host, "hostA");
        assert_eq!(payload.seq, 1);
        assert_eq!(payload.value("r1m"), Some(2.0));
    }

    #[test]
    fn test_exchange_interval_limits_broadcasts() {
        let (mut engine, metrics, _) = engine(BASE);
        assert!(engine.run_cycle(1_000, true).is_some());

        set_queues(&metrics, 9.0);
        // Sampling continues, but exchanges wait for the interval
        assert!(engine.run_cycle(1_005, true).is_none());
        assert!(engine.run_cycle(1_010, true).is_none());
        assert_eq!(value(&engine, BuiltinIndex::R1m), 0.0);

        let payload = engine.run_cycle(1_015, true).unwrap();
        assert_eq!(payload.value("r1m"), Some(9.0));
    }

    #[test]
    fn test_unchanged_load_stays_quiet_until_overdue() {
        let (mut engine, _, _) = engine(BASE);
        assert!(engine.run_cycle(0, true).is_some());
        assert!(engine.run_cycle(15, true).is_none());
        assert!(engine.run_cycle(30, true).is_none());
        assert!(engine.run_cycle(45, true).is_none());
        // Fourth quiet exchange
        assert!(engine.run_cycle(60, true).is_some());
    }

    #[test]
    fn test_raw_and_scaled_views() {
        let config = format!("{BASE}\n[host.models]\nscripted = 2.0\n").replace("ncpus = 1", "ncpus = 2");
        let (mut engine, metrics, _) = engine(&config);
        set_queues(&metrics, 8.0);
        engine.run_cycle(0, true);

        let r1m = engine.host().indices.builtin(BuiltinIndex::R1m);
        assert_eq!(r1m.raw, 8.0);
        assert_eq!(r1m.value, 2.0);
        assert_eq!(engine.host().cpu_factor, 2.0);
    }

    #[test]
    fn test_busy_bits_by_polarity() {
        let config = format!("{BASE}\n[thresholds]\nut = 0.5\nmem = 100.0\n");
        let (mut engine, metrics, _) = engine(&config);
        let ut = BuiltinIndex::Ut.position();
        let mem = BuiltinIndex::Mem.position();

        metrics.update(|m| {
            m.utilization = Some(0.9);
            m.free_memory_kb = Some(500 * 1024);
        });
        engine.run_cycle(0, true);
        assert!(engine.host().busy.is_set(ut));
        assert!(!engine.host().busy.is_set(mem));
        assert!(engine.host().busy.is_busy());

        metrics.update(|m| {
            m.utilization = Some(0.2);
            m.free_memory_kb = Some(50 * 1024);
        });
        engine.run_cycle(15, true);
        assert!(!engine.host().busy.is_set(ut));
        assert!(engine.host().busy.is_set(mem));

        metrics.update(|m| m.free_memory_kb = Some(200 * 1024));
        let payload = engine.run_cycle(30, true).unwrap();
        assert!(!engine.host().busy.is_busy());
        assert!(!payload.status.busy);
    }

    #[test]
    fn test_run_queue_threshold_uses_excess() {
        let config = format!("{BASE}\n[thresholds]\nr1m = 1.0\n");
        let (mut engine, metrics, _) = engine(&config);
        let r1m = BuiltinIndex::R1m.position();

        set_queues(&metrics, 1.9);
        engine.run_cycle(0, true);
        assert!(!engine.host().busy.is_set(r1m));

        set_queues(&metrics, 2.5);
        engine.run_cycle(15, true);
        assert!(engine.host().busy.is_set(r1m));
    }

    #[test]
    fn test_extra_load_decays() {
        let config = format!("{BASE}\n[extra_load]\nwindow = 4\nvalues = {{ r1m = 2.0, ut = 0.8, mem = -1000.0 }}\n");
        let (mut engine, metrics, _) = engine(&config);
        metrics.update(|m| {
            m.utilization = Some(0.5);
            m.free_memory_kb = Some(10 * 1024);
        });

        engine.note_job_dispatched();
        let payload = engine.run_cycle(0, true).unwrap();
        assert_eq!(payload.value("r1m"), Some(2.0));
        assert_eq!(payload.value("ut"), Some(1.0));
        assert_eq!(payload.value("mem"), Some(0.0));

        let payload = engine.run_cycle(15, true).unwrap();
        assert_eq!(payload.value("r1m"), Some(1.5));

        engine.run_cycle(30, true);
        engine.run_cycle(45, true);
        engine.run_cycle(60, true);
        assert_eq!(engine.host().indices.builtin(BuiltinIndex::R1m).raw, 0.0);
    }

    #[test]
    fn test_exchange_thresholds_grow_with_cpus() {
        let (engine, _, _) = engine(&BASE.replace("ncpus = 1", "ncpus = 5"));
        let indices = &engine.host().indices;
        assert!((indices.builtin(BuiltinIndex::R15s).exchange_threshold - 0.30).abs() < 1e-9);
        assert!((indices.builtin(BuiltinIndex::R1m).exchange_threshold - 0.26).abs() < 1e-9);
        assert!((indices.builtin(BuiltinIndex::R15m).exchange_threshold - 0.22).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_ncpus_becomes_one() {
        let (engine, _, _) = engine(&BASE.replace("ncpus = 1", "ncpus = -3"));
        assert_eq!(engine.host().max_cpus, 1);
    }

    #[test]
    fn test_user_lock_expiry_forces_broadcast() {
        let (mut engine, _, _) = engine(BASE);
        engine.run_cycle(0, true);
        engine.lock_user(Some(20));
        let payload = engine.run_cycle(15, true).unwrap();
        assert!(payload.status.locked_user);

        assert!(engine.run_cycle(30, true).is_some());
        assert!(!engine.host().lock.locked_by_user());
        assert!(engine.run_cycle(45, true).is_none());
    }

    #[test]
    fn test_admin_lock() {
        let (mut engine, _, _) = engine(BASE);
        engine.run_cycle(0, true);
        engine.lock_admin();
        let payload = engine.run_cycle(15, true).unwrap();
        assert!(payload.status.locked_admin);
        engine.unlock_admin();
        assert!(!engine.run_cycle(30, true).unwrap().status.locked_admin);
    }

    #[test]
    fn test_tiny_builtin_values_floor_to_zero() {
        let (mut engine, metrics, _) = engine(BASE);
        metrics.update(|m| m.utilization = Some(1e-12));
        engine.run_cycle(0, true);
        assert_eq!(value(&engine, BuiltinIndex::Ut), 0.0);
    }

    const WITH_ELIM: &str = r#"
[host]
name = "hostA"
ncpus = 1
run_elim = true

[cluster]
hosts = ["hostA", "hostB"]

[[resources]]
name = "licA"
dynamic = true
shared = true

[[resources]]
name = "scratch"
dynamic = true
threshold = 10.0

[[shared]]
resource = "licA"
hosts = ["hostA", "hostB"]

[elim]
program = "/usr/libexec/lava/elim"
"#;

    #[test]
    fn test_external_index_from_elim() {
        let (mut engine, _, launcher) = engine(WITH_ELIM);
        let payload = engine.run_cycle(0, true).unwrap();
        // Not reported yet: no data, never busy
        assert_eq!(payload.value("scratch"), Some(INFINIT_LOAD));
        assert!(!payload.status.busy);
        assert_eq!(launcher.launches().len(), 1);

        launcher.push_output(b"2 scratch 12.0000000000001 licA 3\n");
        let payload = engine.run_cycle(15, true).unwrap();
        assert_eq!(payload.value("scratch"), Some(12.0000000000001));
        assert!(payload.status.busy);
        assert_eq!(payload.shared, vec![("licA".to_string(), "3".to_string())]);

        // External values keep full precision
        let pos = engine.host().indices.position("scratch").unwrap();
        assert_eq!(engine.host().indices.get(pos).unwrap().raw, 12.0000000000001);
    }

    #[test]
    fn test_lost_external_value_clears_busy_bit() {
        let (mut engine, _, launcher) = engine(WITH_ELIM);
        engine.run_cycle(0, true);
        launcher.push_output(b"1 scratch 50\n");
        engine.run_cycle(15, true);
        let pos = engine.host().indices.position("scratch").unwrap();
        assert!(engine.host().busy.is_set(pos));

        launcher.exit_probe();
        engine.run_cycle(30, true);
        assert_eq!(engine.host().indices.get(pos).unwrap().value, INFINIT_LOAD);
        assert!(!engine.host().busy.is_set(pos));
        assert!(!engine.host().busy.is_busy());
    }

    #[test]
    fn test_stale_master_hands_role_to_local_host() {
        let config = WITH_ELIM.replace("hosts = [\"hostA\", \"hostB\"]\n\n[[resources]]", "hosts = [\"hostB\", \"hostA\"]\n\n[[resources]]");
        let parsed = LimConfig::parse(&config).unwrap();
        let candidates = parsed.master_candidates();
        assert_eq!(candidates, vec!["hostB", "hostA"]);
        let stale = parsed.timing.master_stale_secs as i64;
        let (mut engine, _, launcher) = engine(&config);

        let mut cluster = ClusterLoadTable::new();
        cluster.record(LoadBroadcast {
            host: "hostB".to_string(),
            seq: 1,
            timestamp: timestamp(0),
            status: Default::default(),
            indices: Vec::new(),
            shared: Vec::new(),
        });
        let is_master = |cluster: &ClusterLoadTable, now: i64| {
            cluster.elect_master(&candidates, "hostA", now - stale) == Some("hostA")
        };
        let master_flag = |launch: usize| {
            launcher.launches()[launch]
                .env
                .iter()
                .find(|(k, _)| k == "LSF_MASTER")
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert!(!is_master(&cluster, 10));
        engine.run_cycle(10, false);
        assert_eq!(master_flag(0), "N");

        assert!(is_master(&cluster, 100));
        engine.run_cycle(100, true);
        assert_eq!(launcher.terminations(), 1);
        assert_eq!(launcher.launches().len(), 2);
        assert_eq!(master_flag(1), "Y");
    }

    #[test]
    fn test_peer_shared_values() {
        let (mut engine, _, _) = engine(WITH_ELIM);
        let peer = LoadBroadcast {
            host: "hostB".to_string(),
            seq: 1,
            timestamp: timestamp(10),
            status: Default::default(),
            indices: Vec::new(),
            shared: vec![("licA".to_string(), "7".to_string())],
        };
        assert_eq!(engine.ingest_peer(&peer, false, 10), 1);
        let lic = engine.shared().local_instance("licA").unwrap();
        assert_eq!(lic.value, "7");
        assert_eq!(lic.update_host.as_deref(), Some("hostB"));
    }

    #[test]
    fn test_too_many_indices_is_fatal() {
        let config = WITH_ELIM.replace("run_elim = true", "run_elim = true\nmax_indices = 11");
        let config = LimConfig::parse(&config).unwrap();
        let result = LoadEngine::new(
            &config,
            Box::new(ScriptedMetrics::default()),
            Box::new(ScriptedLauncher::new()),
        );
        assert!(matches!(result, Err(crate::error::LimError::IndexTableFull { .. })));
    }

    #[test]
    fn test_static_info_from_collector() {
        let config = LimConfig::parse(BASE).unwrap();
        let metrics = ScriptedMetrics::default();
        metrics.update(|m| {
            m.static_info = StaticInfo {
                max_mem_mb: 4096,
                max_swap_mb: 1024,
                max_tmp_mb: 512,
                model: "x6_4800".to_string(),
            }
        });
        let engine = LoadEngine::new(&config, Box::new(metrics), Box::new(ScriptedLauncher::new())).unwrap();
        assert_eq!(engine.host().max_mem_mb, 4096);
        assert_eq!(engine.host().model, "x6_4800");
        assert_eq!(engine.host().cpu_factor, 1.0);
    }
}
