//! Deterministic collector for tests and dry runs

use std::sync::{Arc, Mutex};

use super::{PlatformMetrics, QueueLengths, StaticInfo, TtyActivity};

/// Readings handed out by [`ScriptedMetrics`]; `None` simulates a missing source
#[derive(Debug, Clone)]
pub struct ScriptedReadings {
    pub cpus: Option<u32>,
    pub run_queue: Option<QueueLengths>,
    pub utilization: Option<f64>,
    pub paging: Option<f64>,
    pub io: Option<f64>,
    pub free_memory_kb: Option<u64>,
    pub free_swap_kb: Option<u64>,
    pub free_tmp_mb: Option<u64>,
    pub tty: Option<TtyActivity>,
    pub static_info: StaticInfo,
}

impl Default for ScriptedReadings {
    fn default() -> Self {
        Self {
            cpus: Some(1),
            run_queue: Some(QueueLengths::default()),
            utilization: Some(0.0),
            paging: Some(0.0),
            io: Some(0.0),
            free_memory_kb: Some(0),
            free_swap_kb: Some(0),
            free_tmp_mb: Some(0),
            tty: Some(TtyActivity::default()),
            static_info: StaticInfo {
                model: "scripted".to_string(),
                ..Default::default()
            },
        }
    }
}

/// Replays whatever readings the test put in; clones share the same script
#[derive(Debug, Clone, Default)]
pub struct ScriptedMetrics {
    readings: Arc<Mutex<ScriptedReadings>>,
}

impl ScriptedMetrics {
    pub fn new(readings: ScriptedReadings) -> Self {
        Self {
            readings: Arc::new(Mutex::new(readings)),
        }
    }

    /// Every source missing
    pub fn unavailable() -> Self {
        Self::new(ScriptedReadings {
            cpus: None,
            run_queue: None,
            utilization: None,
            paging: None,
            io: None,
            free_memory_kb: None,
            free_swap_kb: None,
            free_tmp_mb: None,
            tty: None,
            static_info: StaticInfo::default(),
        })
    }

    /// Change the readings for the next sample
    pub fn update<F: FnOnce(&mut ScriptedReadings)>(&self, f: F) {
        let mut readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut readings);
    }

    fn read<T, F: FnOnce(&ScriptedReadings) -> T>(&self, f: F) -> T {
        let readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        f(&readings)
    }
}

impl PlatformMetrics for ScriptedMetrics {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn cpu_count(&mut self) -> Option<u32> {
        self.read(|r| r.cpus)
    }

    fn run_queue_lengths(&mut self) -> Option<QueueLengths> {
        self.read(|r| r.run_queue)
    }

    fn cpu_utilization(&mut self) -> Option<f64> {
        self.read(|r| r.utilization)
    }

    fn paging_rate(&mut self) -> Option<f64> {
        self.read(|r| r.paging)
    }

    fn io_rate(&mut self) -> Option<f64> {
        self.read(|r| r.io)
    }

    fn free_memory_kb(&mut self) -> Option<u64> {
        self.read(|r| r.free_memory_kb)
    }

    fn free_swap_kb(&mut self) -> Option<u64> {
        self.read(|r| r.free_swap_kb)
    }

    fn free_tmp_mb(&mut self) -> Option<u64> {
        self.read(|r| r.free_tmp_mb)
    }

    fn tty_activity(&mut self) -> Option<TtyActivity> {
        self.read(|r| r.tty)
    }

    fn static_info(&mut self) -> StaticInfo {
        self.read(|r| r.static_info.clone())
    }
}
