//! Per-host load state owned by the engine

use serde::{Deserialize, Serialize};

use crate::index::{BusyStatus, LoadIndexVector, LockState};
use crate::metrics::StaticInfo;

/// Load indices, busy and lock flags, and static capacities of one host
#[derive(Debug, Clone, Serialize)]
pub struct HostLoadRecord {
    pub host_name: String,
    pub indices: LoadIndexVector,
    pub busy: BusyStatus,
    pub lock: LockState,
    pub max_cpus: u32,
    pub max_mem_mb: u64,
    pub max_swap_mb: u64,
    pub max_tmp_mb: u64,
    pub model: String,
    /// Relative CPU speed of `model`, 1.0 when unknown
    pub cpu_factor: f64,
}

/// Flags carried in every broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub busy: bool,
    /// One flag per load index, in vector order
    pub busy_indices: Vec<bool>,
    pub locked_user: bool,
    pub locked_admin: bool,
}

impl HostLoadRecord {
    pub fn new(
        host_name: &str,
        indices: LoadIndexVector,
        max_cpus: u32,
        info: StaticInfo,
        cpu_factor: f64,
    ) -> Self {
        let busy = BusyStatus::new(indices.len());
        Self {
            host_name: host_name.to_string(),
            indices,
            busy,
            lock: LockState::default(),
            max_cpus: max_cpus.max(1),
            max_mem_mb: info.max_mem_mb,
            max_swap_mb: info.max_swap_mb,
            max_tmp_mb: info.max_tmp_mb,
            model: info.model,
            cpu_factor,
        }
    }

    pub fn status(&self) -> HostStatus {
        let mut busy_indices = self.busy.flags().to_vec();
        busy_indices.resize(self.indices.len(), false);
        HostStatus {
            busy: self.busy.is_busy(),
            busy_indices,
            locked_user: self.lock.locked_by_user(),
            locked_admin: self.lock.admin,
        }
    }

    /// Names of the indices currently over threshold
    pub fn busy_index_names(&self) -> Vec<&str> {
        self.indices
            .iter()
            .enumerate()
            .filter(|(pos, _)| self.busy.is_set(*pos))
            .map(|(_, index)| index.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BuiltinIndex;

    #[test]
    fn test_status_reflects_flags() {
        let mut record = HostLoadRecord::new(
            "hostA",
            LoadIndexVector::with_builtins(16),
            0,
            StaticInfo::default(),
            1.0,
        );
        assert_eq!(record.max_cpus, 1);

        record.busy.set(BuiltinIndex::Mem.position(), true);
        record.busy.recompute();
        record.lock.admin = true;

        let status = record.status();
        assert!(status.busy);
        assert!(status.locked_admin);
        assert!(!status.locked_user);
        assert_eq!(status.busy_indices.len(), 11);
        assert_eq!(record.busy_index_names(), vec!["mem"]);
    }
}
