//! Load index model
//!
//! A host's load is a fixed-order vector of named indices. The first
//! [`NBUILTINDEX`] entries are the built-in set in [`BuiltinIndex`] order;
//! external indices reported by the ELIM are appended after them in the order
//! they were configured and never move.

use serde::{Deserialize, Serialize};

use crate::error::{LimError, Result};

/// Value meaning "no data": larger than any real load
pub const INFINIT_LOAD: f64 = 2_147_483_647.0;

/// Built-in values below this are treated as exactly zero
pub const MIN_FLOAT16: f64 = 2.328306e-10;

/// Number of built-in indices
pub const NBUILTINDEX: usize = 11;

/// Default ceiling on the number of indices (built-in + external)
pub const DEFAULT_MAX_INDICES: usize = 256;

/// The built-in load indices, in vector order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinIndex {
    R15s,
    R1m,
    R15m,
    Ut,
    Pg,
    Io,
    Ls,
    It,
    Tmp,
    Swp,
    Mem,
}

impl BuiltinIndex {
    pub const ALL: [BuiltinIndex; NBUILTINDEX] = [
        BuiltinIndex::R15s,
        BuiltinIndex::R1m,
        BuiltinIndex::R15m,
        BuiltinIndex::Ut,
        BuiltinIndex::Pg,
        BuiltinIndex::Io,
        BuiltinIndex::Ls,
        BuiltinIndex::It,
        BuiltinIndex::Tmp,
        BuiltinIndex::Swp,
        BuiltinIndex::Mem,
    ];

    pub const RUN_QUEUE: [BuiltinIndex; 3] =
        [BuiltinIndex::R15s, BuiltinIndex::R1m, BuiltinIndex::R15m];

    pub fn position(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinIndex::R15s => "r15s",
            BuiltinIndex::R1m => "r1m",
            BuiltinIndex::R15m => "r15m",
            BuiltinIndex::Ut => "ut",
            BuiltinIndex::Pg => "pg",
            BuiltinIndex::Io => "io",
            BuiltinIndex::Ls => "ls",
            BuiltinIndex::It => "it",
            BuiltinIndex::Tmp => "tmp",
            BuiltinIndex::Swp => "swp",
            BuiltinIndex::Mem => "mem",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// Higher values mean busier. Idle time and free space go the other way.
    pub fn increasing(self) -> bool {
        !matches!(
            self,
            BuiltinIndex::It | BuiltinIndex::Tmp | BuiltinIndex::Swp | BuiltinIndex::Mem
        )
    }

    pub fn is_run_queue(self) -> bool {
        Self::RUN_QUEUE.contains(&self)
    }

    /// Minimum change that makes the index worth broadcasting
    pub fn default_exchange_threshold(self) -> f64 {
        match self {
            BuiltinIndex::R15s | BuiltinIndex::R1m | BuiltinIndex::R15m => 0.10,
            BuiltinIndex::Ut => 0.10,
            BuiltinIndex::Pg => 1.0,
            BuiltinIndex::Io => 10.0,
            BuiltinIndex::Ls => 0.0,
            BuiltinIndex::It => 1.0,
            BuiltinIndex::Tmp | BuiltinIndex::Swp | BuiltinIndex::Mem => 1.0,
        }
    }
}

/// Sentinel used when a threshold is not configured or a value is unknown
pub fn no_data_value(increasing: bool) -> f64 {
    if increasing {
        INFINIT_LOAD
    } else {
        -INFINIT_LOAD
    }
}

/// True when `value` is the "no data" sentinel for the index polarity
pub fn is_no_data(increasing: bool, value: f64) -> bool {
    if increasing {
        (value - INFINIT_LOAD).abs() < 1.0
    } else {
        (value + INFINIT_LOAD).abs() < 1.0
    }
}

/// Direction-aware threshold test: `false` means the index makes the host busy
pub fn threshold_ok(increasing: bool, value: f64, threshold: f64) -> bool {
    if increasing {
        value <= threshold
    } else {
        value >= threshold
    }
}

/// One entry of the load vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadIndex {
    pub name: String,
    /// Working value; after a broadcast this is the normalized view
    pub value: f64,
    /// Unnormalized view exposed to local consumers
    pub raw: f64,
    /// Busy threshold ("satisfy value")
    pub threshold: f64,
    pub exchange_threshold: f64,
    pub increasing: bool,
    pub builtin: bool,
}

impl LoadIndex {
    fn builtin(which: BuiltinIndex) -> Self {
        Self {
            name: which.name().to_string(),
            value: 0.0,
            raw: 0.0,
            threshold: no_data_value(which.increasing()),
            exchange_threshold: which.default_exchange_threshold(),
            increasing: which.increasing(),
            builtin: true,
        }
    }

    /// External index, unknown until the ELIM reports it
    pub fn external(name: &str, increasing: bool, threshold: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            value: INFINIT_LOAD,
            raw: INFINIT_LOAD,
            threshold: threshold.unwrap_or_else(|| no_data_value(increasing)),
            exchange_threshold: 0.0,
            increasing,
            builtin: false,
        }
    }
}

/// Ordered, bounded vector of load indices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadIndexVector {
    indices: Vec<LoadIndex>,
    max: usize,
}

impl LoadIndexVector {
    /// Vector holding just the built-in indices
    pub fn with_builtins(max: usize) -> Self {
        Self {
            indices: BuiltinIndex::ALL.iter().map(|b| LoadIndex::builtin(*b)).collect(),
            max: max.max(NBUILTINDEX),
        }
    }

    /// Append an external index; returns its position
    pub fn push_external(&mut self, index: LoadIndex) -> Result<usize> {
        if let Some(pos) = self.position(&index.name) {
            return Ok(pos);
        }
        if self.indices.len() >= self.max {
            return Err(LimError::IndexTableFull {
                name: index.name,
                max: self.max,
            });
        }
        self.indices.push(index);
        Ok(self.indices.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.indices.iter().position(|i| i.name == name)
    }

    pub fn get(&self, pos: usize) -> Option<&LoadIndex> {
        self.indices.get(pos)
    }

    pub fn get_mut(&mut self, pos: usize) -> Option<&mut LoadIndex> {
        self.indices.get_mut(pos)
    }

    pub fn builtin(&self, which: BuiltinIndex) -> &LoadIndex {
        &self.indices[which.position()]
    }

    pub fn builtin_mut(&mut self, which: BuiltinIndex) -> &mut LoadIndex {
        &mut self.indices[which.position()]
    }

    pub fn value(&self, which: BuiltinIndex) -> f64 {
        self.builtin(which).value
    }

    /// Store a working value, keeping it inside the sentinel range
    pub fn set_value(&mut self, pos: usize, value: f64) {
        if let Some(index) = self.indices.get_mut(pos) {
            index.value = sanitize(index.increasing, value);
        }
    }

    pub fn set(&mut self, which: BuiltinIndex, value: f64) {
        self.set_value(which.position(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadIndex> {
        self.indices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LoadIndex> {
        self.indices.iter_mut()
    }

    /// Working values in vector order
    pub fn values(&self) -> Vec<f64> {
        self.indices.iter().map(|i| i.value).collect()
    }

    /// Unnormalized values in vector order
    pub fn raw_values(&self) -> Vec<f64> {
        self.indices.iter().map(|i| i.raw).collect()
    }

    /// Mark every external index as unknown
    pub fn set_external_unknown(&mut self) {
        for index in self.indices.iter_mut().filter(|i| !i.builtin) {
            index.value = INFINIT_LOAD;
        }
    }
}

fn sanitize(increasing: bool, value: f64) -> f64 {
    if value.is_nan() {
        return no_data_value(increasing);
    }
    value.clamp(-INFINIT_LOAD, INFINIT_LOAD)
}

/// Per-index busy flags plus the aggregate host flag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyStatus {
    per_index: Vec<bool>,
    busy: bool,
}

impl BusyStatus {
    pub fn new(count: usize) -> Self {
        Self {
            per_index: vec![false; count],
            busy: false,
        }
    }

    pub fn set(&mut self, pos: usize, busy: bool) {
        if pos >= self.per_index.len() {
            self.per_index.resize(pos + 1, false);
        }
        self.per_index[pos] = busy;
    }

    pub fn is_set(&self, pos: usize) -> bool {
        self.per_index.get(pos).copied().unwrap_or(false)
    }

    /// Aggregate bit as of the last [`BusyStatus::recompute`]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Aggregate = OR of the per-index bits
    pub fn recompute(&mut self) -> bool {
        self.busy = self.per_index.iter().any(|b| *b);
        self.busy
    }

    pub fn flags(&self) -> &[bool] {
        &self.per_index
    }
}

/// User and administrator locks on the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    /// `Some(None)`: locked indefinitely, `Some(Some(t))`: until unix time `t`
    pub user: Option<Option<i64>>,
    pub admin: bool,
}

impl LockState {
    pub fn locked_by_user(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.admin || self.user.is_some()
    }

    /// Clear an expired user lock; returns true if it expired
    pub fn expire(&mut self, now: i64) -> bool {
        match self.user {
            Some(Some(until)) if now > until => {
                self.user = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_order_and_polarity() {
        let v = LoadIndexVector::with_builtins(DEFAULT_MAX_INDICES);
        assert_eq!(v.len(), NBUILTINDEX);
        assert_eq!(v.get(0).unwrap().name, "r15s");
        assert_eq!(v.get(10).unwrap().name, "mem");
        assert!(v.builtin(BuiltinIndex::Ut).increasing);
        assert!(!v.builtin(BuiltinIndex::It).increasing);
        assert!(!v.builtin(BuiltinIndex::Mem).increasing);
    }

    #[test]
    fn test_busy_threshold_increasing() {
        assert!(!threshold_ok(true, 5.0, 3.0));
        assert!(threshold_ok(true, 2.0, 3.0));
    }

    #[test]
    fn test_busy_threshold_decreasing() {
        assert!(!threshold_ok(false, 2.0, 3.0));
        assert!(threshold_ok(false, 5.0, 3.0));
    }

    #[test]
    fn test_no_data_sentinel() {
        assert!(is_no_data(true, INFINIT_LOAD));
        assert!(is_no_data(false, -INFINIT_LOAD));
        assert!(!is_no_data(false, INFINIT_LOAD));
        assert!(!is_no_data(true, 42.0));
    }

    #[test]
    fn test_external_indices_append_in_order() {
        let mut v = LoadIndexVector::with_builtins(NBUILTINDEX + 2);
        assert_eq!(v.push_external(LoadIndex::external("licA", true, None)).unwrap(), 11);
        assert_eq!(v.push_external(LoadIndex::external("scratch", false, None)).unwrap(), 12);
        // Re-adding an existing name keeps its slot
        assert_eq!(v.push_external(LoadIndex::external("licA", true, None)).unwrap(), 11);

        let err = v.push_external(LoadIndex::external("one_too_many", true, None));
        assert!(matches!(err, Err(LimError::IndexTableFull { .. })));
        assert_eq!(v.position("scratch"), Some(12));
    }

    #[test]
    fn test_values_stay_inside_sentinel_range() {
        let mut v = LoadIndexVector::with_builtins(DEFAULT_MAX_INDICES);
        v.set(BuiltinIndex::Pg, f64::INFINITY);
        v.set(BuiltinIndex::Mem, f64::NEG_INFINITY);
        v.set(BuiltinIndex::Ut, f64::NAN);
        v.set(BuiltinIndex::It, f64::NAN);

        for index in v.iter() {
            assert!(index.value >= -INFINIT_LOAD && index.value <= INFINIT_LOAD);
        }
        assert!(is_no_data(true, v.value(BuiltinIndex::Ut)));
        assert!(is_no_data(false, v.value(BuiltinIndex::It)));
    }

    #[test]
    fn test_aggregate_busy_is_or_of_bits() {
        let mut status = BusyStatus::new(NBUILTINDEX);
        assert!(!status.recompute());
        status.set(3, true);
        status.set(7, true);
        assert!(status.recompute());
        status.set(3, false);
        assert!(status.recompute());
        status.set(7, false);
        assert!(!status.recompute());
    }

    #[test]
    fn test_user_lock_expiry() {
        let mut lock = LockState {
            user: Some(Some(100)),
            admin: false,
        };
        assert!(!lock.expire(100));
        assert!(lock.expire(101));
        assert!(!lock.locked_by_user());

        lock.user = Some(None);
        assert!(!lock.expire(i64::MAX));
        assert!(lock.is_locked());
    }
}
