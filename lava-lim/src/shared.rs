//! Shared resource propagation
//!
//! A shared resource is one dynamic value (a license count, a shared
//! filesystem's free space) that several hosts can report. Each declared
//! instance lists the hosts sharing it; the stored value is whichever report
//! won the most recent update, with the master applying a host-order
//! tie-break.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::LimConfig;
use crate::resources::{is_number, ResourceTable, ValueType};

/// Stored value of an instance nobody currently vouches for
pub const UNKNOWN_VALUE: &str = "-";

#[derive(Debug, Clone, Serialize)]
pub struct SharedResourceInstance {
    pub resource: String,
    /// Participating hosts; position matters for the master tie-break
    pub hosts: Vec<String>,
    pub value: String,
    pub update_host: Option<String>,
    /// Unix seconds of the last accepted report, 0 when unset
    pub update_time: i64,
}

impl SharedResourceInstance {
    pub fn new(resource: &str, hosts: Vec<String>) -> Self {
        Self {
            resource: resource.to_string(),
            hosts,
            value: UNKNOWN_VALUE.to_string(),
            update_host: None,
            update_time: 0,
        }
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    fn position(&self, host: &str) -> Option<usize> {
        self.hosts.iter().position(|h| h == host)
    }

    fn reset(&mut self) {
        self.value = UNKNOWN_VALUE.to_string();
        self.update_host = None;
        self.update_time = 0;
    }
}

/// What happened to a reported value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Accepted and stored
    Stored,
    /// Belongs to a shared instance, but an earlier host's value stands
    Deferred,
    /// Not a shared value for this host; the caller may treat it as a load index
    NotShared,
}

impl ReportOutcome {
    /// The value was consumed by shared propagation
    pub fn handled(self) -> bool {
        !matches!(self, ReportOutcome::NotShared)
    }
}

/// Shared instances known to this daemon
#[derive(Debug, Clone)]
pub struct SharedResources {
    local_host: String,
    cluster_size: usize,
    instances: Vec<SharedResourceInstance>,
}

impl SharedResources {
    pub fn new(local_host: &str, cluster_size: usize, instances: Vec<SharedResourceInstance>) -> Self {
        Self {
            local_host: local_host.to_string(),
            cluster_size,
            instances,
        }
    }

    pub fn from_config(config: &LimConfig, local_host: &str) -> Self {
        let instances = config
            .shared
            .iter()
            .map(|s| SharedResourceInstance::new(&s.resource, s.hosts.clone()))
            .collect();
        Self::new(local_host, config.cluster_size(), instances)
    }

    /// Record `value` for `name` as reported by `reporting_host`
    pub fn report_value(
        &mut self,
        table: &ResourceTable,
        name: &str,
        reporting_host: &str,
        value: &str,
        is_master: bool,
        now: i64,
    ) -> ReportOutcome {
        let Some(resource) = table.get(name) else {
            return ReportOutcome::NotShared;
        };
        if !resource.flags.dynamic {
            return ReportOutcome::NotShared;
        }
        if resource.value_type == ValueType::Numeric && !is_number(value) {
            return ReportOutcome::NotShared;
        }

        let local_host = self.local_host.as_str();
        let Some(instance) = self
            .instances
            .iter_mut()
            .find(|i| i.resource == name && i.has_host(local_host))
        else {
            return ReportOutcome::NotShared;
        };

        if is_master {
            let update_pos = instance.update_host.as_deref().and_then(|h| instance.position(h));
            let reporter_pos = instance.position(reporting_host);
            if let Some(update_pos) = update_pos {
                let earlier_wins = match reporter_pos {
                    None => true,
                    Some(reporter_pos) => {
                        update_pos < reporter_pos && instance.value != UNKNOWN_VALUE
                    }
                };
                if earlier_wins {
                    debug!(
                        "{} from {} deferred to {} ({})",
                        name,
                        reporting_host,
                        instance.update_host.as_deref().unwrap_or_default(),
                        instance.value
                    );
                    return ReportOutcome::Deferred;
                }
            }
        }

        instance.value = value.to_string();
        instance.update_time = now;
        instance.update_host = Some(reporting_host.to_string());
        debug!("{} = {} (updated by {})", name, value, reporting_host);
        ReportOutcome::Stored
    }

    /// Every cluster host shares the resource, so the master covers it alone
    pub fn is_shared_in_all_hosts(&self, name: &str) -> bool {
        self.instances
            .iter()
            .filter(|i| i.resource == name)
            .any(|i| i.hosts.len() == self.cluster_size)
    }

    pub fn is_shared_by_host(&self, host: &str, name: &str) -> bool {
        self.instances.iter().any(|i| i.resource == name && i.has_host(host))
    }

    /// Instances this host participates in
    pub fn local_instances(&self) -> impl Iterator<Item = &SharedResourceInstance> {
        let host = self.local_host.clone();
        self.instances.iter().filter(move |i| i.has_host(&host))
    }

    pub fn local_instance(&self, name: &str) -> Option<&SharedResourceInstance> {
        self.instances
            .iter()
            .find(|i| i.resource == name && i.has_host(&self.local_host))
    }

    /// Forget values this host vouched for (its probe went away)
    pub fn reset_owned_by_local(&mut self) -> usize {
        let mut reset = 0;
        for instance in self.instances.iter_mut() {
            if instance.update_time == 0 || instance.update_host.is_none() {
                continue;
            }
            if instance.update_host.as_deref() == Some(self.local_host.as_str()) {
                instance.reset();
                reset += 1;
            }
        }
        reset
    }

    /// Revert values older than `max_age` seconds to unknown
    pub fn expire_stale(&mut self, now: i64, max_age: i64) -> usize {
        if max_age <= 0 {
            return 0;
        }
        let mut expired = 0;
        for instance in self.instances.iter_mut() {
            if instance.update_time != 0 && now - instance.update_time > max_age {
                info!("Shared value {} from {:?} went stale", instance.resource, instance.update_host);
                instance.reset();
                expired += 1;
            }
        }
        expired
    }

    /// (resource, value) pairs this host currently owns, for broadcasting
    pub fn values_owned_by_local(&self) -> Vec<(String, String)> {
        self.instances
            .iter()
            .filter(|i| i.update_host.as_deref() == Some(self.local_host.as_str()))
            .map(|i| (i.resource.clone(), i.value.clone()))
            .collect()
    }

    pub fn instances(&self) -> &[SharedResourceInstance] {
        &self.instances
    }
}
