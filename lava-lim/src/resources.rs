//! Resource table: built-in indices plus configured resources

use serde::{Deserialize, Serialize};

use crate::config::LimConfig;
use crate::index::BuiltinIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[default]
    Numeric,
    String,
    Boolean,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFlags {
    pub dynamic: bool,
    pub shared: bool,
    pub external: bool,
    pub builtin: bool,
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub value_type: ValueType,
    pub flags: ResourceFlags,
    pub interval: u32,
    pub increasing: bool,
    pub threshold: Option<f64>,
}

impl Resource {
    /// Reported by the ELIM (dynamic, not built-in, not from the external plugin)
    pub fn is_probed(&self) -> bool {
        self.flags.dynamic && !self.flags.builtin && !self.flags.external
    }

    /// Gets its own slot in the load vector
    pub fn is_load_index(&self) -> bool {
        self.flags.dynamic
            && !self.flags.shared
            && !self.flags.builtin
            && self.value_type == ValueType::Numeric
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    resources: Vec<Resource>,
}

impl ResourceTable {
    pub fn from_config(config: &LimConfig) -> Self {
        let mut resources: Vec<Resource> = BuiltinIndex::ALL
            .iter()
            .map(|b| Resource {
                name: b.name().to_string(),
                value_type: ValueType::Numeric,
                flags: ResourceFlags {
                    dynamic: true,
                    builtin: true,
                    ..Default::default()
                },
                interval: 0,
                increasing: b.increasing(),
                threshold: config.thresholds.get(b.name()).copied(),
            })
            .collect();

        resources.extend(config.resources.iter().map(|r| Resource {
            name: r.name.clone(),
            value_type: r.value_type,
            flags: ResourceFlags {
                dynamic: r.dynamic,
                shared: r.shared,
                external: r.external,
                builtin: false,
            },
            interval: r.interval,
            increasing: r.increasing,
            threshold: r.threshold,
        }));

        Self { resources }
    }

    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Anything for an ELIM to report at all
    pub fn has_probed_resources(&self) -> bool {
        self.resources.iter().any(Resource::is_probed)
    }

    pub fn load_indices(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(|r| r.is_load_index())
    }
}

/// Whole string is a finite number
pub fn is_number(value: &str) -> bool {
    value.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

/// Leading-number parse: "12.5abc" -> 12.5, garbage -> 0
pub fn leading_number(value: &str) -> f64 {
    let value = value.trim();
    let mut end = 0;
    for (i, _) in value.char_indices().skip(1) {
        if value[..i].parse::<f64>().is_ok() {
            end = i;
        }
    }
    if value.parse::<f64>().is_ok() {
        end = value.len();
    }
    value[..end].parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;

    fn resource(name: &str, dynamic: bool, shared: bool) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            value_type: ValueType::Numeric,
            dynamic,
            shared,
            external: false,
            interval: 0,
            increasing: true,
            threshold: None,
        }
    }

    #[test]
    fn test_table_starts_with_builtins() {
        let table = ResourceTable::from_config(&LimConfig::default());
        assert_eq!(table.iter().count(), 11);
        assert!(table.get("r15s").unwrap().flags.builtin);
        assert!(!table.has_probed_resources());
    }

    #[test]
    fn test_probed_and_index_resources() {
        let mut config = LimConfig::default();
        config.resources.push(resource("licA", true, true));
        config.resources.push(resource("scratch", true, false));
        config.resources.push(resource("static_tag", false, false));
        let table = ResourceTable::from_config(&config);

        assert!(table.has_probed_resources());
        let names: Vec<_> = table.load_indices().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["scratch"]);
    }

    #[test]
    fn test_number_checks() {
        assert!(is_number("42"));
        assert!(is_number(" 3.5 "));
        assert!(!is_number("3.5x"));
        assert!(!is_number("inf"));
        assert!(!is_number("-"));
        assert_eq!(leading_number("12.5abc"), 12.5);
        assert_eq!(leading_number("abc"), 0.0);
        assert_eq!(leading_number("7"), 7.0);
    }
}
