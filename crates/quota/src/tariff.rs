//! Tariff source: maps a tariff id to the namespace limits it grants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_core::{Describe, KeelError, KeelResult, Limits};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tariff {
    pub id: String,
    pub cpu: u64,
    pub ram: u64,
    #[serde(default)]
    pub max_ext_services: u64,
    #[serde(default)]
    pub max_int_services: u64,
    #[serde(default)]
    pub max_traffic: u64,
}

impl Tariff {
    pub fn limits(&self) -> Limits {
        Limits {
            cpu: self.cpu,
            ram: self.ram,
            max_ext_services: self.max_ext_services,
            max_int_services: self.max_int_services,
            max_traffic: self.max_traffic,
        }
    }
}

pub trait TariffSource: Describe + Send + Sync {
    fn tariff(&self, id: &str) -> Option<Tariff>;

    fn limits(&self, id: &str) -> KeelResult<Limits> {
        self.tariff(id)
            .map(|t| t.limits())
            .ok_or_else(|| KeelError::not_found(format!("tariff {}", id)))
    }
}

/// Fixed tariff table, loaded once from YAML.
///
/// ```yaml
/// - id: small
///   cpu: 1000
///   ram: 2048
///   max_ext_services: 1
///   max_int_services: 4
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTariffs {
    tariffs: BTreeMap<String, Tariff>,
    origin: String,
}

impl StaticTariffs {
    pub fn new(tariffs: impl IntoIterator<Item = Tariff>) -> Self {
        Self { tariffs: tariffs.into_iter().map(|t| (t.id.clone(), t)).collect(), origin: "inline".into() }
    }

    pub fn from_yaml(text: &str) -> KeelResult<Self> {
        let list: Vec<Tariff> =
            serde_yaml::from_str(text).map_err(|e| KeelError::Validation(format!("tariff table: {}", e)))?;
        let mut me = Self::new(list);
        me.origin = "yaml".into();
        Ok(me)
    }

    pub fn load(path: &str) -> KeelResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KeelError::Validation(format!("reading tariffs from {}: {}", path, e)))?;
        let mut me = Self::from_yaml(&text)?;
        me.origin = path.to_string();
        Ok(me)
    }

    /// Small built-in table for debug runs without a tariff file.
    pub fn builtin() -> Self {
        let mut me = Self::new([
            Tariff { id: "free".into(), cpu: 500, ram: 512, max_ext_services: 0, max_int_services: 2, max_traffic: 10 },
            Tariff { id: "small".into(), cpu: 1000, ram: 2048, max_ext_services: 1, max_int_services: 4, max_traffic: 100 },
            Tariff { id: "large".into(), cpu: 8000, ram: 16384, max_ext_services: 4, max_int_services: 16, max_traffic: 1000 },
        ]);
        me.origin = "builtin".into();
        me
    }

    pub fn len(&self) -> usize {
        self.tariffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tariffs.is_empty()
    }
}

impl Describe for StaticTariffs {
    fn describe(&self) -> String {
        format!("static tariffs ({} entries from {})", self.tariffs.len(), self.origin)
    }
}

impl TariffSource for StaticTariffs {
    fn tariff(&self, id: &str) -> Option<Tariff> {
        self.tariffs.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_table_defaults_optional_fields() {
        let t = StaticTariffs::from_yaml("- id: tiny\n  cpu: 100\n  ram: 64\n").unwrap();
        let l = t.limits("tiny").unwrap();
        assert_eq!((l.cpu, l.ram, l.max_ext_services), (100, 64, 0));
        assert!(t.limits("huge").is_err());
        assert!(t.describe().contains("1 entries"));
    }

    #[test]
    fn malformed_yaml_is_validation_error() {
        let err = StaticTariffs::from_yaml("cpu: [").unwrap_err();
        assert_eq!(err.kind(), keel_core::ErrorKind::Validation);
    }
}
