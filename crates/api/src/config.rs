//! Runtime configuration from `KEEL_*` environment variables, optionally
//! overridden by a YAML file named in `KEEL_CONFIG`.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {value:?} ({expected})")]
    Invalid { key: &'static str, value: String, expected: &'static str },
    #[error("reading {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("release mode refuses {0}")]
    Refused(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Debug,
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorBackend {
    Kube,
    #[default]
    Stub,
}

macro_rules! lowercase_enum {
    ($ty:ident, $key:literal, $expected:literal, { $($s:literal => $v:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ConfigError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($s => Ok($ty::$v),)+
                    _ => Err(ConfigError::Invalid { key: $key, value: s.to_string(), expected: $expected }),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self { $($ty::$v => $s,)+ };
                f.write_str(s)
            }
        }
    };
}

lowercase_enum!(Mode, "KEEL_MODE", "debug|release", { "debug" => Debug, "release" => Release });
lowercase_enum!(StoreBackend, "KEEL_STORE", "sqlite|memory", { "sqlite" => Sqlite, "memory" => Memory });
lowercase_enum!(OrchestratorBackend, "KEEL_ORCHESTRATOR", "kube|stub", { "kube" => Kube, "stub" => Stub });

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeelConfig {
    pub mode: Mode,
    pub store: StoreBackend,
    /// SQLite file; `None` means the per-user default.
    pub db_path: Option<String>,
    pub orchestrator: OrchestratorBackend,
    pub remote_timeout_secs: u64,
    /// YAML tariff table; `None` means the built-in table (debug only).
    pub tariffs: Option<String>,
    pub metrics_addr: Option<String>,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Debug,
            store: StoreBackend::Sqlite,
            db_path: None,
            orchestrator: OrchestratorBackend::Stub,
            remote_timeout_secs: keel_ops::DEFAULT_REMOTE_TIMEOUT.as_secs(),
            tariffs: None,
            metrics_addr: None,
        }
    }
}

/// Fields a `KEEL_CONFIG` file may set. Anything present wins over the
/// environment.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overlay {
    mode: Option<Mode>,
    store: Option<StoreBackend>,
    db_path: Option<String>,
    orchestrator: Option<OrchestratorBackend>,
    remote_timeout_secs: Option<u64>,
    tariffs: Option<String>,
    metrics_addr: Option<String>,
}

impl KeelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
    }

    /// Builds the configuration from any key lookup, then validates it.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = lookup("KEEL_MODE") {
            cfg.mode = v.parse()?;
        }
        if let Some(v) = lookup("KEEL_STORE") {
            cfg.store = v.parse()?;
        }
        if let Some(v) = lookup("KEEL_ORCHESTRATOR") {
            cfg.orchestrator = v.parse()?;
        }
        if let Some(v) = lookup("KEEL_REMOTE_TIMEOUT_SECS") {
            cfg.remote_timeout_secs = v.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "KEEL_REMOTE_TIMEOUT_SECS",
                value: v.clone(),
                expected: "whole seconds",
            })?;
        }
        cfg.db_path = lookup("KEEL_DB_PATH").or(cfg.db_path);
        cfg.tariffs = lookup("KEEL_TARIFFS").or(cfg.tariffs);
        cfg.metrics_addr = lookup("KEEL_METRICS_ADDR").or(cfg.metrics_addr);

        if let Some(path) = lookup("KEEL_CONFIG") {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Read { path: path.clone(), reason: e.to_string() })?;
            cfg.apply_yaml(&text).map_err(|reason| ConfigError::Read { path, reason })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_yaml(&mut self, text: &str) -> Result<(), String> {
        let o: Overlay = serde_yaml::from_str(text).map_err(|e| e.to_string())?;
        self.mode = o.mode.unwrap_or(self.mode);
        self.store = o.store.unwrap_or(self.store);
        self.orchestrator = o.orchestrator.unwrap_or(self.orchestrator);
        self.remote_timeout_secs = o.remote_timeout_secs.unwrap_or(self.remote_timeout_secs);
        self.db_path = o.db_path.or(self.db_path.take());
        self.tariffs = o.tariffs.or(self.tariffs.take());
        self.metrics_addr = o.metrics_addr.or(self.metrics_addr.take());
        Ok(())
    }

    /// Release mode runs only against real collaborators.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "KEEL_REMOTE_TIMEOUT_SECS",
                value: "0".into(),
                expected: "a positive number of seconds",
            });
        }
        if self.mode == Mode::Release {
            if self.orchestrator == OrchestratorBackend::Stub {
                return Err(ConfigError::Refused("the stub orchestrator".into()));
            }
            if self.store == StoreBackend::Memory {
                return Err(ConfigError::Refused("the in-memory store".into()));
            }
            if self.tariffs.is_none() {
                return Err(ConfigError::Refused("the built-in tariff table (set KEEL_TARIFFS)".into()));
            }
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn db_path(&self) -> String {
        self.db_path.clone().unwrap_or_else(keel_persist::default_db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |k| map.get(k).map(|v| v.to_string())
    }

    #[test]
    fn defaults_are_debug_sqlite_stub() {
        let cfg = KeelConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, KeelConfig::default());
        assert_eq!(cfg.remote_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn env_values_are_parsed() {
        let cfg = KeelConfig::from_lookup(lookup(&[
            ("KEEL_STORE", "memory"),
            ("KEEL_ORCHESTRATOR", "Kube"),
            ("KEEL_REMOTE_TIMEOUT_SECS", "5"),
            ("KEEL_METRICS_ADDR", "127.0.0.1:9100"),
        ]))
        .unwrap();
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.orchestrator, OrchestratorBackend::Kube);
        assert_eq!(cfg.remote_timeout_secs, 5);
        assert_eq!(cfg.metrics_addr.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = KeelConfig::from_lookup(lookup(&[("KEEL_STORE", "postgres")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KEEL_STORE", .. }));
        let err = KeelConfig::from_lookup(lookup(&[("KEEL_REMOTE_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "KEEL_REMOTE_TIMEOUT_SECS", .. }));
        assert!(KeelConfig::from_lookup(lookup(&[("KEEL_REMOTE_TIMEOUT_SECS", "0")])).is_err());
    }

    #[test]
    fn release_refuses_stand_ins() {
        let err = KeelConfig::from_lookup(lookup(&[("KEEL_MODE", "release"), ("KEEL_TARIFFS", "/etc/keel/t.yaml")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Refused("the stub orchestrator".into()));
        let err = KeelConfig::from_lookup(lookup(&[
            ("KEEL_MODE", "release"),
            ("KEEL_ORCHESTRATOR", "kube"),
            ("KEEL_STORE", "memory"),
            ("KEEL_TARIFFS", "/etc/keel/t.yaml"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Refused(_)));
        let ok = KeelConfig::from_lookup(lookup(&[
            ("KEEL_MODE", "release"),
            ("KEEL_ORCHESTRATOR", "kube"),
            ("KEEL_TARIFFS", "/etc/keel/t.yaml"),
        ]));
        assert!(ok.is_ok());
    }

    #[test]
    fn yaml_file_overrides_environment() {
        let path = std::env::temp_dir().join(format!("keel-config-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "store: memory\nremote_timeout_secs: 7\n").unwrap();
        let p = path.to_string_lossy().to_string();
        let cfg = KeelConfig::from_lookup(lookup(&[
            ("KEEL_STORE", "sqlite"),
            ("KEEL_REMOTE_TIMEOUT_SECS", "3"),
            ("KEEL_DB_PATH", "/tmp/k.db"),
            ("KEEL_CONFIG", p.as_str()),
        ]))
        .unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.remote_timeout_secs, 7);
        assert_eq!(cfg.db_path.as_deref(), Some("/tmp/k.db"));
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let mut cfg = KeelConfig::default();
        assert!(cfg.apply_yaml("storage: memory\n").is_err());
        assert!(cfg.apply_yaml("mode: release\n").is_ok());
        assert_eq!(cfg.mode, Mode::Release);
    }
}
