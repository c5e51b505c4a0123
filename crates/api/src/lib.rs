//! Keel runtime façade: turns a [`KeelConfig`] into a wired [`Coordinator`].
//!
//! Backends are chosen once here. Frontends (the CLI, an HTTP layer) hold a
//! [`Keel`] and call the coordinator's lifecycle operations directly.

#![forbid(unsafe_code)]

mod config;

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use keel_kubehub::{KubeOrchestrator, OrchestratorClient, StubOrchestrator};
use keel_ops::Coordinator;
use keel_persist::SqliteStore;
use keel_quota::{StaticTariffs, TariffSource};

pub use config::{ConfigError, KeelConfig, Mode, OrchestratorBackend, StoreBackend};
pub use keel_ops::{IngressRequest, NamespaceView, RequestCtx, TlsMaterial, VolumeView};

/// Runtime settings and collaborator descriptions exposed to clients.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub mode: Mode,
    pub store: StoreBackend,
    pub orchestrator: OrchestratorBackend,
    pub remote_timeout_secs: u64,
    pub metrics_addr: Option<String>,
    pub collaborators: Vec<(String, String)>,
}

pub struct Keel {
    config: KeelConfig,
    coordinator: Arc<Coordinator>,
}

impl Keel {
    /// Opens the store, connects the orchestrator and loads tariffs.
    pub async fn start(config: KeelConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let store = match config.store {
            StoreBackend::Sqlite => {
                let path = config.db_path();
                SqliteStore::open(&path).with_context(|| format!("opening store at {}", path))?
            }
            StoreBackend::Memory => SqliteStore::open_in_memory().context("opening in-memory store")?,
        };

        let orchestrator: Arc<dyn OrchestratorClient> = match config.orchestrator {
            OrchestratorBackend::Kube => {
                Arc::new(KubeOrchestrator::try_default().await.context("connecting to the cluster")?)
            }
            OrchestratorBackend::Stub => Arc::new(StubOrchestrator::new()),
        };

        let tariffs: Arc<dyn TariffSource> = match &config.tariffs {
            Some(path) => Arc::new(StaticTariffs::load(path).context("loading tariffs")?),
            None => Arc::new(StaticTariffs::builtin()),
        };

        let coordinator = Coordinator::new(Arc::new(store), orchestrator, tariffs, config.remote_timeout());
        Ok(Self::from_parts(config, coordinator))
    }

    /// Wraps an already-wired coordinator. Logs every collaborator by name.
    pub fn from_parts(config: KeelConfig, coordinator: Coordinator) -> Self {
        info!(mode = %config.mode, store = %config.store, orchestrator = %config.orchestrator, "keel: starting");
        for (name, description) in coordinator.collaborators() {
            info!(collaborator = name, %description, "keel: collaborator ready");
        }
        metrics::gauge!("keel_remote_timeout_secs", config.remote_timeout_secs as f64);
        Self { config, coordinator: Arc::new(coordinator) }
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    pub fn stats(&self) -> Stats {
        Stats {
            mode: self.config.mode,
            store: self.config.store,
            orchestrator: self.config.orchestrator,
            remote_timeout_secs: self.config.remote_timeout_secs,
            metrics_addr: self.config.metrics_addr.clone(),
            collaborators: self
                .coordinator
                .collaborators()
                .into_iter()
                .map(|(n, d)| (n.to_string(), d))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Actor, ErrorKind};
    use uuid::Uuid;

    fn memory_config() -> KeelConfig {
        KeelConfig { store: StoreBackend::Memory, ..KeelConfig::default() }
    }

    #[tokio::test]
    async fn debug_wiring_serves_lifecycle_calls() {
        let keel = Keel::start(memory_config()).await.unwrap();
        let ctx = RequestCtx::new(Actor::user(Uuid::new_v4()));
        let ns = keel.coordinator().create_namespace(&ctx, "ns1", "small").await.unwrap();
        assert_eq!(ns.label, "ns1");
        let err = keel.coordinator().create_namespace(&ctx, "ns2", "platinum").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn stats_list_collaborators() {
        let keel = Keel::start(memory_config()).await.unwrap();
        let stats = keel.stats();
        let names: Vec<&str> = stats.collaborators.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["store", "orchestrator", "tariffs"]);
        assert!(stats.collaborators[2].1.contains("builtin"));
        assert_eq!(stats.remote_timeout_secs, 30);
    }

    #[tokio::test]
    async fn start_rechecks_release_rules() {
        let cfg = KeelConfig { mode: Mode::Release, ..memory_config() };
        assert!(Keel::start(cfg).await.is_err());
    }
}
