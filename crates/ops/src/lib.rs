//! Keel saga coordinator.
//!
//! Every lifecycle operation has the same shape:
//!
//! 1. authorize, check quota and apply the local mutation in one transaction,
//!    then commit;
//! 2. call the orchestrator, bounded by the request deadline, the configured
//!    remote timeout and the request's cancellation token;
//! 3. if the remote call fails, run the inverse mutation in a new transaction
//!    and return the remote error. If the inverse itself fails the result is
//!    [`KeelError::InconsistentState`].
//!
//! The store lock is never held across a remote call.

#![forbid(unsafe_code)]

mod access;
mod deployments;
mod ingresses;
mod namespaces;
mod volumes;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Span};

use keel_access::PermissionEngine;
use keel_core::{AccessLevel, Actor, Describe, KeelError, KeelResult, Namespace, OrchestratorError, ResourceKind};
use keel_kubehub::{OrchestratorClient, OrchestratorOp};
use keel_persist::{SqliteStore, Tx};
use keel_quota::{QuotaEngine, TariffSource};
use keel_versions::VersionManager;

pub use ingresses::IngressRequest;
pub use volumes::VolumeView;
pub use keel_kubehub::TlsMaterial;

/// Default bound on a single orchestrator call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request context: who is acting and how long they are willing to wait.
#[derive(Debug, Clone)]
pub struct RequestCtx {
    pub actor: Actor,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl RequestCtx {
    pub fn new(actor: Actor) -> Self {
        Self { actor, cancel: CancellationToken::new(), deadline: None }
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.deadline = Some(Instant::now() + d);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// A namespace as one user sees it: under their own label and level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceView {
    pub label: String,
    pub access: AccessLevel,
    pub namespace: Namespace,
}

pub struct Coordinator {
    store: Arc<SqliteStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    tariffs: Arc<dyn TariffSource>,
    permissions: PermissionEngine,
    quota: QuotaEngine,
    versions: VersionManager,
    remote_timeout: Duration,
    span: Span,
}

impl Coordinator {
    pub fn new(
        store: Arc<SqliteStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
        tariffs: Arc<dyn TariffSource>,
        remote_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            tariffs,
            permissions: PermissionEngine::new(),
            quota: QuotaEngine::new(),
            versions: VersionManager::new(),
            remote_timeout,
            span: tracing::info_span!("saga", component = "saga_coordinator"),
        }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.permissions
    }

    /// Named collaborators with their self-descriptions, for startup logging.
    pub fn collaborators(&self) -> Vec<(&'static str, String)> {
        vec![
            ("store", self.store.describe()),
            ("orchestrator", self.orchestrator.describe()),
            ("tariffs", self.tariffs.describe()),
        ]
    }

    fn tx<T>(&self, f: impl FnOnce(&Tx<'_>) -> KeelResult<T>) -> KeelResult<T> {
        self.store.transactional(f)
    }

    /// Resolves a namespace the actor can reach at `level`.
    fn namespace_for(&self, tx: &Tx<'_>, actor: &Actor, label: &str, level: AccessLevel) -> KeelResult<Namespace> {
        let rec = self.permissions.require(tx, actor, ResourceKind::Namespace, label, level)?;
        tx.namespace(rec.resource_id)?
            .ok_or_else(|| KeelError::not_found(format!("namespace {}", label)))
    }

    /// Runs one orchestrator call under the request's deadline and token.
    async fn remote<F>(&self, ctx: &RequestCtx, op: OrchestratorOp, call: F) -> Result<(), OrchestratorError>
    where
        F: Future<Output = Result<(), OrchestratorError>>,
    {
        let budget = match ctx.deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(self.remote_timeout),
            None => self.remote_timeout,
        };
        let started = Instant::now();
        let outcome = if budget.is_zero() {
            Err(OrchestratorError::Timeout(0))
        } else {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Err(OrchestratorError::Cancelled),
                r = tokio::time::timeout(budget, call) => match r {
                    Ok(r) => r,
                    Err(_) => Err(OrchestratorError::Timeout(budget.as_millis() as u64)),
                },
            }
        };
        histogram!("saga_remote_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op.as_str());
        match &outcome {
            Ok(()) => debug!(parent: &self.span, %op, actor = %ctx.actor.id, "saga: remote call ok"),
            Err(e) => {
                warn!(parent: &self.span, %op, actor = %ctx.actor.id, error = %e, "saga: remote call failed");
                counter!("saga_remote_failures_total", 1, "op" => op.as_str());
            }
        }
        outcome
    }

    /// Undoes a committed local mutation after `remote` failed.
    fn compensate<F>(&self, op: OrchestratorOp, remote: OrchestratorError, undo: F) -> KeelError
    where
        F: FnOnce(&Tx<'_>) -> KeelResult<()>,
    {
        match self.store.transactional(undo) {
            Ok(()) => {
                warn!(parent: &self.span, %op, error = %remote, "saga: local change compensated");
                counter!("saga_compensations_total", 1, "op" => op.as_str());
                KeelError::Orchestrator(remote)
            }
            Err(comp) => self.inconsistent(op, remote.to_string(), comp.to_string()),
        }
    }

    fn inconsistent(&self, op: OrchestratorOp, remote: String, compensation: String) -> KeelError {
        error!(parent: &self.span, %op, error = %remote, %compensation, "saga: compensation failed; local and remote state disagree");
        counter!("saga_inconsistent_total", 1, "op" => op.as_str());
        KeelError::InconsistentState { operation: op.to_string(), remote, compensation }
    }

    fn require_admin(&self, ctx: &RequestCtx, what: &str) -> KeelResult<()> {
        if ctx.actor.admin {
            Ok(())
        } else {
            Err(KeelError::denied(format!("{} requires an administrator", what)))
        }
    }
}

impl Describe for Coordinator {
    fn describe(&self) -> String {
        format!("saga coordinator (remote timeout {}ms)", self.remote_timeout.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kubehub::MockOrchestrator;
    use keel_quota::StaticTariffs;
    use uuid::Uuid;

    fn coordinator(timeout: Duration) -> (Coordinator, Arc<MockOrchestrator>) {
        let mock = Arc::new(MockOrchestrator::new());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let c = Coordinator::new(store, mock.clone(), Arc::new(StaticTariffs::builtin()), timeout);
        (c, mock)
    }

    async fn ok() -> Result<(), OrchestratorError> {
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_wins_over_ready_call() {
        let (c, _) = coordinator(Duration::from_secs(5));
        let ctx = RequestCtx::new(Actor::user(Uuid::new_v4()));
        ctx.cancel.cancel();
        let r = c.remote(&ctx, OrchestratorOp::CreateNamespace, ok()).await;
        assert_eq!(r, Err(OrchestratorError::Cancelled));
    }

    #[tokio::test]
    async fn slow_call_times_out_at_configured_bound() {
        let (c, _) = coordinator(Duration::from_millis(20));
        let ctx = RequestCtx::new(Actor::user(Uuid::new_v4()));
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        };
        let r = c.remote(&ctx, OrchestratorOp::SetReplicas, slow).await;
        assert_eq!(r, Err(OrchestratorError::Timeout(20)));
    }

    #[tokio::test]
    async fn expired_deadline_never_calls_out() {
        let (c, _) = coordinator(Duration::from_secs(5));
        let mut ctx = RequestCtx::new(Actor::user(Uuid::new_v4()));
        ctx.deadline = Some(Instant::now());
        let r = c.remote(&ctx, OrchestratorOp::DeleteDeployment, ok()).await;
        assert_eq!(r, Err(OrchestratorError::Timeout(0)));
    }

    #[test]
    fn collaborators_describe_themselves() {
        let (c, _) = coordinator(DEFAULT_REMOTE_TIMEOUT);
        let names: Vec<&str> = c.collaborators().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["store", "orchestrator", "tariffs"]);
        assert!(c.describe().contains("30000ms"));
    }
}
