//! Scriptable in-memory orchestrator for tests and local experiments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use keel_core::{Actor, DeploymentSpec, Describe, Ingress, Namespace, OrchestratorError, SemVer, UserId};

use crate::{OrchestratorClient, OrchestratorOp, TlsMaterial};

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: OrchestratorOp,
    pub actor: UserId,
    pub target: String,
    pub replicas: Option<u32>,
    pub version: Option<SemVer>,
}

#[derive(Default)]
struct Script {
    always: HashMap<OrchestratorOp, OrchestratorError>,
    once: HashMap<OrchestratorOp, OrchestratorError>,
    delay: Option<Duration>,
}

/// Records every call; failures and latency are scripted per operation.
/// A failed call is still recorded.
#[derive(Default)]
pub struct MockOrchestrator {
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `op` fails with `err`.
    pub fn fail_on(&self, op: OrchestratorOp, err: OrchestratorError) {
        if let Ok(mut s) = self.script.lock() {
            s.always.insert(op, err);
        }
    }

    /// Only the next `op` fails with `err`.
    pub fn fail_once(&self, op: OrchestratorOp, err: OrchestratorError) {
        if let Ok(mut s) = self.script.lock() {
            s.once.insert(op, err);
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut s) = self.script.lock() {
            s.always.clear();
            s.once.clear();
        }
    }

    /// Every call sleeps for `d` before answering.
    pub fn set_delay(&self, d: Option<Duration>) {
        if let Ok(mut s) = self.script.lock() {
            s.delay = d;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn ops(&self) -> Vec<OrchestratorOp> {
        self.calls().into_iter().map(|c| c.op).collect()
    }

    async fn hit(&self, call: Call) -> Result<(), OrchestratorError> {
        let op = call.op;
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let delay = self.script.lock().ok().and_then(|s| s.delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let mut s = match self.script.lock() {
            Ok(s) => s,
            Err(_) => return Err(OrchestratorError::Network("mock script poisoned".into())),
        };
        if let Some(err) = s.once.remove(&op) {
            return Err(err);
        }
        match s.always.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn call(op: OrchestratorOp, actor: &Actor, target: String) -> Call {
    Call { op, actor: actor.id, target, replicas: None, version: None }
}

impl Describe for MockOrchestrator {
    fn describe(&self) -> String {
        "mock orchestrator (in-memory)".to_string()
    }
}

#[async_trait::async_trait]
impl OrchestratorClient for MockOrchestrator {
    async fn create_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::CreateNamespace, actor, ns.id.to_string())).await
    }

    async fn set_namespace_quota(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::SetNamespaceQuota, actor, ns.id.to_string())).await
    }

    async fn delete_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::DeleteNamespace, actor, ns.id.to_string())).await
    }

    async fn create_deployment(&self, actor: &Actor, ns: &Namespace, name: &str, version: SemVer, spec: &DeploymentSpec) -> Result<(), OrchestratorError> {
        let mut c = call(OrchestratorOp::CreateDeployment, actor, format!("{}/{}", ns.id, name));
        c.version = Some(version);
        c.replicas = Some(spec.replicas);
        self.hit(c).await
    }

    async fn replace_deployment(&self, actor: &Actor, ns: &Namespace, name: &str, version: SemVer, spec: &DeploymentSpec) -> Result<(), OrchestratorError> {
        let mut c = call(OrchestratorOp::ReplaceDeployment, actor, format!("{}/{}", ns.id, name));
        c.version = Some(version);
        c.replicas = Some(spec.replicas);
        self.hit(c).await
    }

    async fn set_replicas(&self, actor: &Actor, ns: &Namespace, name: &str, replicas: u32) -> Result<(), OrchestratorError> {
        let mut c = call(OrchestratorOp::SetReplicas, actor, format!("{}/{}", ns.id, name));
        c.replicas = Some(replicas);
        self.hit(c).await
    }

    async fn delete_deployment(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::DeleteDeployment, actor, format!("{}/{}", ns.id, name))).await
    }

    async fn create_ingress(&self, actor: &Actor, ns: &Namespace, ingress: &Ingress) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::CreateIngress, actor, format!("{}/{}", ns.id, ingress.name))).await
    }

    async fn delete_ingress(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::DeleteIngress, actor, format!("{}/{}", ns.id, name))).await
    }

    async fn create_secret(&self, actor: &Actor, ns: &Namespace, name: &str, _tls: &TlsMaterial) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::CreateSecret, actor, format!("{}/{}", ns.id, name))).await
    }

    async fn delete_secret(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        self.hit(call(OrchestratorOp::DeleteSecret, actor, format!("{}/{}", ns.id, name))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{now, Limits};
    use uuid::Uuid;

    fn ns() -> Namespace {
        Namespace {
            id: Uuid::new_v4(),
            owner: Uuid::new_v4(),
            label: "ns1".into(),
            limits: Limits::default(),
            tariff_id: None,
            created_at: now(),
            deleted: false,
            delete_time: None,
        }
    }

    #[tokio::test]
    async fn once_failures_clear_after_one_call() {
        let m = MockOrchestrator::new();
        let actor = Actor::user(Uuid::new_v4());
        let n = ns();
        m.fail_once(OrchestratorOp::DeleteDeployment, OrchestratorError::Rejected("no".into()));
        assert!(m.delete_deployment(&actor, &n, "web").await.is_err());
        assert!(m.delete_deployment(&actor, &n, "web").await.is_ok());
        assert_eq!(m.ops(), vec![OrchestratorOp::DeleteDeployment, OrchestratorOp::DeleteDeployment]);
    }

    #[tokio::test]
    async fn records_actor_and_replicas() {
        let m = MockOrchestrator::new();
        let actor = Actor::user(Uuid::new_v4());
        m.set_replicas(&actor, &ns(), "web", 4).await.unwrap();
        let calls = m.calls();
        assert_eq!(calls[0].actor, actor.id);
        assert_eq!(calls[0].replicas, Some(4));
    }
}
