use tracing::{info, Span};

use keel_core::{Actor, DeploymentSpec, Describe, Ingress, Namespace, OrchestratorError, SemVer};

use crate::{OrchestratorClient, TlsMaterial};

/// Logs every call and reports success. Refused outside debug mode.
pub struct StubOrchestrator {
    span: Span,
}

impl StubOrchestrator {
    pub fn new() -> Self {
        Self { span: tracing::info_span!("orchestrator", component = "stub") }
    }

    fn log(&self, op: &str, actor: &Actor, target: &str) -> Result<(), OrchestratorError> {
        let _e = self.span.enter();
        info!(op, actor = %actor.id, object = target, "stub orchestrator: accepted");
        Ok(())
    }
}

impl Default for StubOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Describe for StubOrchestrator {
    fn describe(&self) -> String {
        "stub orchestrator (no remote calls)".to_string()
    }
}

#[async_trait::async_trait]
impl OrchestratorClient for StubOrchestrator {
    async fn create_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        self.log("create_namespace", actor, &ns.label)
    }

    async fn set_namespace_quota(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        self.log("set_namespace_quota", actor, &ns.label)
    }

    async fn delete_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        self.log("delete_namespace", actor, &ns.label)
    }

    async fn create_deployment(&self, actor: &Actor, ns: &Namespace, name: &str, version: SemVer, _spec: &DeploymentSpec) -> Result<(), OrchestratorError> {
        self.log("create_deployment", actor, &format!("{}/{}@{}", ns.label, name, version))
    }

    async fn replace_deployment(&self, actor: &Actor, ns: &Namespace, name: &str, version: SemVer, _spec: &DeploymentSpec) -> Result<(), OrchestratorError> {
        self.log("replace_deployment", actor, &format!("{}/{}@{}", ns.label, name, version))
    }

    async fn set_replicas(&self, actor: &Actor, ns: &Namespace, name: &str, replicas: u32) -> Result<(), OrchestratorError> {
        self.log("set_replicas", actor, &format!("{}/{} x{}", ns.label, name, replicas))
    }

    async fn delete_deployment(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        self.log("delete_deployment", actor, &format!("{}/{}", ns.label, name))
    }

    async fn create_ingress(&self, actor: &Actor, ns: &Namespace, ingress: &Ingress) -> Result<(), OrchestratorError> {
        self.log("create_ingress", actor, &format!("{}/{} {}{}", ns.label, ingress.name, ingress.domain, ingress.path))
    }

    async fn delete_ingress(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        self.log("delete_ingress", actor, &format!("{}/{}", ns.label, name))
    }

    async fn create_secret(&self, actor: &Actor, ns: &Namespace, name: &str, _tls: &TlsMaterial) -> Result<(), OrchestratorError> {
        self.log("create_secret", actor, &format!("{}/{}", ns.label, name))
    }

    async fn delete_secret(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        self.log("delete_secret", actor, &format!("{}/{}", ns.label, name))
    }
}
