//! Keel kubehub: the orchestrator seam.
//!
//! [`OrchestratorClient`] is the only way the coordinator talks to the
//! cluster. Three variants exist: [`KubeOrchestrator`] (kube-rs),
//! [`StubOrchestrator`] (logs and succeeds, debug mode only) and
//! [`MockOrchestrator`] (records calls, injects failures; used by tests).

#![forbid(unsafe_code)]

mod kube_client;
mod mock;
mod stub;

use std::fmt;

use keel_core::{Actor, DeploymentSpec, Describe, Ingress, Namespace, OrchestratorError, SemVer};

pub use kube_client::KubeOrchestrator;
pub use mock::{Call, MockOrchestrator};
pub use stub::StubOrchestrator;

/// Label set on every object Keel manages.
pub const MANAGED_BY: (&str, &str) = ("app.kubernetes.io/managed-by", "keel");
/// Annotation carrying the acting user's id for remote audit.
pub const ACTOR_ANNOTATION: &str = "keel.io/actor";
pub const OWNER_LABEL: &str = "keel.io/owner";
pub const DEPLOYMENT_LABEL: &str = "keel.io/deployment";
pub const VERSION_ANNOTATION: &str = "keel.io/version";

/// Remote operation names; used for metrics labels and mock scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorOp {
    CreateNamespace,
    SetNamespaceQuota,
    DeleteNamespace,
    CreateDeployment,
    ReplaceDeployment,
    SetReplicas,
    DeleteDeployment,
    CreateIngress,
    DeleteIngress,
    CreateSecret,
    DeleteSecret,
}

impl OrchestratorOp {
    pub fn as_str(self) -> &'static str {
        match self {
            OrchestratorOp::CreateNamespace => "create_namespace",
            OrchestratorOp::SetNamespaceQuota => "set_namespace_quota",
            OrchestratorOp::DeleteNamespace => "delete_namespace",
            OrchestratorOp::CreateDeployment => "create_deployment",
            OrchestratorOp::ReplaceDeployment => "replace_deployment",
            OrchestratorOp::SetReplicas => "set_replicas",
            OrchestratorOp::DeleteDeployment => "delete_deployment",
            OrchestratorOp::CreateIngress => "create_ingress",
            OrchestratorOp::DeleteIngress => "delete_ingress",
            OrchestratorOp::CreateSecret => "create_secret",
            OrchestratorOp::DeleteSecret => "delete_secret",
        }
    }
}

impl fmt::Display for OrchestratorOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PEM material for an ingress TLS secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: String,
    pub key: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial").field("cert_len", &self.cert.len()).field("key", &"<redacted>").finish()
    }
}

/// Remote cluster operations. Every call carries the acting user for audit.
///
/// Deletes of objects that are already gone succeed.
#[async_trait::async_trait]
pub trait OrchestratorClient: Describe + Send + Sync {
    async fn create_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError>;
    /// Pushes `ns.limits` as the remote quota.
    async fn set_namespace_quota(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError>;
    async fn delete_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError>;

    async fn create_deployment(
        &self,
        actor: &Actor,
        ns: &Namespace,
        name: &str,
        version: SemVer,
        spec: &DeploymentSpec,
    ) -> Result<(), OrchestratorError>;
    async fn replace_deployment(
        &self,
        actor: &Actor,
        ns: &Namespace,
        name: &str,
        version: SemVer,
        spec: &DeploymentSpec,
    ) -> Result<(), OrchestratorError>;
    async fn set_replicas(&self, actor: &Actor, ns: &Namespace, name: &str, replicas: u32) -> Result<(), OrchestratorError>;
    async fn delete_deployment(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError>;

    async fn create_ingress(&self, actor: &Actor, ns: &Namespace, ingress: &Ingress) -> Result<(), OrchestratorError>;
    async fn delete_ingress(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError>;

    async fn create_secret(&self, actor: &Actor, ns: &Namespace, name: &str, tls: &TlsMaterial) -> Result<(), OrchestratorError>;
    async fn delete_secret(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError>;
}

/// Remote namespace name for a Keel namespace.
pub fn remote_namespace(ns: &Namespace) -> String {
    ns.id.to_string()
}
