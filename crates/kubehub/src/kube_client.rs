//! kube-rs backed orchestrator. Objects are written with server-side apply
//! under the `keel` field manager.

use std::collections::BTreeMap;
use std::time::Instant;

use k8s_openapi::api::apps::v1::{Deployment as KDeployment, DeploymentSpec as KDeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container as KContainer, ContainerPort, EnvVar, Namespace as KNamespace, PodSpec, PodTemplateSpec, ResourceQuota,
    ResourceQuotaSpec, ResourceRequirements, Secret, Service, ServicePort, ServiceSpec as KServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress as KIngress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use metrics::histogram;
use serde_json::json;
use tracing::{debug, info, warn, Span};

use keel_core::{Actor, DeploymentSpec, Describe, Ingress, Namespace, OrchestratorError, SemVer};

use crate::{
    remote_namespace, OrchestratorClient, OrchestratorOp, TlsMaterial, ACTOR_ANNOTATION, DEPLOYMENT_LABEL, MANAGED_BY,
    OWNER_LABEL, VERSION_ANNOTATION,
};

const FIELD_MANAGER: &str = "keel";
const QUOTA_NAME: &str = "keel-quota";

pub struct KubeOrchestrator {
    client: Client,
    span: Span,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client, span: tracing::info_span!("orchestrator", component = "kube") }
    }

    /// Client from the ambient kubeconfig or in-cluster service account.
    pub async fn try_default() -> Result<Self, OrchestratorError> {
        let client = Client::try_default().await.map_err(map_kube_err)?;
        Ok(Self::new(client))
    }

    fn meta(&self, actor: &Actor, ns: &Namespace, name: &str, namespaced: bool) -> ObjectMeta {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY.0.to_string(), MANAGED_BY.1.to_string());
        labels.insert(OWNER_LABEL.to_string(), ns.owner.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(ACTOR_ANNOTATION.to_string(), actor.id.to_string());
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespaced.then(|| remote_namespace(ns)),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        }
    }

    fn observe(&self, op: OrchestratorOp, actor: &Actor, started: Instant, res: &Result<(), OrchestratorError>) {
        histogram!("orchestrator_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op.as_str(), "backend" => "kube");
        let _e = self.span.enter();
        match res {
            Ok(()) => debug!(op = %op, actor = %actor.id, took_ms = started.elapsed().as_millis() as u64, "kube: ok"),
            Err(e) => warn!(op = %op, actor = %actor.id, error = %e, "kube: failed"),
        }
    }

    async fn apply_deployment(
        &self,
        actor: &Actor,
        ns: &Namespace,
        name: &str,
        version: SemVer,
        spec: &DeploymentSpec,
    ) -> Result<(), OrchestratorError> {
        let rns = remote_namespace(ns);
        let pp = PatchParams::apply(FIELD_MANAGER).force();

        let deployments: Api<KDeployment> = Api::namespaced(self.client.clone(), &rns);
        let obj = build_deployment(self.meta(actor, ns, name, true), name, version, spec);
        deployments.patch(name, &pp, &Patch::Apply(&obj)).await.map_err(map_kube_err)?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &rns);
        for svc in &spec.services {
            let obj = build_service(self.meta(actor, ns, &svc.name, true), name, svc);
            services.patch(&svc.name, &pp, &Patch::Apply(&obj)).await.map_err(map_kube_err)?;
        }
        // Drop services the new spec no longer declares.
        let lp = ListParams::default().labels(&format!("{}={}", DEPLOYMENT_LABEL, name));
        let existing = services.list(&lp).await.map_err(map_kube_err)?;
        for svc in existing.items {
            let Some(svc_name) = svc.metadata.name else { continue };
            if !spec.services.iter().any(|s| s.name == svc_name) {
                delete_ignoring_missing(&services, &svc_name).await?;
            }
        }
        Ok(())
    }
}

impl Describe for KubeOrchestrator {
    fn describe(&self) -> String {
        format!("kube orchestrator (default namespace {})", self.client.default_namespace())
    }
}

#[async_trait::async_trait]
impl OrchestratorClient for KubeOrchestrator {
    async fn create_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<KNamespace> = Api::all(self.client.clone());
        let obj = KNamespace { metadata: self.meta(actor, ns, &remote_namespace(ns), false), ..Default::default() };
        let res = async {
            api.patch(&remote_namespace(ns), &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
                .await
                .map_err(map_kube_err)?;
            self.set_namespace_quota(actor, ns).await
        }
        .await;
        self.observe(OrchestratorOp::CreateNamespace, actor, started, &res);
        if res.is_ok() {
            let _e = self.span.enter();
            info!(ns = %ns.id, label = %ns.label, "kube: namespace created");
        }
        res
    }

    async fn set_namespace_quota(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), &remote_namespace(ns));
        let mut hard = BTreeMap::new();
        hard.insert("limits.cpu".to_string(), Quantity(format!("{}m", ns.limits.cpu)));
        hard.insert("limits.memory".to_string(), Quantity(format!("{}Mi", ns.limits.ram)));
        hard.insert("services.loadbalancers".to_string(), Quantity(ns.limits.max_ext_services.to_string()));
        hard.insert("services".to_string(), Quantity((ns.limits.max_ext_services + ns.limits.max_int_services).to_string()));
        let obj = ResourceQuota {
            metadata: self.meta(actor, ns, QUOTA_NAME, true),
            spec: Some(ResourceQuotaSpec { hard: Some(hard), ..Default::default() }),
            ..Default::default()
        };
        let res = api
            .patch(QUOTA_NAME, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map(|_| ())
            .map_err(map_kube_err);
        self.observe(OrchestratorOp::SetNamespaceQuota, actor, started, &res);
        res
    }

    async fn delete_namespace(&self, actor: &Actor, ns: &Namespace) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<KNamespace> = Api::all(self.client.clone());
        let res = delete_ignoring_missing(&api, &remote_namespace(ns)).await;
        self.observe(OrchestratorOp::DeleteNamespace, actor, started, &res);
        res
    }

    async fn create_deployment(
        &self,
        actor: &Actor,
        ns: &Namespace,
        name: &str,
        version: SemVer,
        spec: &DeploymentSpec,
    ) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let res = self.apply_deployment(actor, ns, name, version, spec).await;
        self.observe(OrchestratorOp::CreateDeployment, actor, started, &res);
        res
    }

    async fn replace_deployment(
        &self,
        actor: &Actor,
        ns: &Namespace,
        name: &str,
        version: SemVer,
        spec: &DeploymentSpec,
    ) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let res = self.apply_deployment(actor, ns, name, version, spec).await;
        self.observe(OrchestratorOp::ReplaceDeployment, actor, started, &res);
        res
    }

    async fn set_replicas(&self, actor: &Actor, ns: &Namespace, name: &str, replicas: u32) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<KDeployment> = Api::namespaced(self.client.clone(), &remote_namespace(ns));
        let payload = scale_patch(actor, replicas);
        let res = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .map(|_| ())
            .map_err(map_kube_err);
        self.observe(OrchestratorOp::SetReplicas, actor, started, &res);
        res
    }

    async fn delete_deployment(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let rns = remote_namespace(ns);
        let res = async {
            let deployments: Api<KDeployment> = Api::namespaced(self.client.clone(), &rns);
            delete_ignoring_missing(&deployments, name).await?;
            let services: Api<Service> = Api::namespaced(self.client.clone(), &rns);
            let lp = ListParams::default().labels(&format!("{}={}", DEPLOYMENT_LABEL, name));
            for svc in services.list(&lp).await.map_err(map_kube_err)?.items {
                if let Some(svc_name) = svc.metadata.name {
                    delete_ignoring_missing(&services, &svc_name).await?;
                }
            }
            Ok(())
        }
        .await;
        self.observe(OrchestratorOp::DeleteDeployment, actor, started, &res);
        res
    }

    async fn create_ingress(&self, actor: &Actor, ns: &Namespace, ingress: &Ingress) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<KIngress> = Api::namespaced(self.client.clone(), &remote_namespace(ns));
        let obj = build_ingress(self.meta(actor, ns, &ingress.name, true), ingress);
        let res = api
            .patch(&ingress.name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map(|_| ())
            .map_err(map_kube_err);
        self.observe(OrchestratorOp::CreateIngress, actor, started, &res);
        res
    }

    async fn delete_ingress(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<KIngress> = Api::namespaced(self.client.clone(), &remote_namespace(ns));
        let res = delete_ignoring_missing(&api, name).await;
        self.observe(OrchestratorOp::DeleteIngress, actor, started, &res);
        res
    }

    async fn create_secret(&self, actor: &Actor, ns: &Namespace, name: &str, tls: &TlsMaterial) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &remote_namespace(ns));
        let mut data = BTreeMap::new();
        data.insert("tls.crt".to_string(), tls.cert.clone());
        data.insert("tls.key".to_string(), tls.key.clone());
        let obj = Secret {
            metadata: self.meta(actor, ns, name, true),
            string_data: Some(data),
            type_: Some("kubernetes.io/tls".to_string()),
            ..Default::default()
        };
        let res = api
            .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&obj))
            .await
            .map(|_| ())
            .map_err(map_kube_err);
        self.observe(OrchestratorOp::CreateSecret, actor, started, &res);
        res
    }

    async fn delete_secret(&self, actor: &Actor, ns: &Namespace, name: &str) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &remote_namespace(ns));
        let res = delete_ignoring_missing(&api, name).await;
        self.observe(OrchestratorOp::DeleteSecret, actor, started, &res);
        res
    }
}

/// Merge patch for a replica change. The scale subresource drops metadata,
/// so the deployment itself is patched to keep the actor annotation current.
pub(crate) fn scale_patch(actor: &Actor, replicas: u32) -> serde_json::Value {
    json!({
        "metadata": {"annotations": {ACTOR_ANNOTATION: actor.id.to_string()}},
        "spec": {"replicas": replicas},
    })
}

async fn delete_ignoring_missing<K>(api: &Api<K>, name: &str) -> Result<(), OrchestratorError>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(map_kube_err(e)),
    }
}

/// 404 → NotFound, other 4xx → Rejected, everything else is a transport failure.
pub(crate) fn map_kube_err(e: kube::Error) -> OrchestratorError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => OrchestratorError::NotFound(ae.message),
        kube::Error::Api(ae) if (400..500).contains(&ae.code) => {
            OrchestratorError::Rejected(format!("{} ({} {})", ae.message, ae.code, ae.reason))
        }
        other => OrchestratorError::Network(other.to_string()),
    }
}

fn pod_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(DEPLOYMENT_LABEL.to_string(), name.to_string());
    labels
}

fn build_deployment(mut meta: ObjectMeta, name: &str, version: SemVer, spec: &DeploymentSpec) -> KDeployment {
    if let Some(a) = meta.annotations.as_mut() {
        a.insert(VERSION_ANNOTATION.to_string(), version.to_string());
    }
    if let Some(l) = meta.labels.as_mut() {
        l.extend(pod_labels(name));
    }
    let containers = spec
        .containers
        .iter()
        .map(|c| {
            let mut limits = BTreeMap::new();
            limits.insert("cpu".to_string(), Quantity(format!("{}m", c.cpu)));
            limits.insert("memory".to_string(), Quantity(format!("{}Mi", c.ram)));
            KContainer {
                name: c.name.clone(),
                image: Some(c.image.clone()),
                env: (!c.env.is_empty()).then(|| {
                    c.env
                        .iter()
                        .map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() })
                        .collect()
                }),
                ports: (!c.ports.is_empty()).then(|| {
                    c.ports
                        .iter()
                        .map(|p| ContainerPort { container_port: i32::from(*p), ..Default::default() })
                        .collect()
                }),
                resources: Some(ResourceRequirements {
                    limits: Some(limits.clone()),
                    requests: Some(limits),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();
    KDeployment {
        metadata: meta,
        spec: Some(KDeploymentSpec {
            replicas: Some(spec.replicas as i32),
            selector: LabelSelector { match_labels: Some(pod_labels(name)), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(pod_labels(name)), ..Default::default() }),
                spec: Some(PodSpec { containers, ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(mut meta: ObjectMeta, deployment: &str, svc: &keel_core::ServiceSpec) -> Service {
    if let Some(l) = meta.labels.as_mut() {
        l.extend(pod_labels(deployment));
    }
    Service {
        metadata: meta,
        spec: Some(KServiceSpec {
            selector: Some(pod_labels(deployment)),
            ports: Some(vec![ServicePort {
                port: i32::from(svc.port),
                target_port: Some(IntOrString::Int(i32::from(svc.port))),
                ..Default::default()
            }]),
            type_: Some(if svc.external { "LoadBalancer" } else { "ClusterIP" }.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_ingress(meta: ObjectMeta, ingress: &Ingress) -> KIngress {
    let path = HTTPIngressPath {
        path: Some(ingress.path.clone()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: ingress.service_name.clone(),
                port: Some(ServiceBackendPort { number: Some(i32::from(ingress.service_port)), ..Default::default() }),
            }),
            ..Default::default()
        },
    };
    KIngress {
        metadata: meta,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(ingress.domain.clone()),
                http: Some(HTTPIngressRuleValue { paths: vec![path] }),
            }]),
            tls: ingress.tls.then(|| {
                vec![IngressTLS { hosts: Some(vec![ingress.domain.clone()]), secret_name: Some(ingress.tls_secret_name()) }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
