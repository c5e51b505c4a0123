//! Deployment lifecycle and version history.

use tracing::info;
use uuid::Uuid;

use keel_core::{
    now, validate_name, validate_replicas, AccessLevel, Deployment, DeploymentSpec, DeploymentView, KeelError, KeelResult,
    Namespace, SemVer, Version,
};
use keel_kubehub::OrchestratorOp;
use keel_persist::Tx;
use keel_versions::VersionDiff;

use crate::{Coordinator, RequestCtx};

/// Local effect of an update, committed before the remote call.
enum Change {
    /// Proposed spec equals the active version.
    Unchanged(Version),
    /// A new version row was appended and activated.
    Appended { created: Version },
    /// An existing version row was rewritten in place (and activated if it
    /// was not). `before` is the pre-image used for compensation.
    InPlace { before: Version, after: Version },
}

struct Prepared {
    ns: Namespace,
    deployment: Deployment,
    prior_active: Option<Uuid>,
    change: Change,
}

impl Coordinator {
    fn deployment_in(tx: &Tx<'_>, ns: &Namespace, name: &str) -> KeelResult<Deployment> {
        tx.deployment_by_name(ns.id, name)?
            .ok_or_else(|| KeelError::not_found(format!("deployment {}", name)))
    }

    /// Creates a deployment with version 1.0.0 active.
    pub async fn create_deployment(
        &self,
        ctx: &RequestCtx,
        ns_label: &str,
        name: &str,
        spec: DeploymentSpec,
    ) -> KeelResult<DeploymentView> {
        validate_name("deployment name", name)?;
        spec.validate()?;
        let actor = ctx.actor;
        let (ns, view) = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            if tx.deployment_by_name(ns.id, name)?.is_some() {
                return Err(KeelError::AlreadyExists(format!("deployment {}", name)));
            }
            let usage = self.quota.usage(tx, ns.id)?;
            self.quota.check_create(&ns.limits, &usage, &spec)?;
            let deployment = Deployment {
                id: Uuid::new_v4(),
                namespace_id: ns.id,
                name: name.to_string(),
                owner: ns.owner,
                created_at: now(),
                deleted: false,
                delete_time: None,
            };
            tx.insert_deployment(&deployment)?;
            let version = self.versions.append(tx, deployment.id, SemVer::INITIAL, &spec, true)?;
            Ok((ns, DeploymentView { deployment, active: Some(version) }))
        })?;

        let op = OrchestratorOp::CreateDeployment;
        let call = self.orchestrator.create_deployment(&actor, &ns, name, SemVer::INITIAL, &spec);
        if let Err(e) = self.remote(ctx, op, call).await {
            return Err(self.compensate(op, e, |tx| Ok(tx.purge_deployment(view.deployment.id)?)));
        }
        info!(parent: &self.span, ns = %ns.id, deployment = name, version = %SemVer::INITIAL, "deployments: created");
        Ok(view)
    }

    /// Replaces the deployment's configuration. Depending on the change this
    /// appends a new major, minor or patch version or rewrites the active one.
    pub async fn update_deployment(
        &self,
        ctx: &RequestCtx,
        ns_label: &str,
        name: &str,
        spec: DeploymentSpec,
    ) -> KeelResult<DeploymentView> {
        self.apply_update(ctx, ns_label, name, move |_| Ok(spec)).await
    }

    /// Shortcut for an update that only swaps one container's image.
    pub async fn set_container_image(
        &self,
        ctx: &RequestCtx,
        ns_label: &str,
        name: &str,
        container: &str,
        image: &str,
    ) -> KeelResult<DeploymentView> {
        self.apply_update(ctx, ns_label, name, |base| {
            let mut next = base.clone();
            let c = next
                .containers
                .iter_mut()
                .find(|c| c.name == container)
                .ok_or_else(|| KeelError::not_found(format!("container {}", container)))?;
            c.image = image.to_string();
            Ok(next)
        })
        .await
    }

    async fn apply_update<F>(&self, ctx: &RequestCtx, ns_label: &str, name: &str, propose: F) -> KeelResult<DeploymentView>
    where
        F: FnOnce(&DeploymentSpec) -> KeelResult<DeploymentSpec>,
    {
        let actor = ctx.actor;
        let p = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let history = self.versions.history(tx, deployment.id)?;
            let base = history
                .base()
                .cloned()
                .ok_or_else(|| KeelError::Validation(format!("deployment {} has no versions", name)))?;
            let proposed = propose(&base.spec)?;
            proposed.validate()?;
            let prior = history.active().cloned();
            let usage = self.quota.usage(tx, ns.id)?;
            match &prior {
                Some(active) => self.quota.check_replace(&ns.limits, &usage, &active.spec, &proposed)?,
                None => self.quota.check_create(&ns.limits, &usage, &proposed)?,
            }
            let change = match history.plan(&proposed)?.next {
                Some(number) => Change::Appended { created: self.versions.append(tx, deployment.id, number, &proposed, true)? },
                None if base.active && base.spec == proposed => Change::Unchanged(base),
                None => {
                    tx.update_version_spec(base.id, &proposed)?;
                    if !base.active {
                        self.versions.activate(tx, deployment.id, Some(&base))?;
                    }
                    let after = Version { spec: proposed, active: true, ..base.clone() };
                    Change::InPlace { before: base, after }
                }
            };
            Ok(Prepared { ns, deployment, prior_active: prior.map(|v| v.id), change })
        })?;

        let Prepared { ns, deployment, prior_active, change } = p;
        let active = match change {
            Change::Unchanged(v) => v,
            Change::Appended { created } => {
                let op = OrchestratorOp::ReplaceDeployment;
                let call = self.orchestrator.replace_deployment(&actor, &ns, &deployment.name, created.version, &created.spec);
                if let Err(e) = self.remote(ctx, op, call).await {
                    return Err(self.compensate(op, e, |tx| {
                        tx.delete_version(created.id)?;
                        tx.set_active(deployment.id, prior_active)?;
                        Ok(())
                    }));
                }
                info!(parent: &self.span, deployment = %deployment.id, version = %created.version, "deployments: new version active");
                created
            }
            Change::InPlace { before, after } => {
                // On the active version an in-place change is replicas only.
                let (op, res) = if before.active {
                    let op = OrchestratorOp::SetReplicas;
                    let call = self.orchestrator.set_replicas(&actor, &ns, &deployment.name, after.spec.replicas);
                    (op, self.remote(ctx, op, call).await)
                } else {
                    let op = OrchestratorOp::ReplaceDeployment;
                    let call = self.orchestrator.replace_deployment(&actor, &ns, &deployment.name, after.version, &after.spec);
                    (op, self.remote(ctx, op, call).await)
                };
                if let Err(e) = res {
                    return Err(self.compensate(op, e, |tx| {
                        tx.update_version_spec(before.id, &before.spec)?;
                        tx.set_active(deployment.id, prior_active)?;
                        Ok(())
                    }));
                }
                info!(parent: &self.span, deployment = %deployment.id, version = %after.version, "deployments: updated in place");
                after
            }
        };
        Ok(DeploymentView { deployment, active: Some(active) })
    }

    /// Rewrites the replica count of the active version.
    pub async fn set_replicas(&self, ctx: &RequestCtx, ns_label: &str, name: &str, replicas: u32) -> KeelResult<DeploymentView> {
        let actor = ctx.actor;
        validate_replicas(replicas)?;
        let (ns, deployment, before) = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let active = tx
                .active_version(deployment.id)?
                .ok_or_else(|| KeelError::Validation(format!("deployment {} has no active version", name)))?;
            let usage = self.quota.usage(tx, ns.id)?;
            self.quota.check_replica_change(&ns.limits, &usage, &active.spec, replicas)?;
            if active.spec.replicas != replicas {
                let spec = DeploymentSpec { replicas, ..active.spec.clone() };
                tx.update_version_spec(active.id, &spec)?;
            }
            Ok((ns, deployment, active))
        })?;
        if before.spec.replicas == replicas {
            return Ok(DeploymentView { deployment, active: Some(before) });
        }

        let op = OrchestratorOp::SetReplicas;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.set_replicas(&actor, &ns, name, replicas)).await {
            return Err(self.compensate(op, e, |tx| Ok(tx.update_version_spec(before.id, &before.spec)?)));
        }
        info!(parent: &self.span, deployment = %deployment.id, from = before.spec.replicas, to = replicas, "deployments: scaled");
        let spec = DeploymentSpec { replicas, ..before.spec.clone() };
        Ok(DeploymentView { deployment, active: Some(Version { spec, ..before }) })
    }

    /// Makes an existing version the active one and pushes its spec.
    pub async fn change_active_version(
        &self,
        ctx: &RequestCtx,
        ns_label: &str,
        name: &str,
        version: SemVer,
    ) -> KeelResult<DeploymentView> {
        let actor = ctx.actor;
        let (ns, deployment, prior_active, target) = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let history = self.versions.history(tx, deployment.id)?;
            let target = history.get(version)?.clone();
            let prior = history.active().cloned();
            if !target.active {
                let usage = self.quota.usage(tx, ns.id)?;
                match &prior {
                    Some(active) => self.quota.check_replace(&ns.limits, &usage, &active.spec, &target.spec)?,
                    None => self.quota.check_create(&ns.limits, &usage, &target.spec)?,
                }
                self.versions.activate(tx, deployment.id, Some(&target))?;
            }
            Ok((ns, deployment, prior.map(|v| v.id), target))
        })?;
        if target.active {
            return Ok(DeploymentView { deployment, active: Some(target) });
        }

        let op = OrchestratorOp::ReplaceDeployment;
        let call = self.orchestrator.replace_deployment(&actor, &ns, name, target.version, &target.spec);
        if let Err(e) = self.remote(ctx, op, call).await {
            return Err(self.compensate(op, e, |tx| Ok(tx.set_active(deployment.id, prior_active)?)));
        }
        info!(parent: &self.span, deployment = %deployment.id, version = %target.version, "deployments: active version changed");
        Ok(DeploymentView { deployment, active: Some(Version { active: true, ..target }) })
    }

    pub async fn delete_deployment(&self, ctx: &RequestCtx, ns_label: &str, name: &str) -> KeelResult<()> {
        let actor = ctx.actor;
        let (ns, deployment) = self.tx(|tx| {
            let ns = self.namespace_for(tx, &actor, ns_label, AccessLevel::ReadWrite)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            tx.soft_delete_deployment(deployment.id, now())?;
            Ok((ns, deployment))
        })?;

        let op = OrchestratorOp::DeleteDeployment;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.delete_deployment(&actor, &ns, name)).await {
            return Err(self.compensate(op, e, |tx| Ok(tx.restore_deployment(deployment.id)?)));
        }
        info!(parent: &self.span, deployment = %deployment.id, "deployments: deleted");
        Ok(())
    }

    /// Removes an inactive version. The active version cannot be deleted.
    pub fn delete_version(&self, ctx: &RequestCtx, ns_label: &str, name: &str, version: SemVer) -> KeelResult<()> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::ReadWrite)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let history = self.versions.history(tx, deployment.id)?;
            let target = history.check_delete(version)?;
            tx.delete_version(target.id)?;
            info!(parent: &self.span, deployment = %deployment.id, %version, "deployments: version deleted");
            Ok(())
        })
    }

    /// Renumbers a version; the new number must keep history order.
    pub fn rename_version(
        &self,
        ctx: &RequestCtx,
        ns_label: &str,
        name: &str,
        from: SemVer,
        to: SemVer,
    ) -> KeelResult<Version> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::ReadWrite)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let history = self.versions.history(tx, deployment.id)?;
            let target = history.check_rename(from, to)?.clone();
            if from != to {
                tx.rename_version(target.id, to)?;
            }
            Ok(Version { version: to, ..target })
        })
    }

    pub fn diff_versions(&self, ctx: &RequestCtx, ns_label: &str, name: &str, a: SemVer, b: SemVer) -> KeelResult<VersionDiff> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let history = self.versions.history(tx, deployment.id)?;
            Ok(self.versions.diff(history.get(a)?, history.get(b)?))
        })
    }

    /// Diff from the version before `version` to `version`.
    pub fn diff_previous(&self, ctx: &RequestCtx, ns_label: &str, name: &str, version: SemVer) -> KeelResult<VersionDiff> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let history = self.versions.history(tx, deployment.id)?;
            let current = history.get(version)?;
            let previous = history
                .previous(version)?
                .ok_or_else(|| KeelError::not_found(format!("version before {}", version)))?;
            Ok(self.versions.diff(previous, current))
        })
    }

    pub fn get_deployment(&self, ctx: &RequestCtx, ns_label: &str, name: &str) -> KeelResult<DeploymentView> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            let active = tx.active_version(deployment.id)?;
            Ok(DeploymentView { deployment, active })
        })
    }

    pub fn list_deployments(&self, ctx: &RequestCtx, ns_label: &str) -> KeelResult<Vec<DeploymentView>> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            let mut out = Vec::new();
            for deployment in tx.deployments_in(ns.id)? {
                let active = tx.active_version(deployment.id)?;
                out.push(DeploymentView { deployment, active });
            }
            Ok(out)
        })
    }

    /// All versions in history order.
    pub fn list_versions(&self, ctx: &RequestCtx, ns_label: &str, name: &str) -> KeelResult<Vec<Version>> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            let deployment = Self::deployment_in(tx, &ns, name)?;
            Ok(self.versions.history(tx, deployment.id)?.versions().to_vec())
        })
    }
}
