//! Namespace lifecycle.

use tracing::info;
use uuid::Uuid;

use keel_core::{
    now, validate_name, AccessLevel, AccessRecord, KeelError, KeelResult, Namespace, ResourceCounts, ResourceId,
    ResourceKind, Usage,
};
use keel_kubehub::OrchestratorOp;

use crate::{Coordinator, NamespaceView, RequestCtx};

/// Everything an owner's delete touched, kept to undo it.
struct Removal {
    ns: Namespace,
    deployments: Vec<ResourceId>,
    ingresses: Vec<ResourceId>,
    volumes: Vec<ResourceId>,
    accesses: Vec<AccessRecord>,
}

impl Coordinator {
    /// Creates the local namespace and owner record, then the remote
    /// namespace with a quota built from the tariff.
    pub async fn create_namespace(&self, ctx: &RequestCtx, label: &str, tariff_id: &str) -> KeelResult<NamespaceView> {
        validate_name("namespace label", label)?;
        let limits = self.tariffs.limits(tariff_id)?;
        let actor = ctx.actor;
        let (ns, rec) = self.tx(|tx| {
            if tx.access_by_label(actor.id, ResourceKind::Namespace, label)?.is_some() {
                return Err(KeelError::AlreadyExists(format!("namespace {}", label)));
            }
            let ns = Namespace {
                id: Uuid::new_v4(),
                owner: actor.id,
                label: label.to_string(),
                limits,
                tariff_id: Some(tariff_id.to_string()),
                created_at: now(),
                deleted: false,
                delete_time: None,
            };
            tx.insert_namespace(&ns)?;
            let rec = self.permissions.create_owner_record(tx, ResourceKind::Namespace, ns.id, label, actor.id)?;
            Ok((ns, rec))
        })?;

        let op = OrchestratorOp::CreateNamespace;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.create_namespace(&actor, &ns)).await {
            return Err(self.compensate(op, e, |tx| {
                tx.delete_access(rec.id)?;
                tx.purge_namespace(ns.id)?;
                Ok(())
            }));
        }
        info!(parent: &self.span, ns = %ns.id, label, tariff = tariff_id, "namespaces: created");
        Ok(NamespaceView { label: rec.resource_label, access: rec.new_access_level, namespace: ns })
    }

    /// Switches the namespace to another tariff. Rejected when current usage
    /// would not fit the new limits.
    pub async fn resize_namespace(&self, ctx: &RequestCtx, label: &str, tariff_id: &str) -> KeelResult<Namespace> {
        let limits = self.tariffs.limits(tariff_id)?;
        let actor = ctx.actor;
        let (before, after) = self.tx(|tx| {
            let rec = self.permissions.require_owner(tx, &actor, ResourceKind::Namespace, label, AccessLevel::ReadWrite)?;
            let before = tx
                .namespace(rec.resource_id)?
                .ok_or_else(|| KeelError::not_found(format!("namespace {}", label)))?;
            let usage = self.quota.usage(tx, before.id)?;
            self.quota.check_limits_cover(&limits, &usage)?;
            tx.set_namespace_limits(before.id, &limits, Some(tariff_id))?;
            let after = Namespace { limits, tariff_id: Some(tariff_id.to_string()), ..before.clone() };
            Ok((before, after))
        })?;

        let op = OrchestratorOp::SetNamespaceQuota;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.set_namespace_quota(&actor, &after)).await {
            return Err(self.compensate(op, e, |tx| {
                tx.set_namespace_limits(before.id, &before.limits, before.tariff_id.as_deref())?;
                Ok(())
            }));
        }
        info!(parent: &self.span, ns = %after.id, tariff = tariff_id, "namespaces: resized");
        Ok(after)
    }

    /// Renames the actor's label for a namespace. The owner's rename also
    /// changes the namespace's own label; other users only relabel their view.
    pub fn rename_namespace(&self, ctx: &RequestCtx, label: &str, new_label: &str) -> KeelResult<NamespaceView> {
        validate_name("namespace label", new_label)?;
        let actor = ctx.actor;
        self.tx(|tx| {
            let rec = self.permissions.require(tx, &actor, ResourceKind::Namespace, label, AccessLevel::Read)?;
            if label == new_label {
                let namespace = self.namespace_for(tx, &actor, label, AccessLevel::Read)?;
                return Ok(NamespaceView { label: rec.resource_label, access: rec.new_access_level, namespace });
            }
            if tx.access_by_label(actor.id, ResourceKind::Namespace, new_label)?.is_some() {
                return Err(KeelError::AlreadyExists(format!("namespace {}", new_label)));
            }
            tx.relabel_access(rec.id, new_label)?;
            let mut namespace = tx
                .namespace(rec.resource_id)?
                .ok_or_else(|| KeelError::not_found(format!("namespace {}", label)))?;
            if rec.is_owner_record() {
                tx.rename_namespace(namespace.id, new_label)?;
                namespace.label = new_label.to_string();
            }
            info!(parent: &self.span, ns = %namespace.id, from = label, to = new_label, "namespaces: renamed");
            Ok(NamespaceView { label: new_label.to_string(), access: rec.new_access_level, namespace })
        })
    }

    /// The owner deletes the namespace with its deployments and ingresses;
    /// anyone else only gives up their own access.
    ///
    /// Attached persistent volumes block the delete until detached. Other
    /// attached volumes are detached with it.
    pub async fn delete_namespace(&self, ctx: &RequestCtx, label: &str) -> KeelResult<()> {
        let actor = ctx.actor;
        let removal = self.tx(|tx| {
            let rec = self.permissions.require(tx, &actor, ResourceKind::Namespace, label, AccessLevel::Read)?;
            if !rec.is_owner_record() {
                tx.delete_access(rec.id)?;
                return Ok(None);
            }
            self.permissions.require_level(&actor, &rec, AccessLevel::ReadWrite)?;
            let ns = tx
                .namespace(rec.resource_id)?
                .ok_or_else(|| KeelError::not_found(format!("namespace {}", label)))?;
            let volumes = tx.volumes_of_namespace(ns.id)?;
            if let Some(v) = volumes.iter().find(|v| v.persistent) {
                return Err(KeelError::Validation(format!(
                    "namespace {} has persistent volume {} attached; detach it first",
                    label, v.label
                )));
            }
            let at = now();
            let deployments: Vec<ResourceId> = tx.deployments_in(ns.id)?.into_iter().map(|d| d.id).collect();
            for id in &deployments {
                tx.soft_delete_deployment(*id, at)?;
            }
            let ingresses: Vec<ResourceId> = tx.ingresses_in(ns.id)?.into_iter().map(|i| i.id).collect();
            for id in &ingresses {
                tx.soft_delete_ingress(*id, at)?;
            }
            let volumes: Vec<ResourceId> = volumes.into_iter().map(|v| v.id).collect();
            for id in &volumes {
                tx.detach_volume(ns.id, *id)?;
            }
            let accesses = tx.accesses_for_resource(ResourceKind::Namespace, ns.id)?;
            tx.delete_resource_accesses(ResourceKind::Namespace, ns.id)?;
            tx.soft_delete_namespace(ns.id, at)?;
            Ok(Some(Removal { ns, deployments, ingresses, volumes, accesses }))
        })?;

        let Some(r) = removal else {
            info!(parent: &self.span, user = %actor.id, label, "namespaces: access given up");
            return Ok(());
        };
        let op = OrchestratorOp::DeleteNamespace;
        if let Err(e) = self.remote(ctx, op, self.orchestrator.delete_namespace(&actor, &r.ns)).await {
            return Err(self.compensate(op, e, |tx| {
                tx.restore_namespace(r.ns.id)?;
                for a in &r.accesses {
                    tx.upsert_access(a)?;
                }
                for id in &r.volumes {
                    tx.attach_volume(r.ns.id, *id)?;
                }
                for id in &r.deployments {
                    tx.restore_deployment(*id)?;
                }
                for id in &r.ingresses {
                    tx.restore_ingress(*id)?;
                }
                Ok(())
            }));
        }
        info!(
            parent: &self.span,
            ns = %r.ns.id,
            deployments = r.deployments.len(),
            ingresses = r.ingresses.len(),
            "namespaces: deleted"
        );
        Ok(())
    }

    pub fn get_namespace(&self, ctx: &RequestCtx, label: &str) -> KeelResult<NamespaceView> {
        self.tx(|tx| {
            let rec = self.permissions.require(tx, &ctx.actor, ResourceKind::Namespace, label, AccessLevel::Read)?;
            let namespace = tx
                .namespace(rec.resource_id)?
                .ok_or_else(|| KeelError::not_found(format!("namespace {}", label)))?;
            Ok(NamespaceView { label: rec.resource_label, access: rec.new_access_level, namespace })
        })
    }

    /// Namespaces the actor can see, owned or shared.
    pub fn list_namespaces(&self, ctx: &RequestCtx) -> KeelResult<Vec<NamespaceView>> {
        self.tx(|tx| {
            let mut out = Vec::new();
            for rec in self.permissions.user_accesses(tx, ctx.actor.id)? {
                if rec.kind != ResourceKind::Namespace {
                    continue;
                }
                if let Some(namespace) = tx.namespace(rec.resource_id)? {
                    out.push(NamespaceView { label: rec.resource_label, access: rec.new_access_level, namespace });
                }
            }
            out.sort_by(|a, b| a.label.cmp(&b.label));
            Ok(out)
        })
    }

    pub fn namespace_usage(&self, ctx: &RequestCtx, label: &str) -> KeelResult<Usage> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, label, AccessLevel::Read)?;
            Ok(self.quota.usage(tx, ns.id)?)
        })
    }

    /// Live resources the actor owns.
    pub fn resource_counts(&self, ctx: &RequestCtx) -> KeelResult<ResourceCounts> {
        self.tx(|tx| Ok(tx.resource_counts(ctx.actor.id)?))
    }
}
