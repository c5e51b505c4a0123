//! Volume records. Storage backends provision volumes outside the
//! orchestrator, so every operation here is local.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use keel_core::{now, validate_name, AccessLevel, AccessRecord, KeelError, KeelResult, ResourceKind, Volume};
use keel_persist::Tx;

use crate::{Coordinator, RequestCtx};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeView {
    pub label: String,
    pub access: AccessLevel,
    pub volume: Volume,
}

impl Coordinator {
    fn volume_for(&self, tx: &Tx<'_>, ctx: &RequestCtx, label: &str, level: AccessLevel) -> KeelResult<(AccessRecord, Volume)> {
        let rec = self.permissions.require(tx, &ctx.actor, ResourceKind::Volume, label, level)?;
        let volume = tx.volume(rec.resource_id)?.ok_or_else(|| KeelError::not_found(format!("volume {}", label)))?;
        Ok((rec, volume))
    }

    pub fn create_volume(
        &self,
        ctx: &RequestCtx,
        label: &str,
        capacity: u64,
        replicas: u32,
        persistent: bool,
    ) -> KeelResult<VolumeView> {
        validate_name("volume label", label)?;
        if capacity == 0 || replicas == 0 {
            return Err(KeelError::Validation("volume capacity and replicas must be positive".into()));
        }
        let owner = ctx.actor.id;
        self.tx(|tx| {
            if tx.access_by_label(owner, ResourceKind::Volume, label)?.is_some() {
                return Err(KeelError::AlreadyExists(format!("volume {}", label)));
            }
            let volume = Volume {
                id: Uuid::new_v4(),
                owner,
                label: label.to_string(),
                capacity,
                replicas,
                persistent,
                created_at: now(),
                deleted: false,
                delete_time: None,
            };
            tx.insert_volume(&volume)?;
            let rec = self.permissions.create_owner_record(tx, ResourceKind::Volume, volume.id, label, owner)?;
            info!(parent: &self.span, volume = %volume.id, label, capacity, persistent, "volumes: created");
            Ok(VolumeView { label: rec.resource_label, access: rec.new_access_level, volume })
        })
    }

    pub fn rename_volume(&self, ctx: &RequestCtx, label: &str, new_label: &str) -> KeelResult<VolumeView> {
        validate_name("volume label", new_label)?;
        self.tx(|tx| {
            let (rec, mut volume) = self.volume_for(tx, ctx, label, AccessLevel::Read)?;
            if label != new_label {
                if tx.access_by_label(ctx.actor.id, ResourceKind::Volume, new_label)?.is_some() {
                    return Err(KeelError::AlreadyExists(format!("volume {}", new_label)));
                }
                tx.relabel_access(rec.id, new_label)?;
                if rec.is_owner_record() {
                    tx.rename_volume(volume.id, new_label)?;
                    volume.label = new_label.to_string();
                }
            }
            Ok(VolumeView { label: new_label.to_string(), access: rec.new_access_level, volume })
        })
    }

    /// Grows a volume or changes its replica count. Volumes never shrink.
    pub fn resize_volume(&self, ctx: &RequestCtx, label: &str, capacity: u64, replicas: u32) -> KeelResult<VolumeView> {
        if replicas == 0 {
            return Err(KeelError::Validation("volume replicas must be positive".into()));
        }
        self.tx(|tx| {
            let rec = self.permissions.require_owner(tx, &ctx.actor, ResourceKind::Volume, label, AccessLevel::ReadWrite)?;
            let (_, volume) = self.volume_for(tx, ctx, label, AccessLevel::Read)?;
            if capacity < volume.capacity {
                return Err(KeelError::Validation(format!(
                    "volume {} cannot shrink from {} to {}",
                    label, volume.capacity, capacity
                )));
            }
            tx.resize_volume(volume.id, capacity, replicas)?;
            info!(parent: &self.span, volume = %volume.id, capacity, replicas, "volumes: resized");
            Ok(VolumeView { label: rec.resource_label, access: rec.new_access_level, volume: Volume { capacity, replicas, ..volume } })
        })
    }

    /// The owner deletes a detached volume; anyone else gives up their access.
    pub fn delete_volume(&self, ctx: &RequestCtx, label: &str) -> KeelResult<()> {
        self.tx(|tx| {
            let (rec, volume) = self.volume_for(tx, ctx, label, AccessLevel::Read)?;
            if !rec.is_owner_record() {
                tx.delete_access(rec.id)?;
                return Ok(());
            }
            self.permissions.require_level(&ctx.actor, &rec, AccessLevel::ReadWrite)?;
            let attached = tx.namespaces_of_volume(volume.id)?;
            if !attached.is_empty() {
                return Err(KeelError::Validation(format!(
                    "volume {} is attached to {} namespace(s); detach it first",
                    label,
                    attached.len()
                )));
            }
            tx.delete_resource_accesses(ResourceKind::Volume, volume.id)?;
            tx.soft_delete_volume(volume.id, now())?;
            info!(parent: &self.span, volume = %volume.id, "volumes: deleted");
            Ok(())
        })
    }

    /// Attaching needs write access to both sides.
    pub fn attach_volume(&self, ctx: &RequestCtx, ns_label: &str, label: &str) -> KeelResult<()> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::ReadWrite)?;
            let (_, volume) = self.volume_for(tx, ctx, label, AccessLevel::ReadWrite)?;
            tx.attach_volume(ns.id, volume.id)?;
            info!(parent: &self.span, ns = %ns.id, volume = %volume.id, "volumes: attached");
            Ok(())
        })
    }

    pub fn detach_volume(&self, ctx: &RequestCtx, ns_label: &str, label: &str) -> KeelResult<()> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::ReadWrite)?;
            let (_, volume) = self.volume_for(tx, ctx, label, AccessLevel::ReadWrite)?;
            if !tx.detach_volume(ns.id, volume.id)? {
                return Err(KeelError::not_found(format!("volume {} in namespace {}", label, ns_label)));
            }
            info!(parent: &self.span, ns = %ns.id, volume = %volume.id, "volumes: detached");
            Ok(())
        })
    }

    pub fn get_volume(&self, ctx: &RequestCtx, label: &str) -> KeelResult<VolumeView> {
        self.tx(|tx| {
            let (rec, volume) = self.volume_for(tx, ctx, label, AccessLevel::Read)?;
            Ok(VolumeView { label: rec.resource_label, access: rec.new_access_level, volume })
        })
    }

    pub fn list_volumes(&self, ctx: &RequestCtx) -> KeelResult<Vec<VolumeView>> {
        self.tx(|tx| {
            let mut out = Vec::new();
            for rec in self.permissions.user_accesses(tx, ctx.actor.id)? {
                if rec.kind != ResourceKind::Volume {
                    continue;
                }
                if let Some(volume) = tx.volume(rec.resource_id)? {
                    out.push(VolumeView { label: rec.resource_label, access: rec.new_access_level, volume });
                }
            }
            out.sort_by(|a, b| a.label.cmp(&b.label));
            Ok(out)
        })
    }

    /// Volumes attached to a namespace.
    pub fn namespace_volumes(&self, ctx: &RequestCtx, ns_label: &str) -> KeelResult<Vec<Volume>> {
        self.tx(|tx| {
            let ns = self.namespace_for(tx, &ctx.actor, ns_label, AccessLevel::Read)?;
            Ok(tx.volumes_of_namespace(ns.id)?)
        })
    }
}
