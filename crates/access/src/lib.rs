//! Keel permission engine.
//!
//! Every owned resource has one owner record (`subject == owner`). Its
//! `access_level` is always `Owner`; its `new_access_level` is the owner's
//! current ceiling for that resource. Shared records keep the granted level
//! in `access_level` and the effective level, clamped to the ceiling, in
//! `new_access_level`. Lifting the ceiling restores the granted level.
//!
//! All functions take an open [`Tx`]; grants and restrictions are atomic with
//! whatever else the caller does in that transaction.

#![forbid(unsafe_code)]

use metrics::counter;
use tracing::{debug, info, Span};
use uuid::Uuid;

use keel_core::{now, AccessLevel, AccessRecord, Actor, KeelError, KeelResult, ResourceId, ResourceKind, StoreError, UserId};
use keel_persist::Tx;

/// Effective level of a record granted `granted` under an owner ceiling.
/// Returns the clamped level and whether clamping happened.
pub fn effective_level(granted: AccessLevel, ceiling: AccessLevel) -> (AccessLevel, bool) {
    if granted > ceiling {
        (ceiling, true)
    } else {
        (granted, false)
    }
}

pub struct PermissionEngine {
    span: Span,
}

impl Default for PermissionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionEngine {
    pub fn new() -> Self {
        Self { span: tracing::info_span!("permissions", component = "permission_engine") }
    }

    fn resource_live(tx: &Tx<'_>, kind: ResourceKind, id: ResourceId) -> Result<bool, StoreError> {
        Ok(match kind {
            ResourceKind::Namespace => tx.namespace(id)?.is_some(),
            ResourceKind::Volume => tx.volume(id)?.is_some(),
        })
    }

    /// True iff the actor's effective level on a live resource reaches `required`.
    /// Never writes.
    pub fn authorize(
        &self,
        tx: &Tx<'_>,
        actor: &Actor,
        kind: ResourceKind,
        resource_id: ResourceId,
        required: AccessLevel,
    ) -> Result<bool, StoreError> {
        let Some(rec) = tx.access(kind, resource_id, actor.id)? else { return Ok(false) };
        if rec.new_access_level < required {
            return Ok(false);
        }
        Self::resource_live(tx, kind, resource_id)
    }

    /// Resolves the resource the actor knows under `label` and checks the level.
    ///
    /// Unknown labels and soft-deleted resources are `NotFound`; a known
    /// resource with too low a level is `PermissionDenied`.
    pub fn require(
        &self,
        tx: &Tx<'_>,
        actor: &Actor,
        kind: ResourceKind,
        label: &str,
        required: AccessLevel,
    ) -> KeelResult<AccessRecord> {
        let rec = tx
            .access_by_label(actor.id, kind, label)?
            .ok_or_else(|| KeelError::not_found(format!("{} {}", kind, label)))?;
        if !Self::resource_live(tx, kind, rec.resource_id)? {
            return Err(KeelError::not_found(format!("{} {}", kind, label)));
        }
        self.require_level(actor, &rec, required)?;
        Ok(rec)
    }

    /// Fails with `PermissionDenied` when `rec` grants less than `required`.
    pub fn require_level(&self, actor: &Actor, rec: &AccessRecord, required: AccessLevel) -> KeelResult<()> {
        if rec.new_access_level >= required {
            return Ok(());
        }
        let kind = rec.kind;
        let _e = self.span.enter();
        debug!(actor = %actor.id, %kind, label = %rec.resource_label, have = %rec.new_access_level, need = %required, "permissions: denied");
        counter!("permission_denied_total", 1, "kind" => kind.as_str());
        Err(KeelError::denied(format!(
            "{} {} requires {} access, have {}",
            kind, rec.resource_label, required, rec.new_access_level
        )))
    }

    /// Same as [`require`](Self::require) but only the owner passes. Owner-only
    /// mutations ask for `ReadWrite`, so a restricted owner keeps just the listings.
    pub fn require_owner(
        &self,
        tx: &Tx<'_>,
        actor: &Actor,
        kind: ResourceKind,
        label: &str,
        required: AccessLevel,
    ) -> KeelResult<AccessRecord> {
        let rec = self.require(tx, actor, kind, label, AccessLevel::Read)?;
        if !rec.is_owner_record() {
            return Err(KeelError::denied(format!("{} {} is owned by another user", kind, label)));
        }
        self.require_level(actor, &rec, required)?;
        Ok(rec)
    }

    /// The owner's standing ceiling for `kind`; `Owner` unless restricted.
    /// Survives the deletion of every resource the owner had.
    pub fn owner_ceiling(&self, tx: &Tx<'_>, owner: UserId, kind: ResourceKind) -> Result<AccessLevel, StoreError> {
        Ok(tx.owner_ceiling(owner, kind)?.unwrap_or(AccessLevel::Owner))
    }

    /// Writes the owner record for a freshly created resource. A restricted
    /// owner's new resources inherit the restriction.
    pub fn create_owner_record(
        &self,
        tx: &Tx<'_>,
        kind: ResourceKind,
        resource_id: ResourceId,
        label: &str,
        owner: UserId,
    ) -> KeelResult<AccessRecord> {
        let ceiling = self.owner_ceiling(tx, owner, kind)?;
        let rec = AccessRecord {
            id: Uuid::new_v4(),
            kind,
            resource_id,
            resource_label: label.to_string(),
            subject: owner,
            owner,
            access_level: AccessLevel::Owner,
            new_access_level: ceiling,
            limited: ceiling < AccessLevel::Owner,
            changed_at: now(),
        };
        tx.upsert_access(&rec)?;
        Ok(rec)
    }

    /// Creates or replaces `subject`'s record on a resource the actor owns.
    pub fn grant_access(
        &self,
        tx: &Tx<'_>,
        actor: &Actor,
        kind: ResourceKind,
        label: &str,
        subject: UserId,
        level: AccessLevel,
    ) -> KeelResult<AccessRecord> {
        let owner_rec = self.require_owner(tx, actor, kind, label, AccessLevel::ReadWrite)?;
        if subject == owner_rec.owner {
            return Err(KeelError::Validation("cannot change the owner's own access".into()));
        }
        if level == AccessLevel::None || level == AccessLevel::Owner {
            return Err(KeelError::Validation(format!("cannot grant {} access; use read or readwrite", level)));
        }
        let (effective, limited) = effective_level(level, owner_rec.new_access_level);
        let id = tx
            .access(kind, owner_rec.resource_id, subject)?
            .map(|r| r.id)
            .unwrap_or_else(Uuid::new_v4);
        let rec = AccessRecord {
            id,
            kind,
            resource_id: owner_rec.resource_id,
            resource_label: owner_rec.resource_label.clone(),
            subject,
            owner: owner_rec.owner,
            access_level: level,
            new_access_level: effective,
            limited,
            changed_at: now(),
        };
        tx.upsert_access(&rec)?;
        let _e = self.span.enter();
        info!(%kind, resource = %rec.resource_id, %subject, granted = %level, effective = %effective, limited, "permissions: access granted");
        Ok(rec)
    }

    /// Removes `subject`'s record on a resource the actor owns.
    pub fn revoke_access(&self, tx: &Tx<'_>, actor: &Actor, kind: ResourceKind, label: &str, subject: UserId) -> KeelResult<()> {
        let owner_rec = self.require_owner(tx, actor, kind, label, AccessLevel::ReadWrite)?;
        if subject == owner_rec.owner {
            return Err(KeelError::Validation("cannot revoke the owner's access".into()));
        }
        let rec = tx
            .access(kind, owner_rec.resource_id, subject)?
            .ok_or_else(|| KeelError::not_found(format!("access of {} to {} {}", subject, kind, label)))?;
        tx.delete_access(rec.id)?;
        let _e = self.span.enter();
        info!(%kind, resource = %rec.resource_id, %subject, "permissions: access revoked");
        Ok(())
    }

    /// Sets the owner's ceiling on every resource they own (of `kind`, or all
    /// kinds) and re-clamps every shared record in the same transaction.
    /// The ceiling is stored per owner and kind, so resources created later
    /// inherit it. Returns the number of records whose stored levels changed.
    pub fn restrict_all_access(
        &self,
        tx: &Tx<'_>,
        owner: UserId,
        kind: Option<ResourceKind>,
        ceiling: AccessLevel,
    ) -> KeelResult<usize> {
        let at = now();
        for k in kind.map_or(ResourceKind::ALL.to_vec(), |k| vec![k]) {
            tx.set_owner_ceiling(owner, k, ceiling, at)?;
        }
        let mut changed = 0usize;
        for rec in tx.accesses_owned_by(owner, kind)? {
            let granted = if rec.is_owner_record() { AccessLevel::Owner } else { rec.access_level };
            let (effective, limited) = effective_level(granted, ceiling);
            if effective != rec.new_access_level || limited != rec.limited {
                tx.set_effective_access(rec.id, effective, limited, at)?;
                changed += 1;
            }
        }
        let _e = self.span.enter();
        info!(%owner, kind = ?kind, %ceiling, changed, "permissions: owner ceiling set");
        counter!("permission_restrict_total", 1);
        Ok(changed)
    }

    /// All records on a resource; only its owner may list them.
    pub fn resource_accesses(&self, tx: &Tx<'_>, actor: &Actor, kind: ResourceKind, label: &str) -> KeelResult<Vec<AccessRecord>> {
        let owner_rec = self.require_owner(tx, actor, kind, label, AccessLevel::Read)?;
        Ok(tx.accesses_for_resource(kind, owner_rec.resource_id)?)
    }

    /// Records the user holds, hiding resources that were soft-deleted.
    pub fn user_accesses(&self, tx: &Tx<'_>, user: UserId) -> KeelResult<Vec<AccessRecord>> {
        let mut out = Vec::new();
        for rec in tx.accesses_of_subject(user)? {
            if Self::resource_live(tx, rec.kind, rec.resource_id)? {
                out.push(rec);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_is_min_with_flag() {
        use AccessLevel::*;
        assert_eq!(effective_level(ReadWrite, Read), (Read, true));
        assert_eq!(effective_level(Read, ReadWrite), (Read, false));
        assert_eq!(effective_level(Read, Read), (Read, false));
        assert_eq!(effective_level(Owner, None), (None, true));
    }
}
