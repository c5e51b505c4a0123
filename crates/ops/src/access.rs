//! Sharing and restriction of namespaces and volumes.

use keel_core::{AccessLevel, AccessRecord, KeelResult, ResourceKind, UserId};

use crate::{Coordinator, RequestCtx};

impl Coordinator {
    /// Shares a resource the actor owns. `level` must be read or readwrite.
    pub fn grant_access(
        &self,
        ctx: &RequestCtx,
        kind: ResourceKind,
        label: &str,
        subject: UserId,
        level: AccessLevel,
    ) -> KeelResult<AccessRecord> {
        self.tx(|tx| self.permissions.grant_access(tx, &ctx.actor, kind, label, subject, level))
    }

    pub fn revoke_access(&self, ctx: &RequestCtx, kind: ResourceKind, label: &str, subject: UserId) -> KeelResult<()> {
        self.tx(|tx| self.permissions.revoke_access(tx, &ctx.actor, kind, label, subject))
    }

    /// Administrative ceiling on everything `owner` owns (of one kind, or
    /// all kinds). Raising the ceiling again restores the granted levels.
    pub fn restrict_all_access(
        &self,
        ctx: &RequestCtx,
        owner: UserId,
        kind: Option<ResourceKind>,
        ceiling: AccessLevel,
    ) -> KeelResult<usize> {
        self.require_admin(ctx, "restricting access")?;
        self.tx(|tx| self.permissions.restrict_all_access(tx, owner, kind, ceiling))
    }

    /// Every record on a resource; owner only.
    pub fn resource_accesses(&self, ctx: &RequestCtx, kind: ResourceKind, label: &str) -> KeelResult<Vec<AccessRecord>> {
        self.tx(|tx| self.permissions.resource_accesses(tx, &ctx.actor, kind, label))
    }

    /// Records the actor holds on live resources.
    pub fn my_accesses(&self, ctx: &RequestCtx) -> KeelResult<Vec<AccessRecord>> {
        self.tx(|tx| self.permissions.user_accesses(tx, ctx.actor.id))
    }

    /// Whether the actor reaches `level` on the resource it knows as `label`.
    pub fn authorize(&self, ctx: &RequestCtx, kind: ResourceKind, label: &str, level: AccessLevel) -> KeelResult<bool> {
        self.tx(|tx| match tx.access_by_label(ctx.actor.id, kind, label)? {
            Some(rec) => Ok(self.permissions.authorize(tx, &ctx.actor, kind, rec.resource_id, level)?),
            None => Ok(false),
        })
    }
}
