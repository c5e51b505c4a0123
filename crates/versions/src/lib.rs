//! Keel version manager.
//!
//! A deployment's configuration is a linear history of immutable versions.
//! Updates are classified against the base version:
//!
//! | change | result |
//! |---|---|
//! | container name sequence differs | major bump |
//! | any container image differs | minor bump |
//! | any other field except replicas differs | patch bump |
//! | identical, or replicas only | in place, no new version |

#![forbid(unsafe_code)]

mod diff;
mod history;

use serde::{Deserialize, Serialize};
use tracing::{debug, Span};
use uuid::Uuid;

use keel_core::{now, DeploymentSpec, KeelResult, ResourceId, SemVer, Version};
use keel_persist::Tx;

pub use diff::{diff_specs, DiffSummary, VersionDiff};
pub use history::{Activation, Plan, VersionHistory};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Bump {
    InPlace,
    Patch,
    Minor,
    Major,
}

/// Total over all pairs of specs; see the crate docs for the rule.
pub fn classify(current: &DeploymentSpec, proposed: &DeploymentSpec) -> Bump {
    let names = |s: &DeploymentSpec| s.containers.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    if names(current) != names(proposed) {
        return Bump::Major;
    }
    if current.containers.iter().zip(&proposed.containers).any(|(a, b)| a.image != b.image) {
        return Bump::Minor;
    }
    let mut aligned = proposed.clone();
    aligned.replicas = current.replicas;
    if &aligned != current {
        Bump::Patch
    } else {
        Bump::InPlace
    }
}

/// `Ok(None)` for in-place changes; an error once `highest` cannot grow.
pub fn next_version(highest: SemVer, bump: Bump) -> KeelResult<Option<SemVer>> {
    Ok(match bump {
        Bump::InPlace => None,
        Bump::Patch => Some(highest.bump_patch()?),
        Bump::Minor => Some(highest.bump_minor()?),
        Bump::Major => Some(highest.bump_major()?),
    })
}

/// Reads and writes version rows inside the caller's transaction.
pub struct VersionManager {
    span: Span,
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionManager {
    pub fn new() -> Self {
        Self { span: tracing::info_span!("versions", component = "version_manager") }
    }

    pub fn history(&self, tx: &Tx<'_>, deployment_id: ResourceId) -> KeelResult<VersionHistory> {
        VersionHistory::load(deployment_id, tx.versions(deployment_id)?)
    }

    /// Inserts a new version row; when `activate` is set it becomes the only
    /// active version in the same transaction.
    pub fn append(
        &self,
        tx: &Tx<'_>,
        deployment_id: ResourceId,
        number: SemVer,
        spec: &DeploymentSpec,
        activate: bool,
    ) -> KeelResult<Version> {
        if activate {
            tx.set_active(deployment_id, None)?;
        }
        let v = Version {
            id: Uuid::new_v4(),
            deployment_id,
            version: number,
            spec: spec.clone(),
            active: activate,
            created_at: now(),
        };
        tx.insert_version(&v)?;
        let _e = self.span.enter();
        debug!(deployment = %deployment_id, version = %number, activate, "versions: appended");
        Ok(v)
    }

    /// Makes `target` the active version; `None` leaves the deployment with
    /// no active version.
    pub fn activate(&self, tx: &Tx<'_>, deployment_id: ResourceId, target: Option<&Version>) -> KeelResult<()> {
        tx.set_active(deployment_id, target.map(|v| v.id))?;
        let _e = self.span.enter();
        debug!(deployment = %deployment_id, version = ?target.map(|v| v.version), "versions: activation changed");
        Ok(())
    }

    pub fn diff(&self, a: &Version, b: &Version) -> VersionDiff {
        diff_specs(a.version, &a.spec, b.version, &b.spec)
    }
}
