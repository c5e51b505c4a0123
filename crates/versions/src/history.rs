//! Per-deployment version arena and its activation state.

use keel_core::{DeploymentSpec, KeelError, KeelResult, ResourceId, SemVer, StoreError, Version};

use crate::{classify, Bump};

/// Activation state of one deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// No versions at all.
    Empty,
    /// Exactly this version is live remotely.
    Active(SemVer),
    /// Versions exist but none is active: an update is in flight or was
    /// interrupted.
    Inactive,
}

/// What an update would do to the history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub bump: Bump,
    /// Number of the version to create; `None` for in-place updates.
    pub next: Option<SemVer>,
}

/// Versions of one deployment in ascending order, validated on load.
#[derive(Debug, Clone)]
pub struct VersionHistory {
    deployment_id: ResourceId,
    versions: Vec<Version>,
}

impl VersionHistory {
    /// Fails with a corrupt-store error when more than one version is active
    /// or numbers repeat.
    pub fn load(deployment_id: ResourceId, mut versions: Vec<Version>) -> KeelResult<Self> {
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        if versions.windows(2).any(|w| w[0].version == w[1].version) {
            return Err(StoreError::Corrupt(format!("deployment {} has duplicate version numbers", deployment_id)).into());
        }
        if versions.iter().filter(|v| v.active).count() > 1 {
            return Err(StoreError::Corrupt(format!("deployment {} has several active versions", deployment_id)).into());
        }
        Ok(Self { deployment_id, versions })
    }

    pub fn deployment_id(&self) -> ResourceId {
        self.deployment_id
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn activation(&self) -> Activation {
        match (self.versions.is_empty(), self.active()) {
            (true, _) => Activation::Empty,
            (false, Some(v)) => Activation::Active(v.version),
            (false, None) => Activation::Inactive,
        }
    }

    pub fn active(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.active)
    }

    pub fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// The version updates are classified against: the active one, else the latest.
    pub fn base(&self) -> Option<&Version> {
        self.active().or_else(|| self.latest())
    }

    pub fn get(&self, v: SemVer) -> KeelResult<&Version> {
        self.versions
            .iter()
            .find(|x| x.version == v)
            .ok_or_else(|| KeelError::not_found(format!("version {}", v)))
    }

    /// Version immediately before `v` in history order.
    pub fn previous(&self, v: SemVer) -> KeelResult<Option<&Version>> {
        let idx = self
            .versions
            .iter()
            .position(|x| x.version == v)
            .ok_or_else(|| KeelError::not_found(format!("version {}", v)))?;
        Ok(idx.checked_sub(1).map(|i| &self.versions[i]))
    }

    /// Classifies `proposed` against the base version. New numbers are bumped
    /// from the highest existing version so they keep increasing after rollbacks.
    pub fn plan(&self, proposed: &DeploymentSpec) -> KeelResult<Plan> {
        let Some(base) = self.base() else {
            return Ok(Plan { bump: Bump::Major, next: Some(SemVer::INITIAL) });
        };
        let bump = classify(&base.spec, proposed);
        let highest = self.latest().map(|v| v.version).unwrap_or(SemVer::INITIAL);
        Ok(Plan { bump, next: crate::next_version(highest, bump)? })
    }

    /// The version to delete, unless it is the active one.
    pub fn check_delete(&self, v: SemVer) -> KeelResult<&Version> {
        let target = self.get(v)?;
        if target.active {
            return Err(KeelError::UnableDeleteActiveVersion(v));
        }
        Ok(target)
    }

    /// The version to rename; `to` must be free and keep history order.
    pub fn check_rename(&self, from: SemVer, to: SemVer) -> KeelResult<&Version> {
        let idx = self
            .versions
            .iter()
            .position(|x| x.version == from)
            .ok_or_else(|| KeelError::not_found(format!("version {}", from)))?;
        if from == to {
            return Ok(&self.versions[idx]);
        }
        if !to.in_range() {
            return Err(KeelError::Validation(format!(
                "version {} has a component above {}",
                to,
                SemVer::MAX_PART
            )));
        }
        if self.versions.iter().any(|x| x.version == to) {
            return Err(KeelError::AlreadyExists(format!("version {}", to)));
        }
        let after_prev = idx == 0 || self.versions[idx - 1].version < to;
        let before_next = self.versions.get(idx + 1).map_or(true, |n| to < n.version);
        if !(after_prev && before_next) {
            return Err(KeelError::Validation(format!(
                "renaming {} to {} would reorder the version history",
                from, to
            )));
        }
        Ok(&self.versions[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{now, Container};
    use uuid::Uuid;

    fn spec(image: &str) -> DeploymentSpec {
        DeploymentSpec {
            containers: vec![Container { name: "web".into(), image: image.into(), cpu: 10, ram: 10, env: Default::default(), ports: vec![] }],
            replicas: 1,
            services: vec![],
        }
    }

    fn v(dep: ResourceId, n: SemVer, active: bool) -> Version {
        Version { id: Uuid::new_v4(), deployment_id: dep, version: n, spec: spec(&format!("img:{}", n)), active, created_at: now() }
    }

    fn history() -> VersionHistory {
        let dep = Uuid::new_v4();
        VersionHistory::load(
            dep,
            vec![v(dep, SemVer::new(2, 0, 0), false), v(dep, SemVer::new(1, 0, 0), true), v(dep, SemVer::new(1, 1, 0), false)],
        )
        .unwrap()
    }

    #[test]
    fn load_sorts_and_reports_activation() {
        let h = history();
        let order: Vec<String> = h.versions().iter().map(|v| v.version.to_string()).collect();
        assert_eq!(order, vec!["1.0.0", "1.1.0", "2.0.0"]);
        assert_eq!(h.activation(), Activation::Active(SemVer::INITIAL));
        assert_eq!(VersionHistory::load(Uuid::new_v4(), vec![]).unwrap().activation(), Activation::Empty);
    }

    #[test]
    fn two_active_versions_are_corrupt() {
        let dep = Uuid::new_v4();
        let err = VersionHistory::load(dep, vec![v(dep, SemVer::new(1, 0, 0), true), v(dep, SemVer::new(2, 0, 0), true)]).unwrap_err();
        assert_eq!(err.kind(), keel_core::ErrorKind::Storage);
    }

    #[test]
    fn plan_bumps_from_highest_not_active() {
        let h = history();
        // Active is 1.0.0 but 2.0.0 exists: an image change becomes 2.1.0.
        let plan = h.plan(&spec("other:1")).unwrap();
        assert_eq!(plan, Plan { bump: Bump::Minor, next: Some(SemVer::new(2, 1, 0)) });
        let same = h.plan(&h.active().unwrap().spec.clone()).unwrap();
        assert_eq!(same, Plan { bump: Bump::InPlace, next: None });
    }

    #[test]
    fn active_version_cannot_be_deleted() {
        let h = history();
        let err = h.check_delete(SemVer::INITIAL).unwrap_err();
        assert!(matches!(err, KeelError::UnableDeleteActiveVersion(v) if v == SemVer::INITIAL));
        assert!(h.check_delete(SemVer::new(2, 0, 0)).is_ok());
        assert_eq!(h.check_delete(SemVer::new(9, 0, 0)).unwrap_err().kind(), keel_core::ErrorKind::NotFound);
    }

    #[test]
    fn rename_must_keep_order() {
        let h = history();
        assert!(h.check_rename(SemVer::new(1, 1, 0), SemVer::new(1, 5, 0)).is_ok());
        assert_eq!(h.check_rename(SemVer::new(1, 1, 0), SemVer::new(3, 0, 0)).unwrap_err().kind(), keel_core::ErrorKind::Validation);
        assert_eq!(h.check_rename(SemVer::new(1, 1, 0), SemVer::new(2, 0, 0)).unwrap_err().kind(), keel_core::ErrorKind::AlreadyExists);
        assert!(h.check_rename(SemVer::new(2, 0, 0), SemVer::new(7, 0, 0)).is_ok());
    }

    #[test]
    fn rename_refuses_unstorable_numbers() {
        let h = history();
        let err = h.check_rename(SemVer::new(2, 0, 0), SemVer::new(SemVer::MAX_PART + 1, 0, 0)).unwrap_err();
        assert_eq!(err.kind(), keel_core::ErrorKind::Validation);
        assert!(h.check_rename(SemVer::new(2, 0, 0), SemVer::new(SemVer::MAX_PART, 0, 0)).is_ok());
    }

    #[test]
    fn previous_walks_history_order() {
        let h = history();
        assert_eq!(h.previous(SemVer::new(2, 0, 0)).unwrap().map(|v| v.version), Some(SemVer::new(1, 1, 0)));
        assert!(h.previous(SemVer::INITIAL).unwrap().is_none());
    }
}
