//! Keel core types and errors.
//!
//! Records here mirror the persisted rows one to one. Everything that mutates
//! them lives in `keel-ops`; this crate only carries data, ordering rules and
//! the error taxonomy shared by every layer.

#![forbid(unsafe_code)]

pub mod error;
pub mod version;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::{
    ErrorKind, KeelError, KeelResult, OrchestratorError, QuotaDimension, QuotaViolation, StoreError,
};
pub use version::SemVer;

pub type UserId = Uuid;
pub type ResourceId = Uuid;

/// Current time truncated to the millisecond precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Ordered permission tier for a (user, resource) pair.
///
/// Declaration order is the total order used by every comparison and clamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    Read,
    ReadWrite,
    Owner,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Read => "read",
            AccessLevel::ReadWrite => "readwrite",
            AccessLevel::Owner => "owner",
        }
    }

    pub fn rank(self) -> i64 {
        self as i64
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(AccessLevel::None),
            1 => Some(AccessLevel::Read),
            2 => Some(AccessLevel::ReadWrite),
            3 => Some(AccessLevel::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(AccessLevel::None),
            "read" => Ok(AccessLevel::Read),
            "readwrite" | "write" => Ok(AccessLevel::ReadWrite),
            "owner" => Ok(AccessLevel::Owner),
            other => Err(KeelError::Validation(format!("unknown access level: {}", other))),
        }
    }
}

/// Resource kinds that carry access records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Namespace,
    Volume,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Namespace, ResourceKind::Volume];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespace",
            ResourceKind::Volume => "volume",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "namespace" | "ns" => Ok(ResourceKind::Namespace),
            "volume" | "vol" => Ok(ResourceKind::Volume),
            other => Err(KeelError::Validation(format!("unknown resource kind: {}", other))),
        }
    }
}

/// Identity of the user performing a request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub admin: bool,
}

impl Actor {
    pub fn user(id: UserId) -> Self {
        Self { id, admin: false }
    }

    pub fn admin(id: UserId) -> Self {
        Self { id, admin: true }
    }
}

/// Tariff-derived ceilings for one namespace. CPU in millicores, RAM in MiB.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub cpu: u64,
    pub ram: u64,
    pub max_ext_services: u64,
    pub max_int_services: u64,
    pub max_traffic: u64,
}

/// Live usage of a namespace, derived from its non-deleted children.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub cpu: u64,
    pub ram: u64,
    pub ext_services: u64,
    pub int_services: u64,
    pub volumes: u64,
    pub deployments: u64,
    pub ingresses: u64,
}

/// Live resources owned by one user across all namespaces.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceCounts {
    pub namespaces: u64,
    pub volumes: u64,
    pub deployments: u64,
    pub ingresses: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub id: ResourceId,
    pub owner: UserId,
    pub label: String,
    pub limits: Limits,
    pub tariff_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub delete_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub id: ResourceId,
    pub owner: UserId,
    pub label: String,
    /// Capacity in GiB.
    pub capacity: u64,
    pub replicas: u32,
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub delete_time: Option<DateTime<Utc>>,
}

/// One container of a deployment. `cpu` in millicores, `ram` in MiB (per replica).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub cpu: u64,
    pub ram: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub external: bool,
}

/// Configuration snapshot stored with every deployment version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub containers: Vec<Container>,
    pub replicas: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
}

impl DeploymentSpec {
    pub fn container(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Checks names, requests and replica count.
    pub fn validate(&self) -> KeelResult<()> {
        if self.containers.is_empty() {
            return Err(KeelError::Validation("deployment needs at least one container".into()));
        }
        validate_replicas(self.replicas)?;
        let mut seen = std::collections::HashSet::new();
        for c in &self.containers {
            validate_name("container name", &c.name)?;
            if c.image.trim().is_empty() {
                return Err(KeelError::Validation(format!("container {} has empty image", c.name)));
            }
            if c.cpu > MAX_CONTAINER_CPU || c.ram > MAX_CONTAINER_RAM {
                return Err(KeelError::Validation(format!(
                    "container {} requests {}m cpu / {}Mi ram, max {}m / {}Mi",
                    c.name, c.cpu, c.ram, MAX_CONTAINER_CPU, MAX_CONTAINER_RAM
                )));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(KeelError::Validation(format!("duplicate container name: {}", c.name)));
            }
        }
        let mut svc = std::collections::HashSet::new();
        for s in &self.services {
            validate_name("service name", &s.name)?;
            if !svc.insert(s.name.as_str()) {
                return Err(KeelError::Validation(format!("duplicate service name: {}", s.name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deployment {
    pub id: ResourceId,
    pub namespace_id: ResourceId,
    pub name: String,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub delete_time: Option<DateTime<Utc>>,
}

/// Immutable configuration snapshot of a deployment. Only `active` flips,
/// and `spec.replicas` may be rewritten in place for the active version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Version {
    pub id: ResourceId,
    pub deployment_id: ResourceId,
    pub version: SemVer,
    pub spec: DeploymentSpec,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Deployment together with the version currently reflected remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentView {
    pub deployment: Deployment,
    pub active: Option<Version>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRecord {
    pub id: Uuid,
    pub kind: ResourceKind,
    pub resource_id: ResourceId,
    pub resource_label: String,
    pub subject: UserId,
    pub owner: UserId,
    /// Level originally granted; kept intact while the owner is restricted.
    pub access_level: AccessLevel,
    /// Effective level after the owner's ceiling is applied.
    pub new_access_level: AccessLevel,
    pub limited: bool,
    pub changed_at: DateTime<Utc>,
}

impl AccessRecord {
    pub fn is_owner_record(&self) -> bool {
        self.subject == self.owner
    }

    pub fn effective(&self) -> AccessLevel {
        self.new_access_level
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Domain {
    pub id: Uuid,
    pub domain: String,
    pub group: String,
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ingress {
    pub id: ResourceId,
    pub namespace_id: ResourceId,
    pub name: String,
    pub domain: String,
    pub path: String,
    pub service_name: String,
    pub service_port: u16,
    pub tls: bool,
    pub owner: UserId,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
    pub delete_time: Option<DateTime<Utc>>,
}

impl Ingress {
    pub fn tls_secret_name(&self) -> String {
        format!("{}-tls", self.name)
    }
}

/// Collaborators report a one-line description of themselves at startup.
pub trait Describe {
    fn describe(&self) -> String;
}

/// Largest CPU request of one container, in millicores.
pub const MAX_CONTAINER_CPU: u64 = 1_000_000;
/// Largest RAM request of one container, in MiB.
pub const MAX_CONTAINER_RAM: u64 = 16 * 1024 * 1024;
pub const MAX_REPLICAS: u32 = 10_000;

/// Zero replicas is a valid paused deployment.
pub fn validate_replicas(replicas: u32) -> KeelResult<()> {
    if replicas > MAX_REPLICAS {
        return Err(KeelError::Validation(format!("replicas {} exceeds {}", replicas, MAX_REPLICAS)));
    }
    Ok(())
}

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("static regex"));

/// Validates a DNS-1123 label (names of deployments, containers, ingresses, labels).
pub fn validate_name(what: &str, name: &str) -> KeelResult<()> {
    if DNS_LABEL.is_match(name) {
        Ok(())
    } else {
        Err(KeelError::Validation(format!(
            "invalid {}: {:?} (expect lowercase alphanumerics and '-', max 63 chars)",
            what, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_totally_ordered() {
        assert!(AccessLevel::None < AccessLevel::Read);
        assert!(AccessLevel::Read < AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadWrite < AccessLevel::Owner);
        for rank in 0..4 {
            let lvl = AccessLevel::from_rank(rank).expect("rank");
            assert_eq!(lvl.rank(), rank);
        }
        assert_eq!(AccessLevel::from_rank(9), None);
    }

    #[test]
    fn access_level_parses_aliases() {
        assert_eq!("write".parse::<AccessLevel>().unwrap(), AccessLevel::ReadWrite);
        assert_eq!("OWNER".parse::<AccessLevel>().unwrap(), AccessLevel::Owner);
        assert!("admin".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn names_follow_dns_labels() {
        assert!(validate_name("name", "web-1").is_ok());
        assert!(validate_name("name", "Web").is_err());
        assert!(validate_name("name", "-web").is_err());
        assert!(validate_name("name", "").is_err());
        assert!(validate_name("name", &"a".repeat(64)).is_err());
    }

    #[test]
    fn spec_validation_rejects_duplicates() {
        let c = Container { name: "web".into(), image: "nginx".into(), cpu: 100, ram: 128, env: BTreeMap::new(), ports: vec![] };
        let spec = DeploymentSpec { containers: vec![c.clone(), c], replicas: 1, services: vec![] };
        let err = spec.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn spec_validation_bounds_requests_and_replicas() {
        let c = Container { name: "web".into(), image: "nginx".into(), cpu: MAX_CONTAINER_CPU, ram: MAX_CONTAINER_RAM, env: BTreeMap::new(), ports: vec![] };
        let ok = DeploymentSpec { containers: vec![c.clone()], replicas: MAX_REPLICAS, services: vec![] };
        assert!(ok.validate().is_ok());
        assert!(DeploymentSpec { replicas: 0, ..ok.clone() }.validate().is_ok());

        let too_many = DeploymentSpec { replicas: MAX_REPLICAS + 1, ..ok.clone() };
        assert_eq!(too_many.validate().unwrap_err().kind(), ErrorKind::Validation);
        let cpu = DeploymentSpec { containers: vec![Container { cpu: 1 << 63, ..c.clone() }], ..ok.clone() };
        assert_eq!(cpu.validate().unwrap_err().kind(), ErrorKind::Validation);
        let ram = DeploymentSpec { containers: vec![Container { ram: MAX_CONTAINER_RAM + 1, ..c }], ..ok };
        assert_eq!(ram.validate().unwrap_err().kind(), ErrorKind::Validation);
    }
}
