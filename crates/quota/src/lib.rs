//! Keel quota engine.
//!
//! [`cost`] is the single pricing function; every check derives from it.
//! Dimensions are evaluated in the order CPU, RAM, external services,
//! internal services and the first one over its ceiling is reported.

#![forbid(unsafe_code)]

mod tariff;

use metrics::counter;
use tracing::{debug, Span};

use keel_core::{DeploymentSpec, Limits, QuotaDimension, QuotaViolation, ResourceId, StoreError, Usage};
use keel_persist::Tx;

pub use tariff::{StaticTariffs, Tariff, TariffSource};

/// Resources a deployment consumes. CPU in millicores, RAM in MiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cost {
    pub cpu: u64,
    pub ram: u64,
    pub ext_services: u64,
    pub int_services: u64,
}

/// Container requests summed and scaled by replicas; services count once each.
/// Arithmetic saturates, so a spec too large to price still exceeds every limit.
pub fn cost(spec: &DeploymentSpec) -> Cost {
    let replicas = u64::from(spec.replicas);
    let cpu = spec.containers.iter().fold(0u64, |acc, c| acc.saturating_add(c.cpu));
    let ram = spec.containers.iter().fold(0u64, |acc, c| acc.saturating_add(c.ram));
    let ext = spec.services.iter().filter(|s| s.external).count() as u64;
    Cost {
        cpu: cpu.saturating_mul(replicas),
        ram: ram.saturating_mul(replicas),
        ext_services: ext,
        int_services: spec.services.len() as u64 - ext,
    }
}

fn dims(limits: &Limits, usage: &Usage) -> [(QuotaDimension, u64, u64); 4] {
    [
        (QuotaDimension::Cpu, limits.cpu, usage.cpu),
        (QuotaDimension::Ram, limits.ram, usage.ram),
        (QuotaDimension::ExtServices, limits.max_ext_services, usage.ext_services),
        (QuotaDimension::IntServices, limits.max_int_services, usage.int_services),
    ]
}

fn amounts(c: &Cost) -> [u64; 4] {
    [c.cpu, c.ram, c.ext_services, c.int_services]
}

/// Fails iff `usage + cost(spec)` exceeds a limit.
pub fn check_create(limits: &Limits, usage: &Usage, spec: &DeploymentSpec) -> Result<(), QuotaViolation> {
    check_growth(limits, usage, &Cost::default(), &cost(spec))
}

/// Only dimensions that grow can fail; growth is `cost(new) - cost(old)`.
pub fn check_replace(
    limits: &Limits,
    usage: &Usage,
    old: &DeploymentSpec,
    new: &DeploymentSpec,
) -> Result<(), QuotaViolation> {
    check_growth(limits, usage, &cost(old), &cost(new))
}

/// [`check_replace`] for a spec that differs only in replica count.
pub fn check_replica_change(
    limits: &Limits,
    usage: &Usage,
    spec: &DeploymentSpec,
    new_replicas: u32,
) -> Result<(), QuotaViolation> {
    let scaled = DeploymentSpec { replicas: new_replicas, ..spec.clone() };
    check_replace(limits, usage, spec, &scaled)
}

/// New limits must still cover what the namespace already uses.
pub fn check_limits_cover(limits: &Limits, usage: &Usage) -> Result<(), QuotaViolation> {
    for (dimension, limit, used) in dims(limits, usage) {
        if used > limit {
            return Err(QuotaViolation { dimension, limit, used, requested: 0 });
        }
    }
    Ok(())
}

fn check_growth(limits: &Limits, usage: &Usage, old: &Cost, new: &Cost) -> Result<(), QuotaViolation> {
    let before = amounts(old);
    let after = amounts(new);
    for (i, (dimension, limit, used)) in dims(limits, usage).into_iter().enumerate() {
        let Some(delta) = after[i].checked_sub(before[i]).filter(|d| *d > 0) else { continue };
        if used.saturating_add(delta) > limit {
            return Err(QuotaViolation { dimension, limit, used, requested: delta });
        }
    }
    Ok(())
}

/// Live usage of a namespace from its non-deleted children.
pub fn compute_usage(tx: &Tx<'_>, namespace_id: ResourceId) -> Result<Usage, StoreError> {
    let mut usage = Usage::default();
    for spec in tx.active_specs_in(namespace_id)? {
        let c = cost(&spec);
        usage.cpu = usage.cpu.saturating_add(c.cpu);
        usage.ram = usage.ram.saturating_add(c.ram);
        usage.ext_services = usage.ext_services.saturating_add(c.ext_services);
        usage.int_services = usage.int_services.saturating_add(c.int_services);
    }
    usage.deployments = tx.count_deployments_in(namespace_id)?;
    usage.volumes = tx.count_volumes_in(namespace_id)?;
    usage.ingresses = tx.count_ingresses_in(namespace_id)?;
    Ok(usage)
}

/// Logging and metrics around the pure checks.
pub struct QuotaEngine {
    span: Span,
}

impl Default for QuotaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaEngine {
    pub fn new() -> Self {
        Self { span: tracing::info_span!("quota", component = "quota_engine") }
    }

    pub fn usage(&self, tx: &Tx<'_>, namespace_id: ResourceId) -> Result<Usage, StoreError> {
        compute_usage(tx, namespace_id)
    }

    pub fn check_create(&self, limits: &Limits, usage: &Usage, spec: &DeploymentSpec) -> Result<(), QuotaViolation> {
        self.observe("create", check_create(limits, usage, spec))
    }

    pub fn check_replace(&self, limits: &Limits, usage: &Usage, old: &DeploymentSpec, new: &DeploymentSpec) -> Result<(), QuotaViolation> {
        self.observe("replace", check_replace(limits, usage, old, new))
    }

    pub fn check_replica_change(&self, limits: &Limits, usage: &Usage, spec: &DeploymentSpec, replicas: u32) -> Result<(), QuotaViolation> {
        self.observe("replicas", check_replica_change(limits, usage, spec, replicas))
    }

    pub fn check_limits_cover(&self, limits: &Limits, usage: &Usage) -> Result<(), QuotaViolation> {
        self.observe("resize", check_limits_cover(limits, usage))
    }

    fn observe(&self, check: &'static str, res: Result<(), QuotaViolation>) -> Result<(), QuotaViolation> {
        if let Err(v) = &res {
            let _e = self.span.enter();
            debug!(check, dimension = %v.dimension, limit = v.limit, used = v.used, requested = v.requested, "quota: rejected");
            counter!("quota_rejected_total", 1, "check" => check, "dimension" => dimension_label(v.dimension));
        }
        res
    }
}

fn dimension_label(d: QuotaDimension) -> &'static str {
    match d {
        QuotaDimension::Cpu => "cpu",
        QuotaDimension::Ram => "ram",
        QuotaDimension::ExtServices => "ext_services",
        QuotaDimension::IntServices => "int_services",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Container, ServiceSpec};
    use proptest::prelude::*;

    fn container(name: &str, cpu: u64, ram: u64) -> Container {
        Container { name: name.into(), image: "img:1".into(), cpu, ram, env: Default::default(), ports: vec![] }
    }

    fn web(replicas: u32) -> DeploymentSpec {
        DeploymentSpec { containers: vec![container("a", 100, 128), container("b", 100, 128)], replicas, services: vec![] }
    }

    fn limits(cpu: u64, ram: u64) -> Limits {
        Limits { cpu, ram, max_ext_services: 1, max_int_services: 2, max_traffic: 0 }
    }

    #[test]
    fn cost_scales_requests_not_services() {
        let mut s = web(3);
        s.services = vec![
            ServiceSpec { name: "pub".into(), port: 80, external: true },
            ServiceSpec { name: "int".into(), port: 81, external: false },
        ];
        assert_eq!(cost(&s), Cost { cpu: 600, ram: 768, ext_services: 1, int_services: 1 });
    }

    #[test]
    fn unpriceable_spec_saturates_and_is_rejected() {
        let huge = DeploymentSpec {
            containers: vec![container("a", 1 << 63, 128), container("b", 1 << 63, 128)],
            replicas: 1,
            services: vec![],
        };
        assert_eq!(cost(&huge).cpu, u64::MAX);
        let v = check_create(&limits(1000, 2048), &Usage::default(), &huge).unwrap_err();
        assert_eq!(v.dimension, QuotaDimension::Cpu);
        assert_eq!(v.requested, u64::MAX);

        let wide = DeploymentSpec { replicas: u32::MAX, ..web(1) };
        assert_eq!(cost(&wide).cpu, 200 * u64::from(u32::MAX));
        assert!(check_create(&limits(1000, 2048), &Usage::default(), &wide).is_err());
    }

    #[test]
    fn create_within_limits_passes() {
        assert!(check_create(&limits(1000, 2048), &Usage::default(), &web(1)).is_ok());
    }

    #[test]
    fn replica_growth_reports_ram() {
        // 256 MiB per replica; 512 MiB headroom fits 2 extra replicas, not 3.
        let usage = Usage { cpu: 200, ram: 256, ..Default::default() };
        let l = limits(10_000, 768);
        assert!(check_replica_change(&l, &usage, &web(1), 3).is_ok());
        let v = check_replica_change(&l, &usage, &web(1), 4).unwrap_err();
        assert_eq!(v.dimension, QuotaDimension::Ram);
        assert_eq!(v.requested, 768);
    }

    #[test]
    fn cpu_is_reported_before_ram() {
        let v = check_create(&limits(100, 100), &Usage::default(), &web(1)).unwrap_err();
        assert_eq!(v.dimension, QuotaDimension::Cpu);
    }

    #[test]
    fn shrinking_one_dimension_while_growing_another() {
        // Old: 200 cpu / 256 ram. New: 100 cpu / 512 ram. At cpu limit already.
        let old = web(1);
        let new = DeploymentSpec { containers: vec![container("a", 100, 512)], replicas: 1, services: vec![] };
        let usage = Usage { cpu: 1000, ram: 256, ..Default::default() };
        assert!(check_replace(&limits(1000, 2048), &usage, &old, &new).is_ok());
        let v = check_replace(&limits(1000, 400), &usage, &old, &new).unwrap_err();
        assert_eq!(v.dimension, QuotaDimension::Ram);
    }

    #[test]
    fn resize_below_usage_is_rejected() {
        let usage = Usage { cpu: 500, ram: 100, ..Default::default() };
        assert!(check_limits_cover(&limits(500, 100), &usage).is_ok());
        assert_eq!(check_limits_cover(&limits(400, 100), &usage).unwrap_err().dimension, QuotaDimension::Cpu);
    }

    fn arb_spec() -> impl Strategy<Value = DeploymentSpec> {
        (proptest::collection::vec((0u64..500, 0u64..1024), 1..4), 1u32..5).prop_map(|(cs, replicas)| DeploymentSpec {
            containers: cs.into_iter().enumerate().map(|(i, (cpu, ram))| container(&format!("c{}", i), cpu, ram)).collect(),
            replicas,
            services: vec![],
        })
    }

    proptest! {
        #[test]
        fn create_accepts_iff_sum_fits(spec in arb_spec(), ucpu in 0u64..4000, uram in 0u64..8000, hcpu in 0u64..4000, hram in 0u64..8000) {
            let usage = Usage { cpu: ucpu, ram: uram, ..Default::default() };
            let l = Limits { cpu: ucpu + hcpu, ram: uram + hram, max_ext_services: 0, max_int_services: 0, max_traffic: 0 };
            let c = cost(&spec);
            let fits = ucpu + c.cpu <= l.cpu && uram + c.ram <= l.ram;
            prop_assert_eq!(check_create(&l, &usage, &spec).is_ok(), fits);
        }

        #[test]
        fn shrinking_always_passes_at_limit(spec in arb_spec()) {
            let c = cost(&spec);
            let usage = Usage { cpu: c.cpu, ram: c.ram, ..Default::default() };
            let l = Limits { cpu: c.cpu, ram: c.ram, max_ext_services: 0, max_int_services: 0, max_traffic: 0 };
            let smaller = DeploymentSpec { replicas: 1, ..spec.clone() };
            prop_assert!(check_replace(&l, &usage, &spec, &smaller).is_ok());
        }
    }
}
