#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{Actor, Container, DeploymentSpec, ServiceSpec};
use keel_kubehub::MockOrchestrator;
use keel_ops::{Coordinator, RequestCtx};
use keel_persist::SqliteStore;
use keel_quota::{StaticTariffs, Tariff};
use uuid::Uuid;

pub struct Harness {
    pub coord: Coordinator,
    pub mock: Arc<MockOrchestrator>,
    pub owner: RequestCtx,
}

impl Harness {
    pub fn fingerprint(&self) -> String {
        self.coord.store().fingerprint().unwrap()
    }

    pub fn user(&self) -> RequestCtx {
        RequestCtx::new(Actor::user(Uuid::new_v4()))
    }

    pub fn admin(&self) -> RequestCtx {
        RequestCtx::new(Actor::admin(Uuid::new_v4()))
    }
}

/// Tariffs used across tests: `small` (CPU 1000, RAM 2048), `tight`
/// (RAM 640) and `large`.
pub fn tariffs() -> StaticTariffs {
    StaticTariffs::new([
        Tariff { id: "small".into(), cpu: 1000, ram: 2048, max_ext_services: 1, max_int_services: 4, max_traffic: 100 },
        Tariff { id: "tight".into(), cpu: 10_000, ram: 640, max_ext_services: 1, max_int_services: 4, max_traffic: 100 },
        Tariff { id: "large".into(), cpu: 100_000, ram: 100_000, max_ext_services: 8, max_int_services: 16, max_traffic: 1000 },
    ])
}

pub fn harness_with_timeout(timeout: Duration) -> Harness {
    let mock = Arc::new(MockOrchestrator::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let coord = Coordinator::new(store, mock.clone(), Arc::new(tariffs()), timeout);
    Harness { coord, mock, owner: RequestCtx::new(Actor::user(Uuid::new_v4())) }
}

pub fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(5))
}

pub fn container(name: &str, image: &str, cpu: u64, ram: u64) -> Container {
    Container { name: name.into(), image: image.into(), cpu, ram, env: Default::default(), ports: vec![8080] }
}

/// Two containers requesting CPU 100 / RAM 128 each.
pub fn web(replicas: u32) -> DeploymentSpec {
    DeploymentSpec {
        containers: vec![container("app", "nginx:1", 100, 128), container("sidecar", "envoy:1", 100, 128)],
        replicas,
        services: vec![ServiceSpec { name: "http".into(), port: 80, external: false }],
    }
}
