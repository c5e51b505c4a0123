#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use common::{container, harness, harness_with_timeout, web};
use keel_core::{AccessLevel, ErrorKind, KeelError, OrchestratorError, QuotaDimension, ResourceKind, SemVer};
use keel_kubehub::OrchestratorOp;
use keel_ops::{IngressRequest, TlsMaterial};

fn v(major: u64, minor: u64, patch: u64) -> SemVer {
    SemVer::new(major, minor, patch)
}

#[tokio::test]
async fn create_web_in_ns1() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    let view = h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let active = view.active.unwrap();
    assert_eq!(active.version, v(1, 0, 0));
    assert!(active.active);
    assert_eq!(h.mock.ops(), vec![OrchestratorOp::CreateNamespace, OrchestratorOp::CreateDeployment]);
    assert!(h.mock.calls().iter().all(|c| c.actor == h.owner.actor.id));

    let usage = h.coord.namespace_usage(&h.owner, "ns1").unwrap();
    assert_eq!((usage.cpu, usage.ram, usage.deployments, usage.int_services), (200, 256, 1, 1));
}

#[tokio::test]
async fn replica_growth_over_ram_leaves_state_unchanged() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "tight").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let before = h.fingerprint();

    // 256 MiB used, 640 MiB limit: two more replicas need 512.
    let err = h.coord.set_replicas(&h.owner, "ns1", "web", 3).await.unwrap_err();
    match err {
        KeelError::QuotaExceeded(q) => assert_eq!(q.dimension, QuotaDimension::Ram),
        other => panic!("unexpected {other}"),
    }
    assert_eq!(h.fingerprint(), before);
    assert!(!h.mock.ops().contains(&OrchestratorOp::SetReplicas));

    let ok = h.coord.set_replicas(&h.owner, "ns1", "web", 2).await.unwrap();
    assert_eq!(ok.active.unwrap().spec.replicas, 2);
}

#[tokio::test]
async fn active_version_cannot_be_deleted() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let before = h.fingerprint();
    let err = h.coord.delete_version(&h.owner, "ns1", "web", v(1, 0, 0)).unwrap_err();
    assert!(matches!(err, KeelError::UnableDeleteActiveVersion(x) if x == v(1, 0, 0)));
    assert_eq!(h.fingerprint(), before);
}

#[tokio::test]
async fn failed_activation_keeps_previous_active() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let mut bigger = web(1);
    bigger.containers.push(container("cache", "redis:7", 100, 128));
    let updated = h.coord.update_deployment(&h.owner, "ns1", "web", bigger).await.unwrap();
    assert_eq!(updated.active.unwrap().version, v(2, 0, 0));
    h.coord.change_active_version(&h.owner, "ns1", "web", v(1, 0, 0)).await.unwrap();

    h.mock.fail_once(OrchestratorOp::ReplaceDeployment, OrchestratorError::Network("connection reset".into()));
    let err = h.coord.change_active_version(&h.owner, "ns1", "web", v(2, 0, 0)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Orchestrator);

    let versions = h.coord.list_versions(&h.owner, "ns1", "web").unwrap();
    let states: Vec<(String, bool)> = versions.iter().map(|x| (x.version.to_string(), x.active)).collect();
    assert_eq!(states, vec![("1.0.0".to_string(), true), ("2.0.0".to_string(), false)]);
}

#[tokio::test]
async fn updates_are_classified_into_bumps() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();

    let image = h.coord.set_container_image(&h.owner, "ns1", "web", "app", "nginx:2").await.unwrap();
    assert_eq!(image.active.unwrap().version, v(1, 1, 0));

    let mut cpu = web(1);
    cpu.containers[0].image = "nginx:2".into();
    cpu.containers[1].cpu = 150;
    let patch = h.coord.update_deployment(&h.owner, "ns1", "web", cpu.clone()).await.unwrap();
    assert_eq!(patch.active.unwrap().version, v(1, 1, 1));

    cpu.replicas = 2;
    let in_place = h.coord.update_deployment(&h.owner, "ns1", "web", cpu.clone()).await.unwrap();
    let active = in_place.active.unwrap();
    assert_eq!((active.version, active.spec.replicas), (v(1, 1, 1), 2));
    assert_eq!(h.mock.ops().last(), Some(&OrchestratorOp::SetReplicas));

    let calls_before = h.mock.ops().len();
    h.coord.update_deployment(&h.owner, "ns1", "web", cpu).await.unwrap();
    assert_eq!(h.mock.ops().len(), calls_before, "identical spec makes no remote call");

    let missing = h.coord.set_container_image(&h.owner, "ns1", "web", "nope", "x:1").await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn rollback_then_update_bumps_from_highest() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    h.coord.set_container_image(&h.owner, "ns1", "web", "app", "nginx:2").await.unwrap();
    h.coord.change_active_version(&h.owner, "ns1", "web", v(1, 0, 0)).await.unwrap();
    let next = h.coord.set_container_image(&h.owner, "ns1", "web", "app", "nginx:3").await.unwrap();
    assert_eq!(next.active.unwrap().version, v(1, 2, 0));

    let diff = h.coord.diff_previous(&h.owner, "ns1", "web", v(1, 2, 0)).unwrap();
    assert_eq!(diff.lines, vec!["~ containers.app.image: \"nginx:2\" -> \"nginx:3\"".to_string()]);
    let between = h.coord.diff_versions(&h.owner, "ns1", "web", v(1, 0, 0), v(1, 2, 0)).unwrap();
    assert_eq!(between.summary.updates, 1);
}

#[tokio::test]
async fn rename_version_keeps_order() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    h.coord.set_container_image(&h.owner, "ns1", "web", "app", "nginx:2").await.unwrap();

    let renamed = h.coord.rename_version(&h.owner, "ns1", "web", v(1, 0, 0), v(0, 9, 0)).unwrap();
    assert_eq!(renamed.version, v(0, 9, 0));
    let err = h.coord.rename_version(&h.owner, "ns1", "web", v(0, 9, 0), v(3, 0, 0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let numbers: Vec<SemVer> = h.coord.list_versions(&h.owner, "ns1", "web").unwrap().into_iter().map(|x| x.version).collect();
    assert_eq!(numbers, vec![v(0, 9, 0), v(1, 1, 0)]);
}

#[tokio::test]
async fn delete_is_compensated_and_then_hidden() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let before = h.fingerprint();

    h.mock.fail_once(OrchestratorOp::DeleteDeployment, OrchestratorError::Rejected("admission webhook".into()));
    let err = h.coord.delete_deployment(&h.owner, "ns1", "web").await.unwrap_err();
    assert!(matches!(err, KeelError::Orchestrator(OrchestratorError::Rejected(_))));
    assert_eq!(h.fingerprint(), before);

    h.coord.delete_deployment(&h.owner, "ns1", "web").await.unwrap();
    assert_eq!(h.coord.get_deployment(&h.owner, "ns1", "web").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(h.coord.list_deployments(&h.owner, "ns1").unwrap().is_empty());
    // The name is free again.
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
}

#[tokio::test]
async fn sharing_respects_levels_and_owner_ceiling() {
    let h = harness();
    let reader = h.user();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord
        .grant_access(&h.owner, ResourceKind::Namespace, "ns1", reader.actor.id, AccessLevel::Read)
        .unwrap();

    assert_eq!(h.coord.list_namespaces(&reader).unwrap().len(), 1);
    let err = h.coord.create_deployment(&reader, "ns1", "web", web(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h.coord.create_deployment(&reader, "nope", "web", web(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let admin = h.admin();
    h.coord.restrict_all_access(&admin, h.owner.actor.id, None, AccessLevel::Read).unwrap();
    let err = h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert!(!h.coord.authorize(&h.owner, ResourceKind::Namespace, "ns1", AccessLevel::ReadWrite).unwrap());

    h.coord.restrict_all_access(&admin, h.owner.actor.id, None, AccessLevel::Owner).unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();

    let err = h.coord.restrict_all_access(&reader, h.owner.actor.id, None, AccessLevel::Read).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
}

#[tokio::test]
async fn namespace_delete_cascades_and_compensates() {
    let h = harness();
    let shared = h.user();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    h.coord.grant_access(&h.owner, ResourceKind::Namespace, "ns1", shared.actor.id, AccessLevel::ReadWrite).unwrap();
    h.coord.create_volume(&h.owner, "data", 10, 1, true).unwrap();
    h.coord.create_volume(&h.owner, "scratch", 1, 1, false).unwrap();
    h.coord.attach_volume(&h.owner, "ns1", "data").unwrap();
    h.coord.attach_volume(&h.owner, "ns1", "scratch").unwrap();

    let err = h.coord.delete_namespace(&h.owner, "ns1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    h.coord.detach_volume(&h.owner, "ns1", "data").unwrap();

    let before = h.fingerprint();
    h.mock.fail_once(OrchestratorOp::DeleteNamespace, OrchestratorError::Network("timeout".into()));
    assert_eq!(h.coord.delete_namespace(&h.owner, "ns1").await.unwrap_err().kind(), ErrorKind::Orchestrator);
    assert_eq!(h.fingerprint(), before);

    h.coord.delete_namespace(&h.owner, "ns1").await.unwrap();
    assert_eq!(h.coord.get_namespace(&h.owner, "ns1").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(h.coord.list_namespaces(&shared).unwrap().is_empty());
    assert_eq!(h.coord.resource_counts(&h.owner).unwrap().deployments, 0);
    // The scratch volume was detached along with the delete and can go now.
    h.coord.delete_volume(&h.owner, "scratch").unwrap();
}

#[tokio::test]
async fn non_owner_delete_only_leaves() {
    let h = harness();
    let guest = h.user();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.grant_access(&h.owner, ResourceKind::Namespace, "ns1", guest.actor.id, AccessLevel::Read).unwrap();
    h.coord.delete_namespace(&guest, "ns1").await.unwrap();
    assert!(h.coord.list_namespaces(&guest).unwrap().is_empty());
    assert_eq!(h.coord.get_namespace(&h.owner, "ns1").unwrap().label, "ns1");
    assert!(!h.mock.ops().contains(&OrchestratorOp::DeleteNamespace));
}

#[tokio::test]
async fn namespace_resize_and_rename() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "large").await.unwrap();
    let mut heavy = web(1);
    heavy.containers[0].ram = 1500;
    h.coord.create_deployment(&h.owner, "ns1", "web", heavy).await.unwrap();

    let err = h.coord.resize_namespace(&h.owner, "ns1", "tight").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    let ns = h.coord.resize_namespace(&h.owner, "ns1", "small").await.unwrap();
    assert_eq!(ns.limits.ram, 2048);

    let before = h.fingerprint();
    h.mock.fail_once(OrchestratorOp::SetNamespaceQuota, OrchestratorError::Rejected("quota".into()));
    assert!(h.coord.resize_namespace(&h.owner, "ns1", "large").await.is_err());
    assert_eq!(h.fingerprint(), before);

    h.coord.create_namespace(&h.owner, "ns2", "small").await.unwrap();
    let err = h.coord.rename_namespace(&h.owner, "ns1", "ns2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    let renamed = h.coord.rename_namespace(&h.owner, "ns1", "prod").unwrap();
    assert_eq!(renamed.namespace.label, "prod");
    assert_eq!(h.coord.list_deployments(&h.owner, "prod").unwrap().len(), 1);
}

#[tokio::test]
async fn failed_namespace_create_leaves_nothing() {
    let h = harness();
    let before = h.fingerprint();
    h.mock.fail_once(OrchestratorOp::CreateNamespace, OrchestratorError::Network("refused".into()));
    assert!(h.coord.create_namespace(&h.owner, "ns1", "small").await.is_err());
    assert_eq!(h.fingerprint(), before);
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    assert_eq!(
        h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap_err().kind(),
        ErrorKind::AlreadyExists
    );
    assert_eq!(h.coord.create_namespace(&h.owner, "ns3", "gold").await.unwrap_err().kind(), ErrorKind::NotFound);
}

fn ingress(name: &str, path: &str, tls: bool) -> IngressRequest {
    IngressRequest {
        name: name.into(),
        domain: "apps.example.com".into(),
        path: path.into(),
        service_name: "http".into(),
        service_port: 80,
        tls: tls.then(|| TlsMaterial { cert: "CERT".into(), key: "KEY".into() }),
    }
}

#[tokio::test]
async fn ingress_with_tls_cleans_up_secret_on_failure() {
    let h = harness();
    let admin = h.admin();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    assert_eq!(
        h.coord.add_domain(&h.owner, "apps.example.com", "public", vec![]).unwrap_err().kind(),
        ErrorKind::PermissionDenied
    );
    h.coord.add_domain(&admin, "apps.example.com", "public", vec!["10.0.0.1".into()]).unwrap();

    let before = h.fingerprint();
    h.mock.fail_once(OrchestratorOp::CreateIngress, OrchestratorError::Rejected("bad host".into()));
    let err = h.coord.create_ingress(&h.owner, "ns1", ingress("site", "/", true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Orchestrator);
    assert_eq!(h.fingerprint(), before);
    assert_eq!(
        &h.mock.ops()[1..],
        &[OrchestratorOp::CreateSecret, OrchestratorOp::CreateIngress, OrchestratorOp::DeleteSecret]
    );

    h.coord.create_ingress(&h.owner, "ns1", ingress("site", "/", true)).await.unwrap();
    let dup = h.coord.create_ingress(&h.owner, "ns1", ingress("other", "/", false)).await.unwrap_err();
    assert_eq!(dup.kind(), ErrorKind::AlreadyExists);

    let bound = h.coord.delete_domain(&admin, "apps.example.com").unwrap_err();
    assert_eq!(bound.kind(), ErrorKind::Validation);
    h.coord.delete_ingress(&h.owner, "ns1", "site").await.unwrap();
    assert_eq!(h.mock.ops().last(), Some(&OrchestratorOp::DeleteSecret));
    h.coord.delete_domain(&admin, "apps.example.com").unwrap();
    assert_eq!(h.coord.get_domain("apps.example.com").unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn secret_cleanup_failure_is_inconsistent() {
    let h = harness();
    let admin = h.admin();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.add_domain(&admin, "apps.example.com", "public", vec![]).unwrap();
    h.mock.fail_once(OrchestratorOp::CreateIngress, OrchestratorError::Rejected("bad host".into()));
    h.mock.fail_once(OrchestratorOp::DeleteSecret, OrchestratorError::Network("reset".into()));
    let err = h.coord.create_ingress(&h.owner, "ns1", ingress("site", "/", true)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InconsistentState);
    assert!(h.coord.list_ingresses(&h.owner, "ns1").unwrap().is_empty());
}

#[tokio::test]
async fn failed_compensation_is_inconsistent_state() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    h.coord.set_container_image(&h.owner, "ns1", "web", "app", "nginx:2").await.unwrap();
    h.coord.change_active_version(&h.owner, "ns1", "web", v(1, 0, 0)).await.unwrap();

    // While 1.1.0 is being activated remotely, 1.0.0 is inactive locally and
    // gets deleted; undoing the activation then has nothing to reactivate.
    h.mock.set_delay(Some(Duration::from_millis(200)));
    h.mock.fail_once(OrchestratorOp::ReplaceDeployment, OrchestratorError::Network("reset".into()));
    let (activate, delete) = tokio::join!(
        h.coord.change_active_version(&h.owner, "ns1", "web", v(1, 1, 0)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.coord.delete_version(&h.owner, "ns1", "web", v(1, 0, 0))
        }
    );
    delete.unwrap();
    let err = activate.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InconsistentState);
    assert!(err.to_string().contains("replace_deployment"));
}

#[tokio::test]
async fn cancellation_compensates_like_failure() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let before = h.fingerprint();

    h.mock.set_delay(Some(Duration::from_secs(2)));
    let token = h.owner.cancel.clone();
    let (res, ()) = tokio::join!(h.coord.set_replicas(&h.owner, "ns1", "web", 2), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    assert!(matches!(res, Err(KeelError::Orchestrator(OrchestratorError::Cancelled))));
    assert_eq!(h.fingerprint(), before);
}

#[tokio::test]
async fn timeout_compensates_like_failure() {
    let h = harness_with_timeout(Duration::from_millis(30));
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let before = h.fingerprint();

    h.mock.set_delay(Some(Duration::from_secs(1)));
    let err = h.coord.delete_deployment(&h.owner, "ns1", "web").await.unwrap_err();
    assert!(matches!(err, KeelError::Orchestrator(OrchestratorError::Timeout(30))));
    assert_eq!(h.fingerprint(), before);
    h.mock.set_delay(None);
    assert!(h.coord.get_deployment(&h.owner, "ns1", "web").is_ok());
}

#[tokio::test]
async fn oversized_requests_never_wrap_past_quota() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "small", "small").await.unwrap();
    let before = h.fingerprint();
    let calls = h.mock.ops().len();

    let huge = keel_core::DeploymentSpec {
        containers: vec![container("a", "img:1", 1 << 63, 128), container("b", "img:1", 1 << 63, 128)],
        replicas: 1,
        services: vec![],
    };
    let err = h.coord.create_deployment(&h.owner, "small", "web", huge).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h.coord.create_deployment(&h.owner, "small", "web", web(keel_core::MAX_REPLICAS + 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.fingerprint(), before);
    assert_eq!(h.mock.ops().len(), calls);

    h.coord.create_deployment(&h.owner, "small", "web", web(1)).await.unwrap();
    let err = h.coord.set_replicas(&h.owner, "small", "web", u32::MAX).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = h.coord.set_replicas(&h.owner, "small", "web", keel_core::MAX_REPLICAS).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(h.coord.namespace_usage(&h.owner, "small").unwrap().cpu, 200);
}

#[tokio::test]
async fn unstorable_version_rename_is_refused() {
    let h = harness();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_deployment(&h.owner, "ns1", "web", web(1)).await.unwrap();
    let before = h.fingerprint();

    assert_eq!("9223372036854775808.0.0".parse::<SemVer>().unwrap_err().kind(), ErrorKind::Validation);
    let err = h.coord.rename_version(&h.owner, "ns1", "web", v(1, 0, 0), v(1 << 63, 0, 0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.fingerprint(), before);

    // History still loads and the deployment stays usable.
    assert_eq!(h.coord.list_versions(&h.owner, "ns1", "web").unwrap().len(), 1);
    h.coord.set_replicas(&h.owner, "ns1", "web", 2).await.unwrap();
}

#[tokio::test]
async fn read_only_owner_cannot_resize_or_delete() {
    let h = harness();
    let admin = h.admin();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.create_volume(&h.owner, "data", 10, 1, true).unwrap();
    h.coord.restrict_all_access(&admin, h.owner.actor.id, None, AccessLevel::Read).unwrap();
    let before = h.fingerprint();

    let err = h.coord.resize_namespace(&h.owner, "ns1", "large").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h.coord.delete_namespace(&h.owner, "ns1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h.coord.resize_volume(&h.owner, "data", 20, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h.coord.delete_volume(&h.owner, "data").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h.coord.grant_access(&h.owner, ResourceKind::Namespace, "ns1", h.user().actor.id, AccessLevel::Read).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(h.fingerprint(), before);
    assert!(!h.mock.ops().contains(&OrchestratorOp::DeleteNamespace));

    // Reads still work.
    assert_eq!(h.coord.get_namespace(&h.owner, "ns1").unwrap().access, AccessLevel::Read);
    assert_eq!(h.coord.resource_accesses(&h.owner, ResourceKind::Namespace, "ns1").unwrap().len(), 1);

    h.coord.restrict_all_access(&admin, h.owner.actor.id, None, AccessLevel::Owner).unwrap();
    h.coord.resize_namespace(&h.owner, "ns1", "large").await.unwrap();
    h.coord.delete_namespace(&h.owner, "ns1").await.unwrap();
}

#[tokio::test]
async fn restriction_applies_to_namespaces_created_later() {
    let h = harness();
    let admin = h.admin();
    h.coord.create_namespace(&h.owner, "ns1", "small").await.unwrap();
    h.coord.delete_namespace(&h.owner, "ns1").await.unwrap();

    // The owner holds nothing when restricted.
    assert_eq!(h.coord.restrict_all_access(&admin, h.owner.actor.id, None, AccessLevel::Read).unwrap(), 0);
    let ns = h.coord.create_namespace(&h.owner, "ns2", "small").await.unwrap();
    assert_eq!(ns.access, AccessLevel::Read);
    assert!(!h.coord.authorize(&h.owner, ResourceKind::Namespace, "ns2", AccessLevel::ReadWrite).unwrap());
    let err = h.coord.create_deployment(&h.owner, "ns2", "web", web(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    h.coord.restrict_all_access(&admin, h.owner.actor.id, None, AccessLevel::Owner).unwrap();
    assert!(h.coord.authorize(&h.owner, ResourceKind::Namespace, "ns2", AccessLevel::ReadWrite).unwrap());
}
