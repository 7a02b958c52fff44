//! End-to-end collection scenarios against the in-memory cluster

mod common;

use common::{
    FakeCluster, Harness, config_map, eventually, eventually_within, object, reference_to,
    terminating, with_owners,
};
use projectgc::gc::model::{FINALIZER_DELETE_DEPENDENTS, ObjectAccessor};
use projectgc::gc::{ClientError, PartitionId, PropagationPolicy};
use std::time::Duration;

#[tokio::test]
async fn test_background_delete_removes_dependents() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(config_map("owner", "owner-uid"));
    let child = cluster.create(with_owners(
        object("apps/v1", "Deployment", "default", "child", "child-uid"),
        vec![reference_to(&owner, false)],
    ));
    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(eventually(|| harness.gc.graph_has_uid("child-uid")).await);
    assert!(cluster.exists(child.uid().unwrap()));

    cluster.delete("owner-uid", PropagationPolicy::Background);

    assert!(eventually(|| !cluster.exists("child-uid")).await);
    let deletes = cluster.deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].name, "child");
    assert_eq!(deletes[0].propagation, Some(PropagationPolicy::Background));
    assert!(eventually(|| !harness.gc.graph_has_uid("child-uid")).await);
}

#[tokio::test]
async fn test_dependent_of_missing_owner_is_deleted() {
    let cluster = FakeCluster::new();
    let ghost = config_map("ghost", "ghost-uid");
    cluster.create(with_owners(config_map("orphaned", "orphaned-uid"), vec![reference_to(&ghost, false)]));

    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(eventually(|| !cluster.exists("orphaned-uid")).await);
}

#[tokio::test]
async fn test_owner_with_same_name_but_new_uid_is_absent() {
    let cluster = FakeCluster::new();
    let original = config_map("owner", "old-uid");
    cluster.create(config_map("owner", "new-uid"));
    cluster.create(with_owners(config_map("child", "child-uid"), vec![reference_to(&original, false)]));

    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(eventually(|| !cluster.exists("child-uid")).await);
    assert!(cluster.exists("new-uid"));
}

#[tokio::test]
async fn test_orphan_delete_keeps_dependents() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(config_map("owner", "owner-uid"));
    cluster.create(with_owners(config_map("a", "a-uid"), vec![reference_to(&owner, true)]));
    cluster.create(with_owners(config_map("b", "b-uid"), vec![reference_to(&owner, false)]));
    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;
    assert!(eventually(|| harness.gc.graph_has_uid("a-uid") && harness.gc.graph_has_uid("b-uid")).await);

    cluster.delete("owner-uid", PropagationPolicy::Orphan);

    assert!(eventually(|| !cluster.exists("owner-uid")).await);
    for uid in ["a-uid", "b-uid"] {
        let dependent = cluster.get(uid).expect("dependent kept");
        assert!(dependent.owner_references().is_empty(), "{uid} still has owners");
    }
    assert!(cluster.deletes().is_empty());
}

#[tokio::test]
async fn test_orphan_finalizer_removed_when_there_are_no_dependents() {
    let cluster = FakeCluster::new();
    cluster.create(config_map("lonely", "lonely-uid"));
    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    cluster.delete("lonely-uid", PropagationPolicy::Orphan);

    assert!(eventually(|| !cluster.exists("lonely-uid")).await);
}

#[tokio::test]
async fn test_foreground_delete_removes_dependents_first() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(config_map("owner", "owner-uid"));
    cluster.create(with_owners(config_map("child", "child-uid"), vec![reference_to(&owner, true)]));
    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;
    assert!(eventually(|| harness.gc.graph_has_uid("child-uid")).await);

    cluster.delete("owner-uid", PropagationPolicy::Foreground);

    assert!(eventually(|| !cluster.exists("child-uid") && !cluster.exists("owner-uid")).await);
    let deletes = cluster.deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].name, "child");
}

#[tokio::test]
async fn test_solid_owner_only_strips_dangling_references() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(config_map("owner", "owner-uid"));
    let ghost = config_map("ghost", "ghost-uid");
    cluster.create(with_owners(
        config_map("child", "child-uid"),
        vec![reference_to(&owner, false), reference_to(&ghost, false)],
    ));

    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(
        eventually(|| {
            cluster
                .get("child-uid")
                .is_some_and(|child| child.owner_references().len() == 1)
        })
        .await
    );
    let child = cluster.get("child-uid").unwrap();
    assert_eq!(child.owner_references()[0].uid, "owner-uid");
    assert!(cluster.deletes().is_empty());
}

#[tokio::test]
async fn test_live_owner_of_another_kind_is_not_collected() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(object("apps/v1", "Deployment", "default", "web", "web-uid"));
    cluster.create(with_owners(
        object("apps/v1", "ReplicaSet", "default", "web-1", "rs-uid"),
        vec![reference_to(&owner, true)],
    ));

    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;
    assert!(eventually(|| harness.gc.graph_has_uid("rs-uid") && harness.gc.graph_has_uid("web-uid")).await);

    // Nothing should happen while the owner lives.
    assert!(!eventually_within(Duration::from_millis(500), || !cluster.deletes().is_empty()).await);
    assert!(cluster.exists("rs-uid"));
    assert_eq!(cluster.patch_count(), 0);
}

#[tokio::test]
async fn test_owner_created_after_dependent_is_resolved() {
    let cluster = FakeCluster::new();
    let owner = config_map("late", "late-uid");
    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    cluster.create(owner.clone());
    cluster.create(with_owners(config_map("child", "child-uid"), vec![reference_to(&owner, false)]));

    assert!(eventually(|| harness.gc.graph_has_uid("child-uid")).await);
    assert!(!eventually_within(Duration::from_millis(500), || !cluster.exists("child-uid")).await);
}

#[tokio::test]
async fn test_cluster_scoped_dependent_of_namespaced_owner_is_left_alone() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(config_map("owner", "owner-uid"));
    cluster.create(with_owners(
        object("rbac.authorization.k8s.io/v1", "ClusterRole", "", "role", "role-uid"),
        vec![reference_to(&owner, false)],
    ));

    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;
    assert!(eventually(|| harness.gc.graph_has_uid("role-uid")).await);

    assert!(!eventually_within(Duration::from_millis(500), || !cluster.exists("role-uid")).await);
    assert!(cluster.deletes().is_empty());
}

#[tokio::test]
async fn test_cluster_scoped_dependent_of_missing_namespaced_owner_is_left_alone() {
    let cluster = FakeCluster::new();
    let ghost = config_map("ghost", "ghost-uid");
    cluster.create(with_owners(
        object("rbac.authorization.k8s.io/v1", "ClusterRole", "", "role", "role-uid"),
        vec![reference_to(&ghost, false)],
    ));

    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;
    assert!(eventually(|| harness.gc.graph_has_uid("role-uid")).await);

    assert!(!eventually_within(Duration::from_millis(500), || !cluster.exists("role-uid")).await);
    assert!(cluster.deletes().is_empty());
    assert_eq!(cluster.get_count("ghost"), 0);
}

#[tokio::test]
async fn test_forbidden_item_is_dropped() {
    let cluster = FakeCluster::new();
    let ghost = config_map("ghost", "ghost-uid");
    cluster.create(with_owners(config_map("child", "child-uid"), vec![reference_to(&ghost, false)]));
    cluster.fail_gets("child", ClientError::Forbidden("no access".into()), usize::MAX);

    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(eventually(|| cluster.get_count("child") >= 1).await);
    // Dropped rather than retried.
    assert!(!eventually_within(Duration::from_millis(500), || cluster.get_count("child") > 1).await);
    assert!(cluster.exists("child-uid"));
    assert!(cluster.deletes().is_empty());
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let cluster = FakeCluster::new();
    let ghost = config_map("ghost", "ghost-uid");
    cluster.create(with_owners(config_map("child", "child-uid"), vec![reference_to(&ghost, false)]));
    cluster.fail_gets("child", ClientError::Transport("connection reset".into()), 3);

    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(eventually(|| !cluster.exists("child-uid")).await);
    assert!(cluster.get_count("child") >= 4);
}

#[tokio::test]
async fn test_owner_in_another_namespace_is_reported() {
    let cluster = FakeCluster::new();
    let owner = cluster.create(object("v1", "ConfigMap", "team-a", "owner", "a-owner"));
    cluster.create(with_owners(config_map("child", "b-child"), vec![reference_to(&owner, false)]));

    let harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(eventually(|| !harness.events.all().is_empty()).await);
    let event = &harness.events.all()[0];
    assert_eq!(event.reason, "OwnerRefInvalidNamespace");
    assert_eq!(event.object.uid, "b-child");
    assert!(event.message.contains("does not exist in namespace \"default\""));
    // The owner is looked up in the child's namespace, where it does not exist.
    assert!(eventually(|| !cluster.exists("b-child")).await);
    assert!(cluster.exists("a-owner"));
}

#[tokio::test]
async fn test_waiting_owner_unblocks_references_before_foreground_delete() {
    const HOLD: &str = "example.com/hold";
    let cluster = FakeCluster::new();
    let owner = terminating(config_map("owner", "e-owner"), &[FINALIZER_DELETE_DEPENDENTS]);
    let middle = config_map("middle", "c-middle");
    let dependent = terminating(
        with_owners(config_map("dependent", "a-dependent"), vec![reference_to(&middle, true)]),
        &[FINALIZER_DELETE_DEPENDENTS, HOLD],
    );
    // Blocking dependents that never go away keep both foreground deletions waiting.
    cluster.create(owner.clone());
    cluster.create(terminating(
        with_owners(config_map("pinned", "d-pinned"), vec![reference_to(&owner, true)]),
        &[HOLD],
    ));
    cluster.create(with_owners(middle.clone(), vec![reference_to(&owner, true)]));
    cluster.create(dependent.clone());
    cluster.create(terminating(
        with_owners(config_map("leaf", "b-leaf"), vec![reference_to(&dependent, true)]),
        &[HOLD],
    ));

    let _harness = Harness::start(vec![(PartitionId::Root, cluster.clone())]).await;

    assert!(
        eventually(|| {
            cluster
                .deletes()
                .iter()
                .any(|d| d.name == "middle" && d.propagation == Some(PropagationPolicy::Foreground))
        })
        .await
    );
    let middle = cluster.get("c-middle").expect("middle waits for its dependents");
    assert!(middle.is_being_deleted());
    assert_eq!(middle.owner_references()[0].block_owner_deletion, Some(false));
}

#[tokio::test]
async fn test_partitions_are_collected_independently() {
    let project = FakeCluster::new();
    let root = FakeCluster::new();

    let project_owner = project.create(config_map("owner", "p-owner"));
    project.create(with_owners(config_map("child", "p-child"), vec![reference_to(&project_owner, false)]));
    let root_owner = root.create(config_map("owner", "r-owner"));
    root.create(with_owners(config_map("child", "r-child"), vec![reference_to(&root_owner, false)]));

    let harness = Harness::start(vec![
        (PartitionId::Root, root.clone()),
        (PartitionId::project("project-a"), project.clone()),
    ])
    .await;
    assert!(eventually(|| harness.gc.graph_has_uid("p-child") && harness.gc.graph_has_uid("r-child")).await);

    project.delete("p-owner", PropagationPolicy::Background);

    assert!(eventually(|| !project.exists("p-child")).await);
    assert!(!eventually_within(Duration::from_millis(300), || !root.exists("r-child")).await);
    assert!(root.deletes().is_empty());
}
