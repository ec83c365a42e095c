#![forbid(unsafe_code)]

use std::sync::Arc;

use altc_core::{Action, ResourceItem, SnapshotId};
use altc_store::{BatchAssembler, Populate, ResourceItemQueue, SnapshotQueue};

fn pod(n: usize) -> ResourceItem {
    let meta = serde_json::json!({
        "name": format!("pod-{}", n),
        "namespace": "default",
        "uid": format!("00000000-0000-0000-0000-{:012}", n),
    });
    ResourceItem::new(Action::Add, "Pod", serde_json::json!({ "metadata": meta }))
}

fn setup(limit: usize, items: usize) -> (Arc<ResourceItemQueue>, Arc<SnapshotQueue>, BatchAssembler) {
    let resources = Arc::new(ResourceItemQueue::resource_items());
    let snapshots = Arc::new(SnapshotQueue::snapshots());
    for n in 0..items {
        assert!(resources.add(pod(n)));
    }
    let assembler = BatchAssembler::new("test-cluster", limit, Arc::clone(&resources), Arc::clone(&snapshots));
    (resources, snapshots, assembler)
}

fn pod_name(item: &ResourceItem) -> String {
    item.payload["metadata"]["name"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn twelve_items_with_limit_five_drain_as_5_5_2() {
    let (resources, snapshots, mut assembler) = setup(5, 12);
    let id = SnapshotId::generate();

    let mut sizes = Vec::new();
    let mut names = Vec::new();
    while !resources.is_empty() {
        assert!(matches!(assembler.populate(id).await, Populate::Queued { .. }));
        let snap = snapshots.get().await.expect("snapshot queued");
        assert_eq!(snap.snapshot_id, id);
        assert_eq!(snap.cluster_name, "test-cluster");
        sizes.push(snap.items.len());
        names.extend(snap.items.iter().map(pod_name));
        snapshots.done(&snap);
    }

    assert_eq!(sizes, vec![5, 5, 2]);
    let expected: Vec<String> = (0..12).map(|n| format!("pod-{}", n)).collect();
    assert_eq!(names, expected, "items keep enqueue order across batches");
    assert_eq!(resources.in_flight(), 0, "every drained item is marked done");
}

#[tokio::test]
async fn empty_source_produces_no_snapshot() {
    let (_resources, snapshots, mut assembler) = setup(5, 0);
    assert_eq!(assembler.populate(SnapshotId::generate()).await, Populate::Empty);
    assert!(snapshots.is_empty());
}

#[tokio::test]
async fn pending_snapshot_blocks_assembly() {
    let (resources, snapshots, mut assembler) = setup(2, 5);
    let id = SnapshotId::generate();
    assert_eq!(assembler.populate(id).await, Populate::Queued { items: 2, batch: 0 });
    assert_eq!(assembler.populate(id).await, Populate::Pending(1));
    assert_eq!(resources.len(), 3, "no items drained while a snapshot is pending");
    assert_eq!(snapshots.len(), 1);
}

#[tokio::test]
async fn batches_within_a_cycle_get_increasing_positions() {
    let (_resources, snapshots, mut assembler) = setup(2, 5);
    let first = SnapshotId::generate();
    let mut batches = Vec::new();
    for _ in 0..2 {
        assembler.populate(first).await;
        let snap = snapshots.get().await.unwrap();
        batches.push(snap.batch);
        snapshots.done(&snap);
    }
    assert_eq!(batches, vec![0, 1]);

    let second = SnapshotId::generate();
    assert_eq!(assembler.populate(second).await, Populate::Queued { items: 1, batch: 0 });
}

#[tokio::test]
async fn failed_snapshot_can_be_requeued_unchanged() {
    let (_resources, snapshots, mut assembler) = setup(3, 3);
    let id = SnapshotId::generate();
    assembler.populate(id).await;
    let snap = snapshots.get().await.unwrap();
    assert!(!snapshots.add(snap.clone()), "checked-out snapshot must be acked before re-add");
    snapshots.done(&snap);
    assert!(snapshots.add(snap.clone()));
    let again = snapshots.get().await.unwrap();
    assert_eq!(again, snap);
}

#[tokio::test]
async fn zero_limit_assembles_single_item_batches() {
    let (_resources, snapshots, mut assembler) = setup(0, 2);
    assert_eq!(assembler.populate(SnapshotId::generate()).await, Populate::Queued { items: 1, batch: 0 });
    assert_eq!(snapshots.get().await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn shut_down_snapshot_queue_discards_batch() {
    let (_resources, snapshots, mut assembler) = setup(5, 3);
    snapshots.shut_down();
    assert_eq!(assembler.populate(SnapshotId::generate()).await, Populate::ShutDown);
    assert!(snapshots.get().await.is_none());
}

#[tokio::test]
async fn duplicate_objects_are_not_requeued() {
    let resources = ResourceItemQueue::resource_items();
    assert!(resources.add(pod(1)));
    assert!(!resources.add(pod(1)));
    let mut renamed = pod(1);
    renamed.kind = "Node".into();
    assert!(resources.add(renamed), "same uid under another kind is a different item");
    assert_eq!(resources.len(), 2);
}

#[tokio::test]
async fn drained_items_can_be_collected_again() {
    let (resources, snapshots, mut assembler) = setup(3, 3);
    assert_eq!(assembler.populate(SnapshotId::generate()).await, Populate::Queued { items: 3, batch: 0 });
    assert_eq!(resources.in_flight(), 0);
    for n in 0..3 {
        assert!(resources.add(pod(n)), "pod-{} must be accepted once assembled", n);
    }
    assert_eq!(snapshots.len(), 1);
}
