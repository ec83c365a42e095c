//! Altc store: in-memory queues feeding snapshot delivery.
//!
//! - [`ResourceItemQueue`] holds individually observed objects.
//! - [`BatchAssembler`] drains it into bounded [`Snapshot`]s.
//! - [`SnapshotQueue`] holds the snapshot awaiting acknowledgment.
//!
//! Nothing here is persisted; queue state is lost with the process.

#![forbid(unsafe_code)]

mod assembler;
mod queue;

use altc_core::{ResourceItem, Snapshot, SnapshotId};

pub use assembler::{batch_size, BatchAssembler, Populate};
pub use queue::{QueueItem, WorkQueue};

pub const RESOURCE_ITEM_QUEUE: &str = "altc-resourceObjectQ";
pub const SNAPSHOT_QUEUE: &str = "altc-snapshotObjectsQ";

pub type ResourceItemQueue = WorkQueue<ResourceItem>;
pub type SnapshotQueue = WorkQueue<Snapshot>;

/// Identity of a resource item: kind plus object reference. Objects without
/// metadata fall back to their serialized payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub kind: String,
    pub object: String,
}

impl QueueItem for ResourceItem {
    type Key = ItemKey;

    fn key(&self) -> ItemKey {
        ItemKey {
            kind: self.kind.clone(),
            object: self.object_ref().unwrap_or_else(|| self.payload.to_string()),
        }
    }
}

impl QueueItem for Snapshot {
    type Key = (SnapshotId, u32);

    fn key(&self) -> (SnapshotId, u32) { (self.snapshot_id, self.batch) }
}

impl WorkQueue<ResourceItem> {
    pub fn resource_items() -> Self { Self::new(RESOURCE_ITEM_QUEUE) }
}

impl WorkQueue<Snapshot> {
    pub fn snapshots() -> Self { Self::new(SNAPSHOT_QUEUE) }
}
