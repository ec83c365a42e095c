//! Drains the resource item queue into bounded snapshots.

use std::sync::Arc;

use altc_core::{ResourceItem, Snapshot, SnapshotId};
use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::{ResourceItemQueue, SnapshotQueue};

/// Items to take for the next snapshot: `min(limit, depth)`, where a limit of
/// zero counts as one. Zero means there is nothing to assemble.
pub fn batch_size(limit: usize, depth: usize) -> usize {
    if depth == 0 {
        return 0;
    }
    depth.min(limit.max(1))
}

/// Result of a [`BatchAssembler::populate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Populate {
    /// A snapshot with `items` items was added to the snapshot queue.
    Queued { items: usize, batch: u32 },
    /// The snapshot queue already holds an unacknowledged snapshot.
    Pending(usize),
    /// The resource item queue was empty.
    Empty,
    /// A queue shut down mid-assembly; the partial batch was discarded.
    ShutDown,
}

pub struct BatchAssembler {
    resources: Arc<ResourceItemQueue>,
    snapshots: Arc<SnapshotQueue>,
    batch_limit: usize,
    cluster_name: String,
    cycle: Option<(SnapshotId, u32)>,
}

impl BatchAssembler {
    pub fn new(
        cluster_name: impl Into<String>,
        batch_limit: usize,
        resources: Arc<ResourceItemQueue>,
        snapshots: Arc<SnapshotQueue>,
    ) -> Self {
        Self { resources, snapshots, batch_limit, cluster_name: cluster_name.into(), cycle: None }
    }

    pub fn batch_limit(&self) -> usize { self.batch_limit }

    pub fn cluster_name(&self) -> &str { &self.cluster_name }

    /// Assemble the next snapshot for `snapshot_id` and queue it, unless a
    /// snapshot is still awaiting acknowledgment.
    pub async fn populate(&mut self, snapshot_id: SnapshotId) -> Populate {
        let pending = self.snapshots.len();
        if pending > 0 {
            debug!(pending, "snapshot queue already populated; not adding resource items");
            return Populate::Pending(pending);
        }

        let depth = self.resources.len();
        let size = batch_size(self.batch_limit, depth);
        if size == 0 {
            return Populate::Empty;
        }
        debug!(batch_size = size, depth, "assembling snapshot");

        let mut items: Vec<ResourceItem> = Vec::with_capacity(size);
        while items.len() < size {
            let Some(item) = self.resources.get().await else {
                info!(collected = items.len(), batch_size = size, "resource item queue shut down; discarding partial batch");
                return Populate::ShutDown;
            };
            self.resources.done(&item);
            items.push(item);
        }

        let batch = self.next_batch(snapshot_id);
        let count = items.len();
        let snapshot = Snapshot { cluster_name: self.cluster_name.clone(), snapshot_id, items, batch };
        if !self.snapshots.add(snapshot) {
            info!(items = count, "snapshot queue shut down; discarding assembled batch");
            return Populate::ShutDown;
        }
        counter!("altc_snapshots_assembled_total", 1u64);
        histogram!("altc_snapshot_items", count as f64);
        Populate::Queued { items: count, batch }
    }

    fn next_batch(&mut self, snapshot_id: SnapshotId) -> u32 {
        let batch = match self.cycle {
            Some((current, n)) if current == snapshot_id => n + 1,
            _ => 0,
        };
        self.cycle = Some((snapshot_id, batch));
        batch
    }
}
