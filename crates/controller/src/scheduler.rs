use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use altc_core::{ResourceItem, WatchCache};
use altc_store::{ResourceItemQueue, SnapshotQueue};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a scheduler firing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The timer fired and the guarded collection ran (or was skipped).
    Ready,
    /// Cancelled before the timer fired; nothing was collected.
    Stopped,
}

/// Outcome of one guarded collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collection {
    /// Objects were enumerated; `added` of them entered the resource item queue.
    Collected { listed: usize, added: usize },
    /// The pipeline still held work, so no objects were enumerated.
    Skipped { resources: usize, snapshots: usize },
}

/// Periodically enumerates the watch cache into the resource item queue.
/// It is the only producer into that queue.
pub struct CollectionScheduler {
    cache: Arc<dyn WatchCache>,
    resources: Arc<ResourceItemQueue>,
    snapshots: Arc<SnapshotQueue>,
    interval: Duration,
}

impl CollectionScheduler {
    pub fn new(
        cache: Arc<dyn WatchCache>,
        resources: Arc<ResourceItemQueue>,
        snapshots: Arc<SnapshotQueue>,
        interval: Duration,
    ) -> Self {
        Self { cache, resources, snapshots, interval }
    }

    pub fn interval(&self) -> Duration { self.interval }

    /// Wait one interval, or until cancelled, then collect.
    pub async fn tick(&self, cancel: &CancellationToken) -> Tick {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("scheduler cancelled before firing");
                return Tick::Stopped;
            }
            _ = tokio::time::sleep(self.interval) => {}
        }
        self.collect();
        Tick::Ready
    }

    /// Run a single [`tick`](Self::tick) on its own task.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<Tick> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.tick(&cancel).await })
    }

    /// Enqueue every cached object as an `Add` item, unless either queue still
    /// holds work from an earlier cycle.
    pub fn collect(&self) -> Collection {
        let resources = self.resources.len();
        let snapshots = self.snapshots.len();
        if resources > 0 || snapshots > 0 {
            counter!("altc_collect_skipped_total", 1u64);
            info!(resources, snapshots, "queues not drained; skipping collection");
            return Collection::Skipped { resources, snapshots };
        }

        info!("collecting objects from watch cache");
        let objects = self.cache.list();
        let listed = objects.len();
        let mut per_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut added = 0usize;
        for object in objects {
            *per_kind.entry(object.kind.clone()).or_default() += 1;
            if self.resources.add(ResourceItem::added(object)) {
                added += 1;
            }
        }
        counter!("altc_collect_objects_total", added as u64);
        for (kind, count) in &per_kind {
            debug!(kind = %kind, count, "collected kind");
        }
        info!(listed, added, kinds = per_kind.len(), "collection finished");
        Collection::Collected { listed, added }
    }
}
