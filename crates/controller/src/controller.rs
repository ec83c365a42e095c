use std::sync::Arc;
use std::time::Duration;

use altc_client::SnapshotSender;
use altc_core::{SnapshotId, WatchCache};
use altc_store::{BatchAssembler, Populate, ResourceItemQueue, SnapshotQueue};
use anyhow::{anyhow, Context, Result};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::scheduler::{CollectionScheduler, Tick};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub cluster_name: String,
    /// Maximum items per snapshot; zero behaves as one.
    pub batch_limit: usize,
    pub interval: Duration,
}

/// Drives collection and delivery: one scheduler firing per cycle, then an
/// assemble, send, done loop until the resource item queue is empty. At most
/// one snapshot is ever in flight.
pub struct Controller {
    config: ControllerConfig,
    cache: Arc<dyn WatchCache>,
    sender: Arc<dyn SnapshotSender>,
    resources: Arc<ResourceItemQueue>,
    snapshots: Arc<SnapshotQueue>,
}

/// Whether the drain loop should hand back to the scheduler.
enum Drain {
    Idle,
    Terminated,
}

impl Controller {
    pub fn new(config: ControllerConfig, cache: Arc<dyn WatchCache>, sender: Arc<dyn SnapshotSender>) -> Self {
        Self {
            config,
            cache,
            sender,
            resources: Arc::new(ResourceItemQueue::resource_items()),
            snapshots: Arc::new(SnapshotQueue::snapshots()),
        }
    }

    pub fn resource_queue(&self) -> Arc<ResourceItemQueue> { Arc::clone(&self.resources) }

    pub fn snapshot_queue(&self) -> Arc<SnapshotQueue> { Arc::clone(&self.snapshots) }

    /// Run until `cancel` fires. Fails without entering the loop when
    /// registration or the initial cache sync fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            cluster = %self.config.cluster_name,
            batch_limit = self.config.batch_limit,
            interval_secs = self.config.interval.as_secs(),
            "starting controller"
        );
        self.sender.register().await.context("registering with collector")?;

        let shutdown = self.spawn_shutdown(cancel.clone());
        let res = self.run_cycles(&cancel).await;
        shutdown.abort();
        self.shut_down_queues();
        info!("controller loop terminated");
        res
    }

    async fn run_cycles(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("cancelled while waiting for cache sync");
                return Ok(());
            }
            synced = self.cache.wait_for_sync() => synced.context("waiting for watch cache sync")?,
        }

        let scheduler = Arc::new(CollectionScheduler::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.resources),
            Arc::clone(&self.snapshots),
            self.config.interval,
        ));
        let mut assembler = BatchAssembler::new(
            self.config.cluster_name.clone(),
            self.config.batch_limit,
            Arc::clone(&self.resources),
            Arc::clone(&self.snapshots),
        );

        loop {
            match scheduler.spawn(cancel.clone()).await {
                Ok(Tick::Ready) => {}
                Ok(Tick::Stopped) => return Ok(()),
                Err(e) => return Err(anyhow!("collection task failed: {}", e)),
            }
            let snapshot_id = SnapshotId::generate();
            info!(
                snapshot_id = %snapshot_id,
                items = self.resources.len(),
                pending_snapshots = self.snapshots.len(),
                "draining queues"
            );
            if let Drain::Terminated = self.drain(&mut assembler, snapshot_id, cancel).await {
                return Ok(());
            }
        }
    }

    async fn drain(&self, assembler: &mut BatchAssembler, snapshot_id: SnapshotId, cancel: &CancellationToken) -> Drain {
        loop {
            if cancel.is_cancelled() {
                return Drain::Terminated;
            }
            match assembler.populate(snapshot_id).await {
                Populate::Queued { items, batch } => debug!(items, batch, "snapshot assembled"),
                Populate::Pending(n) => debug!(pending = n, "retrying pending snapshot"),
                Populate::Empty => {}
                Populate::ShutDown => return Drain::Terminated,
            }
            if self.snapshots.is_empty() {
                return Drain::Idle;
            }
            let Some(snapshot) = self.snapshots.get().await else {
                return Drain::Terminated;
            };

            let sent = self.sender.send(&snapshot, cancel).await;
            self.snapshots.done(&snapshot);
            match sent {
                Ok(()) => info!(
                    snapshot_id = %snapshot.snapshot_id,
                    batch = snapshot.batch,
                    items = snapshot.len(),
                    remaining = self.resources.len(),
                    "snapshot sent"
                ),
                Err(e) => {
                    counter!("altc_snapshots_requeued_total", 1u64);
                    warn!(
                        snapshot_id = %snapshot.snapshot_id,
                        batch = snapshot.batch,
                        items = snapshot.len(),
                        error = %e,
                        "send failed; re-queueing snapshot"
                    );
                    if !self.snapshots.add(snapshot) {
                        return Drain::Terminated;
                    }
                }
            }
            if self.resources.is_empty() {
                return Drain::Idle;
            }
        }
    }

    fn spawn_shutdown(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let resources = Arc::clone(&self.resources);
        let snapshots = Arc::clone(&self.snapshots);
        tokio::spawn(async move {
            cancel.cancelled().await;
            info!(queue = resources.name(), depth = resources.len(), "shutting down queue");
            resources.shut_down();
            info!(queue = snapshots.name(), depth = snapshots.len(), "shutting down queue");
            snapshots.shut_down();
        })
    }

    fn shut_down_queues(&self) {
        self.resources.shut_down();
        self.snapshots.shut_down();
    }
}
