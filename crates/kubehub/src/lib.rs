//! Altc kubehub – list+watch wiring for the tracked resource kinds, exposed
//! as a [`WatchCache`].

#![forbid(unsafe_code)]

use std::time::Duration;

use altc_core::{ObservedObject, WatchCache};
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1 as apps, batch::v1 as batch, core::v1 as corev1, networking::v1 as networking,
    rbac::v1 as rbac, storage::v1 as storage,
};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::{
        reflector::{self, store::Writer, Store},
        watcher, WatchStreamExt,
    },
    Client,
};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYNC_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Resource kinds whose objects are collected into snapshots.
pub fn tracked_resources() -> Vec<ApiResource> {
    vec![
        ApiResource::erase::<corev1::ConfigMap>(&()),
        ApiResource::erase::<corev1::Endpoints>(&()),
        ApiResource::erase::<corev1::Event>(&()),
        ApiResource::erase::<corev1::LimitRange>(&()),
        ApiResource::erase::<corev1::Namespace>(&()),
        ApiResource::erase::<corev1::Node>(&()),
        ApiResource::erase::<corev1::PersistentVolumeClaim>(&()),
        ApiResource::erase::<corev1::PodTemplate>(&()),
        ApiResource::erase::<corev1::Pod>(&()),
        ApiResource::erase::<corev1::ReplicationController>(&()),
        ApiResource::erase::<corev1::ResourceQuota>(&()),
        ApiResource::erase::<corev1::Secret>(&()),
        ApiResource::erase::<corev1::ServiceAccount>(&()),
        ApiResource::erase::<corev1::Service>(&()),
        ApiResource::erase::<apps::Deployment>(&()),
        ApiResource::erase::<apps::DaemonSet>(&()),
        ApiResource::erase::<apps::ReplicaSet>(&()),
        ApiResource::erase::<apps::StatefulSet>(&()),
        ApiResource::erase::<batch::CronJob>(&()),
        ApiResource::erase::<batch::Job>(&()),
        ApiResource::erase::<networking::Ingress>(&()),
        ApiResource::erase::<networking::NetworkPolicy>(&()),
        ApiResource::erase::<rbac::ClusterRole>(&()),
        ApiResource::erase::<rbac::ClusterRoleBinding>(&()),
        ApiResource::erase::<rbac::Role>(&()),
        ApiResource::erase::<rbac::RoleBinding>(&()),
        ApiResource::erase::<storage::CSIStorageCapacity>(&()),
    ]
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn observed_from(kind: &str, obj: &DynamicObject) -> Result<ObservedObject> {
    let mut payload = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut payload);
    Ok(ObservedObject { kind: kind.to_string(), payload })
}

struct TrackedKind {
    kind: String,
    store: Store<DynamicObject>,
}

/// Cluster-wide reflector stores, one per tracked kind.
pub struct KubeWatchCache {
    kinds: Vec<TrackedKind>,
}

impl KubeWatchCache {
    /// Spawn one reflector per resource. The tasks stop when `cancel` fires.
    pub fn start(client: Client, resources: Vec<ApiResource>, cancel: CancellationToken) -> (Self, Vec<JoinHandle<()>>) {
        let mut kinds = Vec::with_capacity(resources.len());
        let mut tasks = Vec::with_capacity(resources.len());
        for ar in resources {
            let writer: Writer<DynamicObject> = Writer::new(ar.clone());
            let store = writer.as_reader();
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
            tasks.push(tokio::spawn(run_reflector(ar.kind.clone(), api, writer, cancel.clone())));
            kinds.push(TrackedKind { kind: ar.kind, store });
        }
        (Self { kinds }, tasks)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.iter().map(|k| k.kind.as_str())
    }
}

async fn run_reflector(kind: String, api: Api<DynamicObject>, writer: Writer<DynamicObject>, cancel: CancellationToken) {
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default())).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, "watcher started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(kind = %kind, "watcher cancelled");
                break;
            }
            ev = stream.next() => match ev {
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    counter!("altc_watch_errors_total", 1u64);
                    warn!(kind = %kind, error = %e, "watch error; backing off");
                }
                None => {
                    warn!(kind = %kind, "watcher stream ended");
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl WatchCache for KubeWatchCache {
    async fn wait_for_sync(&self) -> Result<()> {
        for tracked in &self.kinds {
            loop {
                match tokio::time::timeout(SYNC_REPORT_INTERVAL, tracked.store.wait_until_ready()).await {
                    Ok(Ok(())) => {
                        debug!(kind = %tracked.kind, "cache synced");
                        break;
                    }
                    Ok(Err(_)) => return Err(anyhow!("{} cache writer dropped before initial sync", tracked.kind)),
                    Err(_) => info!(kind = %tracked.kind, "cache has not synced yet"),
                }
            }
        }
        info!(kinds = self.kinds.len(), "all caches synced");
        Ok(())
    }

    fn list(&self) -> Vec<ObservedObject> {
        let mut out = Vec::new();
        for tracked in &self.kinds {
            let objects = tracked.store.state();
            debug!(kind = %tracked.kind, count = objects.len(), "collecting objects from cache");
            for obj in objects.iter() {
                match observed_from(&tracked.kind, obj) {
                    Ok(o) => out.push(o),
                    Err(e) => warn!(kind = %tracked.kind, error = ?e, "skipping object"),
                }
            }
        }
        out
    }
}
