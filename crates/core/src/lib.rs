//! Altc core types shared by the queues, the sender and the controller.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to an object. Polling collection reports every object as `Add`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Update,
    Delete,
}

/// One observed cluster object, tagged with its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceItem {
    pub action: Action,
    pub kind: String,
    /// Raw object document as served by the API server (managedFields stripped).
    pub payload: serde_json::Value,
}

impl ResourceItem {
    pub fn new(action: Action, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { action, kind: kind.into(), payload }
    }

    pub fn added(object: ObservedObject) -> Self {
        Self { action: Action::Add, kind: object.kind, payload: object.payload }
    }

    /// Stable reference to the underlying object: `metadata.uid` when present,
    /// otherwise `namespace/name` (or `name` for cluster-scoped objects).
    pub fn object_ref(&self) -> Option<String> {
        let meta = self.payload.get("metadata")?;
        if let Some(uid) = meta.get("uid").and_then(|v| v.as_str()) {
            return Some(uid.to_string());
        }
        let name = meta.get("name").and_then(|v| v.as_str())?;
        match meta.get("namespace").and_then(|v| v.as_str()) {
            Some(ns) => Some(format!("{}/{}", ns, name)),
            None => Some(name.to_string()),
        }
    }
}

/// Identifier shared by every snapshot produced within one collection cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A bounded batch of resource items; the unit of delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub cluster_name: String,
    pub snapshot_id: SnapshotId,
    #[serde(rename = "data")]
    pub items: Vec<ResourceItem>,
    /// Position of this batch within its cycle. Local bookkeeping only, never sent.
    #[serde(skip)]
    pub batch: u32,
}

impl Snapshot {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

/// An object as enumerated from the watch cache, kind already resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedObject {
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Locally cached, eventually consistent view of cluster objects.
#[async_trait::async_trait]
pub trait WatchCache: Send + Sync {
    /// Resolves once every tracked kind has completed its initial listing.
    async fn wait_for_sync(&self) -> anyhow::Result<()>;

    /// Every object currently held by the cache.
    fn list(&self) -> Vec<ObservedObject>;
}

pub mod prelude {
    pub use super::{Action, ObservedObject, ResourceItem, Snapshot, SnapshotId, WatchCache};
}
