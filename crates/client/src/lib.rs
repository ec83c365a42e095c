//! Altc client – delivers snapshots to the collector.
//!
//! [`HttpSender`] posts each [`Snapshot`] as (optionally gzipped) JSON with a
//! bearer token from a [`CredentialSource`], retrying transport failures under
//! a fixed exponential [`Backoff`] and an overall deadline.

#![forbid(unsafe_code)]

pub mod auth;
pub mod backoff;
mod sender;

use std::time::Duration;

use altc_core::Snapshot;
use tokio_util::sync::CancellationToken;

pub use auth::{AuthConfig, AuthError, ClientCredentials, Credential, CredentialSource, TokenVerifier};
pub use backoff::Backoff;
pub use sender::{encode, HttpSender, DEFAULT_ENDPOINT, SEND_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("encode snapshot: {0}")]
    Encode(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("credential: {0}")]
    Credential(#[from] AuthError),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("send deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("send cancelled")]
    Cancelled,
}

/// Delivery seam used by the controller.
#[async_trait::async_trait]
pub trait SnapshotSender: Send + Sync {
    /// Establish credentials with the collector before any delivery.
    async fn register(&self) -> Result<(), SendError>;

    /// Deliver one snapshot. Cancellation is honored between attempts only.
    async fn send(&self, snapshot: &Snapshot, cancel: &CancellationToken) -> Result<(), SendError>;
}
