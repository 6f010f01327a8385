//! Listing index: vectors, snapshots, and the machinery that builds them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   fetch    ┌──────────────┐   embed   ┌───────────────────┐
//! │ DocumentSource │──────────▶│ IndexBuilder │─────────▶│ EmbeddingProvider │
//! └────────────────┘            └──────┬───────┘           └───────────────────┘
//!                                      │ IndexSnapshot
//!                                      ▼
//!                             ┌─────────────────┐  publish  ┌─────────────┐
//!                             │ BuildSupervisor │─────────▶│ IndexHandle │◀── readers
//!                             └─────────────────┘           └─────────────┘
//! ```
//!
//! Readers clone the current `Arc<IndexSnapshot>` and keep using it for the
//! whole request; a publish only swaps the pointer.

mod builder;
mod snapshot;
mod supervisor;
mod vector;

pub use builder::{BuildReport, IndexBuilder};
pub use snapshot::{IndexSnapshot, Manifest, SNAPSHOT_FORMAT_VERSION};
pub use supervisor::{
    BuildKind, BuildState, BuildStatus, BuildSupervisor, BuildTicket, CompletedBuild,
};
pub use vector::{VectorHit, VectorIndex};

use static_assertions::assert_impl_all;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Holder of the snapshot currently being served.
#[derive(Debug, Default)]
pub struct IndexHandle {
    current: RwLock<Option<Arc<IndexSnapshot>>>,
}

assert_impl_all!(IndexHandle: Send, Sync);
assert_impl_all!(IndexSnapshot: Send, Sync);

impl IndexHandle {
    /// Handle with nothing loaded; every read fails with `IndexNotReady`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Handle serving `snapshot` from the start.
    pub fn with_snapshot(snapshot: IndexSnapshot) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    /// The snapshot to use for one request.
    pub async fn current(&self) -> Result<Arc<IndexSnapshot>> {
        self.current
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(Error::IndexNotReady)
    }

    pub async fn try_current(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().await.as_ref().cloned()
    }

    pub async fn is_ready(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Make `snapshot` the one new requests see. Returns it.
    pub async fn publish(&self, snapshot: IndexSnapshot) -> Arc<IndexSnapshot> {
        let snapshot = Arc::new(snapshot);
        *self.current.write().await = Some(snapshot.clone());
        snapshot
    }
}
