//! In-memory document source.
//!
//! Holds listings in a map that tests and demos mutate between builds. Can be
//! told to fail or to stall, which is how build failure and single-flight
//! behaviour are exercised.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::DocumentSource;
use crate::error::{AdapterFailure, Error, Result};
use crate::model::Listing;

#[derive(Debug, Default)]
struct MemoryState {
    listings: BTreeMap<String, Listing>,
    labels: HashMap<String, String>,
    failing: bool,
}

/// Mutable, in-process listing store.
#[derive(Debug, Default)]
pub struct InMemorySource {
    state: RwLock<MemoryState>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(listings: impl IntoIterator<Item = Listing>) -> Self {
        let state = MemoryState {
            listings: listings.into_iter().map(|l| (l.id.clone(), l)).collect(),
            ..Default::default()
        };
        Self {
            state: RwLock::new(state),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.state.get_mut().labels = labels;
        self
    }

    /// Stall every fetch by `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn upsert(&self, listing: Listing) {
        self.state
            .write()
            .await
            .listings
            .insert(listing.id.clone(), listing);
    }

    pub async fn remove(&self, id: &str) -> Option<Listing> {
        self.state.write().await.listings.remove(id)
    }

    pub async fn set_labels(&self, labels: HashMap<String, String>) {
        self.state.write().await.labels = labels;
    }

    /// Make every call fail as an unavailable store.
    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.failing = failing;
    }

    /// Number of listing fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn begin_fetch(&self) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.read().await.failing {
            return Err(Error::store(
                AdapterFailure::Unavailable,
                "in-memory source is set to fail",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentSource for InMemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_all(&self) -> Result<Vec<Listing>> {
        self.begin_fetch().await?;
        Ok(self.state.read().await.listings.values().cloned().collect())
    }

    async fn list_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>> {
        self.begin_fetch().await?;
        Ok(self
            .state
            .read()
            .await
            .listings
            .values()
            .filter(|l| l.updated_at > since)
            .cloned()
            .collect())
    }

    async fn criteria_labels(&self) -> Result<HashMap<String, String>> {
        let state = self.state.read().await;
        if state.failing {
            return Err(Error::store(
                AdapterFailure::Unavailable,
                "in-memory source is set to fail",
            ));
        }
        Ok(state.labels.clone())
    }
}
