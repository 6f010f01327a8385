//! Full rebuilds and incremental updates of the listing index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use super::snapshot::IndexSnapshot;
use crate::config::DeletionPolicy;
use crate::embedding::{embed_all, EmbeddingProvider};
use crate::error::Result;
use crate::model::{EmbeddingRecord, IndexedListing, Listing};
use crate::source::DocumentSource;

/// What one build did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    /// Whether the whole corpus was re-read and re-embedded.
    pub full_rebuild: bool,
    /// Listings returned by the source.
    pub fetched: usize,
    /// Listings sent to the embedding provider.
    pub embedded: usize,
    /// Listings dropped because they vanished upstream.
    pub removed: usize,
    /// Listings in the resulting snapshot.
    pub listing_count: usize,
    pub source_cutoff: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// Turns source listings into index snapshots.
pub struct IndexBuilder {
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    embed_batch_size: usize,
}

impl IndexBuilder {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        embed_batch_size: usize,
    ) -> Self {
        Self {
            source,
            embedder,
            embed_batch_size: embed_batch_size.max(1),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn source(&self) -> &Arc<dyn DocumentSource> {
        &self.source
    }

    /// Read the whole source and build a fresh snapshot.
    #[instrument(skip_all, fields(source = self.source.name(), model = self.embedder.model_id()))]
    pub async fn rebuild(&self) -> Result<(IndexSnapshot, BuildReport)> {
        let started = Instant::now();
        let cutoff = Utc::now();

        let (labels, listings) =
            futures::try_join!(self.source.criteria_labels(), self.source.list_all())?;
        let listings = dedupe(listings);
        let fetched = listings.len();
        info!("Rebuilding index from {} listings", fetched);

        let indexed: Vec<IndexedListing> = listings
            .into_iter()
            .map(|l| IndexedListing::resolve(l, &labels))
            .collect();
        let records = self.embed(&indexed).await?;

        let snapshot = IndexSnapshot::new(
            self.embedder.model_id(),
            self.embedder.dimension(),
            cutoff,
            indexed,
            records,
        )?;
        let report = BuildReport {
            full_rebuild: true,
            fetched,
            embedded: fetched,
            removed: 0,
            listing_count: snapshot.len(),
            source_cutoff: cutoff,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        Ok((snapshot, report))
    }

    /// Apply changes made upstream since `current` was built.
    ///
    /// Falls back to [`IndexBuilder::rebuild`] when there is no current
    /// snapshot or it was built with a different embedding model.
    #[instrument(skip_all, fields(source = self.source.name(), ?policy))]
    pub async fn update(
        &self,
        current: Option<&IndexSnapshot>,
        policy: DeletionPolicy,
    ) -> Result<(IndexSnapshot, BuildReport)> {
        let Some(current) = current else {
            info!("No index loaded, running a full rebuild instead of an update");
            return self.rebuild().await;
        };
        let manifest = current.manifest();
        if manifest.embedding_model != self.embedder.model_id()
            || manifest.dimension != self.embedder.dimension()
        {
            warn!(
                "Index was built with {} ({} dims), provider is {} ({} dims); rebuilding",
                manifest.embedding_model,
                manifest.dimension,
                self.embedder.model_id(),
                self.embedder.dimension()
            );
            return self.rebuild().await;
        }

        let started = Instant::now();
        let cutoff = Utc::now();
        let changed = dedupe(
            self.source
                .list_modified_since(manifest.source_cutoff)
                .await?,
        );
        let fetched = changed.len();

        let removals: Vec<String> = match policy {
            DeletionPolicy::Retain => Vec::new(),
            DeletionPolicy::Prune => {
                let present: HashSet<String> = self.source.list_ids().await?.into_iter().collect();
                current
                    .listing_ids()
                    .filter(|id| !present.contains(*id))
                    .map(str::to_string)
                    .collect()
            }
        };

        let upserts = if changed.is_empty() {
            Vec::new()
        } else {
            let labels = self.source.criteria_labels().await?;
            let indexed: Vec<IndexedListing> = changed
                .into_iter()
                .map(|l| IndexedListing::resolve(l, &labels))
                .collect();
            let records = self.embed(&indexed).await?;
            indexed.into_iter().zip(records).collect()
        };

        let snapshot = current.with_changes(upserts, &removals, cutoff)?;
        info!(
            "Index updated: {} changed, {} removed, {} total",
            fetched,
            removals.len(),
            snapshot.len()
        );
        let report = BuildReport {
            full_rebuild: false,
            fetched,
            embedded: fetched,
            removed: removals.len(),
            listing_count: snapshot.len(),
            source_cutoff: cutoff,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        Ok((snapshot, report))
    }

    async fn embed(&self, listings: &[IndexedListing]) -> Result<Vec<EmbeddingRecord>> {
        let documents: Vec<String> = listings.iter().map(|l| l.document.clone()).collect();
        let vectors = embed_all(self.embedder.as_ref(), &documents, self.embed_batch_size).await?;
        let indexed_at = Utc::now();
        Ok(listings
            .iter()
            .zip(vectors)
            .map(|(listing, vector)| EmbeddingRecord {
                listing_id: listing.id().to_string(),
                vector,
                indexed_at,
            })
            .collect())
    }
}

/// Keep the most recently modified version of each id.
fn dedupe(listings: Vec<Listing>) -> Vec<Listing> {
    let mut by_id: BTreeMap<String, Listing> = BTreeMap::new();
    for listing in listings {
        match by_id.get(&listing.id) {
            Some(existing) if existing.updated_at > listing.updated_at => {}
            _ => {
                by_id.insert(listing.id.clone(), listing);
            }
        }
    }
    by_id.into_values().collect()
}
