//! Immutable, fully built index snapshots and their on-disk form.
//!
//! Layout of a snapshot directory:
//!
//! ```text
//! <dir>/manifest.json   human-readable manifest
//! <dir>/snapshot.bin    bincode: manifest copy + listings + vectors
//! ```
//!
//! Both files are written to `*.tmp` and renamed into place, data first.
//! The manifest copy inside `snapshot.bin` must equal `manifest.json`, so a
//! crash between the two renames is detected on load instead of serving a
//! mismatched pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::vector::{VectorHit, VectorIndex};
use crate::error::{Error, Result};
use crate::model::{EmbeddingRecord, IndexedListing};

/// Bumped whenever the on-disk layout changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 2;

const MANIFEST_FILE: &str = "manifest.json";
const DATA_FILE: &str = "snapshot.bin";

/// Describes how and when a snapshot was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub listing_count: usize,
    pub built_at: DateTime<Utc>,
    /// When the build began reading the source; the next incremental update
    /// asks for listings modified after this instant.
    pub source_cutoff: DateTime<Utc>,
    pub embedding_model: String,
    pub dimension: usize,
}

#[derive(Serialize, Deserialize)]
struct SnapshotData {
    manifest: Manifest,
    listings: Vec<IndexedListing>,
    vectors: VectorIndex,
}

/// A complete, consistent version of the search index.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    manifest: Manifest,
    listings: BTreeMap<String, IndexedListing>,
    vectors: VectorIndex,
}

impl IndexSnapshot {
    /// Assemble a snapshot; every vector must belong to a listing and vice versa.
    pub fn new(
        embedding_model: impl Into<String>,
        dimension: usize,
        source_cutoff: DateTime<Utc>,
        listings: Vec<IndexedListing>,
        records: Vec<EmbeddingRecord>,
    ) -> Result<Self> {
        let listings: BTreeMap<String, IndexedListing> = listings
            .into_iter()
            .map(|l| (l.id().to_string(), l))
            .collect();
        let vectors = VectorIndex::build(dimension, records)?;
        let manifest = Manifest {
            format_version: SNAPSHOT_FORMAT_VERSION,
            listing_count: listings.len(),
            built_at: Utc::now(),
            source_cutoff,
            embedding_model: embedding_model.into(),
            dimension,
        };
        let snapshot = Self {
            manifest,
            listings,
            vectors,
        };
        snapshot.check_consistency()?;
        Ok(snapshot)
    }

    /// Copy of this snapshot with listings inserted/replaced and removed.
    ///
    /// `self` is left untouched; readers holding it keep a consistent view.
    pub fn with_changes(
        &self,
        upserts: Vec<(IndexedListing, EmbeddingRecord)>,
        removals: &[String],
        source_cutoff: DateTime<Utc>,
    ) -> Result<Self> {
        let mut next = self.clone();
        for id in removals {
            next.listings.remove(id);
            next.vectors.remove(id);
        }
        for (listing, record) in upserts {
            if listing.id() != record.listing_id {
                return Err(Error::Internal(format!(
                    "embedding for '{}' paired with listing '{}'",
                    record.listing_id,
                    listing.id()
                )));
            }
            next.vectors.upsert(record)?;
            next.listings.insert(listing.id().to_string(), listing);
        }
        next.manifest.listing_count = next.listings.len();
        next.manifest.built_at = Utc::now();
        next.manifest.source_cutoff = source_cutoff;
        next.check_consistency()?;
        Ok(next)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }

    pub fn listing(&self, id: &str) -> Option<&IndexedListing> {
        self.listings.get(id)
    }

    /// Listings in id order.
    pub fn listings(&self) -> impl Iterator<Item = &IndexedListing> {
        self.listings.values()
    }

    pub fn listing_ids(&self) -> impl Iterator<Item = &str> {
        self.listings.keys().map(String::as_str)
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    /// Nearest listings to `query`. `k` larger than the corpus is fine.
    pub fn search_vectors(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        self.vectors.search(query, k)
    }

    fn check_consistency(&self) -> Result<()> {
        if self.vectors.len() != self.listings.len() {
            return Err(Error::Snapshot(format!(
                "{} vectors for {} listings",
                self.vectors.len(),
                self.listings.len()
            )));
        }
        if let Some(orphan) = self
            .vectors
            .records()
            .iter()
            .find(|r| !self.listings.contains_key(&r.listing_id))
        {
            return Err(Error::Snapshot(format!(
                "vector for unknown listing '{}'",
                orphan.listing_id
            )));
        }
        if self.manifest.listing_count != self.listings.len() {
            return Err(Error::Snapshot(format!(
                "manifest lists {} listings, snapshot holds {}",
                self.manifest.listing_count,
                self.listings.len()
            )));
        }
        Ok(())
    }

    /// Whether a persisted snapshot exists in `dir`.
    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE).is_file() && dir.join(DATA_FILE).is_file()
    }

    /// Read only the manifest of a persisted snapshot.
    pub fn read_manifest(dir: &Path) -> Result<Manifest> {
        let file = File::open(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Persist to `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let data = SnapshotData {
            manifest: self.manifest.clone(),
            listings: self.listings.values().cloned().collect(),
            vectors: self.vectors.clone(),
        };

        let data_path = dir.join(DATA_FILE);
        write_atomically(&data_path, |w| {
            bincode::serialize_into(w, &data)?;
            Ok(())
        })?;
        let manifest_path = dir.join(MANIFEST_FILE);
        write_atomically(&manifest_path, |w| {
            serde_json::to_writer_pretty(w, &self.manifest)?;
            Ok(())
        })?;

        info!(
            dir = %dir.display(),
            listings = self.manifest.listing_count,
            model = %self.manifest.embedding_model,
            "Snapshot saved"
        );
        Ok(())
    }

    /// Load a snapshot persisted with [`IndexSnapshot::save`].
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest = Self::read_manifest(dir)?;
        if manifest.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported snapshot format {} (expected {})",
                manifest.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        let file = File::open(dir.join(DATA_FILE))?;
        let data: SnapshotData = bincode::deserialize_from(BufReader::new(file))?;
        if data.manifest != manifest {
            return Err(Error::Snapshot(
                "manifest.json does not match snapshot.bin (interrupted save?)".into(),
            ));
        }
        if data.vectors.dimension() != manifest.dimension {
            return Err(Error::Snapshot(format!(
                "vector dimension {} does not match manifest dimension {}",
                data.vectors.dimension(),
                manifest.dimension
            )));
        }

        let mut vectors = data.vectors;
        vectors.reindex()?;
        let snapshot = Self {
            manifest,
            listings: data
                .listings
                .into_iter()
                .map(|l| (l.id().to_string(), l))
                .collect(),
            vectors,
        };
        snapshot.check_consistency()?;
        debug!(dir = %dir.display(), listings = snapshot.len(), "Snapshot loaded");
        Ok(snapshot)
    }
}

fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let tmp = temp_path(path);
    let file = File::create(&tmp)?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| Error::Io(e.into_error()))?
        .sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
