//! Nearest-neighbour index over listing embeddings.
//!
//! Exact cosine scan over unit-length copies of every stored vector.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::model::EmbeddingRecord;

/// One neighbour returned by [`VectorIndex::search`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub listing_id: String,
    /// Cosine distance, `1 - cos`, in `[0, 2]`.
    pub distance: f32,
}

/// Flat vector index keyed by listing id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    dimension: usize,
    records: Vec<EmbeddingRecord>,
    /// Unit-length copies of `records[i].vector`; zero vectors stay zero.
    #[serde(skip)]
    normalized: Vec<Vec<f32>>,
    #[serde(skip)]
    positions: HashMap<String, usize>,
}

impl VectorIndex {
    /// Empty index for vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: Vec::new(),
            normalized: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Build an index from records. Later records replace earlier ones with
    /// the same listing id.
    pub fn build(dimension: usize, records: impl IntoIterator<Item = EmbeddingRecord>) -> Result<Self> {
        let mut index = Self::new(dimension);
        for record in records {
            index.upsert(record)?;
        }
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, listing_id: &str) -> bool {
        self.positions.contains_key(listing_id)
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.records
    }

    /// Insert a record or replace the one with the same listing id.
    pub fn upsert(&mut self, record: EmbeddingRecord) -> Result<()> {
        if record.vector.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "embedding for '{}' has dimension {}, index expects {}",
                record.listing_id,
                record.vector.len(),
                self.dimension
            )));
        }
        let unit = unit_vector(&record.vector);
        match self.positions.get(&record.listing_id) {
            Some(&pos) => {
                self.records[pos] = record;
                self.normalized[pos] = unit;
            }
            None => {
                self.positions
                    .insert(record.listing_id.clone(), self.records.len());
                self.records.push(record);
                self.normalized.push(unit);
            }
        }
        Ok(())
    }

    /// Remove a listing's record. Returns whether it was present.
    pub fn remove(&mut self, listing_id: &str) -> bool {
        let Some(pos) = self.positions.remove(listing_id) else {
            return false;
        };
        self.records.swap_remove(pos);
        self.normalized.swap_remove(pos);
        if let Some(moved) = self.records.get(pos) {
            self.positions.insert(moved.listing_id.clone(), pos);
        }
        true
    }

    /// The `k` nearest listings to `query`, ascending distance, ties by id.
    #[instrument(skip_all, fields(index_size = self.records.len(), k))]
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be at least 1".into()));
        }
        if query.len() != self.dimension {
            return Err(Error::InvalidArgument(format!(
                "query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            )));
        }
        let query = unit_vector(query);
        let mut hits: Vec<VectorHit> = self
            .records
            .iter()
            .zip(&self.normalized)
            .map(|(record, unit)| VectorHit {
                listing_id: record.listing_id.clone(),
                distance: cosine_distance(&query, unit),
            })
            .collect();
        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Restore the derived lookup tables after deserialization.
    pub(crate) fn reindex(&mut self) -> Result<()> {
        self.positions.clear();
        self.normalized.clear();
        for (pos, record) in self.records.iter().enumerate() {
            if record.vector.len() != self.dimension {
                return Err(Error::Snapshot(format!(
                    "stored vector for '{}' has dimension {}, expected {}",
                    record.listing_id,
                    record.vector.len(),
                    self.dimension
                )));
            }
            if self
                .positions
                .insert(record.listing_id.clone(), pos)
                .is_some()
            {
                return Err(Error::Snapshot(format!(
                    "duplicate vector for '{}'",
                    record.listing_id
                )));
            }
            self.normalized.push(unit_vector(&record.vector));
        }
        Ok(())
    }
}

fn compare_hits(a: &VectorHit, b: &VectorHit) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then_with(|| a.listing_id.cmp(&b.listing_id))
}

fn unit_vector(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return vec![0.0; v.len()];
    }
    v.iter().map(|x| x / norm).collect()
}

/// `1 - cos(a, b)` for unit vectors; zero vectors sit at distance 1.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (1.0 - dot).clamp(0.0, 2.0)
}
