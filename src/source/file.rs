//! JSON file document source, for local development and demos.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use super::DocumentSource;
use crate::error::{AdapterFailure, Error, Result};
use crate::model::Listing;

/// On-disk layout of a listing file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFile {
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub criteria_labels: HashMap<String, String>,
}

/// Source reading a [`SourceFile`]. The file is re-read on every call so
/// edits show up on the next update.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read(&self) -> Result<SourceFile> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::store(
                AdapterFailure::Unavailable,
                format!("cannot read {}: {}", self.path.display(), e),
            )
        })?;
        let file: SourceFile = serde_json::from_str(&raw).map_err(|e| {
            Error::store(
                AdapterFailure::Rejected,
                format!("malformed listing file {}: {}", self.path.display(), e),
            )
        })?;
        debug!(
            "Read {} listings from {}",
            file.listings.len(),
            self.path.display()
        );
        Ok(file)
    }
}

#[async_trait]
impl DocumentSource for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn list_all(&self) -> Result<Vec<Listing>> {
        Ok(self.read().await?.listings)
    }

    async fn list_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>> {
        Ok(self
            .read()
            .await?
            .listings
            .into_iter()
            .filter(|l| l.updated_at > since)
            .collect())
    }

    async fn criteria_labels(&self) -> Result<HashMap<String, String>> {
        Ok(self.read().await?.criteria_labels)
    }
}
