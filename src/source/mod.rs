//! Document sources: where listings and criterion labels come from.

mod appwrite;
mod file;
mod memory;

pub use appwrite::AppwriteSource;
pub use file::{FileSource, SourceFile};
pub use memory::InMemorySource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{SourceConfig, SourceKind};
use crate::error::{Error, Result};
use crate::model::Listing;

/// Read access to the backing listing store.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Every listing in the store.
    async fn list_all(&self) -> Result<Vec<Listing>>;

    /// Listings modified strictly after `since`.
    async fn list_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>>;

    /// Ids of every listing in the store.
    async fn list_ids(&self) -> Result<Vec<String>> {
        Ok(self.list_all().await?.into_iter().map(|l| l.id).collect())
    }

    /// Criterion id -> human-readable label.
    async fn criteria_labels(&self) -> Result<HashMap<String, String>>;
}

/// Build the source selected in the configuration.
pub fn from_config(config: &SourceConfig, page_size: usize) -> Result<Arc<dyn DocumentSource>> {
    let source: Arc<dyn DocumentSource> = match config.kind {
        SourceKind::Appwrite => Arc::new(AppwriteSource::from_config(config, page_size)?),
        SourceKind::File => {
            let path = config.file_path.clone().ok_or_else(|| {
                Error::Config("source.file_path is required for the file source".into())
            })?;
            Arc::new(FileSource::new(path))
        }
    };
    Ok(source)
}
