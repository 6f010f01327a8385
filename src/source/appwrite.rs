//! Appwrite database REST adapter.
//!
//! Listings live in one collection; criterion labels in another. Documents
//! carry their criteria as a JSON string of `{id_criteria, value}` objects.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use moka::future::Cache;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::DocumentSource;
use crate::config::SourceConfig;
use crate::error::{AdapterFailure, Error, Result};
use crate::model::{CriterionValue, Listing};
use crate::transport::{self, RETRY_BACKOFF};

/// How long fetched criterion labels are reused.
const LABEL_TTL: Duration = Duration::from_secs(600);

/// Appwrite caps page size at 100 documents; larger values are clamped.
const MAX_PAGE_SIZE: usize = 100;

#[derive(Deserialize)]
struct DocumentPage {
    #[serde(default)]
    documents: Vec<Value>,
}

#[derive(Deserialize)]
struct StoreDocument {
    #[serde(rename = "$id")]
    id: String,
    #[serde(rename = "$updatedAt")]
    updated_at: DateTime<Utc>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    criterias: Option<Value>,
}

#[derive(Deserialize)]
struct RawCriterion {
    id_criteria: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct CriterionDocument {
    #[serde(rename = "$id")]
    id: String,
    #[serde(default)]
    label: Option<String>,
}

/// Listing source backed by an Appwrite collection.
pub struct AppwriteSource {
    client: reqwest::Client,
    endpoint: String,
    database_id: String,
    collection_id: String,
    criteria_collection_id: String,
    page_size: usize,
    labels: Cache<String, Arc<HashMap<String, String>>>,
}

impl AppwriteSource {
    pub fn from_config(config: &SourceConfig, page_size: usize) -> Result<Self> {
        for (name, value) in [
            ("project_id", &config.project_id),
            ("database_id", &config.database_id),
            ("collection_id", &config.collection_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("source.{} is required", name)));
            }
        }
        let api_key = config.api_key.as_deref().ok_or_else(|| {
            Error::Config("source.api_key (or APPWRITE_API_KEY) is required".into())
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-appwrite-project"),
            HeaderValue::from_str(&config.project_id)
                .map_err(|_| Error::Config("invalid project id".into()))?,
        );
        let mut key = HeaderValue::from_str(api_key)
            .map_err(|_| Error::Config("Appwrite API key is not a valid header value".into()))?;
        key.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-appwrite-key"), key);

        Ok(Self {
            client: transport::build_client(Duration::from_secs(config.timeout_secs), headers)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            database_id: config.database_id.clone(),
            collection_id: config.collection_id.clone(),
            criteria_collection_id: config.criteria_collection_id.clone(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            labels: Cache::builder()
                .max_capacity(4)
                .time_to_live(LABEL_TTL)
                .build(),
        })
    }

    fn documents_url(&self, collection_id: &str) -> String {
        format!(
            "{}/databases/{}/collections/{}/documents",
            self.endpoint,
            urlencoding::encode(&self.database_id),
            urlencoding::encode(collection_id)
        )
    }

    async fn fetch_page(&self, collection_id: &str, queries: &[Value]) -> Result<Vec<Value>> {
        let url = self.documents_url(collection_id);
        let params: Vec<(&str, String)> = queries
            .iter()
            .map(|q| ("queries[]", q.to_string()))
            .collect();

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| transport::adapter_error(e, |f, m| Error::store(f, m), "list documents"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::store(
                transport::classify_status(status),
                format!("list documents failed with status {}", status.as_u16()),
            ));
        }
        let page: DocumentPage = response
            .json()
            .await
            .map_err(|_| Error::store(AdapterFailure::Rejected, "malformed document page"))?;
        Ok(page.documents)
    }

    /// Page through the listing collection with optional extra filters.
    async fn fetch_listings(&self, filters: Vec<Value>) -> Result<Vec<Listing>> {
        let mut listings = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut queries = filters.clone();
            queries.push(json!({"method": "limit", "values": [self.page_size]}));
            queries.push(json!({"method": "offset", "values": [offset]}));

            let documents = transport::with_retry("list documents", RETRY_BACKOFF, || {
                self.fetch_page(&self.collection_id, &queries)
            })
            .await?;
            let fetched = documents.len();
            debug!(offset, fetched, "Fetched listing page");

            listings.extend(documents.into_iter().filter_map(|doc| match parse_listing(doc) {
                Ok(listing) => Some(listing),
                Err(e) => {
                    warn!("Skipping malformed listing document: {}", e);
                    None
                }
            }));

            if fetched < self.page_size {
                break;
            }
            offset += fetched;
        }
        info!("Fetched {} listings from Appwrite", listings.len());
        Ok(listings)
    }

    async fn fetch_labels(&self) -> Result<HashMap<String, String>> {
        let mut labels = HashMap::new();
        let mut offset = 0usize;
        loop {
            let queries = [
                json!({"method": "limit", "values": [MAX_PAGE_SIZE]}),
                json!({"method": "offset", "values": [offset]}),
            ];
            let documents = transport::with_retry("list criteria", RETRY_BACKOFF, || {
                self.fetch_page(&self.criteria_collection_id, &queries)
            })
            .await?;
            let fetched = documents.len();
            for doc in documents {
                match serde_json::from_value::<CriterionDocument>(doc) {
                    Ok(c) => {
                        if let Some(label) = c.label.filter(|l| !l.trim().is_empty()) {
                            labels.insert(c.id, label);
                        }
                    }
                    Err(e) => warn!("Skipping malformed criterion document: {}", e),
                }
            }
            if fetched < MAX_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        Ok(labels)
    }
}

#[async_trait]
impl DocumentSource for AppwriteSource {
    fn name(&self) -> &str {
        "appwrite"
    }

    async fn list_all(&self) -> Result<Vec<Listing>> {
        self.fetch_listings(Vec::new()).await
    }

    async fn list_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<Listing>> {
        let cutoff = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.fetch_listings(vec![json!({
            "method": "greaterThan",
            "attribute": "$updatedAt",
            "values": [cutoff]
        })])
        .await
    }

    async fn criteria_labels(&self) -> Result<HashMap<String, String>> {
        let key = self.criteria_collection_id.clone();
        if let Some(cached) = self.labels.get(&key).await {
            return Ok(cached.as_ref().clone());
        }
        let labels = self.fetch_labels().await?;
        info!("Loaded {} criterion labels", labels.len());
        self.labels.insert(key, Arc::new(labels.clone())).await;
        Ok(labels)
    }
}

/// Convert one raw store document into a listing.
fn parse_listing(doc: Value) -> Result<Listing> {
    let doc: StoreDocument = serde_json::from_value(doc)?;
    Ok(Listing {
        id: doc.id,
        title: doc.title.unwrap_or_default(),
        description: doc.description.unwrap_or_default(),
        price: doc.price.as_ref().and_then(parse_price),
        location: doc.location.filter(|l| !l.trim().is_empty()),
        criteria: doc.criterias.map(parse_criteria).unwrap_or_default(),
        updated_at: doc.updated_at,
    })
}

fn parse_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

/// Criteria arrive either as a JSON-encoded string or as an inline array.
/// Anything unparseable yields no criteria.
fn parse_criteria(value: Value) -> Vec<CriterionValue> {
    let raw: Vec<RawCriterion> = match value {
        Value::String(s) => serde_json::from_str(&s).unwrap_or_default(),
        Value::Array(_) => serde_json::from_value(value).unwrap_or_default(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(|c| CriterionValue {
            criterion_id: c.id_criteria,
            value: match c.value {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            },
        })
        .collect()
}
