//! Core listing types shared by sources, the index and the search path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label used when a criterion id has no entry in the label table.
pub const UNKNOWN_CRITERION_LABEL: &str = "Unknown criterion";

/// One structured attribute of a listing, as stored upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionValue {
    /// Id of the criterion definition (resolved to a label externally).
    pub criterion_id: String,
    /// Raw value, e.g. "Trek".
    pub value: String,
}

/// A marketplace listing as fetched from the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub criteria: Vec<CriterionValue>,
    pub updated_at: DateTime<Utc>,
}

/// A criterion with its label resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCriterion {
    pub label: String,
    pub value: String,
}

/// A listing as it lives inside an index snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedListing {
    pub listing: Listing,
    /// Resolved criteria, in source order.
    pub criteria: Vec<ResolvedCriterion>,
    /// `"<label>: <value>"` for every criterion, in source order.
    pub criteria_labels: Vec<String>,
    /// Text that was sent to the embedding provider.
    pub document: String,
}

impl IndexedListing {
    /// Resolve criterion labels and render the embedding document.
    pub fn resolve(listing: Listing, labels: &HashMap<String, String>) -> Self {
        let criteria = listing
            .criteria
            .iter()
            .map(|c| ResolvedCriterion {
                label: labels
                    .get(&c.criterion_id)
                    .cloned()
                    .unwrap_or_else(|| UNKNOWN_CRITERION_LABEL.to_string()),
                value: c.value.clone(),
            })
            .collect::<Vec<_>>();
        let criteria_labels = criteria
            .iter()
            .map(|c| format!("{}: {}", c.label, c.value))
            .collect::<Vec<_>>();
        let document = render_document(&listing, &criteria_labels);
        Self {
            listing,
            criteria,
            criteria_labels,
            document,
        }
    }

    pub fn id(&self) -> &str {
        &self.listing.id
    }

    /// Resolved criteria as `(label, value)` pairs.
    pub fn criterion_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.criteria
            .iter()
            .map(|c| (c.label.as_str(), c.value.as_str()))
    }
}

/// Render the text embedded for a listing.
///
/// Layout: title, location, price, criteria block, blank line, description.
pub fn render_document(listing: &Listing, criteria_labels: &[String]) -> String {
    let mut lines = Vec::with_capacity(6 + criteria_labels.len());
    lines.push(format!("Title: {}", listing.title));
    lines.push(format!(
        "Location: {}",
        listing.location.as_deref().unwrap_or("")
    ));
    match listing.price {
        Some(price) => lines.push(format!("Price: {} €", price)),
        None => lines.push("Price: ".to_string()),
    }
    lines.push("Criteria:".to_string());
    for label in criteria_labels {
        lines.push(format!("- {}", label));
    }
    lines.push(String::new());
    lines.push("Description:".to_string());
    lines.push(listing.description.clone());
    lines.join("\n")
}

/// Vector for one listing, stamped with the build that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub listing_id: String,
    pub vector: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
}

/// The listing fields returned to API clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSummary {
    pub id: String,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub location: Option<String>,
    pub criteria: Vec<String>,
}

impl From<&IndexedListing> for ListingSummary {
    fn from(indexed: &IndexedListing) -> Self {
        Self {
            id: indexed.listing.id.clone(),
            title: indexed.listing.title.clone(),
            description: indexed.listing.description.clone(),
            price: indexed.listing.price,
            location: indexed.listing.location.clone(),
            criteria: indexed.criteria_labels.clone(),
        }
    }
}
