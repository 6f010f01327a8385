//! Lexical matching over listing fields and resolved criteria labels.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::model::IndexedListing;

/// Field of a listing a lexical query matched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedField {
    Title,
    Description,
    Criteria,
    Location,
}

/// Lowercase, strip diacritics and collapse whitespace.
///
/// `"  Vélo   ÉLECTRIQUE "` becomes `"velo electrique"`.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case- and diacritic-insensitive substring matcher.
#[derive(Debug, Clone, Default)]
pub struct LexicalMatcher;

impl LexicalMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Match `query` against every listing.
    ///
    /// Returns listing id -> matched fields (sorted, non-empty). An empty or
    /// whitespace-only query matches nothing.
    pub fn find_matches<'a, I>(&self, query: &str, listings: I) -> BTreeMap<String, Vec<MatchedField>>
    where
        I: IntoIterator<Item = &'a IndexedListing>,
    {
        let needle = normalize(query);
        let mut hits = BTreeMap::new();
        if needle.is_empty() {
            return hits;
        }
        for listing in listings {
            let fields = Self::matched_fields(&needle, listing);
            if !fields.is_empty() {
                hits.insert(listing.id().to_string(), fields);
            }
        }
        hits
    }

    fn matched_fields(needle: &str, listing: &IndexedListing) -> Vec<MatchedField> {
        let mut fields = Vec::new();
        if normalize(&listing.listing.title).contains(needle) {
            fields.push(MatchedField::Title);
        }
        if normalize(&listing.listing.description).contains(needle) {
            fields.push(MatchedField::Description);
        }
        if listing
            .criteria_labels
            .iter()
            .any(|label| normalize(label).contains(needle))
        {
            fields.push(MatchedField::Criteria);
        }
        if listing
            .listing
            .location
            .as_deref()
            .is_some_and(|loc| normalize(loc).contains(needle))
        {
            fields.push(MatchedField::Location);
        }
        fields
    }
}
