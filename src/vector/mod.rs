//! Vector index abstraction for semantic receipt retrieval.
//!
//! The [`VectorIndex`] trait defines the capability set {add, remove,
//! search} plus the introspection the health endpoint and the re-index
//! sweep need. Two interchangeable back-ends satisfy the contract:
//!
//! | Backend | Module | Storage |
//! |---------|--------|---------|
//! | `memory` | [`memory`] | `HashMap` behind a reader-writer lock |
//! | `persistent` | [`persistent`] | SQLite file inside the vector directory |
//!
//! The contract, including ordering, is identical: `search` returns the
//! top-*k* entries by cosine similarity descending, ties broken by
//! descending identifier. Embeddings are L2-normalized before they reach
//! the index, so similarity is a plain dot product.
//!
//! The index holds exactly one entry per receipt in the relational store;
//! the ingestor keeps the two in step.

pub mod memory;
pub mod persistent;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

use crate::models::{cents_to_string, Receipt};

/// One search result: a receipt identifier with its cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: i64,
    pub similarity: f32,
}

/// Metadata attached to each entry. Filters are equality conjunctions over
/// these keys.
pub type Metadata = BTreeMap<String, String>;

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the entry for `id`.
    async fn add(
        &self,
        id: i64,
        document: &str,
        embedding: &[f32],
        metadata: &Metadata,
    ) -> Result<()>;

    /// Remove the entry for `id`. Removing an absent id is not an error.
    async fn remove(&self, id: i64) -> Result<()>;

    /// Top-`k` entries matching `filter`, by similarity descending, ties by
    /// descending id.
    async fn search(&self, query: &[f32], k: usize, filter: &Metadata) -> Result<Vec<SearchHit>>;

    /// Number of entries.
    async fn len(&self) -> Result<usize>;

    /// All entry identifiers (used by the startup re-index sweep).
    async fn ids(&self) -> Result<Vec<i64>>;
}

/// Open the back-end selected by configuration.
pub async fn create_index(backend: &str, path: &Path) -> Result<Box<dyn VectorIndex>> {
    match backend {
        "memory" => Ok(Box::new(memory::MemoryIndex::new())),
        "persistent" => Ok(Box::new(persistent::PersistentIndex::open(path).await?)),
        other => anyhow::bail!("Unknown vector backend: {}", other),
    }
}

/// The fixed document template embedded for each receipt: vendor, date,
/// total, category, and every line-item description.
pub fn document_for(receipt: &Receipt) -> String {
    let items = if receipt.items.is_empty() {
        "none".to_string()
    } else {
        receipt
            .items
            .iter()
            .map(|i| i.description.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };

    format!(
        "Receipt from {}\nDate: {}\nTotal: {} {}\nCategory: {}\nItems: {}",
        receipt.vendor,
        receipt.day,
        cents_to_string(receipt.total_cents),
        receipt.currency,
        receipt.category.as_deref().unwrap_or("unknown"),
        items
    )
}

/// Metadata map stored alongside each receipt's embedding.
pub fn metadata_for(receipt: &Receipt) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("vendor".to_string(), receipt.vendor_norm.clone());
    meta.insert(
        "category".to_string(),
        receipt
            .category
            .as_deref()
            .unwrap_or("unknown")
            .to_lowercase(),
    );
    meta.insert("total".to_string(), cents_to_string(receipt.total_cents));
    meta.insert("date".to_string(), receipt.day.to_string());
    meta.insert("currency".to_string(), receipt.currency.clone());
    meta.insert("flagged".to_string(), receipt.flags.any().to_string());
    meta
}

/// True when every filter key is present in `metadata` with an equal value.
pub(crate) fn filter_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
}

/// Shared ordering: similarity descending, ties by descending id.
pub(crate) fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.id.cmp(&a.id))
    });
}
