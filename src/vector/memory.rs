//! In-memory [`VectorIndex`] backend.
//!
//! `HashMap` behind `std::sync::RwLock`: searches take the read lock,
//! add/remove take the write lock. Search is brute-force dot product over
//! all stored vectors, fast enough for a single business's receipt volume.
//! Holds no data that is not also in the relational store.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{filter_matches, sort_hits, Metadata, SearchHit, VectorIndex};

struct Entry {
    _document: String,
    embedding: Vec<f32>,
    metadata: Metadata,
}

pub struct MemoryIndex {
    entries: RwLock<HashMap<i64, Entry>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn add(
        &self,
        id: i64,
        document: &str,
        embedding: &[f32],
        metadata: &Metadata,
    ) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            id,
            Entry {
                _document: document.to_string(),
                embedding: embedding.to_vec(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.remove(&id);
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize, filter: &Metadata) -> Result<Vec<SearchHit>> {
        let entries = self.entries.read().unwrap();
        let mut hits: Vec<SearchHit> = entries
            .iter()
            .filter(|(_, e)| filter_matches(&e.metadata, filter))
            .map(|(id, e)| SearchHit {
                id: *id,
                // Vectors are stored normalized; dot product is cosine.
                similarity: dot(query, &e.embedding),
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().unwrap().len())
    }

    async fn ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = self.entries.read().unwrap().keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::l2_normalize;

    fn unit(components: &[f32]) -> Vec<f32> {
        let mut v = components.to_vec();
        l2_normalize(&mut v);
        v
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn add_search_remove_round_trip() {
        let index = MemoryIndex::new();
        index
            .add(1, "doc one", &unit(&[1.0, 0.0]), &Metadata::new())
            .await
            .unwrap();
        index
            .add(2, "doc two", &unit(&[0.0, 1.0]), &Metadata::new())
            .await
            .unwrap();
        assert_eq!(index.len().await.unwrap(), 2);

        let hits = index
            .search(&unit(&[1.0, 0.0]), 10, &Metadata::new())
            .await
            .unwrap();
        assert_eq!(hits[0].id, 1);
        assert!(hits[0].similarity > 0.99);

        index.remove(1).await.unwrap();
        assert_eq!(index.len().await.unwrap(), 1);
        assert_eq!(index.ids().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn add_replaces_existing_entry() {
        let index = MemoryIndex::new();
        index
            .add(1, "old", &unit(&[1.0, 0.0]), &Metadata::new())
            .await
            .unwrap();
        index
            .add(1, "new", &unit(&[0.0, 1.0]), &Metadata::new())
            .await
            .unwrap();
        assert_eq!(index.len().await.unwrap(), 1);

        let hits = index
            .search(&unit(&[0.0, 1.0]), 1, &Metadata::new())
            .await
            .unwrap();
        assert!(hits[0].similarity > 0.99);
    }

    #[tokio::test]
    async fn filter_restricts_results() {
        let index = MemoryIndex::new();
        index
            .add(1, "a", &unit(&[1.0, 0.0]), &meta(&[("category", "groceries")]))
            .await
            .unwrap();
        index
            .add(2, "b", &unit(&[1.0, 0.0]), &meta(&[("category", "fuel")]))
            .await
            .unwrap();

        let hits = index
            .search(
                &unit(&[1.0, 0.0]),
                10,
                &meta(&[("category", "groceries")]),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[tokio::test]
    async fn equal_similarity_orders_by_descending_id() {
        let index = MemoryIndex::new();
        let v = unit(&[1.0, 1.0]);
        for id in 1..=3 {
            index.add(id, "same", &v, &Metadata::new()).await.unwrap();
        }
        let hits = index.search(&v, 10, &Metadata::new()).await.unwrap();
        let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn k_truncates() {
        let index = MemoryIndex::new();
        let v = unit(&[1.0, 0.5]);
        for id in 1..=10 {
            index.add(id, "x", &v, &Metadata::new()).await.unwrap();
        }
        let hits = index.search(&v, 3, &Metadata::new()).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn removing_absent_id_is_not_an_error() {
        let index = MemoryIndex::new();
        index.remove(99).await.unwrap();
    }
}
