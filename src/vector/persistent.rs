//! Persistent [`VectorIndex`] backend.
//!
//! Stores entries in a dedicated SQLite file (`vectors.sqlite`) inside the
//! configured vector directory, embeddings as little-endian f32 BLOBs and
//! metadata as a JSON object. The directory is one of the two persisted
//! artifacts; deleting it resets semantic search (the relational store
//! remains authoritative and the startup sweep re-indexes it).

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::embedding::{blob_to_vec, vec_to_blob};

use super::{filter_matches, sort_hits, Metadata, SearchHit, VectorIndex};

pub struct PersistentIndex {
    pool: SqlitePool,
}

impl PersistentIndex {
    /// Open (or create) the index under `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("vectors.sqlite");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS receipt_vectors (
                receipt_id INTEGER PRIMARY KEY,
                document TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl VectorIndex for PersistentIndex {
    async fn add(
        &self,
        id: i64,
        document: &str,
        embedding: &[f32],
        metadata: &Metadata,
    ) -> Result<()> {
        let blob = vec_to_blob(embedding);
        let metadata_json = serde_json::to_string(metadata)?;

        sqlx::query(
            r#"
            INSERT INTO receipt_vectors (receipt_id, document, embedding, metadata)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(receipt_id) DO UPDATE SET
                document = excluded.document,
                embedding = excluded.embedding,
                metadata = excluded.metadata
            "#,
        )
        .bind(id)
        .bind(document)
        .bind(blob)
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM receipt_vectors WHERE receipt_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize, filter: &Metadata) -> Result<Vec<SearchHit>> {
        let rows = sqlx::query("SELECT receipt_id, embedding, metadata FROM receipt_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let metadata_json: String = row.get("metadata");
            let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
            if !filter_matches(&metadata, filter) {
                continue;
            }

            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            hits.push(SearchHit {
                id: row.get("receipt_id"),
                similarity: dot(query, &embedding),
            });
        }

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipt_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT receipt_id FROM receipt_vectors ORDER BY receipt_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
