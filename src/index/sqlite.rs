//! SQLite-backed vector index.
//!
//! Vectors live in a single table as little-endian f32 blobs; similarity is
//! brute-force cosine computed in process over the filtered candidate set.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{
    cosine_similarity, rank, validate_top_k, IndexEntry, IndexFilter, ScoredEntry, VectorIndex,
};
use crate::errors::EngineError;

pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn open(db_path: PathBuf) -> Result<Self, EngineError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::transient("vector index", e))?;

        let index = Self { pool };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS index_entries (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                model_version TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                ingested_at TEXT NOT NULL,
                embedding BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_owner ON index_entries(owner)")
            .execute(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_document ON index_entries(document_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> IndexEntry {
        let embedding_bytes: Vec<u8> = row.get("embedding");
        let ingested_at: String = row.get("ingested_at");

        IndexEntry {
            chunk_id: row.get("chunk_id"),
            document_id: row.get("document_id"),
            owner: row.get("owner"),
            model_version: row.get("model_version"),
            ordinal: row.get("ordinal"),
            ingested_at: DateTime::parse_from_rfc3339(&ingested_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            vector: Self::deserialize_embedding(&embedding_bytes),
        }
    }

    async fn fetch_filtered(&self, filter: &IndexFilter) -> Result<Vec<IndexEntry>, EngineError> {
        let rows = match (&filter.owner, &filter.document_id) {
            (Some(owner), Some(document_id)) => {
                sqlx::query(
                    "SELECT * FROM index_entries WHERE owner = ?1 AND document_id = ?2",
                )
                .bind(owner)
                .bind(document_id)
                .fetch_all(&self.pool)
                .await
            }
            (Some(owner), None) => {
                sqlx::query("SELECT * FROM index_entries WHERE owner = ?1")
                    .bind(owner)
                    .fetch_all(&self.pool)
                    .await
            }
            (None, Some(document_id)) => {
                sqlx::query("SELECT * FROM index_entries WHERE document_id = ?1")
                    .bind(document_id)
                    .fetch_all(&self.pool)
                    .await
            }
            (None, None) => sqlx::query("SELECT * FROM index_entries").fetch_all(&self.pool).await,
        }
        .map_err(|e| EngineError::transient("vector index", e))?;

        Ok(rows.iter().map(Self::row_to_entry).collect())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), EngineError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::transient("vector index", e))?;

        for entry in &entries {
            let blob = Self::serialize_embedding(&entry.vector);
            sqlx::query(
                "INSERT OR REPLACE INTO index_entries
                 (chunk_id, document_id, owner, model_version, ordinal, ingested_at, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&entry.chunk_id)
            .bind(&entry.document_id)
            .bind(&entry.owner)
            .bind(&entry.model_version)
            .bind(entry.ordinal)
            .bind(entry.ingested_at.to_rfc3339())
            .bind(&blob)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::transient("vector index", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::transient("vector index", e))?;
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<usize, EngineError> {
        let result = sqlx::query("DELETE FROM index_entries WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::transient("vector index", e))?;

        Ok(result.rows_affected() as usize)
    }

    async fn remove_superseded(
        &self,
        document_id: &str,
        keep_chunk_ids: &[String],
    ) -> Result<usize, EngineError> {
        if keep_chunk_ids.is_empty() {
            return self.delete(document_id).await;
        }

        // Candidate sets are per-document and small; filter in process rather
        // than building a dynamic IN clause.
        let rows = sqlx::query("SELECT chunk_id FROM index_entries WHERE document_id = ?1")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::transient("vector index", e))?;

        let mut removed = 0usize;
        for row in rows {
            let chunk_id: String = row.get("chunk_id");
            if keep_chunk_ids.contains(&chunk_id) {
                continue;
            }
            let result = sqlx::query("DELETE FROM index_entries WHERE chunk_id = ?1")
                .bind(&chunk_id)
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::transient("vector index", e))?;
            removed += result.rows_affected() as usize;
        }

        Ok(removed)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<ScoredEntry>, EngineError> {
        validate_top_k(top_k)?;

        let candidates = self.fetch_filtered(filter).await?;
        let scored = candidates
            .into_iter()
            .map(|entry| {
                let score = cosine_similarity(vector, &entry.vector);
                ScoredEntry { entry, score }
            })
            .collect();

        Ok(rank(scored, top_k))
    }

    async fn model_versions(&self, owner: &str) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query(
            "SELECT DISTINCT model_version FROM index_entries WHERE owner = ?1 ORDER BY model_version",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::transient("vector index", e))?;

        Ok(rows.iter().map(|row| row.get("model_version")).collect())
    }

    async fn count(&self, filter: &IndexFilter) -> Result<usize, EngineError> {
        Ok(self.fetch_filtered(filter).await?.len())
    }
}
