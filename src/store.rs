//! Document store.
//!
//! Durable record of documents, their chunks, and processing status. The
//! ingestion pipeline is the only writer; the retriever reads chunk text
//! back by id. Deleting a document cascades to its chunks.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::errors::EngineError;
use crate::extract::DocumentFormat;

/// Ingestion status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Indexed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Indexed => "indexed",
            DocumentStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "pending" => DocumentStatus::Pending,
            "processing" => DocumentStatus::Processing,
            "indexed" => DocumentStatus::Indexed,
            _ => DocumentStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub owner: String,
    pub filename: String,
    pub format: DocumentFormat,
    pub status: DocumentStatus,
    /// Present iff status is `Failed`.
    pub error: Option<String>,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    /// SHA-256 of the chunk text; re-ingestions compare by content.
    pub content_hash: String,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
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
            .map_err(|e| EngineError::transient("document store", e))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                filename TEXT NOT NULL,
                format TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                text TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(EngineError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner)")
            .execute(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await
            .map_err(EngineError::internal)?;

        Ok(())
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> DocumentRecord {
        let format: String = row.get("format");
        let status: String = row.get("status");
        let created_at: String = row.get("created_at");

        DocumentRecord {
            id: row.get("id"),
            owner: row.get("owner"),
            filename: row.get("filename"),
            format: DocumentFormat::parse(&format).unwrap_or(DocumentFormat::PlainText),
            status: DocumentStatus::parse(&status),
            error: row.get("error"),
            chunk_count: row.get("chunk_count"),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
        ChunkRecord {
            id: row.get("id"),
            document_id: row.get("document_id"),
            ordinal: row.get("ordinal"),
            text: row.get("text"),
            start_offset: row.get("start_offset"),
            end_offset: row.get("end_offset"),
            content_hash: row.get("content_hash"),
        }
    }

    /// Create the document row in `pending`, or return the existing row for
    /// re-ingestion. An existing row owned by someone else is a consistency
    /// violation, not a silent overwrite.
    pub async fn upsert_document(
        &self,
        id: &str,
        owner: &str,
        filename: &str,
        format: DocumentFormat,
    ) -> Result<DocumentRecord, EngineError> {
        if let Some(existing) = self.get_document(id).await? {
            if existing.owner != owner {
                return Err(EngineError::Consistency(format!(
                    "document {} already registered to another owner",
                    id
                )));
            }
            return Ok(existing);
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO documents (id, owner, filename, format, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        )
        .bind(id)
        .bind(owner)
        .bind(filename)
        .bind(format.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::transient("document store", e))?;

        Ok(DocumentRecord {
            id: id.to_string(),
            owner: owner.to_string(),
            filename: filename.to_string(),
            format,
            status: DocumentStatus::Pending,
            error: None,
            chunk_count: 0,
            created_at: now,
        })
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, EngineError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        Ok(row.as_ref().map(Self::row_to_document))
    }

    /// Owner-scoped lookup. An id belonging to a different owner reports
    /// NotFound rather than leaking the document's existence.
    pub async fn get_owned_document(
        &self,
        id: &str,
        owner: &str,
    ) -> Result<DocumentRecord, EngineError> {
        match self.get_document(id).await? {
            Some(record) if record.owner == owner => Ok(record),
            _ => Err(EngineError::NotFound(format!("document {}", id))),
        }
    }

    pub async fn list_documents(&self, owner: &str) -> Result<Vec<DocumentRecord>, EngineError> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE owner = ?1 ORDER BY created_at DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::transient("document store", e))?;

        Ok(rows.iter().map(Self::row_to_document).collect())
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error: Option<&str>,
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE documents SET status = ?1, error = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;
        Ok(())
    }

    /// Swap a document's chunks in one transaction and update the count.
    pub async fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[ChunkRecord],
    ) -> Result<(), EngineError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, ordinal, text, start_offset, end_offset, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.ordinal)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(&chunk.content_hash)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;
        }

        sqlx::query("UPDATE documents SET chunk_count = ?1 WHERE id = ?2")
            .bind(chunks.len() as i64)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        tx.commit()
            .await
            .map_err(|e| EngineError::transient("document store", e))?;
        Ok(())
    }

    pub async fn chunks_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<ChunkRecord>, EngineError> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ?1 ORDER BY ordinal ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<ChunkRecord>, EngineError> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?1")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        Ok(row.as_ref().map(Self::row_to_chunk))
    }

    /// Delete a document; chunks cascade. Returns false when absent.
    pub async fn delete_document(&self, id: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Startup recovery: every document stranded in `processing` by a crash
    /// is marked failed and becomes eligible for re-ingestion. Returns the
    /// affected ids so the caller can clear their index entries.
    pub async fn recover_interrupted(&self) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query("SELECT id FROM documents WHERE status = 'processing'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::transient("document store", e))?;

        let ids: Vec<String> = rows.iter().map(|row| row.get("id")).collect();
        for id in &ids {
            self.set_status(id, DocumentStatus::Failed, Some("interrupted by restart"))
                .await?;
        }
        Ok(ids)
    }
}
