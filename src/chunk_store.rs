//! Persisted document chunks and their embeddings.

use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::chunk::content_hash;
use crate::db::now_ts;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::errors::PipelineError;
use crate::models::DocChunk;

#[derive(Debug, Clone)]
pub struct NewChunk<'a> {
    pub document_id: &'a str,
    pub chunk_index: i64,
    pub content: &'a str,
    pub start_char: i64,
    pub end_char: i64,
    pub embedding: &'a [f32],
}

fn row_to_chunk(row: &SqliteRow) -> DocChunk {
    let blob: Option<Vec<u8>> = row.get("embedding");
    DocChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        start_char: row.get("start_char"),
        end_char: row.get("end_char"),
        embedding: blob.map(|b| blob_to_vec(&b)).unwrap_or_default(),
    }
}

pub async fn insert_chunk(pool: &SqlitePool, chunk: &NewChunk<'_>) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    let embedding = if chunk.embedding.is_empty() {
        None
    } else {
        Some(vec_to_blob(chunk.embedding))
    };
    sqlx::query(
        r#"
        INSERT INTO doc_chunks (id, document_id, chunk_index, content, start_char, end_char, hash, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(chunk.document_id)
    .bind(chunk.chunk_index)
    .bind(chunk.content)
    .bind(chunk.start_char)
    .bind(chunk.end_char)
    .bind(content_hash(chunk.content))
    .bind(embedding)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn get_chunk(pool: &SqlitePool, id: &str) -> Result<DocChunk, PipelineError> {
    let row = sqlx::query("SELECT * FROM doc_chunks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("chunk {}", id)))?;
    Ok(row_to_chunk(&row))
}

pub async fn list_for_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<DocChunk>, PipelineError> {
    let rows = sqlx::query("SELECT * FROM doc_chunks WHERE document_id = ? ORDER BY chunk_index, created_at")
        .bind(document_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_chunk).collect())
}

/// Chunks that carry an embedding, restricted to `domain_ids` when non-empty.
pub async fn embedded_chunks(
    pool: &SqlitePool,
    domain_ids: &[String],
    since: Option<i64>,
) -> Result<Vec<DocChunk>, PipelineError> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT c.* FROM doc_chunks c WHERE c.embedding IS NOT NULL");
    if !domain_ids.is_empty() {
        qb.push(" AND c.id IN (SELECT chunk_id FROM chunk_domains WHERE domain_id IN (");
        let mut separated = qb.separated(", ");
        for id in domain_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated("))");
    }
    if let Some(since) = since {
        qb.push(" AND c.created_at >= ").push_bind(since);
    }
    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows.iter().map(row_to_chunk).collect())
}

/// Next free chunk index for a document.
pub async fn next_index(pool: &SqlitePool, document_id: &str) -> Result<i64, PipelineError> {
    let row = sqlx::query("SELECT COALESCE(MAX(chunk_index) + 1, 0) AS next FROM doc_chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get("next"))
}

/// Delete a chunk and its domain links.
pub async fn delete_chunk(pool: &SqlitePool, id: &str) -> Result<(), PipelineError> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM chunk_domains WHERE chunk_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM doc_chunks WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
