//! Document records and their parse-status lifecycle.
//!
//! ```text
//! PENDING ──▶ PROCESSING ──▶ COMPLETED   (after commit)
//!                 │
//!                 └────────▶ FAILED      (fatal error or stale reset)
//! ```

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::db::now_ts;
use crate::errors::PipelineError;
use crate::models::{Document, ParseStatus};

pub const STALE_MESSAGE: &str = "processing timed out";

fn row_to_document(row: &SqliteRow) -> Result<Document, PipelineError> {
    let status: String = row.get("parse_status");
    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        raw_text: row.get("raw_text"),
        parse_status: status.parse()?,
        parse_error: row.get("parse_error"),
        retry_count: row.get("retry_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn create_document(
    pool: &SqlitePool,
    title: &str,
    raw_text: &str,
) -> Result<Document, PipelineError> {
    if title.trim().is_empty() {
        return Err(PipelineError::Validation("title must not be empty".into()));
    }
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO documents (id, title, raw_text, parse_status, retry_count, created_at, updated_at)
        VALUES (?, ?, ?, 'PENDING', 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(title.trim())
    .bind(raw_text)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!(document_id = %id, chars = raw_text.chars().count(), "document created");
    get_document(pool, &id).await
}

pub async fn get_document(pool: &SqlitePool, id: &str) -> Result<Document, PipelineError> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("document {}", id)))?;
    row_to_document(&row)
}

pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<Document>, PipelineError> {
    let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at DESC, id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_document).collect()
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: ParseStatus,
    error: Option<&str>,
) -> Result<(), PipelineError> {
    let result = sqlx::query(
        "UPDATE documents SET parse_status = ?, parse_error = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(error)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(PipelineError::NotFound(format!("document {}", id)));
    }
    Ok(())
}

/// Move a document into PROCESSING, counting a retry if the last run failed.
pub async fn mark_processing(pool: &SqlitePool, id: &str) -> Result<(), PipelineError> {
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET retry_count = retry_count + CASE WHEN parse_status = 'FAILED' THEN 1 ELSE 0 END,
            parse_status = 'PROCESSING',
            parse_error = NULL,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(PipelineError::NotFound(format!("document {}", id)));
    }
    Ok(())
}

/// Fail documents that have sat in PROCESSING for longer than `max_age_secs`.
///
/// Returns the number of documents reset.
pub async fn reset_stale(pool: &SqlitePool, max_age_secs: i64) -> Result<u64, PipelineError> {
    let now = now_ts();
    let result = sqlx::query(
        r#"
        UPDATE documents
        SET parse_status = 'FAILED', parse_error = ?, updated_at = ?
        WHERE parse_status = 'PROCESSING' AND updated_at <= ?
        "#,
    )
    .bind(STALE_MESSAGE)
    .bind(now)
    .bind(now - max_age_secs)
    .execute(pool)
    .await?;

    let reset = result.rows_affected();
    if reset > 0 {
        tracing::warn!(count = reset, "reset stale processing documents");
    }
    Ok(reset)
}

/// Delete a document together with its staged items, chunks and links.
///
/// Committed rules and Q&A pairs survive with their `document_id` cleared.
pub async fn delete_document(pool: &SqlitePool, id: &str) -> Result<(), PipelineError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "DELETE FROM chunk_domains WHERE chunk_id IN (SELECT id FROM doc_chunks WHERE document_id = ?)",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM doc_chunks WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM staged_extractions WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM document_domains WHERE document_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    for table in ["rules", "qa_pairs", "domain_suggestions", "ai_questions"] {
        sqlx::query(&format!(
            "UPDATE {} SET document_id = NULL WHERE document_id = ?",
            table
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
    }
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(PipelineError::NotFound(format!("document {}", id)));
    }

    tx.commit().await?;
    tracing::info!(document_id = %id, "document deleted");
    Ok(())
}
