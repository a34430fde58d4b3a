//! Staging store: the write-ahead buffer between AI output and the
//! knowledge base.
//!
//! Each staged item is independent. Appends are not grouped into
//! transactions, so a crashed run leaves whatever it had already staged;
//! the next run for the document clears it first.
//!
//! Review state is kept as two flags with one invariant: an item is never
//! both verified and rejected. Every [`VerificationAction`] writes both
//! flags together, so the invariant holds after any sequence of actions.

use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::db::now_ts;
use crate::errors::PipelineError;
use crate::models::{ItemType, Phase, ReviewStatus, StagedExtraction, StagedPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationAction {
    Verify,
    Reject,
    Reset,
}

impl FromStr for VerificationAction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verify" => Ok(VerificationAction::Verify),
            "reject" => Ok(VerificationAction::Reject),
            "reset" => Ok(VerificationAction::Reset),
            other => Err(PipelineError::Validation(format!(
                "unknown action '{}': expected verify, reject, or reset",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingFilter {
    pub phase: Option<Phase>,
    pub item_type: Option<ItemType>,
    pub status: Option<ReviewStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagingCounts {
    pub pending: i64,
    pub verified: i64,
    pub rejected: i64,
}

fn row_to_staged(row: &SqliteRow) -> Result<StagedExtraction, PipelineError> {
    let phase: String = row.get("phase");
    let item_type: String = row.get("item_type");
    let data: String = row.get("data");
    let payload = StagedPayload::from_parts(&item_type, serde_json::from_str(&data)?)?;
    let phase: Phase = phase.parse()?;
    if payload.phase() != phase {
        return Err(PipelineError::Validation(format!(
            "staged item {} has type {} but phase {}",
            row.get::<String, _>("id"),
            item_type,
            phase
        )));
    }

    Ok(StagedExtraction {
        id: row.get("id"),
        document_id: row.get("document_id"),
        phase,
        payload,
        is_verified: row.get::<i64, _>("is_verified") != 0,
        is_rejected: row.get::<i64, _>("is_rejected") != 0,
        verified_at: row.get("verified_at"),
        created_at: row.get("created_at"),
    })
}

/// Stage one extracted item and return its id.
///
/// The phase and item type are taken from the payload variant, so a
/// payload can never be filed under the wrong phase.
pub async fn append(
    pool: &SqlitePool,
    document_id: &str,
    payload: &StagedPayload,
) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO staged_extractions (id, document_id, phase, item_type, data, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(document_id)
    .bind(payload.phase().as_str())
    .bind(payload.item_type().as_str())
    .bind(serde_json::to_string(&payload.data())?)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(id)
}

/// Items for a document in creation order.
pub async fn list_by_document(
    pool: &SqlitePool,
    document_id: &str,
    filter: &StagingFilter,
) -> Result<Vec<StagedExtraction>, PipelineError> {
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT * FROM staged_extractions WHERE document_id = ");
    qb.push_bind(document_id);
    if let Some(phase) = filter.phase {
        qb.push(" AND phase = ").push_bind(phase.as_str());
    }
    if let Some(item_type) = filter.item_type {
        qb.push(" AND item_type = ").push_bind(item_type.as_str());
    }
    match filter.status {
        Some(ReviewStatus::Verified) => {
            qb.push(" AND is_verified = 1");
        }
        Some(ReviewStatus::Rejected) => {
            qb.push(" AND is_rejected = 1");
        }
        Some(ReviewStatus::Pending) => {
            qb.push(" AND is_verified = 0 AND is_rejected = 0");
        }
        None => {}
    }
    qb.push(" ORDER BY created_at, rowid");

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_staged).collect()
}

pub async fn list_verified(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<StagedExtraction>, PipelineError> {
    let filter = StagingFilter {
        status: Some(ReviewStatus::Verified),
        ..StagingFilter::default()
    };
    list_by_document(pool, document_id, &filter).await
}

/// Apply a review action to the given items; returns how many changed.
///
/// Items already in the target state are left alone, so repeating an
/// action reports zero changes.
pub async fn set_verification(
    pool: &SqlitePool,
    ids: &[String],
    action: VerificationAction,
) -> Result<u64, PipelineError> {
    if ids.is_empty() {
        return Err(PipelineError::Validation("ids must not be empty".into()));
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE staged_extractions SET ");
    match action {
        VerificationAction::Verify => {
            qb.push("is_verified = 1, is_rejected = 0, verified_at = ")
                .push_bind(now_ts());
        }
        VerificationAction::Reject => {
            qb.push("is_verified = 0, is_rejected = 1, verified_at = NULL");
        }
        VerificationAction::Reset => {
            qb.push("is_verified = 0, is_rejected = 0, verified_at = NULL");
        }
    }
    qb.push(" WHERE id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");
    qb.push(match action {
        VerificationAction::Verify => " AND NOT (is_verified = 1 AND is_rejected = 0)",
        VerificationAction::Reject => " AND NOT (is_verified = 0 AND is_rejected = 1)",
        VerificationAction::Reset => " AND (is_verified = 1 OR is_rejected = 1)",
    });

    let result = qb.build().execute(pool).await?;
    tracing::debug!(?action, requested = ids.len(), changed = result.rows_affected(), "staging review");
    Ok(result.rows_affected())
}

/// Remove one staged item once its content has been committed.
pub async fn delete_item(pool: &SqlitePool, id: &str) -> Result<u64, PipelineError> {
    let result = sqlx::query("DELETE FROM staged_extractions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Remove every staged item of a document, whatever its review state.
pub async fn clear_all(pool: &SqlitePool, document_id: &str) -> Result<u64, PipelineError> {
    let result = sqlx::query("DELETE FROM staged_extractions WHERE document_id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn counts_by_status(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<StagingCounts, PipelineError> {
    let row = sqlx::query(
        r#"
        SELECT
            COALESCE(SUM(CASE WHEN is_verified = 0 AND is_rejected = 0 THEN 1 ELSE 0 END), 0) AS pending,
            COALESCE(SUM(CASE WHEN is_verified = 1 THEN 1 ELSE 0 END), 0) AS verified,
            COALESCE(SUM(CASE WHEN is_rejected = 1 THEN 1 ELSE 0 END), 0) AS rejected
        FROM staged_extractions
        WHERE document_id = ?
        "#,
    )
    .bind(document_id)
    .fetch_one(pool)
    .await?;

    Ok(StagingCounts {
        pending: row.get("pending"),
        verified: row.get("verified"),
        rejected: row.get("rejected"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parsing() {
        assert_eq!("verify".parse::<VerificationAction>().unwrap(), VerificationAction::Verify);
        assert_eq!("reset".parse::<VerificationAction>().unwrap(), VerificationAction::Reset);
        assert!(matches!(
            "approve".parse::<VerificationAction>(),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_filter_deserializes_from_query_shape() {
        let f: StagingFilter = serde_json::from_value(serde_json::json!({
            "phase": "CHUNKING",
            "itemType": "CHUNK",
            "status": "pending"
        }))
        .unwrap();
        assert_eq!(f.phase, Some(Phase::Chunking));
        assert_eq!(f.item_type, Some(ItemType::Chunk));
        assert_eq!(f.status, Some(ReviewStatus::Pending));
    }
}
