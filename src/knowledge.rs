//! Canonical knowledge: rules, Q&A pairs, AI questions and the change log.
//!
//! # Rule versioning
//!
//! Rules keep their code across versions; row identity does not. An update
//! through [`update_rule`] inserts a new ACTIVE row with `version + 1` and
//! `supersedes_rule_id` pointing at the old row, which becomes SUPERSEDED:
//!
//! ```text
//! R-7 v1 (SUPERSEDED) ◀── supersedes ── R-7 v2 (ACTIVE)
//! ```
//!
//! Every update or deprecation appends a [`KnowledgeChange`] row. That table
//! is append-only.

use serde::Deserialize;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::now_ts;
use crate::errors::PipelineError;
use crate::models::{
    next_code_after, AiQuestion, KnowledgeChange, KnowledgeStatus, QaPair, QuestionStatus, Rule,
};

pub const TARGET_RULE: &str = "RULE";
pub const CHANGE_UPDATE: &str = "UPDATE";
pub const CHANGE_DEPRECATE: &str = "DEPRECATE";
pub const CHANGE_APPLIED: &str = "APPLIED";

fn row_to_rule(row: &SqliteRow) -> Result<Rule, PipelineError> {
    let status: String = row.get("status");
    Ok(Rule {
        id: row.get("id"),
        rule_code: row.get("rule_code"),
        title: row.get("title"),
        body: row.get("body"),
        confidence: row.get("confidence"),
        status: status.parse()?,
        version: row.get("version"),
        source_quote: row.get("source_quote"),
        source_location: row.get("source_location"),
        document_id: row.get("document_id"),
        supersedes_rule_id: row.get("supersedes_rule_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_qa(row: &SqliteRow) -> Result<QaPair, PipelineError> {
    let status: String = row.get("status");
    Ok(QaPair {
        id: row.get("id"),
        question: row.get("question"),
        answer: row.get("answer"),
        rule_id: row.get("rule_id"),
        document_id: row.get("document_id"),
        status: status.parse()?,
        version: row.get("version"),
    })
}

// ============ Rules ============

#[derive(Debug, Clone)]
pub struct NewRule {
    pub rule_code: String,
    pub title: String,
    pub body: String,
    pub confidence: f64,
    pub source_quote: Option<String>,
    pub source_location: Option<String>,
    pub document_id: Option<String>,
}

pub async fn insert_rule(pool: &SqlitePool, rule: &NewRule) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO rules (id, rule_code, title, body, confidence, status, version,
                           source_quote, source_location, document_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'ACTIVE', 1, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&rule.rule_code)
    .bind(&rule.title)
    .bind(&rule.body)
    .bind(rule.confidence)
    .bind(&rule.source_quote)
    .bind(&rule.source_location)
    .bind(&rule.document_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn get_rule(pool: &SqlitePool, id: &str) -> Result<Rule, PipelineError> {
    let row = sqlx::query("SELECT * FROM rules WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("rule {}", id)))?;
    row_to_rule(&row)
}

/// Rules sharing a code, oldest version first.
pub async fn rule_versions(pool: &SqlitePool, rule_code: &str) -> Result<Vec<Rule>, PipelineError> {
    let rows = sqlx::query("SELECT * FROM rules WHERE rule_code = ? ORDER BY version, created_at")
        .bind(rule_code)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_rule).collect()
}

/// The ACTIVE rule a document contributed under `rule_code`, if any.
pub async fn find_document_rule(
    pool: &SqlitePool,
    document_id: &str,
    rule_code: &str,
) -> Result<Option<Rule>, PipelineError> {
    let row = sqlx::query(
        "SELECT * FROM rules WHERE document_id = ? AND rule_code = ? AND status = 'ACTIVE' \
         ORDER BY version DESC LIMIT 1",
    )
    .bind(document_id)
    .bind(rule_code)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(row_to_rule).transpose()
}

/// Most recently updated rules, optionally filtered by status.
pub async fn list_rules(
    pool: &SqlitePool,
    status: Option<KnowledgeStatus>,
    limit: i64,
) -> Result<Vec<Rule>, PipelineError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM rules");
    if let Some(status) = status {
        qb.push(" WHERE status = ").push_bind(status.as_str());
    }
    qb.push(" ORDER BY updated_at DESC, rule_code LIMIT ")
        .push_bind(limit);
    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_rule).collect()
}

/// Rules in the given statuses, restricted to `domain_ids` when non-empty
/// and to rows updated at or after `since`.
pub async fn rules_in_domains(
    pool: &SqlitePool,
    statuses: &[KnowledgeStatus],
    domain_ids: &[String],
    since: Option<i64>,
    limit: i64,
) -> Result<Vec<Rule>, PipelineError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT r.* FROM rules r WHERE r.status IN (");
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
    if !domain_ids.is_empty() {
        qb.push(" AND r.id IN (SELECT rule_id FROM rule_domains WHERE domain_id IN (");
        let mut separated = qb.separated(", ");
        for id in domain_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated("))");
    }
    if let Some(since) = since {
        qb.push(" AND r.updated_at >= ").push_bind(since);
    }
    qb.push(" ORDER BY r.confidence DESC, r.updated_at DESC LIMIT ")
        .push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_rule).collect()
}

/// Every rule code ever issued, in any status.
pub async fn all_rule_codes(pool: &SqlitePool) -> Result<Vec<String>, PipelineError> {
    let rows = sqlx::query("SELECT DISTINCT rule_code FROM rules ORDER BY rule_code")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("rule_code")).collect())
}

/// One past the highest ACTIVE rule code.
pub async fn next_rule_code(pool: &SqlitePool) -> Result<u32, PipelineError> {
    let rows = sqlx::query("SELECT rule_code FROM rules WHERE status = 'ACTIVE'")
        .fetch_all(pool)
        .await?;
    let codes: Vec<String> = rows.iter().map(|r| r.get("rule_code")).collect();
    Ok(next_code_after(codes.iter().map(String::as_str)))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    pub title: Option<String>,
    pub body: Option<String>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    #[serde(default = "default_initiator")]
    pub initiated_by: String,
}

fn default_initiator() -> String {
    "admin".to_string()
}

/// Versioned update of an ACTIVE rule; returns the new row.
///
/// Domain links are copied to the new row and ACTIVE Q&A pairs linked to
/// the old row are re-pointed at it.
pub async fn update_rule(
    pool: &SqlitePool,
    rule_id: &str,
    update: &RuleUpdate,
) -> Result<Rule, PipelineError> {
    let old = get_rule(pool, rule_id).await?;
    if old.status != KnowledgeStatus::Active {
        return Err(PipelineError::Validation(format!(
            "rule {} is {} and cannot be updated",
            old.rule_code, old.status
        )));
    }
    if update.title.is_none() && update.body.is_none() && update.confidence.is_none() {
        return Err(PipelineError::Validation(
            "nothing to update: give a title, body or confidence".into(),
        ));
    }

    let new_id = Uuid::new_v4().to_string();
    let now = now_ts();
    let title = update.title.clone().unwrap_or_else(|| old.title.clone());
    let body = update.body.clone().unwrap_or_else(|| old.body.clone());
    let confidence = update.confidence.unwrap_or(old.confidence);

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE rules SET status = 'SUPERSEDED', updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(&old.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO rules (id, rule_code, title, body, confidence, status, version,
                           source_quote, source_location, document_id, supersedes_rule_id,
                           created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'ACTIVE', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&new_id)
    .bind(&old.rule_code)
    .bind(&title)
    .bind(&body)
    .bind(confidence)
    .bind(old.version + 1)
    .bind(&old.source_quote)
    .bind(&old.source_location)
    .bind(&old.document_id)
    .bind(&old.id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        INSERT INTO rule_domains (rule_id, domain_id, confidence)
        SELECT ?, domain_id, confidence FROM rule_domains WHERE rule_id = ?
        ON CONFLICT(rule_id, domain_id) DO NOTHING
        "#,
    )
    .bind(&new_id)
    .bind(&old.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE qa_pairs SET rule_id = ? WHERE rule_id = ? AND status = 'ACTIVE'")
        .bind(&new_id)
        .bind(&old.id)
        .execute(&mut *tx)
        .await?;

    record_change(
        &mut tx,
        &NewChange {
            target_type: TARGET_RULE,
            target_id: &new_id,
            change_type: CHANGE_UPDATE,
            old_value: Some(rule_snapshot(&old.title, &old.body, old.confidence, old.version)),
            new_value: Some(rule_snapshot(&title, &body, confidence, old.version + 1)),
            reason: update.reason.as_deref(),
            initiated_by: &update.initiated_by,
        },
    )
    .await?;
    tx.commit().await?;

    tracing::info!(rule_code = %old.rule_code, version = old.version + 1, "rule updated");
    get_rule(pool, &new_id).await
}

/// Rewrite a rule row without versioning (human correction).
pub async fn overwrite_rule(
    pool: &SqlitePool,
    rule_id: &str,
    title: &str,
    body: &str,
    confidence: f64,
) -> Result<(), PipelineError> {
    let result = sqlx::query(
        "UPDATE rules SET title = ?, body = ?, confidence = ?, updated_at = ? WHERE id = ?",
    )
    .bind(title)
    .bind(body)
    .bind(confidence)
    .bind(now_ts())
    .bind(rule_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(PipelineError::NotFound(format!("rule {}", rule_id)));
    }
    Ok(())
}

/// Deprecate a rule and the ACTIVE Q&A pairs linked to it.
///
/// Returns how many Q&A pairs were deprecated alongside.
pub async fn deprecate_rule(
    pool: &SqlitePool,
    rule_id: &str,
    reason: Option<&str>,
    initiated_by: &str,
) -> Result<u64, PipelineError> {
    let rule = get_rule(pool, rule_id).await?;
    if rule.status == KnowledgeStatus::Deprecated {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE rules SET status = 'DEPRECATED', updated_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(rule_id)
        .execute(&mut *tx)
        .await?;
    let qa = deprecate_linked_qa_in(&mut tx, rule_id).await?;
    record_change(
        &mut tx,
        &NewChange {
            target_type: TARGET_RULE,
            target_id: rule_id,
            change_type: CHANGE_DEPRECATE,
            old_value: Some(serde_json::json!({"status": rule.status.as_str()})),
            new_value: Some(serde_json::json!({"status": "DEPRECATED"})),
            reason,
            initiated_by,
        },
    )
    .await?;
    tx.commit().await?;

    tracing::info!(rule_code = %rule.rule_code, qa_deprecated = qa, "rule deprecated");
    Ok(qa)
}

/// Mark ACTIVE Q&A pairs linked to a rule as DEPRECATED.
pub async fn deprecate_linked_qa(pool: &SqlitePool, rule_id: &str) -> Result<u64, PipelineError> {
    let mut conn = pool.acquire().await?;
    deprecate_linked_qa_in(&mut conn, rule_id).await
}

async fn deprecate_linked_qa_in(
    conn: &mut SqliteConnection,
    rule_id: &str,
) -> Result<u64, PipelineError> {
    let result = sqlx::query(
        "UPDATE qa_pairs SET status = 'DEPRECATED', updated_at = ? WHERE rule_id = ? AND status = 'ACTIVE'",
    )
    .bind(now_ts())
    .bind(rule_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) fn rule_snapshot(title: &str, body: &str, confidence: f64, version: i64) -> serde_json::Value {
    serde_json::json!({
        "title": title,
        "body": body,
        "confidence": confidence,
        "version": version,
    })
}

// ============ Q&A pairs ============

#[derive(Debug, Clone)]
pub struct NewQa {
    pub question: String,
    pub answer: String,
    pub rule_id: Option<String>,
    pub document_id: Option<String>,
}

pub async fn insert_qa(pool: &SqlitePool, qa: &NewQa) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO qa_pairs (id, question, answer, rule_id, document_id, status, version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'ACTIVE', 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&qa.question)
    .bind(&qa.answer)
    .bind(&qa.rule_id)
    .bind(&qa.document_id)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn get_qa(pool: &SqlitePool, id: &str) -> Result<QaPair, PipelineError> {
    let row = sqlx::query("SELECT * FROM qa_pairs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("qa pair {}", id)))?;
    row_to_qa(&row)
}

pub async fn qa_for_rule(pool: &SqlitePool, rule_id: &str) -> Result<Vec<QaPair>, PipelineError> {
    let rows = sqlx::query("SELECT * FROM qa_pairs WHERE rule_id = ? ORDER BY created_at")
        .bind(rule_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_qa).collect()
}

/// Q&A pairs in the given statuses, restricted to `domain_ids` when non-empty.
pub async fn qa_in_domains(
    pool: &SqlitePool,
    statuses: &[KnowledgeStatus],
    domain_ids: &[String],
    since: Option<i64>,
    limit: i64,
) -> Result<Vec<QaPair>, PipelineError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT q.* FROM qa_pairs q WHERE q.status IN (");
    let mut separated = qb.separated(", ");
    for status in statuses {
        separated.push_bind(status.as_str());
    }
    separated.push_unseparated(")");
    if !domain_ids.is_empty() {
        qb.push(" AND q.id IN (SELECT qa_id FROM qa_domains WHERE domain_id IN (");
        let mut separated = qb.separated(", ");
        for id in domain_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated("))");
    }
    if let Some(since) = since {
        qb.push(" AND q.updated_at >= ").push_bind(since);
    }
    qb.push(" ORDER BY q.updated_at DESC LIMIT ").push_bind(limit);

    let rows = qb.build().fetch_all(pool).await?;
    rows.iter().map(row_to_qa).collect()
}

// ============ AI questions ============

pub async fn insert_ai_question(
    pool: &SqlitePool,
    issue_type: &str,
    question: &str,
    context: &serde_json::Value,
    document_id: Option<&str>,
) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO ai_questions (id, issue_type, question, context, status, document_id, created_at)
        VALUES (?, ?, ?, ?, 'OPEN', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(issue_type)
    .bind(question)
    .bind(serde_json::to_string(context)?)
    .bind(document_id)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(id)
}

fn row_to_question(row: &SqliteRow) -> Result<AiQuestion, PipelineError> {
    let status: String = row.get("status");
    let context: String = row.get("context");
    Ok(AiQuestion {
        id: row.get("id"),
        issue_type: row.get("issue_type"),
        question: row.get("question"),
        context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
        status: status.parse()?,
        response: row.get("response"),
        document_id: row.get("document_id"),
        created_at: row.get("created_at"),
    })
}

pub async fn list_open_questions(pool: &SqlitePool) -> Result<Vec<AiQuestion>, PipelineError> {
    let rows = sqlx::query("SELECT * FROM ai_questions WHERE status = 'OPEN' ORDER BY created_at, rowid")
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_question).collect()
}

async fn close_question(
    pool: &SqlitePool,
    id: &str,
    status: QuestionStatus,
    response: Option<&str>,
) -> Result<(), PipelineError> {
    let result = sqlx::query(
        "UPDATE ai_questions SET status = ?, response = ?, answered_at = ? WHERE id = ? AND status = 'OPEN'",
    )
    .bind(status.as_str())
    .bind(response)
    .bind(now_ts())
    .bind(id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(PipelineError::NotFound(format!("open question {}", id)));
    }
    Ok(())
}

pub async fn answer_question(pool: &SqlitePool, id: &str, response: &str) -> Result<(), PipelineError> {
    if response.trim().is_empty() {
        return Err(PipelineError::Validation("response must not be empty".into()));
    }
    close_question(pool, id, QuestionStatus::Answered, Some(response)).await
}

pub async fn dismiss_question(pool: &SqlitePool, id: &str) -> Result<(), PipelineError> {
    close_question(pool, id, QuestionStatus::Dismissed, None).await
}

// ============ Change log ============

pub struct NewChange<'a> {
    pub target_type: &'a str,
    pub target_id: &'a str,
    pub change_type: &'a str,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub reason: Option<&'a str>,
    pub initiated_by: &'a str,
}

pub async fn record_change(
    conn: &mut SqliteConnection,
    change: &NewChange<'_>,
) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let old_value = change.old_value.as_ref().map(|v| v.to_string());
    let new_value = change.new_value.as_ref().map(|v| v.to_string());
    sqlx::query(
        r#"
        INSERT INTO knowledge_changes (id, target_type, target_id, change_type, old_value, new_value,
                                       reason, initiated_by, approved_by, status, created_at, reviewed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(change.target_type)
    .bind(change.target_id)
    .bind(change.change_type)
    .bind(old_value)
    .bind(new_value)
    .bind(change.reason)
    .bind(change.initiated_by)
    .bind(change.initiated_by)
    .bind(CHANGE_APPLIED)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(id)
}

fn row_to_change(row: &SqliteRow) -> KnowledgeChange {
    let parse = |col: &str| -> Option<serde_json::Value> {
        row.get::<Option<String>, _>(col)
            .and_then(|s| serde_json::from_str(&s).ok())
    };
    KnowledgeChange {
        id: row.get("id"),
        target_type: row.get("target_type"),
        target_id: row.get("target_id"),
        change_type: row.get("change_type"),
        old_value: parse("old_value"),
        new_value: parse("new_value"),
        reason: row.get("reason"),
        initiated_by: row.get("initiated_by"),
        approved_by: row.get("approved_by"),
        status: row.get("status"),
        created_at: row.get("created_at"),
        reviewed_at: row.get("reviewed_at"),
    }
}

/// Change log, newest first, optionally for one target.
pub async fn list_changes(
    pool: &SqlitePool,
    target_id: Option<&str>,
) -> Result<Vec<KnowledgeChange>, PipelineError> {
    let rows = match target_id {
        Some(id) => {
            sqlx::query("SELECT * FROM knowledge_changes WHERE target_id = ? ORDER BY created_at DESC, rowid DESC")
                .bind(id)
                .fetch_all(pool)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM knowledge_changes ORDER BY created_at DESC, rowid DESC")
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows.iter().map(row_to_change).collect())
}
