//! Domains, domain suggestions and the domain link tables.
//!
//! All link writes are upserts keyed on the link table's composite primary
//! key, so writing the same link twice leaves one row.

use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::db::now_ts;
use crate::errors::PipelineError;
use crate::models::{Domain, DomainSuggestionItem};

fn row_to_domain(row: &SqliteRow) -> Domain {
    Domain {
        id: row.get("id"),
        slug: row.get("slug"),
        title: row.get("title"),
        description: row.get("description"),
        parent_id: row.get("parent_id"),
    }
}

/// Create a domain. The parent, if named, must already exist.
pub async fn create_domain(
    pool: &SqlitePool,
    slug: &str,
    title: &str,
    description: Option<&str>,
    parent_slug: Option<&str>,
) -> Result<Domain, PipelineError> {
    let slug = slug.trim();
    if slug.is_empty() || title.trim().is_empty() {
        return Err(PipelineError::Validation(
            "domain slug and title must not be empty".into(),
        ));
    }
    if find_by_slug(pool, slug).await?.is_some() {
        return Err(PipelineError::Validation(format!(
            "domain '{}' already exists",
            slug
        )));
    }
    let parent_id = match parent_slug {
        Some(parent) => Some(
            find_by_slug(pool, parent)
                .await?
                .ok_or_else(|| {
                    PipelineError::Validation(format!("parent domain '{}' does not exist", parent))
                })?
                .id,
        ),
        None => None,
    };

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO domains (id, slug, title, description, parent_id, created_at) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(slug)
    .bind(title.trim())
    .bind(description)
    .bind(&parent_id)
    .bind(now_ts())
    .execute(pool)
    .await?;

    tracing::info!(slug, "domain created");
    Ok(Domain {
        id,
        slug: slug.to_string(),
        title: title.trim().to_string(),
        description: description.map(String::from),
        parent_id,
    })
}

pub async fn list_domains(pool: &SqlitePool) -> Result<Vec<Domain>, PipelineError> {
    let rows = sqlx::query("SELECT * FROM domains ORDER BY slug")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(row_to_domain).collect())
}

pub async fn find_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Domain>, PipelineError> {
    let row = sqlx::query("SELECT * FROM domains WHERE slug = ?")
        .bind(slug.trim())
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(row_to_domain))
}

/// Resolve slugs to domain ids, in order, skipping unknown slugs and repeats.
pub async fn resolve_slugs(
    pool: &SqlitePool,
    slugs: &[String],
) -> Result<Vec<String>, PipelineError> {
    let mut ids = Vec::new();
    for slug in slugs {
        match find_by_slug(pool, slug).await? {
            Some(domain) => {
                if !ids.contains(&domain.id) {
                    ids.push(domain.id);
                }
            }
            None => tracing::warn!(slug = %slug, "unknown domain slug skipped"),
        }
    }
    Ok(ids)
}

pub async fn create_suggestion(
    pool: &SqlitePool,
    item: &DomainSuggestionItem,
    document_id: Option<&str>,
) -> Result<String, PipelineError> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO domain_suggestions
            (id, suggested_slug, title, description, parent_slug, confidence, reasoning, status, document_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&item.suggested_slug)
    .bind(&item.title)
    .bind(&item.description)
    .bind(&item.parent_slug)
    .bind(item.confidence)
    .bind(&item.reason)
    .bind(document_id)
    .bind(now_ts())
    .execute(pool)
    .await?;
    Ok(id)
}

// ============ Link upserts ============

pub async fn link_document(
    pool: &SqlitePool,
    document_id: &str,
    domain_id: &str,
    confidence: f64,
    is_primary: bool,
) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        INSERT INTO document_domains (document_id, domain_id, confidence, is_primary)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(document_id, domain_id) DO UPDATE SET
            confidence = excluded.confidence,
            is_primary = excluded.is_primary
        "#,
    )
    .bind(document_id)
    .bind(domain_id)
    .bind(confidence)
    .bind(is_primary as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn link_rule(
    pool: &SqlitePool,
    rule_id: &str,
    domain_id: &str,
    confidence: f64,
) -> Result<(), PipelineError> {
    sqlx::query(
        r#"
        INSERT INTO rule_domains (rule_id, domain_id, confidence)
        VALUES (?, ?, ?)
        ON CONFLICT(rule_id, domain_id) DO UPDATE SET confidence = excluded.confidence
        "#,
    )
    .bind(rule_id)
    .bind(domain_id)
    .bind(confidence)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn link_qa(pool: &SqlitePool, qa_id: &str, domain_id: &str) -> Result<(), PipelineError> {
    sqlx::query("INSERT INTO qa_domains (qa_id, domain_id) VALUES (?, ?) ON CONFLICT DO NOTHING")
        .bind(qa_id)
        .bind(domain_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn link_chunk(
    pool: &SqlitePool,
    chunk_id: &str,
    domain_id: &str,
) -> Result<(), PipelineError> {
    sqlx::query(
        "INSERT INTO chunk_domains (chunk_id, domain_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(chunk_id)
    .bind(domain_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Domain ids linked to a document, primary links first.
pub async fn document_domain_ids(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<String>, PipelineError> {
    let rows = sqlx::query(
        "SELECT domain_id FROM document_domains WHERE document_id = ? ORDER BY is_primary DESC, confidence DESC",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get("domain_id")).collect())
}

pub async fn rule_domain_ids(pool: &SqlitePool, rule_id: &str) -> Result<Vec<String>, PipelineError> {
    let rows = sqlx::query("SELECT domain_id FROM rule_domains WHERE rule_id = ?")
        .bind(rule_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| r.get("domain_id")).collect())
}
