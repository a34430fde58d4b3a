//! Direct knowledge edits that bypass staging.
//!
//! Two operations, both synchronous from the caller's point of view:
//!
//! - [`add_knowledge`]: free text → new rules and Q&A pairs, stored at once,
//!   plus the text itself as a one-chunk document for retrieval.
//! - [`correct_knowledge`]: free text describing a change → matching rules
//!   are rewritten **in place** (same row, same code, confidence 1.0).
//!
//! Correction does not go through [`crate::knowledge::update_rule`]:
//! there is no new version row. Instead, stale chunks of the rule's source
//! document are removed so retrieval stops surfacing the old wording. A
//! chunk is stale when it contains more than `overlap_threshold` of the old
//! body's significant words. There is no minimum word count, so a very
//! short old body can match unrelated chunks.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;

use crate::chunk_store::{self, NewChunk};
use crate::config::Config;
use crate::documents;
use crate::domains;
use crate::errors::PipelineError;
use crate::extraction::parse_json;
use crate::knowledge::{self, NewChange, NewQa, NewRule};
use crate::models::{format_rule_code, truncate_chars, KnowledgeStatus, ParseStatus, Rule};
use crate::provider::{AiProvider, ChatRequest};

const ADD_PROMPT: &str = r#"You turn a manager's note into knowledge base entries for a translation bureau.

Split the note into atomic business rules and, where useful, question-answer
pairs a client might ask. Choose domainSlugs only from the given list. Keep
the language of the note. Respond with a single JSON object:
{
  "domainSlugs": ["..."],
  "rules": [{"title": "...", "body": "..."}],
  "qaPairs": [{"question": "...", "answer": "...", "ruleIndex": 0}]
}
ruleIndex is the zero-based position of the rule the answer follows from, or null."#;

const CORRECT_PROMPT: &str = r#"You apply a manager's correction to the rules of a translation bureau.

Find the rule or rules the correction refers to among the listed rules. For
each, write the complete new title and body with the correction applied (not
a diff). Use only rule codes from the list. Keep the language of the rules.
Respond with a single JSON object:
{
  "updates": [{"ruleCode": "R-1", "title": "...", "body": "...", "reason": "..."}]
}
Return an empty updates list when no rule matches."#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddResponse {
    #[serde(default)]
    domain_slugs: Vec<String>,
    #[serde(default)]
    rules: Vec<NoteRule>,
    #[serde(default)]
    qa_pairs: Vec<NoteQa>,
}

#[derive(Debug, Deserialize)]
struct NoteRule {
    title: String,
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteQa {
    question: String,
    answer: String,
    #[serde(default)]
    rule_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CorrectResponse {
    #[serde(default)]
    updates: Vec<RuleRewrite>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuleRewrite {
    rule_code: String,
    title: String,
    body: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSummary {
    pub rule_codes: Vec<String>,
    pub qa_pairs_created: usize,
    pub document_id: String,
    pub chunk_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionSummary {
    pub updated_codes: Vec<String>,
    pub qa_deprecated: u64,
    pub chunks_deleted: usize,
    pub chunk_ids_created: Vec<String>,
}

/// Add knowledge from a free-text note.
pub async fn add_knowledge(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    config: &Config,
    text: &str,
    initiated_by: &str,
) -> Result<AddSummary, PipelineError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(PipelineError::Validation("text must not be empty".into()));
    }
    let known = domains::list_domains(pool).await?;
    let slugs: Vec<&str> = known.iter().map(|d| d.slug.as_str()).collect();
    let request = ChatRequest::json(
        ADD_PROMPT,
        format!("Domains: {}\n\nNote:\n{}", slugs.join(", "), text),
    );
    let raw = provider.complete(&request).await.map_err(PipelineError::provider)?;
    let parsed: AddResponse = parse_json(&raw, config.extraction.raw_prefix_chars)?;

    let domain_ids = domains::resolve_slugs(pool, &parsed.domain_slugs).await?;
    let confidence = config.correction.add_confidence;

    let title = format!("Заметка: {}", truncate_chars(text, 60));
    let document = documents::create_document(pool, &title, text).await?;
    for (i, domain_id) in domain_ids.iter().enumerate() {
        domains::link_document(pool, &document.id, domain_id, confidence, i == 0).await?;
    }

    let mut next = knowledge::next_rule_code(pool).await?;
    let mut summary = AddSummary {
        document_id: document.id.clone(),
        ..AddSummary::default()
    };
    let mut rule_ids = Vec::new();
    for rule in &parsed.rules {
        let code = format_rule_code(next);
        next = next.saturating_add(1);
        let id = knowledge::insert_rule(
            pool,
            &NewRule {
                rule_code: code.clone(),
                title: rule.title.clone(),
                body: rule.body.clone(),
                confidence,
                source_quote: Some(text.to_string()),
                source_location: Some(format!("added by {}", initiated_by)),
                document_id: Some(document.id.clone()),
            },
        )
        .await?;
        for domain_id in &domain_ids {
            domains::link_rule(pool, &id, domain_id, confidence).await?;
        }
        rule_ids.push(id);
        summary.rule_codes.push(code);
    }

    for qa in &parsed.qa_pairs {
        let rule_id = qa.rule_index.and_then(|i| rule_ids.get(i)).cloned();
        let id = knowledge::insert_qa(
            pool,
            &NewQa {
                question: qa.question.clone(),
                answer: qa.answer.clone(),
                rule_id,
                document_id: Some(document.id.clone()),
            },
        )
        .await?;
        for domain_id in &domain_ids {
            domains::link_qa(pool, &id, domain_id).await?;
        }
        summary.qa_pairs_created += 1;
    }

    summary.chunk_id = store_text_chunk(pool, provider, &document.id, text, &domain_ids).await?;
    documents::set_status(pool, &document.id, ParseStatus::Completed, None).await?;

    tracing::info!(
        initiated_by,
        rules = summary.rule_codes.len(),
        qa = summary.qa_pairs_created,
        "knowledge added"
    );
    Ok(summary)
}

/// Apply a free-text correction to existing rules, in place.
pub async fn correct_knowledge(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    config: &Config,
    text: &str,
    initiated_by: &str,
) -> Result<CorrectionSummary, PipelineError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(PipelineError::Validation("text must not be empty".into()));
    }
    let candidates = knowledge::list_rules(
        pool,
        Some(KnowledgeStatus::Active),
        config.correction.candidate_rules,
    )
    .await?;
    if candidates.is_empty() {
        return Err(PipelineError::Validation(
            "there are no active rules to correct".into(),
        ));
    }

    let listing = candidates
        .iter()
        .map(|r| format!("{} | {} | {}", r.rule_code, r.title, r.body))
        .collect::<Vec<_>>()
        .join("\n");
    let request = ChatRequest::json(
        CORRECT_PROMPT,
        format!("Rules:\n{}\n\nCorrection:\n{}", listing, text),
    );
    let raw = provider.complete(&request).await.map_err(PipelineError::provider)?;
    let parsed: CorrectResponse = parse_json(&raw, config.extraction.raw_prefix_chars)?;

    let mut summary = CorrectionSummary::default();
    for rewrite in &parsed.updates {
        let Some(rule) = candidates.iter().find(|r| r.rule_code == rewrite.rule_code.trim()) else {
            tracing::warn!(rule_code = %rewrite.rule_code, "correction names an unknown rule, skipped");
            continue;
        };
        apply_rewrite(pool, provider, config, rule, rewrite, text, initiated_by, &mut summary).await?;
    }

    if summary.updated_codes.is_empty() {
        return Err(PipelineError::Validation(
            "no rule matches the correction".into(),
        ));
    }
    tracing::info!(
        initiated_by,
        updated = ?summary.updated_codes,
        chunks_deleted = summary.chunks_deleted,
        "knowledge corrected"
    );
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
async fn apply_rewrite(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    config: &Config,
    rule: &Rule,
    rewrite: &RuleRewrite,
    correction: &str,
    initiated_by: &str,
    summary: &mut CorrectionSummary,
) -> Result<(), PipelineError> {
    knowledge::overwrite_rule(pool, &rule.id, &rewrite.title, &rewrite.body, 1.0).await?;
    summary.qa_deprecated += knowledge::deprecate_linked_qa(pool, &rule.id).await?;

    let mut conn = pool.acquire().await?;
    knowledge::record_change(
        &mut conn,
        &NewChange {
            target_type: knowledge::TARGET_RULE,
            target_id: &rule.id,
            change_type: knowledge::CHANGE_UPDATE,
            old_value: Some(knowledge::rule_snapshot(&rule.title, &rule.body, rule.confidence, rule.version)),
            new_value: Some(knowledge::rule_snapshot(&rewrite.title, &rewrite.body, 1.0, rule.version)),
            reason: Some(rewrite.reason.as_deref().unwrap_or(correction)),
            initiated_by,
        },
    )
    .await?;
    drop(conn);

    // Remove chunks that still carry the old wording.
    let domain_ids = domains::rule_domain_ids(pool, &rule.id).await?;
    let document_id = match &rule.document_id {
        Some(document_id) => {
            let chunks = chunk_store::list_for_document(pool, document_id).await?;
            for chunk in chunks {
                let ratio = overlap_ratio(&rule.body, &chunk.content, config.correction.min_word_chars);
                if ratio > config.correction.overlap_threshold {
                    tracing::debug!(chunk_id = %chunk.id, ratio, "deleting stale chunk");
                    chunk_store::delete_chunk(pool, &chunk.id).await?;
                    summary.chunks_deleted += 1;
                }
            }
            document_id.clone()
        }
        None => {
            let title = format!("Исправление {}", rule.rule_code);
            let document = documents::create_document(pool, &title, &rewrite.body).await?;
            documents::set_status(pool, &document.id, ParseStatus::Completed, None).await?;
            document.id
        }
    };

    let corrected = format!("{}\n{}", rewrite.title, rewrite.body);
    let chunk_id = store_text_chunk(pool, provider, &document_id, &corrected, &domain_ids).await?;
    summary.chunk_ids_created.push(chunk_id);
    summary.updated_codes.push(rule.rule_code.clone());
    Ok(())
}

/// Embed `text` and store it as one chunk of `document_id`.
async fn store_text_chunk(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    document_id: &str,
    text: &str,
    domain_ids: &[String],
) -> Result<String, PipelineError> {
    let vectors = provider
        .embed(&[text.to_string()])
        .await
        .map_err(PipelineError::provider)?;
    let embedding = vectors.into_iter().next().unwrap_or_default();
    let chunk_index = chunk_store::next_index(pool, document_id).await?;
    let id = chunk_store::insert_chunk(
        pool,
        &NewChunk {
            document_id,
            chunk_index,
            content: text,
            start_char: 0,
            end_char: text.chars().count() as i64,
            embedding: &embedding,
        },
    )
    .await?;
    for domain_id in domain_ids {
        domains::link_chunk(pool, &id, domain_id).await?;
    }
    Ok(id)
}

/// Lowercased alphanumeric tokens at least `min_chars` characters long.
pub fn significant_words(text: &str, min_chars: usize) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= min_chars)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Share of the old text's significant words that also occur in `chunk`.
///
/// 0.0 when the old text has no significant words.
pub fn overlap_ratio(old: &str, chunk: &str, min_chars: usize) -> f64 {
    let old_words = significant_words(old, min_chars);
    if old_words.is_empty() {
        return 0.0;
    }
    let chunk_words = significant_words(chunk, min_chars);
    let shared = old_words.intersection(&chunk_words).count();
    shared as f64 / old_words.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significant_words_skip_short_tokens() {
        let words = significant_words("Стоимость — 100 рублей за лист", 4);
        assert!(words.contains("стоимость"));
        assert!(words.contains("рублей"));
        assert!(words.contains("лист"));
        assert!(!words.contains("100"));
        assert!(!words.contains("за"));
    }

    #[test]
    fn test_overlap_ratio() {
        let old = "Стоимость — 100 рублей";
        let chunk = "Прайс-лист бюро. Стоимость — 100 рублей за страницу. Сроки обсуждаются.";
        assert_eq!(overlap_ratio(old, chunk, 4), 1.0);
        assert_eq!(overlap_ratio(old, "Сроки выполнения заказа", 4), 0.0);
        assert_eq!(overlap_ratio("до 5 дн", "что угодно", 4), 0.0);
    }

    #[test]
    fn test_overlap_ratio_partial() {
        let ratio = overlap_ratio("нотариальное заверение перевода паспорта", "перевод паспорта срочно", 4);
        assert!((ratio - 0.25).abs() < 1e-9);
    }
}
