//! Commit engine: promotes verified staged items into the knowledge base.
//!
//! The steps run in a fixed order (domains, suggestions, rules, Q&A,
//! uncertainties, chunks) and are not wrapped in one transaction. Each
//! staged item is deleted as soon as its own write succeeds, so a failed
//! commit leaves only the unwritten items staged and calling commit again
//! picks up where the failure stopped. Domain links are upserts; Q&A pairs
//! whose rule was committed by an earlier attempt find it by document and
//! code.
//!
//! Committing a document with no verified items succeeds with all-zero
//! counts.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;

use crate::chunk_store::{self, NewChunk};
use crate::config::CommitConfig;
use crate::documents;
use crate::domains;
use crate::errors::PipelineError;
use crate::knowledge::{self, NewQa, NewRule};
use crate::models::{ParseStatus, StagedPayload, TextChunk};
use crate::provider::AiProvider;
use crate::staging;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub domains_linked: usize,
    pub domain_suggestions_created: usize,
    pub rules_created: usize,
    pub qa_pairs_created: usize,
    pub ai_questions_created: usize,
    pub chunks_created: usize,
}

impl CommitSummary {
    pub fn is_empty(&self) -> bool {
        *self == CommitSummary::default()
    }
}

pub async fn commit(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    config: &CommitConfig,
    document_id: &str,
) -> Result<CommitSummary, PipelineError> {
    let document = documents::get_document(pool, document_id).await?;
    let verified = staging::list_verified(pool, document_id).await?;
    let mut summary = CommitSummary::default();
    if verified.is_empty() {
        tracing::info!(document_id, "nothing verified to commit");
        return Ok(summary);
    }

    let mut assignments = Vec::new();
    let mut suggestions = Vec::new();
    let mut rules = Vec::new();
    let mut qa_pairs = Vec::new();
    let mut uncertainties = Vec::new();
    let mut chunks: Vec<(String, TextChunk)> = Vec::new();
    for item in verified {
        match item.payload {
            StagedPayload::DomainAssignment(a) => assignments.push((item.id, a)),
            StagedPayload::DomainSuggestion(s) => suggestions.push((item.id, s)),
            StagedPayload::Rule(r) => rules.push((item.id, r)),
            StagedPayload::QaPair(q) => qa_pairs.push((item.id, q)),
            StagedPayload::Uncertainty(u) => uncertainties.push((item.id, u)),
            StagedPayload::Chunk(c) => chunks.push((item.id, c)),
        }
    }

    for (staged_id, assignment) in &assignments {
        let primary = domains::resolve_slugs(pool, std::slice::from_ref(&assignment.primary_domain_slug))
            .await?;
        for id in &primary {
            domains::link_document(pool, document_id, id, assignment.confidence, true).await?;
            summary.domains_linked += 1;
        }
        let secondary = domains::resolve_slugs(pool, &assignment.secondary_domain_slugs).await?;
        let secondary_confidence = assignment.confidence * config.secondary_domain_factor;
        for id in &secondary {
            if primary.contains(id) {
                continue;
            }
            domains::link_document(pool, document_id, id, secondary_confidence, false).await?;
            summary.domains_linked += 1;
        }
        staging::delete_item(pool, staged_id).await?;
    }
    // Links from an earlier, partly failed attempt count too.
    let domain_ids = domains::document_domain_ids(pool, document_id).await?;

    for (staged_id, suggestion) in &suggestions {
        domains::create_suggestion(pool, suggestion, Some(document_id)).await?;
        staging::delete_item(pool, staged_id).await?;
        summary.domain_suggestions_created += 1;
    }

    let mut rule_ids: HashMap<String, String> = HashMap::new();
    for (staged_id, rule) in &rules {
        let id = knowledge::insert_rule(
            pool,
            &NewRule {
                rule_code: rule.rule_code.clone(),
                title: rule.title.clone(),
                body: rule.body.clone(),
                confidence: rule.confidence,
                source_quote: non_empty(&rule.source_span.quote),
                source_location: non_empty(&rule.source_span.location_hint),
                document_id: Some(document_id.to_string()),
            },
        )
        .await?;
        for domain_id in &domain_ids {
            domains::link_rule(pool, &id, domain_id, rule.confidence).await?;
        }
        staging::delete_item(pool, staged_id).await?;
        rule_ids.insert(rule.rule_code.clone(), id);
        summary.rules_created += 1;
    }

    for (staged_id, qa) in &qa_pairs {
        let rule_id = match &qa.linked_rule_code {
            Some(code) => match rule_ids.get(code) {
                Some(id) => Some(id.clone()),
                None => knowledge::find_document_rule(pool, document_id, code)
                    .await?
                    .map(|rule| rule.id),
            },
            None => None,
        };
        let id = knowledge::insert_qa(
            pool,
            &NewQa {
                question: qa.question.clone(),
                answer: qa.answer.clone(),
                rule_id,
                document_id: Some(document_id.to_string()),
            },
        )
        .await?;
        for domain_id in &domain_ids {
            domains::link_qa(pool, &id, domain_id).await?;
        }
        staging::delete_item(pool, staged_id).await?;
        summary.qa_pairs_created += 1;
    }

    for (staged_id, uncertainty) in &uncertainties {
        let question = if uncertainty.suggested_question.trim().is_empty() {
            &uncertainty.description
        } else {
            &uncertainty.suggested_question
        };
        let context = serde_json::json!({
            "description": uncertainty.description,
            "documentTitle": document.title,
        });
        knowledge::insert_ai_question(pool, &uncertainty.kind, question, &context, Some(document_id))
            .await?;
        staging::delete_item(pool, staged_id).await?;
        summary.ai_questions_created += 1;
    }

    // Chunks go through the embedding provider a few at a time.
    for batch in chunks.chunks(config.chunk_batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|(_, c)| c.content.clone()).collect();
        let vectors = provider
            .embed(&texts)
            .await
            .map_err(PipelineError::provider)?;
        if vectors.len() != batch.len() {
            return Err(PipelineError::Provider(format!(
                "embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                batch.len()
            )));
        }
        for ((staged_id, chunk), vector) in batch.iter().zip(vectors.iter()) {
            let id = chunk_store::insert_chunk(
                pool,
                &NewChunk {
                    document_id,
                    chunk_index: chunk.index as i64,
                    content: &chunk.content,
                    start_char: chunk.start_char as i64,
                    end_char: chunk.end_char as i64,
                    embedding: vector,
                },
            )
            .await?;
            for domain_id in &domain_ids {
                domains::link_chunk(pool, &id, domain_id).await?;
            }
            staging::delete_item(pool, staged_id).await?;
            summary.chunks_created += 1;
        }
        tracing::debug!(document_id, batch = batch.len(), "chunk batch committed");
    }

    documents::set_status(pool, document_id, ParseStatus::Completed, None).await?;

    tracing::info!(document_id, ?summary, "commit complete");
    Ok(summary)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
