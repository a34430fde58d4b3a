//! Retrieval: cited answers and structured search over committed knowledge.
//!
//! # Answer pipeline
//!
//! 1. Ask the model which known domains the question belongs to.
//! 2. Embed the question and rank chunks (domain-filtered when possible)
//!    by cosine similarity, keeping the top `top_k`.
//! 3. Load ACTIVE rules and Q&A pairs for the same domains.
//! 4. Answer from a labelled context block (rules, Q&A, excerpts) with a
//!    system prompt that forbids going beyond the context.
//! 5. Cite the first `citation_count` rules.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::chunk_store;
use crate::config::{Config, RetrievalConfig};
use crate::correction::significant_words;
use crate::documents;
use crate::domains;
use crate::embedding::cosine_similarity;
use crate::errors::PipelineError;
use crate::extraction::parse_json;
use crate::knowledge;
use crate::models::{truncate_chars, DocChunk, KnowledgeStatus, QaPair, Rule};
use crate::provider::{AiProvider, ChatRequest};

const INTENT_PROMPT: &str = r#"You route questions to a translation bureau's knowledge base.

Pick the domains the question is about, using only slugs from the given
list, and name the intent in a few words. Respond with a single JSON object:
{"intent": "...", "domainSlugs": ["..."]}"#;

const ANSWER_PROMPT: &str = r#"You answer questions for a translation bureau.

Answer only from the context below (rules, Q&A pairs, document excerpts).
Do not use outside knowledge. If the context is not enough to answer, say so
explicitly. Answer in the language of the question. Respond with a single
JSON object: {"answer": "...", "confidence": 0.0}"#;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Intent {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    domain_slugs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    answer: String,
    #[serde(default)]
    confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub rule_code: String,
    pub document_title: Option<String>,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub answer: String,
    pub confidence: f64,
    pub citations: Vec<Citation>,
    pub domains_used: Vec<String>,
}

/// A chunk with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub score: f32,
}

fn validate_query(query: &str, config: &RetrievalConfig) -> Result<String, PipelineError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(PipelineError::Validation("query must not be empty".into()));
    }
    if query.chars().count() > config.max_query_chars {
        return Err(PipelineError::Validation(format!(
            "query must be at most {} characters",
            config.max_query_chars
        )));
    }
    Ok(query.to_string())
}

/// Rank chunks by similarity to `query_vec`, best first.
pub fn rank_chunks(query_vec: &[f32], chunks: Vec<DocChunk>, top_k: usize) -> Vec<ChunkHit> {
    let mut hits: Vec<ChunkHit> = chunks
        .into_iter()
        .map(|c| ChunkHit {
            score: cosine_similarity(query_vec, &c.embedding),
            chunk_id: c.id,
            document_id: c.document_id,
            content: c.content,
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);
    hits
}

async fn embed_query(provider: &dyn AiProvider, query: &str) -> Result<Vec<f32>, PipelineError> {
    let vectors = provider
        .embed(&[query.to_string()])
        .await
        .map_err(PipelineError::provider)?;
    Ok(vectors.into_iter().next().unwrap_or_default())
}

/// Answer a question from committed knowledge, with citations.
pub async fn answer(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    config: &Config,
    question: &str,
) -> Result<Answer, PipelineError> {
    let rc = &config.retrieval;
    let question = validate_query(question, rc)?;

    // Intent and domains, from a closed set of slugs.
    let known = domains::list_domains(pool).await?;
    let slugs: Vec<&str> = known.iter().map(|d| d.slug.as_str()).collect();
    let request = ChatRequest::json(
        INTENT_PROMPT,
        format!("Domains: {}\n\nQuestion: {}", slugs.join(", "), question),
    );
    let raw = provider.complete(&request).await.map_err(PipelineError::provider)?;
    let intent: Intent = match parse_json(&raw, config.extraction.raw_prefix_chars) {
        Ok(intent) => intent,
        Err(e) => {
            tracing::warn!(error = %e, "intent classification unparseable, searching all domains");
            Intent::default()
        }
    };
    let domains_used: Vec<String> = intent
        .domain_slugs
        .into_iter()
        .filter(|s| slugs.contains(&s.as_str()))
        .collect();
    let domain_ids = domains::resolve_slugs(pool, &domains_used).await?;
    tracing::debug!(intent = %intent.intent, domains = ?domains_used, "question classified");

    // Similar chunks; fall back to every chunk if the domains have none.
    let query_vec = embed_query(provider, &question).await?;
    let mut candidates = chunk_store::embedded_chunks(pool, &domain_ids, None).await?;
    if candidates.is_empty() && !domain_ids.is_empty() {
        candidates = chunk_store::embedded_chunks(pool, &[], None).await?;
    }
    let hits = rank_chunks(&query_vec, candidates, rc.top_k);

    let active = [KnowledgeStatus::Active];
    let rules = knowledge::rules_in_domains(pool, &active, &domain_ids, None, rc.rule_limit).await?;
    let qa = knowledge::qa_in_domains(pool, &active, &domain_ids, None, rc.qa_limit).await?;

    let context = context_block(&rules, &qa, &hits);
    let request = ChatRequest::json(
        ANSWER_PROMPT,
        format!("Context:\n{}\n\nQuestion: {}", context, question),
    );
    let raw = provider.complete(&request).await.map_err(PipelineError::provider)?;
    let reply: Reply = parse_json(&raw, config.extraction.raw_prefix_chars)?;

    let mut citations = Vec::new();
    for rule in rules.iter().take(rc.citation_count) {
        let document_title = match &rule.document_id {
            Some(id) => documents::get_document(pool, id).await.ok().map(|d| d.title),
            None => None,
        };
        citations.push(Citation {
            rule_code: rule.rule_code.clone(),
            document_title,
            excerpt: truncate_chars(&rule.body, rc.citation_excerpt_chars),
        });
    }

    tracing::info!(
        rules = rules.len(),
        qa = qa.len(),
        chunks = hits.len(),
        "question answered"
    );
    Ok(Answer {
        answer: reply.answer,
        confidence: reply.confidence.clamp(0.0, 1.0),
        citations,
        domains_used,
    })
}

/// Context block handed to the answering model.
pub fn context_block(rules: &[Rule], qa: &[QaPair], hits: &[ChunkHit]) -> String {
    let mut out = String::new();
    out.push_str("## Rules\n");
    if rules.is_empty() {
        out.push_str("(none)\n");
    }
    for rule in rules {
        out.push_str(&format!("[{}] {}: {}\n", rule.rule_code, rule.title, rule.body));
    }
    out.push_str("\n## Q&A\n");
    if qa.is_empty() {
        out.push_str("(none)\n");
    }
    for pair in qa {
        out.push_str(&format!("Q: {}\nA: {}\n", pair.question, pair.answer));
    }
    out.push_str("\n## Excerpts\n");
    if hits.is_empty() {
        out.push_str("(none)\n");
    }
    for (i, hit) in hits.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", i + 1, hit.content));
    }
    out
}

// ============ Search ============

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    pub domain_slug: Option<String>,
    pub limit: Option<usize>,
    pub min_freshness: Option<String>,
    pub verification_statuses: Option<Vec<String>>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub query: String,
    pub rules: Vec<Rule>,
    pub qa_pairs: Vec<QaPair>,
    pub chunks: Vec<ChunkHit>,
}

/// A search request after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub query: String,
    pub domain_slug: Option<String>,
    pub limit: usize,
    pub since: Option<i64>,
    pub statuses: Vec<KnowledgeStatus>,
}

impl SearchRequest {
    pub fn validate(&self, config: &RetrievalConfig) -> Result<SearchParams, PipelineError> {
        let query = validate_query(&self.query, config)?;

        let limit = self.limit.unwrap_or(config.default_limit);
        if limit == 0 || limit > config.max_limit {
            return Err(PipelineError::Validation(format!(
                "limit must be between 1 and {}",
                config.max_limit
            )));
        }

        let statuses = match &self.verification_statuses {
            None => vec![KnowledgeStatus::Active],
            Some(list) if list.is_empty() => {
                return Err(PipelineError::Validation(
                    "verificationStatuses must not be empty".into(),
                ))
            }
            Some(list) => {
                let mut out = Vec::new();
                for s in list {
                    let status: KnowledgeStatus = s.parse()?;
                    if !out.contains(&status) {
                        out.push(status);
                    }
                }
                out
            }
        };

        let since = match self.min_freshness.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(parse_freshness(value)?),
        };

        let domain_slug = self
            .domain_slug
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(SearchParams {
            query,
            domain_slug,
            limit,
            since,
            statuses,
        })
    }
}

/// `YYYY-MM-DD` (midnight UTC) or RFC 3339, as unix seconds.
pub fn parse_freshness(value: &str) -> Result<i64, PipelineError> {
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc().timestamp());
        }
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|_| {
            PipelineError::Validation(format!(
                "minFreshness '{}' is not a date (YYYY-MM-DD) or RFC 3339 timestamp",
                value
            ))
        })
}

/// Structured search over rules, Q&A pairs and chunks.
pub async fn search(
    pool: &SqlitePool,
    provider: &dyn AiProvider,
    config: &Config,
    request: &SearchRequest,
) -> Result<SearchResponse, PipelineError> {
    let params = request.validate(&config.retrieval)?;

    let domain_ids = match &params.domain_slug {
        Some(slug) => {
            let domain = domains::find_by_slug(pool, slug)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("domain {}", slug)))?;
            vec![domain.id]
        }
        None => Vec::new(),
    };

    // Keyword ranking for rules and Q&A over a wider candidate pool.
    let pool_size = (params.limit * 10) as i64;
    let terms = significant_words(&params.query, config.correction.min_word_chars);
    let rules = knowledge::rules_in_domains(pool, &params.statuses, &domain_ids, params.since, pool_size)
        .await?;
    let rules = rank_by_terms(rules, &terms, params.limit, |r| format!("{} {}", r.title, r.body));
    let qa = knowledge::qa_in_domains(pool, &params.statuses, &domain_ids, params.since, pool_size)
        .await?;
    let qa_pairs = rank_by_terms(qa, &terms, params.limit, |q| format!("{} {}", q.question, q.answer));

    let query_vec = embed_query(provider, &params.query).await?;
    let chunks = chunk_store::embedded_chunks(pool, &domain_ids, params.since).await?;
    let chunks = rank_chunks(&query_vec, chunks, params.limit);

    tracing::info!(
        agent_id = request.agent_id.as_deref().unwrap_or("-"),
        rules = rules.len(),
        qa = qa_pairs.len(),
        chunks = chunks.len(),
        "search"
    );
    Ok(SearchResponse {
        query: params.query,
        rules,
        qa_pairs,
        chunks,
    })
}

/// Keep items sharing at least one term with the query, most shared first.
fn rank_by_terms<T>(
    items: Vec<T>,
    terms: &std::collections::HashSet<String>,
    limit: usize,
    text: impl Fn(&T) -> String,
) -> Vec<T> {
    let mut scored: Vec<(usize, T)> = items
        .into_iter()
        .filter_map(|item| {
            let words = significant_words(&text(&item), 1);
            let score = terms.iter().filter(|t| words.contains(*t)).count();
            (score > 0).then_some((score, item))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().take(limit).map(|(_, item)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, embedding: Vec<f32>) -> DocChunk {
        DocChunk {
            id: id.into(),
            document_id: "d".into(),
            chunk_index: 0,
            content: id.into(),
            start_char: 0,
            end_char: 1,
            embedding,
        }
    }

    #[test]
    fn test_rank_chunks_orders_by_similarity() {
        let hits = rank_chunks(
            &[1.0, 0.0],
            vec![
                chunk("far", vec![0.0, 1.0]),
                chunk("near", vec![1.0, 0.1]),
                chunk("broken", vec![]),
            ],
            2,
        );
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "near");
        assert_eq!(hits[1].score, 0.0);
    }

    #[test]
    fn test_search_validation() {
        let config = RetrievalConfig::default();
        let ok = SearchRequest {
            query: "цена перевода".into(),
            ..Default::default()
        }
        .validate(&config)
        .unwrap();
        assert_eq!(ok.limit, 10);
        assert_eq!(ok.statuses, vec![KnowledgeStatus::Active]);

        let too_long = SearchRequest {
            query: "я".repeat(2001),
            ..Default::default()
        };
        assert!(too_long.validate(&config).is_err());

        let big_limit = SearchRequest {
            query: "цена".into(),
            limit: Some(51),
            ..Default::default()
        };
        assert!(big_limit.validate(&config).is_err());

        let bad_status = SearchRequest {
            query: "цена".into(),
            verification_statuses: Some(vec!["verified".into()]),
            ..Default::default()
        };
        assert!(matches!(
            bad_status.validate(&config),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_freshness() {
        assert_eq!(parse_freshness("1970-01-02").unwrap(), 86_400);
        assert_eq!(parse_freshness("1970-01-01T01:00:00+00:00").unwrap(), 3_600);
        assert!(parse_freshness("yesterday").is_err());
    }

    #[test]
    fn test_rank_by_terms() {
        let terms = significant_words("срочный перевод паспорта", 4);
        let items = vec!["доставка курьером", "перевод паспорта", "срочный перевод паспорта"];
        let ranked = rank_by_terms(items, &terms, 5, |s| s.to_string());
        assert_eq!(ranked, vec!["срочный перевод паспорта", "перевод паспорта"]);
    }
}
