//! Commit engine: verified staging into the knowledge base.

mod common;

use common::{happy_provider, seed_domains, setup, FakeProvider, Route, PRICE_TEXT};
use kb_curator::commit::{commit, CommitSummary};
use kb_curator::config::Config;
use kb_curator::errors::PipelineError;
use kb_curator::models::{ItemType, KnowledgeStatus, ParseStatus, Phase, StagedPayload};
use kb_curator::processing::Processor;
use kb_curator::staging::{self, StagingFilter, VerificationAction};
use kb_curator::{chunk_store, documents, domains, knowledge};
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

async fn processed(
    pool: &SqlitePool,
    config: &Arc<Config>,
    provider: Arc<FakeProvider>,
    text: &str,
) -> String {
    let doc = documents::create_document(pool, "Прайс", text).await.unwrap();
    Processor::new(pool.clone(), provider, config.clone())
        .start(&doc.id)
        .collect()
        .await;
    doc.id
}

async fn verify_all(pool: &SqlitePool, document_id: &str) {
    let ids: Vec<String> = staging::list_by_document(pool, document_id, &StagingFilter::default())
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    staging::set_verification(pool, &ids, VerificationAction::Verify)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_commit_moves_everything_verified() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    let provider = happy_provider();
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;
    verify_all(&pool, &doc_id).await;

    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert_eq!(
        summary,
        CommitSummary {
            domains_linked: 2,
            domain_suggestions_created: 1,
            rules_created: 2,
            qa_pairs_created: 1,
            ai_questions_created: 1,
            chunks_created: 1,
        }
    );

    let doc = documents::get_document(&pool, &doc_id).await.unwrap();
    assert_eq!(doc.parse_status, ParseStatus::Completed);
    let counts = staging::counts_by_status(&pool, &doc_id).await.unwrap();
    assert_eq!(counts.verified, 0);

    // Primary at full confidence, secondary scaled.
    let links = sqlx::query(
        "SELECT d.slug, dd.confidence, dd.is_primary FROM document_domains dd \
         JOIN domains d ON d.id = dd.domain_id WHERE dd.document_id = ? ORDER BY d.slug",
    )
    .bind(&doc_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(links[0].get::<String, _>("slug"), "pricing");
    assert!((links[0].get::<f64, _>("confidence") - 0.9).abs() < 1e-9);
    assert_eq!(links[1].get::<String, _>("slug"), "urgent");
    assert!((links[1].get::<f64, _>("confidence") - 0.72).abs() < 1e-9);
    assert_eq!(links[1].get::<i64, _>("is_primary"), 0);

    let rules = knowledge::list_rules(&pool, Some(KnowledgeStatus::Active), 10)
        .await
        .unwrap();
    assert_eq!(rules.len(), 2);
    let urgent = rules.iter().find(|r| r.rule_code == "R-2").unwrap();
    assert_eq!(urgent.source_quote.as_deref(), Some("наценкой 50 процентов"));
    assert_eq!(urgent.document_id.as_deref(), Some(doc_id.as_str()));

    // The QA pair points at the rule created from its linked code.
    let qa = knowledge::qa_for_rule(&pool, &urgent.id).await.unwrap();
    assert_eq!(qa.len(), 1);
    assert_eq!(qa[0].question, "Сколько стоит срочный перевод?");

    let questions = knowledge::list_open_questions(&pool).await.unwrap();
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].question, "Сколько знаков в расчётной странице?");
    assert_eq!(questions[0].context["documentTitle"], "Прайс");

    let chunks = chunk_store::list_for_document(&pool, &doc_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].embedding.len(), common::EMBED_DIMS);
    assert_eq!(provider.embedded_texts(), vec![chunks[0].content.clone()]);
}

#[tokio::test]
async fn test_second_commit_is_a_noop() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    let provider = happy_provider();
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;
    verify_all(&pool, &doc_id).await;

    commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    let again = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert!(again.is_empty());
    assert_eq!(
        knowledge::list_rules(&pool, None, 10).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_domain_links_have_no_duplicates() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    let provider = FakeProvider::new();
    // Two assignments overlapping on "pricing", one naming it as its own secondary.
    provider.reply_json(
        Route::Classify,
        json!({
            "documentDomains": [
                {"primaryDomainSlug": "pricing", "secondaryDomainSlugs": ["pricing", "urgent"], "confidence": 0.9, "reason": ""},
                {"primaryDomainSlug": "urgent", "secondaryDomainSlugs": ["pricing"], "confidence": 0.7, "reason": ""}
            ]
        }),
    );
    provider.reply_json(Route::Extract, common::extraction());
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;
    verify_all(&pool, &doc_id).await;

    commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();

    let dupes: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM (SELECT rule_id, domain_id FROM rule_domains \
         GROUP BY rule_id, domain_id HAVING COUNT(*) > 1)",
    )
    .fetch_one(&pool)
    .await
    .unwrap()
    .get("n");
    assert_eq!(dupes, 0);

    let rules = knowledge::list_rules(&pool, None, 10).await.unwrap();
    for rule in rules {
        assert_eq!(domains::rule_domain_ids(&pool, &rule.id).await.unwrap().len(), 2);
    }
    assert_eq!(
        domains::document_domain_ids(&pool, &doc_id).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_rejected_and_pending_items_stay_staged() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    let provider = happy_provider();
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;

    let rules_filter = StagingFilter {
        item_type: Some(ItemType::Rule),
        ..Default::default()
    };
    let rule_ids: Vec<String> = staging::list_by_document(&pool, &doc_id, &rules_filter)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    staging::set_verification(&pool, &rule_ids[..1], VerificationAction::Verify)
        .await
        .unwrap();
    staging::set_verification(&pool, &rule_ids[1..], VerificationAction::Reject)
        .await
        .unwrap();

    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert_eq!(summary.rules_created, 1);
    assert_eq!(summary.chunks_created, 0);
    // No verified domain assignment, so the rule has no domain links.
    let rules = knowledge::list_rules(&pool, None, 10).await.unwrap();
    assert!(domains::rule_domain_ids(&pool, &rules[0].id)
        .await
        .unwrap()
        .is_empty());

    let counts = staging::counts_by_status(&pool, &doc_id).await.unwrap();
    assert_eq!(counts.verified, 0);
    assert_eq!(counts.rejected, 1);
    assert_eq!(counts.pending, 5);
}

#[tokio::test]
async fn test_unlinked_qa_gets_null_rule() {
    let (_tmp, pool, config) = setup().await;
    let provider = FakeProvider::new();
    provider.reply_json(Route::Classify, json!({"documentDomains": []}));
    provider.reply_json(
        Route::Extract,
        json!({
            "rules": [],
            "qaPairs": [{"question": "Работаете в выходные?", "answer": "Да.", "linkedRuleCode": "R-99"}]
        }),
    );
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;
    verify_all(&pool, &doc_id).await;

    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert_eq!(summary.qa_pairs_created, 1);

    let qa = knowledge::qa_in_domains(&pool, &[KnowledgeStatus::Active], &[], None, 10)
        .await
        .unwrap();
    assert_eq!(qa.len(), 1);
    assert!(qa[0].rule_id.is_none());
}

#[tokio::test]
async fn test_empty_document_scenario() {
    let (_tmp, pool, config) = setup().await;
    let provider = FakeProvider::new();
    let doc_id = processed(&pool, &config, provider.clone(), "").await;

    let chunks = StagingFilter {
        phase: Some(Phase::Chunking),
        ..Default::default()
    };
    assert!(staging::list_by_document(&pool, &doc_id, &chunks)
        .await
        .unwrap()
        .is_empty());

    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert!(summary.is_empty());
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query(sql).fetch_one(pool).await.unwrap().get("n")
}

#[tokio::test]
async fn test_retry_after_embedding_failure_writes_nothing_twice() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    let provider = happy_provider();
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;
    verify_all(&pool, &doc_id).await;
    provider.fail_embeddings("HTTP 503 service unavailable");

    let err = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Provider(_)));

    let doc = documents::get_document(&pool, &doc_id).await.unwrap();
    assert_ne!(doc.parse_status, ParseStatus::Completed);
    // Only the chunk was left unwritten.
    let counts = staging::counts_by_status(&pool, &doc_id).await.unwrap();
    assert_eq!(counts.verified, 1);
    assert_eq!(knowledge::rule_versions(&pool, "R-1").await.unwrap().len(), 1);

    provider.restore_embeddings();
    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert_eq!(
        summary,
        CommitSummary {
            chunks_created: 1,
            ..Default::default()
        }
    );

    let doc = documents::get_document(&pool, &doc_id).await.unwrap();
    assert_eq!(doc.parse_status, ParseStatus::Completed);
    assert_eq!(staging::counts_by_status(&pool, &doc_id).await.unwrap().verified, 0);

    assert_eq!(knowledge::rule_versions(&pool, "R-1").await.unwrap().len(), 1);
    assert_eq!(knowledge::rule_versions(&pool, "R-2").await.unwrap().len(), 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) AS n FROM qa_pairs").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) AS n FROM ai_questions").await, 1);
    assert_eq!(count(&pool, "SELECT COUNT(*) AS n FROM domain_suggestions").await, 1);

    // The chunk written on retry still gets the domains linked by the first attempt.
    let chunks = chunk_store::list_for_document(&pool, &doc_id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    let chunk_links = sqlx::query("SELECT COUNT(*) AS n FROM chunk_domains WHERE chunk_id = ?")
        .bind(&chunks[0].id)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get::<i64, _>("n");
    assert_eq!(chunk_links, 2);
}

#[tokio::test]
async fn test_qa_linked_to_rule_from_earlier_attempt() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    let provider = happy_provider();
    let doc_id = processed(&pool, &config, provider.clone(), PRICE_TEXT).await;

    // First commit only the rules, then the Q&A pair on its own.
    let rules_filter = StagingFilter {
        item_type: Some(ItemType::Rule),
        ..Default::default()
    };
    let rule_ids: Vec<String> = staging::list_by_document(&pool, &doc_id, &rules_filter)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    staging::set_verification(&pool, &rule_ids, VerificationAction::Verify)
        .await
        .unwrap();
    commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();

    let qa_filter = StagingFilter {
        item_type: Some(ItemType::QaPair),
        ..Default::default()
    };
    let qa_ids: Vec<String> = staging::list_by_document(&pool, &doc_id, &qa_filter)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    staging::set_verification(&pool, &qa_ids, VerificationAction::Verify)
        .await
        .unwrap();
    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc_id)
        .await
        .unwrap();
    assert_eq!(summary.qa_pairs_created, 1);
    assert_eq!(summary.rules_created, 0);

    let r2 = knowledge::rule_versions(&pool, "R-2").await.unwrap();
    assert_eq!(r2.len(), 1);
    assert_eq!(knowledge::qa_for_rule(&pool, &r2[0].id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_chunks_are_embedded_in_batches() {
    let (_tmp, pool, config) = setup().await;
    let doc = documents::create_document(&pool, "Длинный", "x").await.unwrap();
    for i in 0..7 {
        staging::append(
            &pool,
            &doc.id,
            &StagedPayload::Chunk(kb_curator::models::TextChunk {
                content: format!("Фрагмент номер {}", i),
                index: i,
                start_char: i * 10,
                end_char: i * 10 + 10,
            }),
        )
        .await
        .unwrap();
    }
    verify_all(&pool, &doc.id).await;

    let provider = FakeProvider::new();
    let summary = commit(&pool, provider.as_ref(), &config.commit, &doc.id)
        .await
        .unwrap();
    assert_eq!(summary.chunks_created, 7);

    let chunks = chunk_store::list_for_document(&pool, &doc.id).await.unwrap();
    let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, (0..7).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_commit_unknown_document() {
    let (_tmp, pool, config) = setup().await;
    let provider = FakeProvider::new();
    let err = commit(&pool, provider.as_ref(), &config.commit, "missing")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}
