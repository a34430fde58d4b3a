//! Adding and correcting knowledge outside of staging.

mod common;

use common::{bag_of_words, seed_domains, setup, FakeProvider, Route};
use kb_curator::chunk_store::{self, NewChunk};
use kb_curator::correction::{add_knowledge, correct_knowledge};
use kb_curator::errors::PipelineError;
use kb_curator::knowledge::{self, NewQa, NewRule};
use kb_curator::models::{KnowledgeStatus, ParseStatus};
use kb_curator::{documents, domains};
use serde_json::json;
use sqlx::SqlitePool;

struct Seeded {
    document_id: String,
    rule_id: String,
    qa_id: String,
    chunk_id: String,
    other_chunk_id: String,
}

async fn seed_price_rule(pool: &SqlitePool) -> Seeded {
    let stale = "Прайс-лист бюро. Стоимость — 100 рублей за страницу. Сроки обсуждаются индивидуально.";
    let other = "Офис открыт с 9 утра.";
    let doc = documents::create_document(pool, "Прайс", &format!("{} {}", stale, other))
        .await
        .unwrap();
    let chunk_id = chunk_store::insert_chunk(
        pool,
        &NewChunk {
            document_id: &doc.id,
            chunk_index: 0,
            content: stale,
            start_char: 0,
            end_char: 85,
            embedding: &bag_of_words(stale),
        },
    )
    .await
    .unwrap();
    let other_chunk_id = chunk_store::insert_chunk(
        pool,
        &NewChunk {
            document_id: &doc.id,
            chunk_index: 1,
            content: other,
            start_char: 86,
            end_char: 107,
            embedding: &bag_of_words(other),
        },
    )
    .await
    .unwrap();
    let rule_id = knowledge::insert_rule(
        pool,
        &NewRule {
            rule_code: "R-1".into(),
            title: "Стоимость".into(),
            body: "Стоимость — 100 рублей".into(),
            confidence: 0.8,
            source_quote: Some("100 рублей".into()),
            source_location: None,
            document_id: Some(doc.id.clone()),
        },
    )
    .await
    .unwrap();
    let qa_id = knowledge::insert_qa(
        pool,
        &NewQa {
            question: "Сколько стоит?".into(),
            answer: "100 рублей".into(),
            rule_id: Some(rule_id.clone()),
            document_id: Some(doc.id.clone()),
        },
    )
    .await
    .unwrap();
    Seeded {
        document_id: doc.id,
        rule_id,
        qa_id,
        chunk_id,
        other_chunk_id,
    }
}

#[tokio::test]
async fn test_correction_rewrites_rule_in_place_and_purges_chunks() {
    let (_tmp, pool, config) = setup().await;
    let seeded = seed_price_rule(&pool).await;
    let provider = FakeProvider::new();
    provider.reply_json(
        Route::Correct,
        json!({
            "updates": [{
                "ruleCode": "R-1",
                "title": "Стоимость",
                "body": "Стоимость — 150 рублей",
                "reason": "новая цена"
            }]
        }),
    );

    let summary = correct_knowledge(&pool, provider.as_ref(), &config, "измени 100 на 150", "manager")
        .await
        .unwrap();
    assert_eq!(summary.updated_codes, vec!["R-1".to_string()]);
    assert_eq!(summary.qa_deprecated, 1);
    // Only the chunk quoting the old price, despite its surrounding text.
    assert_eq!(summary.chunks_deleted, 1);
    assert_eq!(summary.chunk_ids_created.len(), 1);

    // Same row, same code, no new version.
    let rule = knowledge::get_rule(&pool, &seeded.rule_id).await.unwrap();
    assert_eq!(rule.body, "Стоимость — 150 рублей");
    assert_eq!(rule.confidence, 1.0);
    assert_eq!(rule.version, 1);
    assert_eq!(rule.status, KnowledgeStatus::Active);
    assert_eq!(knowledge::rule_versions(&pool, "R-1").await.unwrap().len(), 1);

    let qa = knowledge::get_qa(&pool, &seeded.qa_id).await.unwrap();
    assert_eq!(qa.status, KnowledgeStatus::Deprecated);

    let chunks = chunk_store::list_for_document(&pool, &seeded.document_id)
        .await
        .unwrap();
    assert!(chunks.iter().all(|c| c.id != seeded.chunk_id));
    assert!(chunks.iter().any(|c| c.id == seeded.other_chunk_id));
    let fresh = chunk_store::get_chunk(&pool, &summary.chunk_ids_created[0])
        .await
        .unwrap();
    assert!(fresh.content.contains("150"));
    assert_eq!(fresh.document_id, seeded.document_id);

    let changes = knowledge::list_changes(&pool, Some(&seeded.rule_id)).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type, "UPDATE");
    assert_eq!(changes[0].reason.as_deref(), Some("новая цена"));
    assert_eq!(changes[0].old_value.as_ref().unwrap()["body"], "Стоимость — 100 рублей");
}

#[tokio::test]
async fn test_correction_prompt_lists_active_rules() {
    let (_tmp, pool, config) = setup().await;
    seed_price_rule(&pool).await;
    let provider = FakeProvider::new();
    provider.reply_json(Route::Correct, json!({"updates": []}));

    let err = correct_knowledge(&pool, provider.as_ref(), &config, "поменяй срок", "manager")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let requests = provider.requests(Route::Correct);
    assert_eq!(requests.len(), 1);
    assert!(requests[0].user.contains("R-1 | Стоимость"));
    assert!(requests[0].user.contains("поменяй срок"));
}

#[tokio::test]
async fn test_correction_with_unknown_code_is_rejected() {
    let (_tmp, pool, config) = setup().await;
    let seeded = seed_price_rule(&pool).await;
    let provider = FakeProvider::new();
    provider.reply_json(
        Route::Correct,
        json!({"updates": [{"ruleCode": "R-42", "title": "x", "body": "y"}]}),
    );

    let err = correct_knowledge(&pool, provider.as_ref(), &config, "измени цену", "manager")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    let rule = knowledge::get_rule(&pool, &seeded.rule_id).await.unwrap();
    assert_eq!(rule.body, "Стоимость — 100 рублей");
}

#[tokio::test]
async fn test_correction_without_rules_or_text() {
    let (_tmp, pool, config) = setup().await;
    let provider = FakeProvider::new();

    let err = correct_knowledge(&pool, provider.as_ref(), &config, "  ", "manager")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let err = correct_knowledge(&pool, provider.as_ref(), &config, "измени цену", "manager")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(provider.requests(Route::Correct).is_empty());
}

#[tokio::test]
async fn test_add_knowledge_creates_rules_after_highest_code() {
    let (_tmp, pool, config) = setup().await;
    seed_domains(&pool).await;
    seed_price_rule(&pool).await;
    let provider = FakeProvider::new();
    provider.reply_json(
        Route::Add,
        json!({
            "domainSlugs": ["deadlines", "nonexistent"],
            "rules": [
                {"title": "Срок перевода", "body": "Обычный срок перевода 3 рабочих дня."},
                {"title": "Выходные", "body": "В выходные заказы не принимаются."}
            ],
            "qaPairs": [
                {"question": "Как быстро переводите?", "answer": "За 3 рабочих дня.", "ruleIndex": 0},
                {"question": "Где офис?", "answer": "В центре.", "ruleIndex": null}
            ]
        }),
    );
    let note = "Обычный срок перевода 3 рабочих дня, в выходные не работаем.";

    let summary = add_knowledge(&pool, provider.as_ref(), &config, note, "manager")
        .await
        .unwrap();
    assert_eq!(summary.rule_codes, vec!["R-2".to_string(), "R-3".to_string()]);
    assert_eq!(summary.qa_pairs_created, 2);

    let doc = documents::get_document(&pool, &summary.document_id).await.unwrap();
    assert!(doc.title.starts_with("Заметка: "));
    assert_eq!(doc.parse_status, ParseStatus::Completed);
    let deadlines = domains::find_by_slug(&pool, "deadlines").await.unwrap().unwrap();
    assert_eq!(
        domains::document_domain_ids(&pool, &doc.id).await.unwrap(),
        vec![deadlines.id.clone()]
    );

    let rules = knowledge::rule_versions(&pool, "R-2").await.unwrap();
    assert_eq!(rules.len(), 1);
    assert!((rules[0].confidence - 0.9).abs() < 1e-9);
    assert_eq!(rules[0].document_id.as_deref(), Some(doc.id.as_str()));
    assert_eq!(
        domains::rule_domain_ids(&pool, &rules[0].id).await.unwrap(),
        vec![deadlines.id.clone()]
    );
    let linked = knowledge::qa_for_rule(&pool, &rules[0].id).await.unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].question, "Как быстро переводите?");

    let chunk = chunk_store::get_chunk(&pool, &summary.chunk_id).await.unwrap();
    assert_eq!(chunk.content, note);
    assert_eq!(chunk.document_id, doc.id);
    assert_eq!(provider.embedded_texts(), vec![note.to_string()]);
}

#[tokio::test]
async fn test_add_knowledge_rejects_empty_text() {
    let (_tmp, pool, config) = setup().await;
    let provider = FakeProvider::new();
    let err = add_knowledge(&pool, provider.as_ref(), &config, "\n ", "manager")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));
    assert!(provider.requests(Route::Add).is_empty());
}

#[tokio::test]
async fn test_add_knowledge_unparseable_reply() {
    let (_tmp, pool, config) = setup().await;
    let provider = FakeProvider::new();
    provider.reply(Route::Add, "Извините, не понял.");
    let err = add_knowledge(&pool, provider.as_ref(), &config, "Новая цена 700", "manager")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Parse { .. }));
    assert!(documents::list_documents(&pool).await.unwrap().is_empty());
}
