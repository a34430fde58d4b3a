//! CLI command implementations.
//!
//! Each `run_*` function opens its own pool, performs one operation and
//! prints the result to stdout. Logs go to stderr through `tracing`.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

use crate::commit;
use crate::config::Config;
use crate::correction;
use crate::db;
use crate::documents;
use crate::domains;
use crate::knowledge;
use crate::models::{KnowledgeStatus, ReviewStatus};
use crate::processing::Processor;
use crate::provider::{create_provider, AiProvider};
use crate::retrieval::{self, SearchRequest};
use crate::staging::{self, StagingFilter, VerificationAction};

fn provider(config: &Config) -> Result<Arc<dyn AiProvider>> {
    Ok(Arc::from(create_provider(&config.llm, &config.embedding)?))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn pool(config: &Config) -> Result<SqlitePool> {
    db::connect(config).await
}

pub async fn run_upload(config: &Config, file: &Path, title: Option<String>) -> Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let title = title.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "untitled".to_string())
    });

    let pool = pool(config).await?;
    let doc = documents::create_document(&pool, &title, &text).await?;
    println!("Uploaded document {} ({} chars)", doc.id, text.chars().count());
    Ok(())
}

pub async fn run_documents(config: &Config) -> Result<()> {
    let pool = pool(config).await?;
    let docs = documents::list_documents(&pool).await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    for doc in docs {
        let counts = staging::counts_by_status(&pool, &doc.id).await?;
        println!(
            "{}  {:<10}  staged {}/{}/{}  {}",
            doc.id,
            doc.parse_status.as_str(),
            counts.pending,
            counts.verified,
            counts.rejected,
            doc.title
        );
        if let Some(err) = &doc.parse_error {
            println!("    error: {}", err);
        }
    }
    Ok(())
}

/// Runs processing in the foreground, printing one JSON event per line.
pub async fn run_process(config: &Config, document_id: &str) -> Result<()> {
    let pool = pool(config).await?;
    documents::get_document(&pool, document_id).await?;

    let processor = Processor::new(pool, provider(config)?, Arc::new(config.clone()));
    let mut run = processor.start(document_id);
    let mut failed = None;
    while let Some(event) = run.next_event().await {
        println!("{}", event.to_json());
        if event.kind() == "error" || event.kind() == "fatal_error" {
            failed = Some(event.kind());
        }
    }
    if let Some(kind) = failed {
        bail!("processing ended with {}", kind);
    }
    Ok(())
}

pub async fn run_staged(
    config: &Config,
    document_id: &str,
    status: Option<String>,
) -> Result<()> {
    let status = status
        .as_deref()
        .map(str::parse::<ReviewStatus>)
        .transpose()?;
    let filter = StagingFilter {
        status,
        ..Default::default()
    };

    let pool = pool(config).await?;
    let items = staging::list_by_document(&pool, document_id, &filter).await?;
    if items.is_empty() {
        println!("No staged items.");
        return Ok(());
    }
    for item in items {
        println!(
            "{}  {:<8}  {:<18}  {}",
            item.id,
            item.review_status().as_str(),
            item.payload.item_type().as_str(),
            item.payload.preview()
        );
    }
    Ok(())
}

pub async fn run_verify(config: &Config, action: &str, ids: &[String]) -> Result<()> {
    let action: VerificationAction = action.parse()?;
    let pool = pool(config).await?;
    let updated = staging::set_verification(&pool, ids, action).await?;
    println!("Updated {} item(s).", updated);
    Ok(())
}

pub async fn run_commit(config: &Config, document_id: &str) -> Result<()> {
    let pool = pool(config).await?;
    let provider = provider(config)?;
    let summary = commit::commit(&pool, provider.as_ref(), &config.commit, document_id).await?;
    if summary.is_empty() {
        println!("Nothing verified to commit.");
        return Ok(());
    }
    print_json(&summary)
}

pub async fn run_ask(config: &Config, question: &str) -> Result<()> {
    let pool = pool(config).await?;
    let provider = provider(config)?;
    let answer = retrieval::answer(&pool, provider.as_ref(), config, question).await?;

    println!("{}", answer.answer);
    println!();
    println!("confidence: {:.2}", answer.confidence);
    for c in &answer.citations {
        println!(
            "  [{}] {}: {}",
            c.rule_code,
            c.document_title.as_deref().unwrap_or("-"),
            c.excerpt
        );
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    domain: Option<String>,
    limit: Option<usize>,
    since: Option<String>,
) -> Result<()> {
    let req = SearchRequest {
        query: query.to_string(),
        domain_slug: domain,
        limit,
        min_freshness: since,
        ..Default::default()
    };
    let pool = pool(config).await?;
    let provider = provider(config)?;
    let response = retrieval::search(&pool, provider.as_ref(), config, &req).await?;
    print_json(&response)
}

pub async fn run_add(config: &Config, text: &str, initiated_by: &str) -> Result<()> {
    let pool = pool(config).await?;
    let provider = provider(config)?;
    let summary =
        correction::add_knowledge(&pool, provider.as_ref(), config, text, initiated_by).await?;
    print_json(&summary)
}

pub async fn run_correct(config: &Config, text: &str, initiated_by: &str) -> Result<()> {
    let pool = pool(config).await?;
    let provider = provider(config)?;
    let summary =
        correction::correct_knowledge(&pool, provider.as_ref(), config, text, initiated_by)
            .await?;
    print_json(&summary)
}

pub async fn run_reset_stale(config: &Config) -> Result<()> {
    let pool = pool(config).await?;
    let reset = documents::reset_stale(&pool, config.server.stale_after_minutes * 60).await?;
    println!("Reset {} stale document(s).", reset);
    Ok(())
}

pub async fn run_domains_list(config: &Config) -> Result<()> {
    let pool = pool(config).await?;
    let all = domains::list_domains(&pool).await?;
    if all.is_empty() {
        println!("No domains. Add one with `kbc domains add <slug> <title>`.");
        return Ok(());
    }
    for d in &all {
        let parent = d
            .parent_id
            .as_ref()
            .and_then(|pid| all.iter().find(|p| &p.id == pid))
            .map(|p| p.slug.as_str())
            .unwrap_or("-");
        println!("{:<24} parent={:<16} {}", d.slug, parent, d.title);
    }
    Ok(())
}

pub async fn run_domains_add(
    config: &Config,
    slug: &str,
    title: &str,
    description: Option<&str>,
    parent: Option<&str>,
) -> Result<()> {
    let pool = pool(config).await?;
    let domain = domains::create_domain(&pool, slug, title, description, parent).await?;
    println!("Created domain {} ({})", domain.slug, domain.id);
    Ok(())
}

pub async fn run_rules_list(config: &Config, status: Option<String>, limit: i64) -> Result<()> {
    let status = status
        .as_deref()
        .map(str::parse::<KnowledgeStatus>)
        .transpose()?;
    let pool = pool(config).await?;
    for rule in knowledge::list_rules(&pool, status, limit).await? {
        println!(
            "{:<8} v{}  {:<10}  {:.2}  {}",
            rule.rule_code,
            rule.version,
            rule.status.as_str(),
            rule.confidence,
            rule.title
        );
    }
    Ok(())
}

pub async fn run_rules_deprecate(
    config: &Config,
    rule_id: &str,
    reason: Option<&str>,
    initiated_by: &str,
) -> Result<()> {
    let pool = pool(config).await?;
    let qa = knowledge::deprecate_rule(&pool, rule_id, reason, initiated_by).await?;
    println!("Rule deprecated ({} linked QA pair(s) deprecated).", qa);
    Ok(())
}

pub async fn run_rules_history(config: &Config, rule_code: &str) -> Result<()> {
    let pool = pool(config).await?;
    let versions = knowledge::rule_versions(&pool, rule_code).await?;
    if versions.is_empty() {
        bail!("No rule with code {}", rule_code);
    }
    for rule in &versions {
        println!(
            "v{}  {:<10}  {}  {}",
            rule.version,
            rule.status.as_str(),
            rule.id,
            rule.title
        );
        for change in knowledge::list_changes(&pool, Some(&rule.id)).await? {
            println!(
                "    {} by {}: {}",
                change.change_type,
                change.initiated_by,
                change.reason.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

pub async fn run_questions_list(config: &Config) -> Result<()> {
    let pool = pool(config).await?;
    let open = knowledge::list_open_questions(&pool).await?;
    if open.is_empty() {
        println!("No open questions.");
    }
    for q in open {
        println!("{}  [{}]  {}", q.id, q.issue_type, q.question);
    }
    Ok(())
}

pub async fn run_questions_answer(config: &Config, id: &str, response: &str) -> Result<()> {
    let pool = pool(config).await?;
    knowledge::answer_question(&pool, id, response).await?;
    println!("Question {} answered.", id);
    Ok(())
}

pub async fn run_questions_dismiss(config: &Config, id: &str) -> Result<()> {
    let pool = pool(config).await?;
    knowledge::dismiss_question(&pool, id).await?;
    println!("Question {} dismissed.", id);
    Ok(())
}
