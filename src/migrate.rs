use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            raw_text TEXT NOT NULL,
            parse_status TEXT NOT NULL DEFAULT 'PENDING',
            parse_error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS staged_extractions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            phase TEXT NOT NULL,
            item_type TEXT NOT NULL,
            data TEXT NOT NULL,
            is_verified INTEGER NOT NULL DEFAULT 0,
            is_rejected INTEGER NOT NULL DEFAULT 0,
            verified_at INTEGER,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS domains (
            id TEXT PRIMARY KEY,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            description TEXT,
            parent_id TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES domains(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS domain_suggestions (
            id TEXT PRIMARY KEY,
            suggested_slug TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            parent_slug TEXT,
            confidence REAL NOT NULL,
            reasoning TEXT,
            status TEXT NOT NULL DEFAULT 'PENDING',
            document_id TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE SET NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS document_domains (
            document_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            confidence REAL NOT NULL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (document_id, domain_id),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            rule_code TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            confidence REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            version INTEGER NOT NULL DEFAULT 1,
            source_quote TEXT,
            source_location TEXT,
            document_id TEXT,
            supersedes_rule_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE SET NULL,
            FOREIGN KEY (supersedes_rule_id) REFERENCES rules(id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS rule_domains (
            rule_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            confidence REAL NOT NULL,
            PRIMARY KEY (rule_id, domain_id),
            FOREIGN KEY (rule_id) REFERENCES rules(id) ON DELETE CASCADE,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS qa_pairs (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            rule_id TEXT,
            document_id TEXT,
            status TEXT NOT NULL DEFAULT 'ACTIVE',
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (rule_id) REFERENCES rules(id) ON DELETE SET NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE SET NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS qa_domains (
            qa_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            PRIMARY KEY (qa_id, domain_id),
            FOREIGN KEY (qa_id) REFERENCES qa_pairs(id) ON DELETE CASCADE,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS doc_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS chunk_domains (
            chunk_id TEXT NOT NULL,
            domain_id TEXT NOT NULL,
            PRIMARY KEY (chunk_id, domain_id),
            FOREIGN KEY (chunk_id) REFERENCES doc_chunks(id) ON DELETE CASCADE,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS ai_questions (
            id TEXT PRIMARY KEY,
            issue_type TEXT NOT NULL,
            question TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'OPEN',
            response TEXT,
            document_id TEXT,
            created_at INTEGER NOT NULL,
            answered_at INTEGER,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE SET NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_changes (
            id TEXT PRIMARY KEY,
            target_type TEXT NOT NULL,
            target_id TEXT NOT NULL,
            change_type TEXT NOT NULL,
            old_value TEXT,
            new_value TEXT,
            reason TEXT,
            initiated_by TEXT NOT NULL,
            approved_by TEXT,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            reviewed_at INTEGER
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_staged_document ON staged_extractions(document_id, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_rules_code ON rules(rule_code)",
        "CREATE INDEX IF NOT EXISTS idx_rules_status ON rules(status, updated_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_qa_status ON qa_pairs(status)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_document ON doc_chunks(document_id, chunk_index)",
        "CREATE INDEX IF NOT EXISTS idx_changes_target ON knowledge_changes(target_type, target_id)",
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(parse_status, updated_at)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }

    Ok(())
}
