use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent; safe to run on every start.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Original texts, one row per (hash, source_language).
    // Dedup is enforced by callers looking up by hash before inserting.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS texts (
            id TEXT PRIMARY KEY,
            original TEXT NOT NULL,
            field TEXT NOT NULL DEFAULT '',
            html INTEGER NOT NULL DEFAULT 0,
            hash TEXT NOT NULL,
            source_language TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'to_simplify',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Links between texts and the content objects that contain them.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS text_usages (
            text_id TEXT NOT NULL,
            object_id INTEGER NOT NULL,
            object_type TEXT NOT NULL,
            tenant_id INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL DEFAULT 0,
            page_builder TEXT NOT NULL DEFAULT '',
            state TEXT NOT NULL DEFAULT 'to_simplify',
            PRIMARY KEY (text_id, object_id, object_type, tenant_id),
            FOREIGN KEY (text_id) REFERENCES texts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-language simplifications of an original text.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS simplifications (
            text_id TEXT NOT NULL,
            simplified_text TEXT NOT NULL,
            hash TEXT NOT NULL,
            target_language TEXT NOT NULL,
            used_api TEXT NOT NULL DEFAULT '',
            job_id INTEGER NOT NULL DEFAULT 0,
            user_id INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (text_id) REFERENCES texts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run markers: single-flight flag, progress counters, and the last
    // terminal result per object hash. Polled by the progress endpoint.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_markers (
            object_hash TEXT PRIMARY KEY,
            running INTEGER NOT NULL DEFAULT 0,
            max INTEGER NOT NULL DEFAULT 0,
            count INTEGER NOT NULL DEFAULT 0,
            result_json TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_texts_hash_lang ON texts(hash, source_language)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_texts_state ON texts(state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_usages_object ON text_usages(object_id, object_type)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_simplifications_text ON simplifications(text_id, target_language)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_simplifications_hash ON simplifications(hash, target_language)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
