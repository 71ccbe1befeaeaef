//! Database statistics and health overview.
//!
//! Provides a quick summary of the pipeline's state: text counts per
//! lifecycle state, simplification coverage per target language, and
//! usage-link totals. Used by `spx status` to give confidence that
//! extraction and batch runs are working as expected.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-target-language simplification coverage.
struct LanguageStats {
    target_language: String,
    simplification_count: i64,
    api_count: i64,
}

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_texts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM texts")
        .fetch_one(&pool)
        .await?;

    let total_usages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM text_usages")
        .fetch_one(&pool)
        .await?;

    let total_simplifications: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM simplifications")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Simplify Harness — Status");
    println!("=========================");
    println!();
    println!("  Database:          {}", config.db.path.display());
    println!("  Size:              {}", format_bytes(db_size));
    println!();
    println!("  Texts:             {}", total_texts);
    println!("  Usage links:       {}", total_usages);
    println!("  Simplifications:   {}", total_simplifications);

    // Per-state breakdown
    let state_rows = sqlx::query(
        "SELECT state, COUNT(*) AS n FROM texts GROUP BY state ORDER BY n DESC",
    )
    .fetch_all(&pool)
    .await?;

    if !state_rows.is_empty() {
        println!();
        println!("  By state:");
        for row in &state_rows {
            let state: String = row.get("state");
            let n: i64 = row.get("n");
            println!("    {:<14} {}", state, n);
        }
    }

    // Per-language coverage
    let lang_rows = sqlx::query(
        r#"
        SELECT
            target_language,
            COUNT(*) AS simplification_count,
            SUM(CASE WHEN job_id != 0 THEN 1 ELSE 0 END) AS api_count
        FROM simplifications
        GROUP BY target_language
        ORDER BY simplification_count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let lang_stats: Vec<LanguageStats> = lang_rows
        .iter()
        .map(|row| LanguageStats {
            target_language: row.get("target_language"),
            simplification_count: row.get("simplification_count"),
            api_count: row.get("api_count"),
        })
        .collect();

    if !lang_stats.is_empty() {
        println!();
        println!("  By target language:");
        println!("    {:<12} {:>8} {:>10}", "LANGUAGE", "TEXTS", "VIA API");
        println!("    {}", "-".repeat(32));
        for s in &lang_stats {
            println!(
                "    {:<12} {:>8} {:>10}",
                s.target_language, s.simplification_count, s.api_count
            );
        }
    }

    // Objects with runs in flight
    let running: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM run_markers WHERE running != 0")
            .fetch_one(&pool)
            .await?;
    if running > 0 {
        println!();
        println!("  Runs in flight:    {}", running);
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
