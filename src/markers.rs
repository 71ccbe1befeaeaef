//! Run markers: per-object single-flight flag, progress counters, and the
//! last terminal result.
//!
//! One row per object hash. `running` holds the start timestamp of the run
//! in flight (0 when idle) and is acquired with an atomic compare-and-swap
//! so two processes racing on the same object cannot both win. `max` and
//! `count` drive the caller-facing progress endpoint; `result_json` holds
//! the last terminal outcome for polling.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// Snapshot of one object's run marker, as served to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub count: i64,
    pub max: i64,
    /// Start timestamp of the run in flight, 0 when idle.
    pub running: i64,
    /// Last terminal outcome, if any.
    pub result: Option<serde_json::Value>,
}

/// Keyed run-marker store. All state lives in the `run_markers` table so
/// markers survive process restarts and are shared across processes.
pub struct RunState {
    pool: SqlitePool,
}

impl RunState {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ensure_row(&self, hash: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT OR IGNORE INTO run_markers (object_hash, running, max, count, updated_at) \
             VALUES (?, 0, 0, 0, ?)",
        )
        .bind(hash)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Acquire the single-flight slot for this object.
    ///
    /// Returns `false` when a run is already in flight. The update only
    /// matches `running = 0`, so of two racing processes exactly one sees
    /// a changed row.
    pub async fn try_begin(&self, hash: &str) -> Result<bool> {
        self.ensure_row(hash).await?;
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE run_markers SET running = ?, updated_at = ? \
             WHERE object_hash = ? AND running = 0",
        )
        .bind(now)
        .bind(now)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release the single-flight slot.
    pub async fn finish(&self, hash: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE run_markers SET running = 0, updated_at = ? WHERE object_hash = ?")
            .bind(now)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_running(&self, hash: &str) -> Result<bool> {
        let running: Option<i64> =
            sqlx::query_scalar("SELECT running FROM run_markers WHERE object_hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(running.unwrap_or(0) > 0)
    }

    /// Initialize the progress counters for a fresh run.
    pub async fn set_totals(&self, hash: &str, max: i64, count: i64) -> Result<()> {
        self.ensure_row(hash).await?;
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE run_markers SET max = ?, count = ?, updated_at = ? WHERE object_hash = ?",
        )
        .bind(max)
        .bind(count)
        .bind(now)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the processed counter; returns the new value.
    pub async fn increment_count(&self, hash: &str) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE run_markers SET count = count + 1, updated_at = ? WHERE object_hash = ?")
            .bind(now)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        let count: i64 =
            sqlx::query_scalar("SELECT count FROM run_markers WHERE object_hash = ?")
                .bind(hash)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn set_count(&self, hash: &str, count: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE run_markers SET count = ?, updated_at = ? WHERE object_hash = ?")
            .bind(count)
            .bind(now)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store the terminal outcome of a run for pollers.
    pub async fn set_result<T: Serialize>(&self, hash: &str, result: &T) -> Result<()> {
        self.ensure_row(hash).await?;
        let json = serde_json::to_string(result)?;
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE run_markers SET result_json = ?, updated_at = ? WHERE object_hash = ?",
        )
        .bind(json)
        .bind(now)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop any stale result payload before a new user-visible run.
    pub async fn clear_result(&self, hash: &str) -> Result<()> {
        self.ensure_row(hash).await?;
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE run_markers SET result_json = NULL, updated_at = ? WHERE object_hash = ?",
        )
        .bind(now)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The full marker snapshot for this object. Objects never run return
    /// an all-zero snapshot rather than an error.
    pub async fn progress(&self, hash: &str) -> Result<RunProgress> {
        let row = sqlx::query(
            "SELECT count, max, running, result_json FROM run_markers WHERE object_hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let result_json: Option<String> = row.get("result_json");
                let result = result_json.and_then(|raw| serde_json::from_str(&raw).ok());
                Ok(RunProgress {
                    count: row.get("count"),
                    max: row.get("max"),
                    running: row.get("running"),
                    result,
                })
            }
            None => Ok(RunProgress {
                count: 0,
                max: 0,
                running: 0,
                result: None,
            }),
        }
    }
}
