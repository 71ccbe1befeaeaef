//! Content-addressable text store.
//!
//! The single source of truth for originals, their usage links, and their
//! per-language simplifications. Dedup works by content hash: callers look
//! up with [`TextStore::find_by_text`] before inserting, so a text that
//! already went through the paid API is never submitted twice — no matter
//! how many objects contain it.
//!
//! Lookups are memoized in-process: the `(hash, language) → id` mapping is
//! immutable once created, so the cache never serves stale data even
//! though record state changes underneath it.

use std::collections::HashMap;
use std::sync::RwLock;

use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{
    hash_text, ObjectRef, Simplification, TextRecord, TextState, TextUsage,
};
use crate::objects::ContentStore;
use crate::parser::ParserRegistry;

/// Errors surfaced by the store. Everything else in the pipeline is
/// reported as run-result data, not propagated errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Attempted to store a blank original; rejected before it reaches
    /// the database.
    #[error("refusing to store an empty text")]
    EmptyText,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Store behavior knobs, resolved from `[languages]` and `[behavior]`.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Source language assumed when a caller passes none.
    pub default_language: String,
    /// Cascade-delete an original once its last usage link is removed.
    pub delete_unused_texts: bool,
    /// Tenant recorded on new usage links.
    pub tenant_id: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            default_language: "de".to_string(),
            delete_unused_texts: false,
            tenant_id: 0,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_language: config.languages.default_source.clone(),
            delete_unused_texts: config.behavior.delete_unused_texts,
            tenant_id: config.behavior.tenant_id,
        }
    }
}

/// Sort order for [`TextStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Titles before everything else, then oldest first — cheap work first.
    #[default]
    TitleFirst,
    CreatedAsc,
    CreatedDesc,
}

/// Filter for [`TextStore::query`]. All fields are conjunctive; unset
/// fields do not constrain the result.
#[derive(Debug, Clone, Default)]
pub struct TextQuery {
    pub id: Option<String>,
    pub hash: Option<String>,
    pub original: Option<String>,
    pub state: Option<TextState>,
    pub source_language: Option<String>,
    pub field: Option<String>,
    /// Restrict to texts linked to this object.
    pub object: Option<ObjectRef>,
    /// Restrict to texts whose usage link is in this per-object state.
    /// This is the due-selection key: a text already simplified through
    /// another object still has a `to_simplify` usage here until its
    /// result is spliced into this object.
    pub usage_state: Option<TextState>,
    /// Exclude texts in these global states (e.g. operator-ignored).
    pub exclude_states: Vec<TextState>,
    /// `Some(true)`: only texts with at least one simplification;
    /// `Some(false)`: only texts without any.
    pub has_simplification: Option<bool>,
    /// Only texts that have a simplification in this language.
    pub target_language: Option<String>,
    pub order: QueryOrder,
    /// 0 = unlimited.
    pub limit: u64,
    /// Object-level predicates; applied by [`TextStore::query_filtered`]
    /// against the external content system.
    pub object_not_locked: bool,
    pub object_not_prevented: bool,
    /// Only objects in one of these editorial states.
    pub object_states: Vec<String>,
    /// No objects in any of these editorial states (e.g. "trash").
    pub exclude_object_states: Vec<String>,
}

enum Bind {
    Text(String),
    Int(i64),
}

/// Durable, queryable storage of originals, usages, and simplifications.
pub struct TextStore {
    pool: SqlitePool,
    options: StoreOptions,
    lookup_cache: RwLock<HashMap<(String, String), String>>,
}

impl TextStore {
    pub fn new(pool: SqlitePool, options: StoreOptions) -> Self {
        Self {
            pool,
            options,
            lookup_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn default_language(&self) -> &str {
        &self.options.default_language
    }

    // ============ Originals ============

    /// Insert a new original text in state `to_simplify`.
    ///
    /// This does NOT dedupe — callers must check [`find_by_text`](Self::find_by_text)
    /// first, which is what the extraction pipeline does.
    ///
    /// # Errors
    ///
    /// [`StoreError::EmptyText`] if `text` is blank.
    pub async fn add(
        &self,
        text: &str,
        source_language: Option<&str>,
        field: &str,
        is_html: bool,
    ) -> Result<TextRecord, StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::EmptyText);
        }

        let language = source_language
            .unwrap_or(&self.options.default_language)
            .to_string();
        let record = TextRecord {
            id: Uuid::new_v4().to_string(),
            original: text.to_string(),
            field: field.to_string(),
            is_html,
            hash: hash_text(text),
            source_language: language,
            state: TextState::ToSimplify,
            created_at: chrono::Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO texts (id, original, field, html, hash, source_language, state, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.original)
        .bind(&record.field)
        .bind(record.is_html as i64)
        .bind(&record.hash)
        .bind(&record.source_language)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        self.lookup_cache.write().unwrap().insert(
            (record.hash.clone(), record.source_language.clone()),
            record.id.clone(),
        );

        Ok(record)
    }

    /// Exact-match lookup by content hash and source language.
    pub async fn find_by_text(
        &self,
        text: &str,
        source_language: Option<&str>,
    ) -> Result<Option<TextRecord>, StoreError> {
        let language = source_language.unwrap_or(&self.options.default_language);
        let hash = hash_text(text);

        let cached_id = self
            .lookup_cache
            .read()
            .unwrap()
            .get(&(hash.clone(), language.to_string()))
            .cloned();
        if let Some(id) = cached_id {
            if let Some(record) = self.get(&id).await? {
                return Ok(Some(record));
            }
        }

        let row = sqlx::query("SELECT * FROM texts WHERE hash = ? AND source_language = ? LIMIT 1")
            .bind(&hash)
            .bind(language)
            .fetch_optional(&self.pool)
            .await?;

        let record = row.as_ref().map(row_to_record);
        if let Some(record) = &record {
            self.lookup_cache.write().unwrap().insert(
                (record.hash.clone(), record.source_language.clone()),
                record.id.clone(),
            );
        }
        Ok(record)
    }

    /// Reverse lookup: the original whose simplification in `language`
    /// matches `simplified_text`. Used during extraction to keep derived
    /// copies from being re-imported — simplifying a simplification would
    /// spend quota on text that is already simple.
    pub async fn find_by_simplification(
        &self,
        simplified_text: &str,
        language: &str,
    ) -> Result<Option<TextRecord>, StoreError> {
        let hash = hash_text(simplified_text);
        let row = sqlx::query(
            r#"
            SELECT t.* FROM texts t
            JOIN simplifications s ON s.text_id = t.id
            WHERE s.hash = ? AND s.target_language = ?
            LIMIT 1
            "#,
        )
        .bind(&hash)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_record))
    }

    /// Fetch a record by id.
    pub async fn get(&self, id: &str) -> Result<Option<TextRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM texts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_record))
    }

    /// Filtered listing of records. See [`TextQuery`] for the filter keys;
    /// object-level predicates are ignored here — use
    /// [`query_filtered`](Self::query_filtered) when they matter.
    pub async fn query(&self, q: &TextQuery) -> Result<Vec<TextRecord>, StoreError> {
        let mut sql = String::from("SELECT DISTINCT t.* FROM texts t");
        let mut clauses: Vec<String> = Vec::new();
        let mut binds: Vec<Bind> = Vec::new();

        if q.object.is_some() || q.usage_state.is_some() {
            sql.push_str(" JOIN text_usages u ON u.text_id = t.id");
        }
        if let Some(object) = &q.object {
            clauses.push("u.object_id = ? AND u.object_type = ?".to_string());
            binds.push(Bind::Int(object.id));
            binds.push(Bind::Text(object.object_type.clone()));
        }
        if let Some(state) = q.usage_state {
            clauses.push("u.state = ?".to_string());
            binds.push(Bind::Text(state.as_str().to_string()));
        }
        if !q.exclude_states.is_empty() {
            let placeholders = vec!["?"; q.exclude_states.len()].join(", ");
            clauses.push(format!("t.state NOT IN ({})", placeholders));
            for state in &q.exclude_states {
                binds.push(Bind::Text(state.as_str().to_string()));
            }
        }

        if let Some(id) = &q.id {
            clauses.push("t.id = ?".to_string());
            binds.push(Bind::Text(id.clone()));
        }
        if let Some(hash) = &q.hash {
            clauses.push("t.hash = ?".to_string());
            binds.push(Bind::Text(hash.clone()));
        }
        if let Some(original) = &q.original {
            clauses.push("t.original = ?".to_string());
            binds.push(Bind::Text(original.clone()));
        }
        if let Some(state) = q.state {
            clauses.push("t.state = ?".to_string());
            binds.push(Bind::Text(state.as_str().to_string()));
        }
        if let Some(lang) = &q.source_language {
            clauses.push("t.source_language = ?".to_string());
            binds.push(Bind::Text(lang.clone()));
        }
        if let Some(field) = &q.field {
            clauses.push("t.field = ?".to_string());
            binds.push(Bind::Text(field.clone()));
        }
        if let Some(lang) = &q.target_language {
            clauses.push(
                "EXISTS (SELECT 1 FROM simplifications s WHERE s.text_id = t.id AND s.target_language = ?)"
                    .to_string(),
            );
            binds.push(Bind::Text(lang.clone()));
        }
        if let Some(has) = q.has_simplification {
            let op = if has { "EXISTS" } else { "NOT EXISTS" };
            clauses.push(format!(
                "{} (SELECT 1 FROM simplifications s WHERE s.text_id = t.id)",
                op
            ));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        match q.order {
            QueryOrder::TitleFirst => sql.push_str(
                " ORDER BY CASE WHEN t.field = 'title' THEN 0 ELSE 1 END, t.created_at ASC",
            ),
            QueryOrder::CreatedAsc => sql.push_str(" ORDER BY t.created_at ASC"),
            QueryOrder::CreatedDesc => sql.push_str(" ORDER BY t.created_at DESC"),
        }

        if q.limit > 0 {
            sql.push_str(" LIMIT ?");
            binds.push(Bind::Int(q.limit as i64));
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = match bind {
                Bind::Text(s) => query.bind(s),
                Bind::Int(i) => query.bind(i),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    /// [`query`](Self::query) plus the object-level predicates that need
    /// the external content system: locked objects, objects opted out of
    /// automatic mode, and objects in excluded editorial states (e.g.
    /// trash). A record passes when at least one of its usages points at
    /// an object satisfying every predicate.
    pub async fn query_filtered(
        &self,
        q: &TextQuery,
        content: &dyn ContentStore,
    ) -> anyhow::Result<Vec<TextRecord>> {
        let records = self.query(q).await?;
        if !q.object_not_locked
            && !q.object_not_prevented
            && q.object_states.is_empty()
            && q.exclude_object_states.is_empty()
        {
            return Ok(records);
        }

        let mut result = Vec::with_capacity(records.len());
        for record in records {
            let usages = self.usages(&record.id).await?;
            let mut keep = false;
            for usage in &usages {
                let obj = ObjectRef::new(usage.object_id, usage.object_type.clone());
                let Some(object) = content.get(&obj).await? else {
                    continue;
                };
                if q.object_not_locked && object.is_locked() {
                    continue;
                }
                if q.object_not_prevented && object.is_automatic_mode_prevented() {
                    continue;
                }
                if !q.object_states.is_empty() && !q.object_states.contains(&object.state) {
                    continue;
                }
                if q.exclude_object_states.contains(&object.state) {
                    continue;
                }
                keep = true;
                break;
            }
            if keep {
                result.push(record);
            }
        }
        Ok(result)
    }

    // ============ Usage links ============

    /// Link a record to an object. Re-extraction updates position and
    /// parser tag in place.
    pub async fn add_usage(
        &self,
        record_id: &str,
        object: &ObjectRef,
        position: i64,
        page_builder: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO text_usages (text_id, object_id, object_type, tenant_id, position, page_builder, state)
            VALUES (?, ?, ?, ?, ?, ?, 'to_simplify')
            ON CONFLICT(text_id, object_id, object_type, tenant_id) DO UPDATE SET
                position = excluded.position,
                page_builder = excluded.page_builder
            "#,
        )
        .bind(record_id)
        .bind(object.id)
        .bind(&object.object_type)
        .bind(self.options.tenant_id)
        .bind(position)
        .bind(page_builder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn usages(&self, record_id: &str) -> Result<Vec<TextUsage>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM text_usages WHERE text_id = ? ORDER BY object_type, object_id, position",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_usage).collect())
    }

    pub async fn usage_for_object(
        &self,
        record_id: &str,
        object: &ObjectRef,
    ) -> Result<Option<TextUsage>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM text_usages WHERE text_id = ? AND object_id = ? AND object_type = ? LIMIT 1",
        )
        .bind(record_id)
        .bind(object.id)
        .bind(&object.object_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_usage))
    }

    /// How many records are linked to this object; the quota precheck
    /// compares this against the API's per-interval budget.
    pub async fn count_for_object(&self, object: &ObjectRef) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT text_id) FROM text_usages WHERE object_id = ? AND object_type = ?",
        )
        .bind(object.id)
        .bind(&object.object_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Set the per-object state of one usage link.
    pub async fn set_usage_state(
        &self,
        record_id: &str,
        object: &ObjectRef,
        state: TextState,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE text_usages SET state = ? WHERE text_id = ? AND object_id = ? AND object_type = ?",
        )
        .bind(state.as_str())
        .bind(record_id)
        .bind(object.id)
        .bind(&object.object_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ State ============

    /// Persist a state transition.
    pub async fn set_state(
        &self,
        record: &mut TextRecord,
        state: TextState,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE texts SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
        record.state = state;
        Ok(())
    }

    /// State transition from a raw string, as arriving from operators and
    /// HTTP callers. Anything outside the four legal states is a silent
    /// no-op; returns whether the state changed.
    pub async fn set_state_raw(
        &self,
        record: &mut TextRecord,
        state: &str,
    ) -> Result<bool, StoreError> {
        match TextState::parse(state) {
            Some(parsed) => {
                self.set_state(record, parsed).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ============ Simplifications ============

    /// Persist a simplification and advance the record to `in_use`.
    ///
    /// Not an upsert: duplicate calls create duplicate rows, so callers
    /// check [`has_simplification_in_language`](Self::has_simplification_in_language)
    /// first.
    pub async fn set_simplification(
        &self,
        record: &mut TextRecord,
        simplified_text: &str,
        target_language: &str,
        used_api: &str,
        job_id: i64,
        user_id: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO simplifications (text_id, simplified_text, hash, target_language, used_api, job_id, user_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(simplified_text)
        .bind(hash_text(simplified_text))
        .bind(target_language)
        .bind(used_api)
        .bind(job_id)
        .bind(user_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.set_state(record, TextState::InUse).await?;
        Ok(())
    }

    pub async fn has_simplification_in_language(
        &self,
        record_id: &str,
        language: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM simplifications WHERE text_id = ? AND target_language = ?",
        )
        .bind(record_id)
        .bind(language)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// The simplification of `record` for `language` — or the ORIGINAL
    /// text, unmodified, when none exists. Callers must not assume
    /// simplification occurred.
    pub async fn get_simplification(
        &self,
        record: &TextRecord,
        language: &str,
    ) -> Result<String, StoreError> {
        let text: Option<String> = sqlx::query_scalar(
            "SELECT simplified_text FROM simplifications \
             WHERE text_id = ? AND target_language = ? \
             ORDER BY created_at ASC LIMIT 1",
        )
        .bind(&record.id)
        .bind(language)
        .fetch_optional(&self.pool)
        .await?;
        Ok(text.unwrap_or_else(|| record.original.clone()))
    }

    pub async fn simplifications(
        &self,
        record_id: &str,
    ) -> Result<Vec<Simplification>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM simplifications WHERE text_id = ? ORDER BY target_language",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_simplification).collect())
    }

    /// Bulk-clear the simplifications table. Irreversible; originals and
    /// usage links stay in place.
    pub async fn reset_all_simplifications(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM simplifications")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ============ Splicing ============

    /// Write the simplification of `record` for `target_language` into the
    /// simplified copy of `object`, through the parser that extracted the
    /// fragment. Returns `false` when no usage, parser, copy, or
    /// simplification is resolvable.
    pub async fn replace_original_with_simplification(
        &self,
        record: &TextRecord,
        object: &ObjectRef,
        target_language: &str,
        content: &dyn ContentStore,
        parsers: &ParserRegistry,
    ) -> anyhow::Result<bool> {
        let Some(usage) = self.usage_for_object(&record.id, object).await? else {
            return Ok(false);
        };
        let Some(parser) = parsers.find(&usage.page_builder) else {
            tracing::warn!(
                record = %record.id,
                page_builder = %usage.page_builder,
                "no parser registered for usage; cannot splice"
            );
            return Ok(false);
        };
        if !self
            .has_simplification_in_language(&record.id, target_language)
            .await?
        {
            return Ok(false);
        }
        let Some(copy) = content.simplified_copy(object, target_language).await? else {
            return Ok(false);
        };

        let simplified = self.get_simplification(record, target_language).await?;
        let copy_ref = copy.object_ref();
        let whole = content.content(&copy_ref).await?;
        let updated = parser.get_text_with_simplifications(&whole, &record.original, &simplified);
        if updated == whole {
            // Fragment not found in the copy — structural drift between
            // original and derived content.
            return Ok(false);
        }
        content.set_content(&copy_ref, &updated).await?;
        Ok(true)
    }

    // ============ Deletion ============

    /// Remove the usage link for `object` (or every usage when `None`).
    /// When the record's last usage goes away and the delete-unused policy
    /// is on, the original and all its simplifications go with it.
    pub async fn delete(
        &self,
        record_id: &str,
        object: Option<&ObjectRef>,
    ) -> Result<(), StoreError> {
        match object {
            Some(obj) => {
                sqlx::query(
                    "DELETE FROM text_usages WHERE text_id = ? AND object_id = ? AND object_type = ?",
                )
                .bind(record_id)
                .bind(obj.id)
                .bind(&obj.object_type)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM text_usages WHERE text_id = ?")
                    .bind(record_id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        if !self.options.delete_unused_texts {
            return Ok(());
        }

        let remaining: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM text_usages WHERE text_id = ?")
                .bind(record_id)
                .fetch_one(&self.pool)
                .await?;
        if remaining > 0 {
            return Ok(());
        }

        let record = self.get(record_id).await?;
        sqlx::query("DELETE FROM simplifications WHERE text_id = ?")
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM texts WHERE id = ?")
            .bind(record_id)
            .execute(&self.pool)
            .await?;

        if let Some(record) = record {
            self.lookup_cache
                .write()
                .unwrap()
                .remove(&(record.hash, record.source_language));
        }
        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> TextRecord {
    let state: String = row.get("state");
    TextRecord {
        id: row.get("id"),
        original: row.get("original"),
        field: row.get("field"),
        is_html: row.get::<i64, _>("html") != 0,
        hash: row.get("hash"),
        source_language: row.get("source_language"),
        // Unknown persisted values degrade to to_simplify rather than
        // poisoning every query that touches the row.
        state: TextState::parse(&state).unwrap_or(TextState::ToSimplify),
        created_at: row.get("created_at"),
    }
}

fn row_to_usage(row: &sqlx::sqlite::SqliteRow) -> TextUsage {
    let state: String = row.get("state");
    TextUsage {
        text_record_id: row.get("text_id"),
        object_id: row.get("object_id"),
        object_type: row.get("object_type"),
        tenant_id: row.get("tenant_id"),
        position: row.get("position"),
        page_builder: row.get("page_builder"),
        state: TextState::parse(&state).unwrap_or(TextState::ToSimplify),
    }
}

fn row_to_simplification(row: &sqlx::sqlite::SqliteRow) -> Simplification {
    Simplification {
        text_record_id: row.get("text_id"),
        simplified_text: row.get("simplified_text"),
        hash: row.get("hash"),
        target_language: row.get("target_language"),
        used_api: row.get("used_api"),
        job_id: row.get("job_id"),
        user_id: row.get("user_id"),
        created_at: row.get("created_at"),
    }
}
