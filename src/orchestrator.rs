//! Per-object batch orchestration.
//!
//! Coordinates one simplification run: guards against concurrent runs on
//! the same object, detects work left behind by a crashed run, prechecks
//! the API quota, then walks the object's due texts through the external
//! API and splices results back through the parser.
//!
//! Every outcome — success, degradation, or failure — is captured as a
//! [`RunOutcome`] stored in the object's run marker and polled by the
//! caller. Nothing propagates as an error across the run boundary except
//! infrastructure failures (a database that stopped answering).

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::api::SimplificationApi;
use crate::markers::RunState;
use crate::models::{ObjectRef, TextRecord, TextState};
use crate::objects::{ContentObject, ContentStore};
use crate::parser::ParserRegistry;
use crate::progress::{ProgressReporter, RunProgressEvent};
use crate::store::{TextQuery, TextStore};

/// Source language → target languages, as configured in
/// `[languages.mappings]`.
pub type LanguageMappings = BTreeMap<String, Vec<String>>;

/// What went wrong for one text, surfaced in the run result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No simplification came back from the API; the log has the detail.
    ApiFailed,
    /// The API returned text but it could not be written into the
    /// content — a parser/format defect, not a transient condition.
    SpliceMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextFailure {
    pub record_id: String,
    pub kind: FailureKind,
}

/// Terminal outcome of one `run_batch` call, stored in the run marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Single-flight guard tripped; dismissible, not fatal.
    AlreadyRunning,
    /// The object is under an external edit lock.
    Locked,
    /// Records from a previous run are stuck in `processing`; the operator
    /// must choose retry or ignore before a new run can start.
    StaleProcessing { pending: u64 },
    /// Too many texts for one synchronous pass; deferred to the
    /// background run — or, for opted-out objects, an invitation to
    /// enable automatic mode.
    QuotaDeferred {
        total: u64,
        limit: u64,
        automatic_prevented: bool,
    },
    /// Nothing was due and nothing had been processed this run: the
    /// object was already fully simplified, the API was not used.
    AlreadyComplete { max: u64 },
    /// Terminal result of a run that did work (or finished its last page).
    Finished {
        processed: u64,
        max: u64,
        /// Texts that triggered a genuine API call — quota actually spent.
        api_calls: u64,
        /// Texts satisfied from storage without touching the API.
        reused: u64,
        errors: Vec<TextFailure>,
    },
}

impl RunOutcome {
    /// Operator-facing summary line.
    pub fn message(&self) -> String {
        match self {
            RunOutcome::AlreadyRunning => {
                "A simplification run for this object is already in progress.".to_string()
            }
            RunOutcome::Locked => {
                "The object is locked for editing; try again when the lock is released.".to_string()
            }
            RunOutcome::StaleProcessing { pending } => format!(
                "{} text(s) from a previous run are still marked as processing. \
                 Retry them (--resolve-stale retry) or exclude them (--resolve-stale ignore).",
                pending
            ),
            RunOutcome::QuotaDeferred {
                total,
                limit,
                automatic_prevented,
            } => {
                if *automatic_prevented {
                    format!(
                        "{} texts exceed the API budget of {} per run. \
                         Enable automatic mode for this object to process them in the background.",
                        total, limit
                    )
                } else {
                    format!(
                        "{} texts exceed the API budget of {} per run; \
                         the background run will handle them.",
                        total, limit
                    )
                }
            }
            RunOutcome::AlreadyComplete { max } => format!(
                "All {} text(s) are already simplified; the API was not used.",
                max
            ),
            RunOutcome::Finished {
                processed,
                max,
                api_calls,
                reused,
                errors,
            } => {
                let mut msg = format!(
                    "Processed {}/{} text(s): {} via API, {} reused from storage.",
                    processed, max, api_calls, reused
                );
                if !errors.is_empty() {
                    msg.push_str(&format!(" {} failure(s); check the log.", errors.len()));
                }
                msg
            }
        }
    }
}

/// Operator decision for records stuck in `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleDecision {
    /// Put them back into the queue.
    Retry,
    /// Exclude them from simplification.
    Ignore,
}

/// Per-call options for [`Orchestrator::run_batch`].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Maximum texts to process in this call; 0 = unlimited.
    pub limit: u64,
    /// Whether this is the first call of a user-visible run (runs the
    /// guard/recovery/quota phase) or a continuation page.
    pub is_init: bool,
    /// Operator who triggered the run; 0 = system/automatic.
    pub user_id: i64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            is_init: true,
            user_id: 0,
        }
    }
}

/// Classification of one text after `process_one`.
#[derive(Debug)]
struct ProcessReport {
    /// Simplifications produced by fresh API calls.
    produced: u64,
    failure: Option<FailureKind>,
    /// Satisfied entirely from storage.
    reused: bool,
}

/// Batch driver for one content object at a time.
pub struct Orchestrator<'a> {
    store: &'a TextStore,
    content: &'a dyn ContentStore,
    parsers: &'a ParserRegistry,
    run_state: &'a RunState,
    reporter: Option<&'a dyn ProgressReporter>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        store: &'a TextStore,
        content: &'a dyn ContentStore,
        parsers: &'a ParserRegistry,
        run_state: &'a RunState,
    ) -> Self {
        Self {
            store,
            content,
            parsers,
            run_state,
            reporter: None,
        }
    }

    /// Attach a progress reporter for CLI-driven runs.
    pub fn with_reporter(mut self, reporter: &'a dyn ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Run one batch for `object`. Returns the number of texts processed
    /// by this call (or the recorded total when nothing was left to do).
    ///
    /// With `opts.is_init` the call first clears the previous result,
    /// acquires the single-flight slot, checks for crash leftovers, and
    /// prechecks the quota; continuation pages skip straight to the work
    /// phase. When a page ends with work remaining, the single-flight slot
    /// stays held and the caller is expected to call again.
    pub async fn run_batch(
        &self,
        object: &ContentObject,
        api: &dyn SimplificationApi,
        mappings: &LanguageMappings,
        opts: RunOptions,
    ) -> Result<u64> {
        let obj_ref = object.object_ref();
        let hash = obj_ref.marker_hash();

        if opts.is_init {
            self.run_state.clear_result(&hash).await?;

            if object.is_locked() {
                self.run_state
                    .set_result(&hash, &RunOutcome::Locked)
                    .await?;
                return Ok(0);
            }

            // Single-flight: the marker update only succeeds when no run
            // is in flight, so two racing processes cannot both pass.
            if !self.run_state.try_begin(&hash).await? {
                self.run_state
                    .set_result(&hash, &RunOutcome::AlreadyRunning)
                    .await?;
                return Ok(0);
            }

            // Crash recovery: work left in `processing` by a run that died
            // must not be silently resumed or dropped.
            let stale = self
                .store
                .query(&TextQuery {
                    object: Some(obj_ref.clone()),
                    state: Some(TextState::Processing),
                    ..Default::default()
                })
                .await?;
            if !stale.is_empty() {
                self.run_state.finish(&hash).await?;
                self.run_state
                    .set_result(
                        &hash,
                        &RunOutcome::StaleProcessing {
                            pending: stale.len() as u64,
                        },
                    )
                    .await?;
                return Ok(0);
            }

            // Quota precheck: refuse to start a synchronous pass that is
            // doomed to exceed the external rate limit.
            let total = self.store.count_for_object(&obj_ref).await?;
            let limit = api.max_requests_per_interval();
            if total > limit {
                self.run_state.finish(&hash).await?;
                self.run_state
                    .set_result(
                        &hash,
                        &RunOutcome::QuotaDeferred {
                            total,
                            limit,
                            automatic_prevented: object.is_automatic_mode_prevented(),
                        },
                    )
                    .await?;
                return Ok(0);
            }

            self.run_state.set_totals(&hash, total as i64, 0).await?;
        }

        // Work phase.
        if let Some(reporter) = self.reporter {
            reporter.report(RunProgressEvent::Selecting {
                object: obj_ref.to_string(),
            });
        }

        // Due = usages of this object still waiting, excluding texts the
        // operator ignored or a dead run left in processing. A text
        // simplified through another object is still due HERE until its
        // result is spliced into this object's copies.
        let due = self
            .store
            .query(&TextQuery {
                object: Some(obj_ref.clone()),
                usage_state: Some(TextState::ToSimplify),
                exclude_states: vec![TextState::Ignore, TextState::Processing],
                limit: opts.limit,
                ..Default::default()
            })
            .await?;

        let marker = self.run_state.progress(&hash).await?;

        if due.is_empty() {
            let outcome = if marker.count == 0 {
                RunOutcome::AlreadyComplete {
                    max: marker.max as u64,
                }
            } else {
                RunOutcome::Finished {
                    processed: marker.count as u64,
                    max: marker.max as u64,
                    api_calls: 0,
                    reused: 0,
                    errors: Vec::new(),
                }
            };
            self.run_state.set_count(&hash, marker.max).await?;
            self.run_state.finish(&hash).await?;
            self.run_state.set_result(&hash, &outcome).await?;
            return Ok(marker.max as u64);
        }

        let mut api_calls = 0u64;
        let mut reused = 0u64;
        let mut errors: Vec<TextFailure> = Vec::new();
        let mut processed = 0u64;

        for mut record in due {
            let report = self
                .process_one(&mut record, object, api, mappings, opts.user_id)
                .await?;
            api_calls += report.produced;
            if report.reused {
                reused += 1;
            }
            if let Some(kind) = report.failure {
                errors.push(TextFailure {
                    record_id: record.id.clone(),
                    kind,
                });
            }
            processed += 1;

            let count = self.run_state.increment_count(&hash).await?;
            if let Some(reporter) = self.reporter {
                reporter.report(RunProgressEvent::Processing {
                    object: obj_ref.to_string(),
                    n: count,
                    total: marker.max,
                });
            }
        }

        let marker = self.run_state.progress(&hash).await?;
        if marker.count >= marker.max {
            self.run_state.finish(&hash).await?;
            self.run_state
                .set_result(
                    &hash,
                    &RunOutcome::Finished {
                        processed: marker.count as u64,
                        max: marker.max as u64,
                        api_calls,
                        reused,
                        errors,
                    },
                )
                .await?;
            // Finalize: let the parser and the content system react to
            // the derived content having changed.
            if let Some(parser) = self.parsers.resolve(object) {
                parser.update_object(object);
            }
            self.content.mark_updated(&obj_ref).await?;
        }
        // Otherwise the slot stays held and the caller paginates.

        Ok(processed)
    }

    /// Process a single text: call the API for every configured language
    /// pair that still needs it, then splice everything available into
    /// the object's simplified copies.
    async fn process_one(
        &self,
        record: &mut TextRecord,
        object: &ContentObject,
        api: &dyn SimplificationApi,
        mappings: &LanguageMappings,
        user_id: i64,
    ) -> Result<ProcessReport> {
        self.store
            .set_state(record, TextState::Processing)
            .await?;

        let obj_ref = object.object_ref();
        let mut api_error = false;
        let mut produced = 0u64;

        for (source, targets) in mappings {
            if &record.source_language != source {
                continue;
            }
            for target in targets {
                if !object.is_simplifying_into(target) {
                    continue;
                }
                if self
                    .store
                    .has_simplification_in_language(&record.id, target)
                    .await?
                {
                    continue;
                }

                match api.call(&record.original, source, target).await {
                    Ok(simplified) => {
                        match self
                            .store
                            .set_simplification(
                                record,
                                &simplified.text,
                                target,
                                api.name(),
                                simplified.job_id,
                                user_id,
                            )
                            .await
                        {
                            Ok(()) => produced += 1,
                            Err(e) => {
                                // The record stays in `processing`; the
                                // next run's crash recovery picks it up.
                                tracing::error!(
                                    record = %record.id,
                                    target_language = %target,
                                    error = %e,
                                    "failed to persist simplification"
                                );
                                return Ok(ProcessReport {
                                    produced,
                                    failure: Some(FailureKind::ApiFailed),
                                    reused: false,
                                });
                            }
                        }
                    }
                    Err(e) => {
                        // Other language pairs may still succeed.
                        tracing::error!(
                            record = %record.id,
                            source_language = %source,
                            target_language = %target,
                            error = %e,
                            "simplification API call failed"
                        );
                        api_error = true;
                    }
                }
            }
        }

        let mut replaced = 0u64;
        for (source, targets) in mappings {
            if &record.source_language != source {
                continue;
            }
            for target in targets {
                if !object.is_simplifying_into(target) {
                    continue;
                }
                if !self
                    .store
                    .has_simplification_in_language(&record.id, target)
                    .await?
                {
                    continue;
                }
                match self
                    .store
                    .replace_original_with_simplification(
                        record, &obj_ref, target, self.content, self.parsers,
                    )
                    .await
                {
                    Ok(true) => replaced += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            record = %record.id,
                            target_language = %target,
                            error = %e,
                            "splice failed"
                        );
                    }
                }
            }
        }

        // Outcome classification. A text whose API calls all failed goes
        // back into the queue so the next run retries it; everything else
        // counts as used, including pure local reuse.
        if api_error && produced == 0 {
            self.store
                .set_state(record, TextState::ToSimplify)
                .await?;
            // The usage stays to_simplify so the retry selects it again.
            return Ok(ProcessReport {
                produced: 0,
                failure: Some(FailureKind::ApiFailed),
                reused: false,
            });
        }

        let failure = if produced > 0 && replaced == 0 {
            tracing::error!(
                record = %record.id,
                "API returned text but none of it could be written into content"
            );
            Some(FailureKind::SpliceMismatch)
        } else {
            None
        };
        let reused = produced == 0 && replaced > 0;

        self.store.set_state(record, TextState::InUse).await?;
        self.store
            .set_usage_state(&record.id, &obj_ref, TextState::InUse)
            .await?;

        Ok(ProcessReport {
            produced,
            failure,
            reused,
        })
    }

    /// Apply the operator's decision to records stuck in `processing`.
    /// Returns how many records were updated.
    pub async fn resolve_stale(
        &self,
        object: &ObjectRef,
        decision: StaleDecision,
    ) -> Result<u64> {
        let stale = self
            .store
            .query(&TextQuery {
                object: Some(object.clone()),
                state: Some(TextState::Processing),
                ..Default::default()
            })
            .await?;

        let target = match decision {
            StaleDecision::Retry => TextState::ToSimplify,
            StaleDecision::Ignore => TextState::Ignore,
        };

        let mut updated = 0u64;
        for mut record in stale {
            self.store.set_state(&mut record, target).await?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Scheduler entry point: run one batch for every simplifiable object
    /// that is eligible for unattended processing. Locked objects, opted
    /// -out objects, and trashed objects are skipped.
    pub async fn run_automatic(
        &self,
        api: &dyn SimplificationApi,
        mappings: &LanguageMappings,
        limit: u64,
    ) -> Result<u64> {
        let mut processed = 0u64;
        for object in self.content.list_simplifiable().await? {
            if object.is_locked() || object.is_automatic_mode_prevented() {
                continue;
            }
            if object.state == "trash" {
                continue;
            }
            processed += self
                .run_batch(
                    &object,
                    api,
                    mappings,
                    RunOptions {
                        limit,
                        is_init: true,
                        user_id: 0,
                    },
                )
                .await?;
        }
        Ok(processed)
    }
}
