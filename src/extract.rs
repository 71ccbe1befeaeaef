//! Fragment extraction pipeline.
//!
//! Turns a simplifiable content object into stored [`TextRecord`]s:
//! resolve the object's parser, collect fragments, dedup against the
//! store, and maintain the usage links. Re-extracting an object diffs the
//! result — fragments that disappeared from the object lose their usage
//! link (and, policy permitting, the orphaned original is dropped).

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::models::TextRecord;
use crate::objects::{ContentObject, ContentStore};
use crate::parser::ParserRegistry;
use crate::store::{TextQuery, TextStore};

/// Counters reported after extracting one object.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    /// New originals created.
    pub created: u64,
    /// Fragments linked to an already-stored original.
    pub linked: u64,
    /// Fragments skipped because they are themselves simplifications.
    pub skipped_simplifications: u64,
    /// Fragments skipped because they were empty.
    pub skipped_empty: u64,
    /// Usage links removed because the fragment is gone from the object.
    pub removed: u64,
}

/// Extract all fragments of `object` into the store.
///
/// Only simplifiable objects are extracted; passing a simplified copy is
/// an error on the caller's side.
pub async fn extract_object(
    store: &TextStore,
    content: &dyn ContentStore,
    parsers: &ParserRegistry,
    object: &ContentObject,
) -> Result<ExtractReport> {
    if !object.is_simplifiable() {
        bail!("cannot extract a simplified copy: {}", object.object_ref());
    }
    let Some(parser) = parsers.resolve(object) else {
        bail!("no parser claims object {}", object.object_ref());
    };

    let obj_ref = object.object_ref();
    let body = content.content(&obj_ref).await?;
    let fragments = parser.get_parsed_texts(&body);
    let language = object.language.as_str();

    let mut report = ExtractReport::default();
    let mut seen: HashSet<String> = HashSet::new();

    for (position, fragment) in fragments.iter().enumerate() {
        let text = fragment.text.trim();
        if text.is_empty() {
            report.skipped_empty += 1;
            continue;
        }

        // Don't re-import text that is already the output of the API;
        // simplifying a simplification wastes quota and degrades text.
        if store
            .find_by_simplification(text, language)
            .await?
            .is_some()
        {
            report.skipped_simplifications += 1;
            continue;
        }

        let record: TextRecord = match store.find_by_text(text, Some(language)).await? {
            Some(existing) => {
                report.linked += 1;
                existing
            }
            None => {
                let created = store
                    .add(text, Some(language), &fragment.field, fragment.html)
                    .await?;
                report.created += 1;
                created
            }
        };

        store
            .add_usage(&record.id, &obj_ref, position as i64, parser.name())
            .await?;
        seen.insert(record.id);
    }

    // Diff: drop links for records this object no longer contains.
    for record in store
        .query(&TextQuery {
            object: Some(obj_ref.clone()),
            ..Default::default()
        })
        .await?
    {
        if !seen.contains(&record.id) {
            store.delete(&record.id, Some(&obj_ref)).await?;
            report.removed += 1;
        }
    }

    Ok(report)
}
