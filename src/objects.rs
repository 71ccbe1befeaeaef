//! Content object collaborator surface.
//!
//! The system that owns editable content (pages, posts, taxonomy terms)
//! lives outside this crate. The pipeline only depends on the small
//! capability surface below: identity, language, simplifiable/simplified
//! classification, an edit lock, and the automatic-mode opt-out.
//!
//! Two [`ContentStore`] implementations ship with the crate:
//! - [`MemoryContentStore`] — `HashMap` behind `RwLock`, for tests and
//!   embedding the pipeline in another process.
//! - [`JsonContentStore`] — a JSON file on disk, which is what the CLI
//!   commands operate on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::ObjectRef;

/// Classification of a content object. Every object is exactly one of the
/// two: a source-language original, or a per-language derived copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// A source-language object texts are extracted from.
    Simplifiable {
        /// Target languages this object is being simplified into
        /// (one simplified copy per language).
        target_languages: Vec<String>,
    },
    /// A derived copy holding spliced-in simplifications for one language.
    Simplified {
        /// The simplifiable original this copy belongs to.
        original_id: i64,
    },
}

/// A content object as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct ContentObject {
    pub id: i64,
    pub object_type: String,
    /// Detected source language for simplifiable objects; the target
    /// language for simplified copies.
    pub language: String,
    pub kind: ObjectKind,
    /// Editorial state ("published", "draft", "trash", ...). Trashed
    /// objects are excluded from text selection.
    pub state: String,
    /// Externally-owned edit lock. Runs must not start while set.
    pub locked: bool,
    /// Opts the object out of unattended batch runs.
    pub automatic_mode_prevented: bool,
}

impl ContentObject {
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.id, self.object_type.clone())
    }

    pub fn is_simplifiable(&self) -> bool {
        matches!(self.kind, ObjectKind::Simplifiable { .. })
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_automatic_mode_prevented(&self) -> bool {
        self.automatic_mode_prevented
    }

    /// Whether this object is being simplified into `language`.
    pub fn is_simplifying_into(&self, language: &str) -> bool {
        match &self.kind {
            ObjectKind::Simplifiable { target_languages } => {
                target_languages.iter().any(|l| l == language)
            }
            ObjectKind::Simplified { .. } => false,
        }
    }
}

/// Access to the external content system.
///
/// Implementations are expected to be cheap to call repeatedly; the
/// orchestrator consults them per text and per language pair.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch an object by identity.
    async fn get(&self, obj: &ObjectRef) -> Result<Option<ContentObject>>;

    /// The object's editable content.
    async fn content(&self, obj: &ObjectRef) -> Result<String>;

    /// Replace the object's editable content.
    async fn set_content(&self, obj: &ObjectRef, content: &str) -> Result<()>;

    /// The simplified copy of `original` for one target language, if it
    /// has been created.
    async fn simplified_copy(
        &self,
        original: &ObjectRef,
        target_language: &str,
    ) -> Result<Option<ContentObject>>;

    /// All simplifiable objects, for scheduler-driven runs.
    async fn list_simplifiable(&self) -> Result<Vec<ContentObject>>;

    /// Post-run notification that an object's derived content changed
    /// (cache invalidation, search reindex, and similar follow-ups live
    /// behind this on the content system's side).
    async fn mark_updated(&self, obj: &ObjectRef) -> Result<()>;
}

// ============ In-memory store ============

struct StoredObject {
    object: ContentObject,
    content: String,
}

/// In-memory content store for tests and embedded use.
pub struct MemoryContentStore {
    objects: RwLock<HashMap<ObjectRef, StoredObject>>,
    updated: RwLock<Vec<ObjectRef>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            updated: RwLock::new(Vec::new()),
        }
    }

    /// Add or replace an object together with its content.
    pub fn insert(&self, object: ContentObject, content: impl Into<String>) {
        let mut objects = self.objects.write().unwrap();
        objects.insert(
            object.object_ref(),
            StoredObject {
                object,
                content: content.into(),
            },
        );
    }

    pub fn set_locked(&self, obj: &ObjectRef, locked: bool) {
        if let Some(stored) = self.objects.write().unwrap().get_mut(obj) {
            stored.object.locked = locked;
        }
    }

    /// Objects that received a `mark_updated` notification, in order.
    pub fn updated(&self) -> Vec<ObjectRef> {
        self.updated.read().unwrap().clone()
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get(&self, obj: &ObjectRef) -> Result<Option<ContentObject>> {
        Ok(self
            .objects
            .read()
            .unwrap()
            .get(obj)
            .map(|s| s.object.clone()))
    }

    async fn content(&self, obj: &ObjectRef) -> Result<String> {
        self.objects
            .read()
            .unwrap()
            .get(obj)
            .map(|s| s.content.clone())
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", obj))
    }

    async fn set_content(&self, obj: &ObjectRef, content: &str) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        let stored = objects
            .get_mut(obj)
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", obj))?;
        stored.content = content.to_string();
        Ok(())
    }

    async fn simplified_copy(
        &self,
        original: &ObjectRef,
        target_language: &str,
    ) -> Result<Option<ContentObject>> {
        let objects = self.objects.read().unwrap();
        Ok(objects
            .values()
            .map(|s| &s.object)
            .find(|o| {
                o.language == target_language
                    && o.object_type == original.object_type
                    && matches!(&o.kind, ObjectKind::Simplified { original_id } if *original_id == original.id)
            })
            .cloned())
    }

    async fn list_simplifiable(&self) -> Result<Vec<ContentObject>> {
        let objects = self.objects.read().unwrap();
        let mut result: Vec<ContentObject> = objects
            .values()
            .map(|s| s.object.clone())
            .filter(|o| o.is_simplifiable())
            .collect();
        result.sort_by_key(|o| (o.object_type.clone(), o.id));
        Ok(result)
    }

    async fn mark_updated(&self, obj: &ObjectRef) -> Result<()> {
        self.updated.write().unwrap().push(obj.clone());
        Ok(())
    }
}

// ============ JSON file store ============

/// On-disk object representation for [`JsonContentStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileObject {
    id: i64,
    object_type: String,
    language: String,
    /// `"simplifiable"` or `"simplified"`.
    kind: String,
    #[serde(default)]
    target_languages: Vec<String>,
    #[serde(default)]
    original_id: Option<i64>,
    #[serde(default = "default_state")]
    state: String,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    automatic_mode_prevented: bool,
    #[serde(default)]
    content: String,
    #[serde(default)]
    updated_at: i64,
}

fn default_state() -> String {
    "published".to_string()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ContentFile {
    objects: Vec<FileObject>,
}

/// Content store backed by a JSON file.
///
/// This is the collaborator the CLI uses so `spx extract` and
/// `spx simplify` work end to end without a real content system. The file
/// is read once at construction and rewritten after every mutation.
pub struct JsonContentStore {
    path: PathBuf,
    file: RwLock<ContentFile>,
}

impl JsonContentStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read content file: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse content file: {}", path.display()))?
        } else {
            ContentFile::default()
        };
        Ok(Self {
            path,
            file: RwLock::new(file),
        })
    }

    fn persist(&self, file: &ContentFile) -> Result<()> {
        let raw = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write content file: {}", self.path.display()))?;
        Ok(())
    }

    fn to_object(fo: &FileObject) -> ContentObject {
        let kind = if fo.kind == "simplified" {
            ObjectKind::Simplified {
                original_id: fo.original_id.unwrap_or(0),
            }
        } else {
            ObjectKind::Simplifiable {
                target_languages: fo.target_languages.clone(),
            }
        };
        ContentObject {
            id: fo.id,
            object_type: fo.object_type.clone(),
            language: fo.language.clone(),
            kind,
            state: fo.state.clone(),
            locked: fo.locked,
            automatic_mode_prevented: fo.automatic_mode_prevented,
        }
    }
}

#[async_trait]
impl ContentStore for JsonContentStore {
    async fn get(&self, obj: &ObjectRef) -> Result<Option<ContentObject>> {
        let file = self.file.read().unwrap();
        Ok(file
            .objects
            .iter()
            .find(|o| o.id == obj.id && o.object_type == obj.object_type)
            .map(Self::to_object))
    }

    async fn content(&self, obj: &ObjectRef) -> Result<String> {
        let file = self.file.read().unwrap();
        file.objects
            .iter()
            .find(|o| o.id == obj.id && o.object_type == obj.object_type)
            .map(|o| o.content.clone())
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", obj))
    }

    async fn set_content(&self, obj: &ObjectRef, content: &str) -> Result<()> {
        let mut file = self.file.write().unwrap();
        let fo = file
            .objects
            .iter_mut()
            .find(|o| o.id == obj.id && o.object_type == obj.object_type)
            .ok_or_else(|| anyhow::anyhow!("object not found: {}", obj))?;
        fo.content = content.to_string();
        self.persist(&file)
    }

    async fn simplified_copy(
        &self,
        original: &ObjectRef,
        target_language: &str,
    ) -> Result<Option<ContentObject>> {
        let file = self.file.read().unwrap();
        Ok(file
            .objects
            .iter()
            .find(|o| {
                o.kind == "simplified"
                    && o.object_type == original.object_type
                    && o.language == target_language
                    && o.original_id == Some(original.id)
            })
            .map(Self::to_object))
    }

    async fn list_simplifiable(&self) -> Result<Vec<ContentObject>> {
        let file = self.file.read().unwrap();
        Ok(file
            .objects
            .iter()
            .filter(|o| o.kind != "simplified")
            .map(Self::to_object)
            .collect())
    }

    async fn mark_updated(&self, obj: &ObjectRef) -> Result<()> {
        let mut file = self.file.write().unwrap();
        if let Some(fo) = file
            .objects
            .iter_mut()
            .find(|o| o.id == obj.id && o.object_type == obj.object_type)
        {
            fo.updated_at = chrono::Utc::now().timestamp();
            self.persist(&file)?;
        }
        Ok(())
    }
}
