//! Core data models used throughout the simplification pipeline.
//!
//! These types represent the original texts, their per-language
//! simplifications, and the links between texts and the content objects
//! they were extracted from.

use sha2::{Digest, Sha256};

/// Lifecycle state of an original text.
///
/// ```text
/// to_simplify --(API call enqueued)--> processing
/// processing  --(simplified + written back)--> in_use
/// processing  --(operator resets)--> to_simplify
/// processing  --(operator ignores)--> ignore
/// ignore      --(operator resets)--> to_simplify
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextState {
    /// Extracted, waiting for an API call.
    ToSimplify,
    /// An API call is (or was) outstanding for this text.
    Processing,
    /// At least one simplification has been written back into an object.
    InUse,
    /// Operator excluded this text from simplification.
    Ignore,
}

impl TextState {
    /// The persisted representation of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TextState::ToSimplify => "to_simplify",
            TextState::Processing => "processing",
            TextState::InUse => "in_use",
            TextState::Ignore => "ignore",
        }
    }

    /// Parse a persisted state string. Returns `None` for anything outside
    /// the four legal states, so callers can treat unknown values as a no-op.
    pub fn parse(s: &str) -> Option<TextState> {
        match s {
            "to_simplify" => Some(TextState::ToSimplify),
            "processing" => Some(TextState::Processing),
            "in_use" => Some(TextState::InUse),
            "ignore" => Some(TextState::Ignore),
            _ => None,
        }
    }
}

impl std::fmt::Display for TextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An original text fragment, stored once and referenced by content hash.
#[derive(Debug, Clone)]
pub struct TextRecord {
    /// Surrogate id (UUID v4).
    pub id: String,
    /// The original text as extracted from a content object.
    pub original: String,
    /// Semantic slot the text came from ("title", "body", free-form).
    pub field: String,
    /// Whether splicing must preserve markup.
    pub is_html: bool,
    /// SHA-256 hex of `original`; dedup key together with `source_language`.
    pub hash: String,
    pub source_language: String,
    pub state: TextState,
    pub created_at: i64,
}

/// A simplified-language rendering of a [`TextRecord`] for one target
/// language. A record has at most one simplification per target language.
#[derive(Debug, Clone)]
pub struct Simplification {
    pub text_record_id: String,
    pub simplified_text: String,
    /// SHA-256 hex of `simplified_text`, used for the reverse lookup that
    /// keeps simplifications from being re-imported as originals.
    pub hash: String,
    pub target_language: String,
    /// Name of the API that produced this simplification.
    pub used_api: String,
    /// Opaque external job/request id, kept for audit.
    pub job_id: i64,
    /// Who triggered the call; 0 = system/automatic run.
    pub user_id: i64,
    pub created_at: i64,
}

/// Link between a [`TextRecord`] and a content object that contains it.
///
/// Created when a fragment is extracted from an object; removed when the
/// object is deleted or a re-extraction no longer finds the fragment.
#[derive(Debug, Clone)]
pub struct TextUsage {
    pub text_record_id: String,
    pub object_id: i64,
    pub object_type: String,
    /// Tenant the usage was recorded under (multi-site deployments share
    /// one store; 0 for single-tenant).
    pub tenant_id: i64,
    /// Position of the fragment within the object, for stable re-splicing.
    pub position: i64,
    /// Name of the parser that produced this fragment.
    pub page_builder: String,
    /// Per-object progress of this usage. A text simplified through one
    /// object stays `to_simplify` here for every other object that still
    /// needs the result spliced in.
    pub state: TextState,
}

/// A text fragment produced by a parser, before storage.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
    /// Whether the fragment carries markup that splicing must preserve.
    pub html: bool,
    /// Semantic slot; "title" fragments are processed before everything
    /// else.
    pub field: String,
}

impl Fragment {
    pub fn new(text: impl Into<String>, html: bool) -> Self {
        Self {
            text: text.into(),
            html,
            field: "body".to_string(),
        }
    }

    pub fn titled(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: false,
            field: "title".to_string(),
        }
    }
}

/// Identity of a content object: `(id, type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: i64,
    pub object_type: String,
}

impl ObjectRef {
    pub fn new(id: i64, object_type: impl Into<String>) -> Self {
        Self {
            id,
            object_type: object_type.into(),
        }
    }

    /// Stable key for this object's run markers: SHA-256 of type and id.
    pub fn marker_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.object_type.as_bytes());
        hasher.update(b":");
        hasher.update(self.id.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.object_type, self.id)
    }
}

/// Hash a text for content-addressable lookup.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for s in [
            TextState::ToSimplify,
            TextState::Processing,
            TextState::InUse,
            TextState::Ignore,
        ] {
            assert_eq!(TextState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn unknown_state_is_none() {
        assert_eq!(TextState::parse("done"), None);
        assert_eq!(TextState::parse(""), None);
        assert_eq!(TextState::parse("IN_USE"), None);
    }

    #[test]
    fn identical_text_same_hash() {
        assert_eq!(hash_text("Hello"), hash_text("Hello"));
        assert_ne!(hash_text("Hello"), hash_text("hello"));
    }

    #[test]
    fn marker_hash_distinguishes_type() {
        let a = ObjectRef::new(7, "page").marker_hash();
        let b = ObjectRef::new(7, "term").marker_hash();
        assert_ne!(a, b);
    }

    #[test]
    fn fragment_constructors_set_field() {
        assert_eq!(Fragment::new("x", true).field, "body");
        assert_eq!(Fragment::titled("x").field, "title");
    }
}
