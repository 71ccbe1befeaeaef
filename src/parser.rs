//! Format parser contract and registry.
//!
//! Parsers translate a content object's native structure into a flat list
//! of text fragments and splice simplified text back in. Format-specific
//! implementations (page builders, block editors) live outside this crate;
//! the pipeline resolves the right one per object through an ordered
//! registry — first parser to claim the object wins.

use crate::models::Fragment;
use crate::objects::ContentObject;

/// A format adapter for one kind of content structure.
pub trait Parser: Send + Sync {
    /// Identifier stored on usage links so later runs splice with the same
    /// parser that extracted the fragment.
    fn name(&self) -> &str;

    /// Whether this parser understands the given object's format.
    fn is_object_using_this_format(&self, object: &ContentObject) -> bool;

    /// Extract the translatable fragments from `content`, in document order.
    fn get_parsed_texts(&self, content: &str) -> Vec<Fragment>;

    /// Splice one simplified fragment into the whole content, replacing the
    /// original fragment it was produced from. Returns the updated whole.
    fn get_text_with_simplifications(
        &self,
        whole: &str,
        original_fragment: &str,
        simplified_fragment: &str,
    ) -> String;

    /// Format-specific post-processing after a run finished writing into
    /// the object. Default: nothing to do.
    fn update_object(&self, _object: &ContentObject) {}
}

/// Ordered list of parsers; resolution is a first-match-wins linear scan.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParserRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Create a registry pre-loaded with the built-in plain-text parser.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PlainTextParser));
        registry
    }

    /// Register a parser. Order matters: earlier parsers win ties.
    pub fn register(&mut self, parser: Box<dyn Parser>) {
        self.parsers.push(parser);
    }

    /// The first parser claiming this object, if any.
    pub fn resolve(&self, object: &ContentObject) -> Option<&dyn Parser> {
        self.parsers
            .iter()
            .find(|p| p.is_object_using_this_format(object))
            .map(|p| p.as_ref())
    }

    /// Look up a parser by the name recorded on a usage link.
    pub fn find(&self, name: &str) -> Option<&dyn Parser> {
        self.parsers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reference parser for unstructured plain text.
///
/// Fragments are blank-line-separated paragraphs; splicing is literal
/// replacement of the original fragment. Claims every object, so it must
/// be registered last.
pub struct PlainTextParser;

impl Parser for PlainTextParser {
    fn name(&self) -> &str {
        "plain"
    }

    fn is_object_using_this_format(&self, _object: &ContentObject) -> bool {
        true
    }

    fn get_parsed_texts(&self, content: &str) -> Vec<Fragment> {
        content
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Fragment::new(p, false))
            .collect()
    }

    fn get_text_with_simplifications(
        &self,
        whole: &str,
        original_fragment: &str,
        simplified_fragment: &str,
    ) -> String {
        // Identical fragments get identical simplifications, so replacing
        // every occurrence is the correct behavior here.
        whole.replace(original_fragment, simplified_fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::ObjectKind;

    fn object() -> ContentObject {
        ContentObject {
            id: 1,
            object_type: "page".to_string(),
            language: "en".to_string(),
            kind: ObjectKind::Simplifiable {
                target_languages: vec!["de".to_string()],
            },
            state: "published".to_string(),
            locked: false,
            automatic_mode_prevented: false,
        }
    }

    #[test]
    fn plain_parser_splits_paragraphs() {
        let fragments = PlainTextParser.get_parsed_texts("Hello\n\n\n\nWorld\n");
        let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello", "World"]);
    }

    #[test]
    fn plain_parser_splices() {
        let updated =
            PlainTextParser.get_text_with_simplifications("Hello\n\nWorld", "Hello", "Hallo");
        assert_eq!(updated, "Hallo\n\nWorld");
    }

    #[test]
    fn first_match_wins() {
        struct Never;
        impl Parser for Never {
            fn name(&self) -> &str {
                "never"
            }
            fn is_object_using_this_format(&self, _object: &ContentObject) -> bool {
                false
            }
            fn get_parsed_texts(&self, _content: &str) -> Vec<Fragment> {
                Vec::new()
            }
            fn get_text_with_simplifications(
                &self,
                whole: &str,
                _original: &str,
                _simplified: &str,
            ) -> String {
                whole.to_string()
            }
        }

        let mut registry = ParserRegistry::new();
        registry.register(Box::new(Never));
        registry.register(Box::new(PlainTextParser));

        let resolved = registry.resolve(&object()).unwrap();
        assert_eq!(resolved.name(), "plain");
    }
}
