//! Core data models: documents, slugs, and navigation nodes.
//!
//! A [`Document`] is identified by its canonical slug, a `/`-separated path.
//! Parent/child relationships are never stored; they are implied by slug
//! prefix containment and recovered with [`ancestor_slugs`].

use serde::Serialize;
use serde_json::{Map, Value};

/// A single content document.
///
/// Immutable once it enters a [`DocumentStore`](crate::store::DocumentStore);
/// a corpus reload replaces documents wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    slug: String,
    fields: Map<String, Value>,
}

impl Document {
    /// Build a document from a slug and its fields.
    ///
    /// The slug is stored as given; the store canonicalizes it on insert.
    /// Any `slug` entry in `fields` is overwritten so the two never disagree.
    pub fn new(slug: impl Into<String>, mut fields: Map<String, Value>) -> Self {
        let slug = slug.into();
        fields.insert("slug".to_string(), Value::String(slug.clone()));
        Self { slug, fields }
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// The `title` field, when it is a string.
    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }

    /// Look up a field by dot path (`meta.author`).
    ///
    /// Numeric segments index into arrays.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Segments of the slug; the store root `/` has none.
    pub fn segments(&self) -> Vec<&str> {
        slug_segments(&self.slug)
    }

    pub(crate) fn with_slug(mut self, slug: String) -> Self {
        self.fields
            .insert("slug".to_string(), Value::String(slug.clone()));
        self.slug = slug;
        self
    }

    /// Render the document as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

impl Serialize for Document {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

/// A node in a navigation tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationNode {
    pub slug: String,
    pub title: String,
    /// False for ancestors kept only to connect matches to the root.
    pub matched: bool,
    /// Extra metadata copied from the document.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NavigationNode>,
}

impl NavigationNode {
    /// Visit every node depth-first, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a NavigationNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// Canonicalize a slug: leading `/`, no empty segments, no trailing `/`.
///
/// Returns `None` for slugs that cannot name a document (empty input or a
/// `.`/`..` segment).
pub fn canonical_slug(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return None;
        }
        segments.push(segment);
    }
    Some(format!("/{}", segments.join("/")))
}

/// Split a canonical slug into its segments.
pub fn slug_segments(slug: &str) -> Vec<&str> {
    slug.split('/').filter(|s| !s.is_empty()).collect()
}

/// Proper ancestors of a canonical slug, deepest first.
///
/// The store root `/` is never an ancestor.
pub fn ancestor_slugs(slug: &str) -> Vec<String> {
    let segments = slug_segments(slug);
    (1..segments.len())
        .rev()
        .map(|depth| format!("/{}", segments[..depth].join("/")))
        .collect()
}
