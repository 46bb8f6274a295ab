//! In-memory document store.
//!
//! A [`DocumentStore`] is an immutable snapshot of the corpus keyed by
//! canonical slug. Iteration is always slug-sorted, which is the default
//! result order of every query. A reload builds a fresh store and swaps it
//! in; nothing ever mutates a published store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::{canonical_slug, Document};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Immutable, slug-ordered collection of documents.
#[derive(Debug)]
pub struct DocumentStore {
    docs: BTreeMap<String, Arc<Document>>,
    version: u64,
    loaded_at: DateTime<Utc>,
}

impl DocumentStore {
    /// Build a store from loaded documents.
    ///
    /// Documents with an unusable slug are skipped with a warning, as are
    /// later documents repeating an earlier slug. One bad document never
    /// prevents the rest of the corpus from loading.
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        let mut docs = BTreeMap::new();
        for doc in documents {
            let Some(slug) = canonical_slug(doc.slug()) else {
                tracing::warn!(slug = doc.slug(), "skipping document with invalid slug");
                continue;
            };
            if docs.contains_key(&slug) {
                tracing::warn!(slug = %slug, "skipping document with duplicate slug");
                continue;
            }
            let doc = if doc.slug() == slug {
                doc
            } else {
                doc.with_slug(slug.clone())
            };
            docs.insert(slug, Arc::new(doc));
        }

        let store = Self {
            docs,
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            loaded_at: Utc::now(),
        };
        tracing::debug!(
            version = store.version,
            documents = store.len(),
            "document store built"
        );
        store
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn get(&self, slug: &str) -> Option<&Arc<Document>> {
        self.docs.get(slug)
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.docs.contains_key(slug)
    }

    /// Documents in slug order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Document>> {
        self.docs.values()
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.docs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Unique per store instance; grows with every build.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn doc(slug: &str, title: &str) -> Document {
        let mut fields = Map::new();
        fields.insert("title".to_string(), json!(title));
        Document::new(slug, fields)
    }

    #[test]
    fn test_iteration_is_slug_sorted() {
        let store = DocumentStore::new(vec![
            doc("/dogs", "Dogs"),
            doc("/cats/siamese", "Siamese"),
            doc("/cats", "Cats"),
            doc("/cats/persian", "Persian"),
        ]);
        let slugs: Vec<&str> = store.slugs().collect();
        assert_eq!(slugs, vec!["/cats", "/cats/persian", "/cats/siamese", "/dogs"]);
    }

    #[test]
    fn test_slugs_are_canonicalized() {
        let store = DocumentStore::new(vec![doc("cats/", "Cats")]);
        let cats = store.get("/cats").unwrap();
        assert_eq!(cats.slug(), "/cats");
        assert_eq!(cats.get("slug"), Some(&json!("/cats")));
    }

    #[test]
    fn test_invalid_and_duplicate_slugs_skipped() {
        let store = DocumentStore::new(vec![
            doc("/cats", "First"),
            doc("/cats/", "Second"),
            doc("", "Empty"),
            doc("/a/../b", "Dots"),
        ]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("/cats").unwrap().title(), Some("First"));
    }

    #[test]
    fn test_versions_increase() {
        let a = DocumentStore::empty();
        let b = DocumentStore::empty();
        assert!(b.version() > a.version());
        assert!(a.is_empty());
    }
}
