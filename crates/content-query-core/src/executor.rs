//! Query execution against the current document store.
//!
//! [`QueryEngine`] ties the pieces together:
//!
//! 1. A wire descriptor is parsed and normalized, then hashed into a
//!    [`QueryHash`].
//! 2. The hash is looked up in the cache of the current generation (store
//!    snapshot plus its cache). On a miss the filter is compiled once and
//!    run across the whole store, under single-flight so concurrent
//!    resolvers of the same hash share one scan.
//! 3. Matches keep store (slug) order unless the descriptor sorts; `skip`
//!    and `limit` apply last.
//!
//! A corpus reload installs a new generation atomically. Resolutions that
//! already captured the old generation finish against it; the old cache
//! is dropped with it. Descriptors stay registered across reloads, so a
//! known hash can be resolved by hash alone against any later corpus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cache::{CacheEntry, QueryCache};
use crate::descriptor::{QueryDescriptor, SortDirection};
use crate::error::{QueryError, Result};
use crate::hash::{hash, QueryHash};
use crate::models::{Document, NavigationNode};
use crate::navigation::{build_navigation, NavigationOptions};
use crate::normalize::{normalize, NormalizedDescriptor};
use crate::predicate::{compare_values, CompiledFilter, EvalStats};
use crate::store::DocumentStore;

/// A parsed descriptor together with its identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub hash: QueryHash,
    pub normalized: NormalizedDescriptor,
    pub descriptor: QueryDescriptor,
}

impl Identity {
    pub fn of(value: &Value) -> Result<Self> {
        Self::from_descriptor(QueryDescriptor::from_value(value)?)
    }

    pub fn from_descriptor(descriptor: QueryDescriptor) -> Result<Self> {
        let normalized = normalize(&descriptor)?;
        Ok(Self {
            hash: hash(&normalized),
            normalized,
            descriptor,
        })
    }
}

/// The outcome of resolving a query.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub hash: QueryHash,
    pub entry: Arc<CacheEntry>,
    descriptor: Arc<QueryDescriptor>,
    store: Arc<DocumentStore>,
}

impl Resolution {
    pub fn documents(&self) -> &[Arc<Document>] {
        &self.entry.documents
    }

    /// The store snapshot the result was computed against.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Documents as JSON with `only`/`without` projection applied.
    pub fn render(&self) -> Vec<Value> {
        self.documents()
            .iter()
            .map(|doc| project(doc, &self.descriptor))
            .collect()
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub store_version: u64,
    pub documents: usize,
    pub loaded_at: DateTime<Utc>,
    pub cached_queries: usize,
    pub known_queries: usize,
    pub scans: u64,
}

struct Generation {
    store: Arc<DocumentStore>,
    cache: QueryCache,
}

impl Generation {
    fn new(store: DocumentStore) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::new(store),
            cache: QueryCache::new(),
        })
    }
}

/// Resolves queries against an immutable, swappable document store.
pub struct QueryEngine {
    generation: RwLock<Arc<Generation>>,
    known: RwLock<HashMap<QueryHash, Arc<QueryDescriptor>>>,
    navigation: NavigationOptions,
    scans: Arc<AtomicU64>,
}

impl QueryEngine {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            generation: RwLock::new(Generation::new(store)),
            known: RwLock::new(HashMap::new()),
            navigation: NavigationOptions::default(),
            scans: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_navigation(mut self, options: NavigationOptions) -> Self {
        self.navigation = options;
        self
    }

    fn current(&self) -> Arc<Generation> {
        self.generation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The store snapshot new resolutions would run against.
    pub fn snapshot(&self) -> Arc<DocumentStore> {
        self.current().store.clone()
    }

    /// Install a new store and an empty cache in one step.
    ///
    /// Returns the new store version.
    pub fn reload(&self, store: DocumentStore) -> u64 {
        let generation = Generation::new(store);
        let version = generation.store.version();
        let documents = generation.store.len();
        *self
            .generation
            .write()
            .unwrap_or_else(PoisonError::into_inner) = generation;
        tracing::info!(version, documents, "corpus reloaded, query cache cleared");
        version
    }

    /// Number of full corpus scans performed so far.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        let generation = self.current();
        EngineStats {
            store_version: generation.store.version(),
            documents: generation.store.len(),
            loaded_at: generation.store.loaded_at(),
            cached_queries: generation.cache.len(),
            known_queries: self
                .known
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            scans: self.scans(),
        }
    }

    /// Resolve a parsed descriptor, registering it under its hash.
    pub async fn resolve(&self, descriptor: QueryDescriptor) -> Result<Resolution> {
        let identity = Identity::from_descriptor(descriptor)?;
        let descriptor = self.register(&identity);
        self.resolve_registered(identity.hash, descriptor).await
    }

    /// Flat results for `hash`.
    ///
    /// `descriptor` is only needed the first time a hash is used; when given
    /// it must hash to `hash`.
    pub async fn query_documents(
        &self,
        hash: &QueryHash,
        descriptor: Option<&Value>,
    ) -> Result<Resolution> {
        let descriptor = self.lookup(hash, descriptor)?;
        self.resolve_registered(hash.clone(), descriptor).await
    }

    /// Navigation tree for `hash`, built from the same flat result that
    /// [`query_documents`](Self::query_documents) returns.
    pub async fn query_navigation(
        &self,
        hash: &QueryHash,
        descriptor: Option<&Value>,
    ) -> Result<Vec<NavigationNode>> {
        let resolution = self.query_documents(hash, descriptor).await?;
        Ok(self.navigation_for(&resolution))
    }

    pub fn navigation_for(&self, resolution: &Resolution) -> Vec<NavigationNode> {
        build_navigation(resolution.documents(), &resolution.store, &self.navigation)
    }

    fn lookup(&self, hash: &QueryHash, descriptor: Option<&Value>) -> Result<Arc<QueryDescriptor>> {
        match descriptor {
            Some(value) => {
                let identity = Identity::of(value)?;
                if identity.hash != *hash {
                    return Err(QueryError::invalid(format!(
                        "descriptor hashes to {}, not {}",
                        identity.hash, hash
                    )));
                }
                Ok(self.register(&identity))
            }
            None => self
                .known
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(hash)
                .cloned()
                .ok_or_else(|| QueryError::UnknownQuery(hash.clone())),
        }
    }

    fn register(&self, identity: &Identity) -> Arc<QueryDescriptor> {
        let mut known = self.known.write().unwrap_or_else(PoisonError::into_inner);
        known
            .entry(identity.hash.clone())
            .or_insert_with(|| {
                tracing::debug!(hash = %identity.hash, normalized = identity.normalized.as_str(), "registered query");
                Arc::new(identity.descriptor.clone())
            })
            .clone()
    }

    async fn resolve_registered(
        &self,
        hash: QueryHash,
        descriptor: Arc<QueryDescriptor>,
    ) -> Result<Resolution> {
        let generation = self.current();
        let store = generation.store.clone();

        let entry = match generation.cache.get(&hash) {
            Some(entry) => {
                tracing::debug!(hash = %hash, "query cache hit");
                entry
            }
            None => {
                let scans = self.scans.clone();
                let scan_store = store.clone();
                let scan_descriptor = descriptor.clone();
                let scan_hash = hash.clone();
                generation
                    .cache
                    .get_or_compute(&hash, move || {
                        execute(&scan_hash, &scan_descriptor, &scan_store, &scans)
                    })
                    .await?
            }
        };

        Ok(Resolution {
            hash,
            entry,
            descriptor,
            store,
        })
    }
}

/// Run a descriptor across every document in `store`.
fn execute(
    hash: &QueryHash,
    descriptor: &QueryDescriptor,
    store: &DocumentStore,
    scans: &AtomicU64,
) -> Result<CacheEntry> {
    let filter = CompiledFilter::compile(descriptor)?;
    scans.fetch_add(1, Ordering::Relaxed);

    let mut stats = EvalStats::default();
    let mut documents: Vec<Arc<Document>> = store
        .iter()
        .filter(|doc| filter.matches(doc, &mut stats))
        .cloned()
        .collect();

    if !descriptor.sort.is_empty() {
        documents.sort_by(|a, b| {
            descriptor
                .sort
                .iter()
                .map(|key| {
                    let ordering = compare_values(a.get(&key.field), b.get(&key.field));
                    match key.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    let matched = documents.len();
    let documents: Vec<Arc<Document>> = documents
        .into_iter()
        .skip(descriptor.skip)
        .take(descriptor.limit.unwrap_or(usize::MAX))
        .collect();

    if stats.type_mismatches > 0 {
        tracing::debug!(
            hash = %hash,
            type_mismatches = stats.type_mismatches,
            "operators applied to fields of the wrong type were treated as non-matches"
        );
    }
    tracing::debug!(
        hash = %hash,
        evaluated = stats.evaluated,
        matched,
        returned = documents.len(),
        store_version = store.version(),
        "query executed"
    );

    Ok(CacheEntry {
        hash: hash.clone(),
        documents,
        created_at: Utc::now(),
        store_version: store.version(),
    })
}

/// Apply `only`/`without`. Names are dot paths into nested objects, the
/// same paths `where` and `sort` accept; `slug` is always kept.
fn project(doc: &Document, descriptor: &QueryDescriptor) -> Value {
    if descriptor.only.is_empty() && descriptor.without.is_empty() {
        return doc.to_value();
    }
    let mut fields: Map<String, Value> = if descriptor.only.is_empty() {
        doc.fields().clone()
    } else {
        let mut picked = Map::new();
        picked.insert("slug".to_string(), Value::from(doc.slug()));
        for path in &descriptor.only {
            if let Some(value) = doc.get(path) {
                insert_path(&mut picked, path, value.clone());
            }
        }
        picked
    };
    for path in &descriptor.without {
        if path != "slug" {
            remove_path(&mut fields, path);
        }
    }
    Value::Object(fields)
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head)
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

fn remove_path(map: &mut Map<String, Value>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(child)) = map.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Clause;
    use serde_json::json;

    fn doc(slug: &str, fields: Value) -> Document {
        match fields {
            Value::Object(map) => Document::new(slug, map),
            _ => panic!("fields must be an object"),
        }
    }

    fn pets() -> DocumentStore {
        DocumentStore::new(vec![
            doc("/cats", json!({"title": "Cats", "order": 2})),
            doc("/cats/siamese", json!({"title": "Siamese", "order": 1})),
            doc("/cats/persian", json!({"title": "Persian", "order": 3})),
            doc("/dogs", json!({"title": "Dogs", "order": 4})),
        ])
    }

    fn cats_query() -> Value {
        json!({"where": {"slug": {"$regex": "^/cats"}}})
    }

    fn slugs(resolution: &Resolution) -> Vec<&str> {
        resolution.documents().iter().map(|d| d.slug()).collect()
    }

    #[tokio::test]
    async fn test_cats_scenario() {
        let engine = QueryEngine::new(pets());
        let identity = Identity::of(&cats_query()).unwrap();

        let resolution = engine
            .query_documents(&identity.hash, Some(&cats_query()))
            .await
            .unwrap();
        assert_eq!(
            slugs(&resolution),
            vec!["/cats", "/cats/persian", "/cats/siamese"]
        );

        let tree = engine.query_navigation(&identity.hash, None).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].slug, "/cats");
        let children: Vec<&str> = tree[0].children.iter().map(|c| c.slug.as_str()).collect();
        assert_eq!(children, vec!["/cats/persian", "/cats/siamese"]);
        assert_eq!(engine.scans(), 1);
    }

    #[tokio::test]
    async fn test_zero_matches() {
        let engine = QueryEngine::new(pets());
        let query = json!({"where": {"slug": {"$regex": "^/reptiles"}}});
        let hash = Identity::of(&query).unwrap().hash;

        let resolution = engine.query_documents(&hash, Some(&query)).await.unwrap();
        assert!(resolution.documents().is_empty());
        let tree = engine.query_navigation(&hash, None).await.unwrap();
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_hash_without_descriptor() {
        let engine = QueryEngine::new(pets());
        let hash = Identity::of(&cats_query()).unwrap().hash;
        let err = engine.query_documents(&hash, None).await.unwrap_err();
        assert_eq!(err, QueryError::UnknownQuery(hash));
    }

    #[tokio::test]
    async fn test_hash_mismatch_rejected() {
        let engine = QueryEngine::new(pets());
        let other = Identity::of(&json!({})).unwrap().hash;
        let err = engine
            .query_documents(&other, Some(&cats_query()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_descriptor");
    }

    #[tokio::test]
    async fn test_repeated_queries_are_idempotent() {
        let engine = QueryEngine::new(pets());
        let hash = Identity::of(&cats_query()).unwrap().hash;
        let first = engine
            .query_documents(&hash, Some(&cats_query()))
            .await
            .unwrap();
        let second = engine.query_documents(&hash, None).await.unwrap();
        assert!(Arc::ptr_eq(&first.entry, &second.entry));
        assert_eq!(slugs(&first), slugs(&second));
        assert_eq!(engine.scans(), 1);
    }

    #[tokio::test]
    async fn test_sort_skip_limit() {
        let engine = QueryEngine::new(pets());
        let resolution = engine
            .resolve(
                QueryDescriptor::from_value(&json!({
                    "sort": [{"order": -1}],
                    "skip": 1,
                    "limit": 2
                }))
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(slugs(&resolution), vec!["/cats/persian", "/cats"]);
    }

    #[tokio::test]
    async fn test_projection() {
        let engine = QueryEngine::new(pets());
        let only = engine
            .resolve(QueryDescriptor::from_value(&json!({"only": ["title"], "limit": 1})).unwrap())
            .await
            .unwrap();
        assert_eq!(only.render(), vec![json!({"slug": "/cats", "title": "Cats"})]);

        let without = engine
            .resolve(
                QueryDescriptor::from_value(&json!({"without": ["order", "slug"], "limit": 1}))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(without.render(), vec![json!({"slug": "/cats", "title": "Cats"})]);
    }

    #[tokio::test]
    async fn test_projection_dot_paths() {
        let engine = QueryEngine::new(DocumentStore::new(vec![doc(
            "/post",
            json!({"title": "Post", "meta": {"author": "ana", "words": 120}}),
        )]));
        let only = engine
            .resolve(QueryDescriptor::from_value(&json!({"only": ["meta.author", "missing.x"]})).unwrap())
            .await
            .unwrap();
        assert_eq!(
            only.render(),
            vec![json!({"slug": "/post", "meta": {"author": "ana"}})]
        );

        let without = engine
            .resolve(QueryDescriptor::from_value(&json!({"without": ["meta.words", "title.x"]})).unwrap())
            .await
            .unwrap();
        assert_eq!(
            without.render(),
            vec![json!({"slug": "/post", "title": "Post", "meta": {"author": "ana"}})]
        );
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_query() {
        let engine = QueryEngine::new(pets());
        let err = engine
            .resolve(QueryDescriptor::filter(Clause::regex("slug", "([")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_pattern");
        assert_eq!(engine.scans(), 0);
    }

    #[tokio::test]
    async fn test_reload_clears_cache_but_keeps_known_queries() {
        let engine = QueryEngine::new(pets());
        let hash = Identity::of(&cats_query()).unwrap().hash;
        let before = engine
            .query_documents(&hash, Some(&cats_query()))
            .await
            .unwrap();
        assert_eq!(before.documents().len(), 3);

        let version = engine.reload(DocumentStore::new(vec![
            doc("/cats", json!({})),
            doc("/cats/bengal", json!({})),
        ]));
        assert_eq!(engine.stats().store_version, version);
        assert_eq!(engine.stats().cached_queries, 0);

        let after = engine.query_documents(&hash, None).await.unwrap();
        assert_eq!(slugs(&after), vec!["/cats", "/cats/bengal"]);
        assert_eq!(engine.scans(), 2);

        // The earlier result still refers to the snapshot it was computed on.
        assert_eq!(before.documents().len(), 3);
        assert_eq!(before.store().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_resolutions_scan_once() {
        let engine = Arc::new(QueryEngine::new(pets()));
        let hash = Identity::of(&cats_query()).unwrap().hash;
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            let hash = hash.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                engine
                    .query_documents(&hash, Some(&cats_query()))
                    .await
                    .unwrap()
            }));
        }
        let a = tasks.remove(0).await.unwrap();
        let b = tasks.remove(0).await.unwrap();

        assert!(Arc::ptr_eq(&a.entry, &b.entry));
        assert_eq!(engine.scans(), 1);
    }

    #[tokio::test]
    async fn test_regex_results_satisfy_pattern() {
        let engine = QueryEngine::new(pets());
        let resolution = engine
            .resolve(QueryDescriptor::filter(Clause::regex("slug", "^/cats")))
            .await
            .unwrap();
        let pattern = regex::Regex::new("^/cats").unwrap();
        assert!(!resolution.documents().is_empty());
        for doc in resolution.documents() {
            assert!(pattern.is_match(doc.slug()));
        }
    }
}
