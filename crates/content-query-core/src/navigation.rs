//! Navigation trees built from flat query results.
//!
//! The tree contains every matched document plus the ancestors (present in
//! the store) needed to connect matches to a common root. Ancestors above
//! the longest slug prefix shared by all matches are left out, so a query
//! confined to `/cats` is rooted at `/cats`; matches spread across several
//! top-level branches produce several top-level nodes. Sibling subtrees
//! without matches never appear because only matches and their ancestors are
//! ever added.
//!
//! Node order follows the flat result: a node sorts by the position of the
//! first matched document in its subtree, ties broken by slug.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::models::{ancestor_slugs, slug_segments, Document, NavigationNode};
use crate::store::DocumentStore;

/// Node keys that document metadata may not overwrite.
const RESERVED_KEYS: [&str; 4] = ["slug", "title", "matched", "children"];

/// Controls which document metadata is copied onto navigation nodes.
#[derive(Debug, Clone, Default)]
pub struct NavigationOptions {
    /// Extra fields copied from each document, by dot path.
    pub fields: Vec<String>,
}

struct Included {
    doc: Arc<Document>,
    matched: bool,
    position: usize,
}

/// Build the pruned navigation tree for `matches`.
///
/// `matches` must come from `store`. Zero matches produce an empty tree.
pub fn build_navigation(
    matches: &[Arc<Document>],
    store: &DocumentStore,
    options: &NavigationOptions,
) -> Vec<NavigationNode> {
    if matches.is_empty() {
        return Vec::new();
    }

    let root_depth = common_prefix_depth(matches);
    let mut included: HashMap<String, Included> = HashMap::new();

    for (position, doc) in matches.iter().enumerate() {
        included
            .entry(doc.slug().to_string())
            .or_insert_with(|| Included {
                doc: doc.clone(),
                matched: true,
                position,
            });
    }

    for (position, doc) in matches.iter().enumerate() {
        for ancestor in ancestor_slugs(doc.slug()) {
            if slug_segments(&ancestor).len() < root_depth {
                break;
            }
            if let Some(node) = included.get_mut(&ancestor) {
                node.position = node.position.min(position);
            } else if let Some(found) = store.get(&ancestor) {
                included.insert(
                    ancestor,
                    Included {
                        doc: found.clone(),
                        matched: false,
                        position,
                    },
                );
            }
        }
    }

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    let mut roots: Vec<String> = Vec::new();
    for slug in included.keys() {
        let parent = ancestor_slugs(slug)
            .into_iter()
            .find(|a| included.contains_key(a));
        match parent {
            Some(parent) => children.entry(parent).or_default().push(slug.clone()),
            None => roots.push(slug.clone()),
        }
    }

    let sort = |slugs: &mut Vec<String>| {
        slugs.sort_by(|a, b| {
            included[a]
                .position
                .cmp(&included[b].position)
                .then_with(|| a.cmp(b))
        })
    };
    sort(&mut roots);
    for list in children.values_mut() {
        sort(list);
    }

    roots
        .iter()
        .map(|slug| build_node(slug, &included, &children, options))
        .collect()
}

fn build_node(
    slug: &str,
    included: &HashMap<String, Included>,
    children: &HashMap<String, Vec<String>>,
    options: &NavigationOptions,
) -> NavigationNode {
    let entry = &included[slug];
    NavigationNode {
        slug: slug.to_string(),
        title: node_title(&entry.doc),
        matched: entry.matched,
        fields: node_fields(&entry.doc, options),
        children: children
            .get(slug)
            .map(|list| {
                list.iter()
                    .map(|child| build_node(child, included, children, options))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

fn node_title(doc: &Document) -> String {
    match doc.title() {
        Some(title) => title.to_string(),
        None => doc
            .segments()
            .last()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "/".to_string()),
    }
}

fn node_fields(doc: &Document, options: &NavigationOptions) -> Map<String, Value> {
    let mut fields = Map::new();
    for name in &options.fields {
        if RESERVED_KEYS.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = doc.get(name) {
            fields.insert(name.clone(), value.clone());
        }
    }
    if let Some(Value::Object(extra)) = doc.get("navigation") {
        for (key, value) in extra {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                fields.insert(key.clone(), value.clone());
            }
        }
    }
    fields
}

/// Number of leading slug segments shared by every match.
fn common_prefix_depth(matches: &[Arc<Document>]) -> usize {
    let first = matches[0].segments();
    matches[1..].iter().fold(first.len(), |depth, doc| {
        let segments = doc.segments();
        first
            .iter()
            .zip(&segments)
            .take(depth)
            .take_while(|(a, b)| a == b)
            .count()
    })
}
