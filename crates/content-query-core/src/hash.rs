//! Query identity.
//!
//! A [`QueryHash`] is the SHA-256 digest of a [`NormalizedDescriptor`],
//! rendered as 64 lowercase hex characters. It is the cache key and the only
//! handle clients use to name a query. The digest depends solely on the
//! normalized bytes, so hashes stay valid across restarts.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{QueryError, Result};
use crate::normalize::NormalizedDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Validate a client-supplied hash.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.len() != 64 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(QueryError::invalid(format!(
                "query hash must be 64 hex characters, got `{}`",
                text
            )));
        }
        Ok(Self(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest a normalized descriptor.
pub fn hash(normalized: &NormalizedDescriptor) -> QueryHash {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    QueryHash(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_value;
    use serde_json::json;

    fn hash_of(value: serde_json::Value) -> QueryHash {
        hash(&normalize_value(&value).unwrap().1)
    }

    #[test]
    fn test_hash_is_stable() {
        let h = hash_of(json!({"where": {"slug": {"$regex": "^/cats"}}}));
        assert_eq!(h.as_str().len(), 64);
        assert_eq!(h, hash_of(json!({"where": {"slug": {"$regex": "^/cats"}}})));
    }

    #[test]
    fn test_equivalent_descriptors_hash_equal() {
        assert_eq!(
            hash_of(json!({"where": {"a": 1, "b": "x"}, "limit": 3})),
            hash_of(json!({"limit": 3, "where": {"b": {"$eq": "x"}, "a": 1.0}}))
        );
    }

    #[test]
    fn test_conjunction_spellings_hash_equal() {
        let single = hash_of(json!({"where": {"a": 1}}));
        assert_eq!(single, hash_of(json!({"where": [{"a": 1}]})));
        assert_eq!(single, hash_of(json!({"where": {"$and": [{"a": 1}]}})));
        assert_eq!(
            hash_of(json!({"where": {"a": 1, "b": 2}})),
            hash_of(json!({"where": {"a": 1, "$and": [{"b": 2}]}}))
        );
    }

    #[test]
    fn test_regex_and_literal_hash_differently() {
        assert_ne!(
            hash_of(json!({"where": {"slug": "^/cats"}})),
            hash_of(json!({"where": {"slug": {"$regex": "^/cats"}}}))
        );
    }

    #[test]
    fn test_parse() {
        let h = hash_of(json!({}));
        assert_eq!(QueryHash::parse(&h.as_str().to_uppercase()).unwrap(), h);
        assert!(QueryHash::parse("abc").is_err());
        assert!(QueryHash::parse(&"z".repeat(64)).is_err());
    }
}
