//! Canonical serialization of query descriptors.
//!
//! Normalization works on the parsed [`QueryDescriptor`], not on the raw
//! wire JSON, so every spelling of the same query produces the same bytes:
//! key order is irrelevant, `{"a": 1}` equals `{"a": {"$eq": 1}}`, and `1.0`
//! equals `1`. Conjunctions are flattened into one member list, sorted, and
//! a single-member conjunction collapses to that member, so a `where` array,
//! an explicit `$and` and several keys in one object all agree. Sequence
//! order (`$or` members, `sort`, `$in` lists) is kept because it is part of
//! the query.
//!
//! Regex clauses carry `"op":"regex"` with separate `pattern` and `flags`
//! members, so a regex and a literal string with the same text can never
//! serialize identically.

use serde_json::{Map, Number, Value};

use crate::descriptor::{Clause, Predicate, QueryDescriptor, SortDirection};
use crate::error::{QueryError, Result};

/// The canonical byte form of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NormalizedDescriptor(Vec<u8>);

impl NormalizedDescriptor {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Built from serde_json output, which is always UTF-8.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

/// Normalize a parsed descriptor.
pub fn normalize(descriptor: &QueryDescriptor) -> Result<NormalizedDescriptor> {
    let mut root = Map::new();
    root.insert("where".to_string(), clause_value(&descriptor.filter));
    if !descriptor.sort.is_empty() {
        let sort = descriptor
            .sort
            .iter()
            .map(|key| {
                let direction = match key.direction {
                    SortDirection::Asc => 1,
                    SortDirection::Desc => -1,
                };
                object([("field", Value::from(key.field.as_str())), ("dir", direction.into())])
            })
            .collect();
        root.insert("sort".to_string(), Value::Array(sort));
    }
    if descriptor.skip > 0 {
        root.insert("skip".to_string(), Value::from(descriptor.skip));
    }
    if let Some(limit) = descriptor.limit {
        root.insert("limit".to_string(), Value::from(limit));
    }
    if !descriptor.only.is_empty() {
        root.insert("only".to_string(), sorted_names(&descriptor.only));
    }
    if !descriptor.without.is_empty() {
        root.insert("without".to_string(), sorted_names(&descriptor.without));
    }

    let bytes = serde_json::to_vec(&canonical_value(&Value::Object(root)))
        .map_err(|e| QueryError::invalid(format!("descriptor cannot be serialized: {}", e)))?;
    Ok(NormalizedDescriptor(bytes))
}

/// Parse and normalize a wire descriptor in one step.
pub fn normalize_value(value: &Value) -> Result<(QueryDescriptor, NormalizedDescriptor)> {
    let descriptor = QueryDescriptor::from_value(value)?;
    let normalized = normalize(&descriptor)?;
    Ok((descriptor, normalized))
}

fn clause_value(clause: &Clause) -> Value {
    match clause {
        Clause::Field { field, predicate } => {
            let mut map = Map::new();
            map.insert("field".to_string(), Value::from(field.as_str()));
            map.insert("op".to_string(), Value::from(predicate.tag()));
            match predicate {
                Predicate::Regex(regex) => {
                    map.insert("pattern".to_string(), Value::from(regex.pattern.as_str()));
                    map.insert("flags".to_string(), Value::from(regex.flags()));
                }
                Predicate::Exists(present) => {
                    map.insert("value".to_string(), Value::Bool(*present));
                }
                Predicate::In(values) | Predicate::Nin(values) => {
                    map.insert("value".to_string(), Value::Array(values.clone()));
                }
                Predicate::Eq(v)
                | Predicate::Ne(v)
                | Predicate::Gt(v)
                | Predicate::Gte(v)
                | Predicate::Lt(v)
                | Predicate::Lte(v)
                | Predicate::Contains(v) => {
                    map.insert("value".to_string(), v.clone());
                }
            }
            Value::Object(map)
        }
        Clause::And(_) => {
            let mut members = Vec::new();
            push_and_members(clause, &mut members);
            let mut members: Vec<(String, Value)> = members
                .iter()
                .map(|m| {
                    let m = canonical_value(m);
                    (m.to_string(), m)
                })
                .collect();
            members.sort_by(|a, b| a.0.cmp(&b.0));
            members.dedup_by(|a, b| a.0 == b.0);
            if members.len() == 1 {
                members.remove(0).1
            } else {
                object([("and", Value::Array(members.into_iter().map(|m| m.1).collect()))])
            }
        }
        Clause::Or(children) => object([(
            "or",
            Value::Array(children.iter().map(clause_value).collect()),
        )]),
        Clause::Not(inner) => object([("not", clause_value(inner))]),
    }
}

/// Collect the members of nested conjunctions into one list.
fn push_and_members(clause: &Clause, out: &mut Vec<Value>) {
    match clause {
        Clause::And(children) => children.iter().for_each(|c| push_and_members(c, out)),
        other => out.push(clause_value(other)),
    }
}

fn object<const N: usize>(entries: [(&str, Value); N]) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
    )
}

fn sorted_names(names: &[String]) -> Value {
    let mut names: Vec<&str> = names.iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    Value::Array(names.into_iter().map(Value::from).collect())
}

/// Rebuild a value with sorted object keys and integral floats as integers.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonical_value(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        Value::Number(n) => Value::Number(canonical_number(n)),
        other => other.clone(),
    }
}

fn canonical_number(n: &Number) -> Number {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}
