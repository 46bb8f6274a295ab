//! Query descriptors: the typed form of a client query.
//!
//! Clients send descriptors as JSON objects:
//!
//! ```json
//! {
//!   "where": { "slug": { "$regex": { "pattern": "^/cats", "flags": "i" } } },
//!   "sort": [{ "title": 1 }],
//!   "skip": 0,
//!   "limit": 10,
//!   "only": ["title"]
//! }
//! ```
//!
//! A plain value under a field is an equality test. Operators are objects
//! whose keys all start with `$`. `$regex` is the only way to ask for a
//! pattern match, so `"^/cats"` and `{"$regex": "^/cats"}` never mean the
//! same thing.
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `$eq`, `$ne` | equal / not equal |
//! | `$in`, `$nin` | member / not member of a list |
//! | `$gt`, `$gte`, `$lt`, `$lte` | ordered comparison (numbers or strings) |
//! | `$contains` | array element or substring |
//! | `$exists` | field presence |
//! | `$regex` | regex search (pattern string or `{pattern, flags}`) |
//! | `$and`, `$or`, `$not` | logical combinators |

use serde_json::{Map, Value};

use crate::error::{QueryError, Result};

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    /// Filter; an empty `And` matches every document.
    pub filter: Clause,
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Fields to keep in returned documents (`slug` is always kept).
    pub only: Vec<String>,
    /// Fields to drop from returned documents.
    pub without: Vec<String>,
}

/// A node of the filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { field: String, predicate: Predicate },
    And(Vec<Clause>),
    Or(Vec<Clause>),
    Not(Box<Clause>),
}

/// A single-field test.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Contains(Value),
    Exists(bool),
    Regex(RegexOperand),
}

impl Predicate {
    /// Operator tag as it appears on the wire and in the normalized form.
    pub fn tag(&self) -> &'static str {
        match self {
            Predicate::Eq(_) => "eq",
            Predicate::Ne(_) => "ne",
            Predicate::In(_) => "in",
            Predicate::Nin(_) => "nin",
            Predicate::Gt(_) => "gt",
            Predicate::Gte(_) => "gte",
            Predicate::Lt(_) => "lt",
            Predicate::Lte(_) => "lte",
            Predicate::Contains(_) => "contains",
            Predicate::Exists(_) => "exists",
            Predicate::Regex(_) => "regex",
        }
    }
}

/// A regex operand: pattern plus canonical flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexOperand {
    pub pattern: String,
    flags: String,
}

/// Flags that change matching, in canonical order.
const MATCH_FLAGS: &str = "imsxU";
/// Flags accepted for compatibility that have no effect on a boolean search.
const IGNORED_FLAGS: &str = "gu";

impl RegexOperand {
    /// Build an operand, validating and canonicalizing `flags`.
    pub fn new(pattern: impl Into<String>, flags: &str) -> Result<Self> {
        let pattern = pattern.into();
        for flag in flags.chars() {
            if !MATCH_FLAGS.contains(flag) && !IGNORED_FLAGS.contains(flag) {
                return Err(QueryError::InvalidPattern {
                    pattern,
                    message: format!("unsupported regex flag '{}'", flag),
                });
            }
        }
        let flags = MATCH_FLAGS.chars().filter(|f| flags.contains(*f)).collect();
        Ok(Self { pattern, flags })
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    pub fn has_flag(&self, flag: char) -> bool {
        self.flags.contains(flag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl Clause {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Clause::Field {
            field: field.into(),
            predicate: Predicate::Eq(value.into()),
        }
    }

    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Clause::Field {
            field: field.into(),
            predicate: Predicate::Regex(RegexOperand {
                pattern: pattern.into(),
                flags: String::new(),
            }),
        }
    }

    /// The clause that matches every document.
    pub fn all() -> Self {
        Clause::And(Vec::new())
    }
}

impl QueryDescriptor {
    /// A descriptor with only a filter.
    pub fn filter(filter: Clause) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            skip: 0,
            limit: None,
            only: Vec::new(),
            without: Vec::new(),
        }
    }

    /// Parse a descriptor from its JSON text.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| QueryError::invalid(format!("descriptor is not valid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    /// Parse a descriptor from its wire representation.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| QueryError::invalid("descriptor must be a JSON object"))?;

        let mut descriptor = Self::filter(Clause::all());
        for (key, value) in obj {
            match key.as_str() {
                "where" => descriptor.filter = parse_where(value)?,
                "sort" => descriptor.sort = parse_sort(value)?,
                "skip" => descriptor.skip = parse_count("skip", value)?,
                "limit" => descriptor.limit = Some(parse_count("limit", value)?),
                "only" => descriptor.only = parse_field_list("only", value)?,
                "without" => descriptor.without = parse_field_list("without", value)?,
                other => {
                    return Err(QueryError::invalid(format!(
                        "unknown descriptor key `{}`",
                        other
                    )))
                }
            }
        }
        Ok(descriptor)
    }
}

fn parse_where(value: &Value) -> Result<Clause> {
    match value {
        Value::Object(map) => parse_where_object(map),
        Value::Array(items) => Ok(Clause::And(
            items.iter().map(parse_where).collect::<Result<_>>()?,
        )),
        _ => Err(QueryError::invalid(
            "`where` must be an object or an array of objects",
        )),
    }
}

fn parse_where_object(map: &Map<String, Value>) -> Result<Clause> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut clauses = Vec::new();
    for key in keys {
        let value = &map[key];
        match key.as_str() {
            "$and" => clauses.push(Clause::And(parse_clause_list(key, value)?)),
            "$or" => clauses.push(Clause::Or(parse_clause_list(key, value)?)),
            "$not" => clauses.push(Clause::Not(Box::new(parse_where(value)?))),
            op if op.starts_with('$') => {
                return Err(QueryError::UnsupportedOperator(op.to_string()))
            }
            field => clauses.extend(parse_field(field, value)?),
        }
    }

    Ok(collapse_and(clauses))
}

fn parse_clause_list(key: &str, value: &Value) -> Result<Vec<Clause>> {
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::invalid(format!("`{}` expects an array", key)))?;
    items.iter().map(parse_where).collect()
}

fn collapse_and(mut clauses: Vec<Clause>) -> Clause {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        Clause::And(clauses)
    }
}

fn is_operator_object(map: &Map<String, Value>) -> Result<bool> {
    let operators = map.keys().filter(|k| k.starts_with('$')).count();
    if operators == 0 {
        Ok(false)
    } else if operators == map.len() {
        Ok(true)
    } else {
        Err(QueryError::invalid(
            "operator objects cannot mix `$` keys with plain keys",
        ))
    }
}

fn parse_field(field: &str, value: &Value) -> Result<Vec<Clause>> {
    let ops = match value {
        Value::Object(map) if is_operator_object(map)? => map,
        literal => {
            return Ok(vec![Clause::Field {
                field: field.to_string(),
                predicate: Predicate::Eq(literal.clone()),
            }])
        }
    };

    let mut keys: Vec<&String> = ops.keys().collect();
    keys.sort();

    let mut clauses = Vec::new();
    for op in keys {
        let operand = &ops[op];
        if op == "$not" {
            let inner = parse_field(field, operand)?;
            clauses.push(Clause::Not(Box::new(collapse_and(inner))));
            continue;
        }
        clauses.push(Clause::Field {
            field: field.to_string(),
            predicate: parse_predicate(op, operand)?,
        });
    }
    Ok(clauses)
}

fn parse_predicate(op: &str, operand: &Value) -> Result<Predicate> {
    Ok(match op {
        "$eq" => Predicate::Eq(operand.clone()),
        "$ne" => Predicate::Ne(operand.clone()),
        "$in" => Predicate::In(expect_array(op, operand)?),
        "$nin" => Predicate::Nin(expect_array(op, operand)?),
        "$gt" => Predicate::Gt(expect_ordered(op, operand)?),
        "$gte" => Predicate::Gte(expect_ordered(op, operand)?),
        "$lt" => Predicate::Lt(expect_ordered(op, operand)?),
        "$lte" => Predicate::Lte(expect_ordered(op, operand)?),
        "$contains" => Predicate::Contains(operand.clone()),
        "$exists" => Predicate::Exists(
            operand
                .as_bool()
                .ok_or_else(|| QueryError::invalid("`$exists` expects a boolean"))?,
        ),
        "$regex" => Predicate::Regex(parse_regex(operand)?),
        other => return Err(QueryError::UnsupportedOperator(other.to_string())),
    })
}

fn expect_array(op: &str, operand: &Value) -> Result<Vec<Value>> {
    operand
        .as_array()
        .cloned()
        .ok_or_else(|| QueryError::invalid(format!("`{}` expects an array", op)))
}

fn expect_ordered(op: &str, operand: &Value) -> Result<Value> {
    match operand {
        Value::Number(_) | Value::String(_) => Ok(operand.clone()),
        _ => Err(QueryError::invalid(format!(
            "`{}` expects a number or a string",
            op
        ))),
    }
}

fn parse_regex(operand: &Value) -> Result<RegexOperand> {
    match operand {
        Value::String(pattern) => RegexOperand::new(pattern.clone(), ""),
        Value::Object(map) => {
            let pattern = map
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or_else(|| QueryError::invalid("`$regex` object needs a string `pattern`"))?;
            let flags = match map.get("flags") {
                None | Some(Value::Null) => "",
                Some(Value::String(flags)) => flags.as_str(),
                Some(_) => return Err(QueryError::invalid("`$regex` flags must be a string")),
            };
            if let Some(extra) = map.keys().find(|k| *k != "pattern" && *k != "flags") {
                return Err(QueryError::invalid(format!(
                    "unexpected key `{}` in `$regex` operand",
                    extra
                )));
            }
            RegexOperand::new(pattern, flags)
        }
        _ => Err(QueryError::invalid(
            "`$regex` expects a pattern string or {pattern, flags}",
        )),
    }
}

fn parse_sort(value: &Value) -> Result<Vec<SortKey>> {
    let entries: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => return Err(QueryError::invalid("`sort` must be an array of objects")),
    };

    let mut keys = Vec::new();
    for entry in entries {
        let map = entry
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| QueryError::invalid("each `sort` entry must be {field: 1 | -1}"))?;
        for (field, direction) in map {
            let direction = match direction {
                Value::Number(n) if n.as_i64() == Some(1) => SortDirection::Asc,
                Value::Number(n) if n.as_i64() == Some(-1) => SortDirection::Desc,
                Value::String(s) if s == "asc" => SortDirection::Asc,
                Value::String(s) if s == "desc" => SortDirection::Desc,
                _ => {
                    return Err(QueryError::invalid(format!(
                        "sort direction for `{}` must be 1 or -1",
                        field
                    )))
                }
            };
            keys.push(SortKey {
                field: field.clone(),
                direction,
            });
        }
    }
    Ok(keys)
}

fn parse_count(key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| QueryError::invalid(format!("`{}` must be a non-negative integer", key)))
}

fn parse_field_list(key: &str, value: &Value) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::invalid(format!("`{}` must be an array of field names", key)))?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                QueryError::invalid(format!("`{}` must be an array of field names", key))
            })
        })
        .collect()
}
