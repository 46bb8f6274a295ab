//! Predicate evaluation.
//!
//! A [`QueryDescriptor`]'s filter is compiled once per query execution into a
//! [`CompiledFilter`]: regex operands are built here, so an invalid pattern
//! fails the whole query up front and no pattern is compiled per document.
//!
//! Regex matching uses search semantics: the pattern may match anywhere in
//! the field value unless it anchors itself with `^` or `$`.
//!
//! Type mismatches (a regex against a number, `$contains` against a
//! boolean, ...) are non-matches. They are counted in [`EvalStats`] so the
//! executor can log them, but they never fail a query; corpora are
//! heterogeneous and one oddly typed field should not hide the rest.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::descriptor::{Clause, Predicate, QueryDescriptor, RegexOperand};
use crate::error::{QueryError, Result};
use crate::models::Document;

/// Counters collected while evaluating a filter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvalStats {
    pub evaluated: usize,
    pub type_mismatches: usize,
}

/// A filter ready to run against documents.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    Field { field: String, test: Test },
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
}

#[derive(Debug, Clone)]
enum Test {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Compare(Comparison, Value),
    Contains(Value),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompiledFilter {
    pub fn compile(descriptor: &QueryDescriptor) -> Result<Self> {
        Self::compile_clause(&descriptor.filter)
    }

    pub fn compile_clause(clause: &Clause) -> Result<Self> {
        Ok(Self {
            root: compile_node(clause)?,
        })
    }

    /// Test one document.
    pub fn matches(&self, doc: &Document, stats: &mut EvalStats) -> bool {
        stats.evaluated += 1;
        eval_node(&self.root, doc, stats)
    }
}

/// Compile and evaluate a single clause against a single document.
pub fn evaluate(clause: &Clause, doc: &Document) -> Result<bool> {
    let filter = CompiledFilter::compile_clause(clause)?;
    Ok(filter.matches(doc, &mut EvalStats::default()))
}

fn compile_node(clause: &Clause) -> Result<Node> {
    Ok(match clause {
        Clause::Field { field, predicate } => Node::Field {
            field: field.clone(),
            test: compile_test(predicate)?,
        },
        Clause::And(children) => Node::And(children.iter().map(compile_node).collect::<Result<_>>()?),
        Clause::Or(children) => Node::Or(children.iter().map(compile_node).collect::<Result<_>>()?),
        Clause::Not(inner) => Node::Not(Box::new(compile_node(inner)?)),
    })
}

fn compile_test(predicate: &Predicate) -> Result<Test> {
    Ok(match predicate {
        Predicate::Eq(v) => Test::Eq(v.clone()),
        Predicate::Ne(v) => Test::Ne(v.clone()),
        Predicate::In(vs) => Test::In(vs.clone()),
        Predicate::Nin(vs) => Test::Nin(vs.clone()),
        Predicate::Gt(v) => Test::Compare(Comparison::Gt, v.clone()),
        Predicate::Gte(v) => Test::Compare(Comparison::Gte, v.clone()),
        Predicate::Lt(v) => Test::Compare(Comparison::Lt, v.clone()),
        Predicate::Lte(v) => Test::Compare(Comparison::Lte, v.clone()),
        Predicate::Contains(v) => Test::Contains(v.clone()),
        Predicate::Exists(present) => Test::Exists(*present),
        Predicate::Regex(operand) => Test::Regex(compile_regex(operand)?),
    })
}

fn compile_regex(operand: &RegexOperand) -> Result<Regex> {
    RegexBuilder::new(&operand.pattern)
        .case_insensitive(operand.has_flag('i'))
        .multi_line(operand.has_flag('m'))
        .dot_matches_new_line(operand.has_flag('s'))
        .ignore_whitespace(operand.has_flag('x'))
        .swap_greed(operand.has_flag('U'))
        .build()
        .map_err(|e| QueryError::InvalidPattern {
            pattern: operand.pattern.clone(),
            message: e.to_string(),
        })
}

fn eval_node(node: &Node, doc: &Document, stats: &mut EvalStats) -> bool {
    match node {
        Node::Field { field, test } => eval_test(field, test, doc.get(field), stats),
        Node::And(children) => children.iter().all(|c| eval_node(c, doc, stats)),
        Node::Or(children) => children.iter().any(|c| eval_node(c, doc, stats)),
        Node::Not(inner) => !eval_node(inner, doc, stats),
    }
}

fn eval_test(field: &str, test: &Test, value: Option<&Value>, stats: &mut EvalStats) -> bool {
    let actual = value.unwrap_or(&Value::Null);
    match test {
        Test::Eq(expected) => values_equal(actual, expected),
        Test::Ne(expected) => !values_equal(actual, expected),
        Test::In(options) => options.iter().any(|o| values_equal(actual, o)),
        Test::Nin(options) => !options.iter().any(|o| values_equal(actual, o)),
        Test::Exists(present) => value.is_some() == *present,
        Test::Compare(op, bound) => {
            let Some(value) = value else { return false };
            let ordering = match (value, bound) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => {
                    mismatch(stats, field, "a value comparable with the bound");
                    None
                }
            };
            match (ordering, op) {
                (Some(o), Comparison::Gt) => o == Ordering::Greater,
                (Some(o), Comparison::Gte) => o != Ordering::Less,
                (Some(o), Comparison::Lt) => o == Ordering::Less,
                (Some(o), Comparison::Lte) => o != Ordering::Greater,
                (None, _) => false,
            }
        }
        Test::Contains(needle) => match (value, needle) {
            (Some(Value::Array(items)), _) => items.iter().any(|i| values_equal(i, needle)),
            (Some(Value::String(haystack)), Value::String(needle)) => {
                haystack.contains(needle.as_str())
            }
            (None, _) => false,
            (Some(_), _) => {
                mismatch(stats, field, "an array or a string");
                false
            }
        },
        Test::Regex(regex) => match value {
            Some(Value::String(text)) => regex.is_match(text),
            None => false,
            Some(_) => {
                mismatch(stats, field, "a string");
                false
            }
        },
    }
}

fn mismatch(stats: &mut EvalStats, field: &str, expected: &'static str) {
    stats.type_mismatches += 1;
    tracing::trace!(
        "{}",
        QueryError::TypeMismatch {
            field: field.to_string(),
            expected,
        }
    );
}

/// Structural equality where numbers compare by value (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Total order used for sorting: missing < null < bool < number < string
/// < array < object.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(xs)), Some(Value::Array(ys))) => xs
            .iter()
            .zip(ys)
            .map(|(x, y)| compare_values(Some(x), Some(y)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| xs.len().cmp(&ys.len())),
        (Some(x), Some(y)) if x.is_object() && y.is_object() => {
            x.to_string().cmp(&y.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
