//! Error taxonomy for query resolution.
//!
//! Every failure the engine can report is a [`QueryError`]. The type is
//! `Clone` because a single computed failure is handed to every caller
//! waiting on the same in-flight query.

use thiserror::Error;

use crate::hash::QueryHash;

/// Errors produced while parsing, compiling, or resolving a query.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// The descriptor is not a well-formed query object.
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    /// A `$regex` operand failed to compile.
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },

    /// An operator key the evaluator does not know.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// A hash was supplied without a descriptor and has never been seen.
    #[error("unknown query: {0}")]
    UnknownQuery(QueryHash),

    /// An operator was applied to a field of the wrong type.
    ///
    /// Evaluation treats this as a non-match and only logs it; the variant
    /// exists so the condition has a name in diagnostics.
    #[error("type mismatch on field `{field}`: expected {expected}")]
    TypeMismatch { field: String, expected: &'static str },
}

impl QueryError {
    /// Machine-readable error code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidDescriptor(_) => "invalid_descriptor",
            QueryError::InvalidPattern { .. } => "invalid_pattern",
            QueryError::UnsupportedOperator(_) => "unsupported_operator",
            QueryError::UnknownQuery(_) => "unknown_query",
            QueryError::TypeMismatch { .. } => "type_mismatch",
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidDescriptor(message.into())
    }
}

pub type Result<T, E = QueryError> = std::result::Result<T, E>;
