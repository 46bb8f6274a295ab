//! # Content Query Core
//!
//! Runtime-agnostic engine behind Content Query: the document store, query
//! descriptors and their canonical hashing, predicate evaluation, the
//! single-flight result cache, and navigation tree construction.
//!
//! This crate contains no tokio, HTTP, or filesystem I/O. The application
//! crate loads documents, owns configuration, and exposes the engine over
//! the CLI and HTTP.
//!
//! ```text
//! descriptor ─▶ normalize ─▶ hash ─▶ QueryEngine ─▶ cache hit?
//!                                        │              │ no
//!                                        │              ▼
//!                                        │     compile + scan store
//!                                        ▼
//!                               flat results ─▶ navigation tree
//! ```

pub mod cache;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod hash;
pub mod models;
pub mod navigation;
pub mod normalize;
pub mod predicate;
pub mod store;

pub use descriptor::{Clause, Predicate, QueryDescriptor};
pub use error::QueryError;
pub use executor::{EngineStats, Identity, QueryEngine, Resolution};
pub use hash::QueryHash;
pub use models::{Document, NavigationNode};
pub use navigation::NavigationOptions;
pub use store::DocumentStore;
