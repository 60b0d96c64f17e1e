//! `modb` — an embedded, single-process document database.
//!
//! Named collections of schema-validated records are kept in memory in
//! a B-tree-backed primary store, indexed by zero or more secondary
//! indexes, and optionally persisted to one binary file on disk. A
//! [`Storage`] manager owns the schema registry, instantiates
//! collections lazily, debounces writes behind an auto-commit timer,
//! and resolves declared relations between collections into joins.
//!
//! ```text
//! caller -> Storage -> Collection (B-tree + indexes) <-> codec <-> Container (file)
//! ```
//!
//! What this crate is not: a multi-process database, a WAL-backed
//! durable store, a query-language engine, or a networked service. See
//! the crate's design notes for the full list of non-goals.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod btree;
mod codec;
mod collection;
mod container;
mod error;
mod id;
mod index;
mod relation;
mod schema;
mod storage;
mod value;

pub use collection::{CollectionHandle, CollectionStats, IndexStats, View};
pub use error::{Error, ErrorKind, Result};
pub use relation::{DeletePlan, IntegrityReport, JoinRow, Orphan};
pub use schema::{Cardinality, DeletePolicy, FieldDefinition, IndexDefinition, RelationDefinition, Schema};
pub use storage::{CollectionHealth, HealthReport, OpenOptions, RelationMetadata, Storage};
pub use value::{Kind, Value};
