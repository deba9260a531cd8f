//! Dirstore is a small embedded entity store.
//!
//! Every entity is persisted as one JSON file, `<key>.json`, directly inside a
//! backing directory. Stores are layered: a [`engine::DirectoryStore`] owns the
//! files, and decorators wrap it to add behaviour while keeping the same contract.
//!
//! ## Core Components
//! - [`engine::DirectoryStore`]: the base store, with an in-memory key → file index.
//! - [`engine::CachingStore`]: keeps every entity in memory so reads never touch disk.
//! - [`engine::IndexedStore`]: maintains secondary indexes and routes predicate lookups through them.
//! - [`engine::Predicate`]: equality / conjunction predicates that indexes can recognize.
//!
//! ## Example
//!
//! ```no_run
//! use dirstore::engine::{CachingStore, DirectoryStore, GenericIndex, IndexedStore, KeyAccessor, Predicate};
//! use dirstore::{EntityReader, EntityWriter};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     key: Option<String>,
//!     name: String,
//! }
//!
//! fn main() -> dirstore::Result<()> {
//!     let keys = KeyAccessor::new(|u: &User| u.key.clone(), |u: &mut User, k| u.key = Some(k));
//!     let by_name = GenericIndex::unique("name", |u: &User| u.name.clone().into());
//!
//!     let base = DirectoryStore::builder("./users", keys).open()?;
//!     let store = IndexedStore::new(CachingStore::new(base)?, vec![by_name.clone()])?;
//!
//!     store.insert(User { key: None, name: "alice".into() })?;
//!     let alice = store.get_matching(&Predicate::equals(by_name.key_fn(), "alice"))?;
//!     assert_eq!(alice.name, "alice");
//!     Ok(())
//! }
//! ```

pub mod engine;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::engine::{IndexationHandler, KeyAccessor, Predicate};

/// Errors returned by every store layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A key or predicate matched no live entity.
    #[error("no {entity_type} exists for {target}")]
    NotFound { entity_type: String, target: String },
    /// An insert supplied a key that is already indexed.
    #[error("a {entity_type} already exists with key {key}")]
    AlreadyExists { entity_type: String, key: String },
    /// A predicate expected to match at most one entity matched several.
    #[error("the predicate {predicate} of {entity_type} is not unique")]
    NotUnique { entity_type: String, predicate: String },
    /// The entity handed to an operation is not in a state the operation accepts.
    #[error("data integrity violation for {entity_type} with key {}: {reason}", .key.as_deref().unwrap_or("<none>"))]
    IntegrityViolation {
        entity_type: String,
        key: Option<String>,
        reason: String,
    },
    /// Reading or deserializing from disk failed.
    #[error("unable to read {entity_type} from {}", .path.display())]
    ReadFailure {
        entity_type: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Serializing or writing to disk failed.
    #[error("unable to write {entity_type} with key {key} into {}", .path.display())]
    WriteFailure {
        entity_type: String,
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A specialized Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A lazily evaluated sequence of entities. Items fail individually with [`Error::ReadFailure`].
pub type EntityStream<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Read operations shared by every store layer.
pub trait EntityReader<T>: Send + Sync {
    /// Name of the stored entity type, used in error messages.
    fn entity_type(&self) -> &str;
    /// The primary key accessors this store was built with.
    fn key_accessor(&self) -> &KeyAccessor<T>;
    /// True iff an entity is indexed under `key`.
    fn exists(&self, key: &str) -> bool;
    /// Retrieves the entity stored under `key`.
    fn get(&self, key: &str) -> Result<T>;
    /// Retrieves the single entity matching `predicate`.
    ///
    /// Fails with [`Error::NotFound`] on zero matches and [`Error::NotUnique`] on more than one.
    fn get_matching(&self, predicate: &Predicate<T>) -> Result<T>;
    /// Streams every live entity. Each call reflects the current index.
    fn stream_all(&self) -> EntityStream<'_, T>;
    /// Streams every live entity matching `predicate`.
    fn stream_matching(&self, predicate: &Predicate<T>) -> EntityStream<'_, T>;
}

/// Mutating operations shared by every store layer.
pub trait EntityWriter<T>: Send + Sync {
    /// Persists a new entity, assigning a generated key when it carries none.
    fn insert(&self, entity: T) -> Result<T>;
    /// Overwrites an existing entity identified by its primary key.
    fn update(&self, entity: T) -> Result<T>;
    /// Removes the entity stored under `key` and returns it.
    fn delete(&self, key: &str) -> Result<T>;
}

/// Rebuilding derived state from the backing directory.
pub trait Reindex<T>: Send + Sync {
    /// Rescans the backing directory and notifies every registered handler.
    fn reindex(&self) -> Result<()>;
    /// Registers a handler invoked on every subsequent reindex.
    fn register_handler(&self, handler: Arc<dyn IndexationHandler<T>>);
}

/// The complete store contract. Implemented for anything that reads, writes and reindexes.
pub trait EntityStore<T>: EntityReader<T> + EntityWriter<T> + Reindex<T> {}

impl<T, S> EntityStore<T> for S where S: EntityReader<T> + EntityWriter<T> + Reindex<T> {}
