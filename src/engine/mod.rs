pub mod caching;
pub mod directory;
pub mod indexing;
pub mod keys;
pub mod predicate;

pub use caching::CachingStore;
pub use directory::{DirectoryStore, DirectoryStoreBuilder, IndexationHandler, IndexedEntity, DATA_FILE_SUFFIX};
pub use indexing::{GenericIndex, IndexedStore};
pub use keys::{KeyAccessor, KeyGenerator, RandomKeyGenerator};
pub use predicate::{IndexKey, IndexKeyFn, Predicate};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Error, Result};

// Guarded maps are only replaced wholesale or changed by single insert/remove
// calls, so a panic elsewhere cannot leave them half-updated.
pub(crate) fn read_lock<V>(lock: &RwLock<V>) -> RwLockReadGuard<'_, V> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<V>(lock: &RwLock<V>) -> RwLockWriteGuard<'_, V> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reduces a stream to its only element.
pub(crate) fn expect_single<T>(
    mut matches: impl Iterator<Item = Result<T>>,
    entity_type: &str,
    predicate: &Predicate<T>,
) -> Result<T> {
    let first = matches.next().transpose()?.ok_or_else(|| Error::NotFound {
        entity_type: entity_type.to_string(),
        target: format!("predicate {}", predicate),
    })?;
    if matches.next().transpose()?.is_some() {
        return Err(Error::NotUnique {
            entity_type: entity_type.to_string(),
            predicate: predicate.to_string(),
        });
    }
    Ok(first)
}
