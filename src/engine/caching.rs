use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::{expect_single, lock, read_lock, write_lock};
use crate::engine::{DirectoryStore, IndexationHandler, IndexedEntity, KeyAccessor, Predicate};
use crate::{EntityReader, EntityStore, EntityStream, EntityWriter, Error, Reindex, Result};

/// Keeps a deserialized copy of every entity of the wrapped store in memory.
///
/// Reads are served from memory only. Writes go to the wrapped store first and
/// touch the cache only once they succeeded. The cache is reloaded whenever
/// the wrapped store reindexes.
pub struct CachingStore<T, S = DirectoryStore<T>> {
    inner: S,
    cache: Arc<Cache<T>>,
    mutation: Mutex<()>,
    _entity: PhantomData<fn() -> T>,
}

struct Cache<T> {
    entries: RwLock<HashMap<String, T>>,
    staged: Mutex<Option<HashMap<String, T>>>,
}

impl<T> IndexationHandler<T> for Cache<T>
where
    T: Clone + Send + Sync,
{
    fn start(&self) {
        *lock(&self.staged) = Some(HashMap::new());
    }

    fn accept(&self, entry: &IndexedEntity<'_, T>) -> Result<()> {
        let entity = entry.entity()?;
        if let Some(staged) = lock(&self.staged).as_mut() {
            staged.insert(entry.key().to_string(), entity);
        }
        Ok(())
    }

    fn end(&self) {
        if let Some(entries) = lock(&self.staged).take() {
            info!("Reloaded cache with {} entities", entries.len());
            *write_lock(&self.entries) = entries;
        }
    }
}

impl<T, S> CachingStore<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: EntityStore<T>,
{
    /// Loads every entity of `inner` and subscribes to its reindexes.
    pub fn new(inner: S) -> Result<Self> {
        let keys = inner.key_accessor().clone();
        let mut entries = HashMap::new();
        for entity in inner.stream_all() {
            let entity = entity?;
            match keys.key_of(&entity) {
                Some(key) => {
                    entries.insert(key, entity);
                }
                None => warn!("Not caching a keyless {} read from the wrapped store", inner.entity_type()),
            }
        }
        info!("Cached {} {} entities", entries.len(), inner.entity_type());

        let cache = Arc::new(Cache {
            entries: RwLock::new(entries),
            staged: Mutex::new(None),
        });
        inner.register_handler(cache.clone());
        Ok(Self {
            inner,
            cache,
            mutation: Mutex::new(()),
            _entity: PhantomData,
        })
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        read_lock(&self.cache.entries).len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn written_key(&self, entity: &T) -> Result<String> {
        self.inner
            .key_accessor()
            .key_of(entity)
            .ok_or_else(|| Error::IntegrityViolation {
                entity_type: self.inner.entity_type().to_string(),
                key: None,
                reason: "wrapped store returned an entity without a key".to_string(),
            })
    }

    fn snapshot(&self) -> Vec<T> {
        read_lock(&self.cache.entries).values().cloned().collect()
    }
}

impl<T, S> EntityReader<T> for CachingStore<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: EntityStore<T>,
{
    fn entity_type(&self) -> &str {
        self.inner.entity_type()
    }

    fn key_accessor(&self) -> &KeyAccessor<T> {
        self.inner.key_accessor()
    }

    fn exists(&self, key: &str) -> bool {
        read_lock(&self.cache.entries).contains_key(key)
    }

    fn get(&self, key: &str) -> Result<T> {
        read_lock(&self.cache.entries)
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                entity_type: self.entity_type().to_string(),
                target: format!("key {}", key),
            })
    }

    fn get_matching(&self, predicate: &Predicate<T>) -> Result<T> {
        expect_single(self.stream_matching(predicate), self.entity_type(), predicate)
    }

    fn stream_all(&self) -> EntityStream<'_, T> {
        Box::new(self.snapshot().into_iter().map(Ok))
    }

    fn stream_matching(&self, predicate: &Predicate<T>) -> EntityStream<'_, T> {
        let predicate = predicate.clone();
        Box::new(
            self.snapshot()
                .into_iter()
                .filter(move |entity| predicate.test(entity))
                .map(Ok),
        )
    }
}

impl<T, S> EntityWriter<T> for CachingStore<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: EntityStore<T>,
{
    fn insert(&self, entity: T) -> Result<T> {
        let _guard = lock(&self.mutation);
        let inserted = self.inner.insert(entity)?;
        let key = self.written_key(&inserted)?;
        debug!("Caching inserted {} {}", self.entity_type(), key);
        write_lock(&self.cache.entries).insert(key, inserted.clone());
        Ok(inserted)
    }

    fn update(&self, entity: T) -> Result<T> {
        let _guard = lock(&self.mutation);
        let updated = self.inner.update(entity)?;
        let key = self.written_key(&updated)?;
        write_lock(&self.cache.entries).insert(key, updated.clone());
        Ok(updated)
    }

    fn delete(&self, key: &str) -> Result<T> {
        let _guard = lock(&self.mutation);
        let deleted = self.inner.delete(key)?;
        write_lock(&self.cache.entries).remove(key);
        Ok(deleted)
    }
}

impl<T, S> Reindex<T> for CachingStore<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: EntityStore<T>,
{
    fn reindex(&self) -> Result<()> {
        let _guard = lock(&self.mutation);
        self.inner.reindex()
    }

    fn register_handler(&self, handler: Arc<dyn IndexationHandler<T>>) {
        self.inner.register_handler(handler);
    }
}
