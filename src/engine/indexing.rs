use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::{expect_single, lock, read_lock, write_lock};
use crate::engine::{IndexKey, IndexKeyFn, IndexationHandler, IndexedEntity, KeyAccessor, Predicate};
use crate::{EntityReader, EntityStore, EntityStream, EntityWriter, Error, Reindex, Result};

/// A secondary index over a derived key.
///
/// A unique index maps each derived key to at most one entity; a range index
/// maps it to every entity sharing it.
pub struct GenericIndex<T> {
    alias: String,
    key_fn: IndexKeyFn<T>,
    unique: bool,
}

impl<T> GenericIndex<T> {
    /// Declares an index over an existing key function, so predicates built
    /// from `key_fn` elsewhere are recognised by this index.
    pub fn new(alias: &str, key_fn: IndexKeyFn<T>, unique: bool) -> Self {
        Self {
            alias: alias.to_string(),
            key_fn,
            unique,
        }
    }

    /// A unique index over `derive`.
    ///
    /// Entities deriving [`IndexKey::Null`] are exempt from uniqueness, so an
    /// optional projection can be indexed while many entities leave it unset.
    pub fn unique<F>(alias: &str, derive: F) -> Self
    where
        F: Fn(&T) -> IndexKey + Send + Sync + 'static,
    {
        Self::new(alias, IndexKeyFn::new(alias, derive), true)
    }

    /// A non-unique index over `derive`.
    pub fn range<F>(alias: &str, derive: F) -> Self
    where
        F: Fn(&T) -> IndexKey + Send + Sync + 'static,
    {
        Self::new(alias, IndexKeyFn::new(alias, derive), false)
    }

    /// Name used in logs and error messages.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The key function predicates must use to be answered by this index.
    pub fn key_fn(&self) -> &IndexKeyFn<T> {
        &self.key_fn
    }

    /// True for an index built with [`unique`](Self::unique).
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// True when this index can narrow down the candidates of `predicate`.
    pub fn supports(&self, predicate: &Predicate<T>) -> bool {
        predicate.target_for(&self.key_fn).is_some()
    }

    /// Shorthand for [`Predicate::equals`] on this index's key function.
    pub fn equals(&self, target: impl Into<IndexKey>) -> Predicate<T> {
        Predicate::equals(&self.key_fn, target)
    }
}

impl<T> Clone for GenericIndex<T> {
    fn clone(&self) -> Self {
        Self {
            alias: self.alias.clone(),
            key_fn: self.key_fn.clone(),
            unique: self.unique,
        }
    }
}

impl<T> fmt::Debug for GenericIndex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericIndex")
            .field("alias", &self.alias)
            .field("unique", &self.unique)
            .finish()
    }
}

/// Derived key → every live entity deriving to it.
///
/// Unique indexes hold one entity per bucket, except when a rebuild finds
/// several files sharing a derived key; those are all kept so that deleting
/// one leaves the others reachable.
type Buckets<T> = HashMap<IndexKey, Vec<T>>;

/// Index maps shared between the store and the handler it registers on the wrapped store.
struct IndexState<T> {
    indexes: Vec<GenericIndex<T>>,
    keys: KeyAccessor<T>,
    maps: RwLock<Vec<Buckets<T>>>,
    staged: Mutex<Option<Vec<Buckets<T>>>>,
}

impl<T: Clone> IndexState<T> {
    fn empty_maps(&self) -> Vec<Buckets<T>> {
        self.indexes.iter().map(|_| HashMap::new()).collect()
    }

    fn holds(&self, entity: &T, key: &str) -> bool {
        self.keys.key_of(entity).as_deref() == Some(key)
    }

    fn add(&self, maps: &mut [Buckets<T>], key: &str, entity: &T) {
        for (index, map) in self.indexes.iter().zip(maps.iter_mut()) {
            let derived = index.key_fn().derive(entity);
            let bucket = map.entry(derived.clone()).or_default();
            bucket.retain(|held| !self.holds(held, key));
            if index.is_unique() && derived != IndexKey::Null && !bucket.is_empty() {
                warn!(
                    "Unique index {} maps {} to more than one entity, including {}",
                    index.alias(),
                    derived,
                    key
                );
            }
            bucket.push(entity.clone());
        }
    }

    /// Removes the entity stored under `key` from the buckets `entity` derives to.
    fn remove(&self, maps: &mut [Buckets<T>], key: &str, entity: &T) {
        for (index, map) in self.indexes.iter().zip(maps.iter_mut()) {
            let derived = index.key_fn().derive(entity);
            if let Some(bucket) = map.get_mut(&derived) {
                bucket.retain(|held| !self.holds(held, key));
                if bucket.is_empty() {
                    map.remove(&derived);
                }
            }
        }
    }

    /// Fails when a unique index already maps `entity`'s derived key to an entity other than `key`.
    /// A `Null` derived key never conflicts.
    fn check_unique(&self, entity_type: &str, key: Option<&str>, entity: &T) -> Result<()> {
        let maps = read_lock(&self.maps);
        for (index, map) in self.indexes.iter().zip(maps.iter()) {
            if !index.is_unique() {
                continue;
            }
            let derived = index.key_fn().derive(entity);
            if derived == IndexKey::Null {
                continue;
            }
            let bucket = map.get(&derived).map(Vec::as_slice).unwrap_or_default();
            let clash = bucket
                .iter()
                .map(|held| self.keys.key_of(held))
                .find(|held_key| key.is_none() || held_key.as_deref() != key);
            if let Some(held_key) = clash {
                return Err(Error::IntegrityViolation {
                    entity_type: entity_type.to_string(),
                    key: key.map(str::to_string),
                    reason: format!(
                        "unique index {} already maps {} to key {}",
                        index.alias(),
                        derived,
                        held_key.as_deref().unwrap_or("<none>")
                    ),
                });
            }
        }
        Ok(())
    }
}

impl<T> IndexationHandler<T> for IndexState<T>
where
    T: Clone + Send + Sync,
{
    fn start(&self) {
        *lock(&self.staged) = Some(self.empty_maps());
    }

    fn accept(&self, entry: &IndexedEntity<'_, T>) -> Result<()> {
        let entity = entry.entity()?;
        if let Some(staged) = lock(&self.staged).as_mut() {
            self.add(staged, entry.key(), &entity);
        }
        Ok(())
    }

    fn end(&self) {
        if let Some(maps) = lock(&self.staged).take() {
            info!("Rebuilt {} secondary index(es)", maps.len());
            *write_lock(&self.maps) = maps;
        }
    }
}

/// Maintains secondary indexes over a wrapped store and answers predicate
/// lookups from them when it can.
///
/// A predicate is answered from the first declared index that supports it: an
/// equality on that index's key function, or a conjunction containing one. The
/// indexed candidates are still filtered by the whole predicate, so results are
/// identical to a full scan. Predicates no index supports are handed to the
/// wrapped store unchanged.
pub struct IndexedStore<T, S> {
    inner: S,
    state: Arc<IndexState<T>>,
    mutation: Mutex<()>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, S> IndexedStore<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: EntityStore<T>,
{
    /// Builds every index from a full scan of `inner` and subscribes to its reindexes.
    pub fn new(inner: S, indexes: Vec<GenericIndex<T>>) -> Result<Self> {
        let state = Arc::new(IndexState {
            indexes,
            keys: inner.key_accessor().clone(),
            maps: RwLock::new(Vec::new()),
            staged: Mutex::new(None),
        });

        let mut maps = state.empty_maps();
        let mut count = 0;
        for entity in inner.stream_all() {
            let entity = entity?;
            match state.keys.key_of(&entity) {
                Some(key) => {
                    state.add(&mut maps, &key, &entity);
                    count += 1;
                }
                None => warn!("Not indexing a keyless {} read from the wrapped store", inner.entity_type()),
            }
        }
        info!(
            "Built {} index(es) over {} {} entities",
            state.indexes.len(),
            count,
            inner.entity_type()
        );
        *write_lock(&state.maps) = maps;

        inner.register_handler(state.clone());
        Ok(Self {
            inner,
            state,
            mutation: Mutex::new(()),
            _entity: PhantomData,
        })
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Indexes in declaration order, which is also routing order.
    pub fn indexes(&self) -> &[GenericIndex<T>] {
        &self.state.indexes
    }

    /// Candidates from the first index supporting `predicate`, filtered by the whole predicate.
    /// `None` when no index supports it.
    fn lookup(&self, predicate: &Predicate<T>) -> Option<Vec<T>> {
        let maps = read_lock(&self.state.maps);
        self.state
            .indexes
            .iter()
            .zip(maps.iter())
            .find_map(|(index, map)| {
                let target = predicate.target_for(index.key_fn())?;
                debug!("Answering {} from index {}", predicate, index.alias());
                let bucket = map.get(target).map(Vec::as_slice).unwrap_or_default();
                Some(bucket.iter().filter(|entity| predicate.test(entity)).cloned().collect())
            })
    }

    fn written_key(&self, entity: &T) -> Result<String> {
        self.state.keys.key_of(entity).ok_or_else(|| Error::IntegrityViolation {
            entity_type: self.inner.entity_type().to_string(),
            key: None,
            reason: "wrapped store returned an entity without a key".to_string(),
        })
    }
}

impl<T, S> EntityReader<T> for IndexedStore<T, S>
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
        self.inner.exists(key)
    }

    fn get(&self, key: &str) -> Result<T> {
        self.inner.get(key)
    }

    fn get_matching(&self, predicate: &Predicate<T>) -> Result<T> {
        match self.lookup(predicate) {
            Some(found) => expect_single(found.into_iter().map(Ok), self.entity_type(), predicate),
            None => self.inner.get_matching(predicate),
        }
    }

    fn stream_all(&self) -> EntityStream<'_, T> {
        self.inner.stream_all()
    }

    fn stream_matching(&self, predicate: &Predicate<T>) -> EntityStream<'_, T> {
        match self.lookup(predicate) {
            Some(found) => Box::new(found.into_iter().map(Ok)),
            None => self.inner.stream_matching(predicate),
        }
    }
}

impl<T, S> EntityWriter<T> for IndexedStore<T, S>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    S: EntityStore<T>,
{
    fn insert(&self, entity: T) -> Result<T> {
        let _guard = lock(&self.mutation);
        let key = self.state.keys.key_of(&entity);
        // A taken primary key is reported by the wrapped store as AlreadyExists.
        if !key.as_deref().is_some_and(|k| self.inner.exists(k)) {
            self.state.check_unique(self.entity_type(), key.as_deref(), &entity)?;
        }

        let inserted = self.inner.insert(entity)?;
        let key = self.written_key(&inserted)?;
        self.state.add(&mut write_lock(&self.state.maps), &key, &inserted);
        Ok(inserted)
    }

    fn update(&self, entity: T) -> Result<T> {
        let _guard = lock(&self.mutation);
        let Some(key) = self.state.keys.key_of(&entity) else {
            return self.inner.update(entity);
        };
        // The previous value locates the buckets to leave, since the update may change derived keys.
        let existing = self.inner.get(&key)?;
        self.state.check_unique(self.entity_type(), Some(&key), &entity)?;

        let updated = self.inner.update(entity)?;
        let mut maps = write_lock(&self.state.maps);
        self.state.remove(&mut maps, &key, &existing);
        self.state.add(&mut maps, &key, &updated);
        Ok(updated)
    }

    fn delete(&self, key: &str) -> Result<T> {
        let _guard = lock(&self.mutation);
        let deleted = self.inner.delete(key)?;
        self.state.remove(&mut write_lock(&self.state.maps), key, &deleted);
        Ok(deleted)
    }
}

impl<T, S> Reindex<T> for IndexedStore<T, S>
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
