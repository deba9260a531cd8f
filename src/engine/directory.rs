use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::keys::{invalid_key_reason, KeyAccessor, KeyGenerator, RandomKeyGenerator};
use crate::engine::{expect_single, lock, read_lock, write_lock, Predicate};
use crate::{EntityReader, EntityStream, EntityWriter, Error, Reindex, Result};

/// Suffix of every data file. The file name minus this suffix is the entity key.
pub const DATA_FILE_SUFFIX: &str = ".json";

const DATA_FILE_EXTENSION: &str = "json";
const TEMP_FILE_EXTENSION: &str = "json.tmp";

/// Generated keys that collide with an indexed one are redrawn this many times.
const MAX_KEY_ATTEMPTS: usize = 16;

/// Receives every entity discovered while a store rebuilds its location index.
///
/// `start` is called before the directory is scanned, `accept` once per data
/// file, and `end` once the new index is in place. When `accept` fails the
/// rebuild is abandoned and `end` is never called, so implementations should
/// stage their state and only publish it in `end`.
pub trait IndexationHandler<T>: Send + Sync {
    /// A rebuild is starting.
    fn start(&self);
    /// One data file was found. An error aborts the rebuild.
    fn accept(&self, entry: &IndexedEntity<'_, T>) -> Result<()>;
    /// The rebuild completed and the new location index is in place.
    fn end(&self);
}

/// An entity found during a scan. It is only loaded when asked for, and at
/// most once however many handlers ask.
pub struct IndexedEntity<'a, T> {
    key: &'a str,
    load: Box<dyn Fn() -> Result<T> + 'a>,
    resolved: OnceCell<T>,
}

impl<'a, T: Clone> IndexedEntity<'a, T> {
    /// Wraps an entity that `load` reads on first access.
    pub fn lazy(key: &'a str, load: impl Fn() -> Result<T> + 'a) -> Self {
        Self {
            key,
            load: Box::new(load),
            resolved: OnceCell::new(),
        }
    }

    /// Wraps an entity that is already in memory.
    pub fn resolved(key: &'a str, entity: T) -> Self {
        let entry = Self::lazy(key, || unreachable!("entity is already resolved"));
        let _ = entry.resolved.set(entity);
        entry
    }

    /// Key of the data file, taken from its name.
    pub fn key(&self) -> &str {
        self.key
    }

    /// The entity, loaded and memoised on first call. Load failures are returned every time.
    pub fn entity(&self) -> Result<T> {
        if let Some(entity) = self.resolved.get() {
            return Ok(entity.clone());
        }
        let entity = (self.load)()?;
        let _ = self.resolved.set(entity.clone());
        Ok(entity)
    }
}

/// Persists one entity per `<key>.json` file directly inside a directory.
///
/// A key → file index is built when the store is opened and on [`reindex`](Reindex::reindex);
/// every operation goes through that index rather than the file system.
/// Mutations and reindexes are serialised, so a rebuild never overwrites a
/// concurrent insert or delete.
pub struct DirectoryStore<T> {
    dir: PathBuf,
    entity_type: String,
    keys: KeyAccessor<T>,
    key_generator: Box<dyn KeyGenerator>,
    index: RwLock<HashMap<String, PathBuf>>,
    handlers: RwLock<Vec<Arc<dyn IndexationHandler<T>>>>,
    mutation: Mutex<()>,
    _entity: PhantomData<fn() -> T>,
}

/// Construction-time options for a [`DirectoryStore`].
pub struct DirectoryStoreBuilder<T> {
    dir: PathBuf,
    keys: KeyAccessor<T>,
    entity_type: Option<String>,
    key_generator: Option<Box<dyn KeyGenerator>>,
    handlers: Vec<Arc<dyn IndexationHandler<T>>>,
}

impl<T> DirectoryStoreBuilder<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Name used for the entity type in error messages. Defaults to the Rust type name.
    pub fn entity_type(mut self, name: impl Into<String>) -> Self {
        self.entity_type = Some(name.into());
        self
    }

    /// Replaces the default [`RandomKeyGenerator`] used for keyless inserts.
    pub fn key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        self.key_generator = Some(Box::new(generator));
        self
    }

    /// Adds a handler notified by the initial index and every reindex.
    pub fn handler(mut self, handler: Arc<dyn IndexationHandler<T>>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Creates the directory if it is missing and builds the initial index.
    pub fn open(self) -> Result<DirectoryStore<T>> {
        let entity_type = self.entity_type.unwrap_or_else(short_type_name::<T>);
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|source| Error::WriteFailure {
                entity_type: entity_type.clone(),
                key: String::new(),
                path: self.dir.clone(),
                source,
            })?;
        }
        let store = DirectoryStore {
            dir: self.dir,
            entity_type,
            keys: self.keys,
            key_generator: self
                .key_generator
                .unwrap_or_else(|| Box::new(RandomKeyGenerator::default())),
            index: RwLock::new(HashMap::new()),
            handlers: RwLock::new(self.handlers),
            mutation: Mutex::new(()),
            _entity: PhantomData,
        };
        store.reindex()?;
        Ok(store)
    }
}

impl<T> DirectoryStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Starts configuring a store backed by `dir`, reading keys through `keys`.
    pub fn builder<P: AsRef<Path>>(dir: P, keys: KeyAccessor<T>) -> DirectoryStoreBuilder<T> {
        DirectoryStoreBuilder {
            dir: dir.as_ref().to_path_buf(),
            keys,
            entity_type: None,
            key_generator: None,
            handlers: Vec::new(),
        }
    }

    /// Opens a store with default options.
    pub fn open<P: AsRef<Path>>(dir: P, keys: KeyAccessor<T>) -> Result<Self> {
        Self::builder(dir, keys).open()
    }

    /// The backing directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        read_lock(&self.index).len()
    }

    /// True when no entity is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{}", key, DATA_FILE_SUFFIX))
    }

    /// Reads a data file. The file name is authoritative for the key.
    fn load(&self, key: &str, path: &Path) -> Result<T> {
        let entity = read_entity::<T>(path, &self.entity_type)?;
        Ok(self.keys.with_key(entity, key.to_string()))
    }

    fn not_found(&self, key: &str) -> Error {
        Error::NotFound {
            entity_type: self.entity_type.clone(),
            target: format!("key {}", key),
        }
    }

    /// Draws generated keys until one is not already indexed.
    fn fresh_key(&self, index: &HashMap<String, PathBuf>) -> Result<String> {
        let mut key = self.key_generator.next_key(&self.entity_type);
        for _ in 1..MAX_KEY_ATTEMPTS {
            if !index.contains_key(&key) {
                return Ok(key);
            }
            debug!("Generated {} key {} collides, drawing another", self.entity_type, key);
            key = self.key_generator.next_key(&self.entity_type);
        }
        if index.contains_key(&key) {
            return Err(Error::AlreadyExists {
                entity_type: self.entity_type.clone(),
                key,
            });
        }
        Ok(key)
    }

    /// Writes to a temporary file first and then renames it over the destination.
    fn write_entity(&self, key: &str, path: &Path, entity: &T) -> Result<()> {
        let write_failure = |source: std::io::Error| Error::WriteFailure {
            entity_type: self.entity_type.clone(),
            key: key.to_string(),
            path: path.to_path_buf(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(entity).map_err(|e| write_failure(e.into()))?;
        let temp_path = path.with_extension(TEMP_FILE_EXTENSION);
        fs::write(&temp_path, bytes).map_err(write_failure)?;
        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            write_failure(e)
        })
    }

    /// Lists data files in the directory as `(key, path)` pairs.
    fn scan(&self) -> Result<Vec<(String, PathBuf)>> {
        let read_failure = |source: std::io::Error| Error::ReadFailure {
            entity_type: self.entity_type.clone(),
            path: self.dir.clone(),
            source,
        };
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(read_failure)? {
            let path = entry.map_err(read_failure)?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(DATA_FILE_EXTENSION) {
                continue;
            }
            if !path.is_file() {
                warn!("Skipping {:?}: not a regular file", path);
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(key) => found.push((key.to_string(), path.clone())),
                None => warn!("Skipping {:?}: file name is not valid UTF-8", path),
            }
        }
        Ok(found)
    }
}

/// Reads and deserializes one data file.
fn read_entity<T: DeserializeOwned>(path: &Path, entity_type: &str) -> Result<T> {
    let read_failure = |source: std::io::Error| Error::ReadFailure {
        entity_type: entity_type.to_string(),
        path: path.to_path_buf(),
        source,
    };
    let bytes = fs::read(path).map_err(read_failure)?;
    serde_json::from_slice(&bytes).map_err(|e| read_failure(e.into()))
}

fn short_type_name<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

impl<T> EntityReader<T> for DirectoryStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn key_accessor(&self) -> &KeyAccessor<T> {
        &self.keys
    }

    fn exists(&self, key: &str) -> bool {
        read_lock(&self.index).contains_key(key)
    }

    fn get(&self, key: &str) -> Result<T> {
        let path = read_lock(&self.index)
            .get(key)
            .cloned()
            .ok_or_else(|| self.not_found(key))?;
        self.load(key, &path)
    }

    fn get_matching(&self, predicate: &Predicate<T>) -> Result<T> {
        expect_single(self.stream_matching(predicate), &self.entity_type, predicate)
    }

    fn stream_all(&self) -> EntityStream<'_, T> {
        let entries: Vec<(String, PathBuf)> = read_lock(&self.index)
            .iter()
            .map(|(key, path)| (key.clone(), path.clone()))
            .collect();
        Box::new(entries.into_iter().map(move |(key, path)| self.load(&key, &path)))
    }

    fn stream_matching(&self, predicate: &Predicate<T>) -> EntityStream<'_, T> {
        let predicate = predicate.clone();
        Box::new(self.stream_all().filter(move |item| match item {
            Ok(entity) => predicate.test(entity),
            Err(_) => true,
        }))
    }
}

impl<T> EntityWriter<T> for DirectoryStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn insert(&self, entity: T) -> Result<T> {
        let _guard = lock(&self.mutation);
        let mut index = write_lock(&self.index);
        let (key, entity) = match self.keys.key_of(&entity) {
            Some(key) => {
                if index.contains_key(&key) {
                    return Err(Error::AlreadyExists {
                        entity_type: self.entity_type.clone(),
                        key,
                    });
                }
                if let Some(reason) = invalid_key_reason(&key) {
                    return Err(Error::IntegrityViolation {
                        entity_type: self.entity_type.clone(),
                        key: Some(key),
                        reason: reason.to_string(),
                    });
                }
                (key, entity)
            }
            None => {
                let key = self.fresh_key(&index)?;
                let entity = self.keys.with_key(entity, key.clone());
                (key, entity)
            }
        };

        let path = self.file_for(&key);
        self.write_entity(&key, &path, &entity)?;
        debug!("Inserted {} {} at {:?}", self.entity_type, key, path);
        index.insert(key, path);
        Ok(entity)
    }

    fn update(&self, entity: T) -> Result<T> {
        let key = self.keys.key_of(&entity).ok_or_else(|| Error::IntegrityViolation {
            entity_type: self.entity_type.clone(),
            key: None,
            reason: "no primary key defined during update".to_string(),
        })?;
        let _guard = lock(&self.mutation);
        let index = write_lock(&self.index);
        let path = index.get(&key).cloned().ok_or_else(|| self.not_found(&key))?;
        self.write_entity(&key, &path, &entity)?;
        debug!("Updated {} {}", self.entity_type, key);
        Ok(entity)
    }

    fn delete(&self, key: &str) -> Result<T> {
        let _guard = lock(&self.mutation);
        let mut index = write_lock(&self.index);
        let path = index.get(key).cloned().ok_or_else(|| self.not_found(key))?;
        let deleted = self.load(key, &path)?;
        fs::remove_file(&path).map_err(|source| Error::WriteFailure {
            entity_type: self.entity_type.clone(),
            key: key.to_string(),
            path: path.clone(),
            source,
        })?;
        index.remove(key);
        debug!("Deleted {} {}", self.entity_type, key);
        Ok(deleted)
    }
}

impl<T> Reindex<T> for DirectoryStore<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn reindex(&self) -> Result<()> {
        let _guard = lock(&self.mutation);
        let handlers: Vec<_> = read_lock(&self.handlers).clone();
        for handler in &handlers {
            handler.start();
        }

        let mut index = HashMap::new();
        for (key, path) in self.scan()? {
            {
                let entry = IndexedEntity::lazy(&key, || self.load(&key, &path));
                for handler in &handlers {
                    handler.accept(&entry)?;
                }
            }
            index.insert(key, path);
        }

        info!("Indexed {} {} file(s) in {:?}", index.len(), self.entity_type, self.dir);
        *write_lock(&self.index) = index;
        for handler in &handlers {
            handler.end();
        }
        Ok(())
    }

    fn register_handler(&self, handler: Arc<dyn IndexationHandler<T>>) {
        write_lock(&self.handlers).push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Note {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        name: String,
    }

    fn note(name: &str) -> Note {
        Note { key: None, name: name.to_string() }
    }

    fn keys() -> KeyAccessor<Note> {
        KeyAccessor::new(|n: &Note| n.key.clone(), |n: &mut Note, k| n.key = Some(k))
    }

    fn open(dir: &Path) -> DirectoryStore<Note> {
        DirectoryStore::open(dir, keys()).unwrap()
    }

    fn data_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().and_then(|s| s.to_str()) == Some("json"))
            .count()
    }

    struct FixedKeys(&'static str);

    impl KeyGenerator for FixedKeys {
        fn next_key(&self, _entity_type: &str) -> String {
            self.0.to_string()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl IndexationHandler<Note> for Recorder {
        fn start(&self) {
            self.events.lock().unwrap().push("start".to_string());
        }

        fn accept(&self, entry: &IndexedEntity<'_, Note>) -> Result<()> {
            let name = entry.entity()?.name;
            self.events.lock().unwrap().push(format!("{}={}", entry.key(), name));
            Ok(())
        }

        fn end(&self) {
            self.events.lock().unwrap().push("end".to_string());
        }
    }

    #[test]
    fn test_indexes_existing_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("AAA.json"), r#"{"name":"aaa"}"#).unwrap();
        fs::write(dir.path().join("BBB.json"), r#"{"name":"bbb"}"#).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("CCC.json.tmp"), "{}").unwrap();

        let store = open(dir.path());
        assert_eq!(store.len(), 2);
        assert!(store.exists("AAA"));
        assert!(store.exists("BBB"));
        assert!(!store.exists("notes"));
        assert!(!store.exists("CCC.json"));
        assert_eq!(store.get("BBB").unwrap().name, "bbb");
        assert_eq!(store.entity_type(), "Note");
    }

    #[test]
    fn test_key_keeps_inner_dots() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("v1.2.json"), r#"{"name":"dotted"}"#).unwrap();
        let store = open(dir.path());
        assert!(store.exists("v1.2"));
    }

    #[test]
    fn test_open_creates_missing_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = open(&nested);
        assert!(nested.is_dir());
        assert!(store.is_empty());
    }

    #[test]
    fn test_insert_assigns_key_and_round_trips() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());

        let inserted = store.insert(note("aaa")).unwrap();
        let key = inserted.key.clone().unwrap();
        assert_eq!(key.len(), 10);
        assert!(dir.path().join(format!("{}.json", key)).exists());
        assert!(!dir.path().join(format!("{}.json.tmp", key)).exists());
        assert_eq!(store.get(&key).unwrap(), inserted);
    }

    #[test]
    fn test_insert_existing_key_fails() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let original = store.insert(Note { key: Some("K1".into()), name: "first".into() }).unwrap();

        let res = store.insert(Note { key: Some("K1".into()), name: "second".into() });
        assert!(matches!(res, Err(Error::AlreadyExists { ref key, .. }) if key == "K1"));
        assert_eq!(store.get("K1").unwrap(), original);
        assert_eq!(data_files(dir.path()), 1);
    }

    #[test]
    fn test_insert_rejects_unsafe_keys() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let res = store.insert(Note { key: Some("../escape".into()), name: "x".into() });
        assert!(matches!(res, Err(Error::IntegrityViolation { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_generated_key_collision_is_rejected() {
        let dir = tempdir().unwrap();
        let store = DirectoryStore::builder(dir.path(), keys())
            .key_generator(FixedKeys("SAME"))
            .open()
            .unwrap();
        store.insert(note("one")).unwrap();
        let res = store.insert(note("two"));
        assert!(matches!(res, Err(Error::AlreadyExists { .. })));
        assert_eq!(store.get("SAME").unwrap().name, "one");
    }

    #[test]
    fn test_update() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let mut n = store.insert(note("before")).unwrap();
        n.name = "after".to_string();
        store.update(n.clone()).unwrap();
        assert_eq!(store.get(n.key.as_deref().unwrap()).unwrap().name, "after");

        let res = store.update(note("keyless"));
        assert!(matches!(res, Err(Error::IntegrityViolation { key: None, .. })));

        let res = store.update(Note { key: Some("missing".into()), name: "x".into() });
        assert!(matches!(res, Err(Error::NotFound { .. })));
        assert!(!dir.path().join("missing.json").exists());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let n = store.insert(note("gone")).unwrap();
        let key = n.key.clone().unwrap();

        assert_eq!(store.delete(&key).unwrap(), n);
        assert!(!store.exists(&key));
        assert!(!dir.path().join(format!("{}.json", key)).exists());
        assert!(matches!(store.delete(&key), Err(Error::NotFound { .. })));
        assert!(matches!(store.get(&key), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_get_matching_and_streams() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        for name in ["aaa", "abc", "bbb"] {
            store.insert(note(name)).unwrap();
        }
        let starts_with_a = Predicate::matching("starts with a", |n: &Note| n.name.starts_with('a'));
        let is_bbb = Predicate::matching("is bbb", |n: &Note| n.name == "bbb");
        let is_ccc = Predicate::matching("is ccc", |n: &Note| n.name == "ccc");

        assert_eq!(store.stream_all().count(), 3);
        assert_eq!(store.stream_matching(&starts_with_a).count(), 2);
        assert_eq!(store.get_matching(&is_bbb).unwrap().name, "bbb");
        assert!(matches!(store.get_matching(&is_ccc), Err(Error::NotFound { .. })));
        assert!(matches!(store.get_matching(&starts_with_a), Err(Error::NotUnique { .. })));
    }

    #[test]
    fn test_corrupt_file_is_a_read_failure() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("BAD.json"), "not json").unwrap();
        let store = open(dir.path());
        assert!(store.exists("BAD"));
        assert!(matches!(store.get("BAD"), Err(Error::ReadFailure { .. })));
        assert!(store.stream_all().next().unwrap().is_err());
    }

    #[test]
    fn test_reindex_picks_up_external_changes() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        fs::write(dir.path().join("EXT.json"), r#"{"name":"external"}"#).unwrap();
        assert!(!store.exists("EXT"));
        store.reindex().unwrap();
        assert_eq!(store.get("EXT").unwrap().name, "external");
    }

    #[test]
    fn test_handlers_see_every_entity() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("AAA.json"), r#"{"name":"aaa"}"#).unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = DirectoryStore::builder(dir.path(), keys())
            .handler(recorder.clone())
            .open()
            .unwrap();
        assert_eq!(*recorder.events.lock().unwrap(), vec!["start", "AAA=aaa", "end"]);

        let late = Arc::new(Recorder::default());
        store.register_handler(late.clone());
        store.reindex().unwrap();
        assert_eq!(*late.events.lock().unwrap(), vec!["start", "AAA=aaa", "end"]);
        assert_eq!(recorder.events.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_failed_handler_keeps_previous_index() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("AAA.json"), r#"{"name":"aaa"}"#).unwrap();
        let recorder = Arc::new(Recorder::default());
        let store = DirectoryStore::builder(dir.path(), keys())
            .handler(recorder.clone())
            .open()
            .unwrap();

        fs::write(dir.path().join("BAD.json"), "not json").unwrap();
        assert!(matches!(store.reindex(), Err(Error::ReadFailure { .. })));
        assert!(!store.exists("BAD"));
        assert!(store.exists("AAA"));
        let ends = recorder.events.lock().unwrap().iter().filter(|e| *e == "end").count();
        assert_eq!(ends, 1);
    }

    /// Parks the first `accept` until released.
    struct Gate {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl IndexationHandler<Note> for Gate {
        fn start(&self) {}

        fn accept(&self, _entry: &IndexedEntity<'_, Note>) -> Result<()> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(())
        }

        fn end(&self) {}
    }

    #[test]
    fn test_delete_during_reindex_is_not_undone() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("AAA.json"), r#"{"name":"aaa"}"#).unwrap();
        let store = open(dir.path());

        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        store.register_handler(Arc::new(Gate {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));

        thread::scope(|s| {
            let reindex = s.spawn(|| store.reindex());
            entered_rx.recv().unwrap();
            let delete = s.spawn(|| store.delete("AAA"));
            thread::sleep(Duration::from_millis(50));
            release_tx.send(()).unwrap();
            reindex.join().unwrap().unwrap();
            delete.join().unwrap().unwrap();
        });

        assert!(!store.exists("AAA"));
        assert!(!dir.path().join("AAA.json").exists());
        assert!(matches!(store.get("AAA"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_failed_insert_write_leaves_index() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        fs::create_dir(dir.path().join("K1.json")).unwrap();

        let res = store.insert(Note { key: Some("K1".into()), name: "blocked".into() });
        assert!(matches!(res, Err(Error::WriteFailure { ref key, .. }) if key == "K1"));
        assert!(!store.exists("K1"));
        assert!(store.is_empty());
        assert!(!dir.path().join("K1.json.tmp").exists());
    }

    #[test]
    fn test_failed_update_write_keeps_previous_file() {
        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let before = store.insert(Note { key: Some("K1".into()), name: "before".into() }).unwrap();
        fs::create_dir(dir.path().join("K1.json.tmp")).unwrap();

        let res = store.update(Note { key: Some("K1".into()), name: "after".into() });
        assert!(matches!(res, Err(Error::WriteFailure { .. })));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("K1").unwrap(), before);
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_delete_keeps_entity() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = open(dir.path());
        let kept = store.insert(Note { key: Some("K1".into()), name: "kept".into() }).unwrap();

        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o555)).unwrap();
        // Privileged users ignore directory permissions.
        let writable = fs::write(dir.path().join("writable.txt"), "").is_ok();
        let res = store.delete("K1");
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();
        if writable {
            return;
        }

        assert!(matches!(res, Err(Error::WriteFailure { ref key, .. }) if key == "K1"));
        assert!(store.exists("K1"));
        assert_eq!(store.get("K1").unwrap(), kept);
    }
}
