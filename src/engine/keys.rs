use std::fmt;
use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;

/// Default length of generated keys.
pub const DEFAULT_KEY_LENGTH: usize = 10;

type KeyGetter<T> = dyn Fn(&T) -> Option<String> + Send + Sync;
type KeySetter<T> = dyn Fn(&mut T, String) + Send + Sync;

/// Reads and writes the primary key of an entity.
///
/// The store never inspects entities directly; it only goes through the
/// functions supplied here. After `set_key(e, k)`, `key_of(e)` must return `k`.
pub struct KeyAccessor<T> {
    getter: Arc<KeyGetter<T>>,
    setter: Arc<KeySetter<T>>,
}

impl<T> KeyAccessor<T> {
    /// Builds an accessor from a key getter and a key setter.
    pub fn new<G, S>(getter: G, setter: S) -> Self
    where
        G: Fn(&T) -> Option<String> + Send + Sync + 'static,
        S: Fn(&mut T, String) + Send + Sync + 'static,
    {
        Self {
            getter: Arc::new(getter),
            setter: Arc::new(setter),
        }
    }

    /// The entity's key, or `None` when it has not been assigned one.
    pub fn key_of(&self, entity: &T) -> Option<String> {
        (self.getter)(entity)
    }

    /// Assigns `key` to the entity.
    pub fn set_key(&self, entity: &mut T, key: String) {
        (self.setter)(entity, key)
    }

    /// Consuming form of [`set_key`](Self::set_key).
    pub fn with_key(&self, mut entity: T, key: String) -> T {
        self.set_key(&mut entity, key);
        entity
    }
}

impl<T> Clone for KeyAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            getter: self.getter.clone(),
            setter: self.setter.clone(),
        }
    }
}

impl<T> fmt::Debug for KeyAccessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyAccessor")
    }
}

/// Produces fresh keys for entities inserted without one.
///
/// Generators make no uniqueness promise; the inserting store rejects collisions.
pub trait KeyGenerator: Send + Sync {
    /// A candidate key for a new entity of `entity_type`.
    fn next_key(&self, entity_type: &str) -> String;
}

/// Fixed-length keys drawn uniformly from `[0-9A-Za-z]`.
#[derive(Debug, Clone)]
pub struct RandomKeyGenerator {
    length: usize,
}

impl RandomKeyGenerator {
    /// Generates keys of `length` characters.
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    /// Length of every generated key.
    pub fn length(&self) -> usize {
        self.length
    }
}

impl Default for RandomKeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_LENGTH)
    }
}

impl KeyGenerator for RandomKeyGenerator {
    fn next_key(&self, _entity_type: &str) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect()
    }
}

/// Keys become file names, so they must stay inside the backing directory.
pub(crate) fn invalid_key_reason(key: &str) -> Option<&'static str> {
    if key.is_empty() {
        Some("key is empty")
    } else if key.starts_with('.') {
        Some("key starts with '.'")
    } else if key.contains(['/', '\\']) {
        Some("key contains a path separator")
    } else {
        None
    }
}
