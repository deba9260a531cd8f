use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A value derived from an entity by an index function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Several projections combined into one key.
    Composite(Vec<IndexKey>),
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Null => f.write_str("null"),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Int(i) => write!(f, "{}", i),
            IndexKey::Str(s) => write!(f, "{:?}", s),
            IndexKey::Composite(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Str(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Str(value)
    }
}

impl From<&String> for IndexKey {
    fn from(value: &String) -> Self {
        IndexKey::Str(value.clone())
    }
}

impl From<bool> for IndexKey {
    fn from(value: bool) -> Self {
        IndexKey::Bool(value)
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::Int(value)
    }
}

impl From<i32> for IndexKey {
    fn from(value: i32) -> Self {
        IndexKey::Int(value.into())
    }
}

impl From<u32> for IndexKey {
    fn from(value: u32) -> Self {
        IndexKey::Int(value.into())
    }
}

impl<V: Into<IndexKey>> From<Option<V>> for IndexKey {
    fn from(value: Option<V>) -> Self {
        value.map(Into::into).unwrap_or(IndexKey::Null)
    }
}

impl From<Vec<IndexKey>> for IndexKey {
    fn from(value: Vec<IndexKey>) -> Self {
        IndexKey::Composite(value)
    }
}

impl<A: Into<IndexKey>, B: Into<IndexKey>> From<(A, B)> for IndexKey {
    fn from((a, b): (A, B)) -> Self {
        IndexKey::Composite(vec![a.into(), b.into()])
    }
}

/// Numbers that do not fit an `i64` keep their JSON text; objects are keyed by their serialized form.
impl From<&serde_json::Value> for IndexKey {
    fn from(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map(IndexKey::Int)
                .unwrap_or_else(|| IndexKey::Str(n.to_string())),
            Value::String(s) => IndexKey::Str(s.clone()),
            Value::Array(items) => IndexKey::Composite(items.iter().map(IndexKey::from).collect()),
            Value::Object(_) => IndexKey::Str(value.to_string()),
        }
    }
}

static NEXT_KEY_FN_ID: AtomicU64 = AtomicU64::new(1);

type DeriveFn<T> = dyn Fn(&T) -> IndexKey + Send + Sync;

/// A named function deriving an [`IndexKey`] from an entity.
///
/// Each instance has its own identity: two functions built from the same
/// closure are still different, and only clones of one instance compare equal.
/// Equality predicates remember which instance they were built from, which is
/// how an index recognizes the predicates it can answer.
pub struct IndexKeyFn<T> {
    id: u64,
    name: Arc<str>,
    derive: Arc<DeriveFn<T>>,
}

impl<T> IndexKeyFn<T> {
    /// Wraps `derive` under a fresh identity.
    pub fn new<F>(name: &str, derive: F) -> Self
    where
        F: Fn(&T) -> IndexKey + Send + Sync + 'static,
    {
        Self {
            id: NEXT_KEY_FN_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name),
            derive: Arc::new(derive),
        }
    }

    /// Label used when displaying predicates.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Computes the derived key of `entity`.
    pub fn derive(&self, entity: &T) -> IndexKey {
        (self.derive)(entity)
    }

    /// True when both are clones of the same instance.
    pub fn same_as(&self, other: &IndexKeyFn<T>) -> bool {
        self.id == other.id
    }
}

impl<T> Clone for IndexKeyFn<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            derive: self.derive.clone(),
        }
    }
}

impl<T> fmt::Debug for IndexKeyFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexKeyFn")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

type TestFn<T> = dyn Fn(&T) -> bool + Send + Sync;

/// A boolean test over entities that indexes can also read as a query.
pub enum Predicate<T> {
    /// `key_fn(entity) == target`.
    Equals { key_fn: IndexKeyFn<T>, target: IndexKey },
    /// Every member holds. Evaluated in order, stopping at the first failure.
    And(Vec<Predicate<T>>),
    /// An arbitrary test. Never answered from an index.
    Matching { label: Arc<str>, test: Arc<TestFn<T>> },
}

impl<T> Predicate<T> {
    /// Holds when `key_fn` derives `target`.
    pub fn equals(key_fn: &IndexKeyFn<T>, target: impl Into<IndexKey>) -> Self {
        Predicate::Equals {
            key_fn: key_fn.clone(),
            target: target.into(),
        }
    }

    /// Conjunction of `predicates`.
    pub fn all(predicates: impl IntoIterator<Item = Predicate<T>>) -> Self {
        Predicate::And(predicates.into_iter().collect())
    }

    /// An opaque test, shown as `label`.
    pub fn matching<F>(label: &str, test: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Predicate::Matching {
            label: Arc::from(label),
            test: Arc::new(test),
        }
    }

    /// Conjunction of `self` and `other`, appending to `self` when it already is one.
    pub fn and(self, other: Predicate<T>) -> Self {
        match self {
            Predicate::And(mut members) => {
                members.push(other);
                Predicate::And(members)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Evaluates the predicate against `entity`.
    pub fn test(&self, entity: &T) -> bool {
        match self {
            Predicate::Equals { key_fn, target } => key_fn.derive(entity) == *target,
            Predicate::And(members) => members.iter().all(|p| p.test(entity)),
            Predicate::Matching { test, .. } => test(entity),
        }
    }

    /// The value an index built on `key_fn` should look up to answer this predicate.
    ///
    /// Found when the predicate is an equality on `key_fn` itself, or a conjunction
    /// with such a member (searched in order, nested conjunctions included).
    pub fn target_for(&self, key_fn: &IndexKeyFn<T>) -> Option<&IndexKey> {
        match self {
            Predicate::Equals { key_fn: own, target } if own.same_as(key_fn) => Some(target),
            Predicate::Equals { .. } | Predicate::Matching { .. } => None,
            Predicate::And(members) => members.iter().find_map(|p| p.target_for(key_fn)),
        }
    }
}

impl<T> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        match self {
            Predicate::Equals { key_fn, target } => Predicate::Equals {
                key_fn: key_fn.clone(),
                target: target.clone(),
            },
            Predicate::And(members) => Predicate::And(members.clone()),
            Predicate::Matching { label, test } => Predicate::Matching {
                label: label.clone(),
                test: test.clone(),
            },
        }
    }
}

impl<T> fmt::Display for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Equals { key_fn, target } => write!(f, "{} == {}", key_fn.name(), target),
            Predicate::And(members) => {
                f.write_str("(")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" && ")?;
                    }
                    write!(f, "{}", member)?;
                }
                f.write_str(")")
            }
            Predicate::Matching { label, .. } => f.write_str(label),
        }
    }
}

impl<T> fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Pojo {
        name: &'static str,
        size: i64,
    }

    fn name_fn() -> IndexKeyFn<Pojo> {
        IndexKeyFn::new("name", |p: &Pojo| p.name.into())
    }

    #[test]
    fn test_equals_compares_derived_value() {
        let name = name_fn();
        let p = Predicate::equals(&name, "aaa");
        assert!(p.test(&Pojo { name: "aaa", size: 1 }));
        assert!(!p.test(&Pojo { name: "bbb", size: 1 }));
    }

    #[test]
    fn test_and_requires_every_member() {
        let name = name_fn();
        let p = Predicate::equals(&name, "aaa").and(Predicate::matching("size > 2", |p: &Pojo| p.size > 2));
        assert!(p.test(&Pojo { name: "aaa", size: 3 }));
        assert!(!p.test(&Pojo { name: "aaa", size: 1 }));
        assert!(!p.test(&Pojo { name: "bbb", size: 3 }));
    }

    #[test]
    fn test_and_short_circuits() {
        let name = name_fn();
        let p = Predicate::all([
            Predicate::equals(&name, "zzz"),
            Predicate::matching("never evaluated", |_: &Pojo| panic!("evaluated after a failed member")),
        ]);
        assert!(!p.test(&Pojo { name: "aaa", size: 1 }));
    }

    #[test]
    fn test_empty_and_holds() {
        let p: Predicate<Pojo> = Predicate::all([]);
        assert!(p.test(&Pojo { name: "aaa", size: 1 }));
    }

    #[test]
    fn test_target_for_matches_identity_not_name() {
        let name = name_fn();
        let lookalike = name_fn();
        let p = Predicate::equals(&name, "aaa");
        assert_eq!(p.target_for(&name), Some(&IndexKey::from("aaa")));
        assert_eq!(p.target_for(&name.clone()), Some(&IndexKey::from("aaa")));
        assert_eq!(p.target_for(&lookalike), None);
    }

    #[test]
    fn test_target_for_searches_conjunction_members() {
        let name = name_fn();
        let size = IndexKeyFn::new("size", |p: &Pojo| p.size.into());
        let p = Predicate::matching("anything", |_: &Pojo| true)
            .and(Predicate::equals(&size, 3i64))
            .and(Predicate::all([Predicate::equals(&name, "aaa")]));
        assert_eq!(p.target_for(&size), Some(&IndexKey::Int(3)));
        assert_eq!(p.target_for(&name), Some(&IndexKey::from("aaa")));
        assert_eq!(Predicate::matching("x", |_: &Pojo| true).target_for(&name), None);
    }

    #[test]
    fn test_display() {
        let name = name_fn();
        let p = Predicate::equals(&name, "aaa").and(Predicate::matching("big", |p: &Pojo| p.size > 9));
        assert_eq!(p.to_string(), "(name == \"aaa\" && big)");
    }

    #[test]
    fn test_index_key_from_json() {
        assert_eq!(IndexKey::from(&json!("a")), IndexKey::from("a"));
        assert_eq!(IndexKey::from(&json!(7)), IndexKey::Int(7));
        assert_eq!(IndexKey::from(&json!(1.5)), IndexKey::Str("1.5".to_string()));
        assert_eq!(IndexKey::from(&json!(null)), IndexKey::Null);
        assert_eq!(
            IndexKey::from(&json!([1, "x"])),
            IndexKey::Composite(vec![IndexKey::Int(1), IndexKey::from("x")])
        );
        assert_eq!(IndexKey::from(Some("a")), IndexKey::from("a"));
        assert_eq!(IndexKey::from(None::<&str>), IndexKey::Null);
    }
}
