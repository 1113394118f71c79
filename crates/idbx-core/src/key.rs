//! Keys, key paths and key ranges
//!
//! Keys follow IndexedDB ordering: every number sorts before every string, every
//! string before every array; arrays compare element-wise, then by length.
//! Records are JSON values, so keys are extracted from and written back into
//! `serde_json::Value` trees.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// Largest integer a key number can hold without losing precision when written back as JSON.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A record key.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    /// Read a key out of a JSON value. Returns `None` for values that are not valid keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_f64().map(Key::Number),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Convert back to JSON. Integral numbers are written as integers.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::String(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u32> for Key {
    fn from(n: u32) -> Self {
        Key::Number(n as f64)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

/// Path (or paths, for compound keys) into a record.
///
/// Serialized as a string or an array of strings, the way IndexedDB spells `keyPath`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Compound(Vec<String>),
}

impl KeyPath {
    /// Evaluate the path against a record.
    pub fn extract(&self, record: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => lookup(record, path).and_then(Key::from_value),
            KeyPath::Compound(paths) => paths
                .iter()
                .map(|p| lookup(record, p).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// The raw value a single path points at. Compound paths have no single value.
    pub fn value_in<'a>(&self, record: &'a Value) -> Option<&'a Value> {
        match self {
            KeyPath::Single(path) => lookup(record, path),
            KeyPath::Compound(_) => None,
        }
    }

    /// Whether the path resolves to some value, valid key or not.
    pub fn is_present(&self, record: &Value) -> bool {
        self.segments()
            .into_iter()
            .all(|path| lookup(record, path).is_some())
    }

    /// Write a generated key into the record at this path, creating intermediate objects.
    ///
    /// Only single, non-empty paths can receive generated keys.
    pub fn inject(&self, record: &mut Value, key: &Key) -> EngineResult<()> {
        let path = match self {
            KeyPath::Single(path) if !path.is_empty() => path,
            _ => {
                return Err(EngineError::data(format!(
                    "cannot inject a generated key at key path {}",
                    self
                )))
            }
        };

        let mut current = record;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            let object = current.as_object_mut().ok_or_else(|| {
                EngineError::data(format!("key path {} does not lead through objects", path))
            })?;
            if segments.peek().is_none() {
                object.insert(segment.to_string(), key.to_value());
                return Ok(());
            }
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }
        Ok(())
    }

    /// The paths as a list, one entry for single paths.
    pub fn segments(&self) -> Vec<&str> {
        match self {
            KeyPath::Single(p) => vec![p.as_str()],
            KeyPath::Compound(ps) => ps.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(p) => write!(f, "{:?}", p),
            KeyPath::Compound(ps) => write!(f, "{:?}", ps),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Single(path)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Compound(paths.into_iter().map(String::from).collect())
    }
}

/// Resolve a dotted path. The empty path is the record itself.
fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(record);
    }
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

/// A contiguous interval of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Bound<Key>,
    upper: Bound<Key>,
}

impl KeyRange {
    /// Range matching exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    /// Keys above `key` (excluding it when `open`).
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: bound(key.into(), open),
            upper: Bound::Unbounded,
        }
    }

    /// Keys below `key` (excluding it when `open`).
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: bound(key.into(), open),
        }
    }

    /// Keys between `lower` and `upper`.
    ///
    /// Fails with `DataError` when the range is empty by construction.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> EngineResult<Self> {
        let (lower, upper) = (lower.into(), upper.into());
        match lower.cmp(&upper) {
            Ordering::Greater => {
                return Err(EngineError::data(format!(
                    "lower bound {} is greater than upper bound {}",
                    lower, upper
                )))
            }
            Ordering::Equal if lower_open || upper_open => {
                return Err(EngineError::data(format!(
                    "bounds are equal ({}) and one of them is open",
                    lower
                )))
            }
            _ => {}
        }
        Ok(Self {
            lower: bound(lower, lower_open),
            upper: bound(upper, upper_open),
        })
    }

    pub fn lower(&self) -> &Bound<Key> {
        &self.lower
    }

    pub fn upper(&self) -> &Bound<Key> {
        &self.upper
    }

    pub fn contains(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    }
}

fn bound(key: Key, open: bool) -> Bound<Key> {
    if open {
        Bound::Excluded(key)
    } else {
        Bound::Included(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::from(vec![Key::from(1)]),
            Key::from("b"),
            Key::from(10),
            Key::from("a"),
            Key::from(-2.5),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::from(-2.5),
                Key::from(10),
                Key::from("a"),
                Key::from("b"),
                Key::from(vec![Key::from(1)]),
            ]
        );
    }

    #[test]
    fn test_key_from_value_rejects_non_keys() {
        assert_eq!(Key::from_value(&json!(3)), Some(Key::from(3)));
        assert_eq!(Key::from_value(&json!(null)), None);
        assert_eq!(Key::from_value(&json!({"a": 1})), None);
        assert_eq!(Key::from_value(&json!([1, true])), None);
    }

    #[test]
    fn test_integral_numbers_written_as_integers() {
        assert_eq!(Key::from(1).to_value(), json!(1));
        assert_eq!(Key::from(1.5).to_value(), json!(1.5));
    }

    #[test]
    fn test_extract_dotted_and_compound() {
        let record = json!({"id": 7, "profile": {"email": "ann@example.com"}, "tag": "x"});
        assert_eq!(
            KeyPath::from("profile.email").extract(&record),
            Some(Key::from("ann@example.com"))
        );
        assert_eq!(
            KeyPath::from(vec!["tag", "id"]).extract(&record),
            Some(Key::from(vec![Key::from("x"), Key::from(7)]))
        );
        assert_eq!(KeyPath::from("missing").extract(&record), None);
    }

    #[test]
    fn test_present_but_invalid_differs_from_missing() {
        let record = json!({"id": null, "tags": ["a", null]});
        assert_eq!(KeyPath::from("id").extract(&record), None);
        assert!(KeyPath::from("id").is_present(&record));
        assert!(!KeyPath::from("missing").is_present(&record));
        assert_eq!(
            KeyPath::from("tags").value_in(&record),
            Some(&json!(["a", null]))
        );
        assert_eq!(KeyPath::from(vec!["id"]).value_in(&record), None);
    }

    #[test]
    fn test_inject_creates_intermediate_objects() {
        let mut record = json!({"name": "Ann"});
        KeyPath::from("meta.id")
            .inject(&mut record, &Key::from(4))
            .unwrap();
        assert_eq!(record, json!({"name": "Ann", "meta": {"id": 4}}));

        let err = KeyPath::from(vec!["a", "b"])
            .inject(&mut record, &Key::from(1))
            .unwrap_err();
        assert_eq!(err.kind, crate::EngineErrorKind::Data);
    }

    #[test]
    fn test_range_contains() {
        let range = KeyRange::bound(2, 5, true, false).unwrap();
        assert!(!range.contains(&Key::from(2)));
        assert!(range.contains(&Key::from(3)));
        assert!(range.contains(&Key::from(5)));
        assert!(!range.contains(&Key::from("3")));

        assert!(KeyRange::only("a").contains(&Key::from("a")));
        assert!(KeyRange::lower_bound(1, false).contains(&Key::from("z")));
        assert!(KeyRange::bound(5, 2, false, false).is_err());
        assert!(KeyRange::bound(2, 2, true, false).is_err());
    }
}
