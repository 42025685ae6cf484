//! Query keys and their canonical string encoding.
//!
//! A [`QueryKey`] is an ordered list of segments. Each segment is either a scalar
//! (string, number, boolean, null) or a flat object whose values are scalars.
//! Keys are compared only through their encoding, which is compact JSON with
//! object fields sorted by name:
//!
//! ```
//! use query_signal::key::QueryKey;
//!
//! let key = QueryKey::from("user").with(1);
//! assert_eq!(key.encoded(), r#"["user",1]"#);
//! assert!(key.starts_with(&QueryKey::from("user")));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::QueryError;

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct KeySegment(Value);

impl KeySegment {
    /// Builds a flat object segment.
    ///
    /// Object values must themselves be scalars; a nested object is rejected.
    pub fn object<I, K>(entries: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = (K, KeySegment)>,
        K: Into<String>,
    {
        let mut map = Map::new();
        for (name, KeySegment(value)) in entries {
            let name = name.into();
            if !is_scalar(&value) {
                return Err(QueryError::InvalidKey(format!(
                    "field `{name}` of an object segment must be a scalar"
                )));
            }
            map.insert(name, value);
        }
        Ok(Self(Value::Object(map)))
    }

    /// Returns `true` if this segment is a flat object.
    #[must_use]
    pub const fn is_object(&self) -> bool {
        matches!(self.0, Value::Object(_))
    }
}

const fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

impl TryFrom<Value> for KeySegment {
    type Error = QueryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(_) => Err(QueryError::InvalidKey(
                "a key segment cannot be an array".to_string(),
            )),
            Value::Object(map) => Self::object(map.into_iter().map(|(k, v)| (k, Self(v)))),
            scalar => Ok(Self(scalar)),
        }
    }
}

macro_rules! scalar_segment {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for KeySegment {
                fn from(value: $ty) -> Self {
                    Self(Value::from(value))
                }
            }
        )*
    };
}

// `f64` maps non-finite values to `null`, matching JSON serialization.
scalar_segment!(&str, String, bool, i32, i64, u32, u64, usize, f64);

impl From<()> for KeySegment {
    fn from((): ()) -> Self {
        Self(Value::Null)
    }
}

/// A structured, serializable cache key.
///
/// Equality, hashing and ordering of keys in the cache all go through
/// [`QueryKey::encoded`].
#[derive(Debug, Clone)]
pub struct QueryKey {
    segments: Vec<KeySegment>,
    encoded: String,
}

impl QueryKey {
    /// Creates a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<KeySegment>,
    {
        let segments: Vec<KeySegment> = segments.into_iter().map(Into::into).collect();
        let encoded = encode(&segments);
        Self { segments, encoded }
    }

    /// Parses a key from a JSON value.
    ///
    /// An array becomes one segment per element; any other value is a
    /// single-segment key.
    pub fn from_value(value: Value) -> Result<Self, QueryError> {
        let segments = match value {
            Value::Array(items) => items
                .into_iter()
                .map(KeySegment::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            other => vec![KeySegment::try_from(other)?],
        };
        Ok(Self::new(segments))
    }

    /// Returns a new key with `segment` appended.
    #[must_use]
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.segments.push(segment.into());
        self.encoded = encode(&self.segments);
        self
    }

    /// The canonical string encoding.
    #[must_use]
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    #[must_use]
    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    /// Returns `true` if `prefix`'s segments are a leading run of this key's segments.
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        matches_encoded(&self.encoded, &prefix.encoded, false)
    }
}

/// Encodes segments as compact JSON.
///
/// Object fields come out sorted because `serde_json::Map` is ordered by key.
fn encode(segments: &[KeySegment]) -> String {
    Value::Array(segments.iter().map(|s| s.0.clone()).collect()).to_string()
}

/// Tests an encoded key against an encoded pattern.
///
/// With `exact`, the two must be equal. Otherwise the pattern's segments must be a
/// prefix of the candidate's: the pattern without its closing bracket must lead the
/// candidate, and the candidate must continue with a segment separator or end there.
pub(crate) fn matches_encoded(candidate: &str, pattern: &str, exact: bool) -> bool {
    if exact || candidate == pattern {
        return candidate == pattern;
    }
    let Some(open) = pattern.strip_suffix(']') else {
        return false;
    };
    if open == "[" {
        return true;
    }
    candidate
        .strip_prefix(open)
        .is_some_and(|rest| rest.starts_with(',') || rest.starts_with(']'))
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Value::Array(self.segments.iter().map(|s| s.0.clone()).collect()).serialize(serializer)
    }
}

impl<S: Into<KeySegment>> FromIterator<S> for QueryKey {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl From<&str> for QueryKey {
    fn from(value: &str) -> Self {
        Self::new([value])
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self::new([value])
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(value: &QueryKey) -> Self {
        value.clone()
    }
}
