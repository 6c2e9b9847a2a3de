//! Identity types for aggregates and their cache entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Prefix shared by every aggregate cache key.
pub const DEFAULT_KEY_PREFIX: &str = "AggregateModel";

/// Opaque aggregate identifier.
///
/// Child stores hand out either integer or textual primary keys, so both are
/// accepted. The identifier is stable for the aggregate's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateId {
    Int(i64),
    Text(String),
}

impl AggregateId {
    /// Interpret an attribute value as an identifier.
    ///
    /// Returns `None` for nulls, floats, booleans, arrays, objects and empty
    /// strings, none of which can address an aggregate.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(AggregateId::Int),
            Value::String(s) if !s.is_empty() => Some(AggregateId::Text(s.clone())),
            _ => None,
        }
    }

    /// Convert back into an attribute value.
    pub fn to_value(&self) -> Value {
        match self {
            AggregateId::Int(n) => Value::from(*n),
            AggregateId::Text(s) => Value::String(s.clone()),
        }
    }

    /// Parse the textual form used inside cache keys.
    pub fn parse(s: &str) -> Self {
        s.parse::<i64>()
            .map(AggregateId::Int)
            .unwrap_or_else(|_| AggregateId::Text(s.to_string()))
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateId::Int(n) => write!(f, "{}", n),
            AggregateId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AggregateId {
    fn from(n: i64) -> Self {
        AggregateId::Int(n)
    }
}

impl From<i32> for AggregateId {
    fn from(n: i32) -> Self {
        AggregateId::Int(n as i64)
    }
}

impl From<u32> for AggregateId {
    fn from(n: u32) -> Self {
        AggregateId::Int(n as i64)
    }
}

impl From<&str> for AggregateId {
    fn from(s: &str) -> Self {
        AggregateId::Text(s.to_string())
    }
}

impl From<String> for AggregateId {
    fn from(s: String) -> Self {
        AggregateId::Text(s)
    }
}

impl From<Uuid> for AggregateId {
    fn from(id: Uuid) -> Self {
        AggregateId::Text(id.to_string())
    }
}

/// Separator between key components.
const SEPARATOR: char = ':';

/// A cache key for one aggregate.
///
/// # Format
///
/// `<prefix>:<AggregateTypeName>:<id>`, e.g. `AggregateModel:User:1`.
/// The format is stable across process restarts so that any process sharing
/// the cache can read entries written by another.
///
/// Type names may not contain the separator, which keeps keys of two
/// different aggregate types from ever colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Private inner data - built only through `new()` or `parse()`
    inner: CacheKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKeyInner {
    prefix: String,
    aggregate_type: String,
    id: AggregateId,
}

impl CacheKey {
    /// Create a key for the given aggregate type and id.
    pub fn new(prefix: impl Into<String>, aggregate_type: impl Into<String>, id: AggregateId) -> Self {
        Self {
            inner: CacheKeyInner {
                prefix: prefix.into(),
                aggregate_type: aggregate_type.into(),
                id,
            },
        }
    }

    /// Create a key with the default `AggregateModel` prefix.
    pub fn aggregate(aggregate_type: impl Into<String>, id: AggregateId) -> Self {
        Self::new(DEFAULT_KEY_PREFIX, aggregate_type, id)
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn aggregate_type(&self) -> &str {
        &self.inner.aggregate_type
    }

    pub fn id(&self) -> &AggregateId {
        &self.inner.id
    }

    /// Render the key into its storage form.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse a key from its storage form.
    ///
    /// Returns `None` if the string does not have three non-empty components.
    /// The id component may itself contain separators.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, SEPARATOR);
        let prefix = parts.next().filter(|p| !p.is_empty())?;
        let aggregate_type = parts.next().filter(|p| !p.is_empty())?;
        let id = parts.next().filter(|p| !p.is_empty())?;
        Some(Self::new(prefix, aggregate_type, AggregateId::parse(id)))
    }

    /// Check whether a type name can be embedded in a key without ambiguity.
    pub fn is_valid_type_name(name: &str) -> bool {
        !name.is_empty() && !name.contains(SEPARATOR)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.inner.prefix,
            self.inner.aggregate_type,
            self.inner.id,
            sep = SEPARATOR
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uuid_ids_are_text_and_survive_keys() {
        let uuid = Uuid::now_v7();
        let id = AggregateId::from(uuid);
        assert_eq!(id, AggregateId::Text(uuid.to_string()));

        let key = CacheKey::aggregate("Order", id.clone());
        let parsed = CacheKey::parse(&key.encode()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(AggregateId::from_value(&id.to_value()), Some(id));
    }

    #[test]
    fn test_cache_key_format() {
        let key = CacheKey::aggregate("User", AggregateId::from(1));
        assert_eq!(key.encode(), "AggregateModel:User:1");
    }

    #[test]
    fn test_cache_key_parse() {
        let key = CacheKey::parse("AggregateModel:Order:abc:def").unwrap();
        assert_eq!(key.prefix(), "AggregateModel");
        assert_eq!(key.aggregate_type(), "Order");
        assert_eq!(key.id(), &AggregateId::Text("abc:def".to_string()));
    }

    #[test]
    fn test_cache_key_parse_rejects_short_keys() {
        assert!(CacheKey::parse("AggregateModel:User").is_none());
        assert!(CacheKey::parse("AggregateModel::1").is_none());
        assert!(CacheKey::parse("").is_none());
    }

    #[test]
    fn test_keys_of_different_types_differ() {
        let a = CacheKey::aggregate("User", AggregateId::from(7));
        let b = CacheKey::aggregate("Account", AggregateId::from(7));
        assert_ne!(a, b);
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn test_type_name_validation() {
        assert!(CacheKey::is_valid_type_name("User"));
        assert!(!CacheKey::is_valid_type_name("Us:er"));
        assert!(!CacheKey::is_valid_type_name(""));
    }

    #[test]
    fn test_id_from_value() {
        assert_eq!(AggregateId::from_value(&json!(5)), Some(AggregateId::Int(5)));
        assert_eq!(
            AggregateId::from_value(&json!("x-1")),
            Some(AggregateId::Text("x-1".to_string()))
        );
        assert_eq!(AggregateId::from_value(&json!(null)), None);
        assert_eq!(AggregateId::from_value(&json!("")), None);
        assert_eq!(AggregateId::from_value(&json!(1.5)), None);
    }

    #[test]
    fn test_id_serializes_untagged() {
        let id = AggregateId::from(12);
        assert_eq!(serde_json::to_string(&id).unwrap(), "12");
        let back: AggregateId = serde_json::from_str("\"k-9\"").unwrap();
        assert_eq!(back, AggregateId::from("k-9"));
    }
}
