//! Parameter map model shared by the template engine and the dedup layer.
//!
//! # Design
//! Parameters are kept in a `BTreeMap`, so iteration order is key-sorted
//! and the canonical serialization fed to the fingerprint is stable.
//! Two maps with the same key/value pairs always produce the same
//! fingerprint regardless of insertion order. `Absent` models a key that
//! is present but explicitly carries no value; it is excluded before path
//! rendering and skipped by query serialization unless `skip_nulls` is
//! turned off.

use std::collections::BTreeMap;

use serde_json::Value;

/// A single parameter value.
///
/// Path placeholders accept only the scalar variants (`Bool`, `Int`,
/// `Float`, `Str`); lists are valid for query parameters only.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ParamValue>),
    /// Present-but-valueless: excluded from paths, skipped in queries.
    Absent,
}

impl ParamValue {
    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "boolean",
            ParamValue::Int(_) | ParamValue::Float(_) => "number",
            ParamValue::Str(_) => "string",
            ParamValue::List(_) => "list",
            ParamValue::Absent => "absent",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            ParamValue::Bool(_) | ParamValue::Int(_) | ParamValue::Float(_) | ParamValue::Str(_)
        )
    }

    /// String form of a scalar value, as it appears in a rendered URL
    /// before percent-encoding. `None` for lists and `Absent`.
    pub fn to_plain_string(&self) -> Option<String> {
        match self {
            ParamValue::Bool(b) => Some(b.to_string()),
            ParamValue::Int(n) => Some(n.to_string()),
            ParamValue::Float(n) => Some(n.to_string()),
            ParamValue::Str(s) => Some(s.clone()),
            ParamValue::List(_) | ParamValue::Absent => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Int(n) => Value::from(*n),
            ParamValue::Float(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
            ParamValue::Str(s) => Value::String(s.clone()),
            ParamValue::List(items) => Value::Array(items.iter().map(ParamValue::to_json).collect()),
            ParamValue::Absent => Value::Null,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl<V: Into<ParamValue>> From<Vec<V>> for ParamValue {
    fn from(items: Vec<V>) -> Self {
        ParamValue::List(items.into_iter().map(Into::into).collect())
    }
}

/// An ordered parameter map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        self.0.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Merge `other` over `self`; same-named keys in `other` win.
    pub fn merged(&self, other: &Params) -> Params {
        let mut out = self.clone();
        for (key, value) in other.iter() {
            out.0.insert(key.clone(), value.clone());
        }
        out
    }

    /// Stable JSON serialization used as fingerprint input.
    ///
    /// Keys are sorted (BTreeMap order) and `Absent` entries are dropped,
    /// so logically equal maps serialize identically.
    pub fn canonical(&self) -> String {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.0 {
            if matches!(value, ParamValue::Absent) {
                continue;
            }
            map.insert(key.clone(), value.to_json());
        }
        serde_json::to_string(&Value::Object(map)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_sorts_keys() {
        let a = Params::new().with("type", "alpha").with("codes", vec!["col", "pe", "at"]);
        let b = Params::new().with("codes", vec!["col", "pe", "at"]).with("type", "alpha");
        assert_eq!(a.canonical(), r#"{"codes":["col","pe","at"],"type":"alpha"}"#);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn canonical_drops_absent_entries() {
        let params = Params::new().with("a", 1).with("b", ParamValue::Absent);
        assert_eq!(params.canonical(), r#"{"a":1}"#);
    }

    #[test]
    fn canonical_empty_map() {
        assert_eq!(Params::new().canonical(), "{}");
    }

    #[test]
    fn merged_prefers_right_hand_side() {
        let base = Params::new().with("lang", "en").with("page", 1);
        let call = Params::new().with("page", 2);
        let merged = base.merged(&call);
        assert_eq!(merged.get("page"), Some(&ParamValue::Int(2)));
        assert_eq!(merged.get("lang"), Some(&ParamValue::Str("en".into())));
        // the inputs are untouched
        assert_eq!(base.get("page"), Some(&ParamValue::Int(1)));
    }

    #[test]
    fn kind_names() {
        assert_eq!(ParamValue::Bool(true).kind(), "boolean");
        assert_eq!(ParamValue::Int(1).kind(), "number");
        assert_eq!(ParamValue::Float(1.5).kind(), "number");
        assert_eq!(ParamValue::Str("x".into()).kind(), "string");
        assert_eq!(ParamValue::List(vec![]).kind(), "list");
        assert_eq!(ParamValue::Absent.kind(), "absent");
    }

    #[test]
    fn plain_string_forms() {
        assert_eq!(ParamValue::Bool(true).to_plain_string().as_deref(), Some("true"));
        assert_eq!(ParamValue::Int(42).to_plain_string().as_deref(), Some("42"));
        assert_eq!(ParamValue::Float(1.5).to_plain_string().as_deref(), Some("1.5"));
        assert_eq!(ParamValue::Str("test".into()).to_plain_string().as_deref(), Some("test"));
        assert_eq!(ParamValue::List(vec![]).to_plain_string(), None);
    }
}
