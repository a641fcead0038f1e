//! Dynamic payload values bound into templates.
//!
//! Payloads have no schema. Dates and money are first-class variants so a
//! payload built in code carries them exactly; when a template runs, the
//! value is serialized into the template context with dates as ISO strings
//! and decimals as their literal text (`150.00` stays two places).
//!
//! JSON has no date or decimal type; when converting from JSON the tagged
//! objects `{"$date": "2023-10-27"}`, `{"$datetime": "2023-10-27T09:30:00"}` and
//! `{"$decimal": "150.00"}` produce typed values. Plain integers become
//! [`Value::Int`] and every other number becomes [`Value::Decimal`] with the
//! scale it was written with. Object keys keep their document order.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use serde_json::value::RawValue;

use crate::error::{ForgeError, Result};

/// A node in a data payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    /// Exact decimal, scale preserved (`150.00` stays two places).
    Decimal(Decimal),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    String(String),
    List(Vec<Value>),
    /// Entries in insertion order.
    Map(IndexMap<String, Value>),
}

impl Value {
    /// Build a map value from key/value pairs.
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list value.
    pub fn list<V, I>(items: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Parse a decimal literal such as `"1177.50"`, keeping its scale.
    pub fn decimal(literal: &str) -> Result<Self> {
        Decimal::from_str(literal)
            .map(Value::Decimal)
            .map_err(|e| ForgeError::Data(format!("bad decimal '{literal}': {e}")))
    }

    /// Look up one path segment: a map key, or a list index.
    pub fn get(&self, segment: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(segment),
            Value::List(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Parse a JSON document into a payload.
    ///
    /// Numbers are read from their literal text, so `150.00` becomes a
    /// two-place decimal rather than the float `150.0`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: &RawValue = serde_json::from_str(json)?;
        from_raw(raw)
    }
}

fn from_raw(raw: &RawValue) -> Result<Value> {
    let text = raw.get().trim_start();
    match text.as_bytes().first() {
        Some(b'{') => {
            let entries: IndexMap<String, &RawValue> = serde_json::from_str(text)?;
            if entries.len() == 1 {
                if let Some((tag, inner)) = entries.first() {
                    if let Ok(literal) = serde_json::from_str::<String>(inner.get()) {
                        if let Some(typed) = tagged_scalar(tag, &literal)? {
                            return Ok(typed);
                        }
                    }
                }
            }
            entries
                .into_iter()
                .map(|(key, inner)| Ok((key, from_raw(inner)?)))
                .collect::<Result<IndexMap<_, _>>>()
                .map(Value::Map)
        }
        Some(b'[') => {
            let items: Vec<&RawValue> = serde_json::from_str(text)?;
            items
                .into_iter()
                .map(from_raw)
                .collect::<Result<Vec<_>>>()
                .map(Value::List)
        }
        Some(b'-' | b'0'..=b'9') => number(text.trim_end()),
        _ => match serde_json::from_str::<serde_json::Value>(text)? {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            other => Err(ForgeError::Data(format!("unexpected JSON value {other}"))),
        },
    }
}

fn number(literal: &str) -> Result<Value> {
    if let Ok(i) = literal.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    Decimal::from_str(literal)
        .or_else(|_| Decimal::from_scientific(literal))
        .map(Value::Decimal)
        .map_err(|e| ForgeError::Data(format!("number {literal} out of range: {e}")))
}

fn tagged_scalar(tag: &str, text: &str) -> Result<Option<Value>> {
    let bad = |e: &dyn std::fmt::Display| ForgeError::Data(format!("bad {tag} '{text}': {e}"));
    match tag {
        "$decimal" => Decimal::from_str(text)
            .map(|d| Some(Value::Decimal(d)))
            .map_err(|e| bad(&e)),
        "$date" => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(|d| Some(Value::Date(d)))
            .map_err(|e| bad(&e)),
        "$datetime" => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| DateTime::parse_from_rfc3339(text).map(|dt| dt.naive_local()))
            .map(|dt| Some(Value::DateTime(dt)))
            .map_err(|e| bad(&e)),
        _ => Ok(None),
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Decimal(d) => serializer.collect_str(d),
            Value::Date(d) => serializer.collect_str(&d.format("%Y-%m-%d")),
            Value::DateTime(dt) => serializer.collect_str(&dt.format("%Y-%m-%dT%H:%M:%S")),
            Value::String(s) => serializer.serialize_str(s),
            Value::List(items) => serializer.collect_seq(items),
            Value::Map(entries) => serializer.collect_map(entries),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_numbers_split_into_int_and_decimal() {
        let v = Value::from_json_str(r#"{"qty": 2, "price": 150.5}"#).unwrap();
        assert_eq!(v.get("qty"), Some(&Value::Int(2)));
        assert_eq!(v.get("price"), Some(&Value::decimal("150.5").unwrap()));
    }

    #[test]
    fn plain_json_numbers_keep_their_scale() {
        let v = Value::from_json_str(r#"{"price": 150.00, "rate": 1.5e2, "big": 92233720368547758070}"#)
            .unwrap();
        let price = v.get("price").unwrap();
        assert_eq!(serde_json::to_value(price).unwrap(), json!("150.00"));
        assert_eq!(v.get("rate"), Some(&Value::decimal("150").unwrap()));
        assert_eq!(v.get("big"), Some(&Value::decimal("92233720368547758070").unwrap()));
    }

    #[test]
    fn tagged_objects_become_typed_values() {
        let v = Value::from_json_str(
            r#"{"issued": {"$date": "2023-10-27"}, "total": {"$decimal": "1177.50"}}"#,
        )
        .unwrap();
        assert_eq!(
            v.get("issued"),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2023, 10, 27).unwrap()))
        );
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            json!({"issued": "2023-10-27", "total": "1177.50"})
        );
    }

    #[test]
    fn malformed_tag_is_rejected() {
        let err = Value::from_json_str(r#"{"d": {"$date": "27/10/2023"}}"#).unwrap_err();
        assert!(matches!(err, ForgeError::Data(_)));
    }

    #[test]
    fn unknown_single_key_object_stays_a_map() {
        let v = Value::from_json_str(r#"{"$other": "x"}"#).unwrap();
        assert_eq!(v.get("$other"), Some(&Value::from("x")));
    }

    #[test]
    fn object_keys_keep_document_order() {
        let v = Value::from_json_str(r#"{"zeta": 1, "alpha": {"b": true, "a": null}, "mid": "x"}"#)
            .unwrap();
        let Value::Map(entries) = &v else { panic!("expected a map") };
        assert_eq!(entries.keys().collect::<Vec<_>>(), ["zeta", "alpha", "mid"]);
        assert_eq!(
            serde_json::to_string(&v).unwrap(),
            r#"{"zeta":1,"alpha":{"b":true,"a":null},"mid":"x"}"#
        );
    }

    #[test]
    fn list_index_lookup() {
        let v = Value::list(vec!["a", "b"]);
        assert_eq!(v.get("1"), Some(&Value::from("b")));
        assert_eq!(v.get("9"), None);
        assert_eq!(v.get("x"), None);
    }

    #[test]
    fn datetimes_serialize_as_iso_text() {
        let v = Value::from_json_str(r#"{"$datetime": "2023-10-27T09:30:00"}"#).unwrap();
        assert_eq!(serde_json::to_value(&v).unwrap(), json!("2023-10-27T09:30:00"));
    }
}
