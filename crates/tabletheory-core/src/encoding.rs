//! The tagged attribute-value wire model (spec §4.B).

use std::collections::BTreeMap;

use crate::error::{Result, TableTheoryError};

/// A single store-level attribute value, tagged by logical type.
///
/// Mirrors the tagged-union encoding used on the wire by DynamoDB-class
/// stores: every scalar and collection is carried under an explicit tag
/// rather than inferred from a native JSON type, so that e.g. a numeric
/// string and a number are never confused.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// UTF-8 string.
    S(String),
    /// Arbitrary-precision number, carried as its canonical decimal string.
    N(String),
    /// Opaque binary payload.
    B(Vec<u8>),
    /// Boolean.
    Bool(bool),
    /// Explicit null.
    Null,
    /// Map of attribute name to value.
    M(BTreeMap<String, AttributeValue>),
    /// Ordered list of values.
    L(Vec<AttributeValue>),
    /// String set.
    Ss(Vec<String>),
    /// Number set, each member a canonical decimal string.
    Ns(Vec<String>),
    /// Binary set.
    Bs(Vec<Vec<u8>>),
}

impl AttributeValue {
    /// Short tag name used in error messages and DMS descriptors.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::B(_) => "B",
            Self::Bool(_) => "BOOL",
            Self::Null => "NULL",
            Self::M(_) => "M",
            Self::L(_) => "L",
            Self::Ss(_) => "SS",
            Self::Ns(_) => "NS",
            Self::Bs(_) => "BS",
        }
    }

    /// Borrows the string payload, or errors with the mismatched tag.
    pub fn as_s(&self) -> Result<&str> {
        match self {
            Self::S(v) => Ok(v),
            other => Err(mismatch("S", other)),
        }
    }

    /// Borrows the number payload (still a string) and parses it as `f64`.
    pub fn as_n(&self) -> Result<f64> {
        match self {
            Self::N(v) => v.parse::<f64>().map_err(|e| {
                TableTheoryError::InvalidAttributeValue(format!("not a number: {v} ({e})"))
            }),
            other => Err(mismatch("N", other)),
        }
    }

    /// Borrows the number payload as its raw decimal string.
    pub fn as_n_str(&self) -> Result<&str> {
        match self {
            Self::N(v) => Ok(v),
            other => Err(mismatch("N", other)),
        }
    }

    /// Borrows the binary payload.
    pub fn as_b(&self) -> Result<&[u8]> {
        match self {
            Self::B(v) => Ok(v),
            other => Err(mismatch("B", other)),
        }
    }

    /// Borrows the boolean payload.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(v) => Ok(*v),
            other => Err(mismatch("BOOL", other)),
        }
    }

    /// Borrows the map payload.
    pub fn as_m(&self) -> Result<&BTreeMap<String, AttributeValue>> {
        match self {
            Self::M(v) => Ok(v),
            other => Err(mismatch("M", other)),
        }
    }

    /// Borrows the list payload.
    pub fn as_l(&self) -> Result<&[AttributeValue]> {
        match self {
            Self::L(v) => Ok(v),
            other => Err(mismatch("L", other)),
        }
    }

    /// True for [`AttributeValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Encodes a JSON value into its canonical `AttributeValue` rendering.
    ///
    /// Objects become `M`, arrays become `L`, strings become `S`, numbers
    /// become `N` via their canonical decimal rendering, booleans become
    /// `BOOL`, and `null` becomes `Null`. Set types (`SS`/`NS`/`BS`) have no
    /// JSON counterpart and are never produced here; callers that need a
    /// set construct one directly from a field's declared [`super::registry::ValueType`].
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::N(n.to_string()),
            serde_json::Value::String(s) => Self::S(s.clone()),
            serde_json::Value::Array(items) => Self::L(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::M(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Decodes back to a plain JSON value. Sets are rendered as JSON arrays,
    /// losing their set-ness (acceptable for debug/display paths only;
    /// round-tripping through a model goes through the typed `unmarshal`
    /// path instead).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::N(n) => serde_json::Number::from_f64(n.parse().unwrap_or_default())
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::S(s) => serde_json::Value::String(s.clone()),
            Self::B(b) => {
                serde_json::Value::String(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b))
            }
            Self::L(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::M(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::Ss(items) => {
                serde_json::Value::Array(items.iter().cloned().map(serde_json::Value::String).collect())
            }
            Self::Ns(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|n| {
                        serde_json::Number::from_f64(n.parse().unwrap_or_default())
                            .map(serde_json::Value::Number)
                            .unwrap_or(serde_json::Value::Null)
                    })
                    .collect(),
            ),
            Self::Bs(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|b| {
                        serde_json::Value::String(base64::Engine::encode(
                            &base64::engine::general_purpose::STANDARD,
                            b,
                        ))
                    })
                    .collect(),
            ),
        }
    }
}

fn mismatch(expected: &'static str, got: &AttributeValue) -> TableTheoryError {
    TableTheoryError::InvalidAttributeValue(format!(
        "expected {expected}, got {}",
        got.type_tag()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalar_json() {
        let v = serde_json::json!({"name": "ada", "age": 36, "active": true, "meta": null});
        let av = AttributeValue::from_json(&v);
        let m = av.as_m().unwrap();
        assert_eq!(m.get("name").unwrap().as_s().unwrap(), "ada");
        assert_eq!(m.get("age").unwrap().as_n().unwrap(), 36.0);
        assert!(m.get("active").unwrap().as_bool().unwrap());
        assert!(m.get("meta").unwrap().is_null());
    }

    #[test]
    fn list_round_trips() {
        let v = serde_json::json!([1, 2, 3]);
        let av = AttributeValue::from_json(&v);
        assert_eq!(av.as_l().unwrap().len(), 3);
    }

    #[test]
    fn accessor_mismatch_reports_tag() {
        let av = AttributeValue::S("x".into());
        let err = av.as_n().unwrap_err();
        match err {
            TableTheoryError::InvalidAttributeValue(msg) => assert!(msg.contains('S')),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn type_tags_match_wire_names() {
        assert_eq!(AttributeValue::S("x".into()).type_tag(), "S");
        assert_eq!(AttributeValue::Ss(vec![]).type_tag(), "SS");
        assert_eq!(AttributeValue::Bs(vec![]).type_tag(), "BS");
    }
}
