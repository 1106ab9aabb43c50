//! Opaque, versioned, index-bound pagination cursor (spec §4.G).

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::encoding::AttributeValue;
use crate::error::{Result, TableTheoryError};

const CURSOR_VERSION: &str = "1";

/// Cursor direction. Only `Next` exists today; the field is carried on the
/// wire so a future backward-pagination mode doesn't need a format bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Next,
}

/// Decoded cursor contents.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorData {
    pub index: String,
    pub direction: Direction,
    pub last_key: BTreeMap<String, AttributeValue>,
}

#[derive(Serialize, Deserialize)]
struct WireCursor {
    v: String,
    index: String,
    dir: Direction,
    key: BTreeMap<String, WireAttributeValue>,
}

/// Serde-friendly tagged rendering of [`AttributeValue`], matching the
/// on-wire cursor format bit-for-bit (`{"S":"..."}`, `{"N":"..."}`, …).
#[derive(Serialize, Deserialize)]
enum WireAttributeValue {
    S(String),
    N(String),
    B(#[serde(with = "base64_bytes")] Vec<u8>),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    M(BTreeMap<String, WireAttributeValue>),
    L(Vec<WireAttributeValue>),
    #[serde(rename = "SS")]
    Ss(Vec<String>),
    #[serde(rename = "NS")]
    Ns(Vec<String>),
    #[serde(rename = "BS")]
    Bs(Vec<String>),
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

impl From<&AttributeValue> for WireAttributeValue {
    fn from(v: &AttributeValue) -> Self {
        match v {
            AttributeValue::S(s) => Self::S(s.clone()),
            AttributeValue::N(n) => Self::N(n.clone()),
            AttributeValue::B(b) => Self::B(b.clone()),
            AttributeValue::Bool(b) => Self::Bool(*b),
            AttributeValue::Null => Self::Null(true),
            AttributeValue::M(m) => Self::M(m.iter().map(|(k, v)| (k.clone(), v.into())).collect()),
            AttributeValue::L(l) => Self::L(l.iter().map(Into::into).collect()),
            AttributeValue::Ss(s) => Self::Ss(s.clone()),
            AttributeValue::Ns(n) => Self::Ns(n.clone()),
            AttributeValue::Bs(b) => Self::Bs(b.iter().map(|x| base64::engine::general_purpose::STANDARD.encode(x)).collect()),
        }
    }
}

impl From<WireAttributeValue> for AttributeValue {
    fn from(v: WireAttributeValue) -> Self {
        match v {
            WireAttributeValue::S(s) => Self::S(s),
            WireAttributeValue::N(n) => Self::N(n),
            WireAttributeValue::B(b) => Self::B(b),
            WireAttributeValue::Bool(b) => Self::Bool(b),
            WireAttributeValue::Null(_) => Self::Null,
            WireAttributeValue::M(m) => Self::M(m.into_iter().map(|(k, v)| (k, v.into())).collect()),
            WireAttributeValue::L(l) => Self::L(l.into_iter().map(Into::into).collect()),
            WireAttributeValue::Ss(s) => Self::Ss(s),
            WireAttributeValue::Ns(n) => Self::Ns(n),
            WireAttributeValue::Bs(b) => Self::Bs(
                b.iter()
                    .map(|x| base64::engine::general_purpose::STANDARD.decode(x).unwrap_or_default())
                    .collect(),
            ),
        }
    }
}

/// Encodes a last-evaluated-key into an opaque cursor string: stable-order
/// JSON, base64url without padding.
pub fn encode(last_key: &BTreeMap<String, AttributeValue>, index_name: &str, direction: Direction) -> Result<String> {
    let wire = WireCursor {
        v: CURSOR_VERSION.to_string(),
        index: index_name.to_string(),
        dir: direction,
        key: last_key.iter().map(|(k, v)| (k.clone(), v.into())).collect(),
    };
    let json = serde_json::to_vec(&wire)
        .map_err(|e| TableTheoryError::InvalidCursor(format!("failed to serialize cursor: {e}")))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json))
}

/// Decodes a cursor, rejecting unknown versions or malformed payloads.
/// Does not itself check the index binding (§8 invariant 4) — that's left
/// to the caller, who knows the query's current index; see
/// [`CursorData`]'s `index` field.
pub fn decode(cursor: &str) -> Result<CursorData> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| TableTheoryError::InvalidCursor(format!("malformed base64: {e}")))?;
    let wire: WireCursor = serde_json::from_slice(&bytes)
        .map_err(|e| TableTheoryError::InvalidCursor(format!("malformed cursor payload: {e}")))?;
    if wire.v != CURSOR_VERSION {
        return Err(TableTheoryError::InvalidCursor(format!("unknown cursor version {:?}", wire.v)));
    }
    Ok(CursorData {
        index: wire.index,
        direction: wire.dir,
        last_key: wire.key.into_iter().map(|(k, v)| (k, v.into())).collect(),
    })
}

/// Enforces the index-binding invariant: a cursor minted under one index
/// cannot be replayed against another.
pub fn check_index_binding(cursor: &CursorData, current_index: &str) -> Result<()> {
    if cursor.index != current_index {
        return Err(TableTheoryError::InvalidOperator(format!(
            "cursor was produced for index {:?}, not {current_index:?}",
            cursor.index
        )));
    }
    Ok(())
}
