//! Item-level marshal/unmarshal and lifecycle stamping (spec §4.D).

use std::collections::BTreeMap;

use crate::encoding::AttributeValue;
use crate::error::{Result, TableTheoryError};
use crate::registry::Metadata;

/// Injectable wall-clock source, so lifecycle stamping is deterministic in
/// tests.
pub trait Clock: Send + Sync {
    /// Current time as epoch seconds.
    fn now(&self) -> i64;
}

/// [`Clock`] backed by [`std::time::SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A fixed instant, for tests that need deterministic timestamps.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0
    }
}

/// An item as a map from application field name to raw application value,
/// pre-encoding.
pub type AppItem = BTreeMap<String, serde_json::Value>;

/// An item as a map from store (wire) attribute name to tagged value,
/// post-encoding. This is what crosses the store-client boundary.
pub type WireItem = BTreeMap<String, AttributeValue>;

/// Encodes one application value through a field's modifiers into its
/// tagged wire form. Exposed beyond this module so the update builder can
/// encode `add`/`delete`/list operands through the same set/blob handling
/// as a full `put`, rather than a bare [`AttributeValue::from_json`].
pub fn encode_field(meta: &crate::registry::FieldMetadata, value: &serde_json::Value) -> Result<AttributeValue> {
    if meta.is_json_blob {
        let canonical = serde_json::to_string(value).map_err(|e| {
            TableTheoryError::InvalidValueType(format!("field {}: unserializable JSON: {e}", meta.app_name))
        })?;
        return Ok(AttributeValue::S(canonical));
    }

    let av = AttributeValue::from_json(value);
    let is_empty = match &av {
        AttributeValue::S(s) => s.is_empty(),
        AttributeValue::B(b) => b.is_empty(),
        AttributeValue::Ss(s) => s.is_empty(),
        AttributeValue::Ns(s) => s.is_empty(),
        AttributeValue::Bs(s) => s.is_empty(),
        AttributeValue::Null => true,
        _ => false,
    };

    if meta.is_set {
        // `[]` on a set-typed attribute MUST encode as NULL, never an empty
        // SS/NS/BS, regardless of omit_empty.
        if is_empty {
            return Ok(AttributeValue::Null);
        }
        let items = av.as_l()?;
        return match meta.value_type {
            crate::registry::ValueType::Ss => Ok(AttributeValue::Ss(
                items.iter().map(|v| v.as_s().map(str::to_string)).collect::<Result<_>>()?,
            )),
            crate::registry::ValueType::Ns => Ok(AttributeValue::Ns(
                items
                    .iter()
                    .map(|v| v.as_n().map(|n| n.to_string()))
                    .collect::<Result<_>>()?,
            )),
            crate::registry::ValueType::Bs => Ok(AttributeValue::Bs(
                items.iter().map(|v| v.as_b().map(<[u8]>::to_vec)).collect::<Result<_>>()?,
            )),
            other => Err(TableTheoryError::InvalidValueType(format!(
                "field {}: is_set with non-set value_type {other:?}",
                meta.app_name
            ))),
        };
    }

    if is_empty && (meta.omit_empty || matches!(av, AttributeValue::Null)) {
        return Ok(AttributeValue::Null);
    }

    Ok(av)
}

/// Decodes one tagged wire value back through a field's modifiers into its
/// application-level JSON rendering.
fn decode_field(meta: &crate::registry::FieldMetadata, value: &AttributeValue) -> Result<serde_json::Value> {
    if value.is_null() {
        return Ok(serde_json::Value::Null);
    }
    if meta.is_json_blob {
        let s = value.as_s()?;
        return serde_json::from_str(s)
            .map_err(|e| TableTheoryError::InvalidAttributeValue(format!("field {}: malformed JSON blob: {e}", meta.app_name)));
    }
    if !meta.value_type.matching_attribute(value) {
        return Err(TableTheoryError::InvalidAttributeValue(format!(
            "field {}: expected {:?}, got {}",
            meta.app_name,
            meta.value_type,
            value.type_tag()
        )));
    }
    Ok(value.to_json())
}

/// Builds an item map containing only the key attributes (§4.D
/// `marshal_key`). `key` maps application field names to raw values; it
/// must contain the partition key and, if the model has one, the sort key.
pub fn marshal_key(meta: &Metadata, key: &AppItem) -> Result<WireItem> {
    let mut out = WireItem::new();

    let pk_field = meta.field(&meta.partition_key)?;
    let pk_value = key.get(&meta.partition_key).ok_or_else(|| {
        TableTheoryError::MissingPrimaryKey(format!("missing partition key {:?}", meta.partition_key))
    })?;
    out.insert(pk_field.store_name.clone(), encode_field(pk_field, pk_value)?);

    if let Some(sort_key) = &meta.sort_key {
        let sk_field = meta.field(sort_key)?;
        if let Some(sk_value) = key.get(sort_key) {
            out.insert(sk_field.store_name.clone(), encode_field(sk_field, sk_value)?);
        }
    }

    Ok(out)
}

/// Applies lifecycle stamping and encodes a full item for a first write
/// (§4.D `marshal_put`): `created_at`/`updated_at` are set to `now`,
/// `version` (if present) is set to 0. Encrypted fields are expected to
/// have already been run through the encryption component by the caller
/// (`tabletheory-store`), arriving here as envelope maps.
pub fn marshal_put(meta: &Metadata, item: &AppItem, clock: &dyn Clock) -> Result<WireItem> {
    let mut out = WireItem::new();
    let now = clock.now();

    for (app_name, value) in item {
        let field = meta.fields_by_app_name.get(app_name).ok_or_else(|| {
            TableTheoryError::InvalidModel(format!("unknown field {app_name:?} in item"))
        })?;
        out.insert(field.store_name.clone(), encode_field(field, value)?);
    }

    if let Some(created_at) = &meta.created_at_field {
        let field = meta.field(created_at)?;
        out.insert(field.store_name.clone(), AttributeValue::N(now.to_string()));
    }
    if let Some(updated_at) = &meta.updated_at_field {
        let field = meta.field(updated_at)?;
        out.insert(field.store_name.clone(), AttributeValue::N(now.to_string()));
    }
    if let Some(version) = &meta.version_field {
        let field = meta.field(version)?;
        out.insert(field.store_name.clone(), AttributeValue::N("0".to_string()));
    }

    if out.get(meta.field(&meta.partition_key)?.store_name.as_str()).is_none() {
        return Err(TableTheoryError::MissingPrimaryKey(format!(
            "missing partition key {:?}",
            meta.partition_key
        )));
    }

    Ok(out)
}

/// Encodes the changed-field subset of an update (§4.D `marshal_update`),
/// stamping `updated_at`. Lifecycle fields other than `updated_at` are left
/// untouched by this step; `version` bumping is the update builder's job
/// (it emits its own `ADD version :one` clause).
pub fn marshal_update(
    meta: &Metadata,
    patch: &AppItem,
    changed_fields: &[String],
    clock: &dyn Clock,
) -> Result<WireItem> {
    let mut out = WireItem::new();

    for app_name in changed_fields {
        let field = meta.fields_by_app_name.get(app_name).ok_or_else(|| {
            TableTheoryError::InvalidModel(format!("unknown field {app_name:?} in update"))
        })?;
        let value = patch
            .get(app_name)
            .ok_or_else(|| TableTheoryError::InvalidModel(format!("changed field {app_name:?} missing a value")))?;
        out.insert(field.store_name.clone(), encode_field(field, value)?);
    }

    if let Some(updated_at) = &meta.updated_at_field {
        let field = meta.field(updated_at)?;
        out.insert(field.store_name.clone(), AttributeValue::N(clock.now().to_string()));
    }

    Ok(out)
}

/// Decodes a wire item back into application field names and values.
/// Unknown attributes are dropped unless `keep_extras` is set, in which
/// case they're preserved verbatim under their store-level name.
pub fn unmarshal(meta: &Metadata, wire: &WireItem, keep_extras: bool) -> Result<(AppItem, Option<WireItem>)> {
    let mut app_item = AppItem::new();
    let mut extras = WireItem::new();

    for (store_name, value) in wire {
        match meta.field_by_store_name(store_name) {
            Ok(field) => {
                app_item.insert(field.app_name.clone(), decode_field(field, value)?);
            }
            Err(_) => {
                if keep_extras {
                    extras.insert(store_name.clone(), value.clone());
                }
            }
        }
    }

    Ok((app_item, keep_extras.then_some(extras)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NamingConvention;
    use crate::registry::{FieldMetadata, Metadata, ModelDescriptor, ValueType};

    fn user_metadata() -> Metadata {
        let mut pk = FieldMetadata::new("pk", ValueType::S, NamingConvention::CamelCase).unwrap();
        pk.is_pk = true;
        pk.store_name = "PK".into();
        let mut sk = FieldMetadata::new("sk", ValueType::S, NamingConvention::CamelCase).unwrap();
        sk.is_sk = true;
        sk.store_name = "SK".into();
        let mut nickname = FieldMetadata::new("nickname", ValueType::S, NamingConvention::CamelCase).unwrap();
        nickname.omit_empty = true;
        let mut tags = FieldMetadata::new("tags", ValueType::Ss, NamingConvention::CamelCase).unwrap();
        tags.is_set = true;
        tags.omit_empty = true;
        let mut created_at = FieldMetadata::new("createdAt", ValueType::N, NamingConvention::CamelCase).unwrap();
        created_at.is_created_at = true;
        let mut updated_at = FieldMetadata::new("updatedAt", ValueType::N, NamingConvention::CamelCase).unwrap();
        updated_at.is_updated_at = true;
        let mut version = FieldMetadata::new("version", ValueType::N, NamingConvention::CamelCase).unwrap();
        version.is_version = true;

        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk, sk, nickname, tags, created_at, updated_at, version],
            indexes: vec![],
        };
        Metadata::from_descriptor("User", descriptor).unwrap()
    }

    #[test]
    fn marshal_put_stamps_lifecycle() {
        let meta = user_metadata();
        let clock = FixedClock(1000);
        let mut item = AppItem::new();
        item.insert("pk".into(), serde_json::json!("USER#1"));
        item.insert("sk".into(), serde_json::json!("PROFILE"));
        item.insert("nickname".into(), serde_json::json!("Al"));
        item.insert("tags".into(), serde_json::json!(["a", "b"]));

        let wire = marshal_put(&meta, &item, &clock).unwrap();
        assert_eq!(wire.get("createdAt").unwrap().as_n().unwrap(), 1000.0);
        assert_eq!(wire.get("version").unwrap().as_n_str().unwrap(), "0");
        assert_eq!(wire.get("tags").unwrap().type_tag(), "SS");
    }

    #[test]
    fn marshal_put_missing_pk_errors() {
        let meta = user_metadata();
        let clock = FixedClock(1000);
        let item = AppItem::new();
        let err = marshal_put(&meta, &item, &clock).unwrap_err();
        assert!(matches!(err, TableTheoryError::MissingPrimaryKey(_)));
    }

    #[test]
    fn empty_set_encodes_as_null() {
        let meta = user_metadata();
        let clock = FixedClock(1000);
        let mut item = AppItem::new();
        item.insert("pk".into(), serde_json::json!("USER#1"));
        item.insert("sk".into(), serde_json::json!("PROFILE"));
        item.insert("tags".into(), serde_json::json!([]));

        let wire = marshal_put(&meta, &item, &clock).unwrap();
        assert!(wire.get("tags").unwrap().is_null());
    }

    #[test]
    fn round_trips_non_lifecycle_fields() {
        let meta = user_metadata();
        let clock = FixedClock(1000);
        let mut item = AppItem::new();
        item.insert("pk".into(), serde_json::json!("USER#1"));
        item.insert("sk".into(), serde_json::json!("PROFILE"));
        item.insert("nickname".into(), serde_json::json!("Al"));

        let wire = marshal_put(&meta, &item, &clock).unwrap();
        let (app, extras) = unmarshal(&meta, &wire, false).unwrap();
        assert_eq!(app.get("nickname").unwrap(), "Al");
        assert_eq!(app.get("pk").unwrap(), "USER#1");
        assert!(extras.is_none());
    }

    #[test]
    fn marshal_update_stamps_updated_at_only() {
        let meta = user_metadata();
        let clock = FixedClock(2000);
        let mut patch = AppItem::new();
        patch.insert("nickname".into(), serde_json::json!("Alice"));

        let wire = marshal_update(&meta, &patch, &["nickname".to_string()], &clock).unwrap();
        assert_eq!(wire.get("nickname").unwrap().as_s().unwrap(), "Alice");
        assert_eq!(wire.get("updatedAt").unwrap().as_n().unwrap(), 2000.0);
        assert!(wire.get("createdAt").is_none());
    }

    #[test]
    fn unmarshal_rejects_type_mismatch() {
        let meta = user_metadata();
        let mut wire = WireItem::new();
        wire.insert("nickname".into(), AttributeValue::N("5".into()));
        let err = unmarshal(&meta, &wire, false).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidAttributeValue(_)));
    }
}
