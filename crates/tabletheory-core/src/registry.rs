//! Model descriptors, `Metadata`, and the §3 invariants (spec §4.C).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::encoding::AttributeValue;
use crate::error::{Result, TableTheoryError};
use crate::naming::{self, to_store_name, NamingConvention};

/// A field's logical wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValueType {
    S,
    N,
    B,
    #[serde(rename = "BOOL")]
    Bool,
    M,
    L,
    #[serde(rename = "SS")]
    Ss,
    #[serde(rename = "NS")]
    Ns,
    #[serde(rename = "BS")]
    Bs,
    Null,
}

impl ValueType {
    /// True for the three set kinds (SS/NS/BS).
    pub fn is_set_kind(self) -> bool {
        matches!(self, Self::Ss | Self::Ns | Self::Bs)
    }

    /// Tag used for empty-set/empty-value encoding lookups.
    pub fn matching_attribute(self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (Self::S, AttributeValue::S(_))
                | (Self::N, AttributeValue::N(_))
                | (Self::B, AttributeValue::B(_))
                | (Self::Bool, AttributeValue::Bool(_))
                | (Self::M, AttributeValue::M(_))
                | (Self::L, AttributeValue::L(_))
                | (Self::Ss, AttributeValue::Ss(_))
                | (Self::Ns, AttributeValue::Ns(_))
                | (Self::Bs, AttributeValue::Bs(_))
                | (Self::Null, AttributeValue::Null)
        )
    }
}

/// Index kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexType {
    Primary,
    Gsi,
    Lsi,
}

/// What an index projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectionType {
    All,
    KeysOnly,
    Include,
}

/// A field's role on one named index: whether it's that index's partition
/// or sort key, and whether the index is sparse on this field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRole {
    pub is_pk: bool,
    pub is_sk: bool,
    pub is_sparse: bool,
}

/// One field's full metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub app_name: String,
    pub store_name: String,
    pub value_type: ValueType,

    #[serde(default)]
    pub is_set: bool,
    #[serde(default)]
    pub is_json_blob: bool,
    #[serde(default)]
    pub is_binary: bool,
    #[serde(default)]
    pub is_encrypted: bool,
    #[serde(default)]
    pub omit_empty: bool,

    #[serde(default)]
    pub is_pk: bool,
    #[serde(default)]
    pub is_sk: bool,
    #[serde(default)]
    pub is_version: bool,
    #[serde(default)]
    pub is_ttl: bool,
    #[serde(default)]
    pub is_created_at: bool,
    #[serde(default)]
    pub is_updated_at: bool,

    #[serde(default)]
    pub index_roles: HashMap<String, IndexRole>,
}

impl FieldMetadata {
    /// Starts building a field named `app_name` with wire type `value_type`,
    /// deriving `store_name` from `convention`.
    pub fn new(app_name: impl Into<String>, value_type: ValueType, convention: NamingConvention) -> Result<Self> {
        let app_name = app_name.into();
        let store_name = to_store_name(&app_name, convention)?;
        Ok(Self {
            app_name,
            store_name,
            value_type,
            is_set: false,
            is_json_blob: false,
            is_binary: false,
            is_encrypted: false,
            omit_empty: false,
            is_pk: false,
            is_sk: false,
            is_version: false,
            is_ttl: false,
            is_created_at: false,
            is_updated_at: false,
            index_roles: HashMap::new(),
        })
    }

    fn validate(&self) -> Result<()> {
        let is_any_key = self.is_pk
            || self.is_sk
            || self.index_roles.values().any(|r| r.is_pk || r.is_sk);
        naming::validate_store_name(&self.store_name, is_any_key)?;

        if self.is_set && !self.value_type.is_set_kind() {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: is_set requires a sequence type",
                self.app_name
            )));
        }
        if self.is_json_blob && self.value_type != ValueType::S {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: is_json_blob requires value_type S",
                self.app_name
            )));
        }
        if self.is_binary && self.value_type != ValueType::B {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: is_binary requires value_type B",
                self.app_name
            )));
        }
        let modifier_count =
            [self.is_set, self.is_json_blob, self.is_binary].iter().filter(|b| **b).count();
        if modifier_count > 1 {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: is_set/is_json_blob/is_binary are mutually exclusive",
                self.app_name
            )));
        }
        if self.is_version && self.value_type != ValueType::N {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: version fields must be numeric",
                self.app_name
            )));
        }
        if self.is_ttl && self.value_type != ValueType::N {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: ttl fields must be numeric",
                self.app_name
            )));
        }
        if (self.is_created_at || self.is_updated_at) && self.value_type != ValueType::N {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: timestamp fields must be numeric (epoch seconds)",
                self.app_name
            )));
        }
        if self.is_encrypted && is_any_key {
            return Err(TableTheoryError::InvalidModel(format!(
                "field {}: a field may be encrypted xor appear as a key",
                self.app_name
            )));
        }
        Ok(())
    }
}

/// One named index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSchema {
    pub name: String,
    pub index_type: IndexType,
    pub partition_field: String,
    pub sort_field: Option<String>,
    #[serde(default = "default_projection")]
    pub projection_type: ProjectionType,
    #[serde(default)]
    pub projected_fields: Vec<String>,
}

fn default_projection() -> ProjectionType {
    ProjectionType::All
}

impl IndexSchema {
    /// Infers [`IndexType`] from a name carrying the `lsi-`/`lsi_` prefix
    /// convention; anything else is a GSI.
    pub fn infer_type(name: &str) -> IndexType {
        if name.starts_with("lsi-") || name.starts_with("lsi_") {
            IndexType::Lsi
        } else {
            IndexType::Gsi
        }
    }
}

/// The normalized, immutable schema for one registered model.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub table_name: String,
    pub naming_convention: NamingConvention,
    pub partition_key: String,
    pub sort_key: Option<String>,
    pub indexes: Vec<IndexSchema>,
    pub fields_by_app_name: HashMap<String, FieldMetadata>,
    pub fields_by_store_name: HashMap<String, String>,
    pub version_field: Option<String>,
    pub ttl_field: Option<String>,
    pub created_at_field: Option<String>,
    pub updated_at_field: Option<String>,
}

/// The language-agnostic descriptor form (native builder or DMS YAML), prior
/// to registry validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub table_name: Option<String>,
    #[serde(default)]
    pub naming_convention: Option<NamingConventionDescriptor>,
    pub fields: Vec<FieldMetadata>,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
}

/// DMS-serializable mirror of [`NamingConvention`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConventionDescriptor {
    CamelCase,
    SnakeCase,
}

impl From<NamingConventionDescriptor> for NamingConvention {
    fn from(d: NamingConventionDescriptor) -> Self {
        match d {
            NamingConventionDescriptor::CamelCase => NamingConvention::CamelCase,
            NamingConventionDescriptor::SnakeCase => NamingConvention::SnakeCase,
        }
    }
}

/// Parses a DMS v0.1 YAML descriptor into a [`ModelDescriptor`].
pub fn parse_dms_yaml(yaml: &str) -> Result<ModelDescriptor> {
    serde_yaml::from_str(yaml)
        .map_err(|e| TableTheoryError::InvalidModel(format!("malformed DMS descriptor: {e}")))
}

/// Pluralizes a type name with a simple English rule, used when a
/// descriptor supplies no explicit `table_name`.
pub fn pluralize(type_name: &str) -> String {
    if type_name.ends_with('y')
        && !type_name
            .chars()
            .rev()
            .nth(1)
            .map(|c| "aeiou".contains(c.to_ascii_lowercase()))
            .unwrap_or(false)
    {
        format!("{}ies", &type_name[..type_name.len() - 1])
    } else if type_name.ends_with('s')
        || type_name.ends_with('x')
        || type_name.ends_with("ch")
        || type_name.ends_with("sh")
    {
        format!("{type_name}es")
    } else {
        format!("{type_name}s")
    }
}

impl Metadata {
    /// Validates a descriptor against every §3 invariant and builds the
    /// normalized [`Metadata`].
    pub fn from_descriptor(type_name: &str, descriptor: ModelDescriptor) -> Result<Self> {
        let naming_convention: NamingConvention = descriptor
            .naming_convention
            .map(Into::into)
            .unwrap_or_default();
        let table_name = descriptor
            .table_name
            .unwrap_or_else(|| pluralize(type_name));

        let mut fields_by_app_name = HashMap::new();
        let mut fields_by_store_name = HashMap::new();
        let mut partition_key = None;
        let mut sort_key = None;
        let mut version_field = None;
        let mut ttl_field = None;
        let mut created_at_field = None;
        let mut updated_at_field = None;

        for field in descriptor.fields {
            field.validate()?;

            if let Some(existing) = fields_by_store_name.get(&field.store_name) {
                return Err(TableTheoryError::InvalidModel(format!(
                    "store name {:?} used by both {existing:?} and {:?}",
                    field.store_name, field.app_name
                )));
            }

            if field.is_pk {
                if partition_key.is_some() {
                    return Err(TableTheoryError::DuplicatePrimaryKey(format!(
                        "{type_name}: more than one partition key field"
                    )));
                }
                partition_key = Some(field.app_name.clone());
            }
            if field.is_sk {
                if sort_key.is_some() {
                    return Err(TableTheoryError::DuplicatePrimaryKey(format!(
                        "{type_name}: more than one sort key field"
                    )));
                }
                sort_key = Some(field.app_name.clone());
            }
            if field.is_version {
                if version_field.is_some() {
                    return Err(TableTheoryError::InvalidModel(format!(
                        "{type_name}: more than one version field"
                    )));
                }
                version_field = Some(field.app_name.clone());
            }
            if field.is_ttl {
                if ttl_field.is_some() {
                    return Err(TableTheoryError::InvalidModel(format!(
                        "{type_name}: more than one ttl field"
                    )));
                }
                ttl_field = Some(field.app_name.clone());
            }
            if field.is_created_at {
                if created_at_field.is_some() {
                    return Err(TableTheoryError::InvalidModel(format!(
                        "{type_name}: more than one created_at field"
                    )));
                }
                created_at_field = Some(field.app_name.clone());
            }
            if field.is_updated_at {
                if updated_at_field.is_some() {
                    return Err(TableTheoryError::InvalidModel(format!(
                        "{type_name}: more than one updated_at field"
                    )));
                }
                updated_at_field = Some(field.app_name.clone());
            }

            fields_by_store_name.insert(field.store_name.clone(), field.app_name.clone());
            fields_by_app_name.insert(field.app_name.clone(), field);
        }

        let partition_key = partition_key.ok_or_else(|| {
            TableTheoryError::InvalidModel(format!("{type_name}: missing partition key field"))
        })?;

        let mut indexes = descriptor.indexes;
        for index in &mut indexes {
            if !fields_by_app_name.contains_key(&index.partition_field) {
                return Err(TableTheoryError::InvalidModel(format!(
                    "index {}: partition field {:?} not found",
                    index.name, index.partition_field
                )));
            }
            if let Some(sort_field) = &index.sort_field {
                if !fields_by_app_name.contains_key(sort_field) {
                    return Err(TableTheoryError::InvalidModel(format!(
                        "index {}: sort field {:?} not found",
                        index.name, sort_field
                    )));
                }
            }
            if index.index_type == IndexType::Lsi && index.sort_field.is_none() {
                return Err(TableTheoryError::InvalidModel(format!(
                    "index {}: LSIs require their own sort key",
                    index.name
                )));
            }
            if index.index_type == IndexType::Lsi && index.partition_field != partition_key {
                return Err(TableTheoryError::InvalidModel(format!(
                    "index {}: LSIs must share the table partition key",
                    index.name
                )));
            }
            if index.projection_type == ProjectionType::Include && index.projected_fields.is_empty() {
                return Err(TableTheoryError::InvalidModel(format!(
                    "index {}: INCLUDE projection requires projected_fields",
                    index.name
                )));
            }
        }

        for index in &indexes {
            if index.index_type == IndexType::Lsi {
                if let Some(sort_field) = &index.sort_field {
                    if let Some(field) = fields_by_app_name.get(sort_field) {
                        if field.is_encrypted {
                            return Err(TableTheoryError::InvalidModel(format!(
                                "field {sort_field}: encrypted fields cannot be an LSI sort key"
                            )));
                        }
                    }
                }
            }
        }

        Ok(Self {
            table_name,
            naming_convention,
            partition_key,
            sort_key,
            indexes,
            fields_by_app_name,
            fields_by_store_name,
            version_field,
            ttl_field,
            created_at_field,
            updated_at_field,
        })
    }

    /// Looks up a field by its application name.
    pub fn field(&self, app_name: &str) -> Result<&FieldMetadata> {
        self.fields_by_app_name
            .get(app_name)
            .ok_or_else(|| TableTheoryError::InvalidModel(format!("unknown field {app_name:?}")))
    }

    /// Looks up a field by its store (wire) name.
    pub fn field_by_store_name(&self, store_name: &str) -> Result<&FieldMetadata> {
        let app_name = self
            .fields_by_store_name
            .get(store_name)
            .ok_or_else(|| TableTheoryError::InvalidModel(format!("unknown store name {store_name:?}")))?;
        self.field(app_name)
    }

    /// Returns the named index, or the implicit primary index if `name` is
    /// `None`.
    pub fn index(&self, name: Option<&str>) -> Option<&IndexSchema> {
        match name {
            Some(name) => self.indexes.iter().find(|i| i.name == name),
            None => self.indexes.iter().find(|i| i.index_type == IndexType::Primary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk_field() -> FieldMetadata {
        let mut f = FieldMetadata::new("pk", ValueType::S, NamingConvention::CamelCase).unwrap();
        f.is_pk = true;
        f
    }

    #[test]
    fn requires_partition_key() {
        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![],
            indexes: vec![],
        };
        let err = Metadata::from_descriptor("User", descriptor).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidModel(_)));
    }

    #[test]
    fn rejects_duplicate_partition_keys() {
        let mut second = FieldMetadata::new("otherPk", ValueType::S, NamingConvention::CamelCase).unwrap();
        second.is_pk = true;
        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk_field(), second],
            indexes: vec![],
        };
        let err = Metadata::from_descriptor("User", descriptor).unwrap_err();
        assert!(matches!(err, TableTheoryError::DuplicatePrimaryKey(_)));
    }

    #[test]
    fn rejects_encrypted_key_field() {
        let mut f = pk_field();
        f.is_encrypted = true;
        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![f],
            indexes: vec![],
        };
        let err = Metadata::from_descriptor("User", descriptor).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidModel(_)));
    }

    #[test]
    fn rejects_encrypted_lsi_sort_key() {
        let mut sort = FieldMetadata::new("secret", ValueType::S, NamingConvention::CamelCase).unwrap();
        sort.is_encrypted = true;
        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk_field(), sort],
            indexes: vec![IndexSchema {
                name: "lsi-secret".into(),
                index_type: IndexType::Lsi,
                partition_field: "pk".into(),
                sort_field: Some("secret".into()),
                projection_type: ProjectionType::All,
                projected_fields: vec![],
            }],
        };
        let err = Metadata::from_descriptor("User", descriptor).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidModel(_)));
    }

    #[test]
    fn infers_lsi_from_prefix() {
        assert_eq!(IndexSchema::infer_type("lsi-by-date"), IndexType::Lsi);
        assert_eq!(IndexSchema::infer_type("gsi-email"), IndexType::Gsi);
        assert_eq!(IndexSchema::infer_type("by-email"), IndexType::Gsi);
    }

    #[test]
    fn pluralizes_simple_and_y_ending_names() {
        assert_eq!(pluralize("User"), "Users");
        assert_eq!(pluralize("Category"), "Categories");
        assert_eq!(pluralize("Box"), "Boxes");
    }

    #[test]
    fn parses_dms_yaml() {
        let yaml = r#"
table_name: users
fields:
  - app_name: pk
    store_name: PK
    value_type: S
    is_pk: true
"#;
        let descriptor = parse_dms_yaml(yaml).unwrap();
        assert_eq!(descriptor.table_name.as_deref(), Some("users"));
        assert_eq!(descriptor.fields.len(), 1);
    }
}
