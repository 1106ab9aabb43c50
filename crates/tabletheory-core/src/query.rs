//! Fluent predicate accumulation and `CompiledQuery` planning (spec §4.H,
//! compile-time half).

use std::collections::BTreeMap;

use crate::encoding::AttributeValue;
use crate::error::{Result, TableTheoryError};
use crate::expr::{BoolOp, ExpressionBuilder, Operator};
use crate::index::{select_index, RequiredKeys};
use crate::registry::{IndexType, Metadata};

/// One predicate supplied by the caller before compilation. Whether it
/// lands in the key-condition or filter expression is decided at
/// `compile()` time, once an index is chosen.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub app_field: String,
    pub operator: Operator,
    pub operands: Vec<AttributeValue>,
    pub combinator: BoolOp,
}

/// The wire-level plan produced by [`QueryBuilder::compile`].
#[derive(Debug)]
pub struct CompiledQuery {
    pub table_name: String,
    pub index_name: Option<String>,
    pub key_condition_expression: Option<String>,
    pub filter_expression: Option<String>,
    pub projection_expression: Option<String>,
    pub expression_attribute_names: BTreeMap<String, String>,
    pub expression_attribute_values: BTreeMap<String, AttributeValue>,
    pub limit: Option<u32>,
    pub scan_forward: bool,
    pub exclusive_start_key: Option<BTreeMap<String, AttributeValue>>,
    pub consistent_read: bool,
    pub segment: Option<u32>,
    pub total_segments: Option<u32>,
}

/// Accumulates predicates for one query, then compiles them into a
/// [`CompiledQuery`]. Not safe to share across threads or reuse after
/// `compile` (mirrors the builder-consumed-on-execute convention the
/// execution layer applies to `execute`).
#[derive(Debug, Default)]
pub struct QueryBuilder {
    predicates: Vec<Predicate>,
    projection: Vec<String>,
    limit: Option<u32>,
    scan_forward: bool,
    exclusive_start_key: Option<BTreeMap<String, AttributeValue>>,
    consistent_read: bool,
    requested_index: Option<String>,
    allow_scan_fallback: bool,
    segment: Option<(u32, u32)>,
}

impl QueryBuilder {
    /// Starts an empty builder; scans forward by default.
    pub fn new() -> Self {
        Self {
            scan_forward: true,
            ..Self::default()
        }
    }

    /// Adds a predicate combined with `AND`.
    pub fn and_where(mut self, app_field: impl Into<String>, operator: Operator, operands: Vec<AttributeValue>) -> Self {
        self.predicates.push(Predicate {
            app_field: app_field.into(),
            operator,
            operands,
            combinator: BoolOp::And,
        });
        self
    }

    /// Adds a predicate combined with `OR`.
    pub fn or_where(mut self, app_field: impl Into<String>, operator: Operator, operands: Vec<AttributeValue>) -> Self {
        self.predicates.push(Predicate {
            app_field: app_field.into(),
            operator,
            operands,
            combinator: BoolOp::Or,
        });
        self
    }

    /// Lists application field names to project; compiled to store names
    /// at `compile()` time.
    pub fn projection(mut self, fields: Vec<String>) -> Self {
        self.projection = fields;
        self
    }

    /// Caps the number of items fetched.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets scan direction; `false` scans backward (descending sort key).
    pub fn scan_forward(mut self, forward: bool) -> Self {
        self.scan_forward = forward;
        self
    }

    /// Resumes from a decoded cursor's last key.
    pub fn exclusive_start_key(mut self, key: BTreeMap<String, AttributeValue>) -> Self {
        self.exclusive_start_key = Some(key);
        self
    }

    /// Requests a strongly consistent read. Rejected at `compile()` time if
    /// the chosen index is a GSI.
    pub fn consistent_read(mut self) -> Self {
        self.consistent_read = true;
        self
    }

    /// Pins the index by name instead of letting the selector choose.
    pub fn use_index(mut self, name: impl Into<String>) -> Self {
        self.requested_index = Some(name.into());
        self
    }

    /// Allows falling back to a table Scan when no index satisfies the
    /// predicates, instead of failing with `NoSuitableIndex`.
    pub fn allow_scan_fallback(mut self) -> Self {
        self.allow_scan_fallback = true;
        self
    }

    /// Requests segment `segment` of `total_segments` for a parallel scan.
    pub fn segment(mut self, segment: u32, total_segments: u32) -> Self {
        self.segment = Some((segment, total_segments));
        self
    }

    /// Compiles the accumulated predicates into a [`CompiledQuery`],
    /// segregating filters from key-conditions against the selected index's
    /// key attributes, and allocating placeholders in independent
    /// namespaces per expression kind.
    pub fn compile(self, meta: &Metadata) -> Result<CompiledQuery> {
        let pk_predicate = self
            .predicates
            .iter()
            .find(|p| p.operator == Operator::Eq && is_partition_candidate(meta, &p.app_field));

        let index = if let Some(name) = &self.requested_index {
            meta.index(Some(name))
                .ok_or_else(|| TableTheoryError::InvalidModel(format!("unknown index {name:?}")))?
        } else if let Some(pk_pred) = pk_predicate {
            let sort_pred = self
                .predicates
                .iter()
                .find(|p| p.app_field != pk_pred.app_field);
            let required = RequiredKeys {
                partition: pk_pred.app_field.clone(),
                sort: sort_pred.map(|p| p.app_field.clone()),
                sort_op: sort_pred.map(|p| p.operator),
            };
            match select_index(meta, &required) {
                Some(index) => index,
                None if self.allow_scan_fallback => {
                    return self.compile_as_scan(meta);
                }
                None => return Err(TableTheoryError::NoSuitableIndex),
            }
        } else if self.allow_scan_fallback {
            return self.compile_as_scan(meta);
        } else {
            return Err(TableTheoryError::InvalidModel(
                "Query requires a partition-key equality predicate".into(),
            ));
        };

        if self.consistent_read && index.index_type == IndexType::Gsi {
            return Err(TableTheoryError::InvalidOperator(
                "consistent_read is not permitted on a GSI".into(),
            ));
        }

        let key_fields: Vec<&str> = [Some(index.partition_field.as_str()), index.sort_field.as_deref()]
            .into_iter()
            .flatten()
            .collect();

        for predicate in &self.predicates {
            if meta.field(&predicate.app_field)?.is_encrypted {
                return Err(TableTheoryError::EncryptedFieldNotQueryable(predicate.app_field.clone()));
            }
        }

        // Built in two passes, one builder per expression kind, each seeded
        // from the previous so placeholders allocated across kinds never
        // collide once their `names`/`values` maps are merged below.
        let mut key_builder = ExpressionBuilder::new();
        for predicate in self.predicates.iter().filter(|p| key_fields.contains(&p.app_field.as_str())) {
            let field = meta.field(&predicate.app_field)?;
            key_builder.add_clause(&field.store_name, predicate.operator, predicate.operands.clone(), predicate.combinator)?;
        }

        let mut filter_builder = ExpressionBuilder::new();
        filter_builder.seed_from(&key_builder);
        for predicate in self.predicates.iter().filter(|p| !key_fields.contains(&p.app_field.as_str())) {
            let field = meta.field(&predicate.app_field)?;
            filter_builder.add_clause(&field.store_name, predicate.operator, predicate.operands.clone(), predicate.combinator)?;
        }

        let mut projection_builder = ExpressionBuilder::new();

        let mut names: BTreeMap<String, String> = BTreeMap::new();
        let mut values: BTreeMap<String, AttributeValue> = BTreeMap::new();
        names.extend(key_builder.names().clone());
        names.extend(filter_builder.names().clone());
        values.extend(key_builder.values().clone());
        values.extend(filter_builder.values().clone());

        let projection_expression = if self.projection.is_empty() {
            None
        } else {
            projection_builder.seed_from(&filter_builder);
            let mut pieces = Vec::with_capacity(self.projection.len());
            for app_field in &self.projection {
                let field = meta.field(app_field)?;
                pieces.push(projection_builder.name_placeholder(&field.store_name));
            }
            names.extend(projection_builder.names().clone());
            Some(pieces.join(", "))
        };

        let (segment, total_segments) = match self.segment {
            Some((s, t)) => (Some(s), Some(t)),
            None => (None, None),
        };

        Ok(CompiledQuery {
            table_name: meta.table_name.clone(),
            index_name: (index.index_type != IndexType::Primary).then(|| index.name.clone()),
            key_condition_expression: key_builder.render(),
            filter_expression: filter_builder.render(),
            projection_expression,
            expression_attribute_names: names,
            expression_attribute_values: values,
            limit: self.limit,
            scan_forward: self.scan_forward,
            exclusive_start_key: self.exclusive_start_key,
            consistent_read: self.consistent_read,
            segment,
            total_segments,
        })
    }

    fn compile_as_scan(self, meta: &Metadata) -> Result<CompiledQuery> {
        let mut filter_builder = ExpressionBuilder::new();
        for predicate in &self.predicates {
            let field = meta.field(&predicate.app_field)?;
            if field.is_encrypted {
                return Err(TableTheoryError::EncryptedFieldNotQueryable(predicate.app_field.clone()));
            }
            filter_builder.add_clause(
                &field.store_name,
                predicate.operator,
                predicate.operands.clone(),
                predicate.combinator,
            )?;
        }
        let (segment, total_segments) = match self.segment {
            Some((s, t)) => (Some(s), Some(t)),
            None => (None, None),
        };
        Ok(CompiledQuery {
            table_name: meta.table_name.clone(),
            index_name: None,
            key_condition_expression: None,
            filter_expression: filter_builder.render(),
            projection_expression: None,
            expression_attribute_names: filter_builder.names().clone(),
            expression_attribute_values: filter_builder.values().clone(),
            limit: self.limit,
            scan_forward: self.scan_forward,
            exclusive_start_key: self.exclusive_start_key,
            consistent_read: self.consistent_read,
            segment,
            total_segments,
        })
    }
}

fn is_partition_candidate(meta: &Metadata, app_field: &str) -> bool {
    meta.indexes.iter().any(|i| i.partition_field == app_field)
}

/// Emits `total_segments` [`QueryBuilder`]s for a parallel scan, one per
/// segment. Callers run each independently and merge results without
/// assuming any particular order.
pub fn parallel_scan_plans(base: QueryBuilder, total_segments: u32) -> Vec<QueryBuilder>
where
{
    (0..total_segments)
        .map(|segment| {
            let mut builder = QueryBuilder::new();
            builder.predicates = base.predicates.clone();
            builder.projection = base.projection.clone();
            builder.limit = base.limit;
            builder.scan_forward = base.scan_forward;
            builder.consistent_read = base.consistent_read;
            builder.allow_scan_fallback = true;
            builder.segment = Some((segment, total_segments));
            builder
        })
        .collect()
}

impl Clone for Predicate {
    fn clone(&self) -> Self {
        Self {
            app_field: self.app_field.clone(),
            operator: self.operator,
            operands: self.operands.clone(),
            combinator: self.combinator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NamingConvention;
    use crate::registry::{FieldMetadata, IndexSchema, ModelDescriptor, ProjectionType, ValueType};

    fn user_metadata() -> Metadata {
        let mut pk = FieldMetadata::new("pk", ValueType::S, NamingConvention::CamelCase).unwrap();
        pk.is_pk = true;
        let mut sk = FieldMetadata::new("sk", ValueType::S, NamingConvention::CamelCase).unwrap();
        sk.is_sk = true;
        let tag = FieldMetadata::new("tag", ValueType::S, NamingConvention::CamelCase).unwrap();

        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk, sk, tag],
            indexes: vec![IndexSchema {
                name: "primary".into(),
                index_type: IndexType::Primary,
                partition_field: "pk".into(),
                sort_field: Some("sk".into()),
                projection_type: ProjectionType::All,
                projected_fields: vec![],
            }],
        };
        Metadata::from_descriptor("User", descriptor).unwrap()
    }

    #[test]
    fn requires_partition_equality() {
        let meta = user_metadata();
        let builder = QueryBuilder::new().and_where("tag", Operator::Eq, vec![AttributeValue::S("X".into())]);
        let err = builder.compile(&meta).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidModel(_)));
    }

    #[test]
    fn segregates_filter_from_key_condition() {
        let meta = user_metadata();
        let builder = QueryBuilder::new()
            .and_where("pk", Operator::Eq, vec![AttributeValue::S("USER#1".into())])
            .and_where("tag", Operator::Exists, vec![]);
        let compiled = builder.compile(&meta).unwrap();
        assert!(compiled.key_condition_expression.is_some());
        assert!(compiled.filter_expression.is_some());
        assert!(compiled.filter_expression.unwrap().contains("attribute_exists"));
    }

    #[test]
    fn rejects_consistent_read_on_gsi() {
        let mut pk = FieldMetadata::new("pk", ValueType::S, NamingConvention::CamelCase).unwrap();
        pk.is_pk = true;
        let email = FieldMetadata::new("email", ValueType::S, NamingConvention::CamelCase).unwrap();
        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk, email],
            indexes: vec![IndexSchema {
                name: "gsi-email".into(),
                index_type: IndexType::Gsi,
                partition_field: "email".into(),
                sort_field: None,
                projection_type: ProjectionType::All,
                projected_fields: vec![],
            }],
        };
        let meta = Metadata::from_descriptor("User", descriptor).unwrap();
        let builder = QueryBuilder::new()
            .and_where("email", Operator::Eq, vec![AttributeValue::S("a@b.com".into())])
            .consistent_read();
        let err = builder.compile(&meta).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidOperator(_)));
    }

    #[test]
    fn rejects_encrypted_field_predicate() {
        let mut pk = FieldMetadata::new("pk", ValueType::S, NamingConvention::CamelCase).unwrap();
        pk.is_pk = true;
        let mut secret = FieldMetadata::new("secret", ValueType::S, NamingConvention::CamelCase).unwrap();
        secret.is_encrypted = true;
        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk, secret],
            indexes: vec![IndexSchema {
                name: "primary".into(),
                index_type: IndexType::Primary,
                partition_field: "pk".into(),
                sort_field: None,
                projection_type: ProjectionType::All,
                projected_fields: vec![],
            }],
        };
        let meta = Metadata::from_descriptor("User", descriptor).unwrap();
        let builder = QueryBuilder::new()
            .and_where("pk", Operator::Eq, vec![AttributeValue::S("USER#1".into())])
            .and_where("secret", Operator::Eq, vec![AttributeValue::S("x".into())]);
        let err = builder.compile(&meta).unwrap_err();
        assert!(matches!(err, TableTheoryError::EncryptedFieldNotQueryable(_)));
    }

    #[test]
    fn parallel_scan_emits_one_plan_per_segment() {
        let plans = parallel_scan_plans(QueryBuilder::new(), 4);
        assert_eq!(plans.len(), 4);
        assert_eq!(plans[2].segment, Some((2, 4)));
    }
}
