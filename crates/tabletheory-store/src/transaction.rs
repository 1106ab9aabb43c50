//! `TransactionBuilder`: multi-operation atomic bundles (spec §4.J).

use std::collections::BTreeMap;
use std::sync::Arc;

use tabletheory_core::expr::{BoolOp, ExpressionBuilder, Operator};
use tabletheory_core::registry::Metadata;
use tabletheory_core::AttributeValue;

use crate::client::{StoreClient, TransactWriteOperation};
use crate::error::{Result, TableTheoryError};

const MAX_OPERATIONS: usize = 100;

/// Builds a condition expression in its own placeholder namespace, so each
/// operation in a transaction is independently parseable.
fn build_condition(
    clauses: &[(String, Operator, Vec<AttributeValue>, BoolOp)],
) -> Result<(Option<String>, BTreeMap<String, String>, BTreeMap<String, AttributeValue>)> {
    let mut builder = ExpressionBuilder::new();
    for (store_name, op, operands, combinator) in clauses {
        builder.add_clause(store_name, *op, operands.clone(), *combinator)?;
    }
    Ok((builder.render(), builder.names().clone(), builder.values().clone()))
}

/// Produces a well-formed `attribute_not_exists(pk)` condition.
pub fn if_not_exists(pk_store_name: &str) -> (Option<String>, BTreeMap<String, String>, BTreeMap<String, AttributeValue>) {
    build_condition(&[(pk_store_name.to_string(), Operator::NotExists, vec![], BoolOp::And)])
        .expect("NotExists arity is always valid")
}

/// Produces a well-formed `attribute_exists(pk)` condition.
pub fn if_exists(pk_store_name: &str) -> (Option<String>, BTreeMap<String, String>, BTreeMap<String, AttributeValue>) {
    build_condition(&[(pk_store_name.to_string(), Operator::Exists, vec![], BoolOp::And)])
        .expect("Exists arity is always valid")
}

/// Produces a well-formed `version = v` condition.
pub fn at_version(version_store_name: &str, expected: i64) -> (Option<String>, BTreeMap<String, String>, BTreeMap<String, AttributeValue>) {
    build_condition(&[(
        version_store_name.to_string(),
        Operator::Eq,
        vec![AttributeValue::N(expected.to_string())],
        BoolOp::And,
    )])
    .expect("Eq arity is always valid")
}

/// Accumulates up to 100 Put/Update/Delete/ConditionCheck operations and
/// submits them as one atomic bundle. Consumed on `submit`.
pub struct TransactionBuilder {
    store: Arc<dyn StoreClient>,
    operations: Vec<TransactWriteOperation>,
}

impl TransactionBuilder {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            operations: Vec::new(),
        }
    }

    fn check_capacity(&self) -> Result<()> {
        if self.operations.len() >= MAX_OPERATIONS {
            return Err(TableTheoryError::InvalidInput(format!(
                "transaction cannot exceed {MAX_OPERATIONS} operations"
            )));
        }
        Ok(())
    }

    pub fn put(
        mut self,
        table_name: impl Into<String>,
        item: BTreeMap<String, AttributeValue>,
        condition_expression: Option<String>,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    ) -> Result<Self> {
        self.check_capacity()?;
        self.operations.push(TransactWriteOperation::Put {
            table_name: table_name.into(),
            item,
            condition_expression,
            expression_attribute_names,
            expression_attribute_values,
        });
        Ok(self)
    }

    pub fn update(
        mut self,
        table_name: impl Into<String>,
        key: BTreeMap<String, AttributeValue>,
        update_expression: String,
        condition_expression: Option<String>,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    ) -> Result<Self> {
        self.check_capacity()?;
        self.operations.push(TransactWriteOperation::Update {
            table_name: table_name.into(),
            key,
            update_expression,
            condition_expression,
            expression_attribute_names,
            expression_attribute_values,
        });
        Ok(self)
    }

    pub fn delete(
        mut self,
        table_name: impl Into<String>,
        key: BTreeMap<String, AttributeValue>,
        condition_expression: Option<String>,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    ) -> Result<Self> {
        self.check_capacity()?;
        self.operations.push(TransactWriteOperation::Delete {
            table_name: table_name.into(),
            key,
            condition_expression,
            expression_attribute_names,
            expression_attribute_values,
        });
        Ok(self)
    }

    pub fn condition_check(
        mut self,
        table_name: impl Into<String>,
        key: BTreeMap<String, AttributeValue>,
        condition_expression: String,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    ) -> Result<Self> {
        self.check_capacity()?;
        self.operations.push(TransactWriteOperation::ConditionCheck {
            table_name: table_name.into(),
            key,
            condition_expression,
            expression_attribute_names,
            expression_attribute_values,
        });
        Ok(self)
    }

    /// Submits the bundle atomically, consuming the builder. On
    /// cancellation, the store client reports the first failing operation's
    /// index and a mapped reason as [`TableTheoryError::Transaction`];
    /// a conditional-check failure at the top level maps to
    /// [`TableTheoryError::ConditionFailed`].
    pub async fn submit(self) -> Result<()> {
        if self.operations.is_empty() {
            return Err(TableTheoryError::InvalidInput("transaction has no operations".into()));
        }
        self.store.transact_write_items(self.operations).await
    }

    /// Borrows the unmarshalled metadata's table name for convenience when
    /// composing operations inline (not required — callers may also just
    /// pass `metadata.table_name.clone()` directly).
    pub fn table_name_of(metadata: &Metadata) -> String {
        metadata.table_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    fn key(pk: &str) -> BTreeMap<String, AttributeValue> {
        let mut m = BTreeMap::new();
        m.insert("PK".to_string(), AttributeValue::S(pk.to_string()));
        m.insert("SK".to_string(), AttributeValue::S("LOCK".to_string()));
        m
    }

    #[tokio::test]
    async fn atomic_bundle_fails_whole_on_condition_check() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());

        let mut names = BTreeMap::new();
        names.insert("#n1".to_string(), "lease_token".to_string());
        let mut values = BTreeMap::new();
        values.insert(":v1".to_string(), AttributeValue::S("tok1".to_string()));

        let builder = TransactionBuilder::new(store.clone())
            .condition_check("leases", key("CACHE#A"), "#n1 = :v1".to_string(), names, values)
            .unwrap()
            .put(
                "metadata",
                {
                    let mut m = BTreeMap::new();
                    m.insert("PK".to_string(), AttributeValue::S("META#1".to_string()));
                    m
                },
                None,
                BTreeMap::new(),
                BTreeMap::new(),
            )
            .unwrap();

        let err = builder.submit().await.unwrap_err();
        assert!(matches!(err, TableTheoryError::Transaction(_)));

        let metadata_item = store
            .get_item(
                "metadata",
                &{
                    let mut m = BTreeMap::new();
                    m.insert("PK".to_string(), AttributeValue::S("META#1".to_string()));
                    m
                },
                false,
            )
            .await
            .unwrap();
        assert!(metadata_item.is_none());
    }

    #[tokio::test]
    async fn rejects_over_capacity() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let mut builder = TransactionBuilder::new(store);
        for i in 0..MAX_OPERATIONS {
            builder = builder
                .condition_check(
                    "leases",
                    key(&format!("K{i}")),
                    "attribute_exists(#n1)".to_string(),
                    {
                        let mut n = BTreeMap::new();
                        n.insert("#n1".to_string(), "PK".to_string());
                        n
                    },
                    BTreeMap::new(),
                )
                .unwrap();
        }
        let err = builder
            .condition_check(
                "leases",
                key("K_overflow"),
                "attribute_exists(#n1)".to_string(),
                BTreeMap::new(),
                BTreeMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidInput(_)));
    }
}
