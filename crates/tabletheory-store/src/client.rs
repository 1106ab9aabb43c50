//! Store-client and KMS-client capability sets (spec §6).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tabletheory_core::AttributeValue;

use crate::error::Result;

/// One operation inside a `TransactWriteItems`-style bundle (spec §4.J).
#[derive(Debug, Clone)]
pub enum TransactWriteOperation {
    Put {
        table_name: String,
        item: BTreeMap<String, AttributeValue>,
        condition_expression: Option<String>,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    },
    Update {
        table_name: String,
        key: BTreeMap<String, AttributeValue>,
        update_expression: String,
        condition_expression: Option<String>,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    },
    Delete {
        table_name: String,
        key: BTreeMap<String, AttributeValue>,
        condition_expression: Option<String>,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    },
    ConditionCheck {
        table_name: String,
        key: BTreeMap<String, AttributeValue>,
        condition_expression: String,
        expression_attribute_names: BTreeMap<String, String>,
        expression_attribute_values: BTreeMap<String, AttributeValue>,
    },
}

/// Input to a single-item conditional write or delete.
#[derive(Debug, Clone, Default)]
pub struct ConditionalWriteInput {
    pub condition_expression: Option<String>,
    pub expression_attribute_names: BTreeMap<String, String>,
    pub expression_attribute_values: BTreeMap<String, AttributeValue>,
}

/// Input to `UpdateItem`.
#[derive(Debug, Clone)]
pub struct UpdateItemInput {
    pub table_name: String,
    pub key: BTreeMap<String, AttributeValue>,
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: BTreeMap<String, String>,
    pub expression_attribute_values: BTreeMap<String, AttributeValue>,
    pub return_values: ReturnValues,
}

/// Which item image `UpdateItem` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValues {
    #[default]
    None,
    AllNew,
    AllOld,
    UpdatedNew,
    UpdatedOld,
}

/// Output of `UpdateItem`, carrying whichever image `return_values`
/// requested (absent for `ReturnValues::None`).
#[derive(Debug, Clone, Default)]
pub struct UpdateItemOutput {
    pub item: Option<BTreeMap<String, AttributeValue>>,
}

/// Input to `Query`/`Scan`.
#[derive(Debug, Clone)]
pub struct QueryInput {
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

/// Output of `Query`/`Scan`: one page of items plus an optional resume key.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub items: Vec<BTreeMap<String, AttributeValue>>,
    pub last_evaluated_key: Option<BTreeMap<String, AttributeValue>>,
}

/// Minimal table descriptor for `CreateTable`/`DescribeTable`.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub table_name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
    pub read_capacity_units: u32,
    pub write_capacity_units: u32,
}

/// The store-client capability set the core consumes from the runtime
/// (spec §6): `GetItem, PutItem, UpdateItem, DeleteItem, Query, Scan,
/// BatchGetItem, BatchWriteItem, TransactWriteItems, CreateTable,
/// DescribeTable, DeleteTable, ListTables`. No inheritance implied — a
/// single trait expresses the whole open capability set.
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn get_item(
        &self,
        table_name: &str,
        key: &BTreeMap<String, AttributeValue>,
        consistent_read: bool,
    ) -> Result<Option<BTreeMap<String, AttributeValue>>>;

    async fn put_item(
        &self,
        table_name: &str,
        item: BTreeMap<String, AttributeValue>,
        condition: ConditionalWriteInput,
    ) -> Result<()>;

    async fn update_item(&self, input: UpdateItemInput) -> Result<UpdateItemOutput>;

    async fn delete_item(
        &self,
        table_name: &str,
        key: &BTreeMap<String, AttributeValue>,
        condition: ConditionalWriteInput,
    ) -> Result<()>;

    async fn query(&self, input: QueryInput) -> Result<QueryOutput>;

    async fn scan(&self, input: QueryInput) -> Result<QueryOutput>;

    async fn batch_get_item(
        &self,
        table_name: &str,
        keys: Vec<BTreeMap<String, AttributeValue>>,
    ) -> Result<Vec<BTreeMap<String, AttributeValue>>>;

    async fn batch_write_item(
        &self,
        table_name: &str,
        puts: Vec<BTreeMap<String, AttributeValue>>,
        deletes: Vec<BTreeMap<String, AttributeValue>>,
    ) -> Result<()>;

    async fn transact_write_items(&self, operations: Vec<TransactWriteOperation>) -> Result<()>;

    async fn create_table(&self, descriptor: TableDescriptor) -> Result<()>;

    async fn describe_table(&self, table_name: &str) -> Result<Option<TableDescriptor>>;

    async fn delete_table(&self, table_name: &str) -> Result<()>;

    async fn list_tables(&self) -> Result<Vec<String>>;
}

/// A freshly minted data key: the plaintext key material and its
/// KMS-wrapped form. `plaintext` MUST be zeroized by the caller once the
/// encrypt/decrypt it was requested for completes.
pub struct DataKey {
    pub plaintext: Vec<u8>,
    pub encrypted: Vec<u8>,
}

/// The KMS capability set the encryption component consumes (spec §6):
/// `GenerateDataKey`, `Decrypt`.
#[async_trait]
pub trait KmsClient: Send + Sync {
    async fn generate_data_key(&self, key_arn: &str) -> Result<DataKey>;

    async fn decrypt(&self, key_arn: &str, ciphertext_blob: &[u8]) -> Result<Vec<u8>>;
}
