//! The public façade: `DB`, `Query`, `UpdateBuilder`, `TransactionBuilder`
//! composition (spec §4.N).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tabletheory_core::marshal::{self, AppItem, WireItem};
use tabletheory_core::query::QueryBuilder as CoreQueryBuilder;
use tabletheory_core::registry::{Metadata, ModelDescriptor};
use tabletheory_core::AttributeValue;

use crate::client::{ConditionalWriteInput, StoreClient};
use crate::config::Config;
use crate::encryption::Encryptor;
use crate::error::{Result, TableTheoryError};
use crate::query::{execute, ExecutedPage};
use crate::transaction::TransactionBuilder;
use crate::update::UpdateBuilder;

/// Read-mostly model registry: registrations serialize on a single writer
/// lock, reads are lock-free after first registration (spec §5).
#[derive(Default)]
struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<Metadata>>>,
}

impl ModelRegistry {
    fn register(&self, type_name: &str, descriptor: ModelDescriptor) -> Result<Arc<Metadata>> {
        if let Some(existing) = self.models.read().unwrap().get(type_name) {
            return Ok(existing.clone());
        }

        let metadata = Arc::new(Metadata::from_descriptor(type_name, descriptor)?);
        let mut write_guard = self.models.write().unwrap();
        // Re-check under the writer lock: another caller may have won the
        // race to register this type while we were building `metadata`.
        if let Some(existing) = write_guard.get(type_name) {
            return Ok(existing.clone());
        }
        for (other_name, other_meta) in write_guard.iter() {
            if other_meta.table_name == metadata.table_name && other_name != type_name {
                return Err(TableTheoryError::InvalidModel(format!(
                    "table name {:?} already used by model {other_name:?}",
                    metadata.table_name
                )));
            }
        }
        write_guard.insert(type_name.to_string(), metadata.clone());
        Ok(metadata)
    }

    fn get(&self, type_name: &str) -> Result<Arc<Metadata>> {
        self.models
            .read()
            .unwrap()
            .get(type_name)
            .cloned()
            .ok_or_else(|| TableTheoryError::InvalidModel(format!("model {type_name:?} is not registered")))
    }
}

/// The connection handle. Immutable after construction; `with_context`
/// yields a new handle sharing the same registry and store client.
pub struct DB {
    store: Arc<dyn StoreClient>,
    registry: Arc<ModelRegistry>,
    config: Arc<Config>,
    encryptor: Option<Arc<Encryptor>>,
}

impl DB {
    /// Builds a new `DB` over `store` with `config`.
    pub fn new(store: Arc<dyn StoreClient>, config: Config) -> Self {
        let encryptor = match (&config.kms_key_arn, &config.kms_client) {
            (Some(arn), Some(kms)) => Some(Arc::new(Encryptor::new(kms.clone(), arn.clone(), config.encryption_rand.clone()))),
            _ => None,
        };
        Self {
            store,
            registry: Arc::new(ModelRegistry::default()),
            config: Arc::new(config),
            encryptor,
        }
    }

    /// Clones this handle, sharing the same registry and store client —
    /// the Rust-native substitute for a per-request context clone.
    pub fn with_context(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            encryptor: self.encryptor.clone(),
        }
    }

    /// Registers `type_name` from `descriptor`; subsequent registrations of
    /// the same type no-op. A conflicting table name for a different type
    /// fails.
    pub fn register_model(&self, type_name: &str, descriptor: ModelDescriptor) -> Result<()> {
        if descriptor
            .fields
            .iter()
            .any(|f| f.is_encrypted)
            && self.encryptor.is_none()
        {
            return Err(TableTheoryError::EncryptionNotConfigured(type_name.to_string()));
        }
        self.registry.register(type_name, descriptor)?;
        Ok(())
    }

    fn metadata(&self, type_name: &str) -> Result<Arc<Metadata>> {
        self.registry.get(type_name)
    }

    /// Creates a new item, applying lifecycle stamping. `if_not_exists`
    /// conditions the write on the partition key not already existing.
    pub async fn create(&self, type_name: &str, item: &AppItem, if_not_exists: bool) -> Result<()> {
        let metadata = self.metadata(type_name)?;
        let wire = self.marshal_for_write(&metadata, item).await?;

        let condition = if if_not_exists {
            let pk_store_name = metadata.field(&metadata.partition_key)?.store_name.clone();
            let mut names = BTreeMap::new();
            names.insert("#n1".to_string(), pk_store_name);
            ConditionalWriteInput {
                condition_expression: Some("attribute_not_exists(#n1)".to_string()),
                expression_attribute_names: names,
                expression_attribute_values: BTreeMap::new(),
            }
        } else {
            ConditionalWriteInput::default()
        };

        self.store.put_item(&metadata.table_name, wire, condition).await
    }

    async fn marshal_for_write(&self, metadata: &Metadata, item: &AppItem) -> Result<WireItem> {
        let mut wire = marshal::marshal_put(metadata, item, self.config.clock.as_ref())?;
        for (app_name, field) in &metadata.fields_by_app_name {
            if !field.is_encrypted {
                continue;
            }
            if let Some(plaintext) = item.get(app_name).and_then(|v| v.as_str()) {
                let encryptor = self
                    .encryptor
                    .as_ref()
                    .ok_or_else(|| TableTheoryError::EncryptionNotConfigured(app_name.clone()))?;
                wire.insert(field.store_name.clone(), encryptor.encrypt(&field.store_name, plaintext).await?);
            }
        }
        Ok(wire)
    }

    /// Reads one item by key; decrypts any encrypted attributes.
    pub async fn get(&self, type_name: &str, key: &AppItem, consistent_read: bool) -> Result<Option<AppItem>> {
        let metadata = self.metadata(type_name)?;
        let key_wire = marshal::marshal_key(&metadata, key)?;
        let Some(wire) = self.store.get_item(&metadata.table_name, &key_wire, consistent_read).await? else {
            return Ok(None);
        };
        self.decode_item(&metadata, &wire).await
    }

    async fn decode_item(&self, metadata: &Metadata, wire: &WireItem) -> Result<Option<AppItem>> {
        let mut decrypted = wire.clone();
        for (store_name, value) in wire {
            if let Ok(field) = metadata.field_by_store_name(store_name) {
                if field.is_encrypted && !value.is_null() {
                    let encryptor = self
                        .encryptor
                        .as_ref()
                        .ok_or_else(|| TableTheoryError::EncryptionNotConfigured(field.app_name.clone()))?;
                    let plaintext = encryptor.decrypt(store_name, value).await?;
                    decrypted.insert(store_name.clone(), AttributeValue::S(plaintext));
                }
            }
        }
        let (app_item, _) = marshal::unmarshal(metadata, &decrypted, false)?;
        Ok(Some(app_item))
    }

    /// Deletes one item by key, unconditionally.
    pub async fn delete(&self, type_name: &str, key: &AppItem) -> Result<()> {
        let metadata = self.metadata(type_name)?;
        let key_wire = marshal::marshal_key(&metadata, key)?;
        self.store.delete_item(&metadata.table_name, &key_wire, ConditionalWriteInput::default()).await
    }

    /// Starts a fluent [`Query`] over `type_name`.
    pub fn query(&self, type_name: &str) -> Result<Query> {
        Ok(Query {
            metadata: self.metadata(type_name)?,
            store: self.store.clone(),
            builder: CoreQueryBuilder::new(),
            cursor: None,
        })
    }

    /// Starts an [`UpdateBuilder`] for the item keyed by `key`.
    pub fn update(&self, type_name: &str, key: &AppItem) -> Result<UpdateBuilder> {
        let metadata = self.metadata(type_name)?;
        let key_wire = marshal::marshal_key(&metadata, key)?;
        let mut builder = UpdateBuilder::new(self.store.clone(), metadata, self.config.clock.clone(), key_wire);
        if let Some(encryptor) = &self.encryptor {
            builder = builder.with_encryptor(encryptor.clone());
        }
        Ok(builder)
    }

    /// Starts a [`TransactionBuilder`] bound to this handle's store client.
    pub fn transaction(&self) -> TransactionBuilder {
        TransactionBuilder::new(self.store.clone())
    }

    /// Starts a [`crate::lease::LeaseManager`] over `table_name`.
    pub fn lease_manager(&self, table_name: impl Into<String>) -> crate::lease::LeaseManager {
        crate::lease::LeaseManager::new(
            self.store.clone(),
            table_name,
            self.config.clock.clone(),
            Arc::new(crate::lease::RandomTokenGenerator),
        )
    }

    /// Access to the underlying store client, for callers composing their
    /// own table-management calls (`CreateTable`, `ListTables`, …).
    pub fn store_client(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }
}

/// Fluent predicate accumulator bound to one model and store client; wraps
/// [`tabletheory_core::query::QueryBuilder`] with compile+execute.
pub struct Query {
    metadata: Arc<Metadata>,
    store: Arc<dyn StoreClient>,
    builder: CoreQueryBuilder,
    cursor: Option<String>,
}

impl Query {
    pub fn and_where(mut self, app_field: impl Into<String>, operator: tabletheory_core::expr::Operator, operands: Vec<serde_json::Value>) -> Self {
        self.builder = self.builder.and_where(
            app_field,
            operator,
            operands.iter().map(AttributeValue::from_json).collect(),
        );
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.builder = self.builder.limit(limit);
        self
    }

    pub fn use_index(mut self, name: impl Into<String>) -> Self {
        self.builder = self.builder.use_index(name);
        self
    }

    pub fn consistent_read(mut self) -> Self {
        self.builder = self.builder.consistent_read();
        self
    }

    pub fn allow_scan_fallback(mut self) -> Self {
        self.builder = self.builder.allow_scan_fallback();
        self
    }

    /// Resumes from a previously issued cursor. The index-binding check
    /// happens in [`Self::execute`], once `compile()` has settled on the
    /// index this query actually runs against.
    pub fn cursor(mut self, cursor_str: impl Into<String>) -> Self {
        self.cursor = Some(cursor_str.into());
        self
    }

    /// Compiles the accumulated predicates and executes against the store,
    /// decoding (and decrypting) every returned item.
    pub async fn execute(self) -> Result<(Vec<AppItem>, Option<String>, bool)> {
        let mut compiled = self.builder.compile(&self.metadata)?;

        if let Some(cursor_str) = &self.cursor {
            let current_index = compiled.index_name.as_deref().unwrap_or("primary");
            let decoded = tabletheory_core::cursor::decode(cursor_str)?;
            tabletheory_core::cursor::check_index_binding(&decoded, current_index)?;
            compiled.exclusive_start_key = Some(decoded.last_key);
        }

        let ExecutedPage { items, cursor, has_more } = execute(self.store.as_ref(), &compiled).await?;

        let mut decoded = Vec::with_capacity(items.len());
        for wire in items {
            let (app_item, _) = tabletheory_core::marshal::unmarshal(&self.metadata, &wire, false)?;
            decoded.push(app_item);
        }
        Ok((decoded, cursor, has_more))
    }
}
