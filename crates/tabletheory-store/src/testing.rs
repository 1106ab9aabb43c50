//! In-memory test doubles for [`StoreClient`] and [`KmsClient`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tabletheory_core::AttributeValue;

use crate::client::{
    ConditionalWriteInput, DataKey, KmsClient, QueryInput, QueryOutput, StoreClient, TableDescriptor,
    TransactWriteOperation, UpdateItemInput, UpdateItemOutput,
};
use crate::error::{Result, TableTheoryError};
use crate::update::apply_update_expression;

type Item = BTreeMap<String, AttributeValue>;

fn key_tuple(key: &Item) -> Vec<(String, AttributeValue)> {
    key.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn item_key(item: &Item, pk_name: &str, sk_name: Option<&str>) -> Option<Item> {
    let mut key = BTreeMap::new();
    key.insert(pk_name.to_string(), item.get(pk_name)?.clone());
    if let Some(sk_name) = sk_name {
        key.insert(sk_name.to_string(), item.get(sk_name)?.clone());
    }
    Some(key)
}

/// Splits a rendered [`tabletheory_core::expr::ExpressionBuilder`] condition
/// into its top-level `AND`-joined segments. A segment is either a single
/// clause or a parenthesized `OR` group (`render` only ever nests parens one
/// level deep, and only around `OR` groups), so splitting only needs to
/// track paren depth plus the one place " AND " appears other than as a
/// top-level combinator: inside a rendered `BETWEEN` clause.
fn split_top_level_and(expr: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut depth = 0i32;
    let mut in_between = false;

    for word in expr.split(' ') {
        if word == "AND" && depth == 0 {
            if in_between {
                current.push(word);
                in_between = false;
                continue;
            }
            segments.push(current.join(" "));
            current = Vec::new();
            continue;
        }
        if word.contains("BETWEEN") {
            in_between = true;
        }
        depth += word.matches('(').count() as i32;
        depth -= word.matches(')').count() as i32;
        current.push(word);
    }
    segments.push(current.join(" "));

    segments
}

fn resolve_name(names: &BTreeMap<String, String>, token: &str) -> String {
    names.get(token).cloned().unwrap_or_else(|| token.to_string())
}

fn compare(a: &AttributeValue, b: &AttributeValue) -> std::cmp::Ordering {
    match (a, b) {
        (AttributeValue::N(x), AttributeValue::N(y)) => x
            .parse::<f64>()
            .unwrap_or(0.0)
            .partial_cmp(&y.parse::<f64>().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal),
        (AttributeValue::S(x), AttributeValue::S(y)) => x.cmp(y),
        _ => std::cmp::Ordering::Equal,
    }
}

/// Evaluates a single rendered clause (no top-level combinator) against
/// `item`, resolving `#name`/`:value` placeholders through `names`/`values`.
fn eval_clause(clause: &str, item: Option<&Item>, names: &BTreeMap<String, String>, values: &BTreeMap<String, AttributeValue>) -> bool {
    let clause = clause.trim();

    if let Some(rest) = clause.strip_prefix("attribute_not_exists(") {
        let store_name = resolve_name(names, rest.trim_end_matches(')'));
        return item.map(|i| !i.contains_key(&store_name)).unwrap_or(true);
    }
    if let Some(rest) = clause.strip_prefix("attribute_exists(") {
        let store_name = resolve_name(names, rest.trim_end_matches(')'));
        return item.map(|i| i.contains_key(&store_name)).unwrap_or(false);
    }
    if let Some(rest) = clause.strip_prefix("begins_with(") {
        let inner = rest.trim_end_matches(')');
        let mut parts = inner.splitn(2, ", ");
        let store_name = resolve_name(names, parts.next().unwrap_or_default());
        let val_tok = parts.next().unwrap_or_default();
        let (Some(item), Some(actual), Some(val)) = (item, item.and_then(|i| i.get(&store_name)), values.get(val_tok)) else {
            return false;
        };
        let _ = item;
        return matches!((actual.as_s(), val.as_s()), (Ok(a), Ok(b)) if a.starts_with(b));
    }
    if let Some(rest) = clause.strip_prefix("contains(") {
        let inner = rest.trim_end_matches(')');
        let mut parts = inner.splitn(2, ", ");
        let store_name = resolve_name(names, parts.next().unwrap_or_default());
        let val_tok = parts.next().unwrap_or_default();
        let Some(actual) = item.and_then(|i| i.get(&store_name)) else {
            return false;
        };
        let Some(val) = values.get(val_tok) else { return false };
        return match (actual, val) {
            (AttributeValue::S(a), AttributeValue::S(b)) => a.contains(b.as_str()),
            (AttributeValue::Ss(a), _) => val.as_s().map(|b| a.iter().any(|x| x == b)).unwrap_or(false),
            _ => false,
        };
    }

    let tokens: Vec<&str> = clause.split(' ').collect();
    if tokens.len() >= 5 && tokens[1] == "BETWEEN" && tokens[3] == "AND" {
        let store_name = resolve_name(names, tokens[0]);
        let Some(actual) = item.and_then(|i| i.get(&store_name)) else {
            return false;
        };
        let (Some(lo), Some(hi)) = (values.get(tokens[2]), values.get(tokens[4])) else {
            return false;
        };
        return compare(actual, lo) != std::cmp::Ordering::Less && compare(actual, hi) != std::cmp::Ordering::Greater;
    }
    if tokens.len() >= 2 && tokens[1] == "IN" {
        let store_name = resolve_name(names, tokens[0]);
        let Some(actual) = item.and_then(|i| i.get(&store_name)) else {
            return false;
        };
        let inner = clause.splitn(2, "IN (").nth(1).unwrap_or("").trim_end_matches(')');
        return inner.split(", ").any(|tok| values.get(tok) == Some(actual));
    }
    if tokens.len() == 3 {
        let store_name = resolve_name(names, tokens[0]);
        let Some(actual) = item.and_then(|i| i.get(&store_name)) else {
            return false;
        };
        let Some(expected) = values.get(tokens[2]) else { return false };
        let ord = compare(actual, expected);
        return match tokens[1] {
            "=" => ord == std::cmp::Ordering::Equal,
            "<>" => ord != std::cmp::Ordering::Equal,
            "<" => ord == std::cmp::Ordering::Less,
            "<=" => ord != std::cmp::Ordering::Greater,
            ">" => ord == std::cmp::Ordering::Greater,
            ">=" => ord != std::cmp::Ordering::Less,
            _ => true,
        };
    }

    true
}

struct Table {
    items: Vec<Item>,
}

/// A single-process, in-memory [`StoreClient`], grounded on the teacher's
/// `SqliteStore::open_in_memory()` convention of an in-crate test double
/// rather than a mocking library. Good enough to exercise key-condition,
/// filter, conditional-write, and transaction semantics; it does not model
/// secondary index propagation delay or throttling.
pub struct MemoryStore {
    tables: Mutex<BTreeMap<String, Table>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    fn evaluate_condition(
        item: Option<&Item>,
        names: &BTreeMap<String, String>,
        values: &BTreeMap<String, AttributeValue>,
        expr: &Option<String>,
    ) -> bool {
        let Some(expr) = expr else { return true };
        // The in-memory store interprets only the clause shapes the core's
        // expression builder ever emits: a left-to-right AND chain whose
        // members are either a single clause or a parenthesized OR group.
        split_top_level_and(expr).iter().all(|segment| {
            let segment = segment.trim();
            let inner = match segment.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
                Some(inner) => inner,
                None => segment,
            };
            inner.split(" OR ").any(|clause| eval_clause(clause, item, names, values))
        })
    }

    fn table_mut<'a>(tables: &'a mut BTreeMap<String, Table>, name: &str) -> &'a mut Table {
        tables.entry(name.to_string()).or_insert_with(|| Table { items: Vec::new() })
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get_item(&self, table_name: &str, key: &Item, _consistent_read: bool) -> Result<Option<Item>> {
        let tables = self.tables.lock().unwrap();
        let Some(table) = tables.get(table_name) else {
            return Ok(None);
        };
        let key_tuple = key_tuple(key);
        Ok(table
            .items
            .iter()
            .find(|item| key_tuple.iter().all(|(k, v)| item.get(k) == Some(v)))
            .cloned())
    }

    async fn put_item(&self, table_name: &str, item: Item, condition: ConditionalWriteInput) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = Self::table_mut(&mut tables, table_name);

        let pk_name = item.keys().next().cloned().unwrap_or_default();
        let key_attrs: Vec<&String> = item.keys().take(2).collect();
        let existing_idx = table.items.iter().position(|existing| {
            key_attrs.iter().all(|k| existing.get(*k) == item.get(*k))
        });
        let _ = pk_name;

        let existing = existing_idx.map(|i| &table.items[i]);
        if !Self::evaluate_condition(
            existing,
            &condition.expression_attribute_names,
            &condition.expression_attribute_values,
            &condition.condition_expression,
        ) {
            return Err(TableTheoryError::ConditionFailed("condition expression evaluated to false".into()));
        }

        match existing_idx {
            Some(i) => table.items[i] = item,
            None => table.items.push(item),
        }
        Ok(())
    }

    async fn update_item(&self, input: UpdateItemInput) -> Result<UpdateItemOutput> {
        let mut tables = self.tables.lock().unwrap();
        let table = Self::table_mut(&mut tables, &input.table_name);

        let key_tuple = key_tuple(&input.key);
        let existing_idx = table
            .items
            .iter()
            .position(|item| key_tuple.iter().all(|(k, v)| item.get(k) == Some(v)));
        let existing = existing_idx.map(|i| table.items[i].clone());

        if !Self::evaluate_condition(
            existing.as_ref(),
            &input.expression_attribute_names,
            &input.expression_attribute_values,
            &input.condition_expression,
        ) {
            return Err(TableTheoryError::ConditionFailed("condition expression evaluated to false".into()));
        }

        let mut item = existing.clone().unwrap_or_else(|| input.key.clone());
        apply_update_expression(
            &mut item,
            &input.update_expression,
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )?;

        let old_image = existing;
        match existing_idx {
            Some(i) => table.items[i] = item.clone(),
            None => table.items.push(item.clone()),
        }

        let returned = match input.return_values {
            crate::client::ReturnValues::None => None,
            crate::client::ReturnValues::AllNew | crate::client::ReturnValues::UpdatedNew => Some(item),
            crate::client::ReturnValues::AllOld | crate::client::ReturnValues::UpdatedOld => old_image,
        };

        Ok(UpdateItemOutput { item: returned })
    }

    async fn delete_item(&self, table_name: &str, key: &Item, condition: ConditionalWriteInput) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let table = Self::table_mut(&mut tables, table_name);
        let key_tuple = key_tuple(key);
        let existing_idx = table
            .items
            .iter()
            .position(|item| key_tuple.iter().all(|(k, v)| item.get(k) == Some(v)));
        let existing = existing_idx.map(|i| &table.items[i]);

        if !Self::evaluate_condition(
            existing,
            &condition.expression_attribute_names,
            &condition.expression_attribute_values,
            &condition.condition_expression,
        ) {
            return Err(TableTheoryError::ConditionFailed("condition expression evaluated to false".into()));
        }

        if let Some(i) = existing_idx {
            table.items.remove(i);
        }
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> Result<QueryOutput> {
        self.scan(input).await
    }

    async fn scan(&self, input: QueryInput) -> Result<QueryOutput> {
        let tables = self.tables.lock().unwrap();
        let mut items: Vec<Item> = tables
            .get(&input.table_name)
            .map(|t| t.items.clone())
            .unwrap_or_default();

        items.retain(|item| {
            Self::evaluate_condition(
                Some(item),
                &input.expression_attribute_names,
                &input.expression_attribute_values,
                &input.key_condition_expression,
            )
        });

        items.sort_by(|a, b| {
            key_tuple(a)
                .into_iter()
                .take(2)
                .zip(key_tuple(b).into_iter().take(2))
                .map(|((_, va), (_, vb))| compare(&va, &vb))
                .find(|ord| *ord != std::cmp::Ordering::Equal)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if !input.scan_forward {
            items.reverse();
        }

        let start = match &input.exclusive_start_key {
            Some(start_key) => {
                let start_tuple = key_tuple(start_key);
                items
                    .iter()
                    .position(|item| start_tuple.iter().all(|(k, v)| item.get(k) == Some(v)))
                    .map(|i| i + 1)
                    .unwrap_or(0)
            }
            None => 0,
        };

        let end = match input.limit {
            Some(limit) => (start + limit as usize).min(items.len()),
            None => items.len(),
        };
        let page = items.get(start..end).unwrap_or_default();

        let last_evaluated_key = if end < items.len() {
            page.last().map(|item| item.iter().take(2).map(|(k, v)| (k.clone(), v.clone())).collect())
        } else {
            None
        };

        let matched: Vec<Item> = page
            .iter()
            .filter(|item| {
                Self::evaluate_condition(
                    Some(item),
                    &input.expression_attribute_names,
                    &input.expression_attribute_values,
                    &input.filter_expression,
                )
            })
            .cloned()
            .collect();

        Ok(QueryOutput { items: matched, last_evaluated_key })
    }

    async fn batch_get_item(&self, table_name: &str, keys: Vec<Item>) -> Result<Vec<Item>> {
        let mut out = Vec::new();
        for key in keys {
            if let Some(item) = self.get_item(table_name, &key, false).await? {
                out.push(item);
            }
        }
        Ok(out)
    }

    async fn batch_write_item(&self, table_name: &str, puts: Vec<Item>, deletes: Vec<Item>) -> Result<()> {
        for item in puts {
            self.put_item(table_name, item, ConditionalWriteInput::default()).await?;
        }
        for key in deletes {
            self.delete_item(table_name, &key, ConditionalWriteInput::default()).await?;
        }
        Ok(())
    }

    async fn transact_write_items(&self, operations: Vec<TransactWriteOperation>) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();

        for (i, op) in operations.iter().enumerate() {
            let (table_name, key_or_item, names, values, expr): (
                &str,
                Option<&Item>,
                &BTreeMap<String, String>,
                &BTreeMap<String, AttributeValue>,
                Option<&str>,
            ) = match op {
                TransactWriteOperation::Put {
                    table_name,
                    item,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                } => (
                    table_name,
                    Some(item),
                    expression_attribute_names,
                    expression_attribute_values,
                    condition_expression.as_deref(),
                ),
                TransactWriteOperation::Update {
                    table_name,
                    key,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                    ..
                } => (
                    table_name,
                    Some(key),
                    expression_attribute_names,
                    expression_attribute_values,
                    condition_expression.as_deref(),
                ),
                TransactWriteOperation::Delete {
                    table_name,
                    key,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                } => (
                    table_name,
                    Some(key),
                    expression_attribute_names,
                    expression_attribute_values,
                    condition_expression.as_deref(),
                ),
                TransactWriteOperation::ConditionCheck {
                    table_name,
                    key,
                    condition_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                } => (
                    table_name,
                    Some(key),
                    expression_attribute_names,
                    expression_attribute_values,
                    Some(condition_expression.as_str()),
                ),
            };

            let table = tables.entry(table_name.to_string()).or_insert_with(|| Table { items: Vec::new() });
            let key_tuple: Vec<(String, AttributeValue)> = key_or_item
                .map(|m| m.iter().take(2).map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            let existing = table
                .items
                .iter()
                .find(|item| key_tuple.iter().all(|(k, v)| item.get(k) == Some(v)));

            if !Self::evaluate_condition(existing, names, values, &expr.map(str::to_string)) {
                return Err(TableTheoryError::transaction(i, "ConditionalCheckFailed"));
            }
        }

        for op in operations {
            match op {
                TransactWriteOperation::Put { table_name, item, .. } => {
                    self.put_item(&table_name, item, ConditionalWriteInput::default()).await?;
                }
                TransactWriteOperation::Update {
                    table_name,
                    key,
                    update_expression,
                    expression_attribute_names,
                    expression_attribute_values,
                    ..
                } => {
                    self.update_item(UpdateItemInput {
                        table_name,
                        key,
                        update_expression,
                        condition_expression: None,
                        expression_attribute_names,
                        expression_attribute_values,
                        return_values: crate::client::ReturnValues::None,
                    })
                    .await?;
                }
                TransactWriteOperation::Delete { table_name, key, .. } => {
                    self.delete_item(&table_name, &key, ConditionalWriteInput::default()).await?;
                }
                TransactWriteOperation::ConditionCheck { .. } => {}
            }
        }

        Ok(())
    }

    async fn create_table(&self, descriptor: TableDescriptor) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.entry(descriptor.table_name).or_insert_with(|| Table { items: Vec::new() });
        Ok(())
    }

    async fn describe_table(&self, table_name: &str) -> Result<Option<TableDescriptor>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(table_name).map(|_| TableDescriptor {
            table_name: table_name.to_string(),
            partition_key: "PK".to_string(),
            sort_key: Some("SK".to_string()),
            read_capacity_units: 5,
            write_capacity_units: 5,
        }))
    }

    async fn delete_table(&self, table_name: &str) -> Result<()> {
        self.tables.lock().unwrap().remove(table_name);
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.lock().unwrap().keys().cloned().collect())
    }
}

/// [`KmsClient`] test double that performs no real wrapping: the "cipher"
/// key is the plaintext key you handed it, reversed, so encrypt/decrypt
/// round-trips exercise the same code path as production without needing a
/// real KMS endpoint.
pub struct NoopKmsClient;

#[async_trait]
impl KmsClient for NoopKmsClient {
    async fn generate_data_key(&self, _key_arn: &str) -> Result<DataKey> {
        let plaintext = vec![0x42u8; 32];
        Ok(DataKey {
            encrypted: plaintext.iter().rev().cloned().collect(),
            plaintext,
        })
    }

    async fn decrypt(&self, _key_arn: &str, ciphertext_blob: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext_blob.iter().rev().cloned().collect())
    }
}

/// [`KmsClient`] test double that always hands back the same plaintext key,
/// useful when a test needs to decrypt an envelope minted in a previous
/// step.
pub struct StaticKmsClient {
    pub plaintext_key: Vec<u8>,
}

#[async_trait]
impl KmsClient for StaticKmsClient {
    async fn generate_data_key(&self, _key_arn: &str) -> Result<DataKey> {
        Ok(DataKey {
            plaintext: self.plaintext_key.clone(),
            encrypted: vec![0xAA; 8],
        })
    }

    async fn decrypt(&self, _key_arn: &str, _ciphertext_blob: &[u8]) -> Result<Vec<u8>> {
        Ok(self.plaintext_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletheory_core::AttributeValue;

    fn key(pk: &str, sk: &str) -> Item {
        let mut m = BTreeMap::new();
        m.insert("PK".to_string(), AttributeValue::S(pk.to_string()));
        m.insert("SK".to_string(), AttributeValue::S(sk.to_string()));
        m
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryStore::new();
        let mut item = key("USER#1", "PROFILE");
        item.insert("nickname".to_string(), AttributeValue::S("Al".into()));
        store.put_item("users", item.clone(), ConditionalWriteInput::default()).await.unwrap();

        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap();
        assert_eq!(fetched, Some(item));
    }

    #[tokio::test]
    async fn condition_not_exists_rejects_second_put() {
        let store = MemoryStore::new();
        let mut names = BTreeMap::new();
        names.insert("#n1".to_string(), "PK".to_string());
        let condition = ConditionalWriteInput {
            condition_expression: Some("attribute_not_exists(#n1)".to_string()),
            expression_attribute_names: names,
            expression_attribute_values: BTreeMap::new(),
        };

        store
            .put_item("users", key("USER#1", "PROFILE"), condition.clone())
            .await
            .unwrap();

        let err = store
            .put_item("users", key("USER#1", "PROFILE"), condition)
            .await
            .unwrap_err();
        assert!(matches!(err, TableTheoryError::ConditionFailed(_)));
    }

    #[tokio::test]
    async fn delete_removes_item() {
        let store = MemoryStore::new();
        store
            .put_item("users", key("USER#1", "PROFILE"), ConditionalWriteInput::default())
            .await
            .unwrap();
        store
            .delete_item("users", &key("USER#1", "PROFILE"), ConditionalWriteInput::default())
            .await
            .unwrap();
        assert!(store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().is_none());
    }
}
