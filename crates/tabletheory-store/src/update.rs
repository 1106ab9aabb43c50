//! `UpdateBuilder` fluent API (spec §4.I).

use std::collections::BTreeMap;
use std::sync::Arc;

use tabletheory_core::expr::{BoolOp, ExpressionBuilder, Operator};
use tabletheory_core::marshal::Clock;
use tabletheory_core::registry::Metadata;
use tabletheory_core::AttributeValue;

use crate::client::{ReturnValues, StoreClient, UpdateItemInput};
use crate::encryption::Encryptor;
use crate::error::{Result, TableTheoryError};

#[derive(Debug, Clone)]
enum UpdateAction {
    Set { field: String, value: AttributeValue },
    SetIfNotExists { field: String, value: AttributeValue },
    Increment { field: String, by: f64 },
    Decrement { field: String, by: f64 },
    AddToSet { field: String, value: AttributeValue },
    DeleteFromSet { field: String, value: AttributeValue },
    Remove { field: String },
    AppendToList { field: String, values: Vec<AttributeValue> },
    PrependToList { field: String, values: Vec<AttributeValue> },
    SetListElement { field: String, index: i64, value: AttributeValue },
    RemoveFromListAt { field: String, index: i64 },
}

#[derive(Debug, Clone)]
struct ConditionClause {
    field: String,
    operator: Operator,
    operands: Vec<AttributeValue>,
    combinator: BoolOp,
}

/// Fluent `SET/REMOVE/ADD/DELETE` expression composer, consumed on
/// [`UpdateBuilder::execute`].
pub struct UpdateBuilder {
    store: Arc<dyn StoreClient>,
    metadata: Arc<Metadata>,
    clock: Arc<dyn Clock>,
    encryptor: Option<Arc<Encryptor>>,
    key: BTreeMap<String, AttributeValue>,
    actions: Vec<UpdateAction>,
    conditions: Vec<ConditionClause>,
    return_values: ReturnValues,
}

impl UpdateBuilder {
    pub fn new(
        store: Arc<dyn StoreClient>,
        metadata: Arc<Metadata>,
        clock: Arc<dyn Clock>,
        key: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self {
            store,
            metadata,
            clock,
            encryptor: None,
            key,
            actions: Vec::new(),
            conditions: Vec::new(),
            return_values: ReturnValues::None,
        }
    }

    /// Supplies the encryptor used when `set()` targets an encrypted field.
    pub fn with_encryptor(mut self, encryptor: Arc<Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn set(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.actions.push(UpdateAction::Set {
            field: field.into(),
            value: AttributeValue::from_json(&value),
        });
        self
    }

    pub fn set_if_not_exists(mut self, field: impl Into<String>, default: serde_json::Value) -> Self {
        self.actions.push(UpdateAction::SetIfNotExists {
            field: field.into(),
            value: AttributeValue::from_json(&default),
        });
        self
    }

    pub fn increment(mut self, field: impl Into<String>, by: f64) -> Self {
        self.actions.push(UpdateAction::Increment { field: field.into(), by });
        self
    }

    pub fn decrement(mut self, field: impl Into<String>, by: f64) -> Self {
        self.actions.push(UpdateAction::Decrement { field: field.into(), by });
        self
    }

    /// `ADD` against a set-typed field: encodes `value` (a JSON array) as an
    /// `SS`/`NS`/`BS` member list through the field's declared set type, the
    /// same way a full `put` would, rather than a bare JSON array.
    pub fn add(mut self, field: impl Into<String>, value: serde_json::Value) -> Result<Self> {
        let field = field.into();
        let meta = self.metadata.field(&field)?;
        let value = tabletheory_core::marshal::encode_field(meta, &value)?;
        self.actions.push(UpdateAction::AddToSet { field, value });
        Ok(self)
    }

    /// `DELETE` against a set-typed field: see [`Self::add`].
    pub fn delete(mut self, field: impl Into<String>, value: serde_json::Value) -> Result<Self> {
        let field = field.into();
        let meta = self.metadata.field(&field)?;
        let value = tabletheory_core::marshal::encode_field(meta, &value)?;
        self.actions.push(UpdateAction::DeleteFromSet { field, value });
        Ok(self)
    }

    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.actions.push(UpdateAction::Remove { field: field.into() });
        self
    }

    pub fn append_to_list(mut self, field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.actions.push(UpdateAction::AppendToList {
            field: field.into(),
            values: values.iter().map(AttributeValue::from_json).collect(),
        });
        self
    }

    pub fn prepend_to_list(mut self, field: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.actions.push(UpdateAction::PrependToList {
            field: field.into(),
            values: values.iter().map(AttributeValue::from_json).collect(),
        });
        self
    }

    pub fn set_list_element(mut self, field: impl Into<String>, index: i64, value: serde_json::Value) -> Result<Self> {
        if index < 0 {
            return Err(TableTheoryError::InvalidOperator("list index must not be negative".into()));
        }
        self.actions.push(UpdateAction::SetListElement {
            field: field.into(),
            index,
            value: AttributeValue::from_json(&value),
        });
        Ok(self)
    }

    pub fn remove_from_list_at(mut self, field: impl Into<String>, index: i64) -> Result<Self> {
        if index < 0 {
            return Err(TableTheoryError::InvalidOperator("list index must not be negative".into()));
        }
        self.actions.push(UpdateAction::RemoveFromListAt { field: field.into(), index });
        Ok(self)
    }

    pub fn condition(mut self, field: impl Into<String>, operator: Operator, operands: Vec<serde_json::Value>) -> Self {
        self.conditions.push(ConditionClause {
            field: field.into(),
            operator,
            operands: operands.iter().map(AttributeValue::from_json).collect(),
            combinator: BoolOp::And,
        });
        self
    }

    pub fn or_condition(mut self, field: impl Into<String>, operator: Operator, operands: Vec<serde_json::Value>) -> Self {
        self.conditions.push(ConditionClause {
            field: field.into(),
            operator,
            operands: operands.iter().map(AttributeValue::from_json).collect(),
            combinator: BoolOp::Or,
        });
        self
    }

    pub fn condition_exists(self, field: impl Into<String>) -> Self {
        self.condition(field, Operator::Exists, vec![])
    }

    pub fn condition_not_exists(self, field: impl Into<String>) -> Self {
        self.condition(field, Operator::NotExists, vec![])
    }

    /// Conditions on `version = v`, requiring the model to have a version
    /// field.
    pub fn condition_version(mut self, expected: i64) -> Result<Self> {
        let Some(version_field) = self.metadata.version_field.clone() else {
            return Err(TableTheoryError::InvalidModel(
                "condition_version requires a model with a version field".into(),
            ));
        };
        self.conditions.push(ConditionClause {
            field: version_field,
            operator: Operator::Eq,
            operands: vec![AttributeValue::N(expected.to_string())],
            combinator: BoolOp::And,
        });
        Ok(self)
    }

    pub fn return_values(mut self, return_values: ReturnValues) -> Self {
        self.return_values = return_values;
        self
    }

    /// Renders the accumulated actions/conditions into an `UpdateItemInput`
    /// and submits it, consuming the builder.
    pub async fn execute(self) -> Result<Option<BTreeMap<String, AttributeValue>>> {
        let mut update_builder = ExpressionBuilder::new();
        let mut condition_builder = ExpressionBuilder::new();

        let mut sets = Vec::new();
        let mut removes = Vec::new();
        let mut adds = Vec::new();
        let mut deletes = Vec::new();

        for action in &self.actions {
            match action {
                UpdateAction::Set { field, value } => {
                    let store_name = self.store_name(field)?;
                    let value = self.maybe_encrypt(field, value.clone()).await?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(value);
                    sets.push(format!("{name} = {val}"));
                }
                UpdateAction::SetIfNotExists { field, value } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(value.clone());
                    sets.push(format!("{name} = if_not_exists({name}, {val})"));
                }
                UpdateAction::Increment { field, by } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(AttributeValue::N(by.to_string()));
                    sets.push(format!("{name} = {name} + {val}"));
                }
                UpdateAction::Decrement { field, by } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(AttributeValue::N(by.to_string()));
                    sets.push(format!("{name} = {name} - {val}"));
                }
                UpdateAction::AddToSet { field, value } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(value.clone());
                    adds.push(format!("{name} {val}"));
                }
                UpdateAction::DeleteFromSet { field, value } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(value.clone());
                    deletes.push(format!("{name} {val}"));
                }
                UpdateAction::Remove { field } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    removes.push(name);
                }
                UpdateAction::AppendToList { field, values } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(AttributeValue::L(values.clone()));
                    sets.push(format!("{name} = list_append({name}, {val})"));
                }
                UpdateAction::PrependToList { field, values } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(AttributeValue::L(values.clone()));
                    sets.push(format!("{name} = list_append({val}, {name})"));
                }
                UpdateAction::SetListElement { field, index, value } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    let val = update_builder.value_placeholder(value.clone());
                    sets.push(format!("{name}[{index}] = {val}"));
                }
                UpdateAction::RemoveFromListAt { field, index } => {
                    let store_name = self.store_name(field)?;
                    let name = update_builder.name_placeholder(&store_name);
                    removes.push(format!("{name}[{index}]"));
                }
            }
        }

        if let Some(updated_at_field) = &self.metadata.updated_at_field {
            let already_set = self
                .actions
                .iter()
                .any(|a| matches!(a, UpdateAction::Set { field, .. } if field == updated_at_field));
            if !already_set {
                let field_meta = self.metadata.field(updated_at_field)?;
                let name = update_builder.name_placeholder(&field_meta.store_name);
                let val = update_builder.value_placeholder(AttributeValue::N(self.clock.now().to_string()));
                sets.push(format!("{name} = {val}"));
            }
        }

        // Every update bumps the optimistic-lock version, independent of
        // whether this call also conditioned on it via `condition_version`.
        if let Some(version_field) = self.metadata.version_field.clone() {
            let field_meta = self.metadata.field(&version_field)?;
            let name = update_builder.name_placeholder(&field_meta.store_name);
            let val = update_builder.value_placeholder(AttributeValue::N("1".to_string()));
            adds.push(format!("{name} {val}"));
        }

        // Seeded from update_builder so the condition expression's
        // placeholders never collide with the update expression's once
        // both are merged into one request below.
        condition_builder.seed_from(&update_builder);
        for cond in &self.conditions {
            let store_name = self.store_name(&cond.field)?;
            condition_builder.add_clause(&store_name, cond.operator, cond.operands.clone(), cond.combinator)?;
        }

        let mut clauses = Vec::new();
        if !sets.is_empty() {
            clauses.push(format!("SET {}", sets.join(", ")));
        }
        if !removes.is_empty() {
            clauses.push(format!("REMOVE {}", removes.join(", ")));
        }
        if !adds.is_empty() {
            clauses.push(format!("ADD {}", adds.join(", ")));
        }
        if !deletes.is_empty() {
            clauses.push(format!("DELETE {}", deletes.join(", ")));
        }
        let update_expression = clauses.join(" ");

        let mut names = update_builder.names().clone();
        names.extend(condition_builder.names().clone());
        let mut values = update_builder.values().clone();
        values.extend(condition_builder.values().clone());

        let input = UpdateItemInput {
            table_name: self.metadata.table_name.clone(),
            key: self.key,
            update_expression,
            condition_expression: condition_builder.render(),
            expression_attribute_names: names,
            expression_attribute_values: values,
            return_values: self.return_values,
        };

        let output = self.store.update_item(input).await?;

        if let (Some(item), Some(encryptor)) = (&output.item, &self.encryptor) {
            return Ok(Some(decrypt_image(&self.metadata, item, encryptor).await?));
        }

        Ok(output.item)
    }

    fn store_name(&self, app_field: &str) -> Result<String> {
        Ok(self.metadata.field(app_field)?.store_name.clone())
    }

    async fn maybe_encrypt(&self, app_field: &str, value: AttributeValue) -> Result<AttributeValue> {
        let field = self.metadata.field(app_field)?;
        if !field.is_encrypted {
            return Ok(value);
        }
        let Some(encryptor) = &self.encryptor else {
            return Err(TableTheoryError::EncryptionNotConfigured(app_field.to_string()));
        };
        let plaintext = value.as_s()?;
        encryptor.encrypt(&field.store_name, plaintext).await
    }
}

async fn decrypt_image(
    metadata: &Metadata,
    item: &BTreeMap<String, AttributeValue>,
    encryptor: &Encryptor,
) -> Result<BTreeMap<String, AttributeValue>> {
    let mut out = item.clone();
    for (store_name, value) in item {
        if let Ok(field) = metadata.field_by_store_name(store_name) {
            if field.is_encrypted && !value.is_null() {
                let plaintext = encryptor.decrypt(store_name, value).await?;
                out.insert(store_name.clone(), AttributeValue::S(plaintext));
            }
        }
    }
    Ok(out)
}

/// Applies a rendered update expression against an in-memory item. Used
/// only by [`crate::testing::MemoryStore`]; production store clients
/// translate the expression on the wire instead.
pub(crate) fn apply_update_expression(
    item: &mut BTreeMap<String, AttributeValue>,
    expression: &str,
    names: &BTreeMap<String, String>,
    values: &BTreeMap<String, AttributeValue>,
) -> Result<()> {
    let resolve_name = |token: &str| -> String { names.get(token).cloned().unwrap_or_else(|| token.to_string()) };

    for clause in split_top_level_clauses(expression) {
        let clause = clause.trim();
        if let Some(rest) = clause.strip_prefix("SET ") {
            for assignment in split_commas(rest) {
                let (lhs, rhs) = assignment
                    .split_once('=')
                    .ok_or_else(|| TableTheoryError::Internal(format!("malformed SET clause: {assignment}")))?;
                let lhs = lhs.trim();
                let rhs = rhs.trim();
                let (lhs_token, index) = parse_indexed(lhs);
                let store_name = resolve_name(lhs_token);

                if let Some(index) = index {
                    if let Some(value) = values.get(rhs) {
                        set_list_index(item, &store_name, index, value.clone());
                    }
                } else if let Some(inner) = rhs.strip_prefix("if_not_exists(").and_then(|s| s.strip_suffix(')')) {
                    let mut parts = inner.splitn(2, ", ");
                    parts.next();
                    let val_token = parts.next().unwrap_or_default().trim();
                    if !item.contains_key(&store_name) {
                        if let Some(value) = values.get(val_token) {
                            item.insert(store_name, value.clone());
                        }
                    }
                } else if let Some(inner) = rhs.strip_prefix("list_append(").and_then(|s| s.strip_suffix(')')) {
                    let parts = split_commas(inner);
                    if let [a, b] = parts.as_slice() {
                        if a.as_str() == lhs_token {
                            append_list(item, &store_name, values.get(b.as_str()), true);
                        } else {
                            append_list(item, &store_name, values.get(a.as_str()), false);
                        }
                    }
                } else if let Some(val_token) = rhs.strip_prefix(&format!("{lhs_token} + ")) {
                    let delta = values.get(val_token.trim()).and_then(|v| v.as_n().ok()).unwrap_or(0.0);
                    let current = item.get(&store_name).and_then(|v| v.as_n().ok()).unwrap_or(0.0);
                    item.insert(store_name, AttributeValue::N((current + delta).to_string()));
                } else if let Some(val_token) = rhs.strip_prefix(&format!("{lhs_token} - ")) {
                    let delta = values.get(val_token.trim()).and_then(|v| v.as_n().ok()).unwrap_or(0.0);
                    let current = item.get(&store_name).and_then(|v| v.as_n().ok()).unwrap_or(0.0);
                    item.insert(store_name, AttributeValue::N((current - delta).to_string()));
                } else if let Some(value) = values.get(rhs) {
                    item.insert(store_name, value.clone());
                }
            }
        } else if let Some(rest) = clause.strip_prefix("REMOVE ") {
            for field in split_commas(rest) {
                let (name_token, index) = parse_indexed(field.trim());
                let store_name = resolve_name(name_token);
                match index {
                    Some(index) => remove_list_index(item, &store_name, index),
                    None => {
                        item.remove(&store_name);
                    }
                }
            }
        } else if let Some(rest) = clause.strip_prefix("ADD ") {
            for op in split_commas(rest) {
                let mut parts = op.trim().splitn(2, ' ');
                let name_token = parts.next().unwrap_or_default();
                let val_token = parts.next().unwrap_or_default();
                let store_name = resolve_name(name_token);
                if let Some(delta) = values.get(val_token) {
                    if let Ok(n) = delta.as_n() {
                        let current = item.get(&store_name).and_then(|v| v.as_n().ok()).unwrap_or(0.0);
                        item.insert(store_name, AttributeValue::N((current + n).to_string()));
                    } else {
                        union_into_set(item, &store_name, delta);
                    }
                }
            }
        } else if let Some(rest) = clause.strip_prefix("DELETE ") {
            for op in split_commas(rest) {
                let mut parts = op.trim().splitn(2, ' ');
                let name_token = parts.next().unwrap_or_default();
                let val_token = parts.next().unwrap_or_default();
                let store_name = resolve_name(name_token);
                if let Some(delta) = values.get(val_token) {
                    difference_set(item, &store_name, delta);
                }
            }
        }
    }
    Ok(())
}

/// Splits a trailing `[N]` list index off a name token, as rendered by
/// [`UpdateAction::SetListElement`]/[`UpdateAction::RemoveFromListAt`].
fn parse_indexed(token: &str) -> (&str, Option<usize>) {
    if let Some(open) = token.find('[') {
        if let Some(index) = token.strip_suffix(']').and_then(|s| s[open + 1..].parse::<usize>().ok()) {
            return (&token[..open], Some(index));
        }
    }
    (token, None)
}

fn set_list_index(item: &mut BTreeMap<String, AttributeValue>, store_name: &str, index: usize, value: AttributeValue) {
    if let Some(AttributeValue::L(list)) = item.get_mut(store_name) {
        if let Some(slot) = list.get_mut(index) {
            *slot = value;
        }
    }
}

fn remove_list_index(item: &mut BTreeMap<String, AttributeValue>, store_name: &str, index: usize) {
    if let Some(AttributeValue::L(list)) = item.get_mut(store_name) {
        if index < list.len() {
            list.remove(index);
        }
    }
}

fn append_list(item: &mut BTreeMap<String, AttributeValue>, store_name: &str, value: Option<&AttributeValue>, append: bool) {
    let Some(AttributeValue::L(new_items)) = value else { return };
    let mut list = match item.get(store_name) {
        Some(AttributeValue::L(existing)) => existing.clone(),
        _ => Vec::new(),
    };
    if append {
        list.extend(new_items.iter().cloned());
    } else {
        let mut combined = new_items.clone();
        combined.extend(list);
        list = combined;
    }
    item.insert(store_name.to_string(), AttributeValue::L(list));
}

fn union_into_set(item: &mut BTreeMap<String, AttributeValue>, store_name: &str, delta: &AttributeValue) {
    macro_rules! union {
        ($variant:ident, $items:expr) => {{
            let mut set = match item.get(store_name) {
                Some(AttributeValue::$variant(existing)) => existing.clone(),
                _ => Vec::new(),
            };
            for v in $items {
                if !set.contains(v) {
                    set.push(v.clone());
                }
            }
            item.insert(store_name.to_string(), AttributeValue::$variant(set));
        }};
    }
    match delta {
        AttributeValue::Ss(new) => union!(Ss, new),
        AttributeValue::Ns(new) => union!(Ns, new),
        AttributeValue::Bs(new) => union!(Bs, new),
        _ => {}
    }
}

fn difference_set(item: &mut BTreeMap<String, AttributeValue>, store_name: &str, delta: &AttributeValue) {
    macro_rules! difference {
        ($variant:ident, $remove:expr) => {{
            if let Some(AttributeValue::$variant(existing)) = item.get(store_name) {
                let remaining: Vec<_> = existing.iter().filter(|v| !$remove.contains(v)).cloned().collect();
                item.insert(store_name.to_string(), AttributeValue::$variant(remaining));
            }
        }};
    }
    match delta {
        AttributeValue::Ss(remove) => difference!(Ss, remove),
        AttributeValue::Ns(remove) => difference!(Ns, remove),
        AttributeValue::Bs(remove) => difference!(Bs, remove),
        _ => {}
    }
}

fn split_top_level_clauses(expression: &str) -> Vec<String> {
    let keywords = ["SET ", "REMOVE ", "ADD ", "DELETE "];
    let mut indices = Vec::new();
    for kw in keywords {
        let mut start = 0;
        while let Some(pos) = expression[start..].find(kw) {
            indices.push(start + pos);
            start += pos + kw.len();
        }
    }
    indices.sort_unstable();
    let mut out = Vec::new();
    for (i, &start) in indices.iter().enumerate() {
        let end = indices.get(i + 1).copied().unwrap_or(expression.len());
        out.push(expression[start..end].trim().to_string());
    }
    out
}

/// Splits on top-level commas only, skipping commas nested inside a function
/// call (`if_not_exists(a, b)`, `list_append(a, b)`) or a list index (`x[0]`).
fn split_commas(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | ']' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use tabletheory_core::marshal::FixedClock;
    use tabletheory_core::naming::NamingConvention;
    use tabletheory_core::registry::{FieldMetadata, ModelDescriptor, ValueType};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(1_000))
    }

    fn metadata() -> Arc<Metadata> {
        let mut pk = FieldMetadata::new("pk", ValueType::S, NamingConvention::CamelCase).unwrap();
        pk.is_pk = true;
        let mut sk = FieldMetadata::new("sk", ValueType::S, NamingConvention::CamelCase).unwrap();
        sk.is_sk = true;
        let nickname = FieldMetadata::new("nickname", ValueType::S, NamingConvention::CamelCase).unwrap();
        let mut version = FieldMetadata::new("version", ValueType::N, NamingConvention::CamelCase).unwrap();
        version.is_version = true;
        let mut updated_at = FieldMetadata::new("updatedAt", ValueType::N, NamingConvention::CamelCase).unwrap();
        updated_at.is_updated_at = true;
        let score = FieldMetadata::new("score", ValueType::N, NamingConvention::CamelCase).unwrap();
        let mut tags = FieldMetadata::new("tags", ValueType::Ss, NamingConvention::CamelCase).unwrap();
        tags.is_set = true;
        let todos = FieldMetadata::new("todos", ValueType::L, NamingConvention::CamelCase).unwrap();

        let descriptor = ModelDescriptor {
            table_name: Some("users".into()),
            naming_convention: None,
            fields: vec![pk, sk, nickname, version, updated_at, score, tags, todos],
            indexes: vec![],
        };
        Arc::new(Metadata::from_descriptor("User", descriptor).unwrap())
    }

    fn key(pk: &str, sk: &str) -> BTreeMap<String, AttributeValue> {
        let mut m = BTreeMap::new();
        m.insert("pk".to_string(), AttributeValue::S(pk.to_string()));
        m.insert("sk".to_string(), AttributeValue::S(sk.to_string()));
        m
    }

    #[tokio::test]
    async fn set_updates_field_and_stale_version_fails() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();

        store
            .put_item(
                "users",
                {
                    let mut item = key("USER#1", "PROFILE");
                    item.insert("nickname".to_string(), AttributeValue::S("Al".into()));
                    item.insert("version".to_string(), AttributeValue::N("0".into()));
                    item
                },
                crate::client::ConditionalWriteInput::default(),
            )
            .await
            .unwrap();

        let builder = UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .set("nickname", serde_json::json!("Alice"))
            .condition_version(0)
            .unwrap();
        builder.execute().await.unwrap();

        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        assert_eq!(fetched.get("nickname").unwrap().as_s().unwrap(), "Alice");

        let stale = UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .set("nickname", serde_json::json!("Bob"))
            .condition_version(0)
            .unwrap();
        let err = stale.execute().await.unwrap_err();
        assert!(matches!(err, TableTheoryError::ConditionFailed(_)));
    }

    #[test]
    fn negative_list_index_rejected() {
        let meta = metadata();
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let builder = UpdateBuilder::new(store, meta, clock(), key("USER#1", "PROFILE"));
        let err = builder.set_list_element("nickname", -1, serde_json::json!("x")).unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidOperator(_)));
    }

    #[tokio::test]
    async fn execute_stamps_updated_at() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();
        store
            .put_item(
                "users",
                {
                    let mut item = key("USER#1", "PROFILE");
                    item.insert("version".to_string(), AttributeValue::N("0".into()));
                    item.insert("updatedAt".to_string(), AttributeValue::N("0".into()));
                    item
                },
                crate::client::ConditionalWriteInput::default(),
            )
            .await
            .unwrap();

        UpdateBuilder::new(store.clone(), meta.clone(), Arc::new(FixedClock(5_000)), key("USER#1", "PROFILE"))
            .set("nickname", serde_json::json!("Al"))
            .execute()
            .await
            .unwrap();

        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        assert_eq!(fetched.get("updatedAt").unwrap().as_n().unwrap(), 5_000.0);
    }

    #[tokio::test]
    async fn increment_and_decrement_adjust_numeric_field() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();
        store
            .put_item(
                "users",
                {
                    let mut item = key("USER#1", "PROFILE");
                    item.insert("score".to_string(), AttributeValue::N("10".into()));
                    item
                },
                crate::client::ConditionalWriteInput::default(),
            )
            .await
            .unwrap();

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .increment("score", 5.0)
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        assert_eq!(fetched.get("score").unwrap().as_n().unwrap(), 15.0);

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .decrement("score", 3.0)
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        assert_eq!(fetched.get("score").unwrap().as_n().unwrap(), 12.0);
    }

    #[tokio::test]
    async fn set_if_not_exists_only_applies_when_absent() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();
        store
            .put_item("users", key("USER#1", "PROFILE"), crate::client::ConditionalWriteInput::default())
            .await
            .unwrap();

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .set_if_not_exists("nickname", serde_json::json!("Al"))
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        assert_eq!(fetched.get("nickname").unwrap().as_s().unwrap(), "Al");

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .set_if_not_exists("nickname", serde_json::json!("Bob"))
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        assert_eq!(fetched.get("nickname").unwrap().as_s().unwrap(), "Al");
    }

    #[tokio::test]
    async fn add_and_delete_adjust_a_string_set() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();
        store
            .put_item(
                "users",
                {
                    let mut item = key("USER#1", "PROFILE");
                    item.insert("tags".to_string(), AttributeValue::Ss(vec!["a".into(), "b".into()]));
                    item
                },
                crate::client::ConditionalWriteInput::default(),
            )
            .await
            .unwrap();

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .add("tags", serde_json::json!(["c"]))
            .unwrap()
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        let AttributeValue::Ss(tags) = fetched.get("tags").unwrap() else {
            panic!("expected a string set");
        };
        assert_eq!(tags.len(), 3);
        assert!(tags.contains(&"c".to_string()));

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .delete("tags", serde_json::json!(["a"]))
            .unwrap()
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        let AttributeValue::Ss(tags) = fetched.get("tags").unwrap() else {
            panic!("expected a string set");
        };
        assert_eq!(tags.len(), 2);
        assert!(!tags.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn append_and_prepend_to_list() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();
        store
            .put_item(
                "users",
                {
                    let mut item = key("USER#1", "PROFILE");
                    item.insert("todos".to_string(), AttributeValue::L(vec![AttributeValue::S("wash".into())]));
                    item
                },
                crate::client::ConditionalWriteInput::default(),
            )
            .await
            .unwrap();

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .append_to_list("todos", vec![serde_json::json!("cook")])
            .execute()
            .await
            .unwrap();
        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .prepend_to_list("todos", vec![serde_json::json!("wake")])
            .execute()
            .await
            .unwrap();

        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        let todos = fetched.get("todos").unwrap().as_l().unwrap();
        let rendered: Vec<&str> = todos.iter().map(|v| v.as_s().unwrap()).collect();
        assert_eq!(rendered, vec!["wake", "wash", "cook"]);
    }

    #[tokio::test]
    async fn set_list_element_and_remove_from_list_at_valid_index() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let meta = metadata();
        store
            .put_item(
                "users",
                {
                    let mut item = key("USER#1", "PROFILE");
                    item.insert(
                        "todos".to_string(),
                        AttributeValue::L(vec![AttributeValue::S("wash".into()), AttributeValue::S("cook".into())]),
                    );
                    item
                },
                crate::client::ConditionalWriteInput::default(),
            )
            .await
            .unwrap();

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .set_list_element("todos", 0, serde_json::json!("mop"))
            .unwrap()
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        let todos = fetched.get("todos").unwrap().as_l().unwrap();
        assert_eq!(todos[0].as_s().unwrap(), "mop");

        UpdateBuilder::new(store.clone(), meta.clone(), clock(), key("USER#1", "PROFILE"))
            .remove_from_list_at("todos", 0)
            .unwrap()
            .execute()
            .await
            .unwrap();
        let fetched = store.get_item("users", &key("USER#1", "PROFILE"), false).await.unwrap().unwrap();
        let todos = fetched.get("todos").unwrap().as_l().unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].as_s().unwrap(), "cook");
    }
}
