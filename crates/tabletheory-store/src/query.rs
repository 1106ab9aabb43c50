//! Query/scan execution: pagination, parallel scan merge (spec §4.H,
//! execution half).

use std::collections::BTreeMap;
use std::sync::Arc;

use tabletheory_core::cursor::{self, Direction};
use tabletheory_core::query::CompiledQuery;
use tabletheory_core::registry::Metadata;
use tabletheory_core::AttributeValue;

use crate::client::{QueryInput, StoreClient};
use crate::error::Result;

/// One page of decoded results plus the cursor to resume from, if any.
pub struct ExecutedPage {
    pub items: Vec<BTreeMap<String, AttributeValue>>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

fn to_query_input(compiled: &CompiledQuery, exclusive_start_key: Option<BTreeMap<String, AttributeValue>>) -> QueryInput {
    QueryInput {
        table_name: compiled.table_name.clone(),
        index_name: compiled.index_name.clone(),
        key_condition_expression: compiled.key_condition_expression.clone(),
        filter_expression: compiled.filter_expression.clone(),
        projection_expression: compiled.projection_expression.clone(),
        expression_attribute_names: compiled.expression_attribute_names.clone(),
        expression_attribute_values: compiled.expression_attribute_values.clone(),
        limit: compiled.limit,
        scan_forward: compiled.scan_forward,
        exclusive_start_key,
        consistent_read: compiled.consistent_read,
        segment: compiled.segment,
        total_segments: compiled.total_segments,
    }
}

/// Executes one compiled query/scan against `store`, running `Query` when a
/// key-condition is present and `Scan` otherwise. `has_more` is always
/// derived from the store's `LastEvaluatedKey`, never a `limit+1` probe
/// (spec §9).
pub async fn execute(store: &dyn StoreClient, compiled: &CompiledQuery) -> Result<ExecutedPage> {
    let input = to_query_input(compiled, compiled.exclusive_start_key.clone());
    let output = if compiled.key_condition_expression.is_some() {
        store.query(input).await?
    } else {
        store.scan(input).await?
    };

    let cursor_str = match &output.last_evaluated_key {
        Some(last_key) => Some(cursor::encode(
            last_key,
            compiled.index_name.as_deref().unwrap_or("primary"),
            Direction::Next,
        )?),
        None => None,
    };

    Ok(ExecutedPage {
        items: output.items,
        has_more: output.last_evaluated_key.is_some(),
        cursor: cursor_str,
    })
}

/// Runs every segment of a parallel scan concurrently and merges the
/// results; result order across segments is undefined, matching §4.H.
pub async fn execute_parallel_scan(store: Arc<dyn StoreClient>, compiled_segments: Vec<CompiledQuery>) -> Result<Vec<BTreeMap<String, AttributeValue>>> {
    let mut handles = Vec::with_capacity(compiled_segments.len());
    for compiled in compiled_segments {
        let store = store.clone();
        handles.push(tokio::spawn(async move { execute(store.as_ref(), &compiled).await }));
    }

    let mut merged = Vec::new();
    for handle in handles {
        let page = handle
            .await
            .map_err(|e| crate::error::TableTheoryError::Internal(format!("parallel scan segment panicked: {e}")))??;
        merged.extend(page.items);
    }
    Ok(merged)
}

/// Resolves an optional cursor string against `metadata`'s current index,
/// decoding it and checking the index-binding invariant before it's used
/// as an `exclusive_start_key`.
pub fn resolve_cursor(metadata: &Metadata, cursor_str: &str, current_index: &str) -> Result<BTreeMap<String, AttributeValue>> {
    let _ = metadata;
    let decoded = cursor::decode(cursor_str)?;
    cursor::check_index_binding(&decoded, current_index)?;
    Ok(decoded.last_key)
}
