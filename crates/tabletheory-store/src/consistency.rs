//! Retry/backoff and strong-read consistency helpers (spec §4.M).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Result, TableTheoryError};

/// Decides whether a query attempt should be retried, given its outcome.
/// The default condition (empty-result-aware) is [`default_retry_condition`].
pub trait RetryCondition<T>: Send + Sync {
    fn should_retry(&self, outcome: &Result<T>) -> bool;
}

/// Retries on error, or on a successful-but-empty result.
pub struct DefaultRetryCondition;

impl<T> RetryCondition<Vec<T>> for DefaultRetryCondition {
    fn should_retry(&self, outcome: &Result<Vec<T>>) -> bool {
        match outcome {
            Err(_) => true,
            Ok(items) => items.is_empty(),
        }
    }
}

/// Exponential backoff parameters for [`with_retry`].
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Wraps `attempt` with exponential backoff, stopping early if `cancel` is
/// triggered. Respects `policy.max_retries` and the supplied retry
/// condition.
pub async fn with_retry<T, F, Fut>(
    policy: BackoffPolicy,
    condition: &dyn RetryCondition<Vec<T>>,
    cancel: Option<&CancellationToken>,
    mut attempt: F,
) -> Result<Vec<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let mut delay = policy.initial_delay;
    let mut last = attempt().await;

    for _ in 0..policy.max_retries {
        if !condition.should_retry(&last) {
            break;
        }
        if let Some(token) = cancel {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(TableTheoryError::Internal("operation cancelled during backoff".into()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            tokio::time::sleep(delay).await;
        }
        delay = Duration::from_secs_f64((delay.as_secs_f64() * policy.backoff_factor).min(policy.max_delay.as_secs_f64()));
        last = attempt().await;
    }

    last
}

/// Options controlling how a write is verified before returning.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub verify_write: bool,
    pub wait_for_gsi_propagation: Option<Duration>,
}

/// Issues a create/update and optionally re-reads with strong consistency
/// before returning, per §4.M's `ReadAfterWriteHelper`.
pub struct ReadAfterWriteHelper {
    store: Arc<dyn crate::client::StoreClient>,
}

impl ReadAfterWriteHelper {
    pub fn new(store: Arc<dyn crate::client::StoreClient>) -> Self {
        Self { store }
    }

    /// Issues `write` (a create), then — if `opts.verify_write` — re-reads
    /// `key` with a strongly consistent `GetItem`. If a propagation wait is
    /// configured, sleeps that long after success, before the (optional)
    /// re-read.
    pub async fn create_with_consistency<W, Fut>(
        &self,
        table_name: &str,
        key: &std::collections::BTreeMap<String, tabletheory_core::AttributeValue>,
        opts: VerifyOptions,
        write: W,
    ) -> Result<Option<std::collections::BTreeMap<String, tabletheory_core::AttributeValue>>>
    where
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        write().await?;

        if let Some(wait) = opts.wait_for_gsi_propagation {
            tokio::time::sleep(wait).await;
        }

        if opts.verify_write {
            return self.store.get_item(table_name, key, true).await;
        }

        Ok(None)
    }

    /// As [`Self::create_with_consistency`], but for updates: the verified
    /// re-read is returned for the caller to merge back into their own
    /// reference.
    pub async fn update_with_consistency<W, Fut>(
        &self,
        table_name: &str,
        key: &std::collections::BTreeMap<String, tabletheory_core::AttributeValue>,
        opts: VerifyOptions,
        update: W,
    ) -> Result<Option<std::collections::BTreeMap<String, tabletheory_core::AttributeValue>>>
    where
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.create_with_consistency(table_name, key, opts, update).await
    }
}

/// `CreateAndQueryGSI`: create an item, then query a GSI for it with
/// retry, falling back to a strongly-consistent primary-table read on
/// persistent failure.
pub struct WriteAndReadPattern {
    store: Arc<dyn crate::client::StoreClient>,
}

impl WriteAndReadPattern {
    pub fn new(store: Arc<dyn crate::client::StoreClient>) -> Self {
        Self { store }
    }

    pub async fn create_and_query_gsi<W, Fut>(
        &self,
        create: W,
        gsi_query: tabletheory_core::query::CompiledQuery,
        fallback_key: &std::collections::BTreeMap<String, tabletheory_core::AttributeValue>,
        primary_table: &str,
        policy: BackoffPolicy,
    ) -> Result<Vec<std::collections::BTreeMap<String, tabletheory_core::AttributeValue>>>
    where
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        create().await?;

        let store = self.store.clone();
        let query = gsi_query;
        let result = with_retry(policy, &DefaultRetryCondition, None, || {
            let store = store.clone();
            let query = clone_compiled(&query);
            async move { Ok(crate::query::execute(store.as_ref(), &query).await?.items) }
        })
        .await;

        match result {
            Ok(items) if !items.is_empty() => Ok(items),
            _ => {
                let item = self.store.get_item(primary_table, fallback_key, true).await?;
                Ok(item.into_iter().collect())
            }
        }
    }
}

fn clone_compiled(q: &tabletheory_core::query::CompiledQuery) -> tabletheory_core::query::CompiledQuery {
    tabletheory_core::query::CompiledQuery {
        table_name: q.table_name.clone(),
        index_name: q.index_name.clone(),
        key_condition_expression: q.key_condition_expression.clone(),
        filter_expression: q.filter_expression.clone(),
        projection_expression: q.projection_expression.clone(),
        expression_attribute_names: q.expression_attribute_names.clone(),
        expression_attribute_values: q.expression_attribute_values.clone(),
        limit: q.limit,
        scan_forward: q.scan_forward,
        exclusive_start_key: q.exclusive_start_key.clone(),
        consistent_read: q.consistent_read,
        segment: q.segment,
        total_segments: q.total_segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_retry_stops_once_condition_satisfied() {
        let mut attempts = 0;
        let policy = BackoffPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(2),
        };
        let result: Result<Vec<i32>> = with_retry(policy, &DefaultRetryCondition, None, || {
            attempts += 1;
            let attempts_now = attempts;
            async move {
                if attempts_now < 3 {
                    Ok(Vec::new())
                } else {
                    Ok(vec![1])
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), vec![1]);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn with_retry_respects_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let policy = BackoffPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(50),
        };
        let result: Result<Vec<i32>> = with_retry(policy, &DefaultRetryCondition, Some(&token), || async { Ok(Vec::new()) }).await;
        assert!(result.is_err());
    }
}
