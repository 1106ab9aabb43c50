//! Distributed lease acquire/refresh/release (spec §4.L).

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::RngCore;
use tabletheory_core::expr::{BoolOp, ExpressionBuilder, Operator};
use tabletheory_core::AttributeValue;

use crate::client::{ConditionalWriteInput, StoreClient};
use crate::error::{Result, TableTheoryError};
use tabletheory_core::marshal::Clock;

const DEFAULT_LOCK_SORT_KEY: &str = "LOCK";

/// A held lease, returned by [`LeaseManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub expires_at: i64,
}

/// Injectable 128-bit token generator.
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// [`TokenGenerator`] backed by the OS CSPRNG, hex-encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Coordinates acquire/refresh/release of distributed leases against a
/// `(pk, sk=lock_sort_key)` item in `table_name`.
pub struct LeaseManager {
    store: Arc<dyn StoreClient>,
    table_name: String,
    lock_sort_key: String,
    clock: Arc<dyn Clock>,
    token_gen: Arc<dyn TokenGenerator>,
    ttl_buffer: i64,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn StoreClient>, table_name: impl Into<String>, clock: Arc<dyn Clock>, token_gen: Arc<dyn TokenGenerator>) -> Self {
        Self {
            store,
            table_name: table_name.into(),
            lock_sort_key: DEFAULT_LOCK_SORT_KEY.to_string(),
            clock,
            token_gen,
            ttl_buffer: 300,
        }
    }

    /// Overrides the sort key used for lock items (default `"LOCK"`).
    pub fn with_lock_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.lock_sort_key = sort_key.into();
        self
    }

    /// Overrides the GC-only TTL buffer added past `expires_at` (seconds).
    pub fn with_ttl_buffer(mut self, buffer: i64) -> Self {
        self.ttl_buffer = buffer;
        self
    }

    fn validate_key(&self, pk: &str, duration_secs: i64) -> Result<()> {
        if pk.is_empty() {
            return Err(TableTheoryError::InvalidInput("lease key must not be empty".into()));
        }
        if self.lock_sort_key.is_empty() {
            return Err(TableTheoryError::InvalidInput("lock sort key must not be empty".into()));
        }
        if duration_secs <= 0 {
            return Err(TableTheoryError::InvalidInput("lease duration must be positive".into()));
        }
        Ok(())
    }

    fn item_key(&self, pk: &str) -> BTreeMap<String, AttributeValue> {
        let mut key = BTreeMap::new();
        key.insert("PK".to_string(), AttributeValue::S(pk.to_string()));
        key.insert("SK".to_string(), AttributeValue::S(self.lock_sort_key.clone()));
        key
    }

    /// Acquires the lease on `pk` for `duration_secs`, conditioned on it
    /// not existing or having already expired. Conditional failure maps to
    /// [`TableTheoryError::LeaseHeld`].
    pub async fn acquire(&self, pk: &str, duration_secs: i64) -> Result<Lease> {
        self.validate_key(pk, duration_secs)?;

        let now = self.clock.now();
        let token = self.token_gen.generate();
        let expires_at = now + duration_secs;

        let mut item = self.item_key(pk);
        item.insert("lease_token".to_string(), AttributeValue::S(token.clone()));
        item.insert(
            "lease_expires_at".to_string(),
            AttributeValue::N(expires_at.to_string()),
        );
        item.insert(
            "ttl".to_string(),
            AttributeValue::N((expires_at + self.ttl_buffer).to_string()),
        );

        let mut builder = ExpressionBuilder::new();
        builder
            .add_clause("PK", Operator::NotExists, vec![], BoolOp::Or)
            .expect("NotExists arity is always valid");
        builder
            .add_clause(
                "lease_expires_at",
                Operator::Le,
                vec![AttributeValue::N(now.to_string())],
                BoolOp::Or,
            )
            .expect("Le arity is always valid");

        let condition = ConditionalWriteInput {
            condition_expression: builder.render(),
            expression_attribute_names: builder.names().clone(),
            expression_attribute_values: builder.values().clone(),
        };

        self.store
            .put_item(&self.table_name, item, condition)
            .await
            .map_err(|e| {
                if matches!(e, TableTheoryError::ConditionFailed(_)) {
                    TableTheoryError::LeaseHeld(pk.to_string())
                } else {
                    e
                }
            })?;

        Ok(Lease {
            key: pk.to_string(),
            token,
            expires_at,
        })
    }

    /// Extends a held lease by `duration_secs`, conditioned on the caller
    /// still holding the current token and the lease not yet expired.
    /// Conditional failure maps to [`TableTheoryError::LeaseNotOwned`].
    pub async fn refresh(&self, lease: &Lease, duration_secs: i64) -> Result<Lease> {
        self.validate_key(&lease.key, duration_secs)?;
        if lease.token.is_empty() {
            return Err(TableTheoryError::InvalidInput("lease token must not be empty".into()));
        }

        let now = self.clock.now();
        let new_expires_at = now + duration_secs;

        let mut update_builder = ExpressionBuilder::new();
        let expires_placeholder = update_builder.name_placeholder("lease_expires_at");
        let value_placeholder = update_builder.value_placeholder(AttributeValue::N(new_expires_at.to_string()));
        let update_expression = format!("SET {expires_placeholder} = {value_placeholder}");

        // Seeded from update_builder so the condition's `lease_expires_at`
        // reference reuses the update's placeholder instead of colliding
        // with it once both are merged into one request below.
        let mut builder = ExpressionBuilder::new();
        builder.seed_from(&update_builder);
        builder
            .add_clause(
                "lease_token",
                Operator::Eq,
                vec![AttributeValue::S(lease.token.clone())],
                BoolOp::And,
            )
            .expect("Eq arity is always valid");
        builder
            .add_clause(
                "lease_expires_at",
                Operator::Gt,
                vec![AttributeValue::N(now.to_string())],
                BoolOp::And,
            )
            .expect("Gt arity is always valid");

        let mut names = update_builder.names().clone();
        names.extend(builder.names().clone());
        let mut values = update_builder.values().clone();
        values.extend(builder.values().clone());

        let input = crate::client::UpdateItemInput {
            table_name: self.table_name.clone(),
            key: self.item_key(&lease.key),
            update_expression,
            condition_expression: builder.render(),
            expression_attribute_names: names,
            expression_attribute_values: values,
            return_values: crate::client::ReturnValues::None,
        };

        self.store.update_item(input).await.map_err(|e| {
            if matches!(e, TableTheoryError::ConditionFailed(_)) {
                TableTheoryError::LeaseNotOwned(lease.key.clone())
            } else {
                e
            }
        })?;

        Ok(Lease {
            key: lease.key.clone(),
            token: lease.token.clone(),
            expires_at: new_expires_at,
        })
    }

    /// Releases a held lease. Conditional failure is treated as best-effort
    /// success: the lease had already been lost or expired, which is
    /// exactly the outcome release was trying to reach.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        if lease.key.is_empty() || lease.token.is_empty() {
            return Err(TableTheoryError::InvalidInput("lease key and token must not be empty".into()));
        }

        let mut builder = ExpressionBuilder::new();
        builder
            .add_clause(
                "lease_token",
                Operator::Eq,
                vec![AttributeValue::S(lease.token.clone())],
                BoolOp::And,
            )
            .expect("Eq arity is always valid");

        let condition = ConditionalWriteInput {
            condition_expression: builder.render(),
            expression_attribute_names: builder.names().clone(),
            expression_attribute_values: builder.values().clone(),
        };

        match self.store.delete_item(&self.table_name, &self.item_key(&lease.key), condition).await {
            Ok(()) => Ok(()),
            Err(TableTheoryError::ConditionFailed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use tabletheory_core::marshal::FixedClock;

    struct SeqTokens(std::sync::atomic::AtomicU64);

    impl TokenGenerator for SeqTokens {
        fn generate(&self) -> String {
            format!("tok{}", self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1)
        }
    }

    fn manager_at(store: Arc<MemoryStore>, now: i64) -> LeaseManager {
        LeaseManager::new(
            store,
            "leases",
            Arc::new(FixedClock(now)),
            Arc::new(SeqTokens(std::sync::atomic::AtomicU64::new(0))),
        )
    }

    #[tokio::test]
    async fn second_acquire_fails_with_lease_held() {
        let store = Arc::new(MemoryStore::new());
        let m1 = manager_at(store.clone(), 1000);
        let lease = m1.acquire("CACHE#A", 30).await.unwrap();
        assert_eq!(lease.expires_at, 1030);

        let m2 = manager_at(store.clone(), 1000);
        let err = m2.acquire("CACHE#A", 30).await.unwrap_err();
        assert!(matches!(err, TableTheoryError::LeaseHeld(_)));
    }

    #[tokio::test]
    async fn acquire_succeeds_after_expiry() {
        let store = Arc::new(MemoryStore::new());
        let m1 = manager_at(store.clone(), 1000);
        m1.acquire("CACHE#A", 30).await.unwrap();

        let m2 = manager_at(store.clone(), 2000);
        let lease2 = m2.acquire("CACHE#A", 30).await.unwrap();
        assert_eq!(lease2.expires_at, 2030);

        let refresh = m1
            .refresh(
                &Lease {
                    key: "CACHE#A".into(),
                    token: "tok1".into(),
                    expires_at: 1030,
                },
                30,
            )
            .await;
        assert!(matches!(refresh.unwrap_err(), TableTheoryError::LeaseNotOwned(_)));
        let _ = lease2;
    }

    #[tokio::test]
    async fn refresh_extends_expiry_and_preserves_token() {
        let store = Arc::new(MemoryStore::new());
        let m1 = manager_at(store.clone(), 1000);
        let lease = m1.acquire("CACHE#A", 30).await.unwrap();

        let m1_later = manager_at(store.clone(), 1010);
        let refreshed = m1_later.refresh(&lease, 30).await.unwrap();
        assert_eq!(refreshed.expires_at, 1040);
        assert_eq!(refreshed.token, lease.token);

        // Past the original expiry (1030) but before the refreshed one
        // (1040): a contender only fails here if the refresh actually
        // persisted the new `lease_expires_at`.
        let m2 = manager_at(store.clone(), 1035);
        let err = m2.acquire("CACHE#A", 30).await.unwrap_err();
        assert!(matches!(err, TableTheoryError::LeaseHeld(_)));
    }

    #[tokio::test]
    async fn release_is_best_effort() {
        let store = Arc::new(MemoryStore::new());
        let m = manager_at(store, 1000);
        let lease = m.acquire("CACHE#B", 30).await.unwrap();
        m.release(&lease).await.unwrap();
        // Second release of an already-released lease still succeeds.
        m.release(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_positive_duration() {
        let store = Arc::new(MemoryStore::new());
        let m = manager_at(store, 1000);
        let err = m.acquire("CACHE#C", 0).await.unwrap_err();
        assert!(matches!(err, TableTheoryError::InvalidInput(_)));
    }
}
