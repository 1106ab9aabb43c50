//! The shared error taxonomy (spec §6/§7).

/// Every error identifier TableTheory can surface, as a single enum.
///
/// Callers match on kind rather than on a type hierarchy; each variant
/// carries just enough context to build a useful message.
#[derive(Debug, thiserror::Error)]
pub enum TableTheoryError {
    /// The requested item does not exist.
    #[error("item not found: {table}/{key}")]
    ItemNotFound {
        /// Table the lookup targeted.
        table: String,
        /// A human-readable rendering of the key that was looked up.
        key: String,
    },

    /// A conditional write's condition expression evaluated to false.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// A registered model or descriptor violates a §3 invariant.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// A struct-tag-equivalent or DMS descriptor field is malformed.
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Two fields on the same model claim the partition or sort key role.
    #[error("duplicate primary key definition: {0}")]
    DuplicatePrimaryKey(String),

    /// A write requires a partition key value that was not supplied.
    #[error("missing primary key: {0}")]
    MissingPrimaryKey(String),

    /// An operator/arity combination is not supported, or a cursor was
    /// replayed against the wrong index, or `consistent_read` was
    /// requested on a GSI.
    #[error("invalid operator: {0}")]
    InvalidOperator(String),

    /// A pagination cursor failed to decode or carries an unknown version.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// The index selector found no index satisfying the required keys and
    /// the caller did not opt into a scan fallback.
    #[error("no suitable index for the given key conditions")]
    NoSuitableIndex,

    /// A value does not match its field's declared logical type.
    #[error("invalid value type: {0}")]
    InvalidValueType(String),

    /// An attribute-value tag did not match the schema's expected kind on
    /// read.
    #[error("invalid attribute value: {0}")]
    InvalidAttributeValue(String),

    /// An encrypted field exists on a model but no KMS key/client/rand
    /// source was configured on the `DB`.
    #[error("encryption not configured: {0}")]
    EncryptionNotConfigured(String),

    /// A query or filter predicate targeted an encrypted attribute.
    #[error("encrypted field not queryable: {0}")]
    EncryptedFieldNotQueryable(String),

    /// `acquire` found a live, unexpired lease held by someone else.
    #[error("lease held: {0}")]
    LeaseHeld(String),

    /// `refresh`/`release` was attempted against a lease this caller no
    /// longer (or never) owned.
    #[error("lease not owned: {0}")]
    LeaseNotOwned(String),

    /// A caller-supplied argument failed basic validation (empty key,
    /// non-positive duration, etc).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The target table does not exist on the backing store.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A transaction was cancelled; carries the first failing operation's
    /// index and the store's mapped reason.
    #[error("transaction cancelled at operation {operation_index}: {reason}")]
    Transaction(TransactionError),

    /// Wraps an underlying wire/transport failure that isn't any of the
    /// above (throttling that exhausted retries, network errors, etc).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Detail attached to [`TableTheoryError::Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionError {
    /// Index, within the submitted operation list, of the first operation
    /// that failed.
    pub operation_index: usize,
    /// The store's mapped cancellation reason for that operation.
    pub reason: String,
}

impl std::fmt::Display for TransactionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation {}: {}", self.operation_index, self.reason)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, TableTheoryError>;

impl TableTheoryError {
    /// Builds an [`TableTheoryError::ItemNotFound`].
    pub fn not_found(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::ItemNotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    /// Builds a [`TableTheoryError::Transaction`] from its parts.
    pub fn transaction(operation_index: usize, reason: impl Into<String>) -> Self {
        Self::Transaction(TransactionError {
            operation_index,
            reason: reason.into(),
        })
    }

    /// Returns `true` for [`TableTheoryError::ItemNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ItemNotFound { .. })
    }

    /// Returns `true` if the operation that produced this error may
    /// succeed on retry: throttling-shaped internal errors, and the
    /// "empty result" condition (modeled by callers, not by this method,
    /// since emptiness isn't an error) never land here directly, but the
    /// internal-error catch-all is the one bucket the store client is
    /// allowed to resurface as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}
