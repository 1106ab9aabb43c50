//! Re-exports the shared error taxonomy for store-side modules.

pub use tabletheory_core::error::{Result, TableTheoryError, TransactionError};
