//! Async execution engine for the object mapper.
//!
//! Builds the store-facing runtime — `DB`, `Query`, `UpdateBuilder`,
//! `TransactionBuilder`, `LeaseManager`, envelope encryption, retry/backoff
//! — on top of the pure planning types [`tabletheory_core`] defines.

pub mod client;
pub mod config;
pub mod consistency;
pub mod encryption;
pub mod error;
pub mod facade;
pub mod lease;
pub mod query;
pub mod testing;
pub mod transaction;
pub mod update;

// Re-exports for convenience.
pub use client::{
    ConditionalWriteInput, DataKey, KmsClient, QueryInput, QueryOutput, ReturnValues, StoreClient,
    TableDescriptor, TransactWriteOperation, UpdateItemInput, UpdateItemOutput,
};
pub use config::Config;
pub use consistency::{BackoffPolicy, ReadAfterWriteHelper, RetryCondition, VerifyOptions, WriteAndReadPattern};
pub use encryption::Encryptor;
pub use error::{Result, TableTheoryError};
pub use facade::{Query, DB};
pub use lease::{Lease, LeaseManager, TokenGenerator};
pub use transaction::TransactionBuilder;
pub use update::UpdateBuilder;
