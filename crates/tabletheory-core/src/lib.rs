//! Model metadata, value encoding, and request-planning primitives.
//!
//! This crate is pure and synchronous: it holds no store-client handle and
//! performs no I/O. [`tabletheory_store`] builds the async execution engine
//! on top of the types defined here.

pub mod cursor;
pub mod encoding;
pub mod error;
pub mod expr;
pub mod index;
pub mod marshal;
pub mod naming;
pub mod query;
pub mod registry;

pub use encoding::AttributeValue;
pub use error::{Result, TableTheoryError, TransactionError};
pub use naming::NamingConvention;
pub use registry::{FieldMetadata, IndexSchema, IndexType, Metadata, ModelDescriptor, ProjectionType, ValueType};
