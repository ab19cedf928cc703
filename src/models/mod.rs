//! Data models for the MySQL gateway.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

pub use connection::{ConnectionInfo, ConnectionKey, TransactionMode};
pub use query::{ColumnDescriptor, DEFAULT_MAX_ROWS, QueryResult, TypeTag, Value};
pub use schema::{ColumnDefinition, TableInfo, TableNode, TableType};
