//! Database layer.
//!
//! This module provides database access functionality:
//! - Connection string parsing
//! - The driver seam, with a MySQL driver and a scripted one for tests
//! - Per-connection transaction handling and reconnects
//! - Per-thread pools and the process-wide pool registry
//! - Transaction coordination across connections
//! - Type mappings and literal quoting

pub mod connection;
pub mod driver;
pub mod dsn;
pub mod mysql;
pub mod pool;
pub mod quote;
pub mod registry;
pub mod savepoint;
pub mod scripted;
pub mod transaction;
pub mod types;

pub use connection::{DriverConnection, SharedConnection};
pub use driver::{Driver, DriverError, DriverHandle};
pub use dsn::{ConnectParams, ParsedFlags, ResolvedFlags, parse};
pub use mysql::MySqlDriver;
pub use pool::{PoolSettings, ThreadKey, ThreadLocalPool};
pub use quote::{QuoteLiteral, quote_literal};
pub use registry::RegistryCache;
pub use savepoint::Savepoint;
pub use scripted::ScriptedDriver;
pub use transaction::{
    Transaction, TransactionManager, TransactionParticipant, TransactionSavepoint,
    TransactionStatus,
};
