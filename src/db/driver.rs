//! Driver abstraction.
//!
//! The gateway never speaks the MySQL protocol itself. Everything below
//! `DriverConnection` goes through the two traits in this module, which keeps
//! the pool and transaction logic testable against the scripted driver.

use crate::db::dsn::ConnectParams;
use crate::db::types::NativeType;
use crate::models::Value;
use std::fmt;

/// MySQL client (`CR_*`) and server (`ER_*`) error numbers the gateway reacts to.
pub mod codes {
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_BAD_FIELD_ERROR: u16 = 1054;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;

    pub const CR_UNKNOWN_ERROR: u16 = 2000;
    pub const CR_CONN_HOST_ERROR: u16 = 2003;
    pub const CR_SERVER_GONE_ERROR: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const CR_COMMANDS_OUT_OF_SYNC: u16 = 2014;
}

/// Error reported by a driver, identified by its MySQL error number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("({code}) {message}")]
pub struct DriverError {
    pub code: u16,
    pub message: String,
}

impl DriverError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The connection is unusable and must be re-established.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self.code,
            codes::CR_SERVER_GONE_ERROR | codes::CR_SERVER_LOST | codes::CR_COMMANDS_OUT_OF_SYNC
        )
    }

    /// The statement itself is wrong; retrying cannot help.
    pub fn is_syntax(&self) -> bool {
        matches!(self.code, codes::ER_BAD_FIELD_ERROR | codes::ER_PARSE_ERROR)
    }

    /// Human readable hint for the connection-loss codes.
    pub fn loss_reason(&self) -> Option<&'static str> {
        match self.code {
            codes::CR_SERVER_GONE_ERROR => Some("Server gone."),
            codes::CR_SERVER_LOST => Some("Server lost."),
            codes::CR_COMMANDS_OUT_OF_SYNC => {
                Some("Commands out of sync. Possibly a misplaced semicolon (;) in a query.")
            }
            _ => None,
        }
    }
}

/// Column description as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    pub native_type: NativeType,
    /// Display width, when the driver reports one.
    pub width: Option<u32>,
    pub nullable: Option<bool>,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, native_type: NativeType) -> Self {
        Self {
            name: name.into(),
            native_type,
            width: None,
            nullable: None,
        }
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }
}

/// One result set returned by a single statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResultSet {
    pub columns: Vec<RawColumn>,
    pub rows: Vec<Vec<Value>>,
}

impl RawResultSet {
    pub fn new(columns: Vec<RawColumn>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Whether this set has the schema `columns` describes. Only names and
    /// native types count; width and nullability depend on how the driver
    /// obtained the metadata.
    pub fn same_schema(&self, columns: &[RawColumn]) -> bool {
        self.columns.len() == columns.len()
            && self
                .columns
                .iter()
                .zip(columns)
                .all(|(a, b)| a.name == b.name && a.native_type == b.native_type)
    }

    /// Text of the cell at `(row, col)`, if it holds text or bytes.
    pub fn text(&self, row: usize, col: usize) -> Option<String> {
        self.rows.get(row)?.get(col)?.as_text_lossy()
    }
}

/// One open driver-level connection.
///
/// Implementations are used from a single thread at a time.
pub trait DriverHandle: Send {
    /// Execute `sql` and return its first result set, if it produced one.
    fn query(&mut self, sql: &str) -> Result<Option<RawResultSet>, DriverError>;

    /// Fetch the next pending result set of the last statement.
    fn next_result(&mut self) -> Result<Option<RawResultSet>, DriverError>;

    /// Check the connection, re-establishing it when reconnect is enabled.
    fn ping(&mut self) -> Result<(), DriverError>;

    /// Enable or disable reconnect-on-ping. Persistent for the handle.
    fn set_reconnect(&mut self, enabled: bool);

    /// Whether the server advertised transaction support at handshake.
    fn supports_transactions(&self) -> bool;

    fn close(&mut self) -> Result<(), DriverError>;
}

/// Factory for driver-level connections.
pub trait Driver: Send + Sync + fmt::Debug {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn DriverHandle>, DriverError>;
}
