//! Configuration handling for the MySQL gateway.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use crate::format::OutputFormat;
use crate::gateway::GatewaySettings;
use crate::models::{ConnectionKey, DEFAULT_MAX_ROWS};
use clap::{Parser, Subcommand};

pub const DEFAULT_GATEWAY_ID: &str = "mysql_database_connection";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration for the MySQL gateway command line.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mysql-gateway",
    about = "Per-thread pooled, transaction-aware MySQL gateway",
    version,
    author
)]
pub struct Config {
    /// Connection string:
    /// "[*lock] [+|-]database[@host[:port]] [user [password [unix_socket]]]"
    #[arg(short = 'c', long = "connection", value_name = "DSN", env = "GATEWAY_CONNECTION")]
    pub connection: String,

    /// Registry key of the gateway (defaults to the gateway id)
    #[arg(long, env = "GATEWAY_KEY")]
    pub key: Option<String>,

    /// Maximum rows returned by a query (0 = unlimited)
    #[arg(long, default_value_t = DEFAULT_MAX_ROWS, env = "GATEWAY_MAX_ROWS")]
    pub max_rows: usize,

    /// Talk to the server in utf8
    #[arg(long, env = "GATEWAY_USE_UNICODE")]
    pub use_unicode: bool,

    /// Connection charset (overrides --use-unicode)
    #[arg(long, env = "GATEWAY_CHARSET")]
    pub charset: Option<String>,

    /// Create the database when the server does not know it
    #[arg(long, env = "GATEWAY_AUTO_CREATE_DB")]
    pub auto_create_db: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json", env = "GATEWAY_FORMAT")]
    pub format: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = DEFAULT_LOG_LEVEL, env = "GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "GATEWAY_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run SQL; statements may be separated by NUL bytes
    Query {
        sql: String,
        /// Commit instead of rolling back at the end
        #[arg(long)]
        commit: bool,
    },
    /// List tables
    Tables,
    /// List the columns of a table
    Columns { table: String },
    /// Show server variables
    Variables,
    /// Tables with their columns
    Browse,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the configuration, returning a message for the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.connection.trim().is_empty() {
            return Err("connection string must not be empty".to_string());
        }
        if let Some(charset) = &self.charset {
            if charset.is_empty() || !charset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid charset: {charset:?}"));
            }
        }
        if let Some(key) = &self.key {
            if key.trim().is_empty() {
                return Err("key must not be empty".to_string());
            }
        }
        if let Command::Columns { table } = &self.command {
            if table.trim().is_empty() {
                return Err("table name must not be empty".to_string());
            }
        }
        Ok(())
    }

    pub fn to_settings(&self) -> GatewaySettings {
        let key = self
            .key
            .clone()
            .unwrap_or_else(|| DEFAULT_GATEWAY_ID.to_string());
        GatewaySettings {
            id: DEFAULT_GATEWAY_ID.to_string(),
            key: ConnectionKey::new(key),
            title: String::new(),
            connection_string: self.connection.clone(),
            use_unicode: self.use_unicode,
            charset: self.charset.clone(),
            auto_create_db: self.auto_create_db,
            max_rows: self.max_rows,
        }
    }
}
