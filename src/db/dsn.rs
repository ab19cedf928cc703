//! Connection string parsing.
//!
//! # Format
//!
//! ```text
//! [*lockname] [+|-]database[@host[:port]] [user [password [unix_socket]]]
//! ```
//!
//! - `*lockname` asks for an advisory `GET_LOCK` around every transaction
//! - `+database` requires transactions, `-database` disables them
//! - every token after the database is optional
//!
//! # Examples
//!
//! ```text
//! shop_db shop_user secret
//! +shop_db@127.0.0.1:3306 shop_user secret
//! *orders shop_db@db.internal shop_user secret
//! -shop_db shop_user secret /var/run/mysqld/mysqld.sock
//! ```

use crate::error::{GatewayError, GatewayResult};
use crate::models::TransactionMode;
use serde::Serialize;
use std::fmt;
use tracing::warn;

/// Charset requested when unicode is enabled without an explicit charset.
pub const UNICODE_CHARSET: &str = "utf8";

/// Driver-level connection parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Sensitive - never logged or serialized
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<String>,
    pub use_unicode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
}

impl ConnectParams {
    /// Same parameters without a default database, used to create it.
    pub fn without_database(&self) -> Self {
        Self {
            database: None,
            ..self.clone()
        }
    }
}

/// Everything a connection string says, parsed once per pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedFlags {
    pub params: ConnectParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_name: Option<String>,
    pub transaction_mode: TransactionMode,
}

impl ParsedFlags {
    pub fn database(&self) -> Option<&str> {
        self.params.database.as_deref()
    }
}

/// Renders the canonical connection string. Parsing the output yields equal flags.
impl fmt::Display for ParsedFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.params;
        let mut tokens: Vec<String> = Vec::new();

        if let Some(lock) = &self.lock_name {
            tokens.push(format!("*{lock}"));
        }

        let mut db_token = String::new();
        if let Some(prefix) = self.transaction_mode.prefix() {
            db_token.push(prefix);
        }
        if let Some(db) = &p.database {
            db_token.push_str(db);
        }
        if p.host.is_some() || p.port.is_some() {
            db_token.push('@');
            db_token.push_str(p.host.as_deref().unwrap_or(""));
            if let Some(port) = p.port {
                db_token.push_str(&format!(":{port}"));
            }
        }

        let trailing: Vec<&str> = [&p.user, &p.password, &p.unix_socket]
            .into_iter()
            .map_while(|t| t.as_deref())
            .collect();

        // An empty positional token would vanish when re-split on whitespace.
        if db_token.is_empty() && !trailing.is_empty() {
            db_token.push('@');
        }
        if !db_token.is_empty() {
            tokens.push(db_token);
        }
        tokens.extend(trailing.into_iter().map(String::from));

        f.write_str(&tokens.join(" "))
    }
}

/// Parsed flags plus what the server said about transactions.
///
/// Built once per pool and shared by all of its connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedFlags {
    #[serde(flatten)]
    pub parsed: ParsedFlags,
    pub transactional: bool,
    /// Join the ambient transaction on first query.
    pub use_tm: bool,
}

impl ResolvedFlags {
    /// Apply the transaction mode to the probed server capability.
    pub fn resolve(parsed: ParsedFlags, server_transactional: bool) -> GatewayResult<Self> {
        let transactional = match parsed.transaction_mode {
            TransactionMode::Disabled => false,
            TransactionMode::Required if !server_transactional => {
                return Err(GatewayError::unsupported(
                    "transactions not supported by the server",
                ));
            }
            _ => server_transactional,
        };
        let use_tm = transactional || parsed.lock_name.is_some();
        Ok(Self {
            parsed,
            transactional,
            use_tm,
        })
    }

    pub fn lock_name(&self) -> Option<&str> {
        self.parsed.lock_name.as_deref()
    }

    pub fn params(&self) -> &ConnectParams {
        &self.parsed.params
    }
}

/// Parse a connection string. Never fails: missing parts stay `None`.
pub fn parse(connection: &str, use_unicode: bool, charset: Option<&str>) -> ParsedFlags {
    let mut params = ConnectParams {
        use_unicode,
        charset: match (charset, use_unicode) {
            (Some(cs), _) => Some(cs.to_string()),
            (None, true) => Some(UNICODE_CHARSET.to_string()),
            (None, false) => None,
        },
        ..ConnectParams::default()
    };

    let mut items = connection.split_whitespace();
    let mut lock_name = None;
    let mut transaction_mode = TransactionMode::Auto;

    let mut first = items.next();
    if let Some(lock) = first.and_then(|t| t.strip_prefix('*')) {
        lock_name = Some(lock.to_string()).filter(|l| !l.is_empty());
        first = items.next();
    }

    if let Some(db_host) = first {
        let (db, host_port) = match db_host.split_once('@') {
            Some((db, rest)) => (db, Some(rest)),
            None => (db_host, None),
        };

        if let Some(host_port) = host_port {
            let (host, port) = match host_port.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            };
            params.host = Some(host.to_string()).filter(|h| !h.is_empty());
            params.port = port.and_then(|p| match p.parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!(port = %p, "Ignoring invalid port in connection string");
                    None
                }
            });
        }

        let db = if let Some(rest) = db.strip_prefix('+') {
            transaction_mode = TransactionMode::Required;
            rest
        } else if let Some(rest) = db.strip_prefix('-') {
            transaction_mode = TransactionMode::Disabled;
            rest
        } else {
            db
        };
        params.database = Some(db.to_string()).filter(|d| !d.is_empty());

        params.user = items.next().map(String::from);
        params.password = items.next().map(String::from);
        params.unix_socket = items.next().map(String::from);
    }

    ParsedFlags {
        params,
        lock_name,
        transaction_mode,
    }
}
