//! Connection-related data models.
//!
//! This module defines types for connection identity and state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a logical connection slot, e.g. the path of the object
/// that owns the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(String);

impl ConnectionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build a key from path segments, joined with `/`.
    pub fn from_path<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self(path)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How the connection string asks for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Use transactions if the server supports them.
    #[default]
    Auto,
    /// `+database`: fail to connect if the server lacks transactions.
    Required,
    /// `-database`: never use transactions.
    Disabled,
}

impl TransactionMode {
    /// DSN prefix character for this mode.
    pub fn prefix(&self) -> Option<char> {
        match self {
            Self::Auto => None,
            Self::Required => Some('+'),
            Self::Disabled => Some('-'),
        }
    }
}

/// Information about a connected gateway.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub transactional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_name: Option<String>,
    /// When the pool behind this connection was opened. Liveness marker only.
    pub connected_at: DateTime<Utc>,
    pub open_connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_path() {
        let key = ConnectionKey::from_path(["", "app", "db_conn"]);
        assert_eq!(key.as_str(), "/app/db_conn");
        assert_eq!(key, ConnectionKey::from("/app/db_conn"));
    }

    #[test]
    fn test_transaction_mode_prefix() {
        assert_eq!(TransactionMode::Required.prefix(), Some('+'));
        assert_eq!(TransactionMode::Disabled.prefix(), Some('-'));
        assert_eq!(TransactionMode::default().prefix(), None);
    }
}
