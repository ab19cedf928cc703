//! Savepoints inside an active transaction.

use crate::db::connection::DriverConnection;
use crate::error::GatewayResult;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// First server version with `SAVEPOINT` support.
pub const MIN_SAVEPOINT_VERSION: (u32, u32, u32) = (5, 0, 3);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Parse the leading `major.minor.patch` of a server version such as
/// `8.0.36-log` or `10.6.12-MariaDB`.
pub fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|part| {
        part.chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse::<u32>()
            .ok()
    });
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

pub fn supports_savepoints(version: &str) -> bool {
    parse_version(version).is_some_and(|v| v >= MIN_SAVEPOINT_VERSION)
}

/// Savepoint name derived from the wall clock, e.g. `1718000000sp123456_7`.
///
/// The sequence suffix keeps two savepoints taken within the same
/// microsecond distinct.
pub fn savepoint_name(now: DateTime<Utc>) -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}sp{:06}_{}",
        now.timestamp(),
        now.timestamp_subsec_micros(),
        seq
    )
}

/// A savepoint set on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    pub(crate) fn new(name: String) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Undo everything done on `conn` since this savepoint was set.
    pub fn rollback(&self, conn: &mut DriverConnection) -> GatewayResult<()> {
        conn.execute_raw(&format!("ROLLBACK TO {}", self.name), false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.36"), Some((8, 0, 36)));
        assert_eq!(parse_version("5.0.2-log"), Some((5, 0, 2)));
        assert_eq!(parse_version("10.6.12-MariaDB"), Some((10, 6, 12)));
        assert_eq!(parse_version("5.1"), Some((5, 1, 0)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn test_supports_savepoints() {
        assert!(supports_savepoints("5.0.3"));
        assert!(supports_savepoints("8.0.36"));
        assert!(!supports_savepoints("5.0.2"));
        assert!(!supports_savepoints("4.1.22"));
        assert!(!supports_savepoints(""));
    }

    #[test]
    fn test_savepoint_names_are_unique() {
        let now = Utc::now();
        let a = savepoint_name(now);
        let b = savepoint_name(now);
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("{}sp", now.timestamp())));
        assert!(!a.contains('.'));
    }
}
