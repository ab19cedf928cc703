//! Per-thread connection pool.
//!
//! A `ThreadLocalPool` owns the parsed connection string and hands every
//! worker thread its own `DriverConnection`, created on first use. The map
//! is never locked across driver I/O: connections are opened outside of it
//! and inserted with a re-check, so a racing duplicate is simply dropped.

use crate::db::connection::{DriverConnection, SharedConnection};
use crate::db::driver::{Driver, DriverError, DriverHandle, codes};
use crate::db::dsn::{ConnectParams, ParsedFlags, ResolvedFlags, parse};
use crate::db::quote::{QuoteLiteral, quote_identifier};
use crate::db::transaction::{ParticipantSavepoint, TransactionManager, TransactionParticipant};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    ColumnDefinition, ConnectionInfo, ConnectionKey, QueryResult, TableInfo,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_KEY: ThreadKey = ThreadKey(NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed));
}

/// Identity of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ThreadKey(u64);

impl ThreadKey {
    /// Key of the calling OS thread. Stable for the thread's lifetime.
    pub fn current() -> Self {
        THREAD_KEY.with(|key| *key)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Options that shape how a pool connects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSettings {
    pub use_unicode: bool,
    /// Overrides the charset implied by `use_unicode`.
    pub charset: Option<String>,
    /// Create the database when the server does not know it.
    pub auto_create_db: bool,
}

pub struct ThreadLocalPool {
    driver: Arc<dyn Driver>,
    connection_string: String,
    flags: Arc<ResolvedFlags>,
    settings: PoolSettings,
    transactions: Arc<TransactionManager>,
    connections: DashMap<ThreadKey, SharedConnection>,
    connected_at: DateTime<Utc>,
}

impl std::fmt::Debug for ThreadLocalPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalPool")
            .field("database", &self.name())
            .field("transactional", &self.flags.transactional)
            .field("connections", &self.connections.len())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl ThreadLocalPool {
    /// Parse `connection_string` and probe the server once.
    ///
    /// The probe decides whether connections are transactional and, when
    /// enabled, creates a missing database.
    pub fn open(
        driver: Arc<dyn Driver>,
        connection_string: &str,
        settings: PoolSettings,
        transactions: Arc<TransactionManager>,
    ) -> GatewayResult<Self> {
        let parsed = parse(
            connection_string,
            settings.use_unicode,
            settings.charset.as_deref(),
        );

        info!(
            database = ?parsed.database(),
            host = ?parsed.params.host,
            lock = ?parsed.lock_name,
            mode = ?parsed.transaction_mode,
            "Opening connection pool"
        );

        let server_transactional = probe_server(driver.as_ref(), &parsed, &settings)?;
        let flags = ResolvedFlags::resolve(parsed, server_transactional)?;

        info!(
            database = ?flags.parsed.database(),
            transactional = flags.transactional,
            use_tm = flags.use_tm,
            "Connection pool ready"
        );

        Ok(Self {
            driver,
            connection_string: connection_string.to_string(),
            flags: Arc::new(flags),
            settings,
            transactions,
            connections: DashMap::new(),
            connected_at: Utc::now(),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn flags(&self) -> &ResolvedFlags {
        &self.flags
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Name of the database this pool connects to.
    pub fn name(&self) -> Option<&str> {
        self.flags.parsed.database()
    }

    /// Connection of `key`, opened on first use.
    pub fn get(&self, key: ThreadKey) -> GatewayResult<SharedConnection> {
        if let Some(existing) = self.connections.get(&key) {
            return Ok(existing.clone());
        }

        // Connect without holding any map lock
        let created = SharedConnection::new(DriverConnection::open(
            Arc::clone(&self.driver),
            Arc::clone(&self.flags),
        )?);

        let winner = match self.connections.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!(thread = key.as_u64(), "Created thread connection");
                entry.insert(created.clone());
                return Ok(created);
            }
        };
        // Lost a race for the same key; `created` closes on drop
        drop(created);
        Ok(winner)
    }

    /// Connection of the calling thread.
    pub fn connection(&self) -> GatewayResult<SharedConnection> {
        self.get(ThreadKey::current())
    }

    /// Forget the connection of `key`. Unknown keys are ignored.
    pub fn remove(&self, key: ThreadKey) {
        if let Some((_, conn)) = self.connections.remove(&key) {
            debug!(thread = key.as_u64(), "Removed thread connection");
            drop(conn);
        }
    }

    /// Forget the calling thread's connection, e.g. after the connection
    /// string changed.
    pub fn close_connection(&self) {
        self.remove(ThreadKey::current());
    }

    /// Forget every connection. Each closes once no transaction holds it.
    pub fn clear(&self) {
        let keys: Vec<ThreadKey> = self.connections.iter().map(|e| *e.key()).collect();
        for key in keys {
            self.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn info(&self, key: ConnectionKey) -> ConnectionInfo {
        ConnectionInfo {
            key,
            database: self.name().map(String::from),
            transactional: self.flags.transactional,
            lock_name: self.flags.lock_name().map(String::from),
            connected_at: self.connected_at,
            open_connections: self.len(),
        }
    }

    // =========================================================================
    // Pass-through operations on the calling thread's connection
    // =========================================================================

    /// Run `sql`, joining the thread's ambient transaction first when needed.
    pub fn query(&self, sql: &str, max_rows: usize) -> GatewayResult<QueryResult> {
        let key = ThreadKey::current();
        let shared = self.get(key)?;
        let mut conn = shared.lock();

        if self.flags.use_tm && !conn.is_registered() {
            let participant: Arc<dyn TransactionParticipant> = Arc::new(shared.clone());
            match self.transactions.current(key).join(participant) {
                Ok(()) => conn.set_registered(true),
                Err(err) => {
                    error!(error = %err, "Database connection failed to join transaction");
                }
            }
        }
        // Joined once per transaction; begin is retried until it succeeds
        if conn.is_registered() {
            conn.begin()?;
        }

        conn.query(sql, max_rows)
    }

    pub fn tables(&self) -> GatewayResult<Vec<TableInfo>> {
        self.connection()?.lock().tables()
    }

    pub fn columns(&self, table: &str) -> GatewayResult<Vec<ColumnDefinition>> {
        self.connection()?.lock().columns(table)
    }

    pub fn variables(&self) -> GatewayResult<BTreeMap<String, String>> {
        self.connection()?.lock().variables()
    }

    pub fn quote_literal<T: QuoteLiteral + ?Sized>(&self, value: &T) -> T::Output {
        value.quote_literal()
    }

    /// Savepoint on the calling thread's connection.
    pub fn savepoint(&self) -> GatewayResult<Box<dyn ParticipantSavepoint>> {
        self.connection()?.savepoint()
    }
}

/// Connect once to learn the server's transaction support.
fn probe_server(
    driver: &dyn Driver,
    parsed: &ParsedFlags,
    settings: &PoolSettings,
) -> GatewayResult<bool> {
    let mut handle = match driver.connect(&parsed.params) {
        Ok(handle) => handle,
        Err(err) if settings.auto_create_db && err.code == codes::ER_BAD_DB_ERROR => {
            create_database(driver, &parsed.params, err)?
        }
        Err(err) => return Err(connection_error(err)),
    };

    let transactional = handle.supports_transactions();
    if let Err(err) = handle.close() {
        debug!(error = %err, "Ignoring close failure of probe connection");
    }
    Ok(transactional)
}

/// Create the missing database and return a connection to the bare server.
fn create_database(
    driver: &dyn Driver,
    params: &ConnectParams,
    original: DriverError,
) -> GatewayResult<Box<dyn DriverHandle>> {
    let Some(database) = params.database.as_deref() else {
        return Err(connection_error(original));
    };

    let mut handle = driver
        .connect(&params.without_database())
        .map_err(connection_error)?;

    let mut sql = format!("CREATE DATABASE {}", quote_identifier(database));
    if let Some(charset) = &params.charset {
        sql.push_str(&format!(" DEFAULT CHARACTER SET {charset}"));
    }
    warn!(database = %database, "Database missing, creating it");
    handle.query(&sql).map_err(|err| {
        error!(query = %sql, error = %err, "Failed to create database");
        GatewayError::from(err)
    })?;
    Ok(handle)
}

/// Map a failed connect to an error with a helpful suggestion.
fn connection_error(err: DriverError) -> GatewayError {
    let suggestion = match err.code {
        1045 => "Verify the username and password in the connection string",
        codes::ER_BAD_DB_ERROR => {
            "Check that the database name exists, or enable automatic database creation"
        }
        codes::CR_CONN_HOST_ERROR | 2002 | 2005 => {
            "Check that the MySQL server is running and accessible"
        }
        _ => {
            "Verify the connection string format: \
             [*lock] [+|-]database[@host[:port]] [user [password [unix_socket]]]"
        }
    };
    warn!(code = err.code, error = %err.message, "Failed to connect");
    GatewayError::connection(format!("Failed to connect: {err}"), suggestion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::scripted::{ScriptEvent, ScriptedDriver};
    use std::thread;

    fn open_pool(driver: &ScriptedDriver, dsn: &str, settings: PoolSettings) -> GatewayResult<ThreadLocalPool> {
        ThreadLocalPool::open(
            Arc::new(driver.clone()),
            dsn,
            settings,
            Arc::new(TransactionManager::new()),
        )
    }

    #[test]
    fn test_thread_key_is_stable_per_thread() {
        let here = ThreadKey::current();
        assert_eq!(here, ThreadKey::current());
        let there = thread::spawn(ThreadKey::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_open_probes_and_closes() {
        let driver = ScriptedDriver::new();
        let pool = open_pool(&driver, "shop user pw", PoolSettings::default()).unwrap();
        assert_eq!(pool.name(), Some("shop"));
        assert!(pool.flags().transactional);
        assert!(pool.is_empty());
        assert_eq!(driver.connect_count(), 1);
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_required_transactions_unsupported() {
        let driver = ScriptedDriver::new();
        driver.with_transactions(false);
        let err = open_pool(&driver, "+shop", PoolSettings::default()).unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedFeature { .. }));
    }

    #[test]
    fn test_plain_server_runs_without_transactions() {
        let driver = ScriptedDriver::new();
        driver.with_transactions(false);
        let pool = open_pool(&driver, "shop", PoolSettings::default()).unwrap();
        assert!(!pool.flags().transactional);
        assert!(!pool.flags().use_tm);

        pool.query("UPDATE stock SET n = 0", 0).unwrap();
        assert!(!pool.connection().unwrap().lock().is_registered());
        assert_eq!(driver.statements(), vec!["UPDATE stock SET n = 0"]);
    }

    #[test]
    fn test_auto_create_database() {
        let driver = ScriptedDriver::new();
        driver.with_missing_database("shop");
        let settings = PoolSettings {
            use_unicode: true,
            auto_create_db: true,
            ..Default::default()
        };
        let pool = open_pool(&driver, "shop user", settings).unwrap();
        assert_eq!(
            driver.statements(),
            vec!["CREATE DATABASE `shop` DEFAULT CHARACTER SET utf8"]
        );
        // The database now exists
        pool.get(ThreadKey::from_raw(1)).unwrap();
    }

    #[test]
    fn test_missing_database_without_auto_create() {
        let driver = ScriptedDriver::new();
        driver.with_missing_database("shop");
        let err = open_pool(&driver, "shop", PoolSettings::default()).unwrap_err();
        assert!(err.suggestion().unwrap().contains("database name"));
        assert!(driver.statements().is_empty());
    }

    #[test]
    fn test_get_same_key_same_connection() {
        let driver = ScriptedDriver::new();
        let pool = open_pool(&driver, "shop", PoolSettings::default()).unwrap();
        let a = pool.get(ThreadKey::from_raw(1)).unwrap();
        let again = pool.get(ThreadKey::from_raw(1)).unwrap();
        let b = pool.get(ThreadKey::from_raw(2)).unwrap();
        assert!(a.ptr_eq(&again));
        assert!(!a.ptr_eq(&b));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let driver = ScriptedDriver::new();
        let pool = open_pool(&driver, "shop", PoolSettings::default()).unwrap();
        pool.get(ThreadKey::from_raw(1)).unwrap();
        pool.get(ThreadKey::from_raw(2)).unwrap();

        pool.remove(ThreadKey::from_raw(1));
        pool.remove(ThreadKey::from_raw(99));
        assert_eq!(pool.len(), 1);

        pool.clear();
        assert!(pool.is_empty());
        // probe + two thread connections
        assert_eq!(driver.close_count(), 3);
    }

    #[test]
    fn test_each_thread_gets_its_own_connection() {
        let driver = ScriptedDriver::new();
        let pool = Arc::new(open_pool(&driver, "-shop", PoolSettings::default()).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    pool.query("SELECT 1", 0).unwrap();
                    pool.query("SELECT 2", 0).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.len(), 4);
        // probe + one per thread
        assert_eq!(driver.connect_count(), 5);
    }

    #[test]
    fn test_query_joins_transaction_once() {
        let driver = ScriptedDriver::new();
        let transactions = Arc::new(TransactionManager::new());
        let pool = ThreadLocalPool::open(
            Arc::new(driver.clone()),
            "shop",
            PoolSettings::default(),
            Arc::clone(&transactions),
        )
        .unwrap();

        pool.query("SELECT 1", 0).unwrap();
        pool.query("SELECT 2", 0).unwrap();
        let txn = transactions.current(ThreadKey::current());
        assert_eq!(txn.participant_count(), 1);

        transactions.commit(ThreadKey::current()).unwrap();
        assert_eq!(
            driver.statements(),
            vec!["BEGIN", "SELECT 1", "SELECT 2", "COMMIT"]
        );

        // The next request starts a new transaction
        pool.query("SELECT 3", 0).unwrap();
        transactions.abort(ThreadKey::current()).unwrap();
        assert_eq!(
            &driver.statements()[4..],
            &["BEGIN", "SELECT 3", "ROLLBACK"]
        );
    }

    #[test]
    fn test_non_transactional_pool_does_not_join() {
        let driver = ScriptedDriver::new();
        let transactions = Arc::new(TransactionManager::new());
        let pool = ThreadLocalPool::open(
            Arc::new(driver.clone()),
            "-shop",
            PoolSettings::default(),
            Arc::clone(&transactions),
        )
        .unwrap();
        pool.query("SELECT 1", 0).unwrap();
        assert!(transactions.is_empty());
        assert_eq!(driver.statements(), vec!["SELECT 1"]);
    }

    #[test]
    fn test_close_connection_only_affects_current_thread() {
        let driver = ScriptedDriver::new();
        let pool = Arc::new(open_pool(&driver, "-shop", PoolSettings::default()).unwrap());
        pool.query("SELECT 1", 0).unwrap();
        let other = Arc::clone(&pool);
        thread::spawn(move || other.query("SELECT 1", 0).unwrap())
            .join()
            .unwrap();
        assert_eq!(pool.len(), 2);

        pool.close_connection();
        assert_eq!(pool.len(), 1);
        assert!(driver
            .events()
            .iter()
            .any(|e| matches!(e, ScriptEvent::Close { .. })));
    }
}
