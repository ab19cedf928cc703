//! One driver-level connection and its transaction state.
//!
//! A `DriverConnection` belongs to exactly one worker thread. It knows how to
//! recover from a dropped server connection, how to begin and finish the
//! database side of a two-phase transaction, and how to turn raw driver
//! results into the gateway's result types.

use crate::db::driver::{Driver, DriverError, DriverHandle, RawColumn, RawResultSet, codes};
use crate::db::dsn::ResolvedFlags;
use crate::db::quote::{QuoteLiteral, quote_identifier, quote_literal};
use crate::db::savepoint::{Savepoint, savepoint_name, supports_savepoints};
use crate::db::transaction::{ParticipantSavepoint, TransactionParticipant};
use crate::db::types::{column_icon, key_text, split_column_type};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    ColumnDefinition, ColumnDescriptor, QueryResult, TableInfo, TableType, Value,
};
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct DriverConnection {
    driver: Arc<dyn Driver>,
    flags: Arc<ResolvedFlags>,
    handle: Box<dyn DriverHandle>,
    transaction_begun: bool,
    registered: bool,
    version: Option<String>,
}

impl std::fmt::Debug for DriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnection")
            .field("database", &self.flags.parsed.database())
            .field("transactional", &self.flags.transactional)
            .field("lock_name", &self.flags.lock_name())
            .field("transaction_begun", &self.transaction_begun)
            .field("registered", &self.registered)
            .finish()
    }
}

impl DriverConnection {
    /// Connect and enable reconnect-on-ping.
    pub fn open(driver: Arc<dyn Driver>, flags: Arc<ResolvedFlags>) -> GatewayResult<Self> {
        let mut handle = driver.connect(flags.params())?;
        handle.set_reconnect(true);
        debug!(database = ?flags.parsed.database(), "Opened connection");
        Ok(Self {
            driver,
            flags,
            handle,
            transaction_begun: false,
            registered: false,
            version: None,
        })
    }

    pub fn flags(&self) -> &ResolvedFlags {
        &self.flags
    }

    pub fn is_transaction_begun(&self) -> bool {
        self.transaction_begun
    }

    /// Whether this connection has joined the current ambient transaction.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn set_registered(&mut self, registered: bool) {
        self.registered = registered;
    }

    // =========================================================================
    // Transaction handling
    // =========================================================================

    /// Start the database side of a transaction.
    ///
    /// Any failure is reported as `Conflict` so the caller retries the whole
    /// request. A failed begin leaves the connection outside the transaction,
    /// so the next call tries again.
    pub fn begin(&mut self) -> GatewayResult<()> {
        if self.transaction_begun {
            return Ok(());
        }
        self.transaction_begun = true;
        self.begin_inner().map_err(|err| {
            self.transaction_begun = false;
            error!(error = %err, "Exception during begin");
            GatewayError::conflict(format!("begin failed: {err}"))
        })
    }

    fn begin_inner(&mut self) -> GatewayResult<()> {
        self.handle.ping()?;
        if self.flags.transactional {
            self.execute_raw("BEGIN", false)?;
        }
        if let Some(lock) = self.flags.lock_name().map(str::to_string) {
            let sql = format!("SELECT GET_LOCK({},0)", quote_literal(lock.as_str()));
            let acquired = self
                .execute_raw(&sql, false)?
                .and_then(|set| set.rows.first().and_then(|row| row.first().cloned()))
                .and_then(|v| v.as_int());
            if acquired != Some(1) {
                return Err(GatewayError::conflict(format!("lock '{lock}' is held elsewhere")));
            }
        }
        Ok(())
    }

    /// Finish the database side of a committed transaction.
    ///
    /// The lock release and the `COMMIT` are both attempted; a failure of
    /// either is reported as `Conflict`.
    pub fn commit(&mut self) -> GatewayResult<()> {
        self.registered = false;
        if !self.transaction_begun {
            return Ok(());
        }
        self.transaction_begun = false;

        let mut first_error = None;
        if let Some(lock) = self.flags.lock_name().map(str::to_string) {
            let sql = format!("SELECT RELEASE_LOCK({})", quote_literal(lock.as_str()));
            if let Err(err) = self.execute_raw(&sql, false) {
                error!(error = %err, "Exception during commit");
                first_error.get_or_insert(err);
            }
        }
        if self.flags.transactional {
            if let Err(err) = self.execute_raw("COMMIT", false) {
                error!(error = %err, "Exception during commit");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(GatewayError::conflict(format!("commit failed: {err}"))),
            None => Ok(()),
        }
    }

    /// Roll back the database side of an aborted transaction.
    pub fn abort(&mut self) -> GatewayResult<()> {
        self.registered = false;
        if !self.transaction_begun {
            return Ok(());
        }
        self.transaction_begun = false;

        let mut first_error = None;
        if let Some(lock) = self.flags.lock_name().map(str::to_string) {
            let sql = format!("SELECT RELEASE_LOCK({})", quote_literal(lock.as_str()));
            if let Err(err) = self.execute_raw(&sql, false) {
                first_error.get_or_insert(err);
            }
        }
        if self.flags.transactional {
            if let Err(err) = self.execute_raw("ROLLBACK", false) {
                first_error.get_or_insert(err);
            }
        } else {
            error!("Aborting when non-transactional");
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Set a savepoint in the running transaction.
    pub fn savepoint(&mut self) -> GatewayResult<Savepoint> {
        let version = self.server_version()?;
        if !supports_savepoints(&version) {
            warn!(version = %version, "Savepoints unsupported with MySQL < 5.0.3");
            return Err(GatewayError::not_available(format!(
                "savepoints are not supported by MySQL {version}"
            )));
        }
        if !self.transaction_begun {
            error!("Savepoint used outside of transaction");
            return Err(GatewayError::not_available(
                "savepoint used outside of transaction",
            ));
        }

        let name = savepoint_name(Utc::now());
        self.execute_raw(&format!("SAVEPOINT {name}"), false)?;
        Ok(Savepoint::new(name))
    }

    // =========================================================================
    // Statement execution
    // =========================================================================

    /// Run one statement, recovering from a dropped connection when nothing
    /// connection-bound (transaction, lock) would be lost by reconnecting.
    pub fn execute_raw(
        &mut self,
        sql: &str,
        force_reconnect: bool,
    ) -> GatewayResult<Option<RawResultSet>> {
        let err = match self.handle.query(sql) {
            Ok(result) => return Ok(result),
            Err(err) => err,
        };

        if err.is_syntax() {
            warn!(query = %sql, error = %err, "Query failed");
            return Err(GatewayError::syntax(err.message, sql));
        }

        if !err.is_connection_loss() {
            warn!(query = %sql, error = %err, "Query failed");
            return Err(err.into());
        }

        let bound = self.flags.transactional || self.flags.lock_name().is_some();
        if bound && !force_reconnect {
            warn!(query = %sql, error = %err, "Query failed on a connection-bound session");
            // Reconnecting would drop the transaction or lock, so the
            // transaction as a whole has to be retried
            return Err(GatewayError::conflict(format!(
                "connection lost inside a transaction: {err} (query: {sql})"
            )));
        }

        error!(
            query = %sql,
            code = err.code,
            "{} Forcing a reconnect.",
            err.loss_reason().unwrap_or("Connection lost.")
        );
        self.force_reconnect()?;
        self.handle
            .query(sql)
            .map_err(|retry_err| classify_retry(retry_err, sql))
    }

    /// Drop the driver handle and open a fresh one.
    pub fn force_reconnect(&mut self) -> GatewayResult<()> {
        if let Err(err) = self.handle.close() {
            debug!(error = %err, "Ignoring close failure before reconnect");
        }
        let mut handle = self.driver.connect(self.flags.params())?;
        handle.set_reconnect(true);
        self.handle = handle;
        info!(database = ?self.flags.parsed.database(), "Reconnected");
        Ok(())
    }

    /// Run `sql`, which may hold several statements separated by NUL bytes.
    ///
    /// `SELECT` statements get ` LIMIT max_rows` appended and the returned
    /// rows are capped at `max_rows` (0 means unlimited). The last result set
    /// wins; result sets with different columns are rejected.
    pub fn query(&mut self, sql: &str, max_rows: usize) -> GatewayResult<QueryResult> {
        let mut desc: Option<Vec<RawColumn>> = None;
        let mut rows: Vec<Vec<Value>> = Vec::new();

        for piece in sql.split('\0').map(str::trim).filter(|p| !p.is_empty()) {
            let keyword = piece
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_uppercase();
            let statement = if keyword == "SELECT" && max_rows > 0 {
                format!("{piece} LIMIT {max_rows}")
            } else {
                piece.to_string()
            };

            match self.execute_raw(&statement, false)? {
                Some(set) => {
                    if desc.as_deref().is_some_and(|d| !set.same_schema(d)) {
                        warn!(query = %statement, "Multiple select schema are not allowed");
                        return Err(GatewayError::IncompatibleSchemas);
                    }
                    let RawResultSet {
                        columns,
                        rows: mut set_rows,
                    } = set;
                    if max_rows > 0 {
                        set_rows.truncate(max_rows);
                    }
                    desc = Some(columns);
                    rows = set_rows;
                }
                None => desc = None,
            }

            if keyword == "CALL" {
                // Stored procedures end with a status result
                self.handle.next_result()?;
            }
        }

        let Some(desc) = desc else {
            return Ok(QueryResult::empty());
        };
        let columns = desc
            .into_iter()
            .map(|col| ColumnDescriptor {
                name: col.name,
                type_tag: col.native_type.into(),
                width: col.width,
                nullable: col.nullable,
            })
            .collect();
        Ok(QueryResult { columns, rows })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn tables(&mut self) -> GatewayResult<Vec<TableInfo>> {
        let Some(set) = self.execute_raw("SHOW TABLE STATUS", false)? else {
            return Ok(Vec::new());
        };

        let cell = |row: usize, col: usize| set.text(row, col).unwrap_or_else(|| "-".to_string());
        let tables = (0..set.rows.len())
            .filter_map(|row| {
                let name = set.text(row, 0)?;
                let table_type = match set.text(row, 17) {
                    Some(comment) if comment == "VIEW" => TableType::View,
                    _ => TableType::Table,
                };
                let description = format!(
                    "{}, {} rows, character set/collation {}",
                    cell(row, 1),
                    cell(row, 4),
                    cell(row, 14)
                );
                Some(TableInfo::new(name, table_type).with_description(description))
            })
            .collect();
        Ok(tables)
    }

    /// Column definitions of `table`. A missing table yields an empty list.
    pub fn columns(&mut self, table: &str) -> GatewayResult<Vec<ColumnDefinition>> {
        let sql = format!("SHOW COLUMNS FROM {}", quote_identifier(table));
        let set = match self.execute_raw(&sql, false) {
            Ok(Some(set)) => set,
            Ok(None) => return Ok(Vec::new()),
            Err(GatewayError::Syntax { .. })
            | Err(GatewayError::Database {
                code: codes::ER_NO_SUCH_TABLE,
                ..
            }) => {
                warn!(table = %table, "Columns query for non-existing table");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        Ok((0..set.rows.len())
            .filter_map(|row| column_definition(&set, row))
            .collect())
    }

    /// Server variables from `SHOW VARIABLES`.
    pub fn variables(&mut self) -> GatewayResult<BTreeMap<String, String>> {
        let Some(set) = self.execute_raw("SHOW VARIABLES", false)? else {
            return Ok(BTreeMap::new());
        };
        Ok((0..set.rows.len())
            .filter_map(|row| Some((set.text(row, 0)?, set.text(row, 1).unwrap_or_default())))
            .collect())
    }

    /// Server version, looked up once per connection.
    pub fn server_version(&mut self) -> GatewayResult<String> {
        if let Some(version) = &self.version {
            return Ok(version.clone());
        }
        let version = self.variables()?.remove("version").unwrap_or_default();
        self.version = Some(version.clone());
        Ok(version)
    }

    pub fn quote_literal<T: QuoteLiteral + ?Sized>(&self, value: &T) -> T::Output {
        value.quote_literal()
    }

    /// Close the driver handle. Safe to call more than once.
    pub fn close(&mut self) {
        if let Err(err) = self.handle.close() {
            debug!(error = %err, "Ignoring close failure");
        }
    }
}

impl Drop for DriverConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Classify the failure of the single retry after a reconnect.
fn classify_retry(err: DriverError, sql: &str) -> GatewayError {
    warn!(query = %sql, error = %err, "Query failed after reconnect");
    if err.is_syntax() {
        GatewayError::syntax(err.message, sql)
    } else {
        err.into()
    }
}

/// Build a column definition from one `SHOW COLUMNS` row:
/// Field, Type, Null, Key, Default, Extra.
fn column_definition(set: &RawResultSet, row: usize) -> Option<ColumnDefinition> {
    let name = set.text(row, 0)?;
    let full_type = set.text(row, 1).unwrap_or_default();
    let null = set.text(row, 2).unwrap_or_default();
    let key = set.text(row, 3).unwrap_or_default();
    let default = set.text(row, 4);
    let extra = set.text(row, 5).unwrap_or_default();

    let parsed = split_column_type(&full_type);
    let mut column = ColumnDefinition::new(name, full_type.clone());
    column.icon = column_icon(&parsed.short_type).to_string();
    column.column_type = parsed.short_type;
    column.scale = parsed.scale;
    column.precision = parsed.precision;
    column.nullable = null == "YES";

    let default_text = default
        .as_ref()
        .map(|d| format!("DEFAULT '{d}'"))
        .unwrap_or_default();
    let not_null = if null == "NO" { "NOT NULL" } else { "" };
    column.description = [
        full_type.as_str(),
        default_text.as_str(),
        extra.as_str(),
        key_text(&key),
        not_null,
    ]
    .into_iter()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ");

    column.default = default;
    column.extra = extra;
    if !key.is_empty() {
        column.index = true;
    }
    match key.as_str() {
        "PRI" => {
            column.primary_key = true;
            column.unique = true;
        }
        "UNI" => column.unique = true,
        _ => {}
    }
    column.key = key;
    Some(column)
}

// =============================================================================
// Shared handle
// =============================================================================

/// A pooled connection as handed out by `ThreadLocalPool`.
///
/// The mutex is only ever taken by the owning thread; it exists so the
/// transaction coordinator can call back into the connection.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<DriverConnection>>,
    sort_key: String,
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("sort_key", &self.sort_key)
            .finish()
    }
}

impl SharedConnection {
    pub fn new(conn: DriverConnection) -> Self {
        let sort_key = format!(
            "mysql:{}",
            conn.flags().parsed.database().unwrap_or_default()
        );
        Self {
            inner: Arc::new(Mutex::new(conn)),
            sort_key,
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DriverConnection> {
        self.inner.lock()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl TransactionParticipant for SharedConnection {
    fn sort_key(&self) -> String {
        self.sort_key.clone()
    }

    fn commit(&self) -> GatewayResult<()> {
        self.lock().commit()
    }

    fn abort(&self) -> GatewayResult<()> {
        self.lock().abort()
    }

    fn savepoint(&self) -> GatewayResult<Box<dyn ParticipantSavepoint>> {
        let savepoint = self.lock().savepoint()?;
        Ok(Box::new(ConnectionSavepoint {
            conn: self.clone(),
            savepoint,
        }))
    }
}

struct ConnectionSavepoint {
    conn: SharedConnection,
    savepoint: Savepoint,
}

impl ParticipantSavepoint for ConnectionSavepoint {
    fn rollback(&self) -> GatewayResult<()> {
        self.savepoint.rollback(&mut self.conn.lock())
    }
}
