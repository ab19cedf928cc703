//! sqlx-backed MySQL driver.
//!
//! The gateway is synchronous, sqlx is not. Every handle drives its
//! `MySqlConnection` on one multi-threaded tokio runtime shared by the driver,
//! blocking the calling thread with `Runtime::block_on`. Callers must not be
//! running inside a tokio runtime themselves.
//!
//! Statements go through `sqlx::raw_sql`, i.e. the text protocol, so one
//! call may carry several `;`-separated statements. The first result set is
//! returned and the rest are handed out by `next_result`.

use crate::db::driver::{Driver, DriverError, DriverHandle, RawColumn, RawResultSet, codes};
use crate::db::dsn::ConnectParams;
use crate::db::types::{NativeType, convert_text};
use crate::error::{GatewayError, GatewayResult};
use crate::models::Value;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Either, Executor, Row, TypeInfo};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Worker threads of the shared I/O runtime.
const IO_WORKER_THREADS: usize = 2;

/// Asks whether the default storage engine is transactional.
const TRANSACTIONS_PROBE: &str = "SELECT TRANSACTIONS FROM information_schema.ENGINES \
     WHERE ENGINE = @@default_storage_engine";

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.try_downcast_ref::<MySqlDatabaseError>() {
                Some(mysql_err) => DriverError::new(mysql_err.number(), mysql_err.message()),
                None => DriverError::new(codes::CR_UNKNOWN_ERROR, db_err.message()),
            },
            sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => {
                DriverError::new(codes::CR_SERVER_LOST, err.to_string())
            }
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                DriverError::new(codes::CR_SERVER_GONE_ERROR, err.to_string())
            }
            sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => {
                DriverError::new(codes::CR_CONN_HOST_ERROR, err.to_string())
            }
            _ => DriverError::new(codes::CR_UNKNOWN_ERROR, err.to_string()),
        }
    }
}

/// Build sqlx connect options from parsed connection parameters.
fn connect_options(params: &ConnectParams) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new();
    if let Some(host) = &params.host {
        options = options.host(host);
    }
    if let Some(port) = params.port {
        options = options.port(port);
    }
    if let Some(user) = &params.user {
        options = options.username(user);
    }
    if let Some(password) = &params.password {
        options = options.password(password);
    }
    if let Some(database) = &params.database {
        options = options.database(database);
    }
    if let Some(socket) = &params.unix_socket {
        options = options.socket(socket);
    }
    if let Some(charset) = &params.charset {
        options = options.charset(charset);
    }
    // Statement logging is done by the gateway with its own fields
    options.disable_statement_logging()
}

/// Driver that opens real MySQL connections.
#[derive(Debug, Clone)]
pub struct MySqlDriver {
    runtime: Arc<Runtime>,
}

impl MySqlDriver {
    pub fn new() -> GatewayResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(IO_WORKER_THREADS)
            .thread_name("mysql-gateway-io")
            .enable_all()
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to start I/O runtime: {e}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }
}

impl Driver for MySqlDriver {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn DriverHandle>, DriverError> {
        let options = connect_options(params);
        let mut conn = self
            .runtime
            .block_on(MySqlConnection::connect_with(&options))
            .map_err(connect_error)?;

        let transactional = self.runtime.block_on(probe_transactions(&mut conn));
        info!(
            host = ?params.host,
            database = ?params.database,
            transactional,
            "Opened MySQL connection"
        );

        Ok(Box::new(MySqlHandle {
            runtime: Arc::clone(&self.runtime),
            options,
            conn: Some(conn),
            pending: VecDeque::new(),
            reconnect: false,
            transactional,
        }))
    }
}

/// Failures while connecting are never "lost connections".
fn connect_error(err: sqlx::Error) -> DriverError {
    let driver_err = DriverError::from(err);
    if driver_err.is_connection_loss() {
        DriverError::new(codes::CR_CONN_HOST_ERROR, driver_err.message)
    } else {
        driver_err
    }
}

async fn probe_transactions(conn: &mut MySqlConnection) -> bool {
    match (&mut *conn).fetch_optional(sqlx::raw_sql(TRANSACTIONS_PROBE)).await {
        Ok(Some(row)) => row
            .try_get_unchecked::<Option<String>, _>(0)
            .ok()
            .flatten()
            .is_some_and(|v| v.eq_ignore_ascii_case("YES")),
        Ok(None) => false,
        Err(e) => {
            debug!(error = %e, "Transaction capability probe failed");
            false
        }
    }
}

struct MySqlHandle {
    runtime: Arc<Runtime>,
    options: MySqlConnectOptions,
    conn: Option<MySqlConnection>,
    pending: VecDeque<RawResultSet>,
    reconnect: bool,
    transactional: bool,
}

impl MySqlHandle {
    fn gone() -> DriverError {
        DriverError::new(codes::CR_SERVER_GONE_ERROR, "MySQL server has gone away")
    }
}

impl DriverHandle for MySqlHandle {
    fn query(&mut self, sql: &str) -> Result<Option<RawResultSet>, DriverError> {
        self.pending.clear();
        let conn = self.conn.as_mut().ok_or_else(Self::gone)?;
        let mut sets = self.runtime.block_on(run_statements(conn, sql))?;
        let first = if sets.is_empty() {
            None
        } else {
            sets.remove(0)
        };
        self.pending = sets.into_iter().flatten().collect();
        Ok(first)
    }

    fn next_result(&mut self) -> Result<Option<RawResultSet>, DriverError> {
        Ok(self.pending.pop_front())
    }

    fn ping(&mut self) -> Result<(), DriverError> {
        let alive = match self.conn.as_mut() {
            Some(conn) => self.runtime.block_on(conn.ping()).map_err(DriverError::from),
            None => Err(Self::gone()),
        };
        match alive {
            Ok(()) => Ok(()),
            Err(err) if self.reconnect => {
                warn!(error = %err, "Ping failed, reconnecting");
                self.pending.clear();
                let conn = self
                    .runtime
                    .block_on(MySqlConnection::connect_with(&self.options))
                    .map_err(connect_error)?;
                self.conn = Some(conn);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn set_reconnect(&mut self, enabled: bool) {
        self.reconnect = enabled;
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.pending.clear();
        match self.conn.take() {
            Some(conn) => self.runtime.block_on(conn.close()).map_err(DriverError::from),
            None => Ok(()),
        }
    }
}

/// Statements that produce a result set even when it has no rows.
fn returns_rows(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    ["SELECT", "SHOW", "DESCRIBE", "DESC ", "EXPLAIN", "WITH", "VALUES", "TABLE "]
        .iter()
        .any(|kw| upper.starts_with(kw))
}

/// Run `sql` and split the stream into one entry per statement.
async fn run_statements(
    conn: &mut MySqlConnection,
    sql: &str,
) -> Result<Vec<Option<RawResultSet>>, DriverError> {
    let mut sets = Vec::new();
    let mut rows: Vec<MySqlRow> = Vec::new();
    {
        let mut stream = sqlx::raw_sql(sql).fetch_many(&mut *conn);
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(_done) => {
                    let batch = std::mem::take(&mut rows);
                    sets.push((!batch.is_empty()).then(|| rows_to_result_set(&batch)));
                }
                Either::Right(row) => rows.push(row),
            }
        }
    }
    if !rows.is_empty() {
        sets.push(Some(rows_to_result_set(&rows)));
    }

    // A row-returning statement with no rows still has a schema
    if matches!(sets.first(), Some(None)) && returns_rows(sql) {
        if let Some(described) = describe_columns(conn, sql).await {
            sets[0] = Some(RawResultSet::new(described, Vec::new()));
        }
    }
    Ok(sets)
}

async fn describe_columns(conn: &mut MySqlConnection, sql: &str) -> Option<Vec<RawColumn>> {
    match (&mut *conn).describe(sql).await {
        Ok(describe) => Some(
            describe
                .columns()
                .iter()
                .map(|col| raw_column(col.name(), col.type_info().name()))
                .collect(),
        ),
        Err(e) => {
            debug!(error = %e, "Could not describe empty result set");
            None
        }
    }
}

fn raw_column(name: &str, type_name: &str) -> RawColumn {
    let native = NativeType::from_type_name(type_name).unwrap_or(NativeType::VarString);
    RawColumn::new(name, native)
}

fn is_binary_type(type_name: &str) -> bool {
    let upper = type_name.to_uppercase();
    upper.contains("BLOB") || upper.contains("BINARY") || upper == "GEOMETRY"
}

fn rows_to_result_set(rows: &[MySqlRow]) -> RawResultSet {
    let Some(first) = rows.first() else {
        return RawResultSet::default();
    };

    let layout: Vec<(NativeType, bool)> = first
        .columns()
        .iter()
        .map(|col| {
            let type_name = col.type_info().name();
            (
                NativeType::from_type_name(type_name).unwrap_or(NativeType::VarString),
                is_binary_type(type_name),
            )
        })
        .collect();

    let columns = first
        .columns()
        .iter()
        .map(|col| raw_column(col.name(), col.type_info().name()))
        .collect();

    let rows = rows
        .iter()
        .map(|row| {
            layout
                .iter()
                .enumerate()
                .map(|(idx, (native, binary))| decode_cell(row, idx, *native, *binary))
                .collect()
        })
        .collect();

    RawResultSet::new(columns, rows)
}

fn decode_cell(row: &MySqlRow, idx: usize, native: NativeType, binary: bool) -> Value {
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(idx) {
        Ok(Some(raw)) => convert_text(native, binary, &raw),
        Ok(None) => Value::Null,
        Err(e) => {
            warn!(column = idx, error = %e, "Failed to decode cell");
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("SHOW TABLES"));
        assert!(returns_rows("desc t"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
        assert!(!returns_rows("CALL p()"));
    }

    #[test]
    fn test_binary_types() {
        assert!(is_binary_type("LONGBLOB"));
        assert!(is_binary_type("VARBINARY"));
        assert!(!is_binary_type("VARCHAR"));
        assert!(!is_binary_type("TEXT"));
    }

    #[test]
    fn test_raw_column_falls_back_to_text() {
        assert_eq!(raw_column("a", "BIGINT").native_type, NativeType::LongLong);
        assert_eq!(raw_column("b", "VECTOR").native_type, NativeType::VarString);
    }

    #[test]
    fn test_io_errors_are_connection_loss() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(DriverError::from(err).is_connection_loss());

        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(connect_error(err).code, codes::CR_CONN_HOST_ERROR);
    }

    #[test]
    fn test_connect_options_from_params() {
        let params = ConnectParams {
            database: Some("shop".into()),
            host: Some("db.internal".into()),
            port: Some(3307),
            user: Some("app".into()),
            ..Default::default()
        };
        let options = connect_options(&params);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 3307);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("shop"));
    }
}
