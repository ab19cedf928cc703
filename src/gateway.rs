//! The externally visible gateway object.
//!
//! A `Gateway` is bound to one `ConnectionKey`. It finds (or builds) the pool
//! for its key in the shared `RegistryCache` and rebuilds the pool whenever
//! its connection string changes. All other operations are forwarded to the
//! calling thread's connection.

use crate::db::driver::Driver;
use crate::db::pool::{PoolSettings, ThreadKey, ThreadLocalPool};
use crate::db::quote::QuoteLiteral;
use crate::db::registry::RegistryCache;
use crate::db::transaction::{TransactionManager, TransactionSavepoint};
use crate::error::GatewayResult;
use crate::models::{
    ColumnDefinition, ConnectionInfo, ConnectionKey, DEFAULT_MAX_ROWS, QueryResult, TableInfo,
    TableNode,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings of one gateway, as entered by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewaySettings {
    pub id: String,
    pub key: ConnectionKey,
    pub title: String,
    /// Holds the password, so never serialized.
    #[serde(skip)]
    pub connection_string: String,
    pub use_unicode: bool,
    pub charset: Option<String>,
    pub auto_create_db: bool,
    pub max_rows: usize,
}

impl GatewaySettings {
    pub fn new(id: impl Into<String>, connection_string: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            key: ConnectionKey::new(id.clone()),
            id,
            title: String::new(),
            connection_string: connection_string.into(),
            use_unicode: false,
            charset: None,
            auto_create_db: true,
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_key(mut self, key: ConnectionKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            use_unicode: self.use_unicode,
            charset: self.charset.clone(),
            auto_create_db: self.auto_create_db,
        }
    }
}

pub struct Gateway {
    settings: RwLock<GatewaySettings>,
    registry: Arc<RegistryCache>,
    driver: Arc<dyn Driver>,
    transactions: Arc<TransactionManager>,
    pool: RwLock<Option<Arc<ThreadLocalPool>>>,
    connected: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("settings", &*self.settings.read())
            .field("connected", &*self.connected.read())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        registry: Arc<RegistryCache>,
        driver: Arc<dyn Driver>,
        transactions: Arc<TransactionManager>,
    ) -> Self {
        Self {
            settings: RwLock::new(settings),
            registry,
            driver,
            transactions,
            pool: RwLock::new(None),
            connected: RwLock::new(None),
        }
    }

    /// Build a gateway, connecting right away when `check` is set.
    pub fn create(
        settings: GatewaySettings,
        check: bool,
        registry: Arc<RegistryCache>,
        driver: Arc<dyn Driver>,
        transactions: Arc<TransactionManager>,
    ) -> GatewayResult<Self> {
        let gateway = Self::new(settings, registry, driver, transactions);
        if check {
            let connection_string = gateway.settings.read().connection_string.clone();
            gateway.connect(&connection_string)?;
        }
        Ok(gateway)
    }

    /// Update the administrative settings.
    ///
    /// The next operation reconnects, rebuilding the pool when the
    /// connection string changed.
    pub fn edit(
        &self,
        title: &str,
        connection_string: &str,
        use_unicode: Option<bool>,
        auto_create_db: Option<bool>,
    ) {
        let mut settings = self.settings.write();
        settings.title = title.to_string();
        settings.connection_string = connection_string.to_string();
        if let Some(use_unicode) = use_unicode {
            settings.use_unicode = use_unicode;
        }
        if let Some(auto_create_db) = auto_create_db {
            settings.auto_create_db = auto_create_db;
        }
        drop(settings);

        *self.pool.write() = None;
        info!(id = %self.id(), "Gateway settings updated");
    }

    pub fn settings(&self) -> GatewaySettings {
        self.settings.read().clone()
    }

    pub fn id(&self) -> String {
        self.settings.read().id.clone()
    }

    pub fn title(&self) -> String {
        self.settings.read().title.clone()
    }

    /// Find or build the pool for `connection_string`.
    ///
    /// An installed pool built from the same string is reused. A pool built
    /// from another string is replaced; the calling thread's connection in
    /// it is closed first.
    pub fn connect(&self, connection_string: &str) -> GatewayResult<Arc<ThreadLocalPool>> {
        let (key, pool_settings) = {
            let settings = self.settings.read();
            (settings.key.clone(), settings.pool_settings())
        };

        let existing = self.registry.resolve(&key);
        if let Some(pool) = &existing {
            if pool.connection_string() == connection_string {
                debug!(key = %key, "Reusing connection pool");
                return Ok(self.attach(Arc::clone(pool)));
            }
            pool.close_connection();
        }

        let pool = Arc::new(ThreadLocalPool::open(
            Arc::clone(&self.driver),
            connection_string,
            pool_settings,
            Arc::clone(&self.transactions),
        )?);

        let installed = match existing {
            Some(_) => self.registry.replace(key.clone(), pool),
            None => {
                let installed = self.registry.install_if_absent(key.clone(), Arc::clone(&pool));
                if installed.connection_string() == connection_string {
                    installed
                } else {
                    // Another gateway sharing the key won the install with a different string
                    self.registry.replace(key.clone(), pool)
                }
            }
        };
        info!(key = %key, database = ?installed.name(), "Gateway connected");
        Ok(self.attach(installed))
    }

    fn attach(&self, pool: Arc<ThreadLocalPool>) -> Arc<ThreadLocalPool> {
        *self.connected.write() = Some(pool.connected_at());
        *self.pool.write() = Some(Arc::clone(&pool));
        pool
    }

    /// The pool, connecting with the configured string on first use.
    fn pool(&self) -> GatewayResult<Arc<ThreadLocalPool>> {
        if let Some(pool) = self.pool.read().as_ref() {
            return Ok(Arc::clone(pool));
        }
        let connection_string = self.settings.read().connection_string.clone();
        self.connect(&connection_string)
    }

    /// When the current pool was opened. Only says the gateway connected once;
    /// the server may have gone away since.
    pub fn connected(&self) -> Option<DateTime<Utc>> {
        *self.connected.read()
    }

    pub fn info(&self) -> Option<ConnectionInfo> {
        let key = self.settings.read().key.clone();
        self.pool.read().as_ref().map(|pool| pool.info(key))
    }

    /// Quote `value` for embedding in SQL text.
    pub fn sql_quote<T: QuoteLiteral + ?Sized>(&self, value: &T) -> GatewayResult<T::Output> {
        Ok(self.pool()?.quote_literal(value))
    }

    /// Run `sql` on the calling thread's connection. `max_rows` defaults to
    /// the configured limit; 0 means unlimited.
    pub fn query(&self, sql: &str, max_rows: Option<usize>) -> GatewayResult<QueryResult> {
        let max_rows = max_rows.unwrap_or_else(|| self.settings.read().max_rows);
        self.pool()?.query(sql, max_rows)
    }

    pub fn tables(&self) -> GatewayResult<Vec<TableInfo>> {
        self.pool()?.tables()
    }

    pub fn columns(&self, table: &str) -> GatewayResult<Vec<ColumnDefinition>> {
        self.pool()?.columns(table)
    }

    pub fn variables(&self) -> GatewayResult<BTreeMap<String, String>> {
        self.pool()?.variables()
    }

    pub fn database_name(&self) -> GatewayResult<Option<String>> {
        Ok(self.pool()?.name().map(String::from))
    }

    /// Commit the calling thread's transaction.
    pub fn commit(&self) -> GatewayResult<()> {
        self.transactions.commit(ThreadKey::current())
    }

    /// Roll back the calling thread's transaction.
    pub fn abort(&self) -> GatewayResult<()> {
        self.transactions.abort(ThreadKey::current())
    }

    /// Savepoint across every connection in the calling thread's transaction.
    pub fn savepoint(&self) -> GatewayResult<TransactionSavepoint> {
        self.transactions.current(ThreadKey::current()).savepoint()
    }

    /// Tables with their columns, for browsing.
    pub fn browse(&self) -> GatewayResult<Vec<TableNode>> {
        let pool = self.pool()?;
        let mut nodes = Vec::new();
        for table in pool.tables()? {
            let columns = match pool.columns(&table.name) {
                Ok(columns) => columns,
                Err(err) => {
                    warn!(table = %table.name, error = %err, "Skipping table in browse tree");
                    continue;
                }
            };
            nodes.push(TableNode {
                icon: table.table_type.icon().to_string(),
                table,
                columns,
            });
        }
        Ok(nodes)
    }

    /// Drop the pool from the registry and close its connections.
    pub fn close(&self) {
        let key = self.settings.read().key.clone();
        *self.pool.write() = None;
        *self.connected.write() = None;
        self.registry.remove(&key);
        info!(key = %key, "Gateway closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::scripted::{ScriptedDriver, result_set};
    use crate::db::types::NativeType;
    use crate::error::GatewayError;
    use crate::models::Value;

    fn gateway(driver: &ScriptedDriver, dsn: &str) -> (Gateway, Arc<RegistryCache>) {
        let registry = Arc::new(RegistryCache::new());
        let gateway = Gateway::new(
            GatewaySettings::new("db", dsn).with_key(ConnectionKey::from("/app/db")),
            Arc::clone(&registry),
            Arc::new(driver.clone()),
            Arc::new(TransactionManager::new()),
        );
        (gateway, registry)
    }

    #[test]
    fn test_connect_reuses_pool_for_same_string() {
        let driver = ScriptedDriver::new();
        let (gateway, registry) = gateway(&driver, "-shop");
        let first = gateway.connect("-shop").unwrap();
        let second = gateway.connect("-shop").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(gateway.connected(), Some(first.connected_at()));
        // only one probe
        assert_eq!(driver.connect_count(), 1);
    }

    #[test]
    fn test_connect_with_new_string_replaces_pool() {
        let driver = ScriptedDriver::new();
        let (gateway, registry) = gateway(&driver, "-shop");
        let old = gateway.connect("-shop").unwrap();
        gateway.query("SELECT 1", None).unwrap();
        assert_eq!(old.len(), 1);

        let new = gateway.connect("-shop_v2").unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert!(old.is_empty());
        let installed = registry.resolve(&ConnectionKey::from("/app/db")).unwrap();
        assert!(Arc::ptr_eq(&installed, &new));
    }

    #[test]
    fn test_gateways_sharing_a_key_share_the_pool() {
        let driver = ScriptedDriver::new();
        let registry = Arc::new(RegistryCache::new());
        let transactions = Arc::new(TransactionManager::new());
        let make = || {
            Gateway::new(
                GatewaySettings::new("db", "-shop"),
                Arc::clone(&registry),
                Arc::new(driver.clone()),
                Arc::clone(&transactions),
            )
        };
        let a = make().connect("-shop").unwrap();
        let b = make().connect("-shop").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_sql_quote_connects_lazily() {
        let driver = ScriptedDriver::new();
        let (gateway, _) = gateway(&driver, "shop");
        assert!(gateway.connected().is_none());
        assert_eq!(gateway.sql_quote("it's").unwrap(), "'it\\'s'");
        assert!(gateway.connected().is_some());
        assert_eq!(gateway.database_name().unwrap().as_deref(), Some("shop"));
    }

    #[test]
    fn test_query_uses_configured_row_limit() {
        let driver = ScriptedDriver::new();
        let (gateway, _) = gateway(&driver, "-shop");
        gateway.query("SELECT * FROM items", None).unwrap();
        gateway.query("SELECT * FROM items", Some(0)).unwrap();
        assert_eq!(
            driver.statements(),
            vec![
                format!("SELECT * FROM items LIMIT {DEFAULT_MAX_ROWS}"),
                "SELECT * FROM items".to_string(),
            ]
        );
    }

    #[test]
    fn test_commit_and_abort_use_thread_transaction() {
        let driver = ScriptedDriver::new();
        let (gateway, _) = gateway(&driver, "shop");
        gateway.query("UPDATE items SET n = 1", None).unwrap();
        gateway.commit().unwrap();
        gateway.query("UPDATE items SET n = 2", None).unwrap();
        gateway.abort().unwrap();
        assert_eq!(
            driver.statements(),
            vec![
                "BEGIN",
                "UPDATE items SET n = 1",
                "COMMIT",
                "BEGIN",
                "UPDATE items SET n = 2",
                "ROLLBACK",
            ]
        );
    }

    #[test]
    fn test_edit_rebuilds_pool_on_next_use() {
        let driver = ScriptedDriver::new();
        let (gateway, _) = gateway(&driver, "-shop");
        gateway.tables().unwrap();
        gateway.edit("Shop", "-archive", Some(true), None);
        assert_eq!(gateway.title(), "Shop");
        assert_eq!(gateway.database_name().unwrap().as_deref(), Some("archive"));
        assert!(gateway.settings().use_unicode);
    }

    #[test]
    fn test_create_with_check_reports_connect_failure() {
        let driver = ScriptedDriver::new();
        driver.fail_connect(crate::db::driver::DriverError::new(2003, "refused"));
        let result = Gateway::create(
            GatewaySettings::new("db", "shop"),
            true,
            Arc::new(RegistryCache::new()),
            Arc::new(driver.clone()),
            Arc::new(TransactionManager::new()),
        );
        assert!(matches!(result, Err(GatewayError::Connection { .. })));
    }

    #[test]
    fn test_browse_builds_tree() {
        let driver = ScriptedDriver::new();
        let mut status_row = vec![Value::Null; 18];
        status_row[0] = Value::Text("items".into());
        status_row[1] = Value::Text("InnoDB".into());
        driver.reply(
            "SHOW TABLE STATUS",
            result_set(
                &(0..18)
                    .map(|_| ("c", NativeType::VarString))
                    .collect::<Vec<_>>(),
                vec![status_row],
            ),
        );
        driver.reply(
            "SHOW COLUMNS",
            result_set(
                &[
                    ("Field", NativeType::VarString),
                    ("Type", NativeType::VarString),
                    ("Null", NativeType::VarString),
                    ("Key", NativeType::VarString),
                    ("Default", NativeType::VarString),
                    ("Extra", NativeType::VarString),
                ],
                vec![vec![
                    Value::Text("id".into()),
                    Value::Text("int(11)".into()),
                    Value::Text("NO".into()),
                    Value::Text("PRI".into()),
                    Value::Null,
                    Value::Text("auto_increment".into()),
                ]],
            ),
        );

        let (gateway, _) = gateway(&driver, "-shop");
        let tree = gateway.browse().unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].table.name, "items");
        assert_eq!(tree[0].icon, "table");
        assert_eq!(tree[0].columns[0].name, "id");
        assert_eq!(tree[0].columns[0].icon, "int");
    }

    #[test]
    fn test_close_removes_from_registry() {
        let driver = ScriptedDriver::new();
        let (gateway, registry) = gateway(&driver, "-shop");
        gateway.connect("-shop").unwrap();
        gateway.close();
        assert!(registry.is_empty());
        assert!(gateway.connected().is_none());
        assert!(gateway.info().is_none());
    }
}
