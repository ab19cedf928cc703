//! Integration tests for the gateway connect/reconnect algorithm.

use mysql_gateway::db::{RegistryCache, ScriptedDriver, TransactionManager};
use mysql_gateway::models::ConnectionKey;
use mysql_gateway::{Gateway, GatewayError, GatewaySettings};
use std::sync::{Arc, Barrier};
use std::thread;

fn gateway(
    driver: &ScriptedDriver,
    registry: &Arc<RegistryCache>,
    dsn: &str,
) -> Gateway {
    Gateway::new(
        GatewaySettings::new("db", dsn).with_key(ConnectionKey::from("/site/db")),
        Arc::clone(registry),
        Arc::new(driver.clone()),
        Arc::new(TransactionManager::new()),
    )
}

#[test]
fn test_concurrent_first_connect_installs_one_pool() {
    let driver = ScriptedDriver::new();
    let registry = Arc::new(RegistryCache::new());
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let gateway = gateway(&driver, &registry, "-shop");
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                gateway.connect("-shop").unwrap()
            })
        })
        .collect();
    let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let installed = registry.resolve(&ConnectionKey::from("/site/db")).unwrap();
    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &installed)));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_changed_connection_string_replaces_pool() {
    let driver = ScriptedDriver::new();
    let registry = Arc::new(RegistryCache::new());
    let gateway = gateway(&driver, &registry, "-shop");

    gateway.query("SELECT 1", None).unwrap();
    let old = registry.resolve(&ConnectionKey::from("/site/db")).unwrap();
    let closes_before = driver.close_count();

    gateway.edit("Shop", "-shop_archive", None, None);
    gateway.query("SELECT 1", None).unwrap();

    let new = registry.resolve(&ConnectionKey::from("/site/db")).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.name(), Some("shop_archive"));
    assert!(old.is_empty());
    // old thread connection + probe of the new pool
    assert_eq!(driver.close_count(), closes_before + 2);
}

#[test]
fn test_auto_create_database_on_connect() {
    let driver = ScriptedDriver::new();
    driver.with_missing_database("fresh");
    let registry = Arc::new(RegistryCache::new());
    let mut settings = GatewaySettings::new("db", "fresh app");
    settings.use_unicode = true;
    let gateway = Gateway::new(
        settings,
        registry,
        Arc::new(driver.clone()),
        Arc::new(TransactionManager::new()),
    );

    gateway.tables().unwrap();
    assert_eq!(
        driver.statements()[0],
        "CREATE DATABASE `fresh` DEFAULT CHARACTER SET utf8"
    );
}

#[test]
fn test_racing_first_connects_with_different_strings() {
    let driver = ScriptedDriver::new();
    let registry = Arc::new(RegistryCache::new());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let dsn = if i % 2 == 0 { "-shop" } else { "-shop_v2" };
            let gateway = gateway(&driver, &registry, dsn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let pool = gateway.connect(dsn).unwrap();
                (dsn, pool)
            })
        })
        .collect();

    for handle in handles {
        let (dsn, pool) = handle.join().unwrap();
        assert_eq!(pool.connection_string(), dsn);
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_required_transactions_fail_on_plain_server() {
    let driver = ScriptedDriver::new();
    driver.with_transactions(false);
    let registry = Arc::new(RegistryCache::new());

    let err = gateway(&driver, &registry, "+shop").connect("+shop").unwrap_err();
    assert!(matches!(err, GatewayError::UnsupportedFeature { .. }));
    assert!(registry.is_empty());

    let plain = gateway(&driver, &registry, "shop");
    let pool = plain.connect("shop").unwrap();
    assert!(!pool.flags().transactional);

    driver.clear_events();
    plain.query("UPDATE stock SET n = 0", None).unwrap();
    plain.commit().unwrap();
    assert_eq!(driver.statements(), vec!["UPDATE stock SET n = 0"]);
}

#[test]
fn test_columns_of_missing_table_is_empty() {
    let driver = ScriptedDriver::new();
    driver.fail(
        "SHOW COLUMNS",
        mysql_gateway::db::DriverError::new(1146, "Table 'shop.nope' doesn't exist"),
    );
    let registry = Arc::new(RegistryCache::new());
    let gateway = gateway(&driver, &registry, "-shop");
    assert!(gateway.columns("nope").unwrap().is_empty());
}
