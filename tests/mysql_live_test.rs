//! Tests against a real MySQL server.
//!
//! Set TEST_MYSQL_DSN to a gateway connection string to run them, e.g.
//! TEST_MYSQL_DSN="gateway_test@127.0.0.1:3306 root secret"
//! The database is created when missing.

use mysql_gateway::db::{MySqlDriver, RegistryCache, TransactionManager};
use mysql_gateway::models::{TypeTag, Value};
use mysql_gateway::{Gateway, GatewaySettings};
use std::sync::Arc;

fn live_gateway(id: &str) -> Option<Gateway> {
    let dsn = match std::env::var("TEST_MYSQL_DSN") {
        Ok(dsn) => dsn,
        Err(_) => {
            eprintln!("Skipping test: TEST_MYSQL_DSN not set");
            return None;
        }
    };
    let mut settings = GatewaySettings::new(id, dsn);
    settings.use_unicode = true;
    Some(Gateway::new(
        settings,
        Arc::new(RegistryCache::new()),
        Arc::new(MySqlDriver::new().unwrap()),
        Arc::new(TransactionManager::new()),
    ))
}

#[test]
fn test_live_abort_and_commit() {
    let Some(gateway) = live_gateway("live_tx") else {
        return;
    };

    gateway
        .query(
            "CREATE TABLE IF NOT EXISTS gw_tx (id INT PRIMARY KEY, name VARCHAR(100)) ENGINE=InnoDB",
            None,
        )
        .unwrap();
    gateway.query("DELETE FROM gw_tx", None).unwrap();
    gateway.commit().unwrap();

    gateway
        .query("INSERT INTO gw_tx VALUES (1, 'rolled back')", None)
        .unwrap();
    gateway.abort().unwrap();
    let result = gateway.query("SELECT COUNT(*) FROM gw_tx", None).unwrap();
    assert_eq!(result.rows[0][0], Value::Int(0));
    gateway.commit().unwrap();

    let name = gateway.sql_quote("it's kept").unwrap();
    gateway
        .query(&format!("INSERT INTO gw_tx VALUES (2, {name})"), None)
        .unwrap();
    gateway.commit().unwrap();

    let result = gateway.query("SELECT id, name FROM gw_tx", None).unwrap();
    assert_eq!(result.columns[0].type_tag, TypeTag::Int);
    assert_eq!(result.columns[1].type_tag, TypeTag::Text);
    assert_eq!(result.rows, vec![vec![Value::Int(2), Value::Text("it's kept".into())]]);
    gateway.commit().unwrap();
}

#[test]
fn test_live_introspection() {
    let Some(gateway) = live_gateway("live_schema") else {
        return;
    };

    gateway
        .query(
            "CREATE TABLE IF NOT EXISTS gw_schema (id INT NOT NULL AUTO_INCREMENT PRIMARY KEY, \
             price DECIMAL(8,2) DEFAULT '0.00', created DATETIME NULL)",
            None,
        )
        .unwrap();
    gateway.commit().unwrap();

    let tables = gateway.tables().unwrap();
    assert!(tables.iter().any(|t| t.name == "gw_schema"));

    let columns = gateway.columns("gw_schema").unwrap();
    assert_eq!(columns.len(), 3);
    assert!(columns[0].primary_key);
    assert_eq!(columns[1].column_type, "decimal");
    // `decimal(8,2)` reads as scale 8, precision 2
    assert_eq!(columns[1].scale, Some(8));
    assert_eq!(columns[1].precision, Some(2));
    assert_eq!(columns[2].icon, "datetime");

    assert!(gateway.columns("gw_missing_table").unwrap().is_empty());
    assert!(gateway.variables().unwrap().contains_key("version"));
    gateway.abort().unwrap();
}

#[test]
fn test_live_empty_select_keeps_columns() {
    let Some(gateway) = live_gateway("live_empty") else {
        return;
    };

    let result = gateway
        .query("SELECT 1 AS one, NOW() AS now FROM DUAL WHERE 1 = 0", None)
        .unwrap();
    assert_eq!(result.columns.len(), 2);
    assert!(result.rows.is_empty());
    gateway.abort().unwrap();
}

#[test]
fn test_live_empty_and_filled_results_match() {
    let Some(gateway) = live_gateway("live_same_schema") else {
        return;
    };

    let empty = gateway
        .query("SELECT 1 AS one, 'x' AS two FROM DUAL WHERE 1 = 0", None)
        .unwrap();
    let filled = gateway.query("SELECT 1 AS one, 'x' AS two", None).unwrap();
    assert_eq!(empty.columns, filled.columns);

    let result = gateway
        .query(
            "SELECT 1 AS one, 'x' AS two FROM DUAL WHERE 1 = 0\0SELECT 1 AS one, 'x' AS two",
            None,
        )
        .unwrap();
    assert_eq!(result.row_count(), 1);
    gateway.abort().unwrap();
}
