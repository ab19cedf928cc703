//! MySQL gateway - command line entry point.
//!
//! Connects through the same registry, pool and transaction machinery an
//! application server would use, runs one command and prints the result.

use mysql_gateway::config::{Command, Config};
use mysql_gateway::db::{MySqlDriver, RegistryCache, TransactionManager};
use mysql_gateway::format::{render_list, render_result};
use mysql_gateway::gateway::Gateway;
use mysql_gateway::error::GatewayResult;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Results go to stdout, logs to stderr
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn run(config: &Config, gateway: &Gateway) -> GatewayResult<String> {
    let format = config.format;
    let rendered = match &config.command {
        Command::Query { sql, commit } => {
            let result = gateway.query(sql, None);
            let finished = match (&result, commit) {
                (Ok(_), true) => gateway.commit(),
                _ => gateway.abort(),
            };
            let result = result?;
            finished?;
            render_result(&result, format)
        }
        Command::Tables => render_list(
            &gateway.tables()?,
            &["name", "type", "description"],
            |t| vec![t.name.clone(), t.table_type.to_string(), t.description.clone()],
            format,
        ),
        Command::Columns { table } => render_list(
            &gateway.columns(table)?,
            &["name", "type", "key", "description"],
            |c| vec![c.name.clone(), c.full_type.clone(), c.key.clone(), c.description.clone()],
            format,
        ),
        Command::Variables => {
            let variables: Vec<(String, String)> = gateway.variables()?.into_iter().collect();
            render_list(
                &variables,
                &["variable", "value"],
                |(name, value)| vec![name.clone(), value.clone()],
                format,
            )
        }
        Command::Browse => render_list(
            &gateway.browse()?,
            &["table", "icon", "columns"],
            |node| {
                vec![
                    node.table.name.clone(),
                    node.icon.clone(),
                    node.columns
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                ]
            },
            format,
        ),
    };
    rendered.map_err(|e| mysql_gateway::GatewayError::internal(format!("Failed to render output: {e}")))
}

fn main() -> ExitCode {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    init_tracing(&config);

    if let Err(message) = config.validate() {
        eprintln!("Error: {message}");
        eprintln!();
        eprintln!("Usage: mysql-gateway --connection <dsn> <command>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  mysql-gateway -c 'shop app secret' tables");
        eprintln!("  mysql-gateway -c '+shop@db.local:3306 app secret' query 'SELECT * FROM orders'");
        eprintln!("  mysql-gateway -c '*batch -shop app secret' query 'UPDATE stock SET n = 0' --commit");
        return ExitCode::from(2);
    }

    info!("Starting MySQL gateway v{}", env!("CARGO_PKG_VERSION"));

    let driver = match MySqlDriver::new() {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            error!(error = %e, "Failed to start driver runtime");
            return ExitCode::FAILURE;
        }
    };
    let registry = Arc::new(RegistryCache::new());
    let transactions = Arc::new(TransactionManager::new());
    let gateway = Gateway::new(config.to_settings(), Arc::clone(&registry), driver, transactions);

    let code = match run(&config, &gateway) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {suggestion}");
            }
            ExitCode::FAILURE
        }
    };

    registry.close_all();
    code
}
