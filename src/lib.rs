//! MySQL gateway library.
//!
//! A per-thread connection pool for MySQL with transaction coordination,
//! built for request-per-thread application servers. Each worker thread
//! gets its own connection, lazily opened, which joins the thread's ambient
//! transaction on first use and is committed or rolled back with it.

pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod gateway;
pub mod models;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewaySettings};
