//! In-memory driver for tests and dry runs.
//!
//! `ScriptedDriver` records every statement it receives and answers from a
//! script: canned result sets and injected failures matched by statement
//! prefix. It also simulates the server-side behaviour the gateway depends
//! on: unknown databases, `CREATE DATABASE`, dropped connections and
//! reconnect-on-ping.

use crate::db::driver::{Driver, DriverError, DriverHandle, RawColumn, RawResultSet, codes};
use crate::db::dsn::ConnectParams;
use crate::db::types::NativeType;
use crate::models::Value;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Server version reported by default.
pub const SCRIPTED_VERSION: &str = "8.0.36";

/// Something that happened on a scripted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    Connect {
        handle: usize,
        database: Option<String>,
    },
    Query {
        handle: usize,
        sql: String,
    },
    Ping {
        handle: usize,
    },
    Reconnect {
        handle: usize,
    },
    Close {
        handle: usize,
    },
}

#[derive(Debug, Clone)]
struct Reply {
    prefix: String,
    result: Option<RawResultSet>,
    extra: Vec<RawResultSet>,
}

#[derive(Debug, Clone)]
struct Failure {
    prefix: String,
    error: DriverError,
    /// `None` fails forever
    remaining: Option<usize>,
}

#[derive(Debug)]
struct ScriptState {
    transactional: bool,
    version: String,
    replies: Vec<Reply>,
    failures: Vec<Failure>,
    connect_failures: VecDeque<DriverError>,
    missing_databases: HashSet<String>,
    events: Vec<ScriptEvent>,
    next_handle: usize,
    /// Bumped by `kill_connections`; handles from older generations are dead.
    generation: u64,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            transactional: true,
            version: SCRIPTED_VERSION.to_string(),
            replies: Vec::new(),
            failures: Vec::new(),
            connect_failures: VecDeque::new(),
            missing_databases: HashSet::new(),
            events: Vec::new(),
            next_handle: 0,
            generation: 0,
        }
    }
}

fn matches_prefix(sql: &str, prefix: &str) -> bool {
    let sql = sql.trim_start();
    sql.len() >= prefix.len()
        && sql.is_char_boundary(prefix.len())
        && sql[..prefix.len()].eq_ignore_ascii_case(prefix)
}

impl ScriptState {
    fn take_failure(&mut self, sql: &str) -> Option<DriverError> {
        let idx = self
            .failures
            .iter()
            .position(|f| matches_prefix(sql, &f.prefix))?;
        let failure = &mut self.failures[idx];
        let error = failure.error.clone();
        let exhausted = match failure.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(idx);
        }
        Some(error)
    }

    fn answer(&mut self, sql: &str) -> (Option<RawResultSet>, Vec<RawResultSet>) {
        // Latest matching reply wins so tests can override defaults.
        if let Some(reply) = self
            .replies
            .iter()
            .rev()
            .find(|r| matches_prefix(sql, &r.prefix))
        {
            return (reply.result.clone(), reply.extra.clone());
        }

        let trimmed = sql.trim_start();
        if matches_prefix(trimmed, "CREATE DATABASE") {
            if let Some(name) = trimmed["CREATE DATABASE".len()..].split_whitespace().next() {
                self.missing_databases.remove(name.trim_matches('`'));
            }
            return (None, Vec::new());
        }
        if matches_prefix(trimmed, "SHOW VARIABLES") {
            let set = result_set(
                &[("Variable_name", NativeType::VarString), ("Value", NativeType::VarString)],
                vec![vec![
                    Value::Text("version".into()),
                    Value::Text(self.version.clone()),
                ]],
            );
            return (Some(set), Vec::new());
        }
        if matches_prefix(trimmed, "SELECT GET_LOCK") || matches_prefix(trimmed, "SELECT RELEASE_LOCK") {
            let set = result_set(&[("lock", NativeType::LongLong)], vec![vec![Value::Int(1)]]);
            return (Some(set), Vec::new());
        }
        (None, Vec::new())
    }
}

/// Build a result set from `(name, type)` pairs and rows.
pub fn result_set(columns: &[(&str, NativeType)], rows: Vec<Vec<Value>>) -> RawResultSet {
    let columns = columns
        .iter()
        .map(|(name, native)| RawColumn::new(*name, *native))
        .collect();
    RawResultSet::new(columns, rows)
}

/// Shared, scriptable in-memory driver. Clones share one script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(&self, supported: bool) -> &Self {
        self.state.lock().transactional = supported;
        self
    }

    pub fn with_version(&self, version: &str) -> &Self {
        self.state.lock().version = version.to_string();
        self
    }

    /// Connecting to `database` fails with `ER_BAD_DB_ERROR` until it is created.
    pub fn with_missing_database(&self, database: &str) -> &Self {
        self.state.lock().missing_databases.insert(database.to_string());
        self
    }

    /// Answer statements starting with `prefix` with `result`.
    pub fn reply(&self, prefix: &str, result: RawResultSet) -> &Self {
        self.reply_with_extra(prefix, Some(result), Vec::new())
    }

    /// Answer with `result`, then hand out `extra` through `next_result`.
    pub fn reply_with_extra(
        &self,
        prefix: &str,
        result: Option<RawResultSet>,
        extra: Vec<RawResultSet>,
    ) -> &Self {
        self.state.lock().replies.push(Reply {
            prefix: prefix.to_string(),
            result,
            extra,
        });
        self
    }

    /// Fail the next statement starting with `prefix`.
    pub fn fail(&self, prefix: &str, error: DriverError) -> &Self {
        self.fail_times(prefix, error, Some(1))
    }

    /// Fail every statement starting with `prefix`.
    pub fn fail_always(&self, prefix: &str, error: DriverError) -> &Self {
        self.fail_times(prefix, error, None)
    }

    fn fail_times(&self, prefix: &str, error: DriverError, remaining: Option<usize>) -> &Self {
        self.state.lock().failures.push(Failure {
            prefix: prefix.to_string(),
            error,
            remaining,
        });
        self
    }

    /// Fail the next `connect` call.
    pub fn fail_connect(&self, error: DriverError) -> &Self {
        self.state.lock().connect_failures.push_back(error);
        self
    }

    /// Drop every open connection, as a server restart would.
    pub fn kill_connections(&self) {
        self.state.lock().generation += 1;
    }

    pub fn events(&self) -> Vec<ScriptEvent> {
        self.state.lock().events.clone()
    }

    /// Every statement received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ScriptEvent::Query { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Statements received by one handle.
    pub fn statements_for(&self, handle: usize) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ScriptEvent::Query { handle: h, sql } if *h == handle => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.count(|e| matches!(e, ScriptEvent::Connect { .. }))
    }

    pub fn close_count(&self) -> usize {
        self.count(|e| matches!(e, ScriptEvent::Close { .. }))
    }

    pub fn reconnect_count(&self) -> usize {
        self.count(|e| matches!(e, ScriptEvent::Reconnect { .. }))
    }

    fn count(&self, pred: impl Fn(&ScriptEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

impl Driver for ScriptedDriver {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn DriverHandle>, DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        if let Some(db) = &params.database {
            if state.missing_databases.contains(db) {
                return Err(DriverError::new(
                    codes::ER_BAD_DB_ERROR,
                    format!("Unknown database '{db}'"),
                ));
            }
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.events.push(ScriptEvent::Connect {
            handle,
            database: params.database.clone(),
        });

        Ok(Box::new(ScriptedHandle {
            id: handle,
            generation: state.generation,
            state: Arc::clone(&self.state),
            pending: VecDeque::new(),
            reconnect: false,
            closed: false,
        }))
    }
}

struct ScriptedHandle {
    id: usize,
    generation: u64,
    state: Arc<Mutex<ScriptState>>,
    pending: VecDeque<RawResultSet>,
    reconnect: bool,
    closed: bool,
}

impl ScriptedHandle {
    fn check_alive(&self, state: &ScriptState) -> Result<(), DriverError> {
        if self.closed || self.generation != state.generation {
            return Err(DriverError::new(
                codes::CR_SERVER_GONE_ERROR,
                "MySQL server has gone away",
            ));
        }
        Ok(())
    }
}

impl DriverHandle for ScriptedHandle {
    fn query(&mut self, sql: &str) -> Result<Option<RawResultSet>, DriverError> {
        let mut state = self.state.lock();
        state.events.push(ScriptEvent::Query {
            handle: self.id,
            sql: sql.to_string(),
        });
        self.check_alive(&state)?;
        if !self.pending.is_empty() {
            return Err(DriverError::new(
                codes::CR_COMMANDS_OUT_OF_SYNC,
                "Commands out of sync; you can't run this command now",
            ));
        }
        if let Some(err) = state.take_failure(sql) {
            return Err(err);
        }
        let (result, extra) = state.answer(sql);
        self.pending = extra.into();
        Ok(result)
    }

    fn next_result(&mut self) -> Result<Option<RawResultSet>, DriverError> {
        Ok(self.pending.pop_front())
    }

    fn ping(&mut self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.events.push(ScriptEvent::Ping { handle: self.id });
        if self.check_alive(&state).is_ok() {
            return Ok(());
        }
        if self.reconnect && !self.closed {
            self.generation = state.generation;
            self.pending.clear();
            state.events.push(ScriptEvent::Reconnect { handle: self.id });
            return Ok(());
        }
        self.check_alive(&state)
    }

    fn set_reconnect(&mut self, enabled: bool) {
        self.reconnect = enabled;
    }

    fn supports_transactions(&self) -> bool {
        self.state.lock().transactional
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state.lock().events.push(ScriptEvent::Close { handle: self.id });
        Ok(())
    }
}
