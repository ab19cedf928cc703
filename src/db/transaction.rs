//! Ambient two-phase transactions.
//!
//! Each worker thread has at most one active `Transaction`. Connections join
//! it on first use and are committed or aborted together when the request
//! finishes. The manager never calls into a participant while holding its
//! own locks, so a participant may freely lock its connection.

use crate::db::pool::ThreadKey;
use crate::error::{GatewayError, GatewayResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A resource that takes part in a transaction.
pub trait TransactionParticipant: Send + Sync {
    /// Participants commit in ascending key order.
    fn sort_key(&self) -> String;

    fn commit(&self) -> GatewayResult<()>;

    fn abort(&self) -> GatewayResult<()>;

    /// Set a savepoint. `GatewayError::NotAvailable` means the caller has to
    /// fall back to aborting the whole transaction.
    fn savepoint(&self) -> GatewayResult<Box<dyn ParticipantSavepoint>>;
}

/// One participant's savepoint.
pub trait ParticipantSavepoint: Send {
    fn rollback(&self) -> GatewayResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
    /// Will abort instead of committing.
    Doomed,
}

struct TransactionInner {
    status: TransactionStatus,
    participants: Vec<Arc<dyn TransactionParticipant>>,
}

pub struct Transaction {
    inner: Mutex<TransactionInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("status", &inner.status)
            .field("participants", &inner.participants.len())
            .finish()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TransactionInner {
                status: TransactionStatus::Active,
                participants: Vec::new(),
            }),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.inner.lock().status
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    pub fn join(&self, participant: Arc<dyn TransactionParticipant>) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        if inner.status != TransactionStatus::Active {
            return Err(GatewayError::conflict(format!(
                "cannot join a transaction that is {:?}",
                inner.status
            )));
        }
        inner.participants.push(participant);
        Ok(())
    }

    /// Mark the transaction so that `commit` aborts it.
    pub fn doom(&self) {
        let mut inner = self.inner.lock();
        if inner.status == TransactionStatus::Active {
            inner.status = TransactionStatus::Doomed;
        }
    }

    /// Take the participants out and mark the transaction finished.
    fn finish(&self, status: TransactionStatus) -> Vec<Arc<dyn TransactionParticipant>> {
        let mut inner = self.inner.lock();
        inner.status = status;
        std::mem::take(&mut inner.participants)
    }

    /// Commit every participant in `sort_key` order.
    ///
    /// On the first failure the remaining participants are aborted, the
    /// transaction ends `Aborted` and the failure is returned.
    pub fn commit(&self) -> GatewayResult<()> {
        let status = self.status();
        match status {
            TransactionStatus::Active => {}
            TransactionStatus::Doomed => {
                self.abort()?;
                return Err(GatewayError::conflict("transaction was doomed"));
            }
            _ => {
                return Err(GatewayError::conflict(format!(
                    "cannot commit a transaction that is {status:?}"
                )));
            }
        }

        let mut participants = self.finish(TransactionStatus::Committed);
        participants.sort_by_key(|p| p.sort_key());

        for (idx, participant) in participants.iter().enumerate() {
            if let Err(err) = participant.commit() {
                error!(error = %err, "Participant failed to commit, aborting the rest");
                self.inner.lock().status = TransactionStatus::Aborted;
                for rest in &participants[idx..] {
                    if let Err(abort_err) = rest.abort() {
                        warn!(error = %abort_err, "Abort after failed commit also failed");
                    }
                }
                return Err(err);
            }
        }
        debug!(participants = participants.len(), "Transaction committed");
        Ok(())
    }

    /// Abort every participant. All are attempted; the first error is returned.
    pub fn abort(&self) -> GatewayResult<()> {
        let participants = self.finish(TransactionStatus::Aborted);
        let mut first_error = None;
        for participant in &participants {
            if let Err(err) = participant.abort() {
                error!(error = %err, "Participant failed to abort");
                first_error.get_or_insert(err);
            }
        }
        debug!(participants = participants.len(), "Transaction aborted");
        first_error.map_or(Ok(()), Err)
    }

    /// Savepoint across all participants joined so far.
    pub fn savepoint(&self) -> GatewayResult<TransactionSavepoint> {
        let participants = {
            let inner = self.inner.lock();
            if inner.status != TransactionStatus::Active {
                return Err(GatewayError::not_available(
                    "savepoint requires an active transaction",
                ));
            }
            inner.participants.clone()
        };
        let savepoints = participants
            .iter()
            .map(|p| p.savepoint())
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(TransactionSavepoint { savepoints })
    }
}

/// Savepoint of a whole transaction.
pub struct TransactionSavepoint {
    savepoints: Vec<Box<dyn ParticipantSavepoint>>,
}

impl std::fmt::Debug for TransactionSavepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSavepoint")
            .field("savepoints", &self.savepoints.len())
            .finish()
    }
}

impl TransactionSavepoint {
    pub fn len(&self) -> usize {
        self.savepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.savepoints.is_empty()
    }

    pub fn rollback(&self) -> GatewayResult<()> {
        for savepoint in &self.savepoints {
            savepoint.rollback()?;
        }
        Ok(())
    }
}

/// Ambient transaction per worker thread.
#[derive(Debug, Default)]
pub struct TransactionManager {
    transactions: DashMap<ThreadKey, Arc<Transaction>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread's active transaction, started on demand.
    pub fn current(&self, key: ThreadKey) -> Arc<Transaction> {
        let mut entry = self
            .transactions
            .entry(key)
            .or_insert_with(|| Arc::new(Transaction::new()));
        if matches!(
            entry.status(),
            TransactionStatus::Committed | TransactionStatus::Aborted
        ) {
            *entry = Arc::new(Transaction::new());
        }
        Arc::clone(entry.value())
    }

    /// Commit and forget the thread's transaction. No transaction is a no-op.
    pub fn commit(&self, key: ThreadKey) -> GatewayResult<()> {
        match self.transactions.remove(&key) {
            Some((_, txn)) => txn.commit(),
            None => Ok(()),
        }
    }

    pub fn abort(&self, key: ThreadKey) -> GatewayResult<()> {
        match self.transactions.remove(&key) {
            Some((_, txn)) => txn.abort(),
            None => Ok(()),
        }
    }

    pub fn doom(&self, key: ThreadKey) {
        self.current(key).doom();
    }

    /// Number of threads with a transaction.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
