//! Explicit transaction context.
//!
//! A [`TransactionContext`] is threaded through every coordinator call in
//! place of ambient transaction-bound state. It owns the resource holder, the
//! sessions opened for the transaction, the registered synchronizations and
//! the buffer of change events collected by implicit flushes.

use crate::events::EventBuffer;
use crate::registry::ResourceHolder;
use crate::session::OrmSession;
use entsync_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide sequence ordering transaction starts
/// against cache invalidations.
pub fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// When pending changes are flushed before queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// Flush before any query when unflushed changes exist.
    #[default]
    Auto,
    /// Flush only at commit.
    Commit,
}

/// Per-transaction options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub read_only: bool,
    /// Overrides the configured default when set.
    pub flush_mode: Option<FlushMode>,
}

impl TransactionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `read_only` option (builder pattern).
    #[must_use]
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Set the `flush_mode` option (builder pattern).
    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = Some(mode);
        self
    }
}

/// Transaction state machine: `Open → PreCommit → Committed | RolledBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Open,
    PreCommit,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub const fn is_active(self) -> bool {
        matches!(self, TransactionStatus::Open | TransactionStatus::PreCommit)
    }
}

/// Callbacks bound to a transaction's completion.
pub trait TransactionSynchronization: Send + Sync {
    /// Runs before the sessions commit. Returning `Err` rolls back.
    fn before_commit(&self, _tx: &mut TransactionContext) -> Result<()> {
        Ok(())
    }

    fn after_completion(&self, _status: TransactionStatus) {}
}

#[derive(Clone)]
pub(crate) enum Synchronization {
    /// The resource holder's synchronization, run by the coordinator.
    Registry,
    External(Arc<dyn TransactionSynchronization>),
}

/// Explicit state of one transaction.
pub struct TransactionContext {
    id: u64,
    started_at: u64,
    options: TransactionOptions,
    flush_mode: FlushMode,
    status: TransactionStatus,
    pub(crate) holder: Option<ResourceHolder>,
    pub(crate) sessions: Vec<Arc<dyn OrmSession>>,
    pub(crate) synchronizations: Vec<Synchronization>,
    pub(crate) pending_events: EventBuffer,
    pub(crate) flushing: bool,
    /// Types whose cached results the commit dropped; dropped again once the
    /// sessions have committed.
    pub(crate) invalidated_types: BTreeSet<String>,
    uncommitted_writes: bool,
}

impl TransactionContext {
    /// Open a new transaction. `default_flush_mode` applies unless the
    /// options override it.
    pub fn begin(options: TransactionOptions, default_flush_mode: FlushMode) -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        let flush_mode = options.flush_mode.unwrap_or(default_flush_mode);
        tracing::debug!(
            transaction = id,
            read_only = options.read_only,
            ?flush_mode,
            "Beginning transaction"
        );
        Self {
            id,
            started_at: next_sequence(),
            options,
            flush_mode,
            status: TransactionStatus::Open,
            holder: None,
            sessions: Vec::new(),
            synchronizations: Vec::new(),
            pending_events: EventBuffer::new(),
            flushing: false,
            invalidated_types: BTreeSet::new(),
            uncommitted_writes: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Position of the transaction start in [`next_sequence`]. Session
    /// snapshots taken by this transaction are no older than this.
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        tracing::trace!(transaction = self.id, from = ?self.status, to = ?status, "Transaction status");
        self.status = status;
    }

    /// Fail with `NoActiveTransaction` once the transaction has completed.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::NoActiveTransaction)
        }
    }

    /// Is a pre-commit traversal running right now?
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Register a synchronization.
    ///
    /// Synchronizations registered while the commit is already running get
    /// their `before_commit` called before the sessions commit.
    pub fn register_synchronization(
        &mut self,
        sync: Arc<dyn TransactionSynchronization>,
    ) -> Result<()> {
        self.ensure_active()?;
        self.synchronizations.push(Synchronization::External(sync));
        Ok(())
    }

    pub fn synchronization_count(&self) -> usize {
        self.synchronizations.len()
    }

    /// Session already opened for `store` in this transaction.
    pub fn session_for(&self, store: &str) -> Option<Arc<dyn OrmSession>> {
        self.sessions.iter().find(|s| s.store() == store).cloned()
    }

    pub fn sessions(&self) -> &[Arc<dyn OrmSession>] {
        &self.sessions
    }

    pub(crate) fn add_session(&mut self, session: Arc<dyn OrmSession>) {
        if !self.sessions.iter().any(|s| s.id() == session.id()) {
            self.sessions.push(session);
        }
    }

    /// Has this transaction written to a session without committing yet?
    /// Such state must not reach the shared result cache.
    pub fn has_uncommitted_writes(&self) -> bool {
        self.uncommitted_writes
    }

    /// Record a session write outside change tracking, such as a bulk update.
    pub fn mark_uncommitted_writes(&mut self) {
        self.uncommitted_writes = true;
    }

    /// Change events collected by implicit flushes and not yet published.
    pub fn pending_events(&self) -> &EventBuffer {
        &self.pending_events
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("read_only", &self.options.read_only)
            .field("flush_mode", &self.flush_mode)
            .field("sessions", &self.sessions.len())
            .field("synchronizations", &self.synchronizations.len())
            .field("pending_events", &self.pending_events.len())
            .field("uncommitted_writes", &self.uncommitted_writes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl TransactionSynchronization for Noop {}

    #[test]
    fn test_begin_assigns_unique_ids() {
        let a = TransactionContext::begin(TransactionOptions::new(), FlushMode::Auto);
        let b = TransactionContext::begin(TransactionOptions::new(), FlushMode::Auto);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.status(), TransactionStatus::Open);
    }

    #[test]
    fn test_flush_mode_override() {
        let tx = TransactionContext::begin(
            TransactionOptions::new().flush_mode(FlushMode::Commit),
            FlushMode::Auto,
        );
        assert_eq!(tx.flush_mode(), FlushMode::Commit);
        let tx = TransactionContext::begin(TransactionOptions::new(), FlushMode::Commit);
        assert_eq!(tx.flush_mode(), FlushMode::Commit);
    }

    #[test]
    fn test_completed_transaction_rejects_work() {
        let mut tx = TransactionContext::begin(TransactionOptions::new().read_only(true), FlushMode::Auto);
        assert!(tx.is_read_only());
        tx.register_synchronization(Arc::new(Noop)).unwrap();
        tx.set_status(TransactionStatus::RolledBack);
        assert!(matches!(tx.ensure_active(), Err(Error::NoActiveTransaction)));
        assert!(tx.register_synchronization(Arc::new(Noop)).is_err());
        assert_eq!(tx.synchronization_count(), 1);
    }

    #[test]
    fn test_start_sequence_is_monotonic() {
        let a = TransactionContext::begin(TransactionOptions::new(), FlushMode::Auto);
        let between = next_sequence();
        let b = TransactionContext::begin(TransactionOptions::new(), FlushMode::Auto);
        assert!(a.started_at() < between);
        assert!(between < b.started_at());
    }

    #[test]
    fn test_uncommitted_writes_flag() {
        let mut tx = TransactionContext::begin(TransactionOptions::new(), FlushMode::Auto);
        assert!(!tx.has_uncommitted_writes());
        tx.mark_uncommitted_writes();
        assert!(tx.has_uncommitted_writes());
    }

    #[test]
    fn test_flush_mode_deserialize() {
        let mode: FlushMode = serde_json::from_str("\"commit\"").unwrap();
        assert_eq!(mode, FlushMode::Commit);
    }
}
