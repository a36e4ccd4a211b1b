//! Transactional entity synchronization for entsync.
//!
//! `entsync-session` is the **unit-of-work layer**. It tracks which entity
//! instances a transaction touched, works out what changed, cascades saves and
//! removals across relations and drives the commit through the underlying ORM
//! sessions.
//!
//! # Role In The Architecture
//!
//! - **Resource holder**: per-transaction registry of managed instances,
//!   grouped by store and session ([`registry`]).
//! - **Change tracking**: previous values recorded by each instance are turned
//!   into [`entsync_core::AttributeChanges`] ([`change_tracker`]).
//! - **Cascades**: the closure of a save or remove request over relation
//!   attributes ([`cascade`]).
//! - **Commit coordination**: fixed-point pre-commit traversal, listener
//!   dispatch, detach and event publication ([`coordinator`], [`flush`]).
//!
//! # Design Philosophy
//!
//! - **Explicit transaction context**: every operation takes the
//!   [`TransactionContext`] it runs in; there is no ambient transaction.
//! - **Identity, not equality**: instances are tracked by
//!   [`entsync_core::InstanceId`] so two instances with equal keys stay apart.
//! - **Session boundary**: SQL generation and physical transactions belong to
//!   the [`OrmSession`] behind each store. [`memory`] provides one that keeps
//!   rows in memory.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = CommitCoordinator::new(metadata, CoordinatorConfig::default())?;
//! coordinator.add_store(StoreConfig::new("main"), Arc::new(database));
//!
//! let mut tx = coordinator.begin(TransactionOptions::new());
//! coordinator.save(&mut tx, SaveRequest::new().save(&customer))?;
//! coordinator.commit(&mut tx)?;
//! ```

pub mod cascade;
pub mod change_tracker;
pub mod coordinator;
pub mod events;
pub mod flush;
pub mod listeners;
pub mod memory;
pub mod registry;
pub mod session;
pub mod transaction;

pub use cascade::{AttributeLoader, CascadeClosure, CascadeResolver};
pub use change_tracker::ChangeTracker;
pub use coordinator::{
    CommitCoordinator, CoordinatorConfig, DEFAULT_UNIQUE_CONSTRAINT_PATTERN, SaveRequest,
    TypeInvalidation, is_soft_deleted,
};
pub use events::{ChangeType, EntityChangedEventInfo, EventBuffer};
pub use flush::FlushSummary;
pub use listeners::{
    EntityChangedListener, EntityListener, ListenerRegistry, ListenerScope, PreCommitListener,
};
pub use memory::{MemoryDatabase, MemorySession, QueryKind, QueryLogEntry, Row};
pub use registry::ResourceHolder;
pub use session::{
    CompareOp, Criterion, LockMode, OrmSession, SessionFactory, SessionId, SessionQuery,
    SortOrder, StoreConfig, UpdateAction,
};
pub use transaction::{
    FlushMode, TransactionContext, TransactionOptions, TransactionStatus,
    TransactionSynchronization, next_sequence,
};
