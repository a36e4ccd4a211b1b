//! entsync - transactional entity synchronization.
//!
//! entsync sits between application code and an ORM session. It provides:
//!
//! - An entity lifecycle (new, managed, detached, removed) tracked per instance
//! - Attribute-level change tracking, including embedded values and collections
//! - Save and remove cascades across relations, with delete policies
//! - Change events published exactly once per instance and commit, even when
//!   queries flush changes in the middle of a transaction
//! - Batched loading by identifier and a shared query result cache
//!   invalidated on commit
//!
//! # Quick Start
//!
//! ```ignore
//! use entsync::prelude::*;
//!
//! let mut registry = MetadataRegistry::new();
//! registry.register(
//!     EntityDescriptor::new("Customer")
//!         .attribute(AttributeDescriptor::scalar("name"))
//!         .soft_delete("deleted_at", Some("deleted_by")),
//! );
//! let metadata = Arc::new(registry);
//! let database = MemoryDatabase::new(Arc::clone(&metadata));
//!
//! let manager = DataManager::builder()
//!     .with_store(StoreConfig::new(MAIN_STORE), Arc::new(database))
//!     .with_changed_listener(None, 0, Arc::new(audit_trail))
//!     .build_with(metadata)?;
//!
//! let mut tx = manager.begin();
//! let ada = manager.create("Customer")?;
//! ada.set("name", "Ada")?;
//! manager.persist(&mut tx, &ada)?;
//!
//! // Runs an implicit flush first; the commit still publishes one CREATED event.
//! let found = manager.load(&mut tx, &LoadSpec::new("Customer").condition(
//!     Criterion::eq("name", "Ada"),
//! ))?;
//! manager.commit(&mut tx)?;
//! ```

pub use entsync_core::{
    AttrValue, AttributeChanges, AttributeDescriptor, AttributeKind, CascadePolicy, ChangeValue,
    CollectionKind, DeletePolicy, Entity, EntityDescriptor, EntityKey, EntityRef, Error,
    FetchPlan, IdentitySet, InstanceId, Lifecycle, MAIN_STORE, MetadataRegistry, PlanNode,
    Result, SoftDeleteInfo, Value,
};

pub use entsync_session::{
    ChangeType, CommitCoordinator, CompareOp, Criterion, EntityChangedEventInfo,
    EntityChangedListener, EntityListener, FlushMode, FlushSummary, ListenerScope, LockMode,
    MemoryDatabase, OrmSession, PreCommitListener, QueryKind, QueryLogEntry, SaveRequest,
    SessionFactory, SortOrder, StoreConfig, TransactionContext, TransactionOptions,
    TransactionStatus, TransactionSynchronization,
};

pub use entsync_query::{
    AccessConstraint, CacheStats, DataLoader, LoadSpec, QueryContext, QueryHints, QueryParser,
    QueryResultCache, QueryTransformer, RegexQueryParser,
};

pub mod config;
pub use config::{DEFAULT_CACHE_CAPACITY, PersistenceConfig};

pub mod manager;
pub use manager::{DataManager, DataManagerBuilder};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entsync::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AttributeDescriptor, CascadePolicy, ChangeType, CompareOp, Criterion, DataManager,
        DataManagerBuilder, DeletePolicy, Entity, EntityChangedEventInfo, EntityChangedListener,
        EntityDescriptor, EntityRef, Error, FetchPlan, FlushMode, LoadSpec, LockMode, MAIN_STORE,
        MemoryDatabase, MetadataRegistry, PersistenceConfig, Result, SaveRequest, SortOrder,
        StoreConfig, TransactionContext, TransactionOptions, Value,
    };
    pub use std::sync::Arc;
}
