//! Commit coordination.
//!
//! The [`CommitCoordinator`] is shared by every transaction of a data manager.
//! It owns the store bindings, the listener registry and the cache
//! invalidation hooks; all per-transaction state travels in the
//! [`TransactionContext`] handed to each call.
//!
//! Commit runs as the registry synchronization of the transaction:
//!
//! 1. pre-commit traversal and read-only check
//! 2. fetch plan normalization
//! 3. pre-commit listeners, per store
//! 4. result cache invalidation for every touched type
//! 5. event collection, merged with events of earlier implicit flushes
//! 6. session flush and detach of all instances
//! 7. change event publication
//!
//! Work a listener starts during these steps registers new instances, which
//! re-arms the synchronization so the commit drains them before the sessions
//! commit. Once the sessions have committed, the types invalidated in step 4
//! are invalidated a second time.

use crate::cascade::CascadeResolver;
use crate::change_tracker::ChangeTracker;
use crate::events::EntityChangedEventInfo;
use crate::listeners::{
    EntityChangedListener, EntityListener, ListenerRegistry, ListenerScope, PreCommitListener,
};
use crate::session::{OrmSession, SessionFactory, StoreConfig};
use crate::transaction::{
    FlushMode, Synchronization, TransactionContext, TransactionOptions, TransactionStatus,
};
use entsync_core::{
    AttributeKind, DeletePolicy, EntityRef, Error, IdentitySet, LifecycleViolationKind,
    MetadataRegistry, PersistenceError, PersistenceErrorKind, Result, Value,
};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default pattern extracting the constraint name from a session message.
pub const DEFAULT_UNIQUE_CONSTRAINT_PATTERN: &str = r#"(?i)unique constraint\s+"?([A-Za-z0-9_.]+)"?"#;

/// Hook invalidating cached query results for entity types.
pub trait TypeInvalidation: Send + Sync {
    fn invalidate_types(&self, entity_names: &BTreeSet<String>);
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Bound on traversal rounds per flush or commit pass.
    pub max_flush_iterations: usize,
    /// Regex with one capture group for the constraint name.
    pub unique_constraint_pattern: String,
    /// Value written to the `deleted_by` attribute of soft-deleted entities.
    pub deleted_by: Option<String>,
    pub flush_mode: FlushMode,
    /// Whether removals of soft-deletable entities are soft by default.
    pub soft_deletion: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_flush_iterations: 100,
            unique_constraint_pattern: DEFAULT_UNIQUE_CONSTRAINT_PATTERN.to_string(),
            deleted_by: None,
            flush_mode: FlushMode::Auto,
            soft_deletion: true,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_flush_iterations(mut self, n: usize) -> Self {
        self.max_flush_iterations = n;
        self
    }

    #[must_use]
    pub fn with_unique_constraint_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.unique_constraint_pattern = pattern.into();
        self
    }

    #[must_use]
    pub fn with_deleted_by(mut self, user: impl Into<String>) -> Self {
        self.deleted_by = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn with_soft_deletion(mut self, enabled: bool) -> Self {
        self.soft_deletion = enabled;
        self
    }
}

/// Entities to save and remove in one request.
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub save: Vec<EntityRef>,
    pub remove: Vec<EntityRef>,
    /// Overrides [`CoordinatorConfig::soft_deletion`] when set.
    pub soft_deletion: Option<bool>,
}

impl SaveRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn save(mut self, entity: &EntityRef) -> Self {
        self.save.push(Arc::clone(entity));
        self
    }

    #[must_use]
    pub fn remove(mut self, entity: &EntityRef) -> Self {
        self.remove.push(Arc::clone(entity));
        self
    }

    #[must_use]
    pub fn soft_deletion(mut self, enabled: bool) -> Self {
        self.soft_deletion = Some(enabled);
        self
    }
}

struct StoreBinding {
    config: StoreConfig,
    factory: Arc<dyn SessionFactory>,
}

/// Drives saving, flushing, committing and rolling back transactions.
pub struct CommitCoordinator {
    metadata: Arc<MetadataRegistry>,
    config: CoordinatorConfig,
    unique_pattern: Regex,
    tracker: ChangeTracker,
    cascades: CascadeResolver,
    stores: RwLock<Vec<StoreBinding>>,
    listeners: RwLock<ListenerRegistry>,
    invalidations: RwLock<Vec<Arc<dyn TypeInvalidation>>>,
}

impl CommitCoordinator {
    /// Create a coordinator. Fails with a configuration error when the
    /// unique-constraint pattern does not compile.
    pub fn new(metadata: Arc<MetadataRegistry>, config: CoordinatorConfig) -> Result<Self> {
        let unique_pattern = Regex::new(&config.unique_constraint_pattern).map_err(|e| {
            Error::Config(format!(
                "invalid unique constraint pattern {:?}: {e}",
                config.unique_constraint_pattern
            ))
        })?;
        if unique_pattern.captures_len() < 2 {
            return Err(Error::Config(
                "unique constraint pattern needs a capture group for the constraint name".into(),
            ));
        }
        if config.max_flush_iterations == 0 {
            return Err(Error::Config("max_flush_iterations must be positive".into()));
        }
        Ok(Self {
            metadata,
            config,
            unique_pattern,
            tracker: ChangeTracker::new(),
            cascades: CascadeResolver::new(),
            stores: RwLock::new(Vec::new()),
            listeners: RwLock::new(ListenerRegistry::new()),
            invalidations: RwLock::new(Vec::new()),
        })
    }

    pub fn metadata(&self) -> &Arc<MetadataRegistry> {
        &self.metadata
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    // ========================================================================
    // Wiring
    // ========================================================================

    /// Bind a store to the factory opening its sessions.
    pub fn add_store(&self, store: StoreConfig, factory: Arc<dyn SessionFactory>) {
        let mut stores = self.stores.write();
        stores.retain(|b| b.config.name != store.name);
        tracing::debug!(store = %store.name, manager = %store.manager_key, "Binding store");
        stores.push(StoreBinding {
            config: store,
            factory,
        });
    }

    pub fn store_config(&self, store: &str) -> Result<StoreConfig> {
        self.stores
            .read()
            .iter()
            .find(|b| b.config.name == store)
            .map(|b| b.config.clone())
            .ok_or_else(|| Error::Config(format!("unknown store '{store}'")))
    }

    pub fn add_entity_listener(
        &self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn EntityListener>,
    ) {
        self.listeners
            .write()
            .add_entity_listener(entity, priority, listener);
    }

    pub fn add_pre_commit_listener(
        &self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn PreCommitListener>,
    ) {
        self.listeners
            .write()
            .add_pre_commit_listener(entity, priority, listener);
    }

    pub fn add_changed_listener(
        &self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn EntityChangedListener>,
    ) {
        self.listeners
            .write()
            .add_changed_listener(entity, priority, listener);
    }

    pub fn add_invalidation(&self, hook: Arc<dyn TypeInvalidation>) {
        self.invalidations.write().push(hook);
    }

    // ========================================================================
    // Transactions and sessions
    // ========================================================================

    pub fn begin(&self, options: TransactionOptions) -> TransactionContext {
        TransactionContext::begin(options, self.config.flush_mode)
    }

    /// Session serving `store` in this transaction, opened on first use.
    pub fn session(&self, tx: &mut TransactionContext, store: &str) -> Result<Arc<dyn OrmSession>> {
        tx.ensure_active()?;
        if let Some(session) = tx.session_for(store) {
            return Ok(session);
        }
        let factory = self
            .stores
            .read()
            .iter()
            .find(|b| b.config.name == store)
            .map(|b| Arc::clone(&b.factory))
            .ok_or_else(|| Error::Config(format!("unknown store '{store}'")))?;
        let session = factory.open_session(store)?;
        tracing::debug!(
            transaction = tx.id(),
            store,
            session = session.id(),
            "Opened session"
        );
        tx.add_session(Arc::clone(&session));
        Ok(session)
    }

    /// Register an instance with the transaction under its store's session.
    pub fn register(&self, tx: &mut TransactionContext, entity: &EntityRef) -> Result<()> {
        let store = self.store_config(entity.store())?;
        let session = self.session(tx, &store.name)?;
        tx.register(entity, &session, &store)
    }

    /// Register everything `session` materialized since the last call.
    pub fn attach_loaded(
        &self,
        tx: &mut TransactionContext,
        session: &Arc<dyn OrmSession>,
    ) -> Result<()> {
        let loaded = session.take_loaded();
        if loaded.is_empty() {
            return Ok(());
        }
        let store = self.store_config(session.store())?;
        tracing::trace!(count = loaded.len(), store = %store.name, "Attaching loaded instances");
        for entity in &loaded {
            if !tx.is_registered(entity) {
                tx.register(entity, session, &store)?;
            }
        }
        Ok(())
    }

    /// Resolve an unloaded attribute through the owning session.
    #[tracing::instrument(level = "debug", skip(self, tx, entity), fields(entity = entity.entity_name(), instance = %entity.id()))]
    pub fn load_attribute(
        &self,
        tx: &mut TransactionContext,
        entity: &EntityRef,
        attribute: &str,
    ) -> Result<()> {
        if entity.is_loaded(attribute) {
            return Ok(());
        }
        let session = self.session(tx, entity.store())?;
        let value = session
            .load_attribute(entity, attribute)
            .map_err(|e| self.map_session_error(e))?;
        entity.hydrate(attribute, value);
        self.attach_loaded(tx, &session)
    }

    // ========================================================================
    // Save / remove
    // ========================================================================

    /// Save and remove entities, including their cascade closure.
    ///
    /// Any error aborts the request; the transaction stays open and the
    /// caller decides whether to roll back.
    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id(), save = request.save.len(), remove = request.remove.len()))]
    pub fn save(&self, tx: &mut TransactionContext, request: SaveRequest) -> Result<()> {
        tx.ensure_active()?;
        let soft = request.soft_deletion.unwrap_or(self.config.soft_deletion);
        let closure = {
            let mut loader =
                |e: &EntityRef, attr: &str| -> Result<()> { self.load_attribute(tx, e, attr) };
            self.cascades
                .resolve(&request.save, &request.remove, &mut loader)?
        };
        for entity in request.save.iter().chain(closure.save.iter()) {
            self.save_one(tx, entity)?;
        }
        for entity in request.remove.iter().chain(closure.remove.iter()) {
            self.remove_one(tx, entity, soft)?;
        }
        Ok(())
    }

    fn save_one(&self, tx: &mut TransactionContext, entity: &EntityRef) -> Result<()> {
        if entity.is_embeddable() {
            return Err(Error::metadata(
                entity.entity_name(),
                None,
                "embeddable values are saved through their owner",
            ));
        }
        if entity.is_removed() {
            return Err(Error::lifecycle(
                LifecycleViolationKind::InvalidState,
                entity.key().to_string(),
                "cannot save a removed entity",
            ));
        }
        if entity.is_managed() {
            // Same transaction: nothing to do. Another one: rejected by register.
            return self.register(tx, entity);
        }
        let store = self.store_config(entity.store())?;
        let session = self.session(tx, &store.name)?;
        if entity.is_new() {
            tx.register(entity, &session, &store)?;
            if let Err(e) = session.persist(entity) {
                tx.unregister(entity, session.id(), &store.name);
                entity.revert_to_new();
                return Err(self.map_session_error(e));
            }
            tracing::trace!(entity = entity.entity_name(), instance = %entity.id(), "Persisted new instance");
            return Ok(());
        }

        let baseline = session
            .merge(entity)
            .map_err(|e| self.map_session_error(e))?
            .ok_or_else(|| {
                Error::Persistence(PersistenceError::new(
                    PersistenceErrorKind::NotFound,
                    format!("no stored row for detached {}", entity.key()),
                ))
            })?;
        if let Err(e) = tx.register(entity, &session, &store) {
            session.detach(entity);
            return Err(e);
        }
        entity.reattach(tx.id(), &baseline)?;
        tracing::trace!(entity = entity.entity_name(), instance = %entity.id(), "Merged detached instance");
        self.attach_loaded(tx, &session)
    }

    fn remove_one(&self, tx: &mut TransactionContext, entity: &EntityRef, soft: bool) -> Result<()> {
        if entity.is_removed() {
            return Ok(());
        }
        if entity.is_new() {
            // Never written: forget it instead of deleting.
            if entity.is_managed() {
                self.discard(tx, entity)?;
            }
            return Ok(());
        }
        if !entity.is_managed() {
            self.save_one(tx, entity)?;
        }
        let desc = Arc::clone(entity.descriptor());
        match desc.soft_delete.as_ref().filter(|_| soft) {
            Some(info) => {
                if entity.get(&info.deleted_at).is_some_and(|v| !v.is_null()) {
                    return Ok(());
                }
                self.check_deny_policies(entity)?;
                entity.set(&info.deleted_at, Value::Timestamp(now_micros()))?;
                if let (Some(attr), Some(user)) = (&info.deleted_by, &self.config.deleted_by) {
                    entity.set(attr, user.as_str())?;
                }
                tracing::debug!(entity = entity.entity_name(), instance = %entity.id(), "Soft-deleted instance");
            }
            None => {
                entity.mark_removed()?;
                let session = self.session(tx, entity.store())?;
                session.remove(entity).map_err(|e| self.map_session_error(e))?;
                tracing::debug!(entity = entity.entity_name(), instance = %entity.id(), "Removed instance");
            }
        }
        Ok(())
    }

    /// Drop a new instance that was never written.
    fn discard(&self, tx: &mut TransactionContext, entity: &EntityRef) -> Result<()> {
        let session = self.session(tx, entity.store())?;
        tx.unregister(entity, session.id(), entity.store());
        session.detach(entity);
        entity.revert_to_new();
        tracing::trace!(entity = entity.entity_name(), instance = %entity.id(), "Discarded unsaved instance");
        Ok(())
    }

    // ========================================================================
    // Delete policies
    // ========================================================================

    fn live_related(entity: &EntityRef, attribute: &str) -> Vec<EntityRef> {
        entity
            .attr_value(attribute)
            .map(|v| v.entities())
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !r.is_removed() && !is_soft_deleted(r))
            .collect()
    }

    fn check_deny_policies(&self, entity: &EntityRef) -> Result<()> {
        for attr in entity.descriptor().relations() {
            if attr.on_delete != Some(DeletePolicy::Deny) || !entity.is_loaded(&attr.name) {
                continue;
            }
            let related = Self::live_related(entity, &attr.name);
            if !related.is_empty() {
                return Err(Error::DeletePolicyViolation {
                    entity: entity.entity_name().to_string(),
                    attribute: attr.name.clone(),
                    related: related.len(),
                });
            }
        }
        Ok(())
    }

    /// Apply `on_delete` policies of a soft-deleted owner.
    pub(crate) fn apply_delete_policies(
        &self,
        tx: &mut TransactionContext,
        owner: &EntityRef,
    ) -> Result<()> {
        let relations: Vec<_> = owner
            .descriptor()
            .relations()
            .filter_map(|a| a.on_delete.map(|p| (a.clone(), p)))
            .collect();
        for (attr, policy) in relations {
            self.load_attribute(tx, owner, &attr.name)?;
            let related = Self::live_related(owner, &attr.name);
            match policy {
                DeletePolicy::Deny => {
                    if !related.is_empty() {
                        return Err(Error::DeletePolicyViolation {
                            entity: owner.entity_name().to_string(),
                            attribute: attr.name.clone(),
                            related: related.len(),
                        });
                    }
                }
                DeletePolicy::Cascade => {
                    for r in &related {
                        self.remove_one(tx, r, true)?;
                    }
                }
                DeletePolicy::Unlink => {
                    if attr.kind.is_reference() {
                        owner.set_reference(&attr.name, None)?;
                    } else if !related.is_empty() {
                        if let AttributeKind::Collection {
                            mapped_by: Some(back),
                            ..
                        } = &attr.kind
                        {
                            for r in &related {
                                r.set_reference(back, None)?;
                            }
                        }
                        owner.set_collection(&attr.name, Vec::new())?;
                    }
                }
            }
            tracing::trace!(
                entity = owner.entity_name(),
                attribute = %attr.name,
                ?policy,
                related = related.len(),
                "Applied delete policy"
            );
        }
        Ok(())
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Commit the transaction. On failure everything is rolled back and the
    /// error is returned.
    #[tracing::instrument(level = "debug", skip_all, fields(transaction = tx.id()))]
    pub fn commit(&self, tx: &mut TransactionContext) -> Result<()> {
        tx.ensure_active()?;
        tx.set_status(TransactionStatus::PreCommit);
        if let Err(e) = self.run_before_commit(tx) {
            tracing::warn!(transaction = tx.id(), error = %e, "Commit failed before completion, rolling back");
            self.rollback_inner(tx);
            return Err(e);
        }
        for session in tx.sessions().to_vec() {
            if let Err(e) = session.commit() {
                let e = self.map_session_error(e);
                tracing::warn!(transaction = tx.id(), error = %e, "Session commit failed, rolling back");
                self.rollback_inner(tx);
                return Err(e);
            }
        }
        tx.set_status(TransactionStatus::Committed);
        if let Some(holder) = tx.unbind_holder() {
            for entity in holder.new_detached() {
                entity.mark_persisted();
            }
            tracing::debug!(
                transaction = tx.id(),
                detached = holder.detached_instances().len(),
                "Transaction committed"
            );
        }
        self.after_completion(tx, TransactionStatus::Committed);
        Ok(())
    }

    /// Roll back the transaction. Completed transactions are left untouched.
    pub fn rollback(&self, tx: &mut TransactionContext) {
        if !tx.is_active() {
            tracing::trace!(transaction = tx.id(), status = ?tx.status(), "Rollback ignored");
            return;
        }
        self.rollback_inner(tx);
    }

    fn rollback_inner(&self, tx: &mut TransactionContext) {
        tracing::warn!(transaction = tx.id(), "Rolling back transaction");
        for session in tx.sessions() {
            session.rollback();
            session.clear();
        }
        if let Some(holder) = tx.unbind_holder() {
            let mut revert = IdentitySet::new();
            revert.extend_from(holder.new_detached());
            revert.extend_from(holder.saved_instances());
            for entity in holder.all_instances() {
                if entity.is_new() {
                    revert.insert(Arc::clone(&entity));
                }
                entity.mark_detached();
                entity.cancel_removal();
            }
            for entity in holder.detached_instances() {
                entity.cancel_removal();
            }
            for entity in &revert {
                entity.revert_to_new();
            }
            tracing::debug!(reverted = revert.len(), "Reverted new instances");
        }
        let dropped = tx.pending_events.take();
        if !dropped.is_empty() {
            tracing::debug!(count = dropped.len(), "Dropped unpublished change events");
        }
        tx.flushing = false;
        tx.set_status(TransactionStatus::RolledBack);
        self.after_completion(tx, TransactionStatus::RolledBack);
    }

    fn after_completion(&self, tx: &mut TransactionContext, status: TransactionStatus) {
        let invalidated = std::mem::take(&mut tx.invalidated_types);
        if status == TransactionStatus::Committed {
            // Results cached between the first invalidation and the session
            // commit were read from pre-commit state.
            self.invalidate(&invalidated);
        }
        for sync in std::mem::take(&mut tx.synchronizations) {
            if let Synchronization::External(s) = sync {
                s.after_completion(status);
            }
        }
    }

    /// Drain synchronizations, including ones registered while draining.
    fn run_before_commit(&self, tx: &mut TransactionContext) -> Result<()> {
        let mut i = 0;
        while i < tx.synchronizations.len() {
            match tx.synchronizations[i].clone() {
                Synchronization::Registry => {
                    tx.flushing = true;
                    let result = self.commit_pass(tx);
                    tx.flushing = false;
                    result?;
                }
                Synchronization::External(s) => s.before_commit(tx)?,
            }
            i += 1;
        }
        Ok(())
    }

    /// One pass of the registry synchronization.
    fn commit_pass(&self, tx: &mut TransactionContext) -> Result<()> {
        let mut state = crate::flush::TraversalState::default();
        let mut classified = self.traverse(tx, &mut state)?;
        self.check_read_only(tx, &classified)?;

        for entity in tx.all_instances() {
            entity.normalize_fetch_plan();
        }

        let by_store = tx
            .holder()
            .map(crate::registry::ResourceHolder::instances_by_store)
            .unwrap_or_default();
        for (store, instances) in by_store {
            let listeners = self.listeners.read().pre_commit_listeners(&instances);
            for (listener, seen) in listeners {
                let mut scope = ListenerScope::new(self, tx);
                listener.before_commit(&mut scope, &store, &seen)?;
            }
        }
        classified.extend(self.traverse(tx, &mut state)?);
        self.check_read_only(tx, &classified)?;

        let mut events = std::mem::take(&mut tx.pending_events);
        events.merge_all(self.build_events(&classified)?);
        let types: BTreeSet<String> = events.iter().map(|e| e.entity_name.clone()).collect();
        self.invalidate(&types);
        tx.invalidated_types.extend(types);

        self.detach_all(tx)?;
        tx.holder_mut()?.finish_pass();
        tx.rearm_registry();

        self.publish(tx, events.take())
    }

    fn invalidate(&self, types: &BTreeSet<String>) {
        if types.is_empty() {
            return;
        }
        let hooks = self.invalidations.read().clone();
        tracing::debug!(types = ?types, hooks = hooks.len(), "Invalidating cached results");
        for hook in hooks {
            hook.invalidate_types(types);
        }
    }

    fn detach_all(&self, tx: &mut TransactionContext) -> Result<()> {
        let instances = tx.all_instances();
        for entity in &instances {
            self.notify(tx, entity, |l, s, e| l.on_flush(s, e))?;
        }
        for session in tx.sessions().to_vec() {
            session.flush().map_err(|e| self.map_session_error(e))?;
        }
        for entity in &instances {
            self.notify(tx, entity, |l, s, e| l.before_detach(s, e))?;
        }
        for session in tx.sessions() {
            session.clear();
        }
        let holder = tx.holder_mut()?;
        for entity in &instances {
            let was_new = entity.is_new() || holder.is_saved(entity.id());
            entity.mark_detached();
            holder.record_detached(entity, was_new);
        }
        tracing::debug!(count = instances.len(), "Detached instances");
        Ok(())
    }

    fn publish(&self, tx: &mut TransactionContext, events: Vec<EntityChangedEventInfo>) -> Result<()> {
        tracing::debug!(count = events.len(), "Publishing change events");
        for event in &events {
            let listeners = self.listeners.read().changed_listeners(&event.entity_name);
            for listener in listeners {
                let mut scope = ListenerScope::new(self, tx);
                listener.entity_changed(&mut scope, event)?;
            }
        }
        Ok(())
    }

    /// Run an entity-listener hook for every listener of the instance's type.
    pub(crate) fn notify<F>(&self, tx: &mut TransactionContext, entity: &EntityRef, hook: F) -> Result<()>
    where
        F: Fn(&dyn EntityListener, &mut ListenerScope<'_>, &EntityRef) -> Result<()>,
    {
        let listeners = self.listeners.read().entity_listeners(entity.entity_name());
        for listener in listeners {
            let mut scope = ListenerScope::new(self, tx);
            hook(listener.as_ref(), &mut scope, entity)?;
        }
        Ok(())
    }

    /// Translate session errors; unique-constraint violations get their
    /// constraint name extracted.
    pub fn map_session_error(&self, err: Error) -> Error {
        match err {
            Error::Persistence(p) if p.is_constraint() => {
                let constraint = self
                    .unique_pattern
                    .captures(&p.message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string());
                match constraint {
                    Some(constraint) => Error::UniqueConstraintViolation {
                        constraint,
                        message: p.message,
                    },
                    None => Error::Persistence(p),
                }
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("config", &self.config)
            .field("stores", &self.stores.read().len())
            .field("listeners", &*self.listeners.read())
            .field("invalidations", &self.invalidations.read().len())
            .finish_non_exhaustive()
    }
}

/// Does the entity carry a soft-deletion marker?
pub fn is_soft_deleted(entity: &EntityRef) -> bool {
    entity
        .descriptor()
        .soft_delete
        .as_ref()
        .and_then(|info| entity.get(&info.deleted_at))
        .is_some_and(|v| !v.is_null())
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
