//! Transactional instance registry.
//!
//! The [`ResourceHolder`] maps store → session → managed instances for one
//! transaction and carries the side collections the commit protocol needs:
//! instances already classified as created or deleted, and new instances
//! detached by the commit (reverted to new on rollback).
//!
//! The holder is created on the first registration, belongs to exactly one
//! transaction and is dropped when the transaction completes.

use crate::session::{OrmSession, SessionId, StoreConfig};
use crate::transaction::{Synchronization, TransactionContext};
use entsync_core::{EntityRef, Error, IdentitySet, InstanceId, Result, StoreConflictError};
use std::sync::Arc;

#[derive(Debug, Default)]
struct StoreEntry {
    store: String,
    sessions: Vec<(SessionId, IdentitySet)>,
}

/// Per-transaction registry of managed instances.
#[derive(Debug)]
pub struct ResourceHolder {
    transaction: u64,
    manager_key: Option<String>,
    stores: Vec<StoreEntry>,
    saved: IdentitySet,
    removed: IdentitySet,
    new_detached: IdentitySet,
    detached: IdentitySet,
    sync_registered: bool,
}

impl ResourceHolder {
    pub fn new(transaction: u64) -> Self {
        Self {
            transaction,
            manager_key: None,
            stores: Vec::new(),
            saved: IdentitySet::new(),
            removed: IdentitySet::new(),
            new_detached: IdentitySet::new(),
            detached: IdentitySet::new(),
            sync_registered: false,
        }
    }

    pub fn transaction(&self) -> u64 {
        self.transaction
    }

    /// Transaction-manager key shared by every store in this holder.
    pub fn manager_key(&self) -> Option<&str> {
        self.manager_key.as_deref()
    }

    fn check_owner(&self, transaction: u64) -> Result<()> {
        if self.transaction == transaction {
            Ok(())
        } else {
            tracing::warn!(
                holder = self.transaction,
                transaction,
                "Resource holder used outside its transaction"
            );
            Err(Error::NoActiveTransaction)
        }
    }

    fn check_store(&self, store: &StoreConfig) -> Result<()> {
        match &self.manager_key {
            Some(key) if *key != store.manager_key => Err(Error::StoreConflict(StoreConflictError {
                store: store.name.clone(),
                expected_manager: key.clone(),
                actual_manager: store.manager_key.clone(),
            })),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, entity: &EntityRef, session: SessionId, store: &StoreConfig) -> bool {
        if self.manager_key.is_none() {
            self.manager_key = Some(store.manager_key.clone());
        }
        let entry = match self.stores.iter().position(|s| s.store == store.name) {
            Some(i) => &mut self.stores[i],
            None => {
                self.stores.push(StoreEntry {
                    store: store.name.clone(),
                    sessions: Vec::new(),
                });
                let last = self.stores.len() - 1;
                &mut self.stores[last]
            }
        };
        let set = match entry.sessions.iter().position(|(id, _)| *id == session) {
            Some(i) => &mut entry.sessions[i].1,
            None => {
                entry.sessions.push((session, IdentitySet::new()));
                let last = entry.sessions.len() - 1;
                &mut entry.sessions[last].1
            }
        };
        set.insert(Arc::clone(entity))
    }

    fn remove(&mut self, id: InstanceId, session: SessionId, store: &str) -> bool {
        self.stores
            .iter_mut()
            .filter(|s| s.store == store)
            .flat_map(|s| s.sessions.iter_mut())
            .filter(|(sid, _)| *sid == session)
            .any(|(_, set)| set.remove(id))
    }

    /// Membership snapshot for one session of one store.
    pub fn instances_for(&self, session: SessionId, store: &str) -> Vec<EntityRef> {
        self.stores
            .iter()
            .filter(|s| s.store == store)
            .flat_map(|s| s.sessions.iter())
            .filter(|(sid, _)| *sid == session)
            .flat_map(|(_, set)| set.iter().cloned())
            .collect()
    }

    /// Every registered instance, in store then registration order.
    pub fn all_instances(&self) -> Vec<EntityRef> {
        let mut all = IdentitySet::new();
        for entry in &self.stores {
            for (_, set) in &entry.sessions {
                all.extend_from(set);
            }
        }
        all.to_vec()
    }

    /// Registered instances grouped by store.
    pub fn instances_by_store(&self) -> Vec<(String, Vec<EntityRef>)> {
        self.stores
            .iter()
            .map(|entry| {
                let mut set = IdentitySet::new();
                for (_, s) in &entry.sessions {
                    set.extend_from(s);
                }
                (entry.store.clone(), set.to_vec())
            })
            .filter(|(_, items)| !items.is_empty())
            .collect()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.stores
            .iter()
            .flat_map(|s| s.sessions.iter())
            .any(|(_, set)| set.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.stores
            .iter()
            .flat_map(|s| s.sessions.iter())
            .all(|(_, set)| set.is_empty())
    }

    /// Already classified as created in this transaction?
    pub fn is_saved(&self, id: InstanceId) -> bool {
        self.saved.contains(id)
    }

    pub(crate) fn mark_saved(&mut self, entity: &EntityRef) {
        self.saved.insert(Arc::clone(entity));
    }

    /// Already classified as deleted in this transaction?
    pub fn is_removal_classified(&self, id: InstanceId) -> bool {
        self.removed.contains(id)
    }

    pub(crate) fn mark_removal_classified(&mut self, entity: &EntityRef) {
        self.removed.insert(Arc::clone(entity));
    }

    /// Snapshot of the classification markers, restored when a flush fails.
    pub(crate) fn markers(&self) -> (IdentitySet, IdentitySet) {
        (self.saved.clone(), self.removed.clone())
    }

    pub(crate) fn restore_markers(&mut self, markers: (IdentitySet, IdentitySet)) {
        (self.saved, self.removed) = markers;
    }

    pub fn saved_instances(&self) -> &IdentitySet {
        &self.saved
    }

    pub fn new_detached(&self) -> &IdentitySet {
        &self.new_detached
    }

    /// Instances detached by a completed commit pass.
    pub fn detached_instances(&self) -> &IdentitySet {
        &self.detached
    }

    pub fn is_sync_registered(&self) -> bool {
        self.sync_registered
    }

    /// Record an instance the commit has detached.
    pub(crate) fn record_detached(&mut self, entity: &EntityRef, was_new: bool) {
        if was_new {
            self.new_detached.insert(Arc::clone(entity));
        }
        self.detached.insert(Arc::clone(entity));
    }

    /// End a commit pass: instances the pass detached leave the registry and
    /// a later registration re-arms the synchronization.
    pub(crate) fn finish_pass(&mut self) {
        for entry in &mut self.stores {
            for (_, set) in &mut entry.sessions {
                *set = set.iter().filter(|e| e.is_managed()).cloned().collect();
            }
            entry.sessions.retain(|(_, set)| !set.is_empty());
        }
        self.stores.retain(|s| !s.sessions.is_empty());
        self.sync_registered = false;
    }
}

// ============================================================================
// Registry operations on the transaction
// ============================================================================

impl TransactionContext {
    /// Register `entity` as managed by this transaction.
    ///
    /// Creates the holder on first use and registers its synchronization
    /// exactly once per pass.
    #[tracing::instrument(level = "trace", skip(self, entity, session), fields(transaction = self.id(), instance = %entity.id()))]
    pub fn register(
        &mut self,
        entity: &EntityRef,
        session: &Arc<dyn OrmSession>,
        store: &StoreConfig,
    ) -> Result<()> {
        self.ensure_active()?;
        let tx_id = self.id();
        let holder = self.holder.get_or_insert_with(|| {
            tracing::debug!(transaction = tx_id, "Creating resource holder");
            ResourceHolder::new(tx_id)
        });
        holder.check_owner(tx_id)?;
        holder.check_store(store)?;
        entity.mark_managed(tx_id)?;
        if holder.insert(entity, session.id(), store) {
            tracing::trace!(
                entity = entity.entity_name(),
                store = %store.name,
                session = session.id(),
                "Registered instance"
            );
        }
        let arm = !holder.sync_registered;
        holder.sync_registered = true;
        if arm {
            self.synchronizations.push(Synchronization::Registry);
        }
        self.add_session(Arc::clone(session));
        Ok(())
    }

    /// Remove `entity` from the registry. Returns `true` if it was present.
    pub fn unregister(&mut self, entity: &EntityRef, session: SessionId, store: &str) -> bool {
        self.holder
            .as_mut()
            .is_some_and(|h| h.remove(entity.id(), session, store))
    }

    pub fn instances_for(&self, session: SessionId, store: &str) -> Vec<EntityRef> {
        self.holder
            .as_ref()
            .map(|h| h.instances_for(session, store))
            .unwrap_or_default()
    }

    pub fn all_instances(&self) -> Vec<EntityRef> {
        self.holder
            .as_ref()
            .map(ResourceHolder::all_instances)
            .unwrap_or_default()
    }

    pub fn is_registered(&self, entity: &EntityRef) -> bool {
        self.holder.as_ref().is_some_and(|h| h.contains(entity.id()))
    }

    pub fn holder(&self) -> Option<&ResourceHolder> {
        self.holder.as_ref()
    }

    pub(crate) fn holder_mut(&mut self) -> Result<&mut ResourceHolder> {
        let tx_id = self.id();
        let holder = self.holder.get_or_insert_with(|| ResourceHolder::new(tx_id));
        holder.check_owner(tx_id)?;
        Ok(holder)
    }

    /// Arm the registry synchronization again when instances joined after a
    /// commit pass detached the previous ones.
    pub(crate) fn rearm_registry(&mut self) {
        let Some(holder) = self.holder.as_mut() else {
            return;
        };
        if holder.is_empty() || holder.sync_registered {
            return;
        }
        holder.sync_registered = true;
        self.synchronizations.push(Synchronization::Registry);
    }

    /// Drop the holder when the transaction completes.
    pub(crate) fn unbind_holder(&mut self) -> Option<ResourceHolder> {
        self.holder.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatabase;
    use crate::session::SessionFactory;
    use crate::transaction::{FlushMode, TransactionOptions, TransactionStatus};
    use entsync_core::{Entity, EntityDescriptor, MetadataRegistry};

    fn setup() -> (Arc<EntityDescriptor>, Arc<dyn OrmSession>) {
        let mut reg = MetadataRegistry::new();
        let desc = reg.register(EntityDescriptor::new("Item"));
        let db = MemoryDatabase::new(Arc::new(reg));
        let session = db.open_session("main").unwrap();
        (desc, session)
    }

    fn tx() -> TransactionContext {
        TransactionContext::begin(TransactionOptions::new(), FlushMode::Auto)
    }

    #[test]
    fn test_register_marks_managed_and_arms_sync_once() {
        let (desc, session) = setup();
        let store = StoreConfig::new("main");
        let mut tx = tx();
        let a = Entity::new(Arc::clone(&desc));
        let b = Entity::new(Arc::clone(&desc));
        tx.register(&a, &session, &store).unwrap();
        tx.register(&b, &session, &store).unwrap();
        tx.register(&a, &session, &store).unwrap();

        assert!(a.is_managed());
        assert_eq!(a.transaction(), Some(tx.id()));
        assert_eq!(tx.all_instances().len(), 2);
        assert_eq!(tx.synchronization_count(), 1);
        assert!(tx.holder().unwrap().is_sync_registered());
        assert_eq!(tx.holder().unwrap().manager_key(), Some("main"));
    }

    #[test]
    fn test_registration_order_snapshot() {
        let (desc, session) = setup();
        let store = StoreConfig::new("main");
        let mut tx = tx();
        let items: Vec<_> = (0..3).map(|_| Entity::new(Arc::clone(&desc))).collect();
        for e in &items {
            tx.register(e, &session, &store).unwrap();
        }
        let ids: Vec<_> = tx.instances_for(session.id(), "main").iter().map(|e| e.id()).collect();
        assert_eq!(ids, items.iter().map(|e| e.id()).collect::<Vec<_>>());
        assert!(tx.unregister(&items[1], session.id(), "main"));
        assert!(!tx.unregister(&items[1], session.id(), "main"));
        assert_eq!(tx.all_instances().len(), 2);
    }

    #[test]
    fn test_store_conflict() {
        let (desc, session) = setup();
        let mut tx = tx();
        let a = Entity::new(Arc::clone(&desc));
        let b = Entity::new(Arc::clone(&desc));
        tx.register(&a, &session, &StoreConfig::new("main")).unwrap();
        let err = tx
            .register(&b, &session, &StoreConfig::new("audit").with_manager_key("audit-tm"))
            .unwrap_err();
        assert!(matches!(err, Error::StoreConflict(_)));
        assert!(err.is_fatal());
        assert!(!b.is_managed());

        let c = Entity::new(desc);
        tx.register(&c, &session, &StoreConfig::new("audit").with_manager_key("main"))
            .unwrap();
    }

    #[test]
    fn test_register_outside_transaction() {
        let (desc, session) = setup();
        let mut tx = tx();
        tx.set_status(TransactionStatus::Committed);
        let a = Entity::new(desc);
        let err = tx.register(&a, &session, &StoreConfig::new("main")).unwrap_err();
        assert!(matches!(err, Error::NoActiveTransaction));
        assert!(!a.is_managed());
    }

    #[test]
    fn test_entity_cannot_join_two_transactions() {
        let (desc, session) = setup();
        let store = StoreConfig::new("main");
        let mut first = tx();
        let mut second = tx();
        let a = Entity::new(desc);
        first.register(&a, &session, &store).unwrap();
        let err = second.register(&a, &session, &store).unwrap_err();
        assert!(matches!(err, Error::Lifecycle(_)));
        assert!(!second.is_registered(&a));
    }

    #[test]
    fn test_finish_pass_rearms_sync() {
        let (desc, session) = setup();
        let store = StoreConfig::new("main");
        let mut tx = tx();
        let a = Entity::new(Arc::clone(&desc));
        let kept = Entity::new(Arc::clone(&desc));
        tx.register(&a, &session, &store).unwrap();
        tx.register(&kept, &session, &store).unwrap();
        a.mark_detached();
        tx.holder_mut().unwrap().finish_pass();
        assert_eq!(tx.all_instances().len(), 1);
        assert!(!tx.holder().unwrap().is_sync_registered());
        tx.rearm_registry();
        assert_eq!(tx.synchronization_count(), 2);
        let b = Entity::new(desc);
        tx.register(&b, &session, &store).unwrap();
        assert_eq!(tx.synchronization_count(), 2);
    }
}
