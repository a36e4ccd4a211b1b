//! Lifecycle, pre-commit and change listeners.
//!
//! Listeners are registered per entity type, or for every type, with an
//! integer priority. They run in ascending priority order; listeners of equal
//! priority run in registration order.
//!
//! Every callback receives a [`ListenerScope`] giving access to the
//! coordinator and the running transaction, so a listener may save, remove or
//! load further entities. Work done that way joins the current commit.

use crate::coordinator::CommitCoordinator;
use crate::events::EntityChangedEventInfo;
use crate::transaction::TransactionContext;
use entsync_core::{EntityRef, Result};
use std::sync::Arc;

/// Coordinator and transaction handed to listener callbacks.
pub struct ListenerScope<'a> {
    pub coordinator: &'a CommitCoordinator,
    pub tx: &'a mut TransactionContext,
}

impl<'a> ListenerScope<'a> {
    pub fn new(coordinator: &'a CommitCoordinator, tx: &'a mut TransactionContext) -> Self {
        Self { coordinator, tx }
    }
}

/// Hooks around the pre-commit traversal of a single instance.
#[allow(unused_variables)]
pub trait EntityListener: Send + Sync {
    fn before_insert(&self, scope: &mut ListenerScope<'_>, entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    fn before_update(&self, scope: &mut ListenerScope<'_>, entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    fn before_delete(&self, scope: &mut ListenerScope<'_>, entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    fn before_detach(&self, scope: &mut ListenerScope<'_>, entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    /// Called for every registered instance before its session flushes.
    fn on_flush(&self, scope: &mut ListenerScope<'_>, entity: &EntityRef) -> Result<()> {
        Ok(())
    }
}

/// Called once per affected store before the commit detaches instances.
pub trait PreCommitListener: Send + Sync {
    fn before_commit(
        &self,
        scope: &mut ListenerScope<'_>,
        store: &str,
        instances: &[EntityRef],
    ) -> Result<()>;
}

/// Receives published change events.
pub trait EntityChangedListener: Send + Sync {
    fn entity_changed(
        &self,
        scope: &mut ListenerScope<'_>,
        event: &EntityChangedEventInfo,
    ) -> Result<()>;
}

struct Registered<L: ?Sized> {
    entity: Option<String>,
    priority: i32,
    listener: Arc<L>,
}

impl<L: ?Sized> Registered<L> {
    fn applies_to(&self, entity: &str) -> bool {
        self.entity.as_deref().is_none_or(|e| e == entity)
    }
}

/// Insert keeping ascending priority, after existing entries of equal priority.
fn insert_ordered<L: ?Sized>(list: &mut Vec<Registered<L>>, entry: Registered<L>) {
    let pos = list.partition_point(|r| r.priority <= entry.priority);
    list.insert(pos, entry);
}

/// Priority-ordered listener tables.
#[derive(Default)]
pub struct ListenerRegistry {
    entity: Vec<Registered<dyn EntityListener>>,
    pre_commit: Vec<Registered<dyn PreCommitListener>>,
    changed: Vec<Registered<dyn EntityChangedListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity listener for `entity`, or for every type when `None`.
    pub fn add_entity_listener(
        &mut self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn EntityListener>,
    ) {
        insert_ordered(
            &mut self.entity,
            Registered {
                entity: entity.map(str::to_string),
                priority,
                listener,
            },
        );
    }

    pub fn add_pre_commit_listener(
        &mut self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn PreCommitListener>,
    ) {
        insert_ordered(
            &mut self.pre_commit,
            Registered {
                entity: entity.map(str::to_string),
                priority,
                listener,
            },
        );
    }

    pub fn add_changed_listener(
        &mut self,
        entity: Option<&str>,
        priority: i32,
        listener: Arc<dyn EntityChangedListener>,
    ) {
        insert_ordered(
            &mut self.changed,
            Registered {
                entity: entity.map(str::to_string),
                priority,
                listener,
            },
        );
    }

    /// Entity listeners applying to `entity`, in invocation order.
    pub fn entity_listeners(&self, entity: &str) -> Vec<Arc<dyn EntityListener>> {
        self.entity
            .iter()
            .filter(|r| r.applies_to(entity))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    /// Pre-commit listeners paired with the instances each should see.
    ///
    /// Typed listeners see only instances of their type and are skipped when
    /// the store holds none.
    pub fn pre_commit_listeners(
        &self,
        instances: &[EntityRef],
    ) -> Vec<(Arc<dyn PreCommitListener>, Vec<EntityRef>)> {
        self.pre_commit
            .iter()
            .filter_map(|r| {
                let seen: Vec<EntityRef> = instances
                    .iter()
                    .filter(|e| r.applies_to(e.entity_name()))
                    .cloned()
                    .collect();
                (!seen.is_empty()).then(|| (Arc::clone(&r.listener), seen))
            })
            .collect()
    }

    pub fn changed_listeners(&self, entity: &str) -> Vec<Arc<dyn EntityChangedListener>> {
        self.changed
            .iter()
            .filter(|r| r.applies_to(entity))
            .map(|r| Arc::clone(&r.listener))
            .collect()
    }

    pub fn has_changed_listeners(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entity.len() + self.pre_commit.len() + self.changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("entity", &self.entity.len())
            .field("pre_commit", &self.pre_commit.len())
            .field("changed", &self.changed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entsync_core::{Entity, EntityDescriptor};
    use parking_lot::Mutex;

    struct Tagged(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl EntityListener for Tagged {
        fn before_insert(&self, _scope: &mut ListenerScope<'_>, _entity: &EntityRef) -> Result<()> {
            self.1.lock().push(self.0);
            Ok(())
        }
    }

    impl PreCommitListener for Tagged {
        fn before_commit(
            &self,
            _scope: &mut ListenerScope<'_>,
            _store: &str,
            _instances: &[EntityRef],
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_priority_then_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        let late: Arc<dyn EntityListener> = Arc::new(Tagged("late", Arc::clone(&log)));
        let first: Arc<dyn EntityListener> = Arc::new(Tagged("first", Arc::clone(&log)));
        let second: Arc<dyn EntityListener> = Arc::new(Tagged("second", Arc::clone(&log)));
        let any: Arc<dyn EntityListener> = Arc::new(Tagged("any", Arc::clone(&log)));
        reg.add_entity_listener(Some("Order"), 10, Arc::clone(&late));
        reg.add_entity_listener(Some("Order"), 1, Arc::clone(&first));
        reg.add_entity_listener(Some("Order"), 1, Arc::clone(&second));
        reg.add_entity_listener(None, 5, Arc::clone(&any));

        let listeners = reg.entity_listeners("Order");
        let expected = [first, second, any, late];
        assert_eq!(listeners.len(), expected.len());
        for (got, want) in listeners.iter().zip(&expected) {
            assert!(std::ptr::addr_eq(Arc::as_ptr(got), Arc::as_ptr(want)));
        }
    }

    #[test]
    fn test_type_filtering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        reg.add_entity_listener(Some("Order"), 0, Arc::new(Tagged("order", Arc::clone(&log))));
        reg.add_entity_listener(None, 0, Arc::new(Tagged("all", Arc::clone(&log))));
        assert_eq!(reg.entity_listeners("Order").len(), 2);
        assert_eq!(reg.entity_listeners("Customer").len(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_pre_commit_sees_only_its_type() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ListenerRegistry::new();
        reg.add_pre_commit_listener(Some("Order"), 0, Arc::new(Tagged("o", Arc::clone(&log))));
        reg.add_pre_commit_listener(None, 0, Arc::new(Tagged("a", Arc::clone(&log))));
        let customer = Entity::new(Arc::new(EntityDescriptor::new("Customer")));
        let pairs = reg.pre_commit_listeners(&[Arc::clone(&customer)]);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.len(), 1);

        let order = Entity::new(Arc::new(EntityDescriptor::new("Order")));
        let pairs = reg.pre_commit_listeners(&[customer, order]);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].1.len(), 1);
        assert_eq!(pairs[1].1.len(), 2);
    }
}
