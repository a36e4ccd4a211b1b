//! Entity change events.
//!
//! Classified instances become [`EntityChangedEventInfo`]s. Events collected
//! by implicit flushes wait in an [`EventBuffer`] until the commit publishes
//! them; the buffer holds at most one event per instance, merging later
//! classifications into the first one.

use entsync_core::{AttributeChanges, EntityKey, EntityRef, InstanceId};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Kind of change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeType::Created => "created",
            ChangeType::Updated => "updated",
            ChangeType::Deleted => "deleted",
        })
    }
}

/// A change to one entity instance.
#[derive(Clone)]
pub struct EntityChangedEventInfo {
    pub entity: EntityRef,
    pub change_type: ChangeType,
    /// Previous values. `None` for creations.
    pub changes: Option<AttributeChanges>,
    pub entity_name: String,
}

impl EntityChangedEventInfo {
    pub fn created(entity: EntityRef) -> Self {
        Self {
            entity_name: entity.entity_name().to_string(),
            entity,
            change_type: ChangeType::Created,
            changes: None,
        }
    }

    pub fn updated(entity: EntityRef, changes: AttributeChanges) -> Self {
        Self {
            entity_name: entity.entity_name().to_string(),
            entity,
            change_type: ChangeType::Updated,
            changes: Some(changes),
        }
    }

    pub fn deleted(entity: EntityRef, changes: AttributeChanges) -> Self {
        Self {
            entity_name: entity.entity_name().to_string(),
            entity,
            change_type: ChangeType::Deleted,
            changes: Some(changes),
        }
    }

    /// Current key of the instance.
    pub fn key(&self) -> EntityKey {
        self.entity.key()
    }

    pub fn instance(&self) -> InstanceId {
        self.entity.id()
    }

    /// Fold a later event for the same instance into this one.
    fn absorb(&mut self, later: EntityChangedEventInfo) {
        match (self.change_type, later.change_type) {
            (ChangeType::Deleted, _) | (ChangeType::Created, ChangeType::Updated | ChangeType::Created) => {}
            (ChangeType::Created, ChangeType::Deleted) => {
                self.change_type = ChangeType::Deleted;
                self.changes = later.changes;
            }
            (ChangeType::Updated, ChangeType::Updated | ChangeType::Deleted) => {
                let merged = match (&self.changes, &later.changes) {
                    (Some(a), Some(b)) => Some(a.merge(b)),
                    (Some(a), None) => Some(a.clone()),
                    (None, b) => b.clone(),
                };
                self.change_type = later.change_type;
                self.changes = merged;
            }
            (ChangeType::Updated, ChangeType::Created) => {}
        }
    }
}

impl fmt::Debug for EntityChangedEventInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityChangedEventInfo")
            .field("entity", &self.entity_name)
            .field("instance", &self.entity.id())
            .field("change_type", &self.change_type)
            .field("changes", &self.changes)
            .finish()
    }
}

/// Events keyed by instance identity, in first-seen order.
#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Vec<EntityChangedEventInfo>,
    index: HashMap<InstanceId, usize>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event, merging with an earlier one for the same instance.
    ///
    /// - created then updated stays created
    /// - created then deleted becomes deleted
    /// - updated then updated keeps the earliest previous values
    /// - a deletion is final
    pub fn push(&mut self, event: EntityChangedEventInfo) {
        let id = event.instance();
        if let Some(&pos) = self.index.get(&id) {
            let before = self.events[pos].change_type;
            self.events[pos].absorb(event);
            tracing::trace!(
                instance = %id,
                from = %before,
                to = %self.events[pos].change_type,
                "Merged change event"
            );
        } else {
            self.index.insert(id, self.events.len());
            self.events.push(event);
        }
    }

    /// Merge every event of `other` into this buffer.
    pub fn merge_all(&mut self, other: EventBuffer) {
        for event in other.events {
            self.push(event);
        }
    }

    /// Drain the buffer, leaving it empty.
    pub fn take(&mut self) -> Vec<EntityChangedEventInfo> {
        self.index.clear();
        std::mem::take(&mut self.events)
    }

    pub fn get(&self, id: InstanceId) -> Option<&EntityChangedEventInfo> {
        self.index.get(&id).map(|&pos| &self.events[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityChangedEventInfo> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Extend<EntityChangedEventInfo> for EventBuffer {
    fn extend<T: IntoIterator<Item = EntityChangedEventInfo>>(&mut self, iter: T) {
        for event in iter {
            self.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entsync_core::{ChangeValue, Entity, EntityDescriptor, Value};
    use std::sync::Arc;

    fn entity() -> EntityRef {
        Entity::new(Arc::new(EntityDescriptor::new("Item")))
    }

    fn changes(attr: &str, old: i64) -> AttributeChanges {
        AttributeChanges::new().with_change(attr, ChangeValue::Scalar(Value::BigInt(old)))
    }

    #[test]
    fn test_created_then_updated_stays_created() {
        let e = entity();
        let mut buf = EventBuffer::new();
        buf.push(EntityChangedEventInfo::created(Arc::clone(&e)));
        buf.push(EntityChangedEventInfo::updated(Arc::clone(&e), changes("a", 1)));
        assert_eq!(buf.len(), 1);
        let ev = buf.get(e.id()).unwrap();
        assert_eq!(ev.change_type, ChangeType::Created);
        assert!(ev.changes.is_none());
    }

    #[test]
    fn test_created_then_deleted_becomes_deleted() {
        let e = entity();
        let mut buf = EventBuffer::new();
        buf.push(EntityChangedEventInfo::created(Arc::clone(&e)));
        buf.push(EntityChangedEventInfo::deleted(Arc::clone(&e), changes("a", 1)));
        assert_eq!(buf.get(e.id()).unwrap().change_type, ChangeType::Deleted);
    }

    #[test]
    fn test_updates_keep_earliest_values() {
        let e = entity();
        let mut buf = EventBuffer::new();
        buf.push(EntityChangedEventInfo::updated(Arc::clone(&e), changes("a", 1)));
        buf.push(EntityChangedEventInfo::updated(
            Arc::clone(&e),
            changes("a", 2).with_change("b", ChangeValue::Scalar(Value::BigInt(5))),
        ));
        let ev = buf.get(e.id()).unwrap();
        assert_eq!(ev.change_type, ChangeType::Updated);
        let c = ev.changes.as_ref().unwrap();
        assert_eq!(c.old_value("a"), Some(&ChangeValue::Scalar(Value::BigInt(1))));
        assert!(c.is_changed("b"));
    }

    #[test]
    fn test_update_then_delete_and_delete_is_final() {
        let e = entity();
        let mut buf = EventBuffer::new();
        buf.push(EntityChangedEventInfo::updated(Arc::clone(&e), changes("a", 1)));
        buf.push(EntityChangedEventInfo::deleted(Arc::clone(&e), changes("a", 2)));
        buf.push(EntityChangedEventInfo::updated(Arc::clone(&e), changes("c", 3)));
        let ev = buf.get(e.id()).unwrap();
        assert_eq!(ev.change_type, ChangeType::Deleted);
        let c = ev.changes.as_ref().unwrap();
        assert_eq!(c.old_value("a"), Some(&ChangeValue::Scalar(Value::BigInt(1))));
        assert!(!c.is_changed("c"));
    }

    #[test]
    fn test_first_seen_order_and_take() {
        let (a, b) = (entity(), entity());
        let mut buf = EventBuffer::new();
        buf.push(EntityChangedEventInfo::updated(Arc::clone(&b), changes("x", 1)));
        buf.push(EntityChangedEventInfo::created(Arc::clone(&a)));
        buf.push(EntityChangedEventInfo::updated(Arc::clone(&b), changes("y", 1)));
        let mut other = EventBuffer::new();
        other.push(EntityChangedEventInfo::updated(Arc::clone(&a), changes("z", 1)));
        buf.merge_all(other);

        let order: Vec<_> = buf.iter().map(|e| e.instance()).collect();
        assert_eq!(order, vec![b.id(), a.id()]);
        let drained = buf.take();
        assert_eq!(drained.len(), 2);
        assert!(buf.is_empty());
        assert!(buf.get(a.id()).is_none());
    }
}
