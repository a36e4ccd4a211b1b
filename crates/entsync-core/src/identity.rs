//! Identity-keyed collections of entity instances.
//!
//! Membership is decided by [`InstanceId`], never by attribute values, and
//! iteration follows insertion order.

use crate::entity::{EntityRef, InstanceId};
use std::collections::HashSet;
use std::sync::Arc;

/// Insertion-ordered set of entity instances keyed by instance identity.
#[derive(Debug, Clone, Default)]
pub struct IdentitySet {
    items: Vec<EntityRef>,
    ids: HashSet<InstanceId>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an instance. Returns `false` if it was already present.
    pub fn insert(&mut self, entity: EntityRef) -> bool {
        if self.ids.insert(entity.id()) {
            self.items.push(entity);
            true
        } else {
            false
        }
    }

    /// Remove an instance. Returns `true` if it was present.
    pub fn remove(&mut self, id: InstanceId) -> bool {
        if self.ids.remove(&id) {
            self.items.retain(|e| e.id() != id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.ids.contains(&id)
    }

    pub fn contains_entity(&self, entity: &EntityRef) -> bool {
        self.contains(entity.id())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.items.iter()
    }

    /// Owned snapshot in insertion order.
    pub fn to_vec(&self) -> Vec<EntityRef> {
        self.items.iter().map(Arc::clone).collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
    }

    /// Add every instance of `other` not present yet.
    pub fn extend_from(&mut self, other: &IdentitySet) {
        for e in &other.items {
            self.insert(Arc::clone(e));
        }
    }
}

impl Extend<EntityRef> for IdentitySet {
    fn extend<T: IntoIterator<Item = EntityRef>>(&mut self, iter: T) {
        for e in iter {
            self.insert(e);
        }
    }
}

impl FromIterator<EntityRef> for IdentitySet {
    fn from_iter<T: IntoIterator<Item = EntityRef>>(iter: T) -> Self {
        let mut set = IdentitySet::new();
        set.extend(iter);
        set
    }
}

impl<'a> IntoIterator for &'a IdentitySet {
    type Item = &'a EntityRef;
    type IntoIter = std::slice::Iter<'a, EntityRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
