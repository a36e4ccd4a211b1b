//! Change tracking and dirty detection.
//!
//! Entities record the first previous value of every attribute written while
//! they are managed (see [`Entity`](entsync_core::Entity)). The
//! [`ChangeTracker`] turns that ledger into [`AttributeChanges`]: live
//! references become keys, collections become key lists or key sets, and
//! embedded values contribute nested changes under their owner's attribute.

use entsync_core::{
    AttrValue, AttributeChanges, AttributeKind, ChangeValue, CollectionKind, EntityKey, EntityRef,
    LazyRef, Result, Value, same_persistent_value,
};
use std::collections::BTreeSet;

/// Diffs entities against their change baseline.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeTracker;

impl ChangeTracker {
    pub fn new() -> Self {
        Self
    }

    /// Previous values of every attribute changed since the baseline.
    ///
    /// Attributes written back to their original value are not reported.
    /// A ledger entry for an attribute the descriptor does not know fails
    /// with a metadata error.
    #[tracing::instrument(level = "trace", skip(self, entity), fields(entity = entity.entity_name(), instance = %entity.id()))]
    pub fn changes_since(&self, entity: &EntityRef) -> Result<AttributeChanges> {
        let mut changes = AttributeChanges::new();
        if let Some(ledger) = entity.ledger() {
            let desc = entity.descriptor();
            for (name, old) in ledger {
                let attr = desc.require_attribute(&name)?;
                let now = entity.attr_value_or_empty(&name)?;
                if same_persistent_value(&now, &old) || same_set(&attr.kind, &now, &old) {
                    continue;
                }
                changes = changes.with_change(name, convert(&attr.kind, &old));
            }
        }
        for attr in entity.descriptor().embedded_attributes() {
            if let Some(embedded) = entity.embedded(&attr.name) {
                let nested = self.changes_since(&embedded)?;
                changes = changes.with_embedded(attr.name.clone(), nested);
            }
        }
        tracing::trace!(changed = changes.len(), "Computed attribute changes");
        Ok(changes)
    }

    /// Previous value of one attribute, if it changed.
    pub fn old_value(&self, entity: &EntityRef, attribute: &str) -> Result<Option<ChangeValue>> {
        Ok(self.changes_since(entity)?.old_value(attribute).cloned())
    }

    /// Names of changed attributes, sorted.
    pub fn changed_attribute_names(&self, entity: &EntityRef) -> Result<BTreeSet<String>> {
        Ok(self.changes_since(entity)?.attribute_set())
    }

    pub fn has_changes(&self, entity: &EntityRef) -> Result<bool> {
        Ok(self.changes_since(entity)?.has_changes())
    }

    /// Is a deletion signalled for this instance?
    ///
    /// True for a hard removal, or when the soft-deletion timestamp went from
    /// NULL to a value since the baseline.
    pub fn is_deletion(&self, entity: &EntityRef) -> bool {
        if entity.is_removed() {
            return true;
        }
        let Some(info) = entity.descriptor().soft_delete.as_ref() else {
            return false;
        };
        let populated = entity.get(&info.deleted_at).is_some_and(|v| !v.is_null());
        populated
            && entity.ledger().is_some_and(|ledger| {
                ledger.iter().any(|(name, old)| {
                    *name == info.deleted_at && matches!(old, AttrValue::Scalar(Value::Null))
                })
            })
    }

    /// Pre-delete values of an instance being deleted.
    ///
    /// Changed attributes report their baseline value; every other loaded
    /// attribute reports its current value.
    pub fn deletion_changes(&self, entity: &EntityRef) -> Result<AttributeChanges> {
        let mut changes = self.changes_since(entity)?;
        for attr in &entity.descriptor().attributes {
            let Some(current) = entity.attr_value(&attr.name) else {
                if attr.kind == AttributeKind::Scalar {
                    changes = changes.with_change(attr.name.clone(), ChangeValue::Scalar(Value::Null));
                }
                continue;
            };
            if matches!(current, AttrValue::Lazy(LazyRef::ToMany)) {
                continue;
            }
            changes = changes.with_change(attr.name.clone(), convert(&attr.kind, &current));
        }
        Ok(changes)
    }
}

/// Set-valued collections holding the same members in another order.
fn same_set(kind: &AttributeKind, a: &AttrValue, b: &AttrValue) -> bool {
    let AttributeKind::Collection {
        kind: CollectionKind::Set,
        ..
    } = kind
    else {
        return false;
    };
    match (a, b) {
        (AttrValue::Collection(x), AttrValue::Collection(y)) => {
            let x: BTreeSet<_> = x.iter().map(|e| e.id()).collect();
            let y: BTreeSet<_> = y.iter().map(|e| e.id()).collect();
            x == y
        }
        _ => false,
    }
}

/// Detach a recorded value from live instances.
fn convert(kind: &AttributeKind, value: &AttrValue) -> ChangeValue {
    match value {
        AttrValue::Scalar(v) => ChangeValue::Scalar(v.clone()),
        AttrValue::Reference(target) => ChangeValue::Reference(target.as_ref().map(|e| e.key())),
        AttrValue::Lazy(LazyRef::ToOne(fk)) => {
            let target = kind.target().unwrap_or_default();
            ChangeValue::Reference(fk.as_ref().map(|id| EntityKey::new(target, id.clone())))
        }
        AttrValue::Collection(items) => {
            let keys = items.iter().map(|e| e.key()).collect();
            match kind {
                AttributeKind::Collection {
                    kind: CollectionKind::Set,
                    ..
                } => ChangeValue::Set(keys),
                _ => ChangeValue::List(keys),
            }
        }
        AttrValue::Lazy(LazyRef::ToMany) => ChangeValue::List(Vec::new()),
        AttrValue::Embedded(e) => ChangeValue::Embedded(e.as_ref().map(|e| e.scalar_values())),
    }
}
