//! Entity instances and their lifecycle.
//!
//! An [`Entity`] is a dynamically-typed record described by an
//! [`EntityDescriptor`]. Instances are shared as [`EntityRef`]s and are
//! identified by their [`InstanceId`], never by attribute values, so the
//! registry and cascade bookkeeping stay correct while keys are still
//! unassigned or being edited.
//!
//! # Lifecycle
//!
//! ```text
//!          mark_managed            mark_removed
//!   NEW ───────────────▶ MANAGED ───────────────▶ REMOVED
//!    ▲                    │  ▲
//!    │ revert_to_new      │  │ reattach (merge)
//!    │                    ▼  │
//!    └──────────────── DETACHED
//! ```
//!
//! `new` is tracked as a flag next to the phase: a freshly persisted instance
//! is both new and managed until the transaction commits.
//!
//! # Change ledger
//!
//! While an instance is managed and no longer new, the first write to each
//! attribute records the attribute's previous value. The ledger is the raw
//! material for [`AttributeChanges`](crate::AttributeChanges).

use crate::error::{Error, LifecycleViolationKind, Result};
use crate::key::EntityKey;
use crate::metadata::{AttributeKind, EntityDescriptor};
use crate::plan::FetchPlan;
use crate::value::Value;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Shared handle to an entity instance.
pub type EntityRef = Arc<Entity>;

/// Placeholder for a relation that has not been loaded yet.
#[derive(Debug, Clone, PartialEq)]
pub enum LazyRef {
    /// To-one reference; carries the foreign key when one exists.
    ToOne(Option<Vec<Value>>),
    /// To-many collection.
    ToMany,
}

/// Current value of an attribute.
#[derive(Clone)]
pub enum AttrValue {
    Scalar(Value),
    Reference(Option<EntityRef>),
    Collection(Vec<EntityRef>),
    Embedded(Option<EntityRef>),
    Lazy(LazyRef),
}

impl AttrValue {
    /// Value an attribute of this kind has before it is ever written.
    pub fn empty_for(kind: &AttributeKind) -> Self {
        match kind {
            AttributeKind::Scalar => AttrValue::Scalar(Value::Null),
            AttributeKind::Reference { .. } => AttrValue::Reference(None),
            AttributeKind::Collection { .. } => AttrValue::Collection(Vec::new()),
            AttributeKind::Embedded { .. } => AttrValue::Embedded(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, AttrValue::Lazy(_))
    }

    /// Entities directly held by this value.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            AttrValue::Reference(Some(e)) | AttrValue::Embedded(Some(e)) => vec![Arc::clone(e)],
            AttrValue::Collection(items) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Same scalar value or same instances, compared without locking.
    pub fn same_instance(&self, other: &AttrValue) -> bool {
        match (self, other) {
            (AttrValue::Scalar(a), AttrValue::Scalar(b)) => a == b,
            (AttrValue::Reference(a), AttrValue::Reference(b))
            | (AttrValue::Embedded(a), AttrValue::Embedded(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.id() == b.id(),
                _ => false,
            },
            (AttrValue::Collection(a), AttrValue::Collection(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id() == y.id())
            }
            (AttrValue::Lazy(a), AttrValue::Lazy(b)) => a == b,
            _ => false,
        }
    }

    fn compatible_with(&self, kind: &AttributeKind) -> bool {
        match (self, kind) {
            (AttrValue::Scalar(_), AttributeKind::Scalar)
            | (AttrValue::Reference(_), AttributeKind::Reference { .. })
            | (AttrValue::Collection(_), AttributeKind::Collection { .. })
            | (AttrValue::Embedded(_), AttributeKind::Embedded { .. })
            | (AttrValue::Lazy(LazyRef::ToOne(_)), AttributeKind::Reference { .. })
            | (AttrValue::Lazy(LazyRef::ToMany), AttributeKind::Collection { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Scalar(v) => write!(f, "{v:?}"),
            AttrValue::Reference(None) | AttrValue::Embedded(None) => write!(f, "None"),
            AttrValue::Reference(Some(e)) | AttrValue::Embedded(Some(e)) => {
                write!(f, "{}{}", e.entity_name(), e.id())
            }
            AttrValue::Collection(items) => f
                .debug_list()
                .entries(items.iter().map(|e| e.id()))
                .finish(),
            AttrValue::Lazy(l) => write!(f, "Lazy({l:?})"),
        }
    }
}

/// Dominant lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    New,
    Managed,
    Detached,
    Removed,
}

#[derive(Default)]
struct EntityState {
    values: HashMap<String, AttrValue>,
    new: bool,
    managed: bool,
    detached: bool,
    removed: bool,
    transaction: Option<u64>,
    ledger: Option<Vec<(String, AttrValue)>>,
    plan: Option<FetchPlan>,
}

impl EntityState {
    fn tracking(&self) -> bool {
        self.managed && !self.new
    }
}

/// A dynamically-typed entity instance.
pub struct Entity {
    id: InstanceId,
    descriptor: Arc<EntityDescriptor>,
    state: RwLock<EntityState>,
}

impl Entity {
    /// Create a new (unsaved) instance.
    pub fn new(descriptor: Arc<EntityDescriptor>) -> EntityRef {
        Arc::new(Entity {
            id: InstanceId::next(),
            descriptor,
            state: RwLock::new(EntityState {
                new: true,
                ..EntityState::default()
            }),
        })
    }

    /// Create an instance materialized from stored values.
    ///
    /// The instance is neither new nor managed; the caller registers it.
    pub fn loaded(
        descriptor: Arc<EntityDescriptor>,
        values: impl IntoIterator<Item = (String, AttrValue)>,
    ) -> EntityRef {
        Arc::new(Entity {
            id: InstanceId::next(),
            descriptor,
            state: RwLock::new(EntityState {
                values: values.into_iter().collect(),
                detached: true,
                ..EntityState::default()
            }),
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    pub fn entity_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn store(&self) -> &str {
        &self.descriptor.store
    }

    pub fn is_embeddable(&self) -> bool {
        self.descriptor.embeddable
    }

    // ------------------------------------------------------------------
    // Lifecycle predicates
    // ------------------------------------------------------------------

    pub fn is_new(&self) -> bool {
        self.state.read().new
    }

    pub fn is_managed(&self) -> bool {
        self.state.read().managed
    }

    pub fn is_detached(&self) -> bool {
        self.state.read().detached
    }

    pub fn is_removed(&self) -> bool {
        self.state.read().removed
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let state = self.state.read();
        if state.removed {
            Lifecycle::Removed
        } else if state.managed {
            Lifecycle::Managed
        } else if state.detached {
            Lifecycle::Detached
        } else {
            Lifecycle::New
        }
    }

    /// Transaction currently managing this instance.
    pub fn transaction(&self) -> Option<u64> {
        self.state.read().transaction
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Attach to transaction `tx`. Embedded values follow their owner.
    pub fn mark_managed(&self, tx: u64) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.managed && state.transaction != Some(tx) {
                return Err(Error::lifecycle(
                    LifecycleViolationKind::ForeignTransaction,
                    self.describe_locked(&state),
                    "entity is managed by another transaction",
                ));
            }
            state.managed = true;
            state.detached = false;
            state.transaction = Some(tx);
        }
        for embedded in self.embedded_values() {
            embedded.mark_managed(tx)?;
        }
        Ok(())
    }

    /// Stop tracking. The ledger is discarded.
    pub fn mark_detached(&self) {
        {
            let mut state = self.state.write();
            state.managed = false;
            state.detached = true;
            state.transaction = None;
            state.ledger = None;
        }
        for embedded in self.embedded_values() {
            embedded.mark_detached();
        }
    }

    /// Flag a managed instance for hard deletion.
    pub fn mark_removed(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.managed {
            return Err(Error::lifecycle(
                LifecycleViolationKind::NotManaged,
                self.describe_locked(&state),
                "only managed entities can be removed",
            ));
        }
        state.removed = true;
        Ok(())
    }

    /// Withdraw a pending hard removal, e.g. when the transaction rolls back.
    pub fn cancel_removal(&self) {
        self.state.write().removed = false;
    }

    /// The instance has been written to the store; it is no longer new.
    pub fn mark_persisted(&self) {
        self.state.write().new = false;
        for embedded in self.embedded_values() {
            embedded.mark_persisted();
        }
    }

    /// Undo a failed first save so the instance can be saved again.
    pub fn revert_to_new(&self) {
        {
            let mut state = self.state.write();
            state.new = true;
            state.managed = false;
            state.detached = false;
            state.removed = false;
            state.transaction = None;
            state.ledger = None;
        }
        for embedded in self.embedded_values() {
            embedded.revert_to_new();
        }
    }

    /// Start a new change baseline, e.g. after an implicit flush.
    pub fn reset_ledger(&self) {
        self.state.write().ledger = None;
        for embedded in self.embedded_values() {
            embedded.reset_ledger();
        }
    }

    /// Re-attach a detached instance under `tx`.
    ///
    /// `baseline` holds the stored values; attributes whose current value
    /// differs from it enter the ledger with the stored value as their
    /// previous value.
    pub fn reattach(&self, tx: u64, baseline: &HashMap<String, AttrValue>) -> Result<()> {
        let current = self.values_snapshot();
        let mut ledger = Vec::new();
        for attr in &self.descriptor.attributes {
            let Some(stored) = baseline.get(&attr.name) else {
                continue;
            };
            let now = current
                .get(&attr.name)
                .cloned()
                .unwrap_or_else(|| AttrValue::empty_for(&attr.kind));
            if !now.is_loaded() || matches!(stored, AttrValue::Lazy(LazyRef::ToMany)) {
                continue;
            }
            if !same_persistent_value(&now, stored) {
                ledger.push((attr.name.clone(), stored.clone()));
            }
        }
        self.mark_managed(tx)?;
        let mut state = self.state.write();
        state.new = false;
        state.ledger = if ledger.is_empty() { None } else { Some(ledger) };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Attribute access
    // ------------------------------------------------------------------

    /// Scalar value of an attribute. Unset scalars read as NULL.
    pub fn get(&self, attr: &str) -> Option<Value> {
        match self.state.read().values.get(attr) {
            Some(AttrValue::Scalar(v)) => Some(v.clone()),
            Some(_) => None,
            None => self
                .descriptor
                .find_attribute(attr)
                .filter(|a| a.kind == AttributeKind::Scalar)
                .map(|_| Value::Null),
        }
    }

    /// Loaded to-one reference.
    pub fn reference(&self, attr: &str) -> Option<EntityRef> {
        match self.state.read().values.get(attr) {
            Some(AttrValue::Reference(e) | AttrValue::Embedded(e)) => e.clone(),
            _ => None,
        }
    }

    /// Loaded collection; empty when unset or not loaded.
    pub fn collection(&self, attr: &str) -> Vec<EntityRef> {
        match self.state.read().values.get(attr) {
            Some(AttrValue::Collection(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    pub fn embedded(&self, attr: &str) -> Option<EntityRef> {
        match self.state.read().values.get(attr) {
            Some(AttrValue::Embedded(e)) => e.clone(),
            _ => None,
        }
    }

    /// Raw attribute value, including lazy placeholders.
    pub fn attr_value(&self, attr: &str) -> Option<AttrValue> {
        self.state.read().values.get(attr).cloned()
    }

    /// Attribute value or the empty value for its kind.
    pub fn attr_value_or_empty(&self, attr: &str) -> Result<AttrValue> {
        let desc = self.descriptor.require_attribute(attr)?;
        Ok(self
            .attr_value(attr)
            .unwrap_or_else(|| AttrValue::empty_for(&desc.kind)))
    }

    /// Is the attribute loaded? Unknown attributes report `false`.
    pub fn is_loaded(&self, attr: &str) -> bool {
        if self.descriptor.find_attribute(attr).is_none() {
            return false;
        }
        self.state
            .read()
            .values
            .get(attr)
            .is_none_or(AttrValue::is_loaded)
    }

    /// Set a scalar attribute.
    pub fn set(&self, attr: &str, value: impl Into<Value>) -> Result<()> {
        self.write(attr, AttrValue::Scalar(value.into()))
    }

    pub fn set_reference(&self, attr: &str, target: Option<EntityRef>) -> Result<()> {
        self.write(attr, AttrValue::Reference(target))
    }

    pub fn set_collection(&self, attr: &str, items: Vec<EntityRef>) -> Result<()> {
        self.write(attr, AttrValue::Collection(items))
    }

    /// Append to a collection. A lazy collection is treated as empty.
    pub fn add_to_collection(&self, attr: &str, item: EntityRef) -> Result<()> {
        let mut items = self.collection(attr);
        items.push(item);
        self.write(attr, AttrValue::Collection(items))
    }

    /// Remove an instance from a collection by identity.
    pub fn remove_from_collection(&self, attr: &str, item: &EntityRef) -> Result<bool> {
        let mut items = self.collection(attr);
        let before = items.len();
        items.retain(|e| e.id() != item.id());
        if items.len() == before {
            return Ok(false);
        }
        self.write(attr, AttrValue::Collection(items))?;
        Ok(true)
    }

    /// Replace an embedded value. The new value adopts the owner's lifecycle.
    pub fn set_embedded(&self, attr: &str, value: Option<EntityRef>) -> Result<()> {
        self.write(attr, AttrValue::Embedded(value.clone()))?;
        if let Some(embedded) = value {
            let (new, tx) = {
                let state = self.state.read();
                (state.new, state.transaction.filter(|_| state.managed))
            };
            embedded.state.write().new = new;
            if let Some(tx) = tx {
                embedded.mark_managed(tx)?;
            }
        }
        Ok(())
    }

    /// Fill in a value read from the store. Bypasses the ledger.
    pub fn hydrate(&self, attr: &str, value: AttrValue) {
        self.state.write().values.insert(attr.to_string(), value);
    }

    fn write(&self, attr: &str, value: AttrValue) -> Result<()> {
        let desc = self.descriptor.require_attribute(attr)?;
        if !value.compatible_with(&desc.kind) {
            return Err(Error::metadata(
                &self.descriptor.name,
                Some(attr),
                "value does not match the attribute kind",
            ));
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        let old = state
            .values
            .get(attr)
            .cloned()
            .unwrap_or_else(|| AttrValue::empty_for(&desc.kind));

        if self.descriptor.is_primary_key(attr) && !old.same_instance(&value) {
            if state.removed {
                return Err(Error::lifecycle(
                    LifecycleViolationKind::IdentityChange,
                    self.describe_locked(state),
                    "cannot change the identity of a removed entity",
                ));
            }
            if state.managed && !state.new {
                return Err(Error::lifecycle(
                    LifecycleViolationKind::IdentityChange,
                    self.describe_locked(state),
                    "cannot change the identity of a persistent entity",
                ));
            }
        }

        if state.tracking() && !matches!(old, AttrValue::Lazy(LazyRef::ToMany)) {
            let ledger = state.ledger.get_or_insert_with(Vec::new);
            if !ledger.iter().any(|(name, _)| name == attr) && !old.same_instance(&value) {
                tracing::trace!(
                    entity = %self.descriptor.name,
                    instance = %self.id,
                    attribute = attr,
                    "Recording previous value"
                );
                ledger.push((attr.to_string(), old));
            }
        }
        state.values.insert(attr.to_string(), value);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ledger and snapshots
    // ------------------------------------------------------------------

    /// Recorded previous values, in first-write order. `None` when the
    /// instance has not been modified since the current baseline.
    pub fn ledger(&self) -> Option<Vec<(String, AttrValue)>> {
        self.state.read().ledger.clone()
    }

    pub fn has_ledger_entries(&self) -> bool {
        self.state
            .read()
            .ledger
            .as_ref()
            .is_some_and(|l| !l.is_empty())
    }

    pub fn values_snapshot(&self) -> HashMap<String, AttrValue> {
        self.state.read().values.clone()
    }

    /// Scalar attributes in descriptor order.
    pub fn scalar_values(&self) -> Vec<(String, Value)> {
        let state = self.state.read();
        self.descriptor
            .attributes
            .iter()
            .filter(|a| a.kind == AttributeKind::Scalar)
            .map(|a| {
                let v = match state.values.get(&a.name) {
                    Some(AttrValue::Scalar(v)) => v.clone(),
                    _ => Value::Null,
                };
                (a.name.clone(), v)
            })
            .collect()
    }

    /// Embedded values currently set, in descriptor order.
    pub fn embedded_values(&self) -> Vec<EntityRef> {
        let state = self.state.read();
        self.descriptor
            .embedded_attributes()
            .filter_map(|a| match state.values.get(&a.name) {
                Some(AttrValue::Embedded(Some(e))) => Some(Arc::clone(e)),
                _ => None,
            })
            .collect()
    }

    /// Primary key values in key order; unset components are NULL.
    pub fn key_values(&self) -> Vec<Value> {
        let state = self.state.read();
        self.descriptor
            .primary_key
            .iter()
            .map(|c| match state.values.get(c) {
                Some(AttrValue::Scalar(v)) => v.clone(),
                _ => Value::Null,
            })
            .collect()
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.descriptor.name.clone(), self.key_values())
    }

    // ------------------------------------------------------------------
    // Fetch plan
    // ------------------------------------------------------------------

    pub fn fetch_plan(&self) -> Option<FetchPlan> {
        self.state.read().plan.clone()
    }

    /// Attach a plan, merging with one already present.
    pub fn apply_fetch_plan(&self, plan: &FetchPlan) {
        let mut state = self.state.write();
        state.plan = Some(match state.plan.take() {
            Some(existing) => existing.merge(plan),
            None => plan.clone(),
        });
    }

    pub fn normalize_fetch_plan(&self) {
        if let Some(plan) = self.state.write().plan.as_mut() {
            plan.normalize();
        }
    }

    fn describe_locked(&self, state: &EntityState) -> String {
        let id: Vec<String> = self
            .descriptor
            .primary_key
            .iter()
            .map(|c| match state.values.get(c) {
                Some(AttrValue::Scalar(v)) => v.to_string(),
                _ => "NULL".to_string(),
            })
            .collect();
        format!("{}[{}] {}", self.descriptor.name, id.join(", "), self.id)
    }
}

/// Compare two values by persistent identity: references by key.
pub fn same_persistent_value(a: &AttrValue, b: &AttrValue) -> bool {
    if a.same_instance(b) {
        return true;
    }
    match (a, b) {
        (AttrValue::Reference(Some(x)), AttrValue::Reference(Some(y))) => x.key() == y.key(),
        (AttrValue::Collection(x), AttrValue::Collection(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| p.key() == q.key())
        }
        (AttrValue::Embedded(Some(x)), AttrValue::Embedded(Some(y))) => {
            x.scalar_values() == y.scalar_values()
        }
        (AttrValue::Reference(Some(e)), AttrValue::Lazy(LazyRef::ToOne(Some(fk))))
        | (AttrValue::Lazy(LazyRef::ToOne(Some(fk))), AttrValue::Reference(Some(e))) => {
            e.key_values() == *fk
        }
        (AttrValue::Reference(None), AttrValue::Lazy(LazyRef::ToOne(None)))
        | (AttrValue::Lazy(LazyRef::ToOne(None)), AttrValue::Reference(None)) => true,
        _ => false,
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Entity")
            .field("entity", &self.descriptor.name)
            .field("instance", &self.id)
            .field("new", &state.new)
            .field("managed", &state.managed)
            .field("detached", &state.detached)
            .field("removed", &state.removed)
            .finish_non_exhaustive()
    }
}
