//! Core types for entsync.
//!
//! This crate provides the foundational abstractions shared by the session
//! and query layers:
//!
//! - `Value` for dynamically-typed attribute values
//! - `EntityDescriptor` / `MetadataRegistry` describing entity types
//! - `Entity` instances with lifecycle flags and a change ledger
//! - `AttributeChanges` describing what changed since the baseline
//! - `FetchPlan` describing which attributes must be loaded
//! - `IdentitySet` for identity-based bookkeeping

pub mod changes;
pub mod entity;
pub mod error;
pub mod identity;
pub mod key;
pub mod metadata;
pub mod plan;
pub mod value;

pub use changes::{AttributeChanges, ChangeValue};
pub use entity::{
    AttrValue, Entity, EntityRef, InstanceId, LazyRef, Lifecycle, same_persistent_value,
};
pub use error::{
    Error, LifecycleViolation, LifecycleViolationKind, MetadataError, PersistenceError,
    PersistenceErrorKind, Result, StoreConflictError,
};
pub use identity::IdentitySet;
pub use key::EntityKey;
pub use metadata::{
    AttributeDescriptor, AttributeKind, CascadePolicy, CollectionKind, DeletePolicy,
    EntityDescriptor, MAIN_STORE, MetadataRegistry, SoftDeleteInfo,
};
pub use plan::{FetchPlan, PlanNode};
pub use value::Value;
