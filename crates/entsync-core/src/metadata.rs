//! Entity and attribute metadata.
//!
//! Every entity type is described once by an [`EntityDescriptor`] listing its
//! attributes, primary key, store and soft-deletion columns. Descriptors are
//! collected in a [`MetadataRegistry`], which the session, cascade and query
//! layers consult instead of inspecting instances.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Ordering semantics of a collection attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionKind {
    /// Ordered, duplicates allowed.
    #[default]
    List,
    /// Unordered, compared as a set of identities.
    Set,
}

/// Shape of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    /// Plain value column.
    Scalar,
    /// To-one reference to another entity.
    Reference { target: String },
    /// To-many collection of entities.
    Collection {
        target: String,
        kind: CollectionKind,
        /// Reference attribute on the target that points back to the owner.
        mapped_by: Option<String>,
    },
    /// Embedded value object without independent identity.
    Embedded { target: String },
}

impl AttributeKind {
    /// Target entity name for non-scalar attributes.
    pub fn target(&self) -> Option<&str> {
        match self {
            AttributeKind::Scalar => None,
            AttributeKind::Reference { target }
            | AttributeKind::Collection { target, .. }
            | AttributeKind::Embedded { target } => Some(target),
        }
    }

    pub const fn is_reference(&self) -> bool {
        matches!(self, AttributeKind::Reference { .. })
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self, AttributeKind::Collection { .. })
    }

    pub const fn is_embedded(&self) -> bool {
        matches!(self, AttributeKind::Embedded { .. })
    }
}

/// Which operations follow an attribute to the referenced entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadePolicy {
    pub persist: bool,
    pub merge: bool,
    pub remove: bool,
}

impl CascadePolicy {
    pub const NONE: Self = Self {
        persist: false,
        merge: false,
        remove: false,
    };

    pub const ALL: Self = Self {
        persist: true,
        merge: true,
        remove: true,
    };

    pub const PERSIST: Self = Self {
        persist: true,
        merge: false,
        remove: false,
    };

    pub const REMOVE: Self = Self {
        persist: false,
        merge: false,
        remove: true,
    };

    /// PERSIST and MERGE, the usual policy for owned children.
    pub const SAVE: Self = Self {
        persist: true,
        merge: true,
        remove: false,
    };

    pub const fn cascades_save(&self) -> bool {
        self.persist || self.merge
    }
}

/// What happens to related entities when a soft-deletable owner is soft-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    /// Delete the related entities too.
    Cascade,
    /// Refuse the deletion while related entities exist.
    Deny,
    /// Clear the link and keep the related entities.
    Unlink,
}

/// Metadata for one attribute of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub kind: AttributeKind,
    pub cascade: CascadePolicy,
    pub on_delete: Option<DeletePolicy>,
    /// Loaded on demand unless a fetch plan includes it.
    pub lazy: bool,
}

impl AttributeDescriptor {
    fn with_kind(name: impl Into<String>, kind: AttributeKind) -> Self {
        let lazy = !matches!(kind, AttributeKind::Scalar | AttributeKind::Embedded { .. });
        Self {
            name: name.into(),
            kind,
            cascade: CascadePolicy::NONE,
            on_delete: None,
            lazy,
        }
    }

    pub fn scalar(name: impl Into<String>) -> Self {
        Self::with_kind(name, AttributeKind::Scalar)
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AttributeKind::Reference {
                target: target.into(),
            },
        )
    }

    pub fn list(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AttributeKind::Collection {
                target: target.into(),
                kind: CollectionKind::List,
                mapped_by: None,
            },
        )
    }

    pub fn set(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AttributeKind::Collection {
                target: target.into(),
                kind: CollectionKind::Set,
                mapped_by: None,
            },
        )
    }

    pub fn embedded(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            AttributeKind::Embedded {
                target: target.into(),
            },
        )
    }

    #[must_use]
    pub fn cascade(mut self, policy: CascadePolicy) -> Self {
        self.cascade = policy;
        self
    }

    #[must_use]
    pub fn on_delete(mut self, policy: DeletePolicy) -> Self {
        self.on_delete = Some(policy);
        self
    }

    /// Set the inverse reference attribute of a collection.
    ///
    /// Has no effect on other attribute kinds.
    #[must_use]
    pub fn mapped_by(mut self, attribute: impl Into<String>) -> Self {
        if let AttributeKind::Collection { mapped_by, .. } = &mut self.kind {
            *mapped_by = Some(attribute.into());
        }
        self
    }

    /// Load this attribute together with its owner.
    #[must_use]
    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }
}

/// Soft-deletion columns of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftDeleteInfo {
    /// Timestamp attribute populated on deletion.
    pub deleted_at: String,
    /// Optional attribute receiving the deleting user.
    pub deleted_by: Option<String>,
}

/// Metadata for an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub name: String,
    /// Store (data source) the entity lives in.
    pub store: String,
    pub primary_key: Vec<String>,
    pub attributes: Vec<AttributeDescriptor>,
    pub soft_delete: Option<SoftDeleteInfo>,
    /// Embeddable value type: no identity of its own.
    pub embeddable: bool,
}

/// Store used when a descriptor does not name one.
pub const MAIN_STORE: &str = "main";

impl EntityDescriptor {
    /// Create a descriptor in the main store with an `id` primary key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: MAIN_STORE.to_string(),
            primary_key: vec!["id".to_string()],
            attributes: vec![AttributeDescriptor::scalar("id")],
            soft_delete: None,
            embeddable: false,
        }
    }

    /// Create an embeddable value type descriptor.
    pub fn embeddable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: MAIN_STORE.to_string(),
            primary_key: Vec::new(),
            attributes: Vec::new(),
            soft_delete: None,
            embeddable: true,
        }
    }

    #[must_use]
    pub fn store(mut self, store: impl Into<String>) -> Self {
        self.store = store.into();
        self
    }

    /// Replace the primary key. Missing key columns are added as scalars.
    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        self.attributes
            .retain(|a| !(a.name == "id" && !columns.iter().any(|c| c == "id")));
        for column in &columns {
            if self.find_attribute(column).is_none() {
                self.attributes.push(AttributeDescriptor::scalar(column.clone()));
            }
        }
        self.primary_key = columns;
        self
    }

    /// Add an attribute, replacing one with the same name.
    #[must_use]
    pub fn attribute(mut self, attribute: AttributeDescriptor) -> Self {
        if let Some(existing) = self.attributes.iter_mut().find(|a| a.name == attribute.name) {
            *existing = attribute;
        } else {
            self.attributes.push(attribute);
        }
        self
    }

    /// Enable soft deletion with the given timestamp and user attributes.
    #[must_use]
    pub fn soft_delete(mut self, deleted_at: impl Into<String>, deleted_by: Option<&str>) -> Self {
        let info = SoftDeleteInfo {
            deleted_at: deleted_at.into(),
            deleted_by: deleted_by.map(str::to_string),
        };
        self = self.attribute(AttributeDescriptor::scalar(info.deleted_at.clone()));
        if let Some(by) = &info.deleted_by {
            self = self.attribute(AttributeDescriptor::scalar(by.clone()));
        }
        self.soft_delete = Some(info);
        self
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up an attribute, failing with a metadata error when unknown.
    pub fn require_attribute(&self, name: &str) -> Result<&AttributeDescriptor> {
        self.find_attribute(name)
            .ok_or_else(|| Error::metadata(&self.name, Some(name), "unknown attribute"))
    }

    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|c| c == name)
    }

    pub fn has_composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    pub fn is_soft_deletable(&self) -> bool {
        self.soft_delete.is_some()
    }

    /// Reference and collection attributes.
    pub fn relations(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes
            .iter()
            .filter(|a| a.kind.is_reference() || a.kind.is_collection())
    }

    pub fn embedded_attributes(&self) -> impl Iterator<Item = &AttributeDescriptor> {
        self.attributes.iter().filter(|a| a.kind.is_embedded())
    }
}

/// Capability table mapping entity names to descriptors.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityDescriptor>>,
    order: Vec<String>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor and return the shared handle.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Arc<EntityDescriptor> {
        let name = descriptor.name.clone();
        let descriptor = Arc::new(descriptor);
        if self.entities.insert(name.clone(), Arc::clone(&descriptor)).is_none() {
            self.order.push(name);
        }
        descriptor
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<EntityDescriptor>> {
        self.get(name)
            .ok_or_else(|| Error::metadata(name, None, "entity type is not registered"))
    }

    /// Check every relation target and key column refers to something known.
    pub fn validate(&self) -> Result<()> {
        for name in &self.order {
            let Some(desc) = self.entities.get(name) else {
                continue;
            };
            if desc.primary_key.is_empty() && !desc.embeddable {
                return Err(Error::metadata(&desc.name, None, "entity has no primary key"));
            }
            for column in &desc.primary_key {
                let attr = desc.require_attribute(column)?;
                if attr.kind != AttributeKind::Scalar {
                    return Err(Error::metadata(
                        &desc.name,
                        Some(column),
                        "primary key attributes must be scalar",
                    ));
                }
            }
            for attr in &desc.attributes {
                if let Some(target) = attr.kind.target() {
                    let target_desc = self.require(target)?;
                    if attr.kind.is_embedded() != target_desc.embeddable {
                        return Err(Error::metadata(
                            &desc.name,
                            Some(&attr.name),
                            format!("target '{target}' embeddability does not match"),
                        ));
                    }
                    if let AttributeKind::Collection {
                        mapped_by: Some(inverse),
                        ..
                    } = &attr.kind
                    {
                        target_desc.require_attribute(inverse)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Registered names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MetadataRegistry {
        let mut reg = MetadataRegistry::new();
        reg.register(EntityDescriptor::embeddable("Address").attribute(AttributeDescriptor::scalar("city")));
        reg.register(
            EntityDescriptor::new("Customer")
                .attribute(AttributeDescriptor::scalar("name"))
                .attribute(AttributeDescriptor::embedded("address", "Address"))
                .attribute(
                    AttributeDescriptor::list("orders", "Order")
                        .mapped_by("customer")
                        .cascade(CascadePolicy::ALL),
                )
                .soft_delete("deleted_at", Some("deleted_by")),
        );
        reg.register(
            EntityDescriptor::new("Order")
                .attribute(AttributeDescriptor::reference("customer", "Customer")),
        );
        reg
    }

    #[test]
    fn test_descriptor_builder() {
        let reg = registry();
        let customer = reg.get("Customer").unwrap();
        assert_eq!(customer.primary_key, vec!["id".to_string()]);
        assert!(customer.is_soft_deletable());
        assert!(customer.find_attribute("deleted_at").is_some());
        assert!(customer.find_attribute("deleted_by").is_some());
        assert_eq!(customer.relations().count(), 1);
        assert_eq!(customer.embedded_attributes().count(), 1);
        assert!(customer.find_attribute("orders").unwrap().lazy);
        assert!(!customer.find_attribute("address").unwrap().lazy);
    }

    #[test]
    fn test_composite_primary_key() {
        let desc = EntityDescriptor::new("OrderLine").primary_key(["order_no", "line_no"]);
        assert!(desc.has_composite_key());
        assert!(desc.find_attribute("id").is_none());
        assert!(desc.is_primary_key("line_no"));
    }

    #[test]
    fn test_unknown_attribute_is_metadata_error() {
        let reg = registry();
        let order = reg.get("Order").unwrap();
        let err = order.require_attribute("missing").unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_validate_ok() {
        registry().validate().unwrap();
    }

    #[test]
    fn test_validate_unknown_target() {
        let mut reg = registry();
        reg.register(
            EntityDescriptor::new("Invoice").attribute(AttributeDescriptor::reference("order", "Nope")),
        );
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_validate_embeddable_mismatch() {
        let mut reg = registry();
        reg.register(
            EntityDescriptor::new("Invoice")
                .attribute(AttributeDescriptor::embedded("customer", "Customer")),
        );
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_primary_key() {
        let mut reg = registry();
        reg.register(EntityDescriptor::new("Invoice").primary_key(Vec::<String>::new()));
        let err = reg.validate().unwrap_err();
        assert!(matches!(err, Error::Metadata(_)));
        assert!(err.to_string().contains("Invoice"));
    }

    #[test]
    fn test_reregister_keeps_order() {
        let mut reg = registry();
        reg.register(EntityDescriptor::new("Customer"));
        let names: Vec<_> = reg.names().collect();
        assert_eq!(names, vec!["Address", "Customer", "Order"]);
        assert_eq!(reg.len(), 3);
    }
}
