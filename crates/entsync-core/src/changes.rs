//! Recorded attribute changes.
//!
//! [`AttributeChanges`] is the immutable result of diffing an entity against
//! its baseline: the previous value of every changed attribute, in the order
//! the attributes were first changed, plus nested changes of embedded values.

use crate::key::EntityKey;
use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeSet;

/// Previous value of an attribute, detached from live instances.
#[derive(Debug, Clone, Serialize)]
pub enum ChangeValue {
    Scalar(Value),
    Reference(Option<EntityKey>),
    /// Ordered collection.
    List(Vec<EntityKey>),
    /// Unordered collection; equality ignores order.
    Set(Vec<EntityKey>),
    /// Scalar snapshot of a replaced embedded value.
    Embedded(Option<Vec<(String, Value)>>),
}

impl ChangeValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ChangeValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&EntityKey> {
        match self {
            ChangeValue::Reference(k) => k.as_ref(),
            _ => None,
        }
    }

    /// Identity keys of a collection value.
    pub fn keys(&self) -> &[EntityKey] {
        match self {
            ChangeValue::List(keys) | ChangeValue::Set(keys) => keys,
            _ => &[],
        }
    }
}

impl PartialEq for ChangeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ChangeValue::Scalar(a), ChangeValue::Scalar(b)) => a == b,
            (ChangeValue::Reference(a), ChangeValue::Reference(b)) => a == b,
            (ChangeValue::List(a), ChangeValue::List(b)) => a == b,
            (ChangeValue::Set(a), ChangeValue::Set(b)) => {
                a.len() == b.len()
                    && a.iter().all(|k| {
                        a.iter().filter(|x| *x == k).count() == b.iter().filter(|x| *x == k).count()
                    })
            }
            (ChangeValue::Embedded(a), ChangeValue::Embedded(b)) => a == b,
            _ => false,
        }
    }
}

/// Previous values of the changed attributes of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttributeChanges {
    changes: Vec<(String, ChangeValue)>,
    embedded: Vec<(String, AttributeChanges)>,
}

impl AttributeChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the previous value of `attribute`. The first record wins.
    #[must_use]
    pub fn with_change(mut self, attribute: impl Into<String>, old: ChangeValue) -> Self {
        self.record(attribute.into(), old);
        self
    }

    /// Attach nested changes of the embedded value held by `attribute`.
    ///
    /// Empty nested changes are dropped.
    #[must_use]
    pub fn with_embedded(mut self, attribute: impl Into<String>, nested: AttributeChanges) -> Self {
        self.record_embedded(attribute.into(), nested);
        self
    }

    fn record(&mut self, attribute: String, old: ChangeValue) {
        if !self.changes.iter().any(|(name, _)| *name == attribute) {
            self.changes.push((attribute, old));
        }
    }

    fn record_embedded(&mut self, attribute: String, nested: AttributeChanges) {
        if !nested.has_changes() {
            return;
        }
        if let Some((_, existing)) = self.embedded.iter_mut().find(|(n, _)| *n == attribute) {
            *existing = existing.merge(&nested);
        } else {
            self.embedded.push((attribute, nested));
        }
    }

    /// True when any attribute, directly or through an embedded value, changed.
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty() || self.embedded.iter().any(|(_, c)| c.has_changes())
    }

    /// Was `attribute` changed, directly or through its embedded value?
    pub fn is_changed(&self, attribute: &str) -> bool {
        self.changes.iter().any(|(n, _)| n == attribute)
            || self.embedded.iter().any(|(n, _)| n == attribute)
    }

    /// Previous value of a directly changed attribute.
    pub fn old_value(&self, attribute: &str) -> Option<&ChangeValue> {
        self.changes
            .iter()
            .find(|(n, _)| n == attribute)
            .map(|(_, v)| v)
    }

    /// Nested changes recorded for an embedded attribute.
    pub fn embedded_changes(&self, attribute: &str) -> Option<&AttributeChanges> {
        self.embedded
            .iter()
            .find(|(n, _)| n == attribute)
            .map(|(_, c)| c)
    }

    /// Changed attribute names in first-change order, embedded parents last.
    pub fn attributes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.changes.iter().map(|(n, _)| n.as_str()).collect();
        for (n, _) in &self.embedded {
            if !names.contains(&n.as_str()) {
                names.push(n);
            }
        }
        names
    }

    pub fn attribute_set(&self) -> BTreeSet<String> {
        self.attributes().into_iter().map(str::to_string).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChangeValue)> {
        self.changes.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.attributes().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_changes()
    }

    /// Combine with changes recorded later in the same transaction.
    ///
    /// Previous values already present are kept, so the result always holds
    /// the value from before the transaction started.
    #[must_use]
    pub fn merge(&self, later: &AttributeChanges) -> AttributeChanges {
        let mut merged = self.clone();
        for (name, value) in &later.changes {
            merged.record(name.clone(), value.clone());
        }
        for (name, nested) in &later.embedded {
            merged.record_embedded(name.clone(), nested.clone());
        }
        merged
    }
}
