//! Access-control hook for loads.
//!
//! Constraints never see the session. They receive a [`QueryContext`] and may
//! add criteria or security parameters; the loader folds both into the query
//! and into its result-cache key.

use entsync_core::{Result, Value};
use entsync_session::Criterion;
use std::collections::BTreeMap;

/// Mutable view of a load offered to access constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    entity: String,
    criteria: Vec<Criterion>,
    security_parameters: BTreeMap<String, Value>,
}

impl QueryContext {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            criteria: Vec::new(),
            security_parameters: BTreeMap::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Restrict the load further.
    pub fn add_criterion(&mut self, criterion: Criterion) {
        self.criteria.push(criterion);
    }

    /// Record a value the restriction depends on, such as the current user.
    pub fn set_security_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.security_parameters.insert(name.into(), value.into());
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn security_parameters(&self) -> &BTreeMap<String, Value> {
        &self.security_parameters
    }

    /// `base` conjoined with every added criterion.
    pub fn apply_to(&self, base: Option<Criterion>) -> Option<Criterion> {
        self.criteria.iter().cloned().fold(base, |acc, c| match acc {
            Some(acc) => Some(acc.and(c)),
            None => Some(c),
        })
    }
}

/// Applied to every non-native load before execution.
pub trait AccessConstraint: Send + Sync {
    fn apply(&self, context: &mut QueryContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OwnRows(&'static str);

    impl AccessConstraint for OwnRows {
        fn apply(&self, context: &mut QueryContext) -> Result<()> {
            if context.entity() == "Document" {
                context.add_criterion(Criterion::eq("owner", self.0));
                context.set_security_parameter("user", self.0);
            }
            Ok(())
        }
    }

    #[test]
    fn test_constraint_adds_criteria_and_parameters() {
        let mut ctx = QueryContext::new("Document");
        OwnRows("alice").apply(&mut ctx).unwrap();
        let filter = ctx.apply_to(Some(Criterion::eq("title", "Plan"))).unwrap();
        assert!(matches!(filter, Criterion::And(ref items) if items.len() == 2));
        assert_eq!(ctx.security_parameters().get("user"), Some(&Value::from("alice")));
    }

    #[test]
    fn test_constraint_ignores_other_entities() {
        let mut ctx = QueryContext::new("Folder");
        OwnRows("alice").apply(&mut ctx).unwrap();
        assert!(ctx.criteria().is_empty());
        assert_eq!(ctx.apply_to(None), None);
    }
}
