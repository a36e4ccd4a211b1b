//! Boundary to the underlying ORM session.
//!
//! The coordinator never talks to a database directly. Every store is served
//! by an [`OrmSession`] obtained from the store's [`SessionFactory`]; the
//! session owns SQL generation, its first-level cache and the physical
//! transaction. [`crate::memory`] ships an in-memory implementation.

use entsync_core::{AttrValue, EntityRef, FetchPlan, Result, Value};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifier of an open session.
pub type SessionId = u64;

/// Comparison operators understood by criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Structured filter attached to a query next to its text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Criterion {
    Compare {
        attribute: String,
        op: CompareOp,
        value: Value,
    },
    In {
        attribute: String,
        values: Vec<Value>,
    },
    IsNull(String),
    NotNull(String),
    /// SQL `LIKE` with `%` and `_` wildcards.
    Like {
        attribute: String,
        pattern: String,
    },
    And(Vec<Criterion>),
    Or(Vec<Criterion>),
    Not(Box<Criterion>),
    /// Text-only condition; only sessions that parse query text can apply it.
    Raw(String),
}

impl Criterion {
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Criterion::Compare {
            attribute: attribute.into(),
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    /// Conjunction that flattens nested `And`s.
    #[must_use]
    pub fn and(self, other: Criterion) -> Criterion {
        match (self, other) {
            (Criterion::And(mut a), Criterion::And(b)) => {
                a.extend(b);
                Criterion::And(a)
            }
            (Criterion::And(mut a), c) => {
                a.push(c);
                Criterion::And(a)
            }
            (c, Criterion::And(mut b)) => {
                b.insert(0, c);
                Criterion::And(b)
            }
            (a, b) => Criterion::And(vec![a, b]),
        }
    }

    /// Evaluate against a row. Returns `None` for raw conditions.
    pub fn evaluate(&self, lookup: &dyn Fn(&str) -> Value) -> Option<bool> {
        Some(match self {
            Criterion::Compare {
                attribute,
                op,
                value,
            } => {
                let current = lookup(attribute);
                // SQL semantics: any comparison with NULL is not true.
                if current.is_null() || value.is_null() {
                    return Some(false);
                }
                match current.compare(value) {
                    Some(ord) => match op {
                        CompareOp::Eq => ord == Ordering::Equal,
                        CompareOp::Ne => ord != Ordering::Equal,
                        CompareOp::Lt => ord == Ordering::Less,
                        CompareOp::Le => ord != Ordering::Greater,
                        CompareOp::Gt => ord == Ordering::Greater,
                        CompareOp::Ge => ord != Ordering::Less,
                    },
                    None => *op == CompareOp::Ne,
                }
            }
            Criterion::In { attribute, values } => {
                let current = lookup(attribute);
                values.iter().any(|v| current.matches(v))
            }
            Criterion::IsNull(attribute) => lookup(attribute).is_null(),
            Criterion::NotNull(attribute) => !lookup(attribute).is_null(),
            Criterion::Like { attribute, pattern } => match lookup(attribute) {
                Value::Text(s) => like_match(&s, pattern),
                _ => false,
            },
            Criterion::And(items) => {
                for c in items {
                    if !c.evaluate(lookup)? {
                        return Some(false);
                    }
                }
                true
            }
            Criterion::Or(items) => {
                for c in items {
                    if c.evaluate(lookup)? {
                        return Some(true);
                    }
                }
                false
            }
            Criterion::Not(inner) => !inner.evaluate(lookup)?,
            Criterion::Raw(_) => return None,
        })
    }
}

fn like_match(text: &str, pattern: &str) -> bool {
    fn go(t: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('%', rest)) => (0..=t.len()).any(|i| go(&t[i..], rest)),
            Some(('_', rest)) => !t.is_empty() && go(&t[1..], rest),
            Some((c, rest)) => t.first() == Some(c) && go(&t[1..], rest),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    go(&t, &p)
}

/// Sort key of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortOrder {
    pub attribute: String,
    pub descending: bool,
}

impl SortOrder {
    pub fn asc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            descending: false,
        }
    }

    pub fn desc(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            descending: true,
        }
    }
}

/// Explicit row locking requested by a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockMode {
    /// Shared lock (`FOR SHARE`).
    Read,
    /// Exclusive lock (`FOR UPDATE`).
    Write,
    /// Exclusive lock, fail immediately when unavailable.
    WriteNoWait,
}

/// Bulk modification executed by [`OrmSession::execute_update`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UpdateAction {
    Set(Vec<(String, Value)>),
    Delete,
}

/// A query handed to a session.
///
/// `text` is the rendered query string; `filter` carries the same condition
/// in structured form so sessions that do not parse text can evaluate it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionQuery {
    pub entity: String,
    pub text: String,
    pub parameters: Vec<(String, Value)>,
    pub filter: Option<Criterion>,
    /// Restrict to these single-column primary key values.
    pub ids: Option<Vec<Value>>,
    pub sort: Vec<SortOrder>,
    pub first: usize,
    pub max: Option<usize>,
    pub lock_mode: Option<LockMode>,
    #[serde(skip)]
    pub plan: Option<FetchPlan>,
    /// Attributes returned by [`OrmSession::project`].
    pub projection: Vec<String>,
    pub update: Option<UpdateAction>,
}

impl SessionQuery {
    pub fn new(entity: impl Into<String>) -> Self {
        let entity = entity.into();
        Self {
            text: format!("select e from {entity} e"),
            entity,
            parameters: Vec::new(),
            filter: None,
            ids: None,
            sort: Vec::new(),
            first: 0,
            max: None,
            lock_mode: None,
            plan: None,
            projection: Vec::new(),
            update: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Criterion) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Vec<Value>) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort.push(sort);
        self
    }

    #[must_use]
    pub fn with_page(mut self, first: usize, max: Option<usize>) -> Self {
        self.first = first;
        self.max = max;
        self
    }

    #[must_use]
    pub fn with_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = Some(mode);
        self
    }

    #[must_use]
    pub fn with_plan(mut self, plan: FetchPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    #[must_use]
    pub fn with_projection<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = attributes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_update(mut self, action: UpdateAction) -> Self {
        self.update = Some(action);
        self
    }
}

/// Operations the coordinator needs from the underlying ORM session.
///
/// Sessions use interior mutability; one session belongs to one transaction.
pub trait OrmSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn store(&self) -> &str;

    /// Make a new instance persistent. Written on the next flush.
    fn persist(&self, entity: &EntityRef) -> Result<()>;

    /// Attach a detached instance.
    ///
    /// Returns the stored attribute values, which become the instance's change
    /// baseline, or `None` when no stored row exists.
    fn merge(&self, entity: &EntityRef) -> Result<Option<HashMap<String, AttrValue>>>;

    /// Schedule deletion of a removed instance.
    fn remove(&self, entity: &EntityRef) -> Result<()>;

    fn find(&self, entity: &str, id: &[Value], plan: Option<&FetchPlan>)
    -> Result<Option<EntityRef>>;

    fn query(&self, query: &SessionQuery) -> Result<Vec<EntityRef>>;

    fn count(&self, query: &SessionQuery) -> Result<u64>;

    fn execute_update(&self, query: &SessionQuery) -> Result<u64>;

    /// Value rows for the query's projection.
    fn project(&self, query: &SessionQuery) -> Result<Vec<Vec<Value>>>;

    /// Resolve an unloaded attribute of an instance.
    fn load_attribute(&self, entity: &EntityRef, attribute: &str) -> Result<AttrValue>;

    /// Instances materialized since the last call, in load order.
    fn take_loaded(&self) -> Vec<EntityRef>;

    /// Write pending changes without committing.
    fn flush(&self) -> Result<()>;

    /// Drop the first-level cache.
    fn clear(&self);

    fn detach(&self, entity: &EntityRef);

    fn commit(&self) -> Result<()>;

    fn rollback(&self);
}

/// Opens sessions for a store.
pub trait SessionFactory: Send + Sync {
    fn open_session(&self, store: &str) -> Result<Arc<dyn OrmSession>>;
}

/// Static description of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub name: String,
    /// Stores sharing a key share one transaction manager.
    pub manager_key: String,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            manager_key: name.clone(),
            name,
        }
    }

    #[must_use]
    pub fn with_manager_key(mut self, key: impl Into<String>) -> Self {
        self.manager_key = key.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, total: i64) -> impl Fn(&str) -> Value {
        let name = name.to_string();
        move |attr: &str| match attr {
            "name" => Value::Text(name.clone()),
            "total" => Value::BigInt(total),
            _ => Value::Null,
        }
    }

    #[test]
    fn test_compare_criteria() {
        let lookup = row("Ada", 10);
        let c = Criterion::Compare {
            attribute: "total".into(),
            op: CompareOp::Ge,
            value: Value::Int(10),
        };
        assert_eq!(c.evaluate(&lookup), Some(true));
        let c = Criterion::Compare {
            attribute: "total".into(),
            op: CompareOp::Lt,
            value: Value::Int(10),
        };
        assert_eq!(c.evaluate(&lookup), Some(false));
    }

    #[test]
    fn test_null_semantics() {
        let lookup = row("Ada", 10);
        assert_eq!(Criterion::eq("missing", 1_i64).evaluate(&lookup), Some(false));
        assert_eq!(Criterion::IsNull("missing".into()).evaluate(&lookup), Some(true));
        assert_eq!(Criterion::NotNull("name".into()).evaluate(&lookup), Some(true));
    }

    #[test]
    fn test_boolean_composition() {
        let lookup = row("Ada", 10);
        let c = Criterion::eq("name", "Ada").and(Criterion::Or(vec![
            Criterion::eq("total", 1_i64),
            Criterion::Not(Box::new(Criterion::eq("total", 2_i64))),
        ]));
        assert_eq!(c.evaluate(&lookup), Some(true));
        assert!(matches!(c, Criterion::And(ref items) if items.len() == 2));
    }

    #[test]
    fn test_raw_is_not_evaluable() {
        let lookup = row("Ada", 10);
        let c = Criterion::eq("name", "Ada").and(Criterion::Raw("e.x > 1".into()));
        assert_eq!(c.evaluate(&lookup), None);
    }

    #[test]
    fn test_like() {
        assert!(like_match("Grace Hopper", "Grace%"));
        assert!(like_match("abc", "a_c"));
        assert!(!like_match("abc", "a_d"));
        assert!(like_match("", "%"));
    }

    #[test]
    fn test_in_criterion_loose_numeric() {
        let lookup = row("Ada", 10);
        let c = Criterion::In {
            attribute: "total".into(),
            values: vec![Value::Int(3), Value::Int(10)],
        };
        assert_eq!(c.evaluate(&lookup), Some(true));
    }

    #[test]
    fn test_store_config_defaults_manager_key() {
        let store = StoreConfig::new("main");
        assert_eq!(store.manager_key, "main");
        let store = StoreConfig::new("audit").with_manager_key("main");
        assert_eq!(store.manager_key, "main");
    }
}
