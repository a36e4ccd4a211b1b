//! Logical description of a load.
//!
//! A [`LoadSpec`] names what to load (instances of an entity, or values of
//! some of its attributes), how to select it (identifiers, a condition or an
//! explicit query) and how the result is shaped (sort, page, fetch plans).
//! [`LoadSpec::build`] renders the parameterized query text handed to the
//! session.

use entsync_core::{FetchPlan, Value};
use entsync_session::{Criterion, LockMode, SortOrder, UpdateAction};

/// Identifiers a load is restricted to.
#[derive(Debug, Clone, PartialEq)]
pub enum IdSelection {
    /// One instance, by its primary key values.
    Single(Vec<Value>),
    /// Several instances, each by its primary key values.
    Batch(Vec<Vec<Value>>),
}

impl IdSelection {
    pub fn into_keys(self) -> Vec<Vec<Value>> {
        match self {
            IdSelection::Single(id) => vec![id],
            IdSelection::Batch(ids) => ids,
        }
    }
}

/// A query written by hand instead of derived from a condition.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryText {
    pub text: String,
    pub parameters: Vec<(String, Value)>,
    /// Passed to the session untouched: no transformers, no constraints, no cache.
    pub native: bool,
}

/// Hints that change how a load executes but not what it means.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryHints {
    pub cacheable: bool,
    /// Overrides the configured soft-deletion mode when set.
    pub soft_deletion: Option<bool>,
    pub lock_mode: Option<LockMode>,
}

/// What to load and how.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSpec {
    pub entity: String,
    pub ids: Option<IdSelection>,
    pub query: Option<QueryText>,
    /// Structured condition. Alongside explicit query text it should mirror
    /// the text's `where` clause; sessions that cannot parse text evaluate it
    /// instead.
    pub condition: Option<Criterion>,
    pub sort: Vec<SortOrder>,
    pub first: usize,
    pub max: Option<usize>,
    /// Merged before execution.
    pub plans: Vec<FetchPlan>,
    /// Attributes returned by value loads.
    pub properties: Vec<String>,
    pub update: Option<UpdateAction>,
    pub hints: QueryHints,
}

impl LoadSpec {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            ids: None,
            query: None,
            condition: None,
            sort: Vec::new(),
            first: 0,
            max: None,
            plans: Vec::new(),
            properties: Vec::new(),
            update: None,
            hints: QueryHints::default(),
        }
    }

    /// Load one instance by a single-column key.
    #[must_use]
    pub fn id(mut self, id: impl Into<Value>) -> Self {
        self.ids = Some(IdSelection::Single(vec![id.into()]));
        self
    }

    /// Load one instance by a (possibly composite) key.
    #[must_use]
    pub fn key(mut self, key: Vec<Value>) -> Self {
        self.ids = Some(IdSelection::Single(key));
        self
    }

    /// Load several instances by single-column keys.
    #[must_use]
    pub fn ids<I, V>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.ids = Some(IdSelection::Batch(
            ids.into_iter().map(|id| vec![id.into()]).collect(),
        ));
        self
    }

    #[must_use]
    pub fn keys(mut self, keys: Vec<Vec<Value>>) -> Self {
        self.ids = Some(IdSelection::Batch(keys));
        self
    }

    #[must_use]
    pub fn query(mut self, text: impl Into<String>) -> Self {
        self.query = Some(QueryText {
            text: text.into(),
            parameters: Vec::new(),
            native: false,
        });
        self
    }

    #[must_use]
    pub fn native_query(mut self, text: impl Into<String>) -> Self {
        self.query = Some(QueryText {
            text: text.into(),
            parameters: Vec::new(),
            native: true,
        });
        self
    }

    /// Bind a parameter of the query text.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Some(query) = &mut self.query {
            query.parameters.push((name.into(), value.into()));
        }
        self
    }

    /// Add a condition, conjoined with any existing one.
    #[must_use]
    pub fn condition(mut self, condition: Criterion) -> Self {
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    #[must_use]
    pub fn sort(mut self, order: SortOrder) -> Self {
        self.sort.push(order);
        self
    }

    #[must_use]
    pub fn page(mut self, first: usize, max: usize) -> Self {
        self.first = first;
        self.max = Some(max);
        self
    }

    #[must_use]
    pub fn plan(mut self, plan: FetchPlan) -> Self {
        self.plans.push(plan);
        self
    }

    #[must_use]
    pub fn properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn set(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        let assignment = (attribute.into(), value.into());
        match &mut self.update {
            Some(UpdateAction::Set(assignments)) => assignments.push(assignment),
            _ => self.update = Some(UpdateAction::Set(vec![assignment])),
        }
        self
    }

    #[must_use]
    pub fn delete(mut self) -> Self {
        self.update = Some(UpdateAction::Delete);
        self
    }

    #[must_use]
    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.hints.cacheable = cacheable;
        self
    }

    #[must_use]
    pub fn soft_deletion(mut self, enabled: bool) -> Self {
        self.hints.soft_deletion = Some(enabled);
        self
    }

    #[must_use]
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.hints.lock_mode = Some(mode);
        self
    }

    pub fn is_native(&self) -> bool {
        self.query.as_ref().is_some_and(|q| q.native)
    }

    /// All plans merged into one, or `None` when the spec has none.
    pub fn merged_plan(&self) -> Option<FetchPlan> {
        let mut plan = FetchPlan::merge_all(&self.plans)?;
        plan.normalize();
        Some(plan)
    }

    /// Render the query text for `filter`, which already includes the spec's
    /// condition and anything added by soft deletion or access constraints.
    ///
    /// Parameters are named `p1`, `p2`, ... in rendering order.
    pub fn build(&self, filter: Option<&Criterion>) -> RenderedQuery {
        let mut text = String::new();
        let mut parameters = Vec::new();

        // SELECT
        text.push_str("select ");
        if self.properties.is_empty() {
            text.push('e');
        } else {
            let columns: Vec<String> = self.properties.iter().map(|p| format!("e.{p}")).collect();
            text.push_str(&columns.join(", "));
        }

        // FROM
        text.push_str(" from ");
        text.push_str(&self.entity);
        text.push_str(" e");

        // WHERE
        if let Some(filter) = filter {
            text.push_str(" where ");
            text.push_str(&render_criterion(filter, &mut parameters));
        }

        // ORDER BY
        if !self.sort.is_empty() {
            let orders: Vec<String> = self
                .sort
                .iter()
                .map(|o| {
                    if o.descending {
                        format!("e.{} desc", o.attribute)
                    } else {
                        format!("e.{}", o.attribute)
                    }
                })
                .collect();
            text.push_str(" order by ");
            text.push_str(&orders.join(", "));
        }

        RenderedQuery { text, parameters }
    }
}

/// Query text plus its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub text: String,
    pub parameters: Vec<(String, Value)>,
}

fn bind(parameters: &mut Vec<(String, Value)>, value: Value) -> String {
    let mut index = parameters.len() + 1;
    let mut name = format!("p{index}");
    while parameters.iter().any(|(n, _)| *n == name) {
        index += 1;
        name = format!("p{index}");
    }
    let placeholder = format!(":{name}");
    parameters.push((name, value));
    placeholder
}

/// Add `condition` to the `where` clause of `text`, creating one if needed.
///
/// An existing clause is parenthesized so the added condition restricts all
/// of it.
pub fn append_condition(text: &str, condition: &str) -> String {
    let lower = text.to_ascii_lowercase();
    let split = lower.find(" order by ").unwrap_or(text.len());
    let (head, tail) = text.split_at(split);
    match lower[..split].find(" where ") {
        Some(w) => format!(
            "{} where ({}) and ({condition}){tail}",
            &head[..w],
            head[w + " where ".len()..].trim()
        ),
        None => format!("{head} where {condition}{tail}"),
    }
}

/// Render a criterion as query text, binding literal values as parameters.
pub fn render_criterion(criterion: &Criterion, parameters: &mut Vec<(String, Value)>) -> String {
    match criterion {
        Criterion::Compare {
            attribute,
            op,
            value,
        } => {
            let placeholder = bind(parameters, value.clone());
            format!("e.{attribute} {} {placeholder}", op.symbol())
        }
        Criterion::In { attribute, values } => {
            let placeholder = bind(parameters, Value::Array(values.clone()));
            format!("e.{attribute} in {placeholder}")
        }
        Criterion::IsNull(attribute) => format!("e.{attribute} is null"),
        Criterion::NotNull(attribute) => format!("e.{attribute} is not null"),
        Criterion::Like { attribute, pattern } => {
            let placeholder = bind(parameters, Value::Text(pattern.clone()));
            format!("e.{attribute} like {placeholder}")
        }
        Criterion::And(items) => join(items, " and ", parameters),
        Criterion::Or(items) => join(items, " or ", parameters),
        Criterion::Not(inner) => format!("not ({})", render_criterion(inner, parameters)),
        Criterion::Raw(text) => format!("({text})"),
    }
}

fn join(items: &[Criterion], separator: &str, parameters: &mut Vec<(String, Value)>) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|c| match c {
            Criterion::And(_) | Criterion::Or(_) => {
                format!("({})", render_criterion(c, parameters))
            }
            _ => render_criterion(c, parameters),
        })
        .collect();
    parts.join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use entsync_session::CompareOp;

    #[test]
    fn test_build_simple() {
        let spec = LoadSpec::new("Customer");
        let q = spec.build(None);
        assert_eq!(q.text, "select e from Customer e");
        assert!(q.parameters.is_empty());
    }

    #[test]
    fn test_build_with_condition_and_sort() {
        let spec = LoadSpec::new("Customer")
            .condition(Criterion::eq("name", "Ada"))
            .condition(Criterion::IsNull("deleted_at".into()))
            .sort(SortOrder::desc("name"));
        let q = spec.build(spec.condition.as_ref());
        assert_eq!(
            q.text,
            "select e from Customer e where e.name = :p1 and e.deleted_at is null order by e.name desc"
        );
        assert_eq!(q.parameters, vec![("p1".to_string(), Value::from("Ada"))]);
    }

    #[test]
    fn test_build_nested_boolean_parenthesized() {
        let filter = Criterion::Compare {
            attribute: "total".into(),
            op: CompareOp::Gt,
            value: Value::BigInt(5),
        }
        .and(Criterion::Or(vec![
            Criterion::eq("status", "open"),
            Criterion::Not(Box::new(Criterion::Like {
                attribute: "note".into(),
                pattern: "x%".into(),
            })),
        ]));
        let q = LoadSpec::new("Order").build(Some(&filter));
        assert_eq!(
            q.text,
            "select e from Order e where e.total > :p1 and (e.status = :p2 or not (e.note like :p3))"
        );
        assert_eq!(q.parameters.len(), 3);
    }

    #[test]
    fn test_append_condition() {
        assert_eq!(
            append_condition("select e from Note e", "e.deleted_at is null"),
            "select e from Note e where e.deleted_at is null"
        );
        assert_eq!(
            append_condition(
                "select e from Note e where e.a = 1 or e.b = 2 order by e.a",
                "e.deleted_at is null"
            ),
            "select e from Note e where (e.a = 1 or e.b = 2) and (e.deleted_at is null) order by e.a"
        );
    }

    #[test]
    fn test_bound_names_avoid_existing_parameters() {
        let mut params = vec![("p1".to_string(), Value::BigInt(1))];
        let rendered = render_criterion(&Criterion::eq("a", 2_i64), &mut params);
        assert_eq!(rendered, "e.a = :p2");
        params.insert(0, ("p3".to_string(), Value::Null));
        let rendered = render_criterion(&Criterion::eq("b", 3_i64), &mut params);
        assert_eq!(rendered, "e.b = :p4");
    }

    #[test]
    fn test_build_projection() {
        let spec = LoadSpec::new("Order").properties(["total", "customer"]);
        assert_eq!(spec.build(None).text, "select e.total, e.customer from Order e");
    }

    #[test]
    fn test_id_builders() {
        let spec = LoadSpec::new("Customer").ids([1_i64, 2, 3]);
        assert_eq!(
            spec.ids.map(IdSelection::into_keys),
            Some(vec![
                vec![Value::BigInt(1)],
                vec![Value::BigInt(2)],
                vec![Value::BigInt(3)]
            ])
        );
    }

    #[test]
    fn test_merged_plan_is_normalized() {
        let spec = LoadSpec::new("Customer")
            .plan(FetchPlan::new("Customer").add("orders"))
            .plan(FetchPlan::new("Customer").add("address"));
        let plan = spec.merged_plan().unwrap();
        assert!(plan.is_normalized());
        assert_eq!(plan.nodes().len(), 2);
        assert_eq!(plan.nodes()[0].attribute, "address");
        assert!(LoadSpec::new("Customer").merged_plan().is_none());
    }

    #[test]
    fn test_update_builders() {
        let spec = LoadSpec::new("Order").set("total", 1_i64).set("status", "x");
        assert!(matches!(spec.update, Some(UpdateAction::Set(ref a)) if a.len() == 2));
        assert_eq!(LoadSpec::new("Order").delete().update, Some(UpdateAction::Delete));
    }
}
