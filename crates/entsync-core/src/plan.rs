//! Fetch plans: which attributes of an entity graph must be loaded.
//!
//! A plan is a tree of attribute paths rooted at one entity type, e.g.
//! `Order{customer{address}, lines}`. Several plans for the same root can be
//! merged into one multi-branch plan.

use std::fmt;

/// One attribute of a plan together with the attributes to load beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub attribute: String,
    pub nested: Vec<PlanNode>,
}

impl PlanNode {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            nested: Vec::new(),
        }
    }

    #[must_use]
    pub fn nest(mut self, node: PlanNode) -> Self {
        merge_into(&mut self.nested, node);
        self
    }

    pub fn child(&self, attribute: &str) -> Option<&PlanNode> {
        self.nested.iter().find(|n| n.attribute == attribute)
    }

    fn build(parts: &[&str]) -> Option<Self> {
        let (first, rest) = parts.split_first()?;
        let mut node = PlanNode::new(*first);
        if let Some(child) = Self::build(rest) {
            node.nested.push(child);
        }
        Some(node)
    }

    fn sort(&mut self) {
        self.nested.sort_by(|a, b| a.attribute.cmp(&b.attribute));
        for n in &mut self.nested {
            n.sort();
        }
    }

    fn write_canonical(&self, out: &mut String) {
        out.push_str(&self.attribute);
        if !self.nested.is_empty() {
            out.push('{');
            for (i, n) in self.nested.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                n.write_canonical(out);
            }
            out.push('}');
        }
    }
}

fn merge_into(nodes: &mut Vec<PlanNode>, node: PlanNode) {
    if let Some(existing) = nodes.iter_mut().find(|n| n.attribute == node.attribute) {
        for child in node.nested {
            merge_into(&mut existing.nested, child);
        }
    } else {
        nodes.push(node);
    }
}

/// Declarative load plan for one root entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    entity: String,
    nodes: Vec<PlanNode>,
    normalized: bool,
}

impl FetchPlan {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            nodes: Vec::new(),
            normalized: false,
        }
    }

    /// Add a single top-level attribute.
    #[must_use]
    pub fn add(self, attribute: impl Into<String>) -> Self {
        self.node(PlanNode::new(attribute))
    }

    /// Add a dotted path such as `"customer.address"`.
    ///
    /// Empty segments are ignored; an empty path adds nothing.
    #[must_use]
    pub fn add_path(self, path: &str) -> Self {
        let parts: Vec<&str> = path
            .trim()
            .split('.')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        match PlanNode::build(&parts) {
            Some(node) => self.node(node),
            None => self,
        }
    }

    #[must_use]
    pub fn node(mut self, node: PlanNode) -> Self {
        merge_into(&mut self.nodes, node);
        self.normalized = false;
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    /// Top-level node for an attribute.
    pub fn get(&self, attribute: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.attribute == attribute)
    }

    /// Sub-plan for a related entity reached through `attribute`.
    pub fn sub_plan(&self, attribute: &str, target: &str) -> Option<FetchPlan> {
        let node = self.get(attribute)?;
        Some(FetchPlan {
            entity: target.to_string(),
            nodes: node.nested.clone(),
            normalized: self.normalized,
        })
    }

    /// Does the plan include the dotted `path`?
    pub fn contains(&self, path: &str) -> bool {
        let mut nodes = &self.nodes;
        let mut found = false;
        for part in path.split('.').filter(|p| !p.is_empty()) {
            match nodes.iter().find(|n| n.attribute == part) {
                Some(node) => {
                    nodes = &node.nested;
                    found = true;
                }
                None => return false,
            }
        }
        found
    }

    /// Union of two plans. Plans for different roots keep `self`'s root.
    #[must_use]
    pub fn merge(&self, other: &FetchPlan) -> FetchPlan {
        let mut merged = self.clone();
        for node in &other.nodes {
            merge_into(&mut merged.nodes, node.clone());
        }
        merged.normalized = false;
        merged
    }

    /// Merge a sequence of plans for the same root.
    pub fn merge_all<'a>(plans: impl IntoIterator<Item = &'a FetchPlan>) -> Option<FetchPlan> {
        let mut iter = plans.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, p| acc.merge(p)))
    }

    /// Bring the plan into canonical form: branches sorted by attribute name.
    pub fn normalize(&mut self) {
        if self.normalized {
            return;
        }
        self.nodes.sort_by(|a, b| a.attribute.cmp(&b.attribute));
        for n in &mut self.nodes {
            n.sort();
        }
        self.normalized = true;
    }

    /// Canonical rendering; equal plans always produce equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let mut canonical = self.clone();
        canonical.normalize();
        let mut out = canonical.entity.clone();
        out.push('{');
        for (i, n) in canonical.nodes.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            n.write_canonical(&mut out);
        }
        out.push('}');
        out
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_path_nested() {
        let plan = FetchPlan::new("Order").add_path("customer.address");
        assert!(plan.contains("customer"));
        assert!(plan.contains("customer.address"));
        assert!(!plan.contains("lines"));
        assert!(!plan.contains(""));
    }

    #[test]
    fn test_add_path_ignores_empty_segments() {
        let plan = FetchPlan::new("Order").add_path(" customer..address ").add_path(".");
        assert_eq!(plan.nodes().len(), 1);
        assert!(plan.contains("customer.address"));
    }

    #[test]
    fn test_merge_branches() {
        let a = FetchPlan::new("Order").add_path("customer.address");
        let b = FetchPlan::new("Order").add_path("customer.contacts").add("lines");
        let merged = a.merge(&b);
        assert_eq!(merged.nodes().len(), 2);
        let customer = merged.get("customer").unwrap();
        assert_eq!(customer.nested.len(), 2);
        assert!(merged.contains("customer.contacts"));
        assert!(merged.contains("lines"));
    }

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = FetchPlan::new("Order").add("lines").add_path("customer.address");
        let b = FetchPlan::new("Order").add_path("customer.address").add("lines");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), "Order{customer{address},lines}");
    }

    #[test]
    fn test_normalize_marks_plan() {
        let mut plan = FetchPlan::new("Order").add("lines").add("customer");
        assert!(!plan.is_normalized());
        plan.normalize();
        assert!(plan.is_normalized());
        assert_eq!(plan.nodes()[0].attribute, "customer");
        let plan = plan.add("notes");
        assert!(!plan.is_normalized());
    }

    #[test]
    fn test_sub_plan() {
        let plan = FetchPlan::new("Order").add_path("customer.address");
        let sub = plan.sub_plan("customer", "Customer").unwrap();
        assert_eq!(sub.entity(), "Customer");
        assert!(sub.contains("address"));
        assert!(plan.sub_plan("lines", "Line").is_none());
    }

    #[test]
    fn test_merge_all() {
        let plans = vec![
            FetchPlan::new("Order").add("a"),
            FetchPlan::new("Order").add("b"),
        ];
        let merged = FetchPlan::merge_all(&plans).unwrap();
        assert!(merged.contains("a") && merged.contains("b"));
        assert!(FetchPlan::merge_all(std::iter::empty()).is_none());
    }
}
