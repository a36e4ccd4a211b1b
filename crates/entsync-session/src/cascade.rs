//! Cascade resolution.
//!
//! Saving or removing an entity can drag related entities along, as directed
//! by each attribute's [`CascadePolicy`](entsync_core::CascadePolicy). The
//! resolver walks the object graph depth-first and returns the entities the
//! caller did not name itself.
//!
//! PERSIST/MERGE cascades only follow attributes that are already loaded; an
//! unloaded relation cannot hold unsaved changes. REMOVE cascades load what
//! they need through an [`AttributeLoader`]. Embedded values are always
//! walked, since their relations belong to the owner.

use entsync_core::{AttrValue, AttributeKind, EntityRef, IdentitySet, InstanceId, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Loads an unloaded attribute so a REMOVE cascade can follow it.
pub trait AttributeLoader {
    fn load(&mut self, entity: &EntityRef, attribute: &str) -> Result<()>;
}

impl<F> AttributeLoader for F
where
    F: FnMut(&EntityRef, &str) -> Result<()>,
{
    fn load(&mut self, entity: &EntityRef, attribute: &str) -> Result<()> {
        self(entity, attribute)
    }
}

/// Entities affected through cascades, disjoint from the inputs.
#[derive(Debug, Default)]
pub struct CascadeClosure {
    pub save: IdentitySet,
    pub remove: IdentitySet,
}

impl CascadeClosure {
    pub fn is_empty(&self) -> bool {
        self.save.is_empty() && self.remove.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Walk {
    Save,
    Remove,
}

/// Computes cascade closures.
#[derive(Debug, Default, Clone, Copy)]
pub struct CascadeResolver;

impl CascadeResolver {
    pub fn new() -> Self {
        Self
    }

    /// Entities reached from `to_save` through PERSIST/MERGE cascades and from
    /// `to_remove` through REMOVE cascades.
    #[tracing::instrument(level = "debug", skip_all, fields(save = to_save.len(), remove = to_remove.len()))]
    pub fn resolve(
        &self,
        to_save: &[EntityRef],
        to_remove: &[EntityRef],
        loader: &mut dyn AttributeLoader,
    ) -> Result<CascadeClosure> {
        let inputs: HashSet<InstanceId> = to_save.iter().chain(to_remove).map(|e| e.id()).collect();
        let mut closure = CascadeClosure::default();
        let mut save = IdentitySet::new();
        walk(Walk::Save, to_save, &inputs, &mut save, loader)?;
        let mut remove = IdentitySet::new();
        walk(Walk::Remove, to_remove, &inputs, &mut remove, loader)?;
        closure.save = save;
        closure.remove = remove;
        tracing::debug!(
            save = closure.save.len(),
            remove = closure.remove.len(),
            "Resolved cascades"
        );
        Ok(closure)
    }
}

fn walk(
    mode: Walk,
    roots: &[EntityRef],
    inputs: &HashSet<InstanceId>,
    result: &mut IdentitySet,
    loader: &mut dyn AttributeLoader,
) -> Result<()> {
    let mut visited_embedded: HashSet<InstanceId> = HashSet::new();
    let mut stack: Vec<EntityRef> = roots.iter().rev().cloned().collect();
    while let Some(entity) = stack.pop() {
        let mut next = Vec::new();
        for attr in &entity.descriptor().attributes {
            let follow = match &attr.kind {
                AttributeKind::Scalar => continue,
                AttributeKind::Embedded { .. } => {
                    if let Some(embedded) = entity.embedded(&attr.name) {
                        if visited_embedded.insert(embedded.id()) {
                            next.push(embedded);
                        }
                    }
                    continue;
                }
                AttributeKind::Reference { .. } | AttributeKind::Collection { .. } => match mode {
                    Walk::Save => attr.cascade.cascades_save(),
                    Walk::Remove => attr.cascade.remove,
                },
            };
            if !follow {
                continue;
            }
            if !entity.is_loaded(&attr.name) {
                if mode == Walk::Save {
                    tracing::trace!(
                        entity = entity.entity_name(),
                        attribute = %attr.name,
                        "Skipping unloaded attribute"
                    );
                    continue;
                }
                loader.load(&entity, &attr.name)?;
            }
            let targets = entity
                .attr_value(&attr.name)
                .map(|v| match v {
                    AttrValue::Reference(_) | AttrValue::Collection(_) => v.entities(),
                    _ => Vec::new(),
                })
                .unwrap_or_default();
            for target in targets {
                if inputs.contains(&target.id()) || result.contains(target.id()) {
                    continue;
                }
                result.insert(Arc::clone(&target));
                next.push(target);
            }
        }
        // Depth-first: the first child is explored next.
        stack.extend(next.into_iter().rev());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use entsync_core::{
        AttributeDescriptor, CascadePolicy, Entity, EntityDescriptor, Error, LazyRef,
        MetadataRegistry,
    };
    use proptest::prelude::*;

    fn registry() -> MetadataRegistry {
        let mut reg = MetadataRegistry::new();
        reg.register(EntityDescriptor::new("Customer"));
        reg.register(
            EntityDescriptor::embeddable("Address")
                .attribute(AttributeDescriptor::reference("region", "Region").cascade(CascadePolicy::SAVE)),
        );
        reg.register(EntityDescriptor::new("Region"));
        reg.register(EntityDescriptor::new("Note"));
        reg.register(
            EntityDescriptor::new("Line")
                .attribute(AttributeDescriptor::list("notes", "Note").cascade(CascadePolicy::ALL)),
        );
        reg.register(
            EntityDescriptor::new("Order")
                .attribute(AttributeDescriptor::reference("customer", "Customer"))
                .attribute(AttributeDescriptor::list("lines", "Line").cascade(CascadePolicy::ALL))
                .attribute(AttributeDescriptor::embedded("shipping", "Address")),
        );
        reg
    }

    fn no_loads() -> impl FnMut(&EntityRef, &str) -> Result<()> {
        |_: &EntityRef, attr: &str| Err(Error::Custom(format!("unexpected load of {attr}")))
    }

    #[test]
    fn test_save_follows_loaded_cascade() {
        let reg = registry();
        let order = Entity::new(reg.get("Order").unwrap());
        let line = Entity::new(reg.get("Line").unwrap());
        let note = Entity::new(reg.get("Note").unwrap());
        let customer = Entity::new(reg.get("Customer").unwrap());
        line.set_collection("notes", vec![Arc::clone(&note)]).unwrap();
        order.set_collection("lines", vec![Arc::clone(&line)]).unwrap();
        order.set_reference("customer", Some(Arc::clone(&customer))).unwrap();

        let closure = CascadeResolver::new()
            .resolve(&[Arc::clone(&order)], &[], &mut no_loads())
            .unwrap();
        let ids: Vec<_> = closure.save.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![line.id(), note.id()]);
        assert!(!closure.save.contains(customer.id()));
        assert!(closure.remove.is_empty());
    }

    #[test]
    fn test_save_skips_unloaded_cascade() {
        let reg = registry();
        let order = Entity::loaded(reg.get("Order").unwrap(), Vec::new());
        order.hydrate("lines", AttrValue::Lazy(LazyRef::ToMany));
        let closure = CascadeResolver::new()
            .resolve(&[order], &[], &mut no_loads())
            .unwrap();
        assert!(closure.is_empty());
    }

    #[test]
    fn test_remove_loads_lazy_attributes() {
        let reg = registry();
        let order = Entity::loaded(reg.get("Order").unwrap(), Vec::new());
        order.hydrate("lines", AttrValue::Lazy(LazyRef::ToMany));
        let line = Entity::new(reg.get("Line").unwrap());
        let line_for_loader = Arc::clone(&line);
        let mut loads = Vec::new();
        let mut loader = |e: &EntityRef, attr: &str| -> Result<()> {
            loads.push(attr.to_string());
            if attr == "lines" {
                e.hydrate(attr, AttrValue::Collection(vec![Arc::clone(&line_for_loader)]));
            } else {
                e.hydrate(attr, AttrValue::Collection(Vec::new()));
            }
            Ok(())
        };
        line.hydrate("notes", AttrValue::Lazy(LazyRef::ToMany));
        let closure = CascadeResolver::new()
            .resolve(&[], &[Arc::clone(&order)], &mut loader)
            .unwrap();
        assert_eq!(loads, vec!["lines".to_string(), "notes".to_string()]);
        assert!(closure.remove.contains(line.id()));
        assert_eq!(closure.remove.len(), 1);
    }

    #[test]
    fn test_embedded_relations_are_walked_but_not_added() {
        let reg = registry();
        let order = Entity::new(reg.get("Order").unwrap());
        let address = Entity::new(reg.get("Address").unwrap());
        let region = Entity::new(reg.get("Region").unwrap());
        address.set_reference("region", Some(Arc::clone(&region))).unwrap();
        order.set_embedded("shipping", Some(Arc::clone(&address))).unwrap();

        let closure = CascadeResolver::new()
            .resolve(&[order], &[], &mut no_loads())
            .unwrap();
        assert!(closure.save.contains(region.id()));
        assert!(!closure.save.contains(address.id()));
    }

    #[test]
    fn test_inputs_are_not_in_closure() {
        let reg = registry();
        let order = Entity::new(reg.get("Order").unwrap());
        let line = Entity::new(reg.get("Line").unwrap());
        order.set_collection("lines", vec![Arc::clone(&line)]).unwrap();
        let closure = CascadeResolver::new()
            .resolve(&[Arc::clone(&order), Arc::clone(&line)], &[], &mut no_loads())
            .unwrap();
        assert!(closure.is_empty());
    }

    #[test]
    fn test_cycles_terminate() {
        let mut reg = MetadataRegistry::new();
        let node = reg.register(
            EntityDescriptor::new("Node")
                .attribute(AttributeDescriptor::reference("next", "Node").cascade(CascadePolicy::ALL)),
        );
        let a = Entity::new(Arc::clone(&node));
        let b = Entity::new(node);
        a.set_reference("next", Some(Arc::clone(&b))).unwrap();
        b.set_reference("next", Some(Arc::clone(&a))).unwrap();
        let closure = CascadeResolver::new()
            .resolve(&[Arc::clone(&a)], &[], &mut no_loads())
            .unwrap();
        assert_eq!(closure.save.len(), 1);
        assert!(closure.save.contains(b.id()));
    }

    // ========================================================================
    // Properties over random graphs
    // ========================================================================

    fn graph_registry() -> MetadataRegistry {
        let mut reg = MetadataRegistry::new();
        reg.register(
            EntityDescriptor::new("Node")
                .attribute(AttributeDescriptor::list("children", "Node").cascade(CascadePolicy::ALL))
                .attribute(AttributeDescriptor::reference("link", "Node").cascade(CascadePolicy::SAVE))
                .attribute(AttributeDescriptor::reference("peer", "Node")),
        );
        reg
    }

    type Graph = (usize, Vec<(usize, usize, u8)>, Vec<usize>, Vec<usize>);

    fn arb_graph() -> impl Strategy<Value = Graph> {
        (2usize..12).prop_flat_map(|n| {
            (
                Just(n),
                prop::collection::vec((0..n, 0..n, 0u8..3), 0..30),
                prop::collection::vec(0..n, 0..4),
                prop::collection::vec(0..n, 0..4),
            )
        })
    }

    fn build(n: usize, edges: &[(usize, usize, u8)]) -> Vec<EntityRef> {
        let reg = graph_registry();
        let desc = reg.get("Node").unwrap();
        let nodes: Vec<EntityRef> = (0..n).map(|_| Entity::new(Arc::clone(&desc))).collect();
        for &(from, to, kind) in edges {
            let target = Arc::clone(&nodes[to]);
            match kind {
                0 => nodes[from].add_to_collection("children", target).unwrap(),
                1 => nodes[from].set_reference("link", Some(target)).unwrap(),
                _ => nodes[from].set_reference("peer", Some(target)).unwrap(),
            }
        }
        nodes
    }

    /// Reachability over cascading edges that never passes through an input.
    fn reachable(
        nodes: &[EntityRef],
        roots: &[usize],
        blocked: &HashSet<InstanceId>,
        remove: bool,
    ) -> HashSet<InstanceId> {
        let mut seen: HashSet<InstanceId> = HashSet::new();
        let mut queue: Vec<EntityRef> = roots.iter().map(|&i| Arc::clone(&nodes[i])).collect();
        while let Some(e) = queue.pop() {
            let mut targets = e.collection("children");
            if !remove {
                targets.extend(e.reference("link"));
            }
            for t in targets {
                if !blocked.contains(&t.id()) && seen.insert(t.id()) {
                    queue.push(t);
                }
            }
        }
        seen
    }

    proptest! {
        #[test]
        fn closure_excludes_inputs_and_matches_reachability((n, edges, save, remove) in arb_graph()) {
            let nodes = build(n, &edges);
            let to_save: Vec<_> = save.iter().map(|&i| Arc::clone(&nodes[i])).collect();
            let to_remove: Vec<_> = remove.iter().map(|&i| Arc::clone(&nodes[i])).collect();
            let closure = CascadeResolver::new()
                .resolve(&to_save, &to_remove, &mut no_loads())
                .unwrap();

            let inputs: HashSet<InstanceId> =
                to_save.iter().chain(&to_remove).map(|e| e.id()).collect();
            for e in closure.save.iter().chain(closure.remove.iter()) {
                prop_assert!(!inputs.contains(&e.id()));
            }

            let unique: HashSet<_> = closure.save.iter().map(|e| e.id()).collect();
            prop_assert_eq!(unique.len(), closure.save.len());

            prop_assert_eq!(unique, reachable(&nodes, &save, &inputs, false));

            let removed: HashSet<_> = closure.remove.iter().map(|e| e.id()).collect();
            prop_assert_eq!(removed, reachable(&nodes, &remove, &inputs, true));
        }
    }
}
