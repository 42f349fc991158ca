//! Dependency Analyzer (C6): builds the entity reference graph, finds
//! strongly-connected components with Tarjan's algorithm, orders the
//! condensation topologically, and picks a deferred-field set for every
//! non-trivial SCC so that the intra-tier subgraph with those edges
//! removed is acyclic.
//!
//! Determinism: ties in topological order are broken by entity
//! logical name ascending; deferred edges within an SCC are chosen by
//! `(source entity, field name)` ascending. Any valid deferral set breaks
//! a cycle — a minimum feedback-arc-set is NP-hard and not required — so
//! this picks back-edges of a DFS spanning tree visited in that
//! deterministic order.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::schema::model::Schema;

/// One reference edge in the entity graph: `source.field -> target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefEdge {
    pub source: String,
    pub field: String,
    pub target: String,
}

/// A field deferred to the post-tier pass because resolving it at write
/// time would require an as-yet-unmapped id inside the same tier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeferredField {
    pub entity: String,
    pub field: String,
    pub target: String,
}

/// A set of entities that can be written concurrently, plus the reference
/// fields whose resolution is postponed to the deferred pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tier {
    pub entities: Vec<String>,
    pub deferred_fields: Vec<DeferredField>,
}

impl Tier {
    pub fn is_scc(&self) -> bool {
        self.entities.len() > 1
    }

    pub fn deferred_field_names(&self, entity: &str) -> HashSet<&str> {
        self.deferred_fields
            .iter()
            .filter(|d| d.entity == entity)
            .map(|d| d.field.as_str())
            .collect()
    }
}

/// A sequence of tiers in import order.
#[derive(Debug, Clone, Default)]
pub struct DependencyPlan {
    pub tiers: Vec<Tier>,
}

impl DependencyPlan {
    /// The tier index each entity belongs to, for quick "has this entity's
    /// wave completed" lookups during the M:N wave.
    pub fn tier_index(&self) -> HashMap<String, usize> {
        let mut out = HashMap::new();
        for (i, tier) in self.tiers.iter().enumerate() {
            for e in &tier.entities {
                out.insert(e.clone(), i);
            }
        }
        out
    }

    pub fn all_entities(&self) -> Vec<String> {
        self.tiers.iter().flat_map(|t| t.entities.clone()).collect()
    }
}

/// Build the reference edge list for `schema`, restricted to in-scope
/// targets (fields whose `lookupentity` names another entity present in
/// the schema). Self-loops are kept — they drive the "self-references are
/// always deferred" rule.
fn build_edges(schema: &Schema) -> Vec<RefEdge> {
    let names: HashSet<&str> = schema.entity_names().collect();
    let mut edges = Vec::new();
    for entity in &schema.entities {
        for field in entity.reference_fields() {
            let Some(target) = field.lookup_entity.as_deref() else {
                continue;
            };
            if names.contains(target) {
                edges.push(RefEdge {
                    source: entity.name.clone(),
                    field: field.name.clone(),
                    target: target.to_string(),
                });
            }
        }
    }
    edges.sort();
    edges
}

/// Tarjan's algorithm, iterative to avoid recursion-depth limits on large
/// schemas. Returns components in the order Tarjan emits them, which is
/// already reverse-topological with respect to edge direction (a
/// component with an edge to another is emitted after the one it points
/// to) — exactly the dependency order this engine needs before the
/// name-ascending tie-break pass.
fn tarjan_scc<'a>(nodes: &'a [String], adjacency: &HashMap<&'a str, Vec<&'a str>>) -> Vec<Vec<String>> {
    let mut index_of: HashMap<&'a str, usize> = HashMap::new();
    let mut lowlink: HashMap<&'a str, usize> = HashMap::new();
    let mut on_stack: HashSet<&'a str> = HashSet::new();
    let mut stack: Vec<&'a str> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<String>> = Vec::new();
    let empty: Vec<&str> = Vec::new();

    for start in nodes {
        let start = start.as_str();
        if index_of.contains_key(start) {
            continue;
        }

        // Explicit call stack of (node, next-neighbor-to-visit) standing
        // in for the recursive `strongconnect(v)` calls.
        let mut call_stack: Vec<(&'a str, usize)> = vec![(start, 0)];
        index_of.insert(start, next_index);
        lowlink.insert(start, next_index);
        next_index += 1;
        stack.push(start);
        on_stack.insert(start);

        while let Some(&(node, pos)) = call_stack.last() {
            let neighbors = adjacency.get(node).unwrap_or(&empty);

            if pos < neighbors.len() {
                call_stack.last_mut().unwrap().1 += 1;
                let neighbor = neighbors[pos];
                if !index_of.contains_key(neighbor) {
                    index_of.insert(neighbor, next_index);
                    lowlink.insert(neighbor, next_index);
                    next_index += 1;
                    stack.push(neighbor);
                    on_stack.insert(neighbor);
                    call_stack.push((neighbor, 0));
                } else if on_stack.contains(neighbor) {
                    // Back/cross edge onto a node still on the stack: fold
                    // in its *index*, not its lowlink (the Wikipedia/CLRS
                    // rule — using lowlink here would let a component
                    // "see" outside its own stack window).
                    let ni = index_of[neighbor];
                    let cur = lowlink[node];
                    lowlink.insert(node, cur.min(ni));
                }
                continue;
            }

            // All of `node`'s neighbors are processed: pop its frame and,
            // if it was entered via a tree edge, fold its now-final
            // lowlink into the parent that called it.
            call_stack.pop();
            if let Some(&(parent, _)) = call_stack.last() {
                let child_low = lowlink[node];
                let parent_low = lowlink[parent];
                lowlink.insert(parent, parent_low.min(child_low));
            }

            if lowlink[node] == index_of[node] {
                let mut component = Vec::new();
                loop {
                    let popped = stack.pop().unwrap();
                    on_stack.remove(popped);
                    let done = popped == node;
                    component.push(popped.to_string());
                    if done {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }

    components
}

/// Within one SCC's induced subgraph, pick the back-edges of a DFS
/// spanning tree (visited in ascending `(node, field)` order) plus every
/// self-loop.
fn deferred_edges_for_scc(members: &HashSet<&str>, edges: &[RefEdge]) -> Vec<DeferredField> {
    let mut by_source: BTreeMap<&str, Vec<&RefEdge>> = BTreeMap::new();
    for e in edges {
        if members.contains(e.source.as_str()) && members.contains(e.target.as_str()) {
            by_source.entry(e.source.as_str()).or_default().push(e);
        }
    }
    for v in by_source.values_mut() {
        v.sort_by(|a, b| (&a.field).cmp(&b.field));
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut deferred = Vec::new();
    let mut sorted_members: Vec<&str> = members.iter().copied().collect();
    sorted_members.sort();

    fn visit<'a>(
        node: &'a str,
        by_source: &BTreeMap<&'a str, Vec<&'a RefEdge>>,
        visited: &mut HashSet<&'a str>,
        deferred: &mut Vec<DeferredField>,
    ) {
        visited.insert(node);
        let Some(out_edges) = by_source.get(node) else {
            return;
        };
        for edge in out_edges {
            if edge.source == edge.target {
                deferred.push(DeferredField {
                    entity: edge.source.clone(),
                    field: edge.field.clone(),
                    target: edge.target.clone(),
                });
                continue;
            }
            if !visited.contains(edge.target.as_str()) {
                visit(edge.target.as_str(), by_source, visited, deferred);
            } else {
                // Back or cross edge in this DFS tree: deferring it is
                // sufficient to keep the induced subgraph acyclic.
                deferred.push(DeferredField {
                    entity: edge.source.clone(),
                    field: edge.field.clone(),
                    target: edge.target.clone(),
                });
            }
        }
    }

    for node in sorted_members {
        if !visited.contains(node) {
            visit(node, &by_source, &mut visited, &mut deferred);
        }
    }

    deferred.sort();
    deferred.dedup();
    deferred
}

/// Self-loop edges outside any multi-member SCC still need deferring: a
/// singleton component with `entity -> entity` is a cycle of size one.
fn self_loop_deferrals(entity: &str, edges: &[RefEdge]) -> Vec<DeferredField> {
    edges
        .iter()
        .filter(|e| e.source == entity && e.target == entity)
        .map(|e| DeferredField {
            entity: e.source.clone(),
            field: e.field.clone(),
            target: e.target.clone(),
        })
        .collect()
}

/// Build the full dependency plan for `schema`, restricted to `in_scope`
/// entity names (callers exclude entities whose SchemaValidate phase
/// aborted them before planning — see C10 phase 2).
pub fn build_plan(schema: &Schema, in_scope: &HashSet<String>) -> DependencyPlan {
    let scoped_entities: Vec<String> = schema
        .entity_names()
        .filter(|n| in_scope.contains(*n))
        .map(str::to_string)
        .collect();

    let edges: Vec<RefEdge> = build_edges(schema)
        .into_iter()
        .filter(|e| in_scope.contains(&e.source) && in_scope.contains(&e.target))
        .collect();

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for name in &scoped_entities {
        adjacency.entry(name.as_str()).or_default();
    }
    for e in &edges {
        if e.source != e.target {
            adjacency
                .entry(e.source.as_str())
                .or_default()
                .push(e.target.as_str());
        }
    }
    for v in adjacency.values_mut() {
        v.sort();
        v.dedup();
    }

    let components = tarjan_scc(&scoped_entities, &adjacency);

    // Tarjan already yields components in an order consistent with
    // dependency direction, but ties between independent branches are not
    // yet deterministic by name. Rebuild a deterministic topological order
    // over the condensation by repeated selection of the lexicographically
    // smallest ready component (Kahn's algorithm keyed by min member name).
    let comp_id_of: HashMap<&str, usize> = components
        .iter()
        .enumerate()
        .flat_map(|(i, members)| members.iter().map(move |m| (m.as_str(), i)))
        .collect();

    // `remaining[u]` counts u's distinct not-yet-emitted dependencies;
    // `unlocks[v]` lists the dependents waiting on v. A component is ready
    // to emit once every component it references has already been
    // emitted — the opposite direction from a plain indegree count on the
    // reference edges themselves, since "A references B" means "B must be
    // emitted before A", not the other way round.
    let mut remaining = vec![0usize; components.len()];
    let mut unlocks: Vec<HashSet<usize>> = vec![HashSet::new(); components.len()];
    for e in &edges {
        if e.source == e.target {
            continue;
        }
        let dependent = comp_id_of[e.source.as_str()];
        let dependency = comp_id_of[e.target.as_str()];
        if dependent != dependency && unlocks[dependency].insert(dependent) {
            remaining[dependent] += 1;
        }
    }

    let mut sorted_members: Vec<Vec<String>> = components
        .iter()
        .map(|m| {
            let mut v = m.clone();
            v.sort();
            v
        })
        .collect();

    let mut ready: std::collections::BTreeSet<(String, usize)> = (0..components.len())
        .filter(|&i| remaining[i] == 0)
        .map(|i| (sorted_members[i][0].clone(), i))
        .collect();

    let mut order = Vec::with_capacity(components.len());
    let mut emitted = vec![false; components.len()];
    while let Some((_, id)) = ready.iter().next().cloned() {
        ready.remove(&(sorted_members[id][0].clone(), id));
        order.push(id);
        emitted[id] = true;
        for &dependent in &unlocks[id] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert((sorted_members[dependent][0].clone(), dependent));
            }
        }
    }
    // Any components left unreached here would indicate a cycle at the
    // condensation level, which cannot happen (condensations are DAGs by
    // construction) — defensive fallback keeps the plan total regardless.
    for (i, done) in emitted.iter().enumerate() {
        if !*done {
            order.push(i);
        }
    }

    let mut tiers = Vec::with_capacity(order.len());
    for id in order {
        let members = std::mem::take(&mut sorted_members[id]);
        let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();

        let deferred_fields = if members.len() > 1 {
            deferred_edges_for_scc(&member_set, &edges)
        } else {
            self_loop_deferrals(&members[0], &edges)
        };

        tiers.push(Tier {
            entities: members,
            deferred_fields,
        });
    }

    DependencyPlan { tiers }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{EntityDescriptor, FieldDescriptor, FieldType, Schema};

    fn entity(name: &str, refs: &[(&str, &str)]) -> EntityDescriptor {
        let mut fields = vec![FieldDescriptor {
            name: format!("{name}id"),
            field_type: FieldType::Guid,
            lookup_entity: None,
            is_create_valid: true,
            is_update_valid: true,
        }];
        for (field, target) in refs {
            fields.push(FieldDescriptor {
                name: field.to_string(),
                field_type: FieldType::Reference,
                lookup_entity: Some(target.to_string()),
                is_create_valid: true,
                is_update_valid: true,
            });
        }
        EntityDescriptor {
            name: name.to_string(),
            primary_id_field: format!("{name}id"),
            fields,
        }
    }

    fn in_scope(schema: &Schema) -> HashSet<String> {
        schema.entity_names().map(str::to_string).collect()
    }

    #[test]
    fn two_entity_chain_orders_dependency_first() {
        let schema = Schema {
            entities: vec![
                entity("account", &[("primarycontactid", "contact")]),
                entity("contact", &[]),
            ],
            relationships: vec![],
        };
        let plan = build_plan(&schema, &in_scope(&schema));
        assert_eq!(plan.tiers.len(), 2);
        assert_eq!(plan.tiers[0].entities, vec!["contact".to_string()]);
        assert_eq!(plan.tiers[1].entities, vec!["account".to_string()]);
        assert!(plan.tiers[0].deferred_fields.is_empty());
        assert!(plan.tiers[1].deferred_fields.is_empty());
    }

    #[test]
    fn self_reference_is_deferred_in_a_singleton_tier() {
        let schema = Schema {
            entities: vec![entity("account", &[("parentaccountid", "account")])],
            relationships: vec![],
        };
        let plan = build_plan(&schema, &in_scope(&schema));
        assert_eq!(plan.tiers.len(), 1);
        assert_eq!(plan.tiers[0].entities, vec!["account".to_string()]);
        assert_eq!(plan.tiers[0].deferred_fields.len(), 1);
        assert_eq!(plan.tiers[0].deferred_fields[0].field, "parentaccountid");
    }

    #[test]
    fn two_node_cycle_lands_in_one_tier_with_a_deferred_edge() {
        let schema = Schema {
            entities: vec![
                entity("quote", &[("orderid", "order")]),
                entity("order", &[("quoteid", "quote")]),
            ],
            relationships: vec![],
        };
        let plan = build_plan(&schema, &in_scope(&schema));
        assert_eq!(plan.tiers.len(), 1);
        let tier = &plan.tiers[0];
        assert!(tier.is_scc());
        let mut names = tier.entities.clone();
        names.sort();
        assert_eq!(names, vec!["order".to_string(), "quote".to_string()]);
        assert_eq!(tier.deferred_fields.len(), 1);

        // Acyclicity invariant: the induced subgraph with deferred
        // edges removed must be acyclic.
        let deferred: HashSet<&str> = tier
            .deferred_fields
            .iter()
            .map(|d| d.field.as_str())
            .collect();
        let remaining_edges = if deferred.contains("orderid") { 0 } else { 1 }
            + if deferred.contains("quoteid") { 0 } else { 1 };
        assert_eq!(remaining_edges, 1);
    }

    #[test]
    fn ties_in_topological_order_break_by_entity_name() {
        // Two independent chains with no edges between them: `alpha` and
        // `beta` are both ready immediately, so `alpha` (ascending) wins.
        let schema = Schema {
            entities: vec![entity("beta", &[]), entity("alpha", &[])],
            relationships: vec![],
        };
        let plan = build_plan(&schema, &in_scope(&schema));
        let order: Vec<&str> = plan
            .tiers
            .iter()
            .map(|t| t.entities[0].as_str())
            .collect();
        assert_eq!(order, vec!["alpha", "beta"]);
    }

    #[test]
    fn three_node_cycle_defers_exactly_enough_edges_to_be_acyclic() {
        let schema = Schema {
            entities: vec![
                entity("a", &[("b_ref", "b")]),
                entity("b", &[("c_ref", "c")]),
                entity("c", &[("a_ref", "a")]),
            ],
            relationships: vec![],
        };
        let plan = build_plan(&schema, &in_scope(&schema));
        assert_eq!(plan.tiers.len(), 1);
        let tier = &plan.tiers[0];
        assert_eq!(tier.entities.len(), 3);
        // A 3-cycle needs exactly one edge removed to become acyclic.
        assert_eq!(tier.deferred_fields.len(), 1);
    }
}
