//! Static dependency graph over component kinds.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::types::ComponentKind;

/// Mapping from component kind to its ordered prerequisites. Always acyclic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<ComponentKind, Vec<ComponentKind>>,
    order: Vec<ComponentKind>,
}

impl DependencyGraph {
    /// Build and validate a graph.
    ///
    /// Fails with [`Error::Config`] when a prerequisite is not itself a node
    /// or when the edges contain a cycle.
    pub fn new<I>(edges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (ComponentKind, Vec<ComponentKind>)>,
    {
        let edges: BTreeMap<ComponentKind, Vec<ComponentKind>> = edges.into_iter().collect();
        for (kind, prereqs) in &edges {
            for p in prereqs {
                if !edges.contains_key(p) {
                    return Err(Error::config(format!(
                        "{kind} depends on unknown component kind {p}"
                    )));
                }
                if p == kind {
                    return Err(Error::config(format!("{kind} depends on itself")));
                }
            }
        }
        let order = topo_sort(&edges)?;
        Ok(Self { edges, order })
    }

    /// Kinds in dependency order: every kind appears after all its prerequisites.
    /// Ties are broken by name so the order is deterministic.
    pub fn topo_order(&self) -> &[ComponentKind] {
        &self.order
    }

    /// Teardown order: dependents before their prerequisites.
    pub fn reverse_order(&self) -> impl Iterator<Item = &ComponentKind> {
        self.order.iter().rev()
    }

    pub fn prerequisites(&self, kind: &ComponentKind) -> &[ComponentKind] {
        self.edges.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kinds that list `kind` as a direct prerequisite.
    pub fn dependents(&self, kind: &ComponentKind) -> Vec<ComponentKind> {
        self.edges
            .iter()
            .filter(|(_, prereqs)| prereqs.contains(kind))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn transitive_prerequisites(&self, kind: &ComponentKind) -> BTreeSet<ComponentKind> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ComponentKind> = self.prerequisites(kind).iter().collect();
        while let Some(k) = stack.pop() {
            if seen.insert(k.clone()) {
                stack.extend(self.prerequisites(k));
            }
        }
        seen
    }

    pub fn contains(&self, kind: &ComponentKind) -> bool {
        self.edges.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &ComponentKind> {
        self.edges.keys()
    }
}

fn topo_sort(edges: &BTreeMap<ComponentKind, Vec<ComponentKind>>) -> Result<Vec<ComponentKind>> {
    let mut indegree: BTreeMap<&ComponentKind, usize> = edges
        .iter()
        .map(|(k, prereqs)| (k, prereqs.iter().collect::<BTreeSet<_>>().len()))
        .collect();
    let mut ready: BTreeSet<&ComponentKind> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        for (kind, prereqs) in edges {
            if prereqs.contains(next) {
                if let Some(d) = indegree.get_mut(kind) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(kind);
                    }
                }
            }
        }
    }

    if order.len() != edges.len() {
        let stuck: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(k, _)| k.to_string())
            .collect();
        return Err(Error::config(format!(
            "dependency cycle detected among: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
