//! A single labelled directed graph over object ids, with per-edge info,
//! insertion-ordered adjacency, and cycle rejection for DAG relations.
//! Insertion order matters: for Signal and Forwarding it determines the
//! propagation-queue order between siblings.

use ahash::{AHashMap, AHashSet};

use super::{EdgeInfo, Relation};
use crate::{errors::PlanError, ident::ObjectId};

#[derive(Clone, Debug, Default)]
struct Neighbors {
    children: Vec<ObjectId>,
    parents: Vec<ObjectId>,
}

/// One relation graph of a plan or transaction. Vertices are object ids; the
/// owning plan guarantees every id resolves to a live object of the
/// relation's scope.
#[derive(Clone, Debug)]
pub struct RelationGraph {
    relation: Relation,
    adjacency: AHashMap<ObjectId, Neighbors>,
    info: AHashMap<(ObjectId, ObjectId), EdgeInfo>,
}

impl RelationGraph {
    pub fn new(relation: Relation) -> Self {
        Self {
            relation,
            adjacency: AHashMap::new(),
            info: AHashMap::new(),
        }
    }

    pub fn relation(&self) -> Relation {
        self.relation
    }

    /// Insert a vertex; idempotent.
    pub fn add_vertex(&mut self, vertex: ObjectId) {
        self.adjacency.entry(vertex).or_default();
    }

    pub fn contains(&self, vertex: ObjectId) -> bool {
        self.adjacency.contains_key(&vertex)
    }

    /// Remove a vertex and every edge incident to it.
    pub fn remove_vertex(&mut self, vertex: ObjectId) {
        let Some(neighbors) = self.adjacency.remove(&vertex) else {
            return;
        };
        for child in neighbors.children {
            if let Some(entry) = self.adjacency.get_mut(&child) {
                entry.parents.retain(|p| *p != vertex);
            }
            self.info.remove(&(vertex, child));
        }
        for parent in neighbors.parents {
            if let Some(entry) = self.adjacency.get_mut(&parent) {
                entry.children.retain(|c| *c != vertex);
            }
            self.info.remove(&(parent, vertex));
        }
    }

    /// Add an edge `parent -> child`. Fails with `CycleDetected` when the
    /// relation is a DAG and `child` already reaches `parent`. Re-adding an
    /// existing edge merges the infos through the relation's merge policy.
    pub fn add_edge(
        &mut self,
        parent: ObjectId,
        child: ObjectId,
        info: EdgeInfo,
    ) -> Result<(), PlanError> {
        if parent == child {
            return Err(PlanError::CycleDetected(format!(
                "{} -> {} ({})",
                parent, child, self.relation
            )));
        }
        if self.has_edge(parent, child) {
            let merged = {
                let old = self.info.get(&(parent, child)).cloned().unwrap_or_default();
                EdgeInfo::merge(old, info)
            };
            self.info.insert((parent, child), merged);
            return Ok(());
        }
        if self.relation.is_dag() && self.reachable(child, parent) {
            return Err(PlanError::CycleDetected(format!(
                "{} -> {} ({})",
                parent, child, self.relation
            )));
        }
        self.add_vertex(parent);
        self.add_vertex(child);
        if let Some(entry) = self.adjacency.get_mut(&parent) {
            entry.children.push(child);
        }
        if let Some(entry) = self.adjacency.get_mut(&child) {
            entry.parents.push(parent);
        }
        if !matches!(info, EdgeInfo::None) {
            self.info.insert((parent, child), info);
        }
        Ok(())
    }

    /// Remove an edge; returns its info, or `None` when absent (no-op).
    pub fn remove_edge(&mut self, parent: ObjectId, child: ObjectId) -> Option<EdgeInfo> {
        if !self.has_edge(parent, child) {
            return None;
        }
        if let Some(entry) = self.adjacency.get_mut(&parent) {
            entry.children.retain(|c| *c != child);
        }
        if let Some(entry) = self.adjacency.get_mut(&child) {
            entry.parents.retain(|p| *p != parent);
        }
        Some(self.info.remove(&(parent, child)).unwrap_or_default())
    }

    pub fn has_edge(&self, parent: ObjectId, child: ObjectId) -> bool {
        self.adjacency
            .get(&parent)
            .map(|n| n.children.contains(&child))
            .unwrap_or(false)
    }

    pub fn edge_info(&self, parent: ObjectId, child: ObjectId) -> Option<&EdgeInfo> {
        self.info.get(&(parent, child))
    }

    pub fn edge_info_mut(&mut self, parent: ObjectId, child: ObjectId) -> Option<&mut EdgeInfo> {
        self.info.get_mut(&(parent, child))
    }

    /// Replace the info of an existing edge.
    pub fn set_edge_info(&mut self, parent: ObjectId, child: ObjectId, info: EdgeInfo) {
        if self.has_edge(parent, child) {
            self.info.insert((parent, child), info);
        }
    }

    /// Children of `vertex`, in edge insertion order.
    pub fn children(&self, vertex: ObjectId) -> impl Iterator<Item = ObjectId> + '_ {
        self.adjacency
            .get(&vertex)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Parents of `vertex`, in edge insertion order.
    pub fn parents(&self, vertex: ObjectId) -> impl Iterator<Item = ObjectId> + '_ {
        self.adjacency
            .get(&vertex)
            .map(|n| n.parents.as_slice())
            .unwrap_or(&[])
            .iter()
            .copied()
    }

    /// Parents followed by children.
    pub fn neighbours(&self, vertex: ObjectId) -> impl Iterator<Item = ObjectId> + '_ {
        self.parents(vertex).chain(self.children(vertex))
    }

    /// Does `vertex` participate in any edge?
    pub fn has_edges(&self, vertex: ObjectId) -> bool {
        self.adjacency
            .get(&vertex)
            .map(|n| !n.children.is_empty() || !n.parents.is_empty())
            .unwrap_or(false)
    }

    pub fn vertices(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.adjacency.keys().copied()
    }

    /// Every edge of the graph as `(parent, child, info)` triples.
    pub fn edges(&self) -> impl Iterator<Item = (ObjectId, ObjectId, Option<&EdgeInfo>)> + '_ {
        self.adjacency.iter().flat_map(move |(parent, neighbors)| {
            neighbors
                .children
                .iter()
                .map(move |child| (*parent, *child, self.info.get(&(*parent, *child))))
        })
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(|n| n.children.len()).sum()
    }

    /// All vertices reachable from `vertex` following child edges. O(E).
    pub fn reachable_from(&self, vertex: ObjectId) -> AHashSet<ObjectId> {
        self.closure(vertex, false)
    }

    /// All vertices that reach `vertex` following parent edges. O(E).
    pub fn reaches(&self, vertex: ObjectId) -> AHashSet<ObjectId> {
        self.closure(vertex, true)
    }

    fn closure(&self, vertex: ObjectId, upward: bool) -> AHashSet<ObjectId> {
        let mut seen = AHashSet::new();
        let mut stack = vec![vertex];
        while let Some(current) = stack.pop() {
            let next: Vec<ObjectId> = if upward {
                self.parents(current).collect()
            } else {
                self.children(current).collect()
            };
            for n in next {
                if seen.insert(n) {
                    stack.push(n);
                }
            }
        }
        seen
    }

    fn reachable(&self, from: ObjectId, to: ObjectId) -> bool {
        from == to || self.reachable_from(from).contains(&to)
    }

    /// Whole-graph acyclicity check, used by transaction commit validation.
    pub fn is_acyclic(&self) -> bool {
        // Kahn's algorithm over in-degrees.
        let mut in_degree: AHashMap<ObjectId, usize> = self
            .adjacency
            .iter()
            .map(|(v, n)| (*v, n.parents.len()))
            .collect();
        let mut ready: Vec<ObjectId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(v, _)| *v)
            .collect();
        let mut visited = 0usize;
        while let Some(v) = ready.pop() {
            visited += 1;
            for child in self.children(v) {
                if let Some(d) = in_degree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(child);
                    }
                }
            }
        }
        visited == self.adjacency.len()
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::RelationGraph;
    use crate::{
        ident::ObjectId,
        internal::relation::{EdgeInfo, Relation},
    };

    fn ids(n: usize) -> Vec<ObjectId> {
        (0..n).map(|_| ObjectId::next()).collect()
    }

    /// DAG relations must reject a cycle-creating edge.
    #[test]
    fn test_cycle_rejected() {
        let v = ids(3);
        let mut g = RelationGraph::new(Relation::Dependency);
        g.add_edge(v[0], v[1], EdgeInfo::None).unwrap();
        g.add_edge(v[1], v[2], EdgeInfo::None).unwrap();
        assert!(g.add_edge(v[2], v[0], EdgeInfo::None).is_err());
        assert!(g.is_acyclic());
    }

    /// Free relations accept cycles.
    #[test]
    fn test_free_relation_accepts_cycles() {
        let v = ids(2);
        let mut g = RelationGraph::new(Relation::Forwarding);
        g.add_edge(v[0], v[1], EdgeInfo::None).unwrap();
        g.add_edge(v[1], v[0], EdgeInfo::None).unwrap();
        assert!(g.has_edge(v[0], v[1]));
        assert!(g.has_edge(v[1], v[0]));
    }

    /// Children must come back in insertion order.
    #[test]
    fn test_insertion_order() {
        let v = ids(4);
        let mut g = RelationGraph::new(Relation::Signal);
        g.add_edge(v[0], v[2], EdgeInfo::None).unwrap();
        g.add_edge(v[0], v[1], EdgeInfo::None).unwrap();
        g.add_edge(v[0], v[3], EdgeInfo::None).unwrap();
        let children: Vec<_> = g.children(v[0]).collect();
        assert_eq!(children, vec![v[2], v[1], v[3]]);
    }

    /// add_edge then remove_edge leaves the relation unchanged.
    #[test]
    fn test_add_remove_round_trip() {
        let v = ids(2);
        let mut g = RelationGraph::new(Relation::Dependency);
        g.add_edge(v[0], v[1], EdgeInfo::None).unwrap();
        g.remove_edge(v[0], v[1]);
        assert!(!g.has_edge(v[0], v[1]));
        assert_eq!(g.edge_count(), 0);
        // removing an absent edge is a no-op
        assert!(g.remove_edge(v[0], v[1]).is_none());
    }

    /// reachable_from/reaches walk the right directions.
    #[test]
    fn test_reachability() {
        let v = ids(4);
        let mut g = RelationGraph::new(Relation::Dependency);
        g.add_edge(v[0], v[1], EdgeInfo::None).unwrap();
        g.add_edge(v[1], v[2], EdgeInfo::None).unwrap();
        g.add_edge(v[3], v[1], EdgeInfo::None).unwrap();
        let down = g.reachable_from(v[0]);
        assert!(down.contains(&v[1]) && down.contains(&v[2]) && !down.contains(&v[3]));
        let up = g.reaches(v[2]);
        assert!(up.contains(&v[0]) && up.contains(&v[1]) && up.contains(&v[3]));
    }

    /// Removing a vertex drops all incident edges.
    #[test]
    fn test_remove_vertex_unlinks() {
        let v = ids(3);
        let mut g = RelationGraph::new(Relation::Forwarding);
        g.add_edge(v[0], v[1], EdgeInfo::None).unwrap();
        g.add_edge(v[1], v[2], EdgeInfo::None).unwrap();
        g.remove_vertex(v[1]);
        assert!(!g.contains(v[1]));
        assert!(!g.has_edge(v[0], v[1]));
        assert_eq!(g.children(v[0]).count(), 0);
        assert_eq!(g.parents(v[2]).count(), 0);
    }

    quickcheck! {
        /// Adding the same chain twice is the same as adding it once.
        fn prop_add_idempotent(n: u8) -> bool {
            let n = (n % 16) as usize + 2;
            let v = ids(n);
            let mut once = RelationGraph::new(Relation::Temporal);
            let mut twice = RelationGraph::new(Relation::Temporal);
            for w in v.windows(2) {
                once.add_edge(w[0], w[1], EdgeInfo::None).unwrap();
                twice.add_edge(w[0], w[1], EdgeInfo::None).unwrap();
                twice.add_edge(w[0], w[1], EdgeInfo::None).unwrap();
            }
            once.edge_count() == twice.edge_count()
                && v.iter().all(|x| {
                    once.children(*x).collect::<Vec<_>>() == twice.children(*x).collect::<Vec<_>>()
                })
        }
    }
}
