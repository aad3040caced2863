//! Label hierarchy. Leaves are terminal labels, branches group labels
//! and the root is the universal source of flow.

use crate::{error::SegError, slab::slab_id};
use std::collections::BTreeSet;

slab_id! {
    /// Node of the label hierarchy. Ids are dense, `0..number_of_nodes`.
    pub struct NodeId;
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("n{}", self.0))
    }
}

/// Rooted tree or DAG of labels as seen by the segmentation.
pub trait Hierarchy {
    /// Root node
    fn root(&self) -> NodeId;

    /// Total number of nodes, ids must be `0..number_of_nodes`
    fn number_of_nodes(&self) -> usize;

    fn number_of_children(&self, node: NodeId) -> usize;

    /// K-th child of node
    fn child(&self, node: NodeId, k: usize) -> NodeId;

    fn number_of_parents(&self, node: NodeId) -> usize;

    /// K-th parent of node
    fn parent(&self, node: NodeId, k: usize) -> NodeId;

    fn is_leaf(&self, node: NodeId) -> bool {
        self.number_of_children(node) == 0
    }

    /// Weight of the edge from node to its k-th child
    fn edge_weight(&self, node: NodeId, k: usize) -> f32 {
        let _ = (node, k);
        1.0
    }
}

/// Simple adjacency list hierarchy.
#[derive(Debug, Clone)]
pub struct LabelGraph {
    children: Vec<Vec<(NodeId, f32)>>,
    parents: Vec<Vec<NodeId>>,
}

impl Default for LabelGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelGraph {
    /// Creates graph with only the root node
    #[must_use]
    pub fn new() -> LabelGraph {
        LabelGraph { children: vec![Vec::new()], parents: vec![Vec::new()] }
    }

    /// Adds new node below parent with edge weight 1
    pub fn add_child(&mut self, parent: NodeId) -> NodeId {
        self.add_weighted_child(parent, 1.0)
    }

    pub fn add_weighted_child(&mut self, parent: NodeId, weight: f32) -> NodeId {
        let node = NodeId::from(self.children.len());
        self.children.push(Vec::new());
        self.parents.push(vec![parent]);
        self.children[usize::from(parent)].push((node, weight));
        node
    }

    /// Adds another parent to an existing node, turning the tree into a DAG.
    pub fn add_edge(&mut self, parent: NodeId, child: NodeId, weight: f32) -> Result<(), SegError> {
        let n = self.children.len();
        if usize::from(parent) >= n || usize::from(child) >= n {
            return Err(SegError::hierarchy_error(format!("Edge {parent} -> {child} refers to unknown node")));
        }
        if self.parents[usize::from(child)].contains(&parent) {
            return Err(SegError::hierarchy_error(format!("Edge {parent} -> {child} already exists")));
        }
        self.children[usize::from(parent)].push((child, weight));
        self.parents[usize::from(child)].push(parent);
        Ok(())
    }
}

impl Hierarchy for LabelGraph {
    fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn number_of_nodes(&self) -> usize {
        self.children.len()
    }

    fn number_of_children(&self, node: NodeId) -> usize {
        self.children[usize::from(node)].len()
    }

    fn child(&self, node: NodeId, k: usize) -> NodeId {
        self.children[usize::from(node)][k].0
    }

    fn number_of_parents(&self, node: NodeId) -> usize {
        self.parents[usize::from(node)].len()
    }

    fn parent(&self, node: NodeId, k: usize) -> NodeId {
        self.parents[usize::from(node)][k]
    }

    fn edge_weight(&self, node: NodeId, k: usize) -> f32 {
        self.children[usize::from(node)][k].1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Root,
    Branch,
    Leaf,
}

#[derive(Debug, Clone)]
struct NodeInfo {
    children: Vec<(NodeId, f32)>,
    parents: Vec<(NodeId, f32)>,
}

/// Validated snapshot of a hierarchy with precomputed traversal orders and edge weights.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    root: NodeId,
    nodes: Vec<NodeInfo>,
    leaves: Vec<NodeId>,
    branches: Vec<NodeId>,
    // Parents always come before their children
    forward: Vec<NodeId>,
}

impl Topology {
    pub(crate) fn new(hierarchy: &impl Hierarchy) -> Result<Topology, SegError> {
        let n = hierarchy.number_of_nodes();
        let root = hierarchy.root();
        if usize::from(root) >= n {
            return Err(SegError::hierarchy_error(format!("Root {root} is not a node of the hierarchy")));
        }
        let mut nodes: Vec<NodeInfo> = (0..n).map(|_| NodeInfo { children: Vec::new(), parents: Vec::new() }).collect();
        for i in 0..n {
            let node = NodeId::from(i);
            for k in 0..hierarchy.number_of_children(node) {
                let child = hierarchy.child(node, k);
                let weight = hierarchy.edge_weight(node, k);
                if usize::from(child) >= n {
                    return Err(SegError::hierarchy_error(format!("Child {child} of {node} is not a node")));
                }
                if !(weight > 0.0) || !weight.is_finite() {
                    return Err(SegError::hierarchy_error(format!("Edge {node} -> {child} has invalid weight {weight}")));
                }
                nodes[i].children.push((child, weight));
                nodes[usize::from(child)].parents.push((node, weight));
            }
        }
        for i in 0..n {
            let node = NodeId::from(i);
            let mut declared: Vec<NodeId> = (0..hierarchy.number_of_parents(node)).map(|k| hierarchy.parent(node, k)).collect();
            let mut found: Vec<NodeId> = nodes[i].parents.iter().map(|&(p, _)| p).collect();
            declared.sort();
            found.sort();
            if declared != found {
                return Err(SegError::hierarchy_error(format!("Parents of {node} do not match children lists")));
            }
        }
        if !nodes[usize::from(root)].parents.is_empty() {
            return Err(SegError::hierarchy_error("Root has a parent"));
        }
        if nodes[usize::from(root)].children.is_empty() {
            return Err(SegError::hierarchy_error("Root has no children"));
        }

        // Kahn's algorithm, smallest ready id first so that orders are deterministic
        let mut pending: Vec<usize> = nodes.iter().map(|x| x.parents.len()).collect();
        let mut ready = BTreeSet::from([root]);
        let mut forward = Vec::with_capacity(n);
        while let Some(node) = ready.pop_first() {
            forward.push(node);
            for &(child, _) in &nodes[usize::from(node)].children {
                pending[usize::from(child)] -= 1;
                if pending[usize::from(child)] == 0 {
                    ready.insert(child);
                }
            }
        }
        if forward.len() != n {
            return Err(SegError::hierarchy_error(
                "Hierarchy contains a cycle, a second root or nodes unreachable from root",
            ));
        }

        let mut leaves = Vec::new();
        let mut branches = Vec::new();
        for i in 0..n {
            let node = NodeId::from(i);
            if node == root {
                continue;
            }
            if nodes[i].children.is_empty() {
                leaves.push(node);
            } else {
                branches.push(node);
            }
        }
        Ok(Topology { root, nodes, leaves, branches, forward })
    }

    pub(crate) const fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn role(&self, node: NodeId) -> Role {
        if node == self.root {
            Role::Root
        } else if self.nodes[usize::from(node)].children.is_empty() {
            Role::Leaf
        } else {
            Role::Branch
        }
    }

    pub(crate) fn is_leaf(&self, node: NodeId) -> bool {
        self.role(node) == Role::Leaf
    }

    /// Leaves in ascending id order, the first one acts as the reference leaf during initialization
    pub(crate) fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// Non-root, non-leaf nodes
    pub(crate) fn branches(&self) -> &[NodeId] {
        &self.branches
    }

    pub(crate) fn children(&self, node: NodeId) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.nodes[usize::from(node)].children.iter().map(|&(c, _)| c)
    }

    pub(crate) fn number_of_children(&self, node: NodeId) -> usize {
        self.nodes[usize::from(node)].children.len()
    }

    /// Parents with the weight of the connecting edge
    pub(crate) fn weighted_parents(&self, node: NodeId) -> &[(NodeId, f32)] {
        &self.nodes[usize::from(node)].parents
    }

    pub(crate) fn weighted_children(&self, node: NodeId) -> &[(NodeId, f32)] {
        &self.nodes[usize::from(node)].children
    }

    /// The only parent of node in a tree
    pub(crate) fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[usize::from(node)].parents.first().map(|&(p, _)| p)
    }

    pub(crate) fn is_tree(&self) -> bool {
        self.nodes.iter().all(|x| x.parents.len() <= 1)
    }

    /// Sum of incoming edge weights
    pub(crate) fn num_parents(&self, node: NodeId) -> f32 {
        self.nodes[usize::from(node)].parents.iter().map(|&(_, w)| w).sum()
    }

    /// Sum over children of (edge weight / child's num parents) squared
    pub(crate) fn weighted_num_children(&self, node: NodeId) -> f32 {
        self.nodes[usize::from(node)]
            .children
            .iter()
            .map(|&(c, w)| {
                let m = w / self.num_parents(c);
                m * m
            })
            .sum()
    }

    /// Parents before children
    pub(crate) fn forward(&self) -> &[NodeId] {
        &self.forward
    }

    /// Children before parents
    pub(crate) fn backward(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.forward.iter().rev().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::{Hierarchy, LabelGraph, Role, Topology};

    #[test]
    fn tree_roles_and_orders() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(root);
        let a1 = graph.add_child(a);
        let a2 = graph.add_child(a);
        let topology = Topology::new(&graph).unwrap();
        assert_eq!(topology.role(root), Role::Root);
        assert_eq!(topology.role(a), Role::Branch);
        assert_eq!(topology.role(b), Role::Leaf);
        assert_eq!(topology.leaves(), &[b, a1, a2]);
        assert_eq!(topology.branches(), &[a]);
        assert!(topology.is_tree());
        let forward = topology.forward();
        let pos = |x| forward.iter().position(|&y| y == x).unwrap();
        assert!(pos(a) < pos(a1) && pos(a) < pos(a2) && pos(root) == 0);
        assert_eq!(topology.weighted_num_children(root), 2.0);
    }

    #[test]
    fn dag_weights() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(root);
        let c = graph.add_weighted_child(a, 1.0);
        graph.add_edge(b, c, 3.0).unwrap();
        let topology = Topology::new(&graph).unwrap();
        assert!(!topology.is_tree());
        assert_eq!(topology.num_parents(c), 4.0);
        assert_eq!(topology.weighted_num_children(b), 0.5625);
    }

    #[test]
    fn rejects_cycles() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(a);
        graph.add_edge(b, a, 1.0).unwrap();
        assert!(Topology::new(&graph).is_err());
    }
}
