//! Static ranking of host buffers. Workers evict the resident buffer
//! with the lowest priority first.

use crate::{
    buffers::{BufferId, NodeBuffers},
    hierarchy::Topology,
};
use std::collections::{btree_map::Entry, BTreeMap};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct BufferPriorities(BTreeMap<BufferId, i32>);

impl BufferPriorities {
    pub(crate) fn new(topology: &Topology, nodes: &[NodeBuffers]) -> BufferPriorities {
        let mut priorities = BufferPriorities(BTreeMap::new());
        for &node in topology.forward() {
            let kids = i32::try_from(topology.number_of_children(node)).unwrap_or(i32::MAX - 4);
            match &nodes[usize::from(node)] {
                NodeBuffers::Root { source_flow, source_working } => {
                    priorities.insert(*source_flow, kids + 2);
                    priorities.insert(*source_working, kids + 3);
                }
                NodeBuffers::Leaf { label, div, flows, sink, data, smoothness, .. } => {
                    priorities.insert(*div, 3);
                    for &flow in flows {
                        priorities.insert(flow, 2);
                    }
                    priorities.insert(*sink, 3);
                    priorities.insert(*data, 1);
                    priorities.insert(*label, 3);
                    if let Some(smoothness) = smoothness {
                        priorities.bump(*smoothness);
                    }
                }
                NodeBuffers::Branch { label, div, flows, sink, working, smoothness, .. } => {
                    priorities.insert(*div, 3);
                    for &flow in flows {
                        priorities.insert(flow, 2);
                    }
                    priorities.insert(*sink, kids + 4);
                    priorities.insert(*label, 3);
                    priorities.insert(*working, kids + 3);
                    if let Some(smoothness) = smoothness {
                        priorities.bump(*smoothness);
                    }
                }
            }
        }
        priorities
    }

    // Buffers reached twice keep their first priority
    fn insert(&mut self, buffer: BufferId, priority: i32) {
        self.0.entry(buffer).or_insert(priority);
    }

    fn bump(&mut self, buffer: BufferId) {
        match self.0.entry(buffer) {
            Entry::Occupied(mut entry) => *entry.get_mut() += 1,
            Entry::Vacant(entry) => {
                entry.insert(1);
            }
        }
    }

    /// Buffers without a ranking are evicted first
    pub(crate) fn get(&self, buffer: BufferId) -> i32 {
        self.0.get(&buffer).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::BufferPriorities;
    use crate::{
        buffers::{HostBuffers, NodeBuffers},
        hierarchy::{Hierarchy, LabelGraph, Topology},
    };
    use std::collections::BTreeMap;

    #[test]
    fn priorities_follow_roles() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(root);
        let a1 = graph.add_child(a);
        let a2 = graph.add_child(a);
        let a3 = graph.add_child(a);
        let topology = Topology::new(&graph).unwrap();
        let mut host = HostBuffers::new(4);
        let mut data: BTreeMap<_, _> = [b, a1, a2, a3].into_iter().map(|l| (l, vec![0.0; 4])).collect();
        let mut smoothness = BTreeMap::from([(a1, vec![1.0; 4])]);
        let nodes = NodeBuffers::allocate(&topology, &mut data, &mut smoothness, &mut host).unwrap();
        let priorities = BufferPriorities::new(&topology, &nodes);

        let NodeBuffers::Root { source_flow, source_working } = nodes[usize::from(root)] else { panic!() };
        assert_eq!(priorities.get(source_flow), 4);
        assert_eq!(priorities.get(source_working), 5);
        let NodeBuffers::Branch { sink, working, label, .. } = nodes[usize::from(a)] else { panic!() };
        assert_eq!(priorities.get(sink), 7);
        assert_eq!(priorities.get(working), 6);
        assert_eq!(priorities.get(label), 3);
        let NodeBuffers::Leaf { data, flows, smoothness, .. } = nodes[usize::from(a1)] else { panic!() };
        assert_eq!(priorities.get(data), 1);
        assert_eq!(priorities.get(flows[2]), 2);
        assert_eq!(priorities.get(smoothness.unwrap()), 1);
        // Incoming buffer of a leaf is the parent's sink, first insert wins
        let NodeBuffers::Leaf { incoming, .. } = nodes[usize::from(a2)] else { panic!() };
        assert_eq!(priorities.get(incoming), 7);
    }

    #[test]
    fn priorities_are_idempotent() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(a);
        let c = graph.add_child(a);
        let topology = Topology::new(&graph).unwrap();
        let mut host = HostBuffers::new(2);
        let mut data: BTreeMap<_, _> = [b, c].into_iter().map(|l| (l, vec![0.0; 2])).collect();
        let nodes = NodeBuffers::allocate(&topology, &mut data, &mut BTreeMap::new(), &mut host).unwrap();
        let first = BufferPriorities::new(&topology, &nodes);
        let second = BufferPriorities::new(&topology, &nodes);
        assert_eq!(first, second);
        assert_eq!(first.0.len(), host.len());
    }
}
