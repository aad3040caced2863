//! Host side buffer arena and residency bookkeeping.
//!
//! Every volume used during a run lives in [`HostBuffers`] and is referred to
//! by [`BufferId`]. Next to the data, each buffer carries flags used by workers
//! to decide when copies between host and device are needed.

use crate::{
    error::SegError,
    hierarchy::{NodeId, Role, Topology},
    slab::{slab_id, Slab},
    worker::WorkerId,
};
use std::collections::BTreeMap;

slab_id! {
    /// Handle of a host volume
    pub struct BufferId;
}

/// Residency flags of one host buffer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferState {
    /// Never written by any task (data and smoothness terms)
    pub(crate) read_only: bool,
    /// Transient, host copy is not needed unless it had to be spilled
    pub(crate) no_copy_back: bool,
    /// Device copy is newer than host copy
    pub(crate) overwritten: bool,
    /// No-copy-back buffer that was evicted while holding live data
    pub(crate) spilled: bool,
    /// Worker that currently has this buffer resident
    pub(crate) holder: Option<WorkerId>,
    /// Worker whose copy back to host may still be in flight
    pub(crate) last_writer: Option<WorkerId>,
}

#[derive(Debug)]
struct HostBuffer {
    data: Vec<f32>,
    state: BufferState,
}

#[derive(Debug)]
pub(crate) struct HostBuffers {
    volume: usize,
    buffers: Slab<BufferId, HostBuffer>,
}

impl HostBuffers {
    pub(crate) const fn new(volume: usize) -> HostBuffers {
        HostBuffers { volume, buffers: Slab::new() }
    }

    pub(crate) const fn volume(&self) -> usize {
        self.volume
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Zero initialized buffer
    pub(crate) fn allocate(&mut self) -> BufferId {
        self.buffers.push(HostBuffer { data: vec![0.0; self.volume], state: BufferState::default() })
    }

    /// Caller provided volume, stays read only
    pub(crate) fn insert_read_only(&mut self, data: Vec<f32>) -> BufferId {
        debug_assert_eq!(data.len(), self.volume);
        self.buffers.push(HostBuffer { data, state: BufferState { read_only: true, ..BufferState::default() } })
    }

    pub(crate) fn data(&self, id: BufferId) -> &[f32] {
        &self.buffers[id].data
    }

    pub(crate) fn data_mut(&mut self, id: BufferId) -> &mut [f32] {
        &mut self.buffers[id].data
    }

    pub(crate) fn take(&mut self, id: BufferId) -> Option<Vec<f32>> {
        self.buffers.remove(id).map(|x| x.data)
    }

    pub(crate) fn state(&self, id: BufferId) -> BufferState {
        self.buffers[id].state
    }

    pub(crate) fn state_mut(&mut self, id: BufferId) -> &mut BufferState {
        &mut self.buffers[id].state
    }

    pub(crate) fn holder(&self, id: BufferId) -> Option<WorkerId> {
        self.buffers[id].state.holder
    }

    pub(crate) fn last_writer(&self, id: BufferId) -> Option<WorkerId> {
        self.buffers[id].state.last_writer
    }

    /// Moving this buffer to a device requires a copy
    pub(crate) fn needs_copy_in(&self, id: BufferId) -> bool {
        let state = &self.buffers[id].state;
        !state.no_copy_back || state.spilled
    }

    /// Evicting this buffer from a device requires a copy
    pub(crate) fn needs_copy_back(&self, id: BufferId) -> bool {
        let state = &self.buffers[id].state;
        !state.read_only && state.overwritten
    }
}

/// Buffers of one hierarchy node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeBuffers {
    Root {
        source_flow: BufferId,
        source_working: BufferId,
    },
    Branch {
        label: BufferId,
        div: BufferId,
        flows: [BufferId; 3],
        sink: BufferId,
        // Parent's sink, or source flow of the root
        incoming: BufferId,
        working: BufferId,
        smoothness: Option<BufferId>,
    },
    Leaf {
        label: BufferId,
        div: BufferId,
        flows: [BufferId; 3],
        sink: BufferId,
        incoming: BufferId,
        data: BufferId,
        smoothness: Option<BufferId>,
    },
}

impl NodeBuffers {
    /// Allocates buffers for every node of a tree. Data and smoothness terms are moved in.
    pub(crate) fn allocate(
        topology: &Topology,
        data_terms: &mut BTreeMap<NodeId, Vec<f32>>,
        smoothness_terms: &mut BTreeMap<NodeId, Vec<f32>>,
        host: &mut HostBuffers,
    ) -> Result<Vec<NodeBuffers>, SegError> {
        let mut buffers: Vec<Option<NodeBuffers>> = vec![None; topology.len()];
        for &node in topology.forward() {
            let role = topology.role(node);
            let node_buffers = if role == Role::Root {
                NodeBuffers::Root { source_flow: host.allocate(), source_working: host.allocate() }
            } else {
                let parent = topology
                    .parent(node)
                    .ok_or_else(|| SegError::hierarchy_error(format!("Node {node} has no parent")))?;
                let incoming = buffers[usize::from(parent)]
                    .as_ref()
                    .ok_or_else(|| SegError::internal(format!("Parent of {node} visited after it")))?
                    .sink();
                let label = host.allocate();
                let div = host.allocate();
                let flows = [host.allocate(), host.allocate(), host.allocate()];
                let sink = host.allocate();
                let smoothness = smoothness_terms.remove(&node).map(|x| host.insert_read_only(x));
                if role == Role::Leaf {
                    let data = data_terms
                        .remove(&node)
                        .ok_or_else(|| SegError::input_error(format!("Leaf {node} has no data term")))?;
                    let data = host.insert_read_only(data);
                    NodeBuffers::Leaf { label, div, flows, sink, incoming, data, smoothness }
                } else {
                    let working = host.allocate();
                    host.state_mut(working).no_copy_back = true;
                    NodeBuffers::Branch { label, div, flows, sink, incoming, working, smoothness }
                }
            };
            buffers[usize::from(node)] = Some(node_buffers);
        }
        Ok(buffers.into_iter().flatten().collect())
    }

    /// Sink of the node, source flow for the root
    pub(crate) const fn sink(&self) -> BufferId {
        match self {
            NodeBuffers::Root { source_flow, .. } => *source_flow,
            NodeBuffers::Branch { sink, .. } | NodeBuffers::Leaf { sink, .. } => *sink,
        }
    }

    /// Accumulator that children push their flows into
    pub(crate) const fn working(&self) -> Option<BufferId> {
        match self {
            NodeBuffers::Root { source_working, .. } => Some(*source_working),
            NodeBuffers::Branch { working, .. } => Some(*working),
            NodeBuffers::Leaf { .. } => None,
        }
    }

    pub(crate) const fn label(&self) -> Option<BufferId> {
        match self {
            NodeBuffers::Root { .. } => None,
            NodeBuffers::Branch { label, .. } | NodeBuffers::Leaf { label, .. } => Some(*label),
        }
    }

    /// Buffers shared by branches and leaves, `None` for the root
    pub(crate) const fn flow(&self) -> Option<FlowBuffers> {
        match *self {
            NodeBuffers::Root { .. } => None,
            NodeBuffers::Branch { label, div, flows, sink, incoming, smoothness, .. }
            | NodeBuffers::Leaf { label, div, flows, sink, incoming, smoothness, .. } => {
                Some(FlowBuffers { label, div, flows, sink, incoming, smoothness })
            }
        }
    }
}

/// Flow state of a non-root node
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowBuffers {
    pub(crate) label: BufferId,
    pub(crate) div: BufferId,
    pub(crate) flows: [BufferId; 3],
    pub(crate) sink: BufferId,
    pub(crate) incoming: BufferId,
    pub(crate) smoothness: Option<BufferId>,
}
