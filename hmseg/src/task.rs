//! Task graph of one run.
//!
//! Every task is a short sequence of kernel launches over the buffers of one
//! hierarchy node. Tasks are ordered only by signals: a task becomes runnable
//! once its activation counter reaches zero and completing it adds one to the
//! activation of every task in its signal list. Repeating tasks drop their
//! activation by the reactivation amount after each run.

use crate::{
    buffers::{BufferId, NodeBuffers},
    error::SegError,
    hierarchy::{NodeId, Role, Topology},
    kernels::Kernel,
    slab::{slab_id, Slab},
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Index;

slab_id! {
    pub(crate) struct TaskId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum TaskKind {
    ClearWorkingBuffer,
    UpdateSpatialFlows,
    ApplySinkPotentialBranch,
    ApplySinkPotentialLeaf,
    ApplySourcePotential,
    DivideOutWorkingBuffer,
    UpdateLabels,
    InitializeLeafFlows,
    MinimizeLeafFlows,
    PropogateLeafFlows,
    InitializeLeafLabels,
    AccumulateLabels,
    CorrectLabels,
    ClearBufferInitially,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Blocked,
    Runnable,
    Finished,
}

/// Scalar parameters baked into task kernels
#[derive(Debug, Clone)]
pub(crate) struct SolverParams {
    pub(crate) iterations: usize,
    pub(crate) step_size: f32,
    pub(crate) cc: f32,
    pub(crate) extent: [usize; 3],
    /// Smoothness scalar of each node, indexed by node id
    pub(crate) smoothness: Vec<f32>,
}

#[derive(Debug)]
pub(crate) struct Task {
    pub(crate) kind: TaskKind,
    pub(crate) node: NodeId,
    active: i32,
    initial_active: i32,
    reactivate: i32,
    repeats: usize,
    /// Every buffer touched by launches, in order of first use
    pub(crate) buffers: Vec<BufferId>,
    /// Buffers written by launches
    pub(crate) outputs: Vec<BufferId>,
    pub(crate) launches: Vec<(Kernel, Vec<BufferId>)>,
    signals: Vec<TaskId>,
    times_performed: usize,
    signals_before_first_run: i32,
}

impl Task {
    fn new(kind: TaskKind, node: NodeId, reactivate: i32, repeats: usize, launches: Vec<(Kernel, Vec<BufferId>)>) -> Task {
        let mut buffers = Vec::new();
        let mut outputs = Vec::new();
        for (kernel, args) in &launches {
            for (i, &arg) in args.iter().enumerate() {
                if !buffers.contains(&arg) {
                    buffers.push(arg);
                }
                if i < kernel.outputs() && !outputs.contains(&arg) {
                    outputs.push(arg);
                }
            }
        }
        Task {
            kind,
            node,
            active: 0,
            initial_active: 0,
            reactivate,
            repeats,
            buffers,
            outputs,
            launches,
            signals: Vec::new(),
            times_performed: 0,
            signals_before_first_run: 0,
        }
    }

    pub(crate) const fn state(&self) -> TaskState {
        if self.repeats == 0 {
            TaskState::Finished
        } else if self.active >= 0 {
            TaskState::Runnable
        } else {
            TaskState::Blocked
        }
    }

    pub(crate) const fn initial_active(&self) -> i32 {
        self.initial_active
    }

    pub(crate) const fn signals_before_first_run(&self) -> i32 {
        self.signals_before_first_run
    }
}

#[derive(Debug)]
pub(crate) struct TaskGraph {
    tasks: Slab<TaskId, Task>,
    runnable: BTreeSet<TaskId>,
}

impl Index<TaskId> for TaskGraph {
    type Output = Task;

    fn index(&self, index: TaskId) -> &Self::Output {
        &self.tasks[index]
    }
}

// Tasks of the iteration phase, keyed by node
#[derive(Debug, Default)]
struct IterationTasks {
    clear_working: BTreeMap<NodeId, TaskId>,
    spatial_flows: BTreeMap<NodeId, TaskId>,
    sink_branch: BTreeMap<NodeId, TaskId>,
    sink_leaf: BTreeMap<NodeId, TaskId>,
    source: BTreeMap<NodeId, TaskId>,
    divide_out: BTreeMap<NodeId, TaskId>,
    update_labels: BTreeMap<NodeId, TaskId>,
}

impl TaskGraph {
    /// Builds every task of a run over a tree and wires their signals.
    pub(crate) fn build(topology: &Topology, nodes: &[NodeBuffers], params: &SolverParams) -> Result<TaskGraph, SegError> {
        if !topology.is_tree() {
            return Err(SegError::hierarchy_error("Scheduled solver requires a tree hierarchy"));
        }
        let mut graph = TaskGraph { tasks: Slab::new(), runnable: BTreeSet::new() };
        let root = topology.root();
        let node = |id: NodeId| &nodes[usize::from(id)];
        let flow = |id: NodeId| {
            nodes[usize::from(id)].flow().ok_or_else(|| SegError::internal(format!("Node {id} has no flow buffers")))
        };
        let working = |id: NodeId| {
            nodes[usize::from(id)].working().ok_or_else(|| SegError::internal(format!("Node {id} has no working buffer")))
        };
        let source_working = working(root)?;
        let source_flow = node(root).sink();
        let cc = params.cc;
        let iterations = params.iterations;
        let num_leaves = topology.leaves().len();

        let mut it = IterationTasks::default();
        if iterations > 0 {
            // Creation
            for &id in topology.forward() {
                let kids = topology.number_of_children(id);
                match topology.role(id) {
                    Role::Root => {
                        let launches = vec![(Kernel::Fill(1.0 / cc), vec![source_working])];
                        it.clear_working.insert(id, graph.add(TaskKind::ClearWorkingBuffer, id, 1, iterations, launches));
                        let launches = vec![(Kernel::DivAndStore(kids as f32), vec![source_flow, source_working])];
                        let reactivate = i32::try_from(kids + 1).unwrap_or(i32::MAX);
                        it.divide_out.insert(id, graph.add(TaskKind::DivideOutWorkingBuffer, id, reactivate, iterations, launches));
                    }
                    role => {
                        let f = flow(id)?;
                        let parent = topology.parent(id).ok_or_else(|| SegError::internal(format!("{id} has no parent")))?;
                        let [fx, fy, fz] = f.flows;
                        let mut magnitude = vec![f.div, fx, fy, fz];
                        magnitude.extend(f.smoothness);
                        let launches = vec![
                            (Kernel::GradientStep { step: params.step_size, cc }, vec![f.div, f.sink, f.incoming, f.label]),
                            (Kernel::ApplyStep { extent: params.extent }, vec![fx, fy, fz, f.div]),
                            (Kernel::FlowMagnitude { alpha: params.smoothness[usize::from(id)], extent: params.extent }, magnitude),
                            (Kernel::Project { extent: params.extent }, vec![f.div, fx, fy, fz]),
                        ];
                        it.spatial_flows.insert(id, graph.add(TaskKind::UpdateSpatialFlows, id, 1, iterations, launches));

                        let launches = vec![(Kernel::PushSourceFlow { cc }, vec![working(parent)?, f.sink, f.div, f.label])];
                        it.source.insert(id, graph.add(TaskKind::ApplySourcePotential, id, 2, iterations, launches));

                        let update = vec![(Kernel::UpdateLabel { cc }, vec![f.label, f.sink, f.incoming, f.div])];
                        if role == Role::Leaf {
                            let NodeBuffers::Leaf { data, .. } = *node(id) else {
                                return Err(SegError::internal(format!("Leaf {id} has no data term")));
                            };
                            let launches = vec![
                                (Kernel::LeafSink { cc }, vec![f.sink, f.incoming, f.div, f.label]),
                                (Kernel::Constrain, vec![f.sink, data]),
                            ];
                            it.sink_leaf.insert(id, graph.add(TaskKind::ApplySinkPotentialLeaf, id, 1, iterations, launches));
                            it.update_labels.insert(id, graph.add(TaskKind::UpdateLabels, id, 2, iterations, update));
                        } else {
                            let w = working(id)?;
                            let launches = vec![(Kernel::Zero, vec![w])];
                            it.clear_working.insert(id, graph.add(TaskKind::ClearWorkingBuffer, id, 1, iterations, launches));
                            let launches = vec![(Kernel::AccumulateSinkFlow { cc }, vec![w, f.incoming, f.div, f.label])];
                            it.sink_branch.insert(id, graph.add(TaskKind::ApplySinkPotentialBranch, id, 2, iterations, launches));
                            let launches = vec![(Kernel::DivAndStore((kids + 1) as f32), vec![f.sink, w])];
                            let reactivate = i32::try_from(kids + 1).unwrap_or(i32::MAX);
                            it.divide_out.insert(id, graph.add(TaskKind::DivideOutWorkingBuffer, id, reactivate, iterations, launches));
                            // Last branch label update would not be read by anything
                            if iterations > 1 {
                                it.update_labels.insert(id, graph.add(TaskKind::UpdateLabels, id, 2, iterations - 1, update));
                            }
                        }
                    }
                }
            }

            // Wiring
            for &id in topology.forward() {
                let get = |map: &BTreeMap<NodeId, TaskId>, id: NodeId| map.get(&id).copied();
                let children: Vec<NodeId> = topology.children(id).collect();
                match topology.role(id) {
                    Role::Root => {
                        graph.connect(get(&it.clear_working, id), get(&it.divide_out, id));
                        for &child in &children {
                            graph.connect(get(&it.clear_working, id), get(&it.source, child));
                        }
                        graph.connect_loop(get(&it.divide_out, id), get(&it.clear_working, id));
                        for &child in &children {
                            graph.connect(get(&it.divide_out, id), get(&it.update_labels, child));
                        }
                    }
                    Role::Leaf => {
                        let parent = topology.parent(id);
                        graph.connect(get(&it.spatial_flows, id), get(&it.sink_leaf, id));
                        graph.connect(get(&it.sink_leaf, id), get(&it.source, id));
                        graph.connect(get(&it.source, id), parent.and_then(|p| get(&it.divide_out, p)));
                        graph.connect(get(&it.source, id), get(&it.update_labels, id));
                        graph.connect_loop(get(&it.update_labels, id), get(&it.spatial_flows, id));
                    }
                    Role::Branch => {
                        let parent = topology.parent(id);
                        graph.connect(get(&it.clear_working, id), get(&it.sink_branch, id));
                        for &child in &children {
                            graph.connect(get(&it.clear_working, id), get(&it.source, child));
                        }
                        graph.connect(get(&it.spatial_flows, id), get(&it.sink_branch, id));
                        graph.connect(get(&it.sink_branch, id), get(&it.divide_out, id));
                        graph.connect(get(&it.divide_out, id), get(&it.source, id));
                        graph.connect_loop(get(&it.divide_out, id), get(&it.clear_working, id));
                        for &child in &children {
                            graph.connect(get(&it.divide_out, id), get(&it.update_labels, child));
                        }
                        graph.connect(get(&it.source, id), parent.and_then(|p| get(&it.divide_out, p)));
                        graph.connect(get(&it.source, id), get(&it.update_labels, id));
                        graph.connect_loop(get(&it.update_labels, id), get(&it.spatial_flows, id));
                    }
                }
            }
        }

        // Spatial flows and divergence start at zero
        if iterations > 0 {
            for &id in topology.forward().iter().filter(|&&id| id != root) {
                let f = flow(id)?;
                for buffer in [f.div, f.flows[0], f.flows[1], f.flows[2]] {
                    let clear = graph.add(TaskKind::ClearBufferInitially, id, 1, 1, vec![(Kernel::Zero, vec![buffer])]);
                    graph.connect(Some(clear), it.spatial_flows.get(&id).copied());
                }
            }
        }

        // Every leaf sink starts at its data term, the smallest one is copied everywhere
        let leaves = topology.leaves();
        let first_leaf = *leaves.first().ok_or_else(|| SegError::hierarchy_error("Hierarchy has no leaves"))?;
        let sink0 = flow(first_leaf)?.sink;
        let mut initialize = BTreeMap::new();
        for &leaf in leaves {
            let NodeBuffers::Leaf { sink, data, .. } = *node(leaf) else {
                return Err(SegError::internal(format!("Leaf {leaf} has no data term")));
            };
            let task = graph.add(TaskKind::InitializeLeafFlows, leaf, 1, 1, vec![(Kernel::Copy, vec![sink, data])]);
            initialize.insert(leaf, task);
        }
        let mut minimize = Vec::new();
        for &leaf in &leaves[1..] {
            let sink = flow(leaf)?.sink;
            let task = graph.add(TaskKind::MinimizeLeafFlows, leaf, 1, 1, vec![(Kernel::Min, vec![sink0, sink])]);
            graph.connect(initialize.get(&leaf).copied(), Some(task));
            graph.connect(initialize.get(&first_leaf).copied(), Some(task));
            minimize.push(task);
        }
        let mut propogate = BTreeMap::new();
        for &id in topology.forward() {
            let target = node(id).sink();
            let launches = if target == sink0 { Vec::new() } else { vec![(Kernel::Copy, vec![target, sink0])] };
            let task = graph.add(TaskKind::PropogateLeafFlows, id, 1, 1, launches);
            if minimize.is_empty() {
                graph.connect(initialize.get(&first_leaf).copied(), Some(task));
            }
            for &m in &minimize {
                graph.connect(Some(m), Some(task));
            }
            graph.connect(Some(task), it.spatial_flows.get(&id).copied());
            for child in topology.children(id) {
                graph.connect(Some(task), it.spatial_flows.get(&child).copied());
            }
            propogate.insert(id, task);
        }

        // Initial labelling, normalized by its sum over leaves
        let clear_source = graph.add(TaskKind::ClearBufferInitially, root, 1, 1, vec![(Kernel::Zero, vec![source_working])]);
        let mut sums = Vec::new();
        for &leaf in leaves {
            let NodeBuffers::Leaf { sink, data, label, .. } = *node(leaf) else {
                return Err(SegError::internal(format!("Leaf {leaf} has no data term")));
            };
            let labelling = graph.add(TaskKind::InitializeLeafLabels, leaf, 1, 1, vec![(Kernel::Label, vec![label, sink, data])]);
            graph.connect(propogate.get(&leaf).copied(), Some(labelling));
            let sum = graph.add(TaskKind::AccumulateLabels, leaf, 1, 1, vec![(Kernel::Sum, vec![source_working, label])]);
            graph.connect(Some(labelling), Some(sum));
            graph.connect(Some(clear_source), Some(sum));
            sums.push(sum);
        }
        let mut correct = BTreeMap::new();
        for &leaf in leaves {
            let label = flow(leaf)?.label;
            let task = graph.add(TaskKind::CorrectLabels, leaf, 1, 1, vec![(Kernel::Div, vec![label, source_working])]);
            for &sum in &sums {
                graph.connect(Some(sum), Some(task));
            }
            graph.connect(Some(task), it.spatial_flows.get(&leaf).copied());
            graph.connect(Some(task), it.clear_working.get(&root).copied());
            correct.insert(leaf, task);
        }
        debug_assert_eq!(correct.len(), num_leaves);

        // Branch labels are sums of their children's labels, children first
        let mut accumulates: BTreeMap<NodeId, TaskId> = BTreeMap::new();
        let branches: Vec<NodeId> = topology.backward().filter(|&id| topology.role(id) == Role::Branch).collect();
        for id in branches {
            let label = flow(id)?.label;
            let clear = graph.add(TaskKind::ClearBufferInitially, id, 1, 1, vec![(Kernel::Zero, vec![label])]);
            for child in topology.children(id) {
                let child_label = flow(child)?.label;
                let task = graph.add(TaskKind::AccumulateLabels, child, 1, 1, vec![(Kernel::Sum, vec![label, child_label])]);
                graph.connect(Some(clear), Some(task));
                if topology.is_leaf(child) {
                    graph.connect(correct.get(&child).copied(), Some(task));
                } else {
                    for grandchild in topology.children(child) {
                        graph.connect(accumulates.get(&grandchild).copied(), Some(task));
                    }
                }
                graph.connect(Some(task), it.spatial_flows.get(&id).copied());
                accumulates.insert(child, task);
            }
        }

        for (id, task) in graph.tasks.iter() {
            if task.state() == TaskState::Runnable {
                graph.runnable.insert(id);
            }
        }
        Ok(graph)
    }

    fn add(&mut self, kind: TaskKind, node: NodeId, reactivate: i32, repeats: usize, launches: Vec<(Kernel, Vec<BufferId>)>) -> TaskId {
        self.tasks.push(Task::new(kind, node, reactivate, repeats, launches))
    }

    /// `to` waits for `from` before its first run. Missing tasks are skipped.
    fn connect(&mut self, from: Option<TaskId>, to: Option<TaskId>) {
        if let (Some(from), Some(to)) = (from, to) {
            self.tasks[from].signals.push(to);
            let to = &mut self.tasks[to];
            to.active -= 1;
            to.initial_active -= 1;
        }
    }

    /// Signal which only reactivates `to` after it ran
    fn connect_loop(&mut self, from: Option<TaskId>, to: Option<TaskId>) {
        if let (Some(from), Some(to)) = (from, to) {
            self.tasks[from].signals.push(to);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks.ids()
    }

    pub(crate) fn runnable(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.runnable.iter().copied()
    }

    pub(crate) fn has_runnable(&self) -> bool {
        !self.runnable.is_empty()
    }

    /// Tasks which still have runs left
    pub(crate) fn unfinished(&self) -> usize {
        self.tasks.values().filter(|t| t.state() != TaskState::Finished).count()
    }

    /// Total number of runs of all tasks
    pub(crate) fn total_runs(&self) -> usize {
        self.tasks.values().map(|t| t.repeats + t.times_performed).sum()
    }

    /// Records one run of task and signals its dependents
    pub(crate) fn complete(&mut self, id: TaskId) {
        let task = &mut self.tasks[id];
        debug_assert_eq!(task.state(), TaskState::Runnable, "Completing {:?} which is not runnable", task.kind);
        task.times_performed += 1;
        task.repeats = task.repeats.saturating_sub(1);
        if task.repeats > 0 {
            task.active -= task.reactivate;
        }
        if task.state() != TaskState::Runnable {
            self.runnable.remove(&id);
        }
        let signals = self.tasks[id].signals.clone();
        for to in signals {
            self.signal(to);
        }
    }

    fn signal(&mut self, id: TaskId) {
        let task = &mut self.tasks[id];
        if task.state() == TaskState::Finished {
            return;
        }
        task.active += 1;
        if task.times_performed == 0 {
            task.signals_before_first_run += 1;
        }
        if task.state() == TaskState::Runnable {
            self.runnable.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SolverParams, TaskGraph, TaskKind, TaskState};
    use crate::{
        buffers::{HostBuffers, NodeBuffers},
        hierarchy::{Hierarchy, LabelGraph, NodeId, Topology},
    };
    use std::collections::BTreeMap;

    fn build(graph: &LabelGraph, iterations: usize) -> (Topology, TaskGraph) {
        let topology = Topology::new(graph).unwrap();
        let mut host = HostBuffers::new(8);
        let mut data: BTreeMap<_, _> = topology.leaves().iter().map(|&l| (l, vec![1.0; 8])).collect();
        let nodes = NodeBuffers::allocate(&topology, &mut data, &mut BTreeMap::new(), &mut host).unwrap();
        let params = SolverParams {
            iterations,
            step_size: 0.1,
            cc: 0.25,
            extent: [2, 2, 2],
            smoothness: vec![1.0; topology.len()],
        };
        let tasks = TaskGraph::build(&topology, &nodes, &params).unwrap();
        (topology, tasks)
    }

    // Root with branch `a` of three leaves and leaf `b`
    fn three_level() -> (LabelGraph, NodeId, NodeId) {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(root);
        for _ in 0..3 {
            graph.add_child(a);
        }
        (graph, a, b)
    }

    // Runs tasks in id order until nothing is runnable
    fn drain(tasks: &mut TaskGraph) -> usize {
        let mut performed = 0;
        loop {
            let Some(id) = tasks.runnable().next() else { break };
            tasks.complete(id);
            performed += 1;
        }
        performed
    }

    #[test]
    fn iteration_activations() {
        let (graph, a, b) = three_level();
        let (topology, tasks) = build(&graph, 5);
        let root = topology.root();
        let find = |kind, node| {
            tasks.ids().find(|&id| tasks[id].kind == kind && tasks[id].node == node).map(|id| tasks[id].initial_active())
        };
        assert_eq!(find(TaskKind::ClearWorkingBuffer, root), Some(-4));
        assert_eq!(find(TaskKind::ClearWorkingBuffer, a), Some(0));
        assert_eq!(find(TaskKind::UpdateSpatialFlows, a), Some(-9));
        assert_eq!(find(TaskKind::UpdateSpatialFlows, b), Some(-7));
        assert_eq!(find(TaskKind::ApplySinkPotentialBranch, a), Some(-2));
        assert_eq!(find(TaskKind::ApplySinkPotentialLeaf, b), Some(-1));
        assert_eq!(find(TaskKind::ApplySourcePotential, a), Some(-2));
        assert_eq!(find(TaskKind::ApplySourcePotential, b), Some(-2));
        assert_eq!(find(TaskKind::DivideOutWorkingBuffer, a), Some(-4));
        assert_eq!(find(TaskKind::DivideOutWorkingBuffer, root), Some(-3));
        assert_eq!(find(TaskKind::UpdateLabels, a), Some(-2));
        assert_eq!(find(TaskKind::UpdateLabels, b), Some(-2));
        assert_eq!(find(TaskKind::CorrectLabels, b), Some(-4));
        assert_eq!(find(TaskKind::PropogateLeafFlows, root), Some(-3));
    }

    #[test]
    fn drain_finishes_every_task() {
        let (graph, ..) = three_level();
        let (_, mut tasks) = build(&graph, 4);
        let total = tasks.total_runs();
        assert_eq!(drain(&mut tasks), total);
        assert_eq!(tasks.unfinished(), 0);
        for id in tasks.ids() {
            assert_eq!(tasks[id].state(), TaskState::Finished);
        }
    }

    #[test]
    fn activation_round_trip() {
        let (graph, ..) = three_level();
        let (_, mut tasks) = build(&graph, 3);
        drain(&mut tasks);
        for id in tasks.ids() {
            let task = &tasks[id];
            assert_eq!(task.signals_before_first_run(), -task.initial_active(), "{:?} of {}", task.kind, task.node);
        }
    }

    #[test]
    fn zero_iterations_keep_initialization() {
        let (graph, a, _) = three_level();
        let (_, mut tasks) = build(&graph, 0);
        assert!(tasks.ids().all(|id| !matches!(
            tasks[id].kind,
            TaskKind::UpdateSpatialFlows | TaskKind::UpdateLabels | TaskKind::DivideOutWorkingBuffer
        )));
        // Branch label is still cleared and accumulated from its three children
        let accumulates = tasks.ids().filter(|&id| tasks[id].kind == TaskKind::AccumulateLabels).count();
        assert_eq!(accumulates, 4 + 3);
        let clears = tasks.ids().filter(|&id| tasks[id].kind == TaskKind::ClearBufferInitially && tasks[id].node == a).count();
        assert_eq!(clears, 1);
        let total = tasks.total_runs();
        assert_eq!(drain(&mut tasks), total);
    }

    #[test]
    fn single_leaf_waits_on_its_initialization() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let leaf = graph.add_child(root);
        let (_, mut tasks) = build(&graph, 2);
        let propogate: Vec<_> = tasks.ids().filter(|&id| tasks[id].kind == TaskKind::PropogateLeafFlows).collect();
        assert_eq!(propogate.len(), 2);
        for &id in &propogate {
            assert_eq!(tasks[id].initial_active(), -1);
        }
        let own = propogate.iter().find(|&&id| tasks[id].node == leaf).unwrap();
        assert!(tasks[*own].launches.is_empty());
        let total = tasks.total_runs();
        assert_eq!(drain(&mut tasks), total);
    }

    #[test]
    fn branch_labels_update_one_less_time() {
        let (graph, a, b) = three_level();
        let (_, tasks) = build(&graph, 6);
        let runs = |node| {
            tasks.ids().find(|&id| tasks[id].kind == TaskKind::UpdateLabels && tasks[id].node == node).map(|id| tasks[id].repeats)
        };
        assert_eq!(runs(a), Some(5));
        assert_eq!(runs(b), Some(6));
        let (_, tasks) = build(&graph, 1);
        assert!(!tasks.ids().any(|id| tasks[id].kind == TaskKind::UpdateLabels && tasks[id].node == a));
    }
}
