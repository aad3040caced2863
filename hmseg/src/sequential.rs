//! Sequential solver for label DAGs.
//!
//! Runs the same kernels as the scheduled engine, but on the host in one fixed order
//! and with weighted edges. A node with several parents receives the weighted mean of
//! their sinks as its source and pushes its flow back to each parent scaled by the
//! same weight.
//!
//! Sources are fixed at the start of every iteration, while the scheduled engine updates
//! labels against parent sinks written in the same iteration. Both reach the same labels once
//! converged, but intermediate iterations of deep trees can differ by a few hundredths.

use crate::{
    hierarchy::{NodeId, Role, Topology},
    kernels::{
        apply_step, constrain, div, div_and_store, fill, flow_magnitude, gradient_step, label, leaf_sink, min, project,
        store_sink_flow, store_source_flow, sum, sum_scaled, update_label,
    },
    task::SolverParams,
};
use std::collections::BTreeMap;

/// Convergence diagnostics after initialization (iteration 0) and after every iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    /// Mean source flow
    pub primal: f64,
    /// Mean squared flow conservation error of each non-root node
    pub conservation: Vec<(NodeId, f64)>,
    /// Mean absolute deviation of summed leaf labels from one, in percent
    pub discrepancy: f64,
    /// Deviation of weighted children labels of the root from one, in percent
    pub source_discrepancy: f64,
    /// Deviation of each branch label from its weighted children labels, in percent
    pub branch_discrepancy: Vec<(NodeId, f64)>,
    /// Mean label of each non-root node, in percent
    pub label_means: Vec<(NodeId, f64)>,
}

/// Receives a report after every iteration of the sequential solver
pub trait IterationObserver {
    fn observe(&mut self, report: &IterationReport);
}

impl<F: FnMut(&IterationReport)> IterationObserver for F {
    fn observe(&mut self, report: &IterationReport) {
        self(report);
    }
}

#[derive(Debug, Default)]
struct NodeState {
    label: Vec<f32>,
    div: Vec<f32>,
    flows: [Vec<f32>; 3],
    // Source flow for the root
    sink: Vec<f32>,
    source: Vec<f32>,
    // Source working buffer for the root, empty for leaves
    working: Vec<f32>,
}

struct Solver<'a> {
    topology: &'a Topology,
    data: &'a BTreeMap<NodeId, Vec<f32>>,
    smoothness: &'a BTreeMap<NodeId, Vec<f32>>,
    params: &'a SolverParams,
    states: Vec<NodeState>,
    volume: usize,
}

/// Solves the segmentation and returns labels of every non-root node.
/// Data terms must be validated by the caller.
pub(crate) fn solve(
    topology: &Topology,
    data: &BTreeMap<NodeId, Vec<f32>>,
    smoothness: &BTreeMap<NodeId, Vec<f32>>,
    params: &SolverParams,
    volume: usize,
    mut observer: Option<&mut dyn IterationObserver>,
) -> BTreeMap<NodeId, Vec<f32>> {
    let mut solver = Solver { topology, data, smoothness, params, states: Vec::new(), volume };
    solver.initialize();
    if let Some(observer) = observer.as_deref_mut() {
        observer.observe(&solver.report(0));
    }
    for iteration in 1..=params.iterations {
        solver.iterate();
        if let Some(observer) = observer.as_deref_mut() {
            observer.observe(&solver.report(iteration));
        }
    }
    let root = topology.root();
    solver
        .states
        .into_iter()
        .enumerate()
        .map(|(i, state)| (NodeId::from(i), state.label))
        .filter(|&(id, _)| id != root)
        .collect()
}

impl Solver<'_> {
    fn state(&self, node: NodeId) -> &NodeState {
        &self.states[usize::from(node)]
    }

    fn state_mut(&mut self, node: NodeId) -> &mut NodeState {
        &mut self.states[usize::from(node)]
    }

    // Edge weight divided by the child's summed incoming weights
    fn multiplicity(&self, child: NodeId, weight: f32) -> f32 {
        weight / self.topology.num_parents(child)
    }

    fn initialize(&mut self) {
        let topology = self.topology;
        let n = self.volume;
        self.states = (0..topology.len())
            .map(|_| NodeState {
                label: vec![0.0; n],
                div: vec![0.0; n],
                flows: [vec![0.0; n], vec![0.0; n], vec![0.0; n]],
                sink: vec![0.0; n],
                source: vec![0.0; n],
                working: Vec::new(),
            })
            .collect();
        for &id in topology.forward() {
            if topology.role(id) != Role::Leaf {
                self.state_mut(id).working = vec![0.0; n];
            }
        }

        // Smallest data term over all leaves
        let leaves = topology.leaves();
        let mut sink0 = vec![f32::INFINITY; n];
        for leaf in leaves {
            if let Some(data) = self.data.get(leaf) {
                min(&mut sink0, data);
            }
        }

        // Leaves whose data term is the smallest share the voxel
        let mut total = vec![0.0; n];
        for &leaf in leaves {
            let Some(data) = self.data.get(&leaf) else { continue };
            let state = &mut self.states[usize::from(leaf)];
            label(&mut state.label, &sink0, data);
            sum(&mut total, &state.label);
        }
        for &leaf in leaves {
            div(&mut self.states[usize::from(leaf)].label, &total);
        }

        for state in &mut self.states {
            state.sink.copy_from_slice(&sink0);
            state.source.copy_from_slice(&sink0);
        }
        self.propogate_labels();
    }

    // Branch labels are weighted sums of their children's labels
    fn propogate_labels(&mut self) {
        let topology = self.topology;
        for id in topology.backward() {
            if topology.role(id) != Role::Branch {
                continue;
            }
            let mut branch_label = std::mem::take(&mut self.state_mut(id).label);
            fill(&mut branch_label, 0.0);
            for &(child, weight) in topology.weighted_children(id) {
                sum_scaled(&mut branch_label, &self.state(child).label, self.multiplicity(child, weight));
            }
            self.state_mut(id).label = branch_label;
        }
    }

    fn iterate(&mut self) {
        let topology = self.topology;
        let params = self.params;
        let root = topology.root();
        let cc = params.cc;

        // Spatial flows, order independent
        for &id in topology.forward() {
            if id == root {
                continue;
            }
            let alpha = params.smoothness[usize::from(id)];
            let smoothness = self.smoothness.get(&id).map(Vec::as_slice);
            let state = &mut self.states[usize::from(id)];
            gradient_step(&mut state.div, &state.sink, &state.source, &state.label, params.step_size, cc);
            let [fx, fy, fz] = &mut state.flows;
            apply_step([fx.as_mut_slice(), fy.as_mut_slice(), fz.as_mut_slice()], &state.div, params.extent);
            flow_magnitude(&mut state.div, [fx.as_slice(), fy.as_slice(), fz.as_slice()], smoothness, alpha, params.extent);
            project(&mut state.div, [fx.as_mut_slice(), fy.as_mut_slice(), fz.as_mut_slice()], params.extent);
        }

        // Sources are weighted sums of parents' sinks
        for &id in topology.forward() {
            if id == root {
                continue;
            }
            let mut source = std::mem::take(&mut self.state_mut(id).source);
            fill(&mut source, 0.0);
            for &(parent, weight) in topology.weighted_parents(id) {
                sum_scaled(&mut source, &self.state(parent).sink, self.multiplicity(id, weight));
            }
            self.state_mut(id).source = source;
        }

        // Working buffers
        fill(&mut self.state_mut(root).working, 1.0 / cc);
        for &id in topology.branches() {
            let state = &mut self.states[usize::from(id)];
            store_sink_flow(&mut state.working, &state.source, &state.div, &state.label, cc);
        }

        // Sinks and labels, children first
        for id in topology.backward() {
            match topology.role(id) {
                Role::Root => {
                    let state = &mut self.states[usize::from(id)];
                    div_and_store(&mut state.sink, &state.working, topology.weighted_num_children(id));
                }
                role => {
                    {
                        let state = &mut self.states[usize::from(id)];
                        if role == Role::Leaf {
                            leaf_sink(&mut state.sink, &state.source, &state.div, &state.label, cc);
                            if let Some(data) = self.data.get(&id) {
                                constrain(&mut state.sink, data);
                            }
                        } else {
                            div_and_store(&mut state.sink, &state.working, topology.weighted_num_children(id) + 1.0);
                        }
                    }
                    self.push_to_parents(id);
                    let state = &mut self.states[usize::from(id)];
                    update_label(&mut state.label, &state.sink, &state.source, &state.div, cc);
                }
            }
        }
    }

    // Adds flow leaving node into working buffers of its parents
    fn push_to_parents(&mut self, id: NodeId) {
        let cc = self.params.cc;
        let topology = self.topology;
        for &(parent, weight) in topology.weighted_parents(id) {
            let multiplicity = self.multiplicity(id, weight);
            let mut working = std::mem::take(&mut self.state_mut(parent).working);
            let child = self.state(id);
            store_source_flow(
                &mut working,
                &child.sink,
                &child.div,
                &child.label,
                &child.source,
                &self.state(parent).sink,
                cc,
                multiplicity,
            );
            self.state_mut(parent).working = working;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn report(&self, iteration: usize) -> IterationReport {
        let topology = self.topology;
        let root = topology.root();
        let n = self.volume as f64;
        let mean = |x: &[f32]| x.iter().map(|&v| f64::from(v)).sum::<f64>() / n;

        let mut conservation = Vec::new();
        let mut label_means = Vec::new();
        for &id in topology.forward() {
            if id == root {
                continue;
            }
            let state = self.state(id);
            let mut error: Vec<f64> = state.sink.iter().zip(&state.div).map(|(&s, &d)| f64::from(s + d)).collect();
            for &(parent, weight) in topology.weighted_parents(id) {
                let m = f64::from(self.multiplicity(id, weight));
                for (e, &p) in error.iter_mut().zip(&self.state(parent).sink) {
                    *e -= m * f64::from(p);
                }
            }
            conservation.push((id, error.iter().map(|e| e * e).sum::<f64>() / n));
            label_means.push((id, 100.0 * mean(&state.label)));
        }

        let mut total = vec![1.0f64; self.volume];
        for &leaf in topology.leaves() {
            for (t, &l) in total.iter_mut().zip(&self.state(leaf).label) {
                *t -= f64::from(l);
            }
        }
        let discrepancy = 100.0 * total.iter().map(|t| t.abs()).sum::<f64>() / n;

        // Label of a node minus weighted labels of its children
        let children_discrepancy = |id: NodeId, own: Option<&[f32]>| {
            let mut rest: Vec<f64> = own.map_or_else(|| vec![1.0; self.volume], |x| x.iter().map(|&v| f64::from(v)).collect());
            for &(child, weight) in topology.weighted_children(id) {
                let m = f64::from(self.multiplicity(child, weight));
                for (r, &l) in rest.iter_mut().zip(&self.state(child).label) {
                    *r -= m * f64::from(l);
                }
            }
            100.0 * rest.iter().map(|r| r.abs()).sum::<f64>() / n
        };
        let source_discrepancy = children_discrepancy(root, None);
        let branch_discrepancy = topology
            .branches()
            .iter()
            .map(|&id| (id, children_discrepancy(id, Some(&self.state(id).label))))
            .collect();

        IterationReport {
            iteration,
            primal: mean(&self.state(root).sink),
            conservation,
            discrepancy,
            source_discrepancy,
            branch_discrepancy,
            label_means,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{solve, IterationReport};
    use crate::{
        hierarchy::{Hierarchy, LabelGraph, Topology},
        task::SolverParams,
    };
    use std::collections::BTreeMap;

    fn params(topology: &Topology, iterations: usize, extent: [usize; 3]) -> SolverParams {
        SolverParams { iterations, step_size: 0.1, cc: 0.25, extent, smoothness: vec![0.1; topology.len()] }
    }

    #[test]
    fn initial_labels_pick_cheapest_leaf() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(root);
        let topology = Topology::new(&graph).unwrap();
        let data = BTreeMap::from([(a, vec![0.0, 1.0, 0.5]), (b, vec![1.0, 0.0, 0.5])]);
        let labels = solve(&topology, &data, &BTreeMap::new(), &params(&topology, 0, [3, 1, 1]), 3, None);
        assert_eq!(labels[&a], [1.0, 0.0, 0.5]);
        assert_eq!(labels[&b], [0.0, 1.0, 0.5]);
    }

    #[test]
    fn dag_reports_every_iteration() {
        // Leaf c is shared by both branches
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(root);
        let a1 = graph.add_child(a);
        let c = graph.add_child(a);
        let b1 = graph.add_child(b);
        graph.add_edge(b, c, 1.0).unwrap();
        let topology = Topology::new(&graph).unwrap();
        let volume = 8;
        let data = BTreeMap::from([
            (a1, vec![0.1, 0.9, 0.9, 0.9, 0.1, 0.9, 0.9, 0.9]),
            (c, vec![0.9, 0.1, 0.9, 0.9, 0.9, 0.1, 0.9, 0.9]),
            (b1, vec![0.9, 0.9, 0.1, 0.1, 0.9, 0.9, 0.1, 0.1]),
        ]);
        let mut reports: Vec<IterationReport> = Vec::new();
        let mut observer = |report: &IterationReport| reports.push(report.clone());
        let labels =
            solve(&topology, &data, &BTreeMap::new(), &params(&topology, 5, [2, 2, 2]), volume, Some(&mut observer));
        assert_eq!(reports.len(), 6);
        assert_eq!(reports[0].iteration, 0);
        assert!(reports[0].discrepancy < 1e-3);
        assert_eq!(reports[5].conservation.len(), 5);
        assert_eq!(reports[5].branch_discrepancy.len(), 2);
        assert_eq!(labels.len(), 5);
        for label in labels.values() {
            assert!(label.iter().all(|&x| (0.0..=1.0).contains(&x)));
        }
    }
}
