//! Hierarchical max-flow segmentation, the public entry point.

use crate::{
    buffers::{HostBuffers, NodeBuffers},
    error::SegError,
    hierarchy::{Hierarchy, NodeId, Role, Topology},
    priority::BufferPriorities,
    runtime::{DeviceContext, SEED},
    scheduler::{drain, RunStats},
    sequential::{solve, IterationObserver},
    task::{SolverParams, TaskGraph},
    worker::{Worker, WorkerId},
};
use nanoserde::DeJson;
use rand::{rngs::SmallRng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};

const DEFAULT_ITERATIONS: usize = 100;
const DEFAULT_STEP_SIZE: f32 = 0.1;
const DEFAULT_CC: f32 = 0.25;
const DEFAULT_MAX_GPU_USAGE: f32 = 0.75;
const DEFAULT_REPORT_RATE: usize = 100;

/// Solver section of device config, unset values keep their defaults
#[derive(DeJson, Debug, Default, Clone, PartialEq)]
pub struct SolverConfig {
    pub iterations: Option<usize>,
    pub step_size: Option<f32>,
    pub cc: Option<f32>,
    /// Fraction of free device memory used for buffer slots
    pub max_gpu_usage: Option<f32>,
    /// Tasks between scheduler progress reports
    pub report_rate: Option<usize>,
    pub seed: Option<u64>,
}

/// Multi-label segmentation over a hierarchy of labels.
///
/// Leaves carry data terms, which are costs: at every voxel the label with the
/// lowest cost starts as the winner. Every non-root node may carry a smoothness
/// term volume and a smoothness scalar which together limit spatial flow.
///
/// ```no_run
/// use hmseg::{DeviceContext, HierarchicalMaxFlow, Hierarchy, LabelGraph};
/// # fn main() -> Result<(), hmseg::SegError> {
/// let mut graph = LabelGraph::new();
/// let root = graph.root();
/// let background = graph.add_child(root);
/// let object = graph.add_child(root);
/// let mut seg = HierarchicalMaxFlow::new(&graph, [2, 1, 1])?;
/// seg.set_data_term(background, vec![0.0, 1.0])?;
/// seg.set_data_term(object, vec![1.0, 0.0])?;
/// let mut ctx = DeviceContext::new()?;
/// seg.run(&mut ctx)?;
/// println!("{:?}", seg.label(object));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HierarchicalMaxFlow {
    topology: Topology,
    extent: [usize; 3],
    data_terms: BTreeMap<NodeId, Vec<f32>>,
    smoothness_terms: BTreeMap<NodeId, Vec<f32>>,
    smoothness_scalars: BTreeMap<NodeId, f32>,
    devices: BTreeSet<usize>,
    max_gpu_usage: f32,
    gpu_usage_overrides: BTreeMap<usize, f32>,
    iterations: usize,
    step_size: f32,
    cc: f32,
    report_rate: usize,
    seed: Option<u64>,
    labels: BTreeMap<NodeId, Vec<f32>>,
    last_error: Option<SegError>,
    last_stats: Option<RunStats>,
}

impl HierarchicalMaxFlow {
    /// Segmentation of volume with given extent over hierarchy.
    /// # Errors
    /// Returns error if hierarchy is not a rooted tree or DAG, or if extent is empty.
    pub fn new(hierarchy: &impl Hierarchy, extent: [usize; 3]) -> Result<HierarchicalMaxFlow, SegError> {
        let topology = Topology::new(hierarchy)?;
        if extent.iter().any(|&x| x == 0) {
            return Err(SegError::input_error(format!("Extent {extent:?} is empty")));
        }
        Ok(HierarchicalMaxFlow {
            topology,
            extent,
            data_terms: BTreeMap::new(),
            smoothness_terms: BTreeMap::new(),
            smoothness_scalars: BTreeMap::new(),
            devices: BTreeSet::from([0]),
            max_gpu_usage: DEFAULT_MAX_GPU_USAGE,
            gpu_usage_overrides: BTreeMap::new(),
            iterations: DEFAULT_ITERATIONS,
            step_size: DEFAULT_STEP_SIZE,
            cc: DEFAULT_CC,
            report_rate: DEFAULT_REPORT_RATE,
            seed: None,
            labels: BTreeMap::new(),
            last_error: None,
            last_stats: None,
        })
    }

    /// Number of voxels
    #[must_use]
    pub const fn volume(&self) -> usize {
        self.extent[0] * self.extent[1] * self.extent[2]
    }

    #[must_use]
    pub const fn extent(&self) -> [usize; 3] {
        self.extent
    }

    pub fn add_device(&mut self, device: usize) {
        self.devices.insert(device);
    }

    pub fn remove_device(&mut self, device: usize) {
        self.devices.remove(&device);
    }

    #[must_use]
    pub fn has_device(&self, device: usize) -> bool {
        self.devices.contains(&device)
    }

    /// Deselects all devices, at least one must be added before the next run
    pub fn clear_devices(&mut self) {
        self.devices.clear();
    }

    pub fn devices(&self) -> impl Iterator<Item = usize> + '_ {
        self.devices.iter().copied()
    }

    /// Sets fraction of free device memory used for buffer slots, clamped to `[0, 1]`.
    /// With `None` sets the value for all devices without an override.
    pub fn set_max_gpu_usage(&mut self, usage: f32, device: Option<usize>) {
        let usage = if usage.is_nan() { 0.0 } else { usage.clamp(0.0, 1.0) };
        if let Some(device) = device {
            self.gpu_usage_overrides.insert(device, usage);
        } else {
            self.max_gpu_usage = usage;
        }
    }

    /// Usage override of device, or the global usage
    #[must_use]
    pub fn max_gpu_usage(&self, device: usize) -> f32 {
        self.gpu_usage_overrides.get(&device).copied().unwrap_or(self.max_gpu_usage)
    }

    /// Drops all per device overrides
    pub fn clear_max_gpu_usage(&mut self) {
        self.gpu_usage_overrides.clear();
    }

    pub fn set_iterations(&mut self, iterations: usize) {
        self.iterations = iterations;
    }

    #[must_use]
    pub const fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn set_step_size(&mut self, step_size: f32) {
        self.step_size = step_size;
    }

    #[must_use]
    pub const fn step_size(&self) -> f32 {
        self.step_size
    }

    pub fn set_cc(&mut self, cc: f32) {
        self.cc = cc;
    }

    #[must_use]
    pub const fn cc(&self) -> f32 {
        self.cc
    }

    /// Tasks between progress reports, zero disables them
    pub fn set_report_rate(&mut self, report_rate: usize) {
        self.report_rate = report_rate;
    }

    /// Seed for scheduler tie breaking, overrides seed of device context
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    /// Applies values set in config
    pub fn configure(&mut self, config: &SolverConfig) {
        if let Some(iterations) = config.iterations {
            self.iterations = iterations;
        }
        if let Some(step_size) = config.step_size {
            self.step_size = step_size;
        }
        if let Some(cc) = config.cc {
            self.cc = cc;
        }
        if let Some(usage) = config.max_gpu_usage {
            self.set_max_gpu_usage(usage, None);
        }
        if let Some(report_rate) = config.report_rate {
            self.report_rate = report_rate;
        }
        if let Some(seed) = config.seed {
            self.seed = Some(seed);
        }
    }

    /// Sets cost of assigning each voxel to leaf.
    /// # Errors
    /// Returns error if node is not a leaf, if data has wrong length,
    /// or if some value is negative or not finite.
    pub fn set_data_term(&mut self, leaf: NodeId, data: Vec<f32>) -> Result<(), SegError> {
        self.check_node(leaf)?;
        if !self.topology.is_leaf(leaf) {
            return Err(SegError::input_error(format!("Data term can only be set on leaves, {leaf} is not a leaf")));
        }
        self.check_volume(leaf, &data)?;
        self.data_terms.insert(leaf, data);
        Ok(())
    }

    /// Sets voxelwise multiplier of the smoothness scalar of node.
    /// # Errors
    /// Returns error if node is the root, if smoothness has wrong length,
    /// or if some value is negative or not finite.
    pub fn set_smoothness_term(&mut self, node: NodeId, smoothness: Vec<f32>) -> Result<(), SegError> {
        self.check_node(node)?;
        if node == self.topology.root() {
            return Err(SegError::input_error("Root has no smoothness term"));
        }
        self.check_volume(node, &smoothness)?;
        self.smoothness_terms.insert(node, smoothness);
        Ok(())
    }

    /// Sets smoothness scalar of node, default is 1.
    /// # Errors
    /// Returns error if value is negative or not finite.
    pub fn set_smoothness_scalar(&mut self, node: NodeId, value: f32) -> Result<(), SegError> {
        self.check_node(node)?;
        if !value.is_finite() || value < 0.0 {
            return Err(SegError::input_error(format!("Smoothness scalar {value} of {node} must be non-negative")));
        }
        self.smoothness_scalars.insert(node, value);
        Ok(())
    }

    #[must_use]
    pub fn smoothness_scalar(&self, node: NodeId) -> f32 {
        self.smoothness_scalars.get(&node).copied().unwrap_or(1.0)
    }

    fn check_node(&self, node: NodeId) -> Result<(), SegError> {
        if usize::from(node) >= self.topology.len() {
            return Err(SegError::input_error(format!("{node} is not a node of the hierarchy")));
        }
        Ok(())
    }

    fn check_volume(&self, node: NodeId, values: &[f32]) -> Result<(), SegError> {
        if values.len() != self.volume() {
            return Err(SegError::input_error(format!(
                "Volume of {node} has {} voxels, extent {:?} has {}",
                values.len(),
                self.extent,
                self.volume()
            )));
        }
        if let Some(x) = values.iter().find(|x| !x.is_finite() || **x < 0.0) {
            return Err(SegError::input_error(format!("Volume of {node} contains {x}, values must be non-negative")));
        }
        Ok(())
    }

    fn params(&self) -> Result<SolverParams, SegError> {
        if !(self.cc > 0.0) || !self.cc.is_finite() {
            return Err(SegError::input_error(format!("CC {} must be positive", self.cc)));
        }
        if !(self.step_size > 0.0) || !self.step_size.is_finite() {
            return Err(SegError::input_error(format!("Step size {} must be positive", self.step_size)));
        }
        if let Some(leaf) = self.topology.leaves().iter().find(|l| !self.data_terms.contains_key(l)) {
            return Err(SegError::input_error(format!("Leaf {leaf} has no data term")));
        }
        let smoothness = (0..self.topology.len()).map(|i| self.smoothness_scalar(NodeId::from(i))).collect();
        Ok(SolverParams {
            iterations: self.iterations,
            step_size: self.step_size,
            cc: self.cc,
            extent: self.extent,
            smoothness,
        })
    }

    /// Runs task scheduled solver on selected devices of context.
    /// Only tree hierarchies can be scheduled, use [`HierarchicalMaxFlow::run_sequential`] for DAGs.
    /// # Errors
    /// Returns error if inputs are incomplete, if selected devices are missing
    /// or can not fit the buffers of a task, or if device fails.
    pub fn run(&mut self, ctx: &mut DeviceContext) -> Result<(), SegError> {
        let params = self.params()?;
        if !self.topology.is_tree() {
            return Err(SegError::hierarchy_error("Scheduled solver requires a tree hierarchy, use run_sequential"));
        }
        let debug = ctx.debug();
        let seed = self.seed.or(ctx.seed()).unwrap_or(SEED);
        let topology = &self.topology;

        let mut host = HostBuffers::new(self.volume());
        let mut data = self.data_terms.clone();
        let mut smoothness = self.smoothness_terms.clone();
        let nodes = NodeBuffers::allocate(topology, &mut data, &mut smoothness, &mut host)?;
        let priorities = BufferPriorities::new(topology, &nodes);
        let mut tasks = TaskGraph::build(topology, &nodes, &params)?;
        if debug.sched() {
            println!("Built {} tasks over {} buffers with {} runs", tasks.len(), host.len(), tasks.total_runs());
        }

        let ids: Vec<usize> = self.devices.iter().copied().collect();
        let usage: Vec<f32> = ids.iter().map(|&d| self.max_gpu_usage(d)).collect();
        let mut workers = Vec::with_capacity(ids.len());
        for (i, ((device_id, device, pool), usage)) in ctx.select_mut(&ids)?.into_iter().zip(usage).enumerate() {
            workers.push(Worker::new(WorkerId::from(i), device_id, device, pool, usage, &host, debug)?);
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let stats = drain(&mut tasks, &mut workers, &mut host, &priorities, &mut rng, self.report_rate, debug)?;
        drop(workers);

        let mut labels = BTreeMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if let Some(label) = node.label() {
                let label = host.take(label).ok_or_else(|| SegError::internal("Label buffer was released"))?;
                labels.insert(NodeId::from(i), label);
            }
        }
        self.labels = labels;
        self.last_stats = Some(stats);
        Ok(())
    }

    /// Runs solver and returns 1 on success and -1 on failure.
    /// The error is kept in [`HierarchicalMaxFlow::last_error`].
    pub fn update(&mut self, ctx: &mut DeviceContext) -> i32 {
        match self.run(ctx) {
            Ok(()) => {
                self.last_error = None;
                1
            }
            Err(e) => {
                if ctx.debug().dev() {
                    println!("Segmentation failed, {e}");
                }
                self.last_error = Some(e);
                -1
            }
        }
    }

    /// Solves on the host in a fixed order, supports DAG hierarchies with weighted edges.
    /// # Errors
    /// Returns error if inputs are incomplete.
    pub fn run_sequential(&mut self, observer: Option<&mut dyn IterationObserver>) -> Result<(), SegError> {
        let params = self.params()?;
        self.labels = solve(&self.topology, &self.data_terms, &self.smoothness_terms, &params, self.volume(), observer);
        self.last_stats = None;
        Ok(())
    }

    /// Label volume of a non-root node from the last successful run
    #[must_use]
    pub fn label(&self, node: NodeId) -> Option<&[f32]> {
        self.labels.get(&node).map(Vec::as_slice)
    }

    /// Leaves of the hierarchy in ascending order
    #[must_use]
    pub fn leaves(&self) -> &[NodeId] {
        self.topology.leaves()
    }

    /// Error of the last failed [`HierarchicalMaxFlow::update`]
    #[must_use]
    pub const fn last_error(&self) -> Option<&SegError> {
        self.last_error.as_ref()
    }

    /// Scheduler statistics of the last [`HierarchicalMaxFlow::run`]
    #[must_use]
    pub const fn last_run_stats(&self) -> Option<&RunStats> {
        self.last_stats.as_ref()
    }

    #[must_use]
    pub fn is_tree(&self) -> bool {
        self.topology.is_tree()
    }

    /// Node with both a parent and children
    #[must_use]
    pub fn is_branch(&self, node: NodeId) -> bool {
        usize::from(node) < self.topology.len() && self.topology.role(node) == Role::Branch
    }
}

#[cfg(test)]
mod tests {
    use super::{HierarchicalMaxFlow, SolverConfig};
    use crate::{
        error::SegError,
        hierarchy::{Hierarchy, LabelGraph},
    };

    #[test]
    fn usage_is_clamped_and_overridden() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        graph.add_child(root);
        let mut seg = HierarchicalMaxFlow::new(&graph, [1, 1, 1]).unwrap();
        assert_eq!(seg.max_gpu_usage(3), 0.75);
        seg.set_max_gpu_usage(1.5, None);
        seg.set_max_gpu_usage(-1.0, Some(2));
        assert_eq!(seg.max_gpu_usage(0), 1.0);
        assert_eq!(seg.max_gpu_usage(2), 0.0);
        seg.clear_max_gpu_usage();
        assert_eq!(seg.max_gpu_usage(2), 1.0);
    }

    #[test]
    fn configure_keeps_unset_values() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        graph.add_child(root);
        let mut seg = HierarchicalMaxFlow::new(&graph, [1, 1, 1]).unwrap();
        seg.configure(&SolverConfig { iterations: Some(3), cc: Some(0.5), ..SolverConfig::default() });
        assert_eq!(seg.iterations(), 3);
        assert_eq!(seg.cc(), 0.5);
        assert_eq!(seg.step_size(), 0.1);
    }

    #[test]
    fn data_term_only_on_leaves() {
        let mut graph = LabelGraph::new();
        let root = graph.root();
        let a = graph.add_child(root);
        let b = graph.add_child(a);
        let mut seg = HierarchicalMaxFlow::new(&graph, [2, 1, 1]).unwrap();
        assert!(matches!(seg.set_data_term(a, vec![0.0; 2]), Err(SegError::InputError(_))));
        assert!(matches!(seg.set_data_term(b, vec![0.0; 3]), Err(SegError::InputError(_))));
        assert!(matches!(seg.set_data_term(b, vec![0.0, -1.0]), Err(SegError::InputError(_))));
        assert!(seg.set_data_term(b, vec![0.0, 1.0]).is_ok());
        assert!(seg.is_branch(a));
    }
}
