//! Segments a synthetic volume split into slabs along x, each slab owned by one leaf.

use clap::Parser;
use hmseg::{DeviceContext, HierarchicalMaxFlow, Hierarchy, IterationReport, LabelGraph, NodeId, SegError};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Volume extent as x y z
    #[arg(long, num_args = 3, default_values_t = [32, 32, 8])]
    extent: Vec<usize>,

    /// Leaves below every group
    #[arg(long, short = 'l', default_value_t = 2)]
    leaves: usize,

    /// Branches below the root, zero puts leaves directly below the root
    #[arg(long, short = 'g', default_value_t = 2)]
    groups: usize,

    /// Iterations, overrides the device config
    #[arg(long, short = 'n')]
    iterations: Option<usize>,

    #[arg(long, default_value_t = 0.5)]
    smoothness: f32,

    /// Amplitude of uniform noise added to data terms
    #[arg(long, default_value_t = 0.3)]
    noise: f32,

    /// Devices to run on
    #[arg(long, short = 'd', num_args = 1.., default_values_t = [0])]
    devices: Vec<usize>,

    /// Fraction of free device memory to use
    #[arg(long)]
    max_gpu_usage: Option<f32>,

    /// Seed for both the synthetic volume and the scheduler
    #[arg(long, default_value_t = 299792458)]
    seed: u64,

    /// Solve on the host without the scheduler and print per iteration diagnostics
    #[arg(long)]
    sequential: bool,
}

fn build_hierarchy(groups: usize, leaves: usize) -> (LabelGraph, Vec<NodeId>) {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let mut all = Vec::new();
    if groups == 0 {
        all.extend((0..leaves).map(|_| graph.add_child(root)));
    } else {
        for _ in 0..groups {
            let group = graph.add_child(root);
            all.extend((0..leaves).map(|_| graph.add_child(group)));
        }
    }
    (graph, all)
}

fn main() -> Result<(), SegError> {
    let args = Args::parse();
    let [x, y, z] = args.extent[..] else {
        return Err(SegError::input_error("Extent needs exactly three values"));
    };
    let extent = [x, y, z];
    let (graph, leaves) = build_hierarchy(args.groups, args.leaves);
    if leaves.is_empty() {
        return Err(SegError::input_error("Hierarchy has no leaves"));
    }

    // Ground truth owner of every voxel
    let volume = x * y * z;
    let truth: Vec<usize> = (0..volume).map(|i| (i % x) * leaves.len() / x).collect();
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut seg = HierarchicalMaxFlow::new(&graph, extent)?;
    for (k, &leaf) in leaves.iter().enumerate() {
        let data = truth
            .iter()
            .map(|&t| {
                let cost = if t == k { 0.0 } else { 1.0 };
                cost + rng.gen_range(0.0..=args.noise.max(0.0))
            })
            .collect();
        seg.set_data_term(leaf, data)?;
    }
    for node in (1..graph.number_of_nodes()).map(NodeId::from) {
        seg.set_smoothness_scalar(node, args.smoothness)?;
    }

    let mut ctx = DeviceContext::new()?;
    seg.configure(ctx.solver_config());
    seg.set_seed(args.seed);
    if let Some(iterations) = args.iterations {
        seg.set_iterations(iterations);
    }
    if let Some(usage) = args.max_gpu_usage {
        seg.set_max_gpu_usage(usage, None);
    }
    seg.clear_devices();
    for &device in &args.devices {
        seg.add_device(device);
    }
    for (i, info) in ctx.devices().enumerate() {
        println!("Device {i}: {} with {} B", info.name, info.memory_bytes);
    }

    let begin = std::time::Instant::now();
    if args.sequential {
        let mut observer = |report: &IterationReport| {
            println!(
                "Iteration {:>4}: primal {:.6}, label discrepancy {:.4}%, source discrepancy {:.4}%",
                report.iteration, report.primal, report.discrepancy, report.source_discrepancy
            );
        };
        seg.run_sequential(Some(&mut observer))?;
    } else {
        seg.run(&mut ctx)?;
        if let Some(stats) = seg.last_run_stats() {
            println!("Performed {} tasks with {} memory transfers", stats.tasks_performed, stats.memcpies);
            for w in &stats.workers {
                println!("  device {}: {} slots, at most {} resident, {} transfers", w.device, w.capacity, w.max_resident, w.memcpies);
            }
        }
    }
    println!("Solved {} iterations in {:.3}s", seg.iterations(), begin.elapsed().as_secs_f64());

    let mut correct = 0;
    for (i, &t) in truth.iter().enumerate() {
        let best = leaves
            .iter()
            .enumerate()
            .map(|(k, &leaf)| (k, seg.label(leaf).map_or(0.0, |l| l[i])))
            .fold((0, f32::MIN), |best, (k, v)| if v > best.1 { (k, v) } else { best });
        if best.0 == t {
            correct += 1;
        }
    }
    for &leaf in &leaves {
        if let Some(label) = seg.label(leaf) {
            let mean = label.iter().sum::<f32>() / volume as f32;
            println!("Leaf {leaf}: mean label {mean:.4}");
        }
    }
    println!("{correct} of {volume} voxels assigned to their true leaf");
    Ok(())
}
