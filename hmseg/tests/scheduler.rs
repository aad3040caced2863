use hmseg::{DeviceContext, HierarchicalMaxFlow, Hierarchy, LabelGraph, NodeId, SegError};
use itertools::iproduct;

const EXTENT: [usize; 3] = [4, 2, 2];
// One buffer of the extent above
const SLOT: usize = 16 * 4;

// root -> {a, b, c}, c -> {c1, c2}, c2 -> {d1, d2}
fn deep() -> (LabelGraph, Vec<NodeId>, Vec<NodeId>) {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let a = graph.add_child(root);
    let b = graph.add_child(root);
    let c = graph.add_child(root);
    let c1 = graph.add_child(c);
    let c2 = graph.add_child(c);
    let d1 = graph.add_child(c2);
    let d2 = graph.add_child(c2);
    (graph, vec![a, b, c1, d1, d2], vec![a, b, c, c1, c2, d1, d2])
}

fn segmentation(iterations: usize) -> Result<HierarchicalMaxFlow, SegError> {
    let (graph, leaves, nodes) = deep();
    let mut seg = HierarchicalMaxFlow::new(&graph, EXTENT)?;
    let volume = seg.volume();
    for (k, &leaf) in leaves.iter().enumerate() {
        // Voxel i is won by leaf i % 5, rows of x are split between winners
        let cost = (0..volume).map(|i| if i % leaves.len() == k { 0.0 } else { 1.0 }).collect();
        seg.set_data_term(leaf, cost)?;
    }
    for node in nodes {
        seg.set_smoothness_scalar(node, 0.1)?;
    }
    seg.set_iterations(iterations);
    seg.set_report_rate(0);
    Ok(seg)
}

fn labels(seg: &HierarchicalMaxFlow) -> Vec<Vec<f32>> {
    let (_, _, nodes) = deep();
    nodes.iter().map(|&n| seg.label(n).map(<[f32]>::to_vec).unwrap_or_default()).collect()
}

fn same(x: &[Vec<f32>], y: &[Vec<f32>]) {
    assert_eq!(x.len(), y.len());
    for (node, (x, y)) in x.iter().zip(y).enumerate() {
        assert_eq!(x.len(), y.len());
        for (a, b) in x.iter().zip(y) {
            assert!((a - b).abs() <= 1e-3, "node {node}: {a} != {b}");
        }
    }
}

#[test]
fn small_memory_gives_same_labels() -> Result<(), SegError> {
    let mut seg = segmentation(6)?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;
    let expected = labels(&seg);
    let large = seg.last_run_stats().unwrap().clone();
    assert_eq!(large.unfinished_tasks, 0);

    let mut ctx = DeviceContext::host(1, 8 * SLOT)?;
    seg.set_max_gpu_usage(1.0, None);
    seg.run(&mut ctx)?;
    same(&labels(&seg), &expected);
    let small = seg.last_run_stats().unwrap();
    assert_eq!(small.workers[0].capacity, 8);
    assert!(small.workers[0].max_resident <= 8);
    assert!(small.memcpies > large.memcpies);
    assert_eq!(small.tasks_performed, large.tasks_performed);
    assert_eq!(small.activation_mismatches, 0);
    Ok(())
}

#[test]
fn two_workers_give_same_labels() -> Result<(), SegError> {
    let mut seg = segmentation(6)?;
    let mut ctx = DeviceContext::host(2, 1 << 20)?;
    seg.run(&mut ctx)?;
    let expected = labels(&seg);

    seg.add_device(1);
    seg.run(&mut ctx)?;
    same(&labels(&seg), &expected);
    let stats = seg.last_run_stats().unwrap();
    assert_eq!(stats.workers.iter().map(|w| w.device).collect::<Vec<_>>(), [0, 1]);
    assert_eq!(stats.activation_mismatches, 0);

    seg.remove_device(0);
    seg.run(&mut ctx)?;
    same(&labels(&seg), &expected);
    assert_eq!(seg.last_run_stats().unwrap().workers[0].device, 1);
    Ok(())
}

#[test]
fn every_schedule_finishes() -> Result<(), SegError> {
    let mut seg = segmentation(3)?;
    let mut ctx = DeviceContext::host(3, 10 * SLOT)?;
    // Default usage of 0.75 would leave only 7 slots
    seg.set_max_gpu_usage(1.0, None);
    seg.run(&mut ctx)?;
    let expected = labels(&seg);
    let total = seg.last_run_stats().unwrap().tasks_performed;
    for (seed, devices, usage) in iproduct!(0..6u64, 1..=3usize, [0.8f32, 1.0]) {
        seg.set_seed(seed);
        seg.clear_devices();
        for d in 0..devices {
            seg.add_device(d);
        }
        seg.set_max_gpu_usage(usage, None);
        seg.run(&mut ctx)?;
        let stats = seg.last_run_stats().unwrap();
        assert_eq!(stats.tasks_performed, total, "seed {seed} on {devices} devices");
        assert_eq!(stats.unfinished_tasks, 0);
        assert_eq!(stats.activation_mismatches, 0);
        assert!(stats.workers.iter().all(|w| w.max_resident <= w.capacity));
        same(&labels(&seg), &expected);
    }
    Ok(())
}

#[test]
fn too_few_slots_fail() -> Result<(), SegError> {
    let mut seg = segmentation(2)?;
    seg.set_max_gpu_usage(1.0, None);
    let mut ctx = DeviceContext::host(1, 7 * SLOT)?;
    assert_eq!(seg.update(&mut ctx), -1);
    assert!(matches!(seg.last_error(), Some(SegError::AllocationError(_))));

    // Device override halves the usable memory
    let mut ctx = DeviceContext::host(1, 12 * SLOT)?;
    seg.set_max_gpu_usage(0.5, Some(0));
    assert_eq!(seg.update(&mut ctx), -1);
    seg.clear_max_gpu_usage();
    assert_eq!(seg.update(&mut ctx), 1);
    assert!(seg.last_error().is_none());
    assert_eq!(ctx.free_bytes(0), Some(12 * SLOT));
    Ok(())
}

#[test]
fn device_selection_errors() -> Result<(), SegError> {
    let mut seg = segmentation(1)?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.add_device(4);
    assert!(matches!(seg.run(&mut ctx), Err(SegError::InputError(_))));
    seg.clear_devices();
    assert!(!seg.has_device(0));
    assert!(matches!(seg.run(&mut ctx), Err(SegError::NoDeviceAvailable)));
    seg.add_device(0);
    seg.run(&mut ctx)?;
    assert_eq!(seg.devices().collect::<Vec<_>>(), [0]);
    Ok(())
}
