use hmseg::{DeviceContext, HierarchicalMaxFlow, Hierarchy, LabelGraph, NodeId, SegError};

const EXTENT: [usize; 3] = [4, 2, 2];

fn close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "voxel {i}: {a} != {e}");
    }
}

// root -> {a, b}, b -> {b1, b2}
fn tree() -> (LabelGraph, [NodeId; 4]) {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let a = graph.add_child(root);
    let b = graph.add_child(root);
    let b1 = graph.add_child(b);
    let b2 = graph.add_child(b);
    (graph, [a, b, b1, b2])
}

// Leaf winning at each voxel, rows along x share the winner
fn winners(leaves: [NodeId; 3]) -> Vec<NodeId> {
    let mut winners = Vec::new();
    for z in 0..EXTENT[2] {
        for y in 0..EXTENT[1] {
            for _ in 0..EXTENT[0] {
                winners.push(leaves[(y + 2 * z) % 3]);
            }
        }
    }
    winners
}

fn indicator(winners: &[NodeId], leaf: NodeId) -> Vec<f32> {
    winners.iter().map(|&w| if w == leaf { 1.0 } else { 0.0 }).collect()
}

fn blocky(graph: &LabelGraph, nodes: [NodeId; 4], iterations: usize) -> Result<HierarchicalMaxFlow, SegError> {
    let [a, b, b1, b2] = nodes;
    let winners = winners([a, b1, b2]);
    let mut seg = HierarchicalMaxFlow::new(graph, EXTENT)?;
    for leaf in [a, b1, b2] {
        let cost = indicator(&winners, leaf).into_iter().map(|x| 1.0 - x).collect();
        seg.set_data_term(leaf, cost)?;
    }
    for node in [a, b, b1, b2] {
        seg.set_smoothness_scalar(node, 0.1)?;
    }
    seg.set_iterations(iterations);
    Ok(seg)
}

#[test]
fn two_labels_follow_lower_cost() -> Result<(), SegError> {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let a = graph.add_child(root);
    let b = graph.add_child(root);
    let mut seg = HierarchicalMaxFlow::new(&graph, [2, 1, 1])?;
    seg.set_data_term(a, vec![0.0, 1.0])?;
    seg.set_data_term(b, vec![1.0, 0.0])?;
    seg.set_smoothness_scalar(a, 0.0)?;
    seg.set_smoothness_scalar(b, 0.0)?;
    seg.set_iterations(10);
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;
    close(seg.label(a).unwrap(), &[1.0, 0.0], 1e-3);
    close(seg.label(b).unwrap(), &[0.0, 1.0], 1e-3);
    assert!(seg.label(root).is_none());
    Ok(())
}

#[test]
fn single_leaf_takes_everything() -> Result<(), SegError> {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let only = graph.add_child(root);
    let mut seg = HierarchicalMaxFlow::new(&graph, [3, 2, 1])?;
    seg.set_data_term(only, vec![0.5, 2.0, 0.0, 1.0, 3.0, 0.25])?;
    seg.set_iterations(20);
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;
    close(seg.label(only).unwrap(), &[1.0; 6], 1e-4);
    Ok(())
}

#[test]
fn hierarchy_labels_are_consistent() -> Result<(), SegError> {
    let (graph, nodes) = tree();
    let [a, b, b1, b2] = nodes;
    let winners = winners([a, b1, b2]);
    let mut seg = blocky(&graph, nodes, 30)?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;

    for leaf in [a, b1, b2] {
        close(seg.label(leaf).unwrap(), &indicator(&winners, leaf), 1e-3);
    }
    let branch: Vec<f32> = seg.label(b1).unwrap().iter().zip(seg.label(b2).unwrap()).map(|(x, y)| x + y).collect();
    close(seg.label(b).unwrap(), &branch, 1e-3);
    let total: Vec<f32> = (0..seg.volume())
        .map(|i| [a, b1, b2].iter().map(|&l| seg.label(l).unwrap()[i]).sum())
        .collect();
    close(&total, &vec![1.0; seg.volume()], 1e-3);
    Ok(())
}

#[test]
fn zero_iterations_keep_initial_labels() -> Result<(), SegError> {
    let (graph, nodes) = tree();
    let [a, b, b1, b2] = nodes;
    let winners = winners([a, b1, b2]);
    let mut seg = blocky(&graph, nodes, 0)?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;
    for leaf in [a, b1, b2] {
        assert_eq!(seg.label(leaf).unwrap(), indicator(&winners, leaf).as_slice());
    }
    let branch: Vec<f32> = winners.iter().map(|&w| if w == b1 || w == b2 { 1.0 } else { 0.0 }).collect();
    assert_eq!(seg.label(b).unwrap(), branch.as_slice());
    // Every initialization task runs once, branch b accumulates from two children
    assert_eq!(seg.last_run_stats().unwrap().tasks_performed, 23);
    Ok(())
}

#[test]
fn missing_data_term_is_input_error() -> Result<(), SegError> {
    let (graph, [a, _, b1, _]) = tree();
    let mut seg = HierarchicalMaxFlow::new(&graph, EXTENT)?;
    seg.set_data_term(a, vec![0.0; 16])?;
    seg.set_data_term(b1, vec![1.0; 16])?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    assert!(matches!(seg.run(&mut ctx), Err(SegError::InputError(_))));
    assert_eq!(seg.update(&mut ctx), -1);
    assert!(matches!(seg.last_error(), Some(SegError::InputError(_))));
    assert!(seg.label(a).is_none());
    Ok(())
}

#[test]
fn invalid_parameters_are_rejected() -> Result<(), SegError> {
    let (graph, [a, b, b1, b2]) = tree();
    let mut seg = HierarchicalMaxFlow::new(&graph, EXTENT)?;
    for leaf in [a, b1, b2] {
        seg.set_data_term(leaf, vec![1.0; 16])?;
    }
    assert!(matches!(seg.set_smoothness_scalar(b, -1.0), Err(SegError::InputError(_))));
    assert!(matches!(seg.set_smoothness_term(graph.root(), vec![1.0; 16]), Err(SegError::InputError(_))));
    assert!(matches!(seg.set_smoothness_term(b, vec![f32::NAN; 16]), Err(SegError::InputError(_))));
    assert!(matches!(HierarchicalMaxFlow::new(&graph, [4, 0, 2]), Err(SegError::InputError(_))));
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.set_cc(0.0);
    assert!(matches!(seg.run(&mut ctx), Err(SegError::InputError(_))));
    seg.set_cc(0.25);
    seg.set_step_size(f32::INFINITY);
    assert!(matches!(seg.run(&mut ctx), Err(SegError::InputError(_))));
    Ok(())
}

#[test]
fn smoothness_term_volume_is_used() -> Result<(), SegError> {
    let (graph, nodes) = tree();
    let [a, b, b1, b2] = nodes;
    let winners = winners([a, b1, b2]);
    let mut seg = blocky(&graph, nodes, 10)?;
    for node in [a, b, b1, b2] {
        seg.set_smoothness_term(node, vec![1.0; 16])?;
    }
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;
    for leaf in [a, b1, b2] {
        close(seg.label(leaf).unwrap(), &indicator(&winners, leaf), 1e-3);
    }
    Ok(())
}

#[test]
fn dag_needs_sequential_solver() -> Result<(), SegError> {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let x = graph.add_child(root);
    let y = graph.add_child(root);
    let shared = graph.add_weighted_child(x, 0.5);
    graph.add_edge(y, shared, 0.5)?;
    let other = graph.add_child(y);
    let mut seg = HierarchicalMaxFlow::new(&graph, [2, 1, 1])?;
    assert!(!seg.is_tree());
    seg.set_data_term(shared, vec![0.0, 1.0])?;
    seg.set_data_term(other, vec![1.0, 0.0])?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    assert!(matches!(seg.run(&mut ctx), Err(SegError::HierarchyError(_))));
    seg.set_iterations(5);
    seg.run_sequential(None)?;
    assert_eq!(seg.label(shared).map(<[f32]>::len), Some(2));
    assert_eq!(seg.label(other).map(<[f32]>::len), Some(2));
    Ok(())
}

#[test]
fn failed_update_keeps_previous_labels() -> Result<(), SegError> {
    let (graph, nodes) = tree();
    let mut seg = blocky(&graph, nodes, 10)?;
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    assert_eq!(seg.update(&mut ctx), 1);
    let labels: Vec<Vec<f32>> = nodes.iter().map(|&n| seg.label(n).unwrap().to_vec()).collect();
    let stats = seg.last_run_stats().cloned();

    // Pool of 4 volumes can not hold the buffers of a single task
    let mut small = DeviceContext::host(1, 4 * 16 * 4)?;
    seg.set_max_gpu_usage(1.0, None);
    seg.set_iterations(20);
    assert_eq!(seg.update(&mut small), -1);
    assert!(matches!(seg.last_error(), Some(SegError::AllocationError(_))));
    for (&node, label) in nodes.iter().zip(&labels) {
        assert_eq!(seg.label(node).unwrap(), label.as_slice());
    }
    assert_eq!(seg.last_run_stats().cloned(), stats);
    assert_eq!(small.free_bytes(0), Some(4 * 16 * 4));

    assert_eq!(seg.update(&mut ctx), 1);
    assert!(seg.last_error().is_none());
    Ok(())
}
