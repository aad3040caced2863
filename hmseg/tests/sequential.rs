use hmseg::{DeviceContext, HierarchicalMaxFlow, Hierarchy, IterationReport, LabelGraph, NodeId, SegError};

// root -> {a, b}, b -> {b1, b2}, winners alternate between rows of x
fn blocky(iterations: usize) -> Result<(HierarchicalMaxFlow, [NodeId; 4]), SegError> {
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let a = graph.add_child(root);
    let b = graph.add_child(root);
    let b1 = graph.add_child(b);
    let b2 = graph.add_child(b);
    let extent = [3, 3, 2];
    let mut seg = HierarchicalMaxFlow::new(&graph, extent)?;
    let leaves = [a, b1, b2];
    for (k, &leaf) in leaves.iter().enumerate() {
        let mut cost = Vec::new();
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                for _ in 0..extent[0] {
                    cost.push(if (y + 2 * z) % 3 == k { 0.0 } else { 1.0 });
                }
            }
        }
        seg.set_data_term(leaf, cost)?;
    }
    for node in [a, b, b1, b2] {
        seg.set_smoothness_scalar(node, 0.1)?;
    }
    seg.set_iterations(iterations);
    Ok((seg, [a, b, b1, b2]))
}

#[test]
fn observer_sees_every_iteration() -> Result<(), SegError> {
    let (mut seg, nodes) = blocky(4)?;
    let mut reports: Vec<IterationReport> = Vec::new();
    let mut observer = |report: &IterationReport| reports.push(report.clone());
    seg.run_sequential(Some(&mut observer))?;
    assert_eq!(reports.iter().map(|r| r.iteration).collect::<Vec<_>>(), [0, 1, 2, 3, 4]);
    assert!(reports[0].discrepancy < 1e-3);
    assert!(reports[0].source_discrepancy < 1e-3);
    let last = &reports[4];
    assert_eq!(last.label_means.len(), nodes.len());
    assert_eq!(last.branch_discrepancy.iter().map(|&(n, _)| n).collect::<Vec<_>>(), [nodes[1]]);
    assert!(seg.last_run_stats().is_none());
    Ok(())
}

#[test]
fn matches_scheduled_engine() -> Result<(), SegError> {
    let (mut seg, nodes) = blocky(30)?;
    seg.run_sequential(None)?;
    let sequential: Vec<Vec<f32>> = nodes.iter().map(|&n| seg.label(n).unwrap().to_vec()).collect();
    let mut ctx = DeviceContext::host(1, 1 << 20)?;
    seg.run(&mut ctx)?;
    for (&node, expected) in nodes.iter().zip(&sequential) {
        for (x, y) in seg.label(node).unwrap().iter().zip(expected) {
            assert!((x - y).abs() <= 1e-3, "{node}: {x} != {y}");
        }
    }
    Ok(())
}

#[test]
fn weighted_dag_keeps_labels_in_range() -> Result<(), SegError> {
    // Leaf `shared` belongs half to each branch
    let mut graph = LabelGraph::new();
    let root = graph.root();
    let x = graph.add_child(root);
    let y = graph.add_child(root);
    let x1 = graph.add_child(x);
    let shared = graph.add_weighted_child(x, 0.5);
    graph.add_edge(y, shared, 0.5)?;
    let y1 = graph.add_child(y);
    let mut seg = HierarchicalMaxFlow::new(&graph, [4, 1, 1])?;
    seg.set_data_term(x1, vec![0.0, 1.0, 1.0, 1.0])?;
    seg.set_data_term(shared, vec![1.0, 0.0, 0.0, 1.0])?;
    seg.set_data_term(y1, vec![1.0, 1.0, 1.0, 0.0])?;
    seg.set_iterations(0);
    seg.run_sequential(None)?;
    assert_eq!(seg.label(x1).unwrap(), [1.0, 0.0, 0.0, 0.0]);
    assert_eq!(seg.label(shared).unwrap(), [0.0, 1.0, 1.0, 0.0]);

    let mut reports = 0;
    let mut observer = |_: &IterationReport| reports += 1;
    seg.set_iterations(8);
    seg.run_sequential(Some(&mut observer))?;
    assert_eq!(reports, 9);
    for node in [x, y, x1, shared, y1] {
        let label = seg.label(node).unwrap();
        assert!(label.iter().all(|v| v.is_finite() && (-1e-4..=1.0 + 1e-4).contains(v)), "{node}: {label:?}");
    }
    Ok(())
}
