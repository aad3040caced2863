//! Numerical kernels of the max-flow solver.
//!
//! Every kernel works on whole volumes, one voxel per work item. Buffers are
//! indexed by `x + VX*(y + VY*z)`. Host implementations live here, `OpenCL`
//! sources are generated by the `OpenCL` backend from the same [`Kernel`] values.

use crate::error::{BackendError, ErrorStatus};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Kernel launched by a worker. The first argument slots listed in
/// [`Kernel::outputs`] are written, remaining ones are only read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `out = 0`, args `[out]`
    Zero,
    /// `out = value`, args `[out]`
    Fill(f32),
    /// `out += x`, args `[out, x]`
    Sum,
    /// `out += scale * x`, args `[out, x]`
    SumScaled(f32),
    /// `out = x`, args `[out, x]`
    Copy,
    /// `out = min(out, x)`, args `[out, x]`
    Min,
    /// `out /= x`, args `[out, x]`
    Div,
    /// `out = x / value`, args `[out, x]`
    DivAndStore(f32),
    /// `label = sink == cap ? 1 : 0`, args `[label, sink, cap]`
    Label,
    /// `sink = min(sink, cap)`, args `[sink, cap]`
    Constrain,
    /// `sink = inc - div + label/cc`, args `[sink, inc, div, label]`
    LeafSink { cc: f32 },
    /// `label = clamp(label + cc*(inc - div - sink), 0, 1)`, args `[label, sink, inc, div]`
    UpdateLabel { cc: f32 },
    /// Push of a child with several parents into one parent's working buffer,
    /// args `[working, sink, div, label, source, exclude]`
    StoreSourceFlow { cc: f32, multiplicity: f32 },
    /// `working += sink + div - label/cc`, args `[working, sink, div, label]`
    PushSourceFlow { cc: f32 },
    /// `working = inc - div + label/cc`, args `[working, inc, div, label]`
    StoreSinkFlow { cc: f32 },
    /// `working += inc - div + label/cc`, args `[working, inc, div, label]`
    AccumulateSinkFlow { cc: f32 },
    /// `div = step*(sink + div - inc - label/cc)`, args `[div, sink, inc, label]`
    GradientStep { step: f32, cc: f32 },
    /// Moves flows along the gradient stored in div, args `[flow_x, flow_y, flow_z, div]`
    ApplyStep { extent: [usize; 3] },
    /// Projection multiplier stored in div, args `[div, flow_x, flow_y, flow_z]`
    /// or `[div, flow_x, flow_y, flow_z, smoothness]`
    FlowMagnitude { alpha: f32, extent: [usize; 3] },
    /// Scales flows by the multiplier in div and recomputes divergence,
    /// args `[div, flow_x, flow_y, flow_z]`
    Project { extent: [usize; 3] },
}

impl Kernel {
    /// Number of leading arguments written by this kernel
    pub const fn outputs(&self) -> usize {
        match self {
            Kernel::ApplyStep { .. } => 3,
            Kernel::Project { .. } => 4,
            _ => 1,
        }
    }

    /// Number of arguments this kernel expects, `None` if it varies
    pub const fn arity(&self) -> Option<usize> {
        Some(match self {
            Kernel::Zero | Kernel::Fill(_) => 1,
            Kernel::Sum
            | Kernel::SumScaled(_)
            | Kernel::Copy
            | Kernel::Min
            | Kernel::Div
            | Kernel::DivAndStore(_)
            | Kernel::Constrain => 2,
            Kernel::Label => 3,
            Kernel::LeafSink { .. }
            | Kernel::UpdateLabel { .. }
            | Kernel::PushSourceFlow { .. }
            | Kernel::StoreSinkFlow { .. }
            | Kernel::AccumulateSinkFlow { .. }
            | Kernel::GradientStep { .. }
            | Kernel::ApplyStep { .. }
            | Kernel::Project { .. } => 4,
            Kernel::StoreSourceFlow { .. } => 6,
            Kernel::FlowMagnitude { .. } => return None,
        })
    }
}

/// Runs kernel on host slices. Argument order follows [`Kernel`] docs.
pub(crate) fn run_host(kernel: &Kernel, args: &mut [&mut [f32]]) -> Result<(), BackendError> {
    if let Some(arity) = kernel.arity() {
        if args.len() != arity {
            return Err(arg_error(kernel, args.len()));
        }
    }
    match (*kernel, args) {
        (Kernel::Zero, [out]) => fill(out, 0.0),
        (Kernel::Fill(value), [out]) => fill(out, value),
        (Kernel::Sum, [out, x]) => sum(out, x),
        (Kernel::SumScaled(scale), [out, x]) => sum_scaled(out, x, scale),
        (Kernel::Copy, [out, x]) => out.copy_from_slice(x),
        (Kernel::Min, [out, x]) => min(out, x),
        (Kernel::Div, [out, x]) => div(out, x),
        (Kernel::DivAndStore(value), [out, x]) => div_and_store(out, x, value),
        (Kernel::Label, [label_buf, sink, cap]) => label(label_buf, sink, cap),
        (Kernel::Constrain, [sink, cap]) => constrain(sink, cap),
        (Kernel::LeafSink { cc }, [sink, inc, div, label]) => leaf_sink(sink, inc, div, label, cc),
        (Kernel::UpdateLabel { cc }, [label, sink, inc, div]) => update_label(label, sink, inc, div, cc),
        (Kernel::StoreSourceFlow { cc, multiplicity }, [working, sink, div, label, source, exclude]) => {
            store_source_flow(working, sink, div, label, source, exclude, cc, multiplicity);
        }
        (Kernel::PushSourceFlow { cc }, [working, sink, div, label]) => push_source_flow(working, sink, div, label, cc),
        (Kernel::StoreSinkFlow { cc }, [working, inc, div, label]) => store_sink_flow(working, inc, div, label, cc),
        (Kernel::AccumulateSinkFlow { cc }, [working, inc, div, label]) => {
            accumulate_sink_flow(working, inc, div, label, cc);
        }
        (Kernel::GradientStep { step, cc }, [div, sink, inc, label]) => gradient_step(div, sink, inc, label, step, cc),
        (Kernel::ApplyStep { extent }, [fx, fy, fz, div]) => apply_step([fx, fy, fz], div, extent),
        (Kernel::FlowMagnitude { alpha, extent }, [div, fx, fy, fz]) => flow_magnitude(div, [fx, fy, fz], None, alpha, extent),
        (Kernel::FlowMagnitude { alpha, extent }, [div, fx, fy, fz, smooth]) => {
            flow_magnitude(div, [fx, fy, fz], Some(&**smooth), alpha, extent);
        }
        (Kernel::Project { extent }, [div, fx, fy, fz]) => project(div, [fx, fy, fz], extent),
        (kernel, args) => return Err(arg_error(&kernel, args.len())),
    }
    Ok(())
}

fn arg_error(kernel: &Kernel, len: usize) -> BackendError {
    BackendError { status: ErrorStatus::IncorrectKernelArg, context: format!("{kernel:?} got {len} arguments").into() }
}

#[cfg(feature = "rayon")]
fn voxels_mut(buffer: &mut [f32]) -> impl IndexedParallelIterator<Item = (usize, &mut f32)> {
    buffer.par_iter_mut().enumerate()
}

#[cfg(not(feature = "rayon"))]
fn voxels_mut(buffer: &mut [f32]) -> impl Iterator<Item = (usize, &mut f32)> {
    buffer.iter_mut().enumerate()
}

pub(crate) fn fill(out: &mut [f32], value: f32) {
    voxels_mut(out).for_each(|(_, o)| *o = value);
}

pub(crate) fn sum(out: &mut [f32], x: &[f32]) {
    voxels_mut(out).for_each(|(i, o)| *o += x[i]);
}

pub(crate) fn sum_scaled(out: &mut [f32], x: &[f32], scale: f32) {
    voxels_mut(out).for_each(|(i, o)| *o += scale * x[i]);
}

pub(crate) fn min(out: &mut [f32], x: &[f32]) {
    voxels_mut(out).for_each(|(i, o)| {
        if *o > x[i] {
            *o = x[i];
        }
    });
}

pub(crate) fn div(out: &mut [f32], x: &[f32]) {
    voxels_mut(out).for_each(|(i, o)| *o /= x[i]);
}

pub(crate) fn div_and_store(out: &mut [f32], x: &[f32], value: f32) {
    voxels_mut(out).for_each(|(i, o)| *o = x[i] / value);
}

pub(crate) fn label(label: &mut [f32], sink: &[f32], cap: &[f32]) {
    #[allow(clippy::float_cmp)]
    voxels_mut(label).for_each(|(i, l)| *l = if sink[i] == cap[i] { 1.0 } else { 0.0 });
}

pub(crate) fn constrain(sink: &mut [f32], cap: &[f32]) {
    min(sink, cap);
}

pub(crate) fn leaf_sink(sink: &mut [f32], inc: &[f32], div: &[f32], label: &[f32], cc: f32) {
    voxels_mut(sink).for_each(|(i, s)| *s = inc[i] - div[i] + label[i] / cc);
}

pub(crate) fn update_label(label: &mut [f32], sink: &[f32], inc: &[f32], div: &[f32], cc: f32) {
    voxels_mut(label).for_each(|(i, l)| *l = (*l + cc * (inc[i] - div[i] - sink[i])).clamp(0.0, 1.0));
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn store_source_flow(
    working: &mut [f32],
    sink: &[f32],
    div: &[f32],
    label: &[f32],
    source: &[f32],
    exclude: &[f32],
    cc: f32,
    multiplicity: f32,
) {
    voxels_mut(working).for_each(|(i, w)| {
        *w += (sink[i] + div[i] - source[i] + multiplicity * exclude[i] - label[i] / cc) * multiplicity;
    });
}

pub(crate) fn push_source_flow(working: &mut [f32], sink: &[f32], div: &[f32], label: &[f32], cc: f32) {
    voxels_mut(working).for_each(|(i, w)| *w += sink[i] + div[i] - label[i] / cc);
}

pub(crate) fn store_sink_flow(working: &mut [f32], inc: &[f32], div: &[f32], label: &[f32], cc: f32) {
    voxels_mut(working).for_each(|(i, w)| *w = inc[i] - div[i] + label[i] / cc);
}

pub(crate) fn accumulate_sink_flow(working: &mut [f32], inc: &[f32], div: &[f32], label: &[f32], cc: f32) {
    voxels_mut(working).for_each(|(i, w)| *w += inc[i] - div[i] + label[i] / cc);
}

pub(crate) fn gradient_step(div: &mut [f32], sink: &[f32], inc: &[f32], label: &[f32], step: f32, cc: f32) {
    voxels_mut(div).for_each(|(i, d)| *d = step * (sink[i] + *d - inc[i] - label[i] / cc));
}

/// Neighbour offsets and boundary tests of one volume
#[derive(Debug, Clone, Copy)]
struct Grid {
    vx: usize,
    vy: usize,
    slice: usize,
    size: usize,
}

impl Grid {
    const fn new(extent: [usize; 3]) -> Grid {
        let slice = extent[0] * extent[1];
        Grid { vx: extent[0], vy: extent[1], slice, size: slice * extent[2] }
    }

    /// Previous voxel along axis, if it is inside the volume
    const fn prev(&self, axis: usize, x: usize) -> Option<usize> {
        match axis {
            0 if x % self.vx != 0 => Some(x - 1),
            1 if (x / self.vx) % self.vy != 0 => Some(x - self.vx),
            2 if x >= self.slice => Some(x - self.slice),
            _ => None,
        }
    }

    /// Next voxel along axis, if it is inside the volume
    const fn next(&self, axis: usize, x: usize) -> Option<usize> {
        match axis {
            0 if (x + 1) % self.vx != 0 => Some(x + 1),
            1 if (x / self.vx + 1) % self.vy != 0 => Some(x + self.vx),
            2 if x + self.slice < self.size => Some(x + self.slice),
            _ => None,
        }
    }
}

pub(crate) fn apply_step(flows: [&mut [f32]; 3], div: &[f32], extent: [usize; 3]) {
    let grid = Grid::new(extent);
    for (axis, flow) in flows.into_iter().enumerate() {
        voxels_mut(flow).for_each(|(x, f)| {
            let allowed = div[x];
            let prev = grid.prev(axis, x).map_or(allowed, |p| div[p]);
            *f -= allowed - prev;
        });
    }
}

pub(crate) fn flow_magnitude(
    div: &mut [f32],
    flows: [&[f32]; 3],
    smoothness: Option<&[f32]>,
    alpha: f32,
    extent: [usize; 3],
) {
    let grid = Grid::new(extent);
    voxels_mut(div).for_each(|(x, d)| {
        let mut magnitude = 0.0f32;
        for (axis, flow) in flows.iter().enumerate() {
            magnitude += flow[x] * flow[x];
            if let Some(n) = grid.next(axis, x) {
                magnitude += flow[n] * flow[n];
            }
        }
        let magnitude = magnitude.sqrt();
        let limit = smoothness.map_or(alpha, |s| alpha * s[x]);
        *d = if magnitude > limit { limit / magnitude } else { 1.0 };
    });
}

pub(crate) fn project(div: &mut [f32], flows: [&mut [f32]; 3], extent: [usize; 3]) {
    let grid = Grid::new(extent);
    let [fx, fy, fz] = flows;
    for (axis, flow) in [&mut *fx, &mut *fy, &mut *fz].into_iter().enumerate() {
        let multiplier: &[f32] = div;
        voxels_mut(flow).for_each(|(x, f)| {
            let allowed = multiplier[x];
            let prev = grid.prev(axis, x).map_or(-allowed, |p| multiplier[p]);
            *f *= 0.5 * (allowed + prev);
        });
    }
    let flows: [&[f32]; 3] = [fx, fy, fz];
    voxels_mut(div).for_each(|(x, d)| {
        let mut divergence = 0.0;
        for (axis, flow) in flows.iter().enumerate() {
            divergence += flow[x];
            if let Some(n) = grid.next(axis, x) {
                divergence -= flow[n];
            }
        }
        *d = divergence;
    });
}

#[cfg(test)]
mod tests {
    use super::{run_host, Kernel};

    #[test]
    fn update_label_is_clamped() {
        let mut label = vec![0.9, 0.1];
        let mut sink = vec![0.0, 2.0];
        let mut inc = vec![4.0, 0.0];
        let mut div = vec![0.0, 0.0];
        run_host(&Kernel::UpdateLabel { cc: 0.25 }, &mut [&mut label, &mut sink, &mut inc, &mut div]).unwrap();
        assert_eq!(label, [1.0, 0.0]);
    }

    #[test]
    fn flow_magnitude_reads_forward_neighbours() {
        // 2x2x1 volume, only flow_y of the second row is set
        let extent = [2, 2, 1];
        let mut div = vec![0.0; 4];
        let mut fx = vec![0.0; 4];
        let mut fy = vec![0.0, 0.0, 3.0, 0.0];
        let mut fz = vec![0.0; 4];
        run_host(&Kernel::FlowMagnitude { alpha: 1.0, extent }, &mut [&mut div, &mut fx, &mut fy, &mut fz]).unwrap();
        assert_eq!(div, [1.0 / 3.0, 1.0, 1.0 / 3.0, 1.0]);
    }

    #[test]
    fn projection_zeroes_boundary_flows() {
        let extent = [3, 1, 1];
        let mut div = vec![1.0, 1.0, 1.0];
        let mut fx = vec![5.0, 2.0, -1.0];
        let mut fy = vec![1.0, 1.0, 1.0];
        let mut fz = vec![1.0, 1.0, 1.0];
        run_host(&Kernel::Project { extent }, &mut [&mut div, &mut fx, &mut fy, &mut fz]).unwrap();
        assert_eq!(fx, [0.0, 2.0, -1.0]);
        assert_eq!(fy, [0.0; 3]);
        assert_eq!(div, [-2.0, 3.0, -1.0]);
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let mut out = vec![0.0];
        assert!(run_host(&Kernel::Sum, &mut [&mut out]).is_err());
    }
}
