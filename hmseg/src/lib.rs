//! # hmseg
//!
//! hmseg is continuous max-flow segmentation over a hierarchy of labels.
//! Work is split into small tasks over volumes of one hierarchy node and
//! scheduled onto host and `OpenCL` devices, each with a fixed pool of
//! buffer slots. Buffers move between host and devices on demand.
//!
//! Devices are initialized once into a [`DeviceContext`], which is then passed
//! to every [`HierarchicalMaxFlow::run`].
//!
//! Environment variables:
//! - `HMSEG_DEBUG` bitmask, 1 device info, 2 performance, 4 scheduler, 8 kernel launches
//! - `HMSEG_SEED` seed of scheduler tie breaking
#![forbid(rustdoc::broken_intra_doc_links)]
#![forbid(rustdoc::invalid_codeblock_attributes)]
#![forbid(rustdoc::invalid_html_tags)]
#![forbid(rustdoc::bare_urls)]

mod backend;
mod buffers;
mod error;
mod hierarchy;
mod kernels;
mod priority;
mod runtime;
mod scheduler;
mod segmentation;
mod sequential;
mod slab;
mod task;
mod worker;

pub use backend::{Config, DeviceInfo, HostConfig, OpenCLConfig};
pub use error::{BackendError, ErrorStatus, SegError};
pub use hierarchy::{Hierarchy, LabelGraph, NodeId};
pub use kernels::Kernel;
pub use runtime::{DebugMask, DeviceContext};
pub use scheduler::{RunStats, WorkerStats};
pub use segmentation::{HierarchicalMaxFlow, SolverConfig};
pub use sequential::{IterationObserver, IterationReport};
