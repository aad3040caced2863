//! This file creates backend agnostic API to backends
//! That is it contains enums that dispatch function calls to appropriate backends.
//! Interfaces use events independent from underlying implementation.
//! Each device owns exactly one memory pool, `pools[i]` belongs to `devices[i]`.

use crate::{
    error::{BackendError, ErrorStatus},
    kernels::Kernel,
    segmentation::SolverConfig,
    slab::slab_id,
};
use host::{HostDevice, HostMemoryPool};
use nanoserde::DeJson;
use opencl::{OpenCLDevice, OpenCLMemoryPool};

mod host;
mod opencl;

pub use host::HostConfig;
pub use opencl::OpenCLConfig;

slab_id! {
    /// Buffer slot inside of a device memory pool
    pub struct SlotId;
}

pub(crate) fn initialize_backends(
    config: &Config,
    memory_pools: &mut Vec<MemoryPool>,
    devices: &mut Vec<Device>,
    debug_dev: bool,
) -> Result<(), BackendError> {
    if let Err(err) = host::initialize_device(&config.host, memory_pools, devices, debug_dev) {
        if debug_dev {
            println!("{err}");
        }
    }
    if let Err(err) = opencl::initialize_device(&config.opencl, memory_pools, devices, debug_dev) {
        if debug_dev {
            println!("{err}");
        }
    }
    if devices.is_empty() || memory_pools.is_empty() {
        return Err(BackendError {
            status: ErrorStatus::Initialization,
            context: "All backends failed to initialize or were configured out.".into(),
        });
    }
    debug_assert_eq!(devices.len(), memory_pools.len());
    Ok(())
}

#[derive(Debug, Clone)]
#[allow(clippy::upper_case_acronyms)]
pub enum Event {
    /// Host work is finished once the call returns
    Host,
    OpenCL(opencl::OpenCLEvent),
}

/// Device configuration
#[derive(DeJson, Debug, Default)]
pub struct Config {
    /// Host device configuration
    #[nserde(default)]
    pub host: HostConfig,
    /// `OpenCL` configuration
    #[nserde(default)]
    pub opencl: OpenCLConfig,
    /// Solver defaults
    #[nserde(default)]
    pub solver: SolverConfig,
}

/// Device information used for sizing worker pools and for diagnostics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Device compute in flops
    pub compute: u128,
    /// Global memory size in bytes
    pub memory_bytes: usize,
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug)]
pub enum MemoryPool {
    Host(HostMemoryPool),
    OpenCL(OpenCLMemoryPool),
}

impl MemoryPool {
    pub fn deinitialize(&mut self) {
        match self {
            MemoryPool::Host(pool) => pool.deinitialize(),
            MemoryPool::OpenCL(pool) => pool.deinitialize(),
        }
    }

    pub const fn free_bytes(&self) -> usize {
        match self {
            MemoryPool::Host(pool) => pool.free_bytes(),
            MemoryPool::OpenCL(pool) => pool.free_bytes(),
        }
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<(SlotId, Event), BackendError> {
        match self {
            MemoryPool::Host(pool) => pool.allocate(bytes),
            MemoryPool::OpenCL(pool) => pool.allocate(bytes),
        }
    }

    // Deallocate waits for events, then drops them
    pub fn deallocate(&mut self, slot: SlotId, event_wait_list: Vec<Event>) {
        match self {
            MemoryPool::Host(pool) => pool.deallocate(slot, event_wait_list),
            MemoryPool::OpenCL(pool) => pool.deallocate(slot, event_wait_list),
        }
    }

    /// Host to pool is blocking, src can be dropped once this returns
    pub fn host_to_pool(&mut self, src: &[f32], dst: SlotId, event_wait_list: Vec<Event>) -> Result<Event, BackendError> {
        match self {
            MemoryPool::Host(pool) => pool.host_to_pool(src, dst, event_wait_list),
            MemoryPool::OpenCL(pool) => pool.host_to_pool(src, dst, event_wait_list),
        }
    }

    /// Pool to host is blocking operation, synchronizes events and drops them
    pub fn pool_to_host(&mut self, src: SlotId, dst: &mut [f32], event_wait_list: Vec<Event>) -> Result<(), BackendError> {
        match self {
            MemoryPool::Host(pool) => pool.pool_to_host(src, dst, event_wait_list),
            MemoryPool::OpenCL(pool) => pool.pool_to_host(src, dst, event_wait_list),
        }
    }

    // Synchronize events, blocking, drops those events
    pub fn sync_events(&mut self, events: Vec<Event>) -> Result<(), BackendError> {
        match self {
            MemoryPool::Host(pool) => pool.sync_events(events),
            MemoryPool::OpenCL(pool) => pool.sync_events(events),
        }
    }

    // Drop events without synchronization, non-blocking
    pub fn release_events(&mut self, events: Vec<Event>) {
        match self {
            MemoryPool::Host(pool) => pool.release_events(events),
            MemoryPool::OpenCL(pool) => pool.release_events(events),
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug)]
pub enum Device {
    Host(HostDevice),
    OpenCL(OpenCLDevice),
}

impl Device {
    pub fn deinitialize(&mut self) {
        match self {
            Device::Host(dev) => dev.deinitialize(),
            Device::OpenCL(dev) => dev.deinitialize(),
        }
    }

    pub const fn info(&self) -> &DeviceInfo {
        match self {
            Device::Host(dev) => dev.info(),
            Device::OpenCL(dev) => dev.info(),
        }
    }

    /// Makes sure the device can accept more work. May block until queued work drains.
    pub fn reserve(&mut self) -> Result<(), BackendError> {
        match self {
            Device::Host(dev) => dev.reserve(),
            Device::OpenCL(dev) => dev.reserve(),
        }
    }

    pub fn launch(
        &mut self,
        kernel: &Kernel,
        memory_pool: &mut MemoryPool,
        args: &[SlotId],
        event_wait_list: Vec<Event>,
    ) -> Result<Event, BackendError> {
        match (self, memory_pool) {
            (Device::Host(dev), MemoryPool::Host(pool)) => dev.launch(kernel, pool, args, event_wait_list),
            (Device::OpenCL(dev), MemoryPool::OpenCL(pool)) => dev.launch(kernel, pool, args, event_wait_list),
            _ => Err(BackendError {
                status: ErrorStatus::KernelLaunch,
                context: "Device was paired with memory pool of another backend".into(),
            }),
        }
    }
}
