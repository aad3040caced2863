//! Host backend. Device memory is a set of `Vec<f32>` slots with configured
//! byte budget, kernels run synchronously on the calling thread (or rayon pool).

use super::{Device, DeviceInfo, Event, MemoryPool, SlotId};
use crate::{
    error::{BackendError, ErrorStatus},
    kernels::{self, Kernel},
    slab::Slab,
};
use nanoserde::DeJson;

#[derive(Debug, Default, DeJson)]
pub struct HostConfig {
    /// Number of host devices, each with its own memory pool.
    /// default = 1, 0 disables host backend
    pub devices: Option<usize>,
    /// Memory budget of each host device in bytes.
    /// default = 1 GiB
    pub memory_bytes: Option<usize>,
    /// Reported compute in flops
    pub compute: Option<u64>,
}

impl HostConfig {
    /// Config with given number of devices and per device memory budget
    #[must_use]
    pub const fn new(devices: usize, memory_bytes: usize) -> HostConfig {
        HostConfig { devices: Some(devices), memory_bytes: Some(memory_bytes), compute: None }
    }
}

#[derive(Debug)]
pub struct HostMemoryPool {
    total_bytes: usize,
    free_bytes: usize,
    buffers: Slab<SlotId, Vec<f32>>,
}

#[derive(Debug)]
pub struct HostDevice {
    dev_info: DeviceInfo,
}

pub(super) fn initialize_device(
    config: &HostConfig,
    memory_pools: &mut Vec<MemoryPool>,
    devices: &mut Vec<Device>,
    debug_dev: bool,
) -> Result<(), BackendError> {
    let count = config.devices.unwrap_or(1);
    if count == 0 {
        return Err(BackendError { status: ErrorStatus::Initialization, context: "Host backend configured out.".into() });
    }
    let memory_bytes = config.memory_bytes.unwrap_or(1024 * 1024 * 1024);
    for i in 0..count {
        if debug_dev {
            println!("Using host device {i} with {memory_bytes} B of memory");
        }
        memory_pools.push(MemoryPool::Host(HostMemoryPool {
            total_bytes: memory_bytes,
            free_bytes: memory_bytes,
            buffers: Slab::new(),
        }));
        devices.push(Device::Host(HostDevice {
            dev_info: DeviceInfo {
                name: format!("host{i}"),
                compute: u128::from(config.compute.unwrap_or(1024 * 1024 * 1024)),
                memory_bytes,
            },
        }));
    }
    Ok(())
}

impl HostMemoryPool {
    pub fn deinitialize(&mut self) {
        self.buffers = Slab::new();
        self.free_bytes = self.total_bytes;
    }

    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<(SlotId, Event), BackendError> {
        if bytes > self.free_bytes {
            return Err(BackendError {
                status: ErrorStatus::MemoryAllocation,
                context: format!("Host pool has {} B free, requested {bytes} B", self.free_bytes).into(),
            });
        }
        self.free_bytes -= bytes;
        let id = self.buffers.push(vec![0.0; bytes / std::mem::size_of::<f32>()]);
        Ok((id, Event::Host))
    }

    pub fn deallocate(&mut self, slot: SlotId, event_wait_list: Vec<Event>) {
        self.release_events(event_wait_list);
        if let Some(buffer) = self.buffers.remove(slot) {
            self.free_bytes += buffer.len() * std::mem::size_of::<f32>();
        }
    }

    pub fn host_to_pool(&mut self, src: &[f32], dst: SlotId, event_wait_list: Vec<Event>) -> Result<Event, BackendError> {
        self.release_events(event_wait_list);
        let Some(dst) = self.buffers.get_mut(dst) else {
            return Err(BackendError { status: ErrorStatus::MemoryCopyH2P, context: format!("Slot {dst:?} is not allocated").into() });
        };
        if dst.len() != src.len() {
            return Err(BackendError {
                status: ErrorStatus::MemoryCopyH2P,
                context: format!("Copying {} values into slot of {}", src.len(), dst.len()).into(),
            });
        }
        dst.copy_from_slice(src);
        Ok(Event::Host)
    }

    pub fn pool_to_host(&mut self, src: SlotId, dst: &mut [f32], event_wait_list: Vec<Event>) -> Result<(), BackendError> {
        self.sync_events(event_wait_list)?;
        let Some(src) = self.buffers.get(src) else {
            return Err(BackendError { status: ErrorStatus::MemoryCopyP2H, context: format!("Slot {src:?} is not allocated").into() });
        };
        if dst.len() != src.len() {
            return Err(BackendError {
                status: ErrorStatus::MemoryCopyP2H,
                context: format!("Copying slot of {} values into {}", src.len(), dst.len()).into(),
            });
        }
        dst.copy_from_slice(src);
        Ok(())
    }

    #[allow(clippy::needless_pass_by_value)]
    #[allow(clippy::unnecessary_wraps)]
    pub fn sync_events(&mut self, events: Vec<Event>) -> Result<(), BackendError> {
        let _ = self;
        debug_assert!(events.iter().all(|e| matches!(e, Event::Host)));
        Ok(())
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn release_events(&mut self, events: Vec<Event>) {
        let _ = self;
        debug_assert!(events.iter().all(|e| matches!(e, Event::Host)));
    }
}

impl HostDevice {
    pub fn deinitialize(&mut self) {
        let _ = self;
    }

    pub const fn info(&self) -> &DeviceInfo {
        &self.dev_info
    }

    #[allow(clippy::unnecessary_wraps)]
    pub fn reserve(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    pub fn launch(
        &mut self,
        kernel: &Kernel,
        memory_pool: &mut HostMemoryPool,
        args: &[SlotId],
        event_wait_list: Vec<Event>,
    ) -> Result<Event, BackendError> {
        memory_pool.release_events(event_wait_list);
        // Take arguments out of the pool so that kernels get disjoint slices
        let mut taken: Vec<(SlotId, Vec<f32>)> = Vec::with_capacity(args.len());
        for &slot in args {
            if taken.iter().any(|(s, _)| *s == slot) {
                Self::restore(memory_pool, taken);
                return Err(BackendError {
                    status: ErrorStatus::IncorrectKernelArg,
                    context: format!("{kernel:?} got slot {slot:?} twice").into(),
                });
            }
            let Some(buffer) = memory_pool.buffers.get_mut(slot) else {
                Self::restore(memory_pool, taken);
                return Err(BackendError {
                    status: ErrorStatus::IncorrectKernelArg,
                    context: format!("{kernel:?} got unallocated slot {slot:?}").into(),
                });
            };
            taken.push((slot, std::mem::take(buffer)));
        }
        let result = {
            let mut views: Vec<&mut [f32]> = taken.iter_mut().map(|(_, b)| b.as_mut_slice()).collect();
            kernels::run_host(kernel, &mut views)
        };
        Self::restore(memory_pool, taken);
        result.map(|()| Event::Host)
    }

    fn restore(memory_pool: &mut HostMemoryPool, taken: Vec<(SlotId, Vec<f32>)>) {
        for (slot, buffer) in taken {
            if let Some(dst) = memory_pool.buffers.get_mut(slot) {
                *dst = buffer;
            }
        }
    }
}
