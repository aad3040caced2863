//! Worker owns one device and its memory pool for the duration of a run.
//!
//! The pool is split into a fixed number of equally sized slots, one volume each.
//! Host buffers are moved into slots on demand and evicted by priority when
//! the worker runs out of unused slots.

use crate::{
    backend::{Device, Event, MemoryPool, SlotId},
    buffers::{BufferId, HostBuffers},
    error::SegError,
    priority::BufferPriorities,
    runtime::DebugMask,
    slab::slab_id,
    task::Task,
};
use std::collections::BTreeMap;

slab_id! {
    pub(crate) struct WorkerId;
}

/// Smallest pool that can hold every buffer of the largest task
pub(crate) const MIN_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Resident {
    slot: SlotId,
    last_use: u64,
}

#[derive(Debug)]
pub(crate) struct Worker<'a> {
    id: WorkerId,
    device_id: usize,
    device: &'a mut Device,
    pool: &'a mut MemoryPool,
    capacity: usize,
    slots: Vec<SlotId>,
    unused: Vec<SlotId>,
    resident: BTreeMap<BufferId, Resident>,
    // Incremented after every performed task, used for least recently used ties
    tick: u64,
    // Queues are in order, so the last launched kernel is all we need to wait for
    last_event: Option<Event>,
    num_memcpies: usize,
    max_resident: usize,
    debug: DebugMask,
}

impl<'a> Worker<'a> {
    /// Allocates slots for at most `host.len()` buffers, limited by `usage` of free device memory.
    pub(crate) fn new(
        id: WorkerId,
        device_id: usize,
        device: &'a mut Device,
        pool: &'a mut MemoryPool,
        usage: f32,
        host: &HostBuffers,
        debug: DebugMask,
    ) -> Result<Worker<'a>, SegError> {
        let slot_bytes = host.volume() * std::mem::size_of::<f32>();
        if slot_bytes == 0 {
            return Err(SegError::input_error("Volume is empty"));
        }
        #[allow(clippy::cast_precision_loss)]
        #[allow(clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let by_memory = (pool.free_bytes() as f64 * f64::from(usage) / slot_bytes as f64).floor() as usize;
        let capacity = host.len().max(MIN_SLOTS).min(by_memory);
        if capacity < MIN_SLOTS {
            return Err(SegError::allocation_error(format!(
                "Device {device_id} ({}) fits only {capacity} buffers of {slot_bytes} B, at least {MIN_SLOTS} are required",
                device.info().name
            )));
        }
        let mut worker = Worker {
            id,
            device_id,
            device,
            pool,
            capacity,
            slots: Vec::with_capacity(capacity),
            unused: Vec::with_capacity(capacity),
            resident: BTreeMap::new(),
            tick: 0,
            last_event: None,
            num_memcpies: 0,
            max_resident: 0,
            debug,
        };
        // On error the worker is dropped, which deallocates slots allocated so far
        for _ in 0..capacity {
            let (slot, event) = worker.pool.allocate(slot_bytes)?;
            worker.pool.release_events(vec![event]);
            worker.slots.push(slot);
            worker.unused.push(slot);
        }
        if debug.dev() {
            println!("Worker {} on device {device_id} uses {capacity} slots of {slot_bytes} B", usize::from(id));
        }
        Ok(worker)
    }

    pub(crate) const fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) const fn device_id(&self) -> usize {
        self.device_id
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) const fn num_memcpies(&self) -> usize {
        self.num_memcpies
    }

    /// Most buffers ever resident at once
    pub(crate) const fn max_resident(&self) -> usize {
        self.max_resident
    }

    pub(crate) fn holds(&self, buffer: BufferId) -> bool {
        self.resident.contains_key(&buffer)
    }

    /// Number of task buffers already resident here
    pub(crate) fn held(&self, task: &Task) -> usize {
        task.buffers.iter().filter(|b| self.holds(**b)).count()
    }

    /// True if some of task's buffers are resident on another worker
    pub(crate) fn conflicted(&self, task: &Task, host: &HostBuffers) -> bool {
        task.buffers.iter().any(|&b| host.holder(b).is_some_and(|w| w != self.id))
    }

    pub(crate) fn can_do(&self, task: &Task, host: &HostBuffers) -> bool {
        !self.conflicted(task, host)
    }

    /// Number of copies performing task here would cost, counting copies in
    /// and copies back of buffers evicted to make room.
    pub(crate) fn calc_weight(&self, task: &Task, host: &HostBuffers, priorities: &BufferPriorities) -> usize {
        let missing: Vec<BufferId> = task.buffers.iter().copied().filter(|&b| !self.holds(b)).collect();
        let copies_in = missing.iter().filter(|&&b| host.needs_copy_in(b)).count();
        let evictions = missing.len().saturating_sub(self.unused.len());
        let copies_back = self
            .victims(&task.buffers, evictions, priorities)
            .into_iter()
            .filter(|&b| host.needs_copy_back(b))
            .count();
        copies_in + copies_back
    }

    // Lowest priority first, least recently used on ties
    fn victims(&self, pinned: &[BufferId], count: usize, priorities: &BufferPriorities) -> Vec<BufferId> {
        if count == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(i32, u64, BufferId)> = self
            .resident
            .iter()
            .filter(|(b, _)| !pinned.contains(b))
            .map(|(&b, r)| (priorities.get(b), r.last_use, b))
            .collect();
        candidates.sort_unstable();
        candidates.into_iter().take(count).map(|(_, _, b)| b).collect()
    }

    /// Waits for work queued on the device
    pub(crate) fn reserve(&mut self) -> Result<(), SegError> {
        Ok(self.device.reserve()?)
    }

    /// Blocks until every launched kernel finished
    pub(crate) fn sync(&mut self) -> Result<(), SegError> {
        if let Some(event) = self.last_event.take() {
            self.pool.sync_events(vec![event])?;
        }
        Ok(())
    }

    /// Makes buffer resident, evicting another one if no slot is unused.
    /// Workers that wrote this buffer back last must be synced by the caller.
    pub(crate) fn move_buffer_to_device(
        &mut self,
        buffer: BufferId,
        host: &mut HostBuffers,
        priorities: &BufferPriorities,
        pinned: &[BufferId],
    ) -> Result<(), SegError> {
        self.reserve()?;
        if let Some(resident) = self.resident.get_mut(&buffer) {
            resident.last_use = self.tick;
            return Ok(());
        }
        if let Some(holder) = host.holder(buffer) {
            return Err(SegError::internal(format!("Buffer {buffer:?} is already resident on worker {holder:?}")));
        }
        let slot = if let Some(slot) = self.unused.pop() {
            slot
        } else {
            let victim = self
                .victims(pinned, 1, priorities)
                .pop()
                .ok_or_else(|| SegError::internal(format!("Worker {:?} has no buffer to evict", self.id)))?;
            self.evict_buffer(victim, host)?;
            self.unused.pop().ok_or_else(|| SegError::internal("Eviction did not free a slot"))?
        };
        host.state_mut(buffer).last_writer = None;
        if host.needs_copy_in(buffer) {
            let event = self.pool.host_to_pool(host.data(buffer), slot, Vec::new())?;
            self.pool.release_events(vec![event]);
            self.num_memcpies += 1;
        }
        host.state_mut(buffer).holder = Some(self.id);
        self.resident.insert(buffer, Resident { slot, last_use: self.tick });
        self.max_resident = self.max_resident.max(self.resident.len());
        Ok(())
    }

    /// Copies device contents back to host if host copy is stale.
    /// No-copy-back buffers are only copied when `spill` is set.
    pub(crate) fn return_buffer_to_host(&mut self, buffer: BufferId, host: &mut HostBuffers, spill: bool) -> Result<(), SegError> {
        let Some(&Resident { slot, .. }) = self.resident.get(&buffer) else {
            return Ok(());
        };
        let state = host.state(buffer);
        if state.read_only || !state.overwritten {
            return Ok(());
        }
        let state = host.state_mut(buffer);
        state.overwritten = false;
        state.last_writer = Some(self.id);
        let no_copy_back = state.no_copy_back;
        self.reserve()?;
        if no_copy_back && !spill {
            return Ok(());
        }
        let events: Vec<Event> = self.last_event.iter().cloned().collect();
        self.pool.pool_to_host(slot, host.data_mut(buffer), events)?;
        if no_copy_back {
            host.state_mut(buffer).spilled = true;
        }
        self.num_memcpies += 1;
        Ok(())
    }

    /// Frees the slot of buffer without copying
    pub(crate) fn release_buffer(&mut self, buffer: BufferId, host: &mut HostBuffers) {
        if let Some(resident) = self.resident.remove(&buffer) {
            self.unused.push(resident.slot);
            host.state_mut(buffer).holder = None;
        }
    }

    pub(crate) fn evict_buffer(&mut self, buffer: BufferId, host: &mut HostBuffers) -> Result<(), SegError> {
        if self.debug.sched() {
            println!("Worker {:?} evicts {buffer:?}", self.id);
        }
        self.return_buffer_to_host(buffer, host, true)?;
        self.release_buffer(buffer, host);
        Ok(())
    }

    /// Moves buffers of task to the device, launches its kernels and marks outputs as overwritten
    pub(crate) fn perform(&mut self, task: &Task, host: &mut HostBuffers, priorities: &BufferPriorities) -> Result<(), SegError> {
        for &buffer in &task.buffers {
            self.move_buffer_to_device(buffer, host, priorities, &task.buffers)?;
        }
        for (kernel, args) in &task.launches {
            let slots: Vec<SlotId> = args
                .iter()
                .map(|b| {
                    self.resident
                        .get(b)
                        .map(|r| r.slot)
                        .ok_or_else(|| SegError::internal(format!("Buffer {b:?} of {:?} is not resident", task.kind)))
                })
                .collect::<Result<_, _>>()?;
            self.reserve()?;
            if self.debug.kernel() {
                println!("Worker {:?} launches {kernel:?} on {slots:?}", self.id);
            }
            let event = self.device.launch(kernel, self.pool, &slots, Vec::new())?;
            if let Some(event) = self.last_event.replace(event) {
                self.pool.release_events(vec![event]);
            }
        }
        for &buffer in &task.outputs {
            host.state_mut(buffer).overwritten = true;
        }
        self.tick += 1;
        Ok(())
    }

    /// Returns every resident buffer to host and frees all slots
    pub(crate) fn flush(&mut self, host: &mut HostBuffers) -> Result<(), SegError> {
        let buffers: Vec<BufferId> = self.resident.keys().copied().collect();
        for buffer in buffers {
            self.return_buffer_to_host(buffer, host, false)?;
            self.release_buffer(buffer, host);
        }
        self.sync()
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        let events: Vec<Event> = self.last_event.take().into_iter().collect();
        let _ = self.pool.sync_events(events);
        for slot in self.slots.drain(..) {
            self.pool.deallocate(slot, Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Worker, WorkerId, MIN_SLOTS};
    use crate::{
        backend::{initialize_backends, Config, Device, HostConfig, MemoryPool},
        buffers::HostBuffers,
        error::SegError,
        priority::BufferPriorities,
        runtime::DebugMask,
    };

    fn host_device(memory_bytes: usize) -> (Vec<Device>, Vec<MemoryPool>) {
        let config = Config { host: HostConfig::new(1, memory_bytes), ..Config::default() };
        let mut devices = Vec::new();
        let mut pools = Vec::new();
        initialize_backends(&config, &mut pools, &mut devices, false).unwrap();
        (devices, pools)
    }

    #[test]
    fn too_small_pool_is_rejected() {
        let (mut devices, mut pools) = host_device(7 * 16);
        let mut host = HostBuffers::new(4);
        for _ in 0..20 {
            host.allocate();
        }
        let worker = Worker::new(WorkerId::from(0), 0, &mut devices[0], &mut pools[0], 1.0, &host, DebugMask::default());
        assert!(matches!(worker, Err(SegError::AllocationError(_))));
    }

    #[test]
    fn capacity_is_capped_by_host_buffers() {
        let (mut devices, mut pools) = host_device(1 << 20);
        let mut host = HostBuffers::new(4);
        for _ in 0..10 {
            host.allocate();
        }
        let worker = Worker::new(WorkerId::from(0), 0, &mut devices[0], &mut pools[0], 0.75, &host, DebugMask::default()).unwrap();
        assert_eq!(worker.capacity(), 10);
        drop(worker);
        assert_eq!(pools[0].free_bytes(), 1 << 20);
    }

    #[test]
    fn eviction_copies_back_dirty_buffers() {
        let (mut devices, mut pools) = host_device(MIN_SLOTS * 16);
        let mut host = HostBuffers::new(4);
        let buffers: Vec<_> = (0..MIN_SLOTS + 1).map(|_| host.allocate()).collect();
        let priorities = BufferPriorities::default();
        let mut worker = Worker::new(WorkerId::from(0), 0, &mut devices[0], &mut pools[0], 1.0, &host, DebugMask::default()).unwrap();
        assert_eq!(worker.capacity(), MIN_SLOTS);
        for &b in &buffers[..MIN_SLOTS] {
            worker.move_buffer_to_device(b, &mut host, &priorities, &[]).unwrap();
        }
        host.state_mut(buffers[0]).overwritten = true;
        let copies = worker.num_memcpies();
        // Priorities and last uses are equal, the lowest id goes first
        worker.move_buffer_to_device(buffers[MIN_SLOTS], &mut host, &priorities, &[buffers[MIN_SLOTS]]).unwrap();
        assert!(!worker.holds(buffers[0]));
        assert_eq!(host.holder(buffers[0]), None);
        assert_eq!(host.last_writer(buffers[0]), Some(WorkerId::from(0)));
        assert_eq!(worker.num_memcpies(), copies + 2);
        assert_eq!(worker.max_resident(), MIN_SLOTS);
        worker.flush(&mut host).unwrap();
        assert_eq!(host.holder(buffers[1]), None);
    }
}
