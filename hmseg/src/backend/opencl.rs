//! `OpenCL` backend

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use super::{Device, DeviceInfo, Event, MemoryPool, SlotId};
use crate::{
    error::{BackendError, ErrorStatus},
    kernels::Kernel,
    slab::Slab,
};
use libloading::Library;
use nanoserde::DeJson;
use std::{
    collections::BTreeMap,
    ffi::{c_void, CString},
    ptr,
    sync::Arc,
};

#[derive(Debug, Default, DeJson)]
pub struct OpenCLConfig {
    /// Select which platforms will be used by `OpenCL` backend
    /// If set to None, uses all available platforms.
    /// default = None
    pub platform_ids: Option<Vec<usize>>,
}

// Every device gets its own context, so each pool is tied to exactly one device
#[derive(Debug)]
pub struct OpenCLMemoryPool {
    // Just to close the connection
    #[allow(unused)]
    library: Arc<Library>,
    total_bytes: usize,
    free_bytes: usize,
    context: *mut c_void,
    queue: *mut c_void,
    buffers: Slab<SlotId, OpenCLBuffer>,
    // Functions
    clWaitForEvents: unsafe extern "C" fn(cl_uint, *const *mut c_void) -> OpenCLStatus,
    clReleaseCommandQueue: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus,
    clReleaseContext: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus,
    clReleaseMemObject: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus,
    clEnqueueReadBuffer: unsafe extern "C" fn(
        *mut c_void,
        *mut c_void,
        cl_uint,
        usize,
        usize,
        *mut c_void,
        cl_uint,
        *const *mut c_void,
        *mut *mut c_void,
    ) -> OpenCLStatus,
    clEnqueueWriteBuffer: unsafe extern "C" fn(
        *mut c_void,
        *mut c_void,
        cl_uint,
        usize,
        usize,
        *const c_void,
        cl_uint,
        *const *mut c_void,
        *mut *mut c_void,
    ) -> OpenCLStatus,
    clCreateBuffer: unsafe extern "C" fn(*mut c_void, cl_bitfield, usize, *mut c_void, *mut OpenCLStatus) -> *mut c_void,
}

#[derive(Debug)]
pub(super) struct OpenCLBuffer {
    buffer: *mut c_void,
    bytes: usize,
}

#[derive(Debug)]
pub struct OpenCLDevice {
    ptr: *mut c_void,
    dev_info: DeviceInfo,
    program: *mut c_void,
    kernels: BTreeMap<&'static str, *mut c_void>,
    // Same in-order queue as the memory pool of this device
    queue: *mut c_void,
    // Commands enqueued since the last finish
    load: usize,
    // Functions
    clGetProgramBuildInfo: unsafe extern "C" fn(*mut c_void, *mut c_void, cl_uint, usize, *mut c_void, *mut usize) -> OpenCLStatus,
    clBuildProgram: unsafe extern "C" fn(
        *mut c_void,
        cl_uint,
        *const *mut c_void,
        *const i8,
        Option<unsafe extern "C" fn(*mut c_void, *mut c_void)>,
        *mut c_void,
    ) -> OpenCLStatus,
    clReleaseProgram: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus,
    clReleaseKernel: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus,
    clCreateKernel: unsafe extern "C" fn(*mut c_void, *const i8, *mut OpenCLStatus) -> *mut c_void,
    clGetDeviceInfo: unsafe extern "C" fn(*mut c_void, cl_uint, usize, *mut c_void, *mut usize) -> OpenCLStatus,
    clSetKernelArg: unsafe extern "C" fn(*mut c_void, cl_uint, usize, *const c_void) -> OpenCLStatus,
    clCreateProgramWithSource:
        unsafe extern "C" fn(*mut c_void, cl_uint, *const *const i8, *const usize, *mut OpenCLStatus) -> *mut c_void,
    clEnqueueNDRangeKernel: unsafe extern "C" fn(
        *mut c_void,
        *mut c_void,
        cl_uint,
        *const usize,
        *const usize,
        *const usize,
        cl_uint,
        *const *mut c_void,
        *mut *mut c_void,
    ) -> OpenCLStatus,
    clFinish: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus,
}

#[derive(Debug, Clone)]
pub struct OpenCLEvent {
    pub event: *mut c_void,
}

// This definitely isn't correct, but for now...
unsafe impl Send for OpenCLMemoryPool {}
unsafe impl Send for OpenCLBuffer {}
unsafe impl Send for OpenCLDevice {}
unsafe impl Send for OpenCLEvent {}

// Queue is finished once this many commands are waiting in it
const MAX_QUEUE_LOAD: usize = 20;

macro_rules! load_fn {
    ($library:expr, $name:literal) => {
        *unsafe { $library.get(concat!($name, "\0").as_bytes()) }.map_err(|e| BackendError {
            status: ErrorStatus::DyLibNotFound,
            context: format!("{} not found in OpenCL runtime, {e}", $name).into(),
        })?
    };
}

pub(super) fn initialize_device(
    config: &OpenCLConfig,
    memory_pools: &mut Vec<MemoryPool>,
    devices: &mut Vec<Device>,
    debug_dev: bool,
) -> Result<(), BackendError> {
    if let Some(platform_ids) = &config.platform_ids {
        if platform_ids.is_empty() {
            if debug_dev {
                println!("OpenCL won't be used, as it was configured out");
            }
            return Ok(());
        }
    }
    let opencl_paths = [
        "/lib/libOpenCL.so",
        "/lib64/libOpenCL.so",
        "/lib/x86_64-linux-gnu/libOpenCL.so",
        "/lib64/x86_64-linux-gnu/libOpenCL.so",
        "/usr/lib/libOpenCL.so",
        "/usr/lib64/libOpenCL.so",
        "/usr/lib/x86_64-linux-gnu/libOpenCL.so",
        "/usr/lib64/x86_64-linux-gnu/libOpenCL.so",
        "/usr/lib/x86_64-linux-gnu/libOpenCL.so.1",
    ];
    let opencl = opencl_paths.iter().find_map(|path| unsafe { Library::new(path) }.ok());
    let Some(opencl) = opencl else {
        return Err(BackendError { status: ErrorStatus::DyLibNotFound, context: "OpenCL runtime not found.".into() });
    };
    let clGetPlatformIDs: unsafe extern "C" fn(cl_uint, *mut *mut c_void, *mut cl_uint) -> OpenCLStatus =
        load_fn!(opencl, "clGetPlatformIDs");
    let clCreateContext: unsafe extern "C" fn(
        *const isize,
        cl_uint,
        *const *mut c_void,
        Option<unsafe extern "C" fn(*const i8, *const c_void, usize, *mut c_void)>,
        *mut c_void,
        *mut OpenCLStatus,
    ) -> *mut c_void = load_fn!(opencl, "clCreateContext");
    let clCreateCommandQueue: unsafe extern "C" fn(*mut c_void, *mut c_void, cl_bitfield, *mut OpenCLStatus) -> *mut c_void =
        load_fn!(opencl, "clCreateCommandQueue");
    let clGetDeviceIDs: unsafe extern "C" fn(*mut c_void, cl_bitfield, cl_uint, *mut *mut c_void, *mut cl_uint) -> OpenCLStatus =
        load_fn!(opencl, "clGetDeviceIDs");
    let clWaitForEvents = load_fn!(opencl, "clWaitForEvents");
    let clReleaseCommandQueue: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus = load_fn!(opencl, "clReleaseCommandQueue");
    let clEnqueueNDRangeKernel = load_fn!(opencl, "clEnqueueNDRangeKernel");
    let clGetProgramBuildInfo = load_fn!(opencl, "clGetProgramBuildInfo");
    let clBuildProgram = load_fn!(opencl, "clBuildProgram");
    let clReleaseProgram = load_fn!(opencl, "clReleaseProgram");
    let clReleaseKernel = load_fn!(opencl, "clReleaseKernel");
    let clReleaseContext: unsafe extern "C" fn(*mut c_void) -> OpenCLStatus = load_fn!(opencl, "clReleaseContext");
    let clSetKernelArg = load_fn!(opencl, "clSetKernelArg");
    let clCreateKernel = load_fn!(opencl, "clCreateKernel");
    let clReleaseMemObject = load_fn!(opencl, "clReleaseMemObject");
    let clGetDeviceInfo = load_fn!(opencl, "clGetDeviceInfo");
    let clCreateProgramWithSource = load_fn!(opencl, "clCreateProgramWithSource");
    let clEnqueueReadBuffer = load_fn!(opencl, "clEnqueueReadBuffer");
    let clEnqueueWriteBuffer = load_fn!(opencl, "clEnqueueWriteBuffer");
    let clCreateBuffer = load_fn!(opencl, "clCreateBuffer");
    let clFinish = load_fn!(opencl, "clFinish");

    let library = Arc::new(opencl);
    let platform_ids = {
        let mut count: cl_uint = 0;
        unsafe { clGetPlatformIDs(0, ptr::null_mut(), &mut count) }.check(ErrorStatus::DeviceEnumeration)?;
        let mut ids: Vec<*mut c_void> = vec![ptr::null_mut(); count as usize];
        if count > 0 {
            unsafe { clGetPlatformIDs(count, ids.as_mut_ptr(), ptr::null_mut()) }.check(ErrorStatus::DeviceEnumeration)?;
        }
        ids
    };
    for (platform_id, &platform) in platform_ids
        .iter()
        .enumerate()
        .filter(|(id, _)| config.platform_ids.as_ref().map_or(true, |ids| ids.contains(id)))
    {
        let device_ids = {
            let mut count: cl_uint = 0;
            let status = unsafe { clGetDeviceIDs(platform, CL_DEVICE_TYPE_ALL, 0, ptr::null_mut(), &mut count) };
            if status != OpenCLStatus::CL_SUCCESS || count == 0 {
                if debug_dev {
                    println!("OpenCL platform {platform_id} has no usable devices, {status:?}");
                }
                continue;
            }
            let mut ids: Vec<*mut c_void> = vec![ptr::null_mut(); count as usize];
            let status = unsafe { clGetDeviceIDs(platform, CL_DEVICE_TYPE_ALL, count, ids.as_mut_ptr(), ptr::null_mut()) };
            if status != OpenCLStatus::CL_SUCCESS {
                continue;
            }
            ids
        };
        if debug_dev {
            println!("Using OpenCL platform, platform id {platform_id} on devices:");
        }
        for dev in device_ids {
            let mut status = OpenCLStatus::CL_SUCCESS;
            let context = unsafe { clCreateContext(ptr::null(), 1, [dev].as_ptr(), None, ptr::null_mut(), &mut status) };
            if status.check(ErrorStatus::Initialization).is_err() {
                continue;
            }
            let queue = unsafe { clCreateCommandQueue(context, dev, 0, &mut status) };
            if status.check(ErrorStatus::Initialization).is_err() {
                let _ = unsafe { clReleaseContext(context) };
                continue;
            }
            let mut device = OpenCLDevice {
                ptr: dev,
                dev_info: DeviceInfo::default(),
                program: ptr::null_mut(),
                kernels: BTreeMap::new(),
                queue,
                load: 0,
                clGetProgramBuildInfo,
                clBuildProgram,
                clReleaseProgram,
                clReleaseKernel,
                clCreateKernel,
                clGetDeviceInfo,
                clSetKernelArg,
                clCreateProgramWithSource,
                clEnqueueNDRangeKernel,
                clFinish,
            };
            let setup = device.set_info(debug_dev).and_then(|()| device.compile(context));
            if let Err(err) = setup {
                if debug_dev {
                    println!("{err}");
                }
                let _ = unsafe { clReleaseCommandQueue(queue) };
                let _ = unsafe { clReleaseContext(context) };
                continue;
            }
            let total_bytes = device.dev_info.memory_bytes;
            devices.push(Device::OpenCL(device));
            memory_pools.push(MemoryPool::OpenCL(OpenCLMemoryPool {
                library: library.clone(),
                total_bytes,
                free_bytes: total_bytes,
                context,
                queue,
                buffers: Slab::new(),
                clWaitForEvents,
                clReleaseCommandQueue,
                clReleaseContext,
                clReleaseMemObject,
                clEnqueueReadBuffer,
                clEnqueueWriteBuffer,
                clCreateBuffer,
            }));
        }
    }
    Ok(())
}

impl OpenCLMemoryPool {
    pub fn deinitialize(&mut self) {
        let slots: Vec<SlotId> = self.buffers.ids().collect();
        for slot in slots {
            self.deallocate(slot, Vec::new());
        }
        if !self.queue.is_null() {
            let _ = unsafe { (self.clReleaseCommandQueue)(self.queue) }.check(ErrorStatus::Deinitialization);
            self.queue = ptr::null_mut();
        }
        if !self.context.is_null() {
            let _ = unsafe { (self.clReleaseContext)(self.context) }.check(ErrorStatus::Deinitialization);
            self.context = ptr::null_mut();
        }
    }

    pub const fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn allocate(&mut self, bytes: usize) -> Result<(SlotId, Event), BackendError> {
        if bytes > self.free_bytes {
            return Err(BackendError {
                status: ErrorStatus::MemoryAllocation,
                context: format!("Allocation failure, {bytes} B requested out of {} B", self.total_bytes).into(),
            });
        }
        let mut status = OpenCLStatus::CL_SUCCESS;
        let buffer = unsafe { (self.clCreateBuffer)(self.context, CL_MEM_READ_WRITE, bytes, ptr::null_mut(), &mut status) };
        status.check(ErrorStatus::MemoryAllocation)?;
        self.free_bytes -= bytes;
        Ok((self.buffers.push(OpenCLBuffer { buffer, bytes }), Event::OpenCL(OpenCLEvent { event: ptr::null_mut() })))
    }

    pub fn deallocate(&mut self, slot: SlotId, event_wait_list: Vec<Event>) {
        let _ = self.sync_events(event_wait_list);
        let Some(buffer) = self.buffers.remove(slot) else { return };
        debug_assert!(!buffer.buffer.is_null(), "Deallocating null buffer is invalid");
        let _ = unsafe { (self.clReleaseMemObject)(buffer.buffer) }.check(ErrorStatus::Deinitialization);
        self.free_bytes += buffer.bytes;
    }

    pub fn host_to_pool(&mut self, src: &[f32], dst: SlotId, event_wait_list: Vec<Event>) -> Result<Event, BackendError> {
        let Some(dst) = self.buffers.get(dst) else {
            return Err(BackendError { status: ErrorStatus::MemoryCopyH2P, context: format!("Slot {dst:?} is not allocated").into() });
        };
        let bytes = std::mem::size_of_val(src);
        if bytes != dst.bytes {
            return Err(BackendError {
                status: ErrorStatus::MemoryCopyH2P,
                context: format!("Copying {bytes} B into slot of {} B", dst.bytes).into(),
            });
        }
        let event_wait_list = raw_events(event_wait_list);
        let mut event = ptr::null_mut();
        // Blocking write, src does not need to outlive this call
        unsafe {
            (self.clEnqueueWriteBuffer)(
                self.queue,
                dst.buffer,
                CL_BLOCKING,
                0,
                bytes,
                src.as_ptr().cast(),
                cl_uint::try_from(event_wait_list.len()).unwrap_or(cl_uint::MAX),
                if event_wait_list.is_empty() { ptr::null() } else { event_wait_list.as_ptr() },
                &mut event,
            )
        }
        .check(ErrorStatus::MemoryCopyH2P)?;
        Ok(Event::OpenCL(OpenCLEvent { event }))
    }

    pub fn pool_to_host(&mut self, src: SlotId, dst: &mut [f32], event_wait_list: Vec<Event>) -> Result<(), BackendError> {
        self.sync_events(event_wait_list)?;
        let Some(src) = self.buffers.get(src) else {
            return Err(BackendError { status: ErrorStatus::MemoryCopyP2H, context: format!("Slot {src:?} is not allocated").into() });
        };
        let bytes = std::mem::size_of_val(dst);
        if bytes != src.bytes {
            return Err(BackendError {
                status: ErrorStatus::MemoryCopyP2H,
                context: format!("Copying slot of {} B into {bytes} B", src.bytes).into(),
            });
        }
        debug_assert!(!src.buffer.is_null(), "Trying to read null memory. Internal bug.");
        let mut event: *mut c_void = ptr::null_mut();
        unsafe {
            (self.clEnqueueReadBuffer)(
                self.queue,
                src.buffer,
                CL_NON_BLOCKING,
                0,
                bytes,
                dst.as_mut_ptr().cast(),
                0,
                ptr::null(),
                &mut event,
            )
        }
        .check(ErrorStatus::MemoryCopyP2H)?;
        let events = [event];
        unsafe { (self.clWaitForEvents)(1, events.as_ptr()) }.check(ErrorStatus::MemoryCopyP2H)?;
        Ok(())
    }

    pub fn sync_events(&mut self, events: Vec<Event>) -> Result<(), BackendError> {
        let events = raw_events(events);
        if !events.is_empty() {
            unsafe { (self.clWaitForEvents)(cl_uint::try_from(events.len()).unwrap_or(cl_uint::MAX), events.as_ptr()) }
                .check(ErrorStatus::KernelSync)?;
        }
        Ok(())
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn release_events(&mut self, events: Vec<Event>) {
        let _ = self;
        // Events are owned by the runtime until the queue is released
        let _ = events;
    }
}

fn raw_events(events: Vec<Event>) -> Vec<*mut c_void> {
    events
        .into_iter()
        .filter_map(|event| match event {
            Event::OpenCL(OpenCLEvent { event }) => Some(event),
            Event::Host => None,
        })
        .filter(|event| !event.is_null())
        .collect()
}

/// Scalar or buffer argument of an `OpenCL` kernel
#[derive(Debug, Clone, Copy)]
enum KernelArg {
    Slot(SlotId),
    F32(f32),
    I32(i32),
}

/// Lowers kernel to launches of kernels in [`PROGRAM_SOURCE`]
fn launches(kernel: &Kernel, args: &[SlotId], size: i32) -> Vec<(&'static str, Vec<KernelArg>)> {
    let slots: Vec<KernelArg> = args.iter().map(|&s| KernelArg::Slot(s)).collect();
    let grid = |extent: [usize; 3]| {
        [
            KernelArg::I32(i32::try_from(extent[0]).unwrap_or(i32::MAX)),
            KernelArg::I32(i32::try_from(extent[1]).unwrap_or(i32::MAX)),
        ]
    };
    let with = |scalars: &[KernelArg]| {
        let mut slots = slots.clone();
        slots.extend_from_slice(scalars);
        slots.push(KernelArg::I32(size));
        slots
    };
    match *kernel {
        Kernel::Zero => vec![("hmseg_fill", with(&[KernelArg::F32(0.0)]))],
        Kernel::Fill(value) => vec![("hmseg_fill", with(&[KernelArg::F32(value)]))],
        Kernel::Sum => vec![("hmseg_sum_scaled", with(&[KernelArg::F32(1.0)]))],
        Kernel::SumScaled(scale) => vec![("hmseg_sum_scaled", with(&[KernelArg::F32(scale)]))],
        Kernel::Copy => vec![("hmseg_copy", with(&[]))],
        Kernel::Min | Kernel::Constrain => vec![("hmseg_min", with(&[]))],
        Kernel::Div => vec![("hmseg_div", with(&[]))],
        Kernel::DivAndStore(value) => vec![("hmseg_div_and_store", with(&[KernelArg::F32(value)]))],
        Kernel::Label => vec![("hmseg_label", with(&[]))],
        Kernel::LeafSink { cc } => vec![("hmseg_leaf_sink", with(&[KernelArg::F32(cc)]))],
        Kernel::UpdateLabel { cc } => vec![("hmseg_update_label", with(&[KernelArg::F32(cc)]))],
        Kernel::StoreSourceFlow { cc, multiplicity } => {
            vec![("hmseg_store_source_flow", with(&[KernelArg::F32(cc), KernelArg::F32(multiplicity)]))]
        }
        Kernel::PushSourceFlow { cc } => vec![("hmseg_push_source_flow", with(&[KernelArg::F32(cc)]))],
        Kernel::StoreSinkFlow { cc } => vec![("hmseg_sink_flow", with(&[KernelArg::F32(cc), KernelArg::F32(0.0)]))],
        Kernel::AccumulateSinkFlow { cc } => vec![("hmseg_sink_flow", with(&[KernelArg::F32(cc), KernelArg::F32(1.0)]))],
        Kernel::GradientStep { step, cc } => {
            vec![("hmseg_gradient_step", with(&[KernelArg::F32(step), KernelArg::F32(cc)]))]
        }
        Kernel::ApplyStep { extent } => vec![("hmseg_apply_step", with(&grid(extent)))],
        Kernel::FlowMagnitude { alpha, extent } => {
            let [vx, vy] = grid(extent);
            if slots.len() == 5 {
                vec![("hmseg_flow_magnitude_smooth", with(&[KernelArg::F32(alpha), vx, vy]))]
            } else {
                vec![("hmseg_flow_magnitude", with(&[KernelArg::F32(alpha), vx, vy]))]
            }
        }
        // Both passes take [div, fx, fy, fz, vx, vy, size]
        Kernel::Project { extent } => {
            vec![("hmseg_project_flows", with(&grid(extent))), ("hmseg_divergence", with(&grid(extent)))]
        }
    }
}

impl OpenCLDevice {
    pub fn deinitialize(&mut self) {
        for (_, kernel) in std::mem::take(&mut self.kernels) {
            let _ = unsafe { (self.clReleaseKernel)(kernel) }.check(ErrorStatus::Deinitialization);
        }
        if !self.program.is_null() {
            let _ = unsafe { (self.clReleaseProgram)(self.program) }.check(ErrorStatus::Deinitialization);
            self.program = ptr::null_mut();
        }
    }

    pub const fn info(&self) -> &DeviceInfo {
        &self.dev_info
    }

    /// Waits for the queue once too many commands are pending
    pub fn reserve(&mut self) -> Result<(), BackendError> {
        if self.load > MAX_QUEUE_LOAD {
            unsafe { (self.clFinish)(self.queue) }.check(ErrorStatus::KernelSync)?;
            self.load = 0;
        }
        Ok(())
    }

    fn compile(&mut self, context: *mut c_void) -> Result<(), BackendError> {
        let sources: [*const i8; 1] = [PROGRAM_SOURCE.as_ptr().cast()];
        let mut status = OpenCLStatus::CL_SUCCESS;
        let program = unsafe {
            (self.clCreateProgramWithSource)(context, 1, sources.as_ptr(), [PROGRAM_SOURCE.len()].as_ptr(), &mut status)
        };
        status.check(ErrorStatus::KernelCompilation)?;
        self.program = program;
        if let Err(mut e) = unsafe { (self.clBuildProgram)(program, 1, [self.ptr].as_ptr(), ptr::null(), None, ptr::null_mut()) }
            .check(ErrorStatus::KernelCompilation)
        {
            if let Ok(build_log) = self.get_program_build_data(program, CL_PROGRAM_BUILD_LOG) {
                e.context = format!("{}\n{}", e.context, String::from_utf8_lossy(&build_log)).into();
            }
            return Err(e);
        }
        for name in KERNEL_NAMES {
            let c_name = CString::new(name).map_err(|_| BackendError {
                status: ErrorStatus::KernelCompilation,
                context: format!("Invalid kernel name {name}").into(),
            })?;
            let kernel = unsafe { (self.clCreateKernel)(program, c_name.as_ptr().cast(), &mut status) };
            status.check(ErrorStatus::KernelCompilation)?;
            self.kernels.insert(name, kernel);
        }
        Ok(())
    }

    pub fn launch(
        &mut self,
        kernel: &Kernel,
        memory_pool: &mut OpenCLMemoryPool,
        args: &[SlotId],
        event_wait_list: Vec<Event>,
    ) -> Result<Event, BackendError> {
        let size = memory_pool.buffers.get(args.first().copied().unwrap_or(SlotId::from(0))).map_or(0, |b| b.bytes / 4);
        let size_arg = i32::try_from(size).map_err(|_| BackendError {
            status: ErrorStatus::IncorrectKernelArg,
            context: format!("Volume of {size} voxels does not fit OpenCL int").into(),
        })?;
        let mut event_wait_list = raw_events(event_wait_list);
        let mut event: *mut c_void = ptr::null_mut();
        for (name, kernel_args) in launches(kernel, args, size_arg) {
            let Some(&cl_kernel) = self.kernels.get(name) else {
                return Err(BackendError { status: ErrorStatus::KernelLaunch, context: format!("Kernel {name} not compiled").into() });
            };
            for (i, arg) in kernel_args.iter().enumerate() {
                let i = cl_uint::try_from(i).unwrap_or(cl_uint::MAX);
                let status = match arg {
                    KernelArg::Slot(slot) => {
                        let Some(buffer) = memory_pool.buffers.get(*slot) else {
                            return Err(BackendError {
                                status: ErrorStatus::IncorrectKernelArg,
                                context: format!("{kernel:?} got unallocated slot {slot:?}").into(),
                            });
                        };
                        let ptr: *const _ = &buffer.buffer;
                        unsafe { (self.clSetKernelArg)(cl_kernel, i, std::mem::size_of::<*mut c_void>(), ptr.cast()) }
                    }
                    KernelArg::F32(value) => {
                        let ptr: *const f32 = value;
                        unsafe { (self.clSetKernelArg)(cl_kernel, i, std::mem::size_of::<f32>(), ptr.cast()) }
                    }
                    KernelArg::I32(value) => {
                        let ptr: *const i32 = value;
                        unsafe { (self.clSetKernelArg)(cl_kernel, i, std::mem::size_of::<i32>(), ptr.cast()) }
                    }
                };
                status.check(ErrorStatus::IncorrectKernelArg)?;
            }
            let global_work_size = [size.div_ceil(LOCAL_WORK_SIZE) * LOCAL_WORK_SIZE];
            let local_work_size = [LOCAL_WORK_SIZE];
            unsafe {
                (self.clEnqueueNDRangeKernel)(
                    self.queue,
                    cl_kernel,
                    1,
                    ptr::null(),
                    global_work_size.as_ptr(),
                    local_work_size.as_ptr(),
                    cl_uint::try_from(event_wait_list.len()).unwrap_or(cl_uint::MAX),
                    if event_wait_list.is_empty() { ptr::null() } else { event_wait_list.as_ptr() },
                    &mut event,
                )
            }
            .check(ErrorStatus::KernelLaunch)?;
            self.load += 1;
            event_wait_list = vec![event];
        }
        Ok(Event::OpenCL(OpenCLEvent { event }))
    }

    fn set_info(&mut self, debug_dev: bool) -> Result<(), BackendError> {
        let name = self.get_device_data(CL_DEVICE_NAME)?;
        let name = String::from_utf8_lossy(&name).trim_end_matches('\0').to_string();
        if debug_dev {
            println!("{name}");
        }
        let memory_bytes = u64::from_ne_bytes(self.get_device_data(CL_DEVICE_GLOBAL_MEM_SIZE)?.try_into().map_err(|_| {
            BackendError { status: ErrorStatus::DeviceQuery, context: "Unexpected size of global memory size".into() }
        })?);
        let compute_units = u32::from_ne_bytes(self.get_device_data(CL_DEVICE_MAX_COMPUTE_UNITS)?.try_into().map_err(|_| {
            BackendError { status: ErrorStatus::DeviceQuery, context: "Unexpected size of compute units".into() }
        })?);
        self.dev_info = DeviceInfo {
            name,
            // We can only guess flops without a table of concrete hardware
            compute: u128::from(compute_units) * 64 * 1024 * 1024 * 1024,
            memory_bytes: usize::try_from(memory_bytes).unwrap_or(usize::MAX),
        };
        Ok(())
    }

    fn get_device_data(&mut self, param_name: cl_uint) -> Result<Vec<u8>, BackendError> {
        let mut size: usize = 0;
        let status = unsafe { (self.clGetDeviceInfo)(self.ptr, param_name, 0, ptr::null_mut(), &mut size) };
        if status != OpenCLStatus::CL_SUCCESS {
            return Err(BackendError {
                status: ErrorStatus::DeviceQuery,
                context: format!("Failed to get device info {param_name}, {status:?}").into(),
            });
        }
        let mut data: Vec<u8> = vec![0; size];
        if size > 0 {
            unsafe { (self.clGetDeviceInfo)(self.ptr, param_name, size, data.as_mut_ptr().cast(), ptr::null_mut()) }
                .check(ErrorStatus::DeviceQuery)?;
        }
        Ok(data)
    }

    fn get_program_build_data(&mut self, program: *mut c_void, param_name: cl_uint) -> Result<Vec<u8>, OpenCLStatus> {
        let mut size: usize = 0;
        let status = unsafe { (self.clGetProgramBuildInfo)(program, self.ptr, param_name, 0, ptr::null_mut(), &mut size) };
        if status != OpenCLStatus::CL_SUCCESS {
            return Err(status);
        }
        let mut data: Vec<u8> = vec![0; size];
        if size > 0 {
            let status = unsafe {
                (self.clGetProgramBuildInfo)(program, self.ptr, param_name, size, data.as_mut_ptr().cast(), ptr::null_mut())
            };
            if status != OpenCLStatus::CL_SUCCESS {
                return Err(status);
            }
        }
        Ok(data)
    }
}

impl OpenCLStatus {
    fn check(self, status: ErrorStatus) -> Result<(), BackendError> {
        if self == Self::CL_SUCCESS {
            Ok(())
        } else {
            Err(BackendError { status, context: format!("{self:?}").into() })
        }
    }
}

const LOCAL_WORK_SIZE: usize = 256;

const KERNEL_NAMES: [&str; 18] = [
    "hmseg_fill",
    "hmseg_sum_scaled",
    "hmseg_copy",
    "hmseg_min",
    "hmseg_div",
    "hmseg_div_and_store",
    "hmseg_label",
    "hmseg_leaf_sink",
    "hmseg_update_label",
    "hmseg_store_source_flow",
    "hmseg_push_source_flow",
    "hmseg_sink_flow",
    "hmseg_gradient_step",
    "hmseg_apply_step",
    "hmseg_flow_magnitude",
    "hmseg_flow_magnitude_smooth",
    "hmseg_project_flows",
    "hmseg_divergence",
];

// Neighbourhood kernels take vx, vy and size, the z offset is vx*vy
const PROGRAM_SOURCE: &str = r"
__kernel void hmseg_fill(__global float* out, float value, int size) {
  int x = get_global_id(0);
  if (x < size) out[x] = value;
}

__kernel void hmseg_sum_scaled(__global float* out, __global const float* in, float scale, int size) {
  int x = get_global_id(0);
  if (x < size) out[x] += scale * in[x];
}

__kernel void hmseg_copy(__global float* out, __global const float* in, int size) {
  int x = get_global_id(0);
  if (x < size) out[x] = in[x];
}

__kernel void hmseg_min(__global float* out, __global const float* in, int size) {
  int x = get_global_id(0);
  if (x < size) out[x] = (out[x] > in[x]) ? in[x] : out[x];
}

__kernel void hmseg_div(__global float* out, __global const float* in, int size) {
  int x = get_global_id(0);
  if (x < size) out[x] /= in[x];
}

__kernel void hmseg_div_and_store(__global float* out, __global const float* in, float value, int size) {
  int x = get_global_id(0);
  if (x < size) out[x] = in[x] / value;
}

__kernel void hmseg_label(__global float* label, __global const float* sink, __global const float* cap, int size) {
  int x = get_global_id(0);
  if (x < size) label[x] = (sink[x] == cap[x]) ? 1.0f : 0.0f;
}

__kernel void hmseg_leaf_sink(__global float* sink, __global const float* inc, __global const float* div,
                              __global const float* label, float cc, int size) {
  int x = get_global_id(0);
  if (x < size) sink[x] = inc[x] - div[x] + label[x] / cc;
}

__kernel void hmseg_update_label(__global float* label, __global const float* sink, __global const float* inc,
                                 __global const float* div, float cc, int size) {
  int x = get_global_id(0);
  if (x < size) label[x] = clamp(label[x] + cc * (inc[x] - div[x] - sink[x]), 0.0f, 1.0f);
}

__kernel void hmseg_store_source_flow(__global float* working, __global const float* sink, __global const float* div,
                                      __global const float* label, __global const float* source,
                                      __global const float* exclude, float cc, float m, int size) {
  int x = get_global_id(0);
  if (x < size) working[x] += (sink[x] + div[x] - source[x] + m * exclude[x] - label[x] / cc) * m;
}

__kernel void hmseg_push_source_flow(__global float* working, __global const float* sink, __global const float* div,
                                     __global const float* label, float cc, int size) {
  int x = get_global_id(0);
  if (x < size) working[x] += sink[x] + div[x] - label[x] / cc;
}

__kernel void hmseg_sink_flow(__global float* working, __global const float* inc, __global const float* div,
                              __global const float* label, float cc, float keep, int size) {
  int x = get_global_id(0);
  if (x < size) working[x] = keep * working[x] + inc[x] - div[x] + label[x] / cc;
}

__kernel void hmseg_gradient_step(__global float* div, __global const float* sink, __global const float* inc,
                                  __global const float* label, float step, float cc, int size) {
  int x = get_global_id(0);
  if (x < size) div[x] = step * (sink[x] + div[x] - inc[x] - label[x] / cc);
}

__kernel void hmseg_apply_step(__global float* fx, __global float* fy, __global float* fz, __global const float* div,
                               int vx, int vy, int size) {
  int x = get_global_id(0);
  if (x >= size) return;
  float c = div[x];
  fx[x] -= c - ((x % vx) ? div[x - 1] : c);
  fy[x] -= c - (((x / vx) % vy) ? div[x - vx] : c);
  fz[x] -= c - ((x >= vx * vy) ? div[x - vx * vy] : c);
}

float hmseg_magnitude(__global const float* fx, __global const float* fy, __global const float* fz,
                      int x, int vx, int vy, int size) {
  float m = fx[x] * fx[x] + fy[x] * fy[x] + fz[x] * fz[x];
  if ((x + 1) % vx) m += fx[x + 1] * fx[x + 1];
  if ((x / vx + 1) % vy) m += fy[x + vx] * fy[x + vx];
  if (x + vx * vy < size) m += fz[x + vx * vy] * fz[x + vx * vy];
  return sqrt(m);
}

__kernel void hmseg_flow_magnitude(__global float* div, __global const float* fx, __global const float* fy,
                                   __global const float* fz, float alpha, int vx, int vy, int size) {
  int x = get_global_id(0);
  if (x >= size) return;
  float m = hmseg_magnitude(fx, fy, fz, x, vx, vy, size);
  div[x] = (m > alpha) ? alpha / m : 1.0f;
}

__kernel void hmseg_flow_magnitude_smooth(__global float* div, __global const float* fx, __global const float* fy,
                                          __global const float* fz, __global const float* smooth, float alpha,
                                          int vx, int vy, int size) {
  int x = get_global_id(0);
  if (x >= size) return;
  float m = hmseg_magnitude(fx, fy, fz, x, vx, vy, size);
  float limit = alpha * smooth[x];
  div[x] = (m > limit) ? limit / m : 1.0f;
}

__kernel void hmseg_project_flows(__global const float* div, __global float* fx, __global float* fy, __global float* fz,
                                  int vx, int vy, int size) {
  int x = get_global_id(0);
  if (x >= size) return;
  float c = div[x];
  fx[x] *= 0.5f * (c + ((x % vx) ? div[x - 1] : -c));
  fy[x] *= 0.5f * (c + (((x / vx) % vy) ? div[x - vx] : -c));
  fz[x] *= 0.5f * (c + ((x >= vx * vy) ? div[x - vx * vy] : -c));
}

__kernel void hmseg_divergence(__global float* div, __global const float* fx, __global const float* fy,
                               __global const float* fz, int vx, int vy, int size) {
  int x = get_global_id(0);
  if (x >= size) return;
  float d = fx[x] + fy[x] + fz[x];
  if ((x + 1) % vx) d -= fx[x + 1];
  if ((x / vx + 1) % vy) d -= fy[x + vx];
  if (x + vx * vy < size) d -= fz[x + vx * vy];
  div[x] = d;
}
";

type cl_int = i32;
type cl_uint = u32;
type cl_bitfield = u64;

const CL_DEVICE_NAME: cl_uint = 0x102B; // 4139
const CL_DEVICE_GLOBAL_MEM_SIZE: cl_uint = 0x101F; // 4127
const CL_DEVICE_MAX_COMPUTE_UNITS: cl_uint = 0x1002; // 4098
const CL_DEVICE_TYPE_ALL: cl_bitfield = 0xFFFF_FFFF;
const CL_MEM_READ_WRITE: cl_bitfield = 1;
const CL_NON_BLOCKING: cl_uint = 0;
const CL_BLOCKING: cl_uint = 1;
const CL_PROGRAM_BUILD_LOG: cl_uint = 0x1183; // 4483

#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, PartialEq, Debug, Eq)]
#[repr(C)]
enum OpenCLStatus {
    CL_DEVICE_NOT_FOUND = -1, // 0xFFFF_FFFF
    CL_SUCCESS = 0,
    CL_MEM_OBJECT_ALLOCATION_FAILURE = -4,
    CL_OUT_OF_RESOURCES = -5,
    CL_OUT_OF_HOST_MEMORY = -6,
    CL_BUILD_PROGRAM_FAILURE = -11,
    CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST = -14,
    CL_INVALID_VALUE = -30,
    CL_INVALID_DEVICE = -33,
    CL_INVALID_CONTEXT = -34,
    CL_INVALID_COMMAND_QUEUE = -36,
    CL_INVALID_MEM_OBJECT = -38,
    CL_INVALID_BINARY = -42,
    CL_INVALID_BUILD_OPTIONS = -43,
    CL_INVALID_PROGRAM = -44,
    CL_INVALID_PROGRAM_EXECUTABLE = -45,
    CL_INVALID_KERNEL_NAME = -46,
    CL_INVALID_KERNEL_DEFINITION = -47,
    CL_INVALID_KERNEL = -48,
    CL_INVALID_ARG_INDEX = -49,
    CL_INVALID_ARG_VALUE = -50,
    CL_INVALID_ARG_SIZE = -51,
    CL_INVALID_KERNEL_ARGS = -52,
    CL_INVALID_WORK_DIMENSION = -53,
    CL_INVALID_WORK_GROUP_SIZE = -54,
    CL_INVALID_WORK_ITEM_SIZE = -55,
    CL_INVALID_GLOBAL_OFFSET = -56,
    CL_INVALID_EVENT_WAIT_LIST = -57,
    CL_INVALID_EVENT = -58,
    CL_INVALID_OPERATION = -59,
    CL_INVALID_BUFFER_SIZE = -61,
    CL_INVALID_GLOBAL_WORK_SIZE = -63,
    UNKNOWN,
}

impl From<cl_int> for OpenCLStatus {
    fn from(status: cl_int) -> Self {
        match status {
            -1 => Self::CL_DEVICE_NOT_FOUND,
            0 => Self::CL_SUCCESS,
            -4 => Self::CL_MEM_OBJECT_ALLOCATION_FAILURE,
            -5 => Self::CL_OUT_OF_RESOURCES,
            -6 => Self::CL_OUT_OF_HOST_MEMORY,
            -11 => Self::CL_BUILD_PROGRAM_FAILURE,
            -14 => Self::CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST,
            -30 => Self::CL_INVALID_VALUE,
            -33 => Self::CL_INVALID_DEVICE,
            -34 => Self::CL_INVALID_CONTEXT,
            -36 => Self::CL_INVALID_COMMAND_QUEUE,
            -38 => Self::CL_INVALID_MEM_OBJECT,
            -42 => Self::CL_INVALID_BINARY,
            -43 => Self::CL_INVALID_BUILD_OPTIONS,
            -44 => Self::CL_INVALID_PROGRAM,
            -45 => Self::CL_INVALID_PROGRAM_EXECUTABLE,
            -46 => Self::CL_INVALID_KERNEL_NAME,
            -47 => Self::CL_INVALID_KERNEL_DEFINITION,
            -48 => Self::CL_INVALID_KERNEL,
            -49 => Self::CL_INVALID_ARG_INDEX,
            -50 => Self::CL_INVALID_ARG_VALUE,
            -51 => Self::CL_INVALID_ARG_SIZE,
            -52 => Self::CL_INVALID_KERNEL_ARGS,
            -53 => Self::CL_INVALID_WORK_DIMENSION,
            -54 => Self::CL_INVALID_WORK_GROUP_SIZE,
            -55 => Self::CL_INVALID_WORK_ITEM_SIZE,
            -56 => Self::CL_INVALID_GLOBAL_OFFSET,
            -57 => Self::CL_INVALID_EVENT_WAIT_LIST,
            -58 => Self::CL_INVALID_EVENT,
            -59 => Self::CL_INVALID_OPERATION,
            -61 => Self::CL_INVALID_BUFFER_SIZE,
            -63 => Self::CL_INVALID_GLOBAL_WORK_SIZE,
            _ => Self::UNKNOWN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{launches, KernelArg, KERNEL_NAMES, PROGRAM_SOURCE};
    use crate::{backend::SlotId, kernels::Kernel};

    #[test]
    fn every_kernel_is_in_program() {
        for name in KERNEL_NAMES {
            assert!(PROGRAM_SOURCE.contains(&format!("__kernel void {name}(")), "{name}");
        }
    }

    #[test]
    fn project_lowers_to_two_launches() {
        let slots: Vec<SlotId> = (0..4).map(SlotId::from).collect();
        let launches = launches(&Kernel::Project { extent: [4, 3, 2] }, &slots, 24);
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].0, "hmseg_project_flows");
        assert_eq!(launches[1].0, "hmseg_divergence");
        // div, fx, fy, fz, vx, vy, size
        let divergence = &launches[1].1;
        assert_eq!(divergence.len(), 7);
        assert!(matches!(divergence[0], KernelArg::Slot(s) if s == SlotId::from(0)));
        assert!(matches!(divergence[3], KernelArg::Slot(s) if s == SlotId::from(3)));
        assert!(matches!(divergence[4], KernelArg::I32(4)));
        assert!(matches!(divergence[6], KernelArg::I32(24)));
    }
}
