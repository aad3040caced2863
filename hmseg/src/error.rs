use std::fmt::Display;

/// Enumeration representing the various errors that can occur during segmentation.
#[derive(Debug)]
pub enum SegError {
    /// Hierarchy is not a rooted tree or DAG, or the scheduler got a topology it can not run
    HierarchyError(Box<str>),
    /// Missing or inconsistent input volumes or parameters
    InputError(Box<str>),
    /// Device buffer pool could not be acquired
    AllocationError(Box<str>),
    /// None of the selected devices are available
    NoDeviceAvailable,
    /// Error from file operations
    IOError(std::io::Error),
    /// Error parsing config
    ParseError(Box<str>),
    /// Task graph wiring bug, the run can not finish
    Internal(Box<str>),
    /// Error returned by backends
    BackendError(BackendError),
}

impl SegError {
    /// Hierarchy error
    #[track_caller]
    pub fn hierarchy_error(e: impl Into<String>) -> Self {
        Self::HierarchyError(with_location(e.into()))
    }

    /// Input error
    #[track_caller]
    pub fn input_error(e: impl Into<String>) -> Self {
        Self::InputError(with_location(e.into()))
    }

    /// Allocation error
    #[track_caller]
    pub fn allocation_error(e: impl Into<String>) -> Self {
        Self::AllocationError(with_location(e.into()))
    }

    /// Parse error
    #[track_caller]
    pub fn parse_error(e: impl Into<String>) -> Self {
        Self::ParseError(with_location(e.into()))
    }

    /// Internal error
    #[track_caller]
    pub fn internal(e: impl Into<String>) -> Self {
        Self::Internal(with_location(e.into()))
    }
}

#[track_caller]
fn with_location(mut e: String) -> Box<str> {
    use std::fmt::Write;
    let location = std::panic::Location::caller();
    let _ = write!(e, ", {}:{}:{}", location.file(), location.line(), location.column());
    e.into()
}

impl std::fmt::Display for SegError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegError::HierarchyError(e) => f.write_fmt(format_args!("Hierarchy {e}")),
            SegError::InputError(e) => f.write_fmt(format_args!("Input {e}")),
            SegError::AllocationError(e) => f.write_fmt(format_args!("Allocation error {e}")),
            SegError::NoDeviceAvailable => f.write_str("No available device"),
            SegError::IOError(e) => f.write_fmt(format_args!("IO {e}")),
            SegError::ParseError(e) => f.write_fmt(format_args!("Parse {e}")),
            SegError::Internal(e) => f.write_fmt(format_args!("Internal {e}")),
            SegError::BackendError(e) => f.write_fmt(format_args!("Backend {e}")),
        }
    }
}

impl std::error::Error for SegError {}

impl From<std::io::Error> for SegError {
    #[track_caller]
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}

#[derive(Debug)]
pub struct BackendError {
    pub status: ErrorStatus,
    pub context: Box<str>,
}

impl From<BackendError> for SegError {
    fn from(value: BackendError) -> Self {
        SegError::BackendError(value)
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}: {}", self.status, self.context))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// Dynamic library was not found on the disk
    DyLibNotFound,
    /// Backend initialization failure
    Initialization,
    /// Backend deinitialization failure
    Deinitialization,
    /// Failed to enumerate devices
    DeviceEnumeration,
    /// Failed to query device for information
    DeviceQuery,
    /// Failed to allocate memory
    MemoryAllocation,
    /// Failed to deallocate memory
    MemoryDeallocation,
    /// Failed to copy memory to pool
    MemoryCopyH2P,
    /// Failed to copy memory to host
    MemoryCopyP2H,
    /// Kernel argument was not correct
    IncorrectKernelArg,
    /// Failed to compile kernel
    KernelCompilation,
    /// Failed to launch kernel
    KernelLaunch,
    /// Failed to synchronize kernel
    KernelSync,
}
