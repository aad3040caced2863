//! Device context. Owns every initialized device and its memory pool
//! and is passed explicitly to each segmentation run.

use crate::{
    backend::{initialize_backends, Config, Device, DeviceInfo, HostConfig, MemoryPool, OpenCLConfig},
    error::SegError,
    segmentation::SolverConfig,
};
use nanoserde::DeJson;
use std::path::PathBuf;

/// Seed used for scheduler tie breaking when none is configured
pub(crate) const SEED: u64 = 69420;

/// Debug printing, read from `HMSEG_DEBUG`.
/// Bit 1 is device info, 2 performance, 4 scheduler and 8 kernel launches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugMask(u32);

impl DebugMask {
    #[must_use]
    pub const fn new(mask: u32) -> DebugMask {
        DebugMask(mask)
    }

    /// Reads `HMSEG_DEBUG`, zero if unset or not a number
    #[must_use]
    pub fn from_env() -> DebugMask {
        DebugMask(std::env::var("HMSEG_DEBUG").ok().and_then(|x| x.parse().ok()).unwrap_or(0))
    }

    #[must_use]
    pub const fn dev(&self) -> bool {
        self.0 % 2 == 1
    }

    #[must_use]
    pub const fn perf(&self) -> bool {
        (self.0 >> 1) % 2 == 1
    }

    #[must_use]
    pub const fn sched(&self) -> bool {
        (self.0 >> 2) % 2 == 1
    }

    #[must_use]
    pub const fn kernel(&self) -> bool {
        (self.0 >> 3) % 2 == 1
    }
}

/// Devices and memory pools available to segmentation runs.
/// `memory_pools[i]` belongs to `devices[i]`.
#[derive(Debug)]
pub struct DeviceContext {
    devices: Vec<Device>,
    memory_pools: Vec<MemoryPool>,
    // Directory where device_config.json was found
    config_dir: Option<PathBuf>,
    solver: SolverConfig,
    seed: Option<u64>,
    debug: DebugMask,
}

impl DeviceContext {
    /// Initializes all available devices.
    ///
    /// Reads `HMSEG_DEBUG` and `HMSEG_SEED` environment variables and
    /// `hmseg/device_config.json` from xdg config directories.
    /// If the config is not found or fails to parse, defaults are used.
    /// # Errors
    /// Returns error if all devices failed to initialize.
    pub fn new() -> Result<DeviceContext, SegError> {
        let debug = DebugMask::from_env();
        let (config, config_dir) = read_config(debug);
        let mut context = DeviceContext::with_config(config, debug)?;
        context.config_dir = config_dir;
        if let Ok(x) = std::env::var("HMSEG_SEED") {
            match x.parse() {
                Ok(seed) => context.seed = Some(seed),
                Err(e) => {
                    if debug.dev() {
                        println!("Ignoring HMSEG_SEED={x}, {e}");
                    }
                }
            }
        }
        Ok(context)
    }

    /// Initializes devices from given config
    /// # Errors
    /// Returns error if all devices failed to initialize.
    pub fn with_config(config: Config, debug: DebugMask) -> Result<DeviceContext, SegError> {
        let mut devices = Vec::new();
        let mut memory_pools = Vec::new();
        initialize_backends(&config, &mut memory_pools, &mut devices, debug.dev())?;
        let seed = config.solver.seed;
        Ok(DeviceContext { devices, memory_pools, config_dir: None, solver: config.solver, seed, debug })
    }

    /// Only host devices, each with `memory_bytes` of memory
    /// # Errors
    /// Returns error if `devices` is zero.
    pub fn host(devices: usize, memory_bytes: usize) -> Result<DeviceContext, SegError> {
        let config = Config {
            host: HostConfig::new(devices, memory_bytes),
            opencl: OpenCLConfig { platform_ids: Some(Vec::new()) },
            ..Config::default()
        };
        DeviceContext::with_config(config, DebugMask::from_env())
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn device_info(&self, device: usize) -> Option<&DeviceInfo> {
        self.devices.get(device).map(Device::info)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.iter().map(Device::info)
    }

    #[must_use]
    pub const fn debug(&self) -> DebugMask {
        self.debug
    }

    pub fn set_debug(&mut self, debug: DebugMask) {
        self.debug = debug;
    }

    /// Solver section of the device config
    #[must_use]
    pub const fn solver_config(&self) -> &SolverConfig {
        &self.solver
    }

    /// Seed from `HMSEG_SEED` or the config
    #[must_use]
    pub const fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Directory of the config file that was used, if any
    #[must_use]
    pub fn config_dir(&self) -> Option<&std::path::Path> {
        self.config_dir.as_deref()
    }

    /// Free bytes of device memory
    #[must_use]
    pub fn free_bytes(&self, device: usize) -> Option<usize> {
        self.memory_pools.get(device).map(MemoryPool::free_bytes)
    }

    /// Mutable access to selected devices with their pools, in ascending device order
    pub(crate) fn select_mut(&mut self, ids: &[usize]) -> Result<Vec<(usize, &mut Device, &mut MemoryPool)>, SegError> {
        if ids.is_empty() || self.devices.is_empty() {
            return Err(SegError::NoDeviceAvailable);
        }
        let missing: Vec<usize> = ids.iter().copied().filter(|&i| i >= self.devices.len()).collect();
        if !missing.is_empty() {
            return Err(SegError::input_error(format!(
                "Devices {missing:?} were selected, but only {} devices are available",
                self.devices.len()
            )));
        }
        Ok(self
            .devices
            .iter_mut()
            .zip(self.memory_pools.iter_mut())
            .enumerate()
            .filter(|(i, _)| ids.contains(i))
            .map(|(i, (device, pool))| (i, device, pool))
            .collect())
    }

    /// Releases all devices and memory pools
    pub fn deinitialize(&mut self) {
        while let Some(mut device) = self.devices.pop() {
            device.deinitialize();
        }
        while let Some(mut pool) = self.memory_pools.pop() {
            pool.deinitialize();
        }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

// Search through config directories and find hmseg/device_config.json
fn read_config(debug: DebugMask) -> (Config, Option<PathBuf>) {
    let mut config_dir = None;
    let config = xdg::BaseDirectories::new()
        .map_err(|e| {
            if debug.dev() {
                println!("Failed to find config directories for device_config.json, {e}");
            }
        })
        .ok()
        .map(|bd| {
            let mut dirs = bd.get_config_dirs();
            dirs.push(bd.get_config_home());
            dirs
        })
        .and_then(|paths| {
            paths.into_iter().find_map(|mut path| {
                path.push("hmseg/device_config.json");
                let file = std::fs::read_to_string(&path).ok()?;
                path.pop();
                config_dir = Some(path);
                Some(file)
            })
        })
        .and_then(|file| {
            Config::deserialize_json(&file)
                .map_err(|e| {
                    if debug.dev() {
                        println!("Failed to parse device_config.json, {e}");
                    }
                })
                .ok()
        })
        .map(|config| {
            if debug.dev() {
                println!("Device config successfully read and parsed.");
            }
            config
        })
        .unwrap_or_else(|| {
            if debug.dev() {
                println!("Failed to get device config, using defaults.");
            }
            Config::default()
        });
    (config, config_dir)
}

#[cfg(test)]
mod tests {
    use super::{DebugMask, DeviceContext};
    use crate::{backend::Config, error::SegError};
    use nanoserde::DeJson;

    #[test]
    fn debug_bits() {
        let debug = DebugMask::new(5);
        assert!(debug.dev());
        assert!(!debug.perf());
        assert!(debug.sched());
        assert!(!debug.kernel());
    }

    #[test]
    fn config_parses_sections() {
        let config = Config::deserialize_json(
            r#"{"host": {"devices": 2, "memory_bytes": 4096}, "opencl": {"platform_ids": []}, "solver": {"iterations": 7, "seed": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.host.devices, Some(2));
        assert_eq!(config.solver.iterations, Some(7));
        assert_eq!(config.solver.step_size, None);
        assert_eq!(config.opencl.platform_ids, Some(Vec::new()));
        let context = DeviceContext::with_config(config, DebugMask::default()).unwrap();
        assert_eq!(context.num_devices(), 2);
        assert_eq!(context.seed(), Some(3));
        assert_eq!(context.device_info(1).map(|x| x.memory_bytes), Some(4096));
    }

    #[test]
    fn selecting_missing_device_fails() {
        let mut context = DeviceContext::host(1, 1 << 16).unwrap();
        assert!(context.select_mut(&[0]).is_ok());
        assert!(matches!(context.select_mut(&[0, 3]), Err(SegError::InputError(_))));
        assert!(matches!(context.select_mut(&[]), Err(SegError::NoDeviceAvailable)));
    }
}
