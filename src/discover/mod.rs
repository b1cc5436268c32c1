//! GPU discovery and device snapshots.
//!
//! Discovery produces an immutable [`GpuSnapshot`]: the set of schedulable
//! devices with free/total VRAM, plus the devices that were filtered out and
//! why. The scheduler never mutates a snapshot; it reconciles the driver's
//! free-VRAM figures against its own reservations to judge feasibility, and
//! asks for a fresh snapshot after spawns and unloads.
//!
//! Library-specific behavior (minimum memory, visibility env vars, VRAM
//! reserve factors) lives in a small strategy table on [`LibraryTag`] rather
//! than a type per backend.

pub mod probe;

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Minimum total VRAM for a discrete GPU to be schedulable.
///
/// Below this the backend libraries fail to allocate their fixed buffers,
/// so the device is reported as unsupported instead of scheduled.
pub const MINIMUM_VRAM: u64 = 457 * 1024 * 1024;

/// Minimum CUDA compute capability (major version) we schedule on.
pub const CUDA_MINIMUM_COMPUTE: u32 = 5;

/// Stable identifier for a discovered device, e.g. `cuda:0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which backend library drives a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryTag {
    Cuda,
    Rocm,
    OneApi,
    Metal,
    Cpu,
}

impl LibraryTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            LibraryTag::Cuda => "cuda",
            LibraryTag::Rocm => "rocm",
            LibraryTag::OneApi => "oneapi",
            LibraryTag::Metal => "metal",
            LibraryTag::Cpu => "cpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        !matches!(self, LibraryTag::Cpu)
    }

    /// Minimum total memory for a device of this library to be schedulable.
    pub fn minimum_memory(&self) -> u64 {
        match self {
            LibraryTag::Cpu => 0,
            _ => MINIMUM_VRAM,
        }
    }

    /// Fraction of driver-reported free VRAM actually available to us.
    ///
    /// Intel devices keep a reserve for the MKL workspace used by the SYCL
    /// backend, so their free figure is scaled down.
    pub fn free_vram_factor(&self) -> f64 {
        match self {
            LibraryTag::OneApi => 0.95,
            _ => 1.0,
        }
    }

    /// Environment variable restricting runner processes to a device subset.
    pub fn visible_devices_env(&self) -> Option<&'static str> {
        match self {
            LibraryTag::Cuda => Some("CUDA_VISIBLE_DEVICES"),
            LibraryTag::Rocm => Some("HIP_VISIBLE_DEVICES"),
            LibraryTag::OneApi => Some("ONEAPI_DEVICE_SELECTOR"),
            LibraryTag::Metal => Some("GGML_METAL_NDEVICES"),
            LibraryTag::Cpu => None,
        }
    }

    /// Fixed graph/command-buffer allocation the backend makes per device,
    /// independent of model size.
    pub fn graph_overhead(&self) -> u64 {
        match self {
            LibraryTag::Cuda | LibraryTag::Rocm | LibraryTag::OneApi => 300 * 1024 * 1024,
            LibraryTag::Metal => 128 * 1024 * 1024,
            LibraryTag::Cpu => 0,
        }
    }
}

impl fmt::Display for LibraryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub library: LibraryTag,
    pub name: String,
    pub total_vram: u64,
    pub free_vram: u64,
    /// VRAM the driver reports free but the OS/compositor actually consumes.
    #[serde(default)]
    pub os_overhead: u64,
    /// Compute capability (major, minor) where the library exposes one.
    #[serde(default)]
    pub compute_capability: Option<(u32, u32)>,
    /// Library paths the runner process needs on its loader path.
    #[serde(default)]
    pub dependency_paths: Vec<PathBuf>,
}

impl DeviceDescriptor {
    /// Name-based integrated-GPU heuristic. Integrated devices share system
    /// RAM and report misleading free figures, so they are never scheduled.
    /// Intel GPUs are integrated unless they are discrete Arc parts; AMD
    /// APUs show up as "Vega ... Graphics" or "Radeon(TM) ... Graphics".
    pub fn is_integrated(&self) -> bool {
        let name = self.name.to_lowercase();
        (name.contains("intel") && !name.contains("arc"))
            || (name.contains("vega") && name.contains("graphics"))
            || (name.contains("radeon(tm)") && name.contains("graphics"))
    }
}

/// A device that was discovered but will never be scheduled.
#[derive(Debug, Clone, Serialize)]
pub struct UnsupportedDevice {
    pub device: DeviceDescriptor,
    pub reason: String,
}

/// Immutable view of the devices available to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct GpuSnapshot {
    devices: Vec<DeviceDescriptor>,
    unsupported: Vec<UnsupportedDevice>,
}

impl GpuSnapshot {
    /// Build a snapshot from raw probe output, applying the support filters
    /// and the optional visibility subset. Free VRAM is scaled by the
    /// per-library reserve factor here, so downstream consumers never see
    /// the raw figure.
    pub fn from_devices(raw: Vec<DeviceDescriptor>, visible: Option<&[String]>) -> Self {
        let mut devices = Vec::new();
        let mut unsupported = Vec::new();

        for mut dev in raw {
            if dev.library == LibraryTag::Cpu {
                devices.push(dev);
                continue;
            }

            if let Some(visible) = visible {
                if !visible.iter().any(|v| v == dev.id.as_str()) {
                    tracing::debug!("Device {} hidden by visibility config", dev.id);
                    continue;
                }
            }

            let reason = if dev.is_integrated() {
                Some("unsupported integrated GPU".to_string())
            } else if dev.total_vram < dev.library.minimum_memory() {
                Some(format!(
                    "GPU memory below minimum: {} < {}",
                    dev.total_vram,
                    dev.library.minimum_memory()
                ))
            } else if dev.library == LibraryTag::Cuda
                && matches!(dev.compute_capability, Some((major, _)) if major < CUDA_MINIMUM_COMPUTE)
            {
                Some(format!(
                    "compute capability {}.{} below minimum {}.0",
                    dev.compute_capability.unwrap().0,
                    dev.compute_capability.unwrap().1,
                    CUDA_MINIMUM_COMPUTE
                ))
            } else {
                None
            };

            match reason {
                Some(reason) => {
                    tracing::info!("Skipping {} ({}): {}", dev.id, dev.name, reason);
                    unsupported.push(UnsupportedDevice { device: dev, reason });
                }
                None => {
                    dev.free_vram =
                        (dev.free_vram as f64 * dev.library.free_vram_factor()) as u64;
                    devices.push(dev);
                }
            }
        }

        Self { devices, unsupported }
    }

    /// Schedulable GPU devices, in discovery order.
    pub fn gpus(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().filter(|d| d.library.is_gpu())
    }

    /// The CPU (system RAM) descriptor, if the probe produced one.
    pub fn cpu(&self) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.library == LibraryTag::Cpu)
    }

    pub fn device(&self, id: &DeviceId) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| &d.id == id)
    }

    pub fn unsupported(&self) -> &[UnsupportedDevice] {
        &self.unsupported
    }
}

/// Source of device snapshots. Production probes the system; tests supply
/// fixed snapshots.
pub trait DeviceDiscovery: Send + Sync {
    fn snapshot(&self) -> GpuSnapshot;
}

/// Probes the running system on every call.
pub struct SystemDiscovery {
    visible: Option<Vec<String>>,
}

impl SystemDiscovery {
    pub fn new(visible: Option<Vec<String>>) -> Self {
        Self { visible }
    }
}

impl DeviceDiscovery for SystemDiscovery {
    fn snapshot(&self) -> GpuSnapshot {
        GpuSnapshot::from_devices(probe::probe_devices(), self.visible.as_deref())
    }
}

/// Serves a pre-built snapshot; the scheduler's refresh calls return the most
/// recently supplied one.
pub struct FixedDiscovery {
    snapshot: Mutex<GpuSnapshot>,
}

impl FixedDiscovery {
    pub fn new(snapshot: GpuSnapshot) -> Self {
        Self { snapshot: Mutex::new(snapshot) }
    }

    pub fn set(&self, snapshot: GpuSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }
}

impl DeviceDiscovery for FixedDiscovery {
    fn snapshot(&self) -> GpuSnapshot {
        self.snapshot.lock().unwrap().clone()
    }
}
