//! Compute device resolution and tensor placement
//!
//! Accelerator detection lives behind [`DeviceResolver`] so it is queried once
//! per load instead of being detected again at every call site. Placement goes
//! through [`place`], which never moves a tensor that already lives on the
//! target device.

use crate::error::{Error, Result};
use candle_core::{utils, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Concrete device class a model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    /// Unified-memory accelerator (Apple Metal)
    Metal,
}

impl DeviceKind {
    /// Instantiate the candle device for this class
    pub fn create(self) -> Result<Device> {
        match self {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => Device::new_cuda(0)
                .map_err(|e| Error::DeviceUnavailable(format!("CUDA: {}", e))),
            DeviceKind::Metal => Device::new_metal(0)
                .map_err(|e| Error::DeviceUnavailable(format!("Metal: {}", e))),
        }
    }

    /// Classify an existing candle device
    pub fn of(device: &Device) -> Self {
        match device {
            Device::Cpu => DeviceKind::Cpu,
            Device::Cuda(_) => DeviceKind::Cuda,
            Device::Metal(_) => DeviceKind::Metal,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Metal => "metal",
        };
        f.write_str(name)
    }
}

/// Device requested on the command line or in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    #[value(name = "auto")]
    Auto,
    #[value(name = "cpu")]
    Cpu,
    #[value(name = "cuda")]
    Cuda,
    #[value(name = "metal")]
    Metal,
}

/// Strategy that picks the device class for a process
pub trait DeviceResolver {
    fn resolve(&self) -> DeviceKind;
}

/// Prefers the unified-memory accelerator, then a discrete GPU, then the CPU
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDeviceResolver;

impl DeviceResolver for AutoDeviceResolver {
    fn resolve(&self) -> DeviceKind {
        if utils::metal_is_available() {
            DeviceKind::Metal
        } else if utils::cuda_is_available() {
            DeviceKind::Cuda
        } else {
            DeviceKind::Cpu
        }
    }
}

/// Always answers with the same device class
#[derive(Debug, Clone, Copy)]
pub struct FixedDeviceResolver(pub DeviceKind);

impl DeviceResolver for FixedDeviceResolver {
    fn resolve(&self) -> DeviceKind {
        self.0
    }
}

/// Build the resolver matching a user preference
pub fn resolver_for(preference: DevicePreference) -> Box<dyn DeviceResolver> {
    match preference {
        DevicePreference::Auto => Box::new(AutoDeviceResolver),
        DevicePreference::Cpu => Box::new(FixedDeviceResolver(DeviceKind::Cpu)),
        DevicePreference::Cuda => Box::new(FixedDeviceResolver(DeviceKind::Cuda)),
        DevicePreference::Metal => Box::new(FixedDeviceResolver(DeviceKind::Metal)),
    }
}

/// Resolve and instantiate the device in one step
pub fn select_device(resolver: &dyn DeviceResolver) -> Result<Device> {
    let kind = resolver.resolve();
    info!("Selected {} device", kind);
    kind.create()
}

/// Move a tensor onto `device` unless it is already there
pub fn place(tensor: Tensor, device: &Device) -> Result<Tensor> {
    if tensor.device().same_device(device) {
        return Ok(tensor);
    }
    debug!(
        "Relocating tensor {:?} from {} to {}",
        tensor.shape(),
        DeviceKind::of(tensor.device()),
        DeviceKind::of(device)
    );
    Ok(tensor.to_device(device)?)
}
