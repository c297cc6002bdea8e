//! # Device Selection
//!
//! Picks the Candle compute device every context of the pool is loaded onto.
//! GPU preferences fall back to the CPU when the backend is not available.

use candle_core::Device;
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Cached result of automatic detection
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    Auto,
    #[default]
    Cpu,
    /// CUDA GPU (falls back to CPU if not available)
    Cuda,
    /// Metal GPU (falls back to CPU if not available)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Get the device for `preference`, falling back to the CPU.
    pub fn get_device(preference: DevicePreference) -> Device {
        match preference {
            DevicePreference::Auto => Self::get_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => Self::get_cuda_device().unwrap_or(Device::Cpu),
            DevicePreference::Metal => Self::get_metal_device().unwrap_or(Device::Cpu),
        }
    }

    pub fn get_best_device() -> Device {
        BEST_DEVICE.get_or_init(Self::detect_best_device).clone()
    }

    fn detect_best_device() -> Device {
        info!("Detecting best available compute device...");

        if let Some(cuda_device) = Self::get_cuda_device() {
            info!("Selected CUDA GPU for inference");
            return cuda_device;
        }

        if let Some(metal_device) = Self::get_metal_device() {
            info!("Selected Metal GPU for inference");
            return metal_device;
        }

        info!("Using CPU for inference (no GPU acceleration available)");
        Device::Cpu
    }

    fn get_cuda_device() -> Option<Device> {
        match Device::new_cuda(0) {
            Ok(device) => {
                debug!("CUDA device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("CUDA not available: {}", e);
                None
            }
        }
    }

    fn get_metal_device() -> Option<Device> {
        match Device::new_metal(0) {
            Ok(device) => {
                debug!("Metal device 0 available");
                Some(device)
            }
            Err(e) => {
                debug!("Metal not available: {}", e);
                None
            }
        }
    }

    /// Short human-readable name for logs and health output.
    pub fn get_device_info(device: &Device) -> String {
        match device {
            Device::Cpu => "CPU".to_string(),
            Device::Cuda(_) => "CUDA GPU".to_string(),
            Device::Metal(_) => "Metal GPU (Apple Silicon)".to_string(),
        }
    }

    pub fn get_device_summary(preference: DevicePreference, device: &Device) -> DeviceSummary {
        let cuda_available = Self::get_cuda_device().is_some();
        let metal_available = Self::get_metal_device().is_some();
        DeviceSummary {
            preference: format!("{:?}", preference).to_lowercase(),
            fell_back_to_cpu: matches!(preference, DevicePreference::Cuda | DevicePreference::Metal) && device.is_cpu(),
            cuda_available,
            metal_available,
            gpu_available: cuda_available || metal_available,
            current_device: Self::get_device_info(device),
        }
    }
}

/// Device availability summary, reported by the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    /// Configured preference
    pub preference: String,
    /// A GPU backend was requested but contexts run on the CPU
    pub fell_back_to_cpu: bool,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub gpu_available: bool,
    pub current_device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_preference_parsing() {
        assert_eq!("auto".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("invalid".parse::<DevicePreference>().is_err());
        assert_eq!(DevicePreference::default(), DevicePreference::Cpu);
    }

    #[test]
    fn test_cpu_preference_is_cpu() {
        let device = DeviceManager::get_device(DevicePreference::Cpu);
        assert!(matches!(device, Device::Cpu));
        assert_eq!(DeviceManager::get_device_info(&device), "CPU");
    }

    #[test]
    fn test_summary_for_cpu_preference() {
        let summary = DeviceManager::get_device_summary(DevicePreference::Cpu, &Device::Cpu);
        assert_eq!(summary.preference, "cpu");
        assert_eq!(summary.current_device, "CPU");
        assert!(!summary.fell_back_to_cpu);
    }
}
