//! Device and precision selection

use anyhow::Result;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Device preference for loading and training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Select a device
///
/// An explicit accelerator request that cannot be honoured is an error;
/// only `Auto` walks down to the CPU.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cuda => {
            #[cfg(feature = "cuda")]
            {
                let device = Device::new_cuda(0)
                    .map_err(|e| anyhow::anyhow!("CUDA initialization failed: {}", e))?;
                tracing::info!("✓ CUDA device selected");
                Ok(device)
            }
            #[cfg(not(feature = "cuda"))]
            {
                anyhow::bail!("CUDA requested but not compiled with 'cuda' feature")
            }
        }

        DevicePreference::Metal => {
            #[cfg(feature = "metal")]
            {
                let device = Device::new_metal(0)
                    .map_err(|e| anyhow::anyhow!("Metal initialization failed: {}", e))?;
                tracing::info!("✓ Metal device selected");
                Ok(device)
            }
            #[cfg(not(feature = "metal"))]
            {
                anyhow::bail!("Metal requested but not compiled with 'metal' feature")
            }
        }

        DevicePreference::Cpu => {
            tracing::info!("✓ CPU device selected");
            Ok(Device::Cpu)
        }

        DevicePreference::Auto => {
            tracing::info!("Auto-selecting best available device...");

            #[cfg(feature = "cuda")]
            {
                if let Ok(device) = Device::new_cuda(0) {
                    tracing::info!("✓ Auto-selected: CUDA GPU");
                    return Ok(device);
                }
            }

            #[cfg(feature = "metal")]
            {
                if let Ok(device) = Device::new_metal(0) {
                    tracing::info!("✓ Auto-selected: Metal GPU (Apple Silicon)");
                    return Ok(device);
                }
            }

            tracing::info!("✓ Auto-selected: CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Parse a compute dtype name ("f16", "bf16", "f32")
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_lowercase().as_str() {
        "f16" | "fp16" | "half" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        "f32" | "fp32" | "float" => Ok(DType::F32),
        _ => anyhow::bail!("Unsupported dtype: {}. Valid options: f16, bf16, f32", name),
    }
}

/// Short human-readable device name for logs
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}
