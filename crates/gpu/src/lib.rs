//! NVML-backed device memory probe.
//!
//! [`NvmlDevice`] wraps the NVIDIA Management Library to read the memory
//! counters of one GPU for the memory accountant.
//!
//! NVML initialisation is **gracefully optional** -- if the host has no
//! NVIDIA drivers (e.g. a developer laptop), the probe logs a warning and
//! reports a zero-capacity device, so local-engine admission fails with
//! `ResourceExhausted` instead of guessing.

use nvml_wrapper::Nvml;
use serde::Serialize;
use storyframe_core::error::CoreError;
use storyframe_core::memory::{DeviceMemory, DeviceReading};
use storyframe_core::types::BYTES_PER_MB;

/// Per-GPU memory summary, used for startup logging.
#[derive(Debug, Clone, Serialize)]
pub struct GpuMemoryInfo {
    pub gpu_index: u32,
    pub name: String,
    pub vram_used_mb: u64,
    pub vram_total_mb: u64,
}

/// Memory probe for a single GPU.
pub struct NvmlDevice {
    /// `None` when NVML could not be initialised (no drivers / no GPU).
    nvml: Option<Nvml>,
    gpu_index: u32,
    label: String,
}

impl NvmlDevice {
    /// Attempt to initialise NVML for GPU `gpu_index`.
    pub fn new(gpu_index: u32) -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => {
                tracing::info!(gpu_index, "NVML initialised successfully");
                Some(nvml)
            }
            Err(e) => {
                tracing::warn!(error = %e, "NVML unavailable -- device reports zero capacity");
                None
            }
        };
        Self {
            nvml,
            gpu_index,
            label: format!("cuda:{gpu_index}"),
        }
    }

    /// Whether NVML is usable on this host.
    pub fn is_available(&self) -> bool {
        self.nvml.is_some()
    }

    /// Number of GPUs visible to NVML, or 0 if NVML is unavailable.
    pub fn gpu_count(&self) -> u32 {
        self.nvml
            .as_ref()
            .and_then(|nvml| nvml.device_count().ok())
            .unwrap_or(0)
    }

    /// Memory summary for every GPU on the host.
    ///
    /// Errors on individual devices are logged and the device is skipped.
    pub fn list_devices(&self) -> Vec<GpuMemoryInfo> {
        let Some(nvml) = self.nvml.as_ref() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for idx in 0..self.gpu_count() {
            let info = nvml.device_by_index(idx).and_then(|device| {
                let mem = device.memory_info()?;
                let name = device.name().unwrap_or_else(|_| "unknown".to_string());
                Ok(GpuMemoryInfo {
                    gpu_index: idx,
                    name,
                    vram_used_mb: mem.used / BYTES_PER_MB,
                    vram_total_mb: mem.total / BYTES_PER_MB,
                })
            });
            match info {
                Ok(info) => out.push(info),
                Err(e) => {
                    tracing::warn!(gpu_index = idx, error = %e, "Skipping GPU -- memory query failed");
                }
            }
        }
        out
    }
}

impl DeviceMemory for NvmlDevice {
    fn name(&self) -> &str {
        &self.label
    }

    fn query(&self) -> Result<DeviceReading, CoreError> {
        let Some(nvml) = self.nvml.as_ref() else {
            return Ok(DeviceReading::default());
        };
        let mem = nvml
            .device_by_index(self.gpu_index)
            .and_then(|device| device.memory_info())
            .map_err(|e| CoreError::Internal(format!("NVML memory query failed: {e}")))?;

        Ok(DeviceReading {
            total: mem.total,
            // NVML sees driver-level usage only, so reserved and allocated coincide.
            reserved: mem.used,
            allocated: mem.used,
        })
    }

    fn clear_cache(&self) {
        // Allocator caches belong to the inference process; the driver view
        // picks up whatever it returns on the next query.
        tracing::trace!(device = %self.label, "Cache clear requested");
    }
}
