//! Compute device selection

use candle_core::Device;
use candle_core::utils::{cuda_is_available, metal_is_available};
use tracing::{info, warn};

/// CUDA device 0 or Metal device 0 when compiled in and present, CPU
/// otherwise or when `cpu` is set
pub fn select_device(cpu: bool) -> Device {
    if cpu {
        info!("Using CPU");
        return Device::Cpu;
    }
    if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA device 0");
                return device;
            }
            Err(e) => warn!("CUDA not available: {}, falling back to CPU", e),
        }
    } else if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal device 0");
                return device;
            }
            Err(e) => warn!("Metal not available: {}, falling back to CPU", e),
        }
    } else {
        info!("No GPU backend compiled in, using CPU");
    }
    Device::Cpu
}
