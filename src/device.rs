use std::panic::{self, AssertUnwindSafe};

use burn::{
    backend::{NdArray, Wgpu, ndarray::NdArrayDevice, wgpu::WgpuDevice},
    prelude::*,
};
use log::{info, warn};

/// The device a run ends up on.
#[derive(Debug, Clone, PartialEq)]
pub enum ComputeDevice {
    Wgpu(WgpuDevice),
    Cpu(NdArrayDevice),
}

/// Runs `init` and reports whether it finished.
///
/// Backends panic when they cannot bring a device up, so a panic here means "not available".
pub fn device_available<F: FnOnce()>(name: &str, init: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(init)) {
        Ok(()) => true,
        Err(_) => {
            warn!("{name} device could not be initialized");
            false
        }
    }
}

pub fn wgpu_available(device: &WgpuDevice) -> bool {
    device_available("wgpu", || {
        Tensor::<Wgpu, 1>::zeros([1], device).into_data();
    })
}

/// The default wgpu adapter when one answers, the CPU otherwise.
///
/// `explicit` only changes how loudly the fallback is reported.
pub fn accelerator_or_cpu(explicit: bool) -> ComputeDevice {
    let device = WgpuDevice::default();
    if wgpu_available(&device) {
        info!("using wgpu device {device:?}");
        return ComputeDevice::Wgpu(device);
    }

    if explicit {
        warn!("wgpu was requested but no adapter is available, falling back to the cpu");
    } else {
        info!("no wgpu adapter available, using the cpu");
    }
    cpu()
}

pub fn cpu() -> ComputeDevice {
    let device = NdArrayDevice::Cpu;
    // Always available.
    debug_assert!(device_available("ndarray", || {
        Tensor::<NdArray, 1>::zeros([1], &device).into_data();
    }));
    ComputeDevice::Cpu(device)
}
