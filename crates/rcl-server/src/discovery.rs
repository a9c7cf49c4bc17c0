use std::sync::Arc;

use tracing::{info, warn};

use rcl_core::config::DriverKind;
use rcl_protocol::device_info::DeviceInfo;

use crate::driver::{DeviceDescriptor, Driver, HostDriver, OpenClDriver, QueueProperties};

/// A device this server exposes, addressed by its server-side index.
#[derive(Debug, Clone)]
pub struct ExposedDevice {
    pub index: u32,
    pub descriptor: DeviceDescriptor,
}

/// Select the native driver.
///
/// `Auto` prefers OpenCL and falls back to host emulation when no runtime
/// can be loaded or it reports no devices.
pub fn load_driver(kind: DriverKind, host_devices: u32) -> Result<Arc<dyn Driver>, String> {
    match kind {
        DriverKind::Host => {
            info!("using host emulation driver with {} device(s)", host_devices);
            Ok(Arc::new(HostDriver::with_devices(host_devices)))
        }
        DriverKind::OpenCl => {
            let driver = OpenClDriver::load()?;
            Ok(driver)
        }
        DriverKind::Auto => match OpenClDriver::load() {
            Ok(driver) => match driver.enumerate_devices() {
                Ok(devices) if !devices.is_empty() => Ok(driver),
                Ok(_) => {
                    warn!("OpenCL runtime reports no devices, falling back to host emulation");
                    Ok(Arc::new(HostDriver::with_devices(host_devices)))
                }
                Err(e) => {
                    warn!("OpenCL device enumeration failed ({}), falling back to host emulation", e);
                    Ok(Arc::new(HostDriver::with_devices(host_devices)))
                }
            },
            Err(e) => {
                warn!("OpenCL unavailable ({}), falling back to host emulation", e);
                Ok(Arc::new(HostDriver::with_devices(host_devices)))
            }
        },
    }
}

/// Enumerate the driver's devices, keeping those listed in `expose`
/// (all of them when `None`). Indices are enumeration order and stay
/// stable under filtering.
pub fn discover_devices(driver: &dyn Driver, expose: Option<&[u32]>) -> Vec<ExposedDevice> {
    let descriptors = match driver.enumerate_devices() {
        Ok(descriptors) => descriptors,
        Err(e) => {
            warn!("device enumeration failed: {}", e);
            return Vec::new();
        }
    };

    let devices: Vec<ExposedDevice> = descriptors
        .into_iter()
        .enumerate()
        .map(|(i, descriptor)| ExposedDevice {
            index: i as u32,
            descriptor,
        })
        .filter(|d| expose.map_or(true, |list| list.contains(&d.index)))
        .collect();

    if devices.is_empty() {
        warn!("no devices discovered via the {} driver", driver.name());
    } else {
        info!(
            "discovered {} device(s) via the {} driver",
            devices.len(),
            driver.name()
        );
    }
    devices
}

/// Queue properties a device will be opened with.
pub fn queue_properties(descriptor: &DeviceDescriptor, enable_profiling: bool) -> QueueProperties {
    QueueProperties {
        out_of_order: descriptor.queue_caps.out_of_order,
        profiling: enable_profiling && descriptor.queue_caps.profiling,
    }
}

pub fn device_info(
    descriptor: &DeviceDescriptor,
    index: u32,
    server_id: u16,
    properties: QueueProperties,
) -> DeviceInfo {
    DeviceInfo {
        device_name: descriptor.name.clone(),
        vendor: descriptor.vendor.clone(),
        version: descriptor.version.clone(),
        device_type: descriptor.device_type,
        global_mem_size: descriptor.global_mem_size,
        out_of_order: properties.out_of_order,
        profiling: properties.profiling,
        supports_fill: descriptor.supports_fill,
        server_device_index: index,
        server_id,
    }
}
