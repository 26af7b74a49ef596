//! Picking a GPU and opening a logical device on it.

use super::validation::VALIDATION_LAYER;
use ash::{vk, Device, Instance};
use color_eyre::{eyre::eyre, Result};
use std::ffi::CStr;
use thiserror::Error;
use tracing::{debug, info};

/// For when a physical device does not satisfy some requirement of the application.
#[derive(Debug, Error)]
pub(crate) enum PhysicalDeviceSuitabilityError {
    #[error("Physical device is unsuitable: {0}")]
    Unsuitable(&'static str),
}

/// The physical device we settled on, and the queue family we'll submit to.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SelectedDevice {
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) queue_family: u32,
    pub(crate) memory_properties: vk::PhysicalDeviceMemoryProperties,
}

/// Picks the highest-scoring physical device that can run our work.
#[tracing::instrument(level = "DEBUG", skip_all)]
pub(crate) unsafe fn pick_physical_device(instance: &Instance) -> Result<SelectedDevice> {
    let mut best: Option<(u32, SelectedDevice)> = None;

    for physical_device in instance.enumerate_physical_devices()? {
        let properties = instance.get_physical_device_properties(physical_device);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy();

        match check_physical_device(instance, physical_device, &properties) {
            Ok((score, queue_family)) => {
                debug!(%device_name, score, "Found usable physical device");
                if best.map_or(true, |(best_score, _)| score > best_score) {
                    let memory_properties =
                        instance.get_physical_device_memory_properties(physical_device);
                    best = Some((
                        score,
                        SelectedDevice {
                            physical_device,
                            queue_family,
                            memory_properties,
                        },
                    ));
                }
            }
            Err(err) => debug!(%device_name, reason = %err, "Skipping physical device"),
        }
    }

    let (_, selected) =
        best.ok_or_else(|| eyre!("Failed to find a suitable physical device"))?;

    let properties = instance.get_physical_device_properties(selected.physical_device);
    info!(
        device_name = %CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy(),
        device_id = properties.device_id,
        queue_family = selected.queue_family,
        "Selected physical device"
    );

    Ok(selected)
}

/// Scores a physical device, returning the queue family to use on it.
///
/// Software rasterizers are accepted, just ranked last, so the backend still
/// runs on CI machines without a GPU.
unsafe fn check_physical_device(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    properties: &vk::PhysicalDeviceProperties,
) -> Result<(u32, u32), PhysicalDeviceSuitabilityError> {
    let score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 200,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        vk::PhysicalDeviceType::CPU => 10,
        _ => {
            return Err(PhysicalDeviceSuitabilityError::Unsuitable(
                "Unknown device type",
            ))
        }
    };

    let queue_family = find_graphics_queue_family(instance, physical_device).ok_or(
        PhysicalDeviceSuitabilityError::Unsuitable("Missing a graphics queue family"),
    )?;

    Ok((score, queue_family))
}

/// Graphics queues can always do transfers too, which is all the work we
/// actually submit.
unsafe fn find_graphics_queue_family(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|p| p.queue_count > 0 && p.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|i| i as u32)
}

/// Create a logical device with a single queue from the selected family.
#[tracing::instrument(level = "DEBUG", skip_all)]
pub(crate) unsafe fn create_logical_device(
    instance: &Instance,
    selected: &SelectedDevice,
    validation_enabled: bool,
) -> Result<(Device, vk::Queue)> {
    let queue_priorities = &[1.0];
    let queue_infos = [vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(selected.queue_family)
        .queue_priorities(queue_priorities)
        .build()];

    // Device layers are deprecated, but older loaders still want them to
    // match the instance's.
    let layers = if validation_enabled {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let features = vk::PhysicalDeviceFeatures::builder();

    let info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_infos)
        .enabled_layer_names(&layers)
        .enabled_features(&features);

    let device = instance.create_device(selected.physical_device, &info, None)?;
    let queue = device.get_device_queue(selected.queue_family, 0);

    Ok((device, queue))
}
