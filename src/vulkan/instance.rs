//! Functions for creating headless Vulkan instances.

use super::validation::{should_enable_validation_layers, vk_debug_callback, VALIDATION_LAYER};
use crate::util::VkExtensionName;
use ash::{extensions::ext as vk_ext, vk, Entry, Instance};
use color_eyre::Result;
use std::{collections::HashSet, ffi::CStr};
use tracing::{debug, warn};

/// Create a Vulkan instance from an entry point.
///
/// No surface extensions are requested: nothing here ever presents to a
/// window. Returns the debug messenger too if validation was enabled.
#[tracing::instrument(level = "DEBUG", skip_all)]
pub(crate) unsafe fn create_instance(
    entry: &Entry,
) -> Result<(Instance, Option<vk::DebugUtilsMessengerEXT>)> {
    type DebugSeverity = vk::DebugUtilsMessageSeverityFlagsEXT;
    type DebugMsgType = vk::DebugUtilsMessageTypeFlagsEXT;

    let app_info = vk::ApplicationInfo::builder()
        .application_name(CStr::from_bytes_with_nul(b"Frame Pacer\0")?)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(CStr::from_bytes_with_nul(b"Frame Pacer\0")?)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::make_api_version(0, 1, 0, 0));

    // Only turn validation on if the layer is actually installed; a headless
    // run on a bare driver shouldn't fail because of it.
    let available_layers = entry
        .enumerate_instance_layer_properties()?
        .iter()
        .map(|l| VkExtensionName::from(l.layer_name))
        .collect::<HashSet<_>>();

    let mut validation_enabled = should_enable_validation_layers();
    if validation_enabled && !available_layers.contains(&VALIDATION_LAYER) {
        warn!(layer = %VALIDATION_LAYER, "Validation requested but the layer isn't installed");
        validation_enabled = false;
    }

    let layers = if validation_enabled {
        debug!(layer = %VALIDATION_LAYER, "Enabling validation layer");
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let mut extensions = Vec::new();
    if validation_enabled {
        debug!(extension = ?vk_ext::DebugUtils::name(), "Enabling extension");
        extensions.push(vk_ext::DebugUtils::name().as_ptr());
    }

    let mut instance_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let mut debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            DebugSeverity::VERBOSE
                | DebugSeverity::INFO
                | DebugSeverity::WARNING
                | DebugSeverity::ERROR,
        )
        .message_type(DebugMsgType::GENERAL | DebugMsgType::VALIDATION | DebugMsgType::PERFORMANCE)
        .pfn_user_callback(Some(vk_debug_callback));

    if validation_enabled {
        instance_info = instance_info.push_next(&mut debug_info);
    }

    let instance = entry.create_instance(&instance_info, None)?;

    let messenger = if validation_enabled {
        Some(
            vk_ext::DebugUtils::new(entry, &instance)
                .create_debug_utils_messenger(&debug_info, None)?,
        )
    } else {
        None
    };

    Ok((instance, messenger))
}
