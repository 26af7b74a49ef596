//! Hooks connecting Vulkan's validation API to [`tracing`]

use crate::util::VkExtensionName;
use ash::vk;
use std::{borrow::Cow, ffi::CStr, os::raw::c_void};
use tracing::{debug, error, trace, warn};

/// Returns true if Vulkan validation layers should be enabled.
///
/// Will always return true in builds where `debug_assertions` is enabled.
/// Otherwise, will only return true if the environment variable
/// `ENABLE_VULKAN_VALIDATION_LAYERS` is set.
#[inline]
pub(crate) fn should_enable_validation_layers() -> bool {
    cfg!(debug_assertions) || std::env::var("ENABLE_VULKAN_VALIDATION_LAYERS").is_ok()
}

/// The validation layer bundle requested when [`should_enable_validation_layers()`]
/// returns true.
pub(crate) const VALIDATION_LAYER: VkExtensionName =
    VkExtensionName::from_bytes(b"VK_LAYER_KHRONOS_validation\0");

/// Called by the validation layers whenever they have something to say.
pub(crate) extern "system" fn vk_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    typ: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: checked for null above; the layer keeps it alive for the call.
    let data = unsafe { &*data };

    let message_id = c_str_or(data.p_message_id_name, "<undefined id>");
    let message = c_str_or(data.p_message, "<undefined message>");

    if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        error!({"type" = ?typ, id = %message_id}, "{}", message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        warn!({"type" = ?typ, id = %message_id}, "{}", message);
    } else if severity >= vk::DebugUtilsMessageSeverityFlagsEXT::INFO {
        debug!({"type" = ?typ, id = %message_id}, "{}", message);
    } else {
        trace!({"type" = ?typ, id = %message_id}, "{}", message);
    }

    vk::FALSE
}

fn c_str_or<'a>(ptr: *const std::os::raw::c_char, fallback: &'a str) -> Cow<'a, str> {
    if ptr.is_null() {
        Cow::Borrowed(fallback)
    } else {
        // SAFETY: non-null strings from the layer are nul-terminated.
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
    }
}
