//! Creating buffers and finding memory for them.

use ash::{vk, Device};
use color_eyre::{eyre::eyre, Result};

/// A buffer together with the memory bound to it.
#[derive(Copy, Clone, Debug)]
pub(crate) struct AllocatedBuffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) size: vk::DeviceSize,
}

/// Given a set of memory requirements and property flags, return the index
/// of the *type* of memory to use for allocating something.
pub(crate) fn get_memory_type_index(
    memory: &vk::PhysicalDeviceMemoryProperties,
    properties: vk::MemoryPropertyFlags,
    requirements: vk::MemoryRequirements,
) -> Result<u32> {
    (0..memory.memory_type_count)
        .find(|i| {
            let suitable = (requirements.memory_type_bits & (1 << i)) != 0;
            let memory_type = memory.memory_types[*i as usize];
            suitable && memory_type.property_flags.contains(properties)
        })
        .ok_or_else(|| eyre!("Failed to find a memory type with {properties:?}"))
}

/// Create a buffer of `size` bytes and bind freshly allocated memory to it.
#[tracing::instrument(level = "DEBUG", skip(device, memory_properties))]
pub(crate) unsafe fn create_buffer(
    device: &Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    properties: vk::MemoryPropertyFlags,
) -> Result<AllocatedBuffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        // only ever used from our one queue
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = device.create_buffer(&buffer_info, None)?;

    let requirements = device.get_buffer_memory_requirements(buffer);
    let memory_info = match get_memory_type_index(memory_properties, properties, requirements) {
        Ok(memory_type_index) => vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index),
        Err(e) => {
            device.destroy_buffer(buffer, None);
            return Err(e);
        }
    };

    let memory = match device.allocate_memory(&memory_info, None) {
        Ok(memory) => memory,
        Err(e) => {
            device.destroy_buffer(buffer, None);
            return Err(e.into());
        }
    };

    if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
        device.destroy_buffer(buffer, None);
        device.free_memory(memory, None);
        return Err(e.into());
    }

    Ok(AllocatedBuffer {
        buffer,
        memory,
        size,
    })
}

/// Destroy a buffer created by [`create_buffer()`] and free its memory.
pub(crate) unsafe fn destroy_buffer(device: &Device, buffer: &AllocatedBuffer) {
    device.destroy_buffer(buffer.buffer, None);
    device.free_memory(buffer.memory, None);
}
