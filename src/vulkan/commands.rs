//! Command buffer allocation and recording.

use ash::{vk, Device};
use color_eyre::Result;

/// Create a command pool whose buffers can be individually reset and
/// re-recorded, since each slot records its commands fresh every frame.
#[tracing::instrument(level = "DEBUG", skip(device))]
pub(crate) unsafe fn create_command_pool(
    device: &Device,
    queue_family: u32,
) -> Result<vk::CommandPool> {
    let info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family);

    Ok(device.create_command_pool(&info, None)?)
}

/// Allocate one primary command buffer from `pool`.
pub(crate) unsafe fn allocate_command_buffer(
    device: &Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer> {
    let allocate_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    Ok(device.allocate_command_buffers(&allocate_info)?[0])
}

/// Record the GPU's side of a frame: pull `size` bytes of slot memory into
/// the device-local vertex buffer the draw would read from.
///
/// Encoding the draw itself is the renderer's business; this copy is the part
/// that reads the slot, and so the part the fences guard.
pub(crate) unsafe fn record_slot_upload(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    slot_buffer: vk::Buffer,
    vertex_buffer: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<(), vk::Result> {
    device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;

    let info = vk::CommandBufferBeginInfo::builder()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    device.begin_command_buffer(command_buffer, &info)?;

    let region = vk::BufferCopy::builder().src_offset(0).dst_offset(0).size(size);
    device.cmd_copy_buffer(command_buffer, slot_buffer, vertex_buffer, &[*region]);

    // Make the copy visible to vertex fetch in whatever gets recorded next.
    let barrier = vk::BufferMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::UNIFORM_READ)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(vertex_buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);
    device.cmd_pipeline_barrier(
        command_buffer,
        vk::PipelineStageFlags::TRANSFER,
        vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::VERTEX_SHADER,
        vk::DependencyFlags::empty(),
        &[],
        &[*barrier],
        &[],
    );

    device.end_command_buffer(command_buffer)
}
