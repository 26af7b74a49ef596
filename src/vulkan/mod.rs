//! A headless Vulkan implementation of [`GpuDevice`].
//!
//! Each slot is a persistently mapped, host-coherent buffer. Submitting a
//! frame records a copy from the slot into a device-local vertex buffer,
//! submits it with the slot's fence, and hands the fence to a watcher thread
//! that fires the completion handler once the fence signals.

pub(crate) mod buffers;
pub(crate) mod commands;
pub(crate) mod devices;
pub(crate) mod instance;
pub(crate) mod synchronization;
pub(crate) mod validation;

use std::{
    cell::RefCell,
    fmt,
    ptr::NonNull,
    slice,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ash::{extensions::ext as vk_ext, vk, Device, Entry, Instance};
use color_eyre::{
    eyre::{eyre, Context},
    Result,
};
use tracing::{debug, warn};

use self::{
    buffers::{create_buffer, destroy_buffer, AllocatedBuffer},
    commands::{allocate_command_buffer, create_command_pool, record_slot_upload},
    devices::{create_logical_device, pick_physical_device, SelectedDevice},
    instance::create_instance,
    synchronization::{create_fence, FenceWatcher},
};
use crate::{
    error::{AllocationError, SubmitError},
    gpu::{CompletionHandler, CompletionStatus, FrameSubmission, GpuDevice, SlotBuffer},
};

/// A host-visible Vulkan buffer, mapped for the lifetime of the device.
#[derive(Clone)]
pub struct VulkanSlotBuffer {
    buffer: vk::Buffer,
    mapped: NonNull<u8>,
    len: usize,
}

// SAFETY: the pointer is into driver-owned mapped memory that stays mapped
// until the owning `VulkanGpu` is dropped. Who may touch it when is governed
// by the `SlotBuffer` contract.
unsafe impl Send for VulkanSlotBuffer {}
unsafe impl Sync for VulkanSlotBuffer {}

impl SlotBuffer for VulkanSlotBuffer {
    fn byte_len(&self) -> usize {
        self.len
    }

    unsafe fn bytes(&self) -> &[u8] {
        slice::from_raw_parts(self.mapped.as_ptr(), self.len)
    }

    unsafe fn bytes_mut(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.mapped.as_ptr(), self.len)
    }
}

impl fmt::Debug for VulkanSlotBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VulkanSlotBuffer")
            .field("buffer", &self.buffer)
            .field("len", &self.len)
            .finish()
    }
}

/// Everything one slot needs on the GPU side.
#[derive(Debug)]
struct SlotResources {
    staging: AllocatedBuffer,
    vertex_buffer: AllocatedBuffer,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// A Vulkan device with one queue, driven without a window.
pub struct VulkanGpu {
    // Joined first on drop, before anything it might be waiting on goes away.
    watcher: FenceWatcher,
    entry: Entry,
    instance: Instance,
    messenger: Option<vk::DebugUtilsMessengerEXT>,
    selected: SelectedDevice,
    device: Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
    slots: RefCell<Vec<Option<SlotResources>>>,
    device_lost: Arc<AtomicBool>,
}

impl VulkanGpu {
    /// Load the Vulkan library and open a device on the best GPU available.
    ///
    /// # Safety
    ///
    /// Loads and calls into the system's Vulkan driver, which can do anything.
    #[tracing::instrument(level = "DEBUG", name = "VulkanGpu::create", skip_all)]
    pub unsafe fn create() -> Result<Self> {
        debug!("Loading instance of Vulkan library");
        let entry = Entry::load()
            .map_err(|e| eyre!("{e}"))
            .wrap_err("Error loading Vulkan library")?;
        let (instance, messenger) = create_instance(&entry)?;

        debug!("Selecting device");
        let selected = pick_physical_device(&instance)?;
        let (device, queue) = create_logical_device(&instance, &selected, messenger.is_some())?;

        debug!("Creating command pool");
        let command_pool = create_command_pool(&device, selected.queue_family)?;

        let device_lost = Arc::new(AtomicBool::new(false));
        let watcher = FenceWatcher::spawn(device.clone(), Arc::clone(&device_lost))
            .wrap_err("Error starting the fence watcher")?;

        Ok(Self {
            watcher,
            entry,
            instance,
            messenger,
            selected,
            device,
            queue,
            command_pool,
            slots: RefCell::new(Vec::new()),
            device_lost,
        })
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost.load(Ordering::SeqCst)
    }

    unsafe fn create_slot(&self, byte_size: usize) -> Result<SlotResources> {
        let size = byte_size as vk::DeviceSize;

        let staging = create_buffer(
            &self.device,
            &self.selected.memory_properties,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let usage = vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER;
        let vertex_buffer = create_buffer(
            &self.device,
            &self.selected.memory_properties,
            size,
            usage,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .or_else(|_| {
            // Some software drivers only offer host-visible memory.
            create_buffer(
                &self.device,
                &self.selected.memory_properties,
                size,
                usage,
                vk::MemoryPropertyFlags::empty(),
            )
        });
        let vertex_buffer = match vertex_buffer {
            Ok(vertex_buffer) => vertex_buffer,
            Err(e) => {
                destroy_buffer(&self.device, &staging);
                return Err(e);
            }
        };

        let command_buffer = match allocate_command_buffer(&self.device, self.command_pool) {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                destroy_buffer(&self.device, &vertex_buffer);
                destroy_buffer(&self.device, &staging);
                return Err(e);
            }
        };

        let fence = match create_fence(&self.device) {
            Ok(fence) => fence,
            Err(e) => {
                self.device.free_command_buffers(self.command_pool, &[command_buffer]);
                destroy_buffer(&self.device, &vertex_buffer);
                destroy_buffer(&self.device, &staging);
                return Err(e);
            }
        };

        Ok(SlotResources {
            staging,
            vertex_buffer,
            command_buffer,
            fence,
        })
    }

    unsafe fn destroy_slot(&self, slot: &SlotResources) {
        self.device.destroy_fence(slot.fence, None);
        self.device
            .free_command_buffers(self.command_pool, &[slot.command_buffer]);
        destroy_buffer(&self.device, &slot.vertex_buffer);
        // Freeing mapped memory implicitly unmaps it.
        destroy_buffer(&self.device, &slot.staging);
    }
}

impl GpuDevice for VulkanGpu {
    type Buffer = VulkanSlotBuffer;

    #[tracing::instrument(level = "DEBUG", name = "VulkanGpu::allocate_slot", skip(self))]
    fn allocate_slot(
        &self,
        slot: usize,
        byte_size: usize,
    ) -> Result<VulkanSlotBuffer, AllocationError> {
        let out_of_memory = |reason: String| AllocationError::OutOfMemory {
            slot,
            size: byte_size,
            reason,
        };

        // SAFETY: every handle used belongs to this device.
        let resources = unsafe { self.create_slot(byte_size) }
            .map_err(|e| out_of_memory(format!("{e:#}")))?;

        // SAFETY: the memory is host-visible and not mapped anywhere else.
        let mapped = unsafe {
            self.device.map_memory(
                resources.staging.memory,
                0,
                resources.staging.size,
                vk::MemoryMapFlags::empty(),
            )
        };
        let mapped = match mapped.map(|p| NonNull::new(p.cast::<u8>())) {
            Ok(Some(mapped)) => mapped,
            Ok(None) => {
                unsafe { self.destroy_slot(&resources) };
                return Err(out_of_memory("driver mapped the slot at null".into()));
            }
            Err(e) => {
                unsafe { self.destroy_slot(&resources) };
                return Err(out_of_memory(e.to_string()));
            }
        };

        let buffer = VulkanSlotBuffer {
            buffer: resources.staging.buffer,
            mapped,
            len: byte_size,
        };

        let mut slots = self.slots.borrow_mut();
        if slots.len() <= slot {
            slots.resize_with(slot + 1, || None);
        }
        if let Some(old) = slots[slot].replace(resources) {
            warn!(slot, "Slot reallocated; freeing the old one");
            unsafe { self.destroy_slot(&old) };
        }

        Ok(buffer)
    }

    fn submit(
        &self,
        submission: FrameSubmission<VulkanSlotBuffer>,
        on_complete: CompletionHandler,
    ) -> Result<(), SubmitError> {
        if self.is_device_lost() {
            return Err(SubmitError::DeviceLost);
        }

        let slots = self.slots.borrow();
        let resources = slots
            .get(submission.slot)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                SubmitError::Failed(format!("no resources for slot {}", submission.slot))
            })?;

        let size = submission.layout.byte_size() as vk::DeviceSize;
        let to_submit_error = |e: vk::Result| match e {
            vk::Result::ERROR_DEVICE_LOST => {
                self.device_lost.store(true, Ordering::SeqCst);
                SubmitError::DeviceLost
            }
            e => SubmitError::Failed(e.to_string()),
        };

        // SAFETY: the slot's previous submission has completed (that's what
        // the gate guarantees), so its command buffer and fence are idle.
        unsafe {
            record_slot_upload(
                &self.device,
                resources.command_buffer,
                submission.buffer.buffer,
                resources.vertex_buffer.buffer,
                size,
            )
            .map_err(to_submit_error)?;

            self.device
                .reset_fences(&[resources.fence])
                .map_err(to_submit_error)?;

            let command_buffers = &[resources.command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(command_buffers);
            self.device
                .queue_submit(self.queue, &[*submit_info], resources.fence)
                .map_err(to_submit_error)?;
        }

        if let Err(on_complete) = self.watcher.watch(resources.fence, on_complete) {
            // The work is already queued, so the slot can't be given back
            // until the GPU is really done with it.
            warn!(frame = on_complete.frame(), "Fence watcher is gone, waiting inline");
            let waited =
                unsafe { self.device.wait_for_fences(&[resources.fence], true, u64::MAX) };
            let status = match waited {
                Ok(()) => CompletionStatus::Completed,
                Err(e) => CompletionStatus::Failed(e.to_string()),
            };
            on_complete.complete(status);
        }

        Ok(())
    }
}

impl Drop for VulkanGpu {
    #[tracing::instrument(level = "DEBUG", name = "VulkanGpu::destroy", skip_all)]
    fn drop(&mut self) {
        // Every fence handed to the watcher gets waited on before it exits.
        self.watcher.join();

        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!(error = %e, "Device didn't go idle cleanly");
            }

            let slots = std::mem::take(self.slots.get_mut());
            for slot in slots.iter().flatten() {
                self.destroy_slot(slot);
            }

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);

            if let Some(messenger) = self.messenger {
                vk_ext::DebugUtils::new(&self.entry, &self.instance)
                    .destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}
