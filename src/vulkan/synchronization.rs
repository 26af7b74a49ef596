//! Fences, and the thread that turns signalled fences into completion
//! notifications.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
};

use ash::{vk, Device};
use color_eyre::Result;
use tracing::{error, trace};

use crate::gpu::{CompletionHandler, CompletionStatus};

/// Create an unsignalled fence.
pub(crate) unsafe fn create_fence(device: &Device) -> Result<vk::Fence> {
    let info = vk::FenceCreateInfo::builder();
    Ok(device.create_fence(&info, None)?)
}

/// Waits on submitted fences in submission order and fires each
/// submission's completion handler once its fence signals.
pub(crate) struct FenceWatcher {
    sender: Option<mpsc::Sender<(vk::Fence, CompletionHandler)>>,
    thread: Option<JoinHandle<()>>,
}

impl FenceWatcher {
    pub(crate) fn spawn(device: Device, device_lost: Arc<AtomicBool>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<(vk::Fence, CompletionHandler)>();

        let thread = thread::Builder::new()
            .name("vk-fence-watcher".into())
            .spawn(move || {
                for (fence, on_complete) in receiver {
                    // SAFETY: the fence outlives the watcher; see VulkanGpu's Drop.
                    let result = unsafe { device.wait_for_fences(&[fence], true, u64::MAX) };
                    let status = match result {
                        Ok(()) => CompletionStatus::Completed,
                        Err(vk::Result::ERROR_DEVICE_LOST) => {
                            device_lost.store(true, Ordering::SeqCst);
                            CompletionStatus::Failed("device lost".into())
                        }
                        Err(e) => {
                            error!(
                                frame = on_complete.frame(),
                                error = %e,
                                "Waiting on a frame fence failed"
                            );
                            CompletionStatus::Failed(e.to_string())
                        }
                    };
                    on_complete.complete(status);
                }
                trace!("Fence watcher exiting");
            })?;

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Hand over a submitted fence. Gives the handler back if the watcher
    /// has already stopped.
    pub(crate) fn watch(
        &self,
        fence: vk::Fence,
        on_complete: CompletionHandler,
    ) -> Result<(), CompletionHandler> {
        match &self.sender {
            Some(sender) => sender
                .send((fence, on_complete))
                .map_err(|mpsc::SendError((_, handler))| handler),
            None => Err(on_complete),
        }
    }

    /// Stop accepting fences and wait for everything already handed over.
    pub(crate) fn join(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FenceWatcher {
    fn drop(&mut self) {
        self.join();
    }
}
