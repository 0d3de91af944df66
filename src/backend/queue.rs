// Queue - submission and present endpoint

use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

use super::command::{CmdBufferState, CommandBuffer};
use super::native::DeviceRef;
use super::sync::FencePool;
use crate::error::{RhiError, RhiResult};

pub struct Queue {
    handle: vk::Queue,
    family_index: u32,
    queue_index: u32,
    submissions: AtomicU64,
    device: DeviceRef,
}

impl Queue {
    pub fn new(device: DeviceRef, family_index: u32, queue_index: u32) -> Self {
        let handle = device.get_device_queue(family_index, queue_index);
        Self {
            handle,
            family_index,
            queue_index,
            submissions: AtomicU64::new(0),
            device,
        }
    }

    pub fn graphics(device: DeviceRef) -> Self {
        let family = device.graphics_queue_family();
        Self::new(device, family, 0)
    }

    /// Queue used for presenting to `surface`. Only the graphics family is
    /// considered; a device that cannot present from it is rejected.
    pub fn present(device: DeviceRef, graphics: &Queue, surface: vk::SurfaceKHR) -> RhiResult<Self> {
        if !device.surface_support(graphics.family_index, surface)? {
            return Err(RhiError::Negotiation(
                "graphics queue family cannot present to this surface".into(),
            ));
        }
        Ok(Self::new(device, graphics.family_index, graphics.queue_index))
    }

    #[inline]
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    pub fn queue_index(&self) -> u32 {
        self.queue_index
    }

    /// Submit an ended buffer with its accumulated wait semaphores.
    /// A fence from `fences` is attached and handed to the buffer.
    pub fn submit(
        &self,
        cmd: &mut CommandBuffer,
        fences: &mut FencePool,
        signal_semaphores: &[vk::Semaphore],
    ) -> RhiResult<()> {
        if cmd.state() != CmdBufferState::HasEnded {
            return Err(RhiError::invalid_state("submit", cmd.state()));
        }

        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) =
            cmd.wait_semaphores().iter().copied().unzip();

        let fence = fences.allocate(false)?;
        if let Err(e) = self.device.queue_submit(
            self.handle,
            cmd.handle(),
            &wait_semaphores,
            &wait_stages,
            signal_semaphores,
            fences.handle(fence),
        ) {
            fences.release(fence)?;
            return Err(e.into());
        }

        let serial = self.submissions.fetch_add(1, Ordering::Relaxed) + 1;
        cmd.mark_submitted(fence, serial);
        Ok(())
    }

    /// Present `image_index`. Returns true if the swapchain is suboptimal.
    pub fn present_image(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RhiResult<bool> {
        Ok(self
            .device
            .queue_present(self.handle, wait_semaphores, swapchain, image_index)?)
    }
}
