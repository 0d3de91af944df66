// Swapchain - presentable image ring and the acquire/present protocol
//
// Each ring slot owns an "image acquired" and a "rendering done" semaphore.
// The slot advances by one on every acquire; the image index the driver
// returns is independent of it.

use ash::vk;

use super::command::CommandBuffer;
use super::native::DeviceRef;
use super::queue::Queue;
use super::render_target::Texture;
use super::sync::{FencePool, Semaphore};
use crate::error::{RhiError, RhiResult};

/// Requested presentation parameters
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub present_mode: vk::PresentModeKHR,
    pub back_buffer_count: u32,
    pub acquire_timeout_ns: u64,
}

impl Default for SwapchainSettings {
    fn default() -> Self {
        Self {
            present_mode: vk::PresentModeKHR::MAILBOX,
            back_buffer_count: 3,
            acquire_timeout_ns: u64::MAX,
        }
    }
}

/// What the surface can do
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(device: &DeviceRef, surface: vk::SurfaceKHR) -> RhiResult<Self> {
        Ok(Self {
            capabilities: device.surface_capabilities(surface)?,
            formats: device.surface_formats(surface)?,
            present_modes: device.surface_present_modes(surface)?,
        })
    }
}

/// Parameters agreed between the request and the surface
#[derive(Debug, Clone, Copy)]
pub struct Negotiated {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

pub fn negotiate(
    support: &SurfaceSupport,
    settings: &SwapchainSettings,
    width: u32,
    height: u32,
) -> RhiResult<Negotiated> {
    let caps = &support.capabilities;

    // Choose surface format (prefer SRGB)
    let surface_format = support
        .formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| support.formats.first())
        .copied()
        .ok_or_else(|| RhiError::Negotiation("surface reports no formats".into()))?;

    if support.present_modes.is_empty() {
        return Err(RhiError::Negotiation("surface reports no present modes".into()));
    }

    // Requested mode, then MAILBOX, then FIFO which is always supported
    let present_mode = [settings.present_mode, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| support.present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO);

    let mut image_count = settings.back_buffer_count.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        image_count = image_count.min(caps.max_image_count);
    }

    let extent = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    };

    let pre_transform = if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    };

    let composite_alpha = if caps
        .supported_composite_alpha
        .contains(vk::CompositeAlphaFlagsKHR::OPAQUE)
    {
        vk::CompositeAlphaFlagsKHR::OPAQUE
    } else {
        vk::CompositeAlphaFlagsKHR::INHERIT
    };

    Ok(Negotiated {
        surface_format,
        present_mode,
        image_count,
        extent,
        pre_transform,
        composite_alpha,
    })
}

/// Native handles carried across a recreate so the new swapchain can take
/// over from the old one instead of a hard teardown
#[derive(Debug, Default)]
pub struct RecreateToken {
    pub swapchain: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
}

struct RingSlot {
    image_acquired: Semaphore,
    rendering_done: Semaphore,
}

pub struct SwapchainController {
    swapchain: vk::SwapchainKHR,
    surface: vk::SurfaceKHR,
    back_buffers: Vec<Texture>,
    ring: Vec<RingSlot>,
    semaphore_index: usize,
    // (ring slot, image index) of the image being rendered this frame
    acquired: Option<(usize, u32)>,
    negotiated: Negotiated,
    settings: SwapchainSettings,
    device: DeviceRef,
}

impl SwapchainController {
    /// Takes ownership of `surface`; it is destroyed with the controller.
    pub fn new(
        device: DeviceRef,
        surface: vk::SurfaceKHR,
        settings: SwapchainSettings,
        width: u32,
        height: u32,
    ) -> RhiResult<Self> {
        let mut controller = Self {
            swapchain: vk::SwapchainKHR::null(),
            surface,
            back_buffers: Vec::new(),
            ring: Vec::new(),
            semaphore_index: 0,
            acquired: None,
            negotiated: Negotiated {
                surface_format: vk::SurfaceFormatKHR::default(),
                present_mode: vk::PresentModeKHR::FIFO,
                image_count: 0,
                extent: vk::Extent2D::default(),
                pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            },
            settings,
            device,
        };
        controller.create(RecreateToken::default(), width, height)?;
        Ok(controller)
    }

    fn create(&mut self, token: RecreateToken, width: u32, height: u32) -> RhiResult<()> {
        if token.surface != vk::SurfaceKHR::null() {
            self.surface = token.surface;
        }

        let support = SurfaceSupport::query(&self.device, self.surface)?;
        let negotiated = negotiate(&support, &self.settings, width, height)?;
        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            negotiated.extent.width,
            negotiated.extent.height,
            negotiated.image_count,
            negotiated.surface_format.format,
            negotiated.present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(negotiated.image_count)
            .image_format(negotiated.surface_format.format)
            .image_color_space(negotiated.surface_format.color_space)
            .image_extent(negotiated.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(negotiated.pre_transform)
            .composite_alpha(negotiated.composite_alpha)
            .present_mode(negotiated.present_mode)
            .clipped(true)
            .old_swapchain(token.swapchain);

        let created = self.device.create_swapchain(&create_info);

        // The old swapchain is retired once its successor was attempted
        if token.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(token.swapchain);
        }
        let swapchain = created?;

        let images = self.device.get_swapchain_images(swapchain)?;
        log::info!("Created swapchain with {} images", images.len());

        self.back_buffers = images
            .iter()
            .map(|&image| Texture::back_buffer(image, negotiated.surface_format.format, negotiated.extent))
            .collect();

        if self.ring.len() != images.len() {
            self.ring = (0..images.len())
                .map(|_| {
                    Ok(RingSlot {
                        image_acquired: Semaphore::new(&self.device)?,
                        rendering_done: Semaphore::new(&self.device)?,
                    })
                })
                .collect::<RhiResult<Vec<_>>>()?;
        }

        self.swapchain = swapchain;
        self.negotiated = negotiated;
        // First acquire lands on slot 0
        self.semaphore_index = self.ring.len().saturating_sub(1);
        self.acquired = None;
        Ok(())
    }

    /// Hand the native handles to a token, leaving the controller empty
    fn retire(&mut self) -> RecreateToken {
        self.acquired = None;
        RecreateToken {
            swapchain: std::mem::replace(&mut self.swapchain, vk::SwapchainKHR::null()),
            surface: std::mem::replace(&mut self.surface, vk::SurfaceKHR::null()),
        }
    }

    /// Rebuild for a new window size. Waits for the device to go idle first.
    pub fn resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.device_wait_idle()?;
        let token = self.retire();
        self.create(token, width, height)
    }

    /// Advance the ring and acquire the next image. Returns the image index,
    /// or `None` when no image became available within the acquire timeout.
    /// A timed-out acquire leaves the ring where it was.
    pub fn acquire_image(&mut self) -> RhiResult<Option<u32>> {
        if self.ring.is_empty() {
            return Err(RhiError::Negotiation("swapchain has no images".into()));
        }

        let slot = (self.semaphore_index + 1) % self.ring.len();
        let semaphore = self.ring[slot].image_acquired.handle();
        let acquired = self.device.acquire_next_image(
            self.swapchain,
            self.settings.acquire_timeout_ns,
            semaphore,
        );
        let (image_index, suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                log::debug!("No swapchain image available within {} ns", self.settings.acquire_timeout_ns);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if suboptimal {
            log::warn!("Swapchain is suboptimal for the surface");
        }

        self.semaphore_index = slot;
        self.acquired = Some((slot, image_index));
        Ok(Some(image_index))
    }

    /// Submit the ended buffer and present the acquired image.
    ///
    /// The submission waits on the slot's "image acquired" semaphore and
    /// signals its "rendering done" semaphore plus the buffer's fence; the
    /// present waits on "rendering done".
    pub fn present(
        &mut self,
        queue: &Queue,
        present_queue: &Queue,
        cmd: &mut CommandBuffer,
        fences: &mut FencePool,
    ) -> RhiResult<bool> {
        if !cmd.has_ended() {
            return Err(RhiError::invalid_state("present", cmd.state()));
        }
        let (slot, image_index) = self.acquired.ok_or(RhiError::SwapchainNotAcquired)?;

        let ring_slot = &self.ring[slot];
        cmd.add_wait_semaphore(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ring_slot.image_acquired.handle(),
        );
        let rendering_done = [ring_slot.rendering_done.handle()];
        queue.submit(cmd, fences, &rendering_done)?;

        let suboptimal = present_queue.present_image(self.swapchain, image_index, &rendering_done)?;
        if suboptimal {
            log::warn!("Present reported a suboptimal swapchain");
        }

        self.acquired = None;
        Ok(suboptimal)
    }

    pub fn back_buffer(&self, index: usize) -> Option<&Texture> {
        self.back_buffers.get(index)
    }

    /// Back buffer for the image acquired this frame
    pub fn acquired_back_buffer(&self) -> Option<&Texture> {
        self.acquired
            .and_then(|(_, image_index)| self.back_buffers.get(image_index as usize))
    }

    pub fn acquired_image_index(&self) -> Option<u32> {
        self.acquired.map(|(_, image_index)| image_index)
    }

    pub fn semaphore_index(&self) -> usize {
        self.semaphore_index
    }

    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }

    pub fn image_count(&self) -> usize {
        self.back_buffers.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.negotiated.extent
    }

    pub fn format(&self) -> vk::Format {
        self.negotiated.surface_format.format
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }
}

impl Drop for SwapchainController {
    fn drop(&mut self) {
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
        }
        if self.surface != vk::SurfaceKHR::null() {
            self.device.destroy_surface(self.surface);
        }
    }
}
