// Mock device - records native calls so the bookkeeping can be tested without a GPU
//
// Handles are increasing raw integers. Submitted fences stay pending until the
// test calls complete_pending(), or until a wait is issued with
// complete_on_wait enabled.

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::backend::native::{DeviceRef, NativeDevice};

#[derive(Debug, Clone)]
pub enum Call {
    BeginCmd(vk::CommandBuffer),
    EndCmd(vk::CommandBuffer),
    ResetCmd(vk::CommandBuffer),
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        clear_value_count: u32,
    },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    Draw { vertex_count: u32, first_vertex: u32 },
    SetViewport { x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32 },
    SetScissor(vk::Rect2D),
    ResetFence(vk::Fence),
    Submit {
        cmd: vk::CommandBuffer,
        waits: Vec<vk::Semaphore>,
        stages: Vec<vk::PipelineStageFlags>,
        signals: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Present {
        waits: Vec<vk::Semaphore>,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    },
    Acquire { semaphore: vk::Semaphore, image_index: u32 },
    CreateRenderPass { attachments: Vec<vk::AttachmentDescription> },
    CreateFramebuffer { render_pass: vk::RenderPass, views: u32, width: u32, height: u32 },
    CreateImageView { format: vk::Format, aspect: vk::ImageAspectFlags },
    CreateSwapchain { old_swapchain: vk::SwapchainKHR, image_count: u32, extent: vk::Extent2D },
    DestroySwapchain(vk::SwapchainKHR),
    DestroySurface(vk::SurfaceKHR),
    WaitIdle,
}

pub struct MockState {
    pub calls: Vec<Call>,
    pub live: HashSet<u64>,
    pub signaled: HashSet<u64>,
    pub pending: Vec<u64>,
    pub complete_on_wait: bool,
    pub present_supported: bool,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Image indices handed out by acquire, cycled
    pub acquire_order: Vec<u32>,
    /// Number of upcoming acquires that time out
    pub acquire_timeouts: u32,
    acquire_cursor: usize,
    swapchain_image_count: u32,
    // command buffer -> owning pool
    pool_of: HashMap<u64, u64>,
}

pub struct MockDevice {
    next_handle: Mutex<u64>,
    pub state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: vk::Extent2D { width: 800, height: 600 },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        };

        Arc::new(Self {
            next_handle: Mutex::new(0x1000),
            state: Mutex::new(MockState {
                calls: Vec::new(),
                live: HashSet::new(),
                signaled: HashSet::new(),
                pending: Vec::new(),
                complete_on_wait: true,
                present_supported: true,
                capabilities,
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                acquire_order: Vec::new(),
                acquire_timeouts: 0,
                acquire_cursor: 0,
                swapchain_image_count: 0,
                pool_of: HashMap::new(),
            }),
        })
    }

    pub fn as_device(self: &Arc<Self>) -> DeviceRef {
        self.clone()
    }

    fn handle(&self) -> u64 {
        let mut next = self.next_handle.lock();
        *next += 1;
        *next
    }

    fn create<H: Handle>(&self) -> H {
        let raw = self.handle();
        self.state.lock().live.insert(raw);
        H::from_raw(raw)
    }

    fn destroy<H: Handle>(&self, handle: H) {
        self.state.lock().live.remove(&handle.as_raw());
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    /// Signal every fence submitted so far, as if the GPU caught up
    pub fn complete_pending(&self) {
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending);
        state.signaled.extend(pending);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live<H: Handle>(&self, handle: H) -> bool {
        self.state.lock().live.contains(&handle.as_raw())
    }

    pub fn submits(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Submit { .. }))
            .collect()
    }
}

impl NativeDevice for MockDevice {
    fn graphics_queue_family(&self) -> u32 {
        0
    }

    fn get_device_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x10 + ((family_index as u64) << 4) + queue_index as u64)
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.record(Call::WaitIdle);
        self.complete_pending();
        Ok(())
    }

    fn create_command_pool(&self, _family_index: u32) -> VkResult<vk::CommandPool> {
        Ok(self.create())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy(pool);
        // Buffers allocated from the pool go with it
        let mut state = self.state.lock();
        let owned: Vec<u64> = state
            .pool_of
            .iter()
            .filter(|&(_, &p)| p == pool.as_raw())
            .map(|(&cmd, _)| cmd)
            .collect();
        for cmd in owned {
            state.pool_of.remove(&cmd);
            state.live.remove(&cmd);
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let cmd: vk::CommandBuffer = self.create();
        self.state.lock().pool_of.insert(cmd.as_raw(), pool.as_raw());
        Ok(cmd)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        self.state.lock().pool_of.remove(&cmd.as_raw());
        self.destroy(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::BeginCmd(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::EndCmd(cmd));
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::ResetCmd(cmd));
        Ok(())
    }

    fn cmd_begin_render_pass(&self, _cmd: vk::CommandBuffer, info: &vk::RenderPassBeginInfo) {
        self.record(Call::BeginRenderPass {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            clear_value_count: info.clear_value_count,
        });
    }

    fn cmd_end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.record(Call::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(Call::BindPipeline(pipeline));
    }

    fn cmd_draw(&self, _cmd: vk::CommandBuffer, vertex_count: u32, first_vertex: u32) {
        self.record(Call::Draw { vertex_count, first_vertex });
    }

    fn cmd_set_viewport(&self, _cmd: vk::CommandBuffer, viewport: &vk::Viewport) {
        self.record(Call::SetViewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        });
    }

    fn cmd_set_scissor(&self, _cmd: vk::CommandBuffer, scissor: &vk::Rect2D) {
        self.record(Call::SetScissor(*scissor));
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence: vk::Fence = self.create();
        if signaled {
            self.state.lock().signaled.insert(fence.as_raw());
        }
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.destroy(fence)
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self.state.lock().signaled.contains(&fence.as_raw()))
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.signaled.contains(&raw) {
            return Ok(());
        }
        if state.complete_on_wait && state.pending.contains(&raw) {
            state.pending.retain(|&f| f != raw);
            state.signaled.insert(raw);
            return Ok(());
        }
        Err(vk::Result::TIMEOUT)
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.signaled.remove(&fence.as_raw());
        state.calls.push(Call::ResetFence(fence));
        Ok(())
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        Ok(self.create())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.destroy(semaphore)
    }

    fn create_render_pass(&self, info: &vk::RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        let attachments = if info.attachment_count == 0 {
            Vec::new()
        } else {
            unsafe {
                std::slice::from_raw_parts(info.p_attachments, info.attachment_count as usize)
            }
            .to_vec()
        };
        self.record(Call::CreateRenderPass { attachments });
        Ok(self.create())
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroy(render_pass)
    }

    fn create_framebuffer(&self, info: &vk::FramebufferCreateInfo) -> VkResult<vk::Framebuffer> {
        self.record(Call::CreateFramebuffer {
            render_pass: info.render_pass,
            views: info.attachment_count,
            width: info.width,
            height: info.height,
        });
        Ok(self.create())
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroy(framebuffer)
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo) -> VkResult<vk::ImageView> {
        self.record(Call::CreateImageView {
            format: info.format,
            aspect: info.subresource_range.aspect_mask,
        });
        Ok(self.create())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy(view)
    }

    fn queue_submit(
        &self,
        _queue: vk::Queue,
        cmd: vk::CommandBuffer,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        if fence != vk::Fence::null() {
            state.pending.push(fence.as_raw());
        }
        state.calls.push(Call::Submit {
            cmd,
            waits: wait_semaphores.to_vec(),
            stages: wait_stages.to_vec(),
            signals: signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        swapchain: vk::SwapchainKHR,
        image_index: u32,
    ) -> VkResult<bool> {
        self.record(Call::Present {
            waits: wait_semaphores.to_vec(),
            swapchain,
            image_index,
        });
        Ok(false)
    }

    fn surface_support(&self, _family_index: u32, _surface: vk::SurfaceKHR) -> VkResult<bool> {
        Ok(self.state.lock().present_supported)
    }

    fn surface_capabilities(&self, _surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        Ok(self.state.lock().capabilities)
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    fn surface_present_modes(&self, _surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.record(Call::DestroySurface(surface));
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR) -> VkResult<vk::SwapchainKHR> {
        {
            let mut state = self.state.lock();
            state.swapchain_image_count = info.min_image_count;
            state.acquire_cursor = 0;
            state.calls.push(Call::CreateSwapchain {
                old_swapchain: info.old_swapchain,
                image_count: info.min_image_count,
                extent: info.image_extent,
            });
        }
        Ok(self.create())
    }

    fn get_swapchain_images(&self, _swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let count = self.state.lock().swapchain_image_count;
        Ok((0..count).map(|_| vk::Image::from_raw(self.handle())).collect())
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.destroy(swapchain);
        self.record(Call::DestroySwapchain(swapchain));
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        if state.acquire_timeouts > 0 {
            state.acquire_timeouts -= 1;
            return Err(vk::Result::TIMEOUT);
        }
        let image_index = if state.acquire_order.is_empty() {
            let count = state.swapchain_image_count.max(1);
            state.acquire_cursor as u32 % count
        } else {
            state.acquire_order[state.acquire_cursor % state.acquire_order.len()]
        };
        state.acquire_cursor += 1;
        state.calls.push(Call::Acquire { semaphore, image_index });
        Ok((image_index, false))
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
