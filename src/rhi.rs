// RHI - frame orchestration over the command, swapchain and render target layers
//
// One frame:
//   begin_drawing -> [acquire_back_buffer] -> begin_render_pass -> draws
//   -> end_render_pass -> end_drawing (submit + present)
//
// These entry points are the contract the renderer relies on. Calling them
// out of order is a programming error and is fatal.

use ash::vk;

use crate::backend::command::{CommandBuffer, CommandBufferManager};
use crate::backend::native::DeviceRef;
use crate::backend::pipeline::PipelineState;
use crate::backend::queue::Queue;
use crate::backend::render_pass::RenderTargetCache;
use crate::backend::render_target::{RenderTargetLayout, RenderTargetView, RenderTargetsInfo, Texture};
use crate::backend::swapchain::{SwapchainController, SwapchainSettings};
use crate::error::{OrFatal, RhiError, RhiResult};

#[derive(Debug, Clone, Copy)]
pub struct RhiSettings {
    pub swapchain: SwapchainSettings,
    /// Per-pool cap before prepare waits on the oldest submission
    pub max_command_buffers: usize,
    pub fence_timeout_ns: u64,
}

impl Default for RhiSettings {
    fn default() -> Self {
        let swapchain = SwapchainSettings::default();
        Self {
            max_command_buffers: swapchain.back_buffer_count as usize,
            swapchain,
            fence_timeout_ns: u64::MAX,
        }
    }
}

/// Field order is drop order: cached framebuffers and render passes, then the
/// swapchain, then command buffers and their fences.
pub struct Rhi {
    cache: RenderTargetCache,
    swapchain: SwapchainController,
    commands: CommandBufferManager,
    graphics_queue: Queue,
    present_queue: Queue,
    device: DeviceRef,
}

impl Rhi {
    /// Takes ownership of `surface`.
    pub fn new(
        device: DeviceRef,
        surface: vk::SurfaceKHR,
        settings: RhiSettings,
        width: u32,
        height: u32,
    ) -> RhiResult<Self> {
        let graphics_queue = Queue::graphics(device.clone());
        let present_queue = match Queue::present(device.clone(), &graphics_queue, surface) {
            Ok(queue) => queue,
            Err(e) => {
                device.destroy_surface(surface);
                return Err(e);
            }
        };

        let swapchain = SwapchainController::new(device.clone(), surface, settings.swapchain, width, height)?;
        let commands = CommandBufferManager::new(
            device.clone(),
            graphics_queue.family_index(),
            settings.max_command_buffers,
            settings.fence_timeout_ns,
        )?;

        log::info!(
            "RHI ready: {} back buffers, up to {} command buffers per pool",
            swapchain.image_count(),
            settings.max_command_buffers.max(1)
        );

        Ok(Self {
            cache: RenderTargetCache::new(device.clone()),
            swapchain,
            commands,
            graphics_queue,
            present_queue,
            device,
        })
    }

    /// Select and begin the frame's command buffer
    pub fn begin_drawing(&mut self) {
        self.commands.prepare_for_new_active().map(|_| ()).or_fatal();
    }

    /// The back buffer for this frame, acquiring one if needed. Running out
    /// of the acquire timeout is fatal here; see `try_acquire_back_buffer`.
    pub fn acquire_back_buffer(&mut self) -> Texture {
        self.acquire_if_needed()
            .and_then(|texture| texture.ok_or(RhiError::Vulkan(vk::Result::TIMEOUT)))
            .or_fatal()
    }

    /// Like `acquire_back_buffer`, but `None` when no image became available
    /// within the acquire timeout. The frame can be retried later.
    pub fn try_acquire_back_buffer(&mut self) -> Option<Texture> {
        self.acquire_if_needed().or_fatal()
    }

    fn acquire_if_needed(&mut self) -> RhiResult<Option<Texture>> {
        if self.swapchain.acquired_image_index().is_none() {
            // The slot about to be reused must not be awaited by a pending
            // submission, so keep fewer frames in flight than the ring holds
            self.commands.throttle_graphics(self.swapchain.ring_size())?;
            if self.swapchain.acquire_image()?.is_none() {
                return Ok(None);
            }
        }
        self.swapchain
            .acquired_back_buffer()
            .copied()
            .map(Some)
            .ok_or(RhiError::SwapchainNotAcquired)
    }

    /// Single color target on the acquired back buffer
    pub fn back_buffer_targets(
        &mut self,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear_color: [f32; 4],
    ) -> RenderTargetsInfo {
        let back_buffer = self.acquire_back_buffer();
        RenderTargetsInfo::single_color(RenderTargetView::new(back_buffer, load_op, store_op))
            .with_clear_color(clear_color)
    }

    pub fn begin_render_pass(&mut self, targets: &RenderTargetsInfo) {
        self.try_begin_render_pass(targets).or_fatal()
    }

    fn try_begin_render_pass(&mut self, targets: &RenderTargetsInfo) -> RhiResult<()> {
        let layout = RenderTargetLayout::new(targets)?;
        let render_pass = self.cache.get_or_create_render_pass(&layout)?;
        let framebuffer = self.cache.get_or_create_framebuffer(targets, &layout, &render_pass)?;
        let clear_values = targets.clear_values();

        self.commands
            .active_mut()?
            .begin_render_pass(&render_pass, &framebuffer, &clear_values)
    }

    pub fn end_render_pass(&mut self) {
        self.commands
            .active_mut()
            .and_then(CommandBuffer::end_render_pass)
            .or_fatal()
    }

    pub fn set_pipeline_state(&mut self, pipeline: &PipelineState) {
        self.commands
            .active_mut()
            .and_then(|cmd| cmd.bind_pipeline(pipeline))
            .map(|_| ())
            .or_fatal()
    }

    /// Draw `num_primitives` triangles starting at `base_vertex`
    pub fn draw_primitive(&mut self, base_vertex: u32, num_primitives: u32) {
        self.commands
            .active_mut()
            .and_then(|cmd| {
                let vertex_count = num_primitives
                    .checked_mul(3)
                    .ok_or_else(|| RhiError::invalid_state("draw_primitive with an overflowing vertex count", num_primitives))?;
                cmd.draw(vertex_count, base_vertex)
            })
            .or_fatal()
    }

    pub fn set_viewport(&mut self, min_x: f32, min_y: f32, min_z: f32, max_x: f32, max_y: f32, max_z: f32) {
        self.commands
            .active_mut()
            .and_then(|cmd| cmd.set_viewport(min_x, min_y, min_z, max_x, max_y, max_z))
            .or_fatal()
    }

    /// Viewport spanning the back buffer from (min_x, min_y)
    pub fn set_back_buffer_viewport(&mut self, min_x: f32, min_y: f32, min_z: f32, max_z: f32) {
        let extent = self.swapchain.extent();
        self.set_viewport(
            min_x,
            min_y,
            min_z,
            extent.width as f32,
            extent.height as f32,
            max_z,
        );
    }

    pub fn set_scissor_rect(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.commands
            .active_mut()
            .and_then(|cmd| cmd.set_scissor(x, y, width, height))
            .or_fatal()
    }

    /// End the frame: end recording, submit against the acquired image and
    /// present it. Returns true if the swapchain no longer matches the surface.
    pub fn end_drawing(&mut self) -> bool {
        self.try_end_drawing().or_fatal()
    }

    fn try_end_drawing(&mut self) -> RhiResult<bool> {
        let (cmd, fences) = self.commands.active_with_fences()?;
        cmd.end()?;
        let suboptimal = self
            .swapchain
            .present(&self.graphics_queue, &self.present_queue, cmd, fences)?;
        self.commands.clear_active();
        Ok(suboptimal)
    }

    /// Submit the active buffer without presenting
    pub fn submit_active(&mut self, signal_semaphores: &[vk::Semaphore]) {
        self.commands
            .submit_active(&self.graphics_queue, signal_semaphores)
            .or_fatal()
    }

    /// Make the next graphics submission wait on `semaphore` at `stage`
    pub fn add_wait_semaphore(&mut self, stage: vk::PipelineStageFlags, semaphore: vk::Semaphore) {
        self.commands
            .active_mut()
            .map(|cmd| cmd.add_wait_semaphore(stage, semaphore))
            .or_fatal()
    }

    pub fn upload_cmd_buffer(&mut self) -> &mut CommandBuffer {
        self.commands.upload_cmd_buffer().or_fatal()
    }

    pub fn submit_upload(&mut self, signal_semaphores: &[vk::Semaphore]) {
        self.commands
            .submit_upload(&self.graphics_queue, signal_semaphores)
            .or_fatal()
    }

    /// Block until the GPU is idle and recycle everything it finished
    pub fn wait_idle(&mut self) {
        self.device
            .device_wait_idle()
            .map_err(RhiError::from)
            .and_then(|_| self.commands.refresh_fence_status())
            .or_fatal()
    }

    /// Recreate the swapchain for a new window size. Cached framebuffers
    /// reference the old images and are dropped with their render passes.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.try_resize(width, height).or_fatal()
    }

    fn try_resize(&mut self, width: u32, height: u32) -> RhiResult<()> {
        if let Ok(active) = self.commands.active() {
            return Err(RhiError::invalid_state("resize during a frame", active.state()));
        }
        self.wait_idle();
        self.cache.teardown();
        self.swapchain.resize(width, height)?;
        log::info!(
            "Resized to {}x{}",
            self.swapchain.extent().width,
            self.swapchain.extent().height
        );
        Ok(())
    }

    /// Free native command buffers that are neither recording nor in flight
    pub fn trim_command_buffers(&mut self) -> usize {
        let freed = self.commands.free_idle();
        if freed > 0 {
            log::debug!("Freed {} idle command buffers", freed);
        }
        freed
    }

    pub fn back_buffer(&self, index: usize) -> Option<&Texture> {
        self.swapchain.back_buffer(index)
    }

    pub fn swapchain(&self) -> &SwapchainController {
        &self.swapchain
    }

    pub fn render_targets(&self) -> &RenderTargetCache {
        &self.cache
    }

    pub fn commands(&self) -> &CommandBufferManager {
        &self.commands
    }

    pub fn graphics_queue(&self) -> &Queue {
        &self.graphics_queue
    }

    pub fn present_queue(&self) -> &Queue {
        &self.present_queue
    }
}

impl Drop for Rhi {
    fn drop(&mut self) {
        if let Err(e) = self.device.device_wait_idle() {
            log::error!("device_wait_idle failed during shutdown: {:?}", e);
        }
        log::info!("Shutting down RHI");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::command::CmdBufferState;
    use crate::testing::{init_logging, Call, MockDevice};
    use ash::vk::Handle;
    use std::sync::Arc;

    const CLEAR: [f32; 4] = [0.1, 0.2, 0.8, 1.0];

    fn rhi(mock: &Arc<MockDevice>) -> Rhi {
        let settings = RhiSettings {
            swapchain: SwapchainSettings {
                back_buffer_count: 3,
                ..Default::default()
            },
            max_command_buffers: 3,
            fence_timeout_ns: u64::MAX,
        };
        Rhi::new(mock.as_device(), vk::SurfaceKHR::from_raw(0x5), settings, 800, 600).unwrap()
    }

    fn frame(rhi: &mut Rhi, load_op: vk::AttachmentLoadOp) -> vk::CommandBuffer {
        rhi.begin_drawing();
        let targets = rhi.back_buffer_targets(load_op, vk::AttachmentStoreOp::STORE, CLEAR);
        rhi.begin_render_pass(&targets);
        rhi.set_back_buffer_viewport(0.0, 0.0, 0.0, 1.0);
        rhi.draw_primitive(0, 1);
        rhi.end_render_pass();
        let handle = rhi.commands().active().unwrap().handle();
        rhi.end_drawing();
        handle
    }

    #[test]
    fn frames_cycle_ring_and_cache_render_passes() {
        init_logging();
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        assert_eq!(rhi.swapchain().ring_size(), 3);

        let first = frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(rhi.swapchain().semaphore_index(), 0);
        assert_eq!(rhi.render_targets().render_pass_count(), 1);

        // GPU finished frame one: its buffer is reused for a load+store pass
        mock.complete_pending();
        let second = frame(&mut rhi, vk::AttachmentLoadOp::LOAD);
        assert_eq!(second, first);
        assert_eq!(rhi.swapchain().semaphore_index(), 1);
        assert_eq!(rhi.render_targets().render_pass_count(), 2);

        let third = frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        assert_ne!(third, first);
        assert_eq!(rhi.swapchain().semaphore_index(), 2);
        assert_eq!(rhi.render_targets().render_pass_count(), 2);

        let calls = mock.calls();
        let presents = calls.iter().filter(|c| matches!(c, Call::Present { .. })).count();
        let draws: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Draw { vertex_count, .. } => Some(*vertex_count),
                _ => None,
            })
            .collect();
        assert_eq!(presents, 3);
        assert_eq!(draws, vec![3, 3, 3]);
    }

    #[test]
    fn each_submission_waits_on_its_own_acquire_semaphore() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);

        for _ in 0..4 {
            frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
            mock.complete_pending();
        }

        let calls = mock.calls();
        let acquired: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Acquire { semaphore, .. } => Some(*semaphore),
                _ => None,
            })
            .collect();
        let waited: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                Call::Submit { waits, .. } => Some(waits.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(acquired.len(), 4);
        for (semaphore, waits) in acquired.iter().zip(&waited) {
            assert_eq!(waits, &vec![*semaphore]);
        }
        // Fourth frame is back on the first slot
        assert_eq!(acquired[3], acquired[0]);
    }

    #[test]
    fn acquire_slot_is_not_reused_while_its_frame_is_pending() {
        let mock = MockDevice::new();
        let settings = RhiSettings {
            swapchain: SwapchainSettings {
                back_buffer_count: 2,
                ..Default::default()
            },
            max_command_buffers: 4,
            fence_timeout_ns: u64::MAX,
        };
        let mut rhi = Rhi::new(mock.as_device(), vk::SurfaceKHR::from_raw(0x5), settings, 800, 600).unwrap();
        assert_eq!(rhi.swapchain().ring_size(), 2);

        // The GPU never finishes on its own
        for _ in 0..3 {
            frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        }

        let calls = mock.calls();
        let acquires: Vec<_> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                Call::Acquire { semaphore, .. } => Some((i, *semaphore)),
                _ => None,
            })
            .collect();
        let (first_submit, first_fence) = calls
            .iter()
            .enumerate()
            .find_map(|(i, c)| match c {
                Call::Submit { fence, .. } => Some((i, *fence)),
                _ => None,
            })
            .unwrap();
        assert_eq!(acquires.len(), 3);
        assert_eq!(acquires[2].1, acquires[0].1);

        // Frame one, the last waiter on the slot, retired before the slot came back
        let retired = calls
            .iter()
            .enumerate()
            .skip(first_submit)
            .find_map(|(i, c)| matches!(c, Call::ResetFence(f) if *f == first_fence).then_some(i))
            .unwrap();
        assert!(retired < acquires[2].0);
        assert!(rhi.commands().graphics_pool().in_flight() < rhi.swapchain().ring_size());
    }

    #[test]
    fn timed_out_acquire_skips_the_frame() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);

        mock.state.lock().acquire_timeouts = 1;
        assert!(rhi.try_acquire_back_buffer().is_none());
        assert!(rhi.swapchain().acquired_back_buffer().is_none());

        let texture = rhi.try_acquire_back_buffer().unwrap();
        assert_eq!(rhi.swapchain().acquired_back_buffer().map(|t| t.image), Some(texture.image));
        // Already acquired: no second native acquire
        rhi.try_acquire_back_buffer().unwrap();
        let acquires = mock.calls().iter().filter(|c| matches!(c, Call::Acquire { .. })).count();
        assert_eq!(acquires, 1);

        frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(mock.submits().len(), 1);
    }

    #[test]
    fn repeated_frames_reuse_framebuffers() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);

        for _ in 0..6 {
            frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
            mock.complete_pending();
        }
        // One framebuffer per swapchain image
        assert_eq!(rhi.render_targets().framebuffer_count(), 3);
        assert!(rhi.commands().graphics_pool().len() <= 3);
    }

    #[test]
    fn resize_drops_cached_targets_and_rebuilds_swapchain() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        let old = rhi.swapchain().handle();

        mock.state.lock().capabilities.current_extent = vk::Extent2D { width: 1024, height: 768 };
        rhi.resize(1024, 768);

        assert_eq!(rhi.render_targets().render_pass_count(), 0);
        assert_eq!(rhi.render_targets().framebuffer_count(), 0);
        assert_ne!(rhi.swapchain().handle(), old);
        // Frame one's buffer was recycled by the idle wait
        assert!(rhi
            .commands()
            .graphics_pool()
            .buffers()
            .all(|b| b.state() == CmdBufferState::NeedReset));

        frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        let created = mock.calls().into_iter().rev().find_map(|c| match c {
            Call::CreateFramebuffer { width, height, .. } => Some((width, height)),
            _ => None,
        });
        assert_eq!(created, Some((1024, 768)));
    }

    #[test]
    fn upload_submission_is_separate_from_the_frame() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);

        let upload = rhi.upload_cmd_buffer().handle();
        let signal = vk::Semaphore::from_raw(0x77);
        rhi.submit_upload(&[signal]);

        rhi.begin_drawing();
        rhi.add_wait_semaphore(vk::PipelineStageFlags::VERTEX_INPUT, signal);
        rhi.submit_active(&[]);

        let submits = mock.submits();
        assert_eq!(submits.len(), 2);
        match (&submits[0], &submits[1]) {
            (Call::Submit { cmd, signals, .. }, Call::Submit { waits, stages, .. }) => {
                assert_eq!(*cmd, upload);
                assert_eq!(signals, &vec![signal]);
                assert_eq!(waits, &vec![signal]);
                assert_eq!(stages, &vec![vk::PipelineStageFlags::VERTEX_INPUT]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn pipeline_binds_are_deduplicated() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        let pipeline = PipelineState::from_raw(vk::Pipeline::from_raw(0x99));

        rhi.begin_drawing();
        let targets = rhi.back_buffer_targets(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, CLEAR);
        rhi.begin_render_pass(&targets);
        rhi.set_pipeline_state(&pipeline);
        rhi.set_pipeline_state(&pipeline);

        let binds = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::BindPipeline(_)))
            .count();
        assert_eq!(binds, 1);
    }

    #[test]
    fn unsupported_surface_is_rejected_and_released() {
        let mock = MockDevice::new();
        mock.state.lock().present_supported = false;
        let result = Rhi::new(
            mock.as_device(),
            vk::SurfaceKHR::from_raw(0x5),
            RhiSettings::default(),
            800,
            600,
        );
        assert!(matches!(result, Err(RhiError::Negotiation(_))));
        assert!(mock.calls().iter().any(|c| matches!(c, Call::DestroySurface(_))));
    }

    #[test]
    fn drop_releases_every_native_object() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        frame(&mut rhi, vk::AttachmentLoadOp::CLEAR);
        drop(rhi);
        assert_eq!(mock.live_count(), 0);
    }

    #[test]
    #[should_panic(expected = "fatal RHI error")]
    fn begin_render_pass_twice_is_fatal() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        rhi.begin_drawing();
        let targets = rhi.back_buffer_targets(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, CLEAR);
        rhi.begin_render_pass(&targets);
        rhi.begin_render_pass(&targets);
    }

    #[test]
    #[should_panic(expected = "fatal RHI error")]
    fn end_drawing_without_begin_is_fatal() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        rhi.end_drawing();
    }

    #[test]
    #[should_panic(expected = "fatal RHI error")]
    fn end_drawing_inside_render_pass_is_fatal() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        rhi.begin_drawing();
        let targets = rhi.back_buffer_targets(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, CLEAR);
        rhi.begin_render_pass(&targets);
        rhi.end_drawing();
    }

    #[test]
    #[should_panic(expected = "fatal RHI error")]
    fn overflowing_primitive_count_is_fatal() {
        let mock = MockDevice::new();
        let mut rhi = rhi(&mock);
        rhi.begin_drawing();
        let targets = rhi.back_buffer_targets(vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, CLEAR);
        rhi.begin_render_pass(&targets);
        rhi.draw_primitive(0, u32::MAX);
    }
}
