// Command buffers - state machine, pool and manager
//
// Lifecycle of one buffer:
//   ReadyForBegin -> IsInsideBegin <-> IsInsideRenderPass
//   IsInsideBegin -> HasEnded -> Submitted -> NeedReset -> IsInsideBegin
//
// A Submitted buffer owns a fence from the FencePool. Only after that fence
// signals does refresh_fence_status release it and allow the buffer back
// into selection.

use ash::vk;

use super::native::DeviceRef;
use super::pipeline::PipelineState;
use super::queue::Queue;
use super::render_pass::{Framebuffer, RenderPass};
use super::sync::{FenceId, FencePool};
use crate::error::{RhiError, RhiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdBufferState {
    ReadyForBegin,
    IsInsideBegin,
    IsInsideRenderPass,
    HasEnded,
    Submitted,
    NeedReset,
    NotAllocated,
}

pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    state: CmdBufferState,
    upload_only: bool,
    wait_semaphores: Vec<(vk::Semaphore, vk::PipelineStageFlags)>,
    fence: Option<FenceId>,
    submit_serial: u64,

    // Dynamic state shadow, cleared whenever the recording is discarded
    viewport: Option<vk::Viewport>,
    scissor: Option<vk::Rect2D>,
    bound_pipeline: Option<vk::Pipeline>,

    device: DeviceRef,
}

impl CommandBuffer {
    fn new(device: &DeviceRef, pool: vk::CommandPool, upload_only: bool) -> RhiResult<Self> {
        let handle = device.allocate_command_buffer(pool)?;
        Ok(Self {
            handle,
            state: CmdBufferState::ReadyForBegin,
            upload_only,
            wait_semaphores: Vec::new(),
            fence: None,
            submit_serial: 0,
            viewport: None,
            scissor: None,
            bound_pipeline: None,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> CmdBufferState {
        self.state
    }

    pub fn is_upload_only(&self) -> bool {
        self.upload_only
    }

    pub fn is_outside_render_pass(&self) -> bool {
        self.state == CmdBufferState::IsInsideBegin
    }

    pub fn has_ended(&self) -> bool {
        self.state == CmdBufferState::HasEnded
    }

    pub fn fence(&self) -> Option<FenceId> {
        self.fence
    }

    pub fn wait_semaphores(&self) -> &[(vk::Semaphore, vk::PipelineStageFlags)] {
        &self.wait_semaphores
    }

    pub fn begin(&mut self) -> RhiResult<()> {
        match self.state {
            CmdBufferState::ReadyForBegin => {}
            CmdBufferState::NeedReset => self.device.reset_command_buffer(self.handle)?,
            state => return Err(RhiError::invalid_state("begin", state)),
        }

        self.device.begin_command_buffer(self.handle)?;
        self.state = CmdBufferState::IsInsideBegin;
        self.clear_dynamic_state();
        Ok(())
    }

    pub fn end(&mut self) -> RhiResult<()> {
        if !self.is_outside_render_pass() {
            return Err(RhiError::invalid_state("end", self.state));
        }
        self.device.end_command_buffer(self.handle)?;
        self.state = CmdBufferState::HasEnded;
        Ok(())
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: &Framebuffer,
        clear_values: &[vk::ClearValue],
    ) -> RhiResult<()> {
        if !self.is_outside_render_pass() {
            return Err(RhiError::invalid_state("begin_render_pass", self.state));
        }

        let num_clear_values = render_pass.layout().num_used_clear_values() as usize;
        if clear_values.len() < num_clear_values {
            return Err(RhiError::RenderTarget(format!(
                "{} clear values supplied, render pass uses {}",
                clear_values.len(),
                num_clear_values
            )));
        }

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer.handle())
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: framebuffer.extent(),
            })
            .clear_values(&clear_values[..num_clear_values]);

        self.device.cmd_begin_render_pass(self.handle, &begin_info);
        self.state = CmdBufferState::IsInsideRenderPass;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> RhiResult<()> {
        if self.state != CmdBufferState::IsInsideRenderPass {
            return Err(RhiError::invalid_state("end_render_pass", self.state));
        }
        self.device.cmd_end_render_pass(self.handle);
        self.state = CmdBufferState::IsInsideBegin;
        Ok(())
    }

    /// Bind unless the same pipeline is already bound. Returns true if a bind was recorded.
    pub fn bind_pipeline(&mut self, pipeline: &PipelineState) -> RhiResult<bool> {
        self.require_recording("bind_pipeline")?;
        if self.bound_pipeline == Some(pipeline.handle()) {
            return Ok(false);
        }
        self.device.cmd_bind_pipeline(self.handle, pipeline.handle());
        self.bound_pipeline = Some(pipeline.handle());
        Ok(true)
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> RhiResult<()> {
        if self.state != CmdBufferState::IsInsideRenderPass {
            return Err(RhiError::invalid_state("draw", self.state));
        }
        self.device.cmd_draw(self.handle, vertex_count, first_vertex);
        Ok(())
    }

    /// Record a viewport unless it equals the cached one. A collapsed depth
    /// range (min_z == max_z) becomes [min_z, min_z + 1]. Also sets the
    /// matching scissor.
    pub fn set_viewport(
        &mut self,
        min_x: f32,
        min_y: f32,
        min_z: f32,
        max_x: f32,
        max_y: f32,
        max_z: f32,
    ) -> RhiResult<()> {
        self.require_recording("set_viewport")?;

        let viewport = vk::Viewport {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
            min_depth: min_z,
            max_depth: if min_z == max_z { min_z + 1.0 } else { max_z },
        };

        let unchanged = self
            .viewport
            .as_ref()
            .is_some_and(|current| same_viewport(current, &viewport));
        if !unchanged {
            self.device.cmd_set_viewport(self.handle, &viewport);
            self.viewport = Some(viewport);
        }

        self.set_scissor(
            min_x as i32,
            min_y as i32,
            (max_x - min_x) as u32,
            (max_y - min_y) as u32,
        )
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: u32, height: u32) -> RhiResult<()> {
        self.require_recording("set_scissor")?;

        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        };
        let unchanged = self
            .scissor
            .as_ref()
            .is_some_and(|current| same_rect(current, &scissor));
        if !unchanged {
            self.device.cmd_set_scissor(self.handle, &scissor);
            self.scissor = Some(scissor);
        }
        Ok(())
    }

    pub fn add_wait_semaphore(&mut self, stage: vk::PipelineStageFlags, semaphore: vk::Semaphore) {
        self.wait_semaphores.push((semaphore, stage));
    }

    /// Called by Queue after the native submit succeeded
    pub(crate) fn mark_submitted(&mut self, fence: FenceId, serial: u64) {
        self.wait_semaphores.clear();
        self.fence = Some(fence);
        self.submit_serial = serial;
        self.state = CmdBufferState::Submitted;
    }

    /// Poll the fence of a submitted buffer and recycle it once the GPU is done
    pub fn refresh_fence_status(&mut self, fences: &mut FencePool) -> RhiResult<()> {
        if self.state != CmdBufferState::Submitted {
            return Ok(());
        }
        let Some(fence) = self.fence else {
            return Err(RhiError::invalid_state("refresh_fence_status without fence", self.state));
        };

        if fences.is_signaled(fence)? {
            fences.release(fence)?;
            self.fence = None;
            self.clear_dynamic_state();
            self.state = CmdBufferState::NeedReset;
        }
        Ok(())
    }

    fn clear_dynamic_state(&mut self) {
        self.viewport = None;
        self.scissor = None;
        self.bound_pipeline = None;
    }

    fn require_recording(&self, what: &'static str) -> RhiResult<()> {
        match self.state {
            CmdBufferState::IsInsideBegin | CmdBufferState::IsInsideRenderPass => Ok(()),
            state => Err(RhiError::invalid_state(what, state)),
        }
    }

    fn free(&mut self, pool: vk::CommandPool) {
        self.device.free_command_buffer(pool, self.handle);
        self.handle = vk::CommandBuffer::null();
        self.state = CmdBufferState::NotAllocated;
    }

    fn reallocate(&mut self, pool: vk::CommandPool) -> RhiResult<()> {
        self.handle = self.device.allocate_command_buffer(pool)?;
        self.state = CmdBufferState::ReadyForBegin;
        Ok(())
    }
}

fn same_viewport(a: &vk::Viewport, b: &vk::Viewport) -> bool {
    a.x == b.x
        && a.y == b.y
        && a.width == b.width
        && a.height == b.height
        && a.min_depth == b.min_depth
        && a.max_depth == b.max_depth
}

fn same_rect(a: &vk::Rect2D, b: &vk::Rect2D) -> bool {
    a.offset.x == b.offset.x
        && a.offset.y == b.offset.y
        && a.extent.width == b.extent.width
        && a.extent.height == b.extent.height
}

/// Index of a buffer inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdBufferId(usize);

/// Buffers sharing one native command pool. Graphics and upload buffers
/// live in separate pools.
pub struct CommandBufferPool {
    handle: vk::CommandPool,
    buffers: Vec<CommandBuffer>,
    upload_only: bool,
    max_buffers: usize,
    device: DeviceRef,
}

impl CommandBufferPool {
    pub fn new(device: DeviceRef, family_index: u32, upload_only: bool, max_buffers: usize) -> RhiResult<Self> {
        let handle = device.create_command_pool(family_index)?;
        Ok(Self {
            handle,
            buffers: Vec::new(),
            upload_only,
            max_buffers: max_buffers.max(1),
            device,
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, id: CmdBufferId) -> &CommandBuffer {
        &self.buffers[id.0]
    }

    pub fn get_mut(&mut self, id: CmdBufferId) -> &mut CommandBuffer {
        &mut self.buffers[id.0]
    }

    pub fn buffers(&self) -> impl Iterator<Item = &CommandBuffer> {
        self.buffers.iter()
    }

    pub fn refresh_fence_status(&mut self, fences: &mut FencePool) -> RhiResult<()> {
        for buffer in &mut self.buffers {
            buffer.refresh_fence_status(fences)?;
        }
        Ok(())
    }

    /// Buffers whose submission has not been observed complete
    pub fn in_flight(&self) -> usize {
        self.buffers
            .iter()
            .filter(|b| b.state == CmdBufferState::Submitted)
            .count()
    }

    /// Block until fewer than `limit` buffers are in flight, waiting on the
    /// oldest submission first (up to `timeout_ns` per wait).
    pub fn throttle(&mut self, fences: &mut FencePool, limit: usize, timeout_ns: u64) -> RhiResult<()> {
        self.refresh_fence_status(fences)?;

        while self.in_flight() >= limit.max(1) {
            let oldest = self
                .buffers
                .iter()
                .enumerate()
                .filter(|(_, b)| b.state == CmdBufferState::Submitted)
                .min_by_key(|(_, b)| b.submit_serial)
                .map(|(i, _)| i)
                .ok_or_else(|| RhiError::invalid_state("throttle without submissions", CmdBufferState::NotAllocated))?;
            let fence = self.buffers[oldest]
                .fence
                .ok_or_else(|| RhiError::invalid_state("throttle without fence", self.buffers[oldest].state))?;

            if !fences.wait_for(fence, timeout_ns)? {
                return Err(RhiError::Vulkan(vk::Result::TIMEOUT));
            }
            self.buffers[oldest].refresh_fence_status(fences)?;
        }
        Ok(())
    }

    /// Pick the first reusable buffer, or grow the pool.
    ///
    /// Once `max_buffers` buffers are in flight, the oldest submission is
    /// waited on (up to `timeout_ns`) instead of growing.
    pub fn prepare(&mut self, fences: &mut FencePool, timeout_ns: u64) -> RhiResult<CmdBufferId> {
        self.throttle(fences, self.max_buffers, timeout_ns)?;

        if let Some(id) = self.find_reusable()? {
            return Ok(id);
        }

        // Every buffer is Submitted and fewer than max_buffers are in flight
        let buffer = CommandBuffer::new(&self.device, self.handle, self.upload_only)?;
        self.buffers.push(buffer);
        log::debug!(
            "Allocated {} command buffer #{}",
            if self.upload_only { "upload" } else { "graphics" },
            self.buffers.len() - 1
        );
        Ok(CmdBufferId(self.buffers.len() - 1))
    }

    fn find_reusable(&mut self) -> RhiResult<Option<CmdBufferId>> {
        let reusable = self.buffers.iter().position(|b| {
            matches!(
                b.state,
                CmdBufferState::ReadyForBegin | CmdBufferState::NeedReset | CmdBufferState::NotAllocated
            )
        });

        match reusable {
            Some(index) => {
                if self.buffers[index].state == CmdBufferState::NotAllocated {
                    self.buffers[index].reallocate(self.handle)?;
                }
                Ok(Some(CmdBufferId(index)))
            }
            None => {
                if let Some(stuck) = self.buffers.iter().find(|b| b.state != CmdBufferState::Submitted) {
                    return Err(RhiError::invalid_state("prepare with a buffer still recording", stuck.state));
                }
                Ok(None)
            }
        }
    }

    /// Release native buffers that are idle, keeping their slots for reuse
    pub fn free_idle(&mut self) -> usize {
        let mut freed = 0;
        for buffer in &mut self.buffers {
            if matches!(buffer.state, CmdBufferState::ReadyForBegin | CmdBufferState::NeedReset) {
                buffer.free(self.handle);
                freed += 1;
            }
        }
        freed
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        // Destroying the pool frees every buffer allocated from it
        self.device.destroy_command_pool(self.handle);
    }
}

/// Selects and submits the active graphics buffer and the upload buffer
pub struct CommandBufferManager {
    graphics: CommandBufferPool,
    upload: CommandBufferPool,
    fences: FencePool,
    active: Option<CmdBufferId>,
    upload_active: Option<CmdBufferId>,
    fence_timeout_ns: u64,
}

impl CommandBufferManager {
    pub fn new(
        device: DeviceRef,
        family_index: u32,
        max_buffers: usize,
        fence_timeout_ns: u64,
    ) -> RhiResult<Self> {
        Ok(Self {
            graphics: CommandBufferPool::new(device.clone(), family_index, false, max_buffers)?,
            upload: CommandBufferPool::new(device.clone(), family_index, true, max_buffers)?,
            fences: FencePool::new(device),
            active: None,
            upload_active: None,
            fence_timeout_ns,
        })
    }

    /// Select a graphics buffer for the new frame and begin recording
    pub fn prepare_for_new_active(&mut self) -> RhiResult<&mut CommandBuffer> {
        if let Some(id) = self.active {
            return Err(RhiError::invalid_state(
                "prepare_for_new_active while a buffer is active",
                self.graphics.get(id).state(),
            ));
        }

        let id = self.graphics.prepare(&mut self.fences, self.fence_timeout_ns)?;
        self.graphics.get_mut(id).begin()?;
        self.active = Some(id);
        Ok(self.graphics.get_mut(id))
    }

    pub fn active(&self) -> RhiResult<&CommandBuffer> {
        let id = self.active.ok_or_else(|| RhiError::invalid_state("no active command buffer", CmdBufferState::NotAllocated))?;
        Ok(self.graphics.get(id))
    }

    pub fn active_mut(&mut self) -> RhiResult<&mut CommandBuffer> {
        let id = self.active.ok_or_else(|| RhiError::invalid_state("no active command buffer", CmdBufferState::NotAllocated))?;
        Ok(self.graphics.get_mut(id))
    }

    /// Active buffer together with the fence pool, for the present path
    pub fn active_with_fences(&mut self) -> RhiResult<(&mut CommandBuffer, &mut FencePool)> {
        let id = self.active.ok_or_else(|| RhiError::invalid_state("no active command buffer", CmdBufferState::NotAllocated))?;
        Ok((self.graphics.get_mut(id), &mut self.fences))
    }

    /// Forget the active buffer after it was handed to the GPU
    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// End the active buffer if still recording, then submit it
    pub fn submit_active(&mut self, queue: &Queue, signal_semaphores: &[vk::Semaphore]) -> RhiResult<()> {
        let (buffer, fences) = self.active_with_fences()?;
        if buffer.is_outside_render_pass() {
            buffer.end()?;
        }
        queue.submit(buffer, fences, signal_semaphores)?;
        self.active = None;
        Ok(())
    }

    /// The current upload buffer, beginning a new one if none is open
    pub fn upload_cmd_buffer(&mut self) -> RhiResult<&mut CommandBuffer> {
        let id = match self.upload_active {
            Some(id) => id,
            None => {
                let id = self.upload.prepare(&mut self.fences, self.fence_timeout_ns)?;
                self.upload.get_mut(id).begin()?;
                self.upload_active = Some(id);
                id
            }
        };
        Ok(self.upload.get_mut(id))
    }

    pub fn submit_upload(&mut self, queue: &Queue, signal_semaphores: &[vk::Semaphore]) -> RhiResult<()> {
        let id = self
            .upload_active
            .ok_or_else(|| RhiError::invalid_state("submit_upload with no upload buffer", CmdBufferState::NotAllocated))?;
        let buffer = self.upload.get_mut(id);
        if buffer.is_outside_render_pass() {
            buffer.end()?;
        }
        queue.submit(buffer, &mut self.fences, signal_semaphores)?;
        self.upload_active = None;
        Ok(())
    }

    /// Wait until fewer than `limit` graphics submissions are in flight
    pub fn throttle_graphics(&mut self, limit: usize) -> RhiResult<()> {
        self.graphics.throttle(&mut self.fences, limit, self.fence_timeout_ns)
    }

    pub fn refresh_fence_status(&mut self) -> RhiResult<()> {
        self.graphics.refresh_fence_status(&mut self.fences)?;
        self.upload.refresh_fence_status(&mut self.fences)
    }

    /// Free native buffers that are not in use by the GPU
    pub fn free_idle(&mut self) -> usize {
        let mut freed = 0;
        if self.active.is_none() {
            freed += self.graphics.free_idle();
        }
        if self.upload_active.is_none() {
            freed += self.upload.free_idle();
        }
        freed
    }

    pub fn graphics_pool(&self) -> &CommandBufferPool {
        &self.graphics
    }

    pub fn upload_pool(&self) -> &CommandBufferPool {
        &self.upload
    }

    pub fn fences(&self) -> &FencePool {
        &self.fences
    }
}
