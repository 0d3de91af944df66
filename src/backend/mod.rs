// Backend module - Vulkan bookkeeping layer
//
// native:        object-safe seam over the Vulkan device
// device:        ash-backed implementation of that seam
// command/sync:  command buffer state machine, fences and semaphores
// render_*:      attachment layouts and the render pass/framebuffer cache
// swapchain:     image ring, acquire and present
// queue:         submission endpoint

pub mod command;
pub mod device;
pub mod native;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod render_target;
pub mod swapchain;
pub mod sync;

pub use command::{CmdBufferState, CommandBuffer, CommandBufferManager};
pub use device::VulkanDevice;
pub use native::{DeviceRef, NativeDevice};
pub use pipeline::PipelineState;
pub use queue::Queue;
pub use render_pass::RenderTargetCache;
pub use render_target::{RenderTargetLayout, RenderTargetView, RenderTargetsInfo, Texture};
pub use swapchain::{SwapchainController, SwapchainSettings};
pub use sync::{FencePool, Semaphore};
