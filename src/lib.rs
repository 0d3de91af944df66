// vk-rhi - Vulkan render hardware interface
//
// Command buffer lifecycle, fence/semaphore pooling, render pass and
// framebuffer caching, and swapchain acquire/present, driven per frame
// through `Rhi`.

pub mod backend;
pub mod config;
pub mod error;
pub mod rhi;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{OrFatal, RhiError, RhiResult};
pub use rhi::{Rhi, RhiSettings};
