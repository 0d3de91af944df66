// Graphics pipeline state - opaque handle supplied by the pipeline subsystem
//
// Shader loading and fixed-function state are built elsewhere. The RHI only
// binds the result inside a compatible render pass.

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    handle: vk::Pipeline,
}

impl PipelineState {
    /// Wrap a pipeline created against a render pass from the cache
    pub fn from_raw(handle: vk::Pipeline) -> Self {
        Self { handle }
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }
}
