// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// Fences live in a pool with disjoint free/used lists and are recycled
// between command buffer cycles.

use ash::vk;

use super::native::DeviceRef;
use crate::error::{RhiError, RhiResult};

/// Binary semaphore, destroyed on drop
pub struct Semaphore {
    handle: vk::Semaphore,
    device: DeviceRef,
}

impl Semaphore {
    pub fn new(device: &DeviceRef) -> RhiResult<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self {
            handle,
            device: device.clone(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    NotReady,
    Signaled,
}

/// Stable index of a fence inside its FencePool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(usize);

struct Fence {
    handle: vk::Fence,
    state: FenceState,
}

/// Arena of fences. Every fence ever created is in exactly one of `free`/`used`.
pub struct FencePool {
    fences: Vec<Fence>,
    free: Vec<FenceId>,
    used: Vec<FenceId>,
    device: DeviceRef,
}

impl FencePool {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            fences: Vec::new(),
            free: Vec::new(),
            used: Vec::new(),
            device,
        }
    }

    /// Take a fence from the free list or create one.
    ///
    /// A recycled fence is natively unsignaled; `create_signaled` only marks
    /// its cached state, matching what a signaled creation would report.
    pub fn allocate(&mut self, create_signaled: bool) -> RhiResult<FenceId> {
        let id = match self.free.pop() {
            Some(id) => {
                if create_signaled {
                    self.fences[id.0].state = FenceState::Signaled;
                }
                id
            }
            None => {
                let handle = self.device.create_fence(create_signaled)?;
                let state = if create_signaled {
                    FenceState::Signaled
                } else {
                    FenceState::NotReady
                };
                self.fences.push(Fence { handle, state });
                log::debug!("Created fence #{} (total {})", self.fences.len() - 1, self.fences.len());
                FenceId(self.fences.len() - 1)
            }
        };
        self.used.push(id);
        Ok(id)
    }

    /// Reset the fence and return it to the free list
    pub fn release(&mut self, id: FenceId) -> RhiResult<()> {
        let pos = self.used_position(id, "release")?;
        self.reset(id)?;
        self.used.swap_remove(pos);
        self.free.push(id);
        Ok(())
    }

    /// Blocking wait. Returns false if the timeout elapsed.
    pub fn wait_for(&mut self, id: FenceId, timeout_ns: u64) -> RhiResult<bool> {
        self.used_position(id, "wait")?;
        let fence = &mut self.fences[id.0];
        if fence.state == FenceState::Signaled {
            return Err(RhiError::FenceMisuse(format!(
                "fence #{} waited on after it was already signaled",
                id.0
            )));
        }

        match self.device.wait_for_fence(fence.handle, timeout_ns) {
            Ok(()) => {
                fence.state = FenceState::Signaled;
                Ok(true)
            }
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait unless already signaled, then release regardless of the outcome
    pub fn wait_and_release(&mut self, id: FenceId, timeout_ns: u64) -> RhiResult<()> {
        if !self.is_signaled(id)? && !self.wait_for(id, timeout_ns)? {
            log::warn!("Fence #{} timed out before release", id.0);
        }
        self.release(id)
    }

    /// Non-blocking poll, cached once signaled
    pub fn is_signaled(&mut self, id: FenceId) -> RhiResult<bool> {
        let fence = self.fence_mut(id)?;
        if fence.state == FenceState::Signaled {
            return Ok(true);
        }
        let handle = fence.handle;
        if self.device.get_fence_status(handle)? {
            self.fences[id.0].state = FenceState::Signaled;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn handle(&self, id: FenceId) -> vk::Fence {
        self.fences[id.0].handle
    }

    pub fn state(&self, id: FenceId) -> FenceState {
        self.fences[id.0].state
    }

    pub fn is_used(&self, id: FenceId) -> bool {
        self.used.contains(&id)
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    pub fn total_count(&self) -> usize {
        self.fences.len()
    }

    fn reset(&mut self, id: FenceId) -> RhiResult<()> {
        let fence = &mut self.fences[id.0];
        if fence.state != FenceState::NotReady {
            self.device.reset_fence(fence.handle)?;
            fence.state = FenceState::NotReady;
        }
        Ok(())
    }

    fn used_position(&self, id: FenceId, what: &str) -> RhiResult<usize> {
        self.used.iter().position(|&u| u == id).ok_or_else(|| {
            RhiError::FenceMisuse(format!("{} on fence #{} which is not in use", what, id.0))
        })
    }

    fn fence_mut(&mut self, id: FenceId) -> RhiResult<&mut Fence> {
        self.fences
            .get_mut(id.0)
            .ok_or_else(|| RhiError::FenceMisuse(format!("unknown fence #{}", id.0)))
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        if !self.used.is_empty() {
            log::warn!("Destroying fence pool with {} fences still in use", self.used.len());
        }
        for fence in &self.fences {
            self.device.destroy_fence(fence.handle);
        }
    }
}
