// RHI errors - typed failures for the bookkeeping layer
//
// Low-level operations return RhiResult. The frame contract in rhi.rs
// treats every error as fatal through OrFatal.

use ash::vk;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RhiError {
    /// Any native result code that is not NOT_READY or TIMEOUT
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Illegal state machine transition
    #[error("{what} is not allowed in state {state}")]
    InvalidState { what: &'static str, state: String },

    #[error("Fence misuse: {0}")]
    FenceMisuse(String),

    #[error("Invalid render targets: {0}")]
    RenderTarget(String),

    /// Zero formats, no present support, no suitable GPU or queue family
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("No swapchain image has been acquired")]
    SwapchainNotAcquired,
}

impl RhiError {
    pub(crate) fn invalid_state(what: &'static str, state: impl std::fmt::Debug) -> Self {
        RhiError::InvalidState {
            what,
            state: format!("{:?}", state),
        }
    }
}

pub type RhiResult<T> = std::result::Result<T, RhiError>;

/// Fail-fast conversion for ordering bugs and native errors.
///
/// Logs the caller location and message, then panics. Release builds abort
/// on panic, so a fatal error terminates the process.
pub trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for RhiResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                let caller = std::panic::Location::caller();
                log::error!("Fatal RHI error at {}:{}: {}", caller.file(), caller.line(), e);
                panic!("fatal RHI error: {}", e);
            }
        }
    }
}
