// =============================================================================
// VK-RHI DEMO - Clears the window through the RHI frame contract
// =============================================================================
//
// FRAME FLOW:
// 1. try_acquire_back_buffer (next swapchain image, or skip the frame)
// 2. begin_drawing           (select a command buffer whose fence has signaled)
// 3. begin_render_pass       (cached render pass + framebuffer, clear on load)
// 4. end_render_pass
// 5. end_drawing             (submit against the acquire semaphore, present)
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use vk_rhi::backend::{DeviceRef, VulkanDevice};
use vk_rhi::{Config, Rhi};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting vk-rhi demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, writing to the configured log file when enabled
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    let file_error = match config.debug.open_log_file() {
        Ok(Some(file)) => {
            builder.target(Target::Pipe(Box::new(file)));
            None
        }
        Ok(None) => None,
        Err(e) => Some(e),
    };
    builder.init();

    if let Some(e) = file_error {
        log::warn!("{:#}. Logging to stderr.", e);
    }
}

// =============================================================================
// SURFACE
// =============================================================================

/// Platform-specific window connection
fn create_surface(device: &VulkanDevice, window: &Window) -> Result<vk::SurfaceKHR> {
    use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

    let window_handle = window
        .window_handle()
        .context("Failed to get window handle")?
        .as_raw();
    let display_handle = window
        .display_handle()
        .context("Failed to get display handle")?
        .as_raw();

    let surface = unsafe {
        match (display_handle, window_handle) {
            #[cfg(target_os = "windows")]
            (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
                let hinstance = handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
                let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
                let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                    .hinstance(hinstance)
                    .hwnd(hwnd);
                let loader = ash::extensions::khr::Win32Surface::new(&device.entry, &device.instance);
                loader.create_win32_surface(&create_info, None)?
            }
            #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
            (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
                let dpy = display.display.context("Xlib display handle is null")?;
                let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                    .dpy(dpy.as_ptr().cast())
                    .window(handle.window);
                let loader = ash::extensions::khr::XlibSurface::new(&device.entry, &device.instance);
                loader.create_xlib_surface(&create_info, None)?
            }
            #[cfg(all(unix, not(target_os = "macos"), not(target_os = "android")))]
            (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
                let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                    .display(display.display.as_ptr().cast())
                    .surface(handle.surface.as_ptr().cast());
                let loader = ash::extensions::khr::WaylandSurface::new(&device.entry, &device.instance);
                loader.create_wayland_surface(&create_info, None)?
            }
            _ => anyhow::bail!("Unsupported window handle type"),
        }
    };

    Ok(surface)
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The RHI owns the surface and
/// every device object, so it goes before the device.
struct App {
    config: Config,
    rhi: Option<Rhi>,
    device: Option<Arc<VulkanDevice>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    /// Set when the window size changed or present reported suboptimal
    needs_resize: bool,
    /// Window has zero area; rendering is skipped
    is_minimized: bool,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            rhi: None,
            device: None,
            window: None,
            is_fullscreen,
            needs_resize: false,
            is_minimized: false,
        }
    }

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation)?;
        let surface = create_surface(&device, window)?;

        let size = window.inner_size();
        let native: DeviceRef = device.clone();
        let rhi = Rhi::new(native, surface, self.config.rhi_settings(), size.width, size.height)?;

        self.rhi = Some(rhi);
        self.device = Some(device);
        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) {
        if self.is_minimized {
            return;
        }
        let (Some(rhi), Some(window)) = (self.rhi.as_mut(), self.window.as_ref()) else {
            return;
        };

        if self.needs_resize {
            let size = window.inner_size();
            rhi.resize(size.width, size.height);
            self.needs_resize = false;
        }

        // No image within the acquire timeout: try again next redraw
        if rhi.try_acquire_back_buffer().is_none() {
            return;
        }

        rhi.begin_drawing();
        let targets = rhi.back_buffer_targets(
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            self.config.graphics.clear_color,
        );
        rhi.begin_render_pass(&targets);
        rhi.set_back_buffer_viewport(0.0, 0.0, 0.0, 1.0);
        rhi.end_render_pass();

        if rhi.end_drawing() {
            self.needs_resize = true;
        }
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_resize = true;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref mut rhi) = self.rhi {
                    rhi.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_resize = true;
                }
            }

            WindowEvent::RedrawRequested => self.render_frame(),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            // Release command buffers that are sitting idle
                            KeyCode::KeyT => {
                                if let Some(ref mut rhi) = self.rhi {
                                    rhi.trim_command_buffers();
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Rhi waits for the GPU and releases its objects before the device goes
        self.rhi = None;
        self.device = None;
        log::info!("Cleanup complete");
    }
}
