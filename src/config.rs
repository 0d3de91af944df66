// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Provides sensible defaults if the config file is missing or has errors.
// `Config::rhi_settings` turns the graphics section into RHI parameters.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::backend::swapchain::SwapchainSettings;
use crate::rhi::RhiSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vk-rhi".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Requested swapchain image count, clamped to what the surface allows
    pub back_buffer_count: u32,
    /// Upper bound on command buffers in flight per pool
    pub max_command_buffers: usize,
    pub acquire_timeout_ns: u64,
    pub fence_timeout_ns: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            back_buffer_count: 3,
            max_command_buffers: 3,
            acquire_timeout_ns: u64::MAX,
            fence_timeout_ns: u64::MAX,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "vk_rhi.log".to_string(),
        }
    }
}

impl DebugConfig {
    /// Truncate the log file and write its header. `None` when file logging
    /// is disabled.
    pub fn open_log_file(&self) -> Result<Option<File>> {
        if !self.log_to_file {
            return Ok(None);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_file)
            .with_context(|| format!("Failed to open log file {}", self.log_file))?;
        writeln!(file, "=== vk-rhi Log ===")?;
        writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
        writeln!(file)?;
        Ok(Some(file))
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    pub fn rhi_settings(&self) -> RhiSettings {
        RhiSettings {
            swapchain: SwapchainSettings {
                present_mode: self.get_present_mode(),
                back_buffer_count: self.graphics.back_buffer_count,
                acquire_timeout_ns: self.graphics.acquire_timeout_ns,
            },
            max_command_buffers: self.graphics.max_command_buffers,
            fence_timeout_ns: self.graphics.fence_timeout_ns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_use_defaults() {
        let config = Config::parse("[window]\ntitle = \"demo\"\n").unwrap();
        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.back_buffer_count, 3);
        assert_eq!(config.graphics.fence_timeout_ns, u64::MAX);
    }

    #[test]
    fn graphics_section_maps_to_rhi_settings() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "FIFO"
            back_buffer_count = 2
            max_command_buffers = 4
            fence_timeout_ns = 16000000
            "#,
        )
        .unwrap();

        let settings = config.rhi_settings();
        assert_eq!(settings.swapchain.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(settings.swapchain.back_buffer_count, 2);
        assert_eq!(settings.swapchain.acquire_timeout_ns, u64::MAX);
        assert_eq!(settings.max_command_buffers, 4);
        assert_eq!(settings.fence_timeout_ns, 16_000_000);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-ish\"\n").unwrap();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[graphics]\nback_buffer_count = \"three\"\n").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.graphics.present_mode, "mailbox");
    }

    #[test]
    fn log_file_is_opened_only_when_enabled() {
        let path = std::env::temp_dir().join(format!("vk_rhi_log_{}.log", std::process::id()));
        let mut debug = DebugConfig {
            log_file: path.to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(debug.open_log_file().unwrap().is_none());
        assert!(!path.exists());

        debug.log_to_file = true;
        let mut file = debug.open_log_file().unwrap().unwrap();
        writeln!(file, "frame skipped").unwrap();
        drop(file);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("=== vk-rhi Log ==="));
        assert!(contents.ends_with("frame skipped\n"));
        std::fs::remove_file(&path).unwrap();
    }
}
