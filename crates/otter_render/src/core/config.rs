//! # Renderer Configuration
//!
//! Every tunable the renderer reads at startup lives here. All structs
//! deserialize with defaults for missing fields, so a config file only
//! needs to name what it changes.
//!
//! ## Configuration Categories
//!
//! - **Renderer**: application metadata, shader directory, frames in flight,
//!   camera projection, window
//! - **Acceleration structures**: batch byte budget and scratch sizing
//! - **Scheduler**: worker thread count and shutdown timeout
//! - **Log**: default log filter

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::config::{Config, ConfigError};

/// Default byte budget for one acceleration-structure build batch (256 MiB)
pub const DEFAULT_BATCH_SIZE_LIMIT: u64 = 256 * 1024 * 1024;

/// Default scratch buffer size as a multiple of the largest single build
pub const DEFAULT_SCRATCH_MULTIPLIER: u64 = 16;

/// Acceleration-structure build tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelerationStructureConfig {
    /// Maximum summed acceleration-structure bytes per batch
    pub batch_size_limit: u64,
    /// Shared scratch buffer size = multiplier x largest scratch requirement
    pub scratch_multiplier: u64,
}

impl Default for AccelerationStructureConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            scratch_multiplier: DEFAULT_SCRATCH_MULTIPLIER,
        }
    }
}

/// Task scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads
    pub worker_threads: usize,
    /// Seconds to wait for workers to drain at shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 16,
            shutdown_timeout_secs: 15,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter, e.g. `info` or `otter_render=debug`; `RUST_LOG` wins
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// # Renderer Configuration
///
/// Configuration for the deferred Vulkan renderer, including application
/// metadata passed to instance creation and debug features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Application version (major, minor, patch)
    pub application_version: (u32, u32, u32),
    /// Directory holding the compiled SPIR-V binaries
    pub shader_directory: PathBuf,
    /// Frames in flight requested; clamped to the swapchain image count
    pub requested_frames_in_flight: u32,
    /// Whether to enable Vulkan validation layers (None = debug builds only)
    pub enable_validation: Option<bool>,
    /// Window title
    pub window_title: String,
    /// Initial window width
    pub window_width: u32,
    /// Initial window height
    pub window_height: u32,
    /// Vertical field of view in degrees
    pub field_of_view_degrees: f32,
    /// Near clip plane
    pub near_plane: f32,
    /// Far clip plane
    pub far_plane: f32,
    /// Acceleration-structure build tuning
    pub acceleration_structure: AccelerationStructureConfig,
    /// Worker pool used for G-buffer recording
    pub scheduler: SchedulerConfig,
    /// Logging defaults
    pub log: LogConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            application_version: (1, 0, 0),
            shader_directory: PathBuf::from("shaders"),
            requested_frames_in_flight: 3,
            enable_validation: None,
            window_title: "Otter".to_string(),
            window_width: 1280,
            window_height: 720,
            field_of_view_degrees: 90.0,
            near_plane: 0.1,
            far_plane: 1000.0,
            acceleration_structure: AccelerationStructureConfig::default(),
            scheduler: SchedulerConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Set application version
    pub fn with_version(mut self, major: u32, minor: u32, patch: u32) -> Self {
        self.application_version = (major, minor, patch);
        self
    }

    /// Set the SPIR-V directory
    pub fn with_shader_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.shader_directory = directory.into();
        self
    }

    /// Set requested frames in flight
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.requested_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the number of recording worker threads
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.scheduler.worker_threads = threads;
        self
    }

    /// Set window title and size
    pub fn with_window(mut self, title: impl Into<String>, width: u32, height: u32) -> Self {
        self.window_title = title.into();
        self.window_width = width;
        self.window_height = height;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Path of a shader binary inside the shader directory
    pub fn shader_path(&self, file_name: &str) -> PathBuf {
        self.shader_directory.join(file_name)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if !(1..=8).contains(&self.requested_frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "Frames in flight must be between 1 and 8, got {}",
                self.requested_frames_in_flight
            )));
        }

        if self.window_width == 0 || self.window_height == 0 {
            return Err(ConfigError::Invalid("Window size must be non-zero".to_string()));
        }

        if !(self.near_plane > 0.0 && self.far_plane > self.near_plane) {
            return Err(ConfigError::Invalid(format!(
                "Clip planes must satisfy 0 < near < far, got {} / {}",
                self.near_plane, self.far_plane
            )));
        }

        if self.acceleration_structure.batch_size_limit == 0
            || self.acceleration_structure.scratch_multiplier == 0
        {
            return Err(ConfigError::Invalid(
                "Acceleration structure batch limit and scratch multiplier must be non-zero".to_string(),
            ));
        }

        if self.scheduler.worker_threads == 0 {
            return Err(ConfigError::Invalid("At least one worker thread is required".to_string()));
        }

        Ok(())
    }

    /// Check that the shader directory holds every binary the renderer loads
    pub fn validate_shaders(&self) -> Result<(), ConfigError> {
        for name in crate::render::vulkan::shader::REQUIRED_SHADERS {
            let path = self.shader_path(name);
            if !Path::new(&path).exists() {
                return Err(ConfigError::Invalid(format!("Shader not found: {}", path.display())));
            }
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Otter Application")
    }
}

impl Config for RendererConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_renderer_constants() {
        let config = RendererConfig::default();
        assert_eq!(config.requested_frames_in_flight, 3);
        assert_eq!(config.acceleration_structure.batch_size_limit, 256 * 1024 * 1024);
        assert_eq!(config.acceleration_structure.scratch_multiplier, 16);
        assert_eq!(config.scheduler.worker_threads, 16);
        assert_eq!(config.scheduler.shutdown_timeout_secs, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RendererConfig::default().with_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_frames_in_flight(9).validate().is_err());
        assert!(RendererConfig::default().with_worker_threads(0).validate().is_err());
        assert!(RendererConfig::new("").validate().is_err());

        let mut planes = RendererConfig::default();
        planes.near_plane = 10.0;
        planes.far_plane = 1.0;
        assert!(planes.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let config: RendererConfig = toml::from_str(
            r#"
            application_name = "demo"
            requested_frames_in_flight = 2

            [scheduler]
            worker_threads = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.application_name, "demo");
        assert_eq!(config.requested_frames_in_flight, 2);
        assert_eq!(config.scheduler.worker_threads, 4);
        assert_eq!(config.scheduler.shutdown_timeout_secs, 15);
        assert_eq!(config.acceleration_structure, AccelerationStructureConfig::default());
    }

    #[test]
    fn test_save_and_load_ron() {
        let path = std::env::temp_dir().join(format!("otter_render_config_{}.ron", std::process::id()));
        let config = RendererConfig::new("ron test").with_worker_threads(3);
        config.save_to_file(&path).unwrap();
        let loaded = RendererConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = RendererConfig::load_from_file("renderer.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_) | ConfigError::UnsupportedFormat(_)));
        let err = RendererConfig::default().save_to_file("renderer.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_shader_path_joins_directory() {
        let config = RendererConfig::default().with_shader_directory("build/spv");
        assert_eq!(config.shader_path("rt.rgen.spv"), PathBuf::from("build/spv/rt.rgen.spv"));
    }
}
