//! # Core Module
//!
//! Shared configuration types consumed by the renderer, the task scheduler
//! and the logging setup.

pub mod config;

pub use config::{
    AccelerationStructureConfig,
    LogConfig,
    RendererConfig,
    SchedulerConfig,
};
pub use crate::config::{Config, ConfigError};
