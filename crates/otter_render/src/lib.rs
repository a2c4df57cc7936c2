//! # Otter Render
//!
//! A deferred Vulkan renderer with ray-traced shadows.
//!
//! ## Features
//!
//! - **Deferred shading**: G-buffer pass followed by a full-screen PBR lighting pass
//! - **Ray-traced shadows**: acceleration structures built once for static scenes
//! - **Parallel recording**: G-buffer secondaries recorded on a worker pool, one task per material
//! - **Frames in flight**: per-frame resources paced by fences and chained semaphores
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use otter_render::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RendererConfig::load_or_default("renderer.toml")?;
//!     otter_render::foundation::logging::init_with_config(&config.log);
//!
//!     let mut window = Window::new(&config.window_title, config.window_width, config.window_height)?;
//!     let mut renderer = RenderInstance::new(&config, &mut window)?;
//!
//!     while window.should_continue() {
//!         renderer.draw()?;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scheduler;

/// Common imports for applications driving the renderer
pub mod prelude {
    pub use crate::{
        config::Config,
        core::config::RendererConfig,
        foundation::math::{Mat4, Transform, Vec3},
        render::{
            material::{Material, MaterialConstant},
            mesh::{Mesh, MeshVertex},
            vulkan::{
                mesh::GpuMesh,
                render_instance::RenderInstance,
                window::Window,
                VulkanError, VulkanResult,
            },
        },
        scheduler::TaskScheduler,
    };
}
