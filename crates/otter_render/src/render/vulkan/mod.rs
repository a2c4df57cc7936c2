//! Vulkan backend
//!
//! [`render_instance::RenderInstance`] is the entry point: it owns the
//! context, swapchain, pipelines, scene acceleration structure and the
//! frames in flight. Everything else here is a building block it composes.

pub mod acceleration_structure;
pub mod buffer;
pub mod commands;
pub mod context;
pub mod descriptor;
pub mod frame_loop;
pub mod image;
pub mod mesh;
pub mod pipeline;
pub mod render_frame;
pub mod render_instance;
pub mod render_pass;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod window;

pub use context::{PhysicalDeviceInfo, VulkanContext, VulkanError, VulkanResult};
