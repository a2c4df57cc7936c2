//! Rendering data types and the Vulkan backend
//!
//! The types here are what callers hand to the renderer: CPU meshes,
//! materials and per-frame draw commands. Everything that touches the GPU
//! lives under [`vulkan`].

pub mod material;
pub mod mesh;
pub mod render_queue;
pub mod vulkan;

pub use material::{Material, MaterialConstant};
pub use mesh::{Mesh, MeshRef, MeshVertex};
pub use render_queue::{RenderCommand, RenderQueue};
