//! Material system for rendering
//!
//! A material is a push-constant block plus up to four textures. Materials
//! are shared between draws through `Arc`, and the render queue groups draws
//! by that pointer so each recording task binds one material set.

use crate::render::vulkan::image::Texture;
use bytemuck::{Pod, Zeroable};
use std::sync::Arc;

/// Material factors pushed to the G-buffer fragment shader
///
/// Pushed at offset 64, right after the model matrix.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialConstant {
    /// Linear RGBA multiplier for the base color
    pub base_color_factor: [f32; 4],
    /// Metallic factor (0.0 = dielectric, 1.0 = metallic)
    pub metallic_factor: f32,
    /// Roughness factor (0.0 = mirror, 1.0 = completely rough)
    pub roughness_factor: f32,
    /// Ambient occlusion strength
    pub occlusion_strength: f32,
    /// Non-zero when the base color texture should be sampled
    pub use_base_color_texture: u32,
    /// Non-zero when the normal texture should be sampled
    pub use_normal_texture: u32,
    /// Non-zero when the metallic-roughness texture should be sampled
    pub use_metallic_roughness_texture: u32,
    /// Non-zero when the occlusion texture should be sampled
    pub use_occlusion_texture: u32,
}

impl Default for MaterialConstant {
    fn default() -> Self {
        Self {
            base_color_factor: [1.0, 1.0, 1.0, 1.0],
            metallic_factor: 0.0,
            roughness_factor: 0.5,
            occlusion_strength: 1.0,
            use_base_color_texture: 0,
            use_normal_texture: 0,
            use_metallic_roughness_texture: 0,
            use_occlusion_texture: 0,
        }
    }
}

/// Texture slots in material descriptor set order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSlot {
    /// Binding 0
    BaseColor,
    /// Binding 1
    Normal,
    /// Binding 2
    MetallicRoughness,
    /// Binding 3
    Occlusion,
}

impl TextureSlot {
    /// All slots in binding order
    pub const ALL: [Self; 4] = [Self::BaseColor, Self::Normal, Self::MetallicRoughness, Self::Occlusion];

    /// Descriptor binding index of the slot
    pub const fn binding(self) -> u32 {
        self as u32
    }
}

/// Material properties for 3D rendering
#[derive(Debug, Clone, Default)]
pub struct Material {
    constant: MaterialConstant,
    base_color: Option<Arc<Texture>>,
    normal: Option<Arc<Texture>>,
    metallic_roughness: Option<Arc<Texture>>,
    occlusion: Option<Arc<Texture>>,
}

impl Material {
    /// Create an untextured material
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base color factor
    pub fn with_color(mut self, r: f32, g: f32, b: f32, a: f32) -> Self {
        self.constant.base_color_factor = [r, g, b, a];
        self
    }

    /// Set the metallic factor
    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.constant.metallic_factor = metallic.clamp(0.0, 1.0);
        self
    }

    /// Set the roughness factor
    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.constant.roughness_factor = roughness.clamp(0.0, 1.0);
        self
    }

    /// Set the occlusion strength
    pub fn with_occlusion_strength(mut self, strength: f32) -> Self {
        self.constant.occlusion_strength = strength.clamp(0.0, 1.0);
        self
    }

    /// Attach a texture to a slot and enable sampling it
    pub fn with_texture(mut self, slot: TextureSlot, texture: Arc<Texture>) -> Self {
        match slot {
            TextureSlot::BaseColor => {
                self.base_color = Some(texture);
                self.constant.use_base_color_texture = 1;
            }
            TextureSlot::Normal => {
                self.normal = Some(texture);
                self.constant.use_normal_texture = 1;
            }
            TextureSlot::MetallicRoughness => {
                self.metallic_roughness = Some(texture);
                self.constant.use_metallic_roughness_texture = 1;
            }
            TextureSlot::Occlusion => {
                self.occlusion = Some(texture);
                self.constant.use_occlusion_texture = 1;
            }
        }
        self
    }

    /// Push-constant block
    pub fn constant(&self) -> &MaterialConstant {
        &self.constant
    }

    /// Texture bound to a slot, if any
    pub fn texture(&self, slot: TextureSlot) -> Option<&Arc<Texture>> {
        match slot {
            TextureSlot::BaseColor => self.base_color.as_ref(),
            TextureSlot::Normal => self.normal.as_ref(),
            TextureSlot::MetallicRoughness => self.metallic_roughness.as_ref(),
            TextureSlot::Occlusion => self.occlusion.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_constant_layout() {
        assert_eq!(std::mem::size_of::<MaterialConstant>(), 44);
        assert_eq!(std::mem::offset_of!(MaterialConstant, metallic_factor), 16);
        assert_eq!(std::mem::offset_of!(MaterialConstant, use_base_color_texture), 28);
    }

    #[test]
    fn test_untextured_material_disables_sampling() {
        let material = Material::new().with_color(0.8, 0.1, 0.1, 1.0).with_roughness(2.0);
        let constant = material.constant();
        assert_eq!(constant.base_color_factor, [0.8, 0.1, 0.1, 1.0]);
        assert_eq!(constant.roughness_factor, 1.0);
        assert_eq!(constant.use_base_color_texture, 0);
        assert_eq!(constant.use_occlusion_texture, 0);
        assert!(TextureSlot::ALL.iter().all(|slot| material.texture(*slot).is_none()));
    }

    #[test]
    fn test_texture_slots_follow_binding_order() {
        let bindings: Vec<u32> = TextureSlot::ALL.iter().map(|slot| slot.binding()).collect();
        assert_eq!(bindings, vec![0, 1, 2, 3]);
    }
}
