//! Math utilities and types
//!
//! Provides the transform and projection math the renderer consumes from
//! its callers, plus the GPU-facing uniform layouts built from them.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

pub use nalgebra::{Matrix4, Rotation3, Vector2, Vector3, Vector4};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// Position, rotation (Euler XYZ, radians) and scale
///
/// The matrix applies scale first, then rotation about X, Y and Z, then
/// translation. Swapping that order changes the result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// Position in world space
    pub position: Vec3,
    /// Euler angles in radians, applied X then Y then Z
    pub rotation: Vec3,
    /// Per-axis scale
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    /// Identity transform
    pub fn identity() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Vec3::zeros(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }

    /// Transform at a position with no rotation or scale
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::identity()
        }
    }

    /// Set rotation in radians
    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set scale
    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Rotation part as a 4x4 matrix
    pub fn rotation_matrix(&self) -> Mat4 {
        Rotation3::from_euler_angles(self.rotation.x, self.rotation.y, self.rotation.z).to_homogeneous()
    }

    /// Compose scale -> rotate -> translate
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation_matrix()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }

    /// Matrix in row-major order, `m[row][col]`
    pub fn to_row_major(&self) -> [[f32; 4]; 4] {
        row_major(&self.to_matrix())
    }
}

/// Convert a matrix to row-major nested arrays
pub fn row_major(matrix: &Mat4) -> [[f32; 4]; 4] {
    let mut rows = [[0.0; 4]; 4];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = matrix[(r, c)];
        }
    }
    rows
}

/// Convert a matrix to column-major nested arrays (GLSL `mat4` layout)
pub fn column_major(matrix: &Mat4) -> [[f32; 4]; 4] {
    let mut cols = [[0.0; 4]; 4];
    for (c, col) in cols.iter_mut().enumerate() {
        for (r, value) in col.iter_mut().enumerate() {
            *value = matrix[(r, c)];
        }
    }
    cols
}

/// Vulkan perspective projection
///
/// Right-handed view space looking down -Z, clip-space Y pointing down and
/// depth mapped to [0, 1] with `near` at 0.
pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let tan_half_fovy = (fov_y * 0.5).tan();

    let mut result = Mat4::zeros();
    result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
    result[(1, 1)] = -1.0 / tan_half_fovy;
    result[(2, 2)] = -far / (far - near);
    result[(2, 3)] = -(near * far) / (far - near);
    result[(3, 2)] = -1.0;
    result
}

/// View matrix for a camera placed by `camera`
///
/// Camera scale is ignored.
pub fn view_matrix(camera: &Transform) -> Mat4 {
    let inverse_rotation = camera.rotation_matrix().transpose();
    inverse_rotation * Mat4::new_translation(&-camera.position)
}

/// View and projection matrices as uploaded to the G-buffer pass
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ViewProjection {
    /// World to view
    pub view: [[f32; 4]; 4],
    /// View to clip
    pub projection: [[f32; 4]; 4],
}

impl ViewProjection {
    /// Build from a camera transform and projection parameters
    pub fn new(camera: &Transform, fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            view: column_major(&view_matrix(camera)),
            projection: column_major(&perspective(fov_y_degrees.to_radians(), aspect, near, far)),
        }
    }
}

/// Per-frame lighting uniform
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightingData {
    /// Camera position in world space (w unused)
    pub camera_position_world_space: [f32; 4],
}

impl LightingData {
    /// Lighting data for a camera
    pub fn from_camera(camera: &Transform) -> Self {
        let p = camera.position;
        Self {
            camera_position_world_space: [p.x, p.y, p.z, 1.0],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    fn apply(matrix: &Mat4, point: Vec3) -> Vec3 {
        let p = matrix * Vec4::new(point.x, point.y, point.z, 1.0);
        Vec3::new(p.x / p.w, p.y / p.w, p.z / p.w)
    }

    #[test]
    fn test_identity_transform_is_identity_matrix() {
        assert_relative_eq!(Transform::identity().to_matrix(), Mat4::identity());
    }

    #[test]
    fn test_scale_then_rotate_then_translate() {
        let transform = Transform::from_position(Vec3::new(0.0, 0.0, 5.0))
            .with_rotation(Vec3::new(0.0, 0.0, FRAC_PI_2))
            .with_scale(Vec3::new(2.0, 1.0, 1.0));

        let moved = apply(&transform.to_matrix(), Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(moved, Vec3::new(0.0, 2.0, 5.0), epsilon = 1e-5);

        // Rotating before scaling would stretch Y instead of X
        let wrong_order = Mat4::new_translation(&transform.position)
            * Mat4::new_nonuniform_scaling(&transform.scale)
            * transform.rotation_matrix();
        let wrong = apply(&wrong_order, Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(wrong, Vec3::new(0.0, 1.0, 5.0), epsilon = 1e-5);
    }

    #[test]
    fn test_euler_order_is_x_then_y_then_z() {
        let transform = Transform::identity().with_rotation(Vec3::new(FRAC_PI_2, FRAC_PI_2, 0.0));
        // X rotation takes +Y to +Z, Y rotation then takes +Z to +X
        let rotated = apply(&transform.to_matrix(), Vec3::new(0.0, 1.0, 0.0));
        assert_relative_eq!(rotated, Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn test_row_major_puts_translation_in_last_column() {
        let rows = Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).to_row_major();
        assert_eq!(rows[0][3], 1.0);
        assert_eq!(rows[1][3], 2.0);
        assert_eq!(rows[2][3], 3.0);
        assert_eq!(rows[3], [0.0, 0.0, 0.0, 1.0]);

        let cols = column_major(&Transform::from_position(Vec3::new(1.0, 2.0, 3.0)).to_matrix());
        assert_eq!(cols[3], [1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn test_perspective_maps_near_and_far_to_unit_depth() {
        let projection = perspective(FRAC_PI_2, 16.0 / 9.0, 0.1, 1000.0);
        assert_relative_eq!(apply(&projection, Vec3::new(0.0, 0.0, -0.1)).z, 0.0, epsilon = 1e-5);
        assert_relative_eq!(apply(&projection, Vec3::new(0.0, 0.0, -1000.0)).z, 1.0, epsilon = 1e-4);
        // Vulkan clip space has Y pointing down
        assert!(apply(&projection, Vec3::new(0.0, 1.0, -2.0)).y < 0.0);
    }

    #[test]
    fn test_view_matrix_moves_camera_to_origin() {
        let camera = Transform::from_position(Vec3::new(3.0, -2.0, 10.0))
            .with_rotation(Vec3::new(0.3, -0.7, 0.2));
        let view = view_matrix(&camera);
        assert_relative_eq!(apply(&view, camera.position), Vec3::zeros(), epsilon = 1e-5);
        assert_relative_eq!(view * camera.to_matrix(), Mat4::identity(), epsilon = 1e-5);
    }

    #[test]
    fn test_lighting_data_carries_camera_position() {
        let data = LightingData::from_camera(&Transform::from_position(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(data.camera_position_world_space, [1.0, 2.0, 3.0, 1.0]);
    }
}
