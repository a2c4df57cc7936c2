//! Mesh representation for 3D models
//!
//! `MeshVertex` is the single vertex layout used by the G-buffer pipeline and
//! by acceleration-structure builds (positions are read from offset 0 with a
//! stride of `size_of::<MeshVertex>()`).

use ash::vk;
use bytemuck::{Pod, Zeroable};

/// Interleaved vertex as stored in GPU vertex buffers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Tangent, w holds the bitangent sign
    pub tangent: [f32; 4],
    /// Texture coordinates
    pub uv: [f32; 2],
}

/// CPU-side indexed triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex data
    pub vertices: Vec<MeshVertex>,
    /// Triangle list indices
    pub indices: Vec<u16>,
}

impl Mesh {
    /// Create a mesh from vertex and index data
    pub fn new(vertices: Vec<MeshVertex>, indices: Vec<u16>) -> Self {
        Self { vertices, indices }
    }

    /// Axis-aligned cube centered at the origin with edge length `size`
    ///
    /// Every face has its own four vertices so normals stay flat.
    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];

        let mut mesh = Self::default();
        for (normal, u, v) in faces {
            let center = normal.map(|n| n * h);
            mesh.push_quad(center, normal, u.map(|x| x * h), v.map(|x| x * h));
        }
        mesh
    }

    /// Square in the XZ plane facing +Y with edge length `size`
    pub fn plane(size: f32) -> Self {
        let h = size * 0.5;
        let mut mesh = Self::default();
        mesh.push_quad([0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [h, 0.0, 0.0], [0.0, 0.0, -h]);
        mesh
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    /// Number of indices
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    // Counter-clockwise when seen from the side `normal` points to.
    fn push_quad(&mut self, center: [f32; 3], normal: [f32; 3], u: [f32; 3], v: [f32; 3]) {
        let base = self.vertices.len() as u16;
        let corners = [(-1.0, -1.0, [0.0, 1.0]), (1.0, -1.0, [1.0, 1.0]), (1.0, 1.0, [1.0, 0.0]), (-1.0, 1.0, [0.0, 0.0])];
        let length = (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt();

        for (su, sv, uv) in corners {
            self.vertices.push(MeshVertex {
                position: [
                    center[0] + su * u[0] + sv * v[0],
                    center[1] + su * u[1] + sv * v[1],
                    center[2] + su * u[2] + sv * v[2],
                ],
                normal,
                tangent: [u[0] / length, u[1] / length, u[2] / length, 1.0],
                uv,
            });
        }
        self.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

/// GPU mesh view stored in render commands
///
/// Holds raw handles only. Whoever owns the `GpuMesh` this came from must
/// keep it alive until every frame that queued it has finished on the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRef {
    /// Vertex buffer handle
    pub vertex_buffer: vk::Buffer,
    /// Index buffer handle (u16 indices)
    pub index_buffer: vk::Buffer,
    /// Device address of the vertex buffer
    pub vertex_address: vk::DeviceAddress,
    /// Device address of the index buffer
    pub index_address: vk::DeviceAddress,
    /// Number of vertices
    pub vertex_count: u32,
    /// Number of indices
    pub index_count: u32,
}

impl MeshRef {
    /// Triangle count
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
        [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
    }

    fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
        [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
    }

    fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
        a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
    }

    fn assert_outward_winding(mesh: &Mesh) {
        for triangle in mesh.indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| mesh.vertices[triangle[i] as usize]);
            let face = cross(sub(b.position, a.position), sub(c.position, a.position));
            assert!(dot(face, a.normal) > 0.0, "triangle {triangle:?} winds against its normal");
        }
    }

    #[test]
    fn test_vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<MeshVertex>(), 48);
        assert_eq!(std::mem::offset_of!(MeshVertex, normal), 12);
        assert_eq!(std::mem::offset_of!(MeshVertex, tangent), 24);
        assert_eq!(std::mem::offset_of!(MeshVertex, uv), 40);
    }

    #[test]
    fn test_cube_geometry() {
        let cube = Mesh::cube(2.0);
        assert_eq!(cube.vertex_count(), 24);
        assert_eq!(cube.index_count(), 36);
        for vertex in &cube.vertices {
            for coordinate in vertex.position {
                assert_relative_eq!(coordinate.abs(), 1.0);
            }
        }
        assert_outward_winding(&cube);
    }

    #[test]
    fn test_plane_faces_up() {
        let plane = Mesh::plane(10.0);
        assert_eq!(plane.vertex_count(), 4);
        assert_eq!(plane.index_count(), 6);
        assert!(plane.vertices.iter().all(|v| v.position[1] == 0.0 && v.normal == [0.0, 1.0, 0.0]));
        assert_outward_winding(&plane);
    }

    #[test]
    fn test_tangents_are_unit_length_and_perpendicular() {
        for vertex in Mesh::cube(3.0).vertices {
            let t = [vertex.tangent[0], vertex.tangent[1], vertex.tangent[2]];
            assert_relative_eq!(dot(t, t), 1.0, epsilon = 1e-6);
            assert_relative_eq!(dot(t, vertex.normal), 0.0, epsilon = 1e-6);
        }
    }
}
