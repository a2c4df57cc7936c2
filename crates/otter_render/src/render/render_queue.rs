//! # Render Queue
//!
//! Collects the draw commands queued for one frame. Before recording, the
//! queue is sorted by material so that each contiguous run of equal
//! materials can be handed to one recording task.

use crate::foundation::math::Mat4;
use crate::render::{Material, MeshRef};
use std::ops::Range;
use std::sync::Arc;

/// One mesh draw with its material and world transform
#[derive(Debug, Clone)]
pub struct RenderCommand {
    /// Mesh to draw
    pub mesh: MeshRef,
    /// Material, compared by pointer identity
    pub material: Arc<Material>,
    /// Object to world transform
    pub transform: Mat4,
}

impl RenderCommand {
    /// Create a render command
    pub fn new(mesh: MeshRef, material: Arc<Material>, transform: Mat4) -> Self {
        Self {
            mesh,
            material,
            transform,
        }
    }

    fn material_key(&self) -> usize {
        Arc::as_ptr(&self.material) as usize
    }
}

/// Per-frame list of render commands
#[derive(Debug, Default)]
pub struct RenderQueue {
    commands: Vec<RenderCommand>,
}

impl RenderQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command
    pub fn push(&mut self, command: RenderCommand) {
        self.commands.push(command);
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop every queued command
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Queued commands in their current order
    pub fn commands(&self) -> &[RenderCommand] {
        &self.commands
    }

    /// Stable sort by material identity
    pub fn sort_by_material(&mut self) {
        self.commands.sort_by_key(RenderCommand::material_key);
    }

    /// Contiguous runs of commands sharing a material
    ///
    /// Only groups equal materials together after [`sort_by_material`](Self::sort_by_material).
    pub fn partition_by_material(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        for i in 1..=self.commands.len() {
            let run_ends = i == self.commands.len()
                || self.commands[i].material_key() != self.commands[start].material_key();
            if run_ends {
                ranges.push(start..i);
                start = i;
            }
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn mesh(index_count: u32) -> MeshRef {
        MeshRef {
            vertex_buffer: vk::Buffer::null(),
            index_buffer: vk::Buffer::null(),
            vertex_address: 0,
            index_address: 0,
            vertex_count: index_count,
            index_count,
        }
    }

    #[test]
    fn test_empty_queue_has_no_partitions() {
        let mut queue = RenderQueue::new();
        queue.sort_by_material();
        assert!(queue.is_empty());
        assert!(queue.partition_by_material().is_empty());
    }

    #[test]
    fn test_partitions_cover_queue_with_one_material_each() {
        let materials: Vec<Arc<Material>> = (0..3).map(|_| Arc::new(Material::new())).collect();
        let mut queue = RenderQueue::new();
        for (i, pick) in [2, 0, 1, 0, 2, 2, 1].into_iter().enumerate() {
            queue.push(RenderCommand::new(mesh(i as u32 * 3), materials[pick].clone(), Mat4::identity()));
        }

        queue.sort_by_material();
        let partitions = queue.partition_by_material();

        assert_eq!(partitions.len(), 3);
        let mut covered = 0;
        for range in &partitions {
            assert_eq!(range.start, covered);
            covered = range.end;
            let first = &queue.commands()[range.start].material;
            assert!(queue.commands()[range.clone()].iter().all(|c| Arc::ptr_eq(&c.material, first)));
        }
        assert_eq!(covered, queue.len());

        let sizes: Vec<usize> = partitions.iter().map(|r| r.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 7);
        assert!(sizes.contains(&3) && sizes.contains(&2));
    }

    #[test]
    fn test_sort_is_stable_within_a_material() {
        let material = Arc::new(Material::new());
        let other = Arc::new(Material::new());
        let mut queue = RenderQueue::new();
        for i in 0..4 {
            queue.push(RenderCommand::new(mesh(i * 3), material.clone(), Mat4::identity()));
            queue.push(RenderCommand::new(mesh(100), other.clone(), Mat4::identity()));
        }

        queue.sort_by_material();
        let order: Vec<u32> = queue
            .commands()
            .iter()
            .filter(|c| Arc::ptr_eq(&c.material, &material))
            .map(|c| c.mesh.index_count)
            .collect();
        assert_eq!(order, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_equal_but_distinct_materials_are_separate_partitions() {
        let mut queue = RenderQueue::new();
        queue.push(RenderCommand::new(mesh(3), Arc::new(Material::new()), Mat4::identity()));
        queue.push(RenderCommand::new(mesh(3), Arc::new(Material::new()), Mat4::identity()));
        queue.sort_by_material();
        assert_eq!(queue.partition_by_material().len(), 2);

        queue.clear();
        assert!(queue.is_empty());
    }
}
