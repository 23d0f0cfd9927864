//! Triangle mesh data

use glam::Vec3;

use crate::error::{RendererError, RendererResult};

/// A triangle mesh: vertex positions plus 32-bit triangle indices
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub positions: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str, positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        Self {
            positions,
            indices,
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Vertex data as tightly packed float triples
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.positions)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Check the mesh can be turned into a bottom-level structure
    pub fn validate(&self) -> RendererResult<()> {
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(RendererError::InvalidScene(format!(
                "mesh '{}' has {} indices, expected a non-zero multiple of 3",
                self.name,
                self.indices.len()
            )));
        }
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= self.positions.len()) {
            return Err(RendererError::InvalidScene(format!(
                "mesh '{}' index {} out of range for {} vertices",
                self.name,
                index,
                self.positions.len()
            )));
        }
        if self.positions.iter().any(|p| !p.is_finite()) {
            return Err(RendererError::InvalidScene(format!(
                "mesh '{}' has non-finite vertex positions",
                self.name
            )));
        }
        Ok(())
    }

    /// The single triangle used as the smallest renderable scene
    pub fn triangle() -> Self {
        Self::new(
            "triangle",
            vec![
                Vec3::new(0.0, 0.5, 0.0),
                Vec3::new(0.5, -0.5, 0.0),
                Vec3::new(-0.5, -0.5, 0.0),
            ],
            vec![0, 1, 2],
        )
    }

    /// Axis-aligned quad in the XY plane
    pub fn quad(half_extent: f32) -> Self {
        let h = half_extent;
        Self::new(
            "quad",
            vec![
                Vec3::new(-h, -h, 0.0),
                Vec3::new(h, -h, 0.0),
                Vec3::new(h, h, 0.0),
                Vec3::new(-h, h, 0.0),
            ],
            vec![0, 1, 2, 0, 2, 3],
        )
    }

    /// Unit cube centered at origin
    pub fn cube() -> Self {
        let positions = vec![
            Vec3::new(-0.5, -0.5, -0.5),
            Vec3::new(0.5, -0.5, -0.5),
            Vec3::new(0.5, 0.5, -0.5),
            Vec3::new(-0.5, 0.5, -0.5),
            Vec3::new(-0.5, -0.5, 0.5),
            Vec3::new(0.5, -0.5, 0.5),
            Vec3::new(0.5, 0.5, 0.5),
            Vec3::new(-0.5, 0.5, 0.5),
        ];
        #[rustfmt::skip]
        let indices = vec![
            4, 5, 6, 4, 6, 7, // front
            1, 0, 3, 1, 3, 2, // back
            0, 4, 7, 0, 7, 3, // left
            5, 1, 2, 5, 2, 6, // right
            7, 6, 2, 7, 2, 3, // top
            0, 1, 5, 0, 5, 4, // bottom
        ];
        Self::new("cube", positions, indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_bytes() {
        let mesh = Mesh::triangle();
        assert_eq!(mesh.vertex_bytes().len(), 3 * 12);
        assert_eq!(mesh.index_bytes().len(), 3 * 4);
        assert_eq!(mesh.triangle_count(), 1);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_cube_is_valid() {
        let mesh = Mesh::cube();
        assert_eq!(mesh.triangle_count(), 12);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mesh = Mesh::new("broken", vec![Vec3::ZERO; 2], vec![0, 1, 2]);
        assert!(matches!(mesh.validate(), Err(RendererError::InvalidScene(_))));
    }

    #[test]
    fn test_partial_triangle_rejected() {
        let mesh = Mesh::new("partial", vec![Vec3::ZERO; 3], vec![0, 1]);
        assert!(mesh.validate().is_err());
    }
}
