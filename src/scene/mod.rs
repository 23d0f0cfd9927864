//! Scene description consumed by the renderer

mod camera;
mod camera_controller;
mod constants;

pub use camera::*;
pub use camera_controller::*;
pub use constants::*;

use glam::{Mat4, Vec3};

use crate::acceleration::MeshInstance;
use crate::error::{RendererError, RendererResult};
use crate::resources::Mesh;

/// A mesh placed into the scene
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub mesh: Mesh,
    pub transform: Mat4,
}

impl SceneObject {
    pub fn new(mesh: Mesh) -> Self {
        Self {
            mesh,
            transform: Mat4::IDENTITY,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.transform = Mat4::from_translation(position) * self.transform;
        self
    }
}

/// Ordered meshes plus one camera
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub camera: Camera,
    pub objects: Vec<SceneObject>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// The smallest renderable scene: one triangle in front of the camera
    pub fn triangle() -> Self {
        let mut scene = Self::new();
        scene.add_object(SceneObject::new(Mesh::triangle()));
        scene
    }

    pub fn add_object(&mut self, object: SceneObject) -> usize {
        let id = self.objects.len();
        self.objects.push(object);
        id
    }

    pub fn meshes(&self) -> impl Iterator<Item = &Mesh> {
        self.objects.iter().map(|o| &o.mesh)
    }

    /// One instance per object, in object order
    pub fn instances(&self) -> Vec<MeshInstance> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, object)| MeshInstance {
                transform: object.transform,
                ..MeshInstance::identity(i)
            })
            .collect()
    }

    pub fn triangle_count(&self) -> usize {
        self.meshes().map(Mesh::triangle_count).sum()
    }

    pub fn validate(&self) -> RendererResult<()> {
        if self.objects.is_empty() {
            return Err(RendererError::InvalidScene("scene has no meshes".to_string()));
        }
        for mesh in self.meshes() {
            mesh.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_scene() {
        let scene = Scene::triangle();
        assert_eq!(scene.objects.len(), 1);
        assert_eq!(scene.triangle_count(), 1);
        assert!(scene.validate().is_ok());

        let instances = scene.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].mesh_index, 0);
        assert_eq!(instances[0].transform, Mat4::IDENTITY);
    }

    #[test]
    fn test_empty_scene_rejected() {
        assert!(Scene::new().validate().is_err());
    }

    #[test]
    fn test_instances_carry_transforms() {
        let mut scene = Scene::triangle();
        scene.add_object(SceneObject::new(Mesh::cube()).with_position(Vec3::new(2.0, 0.0, -1.0)));
        let instances = scene.instances();
        assert_eq!(instances[1].mesh_index, 1);
        assert_eq!(instances[1].transform.w_axis.truncate(), Vec3::new(2.0, 0.0, -1.0));
    }
}
