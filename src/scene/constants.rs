//! Constant blocks read by the ray tracing shaders.
//!
//! Layouts match the uniform blocks in `shaders/raygen.rgen` and
//! `shaders/closesthit.rchit` byte for byte (std140).

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::Camera;

/// Camera block: position, one float of padding, then the rotation
/// widened to a 4x4 matrix with an identity last row and column.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraConstants {
    pub position: [f32; 3],
    pub _pad: f32,
    pub rotation: Mat4,
}

impl CameraConstants {
    pub fn from_camera(camera: &Camera) -> Self {
        Self {
            position: camera.position.to_array(),
            _pad: 0.0,
            rotation: Mat4::from_mat3(camera.rotation),
        }
    }
}

/// Debug block selecting the shading visualization
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DebugConstants {
    pub shading_mode: u32,
}

impl From<ShadingMode> for DebugConstants {
    fn from(mode: ShadingMode) -> Self {
        Self {
            shading_mode: mode as u32,
        }
    }
}

/// Visualization variants implemented by the closest-hit shader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ShadingMode {
    #[default]
    RandomTriangleColor = 0,
    Spatial = 1,
    PerTriangle = 2,
    BarycentricHeatmap = 3,
    HeightGradient = 4,
    CameraDistance = 5,
    Checker = 6,
}

impl ShadingMode {
    pub const ALL: [ShadingMode; 7] = [
        ShadingMode::RandomTriangleColor,
        ShadingMode::Spatial,
        ShadingMode::PerTriangle,
        ShadingMode::BarycentricHeatmap,
        ShadingMode::HeightGradient,
        ShadingMode::CameraDistance,
        ShadingMode::Checker,
    ];

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// The following mode, wrapping after the last one
    pub fn next(self) -> Self {
        Self::ALL[(self as usize + 1) % Self::ALL.len()]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShadingMode::RandomTriangleColor => "random triangle color",
            ShadingMode::Spatial => "spatial",
            ShadingMode::PerTriangle => "per triangle",
            ShadingMode::BarycentricHeatmap => "barycentric heatmap",
            ShadingMode::HeightGradient => "height gradient",
            ShadingMode::CameraDistance => "camera distance",
            ShadingMode::Checker => "checker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Mat3, Vec3};

    #[test]
    fn test_camera_constants_layout() {
        assert_eq!(std::mem::size_of::<CameraConstants>(), 80);
        assert_eq!(std::mem::offset_of!(CameraConstants, rotation), 16);
        assert_eq!(std::mem::size_of::<DebugConstants>(), 4);
    }

    #[test]
    fn test_rotation_widened_with_identity() {
        let camera = Camera::new(Vec3::new(1.0, 2.0, 3.0)).with_rotation(Mat3::from_rotation_y(0.5));
        let constants = CameraConstants::from_camera(&camera);

        assert_eq!(constants.position, [1.0, 2.0, 3.0]);
        assert_eq!(constants.rotation.w_axis, glam::Vec4::W);
        assert_eq!(constants.rotation.x_axis.w, 0.0);
        assert_eq!(Mat3::from_mat4(constants.rotation), camera.rotation);

        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(&bytes[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0.0f32.to_le_bytes());
    }

    #[test]
    fn test_shading_mode_cycles() {
        let mut mode = ShadingMode::default();
        for _ in 0..ShadingMode::ALL.len() {
            mode = mode.next();
        }
        assert_eq!(mode, ShadingMode::RandomTriangleColor);
        assert_eq!(ShadingMode::Checker.next(), ShadingMode::RandomTriangleColor);
        assert_eq!(ShadingMode::from_index(5), Some(ShadingMode::CameraDistance));
        assert_eq!(ShadingMode::from_index(7), None);
        assert_eq!(DebugConstants::from(ShadingMode::Checker).shading_mode, 6);
    }
}
