//! Camera pose
//!
//! The camera stores a world position and a 3x3 camera-to-world rotation.
//! Camera space looks down -Z with +Y up, so the rotation's columns are the
//! right, up and backward directions in world space.

use glam::{Mat3, Vec3};

/// Pitch is kept inside this range so the view never flips over the pole
pub const MAX_PITCH_DEGREES: f32 = 89.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub rotation: Mat3,
    /// Accumulated rotation around world Y, in radians
    yaw: f32,
    /// Accumulated rotation above the horizon, in radians
    pitch: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 0.0, 2.0))
    }
}

impl Camera {
    /// A camera at `position` looking down -Z
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            rotation: Mat3::IDENTITY,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    pub fn with_rotation(mut self, rotation: Mat3) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn right(&self) -> Vec3 {
        self.rotation.x_axis
    }

    pub fn up(&self) -> Vec3 {
        self.rotation.y_axis
    }

    /// View direction in world space
    pub fn forward(&self) -> Vec3 {
        -self.rotation.z_axis
    }

    pub fn yaw_degrees(&self) -> f32 {
        self.yaw.to_degrees()
    }

    pub fn pitch_degrees(&self) -> f32 {
        self.pitch.to_degrees()
    }

    /// Turn around the camera's own Y axis
    pub fn pan(&mut self, degrees: f32) {
        self.rotation *= Mat3::from_rotation_y(degrees.to_radians());
    }

    /// Turn around the camera's own X axis
    pub fn tilt(&mut self, degrees: f32) {
        self.rotation *= Mat3::from_rotation_x(degrees.to_radians());
    }

    /// Turn around the camera's own Z axis
    pub fn roll(&mut self, degrees: f32) {
        self.rotation *= Mat3::from_rotation_z(degrees.to_radians());
    }

    /// Add to the accumulated yaw and pitch and rebuild the rotation from them.
    ///
    /// Local pan, tilt and roll applied since the last call are discarded.
    pub fn rotate(&mut self, delta_yaw_degrees: f32, delta_pitch_degrees: f32) {
        let max_pitch = MAX_PITCH_DEGREES.to_radians();
        self.yaw += delta_yaw_degrees.to_radians();
        self.pitch = (self.pitch + delta_pitch_degrees.to_radians()).clamp(-max_pitch, max_pitch);

        let forward = Vec3::new(
            self.pitch.cos() * self.yaw.sin(),
            self.pitch.sin(),
            -self.pitch.cos() * self.yaw.cos(),
        )
        .normalize();
        let right = forward.cross(Vec3::Y).normalize();
        let up = right.cross(forward);
        self.rotation = Mat3::from_cols(right, up, -forward);
    }

    /// Move along the view direction
    pub fn move_forward(&mut self, distance: f32) {
        self.position += self.forward() * distance;
    }

    pub fn move_right(&mut self, distance: f32) {
        self.position += self.right() * distance;
    }

    /// Orbit around `target` about the world Y axis, keeping the same relative view
    pub fn pan_around_target(&mut self, degrees: f32, target: Vec3) {
        let orbit = Mat3::from_rotation_y(degrees.to_radians());
        self.position = target + orbit * (self.position - target);
        self.rotation = orbit * self.rotation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Vec3, b: Vec3) {
        assert!(a.abs_diff_eq(b, 1e-5), "{:?} != {:?}", a, b);
    }

    #[test]
    fn test_default_looks_down_negative_z() {
        let camera = Camera::default();
        assert_close(camera.forward(), Vec3::NEG_Z);
        assert_close(camera.right(), Vec3::X);
        assert_close(camera.up(), Vec3::Y);
    }

    #[test]
    fn test_rotate_zero_is_identity() {
        let mut camera = Camera::default();
        camera.rotate(0.0, 0.0);
        assert!(camera.rotation.abs_diff_eq(Mat3::IDENTITY, 1e-6));
    }

    #[test]
    fn test_rotate_yaw_turns_right() {
        let mut camera = Camera::default();
        camera.rotate(90.0, 0.0);
        assert_close(camera.forward(), Vec3::X);
        assert_close(camera.right(), Vec3::Z);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.rotate(0.0, 120.0);
        assert!((camera.pitch_degrees() - MAX_PITCH_DEGREES).abs() < 1e-3);
        camera.rotate(0.0, -500.0);
        assert!((camera.pitch_degrees() + MAX_PITCH_DEGREES).abs() < 1e-3);
    }

    #[test]
    fn test_rotation_stays_orthonormal() {
        let mut camera = Camera::default();
        camera.rotate(33.0, -17.0);
        camera.pan(12.0);
        camera.roll(5.0);
        let r = camera.rotation;
        assert!((r * r.transpose()).abs_diff_eq(Mat3::IDENTITY, 1e-5));
        assert!((r.determinant() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_move_along_columns() {
        let mut camera = Camera::new(Vec3::ZERO);
        camera.move_forward(2.0);
        camera.move_right(1.0);
        assert_close(camera.position, Vec3::new(1.0, 0.0, -2.0));
    }

    #[test]
    fn test_pan_around_target_keeps_target_in_view() {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 2.0));
        camera.pan_around_target(90.0, Vec3::ZERO);
        assert_close(camera.position, Vec3::new(2.0, 0.0, 0.0));
        assert_close(camera.forward(), Vec3::NEG_X);
    }
}
