//! Turns per-tick user intents into camera motion

use super::Camera;

/// Movement requested by the input collaborator for one tick.
///
/// Moves are signed axis values in [-1, 1], rotations are raw mouse deltas
/// and zoom is in scroll lines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CameraIntent {
    pub move_forward: f32,
    pub move_right: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub zoom: f32,
}

impl CameraIntent {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    /// Reset per-tick deltas, keeping held movement keys
    pub fn reset_deltas(&mut self) {
        self.yaw = 0.0;
        self.pitch = 0.0;
        self.zoom = 0.0;
    }
}

/// Applies intents scaled by elapsed time, speed and mouse sensitivity
#[derive(Debug, Clone)]
pub struct CameraController {
    /// Movement speed in units per second
    pub speed: f32,
    /// Degrees of rotation per unit of mouse delta
    pub mouse_sensitivity: f32,
    /// Distance moved per scroll line
    pub zoom_step: f32,
}

impl Default for CameraController {
    fn default() -> Self {
        Self {
            speed: 10.0,
            mouse_sensitivity: 0.1,
            zoom_step: 0.5,
        }
    }
}

impl CameraController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: f32) -> Self {
        self.mouse_sensitivity = sensitivity;
        self
    }

    /// Apply `intent` for a tick of `dt` seconds. Returns whether the camera moved.
    pub fn apply(&self, camera: &mut Camera, intent: &CameraIntent, dt: f32) -> bool {
        if intent.is_idle() {
            return false;
        }

        if intent.yaw != 0.0 || intent.pitch != 0.0 {
            camera.rotate(
                intent.yaw * self.mouse_sensitivity,
                intent.pitch * self.mouse_sensitivity,
            );
        }
        let step = self.speed * dt;
        camera.move_forward(intent.move_forward * step + intent.zoom * self.zoom_step);
        camera.move_right(intent.move_right * step);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_idle_intent_leaves_camera() {
        let mut camera = Camera::default();
        let before = camera.clone();
        assert!(!CameraController::new().apply(&mut camera, &CameraIntent::default(), 0.016));
        assert_eq!(camera, before);
    }

    #[test]
    fn test_move_scaled_by_speed_and_time() {
        let mut camera = Camera::new(Vec3::ZERO);
        let intent = CameraIntent {
            move_forward: 1.0,
            move_right: -1.0,
            ..Default::default()
        };
        CameraController::new().apply(&mut camera, &intent, 0.5);
        assert!(camera.position.abs_diff_eq(Vec3::new(-5.0, 0.0, -5.0), 1e-5));
    }

    #[test]
    fn test_mouse_delta_scaled_by_sensitivity() {
        let mut camera = Camera::default();
        let intent = CameraIntent {
            yaw: 100.0,
            pitch: -50.0,
            ..Default::default()
        };
        CameraController::new().with_sensitivity(0.2).apply(&mut camera, &intent, 0.016);
        assert!((camera.yaw_degrees() - 20.0).abs() < 1e-3);
        assert!((camera.pitch_degrees() + 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_zoom_moves_along_view() {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 2.0));
        let intent = CameraIntent {
            zoom: 2.0,
            ..Default::default()
        };
        CameraController::new().apply(&mut camera, &intent, 0.016);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, 0.0, 1.0), 1e-5));
    }
}
