//! Window management using winit
//!
//! Keyboard and mouse input is folded into a [`CameraIntent`] per tick.
//! WASD moves, dragging with the left button held turns the camera and the
//! wheel zooms. `M` cycles the shading mode, `P` captures a frame and
//! `Escape` closes the window.

use std::sync::Arc;

use winit::{
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::{DeviceEvent, ElementState, Event, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::scene::CameraIntent;

/// Discrete requests raised by key presses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    CycleShadingMode,
    CaptureFrame,
    Exit,
}

/// Accumulates input between ticks
#[derive(Debug, Default)]
pub struct InputState {
    forward: bool,
    back: bool,
    left: bool,
    right: bool,
    mouse_look: bool,
    yaw: f32,
    pitch: f32,
    zoom: f32,
    actions: Vec<InputAction>,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a key transition. Repeats do not raise actions again.
    pub fn handle_key(&mut self, code: KeyCode, pressed: bool, repeat: bool) {
        match code {
            KeyCode::KeyW => self.forward = pressed,
            KeyCode::KeyS => self.back = pressed,
            KeyCode::KeyA => self.left = pressed,
            KeyCode::KeyD => self.right = pressed,
            KeyCode::KeyM if pressed && !repeat => self.actions.push(InputAction::CycleShadingMode),
            KeyCode::KeyP if pressed && !repeat => self.actions.push(InputAction::CaptureFrame),
            KeyCode::Escape if pressed => self.actions.push(InputAction::Exit),
            _ => {}
        }
    }

    pub fn handle_mouse_button(&mut self, button: MouseButton, pressed: bool) {
        if button == MouseButton::Left {
            self.mouse_look = pressed;
        }
    }

    /// Raw mouse movement in pixels; only turns the camera while dragging
    pub fn handle_mouse_motion(&mut self, dx: f64, dy: f64) {
        if self.mouse_look {
            self.yaw += dx as f32;
            // Screen Y grows downward
            self.pitch -= dy as f32;
        }
    }

    pub fn handle_scroll(&mut self, lines: f32) {
        self.zoom += lines;
    }

    pub fn handle_window_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    self.handle_key(code, event.state == ElementState::Pressed, event.repeat);
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                self.handle_mouse_button(*button, *state == ElementState::Pressed);
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let lines = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(position) => (position.y / 40.0) as f32,
                };
                self.handle_scroll(lines);
            }
            // Released keys are never reported once focus is gone
            WindowEvent::Focused(false) => {
                self.forward = false;
                self.back = false;
                self.left = false;
                self.right = false;
                self.mouse_look = false;
            }
            _ => {}
        }
    }

    /// Intent for the current tick
    pub fn intent(&self) -> CameraIntent {
        let axis = |positive: bool, negative: bool| positive as i32 as f32 - negative as i32 as f32;
        CameraIntent {
            move_forward: axis(self.forward, self.back),
            move_right: axis(self.right, self.left),
            yaw: self.yaw,
            pitch: self.pitch,
            zoom: self.zoom,
        }
    }

    /// Clear per-tick deltas, keeping held keys
    pub fn end_tick(&mut self) {
        self.yaw = 0.0;
        self.pitch = 0.0;
        self.zoom = 0.0;
    }

    pub fn take_actions(&mut self) -> Vec<InputAction> {
        std::mem::take(&mut self.actions)
    }
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
    input: InputState,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> Result<Self, OsError> {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(PhysicalSize::new(width, height))
                .with_resizable(false)
                .build(event_loop)?,
        );

        Ok(Self {
            window,
            width,
            height,
            resized: false,
            close_requested: false,
            input: InputState::new(),
        })
    }

    /// Get arc reference to window for backend initialization
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn was_resized(&self) -> bool {
        self.resized
    }

    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Request the event loop to stop after this tick
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.input
    }

    pub fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
        self.input.handle_window_event(event);
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Open a window and run `callback` once per tick until it closes.
///
/// Setup that needs the window (such as backend creation) happens in `init`;
/// its error ends the loop before the first tick.
pub fn run<S, E, I, F>(title: &str, width: u32, height: u32, init: I, mut callback: F) -> Result<(), RunError<E>>
where
    I: FnOnce(&Window) -> Result<S, E>,
    F: FnMut(&mut Window, &mut S) -> Result<(), E>,
{
    let event_loop = EventLoop::new().map_err(RunError::EventLoop)?;
    let mut window = Window::new(&event_loop, title, width, height).map_err(RunError::Window)?;
    let mut state = init(&window).map_err(RunError::App)?;
    let mut failure: Option<E> = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => window.handle_event(&event),
                Event::DeviceEvent {
                    event: DeviceEvent::MouseMotion { delta },
                    ..
                } => window.input_mut().handle_mouse_motion(delta.0, delta.1),
                Event::AboutToWait => {
                    if let Err(e) = callback(&mut window, &mut state) {
                        failure = Some(e);
                        window.close();
                    }
                    window.input_mut().end_tick();
                    window.request_redraw();
                }
                _ => {}
            }

            if window.should_close() {
                elwt.exit();
            }
        })
        .map_err(RunError::EventLoop)?;

    match failure {
        Some(e) => Err(RunError::App(e)),
        None => Ok(()),
    }
}

/// Failure of [`run`]: either winit or the application callback
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error("Event loop failed: {0}")]
    EventLoop(EventLoopError),
    #[error("Window creation failed: {0}")]
    Window(OsError),
    #[error("{0}")]
    App(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wasd_maps_to_axes() {
        let mut input = InputState::new();
        input.handle_key(KeyCode::KeyW, true, false);
        input.handle_key(KeyCode::KeyA, true, false);
        let intent = input.intent();
        assert_eq!(intent.move_forward, 1.0);
        assert_eq!(intent.move_right, -1.0);

        input.handle_key(KeyCode::KeyS, true, false);
        input.handle_key(KeyCode::KeyA, false, false);
        let intent = input.intent();
        assert_eq!(intent.move_forward, 0.0);
        assert_eq!(intent.move_right, 0.0);
    }

    #[test]
    fn test_mouse_turns_only_while_dragging() {
        let mut input = InputState::new();
        input.handle_mouse_motion(10.0, 5.0);
        assert!(input.intent().is_idle());

        input.handle_mouse_button(MouseButton::Left, true);
        input.handle_mouse_motion(10.0, 5.0);
        input.handle_mouse_motion(2.0, 0.0);
        let intent = input.intent();
        assert_eq!(intent.yaw, 12.0);
        assert_eq!(intent.pitch, -5.0);
    }

    #[test]
    fn test_end_tick_keeps_held_keys() {
        let mut input = InputState::new();
        input.handle_key(KeyCode::KeyD, true, false);
        input.handle_scroll(2.0);
        input.end_tick();
        let intent = input.intent();
        assert_eq!(intent.zoom, 0.0);
        assert_eq!(intent.move_right, 1.0);
    }

    #[test]
    fn test_actions_fire_once_per_press() {
        let mut input = InputState::new();
        input.handle_key(KeyCode::KeyM, true, false);
        input.handle_key(KeyCode::KeyM, true, true);
        input.handle_key(KeyCode::KeyM, false, false);
        input.handle_key(KeyCode::KeyP, true, false);
        assert_eq!(
            input.take_actions(),
            vec![InputAction::CycleShadingMode, InputAction::CaptureFrame]
        );
        assert!(input.take_actions().is_empty());
    }
}
