//! Ray Tracing Engine - real-time hardware ray tracing over two-level
//! acceleration structures
//!
//! The renderer records into a backend-neutral command list that one of two
//! backends executes:
//! - **Vulkan**: `VK_KHR_ray_tracing_pipeline` via ash (native only)
//! - **Dummy**: host-memory backend that validates barriers and fences, used by tests
//!
//! # Frame pipeline
//! - Meshes are uploaded through staging buffers and built into one
//!   bottom-level acceleration structure each, plus one top-level structure
//! - A shader binding table holds the ray generation, miss and hit group records
//! - Every frame the ray output and the current swap surface are moved
//!   through their states with barriers emitted only on change, then the
//!   frame is submitted, presented and waited on through a fence counter

pub mod acceleration;
pub mod backend;
pub mod capture;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shader_table;
pub mod shaders;
pub mod stats;
pub mod sync;
pub mod tracking;
pub mod upload;
#[cfg(not(target_arch = "wasm32"))]
pub mod window;

use std::path::PathBuf;

pub use backend::{Backend, DummyBackend, RayTracingBackend};
#[cfg(not(target_arch = "wasm32"))]
pub use backend::vulkan::VulkanBackend;
pub use capture::FrameCapture;
pub use context::GpuContext;
pub use error::{RendererError, RendererResult};
pub use frame::FrameReport;
pub use renderer::Renderer;
pub use scene::{Camera, CameraIntent, Scene, SceneObject, ShadingMode};
pub use shaders::ShaderLibrary;
pub use stats::FrameTimer;

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Vulkan ray tracing via ash (native only)
    #[default]
    Vulkan,
    /// Host-memory backend that validates but does not trace rays
    Dummy,
}

/// Configuration for creating the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Surface width
    pub width: u32,
    /// Surface height
    pub height: u32,
    /// Which backend to use
    pub backend: BackendType,
    /// Number of pooled presentation surfaces
    pub back_buffer_count: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Enable the validation layer and log its messages
    pub validation: bool,
    /// Color the ray output is cleared to before each dispatch
    pub background_color: [f32; 4],
    /// Shading mode of the first frame
    pub shading_mode: ShadingMode,
    /// Camera movement speed in units per second
    pub camera_speed: f32,
    /// Degrees of camera rotation per pixel of mouse movement
    pub mouse_sensitivity: f32,
    /// Directory with precompiled SPIR-V shaders
    pub shader_dir: Option<PathBuf>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Ray Tracing Engine".to_string(),
            width: 800,
            height: 800,
            backend: BackendType::Vulkan,
            back_buffer_count: 2,
            vsync: true,
            validation: cfg!(debug_assertions),
            background_color: [0.05, 0.05, 0.12, 1.0],
            shading_mode: ShadingMode::default(),
            camera_speed: 10.0,
            mouse_sensitivity: 0.1,
            shader_dir: None,
        }
    }
}
