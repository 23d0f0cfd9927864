//! Common utilities for renderer integration tests.
//!
//! Tests are parameterised over [`TestBackend`]. The Vulkan case needs a
//! ray tracing capable device and shaders, either compiled in through the
//! `shader-compiler` feature or precompiled into the directory named by
//! `RAYTRACING_SHADER_DIR`; without them it is skipped.

#![allow(dead_code)]

use std::path::PathBuf;

use raytracing_engine::backend::{Backend, BackendError, DummyBackend};
use raytracing_engine::{
    BackendType, GpuContext, Renderer, RendererConfig, RendererError, Scene, ShaderLibrary,
    VulkanBackend,
};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 64;

/// Available GPU backends for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestBackend {
    /// Host-memory backend that validates every command
    Dummy,
    /// Headless Vulkan ray tracing
    Vulkan,
}

impl TestBackend {
    pub fn config(self) -> RendererConfig {
        RendererConfig {
            width: WIDTH,
            height: HEIGHT,
            backend: match self {
                TestBackend::Dummy => BackendType::Dummy,
                TestBackend::Vulkan => BackendType::Vulkan,
            },
            validation: true,
            shader_dir: std::env::var_os("RAYTRACING_SHADER_DIR").map(PathBuf::from),
            ..Default::default()
        }
    }

    /// Create the backend, or `None` when this machine cannot run it
    pub fn create(self) -> Option<Backend> {
        match self {
            TestBackend::Dummy => Some(Backend::Dummy(DummyBackend::with_back_buffers(WIDTH, HEIGHT, 2))),
            TestBackend::Vulkan => match VulkanBackend::headless(&self.config()) {
                Ok(backend) => Some(Backend::Vulkan(backend)),
                Err(
                    e @ (BackendError::InitializationFailed(_)
                    | BackendError::NoSuitableAdapter(_)
                    | BackendError::RayTracingUnsupported(_)
                    | BackendError::DeviceCreationFailed(_)),
                ) => {
                    eprintln!("Vulkan ray tracing not available, skipping: {}", e);
                    None
                }
                Err(e) => panic!("Vulkan backend creation failed: {}", e),
            },
        }
    }

    /// A context over a fresh backend
    pub fn context(self) -> Option<GpuContext<Backend>> {
        self.create()
            .map(|backend| GpuContext::new(backend).with_validation(true))
    }

    pub fn shaders(self) -> Option<ShaderLibrary> {
        match ShaderLibrary::load(&self.config()) {
            Ok(shaders) => Some(shaders),
            Err(RendererError::Backend(BackendError::ShaderCompileFailed(e))) => {
                eprintln!("No ray tracing shaders available, skipping: {}", e);
                None
            }
            Err(e) => panic!("Shader loading failed: {}", e),
        }
    }

    /// A renderer over `scene`, or `None` when the backend or shaders are missing
    pub fn renderer(self, scene: &Scene) -> Option<Renderer<Backend>> {
        let shaders = self.shaders()?;
        let backend = self.create()?;
        Some(Renderer::new(backend, &self.config(), scene, &shaders).expect("Failed to create renderer"))
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bytes of a pattern that differs at every offset within 251 bytes
pub fn generate_test_pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
