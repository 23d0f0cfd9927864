//! Interactive ray tracing viewer.
//!
//! # Usage
//!
//! ```bash
//! # Vulkan ray tracing with shaders compiled at startup
//! cargo run --example viewer --features shader-compiler
//!
//! # Precompiled SPIR-V
//! cargo run --example viewer -- --shader-dir target/shaders
//!
//! # Exercise the frame loop without a ray tracing GPU
//! cargo run --example viewer -- --backend dummy --max-frames 120
//! ```
//!
//! WASD moves, dragging with the left mouse button looks around, `M` cycles
//! the shading mode and `P` writes the current frame to `output.ppm`.

use std::path::PathBuf;

use clap::Parser;
use glam::Vec3;
use raytracing_engine::backend::Backend;
use raytracing_engine::capture::DEFAULT_CAPTURE_PATH;
use raytracing_engine::resources::Mesh;
use raytracing_engine::window::{self, InputAction};
use raytracing_engine::{
    BackendType, FrameTimer, Renderer, RendererConfig, RendererError, Scene, SceneObject,
    ShaderLibrary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliBackend {
    /// Hardware ray tracing via Vulkan
    Vulkan,
    /// No-op backend for machines without a ray tracing GPU
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "viewer", about = "Real-time ray traced scene viewer")]
struct Args {
    #[arg(long, value_enum, default_value_t = CliBackend::Vulkan)]
    backend: CliBackend,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 800)]
    height: u32,

    /// Disable vertical sync
    #[arg(long)]
    no_vsync: bool,

    /// Enable the Vulkan validation layer
    #[arg(long)]
    validation: bool,

    /// Directory with raygen.rgen.spv, miss.rmiss.spv and closesthit.rchit.spv
    #[arg(long)]
    shader_dir: Option<PathBuf>,

    /// Exit after this many frames
    #[arg(long)]
    max_frames: Option<u64>,

    /// Show a triangle, a quad and a cube instead of the single triangle
    #[arg(long)]
    showcase: bool,
}

struct Viewer {
    renderer: Renderer<Backend>,
    timer: FrameTimer,
    title: String,
    last_fps: u32,
}

fn build_scene(showcase: bool) -> Scene {
    if !showcase {
        return Scene::triangle();
    }
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(Mesh::triangle()));
    scene.add_object(SceneObject::new(Mesh::quad(4.0)).with_position(Vec3::new(0.0, -1.0, -2.0)));
    scene.add_object(SceneObject::new(Mesh::cube()).with_position(Vec3::new(1.5, 0.0, -1.0)));
    scene
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RendererConfig {
        width: args.width,
        height: args.height,
        backend: args.backend.into(),
        vsync: !args.no_vsync,
        validation: args.validation || cfg!(debug_assertions),
        shader_dir: args.shader_dir.clone(),
        ..Default::default()
    };
    let scene = build_scene(args.showcase);
    let max_frames = args.max_frames;

    let result = window::run(
        &config.title,
        config.width,
        config.height,
        |window| -> Result<Viewer, RendererError> {
            let shaders = ShaderLibrary::load(&config)?;
            let backend = Backend::new(Some(window.window_arc()), &config)?;
            log::info!("Backend: {}", raytracing_engine::RayTracingBackend::name(&backend));
            let renderer = Renderer::new(backend, &config, &scene, &shaders)?;
            Ok(Viewer {
                renderer,
                timer: FrameTimer::new(),
                title: config.title.clone(),
                last_fps: 0,
            })
        },
        move |window, viewer| {
            for action in window.input_mut().take_actions() {
                match action {
                    InputAction::CycleShadingMode => {
                        viewer.renderer.cycle_shading_mode();
                    }
                    InputAction::CaptureFrame => {
                        let capture = viewer.renderer.capture_frame()?;
                        capture.save(DEFAULT_CAPTURE_PATH)?;
                        log::info!(
                            "Saved {}x{} frame to {}",
                            capture.width,
                            capture.height,
                            DEFAULT_CAPTURE_PATH
                        );
                    }
                    InputAction::Exit => window.close(),
                }
            }

            let dt = viewer.timer.tick();
            let intent = window.input().intent();
            viewer.renderer.render_frame(&intent, dt)?;

            if viewer.timer.fps() != viewer.last_fps {
                viewer.last_fps = viewer.timer.fps();
                window.set_title(&format!(
                    "{} - {} fps - {}",
                    viewer.title,
                    viewer.last_fps,
                    viewer.renderer.shading_mode().name()
                ));
            }

            if max_frames.is_some_and(|max| viewer.timer.total_frames() >= max) {
                window.close();
            }
            if window.should_close() {
                viewer.renderer.shutdown()?;
            }
            Ok(())
        },
    );

    if let Err(e) = result {
        log::error!("Viewer failed: {}", e);
        std::process::exit(1);
    }
}
