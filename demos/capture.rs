//! Render a few frames without a window and save the last one.
//!
//! ```bash
//! cargo run --example capture --features shader-compiler -- --frames 3
//! cargo run --example capture -- --backend dummy --output dummy.png
//! ```

use std::path::PathBuf;

use clap::Parser;
use raytracing_engine::backend::{Backend, TextureFormat};
use raytracing_engine::capture::DEFAULT_CAPTURE_PATH;
use raytracing_engine::{
    BackendType, CameraIntent, Renderer, RendererConfig, RendererResult, Scene, ShaderLibrary,
    ShadingMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliBackend {
    Vulkan,
    Dummy,
}

#[derive(Parser, Debug)]
#[command(name = "capture", about = "Headless ray traced frame capture")]
struct Args {
    #[arg(long, value_enum, default_value_t = CliBackend::Vulkan)]
    backend: CliBackend,

    #[arg(long, default_value_t = 800)]
    width: u32,

    #[arg(long, default_value_t = 800)]
    height: u32,

    /// Frames rendered before the capture
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Shading mode index (0-6)
    #[arg(long, default_value_t = 0)]
    mode: u32,

    /// Output file; the extension selects the format
    #[arg(long, default_value = DEFAULT_CAPTURE_PATH)]
    output: PathBuf,

    #[arg(long)]
    shader_dir: Option<PathBuf>,
}

fn capture(args: &Args) -> RendererResult<()> {
    let config = RendererConfig {
        width: args.width,
        height: args.height,
        backend: match args.backend {
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        },
        shading_mode: ShadingMode::from_index(args.mode).unwrap_or_default(),
        shader_dir: args.shader_dir.clone(),
        ..Default::default()
    };

    let shaders = ShaderLibrary::load(&config)?;
    let backend = Backend::new(None, &config)?;
    let mut renderer = Renderer::new(backend, &config, &Scene::triangle(), &shaders)?;

    for _ in 0..args.frames.max(1) {
        let report = renderer.render_frame(&CameraIntent::default(), 0.0)?;
        log::debug!("{:?}", report);
    }

    let frame = renderer.capture_frame()?;
    let background = TextureFormat::Rgba8Unorm.encode(config.background_color);
    log::info!(
        "Captured {}x{}: {} pixels hit geometry",
        frame.width,
        frame.height,
        frame.count_pixels_not(background)
    );
    frame.save(&args.output)?;
    log::info!("Wrote {}", args.output.display());

    renderer.shutdown()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = capture(&args) {
        log::error!("Capture failed: {}", e);
        std::process::exit(1);
    }
}
