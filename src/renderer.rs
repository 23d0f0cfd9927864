//! Main renderer orchestrator

use crate::acceleration::{build_scene, SceneAccelerationStructures};
use crate::backend::*;
use crate::capture::FrameCapture;
use crate::context::GpuContext;
use crate::dispatch::{DispatchBindings, DispatchDriver};
use crate::error::{RendererError, RendererResult};
use crate::frame::{FrameReport, FrameStateMachine};
use crate::pipeline::{shader_table_entries, RayTracingPipeline};
use crate::resources::GpuTexture;
use crate::scene::{Camera, CameraConstants, CameraController, CameraIntent, DebugConstants, Scene, ShadingMode};
use crate::shader_table::{align_up, ShaderBindingTable};
use crate::shaders::ShaderLibrary;
use crate::tracking::BarrierBatch;
use crate::upload::{upload_mesh, ConstantBuffer, GpuMesh, Uploader, READBACK_ROW_PITCH_ALIGNMENT};
use crate::RendererConfig;

/// Everything created for a scene, released together at shutdown
struct SceneResources {
    meshes: Vec<GpuMesh>,
    structures: SceneAccelerationStructures,
    ray_output: GpuTexture,
    pipeline: RayTracingPipeline,
    shader_table: ShaderBindingTable,
    camera_constants: ConstantBuffer<CameraConstants>,
    debug_constants: ConstantBuffer<DebugConstants>,
}

impl SceneResources {
    fn release<B: RayTracingBackend>(self, ctx: &mut GpuContext<B>) {
        self.shader_table.release(ctx);
        self.pipeline.release(ctx);
        self.structures.release(ctx);
        for mesh in self.meshes {
            mesh.release(ctx);
        }
        self.camera_constants.release(ctx);
        self.debug_constants.release(ctx);
        ctx.release_texture(self.ray_output);
    }
}

/// Hardware ray tracing renderer over one scene
pub struct Renderer<B: RayTracingBackend> {
    ctx: GpuContext<B>,
    resources: Option<SceneResources>,
    frames: FrameStateMachine,
    dispatch: DispatchDriver,
    camera: Camera,
    controller: CameraController,
    camera_dirty: bool,
    shading_mode: ShadingMode,
    written_shading_mode: ShadingMode,
}

impl<B: RayTracingBackend> Renderer<B> {
    /// Upload the scene, build its acceleration structures, create the
    /// pipeline and shader table, and wait for all of it to finish on the GPU.
    pub fn new(backend: B, config: &RendererConfig, scene: &Scene, shaders: &ShaderLibrary) -> RendererResult<Self> {
        let mut ctx = GpuContext::new(backend).with_validation(config.validation);
        scene.validate()?;

        let (width, height) = ctx.backend().surface_size();
        if (width, height) != (config.width, config.height) {
            log::warn!(
                "Surface is {}x{}, configured {}x{}",
                width,
                height,
                config.width,
                config.height
            );
        }

        let mut uploader = Uploader::new();
        let mut list = CommandList::new("scene setup");

        let meshes = scene
            .meshes()
            .map(|mesh| upload_mesh(&mut ctx, &mut list, &mut uploader, mesh))
            .collect::<RendererResult<Vec<_>>>()?;
        let structures = build_scene(&mut ctx, &mut list, &mut uploader, &meshes, &scene.instances())?;

        let ray_output = ctx.create_texture(&TextureDescriptor {
            label: Some("ray output".to_string()),
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::STORAGE | TextureUsage::COPY_SRC,
            initial_state: ResourceState::CopySource,
        })?;

        let pipeline = RayTracingPipeline::new(&mut ctx, shaders, structures.top_level.handle, ray_output.handle())?;
        let shader_table = ShaderBindingTable::build(
            &mut ctx,
            &mut list,
            &mut uploader,
            pipeline.pipeline,
            &shader_table_entries(),
            pipeline.descriptor_heap,
        )?;

        ctx.submit_and_wait(&mut list)?;
        log::info!(
            "Scene ready: {} meshes, {} triangles, {} uploads ({} bytes)",
            meshes.len(),
            scene.triangle_count(),
            uploader.upload_count(),
            uploader.uploaded_bytes()
        );

        let camera_constants = ConstantBuffer::new(&mut ctx, "camera constants", &CameraConstants::from_camera(&scene.camera))?;
        let debug_constants = ConstantBuffer::new(&mut ctx, "debug constants", &DebugConstants::from(config.shading_mode))?;
        let frames = FrameStateMachine::new(&mut ctx)?;

        Ok(Self {
            ctx,
            resources: Some(SceneResources {
                meshes,
                structures,
                ray_output,
                pipeline,
                shader_table,
                camera_constants,
                debug_constants,
            }),
            frames,
            dispatch: DispatchDriver::new(width, height, config.background_color),
            camera: scene.camera.clone(),
            controller: CameraController::new()
                .with_speed(config.camera_speed)
                .with_sensitivity(config.mouse_sensitivity),
            camera_dirty: false,
            shading_mode: config.shading_mode,
            written_shading_mode: config.shading_mode,
        })
    }

    fn resources_mut(resources: &mut Option<SceneResources>) -> RendererResult<&mut SceneResources> {
        resources
            .as_mut()
            .ok_or_else(|| RendererError::FrameState("renderer has been shut down".to_string()))
    }

    /// Apply the camera intent and render one frame to the surface
    pub fn render_frame(&mut self, intent: &CameraIntent, dt: f32) -> RendererResult<FrameReport> {
        if self.controller.apply(&mut self.camera, intent, dt) {
            self.camera_dirty = true;
        }
        let resources = Self::resources_mut(&mut self.resources)?;

        // The previous frame has completed, so the constant buffers are idle.
        if self.camera_dirty {
            resources
                .camera_constants
                .write(&mut self.ctx, &CameraConstants::from_camera(&self.camera))?;
            self.camera_dirty = false;
        }
        if self.shading_mode != self.written_shading_mode {
            resources
                .debug_constants
                .write(&mut self.ctx, &DebugConstants::from(self.shading_mode))?;
            self.written_shading_mode = self.shading_mode;
            log::info!("Shading mode: {}", self.shading_mode.name());
        }

        self.frames.begin(&mut self.ctx, &mut resources.ray_output)?;
        self.dispatch.record(
            self.frames.list_mut(),
            &DispatchBindings {
                pipeline: &resources.pipeline,
                shader_table: &resources.shader_table,
                camera_constants: resources.camera_constants.handle(),
                debug_constants: Some(resources.debug_constants.handle()),
                ray_output: resources.ray_output.handle(),
            },
        );
        self.frames.end(&mut self.ctx, &mut resources.ray_output)
    }

    /// Copy the ray output into a readback buffer and return its pixels
    pub fn capture_frame(&mut self) -> RendererResult<FrameCapture> {
        if self.frames.is_recording() {
            return Err(RendererError::FrameState("cannot capture while a frame is recording".to_string()));
        }
        let resources = Self::resources_mut(&mut self.resources)?;
        let output = &mut resources.ray_output;
        let (width, height, format) = (output.width(), output.height(), output.format());
        let row_pitch = align_up(
            (width * format.bytes_per_pixel()) as u64,
            READBACK_ROW_PITCH_ALIGNMENT as u64,
        );
        let last_row = (height as u64).checked_sub(1).filter(|_| width > 0).ok_or_else(|| {
            RendererError::Capture(format!("ray output is {}x{}", width, height))
        })?;
        let size = row_pitch * last_row + (width * format.bytes_per_pixel()) as u64;

        let readback = self.ctx.create_buffer(&BufferDescriptor {
            label: Some("frame capture".to_string()),
            size,
            usage: BufferUsage::COPY_DST,
            location: MemoryLocation::Readback,
            ..Default::default()
        })?;

        let restore = output.state();
        let mut list = CommandList::new("frame capture");
        let mut batch = BarrierBatch::new();
        batch.transition(output, ResourceState::CopySource);
        batch.flush(&mut list);
        list.copy_texture_to_buffer(output.handle(), readback.handle(), row_pitch as u32);
        let mut batch = BarrierBatch::new();
        batch.transition(output, restore);
        batch.flush(&mut list);

        let result = match self.ctx.submit_and_wait(&mut list) {
            Ok(_) => self
                .ctx
                .backend()
                .read_buffer(readback.handle(), 0, size)
                .map_err(RendererError::from),
            Err(e) => Err(e),
        };
        self.ctx.release_buffer(readback);
        FrameCapture::from_padded_rows(width, height, row_pitch as u32, format, &result?)
    }

    /// Wait for the GPU and release every scene resource. Safe to call twice.
    pub fn shutdown(&mut self) -> RendererResult<()> {
        let Some(resources) = self.resources.take() else {
            return Ok(());
        };
        self.ctx.drain()?;
        resources.release(&mut self.ctx);
        log::info!(
            "Renderer shut down after {} frames; {} buffers still registered",
            self.frames.frame_index(),
            self.ctx.registry().live_buffers()
        );
        Ok(())
    }

    pub fn set_shading_mode(&mut self, mode: ShadingMode) {
        self.shading_mode = mode;
    }

    pub fn cycle_shading_mode(&mut self) -> ShadingMode {
        self.shading_mode = self.shading_mode.next();
        self.shading_mode
    }

    pub fn shading_mode(&self) -> ShadingMode {
        self.shading_mode
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Mutable camera access. Changes are uploaded with the next frame.
    pub fn camera_mut(&mut self) -> &mut Camera {
        self.camera_dirty = true;
        &mut self.camera
    }

    pub fn controller_mut(&mut self) -> &mut CameraController {
        &mut self.controller
    }

    pub fn context(&self) -> &GpuContext<B> {
        &self.ctx
    }

    pub fn frames(&self) -> &FrameStateMachine {
        &self.frames
    }

    pub fn dispatch(&self) -> &DispatchDriver {
        &self.dispatch
    }

    pub fn acceleration_structures(&self) -> Option<&SceneAccelerationStructures> {
        self.resources.as_ref().map(|r| &r.structures)
    }

    pub fn shader_table(&self) -> Option<&ShaderBindingTable> {
        self.resources.as_ref().map(|r| &r.shader_table)
    }

    pub fn ray_output(&self) -> Option<&GpuTexture> {
        self.resources.as_ref().map(|r| &r.ray_output)
    }
}

impl<B: RayTracingBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Renderer shutdown failed: {}", e);
        }
    }
}
