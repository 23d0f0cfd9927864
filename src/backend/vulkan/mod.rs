//! Vulkan backend implementation using ash
//!
//! Ray tracing goes through `VK_KHR_acceleration_structure` and
//! `VK_KHR_ray_tracing_pipeline`. The fence counter is a timeline semaphore
//! and every recorded [`CommandList`] is translated into one primary command
//! buffer at submit time.
//!
//! Without a window the backend runs headless: the presentation surfaces are
//! ordinary images and presenting only advances the pool index.

mod commands;
mod conversion;
mod debug;
mod device;
mod ray_tracing;
mod swapchain;

use std::collections::HashMap;
use std::sync::Arc;

use ash::khr::surface;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::commands::CommandList;
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::RendererConfig;

use conversion::*;
use debug::DebugMessenger;
use ray_tracing::{VkAccelerationStructure, VkDescriptorHeap, VkPipeline, VkRootSignature};
use swapchain::Swapchain;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
    address: vk::DeviceAddress,
}

struct VkTexture {
    image: vk::Image,
    /// Storage view, present for textures with storage usage
    view: Option<vk::ImageView>,
    /// `None` for swapchain images, which the swapchain owns
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
    /// Layout after the last recorded transition
    layout: vk::ImageLayout,
    /// False until the first transition; swapchain images start undefined
    initialized: bool,
}

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<DebugMessenger>,
    surface: Option<(surface::Instance, vk::SurfaceKHR)>,
    _window: Option<Arc<winit::window::Window>>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    allocator: Option<Arc<Mutex<Allocator>>>,
    acceleration_fn: ash::khr::acceleration_structure::Device,
    ray_tracing_fn: ash::khr::ray_tracing_pipeline::Device,
    push_descriptor_fn: ash::khr::push_descriptor::Device,
    capabilities: DeviceCapabilities,

    // Presentation
    swapchain: Option<Swapchain>,
    back_buffers: Vec<TextureHandle>,
    back_buffer_index: u32,
    /// The acquire semaphore is signaled and no submit has waited on it yet
    image_acquired: bool,
    /// The current image's render-finished semaphore has been signaled
    present_ready: bool,
    extent: vk::Extent2D,

    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    descriptor_pool: vk::DescriptorPool,

    // Fence counter
    timeline: vk::Semaphore,
    signaled: u64,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    accels: HashMap<u64, VkAccelerationStructure>,
    root_signatures: HashMap<u64, VkRootSignature>,
    pipelines: HashMap<u64, VkPipeline>,
    heaps: HashMap<u64, VkDescriptorHeap>,
    next_id: u64,
}

impl VulkanBackend {
    /// Create the backend. With a window the presentation surfaces are a
    /// swapchain, without one they are `config.back_buffer_count` offscreen images.
    pub fn new(
        window: Option<Arc<winit::window::Window>>,
        config: &RendererConfig,
    ) -> BackendResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let handles = match &window {
            Some(window) => {
                let display = window
                    .display_handle()
                    .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                    .as_raw();
                let window_handle = window
                    .window_handle()
                    .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                    .as_raw();
                Some((display, window_handle))
            }
            None => None,
        };

        let (instance, validation) =
            device::create_instance(&entry, handles.map(|(display, _)| display), config.validation)?;
        let debug = if validation {
            match DebugMessenger::new(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    log::warn!("{}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface = match handles {
            Some((display, window_handle)) => {
                let loader = surface::Instance::new(&entry, &instance);
                let surface = unsafe {
                    ash_window::create_surface(&entry, &instance, display, window_handle, None)
                }
                .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;
                Some((loader, surface))
            }
            None => None,
        };

        let present_target = surface.as_ref().map(|(loader, surface)| device::PresentTarget {
            loader,
            surface: *surface,
        });
        let (physical_device, queue_family, adapter_name) =
            device::select_physical_device(&instance, present_target.as_ref())?;
        let device =
            device::create_logical_device(&instance, physical_device, queue_family, surface.is_some())?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let capabilities = device::query_capabilities(&instance, physical_device, adapter_name);
        log::debug!("Device capabilities: {:?}", capabilities);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let acceleration_fn = ash::khr::acceleration_structure::Device::new(&instance, &device);
        let ray_tracing_fn = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let push_descriptor_fn = ash::khr::push_descriptor::Device::new(&instance, &device);

        let (command_pool, command_buffer, descriptor_pool, timeline) = unsafe {
            let command_pool = device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .queue_family_index(queue_family)
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                    None,
                )
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let command_buffer = device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?[0];

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    descriptor_count: 64,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    descriptor_count: 64,
                },
            ];
            let descriptor_pool = device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default()
                        .pool_sizes(&pool_sizes)
                        .max_sets(64)
                        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
                    None,
                )
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
                .semaphore_type(vk::SemaphoreType::TIMELINE)
                .initial_value(0);
            let timeline = device
                .create_semaphore(
                    &vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info),
                    None,
                )
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            (command_pool, command_buffer, descriptor_pool, timeline)
        };

        let mut backend = Self {
            _entry: entry,
            instance,
            debug,
            surface,
            _window: window,
            physical_device,
            device,
            queue,
            queue_family,
            allocator: Some(Arc::new(Mutex::new(allocator))),
            acceleration_fn,
            ray_tracing_fn,
            push_descriptor_fn,
            capabilities,
            swapchain: None,
            back_buffers: Vec::new(),
            back_buffer_index: 0,
            image_acquired: false,
            present_ready: false,
            extent: vk::Extent2D {
                width: config.width,
                height: config.height,
            },
            command_pool,
            command_buffer,
            descriptor_pool,
            timeline,
            signaled: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            accels: HashMap::new(),
            root_signatures: HashMap::new(),
            pipelines: HashMap::new(),
            heaps: HashMap::new(),
            next_id: 1,
        };

        // From here on Drop cleans up whatever creation left behind
        backend.create_back_buffers(config)?;
        log::info!(
            "Vulkan backend ready on {} ({} back buffers, {})",
            backend.capabilities.adapter_name,
            backend.back_buffers.len(),
            if backend.swapchain.is_some() { "windowed" } else { "headless" }
        );
        Ok(backend)
    }

    /// Create a backend that renders into offscreen surfaces
    pub fn headless(config: &RendererConfig) -> BackendResult<Self> {
        Self::new(None, config)
    }

    pub fn is_headless(&self) -> bool {
        self.swapchain.is_none()
    }

    fn create_back_buffers(&mut self, config: &RendererConfig) -> BackendResult<()> {
        let Some((surface_fn, surface)) = &self.surface else {
            for i in 0..config.back_buffer_count.max(1) {
                let handle = self.create_texture(&TextureDescriptor {
                    label: Some(format!("offscreen back buffer {}", i)),
                    width: config.width,
                    height: config.height,
                    format: TextureFormat::Rgba8Unorm,
                    usage: TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
                    initial_state: ResourceState::Present,
                })?;
                self.back_buffers.push(handle);
            }
            return Ok(());
        };

        let swapchain = Swapchain::new(
            &self.instance,
            &self.device,
            self.physical_device,
            surface_fn,
            *surface,
            config.width,
            config.height,
            config.back_buffer_count,
            config.vsync,
        )?;
        self.extent = swapchain.extent;
        for &image in &swapchain.images {
            let id = self.alloc_id();
            self.textures.insert(
                id,
                VkTexture {
                    image,
                    view: None,
                    allocation: None,
                    format: swapchain.format,
                    extent: swapchain.extent,
                    layout: vk::ImageLayout::UNDEFINED,
                    initialized: false,
                },
            );
            self.back_buffers.push(TextureHandle(id));
        }
        self.back_buffer_index = swapchain.acquire()?;
        self.image_acquired = true;
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&self) -> BackendResult<&Arc<Mutex<Allocator>>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    fn vk_buffer(&self, handle: BufferHandle) -> BackendResult<&VkBuffer> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn vk_texture(&self, handle: TextureHandle) -> BackendResult<&VkTexture> {
        self.textures
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn vk_texture_mut(&mut self, handle: TextureHandle) -> BackendResult<&mut VkTexture> {
        self.textures
            .get_mut(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn vk_accel(&self, handle: AccelerationStructureHandle) -> BackendResult<&VkAccelerationStructure> {
        self.accels
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn vk_root_signature(&self, handle: RootSignatureHandle) -> BackendResult<&VkRootSignature> {
        self.root_signatures
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn vk_pipeline(&self, handle: PipelineHandle) -> BackendResult<&VkPipeline> {
        self.pipelines
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    fn vk_heap(&self, handle: DescriptorHeapHandle) -> BackendResult<&VkDescriptorHeap> {
        self.heaps
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))
    }

    /// Headless surfaces are plain images, which cannot use the present layout
    fn resolve_layout(&self, layout: vk::ImageLayout) -> vk::ImageLayout {
        if layout == vk::ImageLayout::PRESENT_SRC_KHR && self.swapchain.is_none() {
            vk::ImageLayout::GENERAL
        } else {
            layout
        }
    }

    /// Record and run a command buffer outside the frame, waiting for the queue to idle
    fn run_single_time_commands<F>(&self, record: F) -> BackendResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe {
            let cmd = self
                .device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(self.command_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )
                .map_err(|e| BackendError::SubmitFailed(e.to_string()))?[0];

            let result = (|| {
                self.device.begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )?;
                record(cmd);
                self.device.end_command_buffer(cmd)?;
                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
                self.device.queue_wait_idle(self.queue)
            })();

            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result.map_err(|e| BackendError::SubmitFailed(e.to_string()))
        }
    }

    fn map_device_error(e: vk::Result) -> BackendError {
        match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                BackendError::OutOfMemory
            }
            other => BackendError::SubmitFailed(other.to_string()),
        }
    }
}

impl RayTracingBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?}: zero-sized buffer",
                desc.label
            )));
        }
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(desc.size)
                .usage(convert_buffer_usage(desc.usage, desc.location))
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            let mut requirements = self.device.get_buffer_memory_requirements(buffer);
            // Scratch, structure storage and shader tables are addressed
            // directly, so their base addresses carry alignment rules
            if desc.usage.contains(BufferUsage::SCRATCH) {
                requirements.alignment = requirements
                    .alignment
                    .max(self.capabilities.scratch_alignment as u64);
            }
            if desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_STORAGE) {
                requirements.alignment = requirements.alignment.max(256);
            }
            if desc.usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
                requirements.alignment = requirements
                    .alignment
                    .max(self.capabilities.shader_table_alignment as u64);
            }

            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("buffer"),
                requirements,
                location: convert_memory_location(desc.location),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(e.to_string()));
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                let _ = self.allocator()?.lock().free(allocation);
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }

            let address = self
                .device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer));

            let id = self.alloc_id();
            self.buffers.insert(
                id,
                VkBuffer {
                    buffer,
                    allocation,
                    size: desc.size,
                    address,
                },
            );
            log::trace!(
                "Vulkan: created buffer {:?} (size: {}, {:?})",
                desc.label,
                desc.size,
                desc.location
            );
            Ok(BufferHandle(id))
        }
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let mapped = target.allocation.mapped_slice_mut().ok_or_else(|| {
            BackendError::Validation(format!("buffer {:?} is not CPU-visible", buffer))
        })?;
        let start = offset as usize;
        let end = start + data.len();
        if end as u64 > target.size || end > mapped.len() {
            return Err(BackendError::Validation("write past end of buffer".to_string()));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let source = self.vk_buffer(buffer)?;
        let mapped = source.allocation.mapped_slice().ok_or_else(|| {
            BackendError::Validation(format!("buffer {:?} is not CPU-visible", buffer))
        })?;
        let end = (offset + size) as usize;
        if offset + size > source.size || end > mapped.len() {
            return Err(BackendError::Validation("read past end of buffer".to_string()));
        }
        Ok(mapped[offset as usize..end].to_vec())
    }

    fn buffer_address(&self, buffer: BufferHandle) -> BackendResult<GpuAddress> {
        Ok(self.vk_buffer(buffer)?.address)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe {
                self.device.destroy_buffer(vk_buffer.buffer, None);
            }
            if let Some(ref allocator) = self.allocator {
                let _ = allocator.lock().free(vk_buffer.allocation);
            }
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: zero extent",
                desc.label
            )));
        }
        let format = convert_format(desc.format);
        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };

        unsafe {
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .format(format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(convert_texture_usage(desc.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .samples(vk::SampleCountFlags::TYPE_1);

            let image = self
                .device
                .create_image(&image_info, None)
                .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

            let requirements = self.device.get_image_memory_requirements(image);

            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name: desc.label.as_deref().unwrap_or("texture"),
                requirements,
                location: gpu_allocator::MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(BackendError::TextureCreationFailed(e.to_string()));
                }
            };

            if let Err(e) = self
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
            {
                self.device.destroy_image(image, None);
                let _ = self.allocator()?.lock().free(allocation);
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }

            let id = self.alloc_id();
            self.textures.insert(
                id,
                VkTexture {
                    image,
                    view: None,
                    allocation: Some(allocation),
                    format,
                    extent,
                    layout: vk::ImageLayout::UNDEFINED,
                    initialized: false,
                },
            );
            let handle = TextureHandle(id);

            if desc.usage.contains(TextureUsage::STORAGE) {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format)
                    .subresource_range(color_subresource_range());
                match self.device.create_image_view(&view_info, None) {
                    Ok(view) => {
                        if let Some(texture) = self.textures.get_mut(&id) {
                            texture.view = Some(view);
                        }
                    }
                    Err(e) => {
                        self.destroy_texture(handle);
                        return Err(BackendError::TextureCreationFailed(e.to_string()));
                    }
                }
            }

            // Move the image into its declared initial state
            let scope = state_scope(desc.initial_state);
            let layout = self.resolve_layout(scope.layout);
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(scope.access)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_subresource_range());
            let transition = self.run_single_time_commands(|cmd| {
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::ALL_COMMANDS,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            });
            if let Err(e) = transition {
                self.destroy_texture(handle);
                return Err(e);
            }
            if let Some(texture) = self.textures.get_mut(&id) {
                texture.layout = layout;
                texture.initialized = true;
            }

            log::trace!(
                "Vulkan: created texture {:?} ({}x{}, {:?})",
                desc.label,
                desc.width,
                desc.height,
                desc.initial_state
            );
            Ok(handle)
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if self.back_buffers.contains(&texture) && self.swapchain.is_some() {
            return;
        }
        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            unsafe {
                if let Some(view) = vk_texture.view {
                    self.device.destroy_image_view(view, None);
                }
                self.device.destroy_image(vk_texture.image, None);
            }
            if let (Some(allocator), Some(allocation)) = (&self.allocator, vk_texture.allocation) {
                let _ = allocator.lock().free(allocation);
            }
        }
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> BackendResult<PrebuildInfo> {
        self.query_build_sizes(inputs)
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        buffer: BufferHandle,
        size: u64,
    ) -> BackendResult<AccelerationStructureHandle> {
        let accel = self.create_vk_acceleration_structure(kind, buffer, size)?;
        let id = self.alloc_id();
        self.accels.insert(id, accel);
        Ok(AccelerationStructureHandle(id))
    }

    fn acceleration_structure_address(
        &self,
        accel: AccelerationStructureHandle,
    ) -> BackendResult<GpuAddress> {
        Ok(self.vk_accel(accel)?.address)
    }

    fn destroy_acceleration_structure(&mut self, accel: AccelerationStructureHandle) {
        if let Some(accel) = self.accels.remove(&accel.0) {
            unsafe {
                self.acceleration_fn
                    .destroy_acceleration_structure(accel.handle, None)
            };
        }
    }

    fn create_root_signature(
        &mut self,
        desc: &RootSignatureDescriptor,
    ) -> BackendResult<RootSignatureHandle> {
        let signature = self.create_vk_root_signature(desc)?;
        let id = self.alloc_id();
        self.root_signatures.insert(id, signature);
        Ok(RootSignatureHandle(id))
    }

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let layout = self.vk_root_signature(desc.root_signature)?.pipeline_layout;
        let pipeline = self.create_vk_pipeline(desc, layout)?;
        let id = self.alloc_id();
        self.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn shader_identifier(&self, pipeline: PipelineHandle, export: &str) -> BackendResult<Vec<u8>> {
        self.shader_group_handle(self.vk_pipeline(pipeline)?, export)
    }

    fn create_descriptor_heap(
        &mut self,
        root_signature: RootSignatureHandle,
        entries: &[DescriptorEntry],
    ) -> BackendResult<DescriptorHeapHandle> {
        let heap = self.create_vk_descriptor_heap(self.vk_root_signature(root_signature)?, entries)?;
        let id = self.alloc_id();
        self.heaps.insert(id, heap);
        Ok(DescriptorHeapHandle(id))
    }

    fn descriptor_heap_gpu_base(&self, heap: DescriptorHeapHandle) -> BackendResult<GpuAddress> {
        self.vk_heap(heap)?;
        Err(BackendError::Validation(
            "descriptor sets are bound per dispatch and have no GPU address".to_string(),
        ))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(pipeline.pipeline, None) };
        }
    }

    fn destroy_root_signature(&mut self, root_signature: RootSignatureHandle) {
        if let Some(signature) = self.root_signatures.remove(&root_signature.0) {
            unsafe {
                self.device
                    .destroy_pipeline_layout(signature.pipeline_layout, None);
                self.device
                    .destroy_descriptor_set_layout(signature.table_layout, None);
                self.device
                    .destroy_descriptor_set_layout(signature.constants_layout, None);
            }
        }
    }

    fn destroy_descriptor_heap(&mut self, heap: DescriptorHeapHandle) {
        if let Some(heap) = self.heaps.remove(&heap.0) {
            unsafe {
                let _ = self
                    .device
                    .free_descriptor_sets(self.descriptor_pool, &[heap.set]);
            }
        }
    }

    fn submit(&mut self, commands: &CommandList) -> BackendResult<()> {
        if !commands.is_closed() {
            return Err(BackendError::SubmitFailed(format!(
                "command list '{}' is still recording",
                commands.label()
            )));
        }
        // The command buffer is reused, so the previous submission must be done
        self.wait_for_value(self.signaled)?;

        let cmd = self.command_buffer;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(Self::map_device_error)?;
            self.device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(Self::map_device_error)?;
        }

        let summary = match self.record_commands(cmd, commands) {
            Ok(summary) => summary,
            Err(e) => {
                unsafe {
                    let _ = self.device.end_command_buffer(cmd);
                }
                return Err(e);
            }
        };

        unsafe {
            // Make every write visible to host reads of readback buffers
            let host_barrier = vk::MemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::HOST_READ);
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[host_barrier],
                &[],
                &[],
            );
            self.device
                .end_command_buffer(cmd)
                .map_err(Self::map_device_error)?;
        }

        // After a failed present no image is held; writing one would touch an
        // image the presentation engine still owns
        if self.swapchain.is_some() && summary.touches_back_buffer && !self.image_acquired {
            return Err(BackendError::SurfaceLost);
        }

        let command_buffers = [cmd];
        let mut wait_semaphores = Vec::new();
        let mut signal_semaphores = Vec::new();
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let writes_surface = summary.touches_back_buffer && self.image_acquired;
        if let (Some(swapchain), true) = (&self.swapchain, writes_surface) {
            wait_semaphores.push(swapchain.image_available);
            signal_semaphores.push(swapchain.render_finished[self.back_buffer_index as usize]);
        }

        let mut submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        if !wait_semaphores.is_empty() {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(Self::map_device_error)?;
        }
        if !signal_semaphores.is_empty() {
            self.image_acquired = false;
            self.present_ready = true;
        }
        log::trace!(
            "Vulkan: submitted '{}' ({} commands)",
            commands.label(),
            commands.len()
        );
        Ok(())
    }

    fn signal(&mut self, value: u64) -> BackendResult<()> {
        let semaphores = [self.timeline];
        let values = [value];
        let mut timeline_info =
            vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit_info = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
                .map_err(Self::map_device_error)?;
        }
        self.signaled = value;
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        match unsafe { self.device.get_semaphore_counter_value(self.timeline) } {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to read fence value: {}", e);
                0
            }
        }
    }

    fn wait_for_value(&mut self, value: u64) -> BackendResult<()> {
        if value == 0 || self.completed_value() >= value {
            return Ok(());
        }
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::FenceWaitFailed(other.to_string()),
        })
    }

    fn back_buffers(&self) -> &[TextureHandle] {
        &self.back_buffers
    }

    fn current_back_buffer_index(&mut self) -> BackendResult<u32> {
        Ok(self.back_buffer_index)
    }

    fn present(&mut self) -> BackendResult<()> {
        match &self.swapchain {
            Some(swapchain) => {
                if !self.image_acquired && !self.present_ready {
                    return Err(BackendError::SurfaceLost);
                }
                let result = swapchain
                    .present(self.queue, self.back_buffer_index, self.present_ready)
                    .and_then(|()| swapchain.acquire());
                self.present_ready = false;
                match result {
                    Ok(index) => {
                        self.back_buffer_index = index;
                        self.image_acquired = true;
                    }
                    Err(e) => {
                        self.image_acquired = false;
                        return Err(e);
                    }
                }
            }
            None => {
                self.back_buffer_index = (self.back_buffer_index + 1) % self.back_buffers.len() as u32;
            }
        }
        Ok(())
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.extent.width, self.extent.height)
    }

    fn drain_debug_messages(&mut self) -> Vec<String> {
        self.debug
            .as_ref()
            .map(DebugMessenger::drain)
            .unwrap_or_default()
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, accel) in self.accels.drain() {
                self.acceleration_fn
                    .destroy_acceleration_structure(accel.handle, None);
            }

            for (_, pipeline) in self.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
            }

            for (_, signature) in self.root_signatures.drain() {
                self.device
                    .destroy_pipeline_layout(signature.pipeline_layout, None);
                self.device
                    .destroy_descriptor_set_layout(signature.table_layout, None);
                self.device
                    .destroy_descriptor_set_layout(signature.constants_layout, None);
            }
            // Descriptor sets go away with their pool
            self.heaps.clear();

            if let Some(ref allocator) = self.allocator {
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.lock().free(buffer.allocation);
                }

                // Swapchain images have no allocation and are destroyed with the swapchain
                for (_, texture) in self.textures.drain() {
                    if let Some(view) = texture.view {
                        self.device.destroy_image_view(view, None);
                    }
                    if let Some(allocation) = texture.allocation {
                        self.device.destroy_image(texture.image, None);
                        let _ = allocator.lock().free(allocation);
                    }
                }
            }

            // Drop the allocator before destroying the device
            drop(self.allocator.take());

            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_semaphore(self.timeline, None);

            if let Some(swapchain) = self.swapchain.take() {
                swapchain.destroy(&self.device);
            }

            self.device.destroy_device(None);
            if let Some((surface_fn, surface)) = self.surface.take() {
                surface_fn.destroy_surface(surface, None);
            }
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}
