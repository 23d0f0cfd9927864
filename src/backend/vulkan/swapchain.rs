//! Window swapchain: the pooled presentation surfaces of a windowed backend.

use ash::khr::{surface, swapchain};
use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};

pub struct Swapchain {
    loader: swapchain::Device,
    swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Signaled by the acquire, waited on by the submit writing the image
    pub image_available: vk::Semaphore,
    /// One per image, signaled by that submit and waited on by its present
    pub render_finished: Vec<vk::Semaphore>,
}

impl Swapchain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        image_count: u32,
        vsync: bool,
    ) -> BackendResult<Self> {
        unsafe {
            let capabilities = surface_fn
                .get_physical_device_surface_capabilities(physical_device, surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = surface_fn
                .get_physical_device_surface_formats(physical_device, surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = surface_fn
                .get_physical_device_surface_present_modes(physical_device, surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            // The ray output is copied verbatim, so only UNORM formats keep colors intact
            let format = formats
                .iter()
                .find(|f| {
                    matches!(
                        f.format,
                        vk::Format::B8G8R8A8_UNORM | vk::Format::R8G8B8A8_UNORM
                    ) && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .ok_or_else(|| {
                    BackendError::SwapchainCreationFailed("no 8-bit UNORM surface format".into())
                })?;

            if !capabilities
                .supported_usage_flags
                .contains(vk::ImageUsageFlags::TRANSFER_DST)
            {
                return Err(BackendError::SwapchainCreationFailed(
                    "surface images cannot be copy destinations".into(),
                ));
            }

            let present_mode = if vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let max_images = if capabilities.max_image_count > 0 {
                capabilities.max_image_count
            } else {
                u32::MAX
            };
            let image_count = image_count.clamp(capabilities.min_image_count, max_images);

            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);

            let loader = swapchain::Device::new(instance, device);
            let swapchain = loader
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let images = match loader.get_swapchain_images(swapchain) {
                Ok(images) => images,
                Err(e) => {
                    loader.destroy_swapchain(swapchain, None);
                    return Err(BackendError::SwapchainCreationFailed(e.to_string()));
                }
            };

            let semaphore_info = vk::SemaphoreCreateInfo::default();
            let image_available = device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;
            let render_finished = images
                .iter()
                .map(|_| device.create_semaphore(&semaphore_info, None))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            log::info!(
                "Created swapchain: {} images, {:?}, {}x{}, {:?}",
                images.len(),
                format.format,
                extent.width,
                extent.height,
                present_mode
            );

            Ok(Self {
                loader,
                swapchain,
                images,
                format: format.format,
                extent,
                image_available,
                render_finished,
            })
        }
    }

    /// Acquire the next image, signaling `image_available` once it is free
    pub fn acquire(&self) -> BackendResult<u32> {
        let (index, suboptimal) = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available,
                vk::Fence::null(),
            )
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR => {
                BackendError::SurfaceLost
            }
            _ => BackendError::AcquireImageFailed(e.to_string()),
        })?;
        if suboptimal {
            log::debug!("Swapchain is suboptimal for the surface");
        }
        Ok(index)
    }

    pub fn present(&self, queue: vk::Queue, index: u32, wait: bool) -> BackendResult<()> {
        let wait_semaphores = [self.render_finished[index as usize]];
        let swapchains = [self.swapchain];
        let image_indices = [index];
        let mut present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        if wait {
            present_info = present_info.wait_semaphores(&wait_semaphores);
        }

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(_) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                Err(BackendError::SurfaceLost)
            }
            Err(e) => Err(BackendError::PresentFailed(e.to_string())),
        }
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            for &semaphore in &self.render_finished {
                device.destroy_semaphore(semaphore, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
