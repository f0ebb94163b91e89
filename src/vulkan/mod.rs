//! Vulkan collaborator: DRM format modifier queries, DMA-BUF import and
//! present fences.
//!
//! The swapchain does not own the Vulkan instance or device; the embedding
//! layer hands both over wrapped in a [`DeviceContext`]. The device must have
//! `VK_EXT_image_drm_format_modifier`, `VK_EXT_external_memory_dma_buf` and
//! `VK_KHR_external_memory_fd` enabled for the zero-copy paths.

pub mod format;

use std::fmt;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

use ash::extensions::khr;
use ash::vk;
use tracing::warn;

use crate::allocator::dmabuf::Dmabuf;

/// Errors from the Vulkan collaborator.
#[derive(Debug, thiserror::Error)]
pub enum VulkanError {
    /// The format is not usable for the requested operation.
    #[error("format is not supported")]
    UnsupportedFormat,

    /// No memory type satisfies both the image and the imported fd.
    #[error("no compatible memory type for import")]
    NoMemoryType,

    /// The buffer carries no planes.
    #[error("the buffer has no planes")]
    NoPlanes,

    /// Some error from the Vulkan driver.
    #[error(transparent)]
    Vk(#[from] vk::Result),
}

/// Handles to the instance and device the swapchain operates on.
pub struct DeviceContext {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    external_memory_fd: khr::ExternalMemoryFd,
    memory_props: vk::PhysicalDeviceMemoryProperties,
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("physical_device", &self.physical_device)
            .finish_non_exhaustive()
    }
}

impl DeviceContext {
    /// Wrap an instance/device pair.
    pub fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> DeviceContext {
        let external_memory_fd = khr::ExternalMemoryFd::new(&instance, &device);
        let memory_props =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        DeviceContext {
            instance,
            physical_device,
            device: Arc::new(device),
            external_memory_fd,
            memory_props,
        }
    }

    /// The wrapped logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// DRM format modifier properties the driver advertises for `format`.
    pub fn drm_format_modifier_properties(
        &self,
        format: vk::Format,
    ) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
        let mut list = vk::DrmFormatModifierPropertiesListEXT::default();
        {
            let mut props = vk::FormatProperties2::builder().push_next(&mut list);
            unsafe {
                self.instance.get_physical_device_format_properties2(
                    self.physical_device,
                    format,
                    &mut props,
                )
            };
        }

        let mut entries =
            vec![vk::DrmFormatModifierPropertiesEXT::default(); list.drm_format_modifier_count as usize];
        list.p_drm_format_modifier_properties = entries.as_mut_ptr();
        {
            let mut props = vk::FormatProperties2::builder().push_next(&mut list);
            unsafe {
                self.instance.get_physical_device_format_properties2(
                    self.physical_device,
                    format,
                    &mut props,
                )
            };
        }
        entries.truncate(list.drm_format_modifier_count as usize);

        entries
    }

    /// Whether an image with the given description can be imported from a
    /// DMA-BUF using `modifier`.
    pub fn is_modifier_importable(
        &self,
        vk_format: vk::Format,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
        modifier: u64,
    ) -> bool {
        let mut drm_info = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::builder()
            .drm_format_modifier(modifier)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut external_info = vk::PhysicalDeviceExternalImageFormatInfo::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let format_info = vk::PhysicalDeviceImageFormatInfo2::builder()
            .format(vk_format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(usage)
            .flags(vk::ImageCreateFlags::empty())
            .push_next(&mut drm_info)
            .push_next(&mut external_info);

        let mut external_props = vk::ExternalImageFormatProperties::default();
        let mut props = vk::ImageFormatProperties2::builder().push_next(&mut external_props);

        let result = unsafe {
            self.instance.get_physical_device_image_format_properties2(
                self.physical_device,
                &format_info,
                &mut props,
            )
        };
        if result.is_err() {
            return false;
        }

        let limits = props.image_format_properties;
        drop(props);

        if !external_props
            .external_memory_properties
            .external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE)
        {
            return false;
        }

        limits.max_extent.width >= width
            && limits.max_extent.height >= height
            && limits.max_extent.depth >= 1
            && limits.sample_counts.contains(vk::SampleCountFlags::TYPE_1)
    }

    /// Create a 2D image with an explicit DRM modifier layout, set up for
    /// DMA-BUF external memory import.
    pub fn create_dmabuf_image(
        &self,
        vk_format: vk::Format,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
        modifier: u64,
        plane_layouts: &[vk::SubresourceLayout],
        disjoint: bool,
    ) -> Result<vk::Image, VulkanError> {
        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::builder()
            .drm_format_modifier(modifier)
            .plane_layouts(plane_layouts);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let flags = if disjoint {
            vk::ImageCreateFlags::DISJOINT
        } else {
            vk::ImageCreateFlags::empty()
        };

        let create_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut modifier_info)
            .push_next(&mut external_info);

        Ok(unsafe { self.device.create_image(&create_info, None) }?)
    }

    /// Import the planes of `dmabuf` and bind them to `image`.
    ///
    /// Consumes the buffer: plane fds are owned by the driver once the
    /// corresponding `vkAllocateMemory` succeeds.
    pub fn import_and_bind(
        &self,
        image: vk::Image,
        dmabuf: Dmabuf,
        disjoint: bool,
        memory_planes: u32,
    ) -> Result<ImageMemory, VulkanError> {
        let mut planes = dmabuf.into_planes();
        if planes.is_empty() {
            return Err(VulkanError::NoPlanes);
        }

        let mut memories = Vec::new();
        let result = if disjoint && memory_planes > 1 {
            self.import_disjoint(image, &mut planes, memory_planes, &mut memories)
        } else {
            self.import_single(image, planes.remove(0).fd, &mut memories)
        };

        match result {
            Ok(()) => Ok(ImageMemory {
                device: self.device.clone(),
                memories,
            }),
            Err(err) => {
                for memory in memories {
                    unsafe { self.device.free_memory(memory, None) };
                }
                Err(err)
            }
        }
    }

    fn import_single(
        &self,
        image: vk::Image,
        fd: OwnedFd,
        memories: &mut Vec<vk::DeviceMemory>,
    ) -> Result<(), VulkanError> {
        let mut reqs = vk::MemoryRequirements2::default();
        let info = vk::ImageMemoryRequirementsInfo2::builder().image(image);
        unsafe { self.device.get_image_memory_requirements2(&info, &mut reqs) };

        let memory = self.import_fd(image, fd, reqs.memory_requirements)?;
        memories.push(memory);

        unsafe { self.device.bind_image_memory(image, memory, 0) }?;
        Ok(())
    }

    fn import_disjoint(
        &self,
        image: vk::Image,
        planes: &mut Vec<crate::allocator::dmabuf::Plane>,
        memory_planes: u32,
        memories: &mut Vec<vk::DeviceMemory>,
    ) -> Result<(), VulkanError> {
        for (idx, plane) in planes.drain(..).take(memory_planes as usize).enumerate() {
            let mut plane_info = vk::ImagePlaneMemoryRequirementsInfo::builder()
                .plane_aspect(memory_plane_aspect(idx));
            let info = vk::ImageMemoryRequirementsInfo2::builder()
                .image(image)
                .push_next(&mut plane_info);
            let mut reqs = vk::MemoryRequirements2::default();
            unsafe { self.device.get_image_memory_requirements2(&info, &mut reqs) };

            let memory = self.import_fd(image, plane.fd, reqs.memory_requirements)?;
            memories.push(memory);
        }

        let mut plane_infos: Vec<vk::BindImagePlaneMemoryInfo> = (0..memories.len())
            .map(|idx| {
                vk::BindImagePlaneMemoryInfo::builder()
                    .plane_aspect(memory_plane_aspect(idx))
                    .build()
            })
            .collect();
        let bind_infos: Vec<vk::BindImageMemoryInfo> = memories
            .iter()
            .zip(plane_infos.iter_mut())
            .map(|(memory, plane_info)| {
                vk::BindImageMemoryInfo::builder()
                    .image(image)
                    .memory(*memory)
                    .push_next(plane_info)
                    .build()
            })
            .collect();
        unsafe { self.device.bind_image_memory2(&bind_infos) }?;
        Ok(())
    }

    fn import_fd(
        &self,
        image: vk::Image,
        fd: OwnedFd,
        reqs: vk::MemoryRequirements,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let fd_props = unsafe {
            self.external_memory_fd.get_memory_fd_properties(
                vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                fd.as_raw_fd(),
            )
        }?;

        let type_bits = reqs.memory_type_bits & fd_props.memory_type_bits;
        let memory_type_index = (type_bits != 0)
            .then(|| type_bits.trailing_zeros())
            .ok_or(VulkanError::NoMemoryType)?;

        // The driver owns the fd once the allocation succeeds.
        let raw_fd = fd.into_raw_fd();
        let mut import_info = vk::ImportMemoryFdInfoKHR::builder()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(raw_fd);
        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::builder().image(image);
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info)
            .push_next(&mut dedicated_info);

        match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => Ok(memory),
            Err(err) => {
                drop(unsafe { OwnedFd::from_raw_fd(raw_fd) });
                Err(err.into())
            }
        }
    }

    /// Create a host-visible linear image with a persistent mapping for the
    /// software presentation path.
    pub fn create_host_image(
        &self,
        vk_format: vk::Format,
        width: u32,
        height: u32,
        usage: vk::ImageUsageFlags,
    ) -> Result<HostImage, VulkanError> {
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::LINEAR)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::PREINITIALIZED);

        let image = unsafe { self.device.create_image(&create_info, None) }?;

        match self.bind_host_memory(image) {
            Ok((memory, ptr)) => {
                let subresource = vk::ImageSubresource::builder()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .build();
                let layout =
                    unsafe { self.device.get_image_subresource_layout(image, subresource) };

                Ok(HostImage {
                    device: self.device.clone(),
                    image,
                    memory,
                    ptr,
                    row_pitch: layout.row_pitch as usize,
                })
            }
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                Err(err)
            }
        }
    }

    fn bind_host_memory(
        &self,
        image: vk::Image,
    ) -> Result<(vk::DeviceMemory, *mut u8), VulkanError> {
        let reqs = unsafe { self.device.get_image_memory_requirements(image) };
        let wanted =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let memory_type_index = self
            .find_memory_type(reqs.memory_type_bits, wanted)
            .ok_or(VulkanError::NoMemoryType)?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index);
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }?;

        let bound = unsafe { self.device.bind_image_memory(image, memory, 0) }.and_then(|_| unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        });

        match bound {
            Ok(ptr) => Ok((memory, ptr as *mut u8)),
            Err(err) => {
                unsafe { self.device.free_memory(memory, None) };
                Err(err.into())
            }
        }
    }

    fn find_memory_type(&self, type_bits: u32, wanted: vk::MemoryPropertyFlags) -> Option<u32> {
        self.memory_props.memory_types[..self.memory_props.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|(idx, memory_type)| {
                type_bits & (1 << idx) != 0 && memory_type.property_flags.contains(wanted)
            })
            .map(|(idx, _)| idx as u32)
    }

    /// Destroy an image created by this context.
    pub fn destroy_image(&self, image: vk::Image) {
        if image != vk::Image::null() {
            unsafe { self.device.destroy_image(image, None) };
        }
    }

    /// Create a present fence in the signaled state.
    pub fn create_present_fence(&self) -> Result<PresentFence, VulkanError> {
        let create_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { self.device.create_fence(&create_info, None) }?;

        Ok(PresentFence {
            device: self.device.clone(),
            fence,
        })
    }
}

const fn memory_plane_aspect(idx: usize) -> vk::ImageAspectFlags {
    match idx {
        0 => vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
        1 => vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
        2 => vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
        _ => vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
    }
}

/// Device memory bound to an imported dmabuf image.
pub struct ImageMemory {
    device: Arc<ash::Device>,
    memories: Vec<vk::DeviceMemory>,
}

impl fmt::Debug for ImageMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageMemory")
            .field("memories", &self.memories)
            .finish_non_exhaustive()
    }
}

impl Drop for ImageMemory {
    fn drop(&mut self) {
        for memory in self.memories.drain(..) {
            unsafe { self.device.free_memory(memory, None) };
        }
    }
}

/// A host-visible linear image with a persistent mapping.
pub struct HostImage {
    device: Arc<ash::Device>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
    row_pitch: usize,
}

// SAFETY: the mapping is read by the presenter and written by the GPU; all
// cross-thread hand-offs are ordered by the swapchain's image statuses.
unsafe impl Send for HostImage {}
unsafe impl Sync for HostImage {}

impl HostImage {
    /// The Vulkan image handle.
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// Start of the persistent mapping.
    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Row pitch of the linear layout in bytes.
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }
}

impl fmt::Debug for HostImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostImage")
            .field("image", &self.image)
            .field("row_pitch", &self.row_pitch)
            .finish_non_exhaustive()
    }
}

impl Drop for HostImage {
    fn drop(&mut self) {
        unsafe {
            self.device.unmap_memory(self.memory);
            self.device.free_memory(self.memory, None);
            self.device.destroy_image(self.image, None);
        }
    }
}

/// Fence gating buffer reuse on GPU completion of the last submission that
/// rendered to an image.
pub struct PresentFence {
    device: Arc<ash::Device>,
    fence: vk::Fence,
}

impl PresentFence {
    /// Associate the fence with the submission presenting the image.
    ///
    /// Submits an empty batch that waits on `wait_semaphores` and signals the
    /// fence, so a later [`wait`](Self::wait) observes the GPU being done.
    pub fn set_payload(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<(), VulkanError> {
        unsafe { self.device.reset_fences(&[self.fence]) }?;

        let stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait_semaphores.len()];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&stages);
        unsafe { self.device.queue_submit(queue, &[submit.build()], self.fence) }?;
        Ok(())
    }

    /// Block until the payload signals or `timeout_ns` elapses.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), VulkanError> {
        match unsafe { self.device.wait_for_fences(&[self.fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                warn!("present fence wait timed out");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl fmt::Debug for PresentFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentFence")
            .field("fence", &self.fence)
            .finish_non_exhaustive()
    }
}

impl Drop for PresentFence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.fence, None) };
    }
}
