//! Error kinds surfaced to the WSI layer.

use crate::allocator::AllocationError;
use crate::vulkan::VulkanError;

/// Errors reported by the swapchain to the layer above it.
///
/// These are deliberately coarse: the WSI layer maps them onto `VkResult`
/// codes and its only recovery strategy is recreating the swapchain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwapchainError {
    /// Every presentation backend failed to initialize.
    #[error("no presentation backend could be initialized")]
    InitializationFailed,

    /// No DRM format modifier is importable for the requested Vulkan format.
    #[error("no importable DRM format modifier for the requested format")]
    FormatNotSupported,

    /// A host allocation, container reservation or fd duplication failed.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// Wire-level I/O with the display server failed.
    #[error("the surface has been lost")]
    SurfaceLost,

    /// The event pump stopped while a blocking wait was in progress.
    #[error("the swapchain is out of date")]
    OutOfDate,

    /// A Vulkan call failed.
    #[error("vulkan error: {0}")]
    Vk(ash::vk::Result),
}

impl From<ash::vk::Result> for SwapchainError {
    fn from(result: ash::vk::Result) -> Self {
        SwapchainError::Vk(result)
    }
}

impl From<VulkanError> for SwapchainError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::UnsupportedFormat => SwapchainError::FormatNotSupported,
            VulkanError::NoMemoryType | VulkanError::NoPlanes => SwapchainError::OutOfHostMemory,
            VulkanError::Vk(result) => SwapchainError::Vk(result),
        }
    }
}

impl From<AllocationError> for SwapchainError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::Unsupported => SwapchainError::FormatNotSupported,
            AllocationError::Io(_) => SwapchainError::OutOfHostMemory,
        }
    }
}
