//! Buffer allocation collaborators.
//!
//! The swapchain never allocates GPU memory itself. Zero-copy images are
//! backed by DMA-BUFs obtained from a [`DmabufAllocator`] supplied by the
//! embedding layer, typically a wrapper around a DMA heap or GBM device.
//!
//! Allocation is format-negotiating: the swapchain hands the allocator the
//! list of format/modifier pairs the Vulkan device can import and the
//! allocator settles on the one it can actually produce. A `NO_MEMORY` probe
//! performs the negotiation and reports plane layouts without backing the
//! buffer, which the swapchain uses once to lock in the image creation
//! parameters.

pub mod dmabuf;

pub use drm_fourcc::{DrmFormat as Format, DrmFourcc as Fourcc, DrmModifier as Modifier};

use self::dmabuf::Dmabuf;

bitflags::bitflags! {
    /// Flags controlling a single allocation request.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocationFlags: u32 {
        /// Probe only: pick a format and report plane layouts without
        /// allocating backing memory.
        const NO_MEMORY = 1;
        /// Allocate from protected memory.
        const PROTECTED = 2;
    }
}

/// A format the allocator may choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateFormat {
    /// DRM fourcc of the pixel format.
    pub fourcc: Fourcc,
    /// DRM format modifier qualifying the in-memory layout.
    pub modifier: Modifier,
    /// The importer cannot handle disjoint plane layouts for this modifier.
    pub non_disjoint: bool,
}

/// Parameters of one allocation.
#[derive(Debug)]
pub struct AllocationRequest<'a> {
    /// Acceptable formats, in no particular order.
    pub candidates: &'a [CandidateFormat],
    /// Width of the buffer in pixels.
    pub width: u32,
    /// Height of the buffer in pixels.
    pub height: u32,
    /// Request flags.
    pub flags: AllocationFlags,
}

/// Per-plane layout reported by the allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Row stride in bytes.
    pub stride: u32,
    /// Offset of the plane from the start of its fd.
    pub offset: u32,
}

/// The outcome of a successful allocation or probe.
#[derive(Debug)]
pub struct Allocation {
    /// The candidate the allocator settled on.
    pub format: CandidateFormat,
    /// Plane layouts, one entry per format plane.
    pub plane_layouts: Vec<PlaneLayout>,
    /// Number of distinct memory objects backing the planes.
    pub memory_planes: u32,
    /// The planes live in more than one memory object.
    pub is_disjoint: bool,
    /// The backing buffer. `None` for `NO_MEMORY` probes.
    pub buffer: Option<Dmabuf>,
}

/// Errors reported by an allocator implementation.
#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    /// None of the candidate formats can be produced.
    #[error("none of the candidate formats is supported")]
    Unsupported,

    /// The allocation failed for lack of resources.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Interface to the DMA-BUF allocator library.
pub trait DmabufAllocator: Send {
    /// Allocate a buffer matching one of the requested candidates.
    fn allocate(&mut self, request: &AllocationRequest<'_>) -> Result<Allocation, AllocationError>;
}
