//! DMA-BUF handles.
//!
//! A [`Dmabuf`] owns the file descriptors of an allocated buffer, one per
//! plane. Dropping the handle closes them; handing the planes to a consumer
//! that takes ownership (Vulkan import) is done with [`Dmabuf::into_planes`].
//! Backends that keep their own reference to a plane must duplicate the fd
//! first.

use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};

use drm_fourcc::{DrmFourcc, DrmModifier};

/// Maximum amount of planes this implementation supports.
pub const MAX_PLANES: usize = 4;

/// One plane of a dmabuf.
#[derive(Debug)]
pub struct Plane {
    /// Owned dma-buf file descriptor backing the plane.
    pub fd: OwnedFd,
    /// The plane index.
    pub plane_idx: u32,
    /// Offset from the start of the fd.
    pub offset: u32,
    /// Stride for this plane.
    pub stride: u32,
}

/// An allocated DMA-BUF backed buffer.
#[derive(Debug)]
pub struct Dmabuf {
    planes: Vec<Plane>,
    width: u32,
    height: u32,
    fourcc: DrmFourcc,
    modifier: DrmModifier,
}

/// Builder for [`Dmabuf`]s.
#[derive(Debug)]
pub struct DmabufBuilder {
    inner: Dmabuf,
}

impl DmabufBuilder {
    /// Add a plane to the constructed Dmabuf.
    ///
    /// Returns `false` when [`MAX_PLANES`] planes have already been added.
    pub fn add_plane(&mut self, fd: OwnedFd, plane_idx: u32, offset: u32, stride: u32) -> bool {
        if self.inner.planes.len() == MAX_PLANES {
            return false;
        }
        self.inner.planes.push(Plane {
            fd,
            plane_idx,
            offset,
            stride,
        });

        true
    }

    /// Build the `Dmabuf`, or `None` when no planes were added.
    pub fn build(mut self) -> Option<Dmabuf> {
        if self.inner.planes.is_empty() {
            return None;
        }

        self.inner.planes.sort_by_key(|plane| plane.plane_idx);
        Some(self.inner)
    }
}

impl Dmabuf {
    /// Create a new Dmabuf builder.
    pub fn builder(
        width: u32,
        height: u32,
        fourcc: DrmFourcc,
        modifier: DrmModifier,
    ) -> DmabufBuilder {
        DmabufBuilder {
            inner: Dmabuf {
                planes: Vec::with_capacity(MAX_PLANES),
                width,
                height,
                fourcc,
                modifier,
            },
        }
    }

    /// The amount of planes this Dmabuf has.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Borrowed handles of the planes of this buffer.
    pub fn handles(&self) -> impl Iterator<Item = BorrowedFd<'_>> + '_ {
        self.planes.iter().map(|p| p.fd.as_fd())
    }

    /// Offsets of the planes of this buffer.
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.offset)
    }

    /// Strides of the planes of this buffer.
    pub fn strides(&self) -> impl Iterator<Item = u32> + '_ {
        self.planes.iter().map(|p| p.stride)
    }

    /// Width of the buffer in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height of the buffer in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// DRM fourcc of the buffer.
    pub fn fourcc(&self) -> DrmFourcc {
        self.fourcc
    }

    /// DRM format modifier of the buffer.
    pub fn modifier(&self) -> DrmModifier {
        self.modifier
    }

    /// Consume the buffer, yielding ownership of its planes.
    pub fn into_planes(self) -> Vec<Plane> {
        self.planes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::fs::{memfd_create, MemfdFlags};

    fn fake_fd() -> OwnedFd {
        memfd_create("dmabuf-test", MemfdFlags::CLOEXEC).unwrap()
    }

    #[test]
    fn builder_needs_at_least_one_plane() {
        let builder = Dmabuf::builder(64, 64, DrmFourcc::Xrgb8888, DrmModifier::Linear);
        assert!(builder.build().is_none());
    }

    #[test]
    fn builder_caps_planes() {
        let mut builder = Dmabuf::builder(64, 64, DrmFourcc::Xrgb8888, DrmModifier::Linear);
        for idx in 0..MAX_PLANES as u32 {
            assert!(builder.add_plane(fake_fd(), idx, 0, 256));
        }
        assert!(!builder.add_plane(fake_fd(), 4, 0, 256));
        assert_eq!(builder.build().unwrap().num_planes(), MAX_PLANES);
    }

    #[test]
    fn planes_are_sorted_by_index() {
        let mut builder = Dmabuf::builder(64, 64, DrmFourcc::Xrgb8888, DrmModifier::Linear);
        builder.add_plane(fake_fd(), 1, 4096, 256);
        builder.add_plane(fake_fd(), 0, 0, 256);
        let dmabuf = builder.build().unwrap();
        assert_eq!(dmabuf.offsets().collect::<Vec<_>>(), vec![0, 4096]);
    }
}
