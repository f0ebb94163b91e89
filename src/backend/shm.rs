//! MIT-SHM software presenter.
//!
//! The concurrency baseline of the three backends: `present_image` copies the
//! rendered frame from the image's host-visible mapping into a shared memory
//! segment and issues a `PutImage`, after which the image is immediately
//! reusable. No deferred ring, no asynchronous release; completion events
//! are only counted to bound how many puts may be in flight.

use std::os::unix::io::OwnedFd;
use std::sync::Arc;
use std::{fmt, io, ptr};

use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use tracing::debug;
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _, CreateGCAux, ImageFormat};
use x11rb::rust_connection::RustConnection;

use crate::surface::X11Surface;
use crate::vulkan::HostImage;

/// An error raised by the SHM presenter.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The MIT-SHM extension is not available.
    #[error("the MIT-SHM extension is not available")]
    NotAvailable,

    /// Creating or mapping the shared segment failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Some protocol error occurred.
    #[error(transparent)]
    Protocol(#[from] x11rb::errors::ReplyOrIdError),

    /// The connection to the X server broke.
    #[error(transparent)]
    Connection(#[from] x11rb::errors::ConnectionError),
}

/// Shared memory staging segment for one swapchain image.
pub struct ShmStage {
    connection: Arc<RustConnection>,
    seg: shm::Seg,
    ptr: *mut u8,
    len: usize,
    stride: u32,
    /// Keeps the memfd alive for the lifetime of the image.
    _fd: OwnedFd,
}

// SAFETY: the mapping is written by the present worker only; the X server
// reads it out-of-process. Completion accounting orders reuse.
unsafe impl Send for ShmStage {}
unsafe impl Sync for ShmStage {}

impl ShmStage {
    /// The segment id registered with the X server.
    pub fn seg(&self) -> shm::Seg {
        self.seg
    }

    /// Row stride of the segment in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }
}

impl fmt::Debug for ShmStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmStage")
            .field("seg", &self.seg)
            .field("len", &self.len)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

impl Drop for ShmStage {
    fn drop(&mut self) {
        let _ = self.connection.shm_detach(self.seg);
        let _ = self.connection.flush();
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.cast(), self.len);
        }
    }
}

/// Presents by copying into MIT-SHM segments.
#[derive(Debug)]
pub struct ShmPresenter {
    connection: Arc<RustConnection>,
    window: xproto::Window,
    gc: xproto::Gcontext,
    depth: u8,
}

impl ShmPresenter {
    /// Whether the server supports MIT-SHM.
    pub fn is_available(connection: &RustConnection) -> bool {
        if !matches!(
            connection.extension_information(shm::X11_EXTENSION_NAME),
            Ok(Some(_))
        ) {
            return false;
        }

        connection
            .shm_query_version()
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some()
    }

    /// Create the graphics context used for the puts.
    pub fn new(surface: &X11Surface, depth: u8) -> Result<ShmPresenter, ShmError> {
        let connection = surface.connection().clone();
        if !Self::is_available(&connection) {
            return Err(ShmError::NotAvailable);
        }

        let gc = connection.generate_id()?;
        connection.create_gc(
            gc,
            surface.window(),
            &CreateGCAux::new().graphics_exposures(0),
        )?;

        Ok(ShmPresenter {
            connection,
            window: surface.window(),
            gc,
            depth,
        })
    }

    /// The shared X11 connection; the pump drains completion events from it.
    pub fn connection(&self) -> &Arc<RustConnection> {
        &self.connection
    }

    /// Allocate the staging segment for one image and register it with the
    /// server. Segment size is `stride × height`.
    pub fn create_image_resources(
        &self,
        height: u32,
        stride: u32,
    ) -> Result<Arc<ShmStage>, ShmError> {
        let len = stride as usize * height as usize;

        let fd = rustix::fs::memfd_create("wsi-x11-shm", MemfdFlags::CLOEXEC)
            .map_err(io::Error::from)?;
        rustix::fs::ftruncate(&fd, len as u64).map_err(io::Error::from)?;

        let mapping = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(io::Error::from)?;

        // The server consumes its own duplicate of the fd.
        let server_fd = rustix::io::fcntl_dupfd_cloexec(&fd, 3).map_err(io::Error::from)?;
        let seg = self.connection.generate_id()?;
        self.connection.shm_attach_fd(seg, server_fd, false)?;
        self.connection.flush()?;

        debug!(seg, len, stride, "created shm staging segment");

        Ok(Arc::new(ShmStage {
            connection: self.connection.clone(),
            seg,
            ptr: mapping as *mut u8,
            len,
            stride,
            _fd: fd,
        }))
    }

    /// Copy the frame into the segment and put it on the window.
    ///
    /// Synchronous from the caller's point of view: once this returns the
    /// image may be rendered to again. A completion event is requested so
    /// in-flight puts can be counted.
    pub fn present_image(
        &self,
        stage: &ShmStage,
        source: &HostImage,
        width: u32,
        height: u32,
    ) -> Result<(), ShmError> {
        let row_len = (stage.stride as usize).min(source.row_pitch());
        for row in 0..height as usize {
            unsafe {
                ptr::copy_nonoverlapping(
                    source.ptr().add(row * source.row_pitch()),
                    stage.ptr.add(row * stage.stride as usize),
                    row_len,
                );
            }
        }

        self.connection.shm_put_image(
            self.window,
            self.gc,
            width as u16,
            height as u16,
            0,
            0,
            width as u16,
            height as u16,
            0,
            0,
            self.depth,
            ImageFormat::Z_PIXMAP.into(),
            true, // completion event
            stage.seg,
            0,
        )?;
        self.connection.flush()?;

        Ok(())
    }
}
