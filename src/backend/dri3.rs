//! DRI3/Present presenter.
//!
//! Swapchain images are DMA-BUF backed; `dri3_pixmap_from_buffers` turns the
//! plane-0 fd into a server-side pixmap once per image, and each present is a
//! single `present_pixmap` request against that pixmap.
//!
//! Presents use the Present extension's COPY option: the server copies the
//! pixmap contents immediately instead of sampling the client buffer during
//! later compositing, which would show frames the application has already
//! started overwriting.

use std::fs;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::dri3::{self, ConnectionExt as _};
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _};
use x11rb::rust_connection::RustConnection;

use crate::allocator::dmabuf::Dmabuf;
use crate::surface::X11Surface;

/// An error raised by the DRI3 presenter.
#[derive(Debug, thiserror::Error)]
pub enum Dri3Error {
    /// No usable DRM render node was found.
    #[error("no usable DRM render node")]
    NoRenderNode,

    /// The image carries no dmabuf planes.
    #[error("the image has no dmabuf planes")]
    NoPlanes,

    /// Duplicating a dmabuf file descriptor failed.
    #[error("duplicating the dmabuf file descriptor failed: {0}")]
    DupFailed(std::io::Error),

    /// The X server rejected the pixmap import.
    #[error("the X server rejected the pixmap")]
    PixmapRejected,

    /// The presenter has no valid connection or pixmap to present with.
    #[error("the surface has been lost")]
    SurfaceLost,

    /// Some protocol error occurred.
    #[error(transparent)]
    Protocol(#[from] x11rb::errors::ReplyOrIdError),

    /// The connection to the X server broke.
    #[error(transparent)]
    Connection(#[from] x11rb::errors::ConnectionError),
}

impl From<x11rb::errors::ReplyError> for Dri3Error {
    fn from(err: x11rb::errors::ReplyError) -> Self {
        Dri3Error::Protocol(err.into())
    }
}

/// Presents DMA-BUF backed pixmaps through the Present extension.
#[derive(Debug)]
pub struct Dri3Presenter {
    connection: Arc<RustConnection>,
    window: xproto::Window,
    depth: u8,
    render_node: OwnedFd,
}

impl Dri3Presenter {
    /// Whether DRI3 presentation can work on this connection.
    ///
    /// Requires DRI3 with major version ≥ 1, the Present extension, and the
    /// existence of a render node to fall back to if the server refuses to
    /// hand one off.
    pub fn is_available(connection: &RustConnection) -> bool {
        query_dri3_present(connection) && render_node_exists()
    }

    /// Open the render node and prepare the window for presentation.
    pub fn new(surface: &X11Surface, depth: u8) -> Result<Dri3Presenter, Dri3Error> {
        let connection = surface.connection().clone();
        let render_node = open_render_node(&connection, surface.root())?;

        Ok(Dri3Presenter {
            connection,
            window: surface.window(),
            depth,
            render_node,
        })
    }

    /// The render node fd, usable for DRM format queries.
    pub fn render_node(&self) -> BorrowedFd<'_> {
        use std::os::unix::io::AsFd;
        self.render_node.as_fd()
    }

    /// Create the server-side pixmap for one swapchain image.
    pub fn create_image_resources(&self, dmabuf: &Dmabuf) -> Result<xproto::Pixmap, Dri3Error> {
        let fd = dmabuf.handles().next().ok_or(Dri3Error::NoPlanes)?;
        let stride = dmabuf.strides().next().unwrap_or(0);
        let offset = dmabuf.offsets().next().unwrap_or(0);

        // The server takes ownership of the duplicate. Floor of 3 so the new
        // fd cannot shadow stdio.
        let server_fd = rustix::io::fcntl_dupfd_cloexec(fd, 3)
            .map_err(|errno| Dri3Error::DupFailed(errno.into()))?;

        let pixmap = self.connection.generate_id()?;
        self.connection.dri3_pixmap_from_buffers(
            pixmap,
            self.window,
            dmabuf.width() as u16,
            dmabuf.height() as u16,
            stride,
            offset,
            0,
            0,
            0,
            0,
            0,
            0,
            self.depth,
            32,
            dmabuf.modifier().into(),
            vec![server_fd.into()],
        )?;

        // Round-trip through GetGeometry so a failed import surfaces as an
        // error reply instead of poisoning a later request.
        if self.connection.get_geometry(pixmap)?.reply().is_err() {
            error!(pixmap, "pixmap_from_buffers was rejected by the X server");
            return Err(Dri3Error::PixmapRejected);
        }

        debug!(
            pixmap,
            width = dmabuf.width(),
            height = dmabuf.height(),
            fourcc = %dmabuf.fourcc(),
            modifier = u64::from(dmabuf.modifier()),
            "created DRI3 pixmap"
        );

        Ok(pixmap)
    }

    /// Submit a pixmap for immediate presentation and flush the connection.
    pub fn present_image(&self, pixmap: xproto::Pixmap, serial: u32) -> Result<(), Dri3Error> {
        if pixmap == x11rb::NONE {
            return Err(Dri3Error::SurfaceLost);
        }

        self.connection.present_pixmap(
            self.window,
            pixmap,
            serial,
            x11rb::NONE, // valid region: the whole pixmap
            x11rb::NONE, // update region: the whole pixmap
            0,           // no offsets
            0,
            x11rb::NONE, // the server picks the crtc
            x11rb::NONE, // no wait fence
            x11rb::NONE, // no idle fence
            present::Option::COPY.into(),
            0, // target msc: present immediately
            0,
            0,
            &[],
        )?;
        self.connection.flush()?;

        Ok(())
    }

    /// Free the pixmap backing an image.
    pub fn destroy_image_resources(&self, pixmap: xproto::Pixmap) {
        if pixmap != x11rb::NONE {
            let _ = self.connection.free_pixmap(pixmap);
        }
    }

    /// Drain pending X11 events into the void.
    ///
    /// COPY presents release the buffer at submission time, so nothing here
    /// needs tracking; draining keeps the shared connection's event queue
    /// from backing up.
    pub fn drain_events(&self) {
        while let Ok(Some(_event)) = self.connection.poll_for_event() {}
    }
}

fn query_dri3_present(connection: &RustConnection) -> bool {
    let has_dri3 = matches!(
        connection.extension_information(dri3::X11_EXTENSION_NAME),
        Ok(Some(_))
    );
    let has_present = matches!(
        connection.extension_information(present::X11_EXTENSION_NAME),
        Ok(Some(_))
    );
    if !has_dri3 || !has_present {
        return false;
    }

    let dri3_ok = connection
        .dri3_query_version(1, 2)
        .ok()
        .and_then(|cookie| cookie.reply().ok())
        .map(|reply| reply.major_version >= 1)
        .unwrap_or(false);
    let present_ok = connection
        .present_query_version(1, 2)
        .ok()
        .and_then(|cookie| cookie.reply().ok())
        .is_some();

    dri3_ok && present_ok
}

fn render_node_exists() -> bool {
    fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .flatten()
                .any(|entry| entry.file_name().to_string_lossy().starts_with("renderD"))
        })
        .unwrap_or(false)
}

fn open_render_node(
    connection: &RustConnection,
    root: xproto::Window,
) -> Result<OwnedFd, Dri3Error> {
    // Ask the server for its render node first.
    if let Ok(cookie) = connection.dri3_open(root, x11rb::NONE) {
        if let Ok(reply) = cookie.reply() {
            if reply.nfd >= 1 {
                let fd = reply.device_fd;
                let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) };
                let _ = rustix::io::fcntl_setfd(borrowed_fd, rustix::io::FdFlags::CLOEXEC);
                if let Ok(path) = fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd())) {
                    info!(node = %path.display(), "X server handed off its render node");
                }
                return Ok(unsafe { OwnedFd::from_raw_fd(fd.into_raw_fd()) });
            }
        }
    }

    warn!("dri3_open failed, scanning /dev/dri for render nodes");
    let entries = fs::read_dir("/dev/dri").map_err(|_| Dri3Error::NoRenderNode)?;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("renderD") {
            continue;
        }
        if let Ok(fd) = rustix::fs::open(
            entry.path(),
            rustix::fs::OFlags::RDWR | rustix::fs::OFlags::CLOEXEC,
            rustix::fs::Mode::empty(),
        ) {
            info!(node = %entry.path().display(), "opened render node");
            return Ok(fd);
        }
    }

    Err(Dri3Error::NoRenderNode)
}
