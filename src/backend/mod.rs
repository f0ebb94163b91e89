//! Presentation backends.
//!
//! A presenter turns a DMA-BUF backed swapchain image into something a
//! display server will show: an X11 pixmap ([`dri3`]), a compositor buffer
//! ([`bypass`]) or a shared-memory staging copy ([`shm`]). All three expose
//! the same capability set (availability probe, init, per-image resource
//! creation, present, per-image teardown) and exactly one of them is chosen
//! when the swapchain is created.
//!
//! There is no dynamic dispatch on the hot path; the selected presenter is a
//! variant of [`Presenter`] held for the swapchain's lifetime.

pub mod bypass;
pub mod dri3;
pub(crate) mod select;
pub mod shm;

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};
use wayland_client::protocol::wl_buffer;
use x11rb::protocol::xproto;

use self::bypass::{BypassError, BypassPresenter};
use self::dri3::{Dri3Error, Dri3Presenter};
use self::shm::{ShmError, ShmPresenter, ShmStage};
use crate::error::SwapchainError;
use crate::surface::X11Surface;

/// Identifies a presentation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterKind {
    /// Direct-to-compositor Wayland presentation underneath Xwayland.
    Bypass,
    /// DRI3 pixmaps presented through the Present extension.
    Dri3,
    /// MIT-SHM software copies.
    Shm,
}

impl fmt::Display for PresenterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PresenterKind::Bypass => "bypass",
            PresenterKind::Dri3 => "dri3",
            PresenterKind::Shm => "shm",
        })
    }
}

/// The artifact a presenter attaches to a swapchain image.
///
/// Only the variant matching the swapchain's presenter is ever constructed.
#[derive(Debug, Clone)]
pub enum PresentArtifact {
    /// X11 pixmap backed by the image's dmabuf.
    Pixmap(xproto::Pixmap),
    /// Compositor buffer handle on the bypass path.
    WaylandBuffer(wl_buffer::WlBuffer),
    /// Shared-memory staging segment for the software path.
    Shm(Arc<ShmStage>),
}

/// An error from whichever presenter is active.
#[derive(Debug, thiserror::Error)]
pub enum PresenterError {
    /// The bypass presenter failed.
    #[error(transparent)]
    Bypass(#[from] BypassError),

    /// The DRI3 presenter failed.
    #[error(transparent)]
    Dri3(#[from] Dri3Error),

    /// The SHM presenter failed.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

impl PresenterError {
    /// Whether the error means the surface is gone rather than a transient
    /// or resource failure.
    pub fn is_surface_lost(&self) -> bool {
        matches!(
            self,
            PresenterError::Bypass(BypassError::SurfaceLost)
                | PresenterError::Dri3(Dri3Error::SurfaceLost)
        )
    }
}

impl From<PresenterError> for SwapchainError {
    fn from(err: PresenterError) -> Self {
        match err {
            // Allocation-time failures (fd duplication, segment creation,
            // display I/O) are resource exhaustion, not a broken backend.
            PresenterError::Dri3(Dri3Error::DupFailed(_))
            | PresenterError::Shm(ShmError::Io(_))
            | PresenterError::Bypass(BypassError::Io(_)) => SwapchainError::OutOfHostMemory,
            err if err.is_surface_lost() => SwapchainError::SurfaceLost,
            _ => SwapchainError::InitializationFailed,
        }
    }
}

/// The presenter selected for a swapchain.
#[derive(Debug)]
pub enum Presenter {
    /// See [`BypassPresenter`].
    Bypass(BypassPresenter),
    /// See [`Dri3Presenter`].
    Dri3(Dri3Presenter),
    /// See [`ShmPresenter`].
    Shm(ShmPresenter),
}

impl Presenter {
    /// Run backend selection for `surface`.
    ///
    /// The preference comes from the routing table or the zink probes; each
    /// backend in the resulting chain is attempted in turn and the first one
    /// whose init completes wins. SHM is the floor: if even it fails, the
    /// whole swapchain creation fails.
    pub fn select(
        surface: &X11Surface,
        width: u32,
        height: u32,
        depth: u8,
    ) -> Result<Presenter, SwapchainError> {
        let preferred = select::preferred_backend();

        for kind in select::fallback_chain(preferred) {
            match kind {
                PresenterKind::Bypass => match BypassPresenter::new(width, height) {
                    Ok(presenter) => {
                        // The compositor now draws the toplevel; hide the X11
                        // window underneath it.
                        surface.unmap();
                        info!(width, height, "selected the wayland bypass presenter");
                        return Ok(Presenter::Bypass(presenter));
                    }
                    Err(err) => info!("wayland bypass unavailable: {err}"),
                },
                PresenterKind::Dri3 => {
                    if !Dri3Presenter::is_available(surface.connection()) {
                        info!("dri3 presentation not available");
                        continue;
                    }
                    match Dri3Presenter::new(surface, depth) {
                        Ok(presenter) => {
                            info!("selected the dri3 presenter");
                            return Ok(Presenter::Dri3(presenter));
                        }
                        Err(err) => warn!("dri3 init failed: {err}"),
                    }
                }
                PresenterKind::Shm => match ShmPresenter::new(surface, depth) {
                    Ok(presenter) => {
                        info!("selected the shm fallback presenter");
                        return Ok(Presenter::Shm(presenter));
                    }
                    Err(err) => {
                        error!("shm fallback failed: {err}");
                        return Err(SwapchainError::InitializationFailed);
                    }
                },
            }
        }

        Err(SwapchainError::InitializationFailed)
    }

    /// Which backend this is.
    pub fn kind(&self) -> PresenterKind {
        match self {
            Presenter::Bypass(_) => PresenterKind::Bypass,
            Presenter::Dri3(_) => PresenterKind::Dri3,
            Presenter::Shm(_) => PresenterKind::Shm,
        }
    }

    /// Whether presented images go through the deferred-release ring.
    ///
    /// Both zero-copy paths hand the server memory it may keep reading after
    /// the present returns. DRI3's COPY option releases immediately in
    /// principle, but servers have been observed re-reading, so the ring
    /// covers both uniformly.
    pub fn deferred_release(&self) -> bool {
        matches!(self, Presenter::Bypass(_) | Presenter::Dri3(_))
    }
}
