//! The X11 surface a swapchain presents to.
//!
//! The surface object (connection, window, geometry) is owned by the
//! embedding layer; this is the narrow handle the presentation engine needs
//! from it.

use std::sync::Arc;

use tracing::warn;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{self, ConnectionExt as _};
use x11rb::rust_connection::RustConnection;

/// The visual depth assumed when the surface cannot be queried.
pub const DEFAULT_DEPTH: u8 = 24;

/// A handle to the X11 window a swapchain presents to.
#[derive(Debug, Clone)]
pub struct X11Surface {
    connection: Arc<RustConnection>,
    window: xproto::Window,
    screen: usize,
}

impl X11Surface {
    /// Wrap an existing connection and window.
    pub fn new(connection: Arc<RustConnection>, window: xproto::Window, screen: usize) -> X11Surface {
        X11Surface {
            connection,
            window,
            screen,
        }
    }

    /// The underlying connection to the X server.
    pub fn connection(&self) -> &Arc<RustConnection> {
        &self.connection
    }

    /// The XID of the window.
    pub fn window(&self) -> xproto::Window {
        self.window
    }

    /// The root window of the surface's screen.
    pub fn root(&self) -> xproto::Window {
        self.connection.setup().roots[self.screen].root
    }

    /// Window geometry and visual depth, when the server will tell us.
    pub fn size_and_depth(&self) -> Option<(u32, u32, u8)> {
        let geometry = self
            .connection
            .get_geometry(self.window)
            .ok()?
            .reply()
            .ok()?;

        Some((
            u32::from(geometry.width),
            u32::from(geometry.height),
            geometry.depth,
        ))
    }

    /// Hide the X11 window.
    ///
    /// Used when the bypass engages, so the compositor's Wayland toplevel is
    /// the only visible surface.
    pub fn unmap(&self) {
        let unmapped = self
            .connection
            .unmap_window(self.window)
            .and_then(|_| self.connection.flush());
        if let Err(err) = unmapped {
            warn!("failed to unmap the X11 window: {err}");
        }
    }
}
