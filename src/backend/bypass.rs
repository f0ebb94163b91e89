//! Xwayland bypass presenter.
//!
//! When the X server is Xwayland, every frame already ends up in the hands
//! of a Wayland compositor. Instead of routing DMA-BUFs through Xwayland's
//! DRI3 implementation, this presenter connects to the compositor itself,
//! creates an `xdg_toplevel`, and attaches the swapchain's buffers through
//! `zwp_linux_dmabuf_v1`, the same zero-copy path a native Wayland client
//! would take.
//!
//! Two locks are involved. The display lock serializes everything that
//! touches the connection (attach/commit/flush and event dispatch). The
//! release lock guards only the list of released buffers; `wl_buffer.release`
//! callbacks run inside `dispatch_pending` while the dispatching thread holds
//! the display lock, so they must take only the release lock. The display
//! lock is never acquired while the release lock is held.

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::{env, fmt, io};

use drm_fourcc::DrmFourcc;
use tracing::{debug, error, info, trace};
use wayland_client::backend::WaylandError;
use wayland_client::protocol::{wl_buffer, wl_compositor, wl_registry, wl_surface};
use wayland_client::{
    delegate_noop, Connection, Dispatch, DispatchError, EventQueue, QueueHandle,
};
use wayland_protocols::wp::linux_dmabuf::zv1::client::{
    zwp_linux_buffer_params_v1, zwp_linux_dmabuf_v1,
};
use wayland_protocols::xdg::decoration::zv1::client::{
    zxdg_decoration_manager_v1, zxdg_toplevel_decoration_v1,
};
use wayland_protocols::xdg::shell::client::{xdg_surface, xdg_toplevel, xdg_wm_base};

use super::select;
use crate::allocator::dmabuf::Dmabuf;

/// An error raised by the bypass presenter.
#[derive(Debug, thiserror::Error)]
pub enum BypassError {
    /// The bypass was disabled through the environment.
    #[error("the wayland bypass is disabled")]
    Disabled,

    /// No Wayland compositor is reachable.
    #[error("no wayland compositor is reachable")]
    NoCompositor,

    /// A required global is missing from the compositor's registry.
    #[error("required wayland global {0} is missing")]
    MissingGlobal(&'static str),

    /// The image carries no dmabuf planes.
    #[error("the image has no dmabuf planes")]
    NoPlanes,

    /// Event dispatch failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// An I/O error on the display fd.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The compositor connection is gone or the toplevel was closed.
    #[error("the surface has been lost")]
    SurfaceLost,
}

/// Protocol state bound while the registry is enumerated, plus the surface
/// role objects created during configuration.
struct State {
    compositor: Option<wl_compositor::WlCompositor>,
    wm_base: Option<xdg_wm_base::XdgWmBase>,
    dmabuf: Option<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>,
    decoration_manager: Option<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1>,

    surface: Option<wl_surface::WlSurface>,
    xdg_surface: Option<xdg_surface::XdgSurface>,
    toplevel: Option<xdg_toplevel::XdgToplevel>,
    decoration: Option<zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1>,

    configured: bool,
    closed: bool,
    width: u32,
    height: u32,

    released: Arc<Mutex<Vec<usize>>>,
}

struct DisplayInner {
    queue: EventQueue<State>,
    state: State,
}

/// Presents DMA-BUF buffers directly to the Wayland compositor underneath
/// Xwayland.
pub struct BypassPresenter {
    conn: Connection,
    /// The display lock.
    display: Mutex<DisplayInner>,
    /// The release lock.
    released: Arc<Mutex<Vec<usize>>>,
}

impl fmt::Debug for BypassPresenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BypassPresenter").finish_non_exhaustive()
    }
}

impl BypassPresenter {
    /// Connect to the compositor, bind the required globals, create the
    /// toplevel and wait for its first configure.
    pub fn new(width: u32, height: u32) -> Result<BypassPresenter, BypassError> {
        if select::bypass_disabled() {
            return Err(BypassError::Disabled);
        }

        let conn = connect()?;
        info!("connected to the wayland compositor");

        let mut queue = conn.new_event_queue();
        let qh = queue.handle();
        let _registry = conn.display().get_registry(&qh, ());

        let released = Arc::new(Mutex::new(Vec::new()));
        let mut state = State {
            compositor: None,
            wm_base: None,
            dmabuf: None,
            decoration_manager: None,
            surface: None,
            xdg_surface: None,
            toplevel: None,
            decoration: None,
            configured: false,
            closed: false,
            width,
            height,
            released: released.clone(),
        };

        // One blocking roundtrip enumerates the globals.
        queue.roundtrip(&mut state)?;

        let compositor = state
            .compositor
            .clone()
            .ok_or(BypassError::MissingGlobal("wl_compositor"))?;
        let wm_base = state
            .wm_base
            .clone()
            .ok_or(BypassError::MissingGlobal("xdg_wm_base"))?;
        state
            .dmabuf
            .as_ref()
            .ok_or(BypassError::MissingGlobal("zwp_linux_dmabuf_v1"))?;

        let surface = compositor.create_surface(&qh, ());
        let xdg_surface = wm_base.get_xdg_surface(&surface, &qh, ());
        let toplevel = xdg_surface.get_toplevel(&qh, ());
        toplevel.set_title("Vulkan (Xwayland bypass)".into());
        toplevel.set_app_id("vulkan-xwayland-bypass".into());

        if let Some(manager) = &state.decoration_manager {
            let decoration = manager.get_toplevel_decoration(&toplevel, &qh, ());
            decoration.set_mode(zxdg_toplevel_decoration_v1::Mode::ServerSide);
            state.decoration = Some(decoration);
        }

        state.surface = Some(surface.clone());
        state.xdg_surface = Some(xdg_surface);
        state.toplevel = Some(toplevel);

        // Commit the bare surface to solicit the initial configure.
        surface.commit();
        conn.flush().map_err(wire_error)?;

        while !state.configured {
            if state.closed {
                return Err(BypassError::SurfaceLost);
            }
            queue.blocking_dispatch(&mut state)?;
        }

        // From here on the pump reads with the display lock held; the socket
        // must never block underneath it. Before the configure, blocking
        // roundtrips are exactly what we want, hence the late switch.
        set_nonblocking(&conn)?;

        info!(width, height, "xwayland bypass ready, zero-copy dmabuf presentation");

        Ok(BypassPresenter {
            conn,
            display: Mutex::new(DisplayInner { queue, state }),
            released,
        })
    }

    /// Create the `wl_buffer` artifact for swapchain image `index`.
    pub fn create_image_resources(
        &self,
        index: usize,
        dmabuf: &Dmabuf,
    ) -> Result<wl_buffer::WlBuffer, BypassError> {
        let inner = self.display.lock().unwrap();
        let qh = inner.queue.handle();
        let dmabuf_global = inner
            .state
            .dmabuf
            .as_ref()
            .ok_or(BypassError::MissingGlobal("zwp_linux_dmabuf_v1"))?;

        let fd = dmabuf.handles().next().ok_or(BypassError::NoPlanes)?;
        let stride = dmabuf.strides().next().unwrap_or(0);
        let offset = dmabuf.offsets().next().unwrap_or(0);
        let modifier = u64::from(dmabuf.modifier());
        let fourcc = opaque_fourcc(dmabuf.fourcc());

        let params = dmabuf_global.create_params(&qh, ());
        params.add(
            fd,
            0,
            offset,
            stride,
            (modifier >> 32) as u32,
            modifier as u32,
        );
        let buffer = params.create_immed(
            dmabuf.width() as i32,
            dmabuf.height() as i32,
            fourcc as u32,
            zwp_linux_buffer_params_v1::Flags::empty(),
            &qh,
            index,
        );
        params.destroy();

        debug!(
            index,
            width = dmabuf.width(),
            height = dmabuf.height(),
            fourcc = %fourcc,
            modifier,
            "created wl_buffer for swapchain image"
        );

        Ok(buffer)
    }

    /// Attach, damage, commit and flush, all under the display lock.
    pub fn present_image(&self, buffer: &wl_buffer::WlBuffer) -> Result<(), BypassError> {
        let inner = self.display.lock().unwrap();

        let surface = inner.state.surface.as_ref().ok_or(BypassError::SurfaceLost)?;
        surface.attach(Some(buffer), 0, 0);
        surface.damage_buffer(0, 0, i32::MAX, i32::MAX);
        surface.commit();

        self.conn.flush().map_err(|err| {
            error!("wl_display flush failed: {err}");
            BypassError::SurfaceLost
        })
    }

    /// Whether the compositor asked the toplevel to close.
    ///
    /// Presents keep succeeding after that; the swapchain is expected to
    /// retire the surface instead.
    pub fn surface_closed(&self) -> bool {
        self.display.lock().unwrap().state.closed
    }

    /// One non-blocking dispatch cycle, returning the indices of buffers the
    /// compositor released since the last call.
    pub fn dispatch_and_get_releases(&self) -> Vec<usize> {
        {
            let mut inner = self.display.lock().unwrap();
            let _ = self.conn.flush();

            let DisplayInner { queue, state } = &mut *inner;
            // prepare_read only succeeds once the queue is empty.
            loop {
                match queue.prepare_read() {
                    Some(guard) => {
                        match guard.read() {
                            Ok(_) => {}
                            // The fd is non-blocking; nothing to read is routine.
                            Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                            Err(err) => trace!("wayland read failed: {err}"),
                        }
                        let _ = queue.dispatch_pending(state);
                        break;
                    }
                    None => {
                        let _ = queue.dispatch_pending(state);
                    }
                }
            }
        }

        std::mem::take(&mut *self.released.lock().unwrap())
    }

    /// Destroy the buffer backing an image.
    pub fn destroy_image_resources(&self, buffer: &wl_buffer::WlBuffer) {
        let _inner = self.display.lock().unwrap();
        buffer.destroy();
    }
}

impl Drop for BypassPresenter {
    fn drop(&mut self) {
        let inner = self.display.get_mut().unwrap();
        let state = &mut inner.state;

        if let Some(decoration) = state.decoration.take() {
            decoration.destroy();
        }
        if let Some(toplevel) = state.toplevel.take() {
            toplevel.destroy();
        }
        if let Some(xdg_surface) = state.xdg_surface.take() {
            xdg_surface.destroy();
        }
        if let Some(surface) = state.surface.take() {
            surface.destroy();
        }
        if let Some(dmabuf) = state.dmabuf.take() {
            dmabuf.destroy();
        }
        if let Some(wm_base) = state.wm_base.take() {
            wm_base.destroy();
        }
        let _ = self.conn.flush();
    }
}

fn connect() -> Result<Connection, BypassError> {
    if let Ok(conn) = Connection::connect_to_env() {
        return Ok(conn);
    }

    // The app may have scrubbed WAYLAND_DISPLAY to force X11; a compositor
    // can still be listening on the canonical socket.
    let runtime_dir = env::var_os("XDG_RUNTIME_DIR").ok_or(BypassError::NoCompositor)?;
    let stream = UnixStream::connect(Path::new(&runtime_dir).join("wayland-0"))
        .map_err(|_| BypassError::NoCompositor)?;
    Connection::from_socket(stream).map_err(|_| BypassError::NoCompositor)
}

fn set_nonblocking(conn: &Connection) -> Result<(), BypassError> {
    let backend = conn.backend();
    let fd = backend.poll_fd();
    let flags = rustix::fs::fcntl_getfl(fd).map_err(io::Error::from)?;
    rustix::fs::fcntl_setfl(fd, flags | rustix::fs::OFlags::NONBLOCK).map_err(io::Error::from)?;
    Ok(())
}

fn wire_error(err: WaylandError) -> BypassError {
    match err {
        WaylandError::Io(err) => BypassError::Io(err),
        WaylandError::Protocol(_) => BypassError::SurfaceLost,
    }
}

/// Alpha-carrying codes are presented as their opaque siblings so the
/// compositor does not blend the window with whatever is behind it.
fn opaque_fourcc(fourcc: DrmFourcc) -> DrmFourcc {
    match fourcc {
        DrmFourcc::Argb8888 => DrmFourcc::Xrgb8888,
        DrmFourcc::Abgr8888 => DrmFourcc::Xbgr8888,
        other => other,
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for State {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        {
            match interface.as_str() {
                "wl_compositor" => {
                    state.compositor = Some(registry.bind::<wl_compositor::WlCompositor, _, _>(
                        name,
                        version.min(4),
                        qh,
                        (),
                    ));
                }
                "xdg_wm_base" => {
                    state.wm_base =
                        Some(registry.bind::<xdg_wm_base::XdgWmBase, _, _>(name, 1, qh, ()));
                }
                "zwp_linux_dmabuf_v1" => {
                    state.dmabuf = Some(
                        registry.bind::<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1, _, _>(
                            name,
                            version.min(3),
                            qh,
                            (),
                        ),
                    );
                }
                "zxdg_decoration_manager_v1" => {
                    state.decoration_manager = Some(
                        registry
                            .bind::<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1, _, _>(
                                name,
                                1,
                                qh,
                                (),
                            ),
                    );
                }
                _ => {}
            }
        }
    }
}

impl Dispatch<xdg_wm_base::XdgWmBase, ()> for State {
    fn event(
        _state: &mut Self,
        wm_base: &xdg_wm_base::XdgWmBase,
        event: xdg_wm_base::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_wm_base::Event::Ping { serial } = event {
            wm_base.pong(serial);
        }
    }
}

impl Dispatch<xdg_surface::XdgSurface, ()> for State {
    fn event(
        state: &mut Self,
        xdg_surface: &xdg_surface::XdgSurface,
        event: xdg_surface::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let xdg_surface::Event::Configure { serial } = event {
            xdg_surface.ack_configure(serial);
            state.configured = true;
        }
    }
}

impl Dispatch<xdg_toplevel::XdgToplevel, ()> for State {
    fn event(
        state: &mut Self,
        _toplevel: &xdg_toplevel::XdgToplevel,
        event: xdg_toplevel::Event,
        _: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        match event {
            xdg_toplevel::Event::Configure { width, height, .. } => {
                if width > 0 && height > 0 {
                    state.width = width as u32;
                    state.height = height as u32;
                    debug!(width = state.width, height = state.height, "toplevel configured");
                }
            }
            xdg_toplevel::Event::Close => {
                info!("compositor requested toplevel close");
                state.closed = true;
            }
            _ => {}
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, usize> for State {
    fn event(
        state: &mut Self,
        _buffer: &wl_buffer::WlBuffer,
        event: wl_buffer::Event,
        index: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            // The dispatching thread holds the display lock; only the release
            // lock may be taken here.
            state.released.lock().unwrap().push(*index);
        }
    }
}

delegate_noop!(State: ignore wl_compositor::WlCompositor);
delegate_noop!(State: ignore wl_surface::WlSurface);
delegate_noop!(State: ignore zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1);
delegate_noop!(State: ignore zwp_linux_buffer_params_v1::ZwpLinuxBufferParamsV1);
delegate_noop!(State: ignore zxdg_decoration_manager_v1::ZxdgDecorationManagerV1);
delegate_noop!(State: ignore zxdg_toplevel_decoration_v1::ZxdgToplevelDecorationV1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_codes_are_remapped_to_opaque() {
        assert_eq!(opaque_fourcc(DrmFourcc::Argb8888), DrmFourcc::Xrgb8888);
        assert_eq!(opaque_fourcc(DrmFourcc::Abgr8888), DrmFourcc::Xbgr8888);
    }

    #[test]
    fn opaque_codes_pass_through() {
        assert_eq!(opaque_fourcc(DrmFourcc::Xrgb8888), DrmFourcc::Xrgb8888);
        assert_eq!(opaque_fourcc(DrmFourcc::Nv12), DrmFourcc::Nv12);
    }
}
