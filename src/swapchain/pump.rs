//! The event-pump thread.
//!
//! One pump runs per swapchain and exits when the pool's run flag clears.
//! What it does depends on the backend:
//!
//! - **bypass**: a ~16 ms tick does one non-blocking read/dispatch cycle on
//!   the Wayland display. Image reuse is gated by the deferred-release ring,
//!   not by `wl_buffer.release`, so the pump's job is answering pings and
//!   configures and keeping the event queue from backing up.
//! - **dri3**: a ~4 ms tick drains all pending X11 events into the void;
//!   COPY presents need no release tracking.
//! - **shm**: parks on the pool until some image has in-flight completions,
//!   then drains completion events with a 1 ms poll until they are gone.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, trace};
use x11rb::connection::Connection;
use x11rb::protocol::Event;

use super::Shared;
use crate::backend::{shm::ShmPresenter, Presenter};

const BYPASS_TICK: Duration = Duration::from_millis(16);
const DRI3_TICK: Duration = Duration::from_millis(4);
const SHM_POLL: Duration = Duration::from_millis(1);

pub(crate) fn run(shared: Arc<Shared>) {
    info!(backend = %shared.presenter.kind(), "event pump started");

    while shared.pool.is_running() {
        match &shared.presenter {
            Presenter::Bypass(bypass) => {
                let released = bypass.dispatch_and_get_releases();
                if !released.is_empty() {
                    trace!(count = released.len(), "compositor released buffers");
                }
                shared.pool.wait_tick(BYPASS_TICK);
            }
            Presenter::Dri3(dri3) => {
                dri3.drain_events();
                shared.pool.wait_tick(DRI3_TICK);
            }
            Presenter::Shm(shm) => {
                if !shared.pool.any_pending_completions() {
                    shared.pool.wait_any_pending();
                    continue;
                }
                drain_completions(&shared, shm);
                thread::sleep(SHM_POLL);
            }
        }
    }

    // Redundant when stop() initiated the shutdown, but makes the exit
    // observable if the pump ever bails on its own.
    shared.pool.stop();
    info!("event pump stopped");
}

fn drain_completions(shared: &Shared, shm: &ShmPresenter) {
    while let Ok(Some(event)) = shm.connection().poll_for_event() {
        if let Event::ShmCompletion(completion) = event {
            if let Some(index) = shared.image_for_segment(completion.shmseg) {
                shared.pool.complete_one(index);
            }
        }
    }
}
