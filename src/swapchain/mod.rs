//! Swapchain orchestration.
//!
//! Per frame, the application acquires a free image, renders, and queues it
//! for presentation. A dedicated present worker drains that queue and
//! submits to the active presenter, so a present that has to wait (SHM
//! completion slots, display lock contention) never stalls the render loop.
//! Alongside both runs the event pump, one per swapchain, which services
//! display-server events until teardown clears its run flag.
//!
//! After a successful zero-copy present the image is not returned to the
//! free pool immediately; it cools down in the [`DeferredReleaseRing`] for
//! [`DEFER_FRAMES`] further presents. SHM presents are synchronous copies
//! and release immediately. A failed present releases immediately as well
//! and never enters the ring.
//!
//! Teardown order: stop the pump, stop the worker, drain the ring, destroy
//! per-image presentation artifacts, then the Vulkan images.

mod image;
pub(crate) mod pump;
mod ring;

pub use image::{ImageStatus, WaitResult, MAX_PENDING_COMPLETIONS};
pub use ring::{DeferredReleaseRing, DEFER_FRAMES};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ash::vk;
use tracing::{error, info, instrument, warn};
use x11rb::protocol::shm;

use self::image::ImagePool;
use crate::allocator::{
    AllocationFlags, AllocationRequest, CandidateFormat, DmabufAllocator, PlaneLayout,
};
use crate::backend::{PresentArtifact, Presenter, PresenterError, PresenterKind};
use crate::error::SwapchainError;
use crate::surface::{X11Surface, DEFAULT_DEPTH};
use crate::vulkan::{format as vk_format, DeviceContext, HostImage, ImageMemory, PresentFence};

/// How long the present worker parks between wakeups. The explicit notify on
/// enqueue and teardown is what actually drives it; the bound only caps how
/// stale a missed wakeup can go.
const WORKER_PARK: Duration = Duration::from_millis(250);

/// Upper bound on waiting for the GPU before a present is submitted anyway.
const PRESENT_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Parameters for creating a [`Swapchain`].
#[derive(Debug, Clone)]
pub struct SwapchainCreateInfo {
    /// Width of the swapchain images in pixels.
    pub width: u32,
    /// Height of the swapchain images in pixels.
    pub height: u32,
    /// Vulkan format of the images.
    pub format: vk::Format,
    /// Usage flags the images are created with.
    pub usage: vk::ImageUsageFlags,
    /// Number of images in the swapchain.
    pub image_count: u32,
}

/// A present request queued for the worker.
#[derive(Debug, Clone, Copy)]
struct PendingPresentRequest {
    image_index: usize,
}

/// The DRM format locked in by the first zero-copy image.
#[derive(Debug, Clone)]
struct NegotiatedFormat {
    format: CandidateFormat,
    plane_layouts: Vec<PlaneLayout>,
    memory_planes: u32,
    is_disjoint: bool,
}

/// Everything attached to one swapchain image.
struct ImageResources {
    image: vk::Image,
    artifact: Option<PresentArtifact>,
    memory: Option<ImageMemory>,
    host: Option<Arc<HostImage>>,
    fence: Option<Arc<PresentFence>>,
}

impl ImageResources {
    fn empty() -> ImageResources {
        ImageResources {
            image: vk::Image::null(),
            artifact: None,
            memory: None,
            host: None,
            fence: None,
        }
    }
}

struct WorkerQueue {
    pending: VecDeque<PendingPresentRequest>,
    running: bool,
}

/// State shared between the application thread, the present worker and the
/// event pump.
pub(crate) struct Shared {
    device: DeviceContext,
    pub(crate) presenter: Presenter,
    pub(crate) pool: ImagePool,
    resources: Mutex<Vec<ImageResources>>,
    ring: Mutex<DeferredReleaseRing>,
    deferred_release_enabled: bool,
    send_sbc: AtomicU64,
    queue: Mutex<WorkerQueue>,
    /// The page-flip wakeup: posted on enqueue and on teardown.
    queue_cond: Condvar,
    latched_error: Mutex<Option<SwapchainError>>,
    extent: (u32, u32),
}

impl Shared {
    /// Map an SHM segment back to its image index.
    pub(crate) fn image_for_segment(&self, seg: shm::Seg) -> Option<usize> {
        self.resources
            .lock()
            .unwrap()
            .iter()
            .position(|resources| match &resources.artifact {
                Some(PresentArtifact::Shm(stage)) => stage.seg() == seg,
                _ => false,
            })
    }

    fn next_serial(&self) -> u64 {
        next_serial(&self.send_sbc)
    }

    fn latch_error(&self, err: SwapchainError) {
        let mut latched = self.latched_error.lock().unwrap();
        if latched.is_none() {
            *latched = Some(err);
        }
    }

    /// Settle a successfully presented image: defer it on zero-copy paths,
    /// free it immediately otherwise.
    fn settle_presented(&self, index: usize) {
        if self.deferred_release_enabled {
            let evicted = self.ring.lock().unwrap().push(index);
            if let Some(cooled) = evicted {
                self.pool.release(cooled);
            }
        } else {
            self.pool.release(index);
        }
    }

    /// Submit one queued request to the active presenter. Runs on the worker.
    fn present_queued(&self, request: PendingPresentRequest) {
        let index = request.image_index;

        let (artifact, fence, host) = {
            let resources = self.resources.lock().unwrap();
            let Some(res) = resources.get(index) else {
                return;
            };
            (res.artifact.clone(), res.fence.clone(), res.host.clone())
        };

        // The server must not observe a frame the GPU is still writing.
        if let Some(fence) = &fence {
            if let Err(err) = fence.wait(PRESENT_FENCE_TIMEOUT_NS) {
                warn!("present fence wait failed: {err}");
            }
        }

        match (&self.presenter, artifact) {
            (Presenter::Bypass(bypass), Some(PresentArtifact::WaylandBuffer(buffer))) => {
                // Serials are per-swapchain even where the wire does not
                // carry them.
                let _serial = self.next_serial();
                match bypass.present_image(&buffer) {
                    Ok(()) => {
                        if bypass.surface_closed() {
                            self.latch_error(SwapchainError::SurfaceLost);
                        }
                        self.settle_presented(index);
                    }
                    Err(err) => {
                        error!("failed to present image {index} using bypass: {err}");
                        self.latch_error(SwapchainError::SurfaceLost);
                        self.pool.release(index);
                    }
                }
            }
            (Presenter::Dri3(dri3), Some(PresentArtifact::Pixmap(pixmap))) => {
                let serial = self.next_serial() as u32;
                match dri3.present_image(pixmap, serial) {
                    Ok(()) => self.settle_presented(index),
                    Err(err) => {
                        error!("failed to present image {index} using dri3: {err}");
                        self.latch_error(SwapchainError::SurfaceLost);
                        self.pool.release(index);
                    }
                }
            }
            (Presenter::Shm(shm), Some(PresentArtifact::Shm(stage))) => {
                // Bound the number of in-flight puts per image.
                if !self.pool.wait_completion_capacity(index) {
                    self.pool.release(index);
                    return;
                }

                let _serial = self.next_serial();
                let Some(host) = host else {
                    warn!("shm image {index} has no host mapping");
                    self.pool.release(index);
                    return;
                };
                match shm.present_image(&stage, &host, self.extent.0, self.extent.1) {
                    Ok(()) => self.pool.add_pending_completion(index),
                    Err(err) => {
                        error!("failed to present image {index} using shm: {err}");
                        self.latch_error(SwapchainError::SurfaceLost);
                    }
                }
                // The copy is synchronous; the image is reusable either way.
                self.pool.release(index);
            }
            _ => {
                warn!("image {index} has no presentation artifact");
                self.pool.release(index);
            }
        }
    }
}

/// Advance the swapchain's send sequence counter.
fn next_serial(send_sbc: &AtomicU64) -> u64 {
    send_sbc.fetch_add(1, Ordering::SeqCst) + 1
}

/// Release the server-side resource behind an artifact. SHM stages free
/// themselves when the last reference drops.
fn destroy_artifact(presenter: &Presenter, artifact: &PresentArtifact) {
    match (presenter, artifact) {
        (Presenter::Dri3(dri3), PresentArtifact::Pixmap(pixmap)) => {
            dri3.destroy_image_resources(*pixmap);
        }
        (Presenter::Bypass(bypass), PresentArtifact::WaylandBuffer(buffer)) => {
            bypass.destroy_image_resources(buffer);
        }
        _ => {}
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let request = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(request) = queue.pending.pop_front() {
                    break Some(request);
                }
                if !queue.running {
                    break None;
                }
                let (guard, _) = shared.queue_cond.wait_timeout(queue, WORKER_PARK).unwrap();
                queue = guard;
            }
        };

        let Some(request) = request else {
            break;
        };
        shared.present_queued(request);
    }
}

/// A swapchain presenting DMA-BUF or host-visible images to an X11 surface.
pub struct Swapchain {
    shared: Arc<Shared>,
    allocator: Mutex<Box<dyn DmabufAllocator>>,
    negotiated: Mutex<Option<NegotiatedFormat>>,
    create_info: SwapchainCreateInfo,
    depth: u8,
    pump: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("backend", &self.presenter.kind())
            .field("deferred_release_enabled", &self.deferred_release_enabled)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ImageResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageResources")
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("backend", &self.shared.presenter.kind())
            .field("create_info", &self.create_info)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Swapchain {
    /// Create the swapchain: select a backend, build every image, and start
    /// the event pump and present worker.
    #[instrument(skip_all, fields(width = create_info.width, height = create_info.height))]
    pub fn new(
        device: DeviceContext,
        surface: X11Surface,
        allocator: Box<dyn DmabufAllocator>,
        create_info: SwapchainCreateInfo,
    ) -> Result<Swapchain, SwapchainError> {
        let depth = match surface.size_and_depth() {
            Some((_, _, depth)) => depth,
            None => {
                warn!("could not query the surface depth, assuming {DEFAULT_DEPTH}");
                DEFAULT_DEPTH
            }
        };
        info!(depth, "presenting with visual depth");

        let presenter =
            Presenter::select(&surface, create_info.width, create_info.height, depth)?;
        let deferred_release_enabled = presenter.deferred_release();
        let image_count = create_info.image_count as usize;

        let shared = Arc::new(Shared {
            device,
            presenter,
            pool: ImagePool::new(image_count),
            resources: Mutex::new((0..image_count).map(|_| ImageResources::empty()).collect()),
            ring: Mutex::new(DeferredReleaseRing::new()),
            deferred_release_enabled,
            send_sbc: AtomicU64::new(0),
            queue: Mutex::new(WorkerQueue {
                pending: VecDeque::new(),
                running: true,
            }),
            queue_cond: Condvar::new(),
            latched_error: Mutex::new(None),
            extent: (create_info.width, create_info.height),
        });

        let pump = thread::Builder::new()
            .name("wsi-x11-pump".into())
            .spawn({
                let shared = shared.clone();
                move || pump::run(shared)
            })
            .map_err(|_| SwapchainError::InitializationFailed)?;
        let worker = thread::Builder::new()
            .name("wsi-x11-present".into())
            .spawn({
                let shared = shared.clone();
                move || run_worker(shared)
            })
            .map_err(|_| SwapchainError::InitializationFailed)?;

        let swapchain = Swapchain {
            shared,
            allocator: Mutex::new(allocator),
            negotiated: Mutex::new(None),
            create_info,
            depth,
            pump: Some(pump),
            worker: Some(worker),
        };

        for slot in 0..image_count {
            swapchain.create_image(slot)?;
            swapchain.allocate_and_bind(slot)?;
        }

        Ok(swapchain)
    }

    /// Which backend the selector settled on.
    pub fn backend_kind(&self) -> PresenterKind {
        self.shared.presenter.kind()
    }

    /// Whether presented images cool down in the deferred-release ring.
    pub fn deferred_release_enabled(&self) -> bool {
        self.shared.deferred_release_enabled
    }

    /// The visual depth presentation runs at.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The Vulkan image handle of slot `index`.
    pub fn image(&self, index: usize) -> vk::Image {
        self.shared.resources.lock().unwrap()[index].image
    }

    /// Create the Vulkan image for `slot`.
    ///
    /// The first zero-copy image negotiates the DRM fourcc and modifier by
    /// intersecting what the device can import with what the allocator can
    /// produce; all later images reuse the locked format.
    pub fn create_image(&self, slot: usize) -> Result<(), SwapchainError> {
        match self.shared.presenter.kind() {
            PresenterKind::Bypass | PresenterKind::Dri3 => self.create_dmabuf_image(slot),
            PresenterKind::Shm => Ok(()), // created together with its memory in allocate_and_bind
        }
    }

    fn create_dmabuf_image(&self, slot: usize) -> Result<(), SwapchainError> {
        let mut negotiated = self.negotiated.lock().unwrap();
        if negotiated.is_none() {
            let locked = self.negotiate_format()?;
            info!(
                fourcc = %locked.format.fourcc,
                modifier = u64::from(locked.format.modifier),
                disjoint = locked.is_disjoint,
                "locked swapchain dmabuf format"
            );
            *negotiated = Some(locked);
        }
        let negotiated = negotiated.as_ref().unwrap();

        let plane_layouts: Vec<vk::SubresourceLayout> = negotiated
            .plane_layouts
            .iter()
            .map(|layout| vk::SubresourceLayout {
                offset: u64::from(layout.offset),
                size: 0,
                row_pitch: u64::from(layout.stride),
                array_pitch: 0,
                depth_pitch: 0,
            })
            .collect();

        let image = self.shared.device.create_dmabuf_image(
            self.create_info.format,
            self.create_info.width,
            self.create_info.height,
            self.create_info.usage,
            negotiated.format.modifier.into(),
            &plane_layouts,
            negotiated.is_disjoint,
        )?;
        self.shared.resources.lock().unwrap()[slot].image = image;

        Ok(())
    }

    fn negotiate_format(&self) -> Result<NegotiatedFormat, SwapchainError> {
        let fourcc = vk_format::drm_fourcc(self.create_info.format)
            .ok_or(SwapchainError::FormatNotSupported)?;

        let props = self
            .shared
            .device
            .drm_format_modifier_properties(self.create_info.format);

        let mut candidates = Vec::new();
        for prop in &props {
            if !self.shared.device.is_modifier_importable(
                self.create_info.format,
                self.create_info.width,
                self.create_info.height,
                self.create_info.usage,
                prop.drm_format_modifier,
            ) {
                continue;
            }

            candidates.push(CandidateFormat {
                fourcc,
                modifier: prop.drm_format_modifier.into(),
                non_disjoint: !prop
                    .drm_format_modifier_tiling_features
                    .contains(vk::FormatFeatureFlags::DISJOINT),
            });
        }

        if candidates.is_empty() {
            error!("no importable dmabuf format for the requested vulkan format");
            return Err(SwapchainError::FormatNotSupported);
        }

        // The allocator settles on one candidate; probe only, no memory yet.
        let probe = self
            .allocator
            .lock()
            .unwrap()
            .allocate(&AllocationRequest {
                candidates: &candidates,
                width: self.create_info.width,
                height: self.create_info.height,
                flags: AllocationFlags::NO_MEMORY,
            })?;

        let memory_planes = props
            .iter()
            .find(|prop| u64::from(probe.format.modifier) == prop.drm_format_modifier)
            .map(|prop| prop.drm_format_modifier_plane_count)
            .unwrap_or(1)
            .max(probe.memory_planes);

        Ok(NegotiatedFormat {
            format: probe.format,
            plane_layouts: probe.plane_layouts,
            memory_planes,
            is_disjoint: probe.is_disjoint,
        })
    }

    /// Allocate backing memory for `slot` and bind it.
    ///
    /// On the zero-copy paths, the presenter's per-image artifact is built
    /// from duplicated fds *before* the Vulkan import, because the import
    /// consumes the originals.
    pub fn allocate_and_bind(&self, slot: usize) -> Result<(), SwapchainError> {
        match self.shared.presenter.kind() {
            PresenterKind::Bypass | PresenterKind::Dri3 => self.bind_dmabuf_image(slot),
            PresenterKind::Shm => self.bind_host_image(slot),
        }?;

        let fence = self.shared.device.create_present_fence()?;
        self.shared.resources.lock().unwrap()[slot].fence = Some(Arc::new(fence));
        self.shared.pool.set_status(slot, ImageStatus::Free);

        Ok(())
    }

    fn bind_dmabuf_image(&self, slot: usize) -> Result<(), SwapchainError> {
        let negotiated = self
            .negotiated
            .lock()
            .unwrap()
            .clone()
            .ok_or(SwapchainError::InitializationFailed)?;

        let allocation = self
            .allocator
            .lock()
            .unwrap()
            .allocate(&AllocationRequest {
                candidates: std::slice::from_ref(&negotiated.format),
                width: self.create_info.width,
                height: self.create_info.height,
                flags: AllocationFlags::empty(),
            })?;
        let dmabuf = allocation.buffer.ok_or(SwapchainError::OutOfHostMemory)?;

        let artifact = match &self.shared.presenter {
            Presenter::Bypass(bypass) => PresentArtifact::WaylandBuffer(
                bypass
                    .create_image_resources(slot, &dmabuf)
                    .map_err(PresenterError::from)?,
            ),
            Presenter::Dri3(dri3) => PresentArtifact::Pixmap(
                dri3.create_image_resources(&dmabuf)
                    .map_err(PresenterError::from)?,
            ),
            Presenter::Shm(_) => return Err(SwapchainError::InitializationFailed),
        };

        let image = self.shared.resources.lock().unwrap()[slot].image;
        let memory = match self.shared.device.import_and_bind(
            image,
            dmabuf,
            negotiated.is_disjoint,
            negotiated.memory_planes,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                // The server already holds the artifact; tear it down before
                // bailing or it outlives the failed slot.
                destroy_artifact(&self.shared.presenter, &artifact);
                return Err(err.into());
            }
        };

        let mut resources = self.shared.resources.lock().unwrap();
        resources[slot].artifact = Some(artifact);
        resources[slot].memory = Some(memory);

        Ok(())
    }

    fn bind_host_image(&self, slot: usize) -> Result<(), SwapchainError> {
        let Presenter::Shm(shm) = &self.shared.presenter else {
            return Err(SwapchainError::InitializationFailed);
        };

        let host = self.shared.device.create_host_image(
            self.create_info.format,
            self.create_info.width,
            self.create_info.height,
            self.create_info.usage,
        )?;
        let stage =
            shm.create_image_resources(self.create_info.height, host.row_pitch() as u32)
                .map_err(PresenterError::from)?;

        let mut resources = self.shared.resources.lock().unwrap();
        resources[slot].image = host.image();
        resources[slot].host = Some(Arc::new(host));
        resources[slot].artifact = Some(PresentArtifact::Shm(stage));

        Ok(())
    }

    /// Mark the first free image acquired and return its index.
    pub fn acquire_next_free(&self) -> Option<usize> {
        self.shared.pool.acquire_next_free()
    }

    /// Wait until at least one image is free.
    ///
    /// `0` polls, `u64::MAX` blocks until an image frees up or the pump
    /// stops, any other value is a deadline in nanoseconds.
    pub fn get_free_buffer(&self, timeout_ns: u64) -> WaitResult {
        self.shared.pool.wait_free(timeout_ns)
    }

    /// Current status of image `index`.
    pub fn image_status(&self, index: usize) -> ImageStatus {
        self.shared.pool.status(index)
    }

    /// Associate image `index`'s present fence with the submission that
    /// renders it.
    pub fn set_present_payload(
        &self,
        index: usize,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<(), SwapchainError> {
        let fence = self.shared.resources.lock().unwrap()[index].fence.clone();
        match fence {
            Some(fence) => Ok(fence.set_payload(queue, wait_semaphores)?),
            None => Err(SwapchainError::InitializationFailed),
        }
    }

    /// Wait for image `index`'s present fence.
    pub fn wait_present(&self, index: usize, timeout_ns: u64) -> Result<(), SwapchainError> {
        let fence = self.shared.resources.lock().unwrap()[index].fence.clone();
        match fence {
            Some(fence) => Ok(fence.wait(timeout_ns)?),
            None => Err(SwapchainError::InitializationFailed),
        }
    }

    /// Queue image `index` for presentation and wake the present worker.
    ///
    /// Failures observed by the worker on earlier frames (a lost surface,
    /// for instance) are reported here on the next call.
    pub fn present(&self, index: usize) -> Result<(), SwapchainError> {
        if let Some(err) = self.shared.latched_error.lock().unwrap().clone() {
            return Err(err);
        }

        self.shared.pool.set_status(index, ImageStatus::Presented);

        let mut queue = self.shared.queue.lock().unwrap();
        if !queue.running {
            return Err(SwapchainError::OutOfDate);
        }
        queue.pending.push_back(PendingPresentRequest { image_index: index });
        drop(queue);
        self.shared.queue_cond.notify_all();

        Ok(())
    }

    /// Destroy the resources of image `index`.
    pub fn destroy_image(&self, index: usize) {
        let mut resources = self.shared.resources.lock().unwrap();
        if let Some(res) = resources.get_mut(index) {
            Self::destroy_slot(&self.shared, index, res);
        }
    }

    fn destroy_slot(shared: &Shared, index: usize, res: &mut ImageResources) {
        shared.pool.invalidate(index);

        if let Some(artifact) = res.artifact.take() {
            destroy_artifact(&shared.presenter, &artifact);
        }

        res.fence = None;
        res.memory = None;

        if res.host.take().is_none() {
            // Host images own their vk::Image; dmabuf images are ours.
            shared.device.destroy_image(res.image);
        }
        res.image = vk::Image::null();
    }

    /// Tear the swapchain down.
    ///
    /// Stops and joins the pump and the worker, drains the deferred-release
    /// ring, then destroys per-image artifacts and Vulkan images. Safe to
    /// call more than once; [`Drop`] calls it as well.
    pub fn teardown(&mut self) {
        self.shared.pool.stop();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.running = false;
        }
        self.shared.queue_cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        for index in self.shared.ring.lock().unwrap().drain() {
            self.shared.pool.release(index);
        }

        let mut resources = self.shared.resources.lock().unwrap();
        for (index, res) in resources.iter_mut().enumerate() {
            Self::destroy_slot(&self.shared, index, res);
        }
        resources.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    use super::next_serial;

    #[test]
    fn serials_are_strictly_monotonic() {
        let counter = AtomicU64::new(0);
        let mut last = 0;
        for _ in 0..64 {
            let serial = next_serial(&counter);
            assert!(serial > last);
            last = serial;
        }
    }

    #[test]
    fn serials_never_collide_across_threads() {
        let counter = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || (0..256).map(|_| next_serial(&counter)).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4 * 256);
    }
}
