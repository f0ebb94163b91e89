#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like DRI3
#![allow(clippy::upper_case_acronyms)]

//! **wsi-x11: a Vulkan presentation engine for X11 surfaces**
//!
//! This crate implements the presentation half of a Vulkan WSI swapchain for
//! X11 windows. Three interchangeable backends are probed at swapchain
//! creation and one of them is held for the swapchain's lifetime:
//!
//! - [`backend::dri3`]: zero-copy presentation of DMA-BUF backed pixmaps
//!   through the DRI3 and Present extensions.
//! - [`backend::bypass`]: when the X server is Xwayland, buffers are handed
//!   directly to the underlying Wayland compositor through
//!   `zwp_linux_dmabuf_v1`, skipping the X server entirely.
//! - [`backend::shm`]: a software fallback that copies pixels through
//!   MIT-SHM shared memory segments.
//!
//! The entry point is [`swapchain::Swapchain`]. It owns the selected
//! presenter, the swapchain images, a present worker that drains queued
//! presentation requests, and an event-pump thread that services
//! display-server events while the application renders.
//!
//! Buffer allocation and the Vulkan device are collaborators provided by the
//! embedding layer; see [`allocator::DmabufAllocator`] and
//! [`vulkan::DeviceContext`].

pub mod allocator;
pub mod backend;
pub mod error;
pub mod surface;
pub mod swapchain;
pub mod vulkan;

pub use error::SwapchainError;
pub use swapchain::{Swapchain, SwapchainCreateInfo, WaitResult};
