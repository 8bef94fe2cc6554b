//! camstream — V4L2 camera streaming pipeline
//!
//! Moves video frames from a capture device through ISP and hardware codec
//! stages with as little copying as the hardware allows: buffers are shared
//! across stages by exported descriptors (DMA mode) or memory-mapped copies
//! (mmap fallback), with reference counting coordinating ownership between
//! the kernel queues and user-space consumers.
//!
//! # Architecture
//!
//! - **Buffers**: fixed slots shuttled between user space and kernel queues;
//!   see [`buffer`] for the reference-count protocol.
//! - **Pools**: one [`BufferList`] per device queue handles allocation and
//!   QBUF/DQBUF traffic.
//! - **Graph**: a static [`LinkGraph`] wires source pools to sink pools; a
//!   single-threaded poll scheduler moves frames, paces dequeues and
//!   propagates backpressure.
//! - **Backends**: the kernel surface is a trait ([`VideoBackend`]); the
//!   real implementation speaks ioctls, the virtual one fabricates frames
//!   for tests and machines without hardware.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use camstream::{Camera, Config, V4l2Backend};
//!
//! fn main() -> camstream::Result<()> {
//!     let config = Config::default();
//!     let camera = Camera::open(&config, Arc::new(V4l2Backend::new()))?;
//!     let running = AtomicBool::new(true);
//!     camera.run(&running)
//! }
//! ```

pub mod buffer;
pub mod buffer_list;
pub mod camera;
pub mod config;
pub mod device;
pub mod error;
pub mod links;
pub mod types;
pub mod v4l2;

// Re-exports for convenience
pub use buffer::{Buffer, BufferRef};
pub use buffer_list::BufferList;
pub use camera::Camera;
pub use config::{CameraConfig, CodecConfig, Config, IspConfig};
pub use device::{Device, DeviceHandle};
pub use error::{Error, Result};
pub use links::{Callbacks, Link, LinkGraph};
pub use types::{Framerate, PixelFormat, Resolution};
pub use v4l2::{V4l2Backend, VideoBackend, VirtualBackend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
