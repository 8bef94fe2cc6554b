//! Video device handles.
//!
//! A [`Device`] wraps one opened video node and owns up to one capture pool
//! and one output pool. The shared [`DeviceHandle`] carries what the pools
//! and the scheduler need at runtime: the descriptor, the backend, and the
//! pause flag that backpressure propagates through the graph.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer_list::BufferList;
use crate::error::{Error, Result};
use crate::types::{Framerate, PixelFormat};
use crate::v4l2::{Capability, FormatRequest, MemoryType, VideoBackend};

/// Shared runtime state of one opened node.
pub struct DeviceHandle {
    name: String,
    fd: OwnedFd,
    backend: Arc<dyn VideoBackend>,
    capability: Capability,
    mplanes: bool,
    allow_dma: AtomicBool,
    paused: AtomicBool,
    /// Paired node that should share this device's pause state, e.g. the
    /// ISP input node when this is one of its output taps.
    output_peer: Mutex<Option<Arc<DeviceHandle>>>,
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn backend(&self) -> &Arc<dyn VideoBackend> {
        &self.backend
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub fn mplanes(&self) -> bool {
        self.mplanes
    }

    pub fn allow_dma(&self) -> bool {
        self.allow_dma.load(Ordering::Relaxed)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn output_peer(&self) -> Option<Arc<DeviceHandle>> {
        self.output_peer.lock().clone()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("fd", &self.fd())
            .field("paused", &self.paused())
            .finish()
    }
}

/// An opened video node plus its buffer pools.
pub struct Device {
    handle: Arc<DeviceHandle>,
    capture_list: Mutex<Option<Arc<BufferList>>>,
    output_list: Mutex<Option<Arc<BufferList>>>,
}

impl Device {
    /// Open a video node and query its capabilities.
    pub fn open(name: &str, path: &Path, backend: Arc<dyn VideoBackend>) -> Result<Self> {
        let fd = backend.open(path).map_err(|e| Error::Kernel {
            op: "open",
            name: name.to_string(),
            source: e,
        })?;
        let capability = backend
            .query_capabilities(fd.as_raw_fd())
            .map_err(|e| Error::Kernel {
                op: "VIDIOC_QUERYCAP",
                name: name.to_string(),
                source: e,
            })?;
        let mplanes = capability.device_caps.is_mplane();
        tracing::info!(
            "{}: opened {} ({}, {})",
            name,
            path.display(),
            capability.card,
            capability.driver
        );
        Ok(Self {
            handle: Arc::new(DeviceHandle {
                name: name.to_string(),
                fd,
                backend,
                capability,
                mplanes,
                allow_dma: AtomicBool::new(true),
                paused: AtomicBool::new(false),
                output_peer: Mutex::new(None),
            }),
            capture_list: Mutex::new(None),
            output_list: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    pub fn fd(&self) -> RawFd {
        self.handle.fd()
    }

    pub fn handle(&self) -> &Arc<DeviceHandle> {
        &self.handle
    }

    pub fn paused(&self) -> bool {
        self.handle.paused()
    }

    /// Allow or forbid descriptor sharing on this device. Forbidden means
    /// sink pools fall back to mmap copies.
    pub fn set_allow_dma(&self, allow: bool) {
        self.handle.allow_dma.store(allow, Ordering::Relaxed);
    }

    /// Share pause state with another device (this device's pause is copied
    /// onto the peer whenever the scheduler recomputes it).
    pub fn pair_output_device(&self, peer: &Device) {
        *self.handle.output_peer.lock() = Some(peer.handle.clone());
    }

    /// Negotiate and allocate one buffer pool on this device.
    ///
    /// Capture pools allocate driver memory and map it; output pools import
    /// upstream descriptors when DMA is allowed, otherwise they allocate and
    /// receive copies.
    pub fn open_buffer_list(
        &self,
        capture: bool,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        nbufs: u32,
    ) -> Result<Arc<BufferList>> {
        let slot = if capture {
            &self.capture_list
        } else {
            &self.output_list
        };
        if slot.lock().is_some() {
            return Err(Error::Config(format!(
                "{}: {} list already open",
                self.name(),
                if capture { "capture" } else { "output" }
            )));
        }
        let memory = if capture || !self.handle.allow_dma() {
            MemoryType::Mmap
        } else {
            MemoryType::DmaBuf
        };
        let list = BufferList::open(
            self.handle.clone(),
            capture,
            FormatRequest {
                width,
                height,
                pixel_format,
                bytes_per_line: 0,
            },
            nbufs,
            memory,
        )?;
        *slot.lock() = Some(list.clone());
        Ok(list)
    }

    pub fn capture_list(&self) -> Option<Arc<BufferList>> {
        self.capture_list.lock().clone()
    }

    pub fn output_list(&self) -> Option<Arc<BufferList>> {
        self.output_list.lock().clone()
    }

    /// Ask the driver for a frame rate and pace the capture pool to match.
    pub fn set_fps(&self, fps: u32) -> Result<()> {
        let rate = Framerate::new(fps, 1);
        let queue = crate::v4l2::QueueType::for_direction(true, self.handle.mplanes());
        self.handle
            .backend
            .set_frame_interval(self.fd(), queue, rate)
            .map_err(|e| Error::Kernel {
                op: "VIDIOC_S_PARM",
                name: self.name().to_string(),
                source: e,
            })?;
        if let Some(list) = self.capture_list() {
            list.set_interval_us(rate.interval_us());
        }
        Ok(())
    }

    /// Set a driver control by name, e.g. `set_option("video_bitrate", 5_000_000)`.
    pub fn set_option(&self, key: &str, value: i64) -> Result<()> {
        self.handle
            .backend
            .set_control(self.fd(), key, value)
            .map_err(|e| Error::Kernel {
                op: "VIDIOC_S_CTRL",
                name: self.name().to_string(),
                source: e,
            })
    }

    /// Request an IDR frame from an encoder node.
    pub fn video_force_key(&self) -> Result<()> {
        self.handle
            .backend
            .force_key_frame(self.fd())
            .map_err(|e| Error::Kernel {
                op: "VIDIOC_S_CTRL",
                name: self.name().to_string(),
                source: e,
            })
    }

    /// Start or stop a decoder node.
    pub fn set_decoder_start(&self, on: bool) -> Result<()> {
        self.handle
            .backend
            .set_decoder_start(self.fd(), on)
            .map_err(|e| Error::Kernel {
                op: "VIDIOC_DECODER_CMD",
                name: self.name().to_string(),
                source: e,
            })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("fd", &self.fd())
            .field("paused", &self.paused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v4l2::VirtualBackend;

    #[test]
    fn test_open_and_pair() {
        let backend: Arc<dyn VideoBackend> = Arc::new(VirtualBackend::new());
        let a = Device::open("ISP-HIGH", Path::new("/dev/video14"), backend.clone()).unwrap();
        let b = Device::open("ISP", Path::new("/dev/video13"), backend).unwrap();
        a.pair_output_device(&b);

        a.handle().set_paused(true);
        let peer = a.handle().output_peer().unwrap();
        peer.set_paused(a.paused());
        assert!(b.paused());
    }

    #[test]
    fn test_double_list_open_rejected() {
        let backend: Arc<dyn VideoBackend> = Arc::new(VirtualBackend::new());
        let dev = Device::open("CAM", Path::new("/dev/video0"), backend).unwrap();
        dev.open_buffer_list(true, 64, 48, PixelFormat::YUYV, 2)
            .unwrap();
        let err = dev
            .open_buffer_list(true, 64, 48, PixelFormat::YUYV, 2)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
