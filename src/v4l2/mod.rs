//! Kernel video interface
//!
//! Everything the pipeline needs from the V4L2 side of the world is funneled
//! through the [`VideoBackend`] trait: buffer negotiation, queue transfer
//! (QBUF/DQBUF), streaming control, polling and the monotonic clock. The
//! production implementation talks to real video nodes via ioctls; the
//! virtual implementation fabricates frames in memory, which is what the
//! test-suite and `camstream run --virtual` drive the pipeline with.

pub mod backend;
pub mod videodev;
pub mod virt;

pub use backend::V4l2Backend;
pub use virt::VirtualBackend;

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::types::{Framerate, PixelFormat};

/// Kernel buffer queue selector.
///
/// Single-planar and multi-planar queues differ only in descriptor shape;
/// which one a device speaks is decided once from its capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum QueueType {
    VideoCapture = 1,
    VideoOutput = 2,
    VideoCaptureMplane = 9,
    VideoOutputMplane = 10,
}

impl QueueType {
    pub fn for_direction(capture: bool, mplane: bool) -> Self {
        match (capture, mplane) {
            (true, false) => QueueType::VideoCapture,
            (false, false) => QueueType::VideoOutput,
            (true, true) => QueueType::VideoCaptureMplane,
            (false, true) => QueueType::VideoOutputMplane,
        }
    }

    pub fn is_capture(&self) -> bool {
        matches!(self, QueueType::VideoCapture | QueueType::VideoCaptureMplane)
    }

    pub fn is_mplane(&self) -> bool {
        matches!(
            self,
            QueueType::VideoCaptureMplane | QueueType::VideoOutputMplane
        )
    }

    pub fn id(&self) -> u32 {
        *self as u32
    }
}

/// How buffer memory is shared with the kernel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryType {
    /// Allocated by the driver, mapped into our address space.
    Mmap = 1,
    /// Imported from another device via an exported file descriptor.
    DmaBuf = 4,
}

bitflags! {
    /// Device capability flags (subset relevant to the pipeline).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapabilityFlags: u32 {
        const VIDEO_CAPTURE        = 0x0000_0001;
        const VIDEO_OUTPUT         = 0x0000_0002;
        const VIDEO_CAPTURE_MPLANE = 0x0000_1000;
        const VIDEO_OUTPUT_MPLANE  = 0x0000_2000;
        const VIDEO_M2M_MPLANE     = 0x0000_4000;
        const VIDEO_M2M            = 0x0000_8000;
        const STREAMING            = 0x0400_0000;
        const DEVICE_CAPS          = 0x8000_0000;
    }
}

impl CapabilityFlags {
    /// Does the device expose multi-planar queues?
    pub fn is_mplane(&self) -> bool {
        self.intersects(
            CapabilityFlags::VIDEO_CAPTURE_MPLANE
                | CapabilityFlags::VIDEO_OUTPUT_MPLANE
                | CapabilityFlags::VIDEO_M2M_MPLANE,
        )
    }
}

bitflags! {
    /// Kernel buffer state flags as reported by QUERYBUF/DQBUF.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        const MAPPED = 0x0000_0001;
        const QUEUED = 0x0000_0002;
        const DONE   = 0x0000_0004;
        const ERROR  = 0x0000_0040;
    }
}

bitflags! {
    /// Poll event set, matching the kernel's poll(2) bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u16 {
        const IN  = 0x0001;
        const OUT = 0x0004;
        const ERR = 0x0008;
        const HUP = 0x0010;
    }
}

/// One entry of a poll set.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(fd: RawFd, events: PollEvents) -> Self {
        Self {
            fd,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// Identification and capabilities of an opened video node.
#[derive(Debug, Clone, Default)]
pub struct Capability {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: CapabilityFlags,
    pub device_caps: CapabilityFlags,
}

/// Format requested for one queue.
#[derive(Debug, Clone, Copy)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub bytes_per_line: u32,
}

/// Format as negotiated by the driver; may differ from the request.
#[derive(Debug, Clone, Copy)]
pub struct FormatInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

/// Per-slot allocation details from QUERYBUF.
#[derive(Debug, Clone, Copy)]
pub struct BufferInfo {
    pub index: u32,
    pub flags: BufferFlags,
    pub offset: u32,
    pub length: u32,
}

/// Everything QBUF needs for one slot.
#[derive(Debug, Clone, Copy)]
pub struct QueueRequest {
    pub queue: QueueType,
    pub memory: MemoryType,
    pub index: u32,
    pub bytes_used: u32,
    /// Exported descriptor of the upstream buffer, for DMA-imported slots.
    pub dma_fd: Option<RawFd>,
}

/// Result of a successful DQBUF.
#[derive(Debug, Clone, Copy)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub flags: BufferFlags,
}

/// A buffer's memory as visible to user space, unmapped on drop.
///
/// The region stays valid for the lifetime of the owning buffer pool.
/// Reading it is only meaningful while the buffer is user-owned (dequeued,
/// or retained via the reference protocol); the kernel writes into it at
/// any other time.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region points at shared mappings that the kernel mutates while a
// buffer is enqueued; all cross-thread access is mediated by the buffer
// ownership protocol.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// # Safety
    ///
    /// `ptr` must be a live mapping of at least `len` bytes obtained from
    /// mmap(2), exclusively owned by the returned region.
    pub(crate) unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr: NonNull::new(ptr).expect("mmap returned null"),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the first `len` bytes of the region.
    ///
    /// Valid only while the owning buffer is user-owned; see the type docs.
    pub fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    /// Copy `src` into the start of the region. Caller checks capacity.
    pub(crate) fn copy_from(&self, src: &[u8]) {
        debug_assert!(src.len() <= self.len);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr(), src.len());
        }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MappedRegion({:p}, {} bytes)", self.ptr, self.len)
    }
}

/// Abstract surface over the kernel video subsystem.
///
/// One backend instance serves every device of a pipeline; implementations
/// must not call back into the buffer pools (the pool lock may be held
/// across queue submissions).
pub trait VideoBackend: Send + Sync {
    /// Open a video node. The descriptor is closed by dropping it.
    fn open(&self, path: &Path) -> io::Result<OwnedFd>;

    fn query_capabilities(&self, fd: RawFd) -> io::Result<Capability>;

    /// Negotiate the format on one queue, returning what the driver chose.
    fn set_format(&self, fd: RawFd, queue: QueueType, req: &FormatRequest)
        -> io::Result<FormatInfo>;

    /// Allocate (or free, with `count` 0) kernel buffers. Returns the count
    /// actually allocated.
    fn request_buffers(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> io::Result<u32>;

    fn query_buffer(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
        index: u32,
    ) -> io::Result<BufferInfo>;

    /// Map one allocated slot into our address space.
    fn map_buffer(&self, fd: RawFd, info: &BufferInfo) -> io::Result<MappedRegion>;

    /// Export one allocated slot as a shareable descriptor.
    fn export_buffer(&self, fd: RawFd, queue: QueueType, index: u32) -> io::Result<OwnedFd>;

    fn queue_buffer(&self, fd: RawFd, req: &QueueRequest) -> io::Result<()>;

    fn dequeue_buffer(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
    ) -> io::Result<DequeuedBuffer>;

    fn stream_on(&self, fd: RawFd, queue: QueueType) -> io::Result<()>;

    fn stream_off(&self, fd: RawFd, queue: QueueType) -> io::Result<()>;

    /// Wait for events on a set of descriptors. Returns the number of
    /// entries with non-empty `revents`. EINTR surfaces as
    /// `ErrorKind::Interrupted`.
    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> io::Result<u32>;

    /// Monotonic clock in microseconds. Pacing and pause decisions use this
    /// exclusively, which lets the virtual backend run on simulated time.
    fn now_us(&self) -> u64;

    fn set_frame_interval(&self, fd: RawFd, queue: QueueType, rate: Framerate) -> io::Result<()>;

    /// Set a control by its driver-reported name, e.g. "video_bitrate".
    fn set_control(&self, fd: RawFd, name: &str, value: i64) -> io::Result<()>;

    fn set_decoder_start(&self, fd: RawFd, on: bool) -> io::Result<()>;

    fn force_key_frame(&self, fd: RawFd) -> io::Result<()>;
}
