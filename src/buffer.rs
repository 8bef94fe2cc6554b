//! Frame buffer slots and the reference-count protocol.
//!
//! A [`Buffer`] is one fixed slot of a pool, owned either by the kernel
//! queue (`enqueued`) or by user space, never both. User-space ownership is
//! reference counted: the dequeuing caller holds one reference, each
//! DMA-sharing sink holds one more, and external consumers may take their
//! own via [`BufferRef::retain`]. Dropping the last reference requeues the
//! slot to the kernel, so a buffer never sits idle unowned.
//!
//! Every ownership transition happens under one process-wide lock, and the
//! QBUF submission is issued while it is held, so the state flip and the
//! kernel hand-off are atomic with respect to all other reference traffic.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer_list::BufferList;
use crate::error::{Error, Result};
use crate::v4l2::MappedRegion;

/// Serializes ownership transitions across every pool in the process.
static BUFFER_LOCK: Mutex<()> = Mutex::new(());

/// One slot of a buffer pool.
pub struct Buffer {
    index: u32,
    name: String,
    length: usize,
    mem: Option<MappedRegion>,
    dma_fd: Option<OwnedFd>,
    used: AtomicUsize,
    enqueued: AtomicBool,
    reflinks: AtomicU32,
    /// Upstream buffer whose payload this slot is forwarding (DMA import).
    source: Mutex<Option<BufferRef>>,
}

impl Buffer {
    pub(crate) fn new(
        index: u32,
        name: String,
        length: usize,
        mem: Option<MappedRegion>,
        dma_fd: Option<OwnedFd>,
    ) -> Self {
        Self {
            index,
            name,
            length,
            mem,
            dma_fd,
            used: AtomicUsize::new(0),
            enqueued: AtomicBool::new(false),
            reflinks: AtomicU32::new(0),
            source: Mutex::new(None),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity of the slot in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Payload bytes carried by the current frame.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// True while the kernel owns the slot.
    pub fn enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Number of user-space references currently held.
    pub fn reflinks(&self) -> u32 {
        self.reflinks.load(Ordering::Relaxed)
    }

    pub fn has_source(&self) -> bool {
        self.source.lock().is_some()
    }

    /// The upstream buffer this slot is currently forwarding, if any.
    pub fn source(&self) -> Option<BufferRef> {
        self.source.lock().clone()
    }

    pub(crate) fn mem(&self) -> Option<&MappedRegion> {
        self.mem.as_ref()
    }

    pub(crate) fn dma_fd(&self) -> Option<RawFd> {
        self.dma_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub(crate) fn set_used(&self, used: usize) {
        self.used.store(used, Ordering::Relaxed);
    }

    pub(crate) fn set_enqueued(&self, enqueued: bool) {
        self.enqueued.store(enqueued, Ordering::Relaxed);
    }

    pub(crate) fn set_reflinks(&self, reflinks: u32) {
        self.reflinks.store(reflinks, Ordering::Relaxed);
    }

    pub(crate) fn add_reflink(&self) {
        self.reflinks.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.name)
            .field("length", &self.length)
            .field("used", &self.used())
            .field("enqueued", &self.enqueued())
            .field("reflinks", &self.reflinks())
            .finish()
    }
}

/// Cheap handle to one slot: the owning pool plus the slot index.
///
/// Pools outlive the scheduler, so handles stay valid for the lifetime of
/// the pipeline; cyclic upstream references are just handles too.
#[derive(Clone)]
pub struct BufferRef {
    list: Arc<BufferList>,
    index: usize,
}

impl BufferRef {
    pub(crate) fn new(list: Arc<BufferList>, index: usize) -> Self {
        Self { list, index }
    }

    pub fn list(&self) -> &Arc<BufferList> {
        &self.list
    }

    pub fn buffer(&self) -> &Buffer {
        &self.list.buffers()[self.index]
    }

    pub fn index(&self) -> u32 {
        self.buffer().index()
    }

    pub fn used(&self) -> usize {
        self.buffer().used()
    }

    /// View the frame payload.
    ///
    /// Only meaningful while the buffer is user-owned: after a dequeue, or
    /// between a successful [`retain`](Self::retain) and the matching
    /// [`release`](Self::release). `None` for unmapped (DMA-imported) slots.
    pub fn bytes(&self) -> Option<&[u8]> {
        let buf = self.buffer();
        buf.mem().map(|m| m.bytes(buf.used()))
    }

    /// Take an extra reference, keeping the buffer user-owned.
    ///
    /// Fails with [`Error::InvalidState`] once the slot has been handed back
    /// to the kernel; the caller must treat the frame as gone.
    pub fn retain(&self) -> Result<()> {
        let buf = self.buffer();
        let _guard = BUFFER_LOCK.lock();
        if buf.enqueued.load(Ordering::Relaxed) {
            return Err(Error::InvalidState {
                name: buf.name.clone(),
                reason: "buffer is owned by the kernel",
            });
        }
        buf.reflinks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drop one reference; the last one requeues the slot to the kernel.
    ///
    /// On a failed requeue the upstream reference is handed back before the
    /// error propagates, so the source buffer still makes it home.
    pub fn release(&self) -> Result<()> {
        let buf = self.buffer();
        let (upstream, err) = {
            let _guard = BUFFER_LOCK.lock();
            if buf.reflinks.load(Ordering::Relaxed) > 0 {
                buf.reflinks.fetch_sub(1, Ordering::Relaxed);
            }
            if buf.enqueued.load(Ordering::Relaxed) || buf.reflinks.load(Ordering::Relaxed) > 0 {
                return Ok(());
            }
            match self.list.submit(buf) {
                Ok(()) => {
                    buf.enqueued.store(true, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => (buf.source.lock().take(), e),
            }
        };
        if let Some(source) = upstream {
            let _ = source.release();
        }
        Err(err)
    }

    pub(crate) fn set_source(&self, source: Option<BufferRef>) {
        *self.buffer().source.lock() = source;
    }

    pub(crate) fn take_source(&self) -> Option<BufferRef> {
        self.buffer().source.lock().take()
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.list, &other.list) && self.index == other.index
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferRef({})", self.buffer().name())
    }
}

/// Internal entry points used by the pool under [`BUFFER_LOCK`].
pub(crate) struct PoolOps;

impl PoolOps {
    /// Run `f` under the process-wide buffer lock.
    pub(crate) fn locked<T>(f: impl FnOnce() -> T) -> T {
        let _guard = BUFFER_LOCK.lock();
        f()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::device::Device;
    use crate::types::PixelFormat;
    use crate::v4l2::{VideoBackend, VirtualBackend};

    fn capture_list(
        backend: &Arc<VirtualBackend>,
        slot_len: usize,
    ) -> (crate::device::Device, Arc<crate::buffer_list::BufferList>) {
        let dyn_backend: Arc<dyn VideoBackend> = backend.clone();
        let dev = Device::open("CAM", std::path::Path::new("/dev/video-virt"), dyn_backend)
            .expect("open virtual device");
        backend.set_slot_size(dev.fd(), true, slot_len);
        let list = dev
            .open_buffer_list(true, 64, 48, PixelFormat::YUYV, 3)
            .expect("open capture list");
        (dev, list)
    }

    #[test]
    fn test_retain_release_roundtrip() {
        let backend = Arc::new(VirtualBackend::new());
        let (dev, list) = capture_list(&backend, 1024);
        list.set_stream(true).unwrap();

        // Prime the queue and complete one frame.
        for slot in 0..3 {
            list.buffer_ref(slot).release().unwrap();
        }
        assert!(backend.produce_frame(dev.fd(), 100));
        let buf = list.dequeue().unwrap();
        assert_eq!(buf.buffer().reflinks(), 1);

        buf.retain().unwrap();
        assert_eq!(buf.buffer().reflinks(), 2);
        buf.release().unwrap();
        assert_eq!(buf.buffer().reflinks(), 1);
        assert!(!buf.buffer().enqueued());

        // Last reference requeues to the kernel.
        buf.release().unwrap();
        assert!(buf.buffer().enqueued());
        assert_eq!(buf.buffer().reflinks(), 0);
    }

    #[test]
    fn test_retain_fails_on_kernel_owned_buffer() {
        let backend = Arc::new(VirtualBackend::new());
        let (_dev, list) = capture_list(&backend, 1024);
        let r = list.buffer_ref(0);
        r.release().unwrap();
        assert!(r.buffer().enqueued());
        let err = r.retain().unwrap_err();
        assert!(matches!(err, crate::Error::InvalidState { .. }));
    }
}
