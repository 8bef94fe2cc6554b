//! Buffer pools bound to kernel queues.
//!
//! A [`BufferList`] owns N fixed slots on one queue of one device, shuttling
//! them to and from the driver with QBUF/DQBUF. Sources (capture queues)
//! hand dequeued frames to sink lists either by copying payload bytes into a
//! free slot (mmap mode) or by forwarding the exported descriptor and taking
//! a reference on the upstream buffer (DMA mode).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::buffer::{Buffer, BufferRef, PoolOps};
use crate::device::DeviceHandle;
use crate::error::{Error, Result};
use crate::v4l2::{FormatInfo, FormatRequest, MemoryType, QueueRequest, QueueType};

/// Pool of buffers bound to one kernel queue.
pub struct BufferList {
    name: String,
    dev: Arc<DeviceHandle>,
    queue: QueueType,
    memory: MemoryType,
    format: FormatInfo,
    bufs: Vec<Buffer>,
    streaming: AtomicBool,
    /// Minimum spacing between dequeues, 0 = unpaced.
    interval_us: AtomicU64,
    last_dequeued_us: AtomicU64,
    frames: AtomicU64,
}

impl BufferList {
    /// Negotiate the format and allocate `nbufs` slots on one queue.
    ///
    /// Mmap pools are mapped into our address space and, when the device
    /// allows DMA sharing, exported as descriptors for downstream import.
    /// DMA pools allocate unmapped slots that borrow upstream descriptors at
    /// enqueue time.
    pub(crate) fn open(
        dev: Arc<DeviceHandle>,
        capture: bool,
        request: FormatRequest,
        nbufs: u32,
        memory: MemoryType,
    ) -> Result<Arc<Self>> {
        let queue = QueueType::for_direction(capture, dev.mplanes());
        let name = format!("{}:{}", dev.name(), if capture { "capture" } else { "output" });
        let backend = dev.backend();
        let fd = dev.fd();

        let format = backend
            .set_format(fd, queue, &request)
            .map_err(|e| kernel_err("VIDIOC_S_FMT", &name, e))?;
        tracing::info!(
            "{}: negotiated {} {}x{} ({} bytes/frame)",
            name,
            format.pixel_format,
            format.width,
            format.height,
            format.size_image
        );

        let count = backend
            .request_buffers(fd, queue, memory, nbufs)
            .map_err(|e| kernel_err("VIDIOC_REQBUFS", &name, e))?;
        if count == 0 {
            return Err(Error::Config(format!("{name}: driver allocated no buffers")));
        }
        if count != nbufs {
            tracing::warn!("{}: requested {} buffers, driver gave {}", name, nbufs, count);
        }

        let mut bufs = Vec::with_capacity(count as usize);
        for index in 0..count {
            let info = backend
                .query_buffer(fd, queue, memory, index)
                .map_err(|e| kernel_err("VIDIOC_QUERYBUF", &name, e))?;
            let buf_name = format!("{name}:buf{index}");
            let (mem, dma_fd) = match memory {
                MemoryType::Mmap => {
                    let region = backend
                        .map_buffer(fd, &info)
                        .map_err(|e| kernel_err("mmap", &buf_name, e))?;
                    let dma_fd = if capture && dev.allow_dma() {
                        match backend.export_buffer(fd, queue, index) {
                            Ok(fd) => Some(fd),
                            Err(e) => {
                                tracing::debug!("{}: VIDIOC_EXPBUF failed: {}", buf_name, e);
                                None
                            }
                        }
                    } else {
                        None
                    };
                    (Some(region), dma_fd)
                }
                MemoryType::DmaBuf => (None, None),
            };
            bufs.push(Buffer::new(
                index,
                buf_name,
                info.length as usize,
                mem,
                dma_fd,
            ));
        }

        Ok(Arc::new(Self {
            name,
            dev,
            queue,
            memory,
            format,
            bufs,
            streaming: AtomicBool::new(false),
            interval_us: AtomicU64::new(0),
            last_dequeued_us: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<DeviceHandle> {
        &self.dev
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.bufs
    }

    pub fn nbufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn format(&self) -> FormatInfo {
        self.format
    }

    pub fn is_capture(&self) -> bool {
        self.queue.is_capture()
    }

    pub fn is_mmap(&self) -> bool {
        self.memory == MemoryType::Mmap
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory
    }

    pub fn streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    /// Frames dequeued over the list's lifetime.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn interval_us(&self) -> u64 {
        self.interval_us.load(Ordering::Relaxed)
    }

    /// Set the pacing interval; dequeues are spaced at least this far apart.
    pub fn set_interval_us(&self, us: u64) {
        self.interval_us.store(us, Ordering::Relaxed);
    }

    pub fn last_dequeued_us(&self) -> u64 {
        self.last_dequeued_us.load(Ordering::Relaxed)
    }

    /// Handle to one slot by index.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range for the pool.
    pub fn buffer_ref(self: &Arc<Self>, index: usize) -> BufferRef {
        assert!(index < self.bufs.len(), "{}: no slot {}", self.name, index);
        BufferRef::new(self.clone(), index)
    }

    /// First user-owned slot, if any.
    pub fn find_slot(self: &Arc<Self>) -> Option<BufferRef> {
        self.bufs
            .iter()
            .position(|b| !b.enqueued())
            .map(|index| BufferRef::new(self.clone(), index))
    }

    /// Number of slots currently owned by the kernel.
    pub fn count_enqueued(&self) -> usize {
        self.bufs.iter().filter(|b| b.enqueued()).count()
    }

    /// Offer an upstream frame to this pool.
    ///
    /// Returns `Ok(false)` when every slot is kernel-owned (the frame is
    /// dropped for this sink), `Err(CapacityExceeded)` when an mmap copy
    /// does not fit, and `Ok(true)` once the slot is on its way to the
    /// kernel.
    pub fn enqueue(self: &Arc<Self>, src: &BufferRef) -> Result<bool> {
        if self.memory == MemoryType::DmaBuf && src.list().memory_type() == MemoryType::DmaBuf {
            return Err(Error::Config(format!(
                "{}: cannot forward imported buffer {} (no exported descriptor)",
                self.name,
                src.buffer().name()
            )));
        }

        let slot = {
            let src_buf = src.buffer();
            PoolOps::locked(|| -> Result<Option<BufferRef>> {
                let Some(index) = self.bufs.iter().position(|b| !b.enqueued()) else {
                    return Ok(None);
                };
                let slot = BufferRef::new(self.clone(), index);
                let dst_buf = slot.buffer();
                match self.memory {
                    MemoryType::Mmap => {
                        let used = src_buf.used();
                        if used > dst_buf.length() {
                            return Err(Error::CapacityExceeded {
                                name: src_buf.name().to_string(),
                                used,
                                capacity: dst_buf.length(),
                            });
                        }
                        let src_mem = src_buf.mem().ok_or_else(|| {
                            Error::Config(format!(
                                "{}: source {} is not mapped",
                                self.name,
                                src_buf.name()
                            ))
                        })?;
                        tracing::trace!(
                            "{}: mmap copy from {} ({} bytes)",
                            dst_buf.name(),
                            src_buf.name(),
                            used
                        );
                        if let Some(dst_mem) = dst_buf.mem() {
                            dst_mem.copy_from(src_mem.bytes(used));
                        }
                    }
                    MemoryType::DmaBuf => {
                        if src_buf.dma_fd().is_none() {
                            return Err(Error::Config(format!(
                                "{}: source {} has no exported descriptor",
                                self.name,
                                src_buf.name()
                            )));
                        }
                        tracing::trace!(
                            "{}: dmabuf link from {} (fd={:?})",
                            dst_buf.name(),
                            src_buf.name(),
                            src_buf.dma_fd()
                        );
                        slot.set_source(Some(src.clone()));
                        src_buf.add_reflink();
                    }
                }
                dst_buf.set_used(src_buf.used());
                Ok(Some(slot))
            })?
        };

        match slot {
            Some(slot) => slot.release().map(|_| true),
            None => Ok(false),
        }
    }

    /// Pull the next finished buffer off the kernel queue.
    ///
    /// The returned reference is the caller's; releasing it (once every sink
    /// is done with it) sends the slot back to the kernel. A sink dequeue
    /// also drops the upstream DMA reference taken at enqueue time.
    pub fn dequeue(self: &Arc<Self>) -> Result<BufferRef> {
        let done = self
            .dev
            .backend()
            .dequeue_buffer(self.dev.fd(), self.queue, self.memory)
            .map_err(|e| kernel_err("VIDIOC_DQBUF", &self.name, e))?;
        let index = done.index as usize;
        if index >= self.bufs.len() {
            return Err(kernel_err(
                "VIDIOC_DQBUF",
                &self.name,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("driver returned index {index}"),
                ),
            ));
        }

        let buf_ref = BufferRef::new(self.clone(), index);
        let upstream = PoolOps::locked(|| {
            let buf = buf_ref.buffer();
            buf.set_used((done.bytes_used as usize).min(buf.length()));
            buf.set_enqueued(false);
            buf.set_reflinks(1);
            buf_ref.take_source()
        });

        tracing::trace!(
            "{}: dequeued buf{} used={} frame={}",
            self.name,
            index,
            buf_ref.used(),
            self.frames.load(Ordering::Relaxed)
        );

        if let Some(source) = upstream {
            source.buffer().set_used(0);
            if let Err(e) = source.release() {
                tracing::warn!("{}: upstream release failed: {}", self.name, e);
            }
        }

        self.frames.fetch_add(1, Ordering::Relaxed);
        self.last_dequeued_us
            .store(self.dev.backend().now_us(), Ordering::Relaxed);
        Ok(buf_ref)
    }

    /// Toggle STREAMON/STREAMOFF; a no-op if already in the wanted state.
    pub fn set_stream(&self, on: bool) -> Result<()> {
        if self.streaming.load(Ordering::Relaxed) == on {
            return Ok(());
        }
        let backend = self.dev.backend();
        let fd = self.dev.fd();
        if on {
            backend
                .stream_on(fd, self.queue)
                .map_err(|e| kernel_err("VIDIOC_STREAMON", &self.name, e))?;
        } else {
            backend
                .stream_off(fd, self.queue)
                .map_err(|e| kernel_err("VIDIOC_STREAMOFF", &self.name, e))?;
        }
        self.streaming.store(on, Ordering::Relaxed);
        Ok(())
    }

    /// Log the kernel's view of every slot.
    pub fn refresh_states(&self) -> Result<()> {
        let backend = self.dev.backend();
        for buf in &self.bufs {
            let info = backend
                .query_buffer(self.dev.fd(), self.queue, self.memory, buf.index())
                .map_err(|e| kernel_err("VIDIOC_QUERYBUF", buf.name(), e))?;
            tracing::info!(
                "{}: flags={:?} offset={} length={}",
                buf.name(),
                info.flags,
                info.offset,
                info.length
            );
        }
        Ok(())
    }

    /// Submit one slot to the kernel. Called with the buffer lock held.
    pub(crate) fn submit(&self, buf: &Buffer) -> Result<()> {
        let dma_fd = match self.memory {
            MemoryType::Mmap => None,
            MemoryType::DmaBuf => {
                let fd = buf.source().and_then(|s| s.buffer().dma_fd());
                if fd.is_none() {
                    return Err(Error::InvalidState {
                        name: buf.name().to_string(),
                        reason: "imported slot has no upstream descriptor",
                    });
                }
                fd
            }
        };
        tracing::trace!("{}: queuing used={} length={}", buf.name(), buf.used(), buf.length());
        self.dev
            .backend()
            .queue_buffer(
                self.dev.fd(),
                &QueueRequest {
                    queue: self.queue,
                    memory: self.memory,
                    index: buf.index(),
                    bytes_used: buf.used() as u32,
                    dma_fd,
                },
            )
            .map_err(|e| kernel_err("VIDIOC_QBUF", buf.name(), e))
    }
}

fn kernel_err(op: &'static str, name: &str, source: std::io::Error) -> Error {
    Error::Kernel {
        op,
        name: name.to_string(),
        source,
    }
}

impl Drop for BufferList {
    fn drop(&mut self) {
        if self.streaming.swap(false, Ordering::Relaxed) {
            if let Err(e) = self.dev.backend().stream_off(self.dev.fd(), self.queue) {
                tracing::debug!("{}: stream off on teardown failed: {}", self.name, e);
            }
        }
        // Free the kernel-side allocation; mappings and exported
        // descriptors are released by the buffers themselves.
        if let Err(e) =
            self.dev
                .backend()
                .request_buffers(self.dev.fd(), self.queue, self.memory, 0)
        {
            tracing::debug!("{}: buffer free on teardown failed: {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for BufferList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferList")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("memory", &self.memory)
            .field("nbufs", &self.bufs.len())
            .field("streaming", &self.streaming())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use crate::device::Device;
    use crate::types::PixelFormat;
    use crate::v4l2::{VideoBackend, VirtualBackend};

    fn open_device(backend: &Arc<VirtualBackend>, name: &str) -> Device {
        let dyn_backend: Arc<dyn VideoBackend> = backend.clone();
        Device::open(name, Path::new(&format!("/dev/{name}")), dyn_backend).unwrap()
    }

    fn primed_source(
        backend: &Arc<VirtualBackend>,
        slot_len: usize,
    ) -> (Device, Arc<super::BufferList>) {
        let dev = open_device(backend, "video-src");
        backend.set_slot_size(dev.fd(), true, slot_len);
        let list = dev
            .open_buffer_list(true, 64, 48, PixelFormat::YUYV, 3)
            .unwrap();
        list.set_stream(true).unwrap();
        while let Some(slot) = list.find_slot() {
            slot.release().unwrap();
        }
        (dev, list)
    }

    #[test]
    fn test_find_slot_prefers_first_free() {
        let backend = Arc::new(VirtualBackend::new());
        let (_dev, list) = primed_source(&backend, 1024);
        assert!(list.find_slot().is_none());
        assert_eq!(list.count_enqueued(), 3);
    }

    #[test]
    fn test_enqueue_without_free_slot_would_block() {
        let backend = Arc::new(VirtualBackend::new());
        let (src_dev, src_list) = primed_source(&backend, 1024);

        let sink_dev = open_device(&backend, "video-sink");
        sink_dev.set_allow_dma(false);
        backend.set_slot_size(sink_dev.fd(), false, 1024);
        let sink = sink_dev
            .open_buffer_list(false, 64, 48, PixelFormat::YUYV, 2)
            .unwrap();
        sink.set_stream(true).unwrap();

        backend.produce_frame(src_dev.fd(), 256);
        backend.produce_frame(src_dev.fd(), 256);
        backend.produce_frame(src_dev.fd(), 256);

        // Fill both sink slots, then the third offer has nowhere to go.
        let a = src_list.dequeue().unwrap();
        assert!(sink.enqueue(&a).unwrap());
        let b = src_list.dequeue().unwrap();
        assert!(sink.enqueue(&b).unwrap());
        let c = src_list.dequeue().unwrap();
        assert!(!sink.enqueue(&c).unwrap());
        assert_eq!(sink.count_enqueued(), 2);
    }

    #[test]
    fn test_enqueue_oversized_frame_is_rejected() {
        let backend = Arc::new(VirtualBackend::new());
        let (src_dev, src_list) = primed_source(&backend, 4096);

        let sink_dev = open_device(&backend, "video-sink");
        sink_dev.set_allow_dma(false);
        backend.set_slot_size(sink_dev.fd(), false, 1024);
        let sink = sink_dev
            .open_buffer_list(false, 64, 48, PixelFormat::YUYV, 2)
            .unwrap();
        sink.set_stream(true).unwrap();

        backend.produce_frame(src_dev.fd(), 2048);
        let frame = src_list.dequeue().unwrap();
        let err = sink.enqueue(&frame).unwrap_err();
        assert!(matches!(err, crate::Error::CapacityExceeded { .. }));
        // Sink pool untouched, source still user-owned.
        assert_eq!(sink.count_enqueued(), 0);
        assert_eq!(frame.buffer().reflinks(), 1);
        frame.release().unwrap();
        assert!(frame.buffer().enqueued());
    }

    #[test]
    fn test_dma_enqueue_links_upstream() {
        let backend = Arc::new(VirtualBackend::new());
        let (src_dev, src_list) = primed_source(&backend, 1024);

        let sink_dev = open_device(&backend, "video-dma-sink");
        backend.set_slot_size(sink_dev.fd(), false, 1024);
        let sink = sink_dev
            .open_buffer_list(false, 64, 48, PixelFormat::YUYV, 3)
            .unwrap();
        sink.set_stream(true).unwrap();

        backend.produce_frame(src_dev.fd(), 800);
        let frame = src_list.dequeue().unwrap();
        assert!(sink.enqueue(&frame).unwrap());
        // One ref from the dequeue, one from the DMA link.
        assert_eq!(frame.buffer().reflinks(), 2);

        // Sink completion releases the upstream reference and zeroes `used`.
        backend.complete_output(sink_dev.fd());
        let done = sink.dequeue().unwrap();
        assert!(!done.buffer().has_source());
        assert_eq!(frame.buffer().reflinks(), 1);
        assert_eq!(frame.buffer().used(), 0);

        frame.release().unwrap();
        assert!(frame.buffer().enqueued());
    }

    #[test]
    fn test_release_requeues_only_at_zero_refs() {
        let backend = Arc::new(VirtualBackend::new());
        let (src_dev, src_list) = primed_source(&backend, 1024);
        backend.produce_frame(src_dev.fd(), 128);
        let frame = src_list.dequeue().unwrap();
        frame.retain().unwrap();
        frame.release().unwrap();
        assert!(!frame.buffer().enqueued());
        frame.release().unwrap();
        assert!(frame.buffer().enqueued());
        assert_eq!(src_list.count_enqueued(), 3);
    }
}
