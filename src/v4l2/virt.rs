//! Virtual backend: an in-memory video subsystem.
//!
//! Plays the role the kernel's `vivid` driver plays for real capture
//! stacks: devices are memfd descriptors, buffer memory is anonymous
//! mappings, and the monotonic clock is simulated and advanced by poll
//! timeouts. Frames come from a paced generator or are injected by hand,
//! and output queues complete either instantly or when told to, which is
//! enough to stand up a whole pipeline without hardware.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use parking_lot::Mutex;

use super::{
    BufferFlags, BufferInfo, Capability, CapabilityFlags, DequeuedBuffer, FormatInfo,
    FormatRequest, MappedRegion, MemoryType, PollEvents, PollFd, QueueRequest, QueueType,
    VideoBackend,
};
use crate::types::Framerate;

/// Counters exposed for assertions and diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualStats {
    pub queued: u64,
    pub dequeued: u64,
    pub stream_ons: u64,
    pub stream_offs: u64,
}

struct Slot {
    addr: Option<usize>,
    length: usize,
}

#[derive(Default)]
struct Queue {
    memory: Option<MemoryType>,
    streaming: bool,
    slots: Vec<Slot>,
    /// Owned by the simulated driver, oldest first: (index, bytes_used).
    pending: VecDeque<(u32, u32)>,
    /// Finished by the simulated driver, ready for DQBUF.
    done: VecDeque<(u32, u32)>,
    stats: VirtualStats,
}

impl Queue {
    fn depth(&self) -> usize {
        self.pending.len() + self.done.len()
    }

    fn slot_flags(&self, index: u32) -> BufferFlags {
        let mut flags = BufferFlags::MAPPED;
        if self.pending.iter().any(|&(i, _)| i == index) {
            flags |= BufferFlags::QUEUED;
        }
        if self.done.iter().any(|&(i, _)| i == index) {
            flags |= BufferFlags::DONE;
        }
        flags
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.done.clear();
    }
}

struct FrameSource {
    interval_us: u64,
    used: u32,
    next_due_us: u64,
}

struct Device {
    name: String,
    hung_up: bool,
    auto_complete: bool,
    /// Forced buffer size per direction, in place of the format default.
    slot_size: [Option<usize>; 2],
    /// Frame size from the last format negotiation per direction.
    fmt_size: [Option<usize>; 2],
    source: Option<FrameSource>,
    capture: Queue,
    output: Queue,
}

impl Device {
    fn queue(&self, capture: bool) -> &Queue {
        if capture {
            &self.capture
        } else {
            &self.output
        }
    }

    fn queue_mut(&mut self, capture: bool) -> &mut Queue {
        if capture {
            &mut self.capture
        } else {
            &mut self.output
        }
    }
}

#[derive(Default)]
struct State {
    now_us: u64,
    interrupt_next_poll: bool,
    devices: Vec<(RawFd, Device)>,
}

impl State {
    fn device(&self, fd: RawFd) -> io::Result<&Device> {
        self.devices
            .iter()
            .find(|(f, _)| *f == fd)
            .map(|(_, d)| d)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn device_mut(&mut self, fd: RawFd) -> io::Result<&mut Device> {
        self.devices
            .iter_mut()
            .find(|(f, _)| *f == fd)
            .map(|(_, d)| d)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    /// Let every due frame source fire once, up to `now`.
    fn run_frame_sources(&mut self) {
        let now = self.now_us;
        for (_, dev) in self.devices.iter_mut() {
            let Some(src) = dev.source.as_mut() else {
                continue;
            };
            while src.next_due_us <= now {
                src.next_due_us += src.interval_us.max(1);
                if !dev.capture.streaming {
                    continue;
                }
                // A frame with no free slot is dropped, like a sensor would.
                if let Some((index, _)) = dev.capture.pending.pop_front() {
                    let used = src.used;
                    fill_pattern(&dev.capture.slots[index as usize], used as usize);
                    dev.capture.done.push_back((index, used));
                }
            }
        }
    }

    fn next_source_due(&self) -> Option<u64> {
        self.devices
            .iter()
            .filter_map(|(_, d)| d.source.as_ref().map(|s| s.next_due_us))
            .min()
    }

    fn ready_events(&self, fd: RawFd) -> PollEvents {
        let mut ready = PollEvents::empty();
        let Ok(dev) = self.device(fd) else {
            return ready;
        };
        if dev.hung_up {
            ready |= PollEvents::HUP;
        }
        if dev.capture.streaming && !dev.capture.done.is_empty() {
            ready |= PollEvents::IN;
        }
        if dev.output.streaming && !dev.output.done.is_empty() {
            ready |= PollEvents::OUT;
        }
        ready
    }
}

fn fill_pattern(slot: &Slot, used: usize) {
    let Some(addr) = slot.addr else { return };
    let len = used.min(slot.length);
    unsafe {
        let ptr = addr as *mut u8;
        for i in 0..len {
            ptr.add(i).write((i & 0xff) as u8);
        }
    }
}

fn anon_map(length: usize) -> io::Result<usize> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            length.max(1),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as usize)
}

fn memfd(name: &str) -> io::Result<OwnedFd> {
    let c_name = std::ffi::CString::new(name).unwrap_or_default();
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Simulated video subsystem; see the module docs.
#[derive(Default)]
pub struct VirtualBackend {
    state: Mutex<State>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the allocation size of one queue's buffers, overriding the
    /// format-derived default. Takes effect at the next REQBUFS.
    pub fn set_slot_size(&self, fd: RawFd, capture: bool, length: usize) {
        let mut state = self.state.lock();
        if let Ok(dev) = state.device_mut(fd) {
            dev.slot_size[capture as usize] = Some(length);
        }
    }

    /// Attach a paced frame generator to the device's capture queue.
    pub fn start_frame_source(&self, fd: RawFd, interval_us: u64, used: u32) {
        let mut state = self.state.lock();
        let now = state.now_us;
        if let Ok(dev) = state.device_mut(fd) {
            dev.source = Some(FrameSource {
                interval_us,
                used,
                next_due_us: now + interval_us,
            });
        }
    }

    /// Complete one pending capture buffer with `used` payload bytes.
    /// Returns false when the driver queue is empty.
    pub fn produce_frame(&self, fd: RawFd, used: u32) -> bool {
        let mut state = self.state.lock();
        let Ok(dev) = state.device_mut(fd) else {
            return false;
        };
        let Some((index, _)) = dev.capture.pending.pop_front() else {
            return false;
        };
        fill_pattern(&dev.capture.slots[index as usize], used as usize);
        dev.capture.done.push_back((index, used));
        true
    }

    /// Mark the oldest pending output buffer as processed.
    pub fn complete_output(&self, fd: RawFd) -> bool {
        let mut state = self.state.lock();
        let Ok(dev) = state.device_mut(fd) else {
            return false;
        };
        match dev.output.pending.pop_front() {
            Some(entry) => {
                dev.output.done.push_back(entry);
                true
            }
            None => false,
        }
    }

    /// Make QBUF on the output queue complete instantly.
    pub fn set_auto_complete(&self, fd: RawFd, on: bool) {
        let mut state = self.state.lock();
        if let Ok(dev) = state.device_mut(fd) {
            dev.auto_complete = on;
        }
    }

    /// Fail the next poll with EINTR, as a signal landing mid-wait would.
    pub fn inject_poll_interrupt(&self) {
        self.state.lock().interrupt_next_poll = true;
    }

    /// Simulate the device going away; poll reports HUP from now on.
    pub fn hang_up(&self, fd: RawFd) {
        let mut state = self.state.lock();
        if let Ok(dev) = state.device_mut(fd) {
            dev.hung_up = true;
        }
    }

    /// Move the simulated clock forward.
    pub fn advance_clock(&self, us: u64) {
        let mut state = self.state.lock();
        state.now_us += us;
        state.run_frame_sources();
    }

    pub fn stats(&self, fd: RawFd, capture: bool) -> VirtualStats {
        let state = self.state.lock();
        state
            .device(fd)
            .map(|d| d.queue(capture).stats)
            .unwrap_or_default()
    }

    /// Buffers currently held by the simulated driver (pending + done).
    pub fn kernel_depth(&self, fd: RawFd, capture: bool) -> usize {
        let state = self.state.lock();
        state.device(fd).map(|d| d.queue(capture).depth()).unwrap_or(0)
    }
}

impl VideoBackend for VirtualBackend {
    fn open(&self, path: &Path) -> io::Result<OwnedFd> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let fd = memfd(&name)?;
        let mut state = self.state.lock();
        state.devices.push((
            fd.as_raw_fd(),
            Device {
                name,
                hung_up: false,
                auto_complete: false,
                slot_size: [None, None],
                fmt_size: [None, None],
                source: None,
                capture: Queue::default(),
                output: Queue::default(),
            },
        ));
        Ok(fd)
    }

    fn query_capabilities(&self, fd: RawFd) -> io::Result<Capability> {
        let state = self.state.lock();
        let dev = state.device(fd)?;
        let caps = CapabilityFlags::VIDEO_CAPTURE
            | CapabilityFlags::VIDEO_OUTPUT
            | CapabilityFlags::VIDEO_M2M
            | CapabilityFlags::STREAMING;
        Ok(Capability {
            driver: "virt".into(),
            card: dev.name.clone(),
            bus_info: "platform:camstream-virt".into(),
            capabilities: caps,
            device_caps: caps,
        })
    }

    fn set_format(
        &self,
        fd: RawFd,
        queue: QueueType,
        req: &FormatRequest,
    ) -> io::Result<FormatInfo> {
        // Accepts anything; two bytes per pixel stands in for negotiation.
        let bytes_per_line = if req.bytes_per_line > 0 {
            req.bytes_per_line
        } else {
            req.width * 2
        };
        let size_image = bytes_per_line * req.height;
        let mut state = self.state.lock();
        let dev = state.device_mut(fd)?;
        dev.fmt_size[queue.is_capture() as usize] = Some(size_image as usize);
        Ok(FormatInfo {
            width: req.width,
            height: req.height,
            pixel_format: req.pixel_format,
            bytes_per_line,
            size_image,
        })
    }

    fn request_buffers(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> io::Result<u32> {
        let mut state = self.state.lock();
        let dev = state.device_mut(fd)?;
        let direction = queue.is_capture() as usize;
        let length = dev.slot_size[direction]
            .or(dev.fmt_size[direction])
            .unwrap_or(4096);
        let q = dev.queue_mut(queue.is_capture());
        q.clear();
        q.slots.clear();
        q.memory = Some(memory);
        for _ in 0..count {
            let addr = match memory {
                MemoryType::Mmap => Some(anon_map(length)?),
                MemoryType::DmaBuf => None,
            };
            q.slots.push(Slot { addr, length });
        }
        Ok(count)
    }

    fn query_buffer(
        &self,
        fd: RawFd,
        queue: QueueType,
        _memory: MemoryType,
        index: u32,
    ) -> io::Result<BufferInfo> {
        let state = self.state.lock();
        let q = state.device(fd)?.queue(queue.is_capture());
        let slot = q
            .slots
            .get(index as usize)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        // The queue is encoded into the offset, the way real m2m drivers
        // keep their two mappings apart.
        let queue_bit = if queue.is_capture() { 0 } else { 1 << 28 };
        Ok(BufferInfo {
            index,
            flags: q.slot_flags(index),
            offset: (index << 12) | queue_bit,
            length: slot.length as u32,
        })
    }

    fn map_buffer(&self, fd: RawFd, info: &BufferInfo) -> io::Result<MappedRegion> {
        let state = self.state.lock();
        let capture = info.offset & (1 << 28) == 0;
        let index = ((info.offset >> 12) & 0xffff) as usize;
        let q = state.device(fd)?.queue(capture);
        if let Some(slot) = q.slots.get(index) {
            if let Some(addr) = slot.addr {
                return Ok(unsafe { MappedRegion::from_raw(addr as *mut u8, slot.length) });
            }
        }
        Err(io::Error::from_raw_os_error(libc::EINVAL))
    }

    fn export_buffer(&self, fd: RawFd, queue: QueueType, index: u32) -> io::Result<OwnedFd> {
        let state = self.state.lock();
        let dev = state.device(fd)?;
        if dev.queue(queue.is_capture()).slots.get(index as usize).is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        memfd(&format!("{}:dmabuf{}", dev.name, index))
    }

    fn queue_buffer(&self, fd: RawFd, req: &QueueRequest) -> io::Result<()> {
        let mut state = self.state.lock();
        let dev = state.device_mut(fd)?;
        let auto_complete = dev.auto_complete;
        let capture = req.queue.is_capture();
        let q = dev.queue_mut(capture);
        if req.index as usize >= q.slots.len() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if q.slot_flags(req.index).intersects(BufferFlags::QUEUED | BufferFlags::DONE) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if q.memory == Some(MemoryType::DmaBuf) && req.dma_fd.is_none() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        q.stats.queued += 1;
        if !capture && auto_complete {
            q.done.push_back((req.index, req.bytes_used));
        } else {
            q.pending.push_back((req.index, req.bytes_used));
        }
        Ok(())
    }

    fn dequeue_buffer(
        &self,
        fd: RawFd,
        queue: QueueType,
        _memory: MemoryType,
    ) -> io::Result<DequeuedBuffer> {
        let mut state = self.state.lock();
        let q = state.device_mut(fd)?.queue_mut(queue.is_capture());
        let (index, bytes_used) = q
            .done
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?;
        q.stats.dequeued += 1;
        Ok(DequeuedBuffer {
            index,
            bytes_used,
            flags: BufferFlags::empty(),
        })
    }

    fn stream_on(&self, fd: RawFd, queue: QueueType) -> io::Result<()> {
        let mut state = self.state.lock();
        let q = state.device_mut(fd)?.queue_mut(queue.is_capture());
        q.streaming = true;
        q.stats.stream_ons += 1;
        Ok(())
    }

    fn stream_off(&self, fd: RawFd, queue: QueueType) -> io::Result<()> {
        let mut state = self.state.lock();
        let q = state.device_mut(fd)?.queue_mut(queue.is_capture());
        q.streaming = false;
        q.stats.stream_offs += 1;
        q.clear();
        Ok(())
    }

    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> io::Result<u32> {
        let mut state = self.state.lock();
        if state.interrupt_next_poll {
            state.interrupt_next_poll = false;
            return Err(io::Error::from_raw_os_error(libc::EINTR));
        }
        let deadline = state.now_us + (timeout_ms.max(0) as u64) * 1_000;
        loop {
            state.run_frame_sources();
            let mut ready = 0;
            for p in fds.iter_mut() {
                let wanted = p.events | PollEvents::HUP | PollEvents::ERR;
                p.revents = state.ready_events(p.fd) & wanted;
                if !p.revents.is_empty() {
                    ready += 1;
                }
            }
            if ready > 0 {
                return Ok(ready);
            }
            if state.now_us >= deadline {
                return Ok(0);
            }
            // Sleep until the next frame is due, or the timeout.
            let wake = state
                .next_source_due()
                .map_or(deadline, |due| due.clamp(state.now_us + 1, deadline));
            state.now_us = wake;
        }
    }

    fn now_us(&self) -> u64 {
        self.state.lock().now_us
    }

    fn set_frame_interval(&self, fd: RawFd, _queue: QueueType, rate: Framerate) -> io::Result<()> {
        let mut state = self.state.lock();
        let now = state.now_us;
        let dev = state.device_mut(fd)?;
        if let Some(src) = dev.source.as_mut() {
            src.interval_us = rate.interval_us().max(1);
            src.next_due_us = now + src.interval_us;
        }
        Ok(())
    }

    fn set_control(&self, fd: RawFd, _name: &str, _value: i64) -> io::Result<()> {
        self.state.lock().device(fd).map(|_| ())
    }

    fn set_decoder_start(&self, fd: RawFd, _on: bool) -> io::Result<()> {
        self.state.lock().device(fd).map(|_| ())
    }

    fn force_key_frame(&self, fd: RawFd) -> io::Result<()> {
        self.state.lock().device(fd).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_flow_through_capture_queue() {
        let backend = VirtualBackend::new();
        let fd = backend.open(Path::new("/dev/video-virt0")).unwrap();
        let raw = fd.as_raw_fd();
        backend.set_slot_size(raw, true, 1024);
        backend
            .request_buffers(raw, QueueType::VideoCapture, MemoryType::Mmap, 3)
            .unwrap();
        backend.stream_on(raw, QueueType::VideoCapture).unwrap();
        for index in 0..3 {
            backend
                .queue_buffer(
                    raw,
                    &QueueRequest {
                        queue: QueueType::VideoCapture,
                        memory: MemoryType::Mmap,
                        index,
                        bytes_used: 0,
                        dma_fd: None,
                    },
                )
                .unwrap();
        }
        assert!(backend.produce_frame(raw, 512));
        let done = backend
            .dequeue_buffer(raw, QueueType::VideoCapture, MemoryType::Mmap)
            .unwrap();
        assert_eq!(done.index, 0);
        assert_eq!(done.bytes_used, 512);
        assert_eq!(backend.kernel_depth(raw, true), 2);
    }

    #[test]
    fn test_poll_advances_simulated_clock() {
        let backend = VirtualBackend::new();
        let fd = backend.open(Path::new("/dev/video-virt1")).unwrap();
        let mut fds = [PollFd::new(fd.as_raw_fd(), PollEvents::IN)];
        let before = backend.now_us();
        assert_eq!(backend.poll(&mut fds, 25).unwrap(), 0);
        assert_eq!(backend.now_us() - before, 25_000);
    }

    #[test]
    fn test_double_queue_rejected() {
        let backend = VirtualBackend::new();
        let fd = backend.open(Path::new("/dev/video-virt2")).unwrap();
        let raw = fd.as_raw_fd();
        backend
            .request_buffers(raw, QueueType::VideoCapture, MemoryType::Mmap, 1)
            .unwrap();
        let req = QueueRequest {
            queue: QueueType::VideoCapture,
            memory: MemoryType::Mmap,
            index: 0,
            bytes_used: 0,
            dma_fd: None,
        };
        backend.queue_buffer(raw, &req).unwrap();
        assert!(backend.queue_buffer(raw, &req).is_err());
    }
}
