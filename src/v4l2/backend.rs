//! Production backend: ioctls against real video nodes.

use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use super::videodev as vd;
use super::{
    BufferFlags, BufferInfo, Capability, CapabilityFlags, DequeuedBuffer, FormatInfo,
    FormatRequest, MappedRegion, MemoryType, PollEvents, PollFd, QueueRequest, QueueType,
    VideoBackend,
};
use crate::types::{Framerate, PixelFormat};

/// Talks to the kernel V4L2 subsystem via ioctls on `/dev/video*` nodes.
#[derive(Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }
}

fn fixed_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Control names as matched against the driver: lowercased, runs of
/// non-alphanumerics collapsed to underscores.
fn normalize_control_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_underscore = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

impl VideoBackend for V4l2Backend {
    fn open(&self, path: &Path) -> io::Result<OwnedFd> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn query_capabilities(&self, fd: RawFd) -> io::Result<Capability> {
        let mut caps: vd::v4l2_capability = unsafe { mem::zeroed() };
        unsafe {
            vd::ioctl(fd, vd::VIDIOC_QUERYCAP, &mut caps as *mut _ as *mut _)?;
        }
        let capabilities = CapabilityFlags::from_bits_truncate(caps.capabilities);
        // device_caps is only valid when the driver advertises it
        let device_caps = if capabilities.contains(CapabilityFlags::DEVICE_CAPS) {
            CapabilityFlags::from_bits_truncate(caps.device_caps)
        } else {
            capabilities
        };
        Ok(Capability {
            driver: fixed_cstr(&caps.driver),
            card: fixed_cstr(&caps.card),
            bus_info: fixed_cstr(&caps.bus_info),
            capabilities,
            device_caps,
        })
    }

    fn set_format(
        &self,
        fd: RawFd,
        queue: QueueType,
        req: &FormatRequest,
    ) -> io::Result<FormatInfo> {
        let mut fmt: vd::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = queue.id();
        if queue.is_mplane() {
            let pix_mp = unsafe { &mut fmt.fmt.pix_mp };
            pix_mp.width = req.width;
            pix_mp.height = req.height;
            pix_mp.pixelformat = req.pixel_format.0;
            pix_mp.num_planes = 1;
            pix_mp.plane_fmt[0].bytesperline = req.bytes_per_line;
        } else {
            let pix = unsafe { &mut fmt.fmt.pix };
            pix.width = req.width;
            pix.height = req.height;
            pix.pixelformat = req.pixel_format.0;
            pix.bytesperline = req.bytes_per_line;
        }
        unsafe {
            vd::ioctl(fd, vd::VIDIOC_S_FMT, &mut fmt as *mut _ as *mut _)?;
        }
        if queue.is_mplane() {
            let pix_mp = unsafe { fmt.fmt.pix_mp };
            let plane = pix_mp.plane_fmt[0];
            Ok(FormatInfo {
                width: pix_mp.width,
                height: pix_mp.height,
                pixel_format: PixelFormat(pix_mp.pixelformat),
                bytes_per_line: plane.bytesperline,
                size_image: plane.sizeimage,
            })
        } else {
            let pix = unsafe { fmt.fmt.pix };
            Ok(FormatInfo {
                width: pix.width,
                height: pix.height,
                pixel_format: PixelFormat(pix.pixelformat),
                bytes_per_line: pix.bytesperline,
                size_image: pix.sizeimage,
            })
        }
    }

    fn request_buffers(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
        count: u32,
    ) -> io::Result<u32> {
        let mut req: vd::v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = queue.id();
        req.memory = memory as u32;
        unsafe {
            vd::ioctl(fd, vd::VIDIOC_REQBUFS, &mut req as *mut _ as *mut _)?;
        }
        Ok(req.count)
    }

    fn query_buffer(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
        index: u32,
    ) -> io::Result<BufferInfo> {
        let mut plane: vd::v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: vd::v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = queue.id();
        buf.memory = memory as u32;
        if queue.is_mplane() {
            buf.length = 1;
            buf.m.planes = &mut plane;
        }
        unsafe {
            vd::ioctl(fd, vd::VIDIOC_QUERYBUF, &mut buf as *mut _ as *mut _)?;
        }
        let (offset, length) = if queue.is_mplane() {
            (unsafe { plane.m.mem_offset }, plane.length)
        } else {
            (unsafe { buf.m.offset }, buf.length)
        };
        Ok(BufferInfo {
            index,
            flags: BufferFlags::from_bits_truncate(buf.flags),
            offset,
            length,
        })
    }

    fn map_buffer(&self, fd: RawFd, info: &BufferInfo) -> io::Result<MappedRegion> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                info.length as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                info.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { MappedRegion::from_raw(ptr as *mut u8, info.length as usize) })
    }

    fn export_buffer(&self, fd: RawFd, queue: QueueType, index: u32) -> io::Result<OwnedFd> {
        let mut exp: vd::v4l2_exportbuffer = unsafe { mem::zeroed() };
        exp.type_ = queue.id();
        exp.index = index;
        exp.flags = (libc::O_RDWR | libc::O_CLOEXEC) as u32;
        unsafe {
            vd::ioctl(fd, vd::VIDIOC_EXPBUF, &mut exp as *mut _ as *mut _)?;
        }
        Ok(unsafe { OwnedFd::from_raw_fd(exp.fd) })
    }

    fn queue_buffer(&self, fd: RawFd, req: &QueueRequest) -> io::Result<()> {
        let mut plane: vd::v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: vd::v4l2_buffer = unsafe { mem::zeroed() };
        buf.index = req.index;
        buf.type_ = req.queue.id();
        buf.memory = req.memory as u32;
        if req.queue.is_mplane() {
            plane.bytesused = req.bytes_used;
            if let Some(dma_fd) = req.dma_fd {
                plane.m.fd = dma_fd;
            }
            buf.length = 1;
            buf.m.planes = &mut plane;
        } else {
            buf.bytesused = req.bytes_used;
            if let Some(dma_fd) = req.dma_fd {
                buf.m.fd = dma_fd;
            }
        }
        unsafe { vd::ioctl(fd, vd::VIDIOC_QBUF, &mut buf as *mut _ as *mut _) }
    }

    fn dequeue_buffer(
        &self,
        fd: RawFd,
        queue: QueueType,
        memory: MemoryType,
    ) -> io::Result<DequeuedBuffer> {
        let mut plane: vd::v4l2_plane = unsafe { mem::zeroed() };
        let mut buf: vd::v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = queue.id();
        buf.memory = memory as u32;
        if queue.is_mplane() {
            buf.length = 1;
            buf.m.planes = &mut plane;
        }
        unsafe {
            vd::ioctl(fd, vd::VIDIOC_DQBUF, &mut buf as *mut _ as *mut _)?;
        }
        let bytes_used = if queue.is_mplane() {
            plane.bytesused
        } else {
            buf.bytesused
        };
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used,
            flags: BufferFlags::from_bits_truncate(buf.flags),
        })
    }

    fn stream_on(&self, fd: RawFd, queue: QueueType) -> io::Result<()> {
        let mut typ = queue.id() as std::os::raw::c_int;
        unsafe { vd::ioctl(fd, vd::VIDIOC_STREAMON, &mut typ as *mut _ as *mut _) }
    }

    fn stream_off(&self, fd: RawFd, queue: QueueType) -> io::Result<()> {
        let mut typ = queue.id() as std::os::raw::c_int;
        unsafe { vd::ioctl(fd, vd::VIDIOC_STREAMOFF, &mut typ as *mut _ as *mut _) }
    }

    fn poll(&self, fds: &mut [PollFd], timeout_ms: i32) -> io::Result<u32> {
        let mut raw: Vec<libc::pollfd> = fds
            .iter()
            .map(|p| libc::pollfd {
                fd: p.fd,
                events: p.events.bits() as i16,
                revents: 0,
            })
            .collect();
        let ret = unsafe { libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout_ms) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        for (p, r) in fds.iter_mut().zip(raw.iter()) {
            p.revents = PollEvents::from_bits_truncate(r.revents as u16);
        }
        Ok(ret as u32)
    }

    fn now_us(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
    }

    fn set_frame_interval(&self, fd: RawFd, queue: QueueType, rate: Framerate) -> io::Result<()> {
        let mut parm: vd::v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = queue.id();
        let timeperframe = vd::v4l2_fract {
            numerator: rate.den,
            denominator: rate.num,
        };
        if queue.is_capture() {
            let capture = unsafe { &mut parm.parm.capture };
            capture.timeperframe = timeperframe;
        } else {
            let output = unsafe { &mut parm.parm.output };
            output.timeperframe = timeperframe;
        }
        unsafe { vd::ioctl(fd, vd::VIDIOC_S_PARM, &mut parm as *mut _ as *mut _) }
    }

    fn set_control(&self, fd: RawFd, name: &str, value: i64) -> io::Result<()> {
        let wanted = normalize_control_name(name);
        let mut qctrl: vd::v4l2_query_ext_ctrl = unsafe { mem::zeroed() };
        qctrl.id = vd::V4L2_CTRL_FLAG_NEXT_CTRL | vd::V4L2_CTRL_FLAG_NEXT_COMPOUND;
        loop {
            if unsafe { vd::ioctl(fd, vd::VIDIOC_QUERY_EXT_CTRL, &mut qctrl as *mut _ as *mut _) }
                .is_err()
            {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("control not found: {name}"),
                ));
            }
            let ctrl_name = unsafe { CStr::from_ptr(qctrl.name.as_ptr()) };
            if normalize_control_name(&ctrl_name.to_string_lossy()) == wanted {
                let mut ctrl = vd::v4l2_control {
                    id: qctrl.id,
                    value: value as i32,
                };
                return unsafe { vd::ioctl(fd, vd::VIDIOC_S_CTRL, &mut ctrl as *mut _ as *mut _) };
            }
            qctrl.id |= vd::V4L2_CTRL_FLAG_NEXT_CTRL | vd::V4L2_CTRL_FLAG_NEXT_COMPOUND;
        }
    }

    fn set_decoder_start(&self, fd: RawFd, on: bool) -> io::Result<()> {
        let mut cmd: vd::v4l2_decoder_cmd = unsafe { mem::zeroed() };
        cmd.cmd = if on {
            vd::V4L2_DEC_CMD_START
        } else {
            vd::V4L2_DEC_CMD_STOP
        };
        unsafe { vd::ioctl(fd, vd::VIDIOC_DECODER_CMD, &mut cmd as *mut _ as *mut _) }
    }

    fn force_key_frame(&self, fd: RawFd) -> io::Result<()> {
        let mut ctrl = vd::v4l2_control {
            id: vd::V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME,
            value: 1,
        };
        unsafe { vd::ioctl(fd, vd::VIDIOC_S_CTRL, &mut ctrl as *mut _ as *mut _) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_name_normalization() {
        assert_eq!(
            normalize_control_name("H264 I-Frame Period"),
            "h264_i_frame_period"
        );
        assert_eq!(normalize_control_name("video_bitrate"), "video_bitrate");
        assert_eq!(normalize_control_name("Compression Quality"), "compression_quality");
    }
}
