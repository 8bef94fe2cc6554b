//! Minimal videodev2 ABI: the structs and ioctl codes the backend touches.
//!
//! Layouts follow linux/videodev2.h; only the fields this crate exercises
//! get real names, everything else is reserved padding.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_ulong, c_void};

#[cfg(not(target_env = "musl"))]
pub type IoctlCode = c_ulong;
#[cfg(target_env = "musl")]
pub type IoctlCode = std::os::raw::c_int;

// linux ioctl.h encoding
const _IOC_NRBITS: u8 = 8;
const _IOC_TYPEBITS: u8 = 8;
const _IOC_SIZEBITS: u8 = 14;

const _IOC_NRSHIFT: u8 = 0;
const _IOC_TYPESHIFT: u8 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u8 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u8 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u8 = 1;
const _IOC_READ: u8 = 2;

const fn ioc(dir: u8, ty: u8, nr: u8, size: usize) -> IoctlCode {
    (((dir as u32) << _IOC_DIRSHIFT)
        | ((ty as u32) << _IOC_TYPESHIFT)
        | ((nr as u32) << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)) as IoctlCode
}

const fn ior<T>(ty: u8, nr: u8) -> IoctlCode {
    ioc(_IOC_READ, ty, nr, std::mem::size_of::<T>())
}

const fn iow<T>(ty: u8, nr: u8) -> IoctlCode {
    ioc(_IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u8) -> IoctlCode {
    ioc(_IOC_READ | _IOC_WRITE, ty, nr, std::mem::size_of::<T>())
}

pub const VIDIOC_QUERYCAP: IoctlCode = ior::<v4l2_capability>(b'V', 0);
pub const VIDIOC_S_FMT: IoctlCode = iowr::<v4l2_format>(b'V', 5);
pub const VIDIOC_REQBUFS: IoctlCode = iowr::<v4l2_requestbuffers>(b'V', 8);
pub const VIDIOC_QUERYBUF: IoctlCode = iowr::<v4l2_buffer>(b'V', 9);
pub const VIDIOC_QBUF: IoctlCode = iowr::<v4l2_buffer>(b'V', 15);
pub const VIDIOC_EXPBUF: IoctlCode = iowr::<v4l2_exportbuffer>(b'V', 16);
pub const VIDIOC_DQBUF: IoctlCode = iowr::<v4l2_buffer>(b'V', 17);
pub const VIDIOC_STREAMON: IoctlCode = iow::<std::os::raw::c_int>(b'V', 18);
pub const VIDIOC_STREAMOFF: IoctlCode = iow::<std::os::raw::c_int>(b'V', 19);
pub const VIDIOC_S_PARM: IoctlCode = iowr::<v4l2_streamparm>(b'V', 22);
pub const VIDIOC_S_CTRL: IoctlCode = iowr::<v4l2_control>(b'V', 28);
pub const VIDIOC_DECODER_CMD: IoctlCode = iowr::<v4l2_decoder_cmd>(b'V', 96);
pub const VIDIOC_QUERY_EXT_CTRL: IoctlCode = iowr::<v4l2_query_ext_ctrl>(b'V', 103);

pub const V4L2_CTRL_FLAG_NEXT_CTRL: u32 = 0x8000_0000;
pub const V4L2_CTRL_FLAG_NEXT_COMPOUND: u32 = 0x4000_0000;

// V4L2_CID_CODEC_BASE + 229
pub const V4L2_CID_MPEG_VIDEO_FORCE_KEY_FRAME: u32 = 0x0099_0900 + 229;

pub const V4L2_DEC_CMD_START: u32 = 0;
pub const V4L2_DEC_CMD_STOP: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; 8],
    pub num_planes: u8,
    pub flags: u8,
    pub ycbcr_enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_union {
    pub pix: v4l2_pix_format,
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_union,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub reserved: [u32; 1],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_plane_union {
    pub mem_offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_union,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_union {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_union,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_captureparm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: v4l2_fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_outputparm {
    pub capability: u32,
    pub outputmode: u32,
    pub timeperframe: v4l2_fract,
    pub extendedmode: u32,
    pub writebuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_streamparm_union {
    pub capture: v4l2_captureparm,
    pub output: v4l2_outputparm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_streamparm {
    pub type_: u32,
    pub parm: v4l2_streamparm_union,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_query_ext_ctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [c_char; 32],
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: u32,
    pub elem_size: u32,
    pub elems: u32,
    pub nr_of_dims: u32,
    pub dims: [u32; 4],
    pub reserved: [u32; 32],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_decoder_cmd {
    pub cmd: u32,
    pub flags: u32,
    pub raw: [u32; 16],
}

/// Thin ioctl wrapper reporting errno as `io::Error`.
///
/// # Safety
///
/// `argp` must point at the struct matching `request`.
pub unsafe fn ioctl(fd: i32, request: IoctlCode, argp: *mut c_void) -> std::io::Result<()> {
    // The libc crate defines ioctl() with incompatible argument types on
    // different platforms; going through syscall() sidesteps that.
    let ret = libc::syscall(libc::SYS_ioctl, fd, request, argp) as std::os::raw::c_int;
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}
