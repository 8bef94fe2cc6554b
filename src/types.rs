//! Common types used throughout camstream

use serde::{Deserialize, Serialize};

/// Four-character pixel format code as used by the kernel video API.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const fn fourcc(code: &[u8; 4]) -> Self {
        Self(
            (code[0] as u32)
                | ((code[1] as u32) << 8)
                | ((code[2] as u32) << 16)
                | ((code[3] as u32) << 24),
        )
    }

    // Formats the original pipeline negotiates at one stage or another
    pub const YUYV: Self = Self::fourcc(b"YUYV");
    pub const YUV420: Self = Self::fourcc(b"YU12");
    pub const NV12: Self = Self::fourcc(b"NV12");
    pub const MJPEG: Self = Self::fourcc(b"MJPG");
    pub const JPEG: Self = Self::fourcc(b"JPEG");
    pub const H264: Self = Self::fourcc(b"H264");
    pub const SRGGB10P: Self = Self::fourcc(b"pRAA");
    pub const RGB565: Self = Self::fourcc(b"RGBP");
    pub const RGB24: Self = Self::fourcc(b"RGB3");

    /// Parse a format name as accepted on the command line.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "YUYV" => Some(Self::YUYV),
            "YUV420" => Some(Self::YUV420),
            "NV12" => Some(Self::NV12),
            "MJPG" | "MJPEG" => Some(Self::MJPEG),
            "JPEG" => Some(Self::JPEG),
            "H264" => Some(Self::H264),
            "RG10" | "SRGGB10P" => Some(Self::SRGGB10P),
            "RGB565" | "RGBP" => Some(Self::RGB565),
            "RGB24" | "RGB" => Some(Self::RGB24),
            _ => None,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_le_bytes();
        for c in b {
            if c.is_ascii_graphic() || c == b' ' {
                write!(f, "{}", c as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PixelFormat({})", self)
    }
}

impl From<String> for PixelFormat {
    fn from(s: String) -> Self {
        PixelFormat::parse(&s).unwrap_or(PixelFormat::YUYV)
    }
}

impl From<PixelFormat> for String {
    fn from(f: PixelFormat) -> Self {
        f.to_string()
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const HD_720P: Self = Self::new(1280, 720);
    pub const FHD_1080P: Self = Self::new(1920, 1080);

    /// Scale both dimensions, e.g. for a reduced-resolution ISP tap.
    ///
    /// Results are rounded down to even values (planar formats want even
    /// dimensions), with a floor of 2.
    pub fn scaled(&self, factor: f32) -> Self {
        let scale = |v: u32| ((v as f32 * factor) as u32).max(2) & !1;
        Self::new(scale(self.width), scale(self.height))
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::FHD_1080P
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Framerate representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framerate {
    pub num: u32,
    pub den: u32,
}

impl Framerate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub const FPS_30: Self = Self::new(30, 1);
    pub const FPS_60: Self = Self::new(60, 1);

    /// Get framerate as integer fps (numerator when den=1)
    pub fn fps(&self) -> u32 {
        if self.den == 0 {
            self.num
        } else {
            self.num / self.den
        }
    }

    /// Frame interval in microseconds
    pub fn interval_us(&self) -> u64 {
        if self.num == 0 {
            return 0;
        }
        (1_000_000u64 * self.den as u64) / self.num as u64
    }
}

impl Default for Framerate {
    fn default() -> Self {
        Self::FPS_30
    }
}

impl std::fmt::Display for Framerate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{} fps", self.num)
        } else {
            write!(f, "{}/{} fps", self.num, self.den)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_roundtrip() {
        assert_eq!(PixelFormat::YUYV.to_string(), "YUYV");
        assert_eq!(PixelFormat::parse("mjpeg"), Some(PixelFormat::MJPEG));
        assert_eq!(PixelFormat::parse("nonsense"), None);
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(Framerate::FPS_30.interval_us(), 33_333);
        assert_eq!(Framerate::new(0, 1).interval_us(), 0);
    }

    #[test]
    fn test_scaled_resolution() {
        assert_eq!(Resolution::FHD_1080P.scaled(0.5), Resolution::new(960, 540));
        assert_eq!(Resolution::FHD_1080P.scaled(1.0), Resolution::FHD_1080P);
        // Odd results round down to even.
        assert_eq!(Resolution::new(1280, 720).scaled(0.33), Resolution::new(422, 236));
    }
}
