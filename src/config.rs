//! Configuration types for camstream

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PixelFormat;

/// Camera device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Video node to capture from
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Pixel format to request; `None` keeps the driver default
    pub format: Option<PixelFormat>,
    /// Buffers per queue
    pub nbufs: u32,
    pub fps: u32,
    /// Share frames downstream by exported descriptors instead of copies
    pub allow_dma: bool,
    /// Scale of the full-resolution ISP tap relative to the sensor
    pub high_res_factor: f32,
    /// Scale of the reduced ISP tap; 0 disables it, a non-zero value opens
    /// it and feeds the encoders from it instead of the full stream
    pub low_res_factor: f32,
    /// Driver controls applied at startup, as `name=value` pairs
    pub options: Vec<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            width: 1920,
            height: 1080,
            format: None,
            nbufs: 3,
            fps: 30,
            allow_dma: true,
            high_res_factor: 1.0,
            low_res_factor: 0.0,
            options: Vec::new(),
        }
    }
}

impl CameraConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_nbufs(mut self, nbufs: u32) -> Self {
        self.nbufs = nbufs;
        self
    }
}

/// ISP device group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IspConfig {
    /// Node that receives raw camera frames
    pub output_path: PathBuf,
    /// Node that produces the full-resolution processed stream
    pub capture_path: PathBuf,
    /// Node that produces the reduced-resolution stream; opened only when
    /// the camera's `low_res_factor` is non-zero
    pub low_capture_path: Option<PathBuf>,
    pub options: Vec<String>,
}

impl Default for IspConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("/dev/video13"),
            capture_path: PathBuf::from("/dev/video14"),
            low_capture_path: Some(PathBuf::from("/dev/video15")),
            options: Vec::new(),
        }
    }
}

/// Hardware codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub path: PathBuf,
    pub options: Vec<String>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video31"),
            options: Vec::new(),
        }
    }
}

impl CodecConfig {
    /// JPEG encoder defaults
    pub fn jpeg() -> Self {
        Self {
            path: PathBuf::from("/dev/video31"),
            options: vec!["compression_quality=80".into()],
        }
    }

    /// H.264 encoder defaults
    pub fn h264() -> Self {
        Self {
            path: PathBuf::from("/dev/video11"),
            options: vec![
                "video_bitrate_mode=0".into(),
                "video_bitrate=5000000".into(),
                "repeat_sequence_header=5000000".into(),
                "h264_i_frame_period=30".into(),
                "h264_level=11".into(),
                "h264_profile=4".into(),
                "h264_minimum_qp_value=16".into(),
                "h264_maximum_qp_value=32".into(),
            ],
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub isp: Option<IspConfig>,
    pub jpeg: Option<CodecConfig>,
    pub h264: Option<CodecConfig>,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Split a `name=value` option pair; the value must be an integer.
pub fn parse_option(option: &str) -> Option<(&str, i64)> {
    let (key, value) = option.split_once('=')?;
    let key = key.trim();
    let value = value.trim().parse().ok()?;
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_option() {
        assert_eq!(
            parse_option("video_bitrate=5000000"),
            Some(("video_bitrate", 5_000_000))
        );
        assert_eq!(parse_option("broken"), None);
        assert_eq!(parse_option("=5"), None);
        assert_eq!(parse_option("quality=high"), None);
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[camera]
path = "/dev/video2"
width = 1280
height = 720
format = "MJPG"
fps = 60

[jpeg]
path = "/dev/video31"
options = ["compression_quality=90"]
"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.camera.path, PathBuf::from("/dev/video2"));
        assert_eq!(config.camera.width, 1280);
        assert_eq!(config.camera.fps, 60);
        assert_eq!(config.camera.format, Some(PixelFormat::MJPEG));
        // Unspecified sections and fields keep their defaults.
        assert_eq!(config.camera.nbufs, 3);
        assert!(config.isp.is_none());
        assert_eq!(
            config.jpeg.unwrap().options,
            vec!["compression_quality=90".to_string()]
        );
    }
}
