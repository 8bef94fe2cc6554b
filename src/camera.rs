//! Camera pipeline assembly
//!
//! Opens the camera node, the optional ISP device group and hardware
//! codecs, wires them into a link graph and runs the scheduler. The
//! topology follows the classic embedded layout: the sensor feeds the ISP
//! input node, the ISP exposes a full-resolution tap and an optional
//! reduced-resolution tap, one of the taps fans out to the JPEG and H.264
//! encoders, and the encoder capture queues are the consumer-facing ends
//! of the graph.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer_list::BufferList;
use crate::config::{parse_option, Config};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::links::{Callbacks, Link, LinkGraph};
use crate::types::{PixelFormat, Resolution};
use crate::v4l2::VideoBackend;

/// Latest JPEG frame, refreshed by the snapshot consumer.
pub type SnapshotLatch = Arc<Mutex<Vec<u8>>>;

/// An assembled capture pipeline.
pub struct Camera {
    camera: Device,
    // Held for the lifetime of the graph; their pools live in the links.
    #[allow(dead_code)]
    isp_out: Option<Device>,
    #[allow(dead_code)]
    isp_high: Option<Device>,
    #[allow(dead_code)]
    isp_low: Option<Device>,
    #[allow(dead_code)]
    jpeg: Option<Device>,
    #[allow(dead_code)]
    h264: Option<Device>,
    graph: LinkGraph,
    snapshot: SnapshotLatch,
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera").finish_non_exhaustive()
    }
}

impl Camera {
    /// Open every configured device and freeze the link graph.
    pub fn open(config: &Config, backend: Arc<dyn VideoBackend>) -> Result<Self> {
        let cam_cfg = &config.camera;
        let camera = Device::open("CAMERA", &cam_cfg.path, backend.clone())?;
        camera.set_allow_dma(cam_cfg.allow_dma);
        let camera_list = camera.open_buffer_list(
            true,
            cam_cfg.width,
            cam_cfg.height,
            cam_cfg.format.unwrap_or(PixelFormat::YUYV),
            cam_cfg.nbufs,
        )?;
        camera.set_fps(cam_cfg.fps)?;
        apply_options(&camera, &cam_cfg.options);

        let snapshot: SnapshotLatch = Arc::new(Mutex::new(Vec::new()));
        let mut links = Vec::new();

        // The stream the encoders consume: one of the ISP taps when an ISP
        // is configured (the reduced one when `low_res_factor` asks for
        // it), the raw camera stream otherwise. The tap that does not feed
        // the encoders stays in the graph as a sinkless link.
        let (isp_out, isp_high, isp_low, codec_feed, idle_tap) = match &config.isp {
            Some(isp_cfg) => {
                let isp_out = Device::open("ISP", &isp_cfg.output_path, backend.clone())?;
                apply_options(&isp_out, &isp_cfg.options);

                let cam_fmt = camera_list.format();
                let isp_in = isp_out.open_buffer_list(
                    false,
                    cam_fmt.width,
                    cam_fmt.height,
                    cam_fmt.pixel_format,
                    cam_cfg.nbufs,
                )?;

                let sensor_res = Resolution::new(cam_fmt.width, cam_fmt.height);
                let isp_high = Device::open("ISP-HIGH", &isp_cfg.capture_path, backend.clone())?;
                let high_res = sensor_res.scaled(cam_cfg.high_res_factor);
                let high_cap = isp_high.open_buffer_list(
                    true,
                    high_res.width,
                    high_res.height,
                    PixelFormat::YUYV,
                    cam_cfg.nbufs,
                )?;

                let (isp_low, low_cap) = if cam_cfg.low_res_factor > 0.0 {
                    let low_path = isp_cfg.low_capture_path.as_ref().ok_or_else(|| {
                        Error::Config(
                            "low_res_factor is set but isp.low_capture_path is not".into(),
                        )
                    })?;
                    let isp_low = Device::open("ISP-LOW", low_path, backend.clone())?;
                    let low_res = sensor_res.scaled(cam_cfg.low_res_factor);
                    let low_cap = isp_low.open_buffer_list(
                        true,
                        low_res.width,
                        low_res.height,
                        PixelFormat::YUYV,
                        cam_cfg.nbufs,
                    )?;
                    (Some(isp_low), Some(low_cap))
                } else {
                    (None, None)
                };

                links.push(Link::new(camera_list.clone()).sink(isp_in));

                // Only the tap that feeds the encoders shares pause state
                // with the ISP input node; the idle tap is permanently
                // paused and must not stall the chain through the pairing.
                let (feed, idle) = match (isp_low.as_ref(), low_cap) {
                    (Some(isp_low), Some(low_cap)) => {
                        isp_low.pair_output_device(&isp_out);
                        (low_cap, Some(high_cap))
                    }
                    _ => {
                        isp_high.pair_output_device(&isp_out);
                        (high_cap, None)
                    }
                };
                (Some(isp_out), Some(isp_high), isp_low, feed, idle)
            }
            None => (None, None, None, camera_list.clone(), None),
        };

        let mut codec_outs: Vec<Arc<BufferList>> = Vec::new();
        let mut consumer_links: Vec<Link> = Vec::new();

        let jpeg = match &config.jpeg {
            Some(codec_cfg) => {
                let dev = Device::open("JPEG", &codec_cfg.path, backend.clone())?;
                dev.set_allow_dma(false);
                let feed_fmt = codec_feed.format();
                let out = dev.open_buffer_list(
                    false,
                    feed_fmt.width,
                    feed_fmt.height,
                    feed_fmt.pixel_format,
                    cam_cfg.nbufs,
                )?;
                let cap = dev.open_buffer_list(
                    true,
                    feed_fmt.width,
                    feed_fmt.height,
                    PixelFormat::JPEG,
                    cam_cfg.nbufs,
                )?;
                apply_options(&dev, &codec_cfg.options);
                codec_outs.push(out);

                let latch = snapshot.clone();
                consumer_links.push(Link::new(cap).callbacks(
                    Callbacks::new()
                        .on_buffer(move |frame| {
                            // Keep the frame alive just long enough to copy it.
                            if frame.retain().is_err() {
                                return;
                            }
                            if let Some(bytes) = frame.bytes() {
                                let mut snap = latch.lock();
                                snap.clear();
                                snap.extend_from_slice(bytes);
                            }
                            let _ = frame.release();
                        })
                        .check_streaming(|| true),
                ));
                Some(dev)
            }
            None => None,
        };

        let h264 = match &config.h264 {
            Some(codec_cfg) => {
                let dev = Device::open("H264", &codec_cfg.path, backend.clone())?;
                dev.set_allow_dma(false);
                let feed_fmt = codec_feed.format();
                let out = dev.open_buffer_list(
                    false,
                    feed_fmt.width,
                    feed_fmt.height,
                    feed_fmt.pixel_format,
                    cam_cfg.nbufs,
                )?;
                let cap = dev.open_buffer_list(
                    true,
                    feed_fmt.width,
                    feed_fmt.height,
                    PixelFormat::H264,
                    cam_cfg.nbufs,
                )?;
                apply_options(&dev, &codec_cfg.options);
                codec_outs.push(out);
                consumer_links
                    .push(Link::new(cap).callbacks(Callbacks::new().check_streaming(|| true)));
                Some(dev)
            }
            None => None,
        };

        if codec_outs.is_empty() && config.isp.is_none() {
            // Bare camera: consume frames straight off the sensor.
            let latch = snapshot.clone();
            links.push(
                Link::new(camera_list).callbacks(
                    Callbacks::new()
                        .on_buffer(move |frame| {
                            if frame.retain().is_err() {
                                return;
                            }
                            if let Some(bytes) = frame.bytes() {
                                let mut snap = latch.lock();
                                snap.clear();
                                snap.extend_from_slice(bytes);
                            }
                            let _ = frame.release();
                        })
                        .check_streaming(|| true),
                ),
            );
        } else {
            let mut feed_link = if config.isp.is_some() {
                Link::new(codec_feed)
            } else {
                Link::new(camera_list)
            };
            for out in codec_outs {
                feed_link = feed_link.sink(out);
            }
            links.push(feed_link);
        }
        if let Some(idle_tap) = idle_tap {
            links.push(Link::new(idle_tap));
        }
        links.extend(consumer_links);

        let graph = LinkGraph::new(links)?;
        Ok(Self {
            camera,
            isp_out,
            isp_high,
            isp_low,
            jpeg,
            h264,
            graph,
            snapshot,
        })
    }

    pub fn camera_device(&self) -> &Device {
        &self.camera
    }

    pub fn graph(&self) -> &LinkGraph {
        &self.graph
    }

    /// Latest consumer-visible frame (JPEG when a codec is configured).
    pub fn snapshot(&self) -> SnapshotLatch {
        self.snapshot.clone()
    }

    /// Drive the scheduler until `running` clears or a device fails.
    pub fn run(&self, running: &AtomicBool) -> Result<()> {
        let result = self.graph.run(running);
        for link in self.graph.links() {
            tracing::info!(
                "{}: {} frames",
                link.source.name(),
                link.source.frames()
            );
        }
        result
    }
}

fn apply_options(dev: &Device, options: &[String]) {
    for option in options {
        match parse_option(option) {
            Some((key, value)) => {
                if let Err(e) = dev.set_option(key, value) {
                    tracing::warn!("{}: option {} rejected: {}", dev.name(), option, e);
                }
            }
            None => tracing::warn!("{}: malformed option: {}", dev.name(), option),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v4l2::VirtualBackend;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_bare_camera_graph() {
        let backend = Arc::new(VirtualBackend::new());
        let config = Config::default();
        let camera = Camera::open(&config, backend.clone()).unwrap();
        assert_eq!(camera.graph().links().len(), 1);
        assert!(camera.graph().links()[0].sinks.is_empty());
    }

    #[test]
    fn test_full_graph_topology() {
        let backend = Arc::new(VirtualBackend::new());
        let config = Config {
            isp: Some(Default::default()),
            jpeg: Some(crate::config::CodecConfig::jpeg()),
            h264: Some(crate::config::CodecConfig::h264()),
            ..Default::default()
        };
        let camera = Camera::open(&config, backend.clone()).unwrap();
        let links = camera.graph().links();
        // camera -> isp, isp -> codecs, plus one consumer link per codec
        assert_eq!(links.len(), 4);
        assert_eq!(links[0].sinks.len(), 1);
        assert_eq!(links[1].sinks.len(), 2);
        assert!(links[2].sinks.is_empty());
        assert!(links[3].sinks.is_empty());
    }

    #[test]
    fn test_low_res_tap_feeds_codecs() {
        let backend = Arc::new(VirtualBackend::new());
        let mut config = Config {
            isp: Some(Default::default()),
            jpeg: Some(crate::config::CodecConfig::jpeg()),
            h264: Some(crate::config::CodecConfig::h264()),
            ..Default::default()
        };
        config.camera.low_res_factor = 0.5;
        let camera = Camera::open(&config, backend.clone()).unwrap();
        let links = camera.graph().links();
        // camera -> isp, low tap -> codecs, idle full tap, two consumers
        assert_eq!(links.len(), 5);
        assert_eq!(links[1].sinks.len(), 2);
        let feed_fmt = links[1].source.format();
        assert_eq!((feed_fmt.width, feed_fmt.height), (960, 540));
        assert!(links[2].sinks.is_empty());
        let idle_fmt = links[2].source.format();
        assert_eq!((idle_fmt.width, idle_fmt.height), (1920, 1080));
    }

    #[test]
    fn test_low_res_without_path_rejected() {
        let backend = Arc::new(VirtualBackend::new());
        let mut config = Config {
            isp: Some(Default::default()),
            ..Default::default()
        };
        config.camera.low_res_factor = 0.5;
        config.isp.as_mut().unwrap().low_capture_path = None;
        let err = Camera::open(&config, backend.clone()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_virtual_run_captures_frames() {
        let backend = Arc::new(VirtualBackend::new());
        let config = Config::default();
        let camera = Camera::open(&config, backend.clone()).unwrap();
        backend.start_frame_source(camera.camera_device().fd(), 33_333, 1024);

        let running = AtomicBool::new(true);
        let graph = camera.graph();
        graph.set_streaming(true).unwrap();
        for _ in 0..40 {
            graph.step().unwrap();
        }
        running.store(false, Ordering::SeqCst);
        graph.set_streaming(false).unwrap();

        assert!(graph.links()[0].source.frames() > 0);
        assert!(!camera.snapshot().lock().is_empty());
    }
}
