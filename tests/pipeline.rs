//! End-to-end pipeline scenarios against the virtual backend.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use camstream::{
    BufferList, Callbacks, Device, Error, Link, LinkGraph, PixelFormat, VideoBackend,
    VirtualBackend,
};

fn open_device(backend: &Arc<VirtualBackend>, name: &str, path: &str) -> Device {
    let dyn_backend: Arc<dyn VideoBackend> = backend.clone();
    Device::open(name, Path::new(path), dyn_backend).unwrap()
}

fn open_source(
    backend: &Arc<VirtualBackend>,
    name: &str,
    nbufs: u32,
    slot_len: usize,
) -> (Device, Arc<BufferList>) {
    let dev = open_device(backend, name, &format!("/dev/{name}"));
    backend.set_slot_size(dev.fd(), true, slot_len);
    let list = dev
        .open_buffer_list(true, 64, 48, PixelFormat::YUYV, nbufs)
        .unwrap();
    (dev, list)
}

fn open_sink(
    backend: &Arc<VirtualBackend>,
    name: &str,
    nbufs: u32,
    slot_len: usize,
    dma: bool,
) -> (Device, Arc<BufferList>) {
    let dev = open_device(backend, name, &format!("/dev/{name}"));
    dev.set_allow_dma(dma);
    backend.set_slot_size(dev.fd(), false, slot_len);
    let list = dev
        .open_buffer_list(false, 64, 48, PixelFormat::YUYV, nbufs)
        .unwrap();
    (dev, list)
}

/// The ownership invariants that must hold on every scheduler boundary.
fn check_invariants(backend: &VirtualBackend, lists: &[&Arc<BufferList>]) {
    for list in lists {
        for buf in list.buffers() {
            if buf.enqueued() {
                assert_eq!(buf.reflinks(), 0, "{}: enqueued with live refs", buf.name());
            }
            if buf.reflinks() > 0 {
                assert!(!buf.enqueued(), "{}: referenced but kernel-owned", buf.name());
            }
            if let Some(source) = buf.source() {
                assert!(
                    source.buffer().reflinks() >= 1,
                    "{}: upstream lost its reference",
                    buf.name()
                );
            }
            assert!(buf.used() <= buf.length(), "{}: used beyond capacity", buf.name());
        }
        assert_eq!(
            backend.kernel_depth(list.device().fd(), list.is_capture()),
            list.count_enqueued(),
            "{}: kernel depth and pool disagree",
            list.name()
        );
    }
}

#[test]
fn test_mmap_single_source_single_sink() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-src", 3, 1024);
    let (sink_dev, sink_list) = open_sink(&backend, "video-sink", 3, 1024, false);
    backend.set_auto_complete(sink_dev.fd(), true);

    let graph = LinkGraph::new(vec![Link::new(src_list.clone()).sink(sink_list.clone())]).unwrap();
    graph.set_streaming(true).unwrap();

    let mut produced = 0;
    let mut iterations = 0;
    while src_list.frames() < 10 {
        if produced < 10 && backend.produce_frame(src_dev.fd(), 512) {
            produced += 1;
        }
        graph.step().unwrap();
        check_invariants(&backend, &[&src_list, &sink_list]);
        iterations += 1;
        assert!(iterations < 200, "pipeline stalled");
    }
    // Let the sink drain what is still in flight.
    for _ in 0..6 {
        graph.step().unwrap();
        check_invariants(&backend, &[&src_list, &sink_list]);
    }

    assert_eq!(backend.stats(src_dev.fd(), true).dequeued, 10);
    assert_eq!(backend.stats(sink_dev.fd(), false).queued, 10);
    for buf in src_list.buffers() {
        assert_eq!(buf.reflinks(), 0);
        assert!(!buf.has_source());
    }
    for buf in sink_list.buffers() {
        assert!(buf.reflinks() <= 1);
        assert!(!buf.has_source());
    }

    graph.set_streaming(false).unwrap();
}

#[test]
fn test_dma_fanout_to_two_sinks() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-dma-src", 3, 1024);
    let (sink_a_dev, sink_a) = open_sink(&backend, "video-dma-a", 3, 1024, true);
    let (sink_b_dev, sink_b) = open_sink(&backend, "video-dma-b", 3, 1024, true);

    let forwarded = Arc::new(AtomicU32::new(u32::MAX));
    let seen = forwarded.clone();
    let graph = LinkGraph::new(vec![Link::new(src_list.clone())
        .sink(sink_a.clone())
        .sink(sink_b.clone())
        .callbacks(Callbacks::new().on_buffer(move |frame| {
            seen.store(frame.index(), Ordering::SeqCst);
        }))])
    .unwrap();
    graph.set_streaming(true).unwrap();

    graph.step().unwrap(); // primes the source queue
    assert!(backend.produce_frame(src_dev.fd(), 800));
    graph.step().unwrap();
    check_invariants(&backend, &[&src_list, &sink_a, &sink_b]);

    let index = forwarded.load(Ordering::SeqCst) as usize;
    assert_ne!(index, u32::MAX as usize, "no frame was forwarded");
    let frame = &src_list.buffers()[index];
    // One reference per DMA sink survives the fan-out.
    assert_eq!(frame.reflinks(), 2);
    assert!(!frame.enqueued());
    assert_eq!(frame.used(), 800);

    // First sink finishes: one reference comes back.
    assert!(backend.complete_output(sink_a_dev.fd()));
    graph.step().unwrap();
    check_invariants(&backend, &[&src_list, &sink_a, &sink_b]);
    assert_eq!(frame.reflinks(), 1);
    assert!(!frame.enqueued());

    // Second sink finishes: the source buffer re-enters the kernel once.
    assert!(backend.complete_output(sink_b_dev.fd()));
    graph.step().unwrap();
    check_invariants(&backend, &[&src_list, &sink_a, &sink_b]);
    assert_eq!(frame.reflinks(), 0);
    assert!(frame.enqueued());
    assert_eq!(frame.used(), 0);

    graph.set_streaming(false).unwrap();
}

#[test]
fn test_mmap_capacity_overflow_is_isolated() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-big-src", 3, 4096);
    let (sink_dev, sink_list) = open_sink(&backend, "video-small-sink", 3, 1024, false);

    let graph = LinkGraph::new(vec![Link::new(src_list.clone()).sink(sink_list.clone())]).unwrap();
    graph.set_streaming(true).unwrap();

    graph.step().unwrap();
    assert!(backend.produce_frame(src_dev.fd(), 2048));
    graph.step().unwrap();
    check_invariants(&backend, &[&src_list, &sink_list]);

    // The oversized frame never reached the sink and the source buffer
    // went straight back to the kernel.
    assert_eq!(backend.stats(sink_dev.fd(), false).queued, 0);
    assert_eq!(sink_list.count_enqueued(), 0);
    assert_eq!(src_list.frames(), 1);
    for buf in src_list.buffers() {
        assert_eq!(buf.reflinks(), 0);
    }

    graph.set_streaming(false).unwrap();
}

#[test]
fn test_pacing_limits_dequeue_rate() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-paced", 3, 1024);
    src_dev.set_fps(30).unwrap();
    assert_eq!(src_list.interval_us(), 33_333);
    // The sensor runs much faster than the requested rate.
    backend.start_frame_source(src_dev.fd(), 8_333, 512);

    let graph = LinkGraph::new(vec![
        Link::new(src_list.clone()).callbacks(Callbacks::new().check_streaming(|| true))
    ])
    .unwrap();
    graph.set_streaming(true).unwrap();

    while backend.now_us() < 1_000_000 {
        graph.step().unwrap();
        check_invariants(&backend, &[&src_list]);
    }

    let frames = src_list.frames();
    assert!(
        (29..=31).contains(&frames),
        "expected ~30 paced dequeues, got {frames}"
    );
    graph.set_streaming(false).unwrap();
}

#[test]
fn test_pacing_spaces_consecutive_dequeues() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-paced2", 3, 1024);
    src_dev.set_fps(30).unwrap();
    backend.start_frame_source(src_dev.fd(), 8_333, 512);

    let graph = LinkGraph::new(vec![
        Link::new(src_list.clone()).callbacks(Callbacks::new().check_streaming(|| true))
    ])
    .unwrap();
    graph.set_streaming(true).unwrap();

    let mut stamps = Vec::new();
    while stamps.len() < 3 {
        let before = src_list.frames();
        graph.step().unwrap();
        if src_list.frames() > before {
            stamps.push(src_list.last_dequeued_us());
        }
    }
    for pair in stamps.windows(2) {
        let delta = pair[1] - pair[0];
        // The poll timeout wakes within a millisecond of the pacing gap.
        assert!(
            (33_333..=36_000).contains(&delta),
            "dequeues {delta} us apart"
        );
    }
    graph.set_streaming(false).unwrap();
}

#[test]
fn test_backpressure_pauses_source() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-bp-src", 3, 1024);
    let (sink_dev, sink_list) = open_sink(&backend, "video-bp-sink", 2, 1024, false);
    // The sink never completes anything until we say so.

    let graph = LinkGraph::new(vec![Link::new(src_list.clone()).sink(sink_list.clone())]).unwrap();
    graph.set_streaming(true).unwrap();

    for _ in 0..10 {
        backend.produce_frame(src_dev.fd(), 256);
        graph.step().unwrap();
        check_invariants(&backend, &[&src_list, &sink_list]);
    }

    // Both sink slots are stuck in the kernel; the chain is paused.
    assert_eq!(sink_list.count_enqueued(), 2);
    assert!(src_list.device().paused());
    let stalled_at = src_list.frames();

    for _ in 0..5 {
        backend.produce_frame(src_dev.fd(), 256);
        graph.step().unwrap();
        check_invariants(&backend, &[&src_list, &sink_list]);
    }
    assert_eq!(src_list.frames(), stalled_at, "paused source kept dequeuing");

    // Draining the sink lifts the pause and frames flow again.
    backend.complete_output(sink_dev.fd());
    backend.complete_output(sink_dev.fd());
    for _ in 0..6 {
        backend.produce_frame(src_dev.fd(), 256);
        graph.step().unwrap();
        check_invariants(&backend, &[&src_list, &sink_list]);
    }
    assert!(src_list.frames() > stalled_at);
    assert!(backend.stats(sink_dev.fd(), false).dequeued >= 2);

    graph.set_streaming(false).unwrap();
}

#[test]
fn test_disconnect_stops_and_streams_off() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-hup-src", 3, 1024);
    let (sink_dev, sink_list) = open_sink(&backend, "video-hup-sink", 3, 1024, false);
    backend.set_auto_complete(sink_dev.fd(), true);

    let graph = LinkGraph::new(vec![Link::new(src_list.clone()).sink(sink_list.clone())]).unwrap();
    backend.hang_up(src_dev.fd());

    let running = AtomicBool::new(true);
    let err = graph.run(&running).unwrap_err();
    assert!(matches!(err, Error::Disconnected(_)));

    // Every list was streamed on and off exactly once.
    assert_eq!(backend.stats(src_dev.fd(), true).stream_ons, 1);
    assert_eq!(backend.stats(src_dev.fd(), true).stream_offs, 1);
    assert_eq!(backend.stats(sink_dev.fd(), false).stream_ons, 1);
    assert_eq!(backend.stats(sink_dev.fd(), false).stream_offs, 1);
    assert!(!src_list.streaming());
    assert!(!sink_list.streaming());
}

#[test]
fn test_poll_interrupt_changes_nothing() {
    let backend = Arc::new(VirtualBackend::new());
    let (src_dev, src_list) = open_source(&backend, "video-eintr", 3, 1024);

    let graph = LinkGraph::new(vec![
        Link::new(src_list.clone()).callbacks(Callbacks::new().check_streaming(|| true))
    ])
    .unwrap();
    graph.set_streaming(true).unwrap();
    graph.step().unwrap(); // primes the capture queue

    let queued_before = backend.stats(src_dev.fd(), true).queued;
    let frames_before = src_list.frames();
    let clock_before = backend.now_us();

    backend.inject_poll_interrupt();
    graph.step().unwrap();

    assert_eq!(backend.stats(src_dev.fd(), true).queued, queued_before);
    assert_eq!(src_list.frames(), frames_before);
    assert_eq!(backend.now_us(), clock_before);
    check_invariants(&backend, &[&src_list]);

    graph.set_streaming(false).unwrap();
}
