//! The link graph and its scheduler.
//!
//! A [`Link`] wires one source pool (a capture queue) to the sink pools it
//! feeds. The graph is built once and never mutated; the scheduler polls
//! every device, moves finished frames from sources into sinks, paces
//! dequeues to the configured frame interval, and propagates pause state
//! upstream when a sink stops draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer_list::BufferList;
use crate::buffer::BufferRef;
use crate::error::{Error, Result};
use crate::v4l2::{PollEvents, PollFd, VideoBackend};

/// Idle poll timeout; pacing shrinks it when a dequeue is due sooner.
const LOOP_INTERVAL_MS: i64 = 10;

/// Consumer invoked after a source dequeue, while the frame is user-owned.
pub type FrameHook = Box<dyn Fn(&BufferRef) + Send + Sync>;

/// Tells the scheduler whether anyone downstream wants this link running.
pub type StreamCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Optional per-link consumer hooks.
#[derive(Default)]
pub struct Callbacks {
    pub on_buffer: Option<FrameHook>,
    pub check_streaming: Option<StreamCheck>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_buffer(mut self, hook: impl Fn(&BufferRef) + Send + Sync + 'static) -> Self {
        self.on_buffer = Some(Box::new(hook));
        self
    }

    pub fn check_streaming(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.check_streaming = Some(Box::new(check));
        self
    }
}

/// One edge of the graph: a source pool and the sinks it feeds.
pub struct Link {
    pub source: Arc<BufferList>,
    pub sinks: Vec<Arc<BufferList>>,
    pub callbacks: Callbacks,
}

impl Link {
    pub fn new(source: Arc<BufferList>) -> Self {
        Self {
            source,
            sinks: Vec::new(),
            callbacks: Callbacks::default(),
        }
    }

    pub fn sink(mut self, sink: Arc<BufferList>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// The static pipeline graph plus its scheduler.
pub struct LinkGraph {
    links: Vec<Link>,
    backend: Arc<dyn VideoBackend>,
}

impl std::fmt::Debug for LinkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkGraph").finish_non_exhaustive()
    }
}

impl LinkGraph {
    /// Validate and freeze a set of links.
    pub fn new(links: Vec<Link>) -> Result<Self> {
        if links.is_empty() {
            return Err(Error::Config("link graph is empty".into()));
        }
        for link in &links {
            if !link.source.is_capture() {
                return Err(Error::Config(format!(
                    "{}: link source must be a capture queue",
                    link.source.name()
                )));
            }
            for sink in &link.sinks {
                if sink.is_capture() {
                    return Err(Error::Config(format!(
                        "{}: link sink must be an output queue",
                        sink.name()
                    )));
                }
            }
        }
        let backend = links[0].source.device().backend().clone();
        Ok(Self { links, backend })
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Start or stop streaming on every pool in the graph.
    ///
    /// Starting fails fast; stopping is best-effort and logs failures so a
    /// teardown always reaches every list.
    pub fn set_streaming(&self, on: bool) -> Result<()> {
        for link in &self.links {
            for list in std::iter::once(&link.source).chain(link.sinks.iter()) {
                match list.set_stream(on) {
                    Ok(()) => {}
                    Err(e) if on => return Err(e),
                    Err(e) => tracing::warn!("{}: stream off failed: {}", list.name(), e),
                }
            }
        }
        Ok(())
    }

    /// One scheduler iteration: build the poll set, wait, service events.
    pub fn step(&self) -> Result<()> {
        let mut fds: Vec<PollFd> = Vec::new();
        let mut slots: Vec<(Arc<BufferList>, Option<usize>)> = Vec::new();
        let mut timeout_ms = LOOP_INTERVAL_MS;
        let now_us = self.backend.now_us();

        // Reverse order: drain output stages before feeding input stages.
        for (index, link) in self.links.iter().enumerate().rev() {
            let source = &link.source;
            if !source.streaming() {
                continue;
            }

            let mut paused = true;
            if let Some(check) = &link.callbacks.check_streaming {
                if check() {
                    paused = false;
                }
            }

            for sink in &link.sinks {
                if !sink.streaming() {
                    continue;
                }
                let count_enqueued = sink.count_enqueued();
                let mut events = PollEvents::HUP;
                if count_enqueued > 0 {
                    events |= PollEvents::OUT;
                }
                fds.push(PollFd::new(sink.device().fd(), events));
                slots.push((sink.clone(), None));

                if !sink.device().paused() && count_enqueued < sink.nbufs() {
                    paused = false;
                }
            }

            let device = source.device();
            device.set_paused(paused);
            if let Some(peer) = device.output_peer() {
                peer.set_paused(paused);
            }

            let mut can_dequeue = !paused && source.count_enqueued() > 0;
            let interval_us = source.interval_us();
            if can_dequeue && interval_us > 0 {
                let elapsed = now_us.saturating_sub(source.last_dequeued_us());
                if elapsed < interval_us {
                    can_dequeue = false;
                    let wait_ms = ((interval_us - elapsed) + 999) / 1_000;
                    timeout_ms = timeout_ms.min(wait_ms as i64);
                }
            }
            let mut events = PollEvents::HUP;
            if can_dequeue {
                events |= PollEvents::IN;
            }
            fds.push(PollFd::new(device.fd(), events));
            slots.push((source.clone(), Some(index)));
        }

        match self.backend.poll(&mut fds, timeout_ms as i32).map_err(Error::Io) {
            Ok(_) => {}
            // A signal landing mid-poll means "no events", not failure.
            Err(e) if e.is_interrupted() => {
                for fd in fds.iter_mut() {
                    fd.revents = PollEvents::empty();
                }
            }
            Err(e) => return Err(e),
        }

        for (i, (list, link_index)) in slots.iter().enumerate() {
            let revents = fds[i].revents;
            tracing::trace!(
                "{}: events={:?} streaming={} enqueued={}/{} paused={}",
                list.name(),
                revents,
                list.streaming(),
                list.count_enqueued(),
                list.nbufs(),
                list.device().paused()
            );

            // Keep capture queues primed, at most one buffer ahead, so
            // other stages are not starved of free slots. Slots still
            // referenced downstream are not idle and stay untouched.
            if !list.device().paused() && list.is_capture() && list.is_mmap() {
                for slot_index in 0..list.nbufs() {
                    if list.count_enqueued() > 1 {
                        break;
                    }
                    let buf = &list.buffers()[slot_index];
                    if buf.enqueued() || buf.reflinks() > 0 {
                        continue;
                    }
                    if let Err(e) = list.buffer_ref(slot_index).release() {
                        tracing::warn!("{}: prime failed: {}", list.name(), e);
                        break;
                    }
                }
            }

            if revents.contains(PollEvents::IN) {
                if let Some(link_index) = link_index {
                    self.forward_source(&self.links[*link_index])?;
                }
            }

            if revents.contains(PollEvents::OUT) {
                self.drain_sink(list)?;
            }

            if revents.intersects(PollEvents::HUP | PollEvents::ERR) {
                tracing::info!("{}: device disconnected", list.name());
                return Err(Error::Disconnected(list.name().to_string()));
            }
        }

        Ok(())
    }

    /// Stream everything on and iterate until `running` clears or a fatal
    /// error occurs; streams everything off on the way out either way.
    pub fn run(&self, running: &AtomicBool) -> Result<()> {
        if let Err(e) = self.set_streaming(true) {
            let _ = self.set_streaming(false);
            return Err(e);
        }
        let result = loop {
            if !running.load(Ordering::SeqCst) {
                break Ok(());
            }
            if let Err(e) = self.step() {
                break Err(e);
            }
        };
        let _ = self.set_streaming(false);
        result
    }

    /// Dequeue one frame from the link's source and offer it to every
    /// unpaused sink, then hand it to the consumer and drop our reference.
    fn forward_source(&self, link: &Link) -> Result<()> {
        let frame = link.source.dequeue()?;
        for sink in &link.sinks {
            if sink.device().paused() {
                continue;
            }
            match sink.enqueue(&frame) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::trace!("{}: full, frame dropped", sink.name());
                }
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("{}: enqueue failed: {}", sink.name(), e);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(hook) = &link.callbacks.on_buffer {
            hook(&frame);
        }
        // Our reference; the frame requeues once the sinks are done too.
        if let Err(e) = frame.release() {
            tracing::warn!("{}: requeue after fan-out failed: {}", link.source.name(), e);
        }
        Ok(())
    }

    /// Reclaim one processed buffer from a sink; the dequeue itself drops
    /// the upstream reference.
    fn drain_sink(&self, sink: &Arc<BufferList>) -> Result<()> {
        sink.dequeue()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::device::Device;
    use crate::types::PixelFormat;
    use crate::v4l2::VirtualBackend;

    fn open_pair(backend: &Arc<VirtualBackend>) -> (Device, Device) {
        let dyn_backend: Arc<dyn VideoBackend> = backend.clone();
        let src = Device::open("SRC", Path::new("/dev/video-src"), dyn_backend.clone()).unwrap();
        let sink = Device::open("SINK", Path::new("/dev/video-sink"), dyn_backend).unwrap();
        (src, sink)
    }

    #[test]
    fn test_graph_rejects_output_source() {
        let backend = Arc::new(VirtualBackend::new());
        let (src, _sink) = open_pair(&backend);
        src.set_allow_dma(false);
        let out = src
            .open_buffer_list(false, 64, 48, PixelFormat::YUYV, 2)
            .unwrap();
        let err = LinkGraph::new(vec![Link::new(out)]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_graph_rejects_capture_sink() {
        let backend = Arc::new(VirtualBackend::new());
        let (src, sink) = open_pair(&backend);
        let cap = src
            .open_buffer_list(true, 64, 48, PixelFormat::YUYV, 2)
            .unwrap();
        let cap2 = sink
            .open_buffer_list(true, 64, 48, PixelFormat::YUYV, 2)
            .unwrap();
        let err = LinkGraph::new(vec![Link::new(cap).sink(cap2)]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_graph_rejected() {
        assert!(matches!(
            LinkGraph::new(Vec::new()).unwrap_err(),
            Error::Config(_)
        ));
    }
}
