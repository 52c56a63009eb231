//! Shared state of one camera stream: buffer, shutdown flag and progress

pub mod ringbuf;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use ringbuf::{FrameCursor, FrameRingBuffer, RingStats};

use crate::capture::slideshow::SlideshowStatus;
use crate::{Frame, StreamConfig};

/// Owned per-stream state handed to the capture task and every responder.
pub struct StreamPipeline {
    name: String,
    content_type: String,
    take_timeout: Duration,
    buffer: FrameRingBuffer,
    cancel: CancellationToken,
    /// Cleared when the source ends on its own
    active: AtomicBool,
    started: Instant,
    progress: CachePadded<Progress>,
    slideshow: ArcSwapOption<SlideshowStatus>,
}

#[derive(Default)]
struct Progress {
    bytes_read: AtomicU64,
    frames_extracted: AtomicU64,
    bytes_discarded: AtomicU64,
    sessions: AtomicUsize,
}

/// Snapshot served by `GET /status`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub name: String,
    pub active: bool,
    pub shutting_down: bool,
    pub uptime_secs: f64,
    pub bytes_read: u64,
    pub frames_extracted: u64,
    pub bytes_discarded: u64,
    pub buffered_frames: usize,
    pub buffer_capacity: usize,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub clients: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slideshow: Option<SlideshowStatus>,
}

impl StreamPipeline {
    pub fn new(name: impl Into<String>, buffer_capacity: usize, take_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            content_type: "image/jpeg".into(),
            take_timeout,
            buffer: FrameRingBuffer::new(buffer_capacity),
            cancel: CancellationToken::new(),
            active: AtomicBool::new(true),
            started: Instant::now(),
            progress: CachePadded::new(Progress::default()),
            slideshow: ArcSwapOption::empty(),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(&config.name, config.buffer_capacity, config.take_timeout())
            .with_content_type(&config.content_type)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn take_timeout(&self) -> Duration {
        self.take_timeout
    }

    pub fn buffer(&self) -> &FrameRingBuffer {
        &self.buffer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Push a freshly extracted frame to every reader.
    pub fn publish(&self, frame: Frame) {
        self.progress
            .frames_extracted
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camrelay_frames_extracted_total", "stream" => self.name.clone())
            .increment(1);

        if self.buffer.offer(frame) {
            metrics::counter!("camrelay_frames_dropped_total", "stream" => self.name.clone())
                .increment(1);
        }
    }

    /// Record reader totals (absolute values, not deltas).
    pub fn record_progress(&self, bytes_read: u64, bytes_discarded: u64) {
        self.progress.bytes_read.store(bytes_read, Ordering::Relaxed);
        let previous = self
            .progress
            .bytes_discarded
            .swap(bytes_discarded, Ordering::Relaxed);
        if bytes_discarded > previous {
            metrics::counter!("camrelay_bytes_discarded_total", "stream" => self.name.clone())
                .increment(bytes_discarded - previous);
        }
    }

    pub fn set_slideshow_status(&self, status: SlideshowStatus) {
        self.slideshow.store(Some(Arc::new(status)));
    }

    /// Stop every loop bound to this pipeline and drop buffered frames.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!(stream = %self.name, "pipeline shutting down");
        }
        self.cancel.cancel();
        self.buffer.clear();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The source ended normally; responders finish, the server stays up.
    pub fn mark_inactive(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.is_shutting_down()
    }

    /// Register a client; the returned guard unregisters it on drop.
    pub fn open_session(self: &Arc<Self>) -> SessionGuard {
        let clients = self.progress.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("camrelay_active_sessions", "stream" => self.name.clone())
            .set(clients as f64);
        SessionGuard {
            pipeline: self.clone(),
        }
    }

    pub fn clients(&self) -> usize {
        self.progress.sessions.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> PipelineStatus {
        let ring = self.buffer.stats();
        PipelineStatus {
            name: self.name.clone(),
            active: self.is_active(),
            shutting_down: self.is_shutting_down(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            bytes_read: self.progress.bytes_read.load(Ordering::Relaxed),
            frames_extracted: self.progress.frames_extracted.load(Ordering::Relaxed),
            bytes_discarded: self.progress.bytes_discarded.load(Ordering::Relaxed),
            buffered_frames: self.buffer.len(),
            buffer_capacity: self.buffer.capacity(),
            frames_delivered: ring.delivered,
            frames_dropped: ring.dropped,
            clients: self.clients(),
            slideshow: self.slideshow.load_full().map(|s| (*s).clone()),
        }
    }
}

/// One open stream client
pub struct SessionGuard {
    pipeline: Arc<StreamPipeline>,
}

impl SessionGuard {
    pub fn pipeline(&self) -> &Arc<StreamPipeline> {
        &self.pipeline
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let clients = self.pipeline.progress.sessions.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("camrelay_active_sessions", "stream" => self.pipeline.name.clone())
            .set(clients as f64);
        debug!(stream = %self.pipeline.name, clients, "stream session closed");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn pipeline() -> Arc<StreamPipeline> {
        Arc::new(StreamPipeline::new("test", 2, Duration::from_millis(50)))
    }

    #[test]
    fn status_tracks_frames_and_drops() {
        let pipeline = pipeline();
        for seq in 1..=3 {
            pipeline.publish(Frame::new(Bytes::from_static(b"x"), seq));
        }
        pipeline.record_progress(300, 12);

        let status = pipeline.status();
        assert_eq!(status.frames_extracted, 3);
        assert_eq!(status.frames_dropped, 1);
        assert_eq!(status.buffered_frames, 2);
        assert_eq!(status.bytes_read, 300);
        assert_eq!(status.bytes_discarded, 12);
        assert!(status.active);
        assert!(status.slideshow.is_none());
    }

    #[test]
    fn sessions_are_counted_until_dropped() {
        let pipeline = pipeline();
        let first = pipeline.open_session();
        let second = pipeline.open_session();
        assert_eq!(pipeline.clients(), 2);

        drop(first);
        assert_eq!(pipeline.clients(), 1);
        drop(second);
        assert_eq!(pipeline.status().clients, 0);
    }

    #[test]
    fn shutdown_clears_buffer_and_deactivates() {
        let pipeline = pipeline();
        pipeline.publish(Frame::new(Bytes::from_static(b"x"), 1));
        pipeline.shutdown();

        assert!(pipeline.is_shutting_down());
        assert!(!pipeline.is_active());
        assert!(pipeline.buffer().is_empty());
    }

    #[test]
    fn status_serializes_slideshow_only_when_present() {
        let pipeline = pipeline();
        let json = serde_json::to_value(pipeline.status()).unwrap();
        assert!(json.get("slideshow").is_none());

        pipeline.set_slideshow_status(SlideshowStatus {
            current_image: 1,
            total_images: 3,
            current_file: "a.jpg".into(),
        });
        let json = serde_json::to_value(pipeline.status()).unwrap();
        assert_eq!(json["slideshow"]["total_images"], 3);
        assert_eq!(json["name"], "test");
    }
}
