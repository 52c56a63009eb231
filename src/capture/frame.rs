use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One complete encoded image cut from a capture stream
#[derive(Clone, Debug)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Position in the pipeline's extraction order, starting at 1
    pub sequence: u64,

    /// When the frame was cut from the stream
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: Bytes, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// Time since extraction; recorded as delivery latency when served
    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Input formats a V4L2 webcam can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Yuyv4,
}

impl PixelFormat {
    /// Name understood by ffmpeg's `-input_format`
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Yuyv4 => "yuyv422",
        }
    }
}
