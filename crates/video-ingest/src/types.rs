use std::time::Instant;

use chrono::Utc;
use thiserror::Error;

/// Immutable BGR frame captured from a video source.
///
/// `captured_at` is monotonic and drives rate limiting; `timestamp_ms` is the
/// wall-clock capture time reported to consumers.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub captured_at: Instant,
    pub format: FrameFormat,
}

impl Frame {
    /// Wrap raw BGR bytes captured right now.
    pub fn bgr(data: Vec<u8>, width: i32, height: i32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp_ms: Utc::now().timestamp_millis(),
            captured_at: Instant::now(),
            format: FrameFormat::Bgr8,
        }
    }

    /// Same payload, stamped with an explicit monotonic capture instant.
    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Expected payload length for the frame dimensions and format.
    pub fn expected_len(&self) -> usize {
        (self.width.max(0) as usize) * (self.height.max(0) as usize) * self.format.channels()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    Bgr8,
}

impl FrameFormat {
    pub fn channels(self) -> usize {
        match self {
            FrameFormat::Bgr8 => 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capturable camera found (tried devices {tried:?})")]
    CameraUnavailable { tried: Vec<i32> },
    #[error("failed to open camera device #{device_id}")]
    Open { device_id: i32 },
    #[error("transient read failure on device #{device_id}: {reason}")]
    ReadTransient { device_id: i32, reason: String },
    #[error("device returned an empty frame")]
    EmptyFrame,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
