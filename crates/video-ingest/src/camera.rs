//! OpenCV-backed camera devices.

use std::time::Instant;

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::{debug, warn};

use crate::{
    device::{CameraBackend, CaptureDevice},
    types::{CaptureError, Frame, FrameFormat},
};

/// Opens local V4L / system cameras through OpenCV.
#[derive(Clone, Debug)]
pub struct OpenCvBackend {
    target_size: (i32, i32),
    fps: f64,
}

impl OpenCvBackend {
    pub fn new(target_size: (i32, i32), fps: f64) -> Self {
        Self { target_size, fps }
    }
}

impl Default for OpenCvBackend {
    fn default() -> Self {
        Self::new((640, 480), 30.0)
    }
}

impl CameraBackend for OpenCvBackend {
    fn open(&self, device_id: i32) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let mut cap = open_video_capture(device_id)?;
        configure_camera(&mut cap, self.target_size, self.fps);
        Ok(Box::new(OpenCvDevice {
            device_id,
            cap,
            target_size: self.target_size,
            frame: Mat::default(),
            scratch: Mat::default(),
        }))
    }
}

struct OpenCvDevice {
    device_id: i32,
    cap: VideoCapture,
    target_size: (i32, i32),
    frame: Mat,
    scratch: Mat,
}

impl OpenCvDevice {
    fn transient(&self, err: impl std::fmt::Display) -> CaptureError {
        CaptureError::ReadTransient {
            device_id: self.device_id,
            reason: err.to_string(),
        }
    }
}

impl CaptureDevice for OpenCvDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let grabbed = self
            .cap
            .read(&mut self.frame)
            .map_err(|e| self.transient(e))?;
        let captured_at = Instant::now();
        let size = self.frame.size().map_err(|e| self.transient(e))?;
        if !grabbed || size.width <= 0 || size.height <= 0 {
            return Err(CaptureError::EmptyFrame);
        }

        let (target_w, target_h) = self.target_size;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &self.frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| self.transient(e))?;
            &self.scratch
        } else {
            &self.frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| self.transient(e))?
            .to_vec();

        Ok(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            captured_at,
            format: FrameFormat::Bgr8,
        })
    }
}

impl Drop for OpenCvDevice {
    fn drop(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!(device_id = self.device_id, "failed to release camera: {err}");
        }
    }
}

/// Try the V4L backend first, then let OpenCV pick.
fn open_video_capture(device_id: i32) -> Result<VideoCapture, CaptureError> {
    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::new(device_id, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                debug!(device_id, backend, "failed to open camera: {err}");
            }
        }
    }
    Err(CaptureError::Open { device_id })
}

/// Apply resolution, frame rate, and preferred pixel format.
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
