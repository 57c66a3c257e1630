//! Boundary to the external inference models.
//!
//! Both providers are synchronous and may be slow; callers are expected to
//! bound them with a timeout.

use anyhow::Result;
use video_ingest::Frame;

use crate::landmarks::LandmarkSet;

/// Pose estimation: a frame in, a complete landmark set or nothing out.
pub trait LandmarkProvider: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<LandmarkSet>>;
}

/// Facial emotion recognition. `None` means no face was found.
pub trait EmotionProvider: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Option<String>>;
}

impl<F> LandmarkProvider for F
where
    F: Fn(&Frame) -> Result<Option<LandmarkSet>> + Send + Sync,
{
    fn detect(&self, frame: &Frame) -> Result<Option<LandmarkSet>> {
        self(frame)
    }
}

impl<F> EmotionProvider for F
where
    F: Fn(&Frame) -> Result<Option<String>> + Send + Sync,
{
    fn detect(&self, frame: &Frame) -> Result<Option<String>> {
        self(frame)
    }
}
