//! Detectors run by the pipeline for every frame.
//!
//! The pipeline only sees the [`Detector`] trait; posture and emotion are two
//! implementations wrapping external providers.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use pose_core::{
    BedFrame, EmotionProvider, LandmarkProvider, LandmarkSet, LandmarkSmoother, PostureAssessment,
    PostureLabel, PostureStabilizer, assess,
};
use serde::Serialize;
use thiserror::Error;
use video_ingest::Frame;

use crate::{
    config::SmoothingConfig,
    state::{DetectionState, Feature},
};

/// Emotion label reported when the provider finds no face.
pub const EMOTION_NO_FACE: &str = "no-face";

/// Output of one detector for one frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorResult {
    Posture {
        label: PostureLabel,
        /// Smoothed landmarks; `None` when no subject was found.
        landmarks: Option<LandmarkSet>,
        /// `landmarks` mapped into bed coordinates when a bed is configured.
        #[serde(skip_serializing_if = "Option::is_none")]
        bed_landmarks: Option<LandmarkSet>,
        assessment: Option<PostureAssessment>,
    },
    Emotion {
        label: String,
    },
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector {detector} exceeded its {timeout_ms} ms budget")]
    TimedOut {
        detector: &'static str,
        timeout_ms: u64,
    },
    #[error("detector {detector} panicked")]
    Panicked { detector: &'static str },
    #[error("detector {detector} still busy or worker pool saturated; skipped")]
    Saturated { detector: &'static str },
    #[error("detector {detector} provider failed")]
    Provider {
        detector: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl DetectorError {
    /// Metric label for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectorError::TimedOut { .. } => "timeout",
            DetectorError::Panicked { .. } => "panic",
            DetectorError::Saturated { .. } => "saturated",
            DetectorError::Provider { .. } => "provider",
        }
    }

    pub fn detector(&self) -> &'static str {
        match self {
            DetectorError::TimedOut { detector, .. }
            | DetectorError::Panicked { detector }
            | DetectorError::Saturated { detector }
            | DetectorError::Provider { detector, .. } => detector,
        }
    }
}

/// A per-frame visual classifier.
///
/// `Ok(None)` means the detector has nothing to contribute for this frame
/// (for instance because its feature is disabled).
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;
    fn detect(&self, frame: &Frame) -> Result<Option<DetectorResult>, DetectorError>;
}

/// Landmarks → smoothing → geometric classification.
pub struct PostureDetector {
    provider: Box<dyn LandmarkProvider>,
    smoother: Mutex<LandmarkSmoother>,
    stabilizer: Option<Mutex<PostureStabilizer>>,
    bed_frame: Option<BedFrame>,
    state: Arc<DetectionState>,
}

impl PostureDetector {
    pub const NAME: &'static str = "posture";

    pub fn new(
        provider: Box<dyn LandmarkProvider>,
        state: Arc<DetectionState>,
        smoothing: &SmoothingConfig,
    ) -> Self {
        let stabilizer = smoothing.stabilize.then(|| {
            Mutex::new(PostureStabilizer::new(
                smoothing.vote_window,
                smoothing.min_hold,
            ))
        });
        Self {
            provider,
            smoother: Mutex::new(LandmarkSmoother::new(smoothing.window, smoothing.factor)),
            stabilizer,
            bed_frame: smoothing.bed_frame,
            state,
        }
    }

    fn stabilize(&self, label: PostureLabel) -> PostureLabel {
        match &self.stabilizer {
            Some(stabilizer) => stabilizer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(label, Instant::now()),
            None => label,
        }
    }
}

impl Detector for PostureDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn detect(&self, frame: &Frame) -> Result<Option<DetectorResult>, DetectorError> {
        if !self.state.is_enabled(Feature::Posture) {
            return Ok(None);
        }

        let raw = self
            .provider
            .detect(frame)
            .map_err(|source| DetectorError::Provider {
                detector: Self::NAME,
                source,
            })?;

        let mut smoother = self.smoother.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(raw) = raw else {
            smoother.reset();
            drop(smoother);
            return Ok(Some(DetectorResult::Posture {
                label: self.stabilize(PostureLabel::Undetected),
                landmarks: None,
                bed_landmarks: None,
                assessment: None,
            }));
        };
        let smoothed = smoother.smooth(&raw);
        drop(smoother);

        let assessment = assess(Some(&smoothed));
        let bed_landmarks = self.bed_frame.map(|bed| bed.transform(&smoothed));
        Ok(Some(DetectorResult::Posture {
            label: self.stabilize(assessment.label),
            landmarks: Some(smoothed),
            bed_landmarks,
            assessment: Some(assessment),
        }))
    }
}

/// Facial emotion through an external provider.
pub struct EmotionDetector {
    provider: Box<dyn EmotionProvider>,
    state: Arc<DetectionState>,
}

impl EmotionDetector {
    pub const NAME: &'static str = "emotion";

    pub fn new(provider: Box<dyn EmotionProvider>, state: Arc<DetectionState>) -> Self {
        Self { provider, state }
    }
}

impl Detector for EmotionDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn detect(&self, frame: &Frame) -> Result<Option<DetectorResult>, DetectorError> {
        if !self.state.is_enabled(Feature::Emotion) {
            return Ok(None);
        }
        let label = self
            .provider
            .detect(frame)
            .map_err(|source| DetectorError::Provider {
                detector: Self::NAME,
                source,
            })?
            .unwrap_or_else(|| EMOTION_NO_FACE.to_string());
        Ok(Some(DetectorResult::Emotion { label }))
    }
}
