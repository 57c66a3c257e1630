//! Pose-side building blocks: the landmark model, geometric posture
//! classification, temporal smoothing, bed-relative coordinates, and the
//! provider traits through which external models are consumed.

pub mod bed;
pub mod classifier;
pub mod landmarks;
pub mod posture;
pub mod provider;
pub mod smoother;
pub mod stability;

pub use bed::{BedFrame, BedFrameError, BedReference};
pub use classifier::{PostureAssessment, assess, classify};
pub use landmarks::{LANDMARK_COUNT, Landmark, LandmarkError, LandmarkId, LandmarkSet};
pub use posture::{PostureGuidance, PostureLabel};
pub use provider::{EmotionProvider, LandmarkProvider};
pub use smoother::LandmarkSmoother;
pub use stability::PostureStabilizer;
