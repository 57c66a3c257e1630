//! Sleep monitoring core: detection dispatch over captured frames, the
//! aggregated detection state, and the session facade tying them together.

pub mod annotation;
pub mod clock;
pub mod config;
pub mod detector;
pub mod health;
pub mod pipeline;
pub mod session;
pub mod state;
pub mod telemetry;

pub use annotation::{Overlay, annotate_frame, encode_jpeg};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    MonitorCliArgs, MonitorConfig, PipelineConfig, SmoothingConfig, StateConfig, TelemetryOptions,
};
pub use detector::{
    Detector, DetectorError, DetectorResult, EMOTION_NO_FACE, EmotionDetector, PostureDetector,
};
pub use health::{HealthComponent, PipelineHealth};
pub use pipeline::{DetectionPipeline, DetectionRecord, PipelineError};
pub use session::{MonitorSession, Providers, SessionError};
pub use state::{
    CameraStatus, DetectionSnapshot, DetectionState, EMOTION_UNDETECTED, Feature, FeatureFlags,
    HistoryEntry, PostureStatistics, Presence, StateError,
};
pub use telemetry::{TelemetryGuard, enter_runtime, init_metrics_recorder, render_metrics};
