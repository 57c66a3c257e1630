//! Session facade wiring capture, detection and state together.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use pose_core::{EmotionProvider, LandmarkProvider};
use thiserror::Error;
use tracing::{info, info_span, warn};
use video_ingest::{CameraBackend, CaptureError, Frame, FrameBuffer, FrameSource};

use crate::{
    clock::{Clock, SystemClock},
    config::MonitorConfig,
    detector::{Detector, EmotionDetector, PostureDetector},
    health::PipelineHealth,
    pipeline::{DetectionPipeline, DetectionRecord, PipelineError},
    state::{CameraStatus, DetectionSnapshot, DetectionState, Feature, StateError},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Camera(#[from] CaptureError),
    #[error("a monitoring session is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// External models feeding the built-in detectors. A missing provider means
/// the matching detector is not registered.
#[derive(Default)]
pub struct Providers {
    pub landmarks: Option<Box<dyn LandmarkProvider>>,
    pub emotion: Option<Box<dyn EmotionProvider>>,
}

/// One camera, one buffer, one pipeline and the state they feed.
pub struct MonitorSession {
    config: MonitorConfig,
    buffer: Arc<FrameBuffer>,
    source: FrameSource,
    pipeline: DetectionPipeline,
    state: Arc<DetectionState>,
    health: PipelineHealth,
    active: bool,
}

impl MonitorSession {
    pub fn new(
        config: MonitorConfig,
        backend: Arc<dyn CameraBackend>,
        providers: Providers,
    ) -> Result<Self, SessionError> {
        Self::with_clock(config, backend, providers, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: MonitorConfig,
        backend: Arc<dyn CameraBackend>,
        providers: Providers,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SessionError> {
        let buffer = Arc::new(FrameBuffer::new(
            config.buffer_capacity,
            config.source.frame_interval,
        ));
        let state = Arc::new(DetectionState::new(config.state.clone(), clock));
        let source = FrameSource::new(config.source.clone(), backend, buffer.clone());
        let mut pipeline =
            DetectionPipeline::new(config.pipeline.clone(), buffer.clone(), state.clone());

        if let Some(provider) = providers.landmarks {
            pipeline.add_detector(Arc::new(PostureDetector::new(
                provider,
                state.clone(),
                &config.smoothing,
            )))?;
        }
        if let Some(provider) = providers.emotion {
            pipeline.add_detector(Arc::new(EmotionDetector::new(provider, state.clone())))?;
        }

        let health = PipelineHealth::new(source.heartbeat(), pipeline.heartbeat());
        Ok(Self {
            config,
            buffer,
            source,
            pipeline,
            state,
            health,
            active: false,
        })
    }

    /// Register an additional detector. Fails while a session is running.
    pub fn add_detector(&mut self, detector: Arc<dyn Detector>) -> Result<(), SessionError> {
        if self.active {
            return Err(SessionError::AlreadyRunning);
        }
        self.pipeline.add_detector(detector)?;
        Ok(())
    }

    /// Reset state, open the camera and start detection.
    ///
    /// When no camera can be opened the error is returned and nothing is
    /// left running.
    pub fn start_session(&mut self) -> Result<(), SessionError> {
        let span = info_span!("monitor.session", devices = ?self.config.source.device_ids);
        let _guard = span.enter();
        if self.active {
            return Err(SessionError::AlreadyRunning);
        }

        self.buffer.clear();
        self.source.start()?;
        self.state.begin_session();
        if let Err(err) = self.pipeline.start() {
            self.source.stop();
            self.state.end_session();
            return Err(err.into());
        }
        self.active = true;
        metrics::gauge!("monitor_session_active").set(1.0);
        info!(device_id = ?self.source.device_id(), "monitoring session started");
        Ok(())
    }

    /// Stop detection, release the camera and close the statistics.
    /// Idempotent.
    pub fn stop_session(&mut self) {
        if !self.active {
            return;
        }
        let _guard = info_span!("monitor.session.stop").entered();
        self.pipeline.stop();
        self.source.stop();
        self.state.end_session();
        self.active = false;
        metrics::gauge!("monitor_session_active").set(0.0);
        let snapshot = self.state.snapshot();
        info!(
            elapsed_secs = snapshot.elapsed_secs,
            tracked_secs = snapshot.tracked_total_secs(),
            wake_count = snapshot.wake_count,
            "monitoring session stopped"
        );
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Snapshot of the detection state with the current camera status.
    pub fn current_state(&self) -> DetectionSnapshot {
        let mut snapshot = self.state.snapshot();
        snapshot.camera_status = self.camera_status();
        snapshot
    }

    fn camera_status(&self) -> CameraStatus {
        if !self.active {
            return CameraStatus::Stopped;
        }
        match self.health.stale_component(self.config.source.frame_timeout) {
            Some(component) => {
                warn!(component = component.label(), "pipeline component stalled");
                CameraStatus::NotReady
            }
            None if self.source.is_ready() => CameraStatus::Ready,
            None => CameraStatus::NotReady,
        }
    }

    /// Toggle a feature by name (`posture`, `emotion` or `wake`).
    pub fn set_feature_enabled(&self, name: &str, enabled: bool) -> Result<(), StateError> {
        let feature: Feature = name.parse()?;
        self.state.set_feature_enabled(feature, enabled);
        Ok(())
    }

    pub fn latest_annotated_frame(&self) -> Option<Arc<Frame>> {
        self.pipeline.latest_annotated_frame()
    }

    pub fn records(&self) -> Receiver<DetectionRecord> {
        self.pipeline.records()
    }

    pub fn state(&self) -> Arc<DetectionState> {
        self.state.clone()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.stop_session();
    }
}
