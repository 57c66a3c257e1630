//! Configuration for a monitoring session.
//!
//! `MonitorConfig` groups the knobs of every stage. CLI flags are parsed into
//! [`MonitorCliArgs`] and converted (and validated) once, so stages never
//! re-read flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;
use pose_core::{
    BedFrame, BedReference,
    smoother::{DEFAULT_SMOOTHING_FACTOR, DEFAULT_SMOOTHING_WINDOW},
    stability::{DEFAULT_MIN_HOLD, DEFAULT_VOTE_WINDOW},
};
use video_ingest::{DEFAULT_BUFFER_CAPACITY, FrameSourceConfig};

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage.
pub struct MonitorConfig {
    /// Camera probing and capture loop settings.
    pub source: FrameSourceConfig,
    /// Frames held between capture and detection.
    pub buffer_capacity: usize,
    pub pipeline: PipelineConfig,
    pub state: StateConfig,
    pub smoothing: SmoothingConfig,
    pub telemetry: TelemetryOptions,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            source: FrameSourceConfig::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            pipeline: PipelineConfig::default(),
            state: StateConfig::default(),
            smoothing: SmoothingConfig::default(),
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.source.device_ids.is_empty() {
            bail!("at least one camera device id is required");
        }
        if self.source.width <= 0 || self.source.height <= 0 {
            bail!("capture width and height must be positive integers");
        }
        if self.source.frame_interval.is_zero() {
            bail!("frame interval must be positive");
        }
        if self.source.max_read_failures == 0 {
            bail!("max read failures must be at least 1");
        }
        if self.buffer_capacity == 0 {
            bail!("buffer capacity must be at least 1");
        }
        if self.pipeline.workers == 0 {
            bail!("--workers must be at least 1");
        }
        if self.pipeline.detector_timeout.is_zero() {
            bail!("--detector-timeout-ms must be positive");
        }
        if self.pipeline.record_capacity == 0 {
            bail!("record queue capacity must be at least 1");
        }
        if self.smoothing.window == 0 {
            bail!("--smoothing-window must be at least 1");
        }
        if !self.smoothing.factor.is_finite() || self.smoothing.factor < 0.0 {
            bail!("--smoothing-factor must be a non-negative number");
        }
        if self.state.posture_history == 0 || self.state.emotion_history == 0 {
            bail!("history capacities must be at least 1");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
/// Detection dispatch settings.
pub struct PipelineConfig {
    /// Worker threads running detectors concurrently.
    pub workers: usize,
    /// Budget for each detector per frame, measured from submission.
    pub detector_timeout: Duration,
    /// Sleep when the frame buffer is empty.
    pub poll_interval: Duration,
    /// Detection records retained for slow readers.
    pub record_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            detector_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            record_capacity: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StateConfig {
    pub posture_history: usize,
    pub emotion_history: usize,
    /// Continuous presence required before the subject counts as back in bed.
    pub presence_debounce: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            posture_history: 100,
            emotion_history: 10,
            presence_debounce: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SmoothingConfig {
    pub window: usize,
    pub factor: f32,
    /// Run classifier output through the majority-vote stabiliser.
    pub stabilize: bool,
    pub vote_window: usize,
    pub min_hold: Duration,
    /// When set, posture results also carry landmarks in bed coordinates.
    pub bed_frame: Option<BedFrame>,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_SMOOTHING_WINDOW,
            factor: DEFAULT_SMOOTHING_FACTOR,
            stabilize: false,
            vote_window: DEFAULT_VOTE_WINDOW,
            min_hold: DEFAULT_MIN_HOLD,
            bed_frame: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing session spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// CLI arguments describing a monitoring session.
#[derive(Debug, Default, Args)]
pub struct MonitorCliArgs {
    /// Camera device id to probe; repeat to probe several in order.
    #[arg(long = "device", value_name = "ID")]
    pub devices: Vec<i32>,
    /// Capture width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<i32>,
    /// Capture height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<i32>,
    /// Target capture rate.
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<u32>,
    /// Frame buffer capacity.
    #[arg(long = "buffer-capacity", value_name = "N")]
    pub buffer_capacity: Option<usize>,
    /// Number of detector workers.
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,
    /// Per-detector timeout in milliseconds.
    #[arg(long = "detector-timeout-ms", value_name = "MS")]
    pub detector_timeout_ms: Option<u64>,
    /// Landmark smoothing window length.
    #[arg(long = "smoothing-window", value_name = "N")]
    pub smoothing_window: Option<usize>,
    /// Exponential smoothing factor.
    #[arg(long = "smoothing-factor", value_name = "K")]
    pub smoothing_factor: Option<f32>,
    /// Stabilise posture labels with a majority vote.
    #[arg(long = "stabilize", action = clap::ArgAction::SetTrue)]
    pub stabilize: bool,
    /// Bed reference points (head, foot, left, right) in normalised image
    /// coordinates: `hx,hy,fx,fy,lx,ly,rx,ry`, optionally with a z per point.
    #[arg(long = "bed-reference", value_name = "POINTS")]
    pub bed_reference: Option<BedReference>,
    /// Continuous presence required before a return to bed counts.
    #[arg(long = "presence-debounce-ms", value_name = "MS")]
    pub presence_debounce_ms: Option<u64>,
    /// Seconds without frames before the camera reports not ready.
    #[arg(long = "frame-timeout-secs", value_name = "SECS")]
    pub frame_timeout_secs: Option<u64>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<MonitorCliArgs> for MonitorConfig {
    type Error = anyhow::Error;

    fn try_from(args: MonitorCliArgs) -> Result<Self> {
        let mut config = MonitorConfig::default();

        if !args.devices.is_empty() {
            config.source.device_ids = args.devices;
        }
        if let Some(width) = args.width {
            config.source.width = width;
        }
        if let Some(height) = args.height {
            config.source.height = height;
        }
        if let Some(fps) = args.fps {
            if !(1..=120).contains(&fps) {
                bail!("--fps must be between 1 and 120");
            }
            config.source.frame_interval = Duration::from_secs_f64(1.0 / fps as f64);
        }
        if let Some(capacity) = args.buffer_capacity {
            config.buffer_capacity = capacity;
        }
        if let Some(workers) = args.workers {
            config.pipeline.workers = workers;
        }
        if let Some(ms) = args.detector_timeout_ms {
            config.pipeline.detector_timeout = Duration::from_millis(ms);
        }
        if let Some(window) = args.smoothing_window {
            config.smoothing.window = window;
        }
        if let Some(factor) = args.smoothing_factor {
            config.smoothing.factor = factor;
        }
        config.smoothing.stabilize = args.stabilize;
        if let Some(reference) = args.bed_reference {
            config.smoothing.bed_frame = Some(BedFrame::from_reference(&reference)?);
        }
        if let Some(ms) = args.presence_debounce_ms {
            config.state.presence_debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = args.frame_timeout_secs {
            if secs == 0 {
                bail!("--frame-timeout-secs must be positive");
            }
            config.source.frame_timeout = Duration::from_secs(secs);
        }
        config.telemetry.chrome_trace_path = args.chrome_trace;

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.source.device_ids, vec![0, 1]);
        assert_eq!(config.buffer_capacity, 30);
        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.detector_timeout, Duration::from_millis(100));
        assert_eq!(config.smoothing.window, 8);
        assert_eq!(config.state.posture_history, 100);
        assert_eq!(config.state.emotion_history, 10);
    }

    #[test]
    fn test_cli_overrides_apply() {
        let args = MonitorCliArgs {
            devices: vec![2],
            fps: Some(15),
            workers: Some(4),
            detector_timeout_ms: Some(250),
            stabilize: true,
            ..MonitorCliArgs::default()
        };
        let config = MonitorConfig::try_from(args).expect("valid args");
        assert_eq!(config.source.device_ids, vec![2]);
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.detector_timeout, Duration::from_millis(250));
        assert!(config.smoothing.stabilize);
        assert!(config.smoothing.bed_frame.is_none());
        let interval = config.source.frame_interval.as_secs_f64();
        assert!((interval - 1.0 / 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_bed_reference_builds_bed_frame() {
        let args = MonitorCliArgs {
            bed_reference: Some("0.5,0.2,0.5,0.8,0.3,0.5,0.7,0.5".parse().expect("points")),
            ..MonitorCliArgs::default()
        };
        let config = MonitorConfig::try_from(args).expect("valid args");
        let bed = config.smoothing.bed_frame.expect("bed frame");
        assert!((bed.scale() - 1.0 / 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_cli_rejects_invalid_values() {
        for args in [
            MonitorCliArgs {
                workers: Some(0),
                ..MonitorCliArgs::default()
            },
            MonitorCliArgs {
                fps: Some(0),
                ..MonitorCliArgs::default()
            },
            MonitorCliArgs {
                width: Some(-640),
                ..MonitorCliArgs::default()
            },
            MonitorCliArgs {
                smoothing_factor: Some(f32::NAN),
                ..MonitorCliArgs::default()
            },
            MonitorCliArgs {
                detector_timeout_ms: Some(0),
                ..MonitorCliArgs::default()
            },
            MonitorCliArgs {
                bed_reference: Some(BedReference::planar([0.5; 2], [0.5; 2], [0.5; 2], [0.5; 2])),
                ..MonitorCliArgs::default()
            },
        ] {
            assert!(MonitorConfig::try_from(args).is_err());
        }
    }
}
