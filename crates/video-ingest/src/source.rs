//! Frame acquisition loop.
//!
//! [`FrameSource`] probes the configured devices, then runs a dedicated
//! capture thread that reads at the target frame rate and feeds the shared
//! [`FrameBuffer`]. Read failures are retried in place; a run of consecutive
//! failures tears the device down and reopens it.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::{
    buffer::{DEFAULT_FRAME_INTERVAL, FrameBuffer},
    device::{CameraBackend, CaptureDevice},
    spawn_thread,
    types::CaptureError,
};

#[derive(Clone, Debug)]
/// Capture loop tuning.
pub struct FrameSourceConfig {
    /// Device ids probed in order at start.
    pub device_ids: Vec<i32>,
    /// Capture width requested from the device.
    pub width: i32,
    /// Capture height requested from the device.
    pub height: i32,
    /// Minimum spacing between device reads.
    pub frame_interval: Duration,
    /// Consecutive read failures tolerated before the device is reopened.
    pub max_read_failures: u32,
    /// Pause after a single failed read.
    pub failure_backoff: Duration,
    /// Pause between reopen attempts once the device is gone.
    pub reopen_backoff: Duration,
    /// Upper bound on any sleep so `stop()` is observed promptly.
    pub poll_interval: Duration,
    /// Age of the last frame after which the source reports not ready.
    pub frame_timeout: Duration,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            device_ids: vec![0, 1],
            width: 640,
            height: 480,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            max_read_failures: 3,
            failure_backoff: Duration::from_millis(100),
            reopen_backoff: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            frame_timeout: Duration::from_secs(5),
        }
    }
}

/// Last-progress timestamp shared between a worker thread and observers.
#[derive(Debug, Default)]
pub struct Heartbeat {
    last_ms: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        self.last_ms.store(current_millis(), Ordering::Relaxed);
    }

    /// Time since the last beat, `None` if it never beat.
    pub fn age(&self) -> Option<Duration> {
        match self.last_ms.load(Ordering::Relaxed) {
            0 => None,
            last => Some(Duration::from_millis(current_millis().saturating_sub(last))),
        }
    }

    pub fn reset(&self) {
        self.last_ms.store(0, Ordering::Relaxed);
    }
}

/// Owns the capture device for the lifetime of a session.
pub struct FrameSource {
    config: FrameSourceConfig,
    backend: Arc<dyn CameraBackend>,
    buffer: Arc<FrameBuffer>,
    heartbeat: Arc<Heartbeat>,
    running: Arc<AtomicBool>,
    active_device: Arc<AtomicI32>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(
        config: FrameSourceConfig,
        backend: Arc<dyn CameraBackend>,
        buffer: Arc<FrameBuffer>,
    ) -> Self {
        Self {
            config,
            backend,
            buffer,
            heartbeat: Arc::new(Heartbeat::new()),
            running: Arc::new(AtomicBool::new(false)),
            active_device: Arc::new(AtomicI32::new(-1)),
            handle: None,
        }
    }

    /// Probe the configured devices and spawn the capture thread.
    ///
    /// A device is usable only when it opens and yields a first frame. When
    /// none qualifies, [`CaptureError::CameraUnavailable`] is returned and no
    /// thread is started.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let (device_id, device) = self.probe()?;
        info!(device_id, "camera opened");

        self.heartbeat.reset();
        self.active_device.store(device_id, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let capture = CaptureLoop {
            config: self.config.clone(),
            backend: self.backend.clone(),
            buffer: self.buffer.clone(),
            heartbeat: self.heartbeat.clone(),
            running: self.running.clone(),
            device_id,
        };

        match spawn_thread("ingest-capture", move || capture.run(device)) {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                self.active_device.store(-1, Ordering::SeqCst);
                Err(CaptureError::Other(
                    anyhow!(err).context("failed to spawn capture thread"),
                ))
            }
        }
    }

    /// Signal the capture loop and block until the device is released.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("capture thread panicked; device released during unwind");
            }
            debug!("capture thread joined");
        }
        self.active_device.store(-1, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Running and delivering frames within the configured timeout.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && self
                .heartbeat
                .age()
                .is_some_and(|age| age <= self.config.frame_timeout)
    }

    /// Heartbeat beaten on every successfully captured frame.
    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }

    /// Id of the device in use, if capturing.
    pub fn device_id(&self) -> Option<i32> {
        match self.active_device.load(Ordering::SeqCst) {
            id if id >= 0 => Some(id),
            _ => None,
        }
    }

    pub fn config(&self) -> &FrameSourceConfig {
        &self.config
    }

    fn probe(&self) -> Result<(i32, Box<dyn CaptureDevice>), CaptureError> {
        for &device_id in &self.config.device_ids {
            let mut device = match self.backend.open(device_id) {
                Ok(device) => device,
                Err(err) => {
                    debug!(device_id, "camera probe failed to open: {err}");
                    continue;
                }
            };
            match device.read() {
                Ok(_) => return Ok((device_id, device)),
                Err(err) => warn!(device_id, "camera opened but first read failed: {err}"),
            }
        }
        Err(CaptureError::CameraUnavailable {
            tried: self.config.device_ids.clone(),
        })
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    config: FrameSourceConfig,
    backend: Arc<dyn CameraBackend>,
    buffer: Arc<FrameBuffer>,
    heartbeat: Arc<Heartbeat>,
    running: Arc<AtomicBool>,
    device_id: i32,
}

impl CaptureLoop {
    /// Body of the capture thread. The device lives on this stack frame, so
    /// it is released on every exit path including unwinding.
    fn run(self, device: Box<dyn CaptureDevice>) {
        let mut device = Some(device);
        let mut failures: u32 = 0;
        let mut last_read: Option<Instant> = None;

        while self.running.load(Ordering::Relaxed) {
            if let Some(last) = last_read {
                let elapsed = last.elapsed();
                if elapsed < self.config.frame_interval {
                    let wait = self.config.frame_interval - elapsed;
                    thread::sleep(wait.min(self.config.poll_interval));
                    continue;
                }
            }

            let Some(active) = device.as_mut() else {
                device = self.reopen();
                if device.is_none() {
                    self.pause(self.config.reopen_backoff);
                }
                continue;
            };

            let read_started = Instant::now();
            last_read = Some(read_started);
            match active.read() {
                Ok(frame) => {
                    failures = 0;
                    self.heartbeat.beat();
                    metrics::counter!("ingest_frames_captured_total").increment(1);
                    // Paced read instants are at least one interval apart.
                    self.buffer.put(frame.with_captured_at(read_started));
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    metrics::counter!("ingest_read_failures_total").increment(1);
                    warn!(
                        device_id = self.device_id,
                        failures, "camera read failed: {err}"
                    );
                    if failures >= self.config.max_read_failures {
                        warn!(
                            device_id = self.device_id,
                            "too many consecutive read failures; reinitialising camera"
                        );
                        drop(device.take());
                        failures = 0;
                        device = self.reopen();
                        if device.is_none() {
                            self.pause(self.config.reopen_backoff);
                        }
                    } else {
                        self.pause(self.config.failure_backoff);
                    }
                }
            }
        }

        drop(device);
        debug!(device_id = self.device_id, "capture loop exited; camera released");
    }

    fn reopen(&self) -> Option<Box<dyn CaptureDevice>> {
        match self.backend.open(self.device_id) {
            Ok(device) => {
                metrics::counter!("ingest_device_reopens_total").increment(1);
                info!(device_id = self.device_id, "camera reopened");
                Some(device)
            }
            Err(err) => {
                warn!(device_id = self.device_id, "camera reopen failed: {err}");
                None
            }
        }
    }

    /// Sleep in poll-sized slices, returning early once stopped.
    fn pause(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(self.config.poll_interval));
        }
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::SyntheticBackend, types::Frame};

    fn fast_config() -> FrameSourceConfig {
        FrameSourceConfig {
            device_ids: vec![0],
            frame_interval: Duration::from_millis(2),
            failure_backoff: Duration::from_millis(1),
            reopen_backoff: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            ..FrameSourceConfig::default()
        }
    }

    fn unthrottled_buffer() -> Arc<FrameBuffer> {
        Arc::new(FrameBuffer::new(30, Duration::ZERO))
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_start_fails_without_device_and_spawns_nothing() {
        let backend = SyntheticBackend::blank(4, 4);
        let mut source = FrameSource::new(
            FrameSourceConfig {
                device_ids: vec![3, 4],
                ..fast_config()
            },
            Arc::new(backend.clone()),
            unthrottled_buffer(),
        );
        match source.start() {
            Err(CaptureError::CameraUnavailable { tried }) => assert_eq!(tried, vec![3, 4]),
            other => panic!("unexpected start result: {other:?}"),
        }
        assert!(!source.is_running());
        assert_eq!(backend.live_devices(), 0);
    }

    #[test]
    fn test_probe_falls_through_to_next_device() {
        let backend = SyntheticBackend::new(vec![1], |_| Ok(Frame::bgr(vec![0; 3], 1, 1)));
        let mut source = FrameSource::new(
            FrameSourceConfig {
                device_ids: vec![0, 1],
                ..fast_config()
            },
            Arc::new(backend),
            unthrottled_buffer(),
        );
        source.start().expect("device 1 should open");
        assert_eq!(source.device_id(), Some(1));
        source.stop();
        assert_eq!(source.device_id(), None);
    }

    #[test]
    fn test_frames_flow_and_stop_releases_device() {
        let backend = SyntheticBackend::blank(4, 4);
        let buffer = unthrottled_buffer();
        let mut source =
            FrameSource::new(fast_config(), Arc::new(backend.clone()), buffer.clone());
        source.start().expect("start");
        assert!(wait_until(Duration::from_secs(2), || buffer.len() >= 3));
        assert!(source.is_ready());
        source.stop();
        assert!(!source.is_ready());
        assert_eq!(backend.live_devices(), 0);
    }

    #[test]
    fn test_consecutive_failures_trigger_reopen() {
        let backend = SyntheticBackend::new(vec![0], |index| {
            if (1..=3).contains(&index) {
                Err(CaptureError::ReadTransient {
                    device_id: 0,
                    reason: "scripted".into(),
                })
            } else {
                Ok(Frame::bgr(vec![index as u8; 3], 1, 1))
            }
        });
        let buffer = unthrottled_buffer();
        let mut source =
            FrameSource::new(fast_config(), Arc::new(backend.clone()), buffer.clone());
        source.start().expect("start");
        assert!(wait_until(Duration::from_secs(2), || backend.open_count() >= 2
            && !buffer.is_empty()));
        source.stop();
        assert_eq!(backend.open_count(), 2);
        assert_eq!(backend.live_devices(), 0);
    }

    #[test]
    fn test_unplugged_camera_is_retried_at_backoff_until_it_returns() {
        let failing = Arc::new(AtomicBool::new(false));
        let backend = SyntheticBackend::new(vec![0], {
            let failing = failing.clone();
            move |_| {
                if failing.load(Ordering::SeqCst) {
                    Err(CaptureError::ReadTransient {
                        device_id: 0,
                        reason: "unplugged".into(),
                    })
                } else {
                    Ok(Frame::bgr(vec![0; 3], 1, 1))
                }
            }
        });
        let config = FrameSourceConfig {
            reopen_backoff: Duration::from_millis(50),
            ..fast_config()
        };
        let buffer = unthrottled_buffer();
        let mut source = FrameSource::new(config, Arc::new(backend.clone()), buffer.clone());
        source.start().expect("start");
        assert_eq!(backend.open_attempts(), 1);

        backend.set_available(vec![]);
        failing.store(true, Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || backend.open_attempts() >= 3));
        assert_eq!(backend.live_devices(), 0);

        let before = backend.open_attempts();
        thread::sleep(Duration::from_millis(300));
        let retries = backend.open_attempts() - before;
        assert!((2..=8).contains(&retries), "{retries} reopen attempts in 300 ms");
        assert!(source.is_running());
        assert_eq!(backend.open_count(), 1);

        buffer.clear();
        failing.store(false, Ordering::SeqCst);
        backend.set_available(vec![0]);
        assert!(wait_until(Duration::from_secs(2), || !buffer.is_empty()));
        assert_eq!(backend.open_count(), 2);
        assert_eq!(backend.live_devices(), 1);
        source.stop();
        assert_eq!(backend.live_devices(), 0);
    }

    #[test]
    fn test_panicking_device_is_still_released() {
        let backend = SyntheticBackend::new(vec![0], |index| {
            if index == 2 {
                panic!("scripted device fault");
            }
            Ok(Frame::bgr(vec![0; 3], 1, 1))
        });
        let mut source =
            FrameSource::new(fast_config(), Arc::new(backend.clone()), unthrottled_buffer());
        source.start().expect("start");
        assert!(wait_until(Duration::from_secs(2), || backend.live_devices() == 0));
        source.stop();
        assert_eq!(backend.live_devices(), 0);
    }

    #[test]
    fn test_heartbeat_reports_age_after_beat() {
        let heartbeat = Heartbeat::new();
        assert!(heartbeat.age().is_none());
        heartbeat.beat();
        assert!(heartbeat.age().is_some_and(|age| age < Duration::from_secs(1)));
        heartbeat.reset();
        assert!(heartbeat.age().is_none());
    }
}
