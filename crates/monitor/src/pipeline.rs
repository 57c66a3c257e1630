//! Detection dispatch.
//!
//! One dispatch thread drains the frame buffer and fans each frame out to
//! every registered [`Detector`] on a small worker pool. Each detector has a
//! per-frame budget; a detector that overruns, panics or cannot be scheduled
//! is recorded as failed for that frame and the others still contribute.
//! A detector runs at most one call at a time: while an overrun call is
//! still executing, later frames skip that detector as `Saturated`. A job
//! that reaches a worker after its deadline is dropped without running.
//! Results are folded into [`DetectionState`], the frame is annotated for
//! preview, and a [`DetectionRecord`] is published on a drop-oldest channel.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::Local;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use video_ingest::{Frame, FrameBuffer, Heartbeat};

use crate::{
    annotation::{Overlay, annotate_frame},
    config::PipelineConfig,
    detector::{Detector, DetectorError, DetectorResult},
    state::DetectionState,
    telemetry::spawn_thread,
};

type Job = Box<dyn FnOnce() + Send + 'static>;
type SharedFrame = Arc<Mutex<Option<Arc<Frame>>>>;

/// Extra time granted to workers on shutdown before they are left detached.
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(1);

/// Everything the detectors produced for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionRecord {
    /// Wall-clock time the record was assembled (ms since the epoch).
    pub timestamp_ms: i64,
    pub frame_timestamp_ms: i64,
    pub frame_number: u64,
    pub results: Vec<DetectorResult>,
    /// Detectors that timed out, panicked, errored or were skipped.
    pub failed: Vec<&'static str>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("detection pipeline is already running")]
    AlreadyRunning,
    #[error("failed to spawn pipeline thread")]
    Spawn(#[from] io::Error),
}

pub struct DetectionPipeline {
    config: PipelineConfig,
    buffer: Arc<FrameBuffer>,
    state: Arc<DetectionState>,
    detectors: Vec<Arc<dyn Detector>>,
    running: Arc<AtomicBool>,
    heartbeat: Arc<Heartbeat>,
    latest: SharedFrame,
    records_tx: Sender<DetectionRecord>,
    records_rx: Receiver<DetectionRecord>,
    dispatch: Option<JoinHandle<()>>,
    pool: Option<Arc<WorkerPool>>,
}

impl DetectionPipeline {
    pub fn new(
        config: PipelineConfig,
        buffer: Arc<FrameBuffer>,
        state: Arc<DetectionState>,
    ) -> Self {
        let (records_tx, records_rx) = crossbeam_channel::bounded(config.record_capacity.max(1));
        Self {
            config,
            buffer,
            state,
            detectors: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            heartbeat: Arc::new(Heartbeat::new()),
            latest: Arc::new(Mutex::new(None)),
            records_tx,
            records_rx,
            dispatch: None,
            pool: None,
        }
    }

    /// Register a detector. Only allowed while stopped.
    pub fn add_detector(&mut self, detector: Arc<dyn Detector>) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        info!(detector = detector.name(), "detector registered");
        self.detectors.push(detector);
        Ok(())
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|detector| detector.name()).collect()
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        if self.detectors.is_empty() {
            warn!("starting detection pipeline without detectors");
        }

        let pool = Arc::new(WorkerPool::spawn(self.config.workers)?);
        self.heartbeat.reset();
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = Dispatcher {
            detectors: self
                .detectors
                .iter()
                .map(|detector| Slot {
                    detector: detector.clone(),
                    busy: Arc::new(AtomicBool::new(false)),
                })
                .collect(),
            pool: pool.clone(),
            buffer: self.buffer.clone(),
            state: self.state.clone(),
            running: self.running.clone(),
            heartbeat: self.heartbeat.clone(),
            latest: self.latest.clone(),
            records_tx: self.records_tx.clone(),
            records_rx: self.records_rx.clone(),
            timeout: self.config.detector_timeout,
            poll_interval: self.config.poll_interval,
        };
        let handle = match spawn_thread("detect-dispatch", move || dispatcher.run()) {
            Ok(handle) => handle,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                pool.shutdown(WORKER_JOIN_GRACE);
                return Err(PipelineError::Spawn(err));
            }
        };
        self.dispatch = Some(handle);
        self.pool = Some(pool);
        info!(
            workers = self.config.workers,
            detectors = ?self.detector_names(),
            timeout_ms = self.config.detector_timeout.as_millis() as u64,
            "detection pipeline started"
        );
        Ok(())
    }

    /// Stop dispatching and wind down the workers. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let was_running = self.dispatch.is_some();
        if let Some(handle) = self.dispatch.take() {
            if handle.join().is_err() {
                warn!("dispatch thread panicked");
            }
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown(self.config.detector_timeout + WORKER_JOIN_GRACE);
        }
        if was_running {
            info!("detection pipeline stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver for detection records. Clones share one queue.
    pub fn records(&self) -> Receiver<DetectionRecord> {
        self.records_rx.clone()
    }

    pub fn latest_annotated_frame(&self) -> Option<Arc<Frame>> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }
}

impl Drop for DetectionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fixed set of named threads executing boxed jobs from a bounded queue.
struct WorkerPool {
    jobs: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn spawn(workers: usize) -> io::Result<Self> {
        let workers = workers.max(1);
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded::<Job>(workers * 4);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let jobs_rx = jobs_rx.clone();
            let spawned = spawn_thread(format!("detect-worker-{index}"), move || {
                for job in jobs_rx.iter() {
                    job();
                }
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    drop(jobs_tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            handles: Mutex::new(handles),
        })
    }

    /// Queue a job without blocking. Returns `false` when the queue is full
    /// or the pool is shutting down.
    fn submit(&self, job: Job) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.as_ref() {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => true,
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Close the queue and join the workers. Workers still busy after
    /// `grace` (a detector that never returns) are left detached.
    fn shutdown(&self, grace: Duration) {
        drop(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take());
        let handles = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *handles)
        };
        let deadline = Instant::now() + grace;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("detector worker still busy at shutdown; detaching");
            }
        }
    }
}

/// A registered detector and whether a call to it is still in flight.
struct Slot {
    detector: Arc<dyn Detector>,
    busy: Arc<AtomicBool>,
}

/// Clears a slot's busy flag when the job finishes or is dropped unrun.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Dispatcher {
    detectors: Vec<Slot>,
    pool: Arc<WorkerPool>,
    buffer: Arc<FrameBuffer>,
    state: Arc<DetectionState>,
    running: Arc<AtomicBool>,
    heartbeat: Arc<Heartbeat>,
    latest: SharedFrame,
    records_tx: Sender<DetectionRecord>,
    records_rx: Receiver<DetectionRecord>,
    timeout: Duration,
    poll_interval: Duration,
}

enum Pending {
    Waiting(&'static str, Receiver<Result<Option<DetectorResult>, DetectorError>>),
    Failed(DetectorError),
}

impl Dispatcher {
    fn run(self) {
        let mut frame_number: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            self.heartbeat.beat();
            let Some(frame) = self.buffer.get() else {
                thread::sleep(self.poll_interval);
                continue;
            };
            frame_number = frame_number.wrapping_add(1);
            let span = info_span!("pipeline.frame", frame = frame_number, ts = frame.timestamp_ms);
            let _guard = span.enter();
            let record = self.process(Arc::new(frame), frame_number);
            self.publish(record);
            metrics::counter!("pipeline_frames_processed_total").increment(1);
        }
        debug!("dispatch loop exiting");
    }

    fn process(&self, frame: Arc<Frame>, frame_number: u64) -> DetectionRecord {
        let deadline = Instant::now() + self.timeout;
        let pending: Vec<Pending> = self
            .detectors
            .iter()
            .map(|slot| self.submit(slot, frame.clone(), deadline))
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        let mut failed = Vec::new();
        for entry in pending {
            let outcome = match entry {
                Pending::Waiting(name, reply) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match reply.recv_timeout(remaining) {
                        Ok(outcome) => outcome,
                        Err(RecvTimeoutError::Timeout) => Err(DetectorError::TimedOut {
                            detector: name,
                            timeout_ms: self.timeout.as_millis() as u64,
                        }),
                        Err(RecvTimeoutError::Disconnected) => {
                            Err(DetectorError::Panicked { detector: name })
                        }
                    }
                }
                Pending::Failed(err) => Err(err),
            };
            match outcome {
                Ok(Some(result)) => {
                    self.state.apply(&result);
                    results.push(result);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(frame = frame_number, error = %err, "detector failed");
                    metrics::counter!(
                        "pipeline_detector_failures_total",
                        "detector" => err.detector(),
                        "kind" => err.kind()
                    )
                    .increment(1);
                    failed.push(err.detector());
                }
            }
        }

        self.store_annotated(&frame, &results, frame_number);
        DetectionRecord {
            timestamp_ms: Local::now().timestamp_millis(),
            frame_timestamp_ms: frame.timestamp_ms,
            frame_number,
            results,
            failed,
        }
    }

    fn submit(&self, slot: &Slot, frame: Arc<Frame>, deadline: Instant) -> Pending {
        let detector = slot.detector.clone();
        let name = detector.name();
        if slot.busy.swap(true, Ordering::AcqRel) {
            debug!(detector = name, "previous call still running; skipping frame");
            return Pending::Failed(DetectorError::Saturated { detector: name });
        }
        let busy = BusyGuard(slot.busy.clone());
        let timeout_ms = self.timeout.as_millis() as u64;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            if Instant::now() >= deadline {
                drop(busy);
                let _ = reply_tx.send(Err(DetectorError::TimedOut {
                    detector: name,
                    timeout_ms,
                }));
                return;
            }
            let started = Instant::now();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| detector.detect(&frame)))
                .unwrap_or(Err(DetectorError::Panicked { detector: name }));
            metrics::histogram!("pipeline_detector_latency_ms", "detector" => name)
                .record(started.elapsed().as_secs_f64() * 1000.0);
            drop(busy);
            let _ = reply_tx.send(outcome);
        });
        if self.pool.submit(job) {
            Pending::Waiting(name, reply_rx)
        } else {
            Pending::Failed(DetectorError::Saturated { detector: name })
        }
    }

    fn store_annotated(&self, frame: &Frame, results: &[DetectorResult], frame_number: u64) {
        let mut posture = None;
        let mut landmarks = None;
        let mut emotion = None;
        for result in results {
            match result {
                DetectorResult::Posture {
                    label,
                    landmarks: points,
                    ..
                } => {
                    posture = Some(*label);
                    landmarks = points.as_ref();
                }
                DetectorResult::Emotion { label } => emotion = Some(label.clone()),
            }
        }
        let emotion = emotion.unwrap_or_else(|| self.state.emotion());
        let overlay = Overlay {
            landmarks,
            posture: posture.unwrap_or_else(|| self.state.posture()),
            emotion: &emotion,
            frame_number,
        };
        let annotated = match annotate_frame(frame, &overlay) {
            Ok(annotated) => annotated,
            Err(err) => {
                debug!(error = %err, "annotation skipped");
                frame.clone()
            }
        };
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(annotated));
    }

    /// Publish without blocking, evicting the oldest unread record when full.
    fn publish(&self, mut record: DetectionRecord) {
        loop {
            match self.records_tx.try_send(record) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    record = returned;
                    if self.records_rx.try_recv().is_ok() {
                        metrics::counter!("pipeline_records_dropped_total").increment(1);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

impl std::fmt::Debug for DetectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionPipeline")
            .field("detectors", &self.detector_names())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;

    struct Scripted {
        name: &'static str,
        delay: Duration,
        panics: bool,
        emotion: &'static str,
    }

    impl Detector for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn detect(&self, _frame: &Frame) -> Result<Option<DetectorResult>, DetectorError> {
            thread::sleep(self.delay);
            if self.panics {
                panic!("scripted detector failure");
            }
            Ok(Some(DetectorResult::Emotion {
                label: self.emotion.to_string(),
            }))
        }
    }

    fn fast(emotion: &'static str) -> Arc<dyn Detector> {
        Arc::new(Scripted {
            name: "fast",
            delay: Duration::ZERO,
            panics: false,
            emotion,
        })
    }

    fn pipeline(timeout: Duration) -> (DetectionPipeline, Arc<FrameBuffer>, Arc<DetectionState>) {
        let buffer = Arc::new(FrameBuffer::new(8, Duration::ZERO));
        let state = Arc::new(DetectionState::with_system_clock(StateConfig::default()));
        let config = PipelineConfig {
            workers: 2,
            detector_timeout: timeout,
            poll_interval: Duration::from_millis(2),
            record_capacity: 8,
        };
        (DetectionPipeline::new(config, buffer.clone(), state.clone()), buffer, state)
    }

    fn frame() -> Frame {
        Frame::bgr(vec![0; 8 * 8 * 3], 8, 8)
    }

    #[test]
    fn test_slow_detector_times_out_without_blocking_others() {
        let (mut pipeline, buffer, state) = pipeline(Duration::from_millis(50));
        pipeline
            .add_detector(Arc::new(Scripted {
                name: "slow",
                delay: Duration::from_millis(400),
                panics: false,
                emotion: "late",
            }))
            .unwrap();
        pipeline.add_detector(fast("calm")).unwrap();
        let records = pipeline.records();
        pipeline.start().unwrap();

        let submitted = Instant::now();
        buffer.put(frame());
        let record = records.recv_timeout(Duration::from_secs(2)).expect("record");
        assert!(submitted.elapsed() < Duration::from_millis(350));
        assert_eq!(record.frame_number, 1);
        assert_eq!(record.failed, vec!["slow"]);
        assert_eq!(record.results.len(), 1);
        assert_eq!(state.emotion(), "calm");
        assert!(pipeline.latest_annotated_frame().is_some());
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn test_overrunning_detector_does_not_starve_others_across_frames() {
        let buffer = Arc::new(FrameBuffer::new(8, Duration::ZERO));
        let state = Arc::new(DetectionState::with_system_clock(StateConfig::default()));
        let mut pipeline =
            DetectionPipeline::new(PipelineConfig::default(), buffer.clone(), state.clone());
        pipeline
            .add_detector(Arc::new(Scripted {
                name: "slow",
                delay: Duration::from_millis(300),
                panics: false,
                emotion: "late",
            }))
            .unwrap();
        pipeline.add_detector(fast("calm")).unwrap();
        let records = pipeline.records();
        pipeline.start().unwrap();

        let mut seen = Vec::new();
        for _ in 0..24 {
            buffer.put(frame());
            thread::sleep(Duration::from_millis(33));
            seen.extend(records.try_iter());
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while buffer.len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(150));
        seen.extend(records.try_iter());
        pipeline.stop();

        assert!(seen.len() >= 15, "only {} records", seen.len());
        for record in &seen {
            assert_eq!(record.failed, vec!["slow"], "frame {}", record.frame_number);
            assert_eq!(record.results.len(), 1, "frame {}", record.frame_number);
        }
        assert_eq!(state.emotion(), "calm");
    }

    #[test]
    fn test_panicking_detector_is_isolated() {
        let (mut pipeline, buffer, _state) = pipeline(Duration::from_millis(200));
        pipeline
            .add_detector(Arc::new(Scripted {
                name: "broken",
                delay: Duration::ZERO,
                panics: true,
                emotion: "",
            }))
            .unwrap();
        pipeline.add_detector(fast("happy")).unwrap();
        let records = pipeline.records();
        pipeline.start().unwrap();

        buffer.put(frame());
        let first = records.recv_timeout(Duration::from_secs(2)).expect("first record");
        buffer.put(frame());
        let second = records.recv_timeout(Duration::from_secs(2)).expect("second record");
        for record in [&first, &second] {
            assert_eq!(record.failed, vec!["broken"]);
            assert_eq!(record.results.len(), 1);
        }
        assert_eq!(second.frame_number, 2);
        pipeline.stop();
    }

    #[test]
    fn test_detectors_cannot_be_added_while_running() {
        let (mut pipeline, _buffer, _state) = pipeline(Duration::from_millis(50));
        pipeline.add_detector(fast("calm")).unwrap();
        pipeline.start().unwrap();
        assert!(matches!(
            pipeline.add_detector(fast("calm")),
            Err(PipelineError::AlreadyRunning)
        ));
        assert!(matches!(pipeline.start(), Err(PipelineError::AlreadyRunning)));
        pipeline.stop();
        pipeline.stop();
        assert!(pipeline.add_detector(fast("calm")).is_ok());
    }

    #[test]
    fn test_record_queue_drops_oldest() {
        let (mut pipeline, buffer, _state) = pipeline(Duration::from_millis(50));
        pipeline.add_detector(fast("calm")).unwrap();
        let records = pipeline.records();
        pipeline.start().unwrap();
        for _ in 0..12 {
            buffer.put(frame());
            thread::sleep(Duration::from_millis(10));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while buffer.len() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        pipeline.stop();

        let numbers: Vec<u64> = records.try_iter().map(|record| record.frame_number).collect();
        assert_eq!(numbers.len(), 8);
        assert_eq!(numbers.last(), Some(&12));
    }
}
