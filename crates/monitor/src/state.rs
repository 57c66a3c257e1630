//! Detection state: the single mutable aggregate of a monitoring session.
//!
//! All reads and writes go through one mutex so the statistics update and the
//! label switch of a posture change are observed together. Logging happens
//! after the lock is released.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use chrono::{DateTime, Local};
use pose_core::{PostureGuidance, PostureLabel};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    clock::{Clock, SystemClock},
    config::StateConfig,
    detector::DetectorResult,
};

/// Emotion reported before any detection ran.
pub const EMOTION_UNDETECTED: &str = "undetected";

/// Cumulative seconds per tracked posture.
pub type PostureStatistics = BTreeMap<PostureLabel, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Presence {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Posture,
    Emotion,
    Wake,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Posture, Feature::Emotion, Feature::Wake];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Posture => "posture",
            Feature::Emotion => "emotion",
            Feature::Wake => "wake",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = StateError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|feature| feature.as_str().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| StateError::UnknownFeature(name.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown feature {0:?} (expected posture, emotion or wake)")]
    UnknownFeature(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureFlags {
    pub posture: bool,
    pub emotion: bool,
    pub wake: bool,
}

impl FeatureFlags {
    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::Posture => self.posture,
            Feature::Emotion => self.emotion,
            Feature::Wake => self.wake,
        }
    }

    fn set(&mut self, feature: Feature, enabled: bool) {
        match feature {
            Feature::Posture => self.posture = enabled,
            Feature::Emotion => self.emotion = enabled,
            Feature::Wake => self.wake = enabled,
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            posture: true,
            emotion: true,
            wake: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry<L> {
    pub label: L,
    pub at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraStatus {
    Stopped,
    Ready,
    NotReady,
}

/// Point-in-time copy of the detection state, safe to serialise.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionSnapshot {
    pub posture: PostureLabel,
    pub posture_guidance: PostureGuidance,
    pub emotion: String,
    pub posture_history: Vec<HistoryEntry<PostureLabel>>,
    pub emotion_history: Vec<HistoryEntry<String>>,
    /// Includes the in-progress segment of the current posture.
    pub statistics: PostureStatistics,
    pub wake_count: u32,
    pub presence: Presence,
    /// Wall time of the last IN/OUT transition this session.
    pub presence_changed_at: Option<DateTime<Local>>,
    pub features: FeatureFlags,
    pub session_started: Option<DateTime<Local>>,
    pub session_ended: Option<DateTime<Local>>,
    pub elapsed_secs: f64,
    pub camera_status: CameraStatus,
    pub taken_at: DateTime<Local>,
}

impl DetectionSnapshot {
    pub fn tracked_total_secs(&self) -> f64 {
        self.statistics.values().sum()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Thread-safe aggregate of detection results.
pub struct DetectionState {
    config: StateConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<StateInner>,
}

struct StateInner {
    posture: PostureLabel,
    emotion: String,
    posture_history: VecDeque<HistoryEntry<PostureLabel>>,
    emotion_history: VecDeque<HistoryEntry<String>>,
    statistics: PostureStatistics,
    last_change: Instant,
    presence: Presence,
    present_since: Option<Instant>,
    presence_changed_at: Option<DateTime<Local>>,
    wake_count: u32,
    features: FeatureFlags,
    session_started: Option<(Instant, DateTime<Local>)>,
    session_ended: Option<(Instant, DateTime<Local>)>,
}

impl StateInner {
    fn fresh(now: Instant) -> Self {
        Self {
            posture: PostureLabel::Undetected,
            emotion: EMOTION_UNDETECTED.to_string(),
            posture_history: VecDeque::new(),
            emotion_history: VecDeque::new(),
            statistics: zeroed_statistics(),
            last_change: now,
            presence: Presence::Out,
            present_since: None,
            presence_changed_at: None,
            wake_count: 0,
            features: FeatureFlags::default(),
            session_started: None,
            session_ended: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.session_ended.is_some()
    }

    /// Credit time since the last change to the current posture.
    fn accumulate(&mut self, now: Instant) {
        if self.posture.is_tracked() {
            let elapsed = now.saturating_duration_since(self.last_change).as_secs_f64();
            *self.statistics.entry(self.posture).or_default() += elapsed;
        }
        self.last_change = now;
    }
}

fn zeroed_statistics() -> PostureStatistics {
    PostureLabel::TRACKED.iter().map(|&label| (label, 0.0)).collect()
}

fn push_bounded<T>(ring: &mut VecDeque<T>, capacity: usize, item: T) {
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

impl DetectionState {
    pub fn new(config: StateConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Mutex::new(StateInner::fresh(now)),
        }
    }

    pub fn with_system_clock(config: StateConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset everything but the feature flags for a new session and start
    /// the session clock.
    pub fn begin_session(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        {
            let mut inner = self.lock();
            let features = inner.features;
            *inner = StateInner::fresh(now);
            inner.features = features;
            inner.session_started = Some((now, wall));
        }
        info!("detection state reset for new session");
    }

    /// Fold the in-progress posture segment into the statistics and freeze
    /// the session. Later updates are ignored. Idempotent.
    pub fn end_session(&self) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut inner = self.lock();
        if inner.is_closed() {
            return;
        }
        inner.accumulate(now);
        inner.session_ended = Some((now, wall));
    }

    /// Switch the current posture. Returns whether the label changed.
    pub fn update_posture(&self, label: PostureLabel) -> bool {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let previous = {
            let mut inner = self.lock();
            if inner.is_closed() || !inner.features.posture || inner.posture == label {
                return false;
            }
            inner.accumulate(now);
            if label.is_tracked() {
                push_bounded(
                    &mut inner.posture_history,
                    self.config.posture_history,
                    HistoryEntry { label, at: wall },
                );
            }
            std::mem::replace(&mut inner.posture, label)
        };
        debug!(from = %previous, to = %label, "posture changed");
        true
    }

    /// Overwrite the current emotion, recording it when it differs from the
    /// most recent history entry.
    pub fn update_emotion(&self, label: impl Into<String>) {
        let label = label.into();
        let wall = self.clock.wall();
        let mut inner = self.lock();
        if inner.is_closed() || !inner.features.emotion {
            return;
        }
        let repeated = inner
            .emotion_history
            .back()
            .is_some_and(|entry| entry.label == label);
        if !repeated {
            push_bounded(
                &mut inner.emotion_history,
                self.config.emotion_history,
                HistoryEntry {
                    label: label.clone(),
                    at: wall,
                },
            );
        }
        inner.emotion = label;
    }

    /// Feed one presence observation into the IN/OUT state machine.
    ///
    /// OUT becomes IN only after continuous presence for the debounce
    /// interval, counting a night wake when wake tracking is enabled. IN
    /// becomes OUT on the first absent observation. Returns the new state on
    /// a transition.
    pub fn observe_presence(&self, present: bool) -> Option<Presence> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let (transition, wake_count) = {
            let mut inner = self.lock();
            if inner.is_closed() {
                return None;
            }
            let transition = match (inner.presence, present) {
                (Presence::In, true) => None,
                (Presence::In, false) => {
                    inner.presence = Presence::Out;
                    inner.presence_changed_at = Some(wall);
                    inner.present_since = None;
                    Some(Presence::Out)
                }
                (Presence::Out, false) => {
                    inner.present_since = None;
                    None
                }
                (Presence::Out, true) => {
                    let since = *inner.present_since.get_or_insert(now);
                    if now.saturating_duration_since(since) >= self.config.presence_debounce {
                        inner.presence = Presence::In;
                        inner.presence_changed_at = Some(wall);
                        inner.present_since = None;
                        if inner.features.wake {
                            inner.wake_count += 1;
                        }
                        Some(Presence::In)
                    } else {
                        None
                    }
                }
            };
            (transition, inner.wake_count)
        };

        match transition {
            Some(Presence::In) => {
                metrics::counter!("monitor_presence_transitions_total", "to" => "in").increment(1);
                info!(wake_count, "subject back in frame");
            }
            Some(Presence::Out) => {
                metrics::counter!("monitor_presence_transitions_total", "to" => "out").increment(1);
                info!("subject left the frame");
            }
            None => {}
        }
        transition
    }

    /// Apply one detector result.
    pub fn apply(&self, result: &DetectorResult) {
        match result {
            DetectorResult::Posture {
                label, landmarks, ..
            } => {
                self.update_posture(*label);
                self.observe_presence(landmarks.is_some());
            }
            DetectorResult::Emotion { label } => self.update_emotion(label.as_str()),
        }
    }

    pub fn set_feature_enabled(&self, feature: Feature, enabled: bool) {
        self.lock().features.set(feature, enabled);
        info!(%feature, enabled, "feature toggled");
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.lock().features.get(feature)
    }

    pub fn posture(&self) -> PostureLabel {
        self.lock().posture
    }

    pub fn emotion(&self) -> String {
        self.lock().emotion.clone()
    }

    pub fn wake_count(&self) -> u32 {
        self.lock().wake_count
    }

    pub fn presence(&self) -> Presence {
        self.lock().presence
    }

    /// Immutable copy of the state. Statistics include the current posture's
    /// running segment without modifying the stored totals.
    pub fn snapshot(&self) -> DetectionSnapshot {
        let now = self.clock.now();
        let taken_at = self.clock.wall();
        let inner = self.lock();

        let horizon = inner.session_ended.map(|(at, _)| at).unwrap_or(now);
        let mut statistics = inner.statistics.clone();
        if inner.posture.is_tracked() && !inner.is_closed() {
            let running = horizon.saturating_duration_since(inner.last_change).as_secs_f64();
            *statistics.entry(inner.posture).or_default() += running;
        }
        let elapsed_secs = inner
            .session_started
            .map(|(start, _)| horizon.saturating_duration_since(start).as_secs_f64())
            .unwrap_or_default();

        DetectionSnapshot {
            posture: inner.posture,
            posture_guidance: inner.posture.guidance(),
            emotion: inner.emotion.clone(),
            posture_history: inner.posture_history.iter().cloned().collect(),
            emotion_history: inner.emotion_history.iter().cloned().collect(),
            statistics,
            wake_count: inner.wake_count,
            presence: inner.presence,
            presence_changed_at: inner.presence_changed_at,
            features: inner.features,
            session_started: inner.session_started.map(|(_, wall)| wall),
            session_ended: inner.session_ended.map(|(_, wall)| wall),
            elapsed_secs,
            camera_status: CameraStatus::Stopped,
            taken_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    use PostureLabel::{HeadLeftSupine, LeftLateral, NormalSupine, RightLateral, Undetected};

    fn state_with_clock() -> (DetectionState, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let state = DetectionState::new(StateConfig::default(), clock.clone());
        state.begin_session();
        (state, clock)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_initial_state_after_reset() {
        let (state, _clock) = state_with_clock();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.posture, Undetected);
        assert_eq!(snapshot.emotion, EMOTION_UNDETECTED);
        assert_eq!(snapshot.presence, Presence::Out);
        assert_eq!(snapshot.wake_count, 0);
        assert_eq!(snapshot.statistics.len(), PostureLabel::TRACKED.len());
        assert!(snapshot.statistics.values().all(|&secs| secs == 0.0));
        assert!(snapshot.session_started.is_some());
        assert_eq!(snapshot.features, FeatureFlags::default());
    }

    #[test]
    fn test_statistics_sum_matches_elapsed_time() {
        let (state, clock) = state_with_clock();
        let sequence = [
            (LeftLateral, 12.5),
            (NormalSupine, 3.25),
            (LeftLateral, 0.75),
            (HeadLeftSupine, 40.0),
            (RightLateral, 7.0),
            (NormalSupine, 1.5),
        ];
        let mut total = 0.0;
        for (label, secs) in sequence {
            state.update_posture(label);
            clock.advance_secs(secs);
            total += secs;
        }
        state.end_session();

        let snapshot = state.snapshot();
        assert_close(snapshot.tracked_total_secs(), total);
        assert_close(snapshot.elapsed_secs, total);
        assert_close(snapshot.statistics[&LeftLateral], 13.25);
        assert_close(snapshot.statistics[&HeadLeftSupine], 40.0);
    }

    #[test]
    fn test_snapshot_includes_running_segment_without_mutating() {
        let (state, clock) = state_with_clock();
        state.update_posture(LeftLateral);
        clock.advance_secs(5.0);

        let first = state.snapshot();
        assert_close(first.statistics[&LeftLateral], 5.0);
        clock.advance_secs(2.0);
        let second = state.snapshot();
        assert_close(second.statistics[&LeftLateral], 7.0);

        state.update_posture(NormalSupine);
        let after_change = state.snapshot();
        assert_close(after_change.statistics[&LeftLateral], 7.0);
        assert_close(after_change.statistics[&NormalSupine], 0.0);
    }

    #[test]
    fn test_undetected_time_is_not_credited() {
        let (state, clock) = state_with_clock();
        clock.advance_secs(3.0);
        state.update_posture(NormalSupine);
        clock.advance_secs(4.0);
        state.update_posture(Undetected);
        clock.advance_secs(10.0);
        let snapshot = state.snapshot();
        assert_close(snapshot.tracked_total_secs(), 4.0);
        assert_eq!(snapshot.posture_history.len(), 1);
    }

    #[test]
    fn test_posture_history_keeps_latest_hundred() {
        let (state, _clock) = state_with_clock();
        for i in 0..150 {
            let label = if i % 2 == 0 { LeftLateral } else { NormalSupine };
            assert!(state.update_posture(label));
        }
        let history = state.snapshot().posture_history;
        assert_eq!(history.len(), 100);
        // Entry 50 (even, left) is now the oldest retained.
        assert_eq!(history[0].label, LeftLateral);
        assert_eq!(history[99].label, NormalSupine);
    }

    #[test]
    fn test_repeated_posture_is_a_no_op() {
        let (state, clock) = state_with_clock();
        assert!(state.update_posture(LeftLateral));
        clock.advance_secs(1.0);
        assert!(!state.update_posture(LeftLateral));
        assert_eq!(state.snapshot().posture_history.len(), 1);
    }

    #[test]
    fn test_disabled_posture_feature_ignores_updates() {
        let (state, _clock) = state_with_clock();
        state.set_feature_enabled(Feature::Posture, false);
        assert!(!state.update_posture(LeftLateral));
        assert_eq!(state.posture(), Undetected);
        state.set_feature_enabled(Feature::Posture, true);
        assert!(state.update_posture(LeftLateral));
    }

    #[test]
    fn test_emotion_history_skips_consecutive_duplicates() {
        let (state, _clock) = state_with_clock();
        for label in ["happy", "happy", "neutral", "neutral", "happy"] {
            state.update_emotion(label);
        }
        let snapshot = state.snapshot();
        assert_eq!(snapshot.emotion, "happy");
        let labels: Vec<&str> = snapshot
            .emotion_history
            .iter()
            .map(|e| e.label.as_str())
            .collect();
        assert_eq!(labels, vec!["happy", "neutral", "happy"]);
    }

    #[test]
    fn test_emotion_history_is_bounded() {
        let (state, _clock) = state_with_clock();
        for i in 0..25 {
            state.update_emotion(format!("emotion-{i}"));
        }
        let history = state.snapshot().emotion_history;
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].label, "emotion-15");
    }

    #[test]
    fn test_short_presence_does_not_count_a_wake() {
        let (state, clock) = state_with_clock();
        state.observe_presence(true);
        clock.advance(Duration::from_millis(600));
        state.observe_presence(true);
        state.observe_presence(false);
        clock.advance(Duration::from_millis(200));
        state.observe_presence(true);
        clock.advance(Duration::from_millis(600));
        assert_eq!(state.observe_presence(true), None);
        assert_eq!(state.wake_count(), 0);
        assert_eq!(state.presence(), Presence::Out);
    }

    #[test]
    fn test_continuous_presence_counts_wakes() {
        let (state, clock) = state_with_clock();
        state.observe_presence(true);
        clock.advance(Duration::from_millis(1_000));
        assert_eq!(state.observe_presence(true), Some(Presence::In));
        assert_eq!(state.wake_count(), 1);

        assert_eq!(state.observe_presence(false), Some(Presence::Out));
        clock.advance(Duration::from_millis(300));
        state.observe_presence(true);
        clock.advance(Duration::from_millis(999));
        assert_eq!(state.observe_presence(true), None);
        clock.advance(Duration::from_millis(1));
        assert_eq!(state.observe_presence(true), Some(Presence::In));
        assert_eq!(state.wake_count(), 2);
    }

    #[test]
    fn test_snapshot_reports_last_presence_transition_time() {
        let (state, clock) = state_with_clock();
        state.observe_presence(true);
        assert_eq!(state.snapshot().presence_changed_at, None);

        clock.advance_secs(1.0);
        let arrived = clock.wall();
        assert_eq!(state.observe_presence(true), Some(Presence::In));
        clock.advance_secs(5.0);
        state.observe_presence(true);
        assert_eq!(state.snapshot().presence_changed_at, Some(arrived));

        let left = clock.wall();
        assert_eq!(state.observe_presence(false), Some(Presence::Out));
        clock.advance_secs(2.0);
        state.observe_presence(false);
        assert_eq!(state.snapshot().presence_changed_at, Some(left));

        state.begin_session();
        assert_eq!(state.snapshot().presence_changed_at, None);
    }

    #[test]
    fn test_disabled_wake_tracking_still_tracks_presence() {
        let (state, clock) = state_with_clock();
        state.set_feature_enabled(Feature::Wake, false);
        state.observe_presence(true);
        clock.advance_secs(1.5);
        assert_eq!(state.observe_presence(true), Some(Presence::In));
        assert_eq!(state.wake_count(), 0);
    }

    #[test]
    fn test_apply_routes_results() {
        let (state, clock) = state_with_clock();
        state.apply(&DetectorResult::Emotion {
            label: "calm".into(),
        });
        state.apply(&DetectorResult::Posture {
            label: RightLateral,
            landmarks: None,
            bed_landmarks: None,
            assessment: None,
        });
        clock.advance_secs(2.0);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.emotion, "calm");
        assert_eq!(snapshot.posture, RightLateral);
        assert_close(snapshot.statistics[&RightLateral], 2.0);
        assert_eq!(snapshot.presence, Presence::Out);
    }

    #[test]
    fn test_end_session_freezes_state() {
        let (state, clock) = state_with_clock();
        state.update_posture(LeftLateral);
        clock.advance_secs(3.0);
        state.end_session();
        clock.advance_secs(30.0);
        assert!(!state.update_posture(NormalSupine));
        state.end_session();

        let snapshot = state.snapshot();
        assert_close(snapshot.statistics[&LeftLateral], 3.0);
        assert_close(snapshot.elapsed_secs, 3.0);
        assert!(snapshot.session_ended.is_some());
    }

    #[test]
    fn test_feature_names_parse() {
        assert_eq!("posture".parse::<Feature>(), Ok(Feature::Posture));
        assert_eq!(" Wake ".parse::<Feature>(), Ok(Feature::Wake));
        assert_eq!(
            "sleep".parse::<Feature>(),
            Err(StateError::UnknownFeature("sleep".into()))
        );
    }

    #[test]
    fn test_snapshot_serialises_with_stable_names() {
        let (state, _clock) = state_with_clock();
        state.update_posture(HeadLeftSupine);
        let json = serde_json::to_value(state.snapshot()).expect("serialise");
        assert_eq!(json["posture"], "head-left-supine");
        assert_eq!(json["presence"], "OUT");
        assert_eq!(json["camera_status"], "stopped");
        assert!(json["statistics"]["left-lateral"].is_number());
        assert_eq!(json["features"]["wake"], true);
    }
}
