//! Liveness of the capture and dispatch loops.
//!
//! Each loop beats a [`Heartbeat`]; a component whose heartbeat is older than
//! the threshold (or never beat) is reported stale, which degrades the
//! session's camera status to not ready.

use std::{sync::Arc, time::Duration};

use video_ingest::Heartbeat;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HealthComponent {
    Capture,
    Dispatch,
}

impl HealthComponent {
    pub fn label(self) -> &'static str {
        match self {
            HealthComponent::Capture => "capture",
            HealthComponent::Dispatch => "dispatch",
        }
    }
}

pub struct PipelineHealth {
    capture: Arc<Heartbeat>,
    dispatch: Arc<Heartbeat>,
}

impl PipelineHealth {
    pub fn new(capture: Arc<Heartbeat>, dispatch: Arc<Heartbeat>) -> Self {
        Self { capture, dispatch }
    }

    /// First component without a heartbeat inside `threshold`.
    pub fn stale_component(&self, threshold: Duration) -> Option<HealthComponent> {
        let stale = |beat: &Heartbeat| beat.age().is_none_or(|age| age > threshold);
        if stale(&self.capture) {
            return Some(HealthComponent::Capture);
        }
        if stale(&self.dispatch) {
            return Some(HealthComponent::Dispatch);
        }
        None
    }
}
