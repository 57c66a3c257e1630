//! Majority-vote posture stabilisation.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use crate::posture::PostureLabel;

pub const DEFAULT_VOTE_WINDOW: usize = 5;
pub const DEFAULT_MIN_HOLD: Duration = Duration::from_secs(1);

/// Suppresses single-frame label flicker.
///
/// The reported label is the majority of the last few classifications and
/// may change at most once per `min_hold`. `Undetected` votes only win when
/// nothing else is in the window.
#[derive(Debug, Clone)]
pub struct PostureStabilizer {
    votes: VecDeque<PostureLabel>,
    capacity: usize,
    min_hold: Duration,
    stable: PostureLabel,
    last_switch: Option<Instant>,
}

impl PostureStabilizer {
    pub fn new(capacity: usize, min_hold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            votes: VecDeque::with_capacity(capacity),
            capacity,
            min_hold,
            stable: PostureLabel::Undetected,
            last_switch: None,
        }
    }

    /// Record a raw label observed at `now` and return the stable label.
    pub fn push(&mut self, label: PostureLabel, now: Instant) -> PostureLabel {
        while self.votes.len() >= self.capacity {
            self.votes.pop_front();
        }
        self.votes.push_back(label);

        let candidate = self.majority();
        if candidate != self.stable {
            let held_long_enough = self
                .last_switch
                .is_none_or(|at| now.saturating_duration_since(at) >= self.min_hold);
            if held_long_enough {
                self.stable = candidate;
                self.last_switch = Some(now);
            }
        }
        self.stable
    }

    pub fn current(&self) -> PostureLabel {
        self.stable
    }

    pub fn reset(&mut self) {
        self.votes.clear();
        self.stable = PostureLabel::Undetected;
        self.last_switch = None;
    }

    /// Most frequent detected label; ties go to the most recent vote.
    fn majority(&self) -> PostureLabel {
        let mut counts: HashMap<PostureLabel, usize> = HashMap::new();
        for label in self.votes.iter().filter(|l| l.is_tracked()) {
            *counts.entry(*label).or_default() += 1;
        }
        let Some(best) = counts.values().copied().max() else {
            return PostureLabel::Undetected;
        };
        self.votes
            .iter()
            .rev()
            .copied()
            .find(|label| counts.get(label) == Some(&best))
            .unwrap_or(PostureLabel::Undetected)
    }
}

impl Default for PostureStabilizer {
    fn default() -> Self {
        Self::new(DEFAULT_VOTE_WINDOW, DEFAULT_MIN_HOLD)
    }
}
