//! Exponentially weighted landmark smoothing over a short sliding window.

use std::collections::VecDeque;

use crate::landmarks::{Landmark, LandmarkSet};

pub const DEFAULT_SMOOTHING_WINDOW: usize = 8;
pub const DEFAULT_SMOOTHING_FACTOR: f32 = 0.7;

/// Sliding-window smoother for one landmark stream.
///
/// Weights are `exp(linspace(-k, 0, n))` normalised to one, so the newest set
/// dominates while older sets damp jitter. Each stream needs its own smoother.
#[derive(Debug, Clone)]
pub struct LandmarkSmoother {
    window: VecDeque<LandmarkSet>,
    capacity: usize,
    factor: f32,
}

impl LandmarkSmoother {
    pub fn new(capacity: usize, factor: f32) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            factor,
        }
    }

    /// Push a raw set and return the weighted average of the window.
    pub fn smooth(&mut self, landmarks: &LandmarkSet) -> LandmarkSet {
        while self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(landmarks.clone());
        if self.window.len() == 1 {
            return landmarks.clone();
        }

        let weights = self.weights();
        let total: f64 = weights.iter().sum();
        let count = landmarks.points().len();
        let mut points = Vec::with_capacity(count);
        for index in 0..count {
            let mut acc = [0.0f64; 4];
            for (set, weight) in self.window.iter().zip(&weights) {
                let p = set.points()[index];
                acc[0] += weight * p.x as f64;
                acc[1] += weight * p.y as f64;
                acc[2] += weight * p.z as f64;
                acc[3] += weight * p.visibility as f64;
            }
            points.push(Landmark::new(
                (acc[0] / total) as f32,
                (acc[1] / total) as f32,
                (acc[2] / total) as f32,
                (acc[3] / total) as f32,
            ));
        }
        LandmarkSet::from_points_unchecked(points)
    }

    /// Forget the window, e.g. when the subject leaves the frame.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Oldest first, matching the window order.
    fn weights(&self) -> Vec<f64> {
        let n = self.window.len();
        let k = self.factor as f64;
        (0..n)
            .map(|i| {
                let t = if n == 1 {
                    -k
                } else {
                    -k + k * i as f64 / (n - 1) as f64
                };
                t.exp()
            })
            .collect()
    }
}

impl Default for LandmarkSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_SMOOTHING_WINDOW, DEFAULT_SMOOTHING_FACTOR)
    }
}
