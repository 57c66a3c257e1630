//! Bed-relative coordinates.
//!
//! Four reference points mark the bed in normalised image coordinates: the
//! middle of the head end, the middle of the foot end, and the middle of each
//! long side. [`BedFrame`] maps landmarks into a frame whose origin is the
//! bed centre (midway between head and foot) and whose unit is the longer of
//! the bed's two extents, so a subject lying anywhere on the bed lands in
//! roughly `[-0.5, 0.5]` on both axes regardless of camera distance.

use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::landmarks::{Landmark, LandmarkSet};

/// Extents below this are treated as an unmarked bed.
const MIN_BED_EXTENT: f32 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum BedFrameError {
    #[error("bed reference point {name} has non-finite coordinates")]
    NonFinite { name: &'static str },
    #[error("bed reference points are degenerate (length {length}, width {width})")]
    Degenerate { length: f32, width: f32 },
    #[error("expected 8 or 12 comma-separated numbers, got {0}")]
    WrongCount(usize),
    #[error("invalid number {0:?} in bed reference")]
    InvalidNumber(String),
}

/// Head, foot, left and right reference points as `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BedReference {
    pub head: [f32; 3],
    pub foot: [f32; 3],
    pub left: [f32; 3],
    pub right: [f32; 3],
}

impl BedReference {
    /// Reference points on the image plane (`z = 0`).
    pub fn planar(head: [f32; 2], foot: [f32; 2], left: [f32; 2], right: [f32; 2]) -> Self {
        let lift = |[x, y]: [f32; 2]| [x, y, 0.0];
        Self {
            head: lift(head),
            foot: lift(foot),
            left: lift(left),
            right: lift(right),
        }
    }

    fn named(&self) -> [(&'static str, [f32; 3]); 4] {
        [
            ("head", self.head),
            ("foot", self.foot),
            ("left", self.left),
            ("right", self.right),
        ]
    }
}

/// Parses `hx,hy,fx,fy,lx,ly,rx,ry` or the same with a `z` after each `y`.
impl FromStr for BedReference {
    type Err = BedFrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| {
                let part = part.trim();
                part.parse::<f32>()
                    .map_err(|_| BedFrameError::InvalidNumber(part.to_string()))
            })
            .collect::<Result<Vec<f32>, _>>()?;
        let stride = match values.len() {
            8 => 2,
            12 => 3,
            other => return Err(BedFrameError::WrongCount(other)),
        };
        let point = |index: usize| {
            let chunk = &values[index * stride..(index + 1) * stride];
            [chunk[0], chunk[1], if stride == 3 { chunk[2] } else { 0.0 }]
        };
        Ok(Self {
            head: point(0),
            foot: point(1),
            left: point(2),
            right: point(3),
        })
    }
}

/// Affine map from image coordinates into bed coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BedFrame {
    center: [f32; 3],
    scale: f32,
}

impl BedFrame {
    pub fn from_reference(reference: &BedReference) -> Result<Self, BedFrameError> {
        for (name, point) in reference.named() {
            if !point.iter().all(|v| v.is_finite()) {
                return Err(BedFrameError::NonFinite { name });
            }
        }
        let length = distance(reference.head, reference.foot);
        let width = distance(reference.left, reference.right);
        let extent = length.max(width);
        if extent < MIN_BED_EXTENT {
            return Err(BedFrameError::Degenerate { length, width });
        }
        let center = [0, 1, 2].map(|axis| (reference.head[axis] + reference.foot[axis]) * 0.5);
        Ok(Self {
            center,
            scale: 1.0 / extent,
        })
    }

    pub fn center(&self) -> [f32; 3] {
        self.center
    }

    /// Bed-coordinate units per image unit.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Visibility is carried through unchanged.
    pub fn transform_point(&self, point: Landmark) -> Landmark {
        Landmark::new(
            (point.x - self.center[0]) * self.scale,
            (point.y - self.center[1]) * self.scale,
            (point.z - self.center[2]) * self.scale,
            point.visibility,
        )
    }

    pub fn transform(&self, landmarks: &LandmarkSet) -> LandmarkSet {
        let points = landmarks
            .points()
            .iter()
            .map(|&point| self.transform_point(point))
            .collect();
        LandmarkSet::from_points_unchecked(points)
    }
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    a.iter()
        .zip(&b)
        .map(|(a, b)| (b - a) * (b - a))
        .sum::<f32>()
        .sqrt()
}
