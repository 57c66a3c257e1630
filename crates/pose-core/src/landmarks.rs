//! Pose landmark model.
//!
//! Indices follow the 33-point MediaPipe body topology so provider output can
//! be adopted without remapping.

use serde::Serialize;
use thiserror::Error;

pub const LANDMARK_COUNT: usize = 33;

/// Body landmark identifiers (MediaPipe pose indices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LandmarkId {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl LandmarkId {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Landmarks the posture classifier cannot work without.
pub const REQUIRED_LANDMARKS: [LandmarkId; 7] = [
    LandmarkId::Nose,
    LandmarkId::LeftShoulder,
    LandmarkId::RightShoulder,
    LandmarkId::LeftWrist,
    LandmarkId::RightWrist,
    LandmarkId::LeftHip,
    LandmarkId::RightHip,
];

/// A single point in normalised image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Provider confidence in `[0, 1]`.
    pub visibility: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        Self { x, y, z, visibility }
    }

    /// Fully visible point on the image plane.
    pub fn at(x: f32, y: f32) -> Self {
        Self::new(x, y, 0.0, 1.0)
    }

    pub fn is_visible(&self, threshold: f32) -> bool {
        self.visibility >= threshold
    }

    fn is_finite(&self) -> bool {
        [self.x, self.y, self.z, self.visibility]
            .iter()
            .all(|v| v.is_finite())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LandmarkError {
    #[error("expected {LANDMARK_COUNT} landmarks, got {0}")]
    WrongCount(usize),
    #[error("landmark set is missing {missing:?}")]
    Incomplete { missing: Vec<LandmarkId> },
    #[error("landmark {index} has non-finite coordinates")]
    NonFinite { index: usize },
}

/// A complete set of body landmarks for one subject.
///
/// Always holds [`LANDMARK_COUNT`] finite points; partial provider output is
/// rejected at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandmarkSet {
    points: Vec<Landmark>,
}

impl LandmarkSet {
    /// Adopt a full provider point list.
    pub fn from_points(points: Vec<Landmark>) -> Result<Self, LandmarkError> {
        if points.len() != LANDMARK_COUNT {
            return Err(LandmarkError::WrongCount(points.len()));
        }
        if let Some(index) = points.iter().position(|p| !p.is_finite()) {
            return Err(LandmarkError::NonFinite { index });
        }
        Ok(Self { points })
    }

    /// Build a set from named points. Every id in [`REQUIRED_LANDMARKS`] must
    /// be present; unnamed slots are left invisible at the origin.
    pub fn from_named<I>(named: I) -> Result<Self, LandmarkError>
    where
        I: IntoIterator<Item = (LandmarkId, Landmark)>,
    {
        let mut points = vec![Landmark::default(); LANDMARK_COUNT];
        let mut seen = [false; LANDMARK_COUNT];
        for (id, point) in named {
            points[id.index()] = point;
            seen[id.index()] = true;
        }
        let missing: Vec<LandmarkId> = REQUIRED_LANDMARKS
            .iter()
            .copied()
            .filter(|id| !seen[id.index()])
            .collect();
        if !missing.is_empty() {
            return Err(LandmarkError::Incomplete { missing });
        }
        Self::from_points(points)
    }

    pub fn get(&self, id: LandmarkId) -> Landmark {
        self.points[id.index()]
    }

    pub fn points(&self) -> &[Landmark] {
        &self.points
    }

    /// Mirror horizontally (x → 1 - x) and swap left/right identifiers.
    pub fn mirrored(&self) -> Self {
        let mut points = self.points.clone();
        for (left, right) in MIRROR_PAIRS {
            points.swap(left as usize, right as usize);
        }
        for point in &mut points {
            point.x = 1.0 - point.x;
        }
        Self { points }
    }

    pub(crate) fn from_points_unchecked(points: Vec<Landmark>) -> Self {
        debug_assert_eq!(points.len(), LANDMARK_COUNT);
        Self { points }
    }
}

const MIRROR_PAIRS: [(LandmarkId, LandmarkId); 16] = [
    (LandmarkId::LeftEyeInner, LandmarkId::RightEyeInner),
    (LandmarkId::LeftEye, LandmarkId::RightEye),
    (LandmarkId::LeftEyeOuter, LandmarkId::RightEyeOuter),
    (LandmarkId::LeftEar, LandmarkId::RightEar),
    (LandmarkId::MouthLeft, LandmarkId::MouthRight),
    (LandmarkId::LeftShoulder, LandmarkId::RightShoulder),
    (LandmarkId::LeftElbow, LandmarkId::RightElbow),
    (LandmarkId::LeftWrist, LandmarkId::RightWrist),
    (LandmarkId::LeftPinky, LandmarkId::RightPinky),
    (LandmarkId::LeftIndex, LandmarkId::RightIndex),
    (LandmarkId::LeftThumb, LandmarkId::RightThumb),
    (LandmarkId::LeftHip, LandmarkId::RightHip),
    (LandmarkId::LeftKnee, LandmarkId::RightKnee),
    (LandmarkId::LeftAnkle, LandmarkId::RightAnkle),
    (LandmarkId::LeftHeel, LandmarkId::RightHeel),
    (LandmarkId::LeftFootIndex, LandmarkId::RightFootIndex),
];

#[cfg(test)]
mod tests {
    use super::*;

    fn required_points() -> Vec<(LandmarkId, Landmark)> {
        REQUIRED_LANDMARKS
            .iter()
            .map(|&id| (id, Landmark::at(0.5, 0.5)))
            .collect()
    }

    #[test]
    fn test_from_named_requires_classifier_landmarks() {
        let mut points = required_points();
        points.retain(|(id, _)| *id != LandmarkId::LeftWrist);
        match LandmarkSet::from_named(points) {
            Err(LandmarkError::Incomplete { missing }) => {
                assert_eq!(missing, vec![LandmarkId::LeftWrist]);
            }
            other => panic!("expected incomplete set, got {other:?}"),
        }
    }

    #[test]
    fn test_from_points_rejects_wrong_count_and_nan() {
        assert_eq!(
            LandmarkSet::from_points(vec![Landmark::default(); 5]),
            Err(LandmarkError::WrongCount(5))
        );
        let mut points = vec![Landmark::default(); LANDMARK_COUNT];
        points[12].y = f32::NAN;
        assert_eq!(
            LandmarkSet::from_points(points),
            Err(LandmarkError::NonFinite { index: 12 })
        );
    }

    #[test]
    fn test_mirrored_swaps_sides() {
        let mut points = required_points();
        points.push((LandmarkId::LeftWrist, Landmark::at(0.2, 0.4)));
        points.push((LandmarkId::RightWrist, Landmark::at(0.9, 0.4)));
        let set = LandmarkSet::from_named(points).expect("complete");
        let mirrored = set.mirrored();
        let left = mirrored.get(LandmarkId::LeftWrist);
        let right = mirrored.get(LandmarkId::RightWrist);
        assert!((left.x - 0.1).abs() < 1e-6);
        assert!((right.x - 0.8).abs() < 1e-6);
    }
}
