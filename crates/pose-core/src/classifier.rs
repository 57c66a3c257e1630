//! Geometric posture classification.
//!
//! Works on the image plane only. The spine axis runs from the shoulder
//! midpoint to the hip midpoint; the side of that axis on which the wrists
//! fall separates lateral from supine postures, and the nose offset refines
//! supine into head-turn variants.
//!
//! Sign convention: with `cross(a, b) = a.x * b.y - a.y * b.x` in image
//! coordinates, a positive cross product against the spine means left.
//!
//! An arm vector (wrist minus shoulder midpoint) shorter than
//! [`DEGENERATE_ARM_NORM`] carries no usable direction. When either arm, or
//! their average, is that short, a lateral posture is decided by the sign of
//! the left arm's cross product alone and no arm angle is reported.

use serde::Serialize;

use crate::{
    landmarks::{LandmarkId, LandmarkSet},
    posture::PostureLabel,
};

/// Arm vectors shorter than this are too short to trust for the angle
/// computation.
pub const DEGENERATE_ARM_NORM: f32 = 0.05;
/// Head rotation beyond this angle counts as a head turn.
pub const HEAD_TURN_THRESHOLD_DEG: f32 = 10.0;
const NORM_EPSILON: f32 = 1e-6;

/// Classification outcome with the angles that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PostureAssessment {
    pub label: PostureLabel,
    /// Angle between the averaged arm vector and the spine (lateral only).
    pub arm_angle_deg: Option<f32>,
    /// Head rotation away from the spine axis (supine only).
    pub head_angle_deg: Option<f32>,
}

impl PostureAssessment {
    fn undetected() -> Self {
        Self::label_only(PostureLabel::Undetected)
    }

    fn label_only(label: PostureLabel) -> Self {
        Self {
            label,
            arm_angle_deg: None,
            head_angle_deg: None,
        }
    }
}

/// Map a landmark set to a posture label. `None` yields `Undetected`.
pub fn classify(landmarks: Option<&LandmarkSet>) -> PostureLabel {
    assess(landmarks).label
}

/// Full classification including diagnostic angles.
pub fn assess(landmarks: Option<&LandmarkSet>) -> PostureAssessment {
    let Some(set) = landmarks else {
        return PostureAssessment::undetected();
    };
    let point = |id: LandmarkId| {
        let lm = set.get(id);
        Vec2::new(lm.x, lm.y)
    };

    let shoulder_mid = point(LandmarkId::LeftShoulder).midpoint(point(LandmarkId::RightShoulder));
    let hip_mid = point(LandmarkId::LeftHip).midpoint(point(LandmarkId::RightHip));
    let spine = hip_mid - shoulder_mid;
    if !spine.is_finite() || spine.norm() < NORM_EPSILON {
        return PostureAssessment::undetected();
    }

    let left_arm = point(LandmarkId::LeftWrist) - shoulder_mid;
    let right_arm = point(LandmarkId::RightWrist) - shoulder_mid;
    let left_cross = left_arm.cross(spine);
    let right_cross = right_arm.cross(spine);

    let same_side =
        (left_cross > 0.0 && right_cross > 0.0) || (left_cross < 0.0 && right_cross < 0.0);
    if same_side {
        let avg_arm = (left_arm + right_arm).scale(0.5);
        let degenerate = [left_arm, right_arm, avg_arm]
            .iter()
            .any(|arm| arm.norm() < DEGENERATE_ARM_NORM);
        if degenerate {
            return PostureAssessment::label_only(lateral_side(left_cross));
        }
        return PostureAssessment {
            label: lateral_side(avg_arm.cross(spine)),
            arm_angle_deg: Some(angle_between(avg_arm, spine)),
            head_angle_deg: None,
        };
    }

    let nose = point(LandmarkId::Nose) - shoulder_mid;
    let head_angle = angle_between(nose, spine.scale(-1.0));
    let label = if head_angle > HEAD_TURN_THRESHOLD_DEG {
        if nose.cross(spine) > 0.0 {
            PostureLabel::HeadLeftSupine
        } else {
            PostureLabel::HeadRightSupine
        }
    } else {
        PostureLabel::NormalSupine
    };

    PostureAssessment {
        label,
        arm_angle_deg: None,
        head_angle_deg: Some(head_angle),
    }
}

fn lateral_side(cross: f32) -> PostureLabel {
    if cross > 0.0 {
        PostureLabel::LeftLateral
    } else {
        PostureLabel::RightLateral
    }
}

fn angle_between(a: Vec2, b: Vec2) -> f32 {
    let denom = (a.norm() * b.norm()).max(NORM_EPSILON);
    (a.dot(b) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Vec2 {
    x: f32,
    y: f32,
}

impl Vec2 {
    fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn midpoint(self, other: Self) -> Self {
        (self + other).scale(0.5)
    }

    fn scale(self, k: f32) -> Self {
        Self::new(self.x * k, self.y * k)
    }

    fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    fn cross(self, other: Self) -> f32 {
        self.x * other.y - self.y * other.x
    }

    fn norm(self) -> f32 {
        self.dot(self).sqrt()
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;

    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;

    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::Landmark;

    /// Sleeper seen from above, head at the top of the image.
    fn body(left_wrist: (f32, f32), right_wrist: (f32, f32), nose: (f32, f32)) -> LandmarkSet {
        LandmarkSet::from_named([
            (LandmarkId::Nose, Landmark::at(nose.0, nose.1)),
            (LandmarkId::LeftShoulder, Landmark::at(0.4, 0.3)),
            (LandmarkId::RightShoulder, Landmark::at(0.6, 0.3)),
            (LandmarkId::LeftHip, Landmark::at(0.42, 0.7)),
            (LandmarkId::RightHip, Landmark::at(0.58, 0.7)),
            (LandmarkId::LeftWrist, Landmark::at(left_wrist.0, left_wrist.1)),
            (LandmarkId::RightWrist, Landmark::at(right_wrist.0, right_wrist.1)),
        ])
        .expect("complete landmark set")
    }

    const CENTRED_NOSE: (f32, f32) = (0.5, 0.2);

    #[test]
    fn test_classification_is_deterministic() {
        let set = body((0.7, 0.5), (0.75, 0.45), CENTRED_NOSE);
        let first = assess(Some(&set));
        for _ in 0..10 {
            assert_eq!(assess(Some(&set.clone())), first);
        }
    }

    #[test]
    fn test_positive_cross_is_left_lateral() {
        let set = body((0.7, 0.5), (0.75, 0.45), CENTRED_NOSE);
        let assessment = assess(Some(&set));
        assert_eq!(assessment.label, PostureLabel::LeftLateral);
        assert!(assessment.arm_angle_deg.is_some());
    }

    #[test]
    fn test_wrists_across_the_spine_flip_lateral_side() {
        let left = body((0.7, 0.5), (0.75, 0.45), CENTRED_NOSE);
        let right = body((0.3, 0.5), (0.25, 0.45), CENTRED_NOSE);
        assert_eq!(classify(Some(&left)), PostureLabel::LeftLateral);
        assert_eq!(classify(Some(&right)), PostureLabel::RightLateral);
    }

    #[test]
    fn test_mirrored_body_flips_lateral_label() {
        let set = body((0.7, 0.5), (0.75, 0.45), CENTRED_NOSE);
        assert_eq!(classify(Some(&set)), PostureLabel::LeftLateral);
        assert_eq!(classify(Some(&set.mirrored())), PostureLabel::RightLateral);
        assert_eq!(classify(Some(&set.mirrored().mirrored())), PostureLabel::LeftLateral);
    }

    #[test]
    fn test_degenerate_arms_use_cross_sign_only() {
        let set = body((0.52, 0.31), (0.53, 0.305), CENTRED_NOSE);
        let assessment = assess(Some(&set));
        assert_eq!(assessment.label, PostureLabel::LeftLateral);
        assert_eq!(assessment.arm_angle_deg, None);

        let mirrored = assess(Some(&set.mirrored()));
        assert_eq!(mirrored.label, PostureLabel::RightLateral);
    }

    #[test]
    fn test_one_short_arm_is_degenerate() {
        let set = body((0.52, 0.31), (0.8, 0.6), CENTRED_NOSE);
        let assessment = assess(Some(&set));
        assert_eq!(assessment.label, PostureLabel::LeftLateral);
        assert_eq!(assessment.arm_angle_deg, None);

        let mirrored = assess(Some(&set.mirrored()));
        assert_eq!(mirrored.label, PostureLabel::RightLateral);
        assert_eq!(mirrored.arm_angle_deg, None);
    }

    #[test]
    fn test_wrists_on_both_sides_is_supine() {
        let set = body((0.3, 0.5), (0.7, 0.5), CENTRED_NOSE);
        let assessment = assess(Some(&set));
        assert_eq!(assessment.label, PostureLabel::NormalSupine);
        assert!(assessment.head_angle_deg.is_some_and(|a| a < 1.0));
    }

    #[test]
    fn test_head_turn_direction() {
        let turned = body((0.3, 0.5), (0.7, 0.5), (0.56, 0.2));
        assert_eq!(classify(Some(&turned)), PostureLabel::HeadLeftSupine);
        assert_eq!(classify(Some(&turned.mirrored())), PostureLabel::HeadRightSupine);

        let slight = body((0.3, 0.5), (0.7, 0.5), (0.51, 0.2));
        assert_eq!(classify(Some(&slight)), PostureLabel::NormalSupine);
    }

    #[test]
    fn test_missing_or_collapsed_landmarks_are_undetected() {
        assert_eq!(classify(None), PostureLabel::Undetected);

        let collapsed = LandmarkSet::from_named(
            crate::landmarks::REQUIRED_LANDMARKS
                .iter()
                .map(|&id| (id, Landmark::at(0.5, 0.5))),
        )
        .expect("complete");
        assert_eq!(classify(Some(&collapsed)), PostureLabel::Undetected);
    }

    #[test]
    fn test_nose_on_shoulder_midpoint_does_not_fail() {
        let set = body((0.3, 0.5), (0.7, 0.5), (0.5, 0.3));
        let assessment = assess(Some(&set));
        assert!(assessment.head_angle_deg.is_some_and(f32::is_finite));
    }
}
