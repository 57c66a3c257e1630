//! Scripted camera and providers for running without hardware or models.
//!
//! Every frame carries its scene id in the first byte; the providers read it
//! back, so the whole chain from capture to state runs for real.

use anyhow::Result;
use pose_core::{Landmark, LandmarkId, LandmarkSet};
use sleep_monitor::Providers;
use video_ingest::{Frame, SyntheticBackend};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scene {
    Supine,
    Left,
    HeadLeft,
    Right,
    HeadRight,
    Away,
}

const SCRIPT: [Scene; 8] = [
    Scene::Supine,
    Scene::Left,
    Scene::Supine,
    Scene::HeadLeft,
    Scene::Away,
    Scene::Right,
    Scene::HeadRight,
    Scene::Supine,
];

impl Scene {
    fn from_byte(byte: u8) -> Option<Self> {
        SCRIPT.iter().copied().find(|scene| scene.byte() == byte)
    }

    fn byte(self) -> u8 {
        match self {
            Scene::Supine => 1,
            Scene::Left => 2,
            Scene::HeadLeft => 3,
            Scene::Right => 4,
            Scene::HeadRight => 5,
            Scene::Away => 6,
        }
    }

    fn landmarks(self) -> Result<Option<LandmarkSet>> {
        let (left_wrist, right_wrist, nose) = match self {
            Scene::Supine => ((0.3, 0.5), (0.7, 0.5), (0.5, 0.2)),
            Scene::Left => ((0.7, 0.5), (0.75, 0.45), (0.5, 0.2)),
            Scene::Right => ((0.3, 0.5), (0.25, 0.45), (0.5, 0.2)),
            Scene::HeadLeft => ((0.3, 0.5), (0.7, 0.5), (0.56, 0.2)),
            Scene::HeadRight => ((0.3, 0.5), (0.7, 0.5), (0.44, 0.2)),
            Scene::Away => return Ok(None),
        };
        let set = LandmarkSet::from_named([
            (LandmarkId::Nose, Landmark::at(nose.0, nose.1)),
            (LandmarkId::LeftShoulder, Landmark::at(0.4, 0.3)),
            (LandmarkId::RightShoulder, Landmark::at(0.6, 0.3)),
            (LandmarkId::LeftHip, Landmark::at(0.42, 0.7)),
            (LandmarkId::RightHip, Landmark::at(0.58, 0.7)),
            (LandmarkId::LeftWrist, Landmark::at(left_wrist.0, left_wrist.1)),
            (LandmarkId::RightWrist, Landmark::at(right_wrist.0, right_wrist.1)),
        ])?;
        Ok(Some(set))
    }

    fn emotion(self) -> Option<&'static str> {
        match self {
            Scene::Away => None,
            Scene::HeadLeft | Scene::HeadRight => Some("neutral"),
            _ => Some("calm"),
        }
    }
}

fn scene_of(frame: &Frame) -> Option<Scene> {
    frame.data.first().copied().and_then(Scene::from_byte)
}

/// Camera on device 0 cycling through [`SCRIPT`], one scene per
/// `frames_per_scene` frames.
pub fn backend(width: i32, height: i32, frames_per_scene: u64) -> SyntheticBackend {
    let len = (width.max(1) * height.max(1) * 3) as usize;
    let frames_per_scene = frames_per_scene.max(1);
    SyntheticBackend::new(vec![0], move |index| {
        let scene = SCRIPT[((index / frames_per_scene) % SCRIPT.len() as u64) as usize];
        let mut data = vec![24; len];
        data[0] = scene.byte();
        Ok(Frame::bgr(data, width.max(1), height.max(1)))
    })
}

pub fn providers() -> Providers {
    Providers {
        landmarks: Some(Box::new(|frame: &Frame| -> Result<Option<LandmarkSet>> {
            match scene_of(frame) {
                Some(scene) => scene.landmarks(),
                None => Ok(None),
            }
        })),
        emotion: Some(Box::new(|frame: &Frame| -> Result<Option<String>> {
            Ok(scene_of(frame).and_then(Scene::emotion).map(str::to_string))
        })),
    }
}

#[cfg(test)]
mod tests {
    use pose_core::{PostureLabel, classify};

    use super::*;

    #[test]
    fn test_scenes_classify_as_scripted() {
        let expected = [
            (Scene::Supine, PostureLabel::NormalSupine),
            (Scene::Left, PostureLabel::LeftLateral),
            (Scene::Right, PostureLabel::RightLateral),
            (Scene::HeadLeft, PostureLabel::HeadLeftSupine),
            (Scene::HeadRight, PostureLabel::HeadRightSupine),
            (Scene::Away, PostureLabel::Undetected),
        ];
        for (scene, label) in expected {
            let landmarks = scene.landmarks().expect("valid scene");
            assert_eq!(classify(landmarks.as_ref()), label, "{scene:?}");
            assert_eq!(Scene::from_byte(scene.byte()), Some(scene));
        }
    }

    #[test]
    fn test_backend_frames_carry_their_scene() {
        use video_ingest::{CameraBackend, CaptureDevice};

        let backend = backend(4, 4, 2);
        let mut device = backend.open(0).expect("device 0");
        let scenes: Vec<_> = (0..4)
            .map(|_| scene_of(&device.read().expect("frame")))
            .collect();
        assert_eq!(
            scenes,
            vec![Some(Scene::Supine), Some(Scene::Supine), Some(Scene::Left), Some(Scene::Left)]
        );
        assert!(backend.open(1).is_err());
    }
}
