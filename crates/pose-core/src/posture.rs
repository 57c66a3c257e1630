use std::fmt;

use serde::{Deserialize, Serialize};

/// Sleeping posture classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostureLabel {
    NormalSupine,
    LeftLateral,
    RightLateral,
    HeadLeftSupine,
    HeadRightSupine,
    Undetected,
}

impl PostureLabel {
    /// Labels that accumulate time statistics (everything but `Undetected`).
    pub const TRACKED: [PostureLabel; 5] = [
        PostureLabel::NormalSupine,
        PostureLabel::LeftLateral,
        PostureLabel::RightLateral,
        PostureLabel::HeadLeftSupine,
        PostureLabel::HeadRightSupine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PostureLabel::NormalSupine => "normal-supine",
            PostureLabel::LeftLateral => "left-lateral",
            PostureLabel::RightLateral => "right-lateral",
            PostureLabel::HeadLeftSupine => "head-left-supine",
            PostureLabel::HeadRightSupine => "head-right-supine",
            PostureLabel::Undetected => "undetected",
        }
    }

    pub fn is_tracked(self) -> bool {
        self != PostureLabel::Undetected
    }

    pub fn is_lateral(self) -> bool {
        matches!(self, PostureLabel::LeftLateral | PostureLabel::RightLateral)
    }

    /// Short explanation and advice shown next to the current posture.
    pub fn guidance(self) -> PostureGuidance {
        match self {
            PostureLabel::NormalSupine => PostureGuidance {
                description: "Lying on the back with the head centred.",
                suggestion: "Keep the neck supported; a low pillow suits this position.",
            },
            PostureLabel::LeftLateral => PostureGuidance {
                description: "Lying on the left side.",
                suggestion: "Good for digestion; a pillow between the knees keeps the spine level.",
            },
            PostureLabel::RightLateral => PostureGuidance {
                description: "Lying on the right side.",
                suggestion: "Keep the shoulder off the arm to avoid numbness.",
            },
            PostureLabel::HeadLeftSupine => PostureGuidance {
                description: "Lying on the back with the head turned left.",
                suggestion: "Prolonged rotation strains the neck; try recentring the head.",
            },
            PostureLabel::HeadRightSupine => PostureGuidance {
                description: "Lying on the back with the head turned right.",
                suggestion: "Prolonged rotation strains the neck; try recentring the head.",
            },
            PostureLabel::Undetected => PostureGuidance {
                description: "No sleeper visible.",
                suggestion: "Check that the camera covers the whole bed.",
            },
        }
    }
}

impl fmt::Display for PostureLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PostureGuidance {
    pub description: &'static str,
    pub suggestion: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names_match_display() {
        for label in PostureLabel::TRACKED {
            let json = serde_json::to_string(&label).expect("serialize");
            assert_eq!(json, format!("\"{label}\""));
        }
        let parsed: PostureLabel = serde_json::from_str("\"head-left-supine\"").expect("parse");
        assert_eq!(parsed, PostureLabel::HeadLeftSupine);
    }

    #[test]
    fn test_undetected_is_not_tracked() {
        assert!(!PostureLabel::TRACKED.contains(&PostureLabel::Undetected));
        assert!(!PostureLabel::Undetected.is_tracked());
        assert!(PostureLabel::LeftLateral.is_lateral());
    }
}
