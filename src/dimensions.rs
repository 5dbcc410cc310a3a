//! The canonical critique dimensions.
//!
//! Every profile, prompt and result in a deployment uses this one fixed set.
//! Older corpora scored on fewer axes are imported as-is: a missing dimension
//! just has no score.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Composition,
    Lighting,
    FocusSharpness,
    ColorHarmony,
    SubjectImpact,
    DepthPerspective,
    VisualBalance,
    EmotionalImpact,
}

impl Dimension {
    pub const ALL: [Dimension; 8] = [
        Dimension::Composition,
        Dimension::Lighting,
        Dimension::FocusSharpness,
        Dimension::ColorHarmony,
        Dimension::SubjectImpact,
        Dimension::DepthPerspective,
        Dimension::VisualBalance,
        Dimension::EmotionalImpact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Composition => "composition",
            Dimension::Lighting => "lighting",
            Dimension::FocusSharpness => "focus_sharpness",
            Dimension::ColorHarmony => "color_harmony",
            Dimension::SubjectImpact => "subject_impact",
            Dimension::DepthPerspective => "depth_perspective",
            Dimension::VisualBalance => "visual_balance",
            Dimension::EmotionalImpact => "emotional_impact",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Dimension::Composition => "Composition",
            Dimension::Lighting => "Lighting",
            Dimension::FocusSharpness => "Focus & Sharpness",
            Dimension::ColorHarmony => "Color Harmony",
            Dimension::SubjectImpact => "Subject Impact",
            Dimension::DepthPerspective => "Depth & Perspective",
            Dimension::VisualBalance => "Visual Balance",
            Dimension::EmotionalImpact => "Emotional Impact",
        }
    }

    /// Lenient lookup: accepts keys, display names and common spellings
    /// ("Focus and Sharpness", "color-harmony", "EMOTIONAL IMPACT").
    pub fn parse(s: &str) -> Option<Self> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .replace(" and ", "_")
            .replace('&', "_")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let key: String = normalized
            .split('_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");

        Dimension::ALL.into_iter().find(|d| d.as_str() == key)
    }

    /// Position in the canonical order, used to break ties deterministically.
    pub fn index(&self) -> usize {
        Dimension::ALL
            .iter()
            .position(|d| d == self)
            .unwrap_or(Dimension::ALL.len())
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_keys_and_display_names() {
        for dim in Dimension::ALL {
            assert_eq!(Dimension::parse(dim.as_str()), Some(dim));
            assert_eq!(Dimension::parse(dim.display_name()), Some(dim));
        }
    }

    #[test]
    fn test_parse_lenient_spellings() {
        assert_eq!(Dimension::parse("Focus and Sharpness"), Some(Dimension::FocusSharpness));
        assert_eq!(Dimension::parse("color-harmony"), Some(Dimension::ColorHarmony));
        assert_eq!(Dimension::parse("  EMOTIONAL IMPACT "), Some(Dimension::EmotionalImpact));
        assert_eq!(Dimension::parse("depth & perspective"), Some(Dimension::DepthPerspective));
        assert_eq!(Dimension::parse("technical_quality"), None);
        assert_eq!(Dimension::parse(""), None);
    }

    #[test]
    fn test_index_follows_canonical_order() {
        assert_eq!(Dimension::Composition.index(), 0);
        assert_eq!(Dimension::EmotionalImpact.index(), 7);
    }
}
