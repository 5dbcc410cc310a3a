//! Citation selection.
//!
//! Given the user's scores and ranked candidates, decide which weak
//! dimensions get an image and/or a quote. The rules:
//!
//! * a dimension is weak when the user's score is at or below `weak_threshold`;
//! * an image is eligible for a dimension only if its own score there is at
//!   least `high_bar`; a passage only if it is tagged with the dimension;
//! * one image and one quote per dimension at most;
//! * no profile or passage id is used twice in one response;
//! * no theme (technique or passage theme) is used twice in one response,
//!   across images and quotes alike;
//! * global caps on image and quote counts, filled weakest dimension first.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use crate::config::RetrievalConfig;
use crate::dimensions::Dimension;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CitationPolicy {
    pub weak_threshold: f32,
    pub high_bar: f32,
    pub max_images: usize,
    pub max_quotes: usize,
}

impl Default for CitationPolicy {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for CitationPolicy {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            weak_threshold: config.weak_threshold,
            high_bar: config.high_bar,
            max_images: config.max_image_citations,
            max_quotes: config.max_quote_citations,
        }
    }
}

/// A named technique shown by a reference image.
#[derive(Debug, Clone, PartialEq)]
pub struct ThemeTag {
    /// `None` when the technique does not target one dimension.
    pub dimension: Option<Dimension>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CandidateProfile {
    pub profile_id: i64,
    pub scores: BTreeMap<Dimension, f32>,
    /// Strongest first.
    pub themes: Vec<ThemeTag>,
    pub distance: f32,
}

impl CandidateProfile {
    /// The technique this image would be cited for under `dimension`.
    pub fn theme_for(&self, dimension: Dimension) -> Option<&str> {
        self.themes
            .iter()
            .find(|t| t.dimension.is_none() || t.dimension == Some(dimension))
            .map(|t| t.name.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CandidatePassage {
    pub passage_id: String,
    pub tags: Vec<Dimension>,
    pub theme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CitationSelection {
    pub dimension: Dimension,
    pub profile_id: Option<i64>,
    pub passage_id: Option<String>,
}

fn theme_key(theme: Option<&str>) -> Option<String> {
    theme
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
}

#[derive(Default)]
struct Ledger {
    profiles: HashSet<i64>,
    passages: HashSet<String>,
    themes: HashSet<String>,
}

impl Ledger {
    fn theme_free(&self, key: &Option<String>) -> bool {
        key.as_ref().map_or(true, |k| !self.themes.contains(k))
    }

    fn claim_theme(&mut self, key: Option<String>) {
        if let Some(k) = key {
            self.themes.insert(k);
        }
    }
}

impl CitationPolicy {
    pub fn is_weak(&self, score: f32) -> bool {
        score <= self.weak_threshold
    }

    pub fn is_exemplary(&self, score: f32) -> bool {
        score >= self.high_bar
    }

    /// Weak dimensions, weakest first; ties keep canonical order.
    pub fn weak_dimensions(&self, user_scores: &BTreeMap<Dimension, f32>) -> Vec<Dimension> {
        let mut weak: Vec<(Dimension, f32)> = user_scores
            .iter()
            .filter(|(_, s)| self.is_weak(**s))
            .map(|(d, s)| (*d, *s))
            .collect();
        weak.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.index().cmp(&b.0.index()))
        });
        weak.into_iter().map(|(d, _)| d).collect()
    }

    /// Pick citations. `profiles` must be in similarity order and `passages`
    /// in relevance order; earlier candidates win.
    pub fn select(
        &self,
        user_scores: &BTreeMap<Dimension, f32>,
        profiles: &[CandidateProfile],
        passages: &[CandidatePassage],
    ) -> Vec<CitationSelection> {
        let mut ledger = Ledger::default();
        let mut images = 0;
        let mut quotes = 0;
        let mut selections = Vec::new();

        for dimension in self.weak_dimensions(user_scores) {
            if images >= self.max_images && quotes >= self.max_quotes {
                break;
            }

            let mut profile_id = None;
            if images < self.max_images {
                for candidate in profiles {
                    if ledger.profiles.contains(&candidate.profile_id) {
                        continue;
                    }
                    let Some(score) = candidate.scores.get(&dimension) else {
                        continue;
                    };
                    if !self.is_exemplary(*score) {
                        continue;
                    }
                    let key = theme_key(candidate.theme_for(dimension));
                    if !ledger.theme_free(&key) {
                        continue;
                    }
                    ledger.profiles.insert(candidate.profile_id);
                    ledger.claim_theme(key);
                    profile_id = Some(candidate.profile_id);
                    images += 1;
                    break;
                }
            }

            let mut passage_id = None;
            if quotes < self.max_quotes {
                for candidate in passages {
                    if !candidate.tags.contains(&dimension)
                        || ledger.passages.contains(&candidate.passage_id)
                    {
                        continue;
                    }
                    let key = theme_key(candidate.theme.as_deref());
                    if !ledger.theme_free(&key) {
                        continue;
                    }
                    ledger.passages.insert(candidate.passage_id.clone());
                    ledger.claim_theme(key);
                    passage_id = Some(candidate.passage_id.clone());
                    quotes += 1;
                    break;
                }
            }

            if profile_id.is_some() || passage_id.is_some() {
                selections.push(CitationSelection {
                    dimension,
                    profile_id,
                    passage_id,
                });
            }
        }

        selections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Dimension::*;

    fn user(scores: &[(Dimension, f32)]) -> BTreeMap<Dimension, f32> {
        Dimension::ALL
            .iter()
            .map(|d| {
                let s = scores.iter().find(|(x, _)| x == d).map(|(_, s)| *s).unwrap_or(8.5);
                (*d, s)
            })
            .collect()
    }

    fn profile(id: i64, scores: &[(Dimension, f32)]) -> CandidateProfile {
        CandidateProfile {
            profile_id: id,
            scores: scores.iter().copied().collect(),
            themes: Vec::new(),
            distance: id as f32 / 100.0,
        }
    }

    fn themed(mut p: CandidateProfile, dimension: Option<Dimension>, name: &str) -> CandidateProfile {
        p.themes.push(ThemeTag {
            dimension,
            name: name.to_string(),
        });
        p
    }

    fn passage(id: &str, tags: &[Dimension], theme: Option<&str>) -> CandidatePassage {
        CandidatePassage {
            passage_id: id.to_string(),
            tags: tags.to_vec(),
            theme: theme.map(str::to_string),
        }
    }

    #[test]
    fn test_two_perfect_references_yield_exactly_one_citation() {
        let policy = CitationPolicy::default();
        let scores = user(&[(Composition, 5.0)]);
        let profiles = vec![profile(1, &[(Composition, 10.0)]), profile(2, &[(Composition, 10.0)])];

        let picks = policy.select(&scores, &profiles, &[]);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].dimension, Composition);
        assert!(matches!(picks[0].profile_id, Some(1) | Some(2)));
        assert_eq!(picks[0].passage_id, None);
    }

    #[test]
    fn test_strong_user_dimensions_are_not_cited() {
        let policy = CitationPolicy::default();
        let scores = user(&[(Lighting, 6.1)]);
        let profiles = vec![profile(1, &[(Lighting, 10.0)])];
        assert!(policy.select(&scores, &profiles, &[]).is_empty());

        let scores = user(&[(Lighting, 6.0)]);
        assert_eq!(policy.select(&scores, &profiles, &[]).len(), 1);
    }

    #[test]
    fn test_reference_must_clear_high_bar() {
        let policy = CitationPolicy::default();
        let scores = user(&[(Lighting, 3.0)]);
        let profiles = vec![
            profile(1, &[(Lighting, 7.9)]),
            profile(2, &[(Composition, 10.0)]),
            profile(3, &[(Lighting, 8.0)]),
        ];
        let picks = policy.select(&scores, &profiles, &[]);
        assert_eq!(picks[0].profile_id, Some(3));
    }

    #[test]
    fn test_profile_not_reused_across_dimensions() {
        let policy = CitationPolicy::default();
        let scores = user(&[(Composition, 4.0), (Lighting, 5.0)]);
        let profiles = vec![profile(1, &[(Composition, 9.0), (Lighting, 9.0)])];

        let picks = policy.select(&scores, &profiles, &[]);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].dimension, Composition);
    }

    #[test]
    fn test_caps_fill_weakest_dimensions_first() {
        let policy = CitationPolicy {
            max_images: 2,
            max_quotes: 1,
            ..CitationPolicy::default()
        };
        let scores = user(&[
            (Composition, 6.0),
            (Lighting, 2.0),
            (ColorHarmony, 4.0),
            (SubjectImpact, 3.0),
        ]);
        let all_high: Vec<(Dimension, f32)> = Dimension::ALL.iter().map(|d| (*d, 9.5)).collect();
        let profiles: Vec<_> = (1..=6).map(|id| profile(id, &all_high)).collect();
        let passages = vec![passage("p1", &Dimension::ALL, None), passage("p2", &Dimension::ALL, None)];

        let picks = policy.select(&scores, &profiles, &passages);
        let images: Vec<_> = picks
            .iter()
            .filter(|p| p.profile_id.is_some())
            .map(|p| p.dimension)
            .collect();
        let quotes: Vec<_> = picks
            .iter()
            .filter(|p| p.passage_id.is_some())
            .map(|p| p.dimension)
            .collect();
        assert_eq!(images, vec![Lighting, SubjectImpact]);
        assert_eq!(quotes, vec![Lighting]);
    }

    #[test]
    fn test_default_caps_are_three_and_three() {
        let policy = CitationPolicy::default();
        let scores = user(
            &Dimension::ALL.iter().map(|d| (*d, 1.0)).collect::<Vec<_>>(),
        );
        let all_high: Vec<(Dimension, f32)> = Dimension::ALL.iter().map(|d| (*d, 10.0)).collect();
        let profiles: Vec<_> = (1..=8).map(|id| profile(id, &all_high)).collect();
        let passages: Vec<_> = (1..=8)
            .map(|i| passage(&format!("p{}", i), &Dimension::ALL, None))
            .collect();

        let picks = policy.select(&scores, &profiles, &passages);
        assert_eq!(picks.iter().filter(|p| p.profile_id.is_some()).count(), 3);
        assert_eq!(picks.iter().filter(|p| p.passage_id.is_some()).count(), 3);

        let mut ids: Vec<_> = picks.iter().filter_map(|p| p.profile_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_theme_is_cited_once() {
        let policy = CitationPolicy::default();
        let scores = user(&[(Composition, 4.0), (DepthPerspective, 5.0)]);
        let profiles = vec![
            themed(
                profile(1, &[(Composition, 9.0), (DepthPerspective, 9.0)]),
                None,
                "Foreground anchor",
            ),
            themed(
                profile(2, &[(DepthPerspective, 9.0)]),
                Some(DepthPerspective),
                "foreground ANCHOR ",
            ),
            themed(profile(3, &[(DepthPerspective, 8.5)]), Some(DepthPerspective), "Layering"),
        ];

        let picks = policy.select(&scores, &profiles, &[]);
        assert_eq!(picks.len(), 2);
        assert_eq!(picks[0].profile_id, Some(1));
        assert_eq!(picks[1].dimension, DepthPerspective);
        assert_eq!(picks[1].profile_id, Some(3));
    }

    #[test]
    fn test_theme_ledger_spans_images_and_quotes() {
        let policy = CitationPolicy::default();
        let scores = user(&[(Lighting, 3.0)]);
        let profiles = vec![themed(profile(1, &[(Lighting, 9.0)]), Some(Lighting), "Zone System")];
        let passages = vec![
            passage("zone", &[Lighting], Some("zone system")),
            passage("other", &[Lighting], Some("previsualization")),
        ];

        let picks = policy.select(&scores, &profiles, &passages);
        assert_eq!(picks[0].profile_id, Some(1));
        assert_eq!(picks[0].passage_id.as_deref(), Some("other"));
    }

    #[test]
    fn test_theme_only_applies_to_its_dimension() {
        let profile = themed(profile(1, &[]), Some(Lighting), "Zone System");
        assert_eq!(profile.theme_for(Lighting), Some("Zone System"));
        assert_eq!(profile.theme_for(Composition), None);
    }

    #[test]
    fn test_passage_quote_without_any_image() {
        let policy = CitationPolicy::default();
        let scores = user(&[(EmotionalImpact, 2.0)]);
        let passages = vec![passage("p1", &[Composition], None), passage("p2", &[EmotionalImpact], None)];

        let picks = policy.select(&scores, &[], &passages);
        assert_eq!(
            picks,
            vec![CitationSelection {
                dimension: EmotionalImpact,
                profile_id: None,
                passage_id: Some("p2".into()),
            }]
        );
    }

    #[test]
    fn test_weak_dimensions_order() {
        let policy = CitationPolicy::default();
        let scores = user(&[(EmotionalImpact, 4.0), (Composition, 4.0), (Lighting, 1.0)]);
        assert_eq!(
            policy.weak_dimensions(&scores),
            vec![Lighting, Composition, EmotionalImpact]
        );
    }
}
