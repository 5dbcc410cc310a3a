//! Retrieval-augmented context: nearest reference profiles, relevant
//! passages, and the citations drawn from them.

mod citations;
mod embedding;

pub use citations::{
    CandidatePassage, CandidateProfile, CitationPolicy, CitationSelection, ThemeTag,
};
pub use embedding::{ImageEmbedder, ImageFeatureEmbedder};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analysis::{AnalysisResult, Citation, ImageCitation, QuoteCitation};
use crate::config::RetrievalConfig;
use crate::db::{Database, EmbeddingKind, Passage, PassageStatus, RankedProfile, TechniqueAnnotation};
use crate::dimensions::Dimension;
use crate::error::{Error, Result};

const EXCERPT_CHARS: usize = 280;

/// Everything retrieved for one request.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    /// Nearest first.
    pub profiles: Vec<RankedProfile>,
    /// Most specific first.
    pub passages: Vec<Passage>,
    pub annotations: HashMap<i64, Vec<TechniqueAnnotation>>,
}

impl RetrievedContext {
    pub fn profile_ids(&self) -> Vec<i64> {
        self.profiles.iter().map(|r| r.profile.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty() && self.passages.is_empty()
    }

    pub fn candidate_profiles(&self) -> Vec<CandidateProfile> {
        self.profiles
            .iter()
            .map(|ranked| {
                let themes = self
                    .annotations
                    .get(&ranked.profile.id)
                    .map(|list| {
                        list.iter()
                            .map(|a| ThemeTag {
                                dimension: a.dimension,
                                name: a.technique_name.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                CandidateProfile {
                    profile_id: ranked.profile.id,
                    scores: ranked
                        .profile
                        .dimensions
                        .iter()
                        .filter_map(|(d, e)| e.score.map(|s| (*d, s)))
                        .collect(),
                    themes,
                    distance: ranked.distance,
                }
            })
            .collect()
    }

    pub fn candidate_passages(&self) -> Vec<CandidatePassage> {
        self.passages
            .iter()
            .map(|p| CandidatePassage {
                passage_id: p.id.clone(),
                tags: p.tags.clone(),
                theme: p.theme.clone(),
            })
            .collect()
    }

    /// Prompt block describing the references. `max_passages` bounds the
    /// quoted material.
    pub fn render(&self, max_passages: usize) -> String {
        let mut out = String::new();

        if !self.profiles.is_empty() {
            out.push_str("Reference images, most similar first:\n");
            for (i, ranked) in self.profiles.iter().enumerate() {
                let p = &ranked.profile;
                let title = p.title.as_deref().unwrap_or(&p.image_reference);
                let mut line = format!("[{}] \"{}\"", i + 1, title);
                let place: Vec<&str> = [p.date.as_deref(), p.location.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect();
                if !place.is_empty() {
                    line.push_str(&format!(" ({})", place.join(", ")));
                }

                let mut strengths: Vec<(Dimension, f32)> = p
                    .dimensions
                    .iter()
                    .filter_map(|(d, e)| e.score.map(|s| (*d, s)))
                    .collect();
                strengths.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                if !strengths.is_empty() {
                    let top: Vec<String> = strengths
                        .iter()
                        .take(3)
                        .map(|(d, s)| format!("{} {:.1}", d.display_name(), s))
                        .collect();
                    line.push_str(&format!("; strongest: {}", top.join(", ")));
                }

                if let Some(annotations) = self.annotations.get(&p.id) {
                    let names: Vec<&str> = annotations
                        .iter()
                        .take(3)
                        .map(|a| a.technique_name.as_str())
                        .collect();
                    if !names.is_empty() {
                        line.push_str(&format!("; techniques: {}", names.join(", ")));
                    }
                }
                if let Some(significance) = p.significance.as_deref() {
                    line.push_str(&format!(". {}", significance.trim()));
                }

                out.push_str(&line);
                out.push('\n');
            }
        }

        if max_passages > 0 && !self.passages.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Passages from your writing:\n");
            for passage in self.passages.iter().take(max_passages) {
                out.push_str(&format!("- \"{}\"", excerpt(&passage.body)));
                if let Some(source) = passage.source.as_deref() {
                    out.push_str(&format!(" ({})", source));
                }
                out.push('\n');
            }
        }

        out
    }
}

fn excerpt(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= EXCERPT_CHARS {
        return body.to_string();
    }
    let cut: String = body.chars().take(EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}

pub struct RetrievalEngine {
    db: Arc<Database>,
    embedder: Arc<dyn ImageEmbedder>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(db: Arc<Database>, embedder: Arc<dyn ImageEmbedder>, config: RetrievalConfig) -> Self {
        Self {
            db,
            embedder,
            config,
        }
    }

    pub fn policy(&self) -> CitationPolicy {
        CitationPolicy::from(&self.config)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Embed the image and run both sub-queries for `advisor_id`.
    pub async fn retrieve(&self, advisor_id: &str, image: Arc<Vec<u8>>) -> Result<RetrievedContext> {
        let db = Arc::clone(&self.db);
        let embedder = Arc::clone(&self.embedder);
        let advisor_id = advisor_id.to_string();
        let top_k = self.config.top_k;

        tokio::task::spawn_blocking(move || -> Result<RetrievedContext> {
            let query = embedder.embed_bytes(&image)?;
            let profiles = db.query_profiles(&advisor_id, &query, top_k, EmbeddingKind::Visual)?;
            let passages = db.passages_for_dimensions(&advisor_id, &Dimension::ALL)?;
            let ids: Vec<i64> = profiles.iter().map(|r| r.profile.id).collect();
            let annotations = db.techniques_for_profiles(&ids)?;

            debug!(
                advisor = %advisor_id,
                profiles = profiles.len(),
                passages = passages.len(),
                "Retrieved reference context"
            );
            Ok(RetrievedContext {
                profiles,
                passages,
                annotations,
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("retrieval task panicked: {}", e)))?
    }

    pub fn select_citations(
        &self,
        result: &AnalysisResult,
        context: &RetrievedContext,
    ) -> Vec<CitationSelection> {
        self.policy().select(
            &result.scores(),
            &context.candidate_profiles(),
            &context.candidate_passages(),
        )
    }

    /// Thread selected citations into `result`, re-resolving every id.
    /// An id that no longer resolves, or a profile that no longer clears the
    /// high bar for its dimension, is dropped with a warning.
    pub fn apply_citations(
        &self,
        result: &mut AnalysisResult,
        selections: &[CitationSelection],
    ) -> Result<()> {
        let policy = self.policy();
        for selection in selections {
            let mut citation = Citation::default();
            let dimension = selection.dimension.as_str();

            if let Some(profile_id) = selection.profile_id {
                match self.db.get_profile_by_id(profile_id)? {
                    Some(profile) => match profile.score(selection.dimension) {
                        Some(score) if policy.is_exemplary(score) => {
                            citation.image = Some(ImageCitation {
                                profile_id,
                                score,
                                title: profile.title.clone(),
                                image_reference: profile.image_reference,
                            });
                        }
                        score => warn!(profile_id, dimension, ?score, "Cited profile fell below the high bar; dropping"),
                    },
                    None => warn!(profile_id, dimension, "Cited profile no longer exists; dropping"),
                }
            }

            if let Some(passage_id) = selection.passage_id.as_deref() {
                match self.db.get_passage(passage_id)? {
                    Some(passage) if passage.status == PassageStatus::Approved => {
                        citation.quote = Some(QuoteCitation {
                            passage_id: passage.id,
                            excerpt: excerpt(&passage.body),
                            source: passage.source,
                        });
                    }
                    Some(_) => warn!(passage_id, dimension, "Cited passage is no longer approved; dropping"),
                    None => warn!(passage_id, dimension, "Cited passage no longer exists; dropping"),
                }
            }

            if citation.is_empty() {
                continue;
            }
            if let Some(entry) = result
                .dimensions
                .iter_mut()
                .find(|d| d.dimension == selection.dimension)
            {
                entry.citation = Some(citation);
            }
        }
        Ok(())
    }
}
