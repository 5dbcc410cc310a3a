//! Offline corpus import: reference profiles, passages and techniques from
//! JSON documents on disk.
//!
//! A file holds one document or an array of them; each carries a `kind` of
//! `profile`, `passage` or `technique`. Profiles are written before techniques
//! so annotations can find the images they point at.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::db::{Database, DimensionEntry, NewPassage, NewTechnique, PassageStatus, ProfileData};
use crate::dimensions::Dimension;
use crate::error::{Error, Result};
use crate::inference::VisionProvider;
use crate::retrieval::ImageEmbedder;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum DimensionValue {
    Score(f32),
    Entry(DimensionEntry),
}

impl From<DimensionValue> for DimensionEntry {
    fn from(value: DimensionValue) -> Self {
        match value {
            DimensionValue::Score(score) => DimensionEntry {
                score: Some(score),
                ..DimensionEntry::default()
            },
            DimensionValue::Entry(entry) => entry,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileDocument {
    #[serde(alias = "advisor")]
    pub advisor_id: String,
    pub image_reference: String,
    /// Image file, relative to the document, used to compute a missing
    /// visual embedding.
    #[serde(default)]
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub significance: Option<String>,
    #[serde(default)]
    dimensions: BTreeMap<String, DimensionValue>,
    #[serde(default)]
    pub visual_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub text_embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PassageDocument {
    pub id: String,
    #[serde(alias = "advisor")]
    pub advisor_id: String,
    #[serde(alias = "text")]
    pub body: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "dimensions")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub theme: Option<String>,
    /// Curated imports are approved unless they say otherwise.
    #[serde(default = "approved")]
    pub status: PassageStatus,
}

fn approved() -> PassageStatus {
    PassageStatus::Approved
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationDocument {
    pub image_reference: String,
    pub strength: f32,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TechniqueDocument {
    #[serde(alias = "advisor")]
    pub advisor_id: String,
    pub name: String,
    #[serde(default)]
    pub detection_criteria: String,
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default)]
    pub annotations: Vec<AnnotationDocument>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Document {
    Profile(ProfileDocument),
    Passage(PassageDocument),
    Technique(TechniqueDocument),
}

impl Document {
    fn order(&self) -> u8 {
        match self {
            Document::Profile(_) => 0,
            Document::Passage(_) => 1,
            Document::Technique(_) => 2,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<Document>),
    One(Box<Document>),
}

/// Parse one JSON file's documents.
pub fn parse_documents(content: &str) -> Result<Vec<Document>> {
    Ok(match serde_json::from_str::<OneOrMany>(content)? {
        OneOrMany::Many(docs) => docs,
        OneOrMany::One(doc) => vec![*doc],
    })
}

/// `*.json` files under `root`, sorted.
pub fn discover_documents(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.is_file()
                && p
                    .extension()
                    .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case("json"))
        })
        .collect();
    files.sort();
    files
}

#[derive(Debug, Default, Clone)]
pub struct ImportReport {
    pub files: usize,
    pub profiles: usize,
    pub passages: usize,
    pub techniques: usize,
    pub annotations: usize,
    pub visual_embeddings_computed: usize,
    pub text_embeddings_computed: usize,
    /// Documents or files that could not be imported, with the reason.
    pub skipped: Vec<(PathBuf, String)>,
}

pub struct Importer<'a> {
    db: &'a Database,
    embedder: &'a dyn ImageEmbedder,
    text_provider: Option<Arc<dyn VisionProvider>>,
}

impl<'a> Importer<'a> {
    pub fn new(db: &'a Database, embedder: &'a dyn ImageEmbedder) -> Self {
        Self {
            db,
            embedder,
            text_provider: None,
        }
    }

    /// Also compute missing text embeddings through `provider`.
    pub fn with_text_embeddings(mut self, provider: Arc<dyn VisionProvider>) -> Self {
        self.text_provider = Some(provider);
        self
    }

    /// Import every document under `root`. Bad files are reported and skipped.
    pub fn import_dir(&self, root: &Path) -> Result<ImportReport> {
        if !root.is_dir() {
            return Err(Error::NotFound(format!("directory {}", root.display())));
        }

        let mut report = ImportReport::default();
        let mut documents: Vec<(PathBuf, Document)> = Vec::new();

        for file in discover_documents(root) {
            report.files += 1;
            let parsed = std::fs::read_to_string(&file)
                .map_err(Error::from)
                .and_then(|content| parse_documents(&content));
            match parsed {
                Ok(docs) => documents.extend(docs.into_iter().map(|d| (file.clone(), d))),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Skipping unreadable document");
                    report.skipped.push((file, e.to_string()));
                }
            }
        }

        documents.sort_by_key(|(_, doc)| doc.order());
        for (file, doc) in documents {
            if let Err(e) = self.import_document(&file, doc, &mut report) {
                warn!(file = %file.display(), error = %e, "Skipping document");
                report.skipped.push((file, e.to_string()));
            }
        }

        info!(
            files = report.files,
            profiles = report.profiles,
            passages = report.passages,
            techniques = report.techniques,
            skipped = report.skipped.len(),
            "Import finished"
        );
        Ok(report)
    }

    pub fn import_document(
        &self,
        file: &Path,
        doc: Document,
        report: &mut ImportReport,
    ) -> Result<()> {
        match doc {
            Document::Profile(profile) => self.import_profile(file, profile, report),
            Document::Passage(passage) => self.import_passage(passage, report),
            Document::Technique(technique) => self.import_technique(technique, report),
        }
    }

    fn import_profile(
        &self,
        file: &Path,
        doc: ProfileDocument,
        report: &mut ImportReport,
    ) -> Result<()> {
        let mut dimensions = BTreeMap::new();
        for (name, value) in doc.dimensions {
            match Dimension::parse(&name) {
                Some(dim) => {
                    dimensions.insert(dim, DimensionEntry::from(value));
                }
                None => warn!(dimension = %name, image = %doc.image_reference, "Unknown dimension ignored"),
            }
        }

        let mut visual_embedding = doc.visual_embedding;
        if visual_embedding.is_none() {
            if let Some(image_path) = &doc.image_path {
                let path = match file.parent() {
                    Some(dir) if image_path.is_relative() => dir.join(image_path),
                    _ => image_path.clone(),
                };
                let bytes = std::fs::read(&path)?;
                visual_embedding = Some(self.embedder.embed_bytes(&bytes)?);
                report.visual_embeddings_computed += 1;
            }
        }

        let mut text_embedding = doc.text_embedding;
        if text_embedding.is_none() {
            if let Some(provider) = self.text_provider.as_ref().filter(|p| p.supports_embeddings()) {
                let text = profile_text(doc.title.as_deref(), doc.significance.as_deref(), &dimensions);
                if !text.is_empty() {
                    text_embedding = Some(provider.text_embedding(&text)?);
                    report.text_embeddings_computed += 1;
                }
            }
        }

        let data = ProfileData {
            title: doc.title,
            date: doc.date,
            location: doc.location,
            significance: doc.significance,
            dimensions,
            visual_embedding,
            text_embedding,
        };
        let id = self.db.save_profile(&doc.advisor_id, &doc.image_reference, &data)?;
        debug!(profile_id = id, image = %doc.image_reference, "Profile imported");
        report.profiles += 1;
        Ok(())
    }

    fn import_passage(&self, doc: PassageDocument, report: &mut ImportReport) -> Result<()> {
        let tags: Vec<Dimension> = doc
            .tags
            .iter()
            .filter_map(|t| {
                let dim = Dimension::parse(t);
                if dim.is_none() {
                    warn!(passage = %doc.id, tag = %t, "Unknown dimension tag ignored");
                }
                dim
            })
            .collect();

        self.db.save_passage(&NewPassage {
            id: &doc.id,
            advisor_id: &doc.advisor_id,
            body: &doc.body,
            source: doc.source.as_deref(),
            tags: &tags,
            theme: doc.theme.as_deref(),
            status: doc.status,
        })?;
        report.passages += 1;
        Ok(())
    }

    fn import_technique(&self, doc: TechniqueDocument, report: &mut ImportReport) -> Result<()> {
        let dimension = match doc.dimension.as_deref() {
            Some(name) => Some(Dimension::parse(name).ok_or_else(|| {
                Error::Validation(format!("technique '{}': unknown dimension '{}'", doc.name, name))
            })?),
            None => None,
        };

        let technique_id = self.db.save_technique(&NewTechnique {
            advisor_id: &doc.advisor_id,
            name: &doc.name,
            detection_criteria: &doc.detection_criteria,
            dimension,
        })?;
        report.techniques += 1;

        for annotation in &doc.annotations {
            let Some(profile) = self.db.get_profile(&doc.advisor_id, &annotation.image_reference)? else {
                warn!(
                    technique = %doc.name,
                    image = %annotation.image_reference,
                    "Annotation points at an unknown profile"
                );
                continue;
            };
            self.db.annotate_technique(
                profile.id,
                technique_id,
                annotation.strength,
                annotation.evidence.as_deref(),
                annotation.region.as_deref(),
            )?;
            report.annotations += 1;
        }
        Ok(())
    }
}

fn profile_text(
    title: Option<&str>,
    significance: Option<&str>,
    dimensions: &BTreeMap<Dimension, DimensionEntry>,
) -> String {
    let mut parts: Vec<&str> = Vec::new();
    parts.extend(title);
    parts.extend(significance);
    parts.extend(dimensions.values().filter_map(|e| e.comment.as_deref()));
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EmbeddingKind;
    use crate::inference::mock::test_image;
    use crate::retrieval::ImageFeatureEmbedder;
    use tempfile::TempDir;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_parse_single_and_array() {
        let one = parse_documents(
            r#"{"kind": "passage", "id": "p1", "advisor_id": "adams", "body": "Simplify.", "tags": ["Composition"]}"#,
        )
        .unwrap();
        assert_eq!(one.len(), 1);

        let many = parse_documents(
            r#"[
                {"kind": "profile", "advisor_id": "adams", "image_reference": "a.jpg"},
                {"kind": "technique", "advisor_id": "adams", "name": "zone system"}
            ]"#,
        )
        .unwrap();
        assert_eq!(many.len(), 2);

        assert!(parse_documents(r#"{"kind": "album"}"#).is_err());
    }

    #[test]
    fn test_import_dir_merges_and_annotates() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("moonrise.png"), test_image()).unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        // Technique first on disk; import still writes profiles before it.
        std::fs::write(
            dir.path().join("a_techniques.json"),
            r#"{"kind": "technique", "advisor_id": "adams", "name": "Zone System",
                "detection_criteria": "full tonal range", "dimension": "Lighting",
                "annotations": [{"image_reference": "moonrise.png", "strength": 0.9},
                                {"image_reference": "missing.png", "strength": 0.5}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("profiles.json"),
            r#"[{"kind": "profile", "advisor_id": "adams", "image_reference": "moonrise.png",
                 "image_path": "moonrise.png", "title": "Moonrise",
                 "dimensions": {"Composition": 10, "lighting": {"score": 9.5, "comment": "luminous"},
                                "Focus & Sharpness": 8, "teleportation": 3}}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("nested/passages.json"),
            r#"{"kind": "passage", "id": "p1", "advisor_id": "adams", "body": "There is nothing worse than a sharp image of a fuzzy concept.",
                "tags": ["focus-sharpness", "subject impact"], "theme": "concept"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let db = db();
        let embedder = ImageFeatureEmbedder;
        let report = Importer::new(&db, &embedder).import_dir(dir.path()).unwrap();

        assert_eq!(report.files, 4);
        assert_eq!(report.profiles, 1);
        assert_eq!(report.passages, 1);
        assert_eq!(report.techniques, 1);
        assert_eq!(report.annotations, 1);
        assert_eq!(report.visual_embeddings_computed, 1);
        assert_eq!(report.skipped.len(), 1);

        let profile = db.get_profile("adams", "moonrise.png").unwrap().unwrap();
        assert_eq!(profile.score(Dimension::Composition), Some(10.0));
        assert_eq!(profile.score(Dimension::FocusSharpness), Some(8.0));
        assert_eq!(
            profile.dimensions[&Dimension::Lighting].comment.as_deref(),
            Some("luminous")
        );
        assert_eq!(
            profile.embedding(EmbeddingKind::Visual).map(|v| v.len()),
            Some(ImageFeatureEmbedder::DIMENSIONS)
        );

        let passage = db.get_passage("p1").unwrap().unwrap();
        assert_eq!(passage.status, PassageStatus::Approved);
        assert_eq!(passage.tags, vec![Dimension::FocusSharpness, Dimension::SubjectImpact]);

        let annotations = db.techniques_for_profiles(&[profile.id]).unwrap();
        assert_eq!(annotations[&profile.id][0].technique_name, "Zone System");
    }

    #[test]
    fn test_reimport_preserves_scores() {
        let dir = TempDir::new().unwrap();
        let db = db();
        let embedder = ImageFeatureEmbedder;
        let importer = Importer::new(&db, &embedder);

        std::fs::write(
            dir.path().join("scores.json"),
            r#"{"kind": "profile", "advisor_id": "adams", "image_reference": "a.jpg",
                "title": "Untitled", "dimensions": {"composition": 9}}"#,
        )
        .unwrap();
        importer.import_dir(dir.path()).unwrap();

        std::fs::write(
            dir.path().join("scores.json"),
            r#"{"kind": "profile", "advisor_id": "adams", "image_reference": "a.jpg",
                "title": "Clearing Winter Storm", "location": "Yosemite"}"#,
        )
        .unwrap();
        importer.import_dir(dir.path()).unwrap();

        let profile = db.get_profile("adams", "a.jpg").unwrap().unwrap();
        assert_eq!(profile.title.as_deref(), Some("Clearing Winter Storm"));
        assert_eq!(profile.location.as_deref(), Some("Yosemite"));
        assert_eq!(profile.score(Dimension::Composition), Some(9.0));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let db = db();
        let embedder = ImageFeatureEmbedder;
        let err = Importer::new(&db, &embedder)
            .import_dir(Path::new("/definitely/not/here"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
