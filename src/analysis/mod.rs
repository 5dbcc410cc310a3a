//! Critique results, their parser, and the strategies that produce them.

mod mode;
pub mod prompt;
mod strategy;

pub use mode::AnalysisMode;
pub use strategy::{
    AdapterStrategy, AnalysisInput, AnalysisOutcome, AnalysisStrategy, BaselineStrategy,
    PreparedAnalysis, RagAdapterStrategy, RagStrategy, StepObserver, StrategyDispatcher,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::dimensions::Dimension;
use crate::error::{Error, Result};
use crate::inference::extract_json;

pub const MIN_SCORE: f32 = 0.0;
pub const MAX_SCORE: f32 = 10.0;

/// Reference image cited for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCitation {
    pub profile_id: i64,
    pub image_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub score: f32,
}

/// Passage quoted for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteCitation {
    pub passage_id: String,
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// At most one image and one quote. An absent half is omitted, never null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageCitation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<QuoteCitation>,
}

impl Citation {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.quote.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: Dimension,
    pub score: f32,
    pub comment: String,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation: Option<Citation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub image_description: String,
    /// One entry per canonical dimension, in canonical order.
    pub dimensions: Vec<DimensionScore>,
    pub overall_score: f32,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl AnalysisResult {
    pub fn score(&self, dimension: Dimension) -> Option<f32> {
        self.dimensions
            .iter()
            .find(|d| d.dimension == dimension)
            .map(|d| d.score)
    }

    pub fn scores(&self) -> BTreeMap<Dimension, f32> {
        self.dimensions.iter().map(|d| (d.dimension, d.score)).collect()
    }

    pub fn image_citation_count(&self) -> usize {
        self.dimensions
            .iter()
            .filter(|d| d.citation.as_ref().is_some_and(|c| c.image.is_some()))
            .count()
    }

    pub fn quote_citation_count(&self) -> usize {
        self.dimensions
            .iter()
            .filter(|d| d.citation.as_ref().is_some_and(|c| c.quote.is_some()))
            .count()
    }
}

fn malformed(message: impl Into<String>) -> Error {
    Error::MalformedResult(message.into())
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn number(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
}

fn checked_score(value: &Value, what: &str) -> Result<f32> {
    let score = number(value).ok_or_else(|| malformed(format!("{} is not a number", what)))?;
    if !score.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(malformed(format!(
            "{} {} is outside {}-{}",
            what, score, MIN_SCORE, MAX_SCORE
        )));
    }
    Ok(score)
}

fn dimension_entry(dimension: Dimension, value: &Value) -> Result<DimensionScore> {
    let what = format!("{} score", dimension.as_str());
    match value {
        Value::Object(obj) => {
            let score = obj
                .get("score")
                .ok_or_else(|| malformed(format!("{} is missing", what)))?;
            Ok(DimensionScore {
                dimension,
                score: checked_score(score, &what)?,
                comment: text_field(obj, &["comment", "critique", "feedback"]),
                recommendation: text_field(obj, &["recommendation", "suggestion", "advice"]),
                citation: None,
            })
        }
        other => Ok(DimensionScore {
            dimension,
            score: checked_score(other, &what)?,
            comment: String::new(),
            recommendation: String::new(),
            citation: None,
        }),
    }
}

fn collect_dimensions(value: &Value) -> Result<BTreeMap<Dimension, DimensionScore>> {
    let mut found = BTreeMap::new();
    let mut insert = |name: &str, entry: &Value| -> Result<()> {
        match Dimension::parse(name) {
            Some(dim) => {
                if !found.contains_key(&dim) {
                    found.insert(dim, dimension_entry(dim, entry)?);
                }
            }
            None => tracing::debug!(name, "Ignoring unknown dimension in model output"),
        }
        Ok(())
    };

    match value {
        Value::Object(map) => {
            for (name, entry) in map {
                insert(name, entry)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                let name = item
                    .get("dimension")
                    .or_else(|| item.get("name"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed("dimension entry has no name"))?;
                insert(name, item)?;
            }
        }
        _ => return Err(malformed("\"dimensions\" must be an object or a list")),
    }
    Ok(found)
}

/// Parse a model answer into an [`AnalysisResult`].
///
/// Accepts bare JSON or JSON inside a fenced block. Every canonical
/// dimension must be present with a score in range.
pub fn parse_analysis(raw: &str) -> Result<AnalysisResult> {
    let json = extract_json(raw);
    let value: Value = serde_json::from_str(json)
        .map_err(|e| malformed(format!("model output is not JSON ({})", e)))?;
    let obj = value
        .as_object()
        .ok_or_else(|| malformed("model output is not a JSON object"))?;

    let dims_value = obj
        .get("dimensions")
        .ok_or_else(|| malformed("missing \"dimensions\""))?;
    let mut found = collect_dimensions(dims_value)?;

    let missing: Vec<&str> = Dimension::ALL
        .iter()
        .filter(|d| !found.contains_key(d))
        .map(|d| d.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(malformed(format!("missing dimensions: {}", missing.join(", "))));
    }

    let dimensions: Vec<DimensionScore> = Dimension::ALL
        .iter()
        .filter_map(|d| found.remove(d))
        .collect();

    let overall_score = match obj.get("overall_score") {
        Some(Value::Null) | None => {
            let mean = dimensions.iter().map(|d| d.score).sum::<f32>() / dimensions.len() as f32;
            (mean * 10.0).round() / 10.0
        }
        Some(v) => checked_score(v, "overall_score")?,
    };

    let recommendations = match obj.get("recommendations") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };

    Ok(AnalysisResult {
        image_description: text_field(obj, &["image_description", "description"]),
        dimensions,
        overall_score,
        recommendations,
    })
}
