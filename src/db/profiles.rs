//! Dimensional profiles: one scored reference image per advisor.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::embeddings::{bytes_to_embedding, cosine_distance, embedding_to_bytes, EmbeddingKind};
use super::schema::dimension_columns;
use super::{get_timestamp, now_timestamp, Database};
use crate::dimensions::Dimension;
use crate::error::Result;

const METADATA_COLUMNS: [&str; 4] = ["title", "date", "location", "significance"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DimensionEntry {
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub instructive_text: Option<String>,
}

impl DimensionEntry {
    fn is_empty(&self) -> bool {
        self.score.is_none() && self.comment.is_none() && self.instructive_text.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionalProfile {
    pub id: i64,
    pub advisor_id: String,
    pub image_reference: String,
    pub title: Option<String>,
    pub date: Option<String>,
    pub location: Option<String>,
    pub significance: Option<String>,
    pub dimensions: BTreeMap<Dimension, DimensionEntry>,
    #[serde(skip)]
    pub visual_embedding: Option<Vec<f32>>,
    #[serde(skip)]
    pub text_embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DimensionalProfile {
    pub fn score(&self, dim: Dimension) -> Option<f32> {
        self.dimensions.get(&dim).and_then(|e| e.score)
    }

    pub fn embedding(&self, kind: EmbeddingKind) -> Option<&[f32]> {
        match kind {
            EmbeddingKind::Visual => self.visual_embedding.as_deref(),
            EmbeddingKind::Text => self.text_embedding.as_deref(),
        }
    }
}

/// Partial profile for merge-upsert. `None` fields leave stored values alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileData {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub significance: Option<String>,
    #[serde(default)]
    pub dimensions: BTreeMap<Dimension, DimensionEntry>,
    #[serde(default)]
    pub visual_embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub text_embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct RankedProfile {
    pub profile: DimensionalProfile,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub total: i64,
    pub with_visual_embedding: i64,
    pub with_text_embedding: i64,
    pub with_both: i64,
}

impl Coverage {
    pub fn is_complete(&self) -> bool {
        self.with_both == self.total
    }
}

/// Columns written by an upsert, excluding the conflict key and timestamps.
fn merge_columns() -> Vec<String> {
    let mut cols: Vec<String> = METADATA_COLUMNS.iter().map(|c| c.to_string()).collect();
    for dim in Dimension::ALL {
        cols.extend(dimension_columns(dim));
    }
    for kind in [EmbeddingKind::Visual, EmbeddingKind::Text] {
        cols.push(kind.column().to_string());
        cols.push(format!("{}_dim", kind.column()));
    }
    cols
}

fn select_columns() -> String {
    let mut cols = vec![
        "id".to_string(),
        "advisor_id".to_string(),
        "image_reference".to_string(),
    ];
    cols.extend(METADATA_COLUMNS.iter().map(|c| c.to_string()));
    for dim in Dimension::ALL {
        cols.extend(dimension_columns(dim));
    }
    cols.push("visual_embedding".to_string());
    cols.push("text_embedding".to_string());
    cols.push("created_at".to_string());
    cols.push("updated_at".to_string());
    cols.join(", ")
}

fn opt_text(value: &Option<String>) -> Value {
    value.clone().map(Value::Text).unwrap_or(Value::Null)
}

fn embedding_values(embedding: &Option<Vec<f32>>) -> [Value; 2] {
    match embedding {
        Some(v) => [
            Value::Blob(embedding_to_bytes(v)),
            Value::Integer(v.len() as i64),
        ],
        None => [Value::Null, Value::Null],
    }
}

fn merge_values(data: &ProfileData) -> Vec<Value> {
    let mut values = vec![
        opt_text(&data.title),
        opt_text(&data.date),
        opt_text(&data.location),
        opt_text(&data.significance),
    ];
    for dim in Dimension::ALL {
        let entry = data.dimensions.get(&dim).cloned().unwrap_or_default();
        values.push(
            entry
                .score
                .map(|s| Value::Real(s as f64))
                .unwrap_or(Value::Null),
        );
        values.push(opt_text(&entry.comment));
        values.push(opt_text(&entry.instructive_text));
    }
    values.extend(embedding_values(&data.visual_embedding));
    values.extend(embedding_values(&data.text_embedding));
    values
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<DimensionalProfile> {
    let mut idx = 3;
    let mut metadata: Vec<Option<String>> = Vec::with_capacity(METADATA_COLUMNS.len());
    for _ in METADATA_COLUMNS {
        metadata.push(row.get(idx)?);
        idx += 1;
    }

    let mut dimensions = BTreeMap::new();
    for dim in Dimension::ALL {
        let entry = DimensionEntry {
            score: row.get::<_, Option<f64>>(idx)?.map(|s| s as f32),
            comment: row.get(idx + 1)?,
            instructive_text: row.get(idx + 2)?,
        };
        idx += 3;
        if !entry.is_empty() {
            dimensions.insert(dim, entry);
        }
    }

    let visual: Option<Vec<u8>> = row.get(idx)?;
    let text: Option<Vec<u8>> = row.get(idx + 1)?;
    let created_at = get_timestamp(row, idx + 2)?;
    let updated_at = get_timestamp(row, idx + 3)?;

    let mut metadata = metadata.into_iter();
    Ok(DimensionalProfile {
        id: row.get(0)?,
        advisor_id: row.get(1)?,
        image_reference: row.get(2)?,
        title: metadata.next().flatten(),
        date: metadata.next().flatten(),
        location: metadata.next().flatten(),
        significance: metadata.next().flatten(),
        dimensions,
        visual_embedding: visual.map(|b| bytes_to_embedding(&b)),
        text_embedding: text.map(|b| bytes_to_embedding(&b)),
        created_at,
        updated_at,
    })
}

impl Database {
    /// Merge-upsert keyed by `(advisor_id, image_reference)`.
    ///
    /// Fields present in `data` overwrite stored ones; absent fields are kept.
    pub fn save_profile(
        &self,
        advisor_id: &str,
        image_reference: &str,
        data: &ProfileData,
    ) -> Result<i64> {
        let cols = merge_columns();
        let now = now_timestamp();

        let mut values = vec![
            Value::Text(advisor_id.to_string()),
            Value::Text(image_reference.to_string()),
        ];
        values.extend(merge_values(data));
        values.push(Value::Text(now.clone()));
        values.push(Value::Text(now));

        let placeholders = (1..=values.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = cols
            .iter()
            .map(|c| format!("{c} = COALESCE(excluded.{c}, {c})"))
            .collect::<Vec<_>>()
            .join(",\n                ");

        let sql = format!(
            r#"
            INSERT INTO dimensional_profiles (advisor_id, image_reference, {}, created_at, updated_at)
            VALUES ({})
            ON CONFLICT(advisor_id, image_reference) DO UPDATE SET
                {},
                updated_at = excluded.updated_at
            RETURNING id
            "#,
            cols.join(", "),
            placeholders,
            updates
        );

        let conn = self.conn();
        let id = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(id)
    }

    pub fn get_profile(
        &self,
        advisor_id: &str,
        image_reference: &str,
    ) -> Result<Option<DimensionalProfile>> {
        let sql = format!(
            "SELECT {} FROM dimensional_profiles WHERE advisor_id = ? AND image_reference = ?",
            select_columns()
        );
        let conn = self.conn();
        let profile = conn
            .query_row(&sql, params![advisor_id, image_reference], row_to_profile)
            .optional()?;
        Ok(profile)
    }

    pub fn get_profile_by_id(&self, profile_id: i64) -> Result<Option<DimensionalProfile>> {
        let sql = format!(
            "SELECT {} FROM dimensional_profiles WHERE id = ?",
            select_columns()
        );
        let conn = self.conn();
        let profile = conn
            .query_row(&sql, [profile_id], row_to_profile)
            .optional()?;
        Ok(profile)
    }

    pub fn list_profiles(&self, advisor_id: &str) -> Result<Vec<DimensionalProfile>> {
        let sql = format!(
            "SELECT {} FROM dimensional_profiles WHERE advisor_id = ? ORDER BY id",
            select_columns()
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let profiles = stmt
            .query_map([advisor_id], row_to_profile)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(profiles)
    }

    /// Nearest profiles for the advisor, ascending by cosine distance.
    ///
    /// Profiles without the requested embedding, or whose vector length differs
    /// from the query, are skipped.
    pub fn query_profiles(
        &self,
        advisor_id: &str,
        query: &[f32],
        k: usize,
        kind: EmbeddingKind,
    ) -> Result<Vec<RankedProfile>> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self.list_profiles(advisor_id)?;
        let mut ranked: Vec<RankedProfile> = candidates
            .into_par_iter()
            .filter_map(|profile| {
                let distance = match profile.embedding(kind) {
                    Some(v) if v.len() == query.len() => cosine_distance(query, v),
                    _ => return None,
                };
                Some(RankedProfile { profile, distance })
            })
            .collect();

        ranked.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.profile.id.cmp(&b.profile.id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    pub fn verify_coverage(&self, advisor_id: &str) -> Result<Coverage> {
        let conn = self.conn();
        let coverage = conn.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(visual_embedding IS NOT NULL), 0),
                COALESCE(SUM(text_embedding IS NOT NULL), 0),
                COALESCE(SUM(visual_embedding IS NOT NULL AND text_embedding IS NOT NULL), 0)
            FROM dimensional_profiles
            WHERE advisor_id = ?
            "#,
            [advisor_id],
            |row| {
                Ok(Coverage {
                    total: row.get(0)?,
                    with_visual_embedding: row.get(1)?,
                    with_text_embedding: row.get(2)?,
                    with_both: row.get(3)?,
                })
            },
        )?;
        Ok(coverage)
    }

    /// Delete every profile, annotation, passage and technique for one advisor.
    /// Returns the number of profiles removed.
    pub fn reset_advisor(&self, advisor_id: &str) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            DELETE FROM technique_annotations
            WHERE profile_id IN (SELECT id FROM dimensional_profiles WHERE advisor_id = ?)
            "#,
            [advisor_id],
        )?;
        let removed = tx.execute(
            "DELETE FROM dimensional_profiles WHERE advisor_id = ?",
            [advisor_id],
        )?;
        tx.execute("DELETE FROM passages WHERE advisor_id = ?", [advisor_id])?;
        tx.execute("DELETE FROM techniques WHERE advisor_id = ?", [advisor_id])?;
        tx.commit()?;
        Ok(removed)
    }
}
