use rusqlite::{params, params_from_iter};
use serde::Serialize;
use std::collections::HashMap;

use super::Database;
use crate::dimensions::Dimension;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Technique {
    pub id: i64,
    pub advisor_id: String,
    pub name: String,
    pub detection_criteria: String,
    pub dimension: Option<Dimension>,
}

#[derive(Debug, Clone)]
pub struct NewTechnique<'a> {
    pub advisor_id: &'a str,
    pub name: &'a str,
    pub detection_criteria: &'a str,
    pub dimension: Option<Dimension>,
}

/// How strongly one reference image exhibits one technique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TechniqueAnnotation {
    pub profile_id: i64,
    pub technique_id: i64,
    pub technique_name: String,
    pub dimension: Option<Dimension>,
    pub strength: f32,
    pub evidence: Option<String>,
    pub region: Option<String>,
}

impl Database {
    /// Upsert by `(advisor_id, name)`, returning the technique id.
    pub fn save_technique(&self, technique: &NewTechnique<'_>) -> Result<i64> {
        let conn = self.conn();
        let id = conn.query_row(
            r#"
            INSERT INTO techniques (advisor_id, name, detection_criteria, dimension)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(advisor_id, name) DO UPDATE SET
                detection_criteria = excluded.detection_criteria,
                dimension = COALESCE(excluded.dimension, dimension)
            RETURNING id
            "#,
            params![
                technique.advisor_id,
                technique.name,
                technique.detection_criteria,
                technique.dimension.map(|d| d.as_str()),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn find_technique(&self, advisor_id: &str, name: &str) -> Result<Option<Technique>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, advisor_id, name, detection_criteria, dimension FROM techniques WHERE advisor_id = ? AND name = ?",
        )?;
        let mut rows = stmt.query_map(params![advisor_id, name], |row| {
            let dimension: Option<String> = row.get(4)?;
            Ok(Technique {
                id: row.get(0)?,
                advisor_id: row.get(1)?,
                name: row.get(2)?,
                detection_criteria: row.get(3)?,
                dimension: dimension.as_deref().and_then(Dimension::parse),
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn annotate_technique(
        &self,
        profile_id: i64,
        technique_id: i64,
        strength: f32,
        evidence: Option<&str>,
        region: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO technique_annotations (profile_id, technique_id, strength, evidence, region)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(profile_id, technique_id) DO UPDATE SET
                strength = excluded.strength,
                evidence = COALESCE(excluded.evidence, evidence),
                region = COALESCE(excluded.region, region)
            "#,
            params![profile_id, technique_id, strength as f64, evidence, region],
        )?;
        Ok(())
    }

    /// Annotations for the given profiles, strongest first within each profile.
    pub fn techniques_for_profiles(
        &self,
        profile_ids: &[i64],
    ) -> Result<HashMap<i64, Vec<TechniqueAnnotation>>> {
        let mut by_profile: HashMap<i64, Vec<TechniqueAnnotation>> = HashMap::new();
        if profile_ids.is_empty() {
            return Ok(by_profile);
        }

        let placeholders = vec!["?"; profile_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT a.profile_id, a.technique_id, t.name, t.dimension, a.strength, a.evidence, a.region
            FROM technique_annotations a
            JOIN techniques t ON t.id = a.technique_id
            WHERE a.profile_id IN ({})
            ORDER BY a.profile_id, a.strength DESC, t.name
            "#,
            placeholders
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(profile_ids.iter()), |row| {
            let dimension: Option<String> = row.get(3)?;
            Ok(TechniqueAnnotation {
                profile_id: row.get(0)?,
                technique_id: row.get(1)?,
                technique_name: row.get(2)?,
                dimension: dimension.as_deref().and_then(Dimension::parse),
                strength: row.get::<_, f64>(4)? as f32,
                evidence: row.get(5)?,
                region: row.get(6)?,
            })
        })?;

        for annotation in rows {
            let annotation = annotation?;
            by_profile
                .entry(annotation.profile_id)
                .or_default()
                .push(annotation);
        }
        Ok(by_profile)
    }
}
