use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{now_timestamp, Database};
use crate::dimensions::Dimension;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassageStatus {
    #[default]
    Pending,
    Approved,
}

impl PassageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassageStatus::Pending => "pending",
            PassageStatus::Approved => "approved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PassageStatus::Pending),
            "approved" => Some(PassageStatus::Approved),
            _ => None,
        }
    }
}

/// A quotable excerpt from an advisor's writing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub id: String,
    pub advisor_id: String,
    pub body: String,
    pub source: Option<String>,
    pub tags: Vec<Dimension>,
    pub theme: Option<String>,
    pub status: PassageStatus,
}

#[derive(Debug, Clone)]
pub struct NewPassage<'a> {
    pub id: &'a str,
    pub advisor_id: &'a str,
    pub body: &'a str,
    pub source: Option<&'a str>,
    pub tags: &'a [Dimension],
    pub theme: Option<&'a str>,
    pub status: PassageStatus,
}

fn row_to_passage(row: &rusqlite::Row<'_>) -> rusqlite::Result<Passage> {
    let tags_json: String = row.get(4)?;
    let keys: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let status: String = row.get(6)?;

    Ok(Passage {
        id: row.get(0)?,
        advisor_id: row.get(1)?,
        body: row.get(2)?,
        source: row.get(3)?,
        tags: keys.iter().filter_map(|k| Dimension::parse(k)).collect(),
        theme: row.get(5)?,
        status: PassageStatus::from_str(&status).unwrap_or_default(),
    })
}

const PASSAGE_COLUMNS: &str = "id, advisor_id, body, source, tags, theme, status";

impl Database {
    /// Insert or replace a passage by id. An id already owned by another
    /// advisor is rejected.
    pub fn save_passage(&self, passage: &NewPassage<'_>) -> Result<()> {
        let mut tags: Vec<&str> = passage.tags.iter().map(|d| d.as_str()).collect();
        tags.sort_unstable();
        tags.dedup();
        let tags_json = serde_json::to_string(&tags)?;

        let conn = self.conn();
        let changed = conn.execute(
            r#"
            INSERT INTO passages (id, advisor_id, body, source, tags, theme, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                body = excluded.body,
                source = excluded.source,
                tags = excluded.tags,
                theme = excluded.theme,
                status = excluded.status
            WHERE passages.advisor_id = excluded.advisor_id
            "#,
            params![
                passage.id,
                passage.advisor_id,
                passage.body,
                passage.source,
                tags_json,
                passage.theme,
                passage.status.as_str(),
                now_timestamp(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::Validation(format!(
                "passage '{}' belongs to another advisor",
                passage.id
            )));
        }
        Ok(())
    }

    pub fn get_passage(&self, passage_id: &str) -> Result<Option<Passage>> {
        let conn = self.conn();
        let passage = conn
            .query_row(
                &format!("SELECT {} FROM passages WHERE id = ?", PASSAGE_COLUMNS),
                [passage_id],
                row_to_passage,
            )
            .optional()?;
        Ok(passage)
    }

    /// Approved passages sharing at least one tag with `dimensions`,
    /// most specific (fewest tags) first, then by id.
    pub fn passages_for_dimensions(
        &self,
        advisor_id: &str,
        dimensions: &[Dimension],
    ) -> Result<Vec<Passage>> {
        if dimensions.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM passages WHERE advisor_id = ? AND status = 'approved'",
            PASSAGE_COLUMNS
        ))?;
        let mut passages: Vec<Passage> = stmt
            .query_map([advisor_id], row_to_passage)?
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|p| p.tags.iter().any(|t| dimensions.contains(t)))
            .collect();

        passages.sort_by(|a, b| a.tags.len().cmp(&b.tags.len()).then_with(|| a.id.cmp(&b.id)));
        Ok(passages)
    }

    pub fn count_passages(&self, advisor_id: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM passages WHERE advisor_id = ?",
            [advisor_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage<'a>(id: &'a str, tags: &'a [Dimension], status: PassageStatus) -> NewPassage<'a> {
        NewPassage {
            id,
            advisor_id: "adams",
            body: "A good photograph is knowing where to stand.",
            source: Some("Examples"),
            tags,
            theme: None,
            status,
        }
    }

    #[test]
    fn test_filters_by_tag_and_status() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        db.save_passage(&passage(
            "p-broad",
            &[Dimension::Composition, Dimension::Lighting, Dimension::ColorHarmony],
            PassageStatus::Approved,
        ))
        .unwrap();
        db.save_passage(&passage("p-narrow", &[Dimension::Composition], PassageStatus::Approved))
            .unwrap();
        db.save_passage(&passage("p-draft", &[Dimension::Composition], PassageStatus::Pending))
            .unwrap();
        db.save_passage(&passage("p-light", &[Dimension::Lighting], PassageStatus::Approved))
            .unwrap();

        let found = db
            .passages_for_dimensions("adams", &[Dimension::Composition])
            .unwrap();
        let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["p-narrow", "p-broad"]);

        assert!(db.passages_for_dimensions("adams", &[]).unwrap().is_empty());
        assert!(db
            .passages_for_dimensions("weston", &[Dimension::Composition])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_save_replaces_by_id() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        db.save_passage(&passage("p1", &[Dimension::Lighting], PassageStatus::Pending))
            .unwrap();
        db.save_passage(&passage("p1", &[Dimension::Lighting], PassageStatus::Approved))
            .unwrap();

        let stored = db.get_passage("p1").unwrap().unwrap();
        assert_eq!(stored.status, PassageStatus::Approved);
        assert_eq!(stored.tags, vec![Dimension::Lighting]);
        assert_eq!(db.count_passages("adams").unwrap(), 1);
        assert!(db.get_passage("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_keeps_passage_with_its_advisor() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        db.save_passage(&passage("p1", &[Dimension::Lighting], PassageStatus::Approved))
            .unwrap();
        let err = db
            .save_passage(&NewPassage {
                advisor_id: "weston",
                body: "Replaced body",
                ..passage("p1", &[Dimension::Composition], PassageStatus::Approved)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let stored = db.get_passage("p1").unwrap().unwrap();
        assert_eq!(stored.advisor_id, "adams");
        assert_eq!(stored.tags, vec![Dimension::Lighting]);
        assert_eq!(db.count_passages("weston").unwrap(), 0);
    }
}
