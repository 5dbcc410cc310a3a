use crate::dimensions::Dimension;

/// Dimensions added when the canonical set grew from six to eight axes.
const ADDED_DIMENSIONS: [Dimension; 2] = [Dimension::VisualBalance, Dimension::EmotionalImpact];

const STATIC_SCHEMA: &str = r#"
-- Analysis jobs and their lifecycle
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    advisor_id TEXT NOT NULL,
    mode TEXT NOT NULL,                    -- baseline / rag / adapter / rag_adapter
    enable_retrieval INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    current_step TEXT NOT NULL DEFAULT '',
    progress_percentage INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    attempt INTEGER NOT NULL DEFAULT 0,    -- bumped on every claim
    error TEXT,
    image_path TEXT NOT NULL,
    image_sha256 TEXT NOT NULL,
    result TEXT,                           -- JSON AnalysisResult
    retrieved_profile_ids TEXT,            -- JSON array, NULL unless retrieval ran
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    last_activity TEXT NOT NULL,
    available_at TEXT NOT NULL             -- retry backoff gate
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

-- Quotable passages from advisor reference material
CREATE TABLE IF NOT EXISTS passages (
    id TEXT PRIMARY KEY,
    advisor_id TEXT NOT NULL,
    body TEXT NOT NULL,
    source TEXT,
    tags TEXT NOT NULL DEFAULT '[]',       -- JSON array of dimension keys
    theme TEXT,
    status TEXT NOT NULL DEFAULT 'pending', -- pending / approved
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_passages_advisor ON passages(advisor_id, status);

-- Advisor-scoped detectable techniques
CREATE TABLE IF NOT EXISTS techniques (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    advisor_id TEXT NOT NULL,
    name TEXT NOT NULL,
    detection_criteria TEXT NOT NULL DEFAULT '',
    dimension TEXT,                        -- dimension key the technique speaks to
    UNIQUE (advisor_id, name)
);

-- Fine-tuned adapters available per advisor
CREATE TABLE IF NOT EXISTS adapters (
    advisor_id TEXT PRIMARY KEY,
    model TEXT NOT NULL,
    registered_at TEXT NOT NULL
);
"#;

const ANNOTATION_SCHEMA: &str = r#"
-- Per reference image technique annotations
CREATE TABLE IF NOT EXISTS technique_annotations (
    profile_id INTEGER NOT NULL,
    technique_id INTEGER NOT NULL,
    strength REAL NOT NULL DEFAULT 0,
    evidence TEXT,
    region TEXT,
    PRIMARY KEY (profile_id, technique_id),
    FOREIGN KEY (profile_id) REFERENCES dimensional_profiles(id) ON DELETE CASCADE,
    FOREIGN KEY (technique_id) REFERENCES techniques(id) ON DELETE CASCADE
);
"#;

/// Column names owned by one dimension, in the order rows are read.
pub(crate) fn dimension_columns(dim: Dimension) -> [String; 3] {
    let key = dim.as_str();
    [
        format!("{}_score", key),
        format!("{}_comment", key),
        format!("{}_instructive", key),
    ]
}

fn profiles_table() -> String {
    let mut dimension_defs = String::new();
    for dim in Dimension::ALL {
        let [score, comment, instructive] = dimension_columns(dim);
        dimension_defs.push_str(&format!(
            "    {} REAL,\n    {} TEXT,\n    {} TEXT,\n",
            score, comment, instructive
        ));
    }

    format!(
        r#"
-- One reference image under one advisor
CREATE TABLE IF NOT EXISTS dimensional_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    advisor_id TEXT NOT NULL,
    image_reference TEXT NOT NULL,
    title TEXT,
    date TEXT,
    location TEXT,
    significance TEXT,
{}    visual_embedding BLOB,                 -- float32 array stored as bytes
    visual_embedding_dim INTEGER,
    text_embedding BLOB,
    text_embedding_dim INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (advisor_id, image_reference)
);

CREATE INDEX IF NOT EXISTS idx_profiles_advisor ON dimensional_profiles(advisor_id);
"#,
        dimension_defs
    )
}

pub fn schema() -> String {
    format!("{}{}{}", STATIC_SCHEMA, profiles_table(), ANNOTATION_SCHEMA)
}

/// Upgrades for databases created with the six-dimension layout.
pub fn migrations() -> Vec<String> {
    ADDED_DIMENSIONS
        .iter()
        .flat_map(|dim| {
            let [score, comment, instructive] = dimension_columns(*dim);
            vec![
                format!("ALTER TABLE dimensional_profiles ADD COLUMN {} REAL", score),
                format!("ALTER TABLE dimensional_profiles ADD COLUMN {} TEXT", comment),
                format!("ALTER TABLE dimensional_profiles ADD COLUMN {} TEXT", instructive),
            ]
        })
        .collect()
}
