use rusqlite::{params, OptionalExtension};

use super::{now_timestamp, Database};
use crate::error::Result;

impl Database {
    /// Record the served model name of an advisor's fine-tuned adapter.
    pub fn register_adapter(&self, advisor_id: &str, model: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO adapters (advisor_id, model, registered_at)
            VALUES (?, ?, ?)
            ON CONFLICT(advisor_id) DO UPDATE SET
                model = excluded.model,
                registered_at = excluded.registered_at
            "#,
            params![advisor_id, model, now_timestamp()],
        )?;
        Ok(())
    }

    pub fn adapter_model(&self, advisor_id: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let model = conn
            .query_row(
                "SELECT model FROM adapters WHERE advisor_id = ?",
                [advisor_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(model)
    }

    pub fn adapter_available(&self, advisor_id: &str) -> Result<bool> {
        Ok(self.adapter_model(advisor_id)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_replace() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();

        assert!(!db.adapter_available("adams").unwrap());
        db.register_adapter("adams", "adams-lora-v1").unwrap();
        db.register_adapter("adams", "adams-lora-v2").unwrap();

        assert!(db.adapter_available("adams").unwrap());
        assert_eq!(db.adapter_model("adams").unwrap().as_deref(), Some("adams-lora-v2"));
        assert!(!db.adapter_available("weston").unwrap());
    }
}
