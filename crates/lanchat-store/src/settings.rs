//! Key/value settings that administrators change at runtime.

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

const RETENTION_KEY: &str = "retention_days";

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Stored retention in days, `None` if never set.
    pub fn retention_days(&self) -> Result<Option<u32>> {
        Ok(self
            .get_setting(RETENTION_KEY)?
            .and_then(|v| v.parse().ok()))
    }

    pub fn set_retention_days(&self, days: u32) -> Result<()> {
        self.set_setting(RETENTION_KEY, &days.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_setting("x").unwrap(), None);
        db.set_setting("x", "1").unwrap();
        db.set_setting("x", "2").unwrap();
        assert_eq!(db.get_setting("x").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_retention_days() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.retention_days().unwrap(), None);
        db.set_retention_days(30).unwrap();
        assert_eq!(db.retention_days().unwrap(), Some(30));
    }
}
