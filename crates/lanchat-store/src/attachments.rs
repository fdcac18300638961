//! Metadata for content-addressed attachment uploads.

use rusqlite::{params, OptionalExtension};

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::Attachment;

impl Database {
    /// Record an attachment. Returns `false` when the hash was already
    /// known, in which case the existing metadata is kept.
    pub fn insert_attachment(&self, attachment: &Attachment) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO attachments (hash, name, mime, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                attachment.hash,
                attachment.name,
                attachment.mime,
                attachment.size as i64,
                ts_to_sql(&attachment.created_at),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_attachment(&self, hash: &str) -> Result<Option<Attachment>> {
        let attachment = self
            .conn()
            .query_row(
                "SELECT hash, name, mime, size, created_at FROM attachments WHERE hash = ?1",
                params![hash],
                row_to_attachment,
            )
            .optional()?;
        Ok(attachment)
    }
}

fn row_to_attachment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attachment> {
    let created: String = row.get(4)?;
    Ok(Attachment {
        hash: row.get(0)?,
        name: row.get(1)?,
        mime: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        created_at: ts_from_sql(4, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn test_insert_is_idempotent_per_hash() {
        let db = Database::open_in_memory().unwrap();
        let first = Attachment {
            hash: "ab".repeat(32),
            name: "report.pdf".into(),
            mime: "application/pdf".into(),
            size: 1024,
            created_at: Utc::now(),
        };
        assert!(db.insert_attachment(&first).unwrap());

        let again = Attachment {
            name: "copy.pdf".into(),
            ..first.clone()
        };
        assert!(!db.insert_attachment(&again).unwrap());

        let stored = db.get_attachment(&first.hash).unwrap().unwrap();
        assert_eq!(stored.name, "report.pdf");
        assert_eq!(stored.size, 1024);
        assert!(db.get_attachment("missing").unwrap().is_none());
    }
}
