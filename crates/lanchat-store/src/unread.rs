//! Per-user unread counters keyed by conversation.

use lanchat_shared::ConversationId;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn increment_unread(&self, username: &str, conversation: &ConversationId) -> Result<()> {
        self.conn().execute(
            "INSERT INTO unread (username, conversation, count) VALUES (?1, ?2, 1)
             ON CONFLICT(username, conversation) DO UPDATE SET count = count + 1",
            params![username, conversation.as_str()],
        )?;
        Ok(())
    }

    pub fn reset_unread(&self, username: &str, conversation: &ConversationId) -> Result<()> {
        self.conn().execute(
            "DELETE FROM unread WHERE username = ?1 AND conversation = ?2",
            params![username, conversation.as_str()],
        )?;
        Ok(())
    }

    pub fn clear_unread_for(&self, username: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM unread WHERE username = ?1", params![username])?;
        Ok(())
    }

    /// Non-zero counters for `username`, ordered by conversation id.
    pub fn unread_for(&self, username: &str) -> Result<Vec<(ConversationId, u64)>> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation, count FROM unread
             WHERE username = ?1 AND count > 0
             ORDER BY conversation ASC",
        )?;
        let rows = stmt.query_map(params![username], |row| {
            Ok((
                ConversationId::from_raw(row.get::<_, String>(0)?),
                row.get::<_, i64>(1)? as u64,
            ))
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Every non-zero counter, used to warm the in-memory tracker at startup.
    pub fn all_unread(&self) -> Result<Vec<(String, ConversationId, u64)>> {
        let mut stmt = self.conn().prepare(
            "SELECT username, conversation, count FROM unread
             WHERE count > 0
             ORDER BY username ASC, conversation ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ConversationId::from_raw(row.get::<_, String>(1)?),
                row.get::<_, i64>(2)? as u64,
            ))
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_reset() {
        let db = Database::open_in_memory().unwrap();
        let general = ConversationId::group("general");
        let dm = ConversationId::dm("alice", "bob");

        for _ in 0..3 {
            db.increment_unread("bob", &general).unwrap();
        }
        db.increment_unread("bob", &dm).unwrap();

        assert_eq!(
            db.unread_for("bob").unwrap(),
            vec![(dm.clone(), 1), (general.clone(), 3)]
        );

        db.reset_unread("bob", &general).unwrap();
        assert_eq!(db.unread_for("bob").unwrap(), vec![(dm, 1)]);

        db.clear_unread_for("bob").unwrap();
        assert!(db.unread_for("bob").unwrap().is_empty());
        assert!(db.unread_for("alice").unwrap().is_empty());
    }

    #[test]
    fn test_all_unread_lists_every_user() {
        let db = Database::open_in_memory().unwrap();
        let general = ConversationId::group("general");
        db.increment_unread("bob", &general).unwrap();
        db.increment_unread("bob", &general).unwrap();
        db.increment_unread("alice", &general).unwrap();

        assert_eq!(
            db.all_unread().unwrap(),
            vec![
                ("alice".to_string(), general.clone(), 1),
                ("bob".to_string(), general, 2),
            ]
        );
    }
}
