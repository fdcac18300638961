//! The append-only message log.

use chrono::{DateTime, Utc};
use lanchat_shared::ConversationId;
use rusqlite::params;

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::StoredMessage;

impl Database {
    /// Append one message. Returns its row id.
    pub fn append_message(
        &self,
        conversation: &ConversationId,
        sender: &str,
        text: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO messages (conversation, sender, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation.as_str(), sender, text, ts_to_sql(&at)],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// The `limit` most recent messages of a conversation, oldest first.
    pub fn recent_messages(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, conversation, sender, body, created_at
             FROM messages
             WHERE conversation = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(
            params![conversation.as_str(), limit as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn count_messages(&self, conversation: &ConversationId) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation = ?1",
            params![conversation.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Delete every message created before `cutoff`. Returns the number of
    /// rows removed.
    pub fn prune_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE created_at < ?1",
            params![ts_to_sql(&cutoff)],
        )?;
        Ok(affected)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: i64 = row.get(0)?;
    let conversation: String = row.get(1)?;
    let sender: String = row.get(2)?;
    let text: String = row.get(3)?;
    let created_str: String = row.get(4)?;

    Ok(StoredMessage {
        id,
        conversation: ConversationId::from_raw(conversation),
        sender,
        text,
        created_at: ts_from_sql(4, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_recent_messages_are_chronological() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::group("general");
        let now = Utc::now();
        for i in 0..5 {
            db.append_message(&conv, "alice", &format!("m{i}"), now).unwrap();
        }

        let last3 = db.recent_messages(&conv, 3).unwrap();
        let texts: Vec<_> = last3.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(db.count_messages(&conv).unwrap(), 5);
    }

    #[test]
    fn test_conversations_are_separate() {
        let db = Database::open_in_memory().unwrap();
        let group = ConversationId::group("general");
        let dm = ConversationId::dm("alice", "bob");
        db.append_message(&group, "alice", "public", Utc::now()).unwrap();
        db.append_message(&dm, "alice", "private", Utc::now()).unwrap();

        let dms = db.recent_messages(&dm, 10).unwrap();
        assert_eq!(dms.len(), 1);
        assert_eq!(dms[0].text, "private");
        assert_eq!(dms[0].conversation, dm);
    }

    #[test]
    fn test_text_with_spaces_survives() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::group("general");
        db.append_message(&conv, "bob", "  spaced  out ", Utc::now()).unwrap();
        assert_eq!(db.recent_messages(&conv, 1).unwrap()[0].text, "  spaced  out ");
    }

    #[test]
    fn test_prune_before_cutoff() {
        let db = Database::open_in_memory().unwrap();
        let conv = ConversationId::group("general");
        let now = Utc::now();
        db.append_message(&conv, "a", "old", now - Duration::days(10)).unwrap();
        db.append_message(&conv, "a", "new", now).unwrap();

        let removed = db.prune_messages_before(now - Duration::days(7)).unwrap();
        assert_eq!(removed, 1);
        let left = db.recent_messages(&conv, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text, "new");
    }
}
