//! Registered users: every name that completed a join.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::{ts_from_sql, ts_to_sql, Database};
use crate::error::Result;
use crate::models::RegisteredUser;

impl Database {
    /// Record that `name` joined at `at`. The first call sets `first_seen`.
    pub fn touch_user(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let ts = ts_to_sql(&at);
        self.conn().execute(
            "INSERT INTO users (name, first_seen, last_seen) VALUES (?1, ?2, ?2)
             ON CONFLICT(name) DO UPDATE SET last_seen = excluded.last_seen",
            params![name, ts],
        )?;
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<RegisteredUser>> {
        let mut stmt = self.conn().prepare(
            "SELECT name, first_seen, last_seen FROM users ORDER BY name ASC",
        )?;
        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Remove a registration together with its unread counters and room
    /// memberships. Returns `true` if the user was registered.
    pub fn delete_user(&self, name: &str) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute("DELETE FROM users WHERE name = ?1", params![name])?;
        tx.execute("DELETE FROM unread WHERE username = ?1", params![name])?;
        tx.execute("DELETE FROM room_members WHERE username = ?1", params![name])?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredUser> {
    let name: String = row.get(0)?;
    let first: String = row.get(1)?;
    let last: String = row.get(2)?;
    Ok(RegisteredUser {
        name,
        first_seen: ts_from_sql(1, &first)?,
        last_seen: ts_from_sql(2, &last)?,
    })
}
