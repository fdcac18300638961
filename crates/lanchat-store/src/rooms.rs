//! Room definitions and their membership sets.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::database::{ts_to_sql, Database};
use crate::error::{Result, StoreError};
use crate::models::Room;

impl Database {
    // ------------------------------------------------------------------
    // Create / update
    // ------------------------------------------------------------------

    /// Insert a room or replace its name and membership set.
    pub fn upsert_room(&self, room: &Room) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "INSERT INTO rooms (id, name, restricted, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                                           restricted = excluded.restricted",
            params![
                room.id,
                room.name,
                room.members.is_some() as i32,
                ts_to_sql(&Utc::now()),
            ],
        )?;
        tx.execute("DELETE FROM room_members WHERE room_id = ?1", params![room.id])?;
        if let Some(members) = &room.members {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO room_members (room_id, username) VALUES (?1, ?2)")?;
            for member in members {
                stmt.execute(params![room.id, member])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Rename a room. Returns `false` if it does not exist.
    pub fn rename_room(&self, id: &str, name: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE rooms SET name = ?2 WHERE id = ?1",
            params![id, name],
        )?;
        Ok(affected > 0)
    }

    /// Replace the membership set. `None` opens the room to everybody.
    /// Returns `false` if the room does not exist.
    pub fn set_room_members(&self, id: &str, members: Option<&[String]>) -> Result<bool> {
        let mut room = match self.get_room(id) {
            Ok(room) => room,
            Err(StoreError::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        };
        room.members = members.map(|m| m.to_vec());
        self.upsert_room(&room)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_room(&self, id: &str) -> Result<Room> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, name, restricted FROM rooms WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()?;

        let (id, name, restricted) = row.ok_or(StoreError::NotFound)?;
        let members = if restricted {
            Some(self.room_members(&id)?)
        } else {
            None
        };
        Ok(Room { id, name, members })
    }

    /// All rooms ordered by id.
    pub fn list_rooms(&self) -> Result<Vec<Room>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM rooms ORDER BY id ASC")?;
        let ids = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut rooms = Vec::new();
        for id in ids {
            rooms.push(self.get_room(&id?)?);
        }
        Ok(rooms)
    }

    fn room_members(&self, id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT username FROM room_members WHERE room_id = ?1 ORDER BY username ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a room and its membership set. Returns `true` if it existed.
    pub fn delete_room(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM rooms WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str, members: Option<&[&str]>) -> Room {
        Room {
            id: id.into(),
            name: format!("Room {id}"),
            members: members.map(|m| m.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn test_open_and_restricted_rooms() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_room(&room("lobby", None)).unwrap();
        db.upsert_room(&room("ops", Some(&["bob", "alice"]))).unwrap();

        assert_eq!(db.get_room("lobby").unwrap().members, None);
        assert_eq!(
            db.get_room("ops").unwrap().members,
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(db.list_rooms().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_member_set_is_not_open() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_room(&room("vault", Some(&[]))).unwrap();
        assert_eq!(db.get_room("vault").unwrap().members, Some(vec![]));
    }

    #[test]
    fn test_set_members_and_reopen() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_room(&room("ops", Some(&["alice"]))).unwrap();

        assert!(db
            .set_room_members("ops", Some(&["carol".to_string()]))
            .unwrap());
        assert_eq!(
            db.get_room("ops").unwrap().members,
            Some(vec!["carol".to_string()])
        );

        assert!(db.set_room_members("ops", None).unwrap());
        assert_eq!(db.get_room("ops").unwrap().members, None);
        assert!(!db.set_room_members("missing", None).unwrap());
    }

    #[test]
    fn test_rename_and_delete() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_room(&room("ops", Some(&["alice"]))).unwrap();

        assert!(db.rename_room("ops", "Operations").unwrap());
        assert_eq!(db.get_room("ops").unwrap().name, "Operations");

        assert!(db.delete_room("ops").unwrap());
        assert!(matches!(db.get_room("ops"), Err(StoreError::NotFound)));
        assert!(!db.delete_room("ops").unwrap());
    }
}
