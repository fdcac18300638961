//! Schema migrations, tracked through `PRAGMA user_version`.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered schema steps. The position in this list (1-based) is the
/// `user_version` a database has once the step is applied.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

pub const CURRENT_VERSION: u32 = STEPS.len() as u32;

/// Bring the schema up to [`CURRENT_VERSION`].
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{applied} is newer than this build (v{CURRENT_VERSION})"
        )));
    }

    for (version, (name, step)) in (1u32..).zip(STEPS) {
        if version <= applied {
            continue;
        }
        tracing::info!(migration = name, version, "applying schema migration");
        step(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version)?;
    }
    Ok(())
}
