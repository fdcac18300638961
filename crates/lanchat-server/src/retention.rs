//! Message retention: an adjustable age limit and the sweeper that applies it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lanchat_store::StoreError;
use tracing::{debug, info, warn};

use crate::persist::{lock_db, SharedDb};

/// How often the sweeper wakes up.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Current retention in days. Zero keeps history forever.
#[derive(Debug, Default)]
pub struct RetentionPolicy {
    days: AtomicU32,
}

impl RetentionPolicy {
    pub fn new(days: u32) -> Self {
        Self {
            days: AtomicU32::new(days),
        }
    }

    /// The stored setting wins over the configured default.
    pub fn load(db: &SharedDb, configured: u32) -> Self {
        match lock_db(db).retention_days() {
            Ok(Some(days)) => Self::new(days),
            Ok(None) => Self::new(configured),
            Err(e) => {
                warn!(error = %e, "could not read retention setting, using configured value");
                Self::new(configured)
            }
        }
    }

    pub fn days(&self) -> u32 {
        self.days.load(Ordering::Relaxed)
    }

    pub fn set(&self, days: u32) {
        self.days.store(days, Ordering::Relaxed);
    }
}

/// Delete messages older than `days`. Returns how many rows went.
pub fn prune_once(db: &SharedDb, days: u32) -> Result<usize, StoreError> {
    if days == 0 {
        return Ok(0);
    }
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let removed = lock_db(db).prune_messages_before(cutoff)?;
    if removed > 0 {
        info!(removed, days, "pruned expired messages");
    }
    Ok(removed)
}

/// Run [`prune_once`] off the async runtime.
pub async fn prune_blocking(db: SharedDb, days: u32) -> Result<usize, StoreError> {
    tokio::task::spawn_blocking(move || prune_once(&db, days))
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

/// Background task applying the policy every [`SWEEP_INTERVAL`].
pub fn spawn_sweeper(db: SharedDb, policy: Arc<RetentionPolicy>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let days = policy.days();
            debug!(days, "retention sweep");
            if let Err(e) = prune_blocking(db.clone(), days).await {
                warn!(error = %e, "retention sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use lanchat_shared::ConversationId;
    use lanchat_store::Database;

    use super::*;

    fn db() -> SharedDb {
        Arc::new(Mutex::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_prune_respects_age() {
        let db = db();
        let conv = ConversationId::group("general");
        {
            let guard = lock_db(&db);
            guard
                .append_message(&conv, "alice", "old", Utc::now() - chrono::Duration::days(10))
                .unwrap();
            guard.append_message(&conv, "alice", "new", Utc::now()).unwrap();
        }

        assert_eq!(prune_once(&db, 0).unwrap(), 0);
        assert_eq!(prune_once(&db, 30).unwrap(), 0);
        assert_eq!(prune_once(&db, 7).unwrap(), 1);

        let left = lock_db(&db).recent_messages(&conv, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text, "new");
    }

    #[test]
    fn test_stored_setting_wins() {
        let db = db();
        assert_eq!(RetentionPolicy::load(&db, 5).days(), 5);
        lock_db(&db).set_retention_days(9).unwrap();
        let policy = RetentionPolicy::load(&db, 5);
        assert_eq!(policy.days(), 9);
        policy.set(0);
        assert_eq!(policy.days(), 0);
    }
}
