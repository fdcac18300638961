//! Per-(user, conversation) unread counters.
//!
//! Counts live in memory and answer every query. When a durable store is
//! configured it gets a write-behind copy of each change, so counting never
//! waits on the database and a failing store only loses the copy.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use lanchat_shared::ConversationId;

use crate::persist::{Persistence, UnreadChange};

/// Durable copy of the counters. Implementations must not block.
pub trait UnreadStore: Send + Sync {
    fn record(&self, change: UnreadChange);
}

impl UnreadStore for Persistence {
    fn record(&self, change: UnreadChange) {
        self.record_unread(change);
    }
}

#[derive(Default)]
struct Counts {
    inner: Mutex<HashMap<String, BTreeMap<ConversationId, u64>>>,
}

impl Counts {
    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, BTreeMap<ConversationId, u64>>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

pub struct UnreadTracker {
    counts: Counts,
    store: Option<Arc<dyn UnreadStore>>,
}

impl UnreadTracker {
    pub fn in_memory() -> Self {
        Self {
            counts: Counts::default(),
            store: None,
        }
    }

    /// Counters mirrored into `store`, starting from the counts it already
    /// holds.
    pub fn durable(
        store: Arc<dyn UnreadStore>,
        seed: impl IntoIterator<Item = (String, ConversationId, u64)>,
    ) -> Self {
        let counts = Counts::default();
        counts.with(|map| {
            for (user, conversation, n) in seed {
                if n > 0 {
                    map.entry(user).or_default().insert(conversation, n);
                }
            }
        });
        Self {
            counts,
            store: Some(store),
        }
    }

    fn mirror(&self, change: UnreadChange) {
        if let Some(store) = &self.store {
            store.record(change);
        }
    }

    pub fn increment(&self, user: &str, conversation: &ConversationId) {
        self.counts.with(|map| {
            *map.entry(user.to_string())
                .or_default()
                .entry(conversation.clone())
                .or_insert(0) += 1;
        });
        self.mirror(UnreadChange::Increment {
            user: user.to_string(),
            conversation: conversation.clone(),
        });
    }

    pub fn reset(&self, user: &str, conversation: &ConversationId) {
        let had = self.counts.with(|map| {
            map.get_mut(user)
                .and_then(|per_user| per_user.remove(conversation))
                .is_some()
        });
        if had {
            self.mirror(UnreadChange::Reset {
                user: user.to_string(),
                conversation: conversation.clone(),
            });
        }
    }

    /// Non-zero counters for `user`, ordered by conversation id.
    pub fn snapshot(&self, user: &str) -> Vec<(ConversationId, u64)> {
        self.counts.with(|map| {
            map.get(user)
                .map(|per_user| {
                    per_user
                        .iter()
                        .filter(|(_, n)| **n > 0)
                        .map(|(c, n)| (c.clone(), *n))
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    pub fn forget_user(&self, user: &str) {
        self.counts.with(|map| map.remove(user));
        self.mirror(UnreadChange::Forget {
            user: user.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use lanchat_store::Database;

    use super::*;
    use crate::persist::{lock_db, SharedDb};

    fn check_monotonic(tracker: &UnreadTracker) {
        let conv = ConversationId::group("general");
        for k in 1..=5u64 {
            tracker.increment("bob", &conv);
            assert_eq!(tracker.snapshot("bob"), vec![(conv.clone(), k)]);
        }
        tracker.reset("bob", &conv);
        assert!(tracker.snapshot("bob").is_empty());
        tracker.reset("bob", &conv);
        assert!(tracker.snapshot("bob").is_empty());
    }

    fn durable() -> (UnreadTracker, Persistence, SharedDb) {
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let persist = Persistence::spawn(db.clone(), 1024);
        let tracker = UnreadTracker::durable(Arc::new(persist.clone()), Vec::new());
        (tracker, persist, db)
    }

    #[test]
    fn test_memory_counts_and_resets() {
        check_monotonic(&UnreadTracker::in_memory());
    }

    #[tokio::test]
    async fn test_durable_counts_reach_the_store() {
        let (tracker, persist, db) = durable();
        check_monotonic(&tracker);

        let dm = ConversationId::dm("alice", "bob");
        tracker.increment("bob", &dm);
        tracker.increment("bob", &dm);
        persist.flush().await;
        assert_eq!(lock_db(&db).unread_for("bob").unwrap(), vec![(dm, 2)]);

        tracker.forget_user("bob");
        persist.flush().await;
        assert!(lock_db(&db).unread_for("bob").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counting_does_not_wait_for_a_busy_store() {
        let (tracker, persist, db) = durable();
        let conv = ConversationId::group("general");
        {
            let _busy = lock_db(&db);
            tracker.increment("bob", &conv);
            tracker.increment("bob", &conv);
            assert_eq!(tracker.snapshot("bob"), vec![(conv.clone(), 2)]);
        }
        persist.flush().await;
        assert_eq!(lock_db(&db).unread_for("bob").unwrap(), vec![(conv, 2)]);
    }

    #[test]
    fn test_seed_restores_counts() {
        let conv = ConversationId::group("general");
        let db: SharedDb = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let persist = Persistence::spawn(db, 1024);
        let tracker = UnreadTracker::durable(
            Arc::new(persist),
            vec![
                ("bob".to_string(), conv.clone(), 3),
                ("alice".to_string(), conv.clone(), 0),
            ],
        );
        assert_eq!(tracker.snapshot("bob"), vec![(conv, 3)]);
        assert!(tracker.snapshot("alice").is_empty());
    }

    #[test]
    fn test_users_are_independent() {
        let tracker = UnreadTracker::in_memory();
        let dm = ConversationId::dm("alice", "bob");
        tracker.increment("bob", &dm);
        assert!(tracker.snapshot("alice").is_empty());
        tracker.forget_user("bob");
        assert!(tracker.snapshot("bob").is_empty());
    }
}
