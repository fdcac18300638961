use serde::{Deserialize, Serialize};

/// Canonical key under which history and unread counts are stored.
///
/// Room chat maps to `group:<room>`. Direct messages map to
/// `dm:<a>:<b>` with the pair sorted, so both participants resolve to the
/// same id whoever started the conversation. `%` and `:` inside a name are
/// percent-escaped so every pair maps to a distinct id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn group(room: &str) -> Self {
        Self(format!("group:{room}"))
    }

    pub fn dm(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("dm:{}:{}", escape(lo), escape(hi)))
    }

    /// Wrap an id read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dm(&self) -> bool {
        self.0.starts_with("dm:")
    }

    /// Returns `true` if `user` is one of the two DM participants.
    pub fn involves(&self, user: &str) -> bool {
        match self.0.strip_prefix("dm:") {
            Some(pair) => {
                let user = escape(user);
                pair.split(':').any(|p| p == user)
            }
            None => false,
        }
    }
}

fn escape(name: &str) -> String {
    name.replace('%', "%25").replace(':', "%3A")
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dm_id_is_symmetric() {
        for (a, b) in [("C01", "C03"), ("alice", "bob"), ("z", "a"), ("same", "same")] {
            assert_eq!(ConversationId::dm(a, b), ConversationId::dm(b, a));
        }
        assert_eq!(ConversationId::dm("bob", "alice").as_str(), "dm:alice:bob");
    }

    #[test]
    fn test_group_id() {
        let id = ConversationId::group("general");
        assert_eq!(id.to_string(), "group:general");
        assert!(!id.is_dm());
    }

    #[test]
    fn test_involves() {
        let id = ConversationId::dm("alice", "bob");
        assert!(id.involves("alice"));
        assert!(id.involves("bob"));
        assert!(!id.involves("carol"));
        assert!(!ConversationId::group("alice").involves("alice"));
    }

    #[test]
    fn test_colon_in_name_does_not_collide() {
        let private = ConversationId::dm("a", "b:c");
        let other = ConversationId::dm("c", "a:b");
        assert_ne!(private, other);
        assert_eq!(private.as_str(), "dm:a:b%3Ac");
        assert!(private.involves("b:c"));
        assert!(!private.involves("c"));
        assert!(!private.involves("b"));

        assert_ne!(ConversationId::dm("x%3Ay", "z"), ConversationId::dm("x:y", "z"));
    }
}
