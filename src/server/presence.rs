use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type UserId = String;
pub type ConnectionId = String;

// Outcome of binding a user to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First registration for this user.
    Registered,
    /// The user was already bound to another connection; `previous` names the
    /// displaced one.
    Replaced { previous: ConnectionId },
    /// The registration was dropped (empty user id). No entry was written.
    Rejected,
}

// Map user_id -> the single connection that can reach that user.
// One entry per user: a newer registration silently displaces the older one,
// so reconnecting clients always win over stale ones. Entries leave only via
// unregister or displacement; a client that vanishes without a disconnect
// keeps its entry until then (no timeout eviction).
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    inner: Arc<Mutex<HashMap<UserId, ConnectionId>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self { Self { inner: Arc::new(Mutex::new(HashMap::new())) } }

    // Bind user_id to connection_id; empty user ids are rejected and leave
    // the registry untouched
    pub async fn register(&self, user_id: &str, connection_id: &str) -> RegisterOutcome {
        if user_id.trim().is_empty() {
            println!("[PRESENCE] Register without a user id ignored (connection {})", connection_id);
            return RegisterOutcome::Rejected;
        }
        let mut map = self.inner.lock().await;
        match map.insert(user_id.to_string(), connection_id.to_string()) {
            Some(previous) if previous != connection_id => {
                println!("[PRESENCE] User {} moved to connection {} (was {})", user_id, connection_id, previous);
                RegisterOutcome::Replaced { previous }
            }
            Some(_) => RegisterOutcome::Registered,
            None => {
                println!("[PRESENCE] Registered user {} on connection {} (online={})", user_id, connection_id, map.len());
                RegisterOutcome::Registered
            }
        }
    }

    // Resolve a user to their active connection, if any
    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        let map = self.inner.lock().await;
        map.get(user_id).cloned()
    }

    // Reverse scan: remove the binding held by connection_id and return the
    // user it belonged to. A connection that never registered, or one already
    // displaced by a newer connection for the same user, is a no-op. The
    // displaced case matters: a stale disconnect arriving after a reconnect
    // must not evict the replacement.
    pub async fn unregister(&self, connection_id: &str) -> Option<UserId> {
        let mut map = self.inner.lock().await;
        let user_id = map
            .iter()
            .find(|(_, bound)| bound.as_str() == connection_id)
            .map(|(uid, _)| uid.clone());
        if let Some(uid) = &user_id {
            map.remove(uid);
            println!("[PRESENCE] Unregistered user {} (connection {}, online={})", uid, connection_id, map.len());
        }
        user_id
    }

    // Number of users currently bound to a connection
    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}
