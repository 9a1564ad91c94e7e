use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use chatscan_common::{ChatScanError, Result};

use crate::page::ChatPage;

struct SessionSlot {
    page: Arc<dyn ChatPage>,
    lock: Arc<Mutex<()>>,
}

/// Browser pages keyed by session id. One discovery run per session at a
/// time; runs on different sessions proceed independently.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the page behind `session_id`.
    pub async fn register(&self, session_id: impl Into<String>, page: Arc<dyn ChatPage>) {
        let session_id = session_id.into();
        info!(session = session_id.as_str(), "Session registered");
        self.sessions.lock().await.insert(
            session_id,
            SessionSlot {
                page,
                lock: Arc::new(Mutex::new(())),
            },
        );
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Wait for exclusive use of a session's page.
    pub async fn lease(&self, session_id: &str) -> Result<SessionLease> {
        let (page, lock) = {
            let sessions = self.sessions.lock().await;
            let slot = sessions
                .get(session_id)
                .ok_or_else(|| ChatScanError::UnknownSession(session_id.to_string()))?;
            (slot.page.clone(), slot.lock.clone())
        };
        let guard = lock.lock_owned().await;
        Ok(SessionLease { page, _guard: guard })
    }
}

/// Exclusive hold on a session; released on drop.
pub struct SessionLease {
    page: Arc<dyn ChatPage>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn page(&self) -> Arc<dyn ChatPage> {
        self.page.clone()
    }
}
