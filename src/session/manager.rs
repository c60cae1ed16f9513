// =============================================================================
// Session Manager — lifecycle registry with a resource cap
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::{Session, SessionParams};
use crate::errors::BotError;

/// Creates, tracks, and bounds live sessions.  Workers normally own exactly
/// one session; the cap matters for the MCP tool surface where one process
/// can hold several.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Optional owner label per session (e.g. a bot id) for inspection.
    owners: RwLock<HashMap<String, String>>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
        }
    }

    /// Open a new session.  Fails when the cap is reached.
    pub async fn create_session(&self, params: SessionParams) -> Result<Arc<Session>, BotError> {
        {
            let sessions = self.sessions.read();
            if sessions.len() >= self.max_sessions {
                warn!(
                    max = self.max_sessions,
                    "session cap reached; refusing create"
                );
                return Err(BotError::Config(format!(
                    "session limit of {} reached",
                    self.max_sessions
                )));
            }
        }

        let session = Session::connect(params).await?;
        self.sessions
            .write()
            .insert(session.session_id.clone(), Arc::clone(&session));
        info!(session_id = %session.session_id, "session registered");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<Session>, BotError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| BotError::NotFound(format!("session {session_id}")))
    }

    /// Tag a session with an owner label (bot id) for later inspection.
    pub fn set_owner(&self, session_id: &str, owner: &str) {
        self.owners
            .write()
            .insert(session_id.to_string(), owner.to_string());
    }

    pub fn owner_of(&self, session_id: &str) -> Option<String> {
        self.owners.read().get(session_id).cloned()
    }

    /// Close and drop a session.  Idempotent: closing an unknown id is a
    /// no-op.
    pub async fn close_session(&self, session_id: &str) {
        let session = self.sessions.write().remove(session_id);
        self.owners.write().remove(session_id);
        if let Some(session) = session {
            session.close().await;
            info!(session_id = %session_id, "session closed and dropped");
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::rules::RuleSet;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn quiet_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn params(addr: std::net::SocketAddr) -> SessionParams {
        let mut p = SessionParams::new("127.0.0.1", addr.port());
        p.rules = RuleSet::empty("t");
        p.connect_timeout = Duration::from_secs(2);
        p
    }

    #[tokio::test]
    async fn enforces_max_sessions() {
        let addr = quiet_server().await;
        let mgr = SessionManager::new(1);

        let s1 = mgr.create_session(params(addr)).await.unwrap();
        let err = mgr.create_session(params(addr)).await.unwrap_err();
        assert!(matches!(err, BotError::Config(_)));

        // After closing, capacity frees up.
        mgr.close_session(&s1.session_id).await;
        mgr.create_session(params(addr)).await.unwrap();
    }

    #[tokio::test]
    async fn get_unknown_session_is_not_found() {
        let mgr = SessionManager::new(4);
        let err = mgr.get_session("nope").unwrap_err();
        assert!(matches!(err, BotError::NotFound(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_owner_tracked() {
        let addr = quiet_server().await;
        let mgr = SessionManager::new(4);
        let s = mgr.create_session(params(addr)).await.unwrap();
        mgr.set_owner(&s.session_id, "bot-1");
        assert_eq!(mgr.owner_of(&s.session_id).as_deref(), Some("bot-1"));

        mgr.close_session(&s.session_id).await;
        mgr.close_session(&s.session_id).await;
        assert!(mgr.is_empty());
        assert!(mgr.owner_of(&s.session_id).is_none());
    }
}
