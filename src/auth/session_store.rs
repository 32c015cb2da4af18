//! Session storage.
//!
//! Sessions are server-side records keyed by a random 128-bit ID; the
//! cookie only ever carries the opaque ID, so a tampered token simply
//! fails to resolve. The `SessionStore` trait keeps the backend swappable;
//! the in-memory implementation suits single-node deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::assertion::AttributeBag;

/// Result type for session store operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur during session operations.
///
/// All of them mean "treat the caller as unauthenticated"; none are fatal.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired")]
    Expired,
}

/// An established application session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session ID; also the opaque cookie value.
    pub id: Uuid,

    /// Subject identifier from the assertion (NameID).
    pub subject: String,

    /// NameID format, kept for the LogoutRequest.
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// SAML SessionIndex for Single Logout.
    #[serde(default)]
    pub session_index: Option<String>,

    /// Attribute mapping copied verbatim from the assertion.
    pub attributes: AttributeBag,

    /// When the session was created.
    pub created_at: DateTime<Utc>,

    /// When the session expires. Never later than the assertion's
    /// NotOnOrAfter.
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Trait for session storage.
///
/// Implementations must be thread-safe and handle concurrent access.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session.
    async fn create_session(&self, session: Session) -> SessionResult<Uuid>;

    /// Get a session by ID.
    async fn get_session(&self, id: Uuid) -> SessionResult<Option<Session>>;

    /// Delete a session.
    async fn delete_session(&self, id: Uuid) -> SessionResult<()>;

    /// Clean up expired sessions.
    async fn cleanup(&self) -> SessionResult<()>;
}

/// Shared session store handle.
pub type SharedSessionStore = std::sync::Arc<dyn SessionStore>;

// ─────────────────────────────────────────────────────────────────────────────
// Memory Session Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory session store.
///
/// Suitable for development and single-node deployments. Sessions are lost
/// on restart and not shared across nodes.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: Session) -> SessionResult<Uuid> {
        let id = session.id;
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session);
        Ok(id)
    }

    async fn get_session(&self, id: Uuid) -> SessionResult<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id).cloned())
    }

    async fn delete_session(&self, id: Uuid) -> SessionResult<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id);
        Ok(())
    }

    async fn cleanup(&self) -> SessionResult<()> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| s.expires_at > now);
        Ok(())
    }
}
