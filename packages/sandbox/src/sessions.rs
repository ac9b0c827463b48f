// ABOUTME: Session registry binding a conversation thread to its user, sandbox and lifecycle status
// ABOUTME: Enforces the session state machine with conditional updates so terminal states never change

use crate::storage::{new_session_id, SandboxStorage, Session, SessionStatus, StorageError};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Thread {0} already has a live session")]
    AlreadyActive(String),

    #[error("Session {0} is already in a terminal state")]
    AlreadyTerminated(String),

    #[error("Session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Session not found: {0}")]
    NotFound(String),
}

impl From<StorageError> for RegistryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Conflict(thread) => RegistryError::AlreadyActive(thread),
            other => RegistryError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Deterministic sandbox name for a thread
pub fn sandbox_name(thread_id: &str) -> String {
    format!("claude-sandbox-{}", thread_id.replace('_', "-"))
}

/// States a session may be in right before moving to `to`
fn allowed_sources(to: SessionStatus) -> &'static [SessionStatus] {
    match to {
        SessionStatus::Pending => &[],
        SessionStatus::Provisioning => &[SessionStatus::Pending],
        SessionStatus::Active => &[SessionStatus::Provisioning],
        SessionStatus::Terminated => &[SessionStatus::Active],
        SessionStatus::Failed => &[SessionStatus::Pending, SessionStatus::Provisioning],
    }
}

pub struct SessionRegistry {
    storage: Arc<SandboxStorage>,
}

impl SessionRegistry {
    pub fn new(storage: Arc<SandboxStorage>) -> Self {
        Self { storage }
    }

    /// Open a PENDING session for the thread
    pub async fn create(&self, user_id: &str, thread_id: &str) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: new_session_id(),
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            sandbox_name: sandbox_name(thread_id),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            terminated_at: None,
            termination_reason: None,
        };

        self.storage.insert_session(&session).await?;

        info!(
            session_id = %session.id,
            thread_id = %thread_id,
            user_id = %user_id,
            "Session created"
        );

        Ok(session)
    }

    pub async fn mark_provisioning(&self, session_id: &str) -> Result<Session> {
        self.transition(session_id, SessionStatus::Provisioning, None)
            .await
    }

    pub async fn mark_active(&self, session_id: &str) -> Result<Session> {
        self.transition(session_id, SessionStatus::Active, None).await
    }

    pub async fn mark_terminated(&self, session_id: &str, reason: Option<&str>) -> Result<Session> {
        self.transition(session_id, SessionStatus::Terminated, reason)
            .await
    }

    pub async fn mark_failed(&self, session_id: &str, reason: &str) -> Result<Session> {
        self.transition(session_id, SessionStatus::Failed, Some(reason))
            .await
    }

    pub async fn find_by_thread(&self, thread_id: &str) -> Result<Option<Session>> {
        Ok(self.storage.latest_session_for_thread(thread_id).await?)
    }

    pub async fn find_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.storage.get_session(session_id).await?)
    }

    /// Sessions holding (or about to hold) a sandbox
    pub async fn list_live(&self) -> Result<Vec<Session>> {
        Ok(self
            .storage
            .list_sessions(&[
                SessionStatus::Pending,
                SessionStatus::Provisioning,
                SessionStatus::Active,
            ])
            .await?)
    }

    pub async fn list_all(&self) -> Result<Vec<Session>> {
        Ok(self.storage.list_sessions(&[]).await?)
    }

    async fn transition(
        &self,
        session_id: &str,
        to: SessionStatus,
        reason: Option<&str>,
    ) -> Result<Session> {
        let moved = self
            .storage
            .transition_session(session_id, allowed_sources(to), to, reason)
            .await?;

        let session = self
            .storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        if moved {
            debug!(session_id, status = to.as_str(), "Session transitioned");
            return Ok(session);
        }

        if session.status.is_terminal() {
            Err(RegistryError::AlreadyTerminated(session_id.to_string()))
        } else {
            Err(RegistryError::InvalidTransition {
                id: session_id.to_string(),
                from: session.status.as_str(),
                to: to.as_str(),
            })
        }
    }
}
