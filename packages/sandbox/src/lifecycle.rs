// ABOUTME: Lifecycle coordinator composing capacity, registry, orchestrator and executor
// ABOUTME: Owns the start rollback policy, the shared teardown sequence and per-session exec serialization

use crate::auth::{Action, AuthError, AuthorizationService};
use crate::capacity::CapacityLedger;
use crate::config::SandboxConfig;
use crate::executor::{CommandExecutor, ExecutorError};
use crate::orchestrator::{
    OrchestratorError, SandboxHandle, SandboxOrchestrator, SandboxTemplate,
};
use crate::providers::{ContainerSummary, Provider, SandboxPhase};
use crate::sessions::{RegistryError, SessionRegistry};
use crate::storage::{
    new_sandbox_id, CapacityUsage, SandboxRecord, SandboxStatus, SandboxStorage, Session,
    SessionStatus, StorageError,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Sandboxes listed in a status report
pub const STATUS_SANDBOX_LIMIT: usize = 10;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Sandbox capacity reached ({current}/{max})")]
    CapacityExceeded { current: i64, max: i64 },

    #[error("Thread {0} already has an active session")]
    AlreadyActive(String),

    #[error("Sandbox creation failed: {0}")]
    CreateFailed(String),

    #[error("Sandbox not ready after {0:?}")]
    ReadinessTimeout(Duration),

    #[error("Sandbox failed to become ready: {0}")]
    ReadinessFailed(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Command rejected: matches blocked pattern '{0}'")]
    DangerousCommandRejected(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Session {0} is already terminated")]
    AlreadyTerminated(String),

    #[error("Session {id} is {status}, not active")]
    NotActive { id: String, status: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    /// Text shown to the chat user
    pub fn user_message(&self) -> String {
        match self {
            Self::CapacityExceeded { current, max } => format!(
                "All sandboxes are in use ({}/{}). Close an existing session or try again later.",
                current, max
            ),
            Self::AlreadyActive(_) => "This thread already has an active session.".to_string(),
            Self::CreateFailed(reason) => format!("Failed to create the sandbox: {}", reason),
            Self::ReadinessTimeout(timeout) => format!(
                "The sandbox did not become ready within {} seconds.",
                timeout.as_secs()
            ),
            Self::ReadinessFailed(reason) => {
                format!("The sandbox failed to start: {}", reason)
            }
            Self::Cancelled => "The service is shutting down; the request was cancelled.".to_string(),
            Self::ExecutionFailed(_) => "Failed to communicate with Claude Code.".to_string(),
            Self::DangerousCommandRejected(pattern) => format!(
                "This command is blocked for safety reasons (matched `{}`).",
                pattern
            ),
            Self::NotFound(_) => "There is no active session in this thread.".to_string(),
            Self::Unauthorized(reason) => format!("Permission denied: {}", reason),
            Self::AlreadyTerminated(_) => "This session has already ended.".to_string(),
            Self::NotActive { status, .. } => {
                format!("This session is not active (status: {}).", status)
            }
            Self::Storage(_) => "An internal error occurred. Please try again.".to_string(),
        }
    }
}

impl From<RegistryError> for LifecycleError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Storage(e) => Self::Storage(e),
            RegistryError::AlreadyActive(thread) => Self::AlreadyActive(thread),
            RegistryError::AlreadyTerminated(id) => Self::AlreadyTerminated(id),
            RegistryError::InvalidTransition { id, from, .. } => Self::NotActive {
                id,
                status: from.to_string(),
            },
            RegistryError::NotFound(id) => Self::NotFound(id),
        }
    }
}

impl From<AuthError> for LifecycleError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Storage(e) => Self::Storage(e),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl From<ExecutorError> for LifecycleError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::DangerousCommandRejected(pattern) => {
                Self::DangerousCommandRejected(pattern)
            }
            other => Self::ExecutionFailed(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for LifecycleError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::CreateFailed { reason, .. } => Self::CreateFailed(reason),
            OrchestratorError::ReadinessTimeout { timeout, .. } => Self::ReadinessTimeout(timeout),
            OrchestratorError::ReadinessFailed { reason, .. } => Self::ReadinessFailed(reason),
            OrchestratorError::Cancelled(_) => Self::Cancelled,
            OrchestratorError::Provider(e) => Self::ReadinessFailed(e.to_string()),
        }
    }
}

/// Outcome of a close or forced termination; `warnings` lists non-fatal teardown failures
#[derive(Debug, Clone)]
pub struct TeardownReport {
    pub session: Session,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session: Session,
    pub sandbox: Option<SandboxRecord>,
    pub phase: Option<SandboxPhase>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub usage: CapacityUsage,
    /// Live session of the asking thread, if any
    pub session: Option<Session>,
    pub sandboxes: Vec<ContainerSummary>,
    pub total_sandboxes: usize,
    pub list_error: Option<String>,
}

pub struct LifecycleCoordinator {
    storage: Arc<SandboxStorage>,
    ledger: CapacityLedger,
    registry: SessionRegistry,
    orchestrator: SandboxOrchestrator,
    executor: CommandExecutor,
    auth: Arc<dyn AuthorizationService>,
    readiness_timeout: Duration,
    exec_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl LifecycleCoordinator {
    pub fn new(
        storage: Arc<SandboxStorage>,
        provider: Arc<dyn Provider>,
        auth: Arc<dyn AuthorizationService>,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            ledger: CapacityLedger::new(storage.clone()),
            registry: SessionRegistry::new(storage.clone()),
            orchestrator: SandboxOrchestrator::new(provider.clone(), SandboxTemplate::from(config)),
            executor: CommandExecutor::new(provider, config.exec_timeout),
            storage,
            auth,
            readiness_timeout: config.readiness_timeout,
            exec_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.orchestrator = self.orchestrator.with_poll_interval(interval);
        self
    }

    pub fn ledger(&self) -> &CapacityLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn orchestrator(&self) -> &SandboxOrchestrator {
        &self.orchestrator
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    /// Create a sandbox for the thread and wait until it is usable
    pub async fn start_session(&self, user_id: &str, thread_id: &str) -> Result<Session> {
        self.auth
            .validate_action(user_id, Action::CreateSession)
            .await?;

        if let Some(existing) = self.registry.find_by_thread(thread_id).await? {
            if !existing.status.is_terminal() {
                return Err(LifecycleError::AlreadyActive(thread_id.to_string()));
            }
        }

        if !self.ledger.acquire_slot().await? {
            let usage = self.ledger.usage().await?;
            info!(
                thread_id = %thread_id,
                current = usage.current,
                max = usage.max,
                "Sandbox request rejected at capacity"
            );
            return Err(LifecycleError::CapacityExceeded {
                current: usage.current,
                max: usage.max,
            });
        }

        let session = match self.registry.create(user_id, thread_id).await {
            Ok(session) => session,
            Err(e) => {
                self.ledger.release_slot().await;
                return Err(e.into());
            }
        };

        let template = self.orchestrator.template();
        let now = Utc::now();
        let record = SandboxRecord {
            id: new_sandbox_id(),
            session_id: session.id.clone(),
            name: session.sandbox_name.clone(),
            namespace: template.namespace.clone(),
            cpu_cores: template.cpu_cores,
            memory_mb: template.memory_mb as i64,
            container_id: None,
            status: SandboxStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.storage.insert_sandbox(&record).await {
            self.rollback(&session, None, &e.to_string()).await;
            return Err(e.into());
        }

        let handle = match self.orchestrator.create(thread_id).await {
            Ok(handle) => handle,
            Err(e) => {
                let e = LifecycleError::from(e);
                self.rollback(&session, Some(&record.id), &e.to_string())
                    .await;
                return Err(e);
            }
        };

        let persisted = async {
            self.registry.mark_provisioning(&session.id).await?;
            self.storage
                .update_sandbox_status(
                    &record.id,
                    SandboxStatus::Pending,
                    handle.container_id.as_deref(),
                )
                .await?;
            Ok::<_, LifecycleError>(())
        };
        if let Err(e) = persisted.await {
            // resource exists but the ledger could not record it; keep the slot
            error!(
                session_id = %session.id,
                sandbox = %handle.name,
                error = %e,
                "Sandbox created but provisioning state not persisted; needs reconciliation"
            );
            return Err(e);
        }

        if let Err(e) = self
            .orchestrator
            .wait_for_ready(&handle, self.readiness_timeout, &self.shutdown)
            .await
        {
            let e = LifecycleError::from(e);
            self.rollback(&session, Some(&record.id), &e.to_string())
                .await;
            return Err(e);
        }

        let session = match self.registry.mark_active(&session.id).await {
            Ok(session) => session,
            Err(e) => {
                let e = LifecycleError::from(e);
                self.rollback(&session, Some(&record.id), &e.to_string())
                    .await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .storage
            .update_sandbox_status(&record.id, SandboxStatus::Running, None)
            .await
        {
            warn!(sandbox = %handle.name, error = %e, "Failed to mark sandbox record running");
        }

        info!(
            session_id = %session.id,
            thread_id = %thread_id,
            sandbox = %handle.name,
            "Session started"
        );

        Ok(session)
    }

    /// Undo a start that got past admission. Every step is best effort.
    async fn rollback(&self, session: &Session, record_id: Option<&str>, reason: &str) {
        warn!(session_id = %session.id, %reason, "Rolling back session start");

        if let Err(e) = self.registry.mark_failed(&session.id, reason).await {
            warn!(session_id = %session.id, error = %e, "Failed to mark session failed");
        }

        if let Some(record_id) = record_id {
            if let Err(e) = self
                .storage
                .update_sandbox_status(record_id, SandboxStatus::Failed, None)
                .await
            {
                warn!(session_id = %session.id, error = %e, "Failed to mark sandbox record failed");
            }

            let handle = SandboxHandle::for_thread(&session.thread_id);
            if let Err(e) = self.orchestrator.delete(&handle).await {
                warn!(sandbox = %handle.name, error = %e, "Failed to delete partial sandbox");
            }
        }

        self.ledger.release_slot().await;
    }

    /// Close a session on behalf of `requester`
    pub async fn close_session(&self, requester: &str, session_id: &str) -> Result<TeardownReport> {
        let session = self
            .registry
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(session_id.to_string()))?;
        self.close_resolved(requester, session).await
    }

    /// Close the live session of a thread
    pub async fn close_thread(&self, requester: &str, thread_id: &str) -> Result<TeardownReport> {
        let session = self
            .registry
            .find_by_thread(thread_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(thread_id.to_string()))?;
        self.close_resolved(requester, session).await
    }

    async fn close_resolved(&self, requester: &str, session: Session) -> Result<TeardownReport> {
        self.auth
            .validate_action(requester, Action::CloseSession)
            .await?;
        if !self
            .auth
            .can_manage_session(requester, &session.user_id)
            .await?
        {
            return Err(LifecycleError::Unauthorized(
                "only the session owner or an owner may close this session".to_string(),
            ));
        }

        match session.status {
            SessionStatus::Active => self.teardown(session, None).await,
            status if status.is_terminal() => Err(LifecycleError::AlreadyTerminated(session.id)),
            status => Err(LifecycleError::NotActive {
                id: session.id,
                status: status.as_str().to_string(),
            }),
        }
    }

    /// Administrative teardown without an ownership check. `reason` is kept for audit.
    pub async fn force_terminate(&self, session_id: &str, reason: &str) -> Result<TeardownReport> {
        let session = self
            .registry
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Active {
            return Err(LifecycleError::NotActive {
                id: session.id,
                status: session.status.as_str().to_string(),
            });
        }

        warn!(session_id = %session.id, %reason, "Force terminating session");
        self.teardown(session, Some(reason)).await
    }

    async fn teardown(&self, session: Session, reason: Option<&str>) -> Result<TeardownReport> {
        let mut warnings = Vec::new();
        let handle = SandboxHandle::for_thread(&session.thread_id);

        if let Err(e) = self.orchestrator.delete(&handle).await {
            let msg = format!("Failed to delete sandbox {}: {}", handle.name, e);
            warn!(session_id = %session.id, "{}", msg);
            warnings.push(msg);
        }

        // only the caller that wins this update releases the slot
        let terminated = match self.registry.mark_terminated(&session.id, reason).await {
            Ok(terminated) => terminated,
            Err(RegistryError::Storage(e)) => {
                let msg = format!("Failed to mark session terminated: {}", e);
                error!(session_id = %session.id, sandbox = %handle.name, "{}", msg);
                warnings.push(msg);
                session.clone()
            }
            Err(e) => return Err(e.into()),
        };

        match self.storage.sandbox_for_session(&session.id).await {
            Ok(Some(record)) => {
                if let Err(e) = self
                    .storage
                    .update_sandbox_status(&record.id, SandboxStatus::Terminated, None)
                    .await
                {
                    let msg = format!("Failed to mark sandbox record terminated: {}", e);
                    warn!(session_id = %session.id, "{}", msg);
                    warnings.push(msg);
                }
            }
            Ok(None) => {}
            Err(e) => {
                let msg = format!("Failed to load sandbox record: {}", e);
                warn!(session_id = %session.id, "{}", msg);
                warnings.push(msg);
            }
        }

        if let Some(msg) = self.ledger.release_slot().await {
            warnings.push(msg);
        }

        self.exec_locks.lock().await.remove(&session.id);

        info!(
            session_id = %session.id,
            thread_id = %session.thread_id,
            sandbox = %handle.name,
            warnings = warnings.len(),
            "Session terminated"
        );

        Ok(TeardownReport {
            session: terminated,
            warnings,
        })
    }

    /// Forward a thread message to the assistant in that thread's sandbox
    pub async fn route_message(&self, thread_id: &str, sender_id: &str, content: &str) -> Result<String> {
        let session = self
            .registry
            .find_by_thread(thread_id)
            .await?
            .filter(Session::is_active)
            .ok_or_else(|| LifecycleError::NotFound(thread_id.to_string()))?;

        if !self
            .auth
            .can_manage_session(sender_id, &session.user_id)
            .await?
        {
            return Err(LifecycleError::Unauthorized(
                "you are not allowed to use this session".to_string(),
            ));
        }

        let lock = self.exec_lock(&session.id).await;
        let _guard = lock.lock().await;

        // a teardown may have landed while this request waited for the lock
        let still_active = self
            .registry
            .find_by_id(&session.id)
            .await?
            .is_some_and(|s| s.is_active());
        if !still_active {
            self.exec_locks.lock().await.remove(&session.id);
            return Err(LifecycleError::NotFound(thread_id.to_string()));
        }

        let handle = SandboxHandle::for_thread(thread_id);
        Ok(self.executor.send_message(&handle, content).await?)
    }

    async fn exec_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.exec_locks
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn session_info(&self, thread_id: &str) -> Result<Option<SessionInfo>> {
        let Some(session) = self.registry.find_by_thread(thread_id).await? else {
            return Ok(None);
        };

        let sandbox = self.storage.sandbox_for_session(&session.id).await?;
        let phase = if session.is_active() {
            self.orchestrator
                .status(&SandboxHandle::for_thread(thread_id))
                .await
                .ok()
        } else {
            None
        };

        Ok(Some(SessionInfo {
            session,
            sandbox,
            phase,
        }))
    }

    pub async fn status_report(&self, thread_id: Option<&str>) -> Result<StatusReport> {
        let usage = self.ledger.usage().await?;

        let session = match thread_id {
            Some(thread) => self
                .registry
                .find_by_thread(thread)
                .await?
                .filter(|s| !s.status.is_terminal()),
            None => None,
        };

        let (sandboxes, total_sandboxes, list_error) = match self.orchestrator.list().await {
            Ok(mut listed) => {
                let total = listed.len();
                listed.truncate(STATUS_SANDBOX_LIMIT);
                (listed, total, None)
            }
            Err(e) => {
                warn!(error = %e, "Failed to list sandboxes");
                (Vec::new(), 0, Some(e.to_string()))
            }
        };

        Ok(StatusReport {
            usage,
            session,
            sandboxes,
            total_sandboxes,
            list_error,
        })
    }

    /// Cancel in-flight readiness waits; their starts roll back
    pub fn shutdown(&self) {
        info!("Lifecycle coordinator shutting down");
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Requester, UserDirectory};
    use crate::testing::MockProvider;
    use pretty_assertions::assert_eq;

    struct Harness {
        storage: Arc<SandboxStorage>,
        provider: Arc<MockProvider>,
        coordinator: Arc<LifecycleCoordinator>,
    }

    async fn harness(max: i64) -> Harness {
        let storage = Arc::new(SandboxStorage::connect("sqlite::memory:").await.unwrap());
        let directory = UserDirectory::new(storage.clone());
        directory.initialize_user("owner", "Olive", true).await.unwrap();
        for user in ["alice", "bob"] {
            directory.add_user(Requester::Console, user, user).await.unwrap();
        }

        let provider = Arc::new(MockProvider::new());
        let config = SandboxConfig {
            readiness_timeout: Duration::from_secs(5),
            ..SandboxConfig::default()
        };
        let coordinator =
            LifecycleCoordinator::new(storage.clone(), provider.clone(), Arc::new(directory), &config)
                .with_poll_interval(Duration::from_millis(10));
        coordinator.ledger().set_maximum(max).await.unwrap();

        Harness {
            storage,
            provider,
            coordinator: Arc::new(coordinator),
        }
    }

    #[tokio::test]
    async fn test_start_session_happy_path() {
        let h = harness(3).await;

        let session = h.coordinator.start_session("alice", "t_1").await.unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.sandbox_name, "claude-sandbox-t-1");
        assert_eq!(h.provider.container_names(), vec!["claude-sandbox-t-1"]);

        let record = h.storage.sandbox_for_session(&session.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Running);
        assert_eq!(record.container_id.as_deref(), Some("mock-claude-sandbox-t-1"));
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 1);
    }

    #[tokio::test]
    async fn test_fourth_start_rejected_without_side_effects() {
        let h = harness(3).await;
        for thread in ["t1", "t2", "t3"] {
            h.coordinator.start_session("alice", thread).await.unwrap();
        }
        let creates = h.provider.create_calls();
        let records = h.storage.list_sandboxes(None).await.unwrap().len();

        let err = h.coordinator.start_session("bob", "t4").await.unwrap_err();

        assert!(matches!(err, LifecycleError::CapacityExceeded { current: 3, max: 3 }));
        assert_eq!(h.provider.create_calls(), creates);
        assert_eq!(h.storage.list_sandboxes(None).await.unwrap().len(), records);
        assert!(h.coordinator.registry().find_by_thread("t4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_user_cannot_start() {
        let h = harness(3).await;
        let err = h.coordinator.start_session("stranger", "t1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Unauthorized(_)));
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_second_start_in_same_thread_is_rejected() {
        let h = harness(3).await;
        h.coordinator.start_session("alice", "t1").await.unwrap();

        let err = h.coordinator.start_session("alice", "t1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyActive(_)));
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 1);
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back() {
        let h = harness(3).await;
        h.provider.fail_create(true);

        let err = h.coordinator.start_session("alice", "t1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::CreateFailed(_)));

        let session = h.coordinator.registry().find_by_thread("t1").await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        let record = h.storage.sandbox_for_session(&session.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Failed);
        assert_eq!(h.provider.remove_calls(), 1);
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_readiness_failure_rolls_back_without_waiting_for_timeout() {
        let h = harness(3).await;
        h.provider
            .script_states(vec![(SandboxPhase::Pending, false), (SandboxPhase::Failed, false)]);

        let started = std::time::Instant::now();
        let err = h.coordinator.start_session("alice", "t1").await.unwrap_err();

        assert!(matches!(err, LifecycleError::ReadinessFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(h.provider.container_names().is_empty());
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);

        // the thread can start over once the failed session is terminal
        h.provider.script_states(vec![(SandboxPhase::Running, true)]);
        h.coordinator.start_session("alice", "t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_start() {
        let h = harness(3).await;
        h.provider.script_states(vec![(SandboxPhase::Pending, false)]);

        let coordinator = h.coordinator.clone();
        let start = tokio::spawn(async move { coordinator.start_session("alice", "t1").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.coordinator.shutdown();

        let err = start.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Cancelled));
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
        assert!(h.provider.container_names().is_empty());
    }

    #[tokio::test]
    async fn test_close_session_tears_down() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();

        let report = h.coordinator.close_session("alice", &session.id).await.unwrap();

        assert!(report.warnings.is_empty());
        assert_eq!(report.session.status, SessionStatus::Terminated);
        assert!(h.provider.container_names().is_empty());
        let record = h.storage.sandbox_for_session(&session.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Terminated);
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_close_terminated_session_is_noop() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();
        h.coordinator.close_session("alice", &session.id).await.unwrap();
        let removes = h.provider.remove_calls();

        let err = h.coordinator.close_session("alice", &session.id).await.unwrap_err();

        assert!(matches!(err, LifecycleError::AlreadyTerminated(_)));
        assert_eq!(h.provider.remove_calls(), removes);
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_close_requires_ownership() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();

        let err = h.coordinator.close_thread("bob", "t1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Unauthorized(_)));

        // owners may close anyone's session
        h.coordinator.close_thread("owner", "t1").await.unwrap();
        let stored = h.coordinator.registry().find_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_delete_failure_becomes_warning() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();
        h.provider.fail_remove(true);

        let report = h.coordinator.close_session("alice", &session.id).await.unwrap();

        assert_eq!(report.session.status, SessionStatus::Terminated);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("claude-sandbox-t1"));
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
    }

    #[tokio::test]
    async fn test_session_write_failure_still_releases_slot() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();
        sqlx::query(
            r#"
            CREATE TRIGGER reject_termination BEFORE UPDATE ON sessions
            WHEN NEW.status = 'terminated'
            BEGIN SELECT RAISE(ABORT, 'disk full'); END
            "#,
        )
        .execute(h.storage.pool())
        .await
        .unwrap();

        let report = h.coordinator.close_session("alice", &session.id).await.unwrap();

        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("disk full"));
        assert!(h.provider.container_names().is_empty());
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 0);
        let record = h.storage.sandbox_for_session(&session.id).await.unwrap().unwrap();
        assert_eq!(record.status, SandboxStatus::Terminated);
        assert!(h.coordinator.exec_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_terminate_records_reason() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();

        let report = h
            .coordinator
            .force_terminate(&session.id, "abuse report")
            .await
            .unwrap();

        assert_eq!(report.session.termination_reason.as_deref(), Some("abuse report"));
        assert!(matches!(
            h.coordinator.force_terminate(&session.id, "again").await,
            Err(LifecycleError::NotActive { .. })
        ));
        assert!(matches!(
            h.coordinator.force_terminate("ses_missing", "x").await,
            Err(LifecycleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_close_and_force_release_once() {
        let h = harness(3).await;
        let keep = h.coordinator.start_session("bob", "t0").await.unwrap();
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 2);

        let (a, b) = {
            let c1 = h.coordinator.clone();
            let c2 = h.coordinator.clone();
            let id1 = session.id.clone();
            let id2 = session.id.clone();
            tokio::join!(
                tokio::spawn(async move { c1.close_session("alice", &id1).await }),
                tokio::spawn(async move { c2.force_terminate(&id2, "admin").await }),
            )
        };

        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(h.coordinator.ledger().usage().await.unwrap().current, 1);
        assert!(h.coordinator.registry().find_by_id(&keep.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn test_route_waiting_on_lock_sees_teardown() {
        let h = harness(3).await;
        let session = h.coordinator.start_session("alice", "t1").await.unwrap();

        let lock = h.coordinator.exec_lock(&session.id).await;
        let guard = lock.lock().await;

        let routed = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.route_message("t1", "alice", "hi").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.coordinator.close_session("alice", &session.id).await.unwrap();
        drop(guard);

        let err = routed.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
        assert_eq!(h.provider.exec_calls(), 0);
        assert!(h.coordinator.exec_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_route_message_runs_in_sandbox() {
        let h = harness(3).await;
        h.coordinator.start_session("alice", "t1").await.unwrap();
        h.provider.set_exec_output("Hello from Claude\n", "");

        let reply = h.coordinator.route_message("t1", "alice", "hi").await.unwrap();

        assert_eq!(reply, "Hello from Claude");
        assert_eq!(h.provider.exec_inputs(), vec!["echo 'hi' | claude\nexit\n".to_string()]);
    }

    #[tokio::test]
    async fn test_route_message_rejects_dangerous_input_before_platform() {
        let h = harness(3).await;
        h.coordinator.start_session("alice", "t1").await.unwrap();
        let calls = h.provider.platform_calls();

        let err = h
            .coordinator
            .route_message("t1", "alice", "  RM -RF /  ")
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::DangerousCommandRejected(_)));
        assert_eq!(h.provider.platform_calls(), calls);
    }

    #[tokio::test]
    async fn test_route_message_checks_session_and_sender() {
        let h = harness(3).await;
        assert!(matches!(
            h.coordinator.route_message("t1", "alice", "hi").await,
            Err(LifecycleError::NotFound(_))
        ));

        h.coordinator.start_session("alice", "t1").await.unwrap();
        assert!(matches!(
            h.coordinator.route_message("t1", "bob", "hi").await,
            Err(LifecycleError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_in_one_session_are_serialized() {
        let h = harness(3).await;
        h.coordinator.start_session("alice", "t1").await.unwrap();
        h.provider.set_exec_delay(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let c1 = h.coordinator.clone();
        let c2 = h.coordinator.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { c1.route_message("t1", "alice", "one").await }),
            tokio::spawn(async move { c2.route_message("t1", "alice", "two").await }),
        );
        a.unwrap().unwrap();
        b.unwrap().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_status_report_and_info() {
        let h = harness(3).await;
        h.coordinator.start_session("alice", "t1").await.unwrap();
        h.coordinator.start_session("bob", "t2").await.unwrap();

        let report = h.coordinator.status_report(Some("t1")).await.unwrap();
        assert_eq!(report.usage, CapacityUsage { current: 2, max: 3 });
        assert_eq!(report.total_sandboxes, 2);
        assert_eq!(report.session.unwrap().thread_id, "t1");
        assert!(report.list_error.is_none());

        let info = h.coordinator.session_info("t1").await.unwrap().unwrap();
        assert_eq!(info.phase, Some(SandboxPhase::Running));
        assert!(info.sandbox.is_some());
        assert!(h.coordinator.session_info("nope").await.unwrap().is_none());
    }
}
