// ABOUTME: Sandbox orchestrator driving the container platform through create, readiness, delete and list
// ABOUTME: Readiness is a fixed-interval poll with a hard deadline that also stops on cancellation

use crate::config::SandboxConfig;
use crate::providers::{
    ContainerSpec, ContainerSummary, Provider, ProviderError, SandboxPhase,
};
use crate::sessions::sandbox_name;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "claude-sandbox";
pub const THREAD_LABEL: &str = "thread-id";
pub const COMPONENT_LABEL: &str = "component";
pub const COMPONENT_LABEL_VALUE: &str = "disclaude";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Roughly thirty years, used when a requested deadline overflows `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

const WORKSPACE_DIR: &str = "/workspace";
const IDLE_LOOP: &str = "while true; do sleep 30; done";
const READINESS_PROBE: &str = "test -d /workspace";

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Failed to create sandbox {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Sandbox {name} not ready after {timeout:?}")]
    ReadinessTimeout { name: String, timeout: Duration },

    #[error("Sandbox {name} failed to become ready: {reason}")]
    ReadinessFailed { name: String, reason: String },

    #[error("Wait for sandbox {0} was cancelled")]
    Cancelled(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Reference to a sandbox resource on the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub name: String,
    pub thread_id: String,
    pub container_id: Option<String>,
}

impl SandboxHandle {
    pub fn for_thread(thread_id: &str) -> Self {
        Self {
            name: sandbox_name(thread_id),
            thread_id: thread_id.to_string(),
            container_id: None,
        }
    }
}

/// Fixed shape of every sandbox
#[derive(Debug, Clone)]
pub struct SandboxTemplate {
    pub namespace: String,
    pub image: String,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub env_vars: HashMap<String, String>,
}

impl From<&SandboxConfig> for SandboxTemplate {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            image: config.image.clone(),
            cpu_cores: config.cpu_cores,
            memory_mb: config.memory_mb,
            env_vars: config.sandbox_env(),
        }
    }
}

pub struct SandboxOrchestrator {
    provider: Arc<dyn Provider>,
    template: SandboxTemplate,
    poll_interval: Duration,
}

impl SandboxOrchestrator {
    pub fn new(provider: Arc<dyn Provider>, template: SandboxTemplate) -> Self {
        Self {
            provider,
            template,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn template(&self) -> &SandboxTemplate {
        &self.template
    }

    pub fn provider(&self) -> Arc<dyn Provider> {
        self.provider.clone()
    }

    /// Prepare the scope and image once at startup
    pub async fn ensure_namespace(&self) -> Result<()> {
        self.provider
            .ensure_namespace(&self.template.namespace)
            .await?;
        self.provider.ensure_image(&self.template.image).await?;
        info!(namespace = %self.template.namespace, "Sandbox namespace ready");
        Ok(())
    }

    fn container_spec(&self, handle: &SandboxHandle) -> ContainerSpec {
        ContainerSpec {
            name: handle.name.clone(),
            image: self.template.image.clone(),
            namespace: self.template.namespace.clone(),
            env_vars: self.template.env_vars.clone(),
            labels: HashMap::from([
                (APP_LABEL.to_string(), APP_LABEL_VALUE.to_string()),
                (THREAD_LABEL.to_string(), handle.thread_id.clone()),
                (COMPONENT_LABEL.to_string(), COMPONENT_LABEL_VALUE.to_string()),
            ]),
            cpu_cores: self.template.cpu_cores,
            memory_mb: self.template.memory_mb,
            command: vec!["/bin/sh".to_string(), "-c".to_string(), IDLE_LOOP.to_string()],
            working_dir: WORKSPACE_DIR.to_string(),
            readiness_probe: Some(READINESS_PROBE.to_string()),
        }
    }

    pub async fn create(&self, thread_id: &str) -> Result<SandboxHandle> {
        let mut handle = SandboxHandle::for_thread(thread_id);
        let spec = self.container_spec(&handle);

        let container_id = self
            .provider
            .create_container(&spec)
            .await
            .map_err(|e| OrchestratorError::CreateFailed {
                name: handle.name.clone(),
                reason: e.to_string(),
            })?;

        info!(
            sandbox = %handle.name,
            thread_id = %thread_id,
            namespace = %self.template.namespace,
            "Sandbox created"
        );

        handle.container_id = Some(container_id);
        Ok(handle)
    }

    pub async fn delete(&self, handle: &SandboxHandle) -> Result<()> {
        self.provider.remove_container(&handle.name).await?;
        info!(sandbox = %handle.name, "Sandbox deleted");
        Ok(())
    }

    pub async fn status(&self, handle: &SandboxHandle) -> Result<SandboxPhase> {
        Ok(self.provider.inspect_container(&handle.name).await?.phase)
    }

    /// Poll until the sandbox runs with every probe ready.
    /// Returns early on a terminal phase, on `timeout`, or when `cancel` fires.
    pub async fn wait_for_ready(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // timeouts past what Instant can represent never expire
        let deadline = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        let deadline = tokio::time::sleep_until(deadline);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled(handle.name.clone()));
                }
                _ = &mut deadline => {
                    return Err(OrchestratorError::ReadinessTimeout {
                        name: handle.name.clone(),
                        timeout,
                    });
                }
                _ = ticker.tick() => {}
            }

            let state = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(OrchestratorError::Cancelled(handle.name.clone()));
                }
                _ = &mut deadline => {
                    return Err(OrchestratorError::ReadinessTimeout {
                        name: handle.name.clone(),
                        timeout,
                    });
                }
                state = self.provider.inspect_container(&handle.name) => state,
            };

            let state = state.map_err(|e| OrchestratorError::ReadinessFailed {
                name: handle.name.clone(),
                reason: e.to_string(),
            })?;

            debug!(
                sandbox = %handle.name,
                phase = %state.phase,
                ready = state.ready,
                "Readiness poll"
            );

            if state.phase.is_terminal() {
                let reason = match state.message {
                    Some(msg) => format!("phase {}: {}", state.phase, msg),
                    None => format!("phase {}", state.phase),
                };
                warn!(sandbox = %handle.name, %reason, "Sandbox stopped before becoming ready");
                return Err(OrchestratorError::ReadinessFailed {
                    name: handle.name.clone(),
                    reason,
                });
            }

            if state.phase == SandboxPhase::Running && state.ready {
                info!(sandbox = %handle.name, "Sandbox ready");
                return Ok(());
            }
        }
    }

    /// Snapshot of this deployment's sandboxes
    pub async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let selector = HashMap::from([(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string())]);
        let mut sandboxes = self.provider.list_containers(&selector).await?;
        sandboxes.retain(|s| {
            s.labels
                .get(&format!("{}.scope", COMPONENT_LABEL_VALUE))
                .map_or(true, |scope| scope == &self.template.namespace)
        });
        Ok(sandboxes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    fn template() -> SandboxTemplate {
        SandboxTemplate::from(&SandboxConfig::default())
    }

    fn orchestrator(provider: Arc<MockProvider>) -> SandboxOrchestrator {
        SandboxOrchestrator::new(provider, template()).with_poll_interval(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_create_builds_labelled_idle_container() {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = orchestrator(provider.clone());

        let handle = orchestrator.create("123_456").await.unwrap();
        assert_eq!(handle.name, "claude-sandbox-123-456");
        assert!(handle.container_id.is_some());

        let spec = provider.last_spec().unwrap();
        assert_eq!(spec.labels.get(APP_LABEL).map(String::as_str), Some(APP_LABEL_VALUE));
        assert_eq!(spec.labels.get(THREAD_LABEL).map(String::as_str), Some("123_456"));
        assert_eq!(spec.cpu_cores, 1.0);
        assert_eq!(spec.memory_mb, 2048);
        assert_eq!(spec.working_dir, "/workspace");
        assert_eq!(spec.command[2], IDLE_LOOP);
    }

    #[tokio::test]
    async fn test_create_failure_maps_to_create_failed() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_create(true);
        let orchestrator = orchestrator(provider);

        let err = orchestrator.create("t1").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CreateFailed { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_ready_needs_running_and_ready() {
        let provider = Arc::new(MockProvider::new());
        provider.script_states(vec![
            (SandboxPhase::Pending, false),
            (SandboxPhase::Running, false),
            (SandboxPhase::Running, true),
        ]);
        let orchestrator = orchestrator(provider.clone());
        let handle = SandboxHandle::for_thread("t1");

        orchestrator
            .wait_for_ready(&handle, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.inspect_calls(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_ready_accepts_unbounded_timeout() {
        let provider = Arc::new(MockProvider::new());
        provider.script_states(vec![(SandboxPhase::Pending, false), (SandboxPhase::Running, true)]);
        let orchestrator = orchestrator(provider);

        orchestrator
            .wait_for_ready(
                &SandboxHandle::for_thread("t1"),
                Duration::from_secs(u64::MAX),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_ready_fails_fast_on_failed_phase() {
        let provider = Arc::new(MockProvider::new());
        provider.script_states(vec![(SandboxPhase::Failed, false)]);
        let orchestrator = orchestrator(provider);
        let handle = SandboxHandle::for_thread("t1");

        let started = std::time::Instant::now();
        let err = orchestrator
            .wait_for_ready(&handle, Duration::from_secs(30), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::ReadinessFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_for_ready_treats_succeeded_as_failure() {
        let provider = Arc::new(MockProvider::new());
        provider.script_states(vec![(SandboxPhase::Pending, false), (SandboxPhase::Succeeded, false)]);
        let orchestrator = orchestrator(provider);

        let err = orchestrator
            .wait_for_ready(
                &SandboxHandle::for_thread("t1"),
                Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ReadinessFailed { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_ready_times_out() {
        let provider = Arc::new(MockProvider::new());
        provider.script_states(vec![(SandboxPhase::Pending, false)]);
        let orchestrator = orchestrator(provider);

        let err = orchestrator
            .wait_for_ready(
                &SandboxHandle::for_thread("t1"),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_ready_stops_promptly_on_cancel() {
        let provider = Arc::new(MockProvider::new());
        provider.script_states(vec![(SandboxPhase::Pending, false)]);
        let orchestrator = SandboxOrchestrator::new(provider, template())
            .with_poll_interval(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = orchestrator
            .wait_for_ready(&SandboxHandle::for_thread("t1"), Duration::from_secs(120), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_list_filters_by_scope() {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = orchestrator(provider.clone());
        orchestrator.create("t1").await.unwrap();
        orchestrator.create("t2").await.unwrap();

        let listed = orchestrator.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.name.starts_with("claude-sandbox-")));
    }
}
