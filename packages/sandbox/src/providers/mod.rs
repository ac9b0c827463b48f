// ABOUTME: Container platform trait consumed by the orchestrator and executor
// ABOUTME: Defines create/inspect/remove/list and a bidirectional exec stream over a label-scoped backend

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub mod docker;

pub use docker::DockerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Exec error: {0}")]
    ExecError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Declarative description of a sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Scope (network + label) the container belongs to
    pub namespace: String,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub command: Vec<String>,
    pub working_dir: String,
    /// Shell probe whose success marks the sandbox as ready
    pub readiness_probe: Option<String>,
}

/// Scheduler-reported lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPhase {
    Pending,
    Running,
    Failed,
    Succeeded,
    Unknown,
}

impl SandboxPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Succeeded => "Succeeded",
            Self::Unknown => "Unknown",
        }
    }

    /// Terminal phases for a process that is expected to run forever
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Succeeded)
    }
}

impl std::fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ContainerState {
    pub phase: SandboxPhase,
    /// Every probe inside the container reports ready
    pub ready: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub phase: SandboxPhase,
    pub labels: HashMap<String, String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamType,
    pub data: Vec<u8>,
}

/// Attached exec session: write to `stdin`, read demultiplexed output until it ends
pub struct ExecStream {
    pub stdin: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, Result<OutputChunk>>,
}

/// Container platform backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the platform is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Make sure the scope exists (created if missing)
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    /// Pull an image unless it is already present
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create and start a container, returning its platform id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Force-remove a container. Missing containers count as removed.
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Current phase and readiness
    async fn inspect_container(&self, name: &str) -> Result<ContainerState>;

    /// Snapshot of containers carrying every given label
    async fn list_containers(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ContainerSummary>>;

    /// Start `command` inside the container with stdin, stdout and stderr attached
    async fn open_exec(&self, name: &str, command: Vec<String>) -> Result<ExecStream>;
}
