// ABOUTME: Sandbox lifecycle and capacity orchestration for chat-driven Claude Code sessions
// ABOUTME: One resource-capped container per conversation thread, tracked in sqlite and driven over docker

pub mod auth;
pub mod capacity;
pub mod commands;
pub mod config;
pub mod executor;
pub mod lifecycle;
pub mod orchestrator;
pub mod providers;
pub mod sessions;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod text;
pub mod transport;

pub use auth::{Action, AuthError, AuthorizationService, Permission, Requester, UserDirectory};
pub use capacity::CapacityLedger;
pub use commands::{Command, CommandRouter};
pub use config::{ConfigError, SandboxConfig};
pub use executor::{CommandExecutor, ExecutorError};
pub use lifecycle::{
    LifecycleCoordinator, LifecycleError, SessionInfo, StatusReport, TeardownReport,
};
pub use orchestrator::{OrchestratorError, SandboxHandle, SandboxOrchestrator, SandboxTemplate};
pub use providers::{DockerProvider, Provider, ProviderError, SandboxPhase};
pub use sessions::{RegistryError, SessionRegistry};
pub use storage::{
    CapacityUsage, Role, SandboxRecord, SandboxStatus, SandboxStorage, Session, SessionStatus,
    StorageError, User,
};
pub use transport::{ChatTransport, ConsoleTransport, InboundEvent, TransportError};
