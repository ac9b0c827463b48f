// ABOUTME: Shared wiring for the disclaude binary: telemetry setup and service bootstrap
// ABOUTME: Builds storage, docker provider, user directory and lifecycle coordinator from configuration

pub mod telemetry;

use anyhow::{Context, Result};
use disclaude_sandbox::{
    DockerProvider, LifecycleCoordinator, SandboxConfig, SandboxStorage, UserDirectory,
};
use std::sync::Arc;
use tracing::info;

/// Load `.env` (when present) and read the sandbox configuration
pub fn load_config() -> Result<SandboxConfig> {
    dotenvy::dotenv().ok();
    SandboxConfig::from_env().context("Invalid configuration")
}

pub async fn open_storage(config: &SandboxConfig) -> Result<Arc<SandboxStorage>> {
    let storage = SandboxStorage::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    Ok(Arc::new(storage))
}

/// Fully wired service
pub struct App {
    pub config: SandboxConfig,
    pub storage: Arc<SandboxStorage>,
    pub directory: Arc<UserDirectory>,
    pub coordinator: Arc<LifecycleCoordinator>,
}

impl App {
    pub async fn bootstrap(config: SandboxConfig) -> Result<Self> {
        let storage = open_storage(&config).await?;
        let directory = Arc::new(UserDirectory::new(storage.clone()));

        let provider = DockerProvider::with_pull_timeout(config.image_pull_timeout)
            .context("Failed to connect to Docker")?;

        let coordinator = LifecycleCoordinator::new(
            storage.clone(),
            Arc::new(provider),
            directory.clone(),
            &config,
        );
        coordinator
            .ledger()
            .set_maximum(config.max_sandboxes)
            .await
            .context("Failed to apply sandbox capacity")?;

        info!(
            namespace = %config.namespace,
            image = %config.image,
            max_sandboxes = config.max_sandboxes,
            "Service initialized"
        );

        Ok(Self {
            config,
            storage,
            directory,
            coordinator: Arc::new(coordinator),
        })
    }
}
