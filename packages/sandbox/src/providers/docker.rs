// ABOUTME: Docker provider implementation backing sandboxes with local containers
// ABOUTME: Uses bollard for container lifecycle, healthcheck-based readiness and attached exec streams

use super::{
    ContainerSpec, ContainerState, ContainerSummary, ExecStream, OutputChunk, Provider,
    ProviderError, Result, SandboxPhase, StreamType,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HealthConfig, HostConfig},
    network::{CreateNetworkOptions, InspectNetworkOptions},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const NANOS_PER_SEC: i64 = 1_000_000_000;

pub struct DockerProvider {
    client: Docker,
    label_prefix: String,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    /// Create a new Docker provider with custom pull timeout
    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Create with a specific Docker connection and custom timeout
    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            label_prefix: "disclaude".to_string(),
            pull_timeout: timeout,
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| {
                    ProviderError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(error) = info.error {
                    return Err(ProviderError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = info.status {
                    if status != last_status {
                        debug!("Pull status: {}", status);
                        last_status = status;
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

/// Build the bollard container config for a sandbox
fn to_bollard_config(label_prefix: &str, spec: &ContainerSpec) -> Config<String> {
    let mut labels = spec.labels.clone();
    labels.insert(format!("{}.managed", label_prefix), "true".to_string());
    labels.insert(format!("{}.scope", label_prefix), spec.namespace.clone());

    let mut env: Vec<String> = spec
        .env_vars
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    // No binds or volumes: the writable layer disappears with the container
    let host_config = HostConfig {
        nano_cpus: Some((spec.cpu_cores * NANOS_PER_SEC as f64) as i64),
        memory: Some((spec.memory_mb * 1024 * 1024) as i64),
        memory_swap: Some((spec.memory_mb * 1024 * 1024) as i64),
        network_mode: Some(spec.namespace.clone()),
        ..Default::default()
    };

    let healthcheck = spec.readiness_probe.as_ref().map(|probe| HealthConfig {
        test: Some(vec!["CMD-SHELL".to_string(), probe.clone()]),
        interval: Some(2 * NANOS_PER_SEC),
        timeout: Some(5 * NANOS_PER_SEC),
        retries: Some(3),
        ..Default::default()
    });

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: Some(env),
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(labels),
        healthcheck,
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Map docker's container state onto a scheduler phase
fn phase_from_state(state: &str, exit_code: Option<i64>, oom_killed: bool) -> SandboxPhase {
    match state.to_lowercase().as_str() {
        "created" | "restarting" | "paused" => SandboxPhase::Pending,
        "running" => SandboxPhase::Running,
        "exited" if oom_killed => SandboxPhase::Failed,
        "exited" => match exit_code {
            Some(0) => SandboxPhase::Succeeded,
            Some(_) => SandboxPhase::Failed,
            None => SandboxPhase::Unknown,
        },
        "dead" => SandboxPhase::Failed,
        _ => SandboxPhase::Unknown,
    }
}

/// Containers without a healthcheck are ready as soon as they run
fn ready_from_health(health: Option<&str>) -> bool {
    match health {
        None => true,
        Some(status) => matches!(status.to_lowercase().as_str(), "" | "none" | "healthy"),
    }
}

/// Extract the exit code from list output such as "Exited (137) 2 minutes ago"
fn exit_code_from_status(status: &str) -> Option<i64> {
    let start = status.find('(')?;
    let end = status[start..].find(')')? + start;
    status[start + 1..end].trim().parse().ok()
}

fn container_error(name: &str, e: bollard::errors::Error) -> ProviderError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ProviderError::NotFound(name.to_string()),
        other => ProviderError::ContainerError(other.to_string()),
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        match self
            .client
            .inspect_network(namespace, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!("Network {} already exists", namespace);
                return Ok(());
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(ProviderError::NetworkError(e.to_string())),
        }

        info!("Creating network: {}", namespace);

        let options = CreateNetworkOptions {
            name: namespace.to_string(),
            driver: "bridge".to_string(),
            labels: HashMap::from([
                (format!("{}.managed", self.label_prefix), "true".to_string()),
                (format!("{}.scope", self.label_prefix), namespace.to_string()),
            ]),
            ..Default::default()
        };

        self.client
            .create_network(options)
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!("Image {} present locally", image);
            return Ok(());
        }
        self.pull_image(image).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), to_bollard_config(&self.label_prefix, spec))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(container.id)
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        info!("Removing container: {}", name);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already gone", name);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerState> {
        let inspect = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| container_error(name, e))?;

        let state = inspect.state.as_ref().ok_or_else(|| {
            ProviderError::ContainerError("Container has no state information".to_string())
        })?;

        let status = state
            .status
            .as_ref()
            .map(|s| s.as_ref())
            .unwrap_or("unknown");
        let phase = phase_from_state(
            status,
            state.exit_code,
            state.oom_killed.unwrap_or(false),
        );

        let health: Option<&str> = state
            .health
            .as_ref()
            .and_then(|h| h.status.as_ref())
            .map(|s| s.as_ref());

        Ok(ContainerState {
            phase,
            ready: phase == SandboxPhase::Running && ready_from_health(health),
            message: state.error.clone().filter(|e| !e.is_empty()),
        })
    }

    async fn list_containers(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<Vec<ContainerSummary>> {
        let mut label_filters: Vec<String> =
            labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        label_filters.push(format!("{}.managed=true", self.label_prefix));

        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), label_filters)]),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                let name = container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let exit_code = container.status.as_deref().and_then(exit_code_from_status);
                let phase = phase_from_state(
                    container.state.as_deref().unwrap_or("unknown"),
                    exit_code,
                    false,
                );
                Some(ContainerSummary {
                    id,
                    name,
                    phase,
                    labels: container.labels.unwrap_or_default(),
                    created_at: container
                        .created
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0)),
                })
            })
            .collect())
    }

    async fn open_exec(&self, name: &str, command: Vec<String>) -> Result<ExecStream> {
        debug!("Opening exec stream in {}: {:?}", name, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(name, exec_config)
            .await
            .map_err(|e| container_error(name, e))?;

        let started = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ProviderError::ExecError(e.to_string()))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .filter_map(|item| {
                        futures::future::ready(match item {
                            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                                Some(Ok(OutputChunk {
                                    stream: StreamType::Stdout,
                                    data: message.to_vec(),
                                }))
                            }
                            Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk {
                                stream: StreamType::Stderr,
                                data: message.to_vec(),
                            })),
                            Ok(_) => None,
                            Err(e) => Some(Err(ProviderError::ExecError(e.to_string()))),
                        })
                    })
                    .boxed();

                Ok(ExecStream {
                    stdin: input,
                    output,
                })
            }
            StartExecResults::Detached => Err(ProviderError::ExecError(
                "Exec was detached unexpectedly".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> ContainerSpec {
        ContainerSpec {
            name: "claude-sandbox-123".to_string(),
            image: "alpine:latest".to_string(),
            namespace: "discord-claude".to_string(),
            env_vars: HashMap::from([("ANTHROPIC_API_KEY".to_string(), "sk".to_string())]),
            labels: HashMap::from([("thread-id".to_string(), "123".to_string())]),
            cpu_cores: 1.0,
            memory_mb: 2048,
            command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            working_dir: "/workspace".to_string(),
            readiness_probe: Some("test -d /workspace".to_string()),
        }
    }

    #[tokio::test]
    async fn test_docker_provider_creation() {
        // This test might fail if Docker is not available
        let provider = DockerProvider::new();
        assert!(provider.is_ok() || provider.is_err());
    }

    #[test]
    fn test_container_config_conversion() {
        let config = to_bollard_config("disclaude", &sample_spec());

        assert_eq!(config.image.as_deref(), Some("alpine:latest"));
        assert_eq!(config.working_dir.as_deref(), Some("/workspace"));

        let labels = config.labels.unwrap();
        assert_eq!(labels.get("disclaude.managed").map(String::as_str), Some("true"));
        assert_eq!(labels.get("disclaude.scope").map(String::as_str), Some("discord-claude"));
        assert_eq!(labels.get("thread-id").map(String::as_str), Some("123"));

        let host = config.host_config.unwrap();
        assert_eq!(host.nano_cpus, Some(1_000_000_000));
        assert_eq!(host.memory, Some(2048 * 1024 * 1024));
        assert!(host.binds.is_none());
        assert_eq!(host.network_mode.as_deref(), Some("discord-claude"));

        let health = config.healthcheck.unwrap();
        assert_eq!(
            health.test,
            Some(vec!["CMD-SHELL".to_string(), "test -d /workspace".to_string()])
        );
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(phase_from_state("created", None, false), SandboxPhase::Pending);
        assert_eq!(phase_from_state("running", None, false), SandboxPhase::Running);
        assert_eq!(phase_from_state("exited", Some(0), false), SandboxPhase::Succeeded);
        assert_eq!(phase_from_state("exited", Some(1), false), SandboxPhase::Failed);
        assert_eq!(phase_from_state("exited", Some(0), true), SandboxPhase::Failed);
        assert_eq!(phase_from_state("dead", None, false), SandboxPhase::Failed);
        assert_eq!(phase_from_state("removing", None, false), SandboxPhase::Unknown);
    }

    #[test]
    fn test_health_readiness() {
        assert!(ready_from_health(None));
        assert!(ready_from_health(Some("healthy")));
        assert!(ready_from_health(Some("none")));
        assert!(!ready_from_health(Some("starting")));
        assert!(!ready_from_health(Some("unhealthy")));
    }

    #[test]
    fn test_exit_code_from_list_status() {
        assert_eq!(exit_code_from_status("Exited (137) 2 minutes ago"), Some(137));
        assert_eq!(exit_code_from_status("Exited (0) 1 second ago"), Some(0));
        assert_eq!(exit_code_from_status("Up 5 minutes"), None);
    }
}
