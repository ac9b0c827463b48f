// ABOUTME: Command executor for running shell commands inside a running sandbox
// ABOUTME: Filters destructive commands, drives an attached /bin/sh exec stream and merges its output

use crate::orchestrator::SandboxHandle;
use crate::providers::{Provider, ProviderError, SandboxPhase, StreamType};
use crate::text::{clean_output, dangerous_pattern, escape_shell, merge_output, sanitize_input};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Command rejected: matches blocked pattern '{0}'")]
    DangerousCommandRejected(&'static str),

    #[error("Sandbox not running: {0}")]
    NotRunning(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

pub struct CommandExecutor {
    provider: Arc<dyn Provider>,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub fn new(provider: Arc<dyn Provider>, default_timeout: Duration) -> Self {
        Self {
            provider,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run `command` through `/bin/sh` in the sandbox and return stdout, plus stderr when present
    pub async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        if let Some(pattern) = dangerous_pattern(command) {
            warn!(sandbox = %handle.name, pattern, "Blocked dangerous command");
            return Err(ExecutorError::DangerousCommandRejected(pattern));
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        tokio::time::timeout(timeout, self.run_shell(handle, command))
            .await
            .map_err(|_| ExecutorError::Timeout(timeout))?
    }

    async fn run_shell(&self, handle: &SandboxHandle, command: &str) -> Result<String> {
        let state = self.provider.inspect_container(&handle.name).await?;
        if state.phase != SandboxPhase::Running {
            return Err(ExecutorError::NotRunning(format!(
                "Sandbox {} is in phase {}",
                handle.name, state.phase
            )));
        }

        let mut exec = self
            .provider
            .open_exec(&handle.name, vec!["/bin/sh".to_string()])
            .await
            .map_err(|e| ExecutorError::ExecutionFailed(e.to_string()))?;

        let script = format!("{}\nexit\n", command);
        exec.stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| ExecutorError::ExecutionFailed(format!("stdin write: {}", e)))?;
        exec.stdin
            .shutdown()
            .await
            .map_err(|e| ExecutorError::ExecutionFailed(format!("stdin close: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = exec.output.next().await {
            let chunk = chunk.map_err(|e| ExecutorError::ExecutionFailed(e.to_string()))?;
            match chunk.stream {
                StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
                StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
            }
        }

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        debug!(
            sandbox = %handle.name,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command finished"
        );

        Ok(merge_output(&stdout, &stderr))
    }

    /// Pipe a chat message into the assistant CLI and return its cleaned reply
    pub async fn send_message(&self, handle: &SandboxHandle, message: &str) -> Result<String> {
        let message = sanitize_input(message);
        if let Some(pattern) = dangerous_pattern(&message) {
            warn!(sandbox = %handle.name, pattern, "Blocked dangerous message");
            return Err(ExecutorError::DangerousCommandRejected(pattern));
        }

        let command = format!("echo {} | claude", escape_shell(&message));
        let output = self.execute(handle, &command, None).await?;
        Ok(clean_output(&output))
    }

    pub async fn write_file(&self, handle: &SandboxHandle, path: &str, content: &str) -> Result<()> {
        let command = format!("cat > {} << 'EOF'\n{}\nEOF", escape_shell(path), content);
        self.execute(handle, &command, None).await?;
        Ok(())
    }

    pub async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<String> {
        self.execute(handle, &format!("cat {}", escape_shell(path)), None)
            .await
    }

    pub async fn list_files(&self, handle: &SandboxHandle, dir: Option<&str>) -> Result<String> {
        let dir = dir.unwrap_or(".");
        self.execute(handle, &format!("ls -la {}", escape_shell(dir)), None)
            .await
    }
}
