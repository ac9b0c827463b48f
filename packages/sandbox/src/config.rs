// ABOUTME: Environment-driven configuration for sandbox capacity, quotas and timeouts
// ABOUTME: Centralizes variable names and defaults so the binary and tests share one parser

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

// Capacity and scheduling
pub const MAX_SANDBOXES: &str = "MAX_SANDBOXES";
pub const SANDBOX_NAMESPACE: &str = "SANDBOX_NAMESPACE";
pub const KUBERNETES_NAMESPACE: &str = "KUBERNETES_NAMESPACE"; // Legacy
pub const SANDBOX_IMAGE: &str = "SANDBOX_IMAGE";
pub const SANDBOX_CPU_CORES: &str = "SANDBOX_CPU_CORES";
pub const SANDBOX_MEMORY_MB: &str = "SANDBOX_MEMORY_MB";

// Timeouts
pub const READINESS_TIMEOUT_SECS: &str = "READINESS_TIMEOUT_SECS";
pub const EXEC_TIMEOUT_SECS: &str = "EXEC_TIMEOUT_SECS";
pub const IMAGE_PULL_TIMEOUT_SECS: &str = "IMAGE_PULL_TIMEOUT_SECS";

// Storage
pub const DATABASE_URL: &str = "DATABASE_URL";

// Credentials injected into every sandbox
pub const CLAUDE_API_KEY: &str = "CLAUDE_API_KEY";
pub const CLAUDE_CONFIG_PATH: &str = "CLAUDE_CONFIG_PATH";

pub const DEFAULT_MAX_SANDBOXES: i64 = 3;
pub const DEFAULT_NAMESPACE: &str = "discord-claude";
pub const DEFAULT_IMAGE: &str = "anthropic/claude-code:latest";
pub const DEFAULT_CPU_CORES: f64 = 1.0;
pub const DEFAULT_MEMORY_MB: u64 = 2048;
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IMAGE_PULL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_DATABASE_URL: &str = "sqlite://disclaude.db";
pub const DEFAULT_CLAUDE_CONFIG_PATH: &str = "/home/user/.claude";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} must be greater than zero")]
    NotPositive { name: &'static str },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub max_sandboxes: i64,
    pub namespace: String,
    pub image: String,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub readiness_timeout: Duration,
    pub exec_timeout: Duration,
    pub image_pull_timeout: Duration,
    pub database_url: String,
    pub claude_api_key: Option<String>,
    pub claude_config_path: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: DEFAULT_MAX_SANDBOXES,
            namespace: DEFAULT_NAMESPACE.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            cpu_cores: DEFAULT_CPU_CORES,
            memory_mb: DEFAULT_MEMORY_MB,
            readiness_timeout: Duration::from_secs(DEFAULT_READINESS_TIMEOUT_SECS),
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            image_pull_timeout: Duration::from_secs(DEFAULT_IMAGE_PULL_TIMEOUT_SECS),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            claude_api_key: None,
            claude_config_path: DEFAULT_CLAUDE_CONFIG_PATH.to_string(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_sandboxes = parse_or(&get, MAX_SANDBOXES, DEFAULT_MAX_SANDBOXES)?;
        if max_sandboxes < 0 {
            return Err(ConfigError::InvalidValue {
                name: MAX_SANDBOXES,
                value: max_sandboxes.to_string(),
            });
        }

        let cpu_cores = parse_or(&get, SANDBOX_CPU_CORES, DEFAULT_CPU_CORES)?;
        if cpu_cores <= 0.0 {
            return Err(ConfigError::NotPositive {
                name: SANDBOX_CPU_CORES,
            });
        }

        let memory_mb = parse_or(&get, SANDBOX_MEMORY_MB, DEFAULT_MEMORY_MB)?;
        if memory_mb == 0 {
            return Err(ConfigError::NotPositive {
                name: SANDBOX_MEMORY_MB,
            });
        }

        let namespace = get(SANDBOX_NAMESPACE)
            .or_else(|| get(KUBERNETES_NAMESPACE))
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok(Self {
            max_sandboxes,
            namespace,
            image: get(SANDBOX_IMAGE).unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            cpu_cores,
            memory_mb,
            readiness_timeout: secs_or(&get, READINESS_TIMEOUT_SECS, DEFAULT_READINESS_TIMEOUT_SECS)?,
            exec_timeout: secs_or(&get, EXEC_TIMEOUT_SECS, DEFAULT_EXEC_TIMEOUT_SECS)?,
            image_pull_timeout: secs_or(
                &get,
                IMAGE_PULL_TIMEOUT_SECS,
                DEFAULT_IMAGE_PULL_TIMEOUT_SECS,
            )?,
            database_url: get(DATABASE_URL).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            claude_api_key: get(CLAUDE_API_KEY),
            claude_config_path: get(CLAUDE_CONFIG_PATH)
                .unwrap_or_else(|| DEFAULT_CLAUDE_CONFIG_PATH.to_string()),
        })
    }

    /// Environment injected into each sandbox container
    pub fn sandbox_env(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if let Some(key) = &self.claude_api_key {
            env.insert("ANTHROPIC_API_KEY".to_string(), key.clone());
        }
        env.insert(
            "CLAUDE_CONFIG_DIR".to_string(),
            self.claude_config_path.clone(),
        );
        env
    }
}

fn parse_or<G, T>(get: &G, name: &'static str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

/// Upper bound for any `*_SECS` setting (one week)
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

fn secs_or<G>(get: &G, name: &'static str, default: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = parse_or(get, name, default)?;
    if secs == 0 {
        return Err(ConfigError::NotPositive { name });
    }
    if secs > MAX_TIMEOUT_SECS {
        return Err(ConfigError::InvalidValue {
            name,
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
