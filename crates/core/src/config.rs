//! Engine configuration.
//!
//! Built once at start-up and injected into every component; nothing reads
//! the environment after [`EngineConfig::from_env`] returns.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Deployment tier. Controls which storage and generation backends are
/// permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Multi-tenant SaaS: cloud storage only, no mock backend.
    Production,
    /// Single-tenant enterprise: any storage, no mock backend.
    SelfHostedProduction,
    /// Local development: anything goes.
    Developer,
}

impl ExecutionMode {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" => Ok(Self::Production),
            "self-hosted-production" => Ok(Self::SelfHostedProduction),
            "developer" => Ok(Self::Developer),
            other => Err(ConfigError::Invalid {
                key: ENV_EXECUTION_MODE,
                message: format!(
                    "'{other}' is not one of: production, self-hosted-production, developer"
                ),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::SelfHostedProduction => "self-hosted-production",
            Self::Developer => "developer",
        }
    }

    pub fn requires_cloud_storage(self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn allows_mock_backend(self) -> bool {
        matches!(self, Self::Developer)
    }
}

/// Where generated artifacts and final renders are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Memory,
    Local,
    S3,
}

impl StorageBackendKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(ConfigError::Invalid {
                key: ENV_STORAGE_BACKEND,
                message: format!("'{other}' is not one of: memory, local, s3"),
            }),
        }
    }
}

/// How segment outputs are assembled into the final artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorKind {
    /// Byte-level concatenation. Development and tests only.
    Concat,
    /// `ffmpeg -f concat -c copy`.
    Ffmpeg,
}

impl CompositorKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "concat" => Ok(Self::Concat),
            "ffmpeg" => Ok(Self::Ffmpeg),
            other => Err(ConfigError::Invalid {
                key: ENV_COMPOSITOR,
                message: format!("'{other}' is not one of: concat, ffmpeg"),
            }),
        }
    }
}

/// Storage collaborator settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    /// Root directory for the local backend.
    pub local_path: PathBuf,
    /// Bucket name for the S3 backend.
    pub s3_bucket: Option<String>,
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub execution_mode: ExecutionMode,
    /// Number of concurrent generation worker slots.
    pub worker_pool_size: usize,
    /// Upper bound on a single generation, initiate to terminal poll.
    pub generation_timeout: Duration,
    pub poll_backoff: BackoffPolicy,
    pub storage: StorageConfig,
    /// Base URL of a ComfyUI instance; the adapter is registered only when set.
    pub comfyui_url: Option<String>,
    /// JSON allowlist of ComfyUI nodes, models and repositories for the
    /// production tiers.
    pub workflow_allowlist_path: Option<PathBuf>,
    pub compositor: CompositorKind,
    /// Postgres URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
}

const ENV_EXECUTION_MODE: &str = "FOUNDRY_EXECUTION_MODE";
const ENV_WORKER_POOL_SIZE: &str = "FOUNDRY_WORKER_POOL_SIZE";
const ENV_GENERATION_TIMEOUT_SECS: &str = "FOUNDRY_GENERATION_TIMEOUT_SECS";
const ENV_POLL_INITIAL_MS: &str = "FOUNDRY_POLL_INITIAL_MS";
const ENV_POLL_MAX_MS: &str = "FOUNDRY_POLL_MAX_MS";
const ENV_POLL_MULTIPLIER: &str = "FOUNDRY_POLL_MULTIPLIER";
const ENV_STORAGE_BACKEND: &str = "FOUNDRY_STORAGE_BACKEND";
const ENV_LOCAL_STORAGE_PATH: &str = "FOUNDRY_LOCAL_STORAGE_PATH";
const ENV_S3_BUCKET: &str = "FOUNDRY_S3_BUCKET";
const ENV_COMFYUI_URL: &str = "FOUNDRY_COMFYUI_URL";
const ENV_WORKFLOW_ALLOWLIST_PATH: &str = "FOUNDRY_WORKFLOW_ALLOWLIST_PATH";
const ENV_COMPOSITOR: &str = "FOUNDRY_COMPOSITOR";
const ENV_DATABASE_URL: &str = "DATABASE_URL";

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Developer,
            worker_pool_size: 4,
            generation_timeout: Duration::from_secs(600),
            poll_backoff: BackoffPolicy::default(),
            storage: StorageConfig {
                backend: StorageBackendKind::Memory,
                local_path: PathBuf::from("./storage"),
                s3_bucket: None,
            },
            comfyui_url: None,
            workflow_allowlist_path: None,
            compositor: CompositorKind::Concat,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                           | Default      |
    /// |-----------------------------------|--------------|
    /// | `FOUNDRY_EXECUTION_MODE`          | `production` |
    /// | `FOUNDRY_WORKER_POOL_SIZE`        | `4`          |
    /// | `FOUNDRY_GENERATION_TIMEOUT_SECS` | `600`        |
    /// | `FOUNDRY_POLL_INITIAL_MS`         | `2000`       |
    /// | `FOUNDRY_POLL_MAX_MS`             | `30000`      |
    /// | `FOUNDRY_POLL_MULTIPLIER`         | `2.0`        |
    /// | `FOUNDRY_STORAGE_BACKEND`         | `local`      |
    /// | `FOUNDRY_LOCAL_STORAGE_PATH`      | `./storage`  |
    /// | `FOUNDRY_S3_BUCKET`               | (none)       |
    /// | `FOUNDRY_COMFYUI_URL`             | (none)       |
    /// | `FOUNDRY_WORKFLOW_ALLOWLIST_PATH` | (none)       |
    /// | `FOUNDRY_COMPOSITOR`              | `ffmpeg`     |
    /// | `DATABASE_URL`                    | (none)       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup, then validate it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let execution_mode = match get(ENV_EXECUTION_MODE) {
            Some(v) => ExecutionMode::parse(&v)?,
            None => ExecutionMode::Production,
        };

        let worker_pool_size = parse_number(&get, ENV_WORKER_POOL_SIZE, 4usize)?;
        let generation_timeout =
            Duration::from_secs(parse_number(&get, ENV_GENERATION_TIMEOUT_SECS, 600u64)?);

        let poll_backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(parse_number(&get, ENV_POLL_INITIAL_MS, 2000u64)?),
            max_delay: Duration::from_millis(parse_number(&get, ENV_POLL_MAX_MS, 30_000u64)?),
            multiplier: parse_number(&get, ENV_POLL_MULTIPLIER, 2.0f64)?,
        };

        let storage = StorageConfig {
            backend: match get(ENV_STORAGE_BACKEND) {
                Some(v) => StorageBackendKind::parse(&v)?,
                None => StorageBackendKind::Local,
            },
            local_path: get(ENV_LOCAL_STORAGE_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./storage")),
            s3_bucket: get(ENV_S3_BUCKET),
        };

        let compositor = match get(ENV_COMPOSITOR) {
            Some(v) => CompositorKind::parse(&v)?,
            None => CompositorKind::Ffmpeg,
        };

        let config = Self {
            execution_mode,
            worker_pool_size,
            generation_timeout,
            poll_backoff,
            storage,
            comfyui_url: get(ENV_COMFYUI_URL),
            workflow_allowlist_path: get(ENV_WORKFLOW_ALLOWLIST_PATH).map(PathBuf::from),
            compositor,
            database_url: get(ENV_DATABASE_URL),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field rules and execution-mode restrictions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_WORKER_POOL_SIZE,
                message: "must be at least 1".into(),
            });
        }
        if self.poll_backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: ENV_POLL_MULTIPLIER,
                message: "must be at least 1.0".into(),
            });
        }
        if self.storage.backend == StorageBackendKind::S3 && self.storage.s3_bucket.is_none() {
            return Err(ConfigError::Missing(ENV_S3_BUCKET));
        }
        if self.execution_mode.requires_cloud_storage()
            && self.storage.backend != StorageBackendKind::S3
        {
            return Err(ConfigError::Invalid {
                key: ENV_STORAGE_BACKEND,
                message: format!(
                    "execution mode '{}' requires the s3 storage backend",
                    self.execution_mode.as_str()
                ),
            });
        }
        Ok(())
    }
}

fn parse_number<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            message: format!("'{raw}' is not a valid number"),
        }),
        None => Ok(default),
    }
}

/// Errors raised while loading or validating [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<EngineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn developer_defaults() {
        let config = load(&[("FOUNDRY_EXECUTION_MODE", "developer")]).unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Developer);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.generation_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_backoff, BackoffPolicy::default());
        assert_eq!(config.storage.backend, StorageBackendKind::Local);
        assert_eq!(config.compositor, CompositorKind::Ffmpeg);
        assert!(config.comfyui_url.is_none());
        assert!(config.workflow_allowlist_path.is_none());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn workflow_allowlist_path_is_read() {
        let config = load(&[
            ("FOUNDRY_EXECUTION_MODE", "self-hosted-production"),
            ("FOUNDRY_WORKFLOW_ALLOWLIST_PATH", "/etc/foundry/allowlist.json"),
        ])
        .unwrap();
        assert_eq!(
            config.workflow_allowlist_path.as_deref(),
            Some(std::path::Path::new("/etc/foundry/allowlist.json"))
        );
    }

    #[test]
    fn production_is_the_default_mode_and_requires_s3() {
        assert_matches!(
            load(&[]),
            Err(ConfigError::Invalid { key: "FOUNDRY_STORAGE_BACKEND", .. })
        );

        let config = load(&[
            ("FOUNDRY_STORAGE_BACKEND", "s3"),
            ("FOUNDRY_S3_BUCKET", "renders"),
        ])
        .unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Production);
        assert!(!config.execution_mode.allows_mock_backend());
    }

    #[test]
    fn s3_backend_requires_bucket() {
        assert_matches!(
            load(&[
                ("FOUNDRY_EXECUTION_MODE", "self-hosted-production"),
                ("FOUNDRY_STORAGE_BACKEND", "s3"),
            ]),
            Err(ConfigError::Missing("FOUNDRY_S3_BUCKET"))
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert_matches!(
            load(&[("FOUNDRY_EXECUTION_MODE", "chaos")]),
            Err(ConfigError::Invalid { key: "FOUNDRY_EXECUTION_MODE", .. })
        );
        assert_matches!(
            load(&[
                ("FOUNDRY_EXECUTION_MODE", "developer"),
                ("FOUNDRY_WORKER_POOL_SIZE", "many"),
            ]),
            Err(ConfigError::Invalid { key: "FOUNDRY_WORKER_POOL_SIZE", .. })
        );
        assert_matches!(
            load(&[
                ("FOUNDRY_EXECUTION_MODE", "developer"),
                ("FOUNDRY_WORKER_POOL_SIZE", "0"),
            ]),
            Err(ConfigError::Invalid { key: "FOUNDRY_WORKER_POOL_SIZE", .. })
        );
    }

    #[test]
    fn poll_backoff_overrides() {
        let config = load(&[
            ("FOUNDRY_EXECUTION_MODE", "developer"),
            ("FOUNDRY_POLL_INITIAL_MS", "10"),
            ("FOUNDRY_POLL_MAX_MS", "40"),
            ("FOUNDRY_POLL_MULTIPLIER", "3"),
            ("FOUNDRY_COMPOSITOR", "concat"),
        ])
        .unwrap();
        assert_eq!(config.poll_backoff.initial_delay, Duration::from_millis(10));
        assert_eq!(config.poll_backoff.max_delay, Duration::from_millis(40));
        assert_eq!(config.poll_backoff.multiplier, 3.0);
        assert_eq!(config.compositor, CompositorKind::Concat);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[
            ("FOUNDRY_EXECUTION_MODE", "developer"),
            ("FOUNDRY_COMFYUI_URL", "  "),
        ])
        .unwrap();
        assert!(config.comfyui_url.is_none());
    }
}
