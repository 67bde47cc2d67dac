//! TOML configuration.
//!
//! Relative paths are resolved against the directory holding the config
//! file. Intervals below [`MIN_INTERVAL_SECS`] are raised to it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::signing::ed25519::identity_from_seed;
use crate::signing::{Certificate, Identity};

/// Lower bound for task polling intervals.
pub const MIN_INTERVAL_SECS: u64 = 10;

fn default_timeout_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_subject() -> String {
    "CN=mexsync".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("locks")
}

fn default_pool_size() -> usize {
    4
}

fn default_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub operations: OperationsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    /// File this configuration was read from.
    #[serde(skip)]
    pub source: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Log every raw message at debug level.
    #[serde(default)]
    pub debug_messages: bool,
}

impl EndpointConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Hex-encoded 32-byte Ed25519 seed.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Hex-encoded public keys whose signatures are accepted.
    #[serde(default)]
    pub trusted_keys: Vec<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_file: None,
            subject: default_subject(),
            trusted_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OperationPolicy {
    #[serde(default = "default_true")]
    pub sign_outbound: bool,
    #[serde(default = "default_true")]
    pub verify_inbound: bool,
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self {
            sign_outbound: true,
            verify_inbound: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperationsConfig {
    #[serde(default)]
    pub get: OperationPolicy,
    #[serde(default)]
    pub list: OperationPolicy,
    #[serde(default)]
    pub put: OperationPolicy,
    #[serde(default)]
    pub query: OperationPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Worker threads for the scheduler.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_dir: default_lock_dir(),
            pool_size: default_pool_size(),
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default, rename = "sink")]
    pub sinks: Vec<SinkConfig>,
}

impl TaskConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub folder: PathBuf,
    /// Empty accepts every type.
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub hook: Option<PathBuf>,
}

impl Config {
    /// Read, resolve and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.source = path.to_path_buf();

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(key) = self.signing.key_file.as_mut() {
            resolve(key);
        }
        resolve(&mut self.sync.state_dir);
        resolve(&mut self.sync.lock_dir);
        for task in &mut self.sync.tasks {
            for sink in &mut task.sinks {
                resolve(&mut sink.folder);
                if let Some(hook) = sink.hook.as_mut() {
                    resolve(hook);
                }
            }
        }
    }

    /// Check required values and clamp intervals.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let url = self.endpoint.url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid("endpoint.url is required".into()));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ConfigError::Invalid(format!(
                "endpoint.url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.endpoint.timeout_secs == 0 {
            return Err(ConfigError::Invalid("endpoint.timeout_secs must be positive".into()));
        }
        if self.sync.pool_size == 0 {
            return Err(ConfigError::Invalid("sync.pool_size must be at least 1".into()));
        }

        let mut names = HashSet::new();
        for task in &mut self.sync.tasks {
            if task.name.trim().is_empty() {
                return Err(ConfigError::Invalid("sync task without a name".into()));
            }
            if !names.insert(task.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "sync task {:?} is defined twice",
                    task.name
                )));
            }
            if task.sinks.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "sync task {:?} has no sink",
                    task.name
                )));
            }
            if task.interval_secs < MIN_INTERVAL_SECS {
                warn!(
                    task = %task.name,
                    configured = task.interval_secs,
                    "Interval below minimum, using {}s",
                    MIN_INTERVAL_SECS
                );
                task.interval_secs = MIN_INTERVAL_SECS;
            }
        }
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.sync.tasks.iter().find(|t| t.name == name)
    }

    /// Client identity from `signing.key_file`, if configured.
    pub fn identity(&self) -> Result<Option<Identity>, ConfigError> {
        let Some(path) = &self.signing.key_file else {
            return Ok(None);
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let seed = decode_key(text.trim()).map_err(|reason| ConfigError::Key {
            path: path.clone(),
            reason,
        })?;
        Ok(Some(identity_from_seed(self.signing.subject.clone(), seed)))
    }

    /// Trusted signer keys.
    pub fn trusted_certificates(&self) -> Result<Vec<Certificate>, ConfigError> {
        self.signing
            .trusted_keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let bytes = decode_key(key.trim()).map_err(|reason| ConfigError::Key {
                    path: self.source.clone(),
                    reason: format!("signing.trusted_keys[{i}]: {reason}"),
                })?;
                Ok(Certificate::new(format!("trusted key {i}"), bytes.to_vec()))
            })
            .collect()
    }
}

fn decode_key(hex_text: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(hex_text).map_err(|e| format!("not valid hex: {e}"))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| format!("expected 32 bytes, got {}", bytes.len()))
}
