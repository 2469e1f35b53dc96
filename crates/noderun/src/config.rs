//! File-based configuration for sandboxes and their network access.

use std::{path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    net::{AllowAllPolicy, NetworkPolicy, PublicOnlyPolicy, TokioDnsResolver},
    sandbox::{
        DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_STACK_SIZE, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT,
        SandboxBuilder, SandboxOptions,
    },
    shims::ShimSet,
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format: {0}")]
    UnknownFormat(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub memory_limit: usize,
    pub timeout_ms: u64,
    pub max_stack_size: usize,
    pub max_body_bytes: usize,
    pub shims: ShimSet,
}

impl Default for SandboxConfig {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            memory_limit: DEFAULT_MEMORY_LIMIT,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shims: ShimSet::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    AllowAll,
    PublicOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub policy: PolicyKind,
    pub proxy: Option<String>,
    pub user_agent: Option<String>,
}

impl Config {
    /// # Errors
    /// Returns [`ConfigError::Yaml`] if the document does not parse.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    /// # Errors
    /// Returns [`ConfigError::Json`] if the document does not parse.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a `.yaml`, `.yml` or `.json` file.
    ///
    /// # Errors
    /// Fails if the file cannot be read, has another extension, or does not
    /// parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            _ => Err(ConfigError::UnknownFormat(path.display().to_string())),
        }
    }

    #[must_use]
    pub fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            memory_limit: self.sandbox.memory_limit,
            timeout: Duration::from_millis(self.sandbox.timeout_ms),
            max_stack_size: self.sandbox.max_stack_size,
            max_body_bytes: self.sandbox.max_body_bytes,
            shims: self.sandbox.shims,
            on_fatal: None,
        }
    }

    #[must_use]
    pub fn network_policy(&self) -> Arc<dyn NetworkPolicy> {
        match self.network.policy {
            PolicyKind::AllowAll => Arc::new(AllowAllPolicy),
            PolicyKind::PublicOnly => Arc::new(PublicOnlyPolicy::<TokioDnsResolver>::default()),
        }
    }

    /// Builder with these options and policy, without a fetch host.
    #[must_use]
    pub fn sandbox_builder(&self) -> SandboxBuilder {
        SandboxBuilder::new()
            .options(self.sandbox_options())
            .policy(self.network_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_yaml_str("{}").unwrap();
        assert_eq!(config, Config::default());
        let options = config.sandbox_options();
        assert_eq!(options.timeout, Duration::from_secs(10));
        assert_eq!(options.memory_limit, 64 * 1024 * 1024);
    }

    #[test]
    fn yaml_overrides() {
        let config = Config::from_yaml_str(
            r"
sandbox:
  timeout_ms: 250
  shims:
    fetch: false
network:
  policy: public-only
  user_agent: noderun-test
",
        )
        .unwrap();
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert!(!config.sandbox.shims.fetch);
        assert!(config.sandbox.shims.console);
        assert_eq!(config.network.policy, PolicyKind::PublicOnly);
        assert_eq!(config.network.user_agent.as_deref(), Some("noderun-test"));
        assert_eq!(
            config.sandbox_options().timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("config.json");
        std::fs::write(&json, r#"{"sandbox": {"memory_limit": 1024}}"#).unwrap();
        assert_eq!(Config::load(&json).unwrap().sandbox.memory_limit, 1024);

        let toml = dir.path().join("config.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(
            Config::load(&toml),
            Err(ConfigError::UnknownFormat(_))
        ));
    }
}
