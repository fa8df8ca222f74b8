use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::directory::WILDCARD;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:9876";
pub const DEFAULT_NOMAD_ADDR: &str = "http://127.0.0.1:4646";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Ingress settings, read from the same YAML file as pingora's own.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Service names to route, or `*` for all of them.
    pub services: Vec<String>,
    pub nomad: NomadConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NomadConfig {
    pub address: String,
    pub namespace: Option<String>,
    pub token_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            services: vec![WILDCARD.to_string()],
            nomad: NomadConfig::default(),
        }
    }
}

impl Default for NomadConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_NOMAD_ADDR.to_string(),
            namespace: None,
            token_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document is valid and means "all defaults".
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Apply `NIMBY_*` / `NOMAD_*` overrides from the process environment.
    pub fn with_env(self) -> Self {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(listen) = lookup("NIMBY_ADDR") {
            self.listen = listen;
        }
        if let Some(services) = lookup("NIMBY_SERVICES") {
            self.services = services
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(address) = lookup("NOMAD_ADDR") {
            self.nomad.address = address;
        }
        if let Some(namespace) = lookup("NOMAD_NAMESPACE") {
            self.nomad.namespace = Some(namespace).filter(|ns| !ns.is_empty());
        }
        if let Some(path) = lookup("NIMBY_TOKEN_PATH") {
            self.nomad.token_path = Some(PathBuf::from(path)).filter(|p| !p.as_os_str().is_empty());
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".into()));
        }
        if self.services.is_empty() {
            return Err(ConfigError::Invalid("no services to watch".into()));
        }
        if !(self.nomad.address.starts_with("http://") || self.nomad.address.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "directory address '{}' must start with http:// or https://",
                self.nomad.address
            )));
        }
        Ok(())
    }
}
