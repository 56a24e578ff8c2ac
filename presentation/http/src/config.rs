//! Server configuration, loaded from `engram.yaml` and `ENGRAM_`-prefixed
//! environment variables.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. "0.0.0.0:8000"
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Root directory for settings and usage logs
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Enable permissive CORS
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_enable_cors() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            data_root: default_data_root(),
            enable_cors: default_enable_cors(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional yaml file plus the environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new();

        if Path::new("engram.yaml").exists() {
            figment = figment.merge(Yaml::file("engram.yaml"));
        }
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("ENGRAM_"));

        figment.extract()
    }

    /// Location of the append-only LLM usage log.
    pub fn usage_log_path(&self) -> PathBuf {
        self.data_root.join("uploads").join("llm_usage.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_any_source() {
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8000");
        assert!(config.enable_cors);
        assert!(config.usage_log_path().ends_with("uploads/llm_usage.jsonl"));
    }
}
