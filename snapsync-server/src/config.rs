use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::replication::ReplicationConfig;

/// Main server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: Server,
    pub logging: LoggingConfig,
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub host: String,
    pub port: u16,
    /// Coordinators on this server expect the extra `check` reply after errors
    pub append_reply: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            append_reply: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = serde_yaml::from_str(&content)?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.host.is_empty() {
            return Err("server.host must not be empty".to_string());
        }
        match self.logging.format.as_str() {
            "json" | "plain" => {}
            other => {
                return Err(format!(
                    "logging.format must be \"json\" or \"plain\", got {:?}",
                    other
                ));
            }
        }
        self.replication.validate()
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_addr(), "0.0.0.0:8888");
        assert_eq!(config.replication.workers, 2);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\n  append_reply: true\nreplication:\n  workers: 4\n  chunk_threshold_bytes: 2048\n"
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert!(config.server.append_reply);
        assert_eq!(config.replication.workers, 4);
        assert_eq!(config.replication.chunk_threshold_bytes, 2048);
        assert_eq!(config.replication.handshake_command, "sync150");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "replication:\n  workers: 0\n").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());

        let mut config = ServerConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().unwrap_err().contains("logging.format"));
    }

    #[test]
    fn test_missing_file() {
        assert!(ServerConfig::from_file("/nonexistent/snapsync.yml").is_err());
    }
}
