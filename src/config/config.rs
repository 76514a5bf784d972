//! Server configuration

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::Deserialize;

use mrd::{MrdError, Result, DEFAULT_MRD_PORT};

use super::logging_config::LoggingConfig;

/// Configuration for the streaming server
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address for the session listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the session listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Capability used when a requested name is unknown
    #[serde(default = "default_fallback_capability")]
    pub fallback_capability: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            fallback_capability: default_fallback_capability(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            MrdError::config(format!("Could not read config file {:?}: {}", path, e))
        })?;
        let config: Config = toml::from_str(&text).map_err(|e| {
            MrdError::config(format!("Could not parse config file {:?}: {}", path, e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(MrdError::config("Port must be greater than 0"));
        }
        if self.fallback_capability.is_empty() {
            return Err(MrdError::config("Fallback capability must be named"));
        }
        if self.logging.log_to_file && self.logging.log_file_path.is_empty() {
            return Err(MrdError::config(
                "File logging is enabled but no log file path is set",
            ));
        }
        Ok(())
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    DEFAULT_MRD_PORT
}

fn default_fallback_capability() -> String {
    "null".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_MRD_PORT);
        assert_eq!(config.fallback_capability, "null");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_with_defaults() {
        let config: Config = toml::from_str("port = 9102\n").unwrap();
        assert_eq!(config.port, 9102);
        assert_eq!(config.fallback_capability, "null");
    }

    #[test]
    fn test_from_file_roundtrip() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9202\nfallback_capability = \"passthrough\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9202);
        assert_eq!(config.fallback_capability, "passthrough");

        let err = Config::from_file("/nonexistent/resonance.toml").unwrap_err();
        assert!(matches!(err, MrdError::Config(_)));
    }

    #[test]
    fn test_file_logging_requires_a_path() {
        let config: Config = toml::from_str(
            "[logging]\nlog_to_file = true\n",
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(MrdError::Config(_))));
    }
}
