use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::flow::{compute_ticks, FlowsConfig};
use crate::icmp::IcmpConfig;
use crate::protocols::{PortMap, Protocol};
use crate::sniffer::CaptureConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub flows: FlowsConfig,

    #[serde(default)]
    pub icmp: IcmpConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    /// Ports claimed per application protocol
    #[serde(default)]
    pub protocols: BTreeMap<Protocol, ProtocolConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowtap/config.toml"),
            PathBuf::from("flowtap.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Check the settings that would otherwise only fail at startup
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.flows.enabled {
            compute_ticks(self.flows.timeout, self.flows.period)?;
        }
        if self.icmp.enabled && self.icmp.transaction_timeout.is_zero() {
            return Err(Error::Config(
                "icmp.transaction_timeout must be greater than zero".to_string(),
            ));
        }
        if self.capture.snaplen == 0 {
            return Err(Error::Config("capture.snaplen must be greater than zero".to_string()));
        }
        PortMap::build(self.enabled_protocols())?;
        Ok(())
    }

    /// Enabled protocols with their ports, in key order
    pub fn enabled_protocols(&self) -> impl Iterator<Item = (Protocol, &[u16])> {
        self.protocols
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(proto, p)| (*proto, p.ports.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Durations written the humantime way ("30s", "1m 30s")
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Like `duration`, with "-1" meaning disabled
pub mod optional_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    const DISABLED: &str = "-1";

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_str(DISABLED),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();
        if s == DISABLED || s.is_empty() {
            return Ok(None);
        }
        humantime::parse_duration(s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[flows]
timeout = "1m"
period = "-1"

[icmp]
send_request = true
transaction_timeout = "5s"

[capture]
snaplen = 1500

[protocols.http]
ports = [80, 8080]

[protocols.dns]
ports = [53]
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.flows.timeout, Duration::from_secs(60));
        assert_eq!(config.flows.period, None);
        assert!(config.icmp.send_request);
        assert!(!config.icmp.send_response);
        assert_eq!(config.icmp.transaction_timeout, Duration::from_secs(5));
        assert_eq!(config.capture.snaplen, 1500);
        assert_eq!(config.protocols[&Protocol::Http].ports, vec![80, 8080]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_validate_duplicate_port() {
        let config: Config = toml::from_str(
            "[protocols.http]\nports = [80]\n[protocols.thrift]\nports = [80]\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate port (80)"));

        // disabled protocols do not claim ports
        let config: Config = toml::from_str(
            "[protocols.http]\nports = [80]\n[protocols.thrift]\nenabled = false\nports = [80]\n",
        )
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_flow_timeout() {
        let config: Config = toml::from_str("[flows]\ntimeout = \"100ms\"").unwrap();
        assert!(matches!(config.validate(), Err(Error::InvalidTimeout(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.flows.period = Some(Duration::from_secs(20));
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/flowtap.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
