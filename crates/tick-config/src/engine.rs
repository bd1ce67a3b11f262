use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::alert::AlertConfig;
use crate::logging::LoggingConfig;
use crate::server::ServerConfig;
use crate::storage::StorageConfig;
use crate::udf::UdfConfig;
use crate::upstream::UpstreamConfig;
use crate::validate;

/// The resolved, validated engine configuration.
///
/// Every section has defaults, so an empty TOML document is a valid config.
/// Environment overrides (`apply_env_overrides`) are applied after parsing
/// and win over TOML values.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub alert: AlertConfig,
    pub udf: UdfConfig,
    #[serde(rename = "upstream", skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<UpstreamConfig>,
}

impl EngineConfig {
    /// Read and parse a `tickd.toml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }

    pub fn upstream(&self, name: &str) -> Option<&UpstreamConfig> {
        self.upstreams.iter().find(|u| u.name == name)
    }
}

impl FromStr for EngineConfig {
    type Err = anyhow::Error;

    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        validate::validate(&config)?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use std::time::Duration;

    pub(crate) const FULL_TOML: &str = r#"
[server]
listen = "tcp://127.0.0.1:9092"

[storage]
dir = "/var/lib/tickd"

[logging]
level = "debug"
format = "json"

[alert]
max_attempts = 5
backoff_base = "250ms"
backoff_max = "10s"

[udf]
timeout = "10s"

[udf.functions.movingAverage]
command = "/usr/local/bin/moving-avg"
args = ["--window", "10"]

[[upstream]]
name = "metrics"
url = "http://localhost:8086"
timeout = "15s"
username = "admin"
password = "hunter2"

[[upstream]]
name = "events"
url = "http://localhost:8087"
"#;

    #[test]
    fn load_full_toml() {
        let cfg: EngineConfig = FULL_TOML.parse().unwrap();
        assert_eq!(cfg.server.listen, "tcp://127.0.0.1:9092");
        assert_eq!(cfg.storage.dir.display().to_string(), "/var/lib/tickd");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.alert.max_attempts, 5);
        assert_eq!(
            cfg.alert.backoff_base.as_duration(),
            Duration::from_millis(250)
        );
        assert_eq!(cfg.udf.timeout.as_duration(), Duration::from_secs(10));
        assert_eq!(cfg.udf.functions["movingAverage"].args.len(), 2);
        assert_eq!(cfg.upstreams.len(), 2);
        assert_eq!(cfg.upstream("metrics").unwrap().username.as_deref(), Some("admin"));
        assert_eq!(
            cfg.upstream("events").unwrap().timeout.as_duration(),
            Duration::from_secs(30),
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg: EngineConfig = "".parse().unwrap();
        assert_eq!(cfg.server.listen, "tcp://127.0.0.1:9092");
        assert_eq!(cfg.alert.max_attempts, 3);
        assert!(cfg.upstreams.is_empty());
    }

    #[test]
    fn reject_invalid_listen() {
        let toml = FULL_TOML.replace("tcp://127.0.0.1:9092", "http://bad");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn reject_duplicate_upstream_names() {
        let toml = FULL_TOML.replace("name = \"events\"", "name = \"metrics\"");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn reject_zero_attempts() {
        let toml = FULL_TOML.replace("max_attempts = 5", "max_attempts = 0");
        assert!(toml.parse::<EngineConfig>().is_err());
    }

    #[test]
    fn load_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickd.toml");
        std::fs::write(&path, FULL_TOML).unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.alert.max_attempts, 5);

        let err = EngineConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"), "{err}");
    }

    #[test]
    fn toml_roundtrip_is_stable() {
        let cfg: EngineConfig = FULL_TOML.parse().unwrap();
        let serialized = toml::to_string(&cfg).unwrap();
        let back: EngineConfig = serialized.parse().unwrap();
        assert_eq!(cfg, back);
    }
}
