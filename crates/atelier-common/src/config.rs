//! ---
//! atelier_section: "01-core-functionality"
//! atelier_subsection: "module"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Configuration model and loading for Atelier services."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_namespace() -> String {
    "atelier:".to_owned()
}

fn default_reconnect_initial_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Top-level configuration shared by Atelier services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pubsub: PubSubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "ATELIER_CONFIG";
    pub const ENV_PUBSUB_MODE: &str = "ATELIER_PUBSUB_MODE";
    pub const ENV_PUBSUB_URL: &str = "ATELIER_PUBSUB_URL";
    pub const ENV_PUBSUB_NAMESPACE: &str = "ATELIER_PUBSUB_NAMESPACE";

    /// Load configuration from disk, respecting the `ATELIER_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ATELIER_PUBSUB_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ATELIER_PUBSUB_*` overrides resolved through `lookup`, then
    /// re-validate.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup(Self::ENV_PUBSUB_MODE) {
            self.pubsub.mode = mode
                .parse::<AdapterMode>()
                .map_err(|err: String| anyhow!(err))
                .with_context(|| format!("invalid {}", Self::ENV_PUBSUB_MODE))?;
        }
        if let Some(url) = lookup(Self::ENV_PUBSUB_URL) {
            self.pubsub.url = Some(url);
        }
        if let Some(namespace) = lookup(Self::ENV_PUBSUB_NAMESPACE) {
            self.pubsub.namespace = namespace;
        }
        self.validate()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.pubsub.validate()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Which pub/sub adapter a deployment runs.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterMode {
    /// Single process; no broker.
    #[default]
    Local,
    /// Several instances sharing a broker.
    Distributed,
}

impl AdapterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterMode::Local => "local",
            AdapterMode::Distributed => "distributed",
        }
    }
}

impl std::fmt::Display for AdapterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AdapterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(AdapterMode::Local),
            "distributed" => Ok(AdapterMode::Distributed),
            other => Err(format!("unknown pubsub mode: {}", other)),
        }
    }
}

/// `[pubsub]` section.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubConfig {
    #[serde(default)]
    pub mode: AdapterMode,
    /// Broker connection string, e.g. `redis://127.0.0.1:6379`.
    #[serde(default)]
    pub url: Option<String>,
    /// Prefix applied to every transport-level channel.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(
        rename = "reconnect_initial_delay_ms",
        default = "default_reconnect_initial_delay"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_initial_delay: Duration,
    #[serde(
        rename = "reconnect_max_delay_ms",
        default = "default_reconnect_max_delay"
    )]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_max_delay: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            mode: AdapterMode::default(),
            url: None,
            namespace: default_namespace(),
            reconnect_initial_delay: default_reconnect_initial_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
        }
    }
}

impl PubSubConfig {
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(anyhow!("pubsub namespace must not be empty"));
        }
        if self.mode == AdapterMode::Distributed
            && self.url.as_deref().map_or(true, |url| url.trim().is_empty())
        {
            return Err(anyhow!("pubsub url is required when mode = distributed"));
        }
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err(anyhow!(
                "pubsub reconnect_initial_delay_ms ({}) exceeds reconnect_max_delay_ms ({})",
                self.reconnect_initial_delay.as_millis(),
                self.reconnect_max_delay.as_millis()
            ));
        }
        Ok(())
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::str::FromStr;

    use super::*;

    #[test]
    fn empty_document_yields_local_defaults() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config.pubsub.mode, AdapterMode::Local);
        assert_eq!(config.pubsub.namespace, "atelier:");
        assert_eq!(config.pubsub.reconnect_initial_delay, Duration::from_millis(250));
        assert_eq!(config.pubsub.reconnect_max_delay, Duration::from_secs(10));
        assert!(config.logging.directory.is_none());
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
    }

    #[test]
    fn parses_distributed_section() {
        let config = AppConfig::from_str(
            r#"
            [pubsub]
            mode = "distributed"
            url = "redis://cache:6379/1"
            namespace = "staging:"
            reconnect_initial_delay_ms = 100
            reconnect_max_delay_ms = 2000

            [logging]
            format = "pretty"
            directory = "target/logs"
            "#,
        )
        .unwrap();
        assert_eq!(config.pubsub.mode, AdapterMode::Distributed);
        assert_eq!(config.pubsub.url.as_deref(), Some("redis://cache:6379/1"));
        assert_eq!(config.pubsub.namespace, "staging:");
        assert_eq!(config.pubsub.reconnect_initial_delay, Duration::from_millis(100));
        assert_eq!(config.pubsub.reconnect_max_delay, Duration::from_secs(2));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.directory, Some(PathBuf::from("target/logs")));
    }

    #[test]
    fn distributed_requires_url() {
        let err = AppConfig::from_str("[pubsub]\nmode = \"distributed\"\n").unwrap_err();
        assert!(err.to_string().contains("url"));
        assert!(AppConfig::from_str("[pubsub]\nmode = \"distributed\"\nurl = \" \"\n").is_err());
    }

    #[test]
    fn rejects_empty_namespace_and_inverted_backoff() {
        assert!(AppConfig::from_str("[pubsub]\nnamespace = \"\"\n").is_err());
        assert!(AppConfig::from_str(
            "[pubsub]\nreconnect_initial_delay_ms = 5000\nreconnect_max_delay_ms = 10\n"
        )
        .is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(AppConfig::from_str("[pubsub]\nmode = \"cluster\"\n").is_err());
        assert!(AdapterMode::from_str("cluster").is_err());
        assert_eq!(
            AdapterMode::from_str(" Distributed ").unwrap(),
            AdapterMode::Distributed
        );
    }

    #[test]
    fn overrides_take_precedence_over_file_values() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            (AppConfig::ENV_PUBSUB_MODE, "distributed"),
            (AppConfig::ENV_PUBSUB_URL, "redis://override:6379"),
            (AppConfig::ENV_PUBSUB_NAMESPACE, "blue:"),
        ]);
        config
            .apply_overrides(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();
        assert_eq!(config.pubsub.mode, AdapterMode::Distributed);
        assert_eq!(config.pubsub.url.as_deref(), Some("redis://override:6379"));
        assert_eq!(config.pubsub.namespace, "blue:");
    }

    #[test]
    fn invalid_override_is_reported() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == AppConfig::ENV_PUBSUB_MODE).then(|| "mesh".to_owned()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("unknown pubsub mode"));

        let mut config = AppConfig::default();
        assert!(config
            .apply_overrides(|key| {
                (key == AppConfig::ENV_PUBSUB_MODE).then(|| "distributed".to_owned())
            })
            .is_err());
    }

    #[test]
    fn missing_candidates_are_listed() {
        let err = AppConfig::load_with_source(&["does/not/exist.toml"]).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.toml"));
    }
}
