use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use host_dedup_core::{EmitFailurePolicy, ResolverOptions, StalenessConfig, DEFAULT_CHUNK_SIZE};
use host_dedup_events::MqttSinkConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV_VAR: &str = "HOST_DEDUP_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "hostdedup.yaml";
pub const DEFAULT_EVENTS_FILE: &str = "host_delete_events.ndjson";

/// Where delete events go.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "sink", rename_all = "snake_case")]
pub enum EventsConfig {
    Ndjson { path: PathBuf },
    Mqtt(MqttSinkConfig),
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self::Ndjson { path: PathBuf::from(DEFAULT_EVENTS_FILE) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub chunk_size: usize,
    pub emit_failure: EmitFailurePolicy,
    pub exclude_culled: bool,
    pub staleness: StalenessConfig,
    pub events: EventsConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            emit_failure: EmitFailurePolicy::default(),
            exclude_culled: false,
            staleness: StalenessConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl JobConfig {
    /// Parse a YAML document; an empty document yields the defaults.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn from_yaml(body: &str) -> Result<Self> {
        let config = if body.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(body).context("invalid configuration YAML")?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.resolver_options().validate().map_err(|err| anyhow!("{err}"))?;
        self.staleness.validate().map_err(|err| anyhow!("{err}"))?;
        if let EventsConfig::Mqtt(mqtt) = &self.events {
            mqtt.validate().map_err(|err| anyhow!("{err}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn resolver_options(&self) -> ResolverOptions {
        ResolverOptions {
            chunk_size: self.chunk_size,
            emit_failure: self.emit_failure,
            dry_run: false,
            exclude_culled: self.exclude_culled,
        }
    }
}

/// The configuration actually in effect and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: JobConfig,
    pub source: Option<PathBuf>,
}

/// Resolve the configuration file: `explicit` (flag), then `$HOST_DEDUP_CONFIG`,
/// then `./hostdedup.yaml` when present, else built-in defaults.
///
/// An explicitly named file must exist.
///
/// # Errors
/// Returns an error when a named file is missing, unreadable, or invalid.
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let from_env = std::env::var_os(CONFIG_ENV_VAR).filter(|value| !value.is_empty());
    let named = explicit.map(Path::to_path_buf).or_else(|| from_env.map(PathBuf::from));

    let path = match named {
        Some(path) => {
            if !path.exists() {
                return Err(anyhow!("configuration file does not exist: {}", path.display()));
            }
            path
        }
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                return Ok(LoadedConfig { config: JobConfig::default(), source: None });
            }
            fallback
        }
    };

    let body = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let config = JobConfig::from_yaml(&body)
        .with_context(|| format!("invalid configuration file {}", path.display()))?;
    Ok(LoadedConfig { config, source: Some(path) })
}
