use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Config {
    pub console_url: String,
    pub agent_id: String,
    pub agent_token: String,
    pub log_level: String,
    pub log_path: Option<PathBuf>,
}

/// Every field optional: a layer may only override a subset of keys, and a
/// missing config file entirely is non-fatal (§6).
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(rename = "ConsoleUrl")]
    console_url: Option<String>,
    #[serde(rename = "AgentId")]
    agent_id: Option<String>,
    #[serde(rename = "AgentToken")]
    agent_token: Option<String>,
    #[serde(rename = "LogLevel")]
    log_level: Option<String>,
    #[serde(rename = "LogPath")]
    log_path: Option<PathBuf>,
}

impl RawConfig {
    /// Layers `other` on top of `self`; a field present in `other` wins.
    fn merge(self, other: RawConfig) -> Self {
        Self {
            console_url: other.console_url.or(self.console_url),
            agent_id: other.agent_id.or(self.agent_id),
            agent_token: other.agent_token.or(self.agent_token),
            log_level: other.log_level.or(self.log_level),
            log_path: other.log_path.or(self.log_path),
        }
    }
}

impl Config {
    /// Resolution order (§6): defaults file beside the executable, then an
    /// override file in a well-known per-machine data directory, later
    /// wins. Either file may be absent.
    pub fn load() -> Result<Self> {
        let mut raw = RawConfig::default();

        if let Some(path) = bundled_defaults_path() {
            raw = raw.merge(load_config_json_if_present(&path)?);
        }

        if let Some(path) = per_machine_override_path() {
            raw = raw.merge(load_config_json_if_present(&path)?);
        }

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let console_url = trim_owned(raw.console_url.unwrap_or_default());
        let agent_id = trim_owned(raw.agent_id.unwrap_or_default());
        let agent_token = trim_owned(raw.agent_token.unwrap_or_default());

        if console_url.is_empty() {
            bail!("agent config missing `ConsoleUrl`");
        }
        if agent_id.is_empty() {
            bail!("agent config missing `AgentId`");
        }
        if agent_token.is_empty() {
            bail!("agent config missing `AgentToken`");
        }

        let log_level = raw
            .log_level
            .map(|value| trim_owned(value))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(default_log_level);

        Ok(Self { console_url, agent_id, agent_token, log_level, log_path: raw.log_path })
    }
}

fn load_config_json_if_present(path: &Path) -> Result<RawConfig> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse JSON config {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RawConfig::default()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {}", path.display()))
        }
    }
}

fn bundled_defaults_path() -> Option<PathBuf> {
    env::current_exe().ok()?.parent().map(|dir| dir.join("agent.config.json"))
}

/// Per-machine override: `AGENT_CONFIG_PATH` wins outright, otherwise the
/// platform's standard per-machine data directory.
fn per_machine_override_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("AGENT_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    #[cfg(windows)]
    {
        let base = non_empty_env("ProgramData").unwrap_or_else(|| "C:\\ProgramData".to_string());
        Some(PathBuf::from(base).join("RemoteAgent").join("config.json"))
    }

    #[cfg(not(windows))]
    {
        Some(PathBuf::from("/etc/remote-agent/config.json"))
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_layer_wins_on_conflicting_fields() {
        let defaults = RawConfig {
            console_url: Some("wss://default/ws/agent".to_string()),
            agent_id: Some("a-default".to_string()),
            agent_token: Some("t-default".to_string()),
            log_level: None,
            log_path: None,
        };
        let overrides = RawConfig {
            console_url: None,
            agent_id: Some("a-override".to_string()),
            agent_token: None,
            log_level: Some("debug".to_string()),
            log_path: None,
        };

        let merged = defaults.merge(overrides);
        let config = Config::from_raw(merged).expect("config should assemble");

        assert_eq!(config.console_url, "wss://default/ws/agent");
        assert_eq!(config.agent_id, "a-override");
        assert_eq!(config.agent_token, "t-default");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let raw = RawConfig { agent_id: Some("a-1".to_string()), ..RawConfig::default() };
        assert!(Config::from_raw(raw).is_err());
    }

    #[test]
    fn missing_log_level_falls_back_to_default() {
        let raw = RawConfig {
            console_url: Some("wss://h/ws/agent".to_string()),
            agent_id: Some("a-1".to_string()),
            agent_token: Some("t".to_string()),
            log_level: None,
            log_path: None,
        };
        let config = Config::from_raw(raw).unwrap();
        assert_eq!(config.log_level, "info");
    }
}
