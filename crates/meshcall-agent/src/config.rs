use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_AGENT_ADDR: &str = "http://127.0.0.1:8500";
pub const DEFAULT_MESH_DOMAIN: &str = "consul";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be a whole number of seconds, got {value:?}")]
    InvalidSeconds { key: &'static str, value: String },

    #[error("{key} must not be empty")]
    Empty { key: &'static str },
}

/// Where the agent lives and how long to wait on it and on peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub address: String,
    pub token: Option<String>,
    pub mesh_domain: String,
    pub call_timeout: Duration,
    pub agent_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_AGENT_ADDR.to_string(),
            token: None,
            mesh_domain: DEFAULT_MESH_DOMAIN.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            agent_timeout: DEFAULT_AGENT_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Reads `MESHCALL_*` variables, after loading `.env` if there is one.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let address = non_empty(&lookup, "MESHCALL_AGENT_ADDR")?.unwrap_or(defaults.address);
        let mesh_domain = non_empty(&lookup, "MESHCALL_MESH_DOMAIN")?.unwrap_or(defaults.mesh_domain);
        let token = lookup("MESHCALL_AGENT_TOKEN").filter(|t| !t.is_empty());
        let call_timeout = seconds(&lookup, "MESHCALL_CALL_TIMEOUT_SECS")?.unwrap_or(defaults.call_timeout);
        let agent_timeout = seconds(&lookup, "MESHCALL_AGENT_TIMEOUT_SECS")?.unwrap_or(defaults.agent_timeout);
        Ok(Self { address, token, mesh_domain, call_timeout, agent_timeout })
    }
}

fn non_empty(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<String>, ConfigError> {
    match lookup(key) {
        Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { key }),
        other => Ok(other),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidSeconds { key, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config(&[]).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn overrides_are_read() {
        let config = config(&[
            ("MESHCALL_AGENT_ADDR", "http://10.0.0.2:8500"),
            ("MESHCALL_AGENT_TOKEN", "s3cret"),
            ("MESHCALL_MESH_DOMAIN", "mesh.internal"),
            ("MESHCALL_CALL_TIMEOUT_SECS", "3"),
        ])
        .unwrap();
        assert_eq!(config.address, "http://10.0.0.2:8500");
        assert_eq!(config.token.as_deref(), Some("s3cret"));
        assert_eq!(config.mesh_domain, "mesh.internal");
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert_eq!(config.agent_timeout, DEFAULT_AGENT_TIMEOUT);
    }

    #[test]
    fn bad_timeouts_are_reported() {
        let err = config(&[("MESHCALL_CALL_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSeconds { key: "MESHCALL_CALL_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn empty_addresses_are_refused() {
        let err = config(&[("MESHCALL_AGENT_ADDR", " ")]).unwrap_err();
        assert!(matches!(err, ConfigError::Empty { .. }));
    }
}
