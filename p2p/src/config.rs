use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_APP_ID: &str = "howlmesh";
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One STUN or TURN endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Connection-negotiation overrides handed to every peer connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                username: None,
                credential: None,
            }],
        }
    }
}

/// Diagnostic output settings. `prefix` tags every room span.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    pub prefix: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            prefix: DEFAULT_APP_ID.into(),
        }
    }
}

impl LoggerConfig {
    /// `EnvFilter` directive enabling this crate at the configured level.
    pub fn filter_directive(&self) -> String {
        format!("howlmesh_p2p={}", self.level)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Consecutive unanswered pings before a peer counts as lost.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_missed: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Rates for the host loop, in hertz.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub update_rate: u32,
    pub snapshot_rate: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_rate: 60,
            snapshot_rate: 20,
        }
    }
}

/// Everything a registry, its rooms and the sync layer are configured by.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub app_id: String,
    pub password: Option<String>,
    pub rtc_config: RtcConfig,
    pub relay_urls: Vec<String>,
    pub relay_redundancy: usize,
    pub logger: LoggerConfig,
    pub announce_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub negotiation_timeout_ms: u64,
    pub heartbeat: HeartbeatConfig,
    pub sync: SyncConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.into(),
            password: None,
            rtc_config: RtcConfig::default(),
            relay_urls: Vec::new(),
            relay_redundancy: 2,
            logger: LoggerConfig::default(),
            announce_interval_ms: 5_000,
            ping_timeout_ms: 5_000,
            negotiation_timeout_ms: 15_000,
            heartbeat: HeartbeatConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn with_app_id(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Build a config from `HOWL_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(app_id) = env::var("HOWL_APP_ID") {
            config.app_id = app_id;
        }
        config.password = env::var("HOWL_PASSWORD").ok().filter(|p| !p.is_empty());
        if let Ok(urls) = env::var("HOWL_RELAY_URLS") {
            config.relay_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(redundancy) = parse_var("HOWL_RELAY_REDUNDANCY")? {
            config.relay_redundancy = redundancy;
        }
        if let Ok(level) = env::var("HOWL_LOG_LEVEL") {
            config.logger.level = level;
        }
        if let Ok(prefix) = env::var("HOWL_LOG_PREFIX") {
            config.logger.prefix = prefix;
        }
        if let Some(ms) = parse_var("HOWL_ANNOUNCE_INTERVAL_MS")? {
            config.announce_interval_ms = ms;
        }
        if let Some(ms) = parse_var("HOWL_PING_TIMEOUT_MS")? {
            config.ping_timeout_ms = ms;
        }
        if let Some(ms) = parse_var("HOWL_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat.interval_ms = ms;
        }
        if let Some(missed) = parse_var("HOWL_HEARTBEAT_MAX_MISSED")? {
            config.heartbeat.max_missed = missed;
        }
        if let Some(rate) = parse_var("HOWL_UPDATE_RATE")? {
            config.sync.update_rate = rate;
        }
        if let Some(rate) = parse_var("HOWL_SNAPSHOT_RATE")? {
            config.sync.snapshot_rate = rate;
        }

        Ok(config)
    }

    /// The relays actually used: the first `relay_redundancy` of `relay_urls`.
    pub fn selected_relays(&self) -> &[String] {
        let count = self.relay_redundancy.clamp(1, self.relay_urls.len().max(1));
        &self.relay_urls[..count.min(self.relay_urls.len())]
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms.max(1))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MeshConfig::default();
        assert_eq!(config.app_id, "howlmesh");
        assert!(config.password.is_none());
        assert!(!config.rtc_config.ice_servers.is_empty());
        assert_eq!(config.sync.update_rate, 60);
        assert_eq!(config.sync.snapshot_rate, 20);
        assert_eq!(config.heartbeat.max_missed, 3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = MeshConfig::from_json(
            r#"{"app_id":"wolves","password":"hunter2","heartbeat":{"interval_ms":250},"relay_urls":["http://a","http://b","http://c"]}"#,
        )
        .unwrap();
        assert_eq!(config.app_id, "wolves");
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.heartbeat.interval_ms, 250);
        assert_eq!(config.heartbeat.max_missed, 3);
        assert_eq!(config.ping_timeout_ms, 5_000);
        assert_eq!(config.relay_urls.len(), 3);
    }

    #[test]
    fn turn_servers_replace_the_default_stun() {
        let config = MeshConfig::from_json(
            r#"{"rtc_config":{"ice_servers":[{"urls":["turn:turn.example.com:3478"],"username":"u","credential":"p"}]}}"#,
        )
        .unwrap();
        let servers = &config.rtc_config.ice_servers;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, ["turn:turn.example.com:3478"]);
        assert_eq!(servers[0].credential.as_deref(), Some("p"));

        let stun = &RtcConfig::default().ice_servers[0];
        assert_eq!(stun.urls, [DEFAULT_STUN_URL]);
        assert!(stun.username.is_none());
    }

    #[test]
    fn selected_relays_respects_redundancy() {
        let mut config = MeshConfig::default();
        assert!(config.selected_relays().is_empty());

        config.relay_urls = vec!["http://a".into(), "http://b".into(), "http://c".into()];
        config.relay_redundancy = 2;
        assert_eq!(config.selected_relays(), ["http://a", "http://b"]);

        config.relay_redundancy = 0;
        assert_eq!(config.selected_relays(), ["http://a"]);

        config.relay_redundancy = 10;
        assert_eq!(config.selected_relays().len(), 3);
    }

    #[test]
    fn filter_directive_uses_level() {
        let logger = LoggerConfig {
            level: "debug".into(),
            prefix: "pack".into(),
        };
        assert_eq!(logger.filter_directive(), "howlmesh_p2p=debug");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            MeshConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
