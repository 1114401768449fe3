//! Server configuration.
//!
//! Layered resolution with precedence defaults < config file < environment
//! < CLI flags. The file is JSON with the same key names as the `WIRECHAT_*`
//! environment variables; durations are whole seconds.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub database_path: PathBuf,
    pub read_header_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_message_bytes: usize,
    pub rate_limit_join_per_min: u32,
    pub rate_limit_msg_per_min: u32,
    pub ping_interval: Duration,
    pub client_idle_timeout: Duration,
    pub jwt_secret: String,
    pub jwt_audience: String,
    pub jwt_issuer: String,
    pub jwt_required: bool,
    pub livekit: LiveKitConfig,
}

#[derive(Debug, Clone, Default)]
pub struct LiveKitConfig {
    pub enabled: bool,
    pub api_key: String,
    pub api_secret: String,
    pub ws_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("data/wirechat.db"),
            read_header_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            max_message_bytes: 1 << 20,
            rate_limit_join_per_min: 60,
            rate_limit_msg_per_min: 300,
            ping_interval: Duration::from_secs(30),
            // 3x ping interval, leaving headroom for ping/pong cycles.
            client_idle_timeout: Duration::from_secs(90),
            jwt_secret: "dev-secret-change-in-production".to_string(),
            jwt_audience: "wirechat".to_string(),
            jwt_issuer: "wirechat-server".to_string(),
            jwt_required: false,
            livekit: LiveKitConfig::default(),
        }
    }
}

/// Optional keys as they appear in the JSON config file.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    addr: Option<String>,
    database_path: Option<String>,
    read_header_timeout: Option<u64>,
    shutdown_timeout: Option<u64>,
    max_message_bytes: Option<usize>,
    rate_limit_join_per_min: Option<u32>,
    rate_limit_msg_per_min: Option<u32>,
    ping_interval: Option<u64>,
    client_idle_timeout: Option<u64>,
    jwt_secret: Option<String>,
    jwt_audience: Option<String>,
    jwt_issuer: Option<String>,
    jwt_required: Option<bool>,
    livekit: Option<FileLiveKitConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileLiveKitConfig {
    enabled: Option<bool>,
    api_key: Option<String>,
    api_secret: Option<String>,
    ws_url: Option<String>,
}

impl ServerConfig {
    /// Resolve configuration from defaults, an optional config file, and the
    /// environment. CLI flags are applied afterwards by the caller via
    /// [`ServerConfig::apply_key`].
    pub fn load(file: Option<&Path>) -> Self {
        let mut config = Self::default();

        if let Some(path) = file {
            match std::fs::read_to_string(path) {
                Ok(raw) => match serde_json::from_str::<FileConfig>(&raw) {
                    Ok(file_cfg) => config.apply_file(file_cfg),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "invalid config file, ignoring");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!(path = %path.display(), "config file not found, using defaults");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read config file");
                }
            }
        }

        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            addr,
            database_path,
            read_header_timeout,
            shutdown_timeout,
            max_message_bytes,
            rate_limit_join_per_min,
            rate_limit_msg_per_min,
            ping_interval,
            client_idle_timeout,
            jwt_secret,
            jwt_audience,
            jwt_issuer,
            jwt_required,
            livekit,
        } = file;

        if let Some(addr) = addr {
            match addr.parse() {
                Ok(parsed) => self.addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "invalid addr in config file, keeping default"),
            }
        }
        if let Some(path) = database_path {
            self.database_path = PathBuf::from(path);
        }
        if let Some(secs) = read_header_timeout {
            self.read_header_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = shutdown_timeout {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = max_message_bytes {
            self.max_message_bytes = bytes;
        }
        if let Some(n) = rate_limit_join_per_min {
            self.rate_limit_join_per_min = n;
        }
        if let Some(n) = rate_limit_msg_per_min {
            self.rate_limit_msg_per_min = n;
        }
        if let Some(secs) = ping_interval {
            self.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = client_idle_timeout {
            self.client_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secret) = jwt_secret {
            self.jwt_secret = secret;
        }
        if let Some(audience) = jwt_audience {
            self.jwt_audience = audience;
        }
        if let Some(issuer) = jwt_issuer {
            self.jwt_issuer = issuer;
        }
        if let Some(required) = jwt_required {
            self.jwt_required = required;
        }
        if let Some(lk) = livekit {
            if let Some(enabled) = lk.enabled {
                self.livekit.enabled = enabled;
            }
            if let Some(key) = lk.api_key {
                self.livekit.api_key = key;
            }
            if let Some(secret) = lk.api_secret {
                self.livekit.api_secret = secret;
            }
            if let Some(url) = lk.ws_url {
                self.livekit.ws_url = url;
            }
        }
    }

    fn apply_env(&mut self) {
        for key in KEYS {
            if let Ok(value) = std::env::var(env_name(key)) {
                if let Err(e) = self.apply_key(key, &value) {
                    tracing::warn!(key = env_name(key), value = %value, error = %e, "invalid environment override");
                }
            }
        }
    }

    /// Apply a single `key=value` override. Shared by the env layer and the
    /// CLI flag layer so both accept the same key names and value formats.
    pub fn apply_key(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "addr" => self.addr = value.parse().map_err(|_| "expected host:port".to_string())?,
            "database_path" => self.database_path = PathBuf::from(value),
            "read_header_timeout" => self.read_header_timeout = parse_secs(value)?,
            "shutdown_timeout" => self.shutdown_timeout = parse_secs(value)?,
            "max_message_bytes" => {
                self.max_message_bytes = value.parse().map_err(|_| "expected byte count".to_string())?
            }
            "rate_limit_join_per_min" => {
                self.rate_limit_join_per_min = value.parse().map_err(|_| "expected integer".to_string())?
            }
            "rate_limit_msg_per_min" => {
                self.rate_limit_msg_per_min = value.parse().map_err(|_| "expected integer".to_string())?
            }
            "ping_interval" => self.ping_interval = parse_secs(value)?,
            "client_idle_timeout" => self.client_idle_timeout = parse_secs(value)?,
            "jwt_secret" => self.jwt_secret = value.to_string(),
            "jwt_audience" => self.jwt_audience = value.to_string(),
            "jwt_issuer" => self.jwt_issuer = value.to_string(),
            "jwt_required" => self.jwt_required = parse_bool(value)?,
            "livekit_enabled" => self.livekit.enabled = parse_bool(value)?,
            "livekit_api_key" => self.livekit.api_key = value.to_string(),
            "livekit_api_secret" => self.livekit.api_secret = value.to_string(),
            "livekit_ws_url" => self.livekit.ws_url = value.to_string(),
            other => return Err(format!("unknown config key: {other}")),
        }
        Ok(())
    }
}

/// Every overridable key, in `apply_key` spelling.
pub const KEYS: &[&str] = &[
    "addr",
    "database_path",
    "read_header_timeout",
    "shutdown_timeout",
    "max_message_bytes",
    "rate_limit_join_per_min",
    "rate_limit_msg_per_min",
    "ping_interval",
    "client_idle_timeout",
    "jwt_secret",
    "jwt_audience",
    "jwt_issuer",
    "jwt_required",
    "livekit_enabled",
    "livekit_api_key",
    "livekit_api_secret",
    "livekit_ws_url",
];

fn env_name(key: &str) -> String {
    format!("WIRECHAT_{}", key.to_uppercase())
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| "expected whole seconds".to_string())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err("expected true/false".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.client_idle_timeout, config.ping_interval * 3);
        assert!(!config.jwt_required);
        assert!(!config.livekit.enabled);
    }

    #[test]
    fn apply_key_overrides() {
        let mut config = ServerConfig::default();
        config.apply_key("addr", "127.0.0.1:9000").unwrap();
        config.apply_key("ping_interval", "10").unwrap();
        config.apply_key("jwt_required", "true").unwrap();
        config.apply_key("livekit_enabled", "1").unwrap();

        assert_eq!(config.addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert!(config.jwt_required);
        assert!(config.livekit.enabled);
    }

    #[test]
    fn apply_key_rejects_garbage() {
        let mut config = ServerConfig::default();
        assert!(config.apply_key("addr", "not-an-addr").is_err());
        assert!(config.apply_key("jwt_required", "maybe").is_err());
        assert!(config.apply_key("no_such_key", "1").is_err());
    }

    #[test]
    fn file_layer_applies_partial_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"addr": "127.0.0.1:9999", "jwt_required": true, "livekit": {"enabled": true, "ws_url": "ws://sfu:7880"}}"#,
        )
        .unwrap();

        let config = ServerConfig::load(Some(&path));
        assert_eq!(config.addr, ([127, 0, 0, 1], 9999).into());
        assert!(config.jwt_required);
        assert!(config.livekit.enabled);
        assert_eq!(config.livekit.ws_url, "ws://sfu:7880");
        // Untouched keys keep their defaults.
        assert_eq!(config.rate_limit_msg_per_min, 300);
    }
}
