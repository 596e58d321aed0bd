//! Agent configuration. Loaded from JSON; server URL and key may come from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_CONFIG_PATH: &str = "SIEM_AGENT_CONFIG";
pub const ENV_SERVER_URL: &str = "SIEM_SERVER_URL";
pub const ENV_API_KEY: &str = "SIEM_API_KEY";

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_SEND_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_QUEUE_CAPACITY: usize = crate::queue::DEFAULT_QUEUE_CAPACITY;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_EVENTS_PER_TICK: usize = 100;
pub const DEFAULT_INTEGRITY_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_INVENTORY_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_APPROVAL_POLL_SECS: u64 = 10;
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_SCRIPT_POLL_SECS: u64 = 30;
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("server url is not configured (set server.url or SIEM_SERVER_URL)")]
    MissingServerUrl,
    #[error("server url must be http(s): {0}")]
    InvalidServerUrl(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Working directory for the agent (identity backup, logs)
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    pub collector: CollectorConfig,
    pub queue: QueueConfig,
    pub sender: SenderConfig,
    pub heartbeat: HeartbeatConfig,
    pub inventory: InventoryConfig,
    pub protection: ProtectionConfig,
    pub software_control: SoftwareControlConfig,
    pub scripts: ScriptConfig,
    pub log: LogConfig,
    /// How long shutdown waits for workers before aborting them
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    /// Pre-shared key sent as `X-API-Key`
    pub api_key: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub enabled: bool,
    /// Per-channel wake-up interval (milliseconds)
    pub poll_interval_ms: u64,
    /// Records drained per channel per tick
    pub max_events_per_tick: usize,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    pub enabled: bool,
    pub exclude_event_ids: Vec<u32>,
    /// Drop events below this severity; 0 disables the filter
    pub min_severity: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub batch_size: usize,
    pub send_interval_secs: u64,
    /// Retries after the first attempt
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub enabled: bool,
    pub integrity_check: bool,
    pub harden_acl: bool,
    pub monitor_service: bool,
    pub check_interval_secs: u64,
    /// Files or directories to hash and harden
    pub protected_paths: Vec<PathBuf>,
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareControlConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub approval_timeout_secs: u64,
    /// Software names (case-insensitive substrings) approved without asking the server
    pub auto_approve: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            collector: CollectorConfig::default(),
            queue: QueueConfig::default(),
            sender: SenderConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            inventory: InventoryConfig::default(),
            protection: ProtectionConfig::default(),
            software_control: SoftwareControlConfig::default(),
            scripts: ScriptConfig::default(),
            log: LogConfig::default(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("siem-agent"))
        .unwrap_or_else(|| PathBuf::from(".siem-agent"))
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_events_per_tick: DEFAULT_MAX_EVENTS_PER_TICK,
            channels: vec![
                ChannelConfig {
                    name: "Security".to_string(),
                    // filtering platform connection noise
                    exclude_event_ids: vec![5156, 5158],
                    ..ChannelConfig::default()
                },
                ChannelConfig::named("System"),
                ChannelConfig::named("Application"),
                ChannelConfig::named("Microsoft-Windows-Sysmon/Operational"),
                ChannelConfig {
                    name: "Microsoft-Windows-PowerShell/Operational".to_string(),
                    enabled: false,
                    ..ChannelConfig::default()
                },
            ],
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            exclude_event_ids: Vec::new(),
            min_severity: 0,
        }
    }
}

impl ChannelConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            send_interval_secs: DEFAULT_SEND_INTERVAL_SECS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_INVENTORY_INTERVAL_SECS,
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            integrity_check: true,
            harden_acl: true,
            monitor_service: true,
            check_interval_secs: DEFAULT_INTEGRITY_INTERVAL_SECS,
            protected_paths: Vec::new(),
            service_name: "SIEMAgent".to_string(),
        }
    }
}

impl Default for SoftwareControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: DEFAULT_APPROVAL_POLL_SECS,
            approval_timeout_secs: DEFAULT_APPROVAL_TIMEOUT_SECS,
            auto_approve: Vec::new(),
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        let (interpreter, interpreter_args) = if cfg!(windows) {
            (
                "powershell.exe".to_string(),
                vec![
                    "-NoProfile".to_string(),
                    "-NonInteractive".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-Command".to_string(),
                ],
            )
        } else {
            ("/bin/sh".to_string(), vec!["-c".to_string()])
        };
        Self {
            enabled: false,
            poll_interval_secs: DEFAULT_SCRIPT_POLL_SECS,
            timeout_secs: DEFAULT_SCRIPT_TIMEOUT_SECS,
            interpreter,
            interpreter_args,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

fn or_default<T: PartialEq + Default>(v: T, default: T) -> T {
    if v == T::default() {
        default
    } else {
        v
    }
}

impl AgentConfig {
    /// Read the JSON file (defaults when it does not exist) and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str::<AgentConfig>(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load, fill defaults and validate; the startup path.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?.normalized();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, get: F) {
        if let Some(url) = get(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            self.server.url = url;
        }
        if let Some(key) = get(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.server.api_key = key;
        }
    }

    /// Substitute defaults for zero intervals and sizes. `retry_attempts` is a
    /// count, so zero stays zero.
    pub fn normalized(mut self) -> Self {
        self.server.url = self.server.url.trim().trim_end_matches('/').to_string();
        self.server.request_timeout_secs =
            or_default(self.server.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        self.collector.poll_interval_ms =
            or_default(self.collector.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        self.collector.max_events_per_tick =
            or_default(self.collector.max_events_per_tick, DEFAULT_MAX_EVENTS_PER_TICK);
        self.queue.capacity = or_default(self.queue.capacity, DEFAULT_QUEUE_CAPACITY);
        self.sender.batch_size = or_default(self.sender.batch_size, DEFAULT_BATCH_SIZE);
        self.sender.send_interval_secs =
            or_default(self.sender.send_interval_secs, DEFAULT_SEND_INTERVAL_SECS);
        self.sender.retry_delay_ms = or_default(self.sender.retry_delay_ms, DEFAULT_RETRY_DELAY_MS);
        self.sender.max_retry_delay_ms =
            or_default(self.sender.max_retry_delay_ms, DEFAULT_MAX_RETRY_DELAY_MS)
                .max(self.sender.retry_delay_ms);
        self.heartbeat.interval_secs =
            or_default(self.heartbeat.interval_secs, DEFAULT_HEARTBEAT_INTERVAL_SECS);
        self.inventory.interval_secs =
            or_default(self.inventory.interval_secs, DEFAULT_INVENTORY_INTERVAL_SECS);
        self.protection.check_interval_secs =
            or_default(self.protection.check_interval_secs, DEFAULT_INTEGRITY_INTERVAL_SECS);
        self.software_control.poll_interval_secs =
            or_default(self.software_control.poll_interval_secs, DEFAULT_APPROVAL_POLL_SECS);
        self.software_control.approval_timeout_secs = or_default(
            self.software_control.approval_timeout_secs,
            DEFAULT_APPROVAL_TIMEOUT_SECS,
        );
        self.scripts.poll_interval_secs =
            or_default(self.scripts.poll_interval_secs, DEFAULT_SCRIPT_POLL_SECS);
        self.scripts.timeout_secs = or_default(self.scripts.timeout_secs, DEFAULT_SCRIPT_TIMEOUT_SECS);
        self.shutdown_grace_secs = or_default(self.shutdown_grace_secs, DEFAULT_SHUTDOWN_GRACE_SECS);
        self
    }

    /// The agent refuses to start without a usable server URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server.url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidServerUrl(url.to_string()));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Paths guarded by self-protection: configured ones, else the running binary
    /// and the config file.
    pub fn protected_paths(&self, config_path: &Path) -> Vec<PathBuf> {
        if !self.protection.protected_paths.is_empty() {
            return self.protection.protected_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            paths.push(exe);
        }
        if config_path.exists() {
            paths.push(config_path.to_path_buf());
        }
        paths
    }
}

impl SenderConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

impl CollectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled && !c.name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let c = AgentConfig::load(Path::new("definitely-missing-config.json")).unwrap();
        assert_eq!(c.sender.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(c.collector.enabled_channels().count(), 4);
    }

    #[test]
    fn validation_requires_server_url() {
        let c = AgentConfig::default().normalized();
        assert!(matches!(c.validate(), Err(ConfigError::MissingServerUrl)));

        let mut c = AgentConfig::default();
        c.server.url = "ftp://x".to_string();
        assert!(matches!(c.validate(), Err(ConfigError::InvalidServerUrl(_))));

        c.server.url = "https://siem.example/".to_string();
        let c = c.normalized();
        assert!(c.validate().is_ok());
        assert_eq!(c.server.url, "https://siem.example");
    }

    #[test]
    fn zero_values_get_defaults() {
        let json = r#"{
            "server": {"url": "http://s", "api_key": "k"},
            "sender": {"batch_size": 0, "send_interval_secs": 0, "retry_attempts": 0},
            "queue": {"capacity": 0},
            "heartbeat": {"interval_secs": 0}
        }"#;
        let c: AgentConfig = serde_json::from_str(json).unwrap();
        let c = c.normalized();
        assert_eq!(c.sender.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(c.sender.send_interval_secs, DEFAULT_SEND_INTERVAL_SECS);
        assert_eq!(c.sender.retry_attempts, 0);
        assert_eq!(c.queue.capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(c.heartbeat.interval_secs, DEFAULT_HEARTBEAT_INTERVAL_SECS);
        assert_eq!(c.server.api_key, "k");
    }

    #[test]
    fn absent_retry_attempts_uses_default() {
        let c: AgentConfig =
            serde_json::from_str(r#"{"sender": {"batch_size": 10}}"#).unwrap();
        assert_eq!(c.normalized().sender.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
    }

    #[test]
    fn env_overrides_file() {
        let mut c = AgentConfig::default();
        c.server.url = "http://file".to_string();
        c.apply_env(|k| match k {
            ENV_SERVER_URL => Some("https://env".to_string()),
            ENV_API_KEY => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(c.server.url, "https://env");
        assert!(c.server.api_key.is_empty());
    }

    #[test]
    fn file_roundtrip_and_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut c = AgentConfig::default();
        c.server.url = "http://localhost:8080".to_string();
        c.collector.channels = vec![ChannelConfig {
            name: "Security".to_string(),
            exclude_event_ids: vec![4658],
            ..ChannelConfig::default()
        }];
        std::fs::write(&path, serde_json::to_string_pretty(&c).unwrap()).unwrap();
        let loaded = AgentConfig::load(&path).unwrap();
        assert_eq!(loaded.collector.channels[0].exclude_event_ids, vec![4658]);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(AgentConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
