//! Layered process settings.
//!
//! Compiled defaults, then `~/.warden/settings.json` (or `--config`)
//! deep-merged over them, then `WARDEN_*` environment overrides. CLI flags
//! are applied last by the binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn, Level};

use warden_engine::{GateConfig, SchedulerConfig};
use warden_server::{BufferBackendKind, BufferConfig, ServerConfig};
use warden_telemetry::TelemetryConfig;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WardenSettings {
    /// Root for databases. Empty means `~/.warden`.
    pub data_dir: String,
    pub server: ServerSettings,
    pub scheduler: SchedulerSettings,
    pub permissions: PermissionSettings,
    pub buffer: BufferSettings,
    pub sandbox: SandboxSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub send_queue: usize,
    pub heartbeat_interval_ms: u64,
    pub client_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    /// Budget for draining running tasks on Ctrl-C.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            send_queue: 256,
            heartbeat_interval_ms: 30_000,
            client_timeout_ms: 90_000,
            disconnect_grace_ms: 30_000,
            shutdown_timeout_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub max_workers: usize,
    pub queue_capacity: usize,
    /// `None` disables the per-task limit.
    pub task_timeout_ms: Option<u64>,
    pub cancel_grace_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_workers: 100,
            queue_capacity: 1000,
            task_timeout_ms: Some(30 * 60 * 1000),
            cancel_grace_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSettings {
    pub skip_all: bool,
    pub allow_list: Vec<String>,
    /// Empty means the process working directory.
    pub working_dir: String,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferSettings {
    pub backend: BufferBackendKind,
    pub max_len: usize,
    pub ttl_secs: u64,
    pub prune_interval_secs: u64,
    /// Sqlite file for the stream backend. Defaults to `<dataDir>/stream.db`.
    pub path: Option<String>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            backend: BufferBackendKind::Sqlite,
            max_len: 1000,
            ttl_secs: 3600,
            prune_interval_secs: 60,
            path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".into(),
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Static,
    Jwt,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    pub disabled: bool,
    pub mode: AuthMode,
    /// Shared token (static) or HMAC key (jwt). Never written back out.
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub secret: Option<SecretString>,
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Per-target overrides, e.g. `{"warden_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
    /// Persist warn+ events to `<dataDir>/logs.db`.
    pub persist: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            modules: BTreeMap::new(),
            persist: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Tool-call database. Defaults to `<dataDir>/warden.db`.
    pub path: Option<String>,
}

pub fn settings_path() -> PathBuf {
    warden_telemetry::default_data_dir().join("settings.json")
}

/// Load from `path` (missing file means defaults) and apply process env.
pub fn load_settings_from_path(path: &Path) -> Result<WardenSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn load_file(path: &Path) -> Result<WardenSettings> {
    let defaults = serde_json::to_value(WardenSettings::default())?;
    let merged = if path.exists() {
        debug!(path = %path.display(), "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        if !user.is_object() {
            return Err(SettingsError::InvalidValue(
                "settings file must contain a JSON object".into(),
            ));
        }
        deep_merge(defaults, user)
    } else {
        debug!(path = %path.display(), "no settings file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key; arrays and scalars replace; `null` is skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target), Value::Object(source)) => {
            for (key, value) in source {
                if value.is_null() {
                    continue;
                }
                let merged = match target.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                target.insert(key, merged);
            }
            Value::Object(target)
        }
        (_, source) => source,
    }
}

/// Apply `WARDEN_*` variables looked up through `lookup`. Values that fail
/// to parse or fall out of range are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut WardenSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env(lookup);

    if let Some(v) = env.string("WARDEN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.ranged("WARDEN_PORT", 1u16, u16::MAX) {
        settings.server.port = v;
    }
    if let Some(v) = env.ranged("WARDEN_MAX_WORKERS", 1usize, 10_000) {
        settings.scheduler.max_workers = v;
    }
    if let Some(v) = env.ranged("WARDEN_QUEUE_CAPACITY", 1usize, 1_000_000) {
        settings.scheduler.queue_capacity = v;
    }
    if let Some(v) = env.ranged("WARDEN_TASK_TIMEOUT_MS", 1_000u64, 86_400_000) {
        settings.scheduler.task_timeout_ms = Some(v);
    }
    if let Some(v) = env.boolean("WARDEN_SKIP_PERMISSIONS") {
        settings.permissions.skip_all = v;
    }
    if let Some(v) = env.ranged("WARDEN_PERMISSION_TIMEOUT_MS", 1_000u64, 86_400_000) {
        settings.permissions.request_timeout_ms = Some(v);
    }
    if let Some(v) = env.string("WARDEN_SANDBOX_URL") {
        settings.sandbox.base_url = v;
    }
    if let Some(raw) = env.string("WARDEN_BUFFER_BACKEND") {
        match serde_json::from_value::<BufferBackendKind>(Value::String(raw.to_lowercase())) {
            Ok(kind) => settings.buffer.backend = kind,
            Err(_) => warn!(key = "WARDEN_BUFFER_BACKEND", value = %raw, "unknown buffer backend, ignoring"),
        }
    }
    if let Some(v) = env.string("WARDEN_AUTH_SECRET") {
        settings.auth.secret = Some(SecretString::from(v));
    }
    if let Some(v) = env.boolean("WARDEN_AUTH_DISABLED") {
        settings.auth.disabled = v;
    }
    if let Some(v) = env.string("WARDEN_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("WARDEN_DATA_DIR") {
        settings.data_dir = v;
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let raw = self.string(name)?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid boolean env var, ignoring");
        }
        parsed
    }

    fn ranged<T>(&self, name: &str, min: T, max: T) -> Option<T>
    where
        T: FromStr + PartialOrd,
    {
        let raw = self.string(name)?;
        let parsed = parse_range(&raw, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T: FromStr + PartialOrd>(raw: &str, min: T, max: T) -> Option<T> {
    let n: T = raw.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl WardenSettings {
    pub fn data_dir(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            warden_telemetry::default_data_dir()
        } else {
            PathBuf::from(&self.data_dir)
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.data_dir().join("warden.db"))
    }

    pub fn server_config(&self) -> ServerConfig {
        let s = &self.server;
        ServerConfig {
            host: s.host.clone(),
            port: s.port,
            send_queue: s.send_queue.max(1),
            heartbeat_interval: millis(s.heartbeat_interval_ms),
            client_timeout: millis(s.client_timeout_ms),
            disconnect_grace: millis(s.disconnect_grace_ms),
            prune_interval: Duration::from_secs(self.buffer.prune_interval_secs.max(1)),
            auth_disabled: self.auth.disabled,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            max_workers: s.max_workers.max(1),
            queue_capacity: s.queue_capacity.max(1),
            task_timeout: s.task_timeout_ms.map(millis),
            cancel_grace: millis(s.cancel_grace_ms),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        let p = &self.permissions;
        let working_dir = if p.working_dir.is_empty() {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
        } else {
            PathBuf::from(&p.working_dir)
        };
        GateConfig {
            skip_all: p.skip_all,
            allow_list: p.allow_list.clone(),
            working_dir,
            request_timeout: p.request_timeout_ms.map(millis),
        }
    }

    pub fn buffer_config(&self) -> BufferConfig {
        let b = &self.buffer;
        BufferConfig {
            backend: b.backend,
            max_len: b.max_len.max(1),
            ttl: Duration::from_secs(b.ttl_secs),
            sqlite_path: Some(
                b.path
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| self.data_dir().join("stream.db")),
            ),
            prune_interval: Duration::from_secs(b.prune_interval_secs.max(1)),
        }
    }

    pub fn sandbox_timeout(&self) -> Duration {
        millis(self.sandbox.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        millis(self.server.shutdown_timeout_ms)
    }

    /// Unknown level names fall back to INFO.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let level = |raw: &str| Level::from_str(raw).ok();
        TelemetryConfig {
            log_level: level(&self.logging.level).unwrap_or(Level::INFO),
            module_levels: self
                .logging
                .modules
                .iter()
                .filter_map(|(module, raw)| level(raw).map(|l| (module.clone(), l)))
                .collect(),
            log_to_sqlite: self.logging.persist,
            log_db_path: self.data_dir().join("logs.db"),
        }
    }
}
