// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Daemon settings.
//!
//! Settings are read once from a structured file and validated up front; a
//! missing or invalid required value is a [`ConfigError`] and the process
//! must not start. The resulting [`Settings`] value is an immutable snapshot
//! shared read-only for the life of the run.
//!
//! # Example JSON Configuration
//!
//! ```json
//! {
//!     "flow": {
//!         "server": "https://studio.example.com",
//!         "script_name": "events",
//!         "script_key": "..."
//!     },
//!     "service": {
//!         "name": "flowhook",
//!         "log_dir": "/var/log/flowhook",
//!         "event_id_filename": "{service_name}.id",
//!         "pid_filename": "{service_name}.pid",
//!         "log_filename": "{service_name}.log",
//!         "conn_retry_sleep": 60,
//!         "max_conn_retries": 5,
//!         "fetch_interval": 5,
//!         "log_level": 20
//!     },
//!     "plugins": {"paths": ["./plugins"]},
//!     "email": {"server": "smtp.example.com", "subject": "[{service_name}] {server}"}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Default config file name looked up in the working directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Environment variable holding the config path.
pub const CONFIG_ENV_VAR: &str = "FLOWHOOK_CONFIG";

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find config path at [{0}]")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Script name and key used to authenticate against the tracking service.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptCredentials {
    pub script_name: String,
    pub script_key: String,
}

impl ScriptCredentials {
    pub fn new(script_name: impl Into<String>, script_key: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            script_key: script_key.into(),
        }
    }
}

impl fmt::Debug for ScriptCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptCredentials")
            .field("script_name", &self.script_name)
            .field("script_key", &"<redacted>")
            .finish()
    }
}

/// Resolves the credentials a plugin registers its callbacks with.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, plugin: &str) -> ScriptCredentials;
}

/// Hands every plugin the same credentials.
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub ScriptCredentials);

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, _plugin: &str) -> ScriptCredentials {
        self.0.clone()
    }
}

/// Tracking service connection options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSection {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub script_name: Option<String>,
    #[serde(default)]
    pub script_key: Option<String>,
    /// `host:port`; an empty string means no proxy.
    #[serde(default)]
    pub proxy_server: Option<String>,
    /// Propagate each event's session uuid into updates made by plugins.
    #[serde(default)]
    pub use_session_uuid: bool,
}

/// General daemon operational settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_event_id_filename")]
    pub event_id_filename: String,
    #[serde(default = "default_pid_filename")]
    pub pid_filename: String,
    #[serde(default = "default_log_filename")]
    pub log_filename: String,
    /// Seconds to wait before retrying a failed connection.
    #[serde(default = "default_conn_retry_sleep")]
    pub conn_retry_sleep: u64,
    /// Retries before an error-level message is logged.
    #[serde(default = "default_max_conn_retries")]
    pub max_conn_retries: u32,
    /// Seconds to wait before requesting new events after a batch.
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval: u64,
    #[serde(default = "default_max_event_batch_size")]
    pub max_event_batch_size: usize,
    /// 0 = everything in the main log, 1 = one file per plugin.
    #[serde(default)]
    pub log_mode: u8,
    /// Numeric threshold: 10 debug, 20 info, 30 warning, 40 error, 50 critical.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// `"on"` enables the timing log.
    #[serde(default)]
    pub timing_log: Option<String>,
}

fn default_event_id_filename() -> String {
    "{service_name}.id".to_string()
}

fn default_pid_filename() -> String {
    "{service_name}.pid".to_string()
}

fn default_log_filename() -> String {
    "{service_name}.log".to_string()
}

fn default_conn_retry_sleep() -> u64 {
    60
}

fn default_max_conn_retries() -> u32 {
    5
}

fn default_fetch_interval() -> u64 {
    5
}

fn default_max_event_batch_size() -> usize {
    500
}

fn default_log_level() -> u8 {
    20
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: None,
            log_dir: None,
            event_id_filename: default_event_id_filename(),
            pid_filename: default_pid_filename(),
            log_filename: default_log_filename(),
            conn_retry_sleep: default_conn_retry_sleep(),
            max_conn_retries: default_max_conn_retries(),
            fetch_interval: default_fetch_interval(),
            max_event_batch_size: default_max_event_batch_size(),
            log_mode: 0,
            log_level: default_log_level(),
            timing_log: None,
        }
    }
}

/// Plugin related settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsSection {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Per-plugin script credentials keyed by plugin name.
    #[serde(default)]
    pub credentials: BTreeMap<String, ScriptCredentials>,
}

/// Email alert settings. Alerts are only sent when server, from and to are
/// all provided.
#[derive(Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    /// May contain `{server}`, `{script_name}` and `{service_name}`.
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
}

fn default_smtp_port() -> u16 {
    25
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            server: None,
            port: default_smtp_port(),
            from: None,
            to: Vec::new(),
            subject: None,
            username: None,
            password: None,
            use_tls: false,
        }
    }
}

impl EmailSettings {
    pub fn is_complete(&self) -> bool {
        self.server.is_some() && self.from.is_some() && !self.to.is_empty()
    }
}

impl fmt::Debug for EmailSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailSettings")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject", &self.subject)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// The on-disk layout of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub flow: FlowSection,
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub plugins: PluginsSection,
    #[serde(default)]
    pub email: EmailSettings,
}

/// How log output is split across files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// All messages in the main log file.
    Single,
    /// One main file for the engine, one file per plugin.
    PerPlugin,
}

/// Validated, read-only settings snapshot.
#[derive(Debug, Clone)]
pub struct Settings {
    path: Option<PathBuf>,
    file: SettingsFile,
    server: String,
    engine_credentials: ScriptCredentials,
    service_name: String,
    log_dir: PathBuf,
}

impl Settings {
    /// Find the settings file: an explicit path, then `FLOWHOOK_CONFIG`, then
    /// `config.json` in the working directory.
    pub fn discover(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let candidate = match explicit {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV_VAR) {
                Some(path) => PathBuf::from(path),
                None => PathBuf::from(CONFIG_FILENAME),
            },
        };
        let candidate = absolutize(&candidate);
        if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(ConfigError::NotFound(candidate))
        }
    }

    /// Discover and load the settings file.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::discover(explicit)?;
        tracing::info!(path = %path.display(), "Loading settings");
        Self::from_file(&path)
    }

    /// Load settings from a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SettingsFile = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        let mut settings = Self::from_parts(file)?;
        settings.path = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::from_parts(serde_json::from_str(json)?)
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Self::from_parts(toml::from_str(toml_str)?)
    }

    /// Validate a parsed settings file.
    pub fn from_parts(file: SettingsFile) -> Result<Self, ConfigError> {
        let server = required(&file.flow.server, "flow.server")?;
        let script_name = required(&file.flow.script_name, "flow.script_name")?;
        let script_key = required(&file.flow.script_key, "flow.script_key")?;

        let service_name = required(&file.service.name, "service.name")?;
        if service_name.contains(' ') {
            return Err(ConfigError::Invalid {
                key: "service.name",
                reason: format!("Service Name cannot contain spaces: {service_name}"),
            });
        }

        let log_dir = file
            .service
            .log_dir
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(absolutize)
            .ok_or(ConfigError::Missing("service.log_dir"))?;

        if file.service.max_event_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "service.max_event_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if file.service.log_mode > 1 {
            return Err(ConfigError::Invalid {
                key: "service.log_mode",
                reason: format!("expected 0 or 1, got {}", file.service.log_mode),
            });
        }

        Ok(Self {
            path: None,
            server,
            engine_credentials: ScriptCredentials::new(script_name, script_key),
            service_name,
            log_dir,
            file,
        })
    }

    /// Path the settings were read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The raw, parsed file contents.
    pub fn file(&self) -> &SettingsFile {
        &self.file
    }

    /// Tracking service URL.
    pub fn connection_url(&self) -> &str {
        &self.server
    }

    /// Credentials the engine itself connects with.
    pub fn engine_credentials(&self) -> &ScriptCredentials {
        &self.engine_credentials
    }

    /// Credentials for `plugin`, falling back to the engine credentials.
    pub fn credentials(&self, plugin: &str) -> ScriptCredentials {
        self.file
            .plugins
            .credentials
            .get(plugin)
            .cloned()
            .unwrap_or_else(|| self.engine_credentials.clone())
    }

    pub fn proxy_server(&self) -> Option<&str> {
        self.file
            .flow
            .proxy_server
            .as_deref()
            .filter(|proxy| !proxy.is_empty())
    }

    pub fn use_session_uuid(&self) -> bool {
        self.file.flow.use_session_uuid
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Absolute directory holding logs and state files.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_secs(self.file.service.conn_retry_sleep)
    }

    pub fn max_retries(&self) -> u32 {
        self.file.service.max_conn_retries
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.file.service.fetch_interval)
    }

    pub fn max_batch_size(&self) -> usize {
        self.file.service.max_event_batch_size
    }

    /// Plugin search paths, made absolute.
    pub fn plugin_search_paths(&self) -> Vec<PathBuf> {
        self.file.plugins.paths.iter().map(|p| absolutize(p)).collect()
    }

    /// Numeric engine log threshold.
    pub fn log_level(&self) -> u8 {
        self.file.service.log_level
    }

    pub fn log_level_filter(&self) -> LevelFilter {
        level_from_numeric(self.log_level())
    }

    pub fn log_mode(&self) -> LogMode {
        match self.file.service.log_mode {
            1 => LogMode::PerPlugin,
            _ => LogMode::Single,
        }
    }

    /// Log file path; `name` overrides the configured file name. Both may
    /// contain `{service_name}`.
    pub fn log_file(&self, name: Option<&str>) -> PathBuf {
        let template = name.unwrap_or(&self.file.service.log_filename);
        self.in_log_dir(template)
    }

    /// Timing log path, when `service.timing_log` is `"on"`.
    pub fn timing_log_file(&self) -> Option<PathBuf> {
        if self.file.service.timing_log.as_deref() != Some("on") {
            return None;
        }
        let log_file = self.log_file(None);
        let name = log_file.file_name()?.to_string_lossy().into_owned();
        let stem = name.strip_suffix(".log").unwrap_or(&name);
        Some(log_file.with_file_name(format!("{stem}.timing")))
    }

    /// Where the id of the last processed event is stored.
    pub fn event_id_file(&self) -> PathBuf {
        self.in_log_dir(&self.file.service.event_id_filename)
    }

    /// Where the daemon stores its process id.
    pub fn pid_file(&self) -> PathBuf {
        self.in_log_dir(&self.file.service.pid_filename)
    }

    pub fn email(&self) -> &EmailSettings {
        &self.file.email
    }

    /// Email subject with `{server}`, `{script_name}` and `{service_name}`
    /// substituted.
    pub fn email_subject(&self) -> Option<String> {
        let template = self.file.email.subject.as_deref()?;
        Some(render_template(
            template,
            &[
                ("server", self.connection_url()),
                ("script_name", &self.engine_credentials.script_name),
                ("service_name", self.service_name()),
            ],
        ))
    }

    fn in_log_dir(&self, template: &str) -> PathBuf {
        let filename = render_template(template, &[("service_name", self.service_name())]);
        self.log_dir.join(filename)
    }
}

impl CredentialProvider for Settings {
    fn credentials(&self, plugin: &str) -> ScriptCredentials {
        Settings::credentials(self, plugin)
    }
}

fn required(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(key))
}

/// Substitute `{name}` tokens. Unknown tokens are left in place.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

/// Map a numeric threshold onto a tracing level filter.
pub fn level_from_numeric(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::TRACE,
        1..=10 => LevelFilter::DEBUG,
        11..=20 => LevelFilter::INFO,
        21..=30 => LevelFilter::WARN,
        31..=50 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

/// Join `path` onto `base` unless it is already absolute, then drop `.` and
/// resolve `..` lexically.
pub fn resolve_path(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Resolve a path against the working directory.
pub fn absolutize(path: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_default();
    resolve_path(path, &cwd)
}
