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

//! Tracing setup for the `flowhook` binary.
//!
//! Console output always; a daily-rolling file under the configured log
//! directory when settings are available; and a separate timing file when
//! `service.timing_log` is on. With `service.log_mode = 1` plugin records go
//! to `<log_dir>/<plugin>.log` instead of the main file. `RUST_LOG` overrides
//! the level derived from `service.log_level`.

use anyhow::{Context, Result};
use flowhook_core::{LogMode, Settings};
use flowhook_plugins::{PLUGIN_TARGET, TIMING_TARGET};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::field::{Field, Visit};
use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the background log writers alive; drop it last.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

pub fn init(settings: Option<&Settings>, verbose: bool) -> Result<LogGuards> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        settings.map_or(LevelFilter::INFO, Settings::log_level_filter)
    };
    // Plugin loggers gate on their own level, so let their records through.
    let directives = format!("{level},{PLUGIN_TARGET}=trace,{TIMING_TARGET}=off");

    let mut guards = Vec::new();

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&directives));

    let per_plugin = settings.is_some_and(|s| s.log_mode() == LogMode::PerPlugin);

    let file = match settings {
        Some(settings) => {
            let (writer, guard) = rolling_writer(&settings.log_file(None))?;
            guards.push(guard);
            let file_directives = if per_plugin {
                format!("{level},{PLUGIN_TARGET}=off,{TIMING_TARGET}=off")
            } else {
                directives.clone()
            };
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(env_filter(&file_directives)),
            )
        }
        None => None,
    };

    let plugin_files = match settings {
        Some(settings) if per_plugin => Some(
            PluginFilesLayer::new(settings.log_dir())
                .with_filter(Targets::new().with_target(PLUGIN_TARGET, Level::TRACE)),
        ),
        _ => None,
    };

    let timing = match settings.and_then(Settings::timing_log_file) {
        Some(path) => {
            let (writer, guard) = rolling_writer(&path)?;
            guards.push(guard);
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer)
                    .with_filter(Targets::new().with_target(TIMING_TARGET, Level::INFO)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .with(plugin_files)
        .with(timing)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuards { _guards: guards })
}

fn env_filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}

fn rolling_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .with_context(|| format!("Log file has no directory: {}", path.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("Log file has no name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(dir, name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Writes each plugin's records to its own daily-rolling `<plugin>.log`.
pub struct PluginFilesLayer {
    dir: PathBuf,
    files: Mutex<HashMap<String, RollingFileAppender>>,
}

impl PluginFilesLayer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> Layer<S> for PluginFilesLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        let mut record = PluginRecord::default();
        event.record(&mut record);
        let Some(plugin) = record.plugin else {
            return;
        };

        let line = format!(
            "{} {:>5} {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            event.metadata().level(),
            record.message
        );

        let mut files = self.files.lock();
        if !files.contains_key(&plugin) {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(format!("{plugin}.log"))
                .build(&self.dir);
            match appender {
                Ok(appender) => {
                    files.insert(plugin.clone(), appender);
                }
                Err(e) => {
                    // Logging from here would re-enter this layer.
                    eprintln!("Failed to open log file for plugin {plugin}: {e}");
                    return;
                }
            }
        }
        if let Some(file) = files.get_mut(&plugin) {
            if let Err(e) = file.write_all(line.as_bytes()) {
                eprintln!("Failed to write log for plugin {plugin}: {e}");
            }
        }
    }
}

/// The `plugin` and `message` fields of a plugin log record.
#[derive(Default)]
struct PluginRecord {
    plugin: Option<String>,
    message: String,
}

impl Visit for PluginRecord {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "plugin" => self.plugin = Some(value.to_string()),
            "message" => self.message.push_str(value),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "plugin" => self.plugin = Some(format!("{value:?}")),
            "message" => {
                let _ = write!(self.message, "{value:?}");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowhook_plugins::PluginLogger;

    fn plugin_log(dir: &Path, plugin: &str) -> String {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{plugin}.log"))
            })
            .map(|entry| std::fs::read_to_string(entry.path()).unwrap())
            .collect()
    }

    #[test]
    fn test_plugin_records_go_to_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = tracing_subscriber::registry().with(
            PluginFilesLayer::new(dir.path())
                .with_filter(Targets::new().with_target(PLUGIN_TARGET, Level::TRACE)),
        );

        tracing::subscriber::with_default(subscriber, || {
            PluginLogger::new("user_cleanup", LevelFilter::DEBUG).info("Removed all projects");
            PluginLogger::new("log_args", LevelFilter::INFO).debug("filtered out");
            PluginLogger::new("log_args", LevelFilter::INFO).warn("Event #7");
            tracing::info!("engine record");
        });

        let cleanup = plugin_log(dir.path(), "user_cleanup");
        assert!(cleanup.contains("INFO Removed all projects"));
        assert!(!cleanup.contains("Event #7"));

        let args = plugin_log(dir.path(), "log_args");
        assert!(args.contains("WARN Event #7"));
        assert!(!args.contains("filtered out"));
        assert!(!args.contains("engine record"));
    }
}
