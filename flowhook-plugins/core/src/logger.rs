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

//! Per-registration logger.
//!
//! Each registration gets its own logger named after its plugin. The level can
//! be changed at runtime through a [`crate::RegistrationHandle`] and only affects
//! that registration. Records are emitted as `tracing` events on the
//! [`PLUGIN_TARGET`] target with a `plugin` field.

use parking_lot::RwLock;
use std::fmt::Display;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::Level;

/// Tracing target for everything plugins log.
pub const PLUGIN_TARGET: &str = "flowhook::plugin";

/// Logger handed to rule handlers. Clones share the same level.
#[derive(Clone)]
pub struct PluginLogger {
    plugin: Arc<str>,
    level: Arc<RwLock<LevelFilter>>,
}

impl PluginLogger {
    pub fn new(plugin: &str, level: LevelFilter) -> Self {
        Self {
            plugin: Arc::from(plugin),
            level: Arc::new(RwLock::new(level)),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn level(&self) -> LevelFilter {
        *self.level.read()
    }

    pub fn set_level(&self, level: LevelFilter) {
        *self.level.write() = level;
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level()
    }

    pub fn debug(&self, message: impl Display) {
        if self.enabled(Level::DEBUG) {
            tracing::debug!(target: PLUGIN_TARGET, plugin = %self.plugin, "{message}");
        }
    }

    pub fn info(&self, message: impl Display) {
        if self.enabled(Level::INFO) {
            tracing::info!(target: PLUGIN_TARGET, plugin = %self.plugin, "{message}");
        }
    }

    pub fn warn(&self, message: impl Display) {
        if self.enabled(Level::WARN) {
            tracing::warn!(target: PLUGIN_TARGET, plugin = %self.plugin, "{message}");
        }
    }

    pub fn error(&self, message: impl Display) {
        if self.enabled(Level::ERROR) {
            tracing::error!(target: PLUGIN_TARGET, plugin = %self.plugin, "{message}");
        }
    }
}

impl std::fmt::Debug for PluginLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLogger")
            .field("plugin", &self.plugin)
            .field("level", &self.level())
            .finish()
    }
}
