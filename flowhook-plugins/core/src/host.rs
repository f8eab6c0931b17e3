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

//! Plugin host: runs each plugin's registration pass against the registry.

use crate::error::PluginError;
use crate::handlers::{RuleHandler, SharedHandler};
use crate::logger::PluginLogger;
use crate::registry::CallbackRegistry;
use flowhook_core::{CredentialProvider, EventFilter, ScriptCredentials};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;

/// A set of rules loaded into the daemon.
pub trait Plugin: Send + Sync {
    /// Plugin name; selects its credentials and names its logger.
    fn name(&self) -> &str;

    /// Called exactly once at load.
    fn register_callbacks(&self, registrar: &mut PluginRegistrar) -> Result<(), PluginError>;
}

struct Pending {
    credentials: ScriptCredentials,
    handler: SharedHandler,
    filter: Option<EventFilter>,
    arg: Value,
    logger: PluginLogger,
}

/// Handed to [`Plugin::register_callbacks`].
///
/// Registrations are buffered and only reach the registry when the pass
/// returns `Ok`; a failing plugin leaves nothing behind.
pub struct PluginRegistrar {
    plugin: String,
    credentials: ScriptCredentials,
    level: LevelFilter,
    pending: Vec<Pending>,
}

impl PluginRegistrar {
    fn new(plugin: &str, credentials: ScriptCredentials, level: LevelFilter) -> Self {
        Self {
            plugin: plugin.to_string(),
            credentials,
            level,
            pending: Vec::new(),
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Credentials configured for this plugin.
    pub fn credentials(&self) -> ScriptCredentials {
        self.credentials.clone()
    }

    /// Queue a registration. `filter: None` matches every event; `arg` is
    /// passed unchanged to each invocation.
    pub fn register_callback(
        &mut self,
        credentials: ScriptCredentials,
        handler: impl RuleHandler + 'static,
        filter: Option<EventFilter>,
        arg: Value,
    ) {
        self.pending.push(Pending {
            credentials,
            handler: Arc::new(handler),
            filter,
            arg,
            logger: PluginLogger::new(&self.plugin, self.level),
        });
    }

    /// Level for this plugin's loggers, including ones already registered.
    pub fn set_log_level(&mut self, level: LevelFilter) {
        self.level = level;
        for pending in &self.pending {
            pending.logger.set_level(level);
        }
    }
}

/// Loads plugins into a shared [`CallbackRegistry`].
pub struct PluginHost {
    registry: Arc<CallbackRegistry>,
    credentials: Arc<dyn CredentialProvider>,
    default_level: LevelFilter,
    loaded: BTreeSet<String>,
}

impl PluginHost {
    /// `credentials` supplies each plugin's script credentials; every
    /// registration logger starts at `default_level`.
    pub fn new(credentials: Arc<dyn CredentialProvider>, default_level: LevelFilter) -> Self {
        Self {
            registry: Arc::new(CallbackRegistry::new()),
            credentials,
            default_level,
            loaded: BTreeSet::new(),
        }
    }

    /// The registry to hand to a [`crate::Dispatcher`].
    pub fn registry(&self) -> Arc<CallbackRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn loaded(&self) -> impl Iterator<Item = &str> {
        self.loaded.iter().map(String::as_str)
    }

    /// Run one plugin's registration pass. Returns how many callbacks it made.
    pub fn load(&mut self, plugin: &dyn Plugin) -> Result<usize, PluginError> {
        let name = plugin.name().to_string();
        if self.loaded.contains(&name) {
            return Err(PluginError::AlreadyLoaded(name));
        }

        let mut registrar =
            PluginRegistrar::new(&name, self.credentials.credentials(&name), self.default_level);
        plugin.register_callbacks(&mut registrar)?;

        let count = registrar.pending.len();
        for pending in registrar.pending {
            self.registry.register_shared(
                &name,
                pending.credentials,
                pending.filter,
                pending.handler,
                pending.arg,
                pending.logger,
            );
        }
        self.loaded.insert(name.clone());

        tracing::info!(plugin = %name, callbacks = count, "Loaded plugin");
        Ok(count)
    }

    /// Load every plugin, logging and skipping the ones that fail.
    pub fn load_all(&mut self, plugins: &[Box<dyn Plugin>]) -> usize {
        let mut loaded = 0;
        for plugin in plugins {
            match self.load(plugin.as_ref()) {
                Ok(_) => loaded += 1,
                Err(e) => {
                    tracing::error!(plugin = plugin.name(), error = %e, "Failed to load plugin");
                }
            }
        }
        loaded
    }
}
