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

//! Callback registry.
//!
//! Registrations are kept in the order they were made; that order is the
//! dispatch order. The registry is append-only: registrations live as long as
//! the process, and registering the same handler twice makes it fire twice.

use crate::handlers::{RuleHandler, SharedHandler};
use crate::logger::PluginLogger;
use flowhook_core::{EventFilter, ScriptCredentials};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;

/// A handler bound to a filter, credentials and an argument.
#[derive(Clone)]
pub struct Registration {
    /// Sequential id, unique within a registry.
    pub id: u64,
    /// Name of the plugin that made the registration.
    pub plugin: String,
    /// Script credentials used to obtain this registration's client.
    pub credentials: ScriptCredentials,
    /// The rule to run when the filter matches.
    pub handler: SharedHandler,
    /// `None` matches every event.
    pub filter: Option<EventFilter>,
    /// Opaque value handed to the handler on every call.
    pub arg: Value,
    /// Logger handed to the handler; its level is owned by this registration.
    pub logger: PluginLogger,
}

impl Registration {
    /// Name reported by the handler.
    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    /// Filter as shown in listings.
    pub fn filter_description(&self) -> String {
        match &self.filter {
            Some(filter) => filter.to_string(),
            None => "<all events>".to_string(),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("plugin", &self.plugin)
            .field("handler", &self.handler.name())
            .field("filter", &self.filter)
            .field("arg", &self.arg)
            .finish()
    }
}

/// Returned by [`CallbackRegistry::register`].
///
/// Lets the plugin that made a registration change that registration's log
/// level later on, without touching any other registration.
#[derive(Debug, Clone)]
pub struct RegistrationHandle {
    id: u64,
    logger: PluginLogger,
}

impl RegistrationHandle {
    /// Id of the registration this handle controls.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Change the level of this registration's logger only.
    pub fn set_log_level(&self, level: LevelFilter) {
        self.logger.set_level(level);
    }
}

/// Ordered, append-only list of registrations shared by the host and the
/// dispatcher.
pub struct CallbackRegistry {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a registration with a fresh logger at `log_level`.
    ///
    /// The new registration runs after every earlier one. Registering the
    /// same handler twice is allowed and makes it run twice per event.
    pub fn register(
        &self,
        plugin: &str,
        credentials: ScriptCredentials,
        filter: Option<EventFilter>,
        handler: impl RuleHandler + 'static,
        arg: Value,
        log_level: LevelFilter,
    ) -> RegistrationHandle {
        self.register_shared(
            plugin,
            credentials,
            filter,
            Arc::new(handler),
            arg,
            PluginLogger::new(plugin, log_level),
        )
    }

    pub(crate) fn register_shared(
        &self,
        plugin: &str,
        credentials: ScriptCredentials,
        filter: Option<EventFilter>,
        handler: SharedHandler,
        arg: Value,
        logger: PluginLogger,
    ) -> RegistrationHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let filter_description = filter
            .as_ref()
            .map_or_else(|| "<all events>".to_string(), ToString::to_string);
        tracing::debug!(
            registration_id = id,
            plugin,
            handler = handler.name(),
            filter = %filter_description,
            "Registered callback"
        );

        let handle = RegistrationHandle {
            id,
            logger: logger.clone(),
        };
        self.registrations.write().push(Registration {
            id,
            plugin: plugin.to_string(),
            credentials,
            handler,
            filter,
            arg,
            logger,
        });
        handle
    }

    /// Snapshot of every registration, in registration order.
    pub fn all(&self) -> Vec<Registration> {
        self.registrations.read().clone()
    }

    /// Registrations made by one plugin, in registration order.
    pub fn for_plugin(&self, plugin: &str) -> Vec<Registration> {
        self.registrations
            .read()
            .iter()
            .filter(|r| r.plugin == plugin)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().is_empty()
    }
}
