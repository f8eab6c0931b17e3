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

//! Logs every event it sees.

use async_trait::async_trait;
use flowhook_core::{Event, TrackingClient};
use flowhook_plugins::{
    HandlerError, Plugin, PluginError, PluginLogger, PluginRegistrar, RuleHandler, RuleOutcome,
};
use serde_json::Value;

pub const PLUGIN_NAME: &str = "log_args";

/// Logs one line per event with its entity, attribute, new value and the
/// registration argument.
#[derive(Debug, Default)]
pub struct LogArgs;

#[async_trait]
impl RuleHandler for LogArgs {
    async fn handle(
        &self,
        _client: &dyn TrackingClient,
        logger: &PluginLogger,
        event: &Event,
        arg: &Value,
    ) -> Result<RuleOutcome, HandlerError> {
        let entity = event
            .entity
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        logger.info(format!(
            "Event #{} {} entity={} attribute={} new_value={} arg={}",
            event.id,
            event.event_type,
            entity,
            event.attribute_name.as_deref().unwrap_or("-"),
            event.meta.new_value.as_ref().unwrap_or(&Value::Null),
            arg
        ));
        Ok(RuleOutcome::completed(0))
    }

    fn name(&self) -> &str {
        "log_args"
    }
}

/// Registers [`LogArgs`] for every event.
pub struct LogArgsPlugin;

impl Plugin for LogArgsPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register_callbacks(&self, registrar: &mut PluginRegistrar) -> Result<(), PluginError> {
        registrar.register_callback(registrar.credentials(), LogArgs, None, Value::Null);
        Ok(())
    }
}
