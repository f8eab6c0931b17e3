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

//! Version status -> Task status cascade.
//!
//! When a Version's `sg_status_list` changes, the same status is applied to
//! the Task the Version belongs to, provided the Task status list accepts it.
//! An optional `status_map` in the registration argument translates Version
//! codes to Task codes first.

use crate::update_existing;
use async_trait::async_trait;
use flowhook_core::{
    schema_status_values, EntityRef, Event, EventFilter, Filter, Record, SchemaLookup,
    TrackingClient,
};
use flowhook_plugins::{
    HandlerError, Plugin, PluginError, PluginLogger, PluginRegistrar, RuleHandler, RuleOutcome,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const PLUGIN_NAME: &str = "version_status_to_task";
pub const EVENT_TYPE: &str = "Shotgun_Version_Change";
pub const STATUS_FIELD: &str = "sg_status_list";

/// Copies a Version's new status onto its Task when the Task status list
/// accepts it.
#[derive(Debug, Default)]
pub struct StatusCascade;

impl StatusCascade {
    fn status_map(arg: &Value) -> Result<BTreeMap<String, String>, HandlerError> {
        let Some(map) = arg.get("status_map") else {
            return Ok(BTreeMap::new());
        };
        let Some(map) = map.as_object() else {
            return Err(HandlerError::InvalidArgument(
                "status_map must be an object".to_string(),
            ));
        };
        map.iter()
            .map(|(from, to)| match to.as_str() {
                Some(to) => Ok((from.clone(), to.to_string())),
                None => Err(HandlerError::InvalidArgument(format!(
                    "status_map value for {from:?} is not a string"
                ))),
            })
            .collect()
    }
}

#[async_trait]
impl RuleHandler for StatusCascade {
    async fn handle(
        &self,
        client: &dyn TrackingClient,
        logger: &PluginLogger,
        event: &Event,
        arg: &Value,
    ) -> Result<RuleOutcome, HandlerError> {
        let Some(new_value) = event.new_value_str() else {
            logger.debug(format!("Event {} has no new status value", event.id));
            return Ok(RuleOutcome::no_action("event has no new value"));
        };
        let Some(version) = &event.entity else {
            logger.debug(format!("Event {} has no Version", event.id));
            return Ok(RuleOutcome::no_action("event has no entity"));
        };

        let status_map = Self::status_map(arg)?;
        let target = status_map
            .get(new_value)
            .map(String::as_str)
            .unwrap_or(new_value);

        let statuses =
            match schema_status_values(client, "Task", STATUS_FIELD, event.project.as_ref()).await {
                SchemaLookup::Found(statuses) => statuses,
                SchemaLookup::NotFound => {
                    logger.debug("Task status field not found in schema");
                    return Ok(RuleOutcome::no_action("Task status schema not found"));
                }
                SchemaLookup::LookupError(e) => {
                    logger.debug(format!("Task status schema lookup failed: {e}"));
                    return Ok(RuleOutcome::no_action("Task status schema unavailable"));
                }
            };
        if !statuses.contains(target) {
            logger.debug(format!("{target:?} is not a valid Task status"));
            return Ok(RuleOutcome::no_action(format!(
                "{target} is not a valid Task status"
            )));
        }

        let Some(version_record) = client
            .find_one("Version", &[Filter::is("id", version.id)], &["sg_task"])
            .await?
        else {
            logger.info(format!("{version} no longer exists"));
            return Ok(RuleOutcome::no_action("version not found"));
        };
        let Some(task) = version_record
            .get("sg_task")
            .and_then(EntityRef::from_value)
        else {
            logger.debug(format!("{version} is not linked to a Task"));
            return Ok(RuleOutcome::no_action("version has no task"));
        };

        let Some(task_record) = client
            .find_one("Task", &[Filter::is("id", task.id)], &[STATUS_FIELD])
            .await?
        else {
            logger.info(format!("{task} no longer exists"));
            return Ok(RuleOutcome::no_action("task not found"));
        };
        if task_record.get(STATUS_FIELD).and_then(Value::as_str) == Some(target) {
            logger.debug(format!("{task} already has status {target:?}"));
            return Ok(RuleOutcome::no_action("task already has this status"));
        }

        let mut data = Record::new();
        data.insert(STATUS_FIELD.to_string(), Value::from(target));
        if !update_existing(client, logger, "Task", task.id, data).await? {
            return Ok(RuleOutcome::no_action("task not found"));
        }

        logger.info(format!(
            "Set {task} status to {} from {version}",
            statuses.display_name(target)
        ));
        Ok(RuleOutcome::completed(1))
    }

    fn name(&self) -> &str {
        "status_cascade"
    }
}

/// Registers [`StatusCascade`] for Version status changes.
#[derive(Debug, Default)]
pub struct VersionStatusToTask {
    status_map: BTreeMap<String, String>,
}

impl VersionStatusToTask {
    /// Translate `version_status` to `task_status` before applying it.
    pub fn with_mapping(mut self, version_status: &str, task_status: &str) -> Self {
        self.status_map
            .insert(version_status.to_string(), task_status.to_string());
        self
    }
}

impl Plugin for VersionStatusToTask {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register_callbacks(&self, registrar: &mut PluginRegistrar) -> Result<(), PluginError> {
        let arg = if self.status_map.is_empty() {
            Value::Null
        } else {
            json!({ "status_map": self.status_map })
        };
        registrar.register_callback(
            registrar.credentials(),
            StatusCascade,
            Some(EventFilter::new().on_attributes(EVENT_TYPE, [STATUS_FIELD])),
            arg,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_map_argument() {
        assert!(StatusCascade::status_map(&Value::Null).unwrap().is_empty());

        let map = StatusCascade::status_map(&json!({"status_map": {"apr": "cmpt"}})).unwrap();
        assert_eq!(map.get("apr").map(String::as_str), Some("cmpt"));

        assert!(matches!(
            StatusCascade::status_map(&json!({"status_map": ["apr"]})),
            Err(HandlerError::InvalidArgument(_))
        ));
        assert!(matches!(
            StatusCascade::status_map(&json!({"status_map": {"apr": 3}})),
            Err(HandlerError::InvalidArgument(_))
        ));
    }
}
