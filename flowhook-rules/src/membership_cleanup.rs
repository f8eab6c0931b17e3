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

//! Clears the project memberships of users who were disabled.

use crate::update_existing;
use async_trait::async_trait;
use flowhook_core::{Event, EventFilter, Filter, Record, TrackingClient};
use flowhook_plugins::{
    HandlerError, Plugin, PluginError, PluginLogger, PluginRegistrar, RuleHandler, RuleOutcome,
};
use serde_json::Value;

pub const PLUGIN_NAME: &str = "user_cleanup";
pub const EVENT_TYPE: &str = "Shotgun_HumanUser_Change";
pub const STATUS_FIELD: &str = "sg_status_list";
/// Status code of a disabled account.
pub const DISABLED_STATUS: &str = "dis";

/// Empties the `projects` list of a user whose status changed to disabled.
#[derive(Debug, Default)]
pub struct MembershipCleanup;

#[async_trait]
impl RuleHandler for MembershipCleanup {
    async fn handle(
        &self,
        client: &dyn TrackingClient,
        logger: &PluginLogger,
        event: &Event,
        _arg: &Value,
    ) -> Result<RuleOutcome, HandlerError> {
        let Some(user) = &event.entity else {
            logger.debug(format!("Event {} has no user", event.id));
            return Ok(RuleOutcome::no_action("event has no entity"));
        };
        let Some(status) = event.new_value_str() else {
            logger.debug(format!("Event {} has no new status value", event.id));
            return Ok(RuleOutcome::no_action("event has no new value"));
        };
        if status != DISABLED_STATUS {
            logger.debug(format!("{user} is not disabled (status {status:?})"));
            return Ok(RuleOutcome::no_action(format!(
                "status {status} is not disabled"
            )));
        }

        let Some(record) = client
            .find_one("HumanUser", &[Filter::is("id", user.id)], &["projects"])
            .await?
        else {
            logger.info(format!("{user} no longer exists"));
            return Ok(RuleOutcome::no_action("user not found"));
        };
        let has_projects = record
            .get("projects")
            .and_then(Value::as_array)
            .is_some_and(|projects| !projects.is_empty());
        if !has_projects {
            logger.debug(format!("{user} has no projects"));
            return Ok(RuleOutcome::no_action("user has no projects"));
        }

        let mut data = Record::new();
        data.insert("projects".to_string(), Value::Array(Vec::new()));
        if !update_existing(client, logger, "HumanUser", user.id, data).await? {
            return Ok(RuleOutcome::no_action("user not found"));
        }

        logger.info(format!("Removed all projects from disabled {user}"));
        Ok(RuleOutcome::completed(1))
    }

    fn name(&self) -> &str {
        "membership_cleanup"
    }
}

/// Registers [`MembershipCleanup`] for user status changes.
pub struct UserCleanup;

impl Plugin for UserCleanup {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register_callbacks(&self, registrar: &mut PluginRegistrar) -> Result<(), PluginError> {
        registrar.register_callback(
            registrar.credentials(),
            MembershipCleanup,
            Some(EventFilter::new().on_attributes(EVENT_TYPE, [STATUS_FIELD])),
            Value::Null,
        );
        Ok(())
    }
}
