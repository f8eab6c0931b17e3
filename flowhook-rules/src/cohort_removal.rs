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

//! Removes artists and supervisors from a project once it wraps.
//!
//! Only the wrapped project is taken off each user's `projects` list; their
//! other memberships stay. Users who no longer list the project are skipped,
//! so replaying the event changes nothing.

use async_trait::async_trait;
use crate::update_existing;
use flowhook_core::{EntityRef, Event, EventFilter, Filter, Operator, Record, TrackingClient};
use flowhook_plugins::{
    HandlerError, Plugin, PluginError, PluginLogger, PluginRegistrar, RuleHandler, RuleOutcome,
};
use serde_json::{json, Value};

pub const PLUGIN_NAME: &str = "project_wrap_cleanup";
pub const EVENT_TYPE: &str = "Shotgun_Project_Change";
pub const STATUS_FIELD: &str = "sg_status";
pub const WRAP_STATUS: &str = "Wrap";
/// Permission rule set codes removed when no `roles` argument is given.
pub const DEFAULT_ROLES: [&str; 2] = ["artist", "supervisor"];

/// Takes a wrapped project off the `projects` list of every user holding one
/// of the configured roles.
#[derive(Debug, Default)]
pub struct CohortRemoval;

impl CohortRemoval {
    /// Permission rule set codes to remove; `{"roles": [...]}` or the defaults.
    fn roles(arg: &Value) -> Result<Vec<String>, HandlerError> {
        match arg.get("roles") {
            None => Ok(DEFAULT_ROLES.iter().map(|r| r.to_string()).collect()),
            Some(Value::Array(roles)) => roles
                .iter()
                .map(|role| {
                    role.as_str().map(str::to_string).ok_or_else(|| {
                        HandlerError::InvalidArgument(format!("role {role} is not a string"))
                    })
                })
                .collect(),
            Some(other) => Err(HandlerError::InvalidArgument(format!(
                "roles must be a list, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl RuleHandler for CohortRemoval {
    async fn handle(
        &self,
        client: &dyn TrackingClient,
        logger: &PluginLogger,
        event: &Event,
        arg: &Value,
    ) -> Result<RuleOutcome, HandlerError> {
        let Some(project) = &event.entity else {
            logger.debug(format!("Event {} has no project", event.id));
            return Ok(RuleOutcome::no_action("event has no entity"));
        };
        let Some(status) = event.new_value_str() else {
            logger.debug(format!("Event {} has no new status value", event.id));
            return Ok(RuleOutcome::no_action("event has no new value"));
        };
        if status != WRAP_STATUS {
            logger.info(format!("{project} status {status:?} is not {WRAP_STATUS}"));
            return Ok(RuleOutcome::no_action(format!(
                "status {status} is not {WRAP_STATUS}"
            )));
        }

        let roles = Self::roles(arg)?;
        let rule_sets = client
            .find(
                "PermissionRuleSet",
                &[Filter::new("code", Operator::In, json!(roles))],
                &["code"],
            )
            .await?;
        if rule_sets.is_empty() {
            logger.info(format!("No permission rule sets named {}", roles.join(", ")));
            return Ok(RuleOutcome::no_action("no matching permission rule sets"));
        }

        let role_filters = rule_sets
            .iter()
            .filter_map(|r| EntityRef::from_value(&Value::Object(r.clone())))
            .map(|r| Filter::is("permission_rule_set", r.to_value()))
            .collect();
        let users = client
            .find(
                "HumanUser",
                &[
                    Filter::is("projects", project.to_value()),
                    Filter::any(role_filters),
                ],
                &["name", "projects"],
            )
            .await?;
        if users.is_empty() {
            logger.info(format!("No users to remove from {project}"));
            return Ok(RuleOutcome::no_action("no users on project"));
        }

        let mut updates = 0;
        for user in &users {
            let Some(user_id) = user.get("id").and_then(Value::as_i64) else {
                logger.warn(format!("Skipping HumanUser record without an id: {user:?}"));
                continue;
            };
            let projects = user
                .get("projects")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let name = user
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>");
            let remaining: Vec<Value> = projects
                .iter()
                .filter(|p| !EntityRef::from_value(p).is_some_and(|p| p.same_entity(project)))
                .cloned()
                .collect();
            if remaining.len() == projects.len() {
                logger.debug(format!("HumanUser {name} is no longer on {project}"));
                continue;
            }

            let mut data = Record::new();
            data.insert("projects".to_string(), Value::Array(remaining));
            if !update_existing(client, logger, "HumanUser", user_id, data).await? {
                continue;
            }
            updates += 1;

            logger.info(format!("Removed HumanUser {name} from {project}"));
        }

        if updates == 0 {
            logger.info(format!("No users left to remove from {project}"));
            return Ok(RuleOutcome::no_action("users already removed"));
        }
        Ok(RuleOutcome::completed(updates))
    }

    fn name(&self) -> &str {
        "cohort_removal"
    }
}

/// Registers [`CohortRemoval`] for project status changes.
pub struct ProjectWrapCleanup {
    roles: Vec<String>,
}

impl Default for ProjectWrapCleanup {
    fn default() -> Self {
        Self {
            roles: DEFAULT_ROLES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

impl ProjectWrapCleanup {
    /// Remove users with these permission rule set codes instead of the
    /// defaults.
    pub fn with_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl Plugin for ProjectWrapCleanup {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register_callbacks(&self, registrar: &mut PluginRegistrar) -> Result<(), PluginError> {
        if self.roles.is_empty() {
            return Err(PluginError::Config("no roles to remove".to_string()));
        }
        registrar.register_callback(
            registrar.credentials(),
            CohortRemoval,
            Some(EventFilter::new().on_attributes(EVENT_TYPE, [STATUS_FIELD])),
            json!({ "roles": self.roles }),
        );
        Ok(())
    }
}
