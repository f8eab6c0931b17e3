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

//! Built-in Flowhook rules.
//!
//! | Plugin | Reacts to | Does |
//! |--------|-----------|------|
//! | `version_status_to_task` | `Shotgun_Version_Change[sg_status_list]` | copies the status onto the Version's Task |
//! | `user_cleanup` | `Shotgun_HumanUser_Change[sg_status_list]` | clears a disabled user's projects |
//! | `project_wrap_cleanup` | `Shotgun_Project_Change[sg_status]` | removes artists and supervisors from a wrapped project |
//! | `log_args` | every event | logs the event |

pub mod cohort_removal;
pub mod log_args;
pub mod membership_cleanup;
pub mod status_cascade;

pub use cohort_removal::{CohortRemoval, ProjectWrapCleanup};
pub use log_args::{LogArgs, LogArgsPlugin};
pub use membership_cleanup::{MembershipCleanup, UserCleanup};
pub use status_cascade::{StatusCascade, VersionStatusToTask};

use flowhook_core::{Record, TrackingClient, TrackingError};
use flowhook_plugins::{HandlerError, Plugin, PluginLogger};

/// Every rule plugin shipped with Flowhook, in load order.
pub fn builtin_plugins() -> Vec<Box<dyn Plugin>> {
    vec![
        Box::new(LogArgsPlugin),
        Box::new(ProjectWrapCleanup::default()),
        Box::new(UserCleanup),
        Box::new(VersionStatusToTask::default()),
    ]
}

/// Update one entity unless it was deleted in the meantime.
///
/// Returns `false`, after logging, when the service no longer has the entity.
/// Any other error is the caller's to handle.
pub(crate) async fn update_existing(
    client: &dyn TrackingClient,
    logger: &PluginLogger,
    entity_type: &str,
    id: i64,
    data: Record,
) -> Result<bool, HandlerError> {
    match client.update(entity_type, id, data).await {
        Ok(_) => Ok(true),
        Err(TrackingError::NotFound { .. }) => {
            logger.info(format!("{entity_type} #{id} no longer exists, not updated"));
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
