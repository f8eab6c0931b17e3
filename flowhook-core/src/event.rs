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

//! Event log records as delivered by the production-tracking service.
//!
//! Events are created upstream, fetched read-only and never mutated here.
//! Fields the service may omit are modelled as `Option` so that a missing
//! entity or a missing `new_value` is a typed state rather than a failed
//! lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Reference to an entity in the tracking service (`{"type": .., "id": ..}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Read a reference out of a JSON value returned by the tracking API.
    ///
    /// Returns `None` for `null`, non-objects, and objects without a string
    /// `type` and integer `id`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let entity_type = obj.get("type")?.as_str()?.to_string();
        let id = obj.get("id")?.as_i64()?;
        let name = obj.get("name").and_then(Value::as_str).map(str::to_string);
        Some(Self {
            entity_type,
            id,
            name,
        })
    }

    /// The wire form used in filters and updates (type and id only).
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "type": self.entity_type, "id": self.id })
    }

    /// Same type and id, ignoring the display name.
    pub fn same_entity(&self, other: &EntityRef) -> bool {
        self.id == other.id && self.entity_type == other.entity_type
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} {}[{}]", self.entity_type, name, self.id),
            None => write!(f, "{} #{}", self.entity_type, self.id),
        }
    }
}

/// Change metadata attached to an attribute-change event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Everything else the service attached (`entity_id`, `field_data_type`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventMeta {
    /// The new value when it is a string (status codes always are).
    pub fn new_value_str(&self) -> Option<&str> {
        self.new_value.as_ref().and_then(Value::as_str)
    }
}

/// A single event log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic, unique; the ordering key for dispatch.
    pub id: i64,
    /// e.g. `Shotgun_Project_Change`.
    pub event_type: String,
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub attribute_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: EventMeta,
    #[serde(default)]
    pub project: Option<EntityRef>,
    #[serde(default)]
    pub user: Option<EntityRef>,
    #[serde(default)]
    pub session_uuid: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    /// Create a bare event stamped with the current time.
    pub fn new(id: i64, event_type: impl Into<String>) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            entity: None,
            attribute_name: None,
            meta: EventMeta::default(),
            project: None,
            user: None,
            session_uuid: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_entity(mut self, entity: EntityRef) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn with_attribute(mut self, attribute_name: impl Into<String>) -> Self {
        self.attribute_name = Some(attribute_name.into());
        self
    }

    pub fn with_new_value(mut self, value: impl Into<Value>) -> Self {
        self.meta.new_value = Some(value.into());
        self
    }

    pub fn with_old_value(mut self, value: impl Into<Value>) -> Self {
        self.meta.old_value = Some(value.into());
        self
    }

    pub fn with_project(mut self, project: EntityRef) -> Self {
        self.project = Some(project);
        self
    }

    pub fn with_session_uuid(mut self, session_uuid: impl Into<String>) -> Self {
        self.session_uuid = Some(session_uuid.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Shortcut for `meta.new_value` as a string.
    pub fn new_value_str(&self) -> Option<&str> {
        self.meta.new_value_str()
    }
}
