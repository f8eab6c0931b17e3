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

//! Narrow interface to the production-tracking service.
//!
//! Rule handlers only ever query, update and read field schemas. The wire
//! transport lives outside this workspace; [`MemoryTracker`] evaluates the
//! same filter grammar in-process.

mod memory;

pub use memory::{Fixtures, MemoryConnector, MemoryTracker, UpdateCall};

use crate::config::ScriptCredentials;
use crate::event::EntityRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// An entity as returned by the service: field name -> value, always
/// including `type` and `id`.
pub type Record = Map<String, Value>;

/// Comparison operators understood by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Equality; on multi-entity fields, "contains this entity".
    Is,
    IsNot,
    In,
    NotIn,
    Contains,
    NotContains,
    LessThan,
    GreaterThan,
}

/// How the members of a filter group combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    Any,
    All,
}

/// One query filter.
///
/// Serialises to the service's wire form: `["field", "is", value]` for a
/// condition and `{"filter_operator": "any", "filters": [...]}` for a group.
/// A top-level list of filters is a logical AND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Condition(String, Operator, Value),
    Group {
        filter_operator: LogicalOperator,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Filter::Condition(field.into(), operator, value.into())
    }

    pub fn is(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Is, value)
    }

    pub fn is_not(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::IsNot, value)
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Filter::Group {
            filter_operator: LogicalOperator::Any,
            filters,
        }
    }

    pub fn all(filters: Vec<Filter>) -> Self {
        Filter::Group {
            filter_operator: LogicalOperator::All,
            filters,
        }
    }
}

/// Errors returned by the tracking service.
#[derive(Debug, Clone, Error)]
pub enum TrackingError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Authentication failed for script {0}")]
    Authentication(String),

    #[error("Entity not found: {entity_type} #{id}")]
    NotFound { entity_type: String, id: i64 },

    #[error("API error: {0}")]
    Api(String),

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

/// Query, update and schema-read access to the tracking service.
#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// First record matching `filters`, with `fields` (plus `type` and `id`).
    async fn find_one(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Option<Record>, TrackingError>;

    /// All records matching `filters`.
    async fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Vec<Record>, TrackingError>;

    /// Set `data` on one entity and return the updated fields.
    async fn update(
        &self,
        entity_type: &str,
        id: i64,
        data: Record,
    ) -> Result<Record, TrackingError>;

    /// [`update`](Self::update) attributed to a user session, so the change
    /// shows up live in that session's views. Clients without session support
    /// ignore the uuid.
    async fn update_in_session(
        &self,
        entity_type: &str,
        id: i64,
        data: Record,
        session_uuid: Option<&str>,
    ) -> Result<Record, TrackingError> {
        let _ = session_uuid;
        self.update(entity_type, id, data).await
    }

    /// Raw schema of one field, optionally in a project's context.
    async fn schema_field_read(
        &self,
        entity_type: &str,
        field_name: &str,
        project: Option<&EntityRef>,
    ) -> Result<Value, TrackingError>;
}

/// Opens a client for a set of script credentials.
#[async_trait]
pub trait TrackingConnector: Send + Sync {
    async fn connect(
        &self,
        credentials: &ScriptCredentials,
    ) -> Result<Arc<dyn TrackingClient>, TrackingError>;
}

/// Client view that attributes every update to one event's session.
pub struct SessionScoped {
    inner: Arc<dyn TrackingClient>,
    session_uuid: String,
}

impl SessionScoped {
    pub fn new(inner: Arc<dyn TrackingClient>, session_uuid: impl Into<String>) -> Self {
        Self {
            inner,
            session_uuid: session_uuid.into(),
        }
    }

    pub fn session_uuid(&self) -> &str {
        &self.session_uuid
    }
}

#[async_trait]
impl TrackingClient for SessionScoped {
    async fn find_one(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Option<Record>, TrackingError> {
        self.inner.find_one(entity_type, filters, fields).await
    }

    async fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Vec<Record>, TrackingError> {
        self.inner.find(entity_type, filters, fields).await
    }

    async fn update(
        &self,
        entity_type: &str,
        id: i64,
        data: Record,
    ) -> Result<Record, TrackingError> {
        self.inner
            .update_in_session(entity_type, id, data, Some(&self.session_uuid))
            .await
    }

    async fn update_in_session(
        &self,
        entity_type: &str,
        id: i64,
        data: Record,
        session_uuid: Option<&str>,
    ) -> Result<Record, TrackingError> {
        let session_uuid = session_uuid.unwrap_or(&self.session_uuid);
        self.inner
            .update_in_session(entity_type, id, data, Some(session_uuid))
            .await
    }

    async fn schema_field_read(
        &self,
        entity_type: &str,
        field_name: &str,
        project: Option<&EntityRef>,
    ) -> Result<Value, TrackingError> {
        self.inner
            .schema_field_read(entity_type, field_name, project)
            .await
    }
}

/// Valid values of a status list field, with their display names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusValues {
    valid: Vec<String>,
    display: BTreeMap<String, String>,
}

impl StatusValues {
    pub fn new(valid: Vec<String>, display: BTreeMap<String, String>) -> Self {
        Self { valid, display }
    }

    pub fn contains(&self, code: &str) -> bool {
        self.valid.iter().any(|v| v == code)
    }

    /// Human readable name for a status code, or the code itself.
    pub fn display_name<'a>(&'a self, code: &'a str) -> &'a str {
        self.display.get(code).map(String::as_str).unwrap_or(code)
    }

    pub fn codes(&self) -> &[String] {
        &self.valid
    }
}

/// Outcome of reading a status field's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaLookup {
    Found(StatusValues),
    /// The service knows no such field.
    NotFound,
    /// The read failed or the schema had an unexpected shape.
    LookupError(String),
}

/// Read the valid values of a status list field.
///
/// Expects the service's schema shape:
///
/// ```json
/// {"sg_status_list": {"properties": {
///     "valid_values": {"value": ["wtg", "ip"]},
///     "display_values": {"value": {"wtg": "Waiting", "ip": "In Progress"}}
/// }}}
/// ```
pub async fn schema_status_values(
    client: &dyn TrackingClient,
    entity_type: &str,
    field_name: &str,
    project: Option<&EntityRef>,
) -> SchemaLookup {
    let schema = match client
        .schema_field_read(entity_type, field_name, project)
        .await
    {
        Ok(schema) => schema,
        Err(e) => return SchemaLookup::LookupError(e.to_string()),
    };

    let Some(field) = schema.get(field_name) else {
        return SchemaLookup::NotFound;
    };
    let properties = field.get("properties");

    let Some(valid) = properties
        .and_then(|p| p.pointer("/valid_values/value"))
        .and_then(Value::as_array)
    else {
        return SchemaLookup::LookupError(format!(
            "{entity_type}.{field_name} schema has no valid_values"
        ));
    };
    let valid: Vec<String> = valid
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    let display = properties
        .and_then(|p| p.pointer("/display_values/value"))
        .and_then(Value::as_object)
        .map(|values| {
            values
                .iter()
                .filter_map(|(code, name)| Some((code.clone(), name.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default();

    SchemaLookup::Found(StatusValues::new(valid, display))
}

/// Build the schema payload the service returns for a status list field.
pub fn status_list_schema(field_name: &str, statuses: &[(&str, &str)]) -> Value {
    let valid: Vec<&str> = statuses.iter().map(|(code, _)| *code).collect();
    let display: Map<String, Value> = statuses
        .iter()
        .map(|(code, name)| (code.to_string(), Value::from(*name)))
        .collect();
    let mut schema = Map::new();
    schema.insert(
        field_name.to_string(),
        serde_json::json!({
            "data_type": {"value": "status_list"},
            "properties": {
                "valid_values": {"value": valid},
                "display_values": {"value": display}
            }
        }),
    );
    Value::Object(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_wire_form() {
        let role = |id: i64| EntityRef::new("PermissionRuleSet", id).to_value();
        let filters = vec![
            Filter::is("projects", EntityRef::new("Project", 42).to_value()),
            Filter::any(vec![
                Filter::is("permission_rule_set", role(1)),
                Filter::is("permission_rule_set", role(2)),
            ]),
        ];

        let wire = serde_json::to_value(&filters).unwrap();
        assert_eq!(
            wire,
            serde_json::json!([
                ["projects", "is", {"type": "Project", "id": 42}],
                {
                    "filter_operator": "any",
                    "filters": [
                        ["permission_rule_set", "is", {"type": "PermissionRuleSet", "id": 1}],
                        ["permission_rule_set", "is", {"type": "PermissionRuleSet", "id": 2}]
                    ]
                }
            ])
        );

        let parsed: Vec<Filter> = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, filters);
    }

    #[tokio::test]
    async fn test_schema_status_values() {
        let tracker = MemoryTracker::new();
        tracker.set_schema(
            "Task",
            "sg_status_list",
            status_list_schema("sg_status_list", &[("rdy", "Ready"), ("ip", "In Progress")]),
        );

        match schema_status_values(&tracker, "Task", "sg_status_list", None).await {
            SchemaLookup::Found(values) => {
                assert!(values.contains("ip"));
                assert!(!values.contains("cmpt"));
                assert_eq!(values.display_name("ip"), "In Progress");
                assert_eq!(values.display_name("zz"), "zz");
            }
            other => panic!("unexpected lookup: {other:?}"),
        }

        assert_eq!(
            schema_status_values(&tracker, "Task", "sg_other", None).await,
            SchemaLookup::NotFound
        );
    }

    #[tokio::test]
    async fn test_session_scoped_updates_carry_uuid() {
        let tracker = Arc::new(MemoryTracker::new());
        tracker.insert(
            "Task",
            serde_json::json!({"id": 4, "sg_status_list": "wtg"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let inner: Arc<dyn TrackingClient> = tracker.clone();
        let scoped = SessionScoped::new(inner, "a1b2");

        let mut data = Record::new();
        data.insert("sg_status_list".to_string(), "ip".into());
        scoped.update("Task", 4, data.clone()).await.unwrap();
        tracker.update("Task", 4, data).await.unwrap();

        let updates = tracker.updates();
        assert_eq!(updates[0].session_uuid.as_deref(), Some("a1b2"));
        assert_eq!(updates[1].session_uuid, None);
    }

    #[tokio::test]
    async fn test_malformed_schema_is_lookup_error() {
        let tracker = MemoryTracker::new();
        tracker.set_schema(
            "Task",
            "sg_status_list",
            serde_json::json!({"sg_status_list": {"properties": {}}}),
        );

        assert!(matches!(
            schema_status_values(&tracker, "Task", "sg_status_list", None).await,
            SchemaLookup::LookupError(_)
        ));
    }
}
