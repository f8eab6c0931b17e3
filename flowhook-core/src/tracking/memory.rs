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

//! In-memory tracking service.

use super::{
    Filter, LogicalOperator, Operator, Record, TrackingClient, TrackingConnector, TrackingError,
};
use crate::config::ScriptCredentials;
use crate::event::EntityRef;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// One recorded `update` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateCall {
    pub entity_type: String,
    pub id: i64,
    pub data: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_uuid: Option<String>,
}

/// Seed data for a [`MemoryTracker`].
///
/// ```json
/// {
///     "entities": {"HumanUser": [{"id": 1, "name": "ann", "projects": []}]},
///     "schemas": {"Task": {"sg_status_list": {"sg_status_list": {"properties": {}}}}}
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fixtures {
    #[serde(default)]
    pub entities: BTreeMap<String, Vec<Record>>,
    /// entity type -> field name -> raw schema payload.
    #[serde(default)]
    pub schemas: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Default)]
struct MemoryState {
    entities: BTreeMap<String, BTreeMap<i64, Record>>,
    schemas: BTreeMap<(String, String), Value>,
    updates: Vec<UpdateCall>,
    failing_schemas: bool,
    failing_updates: BTreeSet<(String, i64)>,
    vanishing: BTreeSet<(String, i64)>,
}

/// A [`TrackingClient`] backed by in-process records.
///
/// Every `update` is recorded so callers can assert on exactly what a rule
/// changed.
#[derive(Default)]
pub struct MemoryTracker {
    state: RwLock<MemoryState>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixtures(fixtures: Fixtures) -> Self {
        let tracker = Self::new();
        for (entity_type, records) in fixtures.entities {
            for record in records {
                tracker.insert(&entity_type, record);
            }
        }
        for (entity_type, fields) in fixtures.schemas {
            for (field, schema) in fields {
                tracker.set_schema(&entity_type, &field, schema);
            }
        }
        tracker
    }

    /// Load fixtures from a JSON file.
    pub fn load_fixtures(path: impl AsRef<Path>) -> Result<Self, TrackingError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrackingError::Connection(format!("{}: {e}", path.display())))?;
        let fixtures: Fixtures = serde_json::from_str(&content)
            .map_err(|e| TrackingError::InvalidResponse(format!("{}: {e}", path.display())))?;
        Ok(Self::from_fixtures(fixtures))
    }

    /// Insert or replace a record. Records without an integer `id` are ignored.
    pub fn insert(&self, entity_type: &str, mut record: Record) {
        let Some(id) = record.get("id").and_then(Value::as_i64) else {
            tracing::warn!(entity_type, "Ignoring fixture record without an id");
            return;
        };
        record.insert("type".to_string(), Value::from(entity_type));
        self.state
            .write()
            .entities
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, record);
    }

    pub fn set_schema(&self, entity_type: &str, field_name: &str, schema: Value) {
        self.state
            .write()
            .schemas
            .insert((entity_type.to_string(), field_name.to_string()), schema);
    }

    /// Make every schema read fail with a connection error.
    pub fn fail_schema_reads(&self, failing: bool) {
        self.state.write().failing_schemas = failing;
    }

    /// Make updates to one entity fail with an API error.
    pub fn fail_updates_for(&self, entity_type: &str, id: i64) {
        self.state
            .write()
            .failing_updates
            .insert((entity_type.to_string(), id));
    }

    /// Delete one entity just before its next update, as if another client
    /// removed it while a rule was working on it.
    pub fn delete_before_update(&self, entity_type: &str, id: i64) {
        self.state
            .write()
            .vanishing
            .insert((entity_type.to_string(), id));
    }

    pub fn remove(&self, entity_type: &str, id: i64) -> Option<Record> {
        self.state
            .write()
            .entities
            .get_mut(entity_type)
            .and_then(|records| records.remove(&id))
    }

    pub fn get(&self, entity_type: &str, id: i64) -> Option<Record> {
        self.state
            .read()
            .entities
            .get(entity_type)
            .and_then(|records| records.get(&id))
            .cloned()
    }

    pub fn updates(&self) -> Vec<UpdateCall> {
        self.state.read().updates.clone()
    }

    pub fn update_count(&self) -> usize {
        self.state.read().updates.len()
    }

    /// A connector that hands out this tracker for any credentials.
    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            tracker: Arc::clone(self),
            rejected: BTreeSet::new(),
        }
    }

    fn matching(&self, entity_type: &str, filters: &[Filter], fields: &[&str]) -> Vec<Record> {
        let state = self.state.read();
        state
            .entities
            .get(entity_type)
            .map(|records| {
                records
                    .values()
                    .filter(|record| filters.iter().all(|f| evaluate(record, f)))
                    .map(|record| project_fields(record, fields))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TrackingClient for MemoryTracker {
    async fn find_one(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Option<Record>, TrackingError> {
        Ok(self.matching(entity_type, filters, fields).into_iter().next())
    }

    async fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Vec<Record>, TrackingError> {
        Ok(self.matching(entity_type, filters, fields))
    }

    async fn update(
        &self,
        entity_type: &str,
        id: i64,
        data: Record,
    ) -> Result<Record, TrackingError> {
        self.update_in_session(entity_type, id, data, None).await
    }

    async fn update_in_session(
        &self,
        entity_type: &str,
        id: i64,
        data: Record,
        session_uuid: Option<&str>,
    ) -> Result<Record, TrackingError> {
        let mut state = self.state.write();
        let key = (entity_type.to_string(), id);
        if state.vanishing.remove(&key) {
            if let Some(records) = state.entities.get_mut(entity_type) {
                records.remove(&id);
            }
        }
        if state.failing_updates.contains(&key) {
            return Err(TrackingError::Api(format!(
                "update rejected for {entity_type} #{id}"
            )));
        }

        let record = state
            .entities
            .get_mut(entity_type)
            .and_then(|records| records.get_mut(&id))
            .ok_or_else(|| TrackingError::NotFound {
                entity_type: entity_type.to_string(),
                id,
            })?;

        let mut result = Record::new();
        result.insert("type".to_string(), Value::from(entity_type));
        result.insert("id".to_string(), Value::from(id));
        for (field, value) in &data {
            record.insert(field.clone(), value.clone());
            result.insert(field.clone(), value.clone());
        }

        state.updates.push(UpdateCall {
            entity_type: entity_type.to_string(),
            id,
            data,
            session_uuid: session_uuid.map(str::to_string),
        });
        Ok(result)
    }

    async fn schema_field_read(
        &self,
        entity_type: &str,
        field_name: &str,
        _project: Option<&EntityRef>,
    ) -> Result<Value, TrackingError> {
        let state = self.state.read();
        if state.failing_schemas {
            return Err(TrackingError::Connection("schema read failed".to_string()));
        }
        Ok(state
            .schemas
            .get(&(entity_type.to_string(), field_name.to_string()))
            .cloned()
            .unwrap_or_else(|| Value::Object(Record::new())))
    }
}

/// [`TrackingConnector`] over a shared [`MemoryTracker`].
#[derive(Clone)]
pub struct MemoryConnector {
    tracker: Arc<MemoryTracker>,
    rejected: BTreeSet<String>,
}

impl MemoryConnector {
    /// Refuse connections for a script name.
    pub fn reject(mut self, script_name: impl Into<String>) -> Self {
        self.rejected.insert(script_name.into());
        self
    }
}

#[async_trait]
impl TrackingConnector for MemoryConnector {
    async fn connect(
        &self,
        credentials: &ScriptCredentials,
    ) -> Result<Arc<dyn TrackingClient>, TrackingError> {
        if self.rejected.contains(&credentials.script_name) {
            return Err(TrackingError::Authentication(
                credentials.script_name.clone(),
            ));
        }
        let client: Arc<dyn TrackingClient> = self.tracker.clone();
        Ok(client)
    }
}

fn project_fields(record: &Record, fields: &[&str]) -> Record {
    let mut projected = Record::new();
    for key in ["type", "id"] {
        if let Some(value) = record.get(key) {
            projected.insert(key.to_string(), value.clone());
        }
    }
    for field in fields {
        projected.insert(
            field.to_string(),
            record.get(*field).cloned().unwrap_or(Value::Null),
        );
    }
    projected
}

fn evaluate(record: &Record, filter: &Filter) -> bool {
    match filter {
        Filter::Condition(field, operator, expected) => {
            compare(record.get(field.as_str()), *operator, expected)
        }
        Filter::Group {
            filter_operator: LogicalOperator::Any,
            filters,
        } => filters.iter().any(|f| evaluate(record, f)),
        Filter::Group {
            filter_operator: LogicalOperator::All,
            filters,
        } => filters.iter().all(|f| evaluate(record, f)),
    }
}

fn compare(actual: Option<&Value>, operator: Operator, expected: &Value) -> bool {
    match operator {
        Operator::Is => is(actual, expected),
        Operator::IsNot => !is(actual, expected),
        Operator::In => match expected {
            Value::Array(candidates) => candidates.iter().any(|c| is(actual, c)),
            single => is(actual, single),
        },
        Operator::NotIn => !compare(actual, Operator::In, expected),
        Operator::Contains => match (actual, expected) {
            (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle),
            (Some(Value::Array(items)), needle) => items.iter().any(|i| same_value(i, needle)),
            _ => false,
        },
        Operator::NotContains => !compare(actual, Operator::Contains, expected),
        Operator::LessThan => order(actual, expected) == Some(Ordering::Less),
        Operator::GreaterThan => order(actual, expected) == Some(Ordering::Greater),
    }
}

/// Equality, with "contains" semantics for multi-entity (array) fields.
fn is(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None | Some(Value::Null) => expected.is_null(),
        Some(Value::Array(items)) => items.iter().any(|i| same_value(i, expected)),
        Some(value) => same_value(value, expected),
    }
}

/// Entity references compare by type and id; everything else structurally.
fn same_value(a: &Value, b: &Value) -> bool {
    match (EntityRef::from_value(a), EntityRef::from_value(b)) {
        (Some(a), Some(b)) => a.same_entity(&b),
        _ => a == b,
    }
}

fn order(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
