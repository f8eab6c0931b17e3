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

//! Event filters and the matcher.
//!
//! A filter maps an event type to the set of attribute names a callback cares
//! about. Matching is exact string equality on both; there are no wildcards.
//! Broad interest is opt-in: an empty attribute set matches any attribute of
//! that type, and only an absent filter (`None`) matches every event type.

use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Event type -> accepted attribute names.
///
/// # Example JSON
///
/// ```json
/// {"Shotgun_Version_Change": ["sg_status_list"], "Shotgun_Task_New": []}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFilter {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl EventFilter {
    /// An empty filter. It matches nothing until entries are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept every event of `event_type`, whatever attribute changed.
    pub fn on_type(mut self, event_type: impl Into<String>) -> Self {
        self.entries.entry(event_type.into()).or_default();
        self
    }

    /// Accept events of `event_type` whose attribute is one of `attributes`.
    pub fn on_attributes<I, S>(mut self, event_type: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries
            .entry(event_type.into())
            .or_default()
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Attribute set for a type; `Some(empty)` means any attribute.
    pub fn attributes(&self, event_type: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(event_type)
    }

    /// Whether `event` satisfies this filter.
    pub fn matches(&self, event: &Event) -> bool {
        let Some(attributes) = self.entries.get(&event.event_type) else {
            return false;
        };
        if attributes.is_empty() {
            return true;
        }
        event
            .attribute_name
            .as_ref()
            .is_some_and(|name| attributes.contains(name))
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "<nothing>");
        }
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(event_type, attributes)| {
                if attributes.is_empty() {
                    format!("{event_type}[*]")
                } else {
                    let names: Vec<&str> = attributes.iter().map(String::as_str).collect();
                    format!("{event_type}[{}]", names.join(","))
                }
            })
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Match an event against an optional filter. `None` matches every event.
pub fn matches(event: &Event, filter: Option<&EventFilter>) -> bool {
    filter.map_or(true, |filter| filter.matches(event))
}
