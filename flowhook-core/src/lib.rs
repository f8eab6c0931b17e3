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

//! Flowhook Core
//!
//! Shared building blocks for the Flowhook event rules:
//!
//! - **Events**: typed event log records (`Event`, `EntityRef`, `EventMeta`)
//! - **Filters**: per-registration event filters and the matcher
//! - **Settings**: the read-only configuration snapshot loaded at startup
//! - **State**: the last-processed event id file and the pid file
//! - **Tracking**: the narrow interface to the production-tracking service,
//!   plus an in-memory implementation used for tests and offline replay

pub mod config;
pub mod event;
pub mod filter;
pub mod state;
pub mod tracking;

pub use config::{
    level_from_numeric, ConfigError, CredentialProvider, EmailSettings, LogMode,
    ScriptCredentials, Settings, StaticCredentials,
};
pub use event::{EntityRef, Event, EventMeta};
pub use filter::{matches, EventFilter};
pub use state::{EventIdStore, PidFile, StateError};
pub use tracking::{
    schema_status_values, status_list_schema, Filter, Fixtures, LogicalOperator, MemoryConnector,
    MemoryTracker, Operator, Record, SchemaLookup, SessionScoped, StatusValues, TrackingClient,
    TrackingConnector, TrackingError, UpdateCall,
};
