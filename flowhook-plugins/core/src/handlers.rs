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

//! Rule handler contract.

use crate::error::HandlerError;
use crate::logger::PluginLogger;
use async_trait::async_trait;
use flowhook_core::{Event, TrackingClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// What a handler did with an event it matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleOutcome {
    /// The rule ran and issued `updates` writes to the tracking service.
    Completed { updates: usize },
    /// A precondition did not hold; nothing was changed.
    NoAction { reason: String },
}

impl RuleOutcome {
    pub fn completed(updates: usize) -> Self {
        RuleOutcome::Completed { updates }
    }

    /// Skip with a human readable reason. Handlers log the reason themselves.
    pub fn no_action(reason: impl Into<String>) -> Self {
        RuleOutcome::NoAction {
            reason: reason.into(),
        }
    }

    pub fn updates(&self) -> usize {
        match self {
            RuleOutcome::Completed { updates } => *updates,
            RuleOutcome::NoAction { .. } => 0,
        }
    }
}

/// A rule that reacts to matched events.
///
/// Handlers may be invoked more than once for the same event (delivery is
/// at-least-once), so they must check current state before writing.
#[async_trait]
pub trait RuleHandler: Send + Sync {
    /// React to one matched event.
    ///
    /// Return [`RuleOutcome::NoAction`] when a precondition does not hold;
    /// errors are reported as a failure of this registration only.
    async fn handle(
        &self,
        client: &dyn TrackingClient,
        logger: &PluginLogger,
        event: &Event,
        arg: &Value,
    ) -> Result<RuleOutcome, HandlerError>;

    /// Handler name used in reports and logs.
    fn name(&self) -> &str;
}

/// A handler as stored in the registry.
pub type SharedHandler = Arc<dyn RuleHandler>;

type Callback =
    dyn Fn(&PluginLogger, &Event, &Value) -> Result<RuleOutcome, HandlerError> + Send + Sync;

/// Handler backed by a synchronous closure. Does not touch the client.
pub struct CallbackHandler {
    name: String,
    callback: Box<Callback>,
}

impl CallbackHandler {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&PluginLogger, &Event, &Value) -> Result<RuleOutcome, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl RuleHandler for CallbackHandler {
    async fn handle(
        &self,
        _client: &dyn TrackingClient,
        logger: &PluginLogger,
        event: &Event,
        arg: &Value,
    ) -> Result<RuleOutcome, HandlerError> {
        (self.callback)(logger, event, arg)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
