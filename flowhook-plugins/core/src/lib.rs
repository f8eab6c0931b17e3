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

//! Flowhook plugin runtime
//!
//! Plugins register callbacks with a filter and a handler. For every event the
//! dispatcher walks the registrations in order, runs each matching handler in
//! isolation and reports one outcome per registration:
//!
//! - **Registry**: append-only list of registrations, in load order
//! - **Host**: runs each plugin's registration pass
//! - **Dispatcher**: matching, client lookup, failure isolation, timing
//! - **Engine**: the fetch/dispatch/checkpoint loop with graceful shutdown

pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod host;
pub mod logger;
pub mod registry;
pub mod resilience;

pub use dispatcher::{
    BatchReport, BatchSummary, DispatchOutcome, Dispatcher, DispatcherConfig, EventReport,
    RegistrationOutcome, TIMING_TARGET,
};
pub use engine::{
    EventLoop, EventSource, LoopConfig, LoopMode, LoopSummary, MemoryEventSource, StartPosition,
    StopReason,
};
pub use error::{EngineError, HandlerError, PluginError};
pub use handlers::{CallbackHandler, RuleHandler, RuleOutcome, SharedHandler};
pub use host::{Plugin, PluginHost, PluginRegistrar};
pub use logger::{PluginLogger, PLUGIN_TARGET};
pub use registry::{CallbackRegistry, Registration, RegistrationHandle};
pub use resilience::{RetryError, RetryPolicy};
