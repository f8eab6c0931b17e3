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

//! Plugin runtime error types

use flowhook_core::{StateError, TrackingError};
use thiserror::Error;

/// Why a single handler invocation failed.
///
/// Every variant is contained by the dispatcher and reported as a failed
/// outcome for that registration only.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("Tracking API error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Handler timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Handler task was cancelled")]
    Cancelled,

    #[error("Invalid handler argument: {0}")]
    InvalidArgument(String),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Errors raised while loading plugins.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Plugin {plugin} failed to register callbacks: {reason}")]
    Registration { plugin: String, reason: String },

    #[error("Plugin configuration error: {0}")]
    Config(String),
}

/// Errors that stop the event loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("State file error: {0}")]
    State(#[from] StateError),

    #[error("Event fetch failed after {attempts} attempts: {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: TrackingError,
    },
}
