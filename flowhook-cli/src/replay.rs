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

//! `flowhook replay`: run the built-in rules over recorded events against an
//! in-memory tracking service.
//!
//! With settings, the run uses the configured event id file (unless `--state`
//! names another), holds the configured pid file, and takes batch size,
//! retries and session attribution from the settings file.

use anyhow::{Context, Result};
use flowhook_core::{
    CredentialProvider, EventIdStore, MemoryTracker, PidFile, ScriptCredentials, Settings,
    StaticCredentials, UpdateCall,
};
use flowhook_plugins::{
    BatchReport, Dispatcher, DispatcherConfig, EventLoop, LoopConfig, LoopMode, LoopSummary,
    MemoryEventSource, PluginHost, RetryPolicy, StartPosition,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone)]
pub struct ReplayArgs {
    pub events: PathBuf,
    pub fixtures: PathBuf,
    /// Event id file; defaults to the configured one when settings exist.
    pub state: Option<PathBuf>,
    pub handler_timeout: Option<Duration>,
    pub batch_size: Option<usize>,
    /// Print per-event outcomes as they are dispatched.
    pub echo: bool,
}

#[derive(Debug, Serialize)]
pub struct ReplayOutput {
    pub summary: LoopSummary,
    pub updates: Vec<UpdateCall>,
}

pub async fn run(args: ReplayArgs, settings: Option<Arc<Settings>>) -> Result<ReplayOutput> {
    let tracker = Arc::new(
        MemoryTracker::load_fixtures(&args.fixtures)
            .with_context(|| format!("Failed to load fixtures {}", args.fixtures.display()))?,
    );
    let source = Arc::new(
        MemoryEventSource::load(&args.events)
            .with_context(|| format!("Failed to load events {}", args.events.display()))?,
    );

    let (credentials, level) = match &settings {
        Some(settings) => (
            Arc::clone(settings) as Arc<dyn CredentialProvider>,
            settings.log_level_filter(),
        ),
        None => (
            Arc::new(StaticCredentials(ScriptCredentials::new("flowhook_replay", "")))
                as Arc<dyn CredentialProvider>,
            LevelFilter::INFO,
        ),
    };

    let mut host = PluginHost::new(credentials, level);
    let plugins = flowhook_rules::builtin_plugins();
    let loaded = host.load_all(&plugins);
    tracing::info!(loaded, total = plugins.len(), events = source.len(), "Replaying events");

    let mut dispatcher_config = settings
        .as_deref()
        .map_or_else(DispatcherConfig::default, DispatcherConfig::from_settings);
    dispatcher_config.handler_timeout = args.handler_timeout;
    let dispatcher = Arc::new(Dispatcher::new(
        host.registry(),
        Arc::new(tracker.connector()),
        dispatcher_config,
    ));

    let mut config = settings
        .as_deref()
        .map_or_else(standalone_loop_config, LoopConfig::from_settings)
        .with_mode(LoopMode::Drain)
        .with_start(StartPosition::Beginning);
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }

    let state = args
        .state
        .clone()
        .or_else(|| settings.as_ref().map(|s| s.event_id_file()));

    let mut event_loop = EventLoop::new(source, dispatcher, config);
    if let Some(state) = state {
        event_loop = event_loop.with_id_store(EventIdStore::new(state));
    }
    if let Some(settings) = &settings {
        let path = settings.pid_file();
        let pid_file = PidFile::create(&path)
            .with_context(|| format!("Failed to create pid file {}", path.display()))?;
        event_loop = event_loop.with_pid_file(pid_file);
    }
    if args.echo {
        event_loop = event_loop.on_batch(print_batch);
    }

    let token = event_loop.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let summary = event_loop.run().await?;
    Ok(ReplayOutput {
        summary,
        updates: tracker.updates(),
    })
}

fn standalone_loop_config() -> LoopConfig {
    LoopConfig {
        batch_size: DEFAULT_BATCH_SIZE,
        fetch_interval: Duration::ZERO,
        retry: RetryPolicy::fixed(1, Duration::ZERO),
        mode: LoopMode::Drain,
        start: StartPosition::Beginning,
    }
}

fn print_batch(report: &BatchReport) {
    for event in &report.events {
        println!("event #{} {}", event.event_id, event.event_type);
        for outcome in event.outcomes.iter().filter(|o| o.outcome.is_matched()) {
            println!(
                "  {}/{}: {} ({}us)",
                outcome.plugin, outcome.handler, outcome.outcome, outcome.execution_time_us
            );
        }
    }
}
