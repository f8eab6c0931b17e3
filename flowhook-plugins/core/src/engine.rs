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

//! The fetch / dispatch / checkpoint loop.
//!
//! Each iteration fetches up to `batch_size` events after the last processed
//! id, dispatches them in id order, and writes the new last id to the event id
//! file. Stop requests (the cancellation token, or removal of the pid file)
//! are only looked at between batches, so a batch is never cut short.

use crate::dispatcher::{BatchReport, Dispatcher};
use crate::error::EngineError;
use crate::resilience::{RetryError, RetryPolicy};
use async_trait::async_trait;
use flowhook_core::{Event, EventIdStore, PidFile, Settings, TrackingError};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where events come from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Id of the newest event, if there are any.
    async fn latest_event_id(&self) -> Result<Option<i64>, TrackingError>;

    /// Up to `limit` events with ids above `after` (all ids when `None`), ascending.
    async fn fetch_after(&self, after: Option<i64>, limit: usize)
        -> Result<Vec<Event>, TrackingError>;
}

/// Events held in memory, e.g. read from a JSON file.
#[derive(Default)]
pub struct MemoryEventSource {
    events: RwLock<Vec<Event>>,
}

impl MemoryEventSource {
    pub fn new(mut events: Vec<Event>) -> Self {
        events.sort_by_key(|e| e.id);
        Self {
            events: RwLock::new(events),
        }
    }

    /// Read a JSON array of events.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrackingError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TrackingError::Connection(format!("{}: {e}", path.display())))?;
        let events: Vec<Event> = serde_json::from_str(&content)
            .map_err(|e| TrackingError::InvalidResponse(format!("{}: {e}", path.display())))?;
        Ok(Self::new(events))
    }

    pub fn push(&self, event: Event) {
        let mut events = self.events.write();
        events.push(event);
        events.sort_by_key(|e| e.id);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    async fn latest_event_id(&self) -> Result<Option<i64>, TrackingError> {
        Ok(self.events.read().last().map(|e| e.id))
    }

    async fn fetch_after(
        &self,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Event>, TrackingError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| after.map_or(true, |last| e.id > last))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Poll forever, sleeping `fetch_interval` when there is nothing new.
    Continuous,
    /// Stop as soon as a fetch comes back empty.
    Drain,
}

/// Where to begin when there is no saved event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Skip history and process only new events.
    Latest,
    Beginning,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub batch_size: usize,
    pub fetch_interval: Duration,
    pub retry: RetryPolicy,
    pub mode: LoopMode,
    pub start: StartPosition,
}

impl LoopConfig {
    /// Continuous polling from the latest event, with batch size, fetch
    /// interval and retries taken from `service` settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            batch_size: settings.max_batch_size(),
            fetch_interval: settings.fetch_interval(),
            retry: RetryPolicy::from_settings(settings),
            mode: LoopMode::Continuous,
            start: StartPosition::Latest,
        }
    }

    pub fn with_mode(mut self, mode: LoopMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_start(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    PidFileRemoved,
    Drained,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopSummary {
    pub batches: usize,
    pub events: usize,
    pub failures: usize,
    pub updates: usize,
    pub last_event_id: Option<i64>,
    pub stop_reason: StopReason,
}

impl LoopSummary {
    fn absorb(&mut self, report: &BatchReport) {
        let batch = report.summary();
        self.batches += 1;
        self.events += batch.events;
        self.failures += batch.failures;
        self.updates += batch.updates;
        if batch.last_event_id.is_some() {
            self.last_event_id = batch.last_event_id;
        }
    }
}

type BatchObserver = Box<dyn Fn(&BatchReport) + Send + Sync>;

/// Drives an [`EventSource`] through a [`Dispatcher`], checkpointing the
/// last processed id after each batch.
pub struct EventLoop {
    source: Arc<dyn EventSource>,
    dispatcher: Arc<Dispatcher>,
    config: LoopConfig,
    id_store: Option<EventIdStore>,
    pid_file: Option<PidFile>,
    cancel: CancellationToken,
    observer: Option<BatchObserver>,
}

impl EventLoop {
    pub fn new(
        source: Arc<dyn EventSource>,
        dispatcher: Arc<Dispatcher>,
        config: LoopConfig,
    ) -> Self {
        Self {
            source,
            dispatcher,
            config,
            id_store: None,
            pid_file: None,
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    /// Resume from, and checkpoint to, this event id file.
    pub fn with_id_store(mut self, store: EventIdStore) -> Self {
        self.id_store = Some(store);
        self
    }

    /// The loop stops after the current batch once this file is gone, and
    /// removes it on exit.
    pub fn with_pid_file(mut self, pid_file: PidFile) -> Self {
        self.pid_file = Some(pid_file);
        self
    }

    /// Called with every batch report after it is checkpointed.
    pub fn on_batch(mut self, observer: impl Fn(&BatchReport) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<LoopSummary, EngineError> {
        let mut last_id = self.initial_position().await?;
        let mut summary = LoopSummary {
            batches: 0,
            events: 0,
            failures: 0,
            updates: 0,
            last_event_id: last_id,
            stop_reason: StopReason::Drained,
        };

        tracing::info!(
            last_event_id = ?last_id,
            batch_size = self.config.batch_size,
            mode = ?self.config.mode,
            "Event loop starting"
        );

        loop {
            if let Some(reason) = self.stop_requested() {
                summary.stop_reason = reason;
                break;
            }

            let fetched = self
                .config
                .retry
                .retry(|_| self.source.fetch_after(last_id, self.config.batch_size))
                .await;

            let events = match fetched {
                Ok(events) => events,
                Err(RetryError::Exhausted { attempts, last }) => {
                    if self.config.mode == LoopMode::Drain {
                        return Err(EngineError::Fetch {
                            attempts,
                            source: last,
                        });
                    }
                    tracing::error!(attempts, error = %last, "Could not fetch events");
                    if self.idle().await {
                        summary.stop_reason = StopReason::Cancelled;
                        break;
                    }
                    continue;
                }
            };

            if events.is_empty() {
                if self.config.mode == LoopMode::Drain {
                    summary.stop_reason = StopReason::Drained;
                    break;
                }
                if self.idle().await {
                    summary.stop_reason = StopReason::Cancelled;
                    break;
                }
                continue;
            }

            let report = self.dispatcher.dispatch_batch(events).await;
            summary.absorb(&report);
            if let Some(id) = report.last_event_id {
                last_id = Some(id);
                self.checkpoint(id);
            }
            if let Some(observer) = &self.observer {
                observer(&report);
            }
        }

        tracing::info!(
            batches = summary.batches,
            events = summary.events,
            failures = summary.failures,
            last_event_id = ?summary.last_event_id,
            stop_reason = ?summary.stop_reason,
            "Event loop stopped"
        );
        Ok(summary)
    }

    async fn initial_position(&self) -> Result<Option<i64>, EngineError> {
        if let Some(store) = &self.id_store {
            if let Some(id) = store.load()? {
                tracing::info!(
                    event_id = id,
                    path = %store.path().display(),
                    "Resuming after saved event id"
                );
                return Ok(Some(id));
            }
        }

        match self.config.start {
            StartPosition::Beginning => Ok(None),
            StartPosition::Latest => {
                let latest = self
                    .config
                    .retry
                    .retry(|_| self.source.latest_event_id())
                    .await
                    .map_err(|RetryError::Exhausted { attempts, last }| EngineError::Fetch {
                        attempts,
                        source: last,
                    })?;
                tracing::info!(
                    event_id = ?latest,
                    "No saved event id, starting from the latest event"
                );
                Ok(latest)
            }
        }
    }

    fn stop_requested(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match &self.pid_file {
            Some(pid_file) if !pid_file.exists() => {
                tracing::info!(path = %pid_file.path().display(), "Pid file removed, stopping");
                Some(StopReason::PidFileRemoved)
            }
            _ => None,
        }
    }

    fn checkpoint(&self, event_id: i64) {
        if let Some(store) = &self.id_store {
            if let Err(e) = store.save(event_id) {
                tracing::error!(event_id, error = %e, "Failed to save last event id");
            }
        }
    }

    /// Wait out the fetch interval. Returns true if cancelled meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(self.config.fetch_interval) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::handlers::{CallbackHandler, RuleOutcome};
    use crate::registry::CallbackRegistry;
    use flowhook_core::{MemoryTracker, ScriptCredentials};
    use parking_lot::Mutex;
    use serde_json::Value;
    use tracing::level_filters::LevelFilter;

    fn config(mode: LoopMode, start: StartPosition) -> LoopConfig {
        LoopConfig {
            batch_size: 2,
            fetch_interval: Duration::from_millis(10),
            retry: RetryPolicy::fixed(1, Duration::from_millis(1)),
            mode,
            start,
        }
    }

    fn recording_dispatcher(seen: Arc<Mutex<Vec<i64>>>) -> Arc<Dispatcher> {
        let registry = Arc::new(CallbackRegistry::new());
        registry.register(
            "test",
            ScriptCredentials::new("events", "key"),
            None,
            CallbackHandler::new("record", move |_, event, _| {
                seen.lock().push(event.id);
                Ok(RuleOutcome::no_action("seen"))
            }),
            Value::Null,
            LevelFilter::INFO,
        );
        let tracker = Arc::new(MemoryTracker::new());
        Arc::new(Dispatcher::new(
            registry,
            Arc::new(tracker.connector()),
            DispatcherConfig::default(),
        ))
    }

    fn source(ids: &[i64]) -> Arc<MemoryEventSource> {
        Arc::new(MemoryEventSource::new(
            ids.iter().map(|id| Event::new(*id, "Shotgun_Task_Change")).collect(),
        ))
    }

    #[tokio::test]
    async fn test_drain_processes_all_batches_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventIdStore::new(dir.path().join("loop.id"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let summary = EventLoop::new(
            source(&[5, 1, 3, 2, 4]),
            recording_dispatcher(seen.clone()),
            config(LoopMode::Drain, StartPosition::Beginning),
        )
        .with_id_store(store.clone())
        .run()
        .await
        .unwrap();

        assert_eq!(seen.lock().as_slice(), [1, 2, 3, 4, 5]);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.events, 5);
        assert_eq!(summary.stop_reason, StopReason::Drained);
        assert_eq!(store.load().unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_resumes_after_saved_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = EventIdStore::new(dir.path().join("loop.id"));
        store.save(3).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        EventLoop::new(
            source(&[1, 2, 3, 4, 5]),
            recording_dispatcher(seen.clone()),
            config(LoopMode::Drain, StartPosition::Beginning),
        )
        .with_id_store(store)
        .run()
        .await
        .unwrap();

        assert_eq!(seen.lock().as_slice(), [4, 5]);
    }

    #[tokio::test]
    async fn test_latest_start_skips_history() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let summary = EventLoop::new(
            source(&[1, 2, 3]),
            recording_dispatcher(seen.clone()),
            config(LoopMode::Drain, StartPosition::Latest),
        )
        .run()
        .await
        .unwrap();

        assert!(seen.lock().is_empty());
        assert_eq!(summary.last_event_id, Some(3));
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_batches() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let events = source(&[1, 2]);
        let event_loop = EventLoop::new(
            events.clone(),
            recording_dispatcher(seen.clone()),
            config(LoopMode::Continuous, StartPosition::Beginning),
        );
        let token = event_loop.cancellation_token();
        let handle = tokio::spawn(event_loop.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        events.push(Event::new(3, "Shotgun_Task_Change"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(seen.lock().as_slice(), [1, 2, 3]);
    }

    #[tokio::test]
    async fn test_removed_pid_file_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("loop.pid");
        let pid_file = PidFile::create(&pid_path).unwrap();
        std::fs::remove_file(&pid_path).unwrap();

        let summary = EventLoop::new(
            source(&[1]),
            recording_dispatcher(Arc::new(Mutex::new(Vec::new()))),
            config(LoopMode::Continuous, StartPosition::Beginning),
        )
        .with_pid_file(pid_file)
        .run()
        .await
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::PidFileRemoved);
        assert_eq!(summary.events, 0);
    }
}
