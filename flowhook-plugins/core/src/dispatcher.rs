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

//! Event dispatcher.
//!
//! For each event, every registration is considered in registration order.
//! Matching handlers run one at a time, each inside its own tokio task so
//! that an error, a panic or an overrun of the time budget is contained and
//! reported as a failed outcome for that registration alone.

use crate::error::HandlerError;
use crate::handlers::RuleOutcome;
use crate::registry::{CallbackRegistry, Registration};
use dashmap::DashMap;
use flowhook_core::{
    matches, Event, ScriptCredentials, SessionScoped, TrackingClient, TrackingConnector,
    TrackingError,
};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracing target for per-handler timing records.
pub const TIMING_TARGET: &str = "flowhook::timing";

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Time budget for one handler invocation. `None` waits indefinitely.
    pub handler_timeout: Option<Duration>,
    /// Attribute handler updates to the session that caused the event.
    pub use_session_uuid: bool,
}

impl DispatcherConfig {
    /// No handler time budget; session attribution per `flow.use_session_uuid`.
    pub fn from_settings(settings: &flowhook_core::Settings) -> Self {
        Self {
            handler_timeout: None,
            use_session_uuid: settings.use_session_uuid(),
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_session_uuid(mut self, enabled: bool) -> Self {
        self.use_session_uuid = enabled;
        self
    }
}

/// What happened to one registration for one event.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Succeeded(RuleOutcome),
    Failed(HandlerError),
    /// The registration's filter rejected the event.
    NotMatched,
    /// The handler was not run.
    Skipped(String),
}

impl DispatchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, DispatchOutcome::Failed(_))
    }

    pub fn is_matched(&self) -> bool {
        !matches!(self, DispatchOutcome::NotMatched)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Succeeded(RuleOutcome::Completed { .. }) => "completed",
            DispatchOutcome::Succeeded(RuleOutcome::NoAction { .. }) => "no_action",
            DispatchOutcome::Failed(_) => "failed",
            DispatchOutcome::NotMatched => "not_matched",
            DispatchOutcome::Skipped(_) => "skipped",
        }
    }
}

impl std::fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutcome::Succeeded(RuleOutcome::Completed { updates }) => {
                write!(f, "completed ({updates} updates)")
            }
            DispatchOutcome::Succeeded(RuleOutcome::NoAction { reason }) => {
                write!(f, "no action: {reason}")
            }
            DispatchOutcome::Failed(e) => write!(f, "failed: {e}"),
            DispatchOutcome::NotMatched => write!(f, "not matched"),
            DispatchOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub registration_id: u64,
    pub plugin: String,
    pub handler: String,
    pub outcome: DispatchOutcome,
    /// Zero for registrations that were not run.
    pub execution_time_us: u64,
}

/// Outcomes for one event, in registration order.
#[derive(Debug, Clone)]
pub struct EventReport {
    pub event_id: i64,
    pub event_type: String,
    pub outcomes: Vec<RegistrationOutcome>,
    pub total_time_us: u64,
}

impl EventReport {
    pub fn matched_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_matched()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_failure()).count()
    }

    /// Writes issued by the handlers that completed.
    pub fn updates(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match &o.outcome {
                DispatchOutcome::Succeeded(outcome) => outcome.updates(),
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub events: Vec<EventReport>,
    /// Id of the last event dispatched, if any.
    pub last_event_id: Option<i64>,
}

impl BatchReport {
    pub fn failure_count(&self) -> usize {
        self.events.iter().map(EventReport::failure_count).sum()
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            events: self.events.len(),
            matched: self.events.iter().map(EventReport::matched_count).sum(),
            failures: self.failure_count(),
            updates: self.events.iter().map(EventReport::updates).sum(),
            last_event_id: self.last_event_id,
        }
    }
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub events: usize,
    pub matched: usize,
    pub failures: usize,
    pub updates: usize,
    pub last_event_id: Option<i64>,
}

/// Routes events to registered handlers.
pub struct Dispatcher {
    registry: Arc<CallbackRegistry>,
    connector: Arc<dyn TrackingConnector>,
    clients: DashMap<ScriptCredentials, Arc<dyn TrackingClient>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CallbackRegistry>,
        connector: Arc<dyn TrackingConnector>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            clients: DashMap::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatch one event to every registration.
    pub async fn dispatch(&self, event: &Event) -> EventReport {
        let start = Instant::now();
        let registrations = self.registry.all();
        let mut outcomes = Vec::with_capacity(registrations.len());

        for registration in &registrations {
            let handler_start = Instant::now();
            let outcome = self.dispatch_one(registration, event).await;
            let execution_time_us = if outcome.is_matched() {
                handler_start.elapsed().as_micros() as u64
            } else {
                0
            };

            if outcome.is_matched() {
                tracing::info!(
                    target: TIMING_TARGET,
                    event_id = event.id,
                    plugin = %registration.plugin,
                    handler = registration.handler_name(),
                    outcome = outcome.label(),
                    execution_time_us,
                    "Handler timing"
                );
            }

            outcomes.push(RegistrationOutcome {
                registration_id: registration.id,
                plugin: registration.plugin.clone(),
                handler: registration.handler_name().to_string(),
                outcome,
                execution_time_us,
            });
        }

        let report = EventReport {
            event_id: event.id,
            event_type: event.event_type.clone(),
            outcomes,
            total_time_us: start.elapsed().as_micros() as u64,
        };

        tracing::debug!(
            event_id = report.event_id,
            event_type = %report.event_type,
            matched = report.matched_count(),
            failures = report.failure_count(),
            total_time_us = report.total_time_us,
            "Event dispatch completed"
        );
        report
    }

    /// Dispatch a batch in ascending id order. Repeated ids are dispatched once.
    pub async fn dispatch_batch(&self, mut events: Vec<Event>) -> BatchReport {
        events.sort_by_key(|e| e.id);
        events.dedup_by_key(|e| e.id);

        let mut report = BatchReport::default();
        for event in &events {
            report.events.push(self.dispatch(event).await);
            report.last_event_id = Some(event.id);
        }
        report
    }

    async fn dispatch_one(&self, registration: &Registration, event: &Event) -> DispatchOutcome {
        if !matches(event, registration.filter.as_ref()) {
            return DispatchOutcome::NotMatched;
        }

        let client = match self.client_for(&registration.credentials).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(
                    event_id = event.id,
                    plugin = %registration.plugin,
                    script_name = %registration.credentials.script_name,
                    error = %e,
                    "No tracking client for registration"
                );
                return DispatchOutcome::Skipped(format!("client unavailable: {e}"));
            }
        };

        let client: Arc<dyn TrackingClient> = match &event.session_uuid {
            Some(uuid) if self.config.use_session_uuid => {
                Arc::new(SessionScoped::new(client, uuid.as_str()))
            }
            _ => client,
        };

        match self.invoke(registration, client, event).await {
            Ok(outcome) => DispatchOutcome::Succeeded(outcome),
            Err(error) => {
                tracing::error!(
                    event_id = event.id,
                    event_type = %event.event_type,
                    plugin = %registration.plugin,
                    handler = registration.handler_name(),
                    error = %error,
                    "Handler failed"
                );
                DispatchOutcome::Failed(error)
            }
        }
    }

    async fn client_for(
        &self,
        credentials: &ScriptCredentials,
    ) -> Result<Arc<dyn TrackingClient>, TrackingError> {
        let cached = self.clients.get(credentials).map(|c| Arc::clone(c.value()));
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = self.connector.connect(credentials).await?;
        self.clients.insert(credentials.clone(), Arc::clone(&client));
        Ok(client)
    }

    async fn invoke(
        &self,
        registration: &Registration,
        client: Arc<dyn TrackingClient>,
        event: &Event,
    ) -> Result<RuleOutcome, HandlerError> {
        let handler = Arc::clone(&registration.handler);
        let logger = registration.logger.clone();
        let arg = registration.arg.clone();
        let event = event.clone();

        let mut task = tokio::spawn(async move {
            handler
                .handle(client.as_ref(), &logger, &event, &arg)
                .await
        });

        let joined = match self.config.handler_timeout {
            Some(budget) => match tokio::time::timeout(budget, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(HandlerError::Timeout {
                        timeout_ms: budget.as_millis() as u64,
                    });
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(HandlerError::Cancelled),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{CallbackHandler, RuleHandler};
    use crate::logger::PluginLogger;
    use async_trait::async_trait;
    use flowhook_core::{EventFilter, MemoryTracker};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::level_filters::LevelFilter;

    fn creds(name: &str) -> ScriptCredentials {
        ScriptCredentials::new(name, "key")
    }

    fn dispatcher(
        registry: Arc<CallbackRegistry>,
        config: DispatcherConfig,
    ) -> (Dispatcher, Arc<MemoryTracker>) {
        let tracker = Arc::new(MemoryTracker::new());
        let connector = Arc::new(tracker.connector().reject("offline"));
        (Dispatcher::new(registry, connector, config), tracker)
    }

    fn register(
        registry: &CallbackRegistry,
        filter: Option<EventFilter>,
        handler: impl RuleHandler + 'static,
    ) {
        registry.register(
            "p",
            creds("a"),
            filter,
            handler,
            Value::Null,
            LevelFilter::INFO,
        );
    }

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> CallbackHandler {
        CallbackHandler::new(name, move |_, event, _| {
            log.lock().push(format!("{name}:{}", event.id));
            Ok(RuleOutcome::no_action("recorded"))
        })
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl RuleHandler for Sleeper {
        async fn handle(
            &self,
            _client: &dyn TrackingClient,
            _logger: &PluginLogger,
            _event: &Event,
            _arg: &Value,
        ) -> Result<RuleOutcome, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(RuleOutcome::completed(0))
        }

        fn name(&self) -> &str {
            "sleeper"
        }
    }

    #[tokio::test]
    async fn test_registration_order_and_filtering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(CallbackRegistry::new());
        let task_only = EventFilter::new().on_type("Shotgun_Task_New");

        register(&registry, None, recorder("first", log.clone()));
        register(&registry, Some(task_only), recorder("tasks", log.clone()));
        register(&registry, None, recorder("last", log.clone()));

        let (dispatcher, _) = dispatcher(registry, DispatcherConfig::default());
        let report = dispatcher.dispatch(&Event::new(5, "Shotgun_Version_Change")).await;

        assert_eq!(log.lock().as_slice(), ["first:5", "last:5"]);
        assert_eq!(report.outcomes.len(), 3);
        assert!(matches!(report.outcomes[1].outcome, DispatchOutcome::NotMatched));
        assert_eq!(report.outcomes[1].execution_time_us, 0);
        assert_eq!(report.matched_count(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(CallbackRegistry::new());

        registry.register(
            "p",
            creds("a"),
            None,
            CallbackHandler::new("errors", |_, _, _| {
                Err(HandlerError::Failed("bad data".into()))
            }),
            Value::Null,
            LevelFilter::INFO,
        );
        registry.register(
            "p",
            creds("a"),
            None,
            CallbackHandler::new("panics", |_, _, _| panic!("handler blew up")),
            Value::Null,
            LevelFilter::INFO,
        );
        register(&registry, None, Sleeper(Duration::from_secs(30)));
        register(&registry, None, recorder("survivor", log.clone()));

        let config = DispatcherConfig::default().with_handler_timeout(Duration::from_millis(50));
        let (dispatcher, _) = dispatcher(registry, config);
        let report = dispatcher.dispatch(&Event::new(9, "Shotgun_Task_Change")).await;

        assert!(matches!(
            report.outcomes[0].outcome,
            DispatchOutcome::Failed(HandlerError::Failed(_))
        ));
        match &report.outcomes[1].outcome {
            DispatchOutcome::Failed(HandlerError::Panicked(message)) => {
                assert!(message.contains("handler blew up"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            report.outcomes[2].outcome,
            DispatchOutcome::Failed(HandlerError::Timeout { timeout_ms: 50 })
        ));
        assert_eq!(log.lock().as_slice(), ["survivor:9"]);
        assert_eq!(report.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure_and_sorts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(CallbackRegistry::new());
        registry.register(
            "p",
            creds("a"),
            None,
            CallbackHandler::new("odd_fails", |_, event, _| {
                if event.id % 2 == 1 {
                    Err(HandlerError::Failed("odd".into()))
                } else {
                    Ok(RuleOutcome::completed(1))
                }
            }),
            Value::Null,
            LevelFilter::INFO,
        );
        register(&registry, None, recorder("rec", log.clone()));

        let (dispatcher, _) = dispatcher(registry, DispatcherConfig::default());
        let events = vec![
            Event::new(3, "Shotgun_Task_Change"),
            Event::new(1, "Shotgun_Task_Change"),
            Event::new(2, "Shotgun_Task_Change"),
            Event::new(2, "Shotgun_Task_Change"),
        ];
        let report = dispatcher.dispatch_batch(events).await;

        assert_eq!(log.lock().as_slice(), ["rec:1", "rec:2", "rec:3"]);
        assert_eq!(report.last_event_id, Some(3));
        let summary = report.summary();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.updates, 1);
    }

    #[tokio::test]
    async fn test_unavailable_client_skips_registration() {
        let registry = Arc::new(CallbackRegistry::new());
        registry.register(
            "p",
            creds("offline"),
            None,
            CallbackHandler::new("never", |_, _, _| Ok(RuleOutcome::completed(1))),
            Value::Null,
            LevelFilter::INFO,
        );

        let (dispatcher, _) = dispatcher(registry, DispatcherConfig::default());
        let report = dispatcher.dispatch(&Event::new(1, "Shotgun_Task_New")).await;

        match &report.outcomes[0].outcome {
            DispatchOutcome::Skipped(reason) => {
                assert!(reason.starts_with("client unavailable"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.failure_count(), 0);
    }

    struct StartTask;

    #[async_trait]
    impl RuleHandler for StartTask {
        async fn handle(
            &self,
            client: &dyn TrackingClient,
            _logger: &PluginLogger,
            _event: &Event,
            _arg: &Value,
        ) -> Result<RuleOutcome, HandlerError> {
            let mut data = flowhook_core::Record::new();
            data.insert("sg_status_list".to_string(), Value::from("ip"));
            client.update("Task", 4, data).await?;
            Ok(RuleOutcome::completed(1))
        }

        fn name(&self) -> &str {
            "start_task"
        }
    }

    async fn session_of_update(use_session_uuid: bool) -> Option<String> {
        let registry = Arc::new(CallbackRegistry::new());
        register(&registry, None, StartTask);
        let config = DispatcherConfig::default().with_session_uuid(use_session_uuid);
        let (dispatcher, tracker) = dispatcher(registry, config);
        tracker.insert(
            "Task",
            serde_json::json!({"id": 4, "sg_status_list": "wtg"})
                .as_object()
                .cloned()
                .unwrap(),
        );

        let event = Event::new(12, "Shotgun_Version_Change").with_session_uuid("a1b2");
        let report = dispatcher.dispatch(&event).await;
        assert_eq!(report.updates(), 1);
        tracker.updates()[0].session_uuid.clone()
    }

    #[tokio::test]
    async fn test_session_uuid_propagates_when_enabled() {
        assert_eq!(session_of_update(true).await.as_deref(), Some("a1b2"));
        assert_eq!(session_of_update(false).await, None);
    }

    struct CountingConnector {
        tracker: Arc<MemoryTracker>,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl TrackingConnector for CountingConnector {
        async fn connect(
            &self,
            _credentials: &ScriptCredentials,
        ) -> Result<Arc<dyn TrackingClient>, TrackingError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let client: Arc<dyn TrackingClient> = self.tracker.clone();
            Ok(client)
        }
    }

    #[tokio::test]
    async fn test_clients_cached_per_credentials() {
        let registry = Arc::new(CallbackRegistry::new());
        for script in ["a", "a", "b"] {
            registry.register(
                "p",
                creds(script),
                None,
                CallbackHandler::new("noop", |_, _, _| Ok(RuleOutcome::no_action("noop"))),
                Value::Null,
                LevelFilter::INFO,
            );
        }
        let connector = Arc::new(CountingConnector {
            tracker: Arc::new(MemoryTracker::new()),
            connects: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(registry, connector.clone(), DispatcherConfig::default());

        dispatcher.dispatch(&Event::new(1, "Shotgun_Task_New")).await;
        dispatcher.dispatch(&Event::new(2, "Shotgun_Task_New")).await;

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
