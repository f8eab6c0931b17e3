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

//! End-to-end scenarios for the built-in rules, run through the dispatcher
//! against an in-memory tracking service.

use flowhook_core::{
    status_list_schema, EntityRef, Event, MemoryTracker, Record, ScriptCredentials,
    StaticCredentials,
};
use flowhook_plugins::{
    DispatchOutcome, Dispatcher, DispatcherConfig, EventReport, HandlerError, Plugin, PluginHost,
    RuleOutcome,
};
use flowhook_rules::{builtin_plugins, ProjectWrapCleanup, UserCleanup, VersionStatusToTask};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

/// Log output collected from the current thread's subscriber.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's tracing output into a buffer until the guard drops.
/// `#[tokio::test]` runs spawned handler tasks on the same thread.
fn capture_logs() -> (Captured, DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(LevelFilter::TRACE)
        .with_writer(captured.clone())
        .finish();
    (captured, tracing::subscriber::set_default(subscriber))
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn project(id: i64) -> Value {
    json!({"type": "Project", "id": id})
}

fn rule_set(id: i64) -> Value {
    json!({"type": "PermissionRuleSet", "id": id})
}

fn studio() -> Arc<MemoryTracker> {
    let tracker = Arc::new(MemoryTracker::new());

    for (id, code) in [(1, "artist"), (2, "supervisor"), (3, "admin")] {
        tracker.insert("PermissionRuleSet", record(json!({"id": id, "code": code})));
    }
    for (id, name, role, projects) in [
        (10, "ann", 1, vec![42, 7]),
        (11, "bob", 2, vec![42]),
        (12, "cat", 3, vec![42]),
        (13, "dan", 1, vec![7]),
    ] {
        let projects: Vec<Value> = projects.into_iter().map(project).collect();
        tracker.insert(
            "HumanUser",
            record(json!({
                "id": id,
                "name": name,
                "permission_rule_set": rule_set(role),
                "projects": projects,
                "sg_status_list": "act"
            })),
        );
    }

    tracker.insert("Task", record(json!({"id": 9, "content": "comp", "sg_status_list": "rdy"})));
    tracker.insert(
        "Version",
        record(json!({"id": 5, "code": "shot010_v001", "sg_task": {"type": "Task", "id": 9}})),
    );
    tracker.insert("Version", record(json!({"id": 6, "code": "orphan_v001", "sg_task": null})));
    tracker.set_schema(
        "Task",
        "sg_status_list",
        status_list_schema(
            "sg_status_list",
            &[("rdy", "Ready to Start"), ("ip", "In Progress"), ("cmpt", "Complete")],
        ),
    );

    tracker
}

fn dispatcher(tracker: &Arc<MemoryTracker>, plugins: Vec<Box<dyn Plugin>>) -> Dispatcher {
    let mut host = PluginHost::new(
        Arc::new(StaticCredentials(ScriptCredentials::new("events", "key"))),
        LevelFilter::DEBUG,
    );
    assert_eq!(host.load_all(&plugins), plugins.len());
    Dispatcher::new(
        host.registry(),
        Arc::new(tracker.connector()),
        DispatcherConfig::default(),
    )
}

fn wrap_event(id: i64, status: Option<&str>) -> Event {
    let event = Event::new(id, "Shotgun_Project_Change")
        .with_entity(EntityRef::new("Project", 42).with_name("Big Feature"))
        .with_attribute("sg_status")
        .with_old_value("Active");
    match status {
        Some(status) => event.with_new_value(status),
        None => event,
    }
}

fn version_status(id: i64, version: i64, status: &str) -> Event {
    Event::new(id, "Shotgun_Version_Change")
        .with_entity(EntityRef::new("Version", version))
        .with_attribute("sg_status_list")
        .with_project(EntityRef::new("Project", 42))
        .with_new_value(status)
}

fn only_outcome(report: &EventReport) -> &DispatchOutcome {
    let mut matched = report.outcomes.iter().filter(|o| o.outcome.is_matched());
    let first = matched.next().expect("no matched registration");
    assert!(matched.next().is_none(), "expected one matched registration");
    &first.outcome
}

fn project_ids(tracker: &MemoryTracker, user: i64) -> Vec<i64> {
    tracker.get("HumanUser", user).unwrap()["projects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn wrap_removes_only_the_wrapped_project() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(ProjectWrapCleanup::default())]);

    let report = dispatcher.dispatch(&wrap_event(1, Some("Wrap"))).await;

    assert!(matches!(
        only_outcome(&report),
        DispatchOutcome::Succeeded(RuleOutcome::Completed { updates: 2 })
    ));
    let updates = tracker.updates();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|u| u.entity_type == "HumanUser"));
    assert_eq!(project_ids(&tracker, 10), [7]);
    assert!(project_ids(&tracker, 11).is_empty());
    assert_eq!(project_ids(&tracker, 12), [42]);
    assert_eq!(project_ids(&tracker, 13), [7]);
}

#[tokio::test]
async fn wrap_replay_changes_nothing() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(ProjectWrapCleanup::default())]);

    dispatcher.dispatch(&wrap_event(1, Some("Wrap"))).await;
    let replay = dispatcher.dispatch(&wrap_event(1, Some("Wrap"))).await;

    assert!(matches!(
        only_outcome(&replay),
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { .. })
    ));
    assert_eq!(tracker.update_count(), 2);
}

#[tokio::test]
async fn other_project_status_is_a_logged_no_op() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(ProjectWrapCleanup::default())]);
    let (logs, _guard) = capture_logs();

    let report = dispatcher.dispatch(&wrap_event(1, Some("Active"))).await;

    assert!(matches!(
        only_outcome(&report),
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { .. })
    ));
    assert_eq!(tracker.update_count(), 0);

    let logs = logs.contents();
    assert!(logs.contains(r#"status "Active" is not Wrap"#), "{logs}");
    assert!(logs.contains("plugin=project_wrap_cleanup"), "{logs}");
}

#[tokio::test]
async fn wrap_without_new_value_is_skipped() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(ProjectWrapCleanup::default())]);

    let report = dispatcher.dispatch(&wrap_event(1, None)).await;

    match only_outcome(&report) {
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { reason }) => {
            assert_eq!(reason, "event has no new value")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(tracker.update_count(), 0);
}

#[tokio::test]
async fn cascade_without_new_value_is_a_logged_skip() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(VersionStatusToTask::default())]);
    let (logs, _guard) = capture_logs();
    let event = Event::new(3, "Shotgun_Version_Change")
        .with_entity(EntityRef::new("Version", 5))
        .with_attribute("sg_status_list")
        .with_old_value("rdy");

    let report = dispatcher.dispatch(&event).await;

    match only_outcome(&report) {
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { reason }) => {
            assert_eq!(reason, "event has no new value")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(tracker.update_count(), 0);
    assert_eq!(tracker.get("Task", 9).unwrap()["sg_status_list"], "rdy");

    let logs = logs.contents();
    assert!(logs.contains("Event 3 has no new status value"), "{logs}");
}

#[tokio::test]
async fn user_deleted_mid_wrap_is_skipped_and_the_rest_cleaned() {
    let tracker = studio();
    tracker.delete_before_update("HumanUser", 10);
    let dispatcher = dispatcher(&tracker, vec![Box::new(ProjectWrapCleanup::default())]);
    let (logs, _guard) = capture_logs();

    let report = dispatcher.dispatch(&wrap_event(1, Some("Wrap"))).await;

    assert!(matches!(
        only_outcome(&report),
        DispatchOutcome::Succeeded(RuleOutcome::Completed { updates: 1 })
    ));
    assert_eq!(report.failure_count(), 0);
    assert!(tracker.get("HumanUser", 10).is_none());
    assert!(project_ids(&tracker, 11).is_empty());

    let logs = logs.contents();
    assert!(logs.contains("HumanUser #10 no longer exists"), "{logs}");
}

#[tokio::test]
async fn task_deleted_mid_cascade_is_a_skip() {
    let tracker = studio();
    tracker.delete_before_update("Task", 9);
    let dispatcher = dispatcher(&tracker, vec![Box::new(VersionStatusToTask::default())]);

    let report = dispatcher.dispatch(&version_status(1, 5, "ip")).await;

    match only_outcome(&report) {
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { reason }) => {
            assert_eq!(reason, "task not found")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(tracker.update_count(), 0);
}

#[tokio::test]
async fn disabled_user_loses_all_projects() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(UserCleanup)]);
    let disable = Event::new(1, "Shotgun_HumanUser_Change")
        .with_entity(EntityRef::new("HumanUser", 10))
        .with_attribute("sg_status_list")
        .with_old_value("act")
        .with_new_value("dis");

    dispatcher.dispatch(&disable).await;
    let again = dispatcher.dispatch(&disable).await;

    assert!(project_ids(&tracker, 10).is_empty());
    assert_eq!(tracker.update_count(), 1);
    assert!(matches!(
        only_outcome(&again),
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { .. })
    ));

    let activate = Event::new(2, "Shotgun_HumanUser_Change")
        .with_entity(EntityRef::new("HumanUser", 11))
        .with_attribute("sg_status_list")
        .with_new_value("act");
    dispatcher.dispatch(&activate).await;
    assert_eq!(project_ids(&tracker, 11), [42]);
}

#[tokio::test]
async fn version_status_cascades_to_task_once() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(VersionStatusToTask::default())]);

    let first = dispatcher.dispatch(&version_status(1, 5, "ip")).await;
    let replay = dispatcher.dispatch(&version_status(1, 5, "ip")).await;

    assert!(matches!(
        only_outcome(&first),
        DispatchOutcome::Succeeded(RuleOutcome::Completed { updates: 1 })
    ));
    assert!(matches!(
        only_outcome(&replay),
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { .. })
    ));
    assert_eq!(tracker.get("Task", 9).unwrap()["sg_status_list"], "ip");
    assert_eq!(tracker.update_count(), 1);
}

#[tokio::test]
async fn invalid_task_status_is_skipped() {
    let tracker = studio();
    let dispatcher = dispatcher(&tracker, vec![Box::new(VersionStatusToTask::default())]);

    dispatcher.dispatch(&version_status(1, 5, "apr")).await;
    dispatcher.dispatch(&version_status(2, 6, "ip")).await;
    dispatcher.dispatch(&version_status(3, 404, "ip")).await;

    assert_eq!(tracker.update_count(), 0);
    assert_eq!(tracker.get("Task", 9).unwrap()["sg_status_list"], "rdy");
}

#[tokio::test]
async fn status_map_translates_version_codes() {
    let tracker = studio();
    let plugin = VersionStatusToTask::default().with_mapping("apr", "cmpt");
    let dispatcher = dispatcher(&tracker, vec![Box::new(plugin)]);

    dispatcher.dispatch(&version_status(1, 5, "apr")).await;

    assert_eq!(tracker.get("Task", 9).unwrap()["sg_status_list"], "cmpt");
}

#[tokio::test]
async fn schema_read_failure_degrades_to_skip() {
    let tracker = studio();
    tracker.fail_schema_reads(true);
    let dispatcher = dispatcher(&tracker, vec![Box::new(VersionStatusToTask::default())]);

    let report = dispatcher.dispatch(&version_status(1, 5, "ip")).await;

    assert!(matches!(
        only_outcome(&report),
        DispatchOutcome::Succeeded(RuleOutcome::NoAction { .. })
    ));
    assert_eq!(tracker.update_count(), 0);
}

#[tokio::test]
async fn failing_rule_does_not_stop_others_or_the_batch() {
    let tracker = studio();
    tracker.fail_updates_for("Task", 9);
    let dispatcher = dispatcher(&tracker, builtin_plugins());

    let report = dispatcher
        .dispatch_batch(vec![wrap_event(2, Some("Wrap")), version_status(1, 5, "ip")])
        .await;

    let first = &report.events[0];
    assert_eq!(first.event_id, 1);
    let failed: Vec<_> = first
        .outcomes
        .iter()
        .filter(|o| o.outcome.is_failure())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].plugin, "version_status_to_task");
    assert!(matches!(
        failed[0].outcome,
        DispatchOutcome::Failed(HandlerError::Tracking(_))
    ));
    // log_args still ran for the failing event
    assert!(first
        .outcomes
        .iter()
        .any(|o| o.plugin == "log_args" && !o.outcome.is_failure() && o.outcome.is_matched()));

    assert_eq!(report.events[1].event_id, 2);
    assert_eq!(report.events[1].updates(), 2);
    assert_eq!(report.last_event_id, Some(2));
}
