//! End-to-end dispatch tests: listener → agent → driver → bus.
//!
//! The coordinator, driver and subscribers are in-memory fakes; everything
//! between them is the production code path.

use std::sync::Arc;

use run_agent::agent::{Agent, AgentSettings, DispatchOutcome};
use run_agent::auth::Authorizer;
use run_agent::bus::{CoordinatorNotifier, EventBus};
use run_agent::core::errors::{InvalidOperationError, WorkspaceLockedError};
use run_agent::core::job::ImagePullPolicy;
use run_agent::core::lifecycle::{EventKind, Operation, Transition};
use run_agent::core::types::{STATUS_APPLY_QUEUED, STATUS_PLAN_QUEUED};
use run_agent::listener::{BrokerListener, Listener};
use run_agent::test_support::{
    CoordinatorCall, DriverCall, FakeCoordinator, RecordingSubscriber, ScriptedDeliveries,
    ScriptedDriver, WORKSPACE_ID, event_fixture, run_fixture, workspace_fixture,
};
use tokio_util::sync::CancellationToken;

struct Harness {
    coordinator: Arc<FakeCoordinator>,
    driver: ScriptedDriver,
    subscriber: RecordingSubscriber,
    authorizer: Authorizer,
    agent: Agent,
}

fn harness(driver: ScriptedDriver, locked: bool) -> Harness {
    let coordinator = Arc::new(FakeCoordinator::new());
    coordinator.add_workspace(workspace_fixture(WORKSPACE_ID, locked));

    let subscriber = RecordingSubscriber::new();
    let mut bus = EventBus::new();
    bus.subscribe_all(Arc::new(subscriber.clone()));
    bus.subscribe_all(Arc::new(CoordinatorNotifier::new(coordinator.clone())));

    let authorizer = Authorizer::in_memory();
    let agent = Agent::new(
        AgentSettings {
            runner_image: "ghcr.io/run-agent/runner:test".to_string(),
            image_pull_policy: ImagePullPolicy::Never,
        },
        coordinator.clone(),
        Arc::new(driver.clone()),
        authorizer.clone(),
        Arc::new(bus),
    );
    Harness {
        coordinator,
        driver,
        subscriber,
        authorizer,
        agent,
    }
}

fn plan_status(run_id: &str, status: &str) -> CoordinatorCall {
    CoordinatorCall::PlanStatus {
        plan_id: format!("plan-{run_id}"),
        status: status.to_string(),
    }
}

#[tokio::test]
async fn queued_plan_runs_to_completion() {
    let h = harness(ScriptedDriver::succeeding(), false);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));

    let outcome = h.agent.process(&event_fixture("run-1")).await.expect("process");

    assert_eq!(
        outcome,
        DispatchOutcome::Completed {
            operation: Operation::Plan
        }
    );
    assert_eq!(
        h.driver.calls(),
        vec![DriverCall::Start, DriverCall::Wait, DriverCall::Cleanup]
    );
    assert_eq!(
        h.subscriber.kinds(),
        vec![EventKind::PlanStarted, EventKind::PlanCompleted]
    );
    assert_eq!(
        h.coordinator.calls(),
        vec![
            plan_status("run-1", "started"),
            plan_status("run-1", "finished")
        ]
    );

    let jobs = h.driver.jobs();
    assert_eq!(jobs.len(), 1);
    let spec = &jobs[0];
    assert_eq!(spec.operation, Operation::Plan);
    assert_eq!(spec.backend_token, "backend-run-1");
    assert_eq!(spec.backend_image, "ghcr.io/run-agent/runner:test");
    assert_eq!(spec.image_pull_policy, ImagePullPolicy::Never);
    assert_eq!(spec.configuration_version.id, "cv-run-1");
    assert_eq!(spec.proxy_token.len(), 64);
    assert!(
        !h.authorizer.validate("run-1", &spec.proxy_token).await,
        "callback token is revoked once the job is done"
    );
}

#[tokio::test]
async fn queued_apply_reports_apply_status() {
    let h = harness(ScriptedDriver::succeeding(), false);
    h.coordinator.add_run(run_fixture("run-2", STATUS_APPLY_QUEUED));

    let outcome = h.agent.process(&event_fixture("run-2")).await.expect("process");

    assert_eq!(
        outcome,
        DispatchOutcome::Completed {
            operation: Operation::Apply
        }
    );
    assert_eq!(
        h.subscriber.kinds(),
        vec![EventKind::ApplyStarted, EventKind::ApplyCompleted]
    );
    assert_eq!(
        h.coordinator.calls(),
        vec![
            CoordinatorCall::ApplyStatus {
                apply_id: "apply-run-2".to_string(),
                status: "started".to_string(),
            },
            CoordinatorCall::ApplyStatus {
                apply_id: "apply-run-2".to_string(),
                status: "finished".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn locked_workspace_is_refused_before_any_event() {
    let h = harness(ScriptedDriver::succeeding(), true);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));

    let err = h
        .agent
        .process(&event_fixture("run-1"))
        .await
        .expect_err("locked");

    let locked = err
        .downcast_ref::<WorkspaceLockedError>()
        .expect("workspace locked error");
    assert_eq!(locked.workspace_id, WORKSPACE_ID);
    assert!(h.driver.calls().is_empty());
    assert!(h.subscriber.events().is_empty());
    assert!(h.coordinator.calls().is_empty());
}

#[tokio::test]
async fn unknown_status_is_rejected_without_side_effects() {
    let h = harness(ScriptedDriver::succeeding(), false);
    h.coordinator.add_run(run_fixture("run-1", "planned"));

    let err = h
        .agent
        .process(&event_fixture("run-1"))
        .await
        .expect_err("not dispatchable");

    let invalid = err
        .downcast_ref::<InvalidOperationError>()
        .expect("invalid operation error");
    assert_eq!(invalid.status, "planned");
    assert!(h.driver.calls().is_empty());
    assert!(h.subscriber.events().is_empty());
}

#[tokio::test]
async fn missing_run_is_a_precondition_failure() {
    let h = harness(ScriptedDriver::succeeding(), false);

    let err = h
        .agent
        .process(&event_fixture("run-404"))
        .await
        .expect_err("no run");

    assert!(format!("{err:#}").contains("read run run-404"));
    assert!(h.subscriber.events().is_empty());
}

#[tokio::test]
async fn backend_token_failure_ends_in_failed_event() {
    let h = harness(ScriptedDriver::succeeding(), false);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));
    h.coordinator.fail_backend_token("token service down");

    let outcome = h.agent.process(&event_fixture("run-1")).await.expect("process");

    let DispatchOutcome::Failed { operation, error } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(operation, Operation::Plan);
    assert!(error.contains("token service down"), "{error}");
    assert!(h.driver.calls().is_empty());
    assert_eq!(
        h.subscriber.kinds(),
        vec![EventKind::PlanStarted, EventKind::PlanFailed]
    );
    assert_eq!(
        h.coordinator.calls(),
        vec![
            plan_status("run-1", "started"),
            plan_status("run-1", "errored")
        ]
    );
}

#[tokio::test]
async fn start_failure_still_cleans_up_and_revokes() {
    let h = harness(ScriptedDriver::failing_start("image pull failed"), false);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));

    let outcome = h.agent.process(&event_fixture("run-1")).await.expect("process");

    assert!(matches!(outcome, DispatchOutcome::Failed { .. }));
    assert_eq!(h.driver.calls(), vec![DriverCall::Start, DriverCall::Cleanup]);
    let token = h.driver.jobs()[0].proxy_token.clone();
    assert!(!h.authorizer.validate("run-1", &token).await);
}

#[tokio::test]
async fn non_zero_exit_is_reported_on_the_failed_event() {
    let h = harness(ScriptedDriver::failing_wait(2), false);
    h.coordinator.add_run(run_fixture("run-1", STATUS_APPLY_QUEUED));

    h.agent.process(&event_fixture("run-1")).await.expect("process");

    let events = h.subscriber.events();
    assert_eq!(events.len(), 2);
    let failed = &events[1];
    assert_eq!(failed.transition, Transition::Failed);
    assert_eq!(failed.subject_id, "apply-run-1");
    let error = failed.error.as_deref().expect("error message");
    assert!(error.contains("exited with code 2"), "{error}");
    assert_eq!(
        h.driver.calls(),
        vec![DriverCall::Start, DriverCall::Wait, DriverCall::Cleanup]
    );
}

#[tokio::test]
async fn notifier_failure_does_not_fail_the_run() {
    let h = harness(ScriptedDriver::succeeding(), false);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));
    h.coordinator.fail_writes();

    let outcome = h.agent.process(&event_fixture("run-1")).await.expect("process");

    assert!(matches!(outcome, DispatchOutcome::Completed { .. }));
    assert_eq!(
        h.subscriber.kinds(),
        vec![EventKind::PlanStarted, EventKind::PlanCompleted]
    );
}

#[tokio::test]
async fn broker_redelivery_runs_the_job_twice_and_skips_garbage() {
    let h = harness(ScriptedDriver::succeeding(), false);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));
    let body = serde_json::to_vec(&event_fixture("run-1")).expect("encode event");

    let mut listener = BrokerListener::new(ScriptedDeliveries::new(vec![
        Ok(body.clone()),
        Ok(b"not json".to_vec()),
        Err("channel closed".to_string()),
        Ok(body),
    ]));
    listener
        .listen(&h.agent, CancellationToken::new())
        .await
        .expect("listen");

    assert_eq!(h.driver.calls().len(), 6);
    assert_eq!(
        h.subscriber.kinds(),
        vec![
            EventKind::PlanStarted,
            EventKind::PlanCompleted,
            EventKind::PlanStarted,
            EventKind::PlanCompleted,
        ]
    );
}

#[tokio::test]
async fn locked_workspace_does_not_stop_the_listener() {
    let h = harness(ScriptedDriver::succeeding(), true);
    h.coordinator.add_run(run_fixture("run-1", STATUS_PLAN_QUEUED));
    let body = serde_json::to_vec(&event_fixture("run-1")).expect("encode event");

    let mut listener = BrokerListener::new(ScriptedDeliveries::new(vec![Ok(body.clone()), Ok(body)]));
    listener
        .listen(&h.agent, CancellationToken::new())
        .await
        .expect("listen");

    assert!(h.driver.calls().is_empty());
    assert!(h.subscriber.events().is_empty());
}
