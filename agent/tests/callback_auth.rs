//! Callback API tests: token enforcement and forwarding to the coordinator.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use run_agent::auth::{Authorizer, RUN_ID_HEADER, TOKEN_HEADER};
use run_agent::core::types::{RunEvent, RunStatusUpdate};
use run_agent::listener::{BrokerListener, RunHandler};
use run_agent::server::{CallbackState, listen_with_callbacks, router};
use run_agent::test_support::{
    CoordinatorCall, FakeCoordinator, ScriptedDeliveries, event_fixture,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Api {
    router: Router,
    coordinator: Arc<FakeCoordinator>,
    authorizer: Authorizer,
}

fn api() -> Api {
    let coordinator = Arc::new(FakeCoordinator::new());
    let authorizer = Authorizer::in_memory();
    let router = router(CallbackState::new(authorizer.clone(), coordinator.clone()));
    Api {
        router,
        coordinator,
        authorizer,
    }
}

fn post(path: &str, credentials: Option<(&str, &str)>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some((run_id, token)) = credentials {
        builder = builder.header(RUN_ID_HEADER, run_id).header(TOKEN_HEADER, token);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, body.to_vec())
}

#[tokio::test]
async fn health_is_open() {
    let api = api();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let (status, body) = send(&api.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn missing_headers_are_unauthorized() {
    let api = api();
    let body = json!({"runId": "run-1", "status": "planning"});
    let (status, _) = send(&api.router, post("/v1/runs/status", None, &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(api.coordinator.calls().is_empty());
}

#[tokio::test]
async fn wrong_or_revoked_token_is_unauthorized() {
    let api = api();
    let token = api.authorizer.generate_token("run-1").await.expect("token");
    let body = json!({"runId": "run-1", "content": "chunk"});

    let (status, _) = send(
        &api.router,
        post("/v1/logs/stream", Some(("run-1", "not-the-token")), &body),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A token is only valid for the run it was issued to.
    let (status, _) = send(
        &api.router,
        post("/v1/logs/stream", Some(("run-2", token.as_str())), &body),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    api.authorizer.revoke("run-1").await.expect("revoke");
    let (status, _) = send(
        &api.router,
        post("/v1/logs/stream", Some(("run-1", token.as_str())), &body),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(api.coordinator.calls().is_empty());
}

#[tokio::test]
async fn body_for_another_run_is_forbidden() {
    let api = api();
    let token = api.authorizer.generate_token("run-1").await.expect("token");
    let body = json!({"runId": "run-2", "content": "plan"});

    let (status, _) = send(
        &api.router,
        post("/v1/plans/upload", Some(("run-1", token.as_str())), &body),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(api.coordinator.calls().is_empty());
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let api = api();
    let token = api.authorizer.generate_token("run-1").await.expect("token");

    let (status, _) = send(
        &api.router,
        post("/v1/runs/status", Some(("run-1", token.as_str())), &json!({"runId": "run-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &api.router,
        post(
            "/v1/runs/status",
            Some(("run-1", token.as_str())),
            &json!({"runId": "run-1", "status": "  "}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn authorized_reports_are_forwarded() {
    let api = api();
    let token = api.authorizer.generate_token("run-1").await.expect("token");
    let credentials = Some(("run-1", token.as_str()));

    let (status, body) = send(
        &api.router,
        post(
            "/v1/runs/status",
            credentials,
            &json!({"runId": "run-1", "status": "planned", "add": 3, "destroy": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let ack: Value = serde_json::from_slice(&body).expect("ack json");
    assert_eq!(ack, json!({"success": true}));

    for (path, content) in [
        ("/v1/plans/upload", "cGxhbg=="),
        ("/v1/logs/stream", "line 1\n"),
        ("/v1/logs/upload", "full log"),
    ] {
        let (status, _) = send(
            &api.router,
            post(path, credentials, &json!({"runId": "run-1", "content": content})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{path}");
    }

    assert_eq!(
        api.coordinator.calls(),
        vec![
            CoordinatorCall::RunStatus {
                run_id: "run-1".to_string(),
                update: RunStatusUpdate {
                    status: "planned".to_string(),
                    add: 3,
                    change: 0,
                    destroy: 1,
                },
            },
            CoordinatorCall::UploadPlan {
                run_id: "run-1".to_string(),
                content: "cGxhbg==".to_string(),
            },
            CoordinatorCall::AppendLogs {
                run_id: "run-1".to_string(),
                chunk: "line 1\n".to_string(),
            },
            CoordinatorCall::UploadLogs {
                run_id: "run-1".to_string(),
                content: "full log".to_string(),
            },
        ]
    );
}

#[tokio::test]
async fn coordinator_failure_is_a_bad_gateway() {
    let api = api();
    api.coordinator.fail_writes();
    let token = api.authorizer.generate_token("run-1").await.expect("token");

    let (status, _) = send(
        &api.router,
        post(
            "/v1/logs/upload",
            Some(("run-1", token.as_str())),
            &json!({"runId": "run-1", "content": "log"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn concurrent_callbacks_are_authorized_independently() {
    let api = api();
    let token_a = api.authorizer.generate_token("run-a").await.expect("token");
    let token_b = api.authorizer.generate_token("run-b").await.expect("token");

    let ((status_a, _), (status_b, _), (status_swapped, _)) = tokio::join!(
        send(
            &api.router,
            post(
                "/v1/logs/stream",
                Some(("run-a", token_a.as_str())),
                &json!({"runId": "run-a", "content": "a"}),
            ),
        ),
        send(
            &api.router,
            post(
                "/v1/logs/stream",
                Some(("run-b", token_b.as_str())),
                &json!({"runId": "run-b", "content": "b"}),
            ),
        ),
        send(
            &api.router,
            post(
                "/v1/logs/stream",
                Some(("run-a", token_b.as_str())),
                &json!({"runId": "run-a", "content": "x"}),
            ),
        ),
    );

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    assert_eq!(status_swapped, StatusCode::UNAUTHORIZED);
    let calls = api.coordinator.calls();
    assert_eq!(calls.len(), 2);
    for (run_id, chunk) in [("run-a", "a"), ("run-b", "b")] {
        assert!(calls.contains(&CoordinatorCall::AppendLogs {
            run_id: run_id.to_string(),
            chunk: chunk.to_string(),
        }));
    }
}

/// Requests shutdown, then reports a log chunk like a job that is still
/// running would.
struct InFlightJob {
    base_url: String,
    token: String,
    shutdown: CancellationToken,
    statuses: Mutex<Vec<u16>>,
}

#[async_trait]
impl RunHandler for InFlightJob {
    async fn handle(&self, event: RunEvent) -> anyhow::Result<()> {
        self.shutdown.cancel();
        let response = reqwest::Client::new()
            .post(format!("{}/v1/logs/stream", self.base_url))
            .header(RUN_ID_HEADER, &event.run_id)
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({"runId": event.run_id, "content": "still planning"}))
            .send()
            .await?;
        self.statuses
            .lock()
            .expect("statuses")
            .push(response.status().as_u16());
        Ok(())
    }
}

#[tokio::test]
async fn callbacks_stay_up_until_the_in_flight_run_finishes() {
    let api = api();
    let token = api.authorizer.generate_token("run-1").await.expect("token");
    let callbacks = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = callbacks.local_addr().expect("addr");
    let shutdown = CancellationToken::new();
    let job = InFlightJob {
        base_url: format!("http://{addr}"),
        token,
        shutdown: shutdown.clone(),
        statuses: Mutex::new(Vec::new()),
    };
    let body = serde_json::to_vec(&event_fixture("run-1")).expect("encode event");
    let mut listener =
        BrokerListener::new(ScriptedDeliveries::new(vec![Ok(body.clone()), Ok(body)]));

    listen_with_callbacks(
        &mut listener,
        &job,
        callbacks,
        CallbackState::new(api.authorizer.clone(), api.coordinator.clone()),
        shutdown,
    )
    .await
    .expect("listen");

    assert_eq!(*job.statuses.lock().expect("statuses"), vec![200]);
    assert_eq!(
        api.coordinator.calls(),
        vec![CoordinatorCall::AppendLogs {
            run_id: "run-1".to_string(),
            chunk: "still planning".to_string(),
        }]
    );
}
