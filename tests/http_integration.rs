//! Integration tests for the HTTP surface.
//!
//! Each test spins up an Axum server on a random port and exercises the real
//! REST contract with reqwest, including the HTTP agent client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use calc_orchestrator::agent::{Agent, HttpTaskSource, Iteration};
use calc_orchestrator::config::{DispatchConfig, OperationTimes};
use calc_orchestrator::gateway::routes::{OWNER_HEADER, router};
use calc_orchestrator::gateway::{SubmissionService, WorkerGateway};
use calc_orchestrator::scheduler::{CompletionDispatcher, Scheduler};
use calc_orchestrator::store::LibSqlBackend;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start an Axum server on a random port, return its base URL.
async fn start_server() -> String {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    let dispatcher = Arc::new(CompletionDispatcher::spawn(
        Arc::clone(&scheduler),
        DispatchConfig::default(),
    ));
    let gateway = Arc::new(WorkerGateway::new(
        store.clone(),
        dispatcher,
        OperationTimes::instant(),
        3,
    ));
    let submissions = Arc::new(SubmissionService::new(store, scheduler));
    let app = router(gateway, submissions);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{port}")
}

async fn submit(client: &reqwest::Client, base: &str, owner: &str, expression: &str) -> i64 {
    let response = client
        .post(format!("{base}/api/v1/calculate"))
        .header(OWNER_HEADER, owner)
        .json(&json!({ "expression": expression }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    body["id"].as_i64().unwrap()
}

async fn fetch(client: &reqwest::Client, base: &str, owner: &str, id: i64) -> reqwest::Response {
    client
        .get(format!("{base}/api/v1/expressions/{id}"))
        .header(OWNER_HEADER, owner)
        .send()
        .await
        .unwrap()
}

/// Poll until the expression reports `status`.
async fn wait_status(client: &reqwest::Client, base: &str, owner: &str, id: i64, status: &str) -> Value {
    timeout(TEST_TIMEOUT, async {
        loop {
            let body: Value = fetch(client, base, owner, id).await.json().await.unwrap();
            if body["expression"]["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("expression never reached the expected status")
}

#[tokio::test]
async fn health_endpoint() {
    let base = start_server().await;
    let body: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn http_agent_drives_submission_to_done() {
    let base = start_server().await;
    let client = reqwest::Client::new();
    let id = submit(&client, &base, "alice", "(1+2)*4").await;
    wait_status(&client, &base, "alice", id, "in_progress").await;

    let agent = Agent::new("http-agent", Arc::new(HttpTaskSource::new(base.clone())), Duration::from_millis(10));
    let body = timeout(TEST_TIMEOUT, async {
        loop {
            if let Iteration::Idle { .. } = agent.run_once().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let body: Value = fetch(&client, &base, "alice", id).await.json().await.unwrap();
            if body["expression"]["status"] == "done" {
                return body;
            }
        }
    })
    .await
    .expect("expression never finished");

    assert_eq!(body["expression"]["result"], 12.0);
    assert_eq!(body["expression"]["expression"], "(1+2)*4");

    let list: Value = client
        .get(format!("{base}/api/v1/expressions"))
        .header(OWNER_HEADER, "alice")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["expressions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn worker_rpc_round_trip() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let empty: Value = client
        .post(format!("{base}/internal/task"))
        .json(&json!({ "agent_id": "w1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(empty, json!({ "kind": "no_task", "retry_after_seconds": 3 }));

    let id = submit(&client, &base, "alice", "6/2").await;
    wait_status(&client, &base, "alice", id, "in_progress").await;

    let task: Value = client
        .post(format!("{base}/internal/task"))
        .json(&json!({ "agent_id": "w1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(task["kind"], "task");
    assert_eq!(task["operator"], "/");
    let task_id = task["id"].as_i64().unwrap();

    let missing = client
        .post(format!("{base}/internal/task/result"))
        .json(&json!({ "task_id": task_id, "agent_id": "w1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);

    let ack: Value = client
        .post(format!("{base}/internal/task/result"))
        .json(&json!({
            "task_id": task_id,
            "agent_id": "w1",
            "outcome": { "status": "result", "value": 3.0 }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ack["acknowledged"], true);

    let body = wait_status(&client, &base, "alice", id, "done").await;
    assert_eq!(body["expression"]["result"], 3.0);
}

#[tokio::test]
async fn client_api_rejections() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let anonymous = client
        .post(format!("{base}/api/v1/calculate"))
        .json(&json!({ "expression": "1+1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);

    let blank = client
        .post(format!("{base}/api/v1/calculate"))
        .header(OWNER_HEADER, "alice")
        .json(&json!({ "expression": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 422);
    let body: Value = blank.json().await.unwrap();
    assert!(body["error"].is_string());

    let id = submit(&client, &base, "alice", "1+1").await;
    assert_eq!(fetch(&client, &base, "mallory", id).await.status(), 404);
    assert_eq!(fetch(&client, &base, "alice", id + 100).await.status(), 404);
    assert_eq!(fetch(&client, &base, "alice", id).await.status(), 200);
}

#[tokio::test]
async fn malformed_submission_reports_error_status() {
    let base = start_server().await;
    let client = reqwest::Client::new();
    let id = submit(&client, &base, "alice", "(1+2").await;

    let body = wait_status(&client, &base, "alice", id, "error").await;
    assert!(body["expression"].get("result").is_none());
    let steps = body["expression"]["steps"].as_array().unwrap();
    assert!(steps[0].as_str().unwrap().starts_with("parse error"));
}
