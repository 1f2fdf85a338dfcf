//! Endpoint tests driving the router in-process with `tower::ServiceExt`.

#[path = "common/harness.rs"]
mod harness;

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use botfleet::backend::ProviderError;
use botfleet::http::router;
use botfleet::orchestrator::WorkflowSettings;
use botfleet::registry::{InstanceRecord, InstanceRegistry};
use botfleet::supervisor::ConflictPolicy;
use botfleet::test_support::{FakeArtifactProbe, active_instance};
use chrono::Utc;
use harness::{Harness, IDENTIFIER, identifier, instant_settings};
use http_body_util::BodyExt;
use rstest::rstest;
use serde_json::{Value, json};
use tower::ServiceExt;

fn parked_harness() -> Harness {
    Harness::with_settings(
        FakeArtifactProbe::ready(),
        WorkflowSettings {
            boot_settle: Duration::from_secs(3600),
            ..instant_settings()
        },
    )
}

fn app(harness: &Harness) -> Router {
    router(harness.supervisor(ConflictPolicy::Reject))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .unwrap_or_else(|err| panic!("request failed: {err}"));
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .unwrap_or_else(|err| panic!("body: {err}"))
        .to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .unwrap_or_else(|err| panic!("request: {err}"))
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|err| panic!("request: {err}"))
}

fn create_body() -> Value {
    json!({
        "identifier": "+55 11 99999-8888",
        "companyName": "Acme",
        "address": "1 Main St",
        "features": { "appointments": true, "catalog": false, "humanHandoff": true }
    })
}

#[tokio::test]
async fn health_answers_ok() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    let (status, body) = send(&app(&harness), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn status_of_unknown_identifier_is_not_started() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    let (status, body) = send(&app(&harness), get(&format!("/instance/status/{IDENTIFIER}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "not_started", "progress": 0 }));
}

#[tokio::test]
async fn status_of_invalid_identifier_fails_in_band() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    let (status, body) = send(&app(&harness), get("/instance/status/not-a-phone")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn create_then_conflict_then_delete() {
    let harness = parked_harness();
    let app = app(&harness);

    let (status, body) = send(&app, json_request("POST", "/instance/create", &create_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (status, body) = send(&app, json_request("POST", "/instance/create", &create_body())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, body) = send(
        &app,
        json_request("DELETE", "/instance/delete", &json!({ "identifier": IDENTIFIER })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "success": true }));

    let (_, body) = send(&app, get(&format!("/instance/status/{IDENTIFIER}"))).await;
    assert_eq!(body, json!({ "status": "creating", "progress": 0 }));
}

#[rstest]
#[case(json!({ "identifier": "123", "companyName": "Acme" }))]
#[case(json!({ "identifier": IDENTIFIER, "companyName": "  " }))]
#[case(json!({ "identifier": IDENTIFIER }))]
#[tokio::test]
async fn invalid_create_requests_are_rejected(#[case] body: Value) {
    let harness = Harness::new(FakeArtifactProbe::ready());
    let (status, response) =
        send(&app(&harness), json_request("POST", "/instance/create", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["success"], false);
    assert!(response["error"].is_string());
}

#[tokio::test]
async fn create_for_provisioned_identifier_returns_the_record() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness
        .registry
        .put(&InstanceRecord {
            identifier: identifier(),
            ip: String::from("198.51.100.7"),
            instance_id: String::from("55"),
            name: String::from("botfleet-5511999998888"),
            recorded_at: Utc::now(),
        })
        .unwrap_or_else(|err| panic!("put: {err}"));

    let (status, body) = send(
        &app(&harness),
        json_request("POST", "/instance/create", &create_body()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["instanceInfo"]["ip"], "198.51.100.7");
    assert!(harness.cloud.calls().is_empty());
}

#[tokio::test]
async fn delete_reports_provider_failures_as_bad_gateway() {
    let harness = Harness::new(FakeArtifactProbe::ready());
    harness.cloud.seed(active_instance(
        "55",
        "botfleet-5511999998888",
        &["botfleet", "botfleet-5511999998888"],
        Utc::now(),
    ));
    harness.cloud.fail_deletes(ProviderError::Api {
        status: 503,
        code: String::from("service_unavailable"),
        message: String::from("maintenance"),
    });

    let (status, body) = send(
        &app(&harness),
        json_request("DELETE", "/instance/delete", &json!({ "identifier": IDENTIFIER })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);
}
