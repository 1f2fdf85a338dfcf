//! DigitalOcean client tests against a local stand-in for the droplets API.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use botfleet::backend::{CloudClient, InstanceId, InstanceSpec, ProviderError};
use botfleet::config::{DEFAULT_API_BASE, DigitalOceanConfig};
use botfleet::digitalocean::DigitalOceanClient;
use rstest::rstest;
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
struct Recorded {
    method: &'static str,
    path: String,
    query: HashMap<String, String>,
    authorization: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct Api {
    base: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Api {
    fn record(
        &self,
        method: &'static str,
        path: String,
        query: HashMap<String, String>,
        headers: &HeaderMap,
        body: Value,
    ) {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Recorded {
                method,
                path,
                query,
                authorization,
                body,
            });
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

fn droplet(id: u64, name: &str, status: &str, tags: &Value) -> Value {
    json!({
        "id": id,
        "name": name,
        "status": status,
        "created_at": "2026-03-01T12:00:00Z",
        "networks": {
            "v4": [
                { "ip_address": "10.10.0.5", "type": "private" },
                { "ip_address": "203.0.113.20", "type": "public" }
            ]
        },
        "tags": tags
    })
}

fn not_found() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "id": "not_found",
            "message": "The resource you were accessing could not be found.",
        })),
    )
}

async fn create(
    State(api): State<Api>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.record("POST", String::from("/v2/droplets"), HashMap::new(), &headers, body.clone());
    let name = body["name"].as_str().unwrap_or_default();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "droplet": droplet(4242, name, "new", &body["tags"]) })),
    )
}

async fn list(
    State(api): State<Api>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    api.record("GET", String::from("/v2/droplets"), query.clone(), &headers, Value::Null);
    if query.get("page").map(String::as_str) == Some("2") {
        return Json(json!({
            "droplets": [droplet(2, "botfleet-5511977776666", "active", &json!(["botfleet"]))],
            "links": {}
        }));
    }
    let tag = query.get("tag_name").cloned().unwrap_or_default();
    Json(json!({
        "droplets": [droplet(1, "botfleet-5511999998888", "active", &json!([tag]))],
        "links": { "pages": { "next": format!("{}/v2/droplets?page=2&tag_name={tag}", api.base) } }
    }))
}

async fn get_one(
    State(api): State<Api>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    api.record("GET", format!("/v2/droplets/{id}"), HashMap::new(), &headers, Value::Null);
    match id.as_str() {
        "404" => Err(not_found()),
        "500" => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "id": "server_error", "message": "boom" })),
        )),
        "slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Err(not_found())
        }
        _ => Ok(Json(json!({
            "droplet": droplet(4242, "botfleet-5511999998888", "active", &json!([])),
        }))),
    }
}

async fn delete_one(
    State(api): State<Api>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> StatusCode {
    api.record("DELETE", format!("/v2/droplets/{id}"), HashMap::new(), &headers, Value::Null);
    if id == "404" { StatusCode::NOT_FOUND } else { StatusCode::NO_CONTENT }
}

async fn action(
    State(api): State<Api>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.record("POST", format!("/v2/droplets/{id}/actions"), HashMap::new(), &headers, body);
    (StatusCode::CREATED, Json(json!({ "action": { "id": 1, "status": "in-progress" } })))
}

async fn spawn_api() -> Api {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let api = Api {
        base: format!("http://{addr}"),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/v2/droplets", get(list).post(create))
        .route("/v2/droplets/{id}", get(get_one).delete(delete_one))
        .route("/v2/droplets/{id}/actions", post(action))
        .with_state(api.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            panic!("stand-in API stopped: {err}");
        }
    });
    api
}

fn client(api: &Api, timeout_secs: u64) -> DigitalOceanClient {
    DigitalOceanClient::new(DigitalOceanConfig {
        token: String::from("test-token"),
        region: String::from("nyc3"),
        size: String::from("s-1vcpu-1gb"),
        image: String::from("bot-image"),
        ssh_keys: Some(String::from("aa:bb, cc:dd")),
        name_prefix: String::from("botfleet"),
        api_base: format!("{}/", api.base),
        request_timeout_secs: timeout_secs,
    })
    .unwrap_or_else(|err| panic!("client: {err}"))
}

#[tokio::test]
async fn create_posts_the_droplet_shape_with_bearer_auth() {
    let api = spawn_api().await;
    let spec = InstanceSpec {
        name: String::from("botfleet-5511999998888"),
        tags: vec![String::from("botfleet-5511999998888"), String::from("botfleet")],
        boot_script: String::from("#!/bin/bash\necho hi\n"),
    };

    let id = client(&api, 5)
        .create(&spec)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(id, InstanceId::new("4242"));
    let requests = api.requests();
    let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
    assert_eq!(request.authorization.as_deref(), Some("Bearer test-token"));
    assert_eq!(request.body["region"], "nyc3");
    assert_eq!(request.body["size"], "s-1vcpu-1gb");
    assert_eq!(request.body["image"], "bot-image");
    assert_eq!(request.body["user_data"], "#!/bin/bash\necho hi\n");
    assert_eq!(request.body["ssh_keys"], json!(["aa:bb", "cc:dd"]));
    assert_eq!(request.body["tags"], json!(["botfleet-5511999998888", "botfleet"]));
}

#[tokio::test]
async fn get_picks_the_public_address() {
    let api = spawn_api().await;

    let instance = client(&api, 5)
        .get(&InstanceId::new("4242"))
        .await
        .unwrap_or_else(|err| panic!("get: {err}"))
        .unwrap_or_else(|| panic!("droplet should exist"));

    assert!(instance.is_active());
    let expected_ip: Ipv4Addr = "203.0.113.20"
        .parse()
        .unwrap_or_else(|err| panic!("ip: {err}"));
    assert_eq!(instance.public_ipv4, Some(expected_ip));
}

#[tokio::test]
async fn get_of_missing_droplet_is_none() {
    let api = spawn_api().await;
    let instance = client(&api, 5)
        .get(&InstanceId::new("404"))
        .await
        .unwrap_or_else(|err| panic!("get: {err}"));
    assert_eq!(instance, None);
}

#[tokio::test]
async fn api_errors_carry_status_code_and_message() {
    let api = spawn_api().await;
    let err = client(&api, 5)
        .get(&InstanceId::new("500"))
        .await
        .err()
        .unwrap_or_else(|| panic!("server error expected"));
    assert_eq!(
        err,
        ProviderError::Api {
            status: 500,
            code: String::from("server_error"),
            message: String::from("boom"),
        }
    );
}

#[tokio::test]
async fn slow_responses_time_out() {
    let api = spawn_api().await;
    let err = client(&api, 1)
        .get(&InstanceId::new("slow"))
        .await
        .err()
        .unwrap_or_else(|| panic!("request should time out"));
    assert!(matches!(err, ProviderError::Timeout { .. }), "unexpected error: {err}");
}

#[tokio::test]
async fn list_by_tag_follows_pagination() {
    let api = spawn_api().await;

    let instances = client(&api, 5)
        .list_by_tag("botfleet-5511999998888")
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));

    let names: Vec<&str> = instances.iter().map(|instance| instance.name.as_str()).collect();
    assert_eq!(names, vec!["botfleet-5511999998888", "botfleet-5511977776666"]);
    let first = api.requests();
    let query = &first.first().unwrap_or_else(|| panic!("no request recorded")).query;
    assert_eq!(query.get("tag_name").map(String::as_str), Some("botfleet-5511999998888"));
    assert_eq!(query.get("per_page").map(String::as_str), Some("200"));
}

#[tokio::test]
async fn get_by_name_filters_on_exact_name() {
    let api = spawn_api().await;
    let found = client(&api, 5)
        .get_by_name("botfleet-5511977776666")
        .await
        .unwrap_or_else(|err| panic!("get_by_name: {err}"));
    assert_eq!(found.map(|instance| instance.id), Some(InstanceId::new("2")));
}

#[rstest]
#[case("4242")]
#[case("404")]
#[tokio::test]
async fn delete_treats_missing_droplets_as_deleted(#[case] id: &str) {
    let api = spawn_api().await;
    client(&api, 5)
        .delete(&InstanceId::new(id))
        .await
        .unwrap_or_else(|err| panic!("delete: {err}"));
    let requests = api.requests();
    let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
    assert_eq!(request.method, "DELETE");
    assert_eq!(request.path, format!("/v2/droplets/{id}"));
}

#[tokio::test]
async fn reboot_posts_a_reboot_action() {
    let api = spawn_api().await;
    client(&api, 5)
        .reboot(&InstanceId::new("4242"))
        .await
        .unwrap_or_else(|err| panic!("reboot: {err}"));
    let requests = api.requests();
    let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
    assert_eq!(request.path, "/v2/droplets/4242/actions");
    assert_eq!(request.body, json!({ "type": "reboot" }));
}

#[test]
fn default_endpoint_is_the_public_api() {
    assert_eq!(DEFAULT_API_BASE, "https://api.digitalocean.com");
}
