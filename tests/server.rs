//! End-to-end tests for the HTTP action handlers.
//!
//! A real server is bound to a free port with an in-memory store, a keyword
//! embedder, and the bundled embedding similarity search, then driven with
//! `reqwest`.

use anyhow::Result;
use async_trait::async_trait;
use pollination_station::config::Config;
use pollination_station::embedding::Embedder;
use pollination_station::matching::{MatchingEngine, MatchingPolicy};
use pollination_station::rationale::{RationaleGenerator, RationaleRequest};
use pollination_station::server::run_server_with_service;
use pollination_station::service::PollinationService;
use pollination_station::similarity::EmbeddingSimilaritySearch;
use pollination_station::store::memory::InMemoryStore;
use pollination_station::store::Store;
use serde_json::{json, Value};
use std::sync::Arc;

// ─── Fakes ──────────────────────────────────────────────────────────

/// One axis per topic keyword, plus a small constant so no vector is zero.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keywords"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_lowercase();
        let axis = |word: &str| if text.contains(word) { 1.0 } else { 0.0 };
        Ok(vec![axis("grant"), axis("audit"), 0.05])
    }
}

struct TemplateRationale;

#[async_trait]
impl RationaleGenerator for TemplateRationale {
    async fn generate(&self, request: &RationaleRequest) -> Result<String> {
        Ok(format!(
            "{} writes grants; {} needs one.",
            request.candidate_name, request.requesting_name
        ))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn start_server() -> String {
    let port = find_free_port();
    let config: Config = toml::from_str(&format!(
        r#"
[db]
path = "unused.sqlite"

[server]
bind = "127.0.0.1:{}"
"#,
        port
    ))
    .unwrap();

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let engine = MatchingEngine::new(
        store.clone(),
        Arc::new(EmbeddingSimilaritySearch::new(store.clone())),
        Arc::new(TemplateRationale),
        MatchingPolicy::default(),
    );
    let service = Arc::new(PollinationService::new(
        store,
        Arc::new(KeywordEmbedder),
        engine,
    ));

    tokio::spawn(async move {
        run_server_with_service(&config, service).await.unwrap();
    });
    wait_for_server(port).await;
    format!("http://127.0.0.1:{}", port)
}

async fn post(client: &reqwest::Client, url: &str, body: Value) -> (u16, Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn create_dao(client: &reqwest::Client, base: &str, name: &str, description: &str) -> i64 {
    let (status, body) = post(
        client,
        &format!("{}/dao-manager", base),
        json!({
            "action": "create",
            "data": {
                "name": name,
                "description": description,
                "publicAddress": format!("0x{}", name.to_lowercase()),
            }
        }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    body["data"]["id"].as_i64().unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health() {
    let base = start_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_envelope_errors() {
    let base = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/dao-manager", base);

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to parse JSON"));

    let (status, body) = post(&client, &url, json!({ "data": {} })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Missing action");

    let (status, body) = post(&client, &url, json!({ "action": "delete" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid action");

    let (status, body) = post(
        &client,
        &format!("{}/need-manager", base),
        json!({ "action": "fulfill" }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "id is required");

    let (status, _) = post(
        &client,
        &url,
        json!({ "action": "create", "data": { "name": "NoAddressDAO" } }),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_dao_lifecycle() {
    let base = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/dao-manager", base);

    let id = create_dao(&client, &base, "ClimateDAO", "climate action").await;

    let (status, body) = post(
        &client,
        &url,
        json!({ "action": "get", "publicAddress": "0xclimatedao" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["id"], id);
    assert!(body["data"].get("description_embedding").is_none());

    let (status, _) = post(
        &client,
        &url,
        json!({ "action": "get", "publicAddress": "0xmissing" }),
    )
    .await;
    assert_eq!(status, 404);

    // Duplicate public address.
    let (status, _) = post(
        &client,
        &url,
        json!({
            "action": "create",
            "data": { "name": "Copy", "description": "x", "public_address": "0xclimatedao" }
        }),
    )
    .await;
    assert_eq!(status, 400);

    let (status, body) = post(
        &client,
        &url,
        json!({ "action": "update", "id": id, "data": { "description": "climate grant funding" } }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["description"], "climate grant funding");
    assert_eq!(body["data"]["matching"]["dao_id"], id);
}

#[tokio::test]
async fn test_need_creation_produces_pollen() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let climate = create_dao(&client, &base, "ClimateDAO", "climate action").await;
    let grant_guild = create_dao(&client, &base, "GrantGuildDAO", "we write grant proposals").await;
    create_dao(&client, &base, "AuditDAO", "smart contract audit").await;

    let (status, body) = post(
        &client,
        &format!("{}/need-manager", base),
        json!({
            "action": "create",
            "data": { "daoId": climate, "description": "seeking grant-writing help" }
        }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    let need_id = body["data"]["id"].as_i64().unwrap();
    let pollen = body["data"]["matching"]["pollen"].as_array().unwrap();
    assert_eq!(pollen.len(), 1);
    assert_eq!(pollen[0]["fulfilling_dao_id"], grant_guild);
    assert_eq!(pollen[0]["requesting_dao_id"], climate);
    assert_eq!(pollen[0]["fulfilling_dao"]["name"], "GrantGuildDAO");
    assert_eq!(
        pollen[0]["collaboration_description"],
        "GrantGuildDAO writes grants; ClimateDAO needs one."
    );

    let found: Value = client
        .get(format!("{}/pollen-query?dao_id={}", base, grant_guild))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(found["data"].as_array().unwrap().len(), 1);
    assert_eq!(found["data"][0]["need"]["id"], need_id);

    // A blank filter is ignored rather than rejected.
    let resp = client
        .get(format!(
            "{}/pollen-query?dao_id=&need_id={}&min_confidence=",
            base, need_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let found: Value = resp.json().await.unwrap();
    assert_eq!(found["data"].as_array().unwrap().len(), 1);
    assert_eq!(found["data"][0]["fulfilling_dao_id"], grant_guild);

    let resp = client
        .get(format!("{}/pollen-query?dao_id=abc", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (status, body) = post(
        &client,
        &format!("{}/need-manager", base),
        json!({ "action": "fulfill", "id": need_id }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["is_fulfilled"], true);
    assert!(!body["data"]["fulfilled_at"].is_null());

    let (status, body) = post(
        &client,
        &format!("{}/need-manager", base),
        json!({ "action": "updateContractId", "id": need_id, "data": { "contract_need_id": 7 } }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["contract_need_id"], "7");

    let (status, _) = post(
        &client,
        &format!("{}/need-manager", base),
        json!({ "action": "updateContractId", "id": need_id, "data": {} }),
    )
    .await;
    assert_eq!(status, 400);

    let (status, _) = post(
        &client,
        &format!("{}/need-manager", base),
        json!({ "action": "create", "data": { "daoId": 999, "description": "x" } }),
    )
    .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_pollen_refresh_endpoint() {
    let base = start_server().await;
    let client = reqwest::Client::new();
    let url = format!("{}/pollen-refresh", base);

    let climate = create_dao(&client, &base, "ClimateDAO", "climate action").await;
    create_dao(&client, &base, "GrantGuildDAO", "grant proposals").await;
    post(
        &client,
        &format!("{}/need-manager", base),
        json!({
            "action": "create",
            "data": { "daoId": climate, "description": "grant writing" }
        }),
    )
    .await;

    let (status, body) = post(&client, &url, json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "exactly one of needId or daoId is required");

    let (status, body) = post(&client, &url, json!({ "daoId": climate })).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["refreshed"].as_array().unwrap().len(), 1);
    assert_eq!(
        body["data"]["refreshed"][0]["pollen"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    let (status, _) = post(&client, &url, json!({ "needId": 12345 })).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_cors_preflight() {
    let base = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .request(reqwest::Method::OPTIONS, format!("{}/need-manager", base))
        .header("origin", "https://app.example.org")
        .header("access-control-request-method", "POST")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "*"
    );
}
