use std::sync::Arc;

use serde_json::{json, Value};

use evidence_harness::embedding::DisabledEmbedder;
use evidence_harness::engine::{Engine, EngineOptions};
use evidence_harness::index::{HybridIndex, IndexParams};
use evidence_harness::server;

async fn spawn_server() -> String {
    let engine = Arc::new(Engine::new(
        HybridIndex::new(IndexParams::default()),
        Arc::new(DisabledEmbedder),
        EngineOptions::default(),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server::serve(listener, engine).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn post(client: &reqwest::Client, url: String, body: Value) -> (u16, Value) {
    let resp = client.post(url).json(&body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

fn contract(text: &str) -> Value {
    json!([
        {"type": "text", "content": text},
        {"type": "image", "content": "ignored.png"},
        {"type": "table", "content": [["Item", "Days"], ["Steel", "10"]]}
    ])
}

#[tokio::test]
async fn test_health() {
    let base = spawn_server().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["documents"], 0);
}

#[tokio::test]
async fn test_document_lifecycle() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let (status, body) = post(
        &client,
        format!("{}/documents", base),
        json!({"source": "supply", "blocks": contract("Delivery is due within ten days.")}),
    )
    .await;
    assert_eq!(status, 201);
    assert_eq!(body["source"], "supply");
    assert_eq!(body["chunks"], 1);

    let (status, body) = post(
        &client,
        format!("{}/documents", base),
        json!({"source": "supply", "blocks": contract("Again.")}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "duplicate_document");

    let resp = client
        .put(format!("{}/documents/supply", base))
        .json(&json!({"blocks": contract("Delivery is due within thirty days.")}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["replaced"], 1);

    let list: Value = client
        .get(format!("{}/documents", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["documents"][0]["source"], "supply");

    let resp = client
        .delete(format!("{}/documents/supply", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .delete(format!("{}/documents/supply", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_replace_unknown_is_404() {
    let base = spawn_server().await;
    let resp = reqwest::Client::new()
        .put(format!("{}/documents/ghost", base))
        .json(&json!({"blocks": contract("text")}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_empty_document_is_bad_request() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();
    let (status, body) = post(
        &client,
        format!("{}/documents", base),
        json!({"source": "blank", "blocks": [{"type": "image", "content": "scan.png"}]}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let list: Value = client
        .get(format!("{}/documents", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["documents"], json!([]));
}

#[tokio::test]
async fn test_search_and_answer() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();
    for (source, text) in [
        ("supply", "Late delivery penalty is one percent per day."),
        ("weather", "Sunny weather is expected tomorrow."),
    ] {
        let (status, _) = post(
            &client,
            format!("{}/documents", base),
            json!({"source": source, "blocks": [{"type": "text", "content": text}]}),
        )
        .await;
        assert_eq!(status, 201);
    }

    let (status, body) = post(
        &client,
        format!("{}/search", base),
        json!({"query": "delivery penalty", "k": 1, "mode": "lexical"}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"][0]["chunk"]["source"], "supply");

    let (status, body) = post(&client, format!("{}/search", base), json!({"query": "  "})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = post(
        &client,
        format!("{}/search", base),
        json!({"query": "penalty", "alpha": 1.5}),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["error"]["message"].as_str().unwrap().contains("alpha"));

    let (status, body) = post(
        &client,
        format!("{}/chat/answer", base),
        json!({"chat": [{"role": "user", "content": "late delivery penalty"}]}),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body["answer"].is_null());
    assert!(body["files_used"]
        .as_array()
        .unwrap()
        .contains(&json!("supply")));
    assert!(body["groups"].is_array());

    let (status, _) = post(&client, format!("{}/chat/answer", base), json!({"chat": []})).await;
    assert_eq!(status, 400);
}
