use super::*;

use cirrus_core::AuthMode;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::sync::pipeline::PipelineConfig;
use crate::sync::store::RecordKind;
use crate::sync::watcher::default_excluded_dirs;

const WS: i64 = 7;

struct Rig {
    reconciler: Reconciler,
    store: Arc<MetadataStore>,
    echo: Arc<EchoSuppressor>,
    events: Arc<EventBus>,
    root: TempDir,
}

async fn rig(server: &MockServer) -> Rig {
    let root = tempfile::tempdir().unwrap();
    let client = CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("t")).unwrap();
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = Arc::new({
        let store = MetadataStore::from_pool(pool);
        store.init().await.unwrap();
        store
    });
    let events = Arc::new(EventBus::new());
    let echo = Arc::new(EchoSuppressor::new(std::time::Duration::from_secs(3600)));
    let pipeline = Arc::new(TransferPipeline::new(
        client.clone(),
        Arc::clone(&events),
        PipelineConfig::default(),
        CancellationToken::new(),
    ));
    let reconciler = Reconciler::new(
        client,
        Arc::clone(&store),
        pipeline,
        Arc::clone(&echo),
        Arc::clone(&events),
        default_excluded_dirs(),
        root.path().to_path_buf(),
    );
    Rig {
        reconciler,
        store,
        echo,
        events,
        root,
    }
}

async fn mock_listing(server: &MockServer, parent_id: Option<i64>, items: serde_json::Value) {
    let given = Mock::given(method("GET")).and(path("/v2/entries"));
    let given = match parent_id {
        Some(id) => given.and(query_param("parent_id", id.to_string())),
        None => given.and(query_param_is_missing("parent_id")),
    };
    let total = items.as_array().map(|a| a.len()).unwrap_or(0);
    given
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": items,
            "limit": 200,
            "offset": 0,
            "total": total
        })))
        .mount(server)
        .await;
}

async fn mock_space(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v2/space"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "used": 0,
            "available": 10_000_000
        })))
        .mount(server)
        .await;
}

async fn mock_download(server: &MockServer, hash: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path("/v2/files/download-link"))
        .and(query_param("hash", hash))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "href": format!("{}/get/{hash}", server.uri()),
            "method": "GET"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/get/{hash}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

async fn mock_upload(server: &MockServer, name: &str, response: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/v2/files/upload-link"))
        .and(query_param("name", name))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "href": format!("{}/put/{name}", server.uri()),
            "method": "PUT"
        })))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/put/{name}")))
        .respond_with(ResponseTemplate::new(201).set_body_json(response))
        .mount(server)
        .await;
}

async fn requests_hitting(server: &MockServer, fragment: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path().contains(fragment))
        .count()
}

mod part1;
mod part2;
