use cirrus_core::{ApiErrorClass, AuthMode, CirrusClient, CirrusError, EntryKind};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn session_client(server: &MockServer) -> CirrusClient {
    let auth = AuthMode::session_from_cookies("cirrus_session=s-1; cirrus_csrf=c-1").unwrap();
    CirrusClient::with_base_url(&server.uri(), auth).unwrap()
}

#[tokio::test]
async fn list_root_sends_session_cookie_and_csrf_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/entries"))
        .and(query_param("workspace_id", "7"))
        .and(header("cookie", "cirrus_session=s-1; cirrus_csrf=c-1"))
        .and(header("x-csrf-token", "c-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {
                    "id": 10,
                    "name": "Docs",
                    "type": "folder",
                    "workspace_id": 7
                }
            ],
            "limit": 200,
            "offset": 0,
            "total": 1
        })))
        .mount(&server)
        .await;

    let entries = session_client(&server).list_root(7).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "Docs");
    assert_eq!(entries[0].kind, EntryKind::Folder);
    assert_eq!(entries[0].parent_id, None);
}

#[tokio::test]
async fn bearer_fallback_sends_authorization_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/space"))
        .and(query_param("workspace_id", "7"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "used": 2048,
            "available": 4096
        })))
        .mount(&server)
        .await;

    let client =
        CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("tok-1")).unwrap();
    let usage = client.space_usage(7).await.unwrap();

    assert_eq!(usage.used, 2048);
    assert_eq!(usage.available, 4096);
}

#[tokio::test]
async fn list_folder_follows_pagination_until_total() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/entries"))
        .and(query_param("parent_id", "10"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": 11, "name": "a.txt", "type": "file", "parent_id": 10, "size": 1, "workspace_id": 7 }
            ],
            "limit": 200,
            "offset": 0,
            "total": 2
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/entries"))
        .and(query_param("parent_id", "10"))
        .and(query_param("offset", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": 12, "name": "b.txt", "type": "file", "parent_id": 10, "size": 2, "workspace_id": 7 }
            ],
            "limit": 200,
            "offset": 1,
            "total": 2
        })))
        .mount(&server)
        .await;

    let entries = session_client(&server).list_folder(7, 10).await.unwrap();

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "a.txt");
    assert_eq!(entries[1].name, "b.txt");
}

#[tokio::test]
async fn create_folder_posts_json_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/folders"))
        .and(body_json(json!({
            "workspace_id": 7,
            "name": "Meeting",
            "parent_id": 10
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 20,
            "name": "Meeting",
            "type": "folder",
            "parent_id": 10,
            "workspace_id": 7
        })))
        .mount(&server)
        .await;

    let entry = session_client(&server)
        .create_folder(7, "Meeting", Some(10))
        .await
        .unwrap();

    assert_eq!(entry.id, 20);
    assert_eq!(entry.kind, EntryKind::Folder);
}

#[tokio::test]
async fn create_folder_adopts_existing_entry_on_conflict() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/folders"))
        .respond_with(ResponseTemplate::new(409).set_body_string("folder already exists"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/entries"))
        .and(query_param("workspace_id", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "id": 21, "name": "meeting", "type": "folder", "workspace_id": 7 }
            ],
            "limit": 200,
            "offset": 0,
            "total": 1
        })))
        .mount(&server)
        .await;

    let entry = session_client(&server)
        .create_folder(7, "Meeting", None)
        .await
        .unwrap();

    assert_eq!(entry.id, 21);
}

#[tokio::test]
async fn rename_returns_false_on_missing_entry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/entries/99/rename"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let renamed = session_client(&server).rename(7, 99, "new.txt").await.unwrap();
    assert!(!renamed);
}

#[tokio::test]
async fn rename_acknowledges_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/entries/11/rename"))
        .and(body_json(json!({ "workspace_id": 7, "name": "b.txt" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    assert!(session_client(&server).rename(7, 11, "b.txt").await.unwrap());
}

#[tokio::test]
async fn delete_treats_no_content_as_success() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v2/entries/11"))
        .and(query_param("workspace_id", "7"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    assert!(session_client(&server).delete(7, 11).await.unwrap());
}

#[tokio::test]
async fn download_link_prefers_content_hash_addressing() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/files/download-link"))
        .and(query_param("hash", "h-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "href": "https://files.example/h-abc",
            "method": "GET"
        })))
        .mount(&server)
        .await;

    let entry = cirrus_core::RemoteEntry {
        id: 11,
        name: "a.txt".into(),
        kind: EntryKind::File,
        parent_id: Some(10),
        size: Some(5),
        hash: Some("h-abc".into()),
        updated_at: None,
        workspace_id: 7,
    };
    let link = session_client(&server).download_link(7, &entry).await.unwrap();

    assert_eq!(link.href.as_str(), "https://files.example/h-abc");
    assert_eq!(link.method, "GET");
}

#[tokio::test]
async fn auth_failures_classify_as_auth() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/space"))
        .respond_with(ResponseTemplate::new(401).set_body_string("session expired"))
        .mount(&server)
        .await;

    let err = session_client(&server).space_usage(7).await.unwrap_err();
    assert_eq!(err.classification(), Some(ApiErrorClass::Auth));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_classify_as_transient() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/space"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = session_client(&server).space_usage(7).await.unwrap_err();
    assert_eq!(err.classification(), Some(ApiErrorClass::Transient));
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        CirrusError::Api { status, .. } if status.as_u16() == 502
    ));
}
