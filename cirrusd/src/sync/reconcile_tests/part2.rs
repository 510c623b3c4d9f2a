use std::sync::atomic::Ordering;
use std::time::Duration;

use super::*;
use crate::sync::debounce::Debouncer;
use crate::sync::watcher::{WatchFilters, WatcherEvent};

// 2024-06-01T10:00:00Z
const T: i64 = 1_717_236_000;

#[tokio::test]
async fn remote_newer_copy_replaces_local_and_inoculates_the_watcher() {
    let server = MockServer::start().await;
    mock_listing(
        &server,
        None,
        serde_json::json!([
            {
                "id": 50,
                "name": "x.bin",
                "type": "file",
                "size": 120,
                "hash": "h-50",
                "updated_at": "2024-06-01T10:00:10Z",
                "workspace_id": WS
            }
        ]),
    )
    .await;
    mock_download(&server, "h-50", &[7u8; 120]).await;

    let rig = rig(&server).await;
    let local = rig.root.path().join("x.bin");
    std::fs::write(&local, vec![1u8; 100]).unwrap();
    set_file_mtime(&local, T).unwrap();

    let ctx = WorkspaceContext::fixed(WS);
    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();

    assert_eq!(summary.downloads, 1);
    assert_eq!(summary.uploads, 0);
    assert_eq!(std::fs::read(&local).unwrap(), vec![7u8; 120]);
    assert!(rig.echo.is_recent(&local));

    // The flurry of events caused by our own write is filtered out.
    let filters = WatchFilters {
        excluded_dirs: default_excluded_dirs(),
        debouncer: Debouncer::new(Duration::ZERO),
        echo: Arc::clone(&rig.echo),
        started_at: std::time::SystemTime::now() - Duration::from_secs(3600),
        start_grace: Duration::from_secs(10),
    };
    assert!(!filters.allows(rig.root.path(), &WatcherEvent::Modified(local)));
}

#[tokio::test]
async fn workspace_switch_aborts_the_pass_before_any_mutation() {
    let server = MockServer::start().await;
    let ctx = WorkspaceContext::fixed(1);
    let current = ctx.current_handle();

    // The switch lands while the snapshot listing is being served.
    Mock::given(method("GET"))
        .and(path("/v2/entries"))
        .respond_with(move |_: &wiremock::Request| {
            current.store(2, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [],
                "limit": 200,
                "offset": 0,
                "total": 0
            }))
        })
        .mount(&server)
        .await;

    let rig = rig(&server).await;
    std::fs::write(rig.root.path().join("doc.txt"), b"pending upload").unwrap();

    let err = rig.reconciler.run_pass(&ctx).await.unwrap_err();
    assert!(matches!(err, ReconcileError::WorkspaceChanged));

    // No uploads were issued against the stale workspace and the store is
    // untouched.
    assert_eq!(requests_hitting(&server, "upload-link").await, 0);
    assert_eq!(requests_hitting(&server, "/put/").await, 0);
    assert!(rig.store.get_all(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn local_deletion_is_never_propagated_and_content_comes_back() {
    let server = MockServer::start().await;
    mock_listing(
        &server,
        None,
        serde_json::json!([
            { "id": 60, "name": "A", "type": "folder", "workspace_id": WS }
        ]),
    )
    .await;
    mock_listing(
        &server,
        Some(60),
        serde_json::json!([
            { "id": 61, "name": "B", "type": "folder", "parent_id": 60, "workspace_id": WS }
        ]),
    )
    .await;
    mock_listing(
        &server,
        Some(61),
        serde_json::json!([
            {
                "id": 62,
                "name": "file.txt",
                "type": "file",
                "parent_id": 61,
                "size": 4,
                "hash": "h-62",
                "updated_at": "2024-06-01T10:00:00Z",
                "workspace_id": WS
            }
        ]),
    )
    .await;
    mock_download(&server, "h-62", b"deep").await;

    let rig = rig(&server).await;
    let ctx = WorkspaceContext::fixed(WS);

    rig.reconciler.run_pass(&ctx).await.unwrap();
    let local = rig.root.path().join("A/B/file.txt");
    assert_eq!(std::fs::read(&local).unwrap(), b"deep");

    // The user deletes the whole subtree locally.
    std::fs::remove_dir_all(rig.root.path().join("A")).unwrap();

    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();
    assert_eq!(summary.downloads, 1);

    // Absence is ambiguous; nothing was deleted remotely, and the file is
    // back on disk.
    let deletes = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "DELETE")
        .count();
    assert_eq!(deletes, 0);
    assert_eq!(std::fs::read(&local).unwrap(), b"deep");
}

#[tokio::test]
async fn local_newer_file_is_uploaded_in_the_second_walk() {
    let server = MockServer::start().await;
    // The snapshot sees the stale entry; once it is deleted, later listings
    // (the upload duplicate check) see an empty root.
    Mock::given(method("GET"))
        .and(path("/v2/entries"))
        .and(query_param_is_missing("parent_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "items": [
                {
                    "id": 70,
                    "name": "draft.md",
                    "type": "file",
                    "size": 8,
                    "hash": "h-70",
                    "updated_at": "2024-06-01T10:00:00Z",
                    "workspace_id": WS
                }
            ],
            "limit": 200,
            "offset": 0,
            "total": 1
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mock_listing(&server, None, serde_json::json!([])).await;
    mock_space(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/v2/entries/70"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    mock_upload(
        &server,
        "draft.md",
        serde_json::json!({
            "id": 71,
            "name": "draft.md",
            "type": "file",
            "size": 8,
            "updated_at": "2024-06-01T11:00:00Z",
            "workspace_id": WS
        }),
    )
    .await;

    let rig = rig(&server).await;
    let local = rig.root.path().join("draft.md");
    std::fs::write(&local, b"newer v2").unwrap();
    // Same size as the remote copy, but edited well past the remote stamp.
    set_file_mtime(&local, T + 600).unwrap();

    let ctx = WorkspaceContext::fixed(WS);
    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();

    assert_eq!(summary.uploads, 1);
    assert_eq!(summary.downloads, 0);
    // The stale remote entry was replaced, not duplicated.
    assert!(rig.store.get_by_id(70).await.unwrap().is_none());
    assert_eq!(rig.store.get_by_id(71).await.unwrap().unwrap().size, Some(8));
    assert!(rig.echo.is_recent(&local));
}

#[tokio::test]
async fn uploaded_content_round_trips_byte_identical() {
    let server = MockServer::start().await;
    let body = b"round trip payload";
    mock_listing(&server, None, serde_json::json!([])).await;
    mock_space(&server).await;
    mock_upload(
        &server,
        "r.txt",
        serde_json::json!({
            "id": 80,
            "name": "r.txt",
            "type": "file",
            "size": body.len(),
            "hash": "h-80",
            "updated_at": "2024-06-01T10:00:00Z",
            "workspace_id": WS
        }),
    )
    .await;
    mock_download(&server, "h-80", body).await;

    let rig = rig(&server).await;
    let local = rig.root.path().join("r.txt");
    std::fs::write(&local, body).unwrap();

    let ctx = WorkspaceContext::fixed(WS);
    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();
    assert_eq!(summary.uploads, 1);

    // Fetch through the recorded entry and compare bytes and placement.
    let record = rig.store.get_by_id(80).await.unwrap().unwrap();
    assert_eq!(record.local_path, local.to_string_lossy());
    let entry = RemoteEntry {
        id: record.id,
        name: record.name.clone(),
        kind: EntryKind::File,
        parent_id: record.parent_id,
        size: record.size.map(|v| v as u64),
        hash: record.hash.clone(),
        updated_at: Some("2024-06-01T10:00:00Z".into()),
        workspace_id: WS,
    };
    let elsewhere = tempfile::tempdir().unwrap();
    let pipeline = TransferPipeline::new(
        CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("t")).unwrap(),
        Arc::new(EventBus::new()),
        PipelineConfig::default(),
        CancellationToken::new(),
    );
    let written = pipeline.download(WS, &entry, elsewhere.path()).await.unwrap();
    assert_eq!(std::fs::read(&written).unwrap(), body.as_slice());
    assert_eq!(written.file_name().unwrap().to_string_lossy(), "r.txt");
}
