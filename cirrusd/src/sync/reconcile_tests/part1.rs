use super::*;

// 2024-06-01T10:00:00Z
const T: i64 = 1_717_236_000;

#[tokio::test]
async fn remote_only_tree_is_downloaded_then_a_second_pass_is_idle() {
    let server = MockServer::start().await;
    mock_listing(
        &server,
        None,
        serde_json::json!([
            { "id": 10, "name": "Docs", "type": "folder", "workspace_id": WS }
        ]),
    )
    .await;
    mock_listing(
        &server,
        Some(10),
        serde_json::json!([
            {
                "id": 11,
                "name": "a.txt",
                "type": "file",
                "parent_id": 10,
                "size": 5,
                "hash": "h-11",
                "updated_at": "2024-06-01T10:00:00Z",
                "workspace_id": WS
            }
        ]),
    )
    .await;
    mock_download(&server, "h-11", b"hello").await;

    let rig = rig(&server).await;
    let ctx = WorkspaceContext::fixed(WS);

    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();
    assert_eq!(summary.downloads, 1);
    assert_eq!(summary.uploads, 0);

    let local = rig.root.path().join("Docs/a.txt");
    assert_eq!(std::fs::read(&local).unwrap(), b"hello");

    let folder = rig.store.get_by_id(10).await.unwrap().unwrap();
    assert_eq!(folder.kind, RecordKind::Folder);
    let file = rig.store.get_by_id(11).await.unwrap().unwrap();
    assert_eq!(file.size, Some(5));
    assert_eq!(file.local_path, local.to_string_lossy());
    assert!(rig.echo.is_recent(&local));

    // An immediately repeated pass moves no bytes in either direction.
    let second = rig.reconciler.run_pass(&ctx).await.unwrap();
    assert_eq!(second, PassSummary::default());
    assert_eq!(requests_hitting(&server, "/get/").await, 1);
    assert_eq!(requests_hitting(&server, "upload-link").await, 0);
}

#[tokio::test]
async fn local_folder_is_created_remotely_before_its_file_uploads() {
    let server = MockServer::start().await;
    mock_listing(&server, None, serde_json::json!([])).await;
    mock_listing(&server, Some(40), serde_json::json!([])).await;
    mock_space(&server).await;
    Mock::given(method("POST"))
        .and(path("/v2/folders"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": 40,
            "name": "Meeting",
            "type": "folder",
            "workspace_id": WS
        })))
        .mount(&server)
        .await;
    mock_upload(
        &server,
        "notes.md",
        serde_json::json!({
            "id": 41,
            "name": "notes.md",
            "type": "file",
            "parent_id": 40,
            "size": 12,
            "updated_at": "2024-06-01T10:00:00Z",
            "workspace_id": WS
        }),
    )
    .await;

    let rig = rig(&server).await;
    let meeting = rig.root.path().join("Meeting");
    std::fs::create_dir_all(&meeting).unwrap();
    std::fs::write(meeting.join("notes.md"), b"twelve bytes").unwrap();

    let ctx = WorkspaceContext::fixed(WS);
    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();
    assert_eq!(summary.folders_created, 1);
    assert_eq!(summary.uploads, 1);

    // The folder create precedes the upload-link request.
    let requests = server.received_requests().await.unwrap();
    let folder_pos = requests
        .iter()
        .position(|r| r.url.path() == "/v2/folders")
        .unwrap();
    let upload_pos = requests
        .iter()
        .position(|r| r.url.path().contains("upload-link"))
        .unwrap();
    assert!(folder_pos < upload_pos);

    // The upload carried the freshly created folder as its parent.
    let upload_request = &requests[upload_pos];
    assert!(
        upload_request
            .url
            .query_pairs()
            .any(|(k, v)| k == "parent_id" && v == "40")
    );

    let record = rig.store.get_by_id(41).await.unwrap().unwrap();
    assert_eq!(record.parent_id, Some(40));
}

#[tokio::test]
async fn files_with_matching_path_and_size_are_recorded_without_transfers() {
    let server = MockServer::start().await;
    mock_listing(
        &server,
        None,
        serde_json::json!([
            {
                "id": 12,
                "name": "readme.md",
                "type": "file",
                "size": 6,
                "hash": "h-12",
                "updated_at": "2024-06-01T10:00:00Z",
                "workspace_id": WS
            }
        ]),
    )
    .await;

    let rig = rig(&server).await;
    let local = rig.root.path().join("readme.md");
    std::fs::write(&local, b"mirror").unwrap();
    set_file_mtime(&local, T).unwrap();

    let ctx = WorkspaceContext::fixed(WS);
    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();

    assert_eq!(summary, PassSummary::default());
    let record = rig.store.get_by_id(12).await.unwrap().unwrap();
    assert_eq!(record.local_path, local.to_string_lossy());
    assert_eq!(requests_hitting(&server, "/get/").await, 0);
    assert_eq!(requests_hitting(&server, "upload-link").await, 0);
}

#[tokio::test]
async fn unresolved_parents_defer_and_nothing_lands_at_root() {
    let server = MockServer::start().await;
    mock_listing(&server, None, serde_json::json!([])).await;
    // Folder creation is refused; the subtree must stay deferred.
    Mock::given(method("POST"))
        .and(path("/v2/folders"))
        .respond_with(ResponseTemplate::new(500).set_body_string("backend down"))
        .mount(&server)
        .await;

    let rig = rig(&server).await;
    let ghost = rig.root.path().join("Ghost");
    std::fs::create_dir_all(&ghost).unwrap();
    std::fs::write(ghost.join("file.txt"), b"orphan").unwrap();

    let ctx = WorkspaceContext::fixed(WS);
    let summary = rig.reconciler.run_pass(&ctx).await.unwrap();

    assert_eq!(summary.uploads, 0);
    assert_eq!(summary.deferred, 2);
    assert!(rig.store.get_all(WS).await.unwrap().is_empty());
    // No upload was issued, at root or anywhere else.
    assert_eq!(requests_hitting(&server, "upload-link").await, 0);
    assert_eq!(requests_hitting(&server, "/put/").await, 0);
}

#[tokio::test]
async fn pass_completion_is_published_on_the_event_bus() {
    let server = MockServer::start().await;
    mock_listing(&server, None, serde_json::json!([])).await;

    let rig = rig(&server).await;
    let mut rx = rig.events.subscribe();
    let ctx = WorkspaceContext::fixed(WS);
    rig.reconciler.run_pass(&ctx).await.unwrap();

    let mut saw_completion = false;
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::PassCompleted {
            uploads,
            downloads,
            folders_created,
            deferred,
        } = event
        {
            assert_eq!((uploads, downloads, folders_created, deferred), (0, 0, 0, 0));
            saw_completion = true;
        }
    }
    assert!(saw_completion);
}
