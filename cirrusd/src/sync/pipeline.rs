use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cirrus_core::{CirrusClient, CirrusError, EntryKind, RemoteEntry, SpaceUsage};
use futures_util::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::paths::sanitize_file_name;
use crate::events::{EventBus, SyncEvent};

const MAX_TRANSFER_ATTEMPTS: u32 = 5;
const STREAM_BUFFER_BYTES: usize = 512 * 1024;
const REPORT_GRANULARITY: u64 = 1024 * 1024;
const MIB: u64 = 1024 * 1024;
const SPACE_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("api error: {0}")]
    Api(#[from] CirrusError),
    #[error("transfer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("workspace storage exhausted: need {needed} bytes, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub max_concurrent_transfers: usize,
    pub large_file_threshold: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 50,
            large_file_threshold: 3 * MIB,
        }
    }
}

/// Bounded-concurrency transfer pool. Bytes stream in both directions with
/// progress reported at 1 MiB granularity; retryable failures back off and
/// retry in place, with a larger base delay for large bodies.
pub struct TransferPipeline {
    client: CirrusClient,
    events: Arc<EventBus>,
    limiter: Arc<Semaphore>,
    cancel: CancellationToken,
    large_file_threshold: u64,
    space_cache: Mutex<Option<(SpaceUsage, Instant)>>,
}

impl TransferPipeline {
    pub fn new(
        client: CirrusClient,
        events: Arc<EventBus>,
        config: PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            events,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
            cancel,
            large_file_threshold: config.large_file_threshold,
            space_cache: Mutex::new(None),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads a local file into the given parent folder, streaming the
    /// body. A `(name, size)` match in the target folder short-circuits to
    /// the existing entry; the workspace quota is checked before any bytes
    /// move.
    pub async fn upload(
        &self,
        workspace_id: i64,
        local_path: &Path,
        parent_id: Option<i64>,
    ) -> Result<RemoteEntry, PipelineError> {
        let _permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::ConcurrencyClosed)?;

        let meta = tokio::fs::metadata(local_path).await?;
        let size = meta.len();
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Some(existing) = self
            .find_duplicate(workspace_id, &name, parent_id, size)
            .await?
        {
            return Ok(existing);
        }
        self.ensure_quota(workspace_id, size).await?;

        let backoff = self.backoff_for(size);
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self
                .upload_once(workspace_id, local_path, &name, parent_id, size)
                .await
            {
                Ok(entry) => return Ok(entry),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    if attempt >= MAX_TRANSFER_ATTEMPTS || !self.is_retryable(&err, size) {
                        if matches!(
                            api_status(&err),
                            Some(StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE)
                        ) {
                            self.invalidate_space_cache();
                        }
                        self.events.error(rejection_message(&name, size));
                        return Err(err);
                    }
                    tokio::time::sleep(backoff.delay(attempt)).await;
                }
            }
        }
    }

    /// Downloads an entry into `dest_dir`, staging through a `.partial`
    /// sibling so the final name only ever holds complete content. Returns
    /// the absolute path written.
    pub async fn download(
        &self,
        workspace_id: i64,
        entry: &RemoteEntry,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let _permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::ConcurrencyClosed)?;

        let size = entry.size.unwrap_or(0);
        let backoff = self.backoff_for(size);
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            match self.download_once(workspace_id, entry, dest_dir).await {
                Ok(path) => return Ok(path),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    if attempt >= MAX_TRANSFER_ATTEMPTS || !self.is_retryable(&err, size) {
                        self.events.error(rejection_message(&entry.name, size));
                        return Err(err);
                    }
                    tokio::time::sleep(backoff.delay(attempt)).await;
                }
            }
        }
    }

    async fn upload_once(
        &self,
        workspace_id: i64,
        local_path: &Path,
        name: &str,
        parent_id: Option<i64>,
        size: u64,
    ) -> Result<RemoteEntry, PipelineError> {
        let link = self
            .client
            .upload_link(workspace_id, name, parent_id, size)
            .await?;

        let file = tokio::fs::File::open(local_path).await?;
        let tracker = Arc::new(ProgressTracker::new(
            name.to_string(),
            size,
            Arc::clone(&self.events),
        ));
        let cancel = self.cancel.clone();
        let stream = ReaderStream::with_capacity(file, STREAM_BUFFER_BYTES).map(move |chunk| {
            if cancel.is_cancelled() {
                return Err(std::io::Error::other("transfer cancelled"));
            }
            if let Ok(chunk) = &chunk {
                tracker.record(chunk.len() as u64);
            }
            chunk
        });

        let response = self
            .client
            .http()
            .put(link.href.clone())
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Api(CirrusError::Api { status, body }));
        }
        Ok(response.json::<RemoteEntry>().await?)
    }

    async fn download_once(
        &self,
        workspace_id: i64,
        entry: &RemoteEntry,
        dest_dir: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let link = self.client.download_link(workspace_id, entry).await?;
        let response = self.client.http().get(link.href.clone()).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Api(CirrusError::Api { status, body }));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(sanitize_file_name(&entry.name));
        let partial = partial_path(&target);
        let total = entry.size.unwrap_or(0);
        let tracker = ProgressTracker::new(entry.name.clone(), total, Arc::clone(&self.events));

        let result = self
            .stream_to_partial(&partial, response, &tracker)
            .await;
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }

        tokio::fs::rename(&partial, &target).await?;
        Ok(target)
    }

    async fn stream_to_partial(
        &self,
        partial: &Path,
        response: reqwest::Response,
        tracker: &ProgressTracker,
    ) -> Result<(), PipelineError> {
        let file = tokio::fs::File::create(partial).await?;
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER_BYTES, file);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            tracker.record(chunk.len() as u64);
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(())
    }

    async fn find_duplicate(
        &self,
        workspace_id: i64,
        name: &str,
        parent_id: Option<i64>,
        size: u64,
    ) -> Result<Option<RemoteEntry>, PipelineError> {
        let siblings = match parent_id {
            Some(parent_id) => self.client.list_folder(workspace_id, parent_id).await?,
            None => self.client.list_root(workspace_id).await?,
        };
        Ok(siblings.into_iter().find(|entry| {
            entry.kind == EntryKind::File
                && entry.size == Some(size)
                && (entry.name.eq_ignore_ascii_case(name) || names_similar(&entry.name, name))
        }))
    }

    async fn ensure_quota(&self, workspace_id: i64, needed: u64) -> Result<(), PipelineError> {
        let cached = {
            let cache = self.space_cache.lock().expect("space cache mutex poisoned");
            cache
                .as_ref()
                .filter(|(_, fetched_at)| fetched_at.elapsed() < SPACE_CACHE_TTL)
                .map(|(usage, _)| *usage)
        };
        let usage = match cached {
            Some(usage) => usage,
            None => {
                let usage = self.client.space_usage(workspace_id).await?;
                *self.space_cache.lock().expect("space cache mutex poisoned") =
                    Some((usage, Instant::now()));
                usage
            }
        };
        if needed > usage.available {
            return Err(PipelineError::QuotaExceeded {
                needed,
                available: usage.available,
            });
        }
        Ok(())
    }

    fn invalidate_space_cache(&self) {
        *self.space_cache.lock().expect("space cache mutex poisoned") = None;
    }

    fn backoff_for(&self, size: u64) -> Backoff {
        if size > self.large_file_threshold {
            Backoff::new(Duration::from_secs(5), Duration::from_secs(120), true)
        } else {
            Backoff::new(Duration::from_millis(500), Duration::from_secs(60), true)
        }
    }

    fn is_retryable(&self, err: &PipelineError, size: u64) -> bool {
        match err {
            PipelineError::Api(api) => match api.status() {
                // Unprocessable-entity on a large body is transient server
                // overload; on a small body it is a real rejection.
                Some(StatusCode::UNPROCESSABLE_ENTITY) => size > self.large_file_threshold,
                Some(StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE) => false,
                _ => api.is_retryable(),
            },
            PipelineError::Request(_) => true,
            PipelineError::Io(_)
            | PipelineError::ConcurrencyClosed
            | PipelineError::Cancelled
            | PipelineError::QuotaExceeded { .. } => false,
        }
    }
}

fn api_status(err: &PipelineError) -> Option<StatusCode> {
    match err {
        PipelineError::Api(api) => api.status(),
        PipelineError::Request(err) => err.status(),
        _ => None,
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

/// Heuristic for encoding-mangled names: equal after stripping everything
/// but ASCII alphanumerics.
fn names_similar(a: &str, b: &str) -> bool {
    let key_a = mangled_key(a);
    !key_a.is_empty() && key_a == mangled_key(b)
}

fn mangled_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn rejection_message(name: &str, size: u64) -> String {
    if size > 100 * MIB {
        format!("{name}: the server rejected this file")
    } else if size > 50 * MIB {
        format!("{name}: upload failed; the file may be too large")
    } else {
        format!("{name}: network error during transfer")
    }
}

struct ProgressTracker {
    file_name: String,
    total: u64,
    started: Instant,
    state: Mutex<ProgressState>,
    events: Arc<EventBus>,
}

#[derive(Default)]
struct ProgressState {
    sent: u64,
    last_report: u64,
}

impl ProgressTracker {
    fn new(file_name: String, total: u64, events: Arc<EventBus>) -> Self {
        Self {
            file_name,
            total,
            started: Instant::now(),
            state: Mutex::new(ProgressState::default()),
            events,
        }
    }

    fn record(&self, bytes: u64) {
        let sent = {
            let mut state = self.state.lock().expect("progress mutex poisoned");
            state.sent = state.sent.saturating_add(bytes);
            if state.sent < state.last_report.saturating_add(REPORT_GRANULARITY)
                && state.sent < self.total
            {
                return;
            }
            state.last_report = state.sent;
            state.sent
        };

        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let mib_per_sec = sent as f64 / MIB as f64 / elapsed;
        let remaining = self.total.saturating_sub(sent);
        let eta_seconds = if mib_per_sec > 0.0 {
            (remaining as f64 / MIB as f64 / mib_per_sec).ceil() as u64
        } else {
            0
        };
        self.events.emit(SyncEvent::TransferProgress {
            file_name: self.file_name.clone(),
            bytes_sent: sent,
            bytes_total: self.total,
            mib_per_sec,
            eta_seconds,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::AuthMode;
    use tempfile::tempdir;
    use wiremock::matchers::{body_bytes, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline(server: &MockServer) -> (TransferPipeline, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let client =
            CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("t")).unwrap();
        let pipeline = TransferPipeline::new(
            client,
            Arc::clone(&events),
            PipelineConfig::default(),
            CancellationToken::new(),
        );
        (pipeline, events)
    }

    fn remote_file(id: i64, name: &str, size: u64) -> RemoteEntry {
        RemoteEntry {
            id,
            name: name.to_string(),
            kind: EntryKind::File,
            parent_id: Some(10),
            size: Some(size),
            hash: Some(format!("h-{id}")),
            updated_at: None,
            workspace_id: 7,
        }
    }

    async fn mock_space(server: &MockServer, available: u64) {
        Mock::given(method("GET"))
            .and(path("/v2/space"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "used": 0,
                "available": available
            })))
            .mount(server)
            .await;
    }

    async fn mock_empty_root(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v2/entries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [],
                "limit": 200,
                "offset": 0,
                "total": 0
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn upload_streams_the_file_body() {
        let server = MockServer::start().await;
        mock_empty_root(&server).await;
        mock_space(&server, 1_000_000).await;
        Mock::given(method("GET"))
            .and(path("/v2/files/upload-link"))
            .and(query_param("name", "in.bin"))
            .and(query_param("size", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "href": format!("{}/put/in.bin", server.uri()),
                "method": "PUT"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/put/in.bin"))
            .and(body_bytes(b"payload"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": 31,
                "name": "in.bin",
                "type": "file",
                "parent_id": null,
                "size": 7,
                "workspace_id": 7
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (pipeline, _) = pipeline(&server);
        let entry = pipeline.upload(7, &source, None).await.unwrap();
        assert_eq!(entry.id, 31);
    }

    #[tokio::test]
    async fn upload_short_circuits_on_duplicate_in_target_folder() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/entries"))
            .and(query_param("parent_id", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    { "id": 31, "name": "IN.bin", "type": "file", "parent_id": 10, "size": 7, "workspace_id": 7 }
                ],
                "limit": 200,
                "offset": 0,
                "total": 1
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (pipeline, _) = pipeline(&server);
        let entry = pipeline.upload(7, &source, Some(10)).await.unwrap();
        assert_eq!(entry.id, 31);

        // Only the listing was hit: no link request, no PUT.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn mangled_name_heuristic_matches_encoding_damage_only() {
        assert!(names_similar("Rapport financier.pdf", "Rapport_financier?.pdf"));
        assert!(!names_similar("a.txt", "b.txt"));
        assert!(!names_similar("???", "!!!"));
    }

    #[tokio::test]
    async fn upload_fails_fast_when_quota_is_exhausted() {
        let server = MockServer::start().await;
        mock_empty_root(&server).await;
        mock_space(&server, 3).await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("big.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (pipeline, _) = pipeline(&server);
        let err = pipeline.upload(7, &source, None).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::QuotaExceeded { needed: 7, available: 3 }
        ));

        // The upload endpoint was never consulted.
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| !r.url.path().contains("upload-link")));
    }

    #[tokio::test]
    async fn upload_retries_transient_errors_then_succeeds() {
        let server = MockServer::start().await;
        mock_empty_root(&server).await;
        mock_space(&server, 1_000_000).await;
        Mock::given(method("GET"))
            .and(path("/v2/files/upload-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "href": format!("{}/put/in.bin", server.uri()),
                "method": "PUT"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/put/in.bin"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/put/in.bin"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": 31,
                "name": "in.bin",
                "type": "file",
                "size": 7,
                "workspace_id": 7
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (pipeline, _) = pipeline(&server);
        let entry = pipeline.upload(7, &source, None).await.unwrap();
        assert_eq!(entry.id, 31);
    }

    #[tokio::test]
    async fn non_retryable_rejection_emits_a_classified_error_event() {
        let server = MockServer::start().await;
        mock_empty_root(&server).await;
        mock_space(&server, 1_000_000).await;
        Mock::given(method("GET"))
            .and(path("/v2/files/upload-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "href": format!("{}/put/in.bin", server.uri()),
                "method": "PUT"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/put/in.bin"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (pipeline, events) = pipeline(&server);
        let mut rx = events.subscribe();
        let err = pipeline.upload(7, &source, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Api(_)));

        // Progress reports may precede the classified error.
        let mut error_message = None;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::Error { message } = event {
                error_message = Some(message);
            }
        }
        assert_eq!(
            error_message.as_deref(),
            Some("in.bin: network error during transfer")
        );
    }

    #[tokio::test]
    async fn download_writes_the_body_and_removes_the_partial() {
        let server = MockServer::start().await;
        let entry = remote_file(31, "out.txt", 5);
        Mock::given(method("GET"))
            .and(path("/v2/files/download-link"))
            .and(query_param("hash", "h-31"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "href": format!("{}/get/out.txt", server.uri()),
                "method": "GET"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get/out.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("Docs");
        let (pipeline, _) = pipeline(&server);
        let written = pipeline.download(7, &entry, &dest).await.unwrap();

        assert_eq!(written, dest.join("out.txt"));
        assert_eq!(std::fs::read(&written).unwrap(), b"hello");
        assert!(!partial_path(&written).exists());
    }

    #[tokio::test]
    async fn download_sanitizes_hostile_entry_names() {
        let server = MockServer::start().await;
        let entry = remote_file(31, "bad:name?.txt", 5);
        Mock::given(method("GET"))
            .and(path("/v2/files/download-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "href": format!("{}/get/file", server.uri()),
                "method": "GET"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (pipeline, _) = pipeline(&server);
        let written = pipeline.download(7, &entry, dir.path()).await.unwrap();
        assert_eq!(written, dir.path().join("bad_name_.txt"));
    }

    #[tokio::test]
    async fn download_reports_progress_at_mib_granularity() {
        let server = MockServer::start().await;
        let body = vec![0u8; (2 * MIB + 512) as usize];
        let entry = remote_file(31, "big.bin", body.len() as u64);
        Mock::given(method("GET"))
            .and(path("/v2/files/download-link"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "href": format!("{}/get/big.bin", server.uri()),
                "method": "GET"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/get/big.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let (pipeline, events) = pipeline(&server);
        let mut rx = events.subscribe();
        pipeline.download(7, &entry, dir.path()).await.unwrap();

        let mut reports = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::TransferProgress {
                bytes_sent,
                bytes_total,
                ..
            } = event
            {
                reports.push((bytes_sent, bytes_total));
            }
        }
        assert!(reports.len() >= 2, "expected multiple reports, got {reports:?}");
        let (final_sent, final_total) = *reports.last().unwrap();
        assert_eq!(final_sent, body.len() as u64);
        assert_eq!(final_total, body.len() as u64);
    }

    #[tokio::test]
    async fn cancelled_pipeline_rejects_transfers() {
        let server = MockServer::start().await;
        let events = Arc::new(EventBus::new());
        let client =
            CirrusClient::with_base_url(&server.uri(), AuthMode::bearer("t")).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline =
            TransferPipeline::new(client, events, PipelineConfig::default(), cancel);

        let entry = remote_file(31, "out.txt", 5);
        let dir = tempdir().unwrap();
        let err = pipeline.download(7, &entry, dir.path()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
