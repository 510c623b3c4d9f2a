use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::auth::AuthMode;

const DEFAULT_BASE_URL: &str = "https://api.cirrusdrive.io";
const LIST_PAGE_SIZE: u32 = 200;

// Transfers of very large files can legitimately run for hours.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Error)]
pub enum CirrusError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("api response missing items")]
    MissingItems,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the workspace drive API. Every operation is scoped to a
/// workspace id passed by the caller; the client itself holds no workspace
/// state, so parallel workspaces can share one client.
#[derive(Clone)]
pub struct CirrusClient {
    http: Client,
    base_url: Url,
    auth: AuthMode,
}

impl CirrusClient {
    pub fn new(auth: AuthMode) -> Result<Self, CirrusError> {
        Self::with_base_url(DEFAULT_BASE_URL, auth)
    }

    pub fn with_base_url(base_url: &str, auth: AuthMode) -> Result<Self, CirrusError> {
        Ok(Self {
            http: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            base_url: Url::parse(base_url)?,
            auth,
        })
    }

    pub async fn list_root(&self, workspace_id: i64) -> Result<Vec<RemoteEntry>, CirrusError> {
        self.list_all(workspace_id, None).await
    }

    pub async fn list_folder(
        &self,
        workspace_id: i64,
        folder_id: i64,
    ) -> Result<Vec<RemoteEntry>, CirrusError> {
        self.list_all(workspace_id, Some(folder_id)).await
    }

    async fn list_all(
        &self,
        workspace_id: i64,
        parent_id: Option<i64>,
    ) -> Result<Vec<RemoteEntry>, CirrusError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_page(workspace_id, parent_id, LIST_PAGE_SIZE, offset)
                .await?;
            offset = offset.saturating_add(page.items.len() as u32);
            let total = page.total;
            items.extend(page.items);
            if offset >= total {
                break;
            }
        }
        Ok(items)
    }

    pub async fn list_page(
        &self,
        workspace_id: i64,
        parent_id: Option<i64>,
        limit: u32,
        offset: u32,
    ) -> Result<EntryPage, CirrusError> {
        let mut url = self.endpoint("/v2/entries")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("workspace_id", &workspace_id.to_string());
            if let Some(parent_id) = parent_id {
                query.append_pair("parent_id", &parent_id.to_string());
            }
            query.append_pair("limit", &limit.to_string());
            query.append_pair("offset", &offset.to_string());
        }
        let response = self.auth.apply(self.http.get(url)).send().await?;
        let payload: EntryPageResponse = Self::handle_response(response).await?;
        payload.page().ok_or(CirrusError::MissingItems)
    }

    /// Creates a folder. When the server reports the name as already taken,
    /// the parent is re-listed and the existing folder entry is adopted.
    pub async fn create_folder(
        &self,
        workspace_id: i64,
        name: &str,
        parent_id: Option<i64>,
    ) -> Result<RemoteEntry, CirrusError> {
        let url = self.endpoint("/v2/folders")?;
        let body = CreateFolderBody {
            workspace_id,
            name,
            parent_id,
        };
        let response = self.auth.apply(self.http.post(url)).json(&body).send().await?;
        match Self::handle_response::<RemoteEntry>(response).await {
            Ok(entry) => Ok(entry),
            Err(CirrusError::Api { status, body }) if status == StatusCode::CONFLICT => {
                let siblings = match parent_id {
                    Some(parent_id) => self.list_folder(workspace_id, parent_id).await?,
                    None => self.list_root(workspace_id).await?,
                };
                siblings
                    .into_iter()
                    .find(|entry| {
                        entry.kind == EntryKind::Folder && entry.name.eq_ignore_ascii_case(name)
                    })
                    .ok_or(CirrusError::Api { status, body })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn rename(
        &self,
        workspace_id: i64,
        id: i64,
        new_name: &str,
    ) -> Result<bool, CirrusError> {
        let url = self.endpoint(&format!("/v2/entries/{id}/rename"))?;
        let body = RenameBody {
            workspace_id,
            name: new_name,
        };
        let response = self.auth.apply(self.http.post(url)).json(&body).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let ack: Ack = Self::handle_response(response).await?;
        Ok(ack.ok)
    }

    pub async fn delete(&self, workspace_id: i64, id: i64) -> Result<bool, CirrusError> {
        let mut url = self.endpoint(&format!("/v2/entries/{id}"))?;
        url.query_pairs_mut()
            .append_pair("workspace_id", &workspace_id.to_string());
        let response = self.auth.apply(self.http.delete(url)).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => {
                let ack: Ack = Self::handle_response(response).await?;
                Ok(ack.ok)
            }
        }
    }

    pub async fn space_usage(&self, workspace_id: i64) -> Result<SpaceUsage, CirrusError> {
        let mut url = self.endpoint("/v2/space")?;
        url.query_pairs_mut()
            .append_pair("workspace_id", &workspace_id.to_string());
        let response = self.auth.apply(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub async fn get_workspace(&self, workspace_id: i64) -> Result<Workspace, CirrusError> {
        let url = self.endpoint(&format!("/v2/workspaces/{workspace_id}"))?;
        let response = self.auth.apply(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Resolves the signed href the file body must be streamed to.
    pub async fn upload_link(
        &self,
        workspace_id: i64,
        name: &str,
        parent_id: Option<i64>,
        size: u64,
    ) -> Result<TransferLink, CirrusError> {
        let mut url = self.endpoint("/v2/files/upload-link")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("workspace_id", &workspace_id.to_string());
            query.append_pair("name", name);
            if let Some(parent_id) = parent_id {
                query.append_pair("parent_id", &parent_id.to_string());
            }
            query.append_pair("size", &size.to_string());
        }
        let response = self.auth.apply(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    /// Resolves the signed href a file body can be streamed from. Entries
    /// carrying a content hash are addressed by it; the id is the fallback.
    pub async fn download_link(
        &self,
        workspace_id: i64,
        entry: &RemoteEntry,
    ) -> Result<TransferLink, CirrusError> {
        let mut url = self.endpoint("/v2/files/download-link")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("workspace_id", &workspace_id.to_string());
            match &entry.hash {
                Some(hash) => query.append_pair("hash", hash),
                None => query.append_pair("id", &entry.id.to_string()),
            };
        }
        let response = self.auth.apply(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    fn endpoint(&self, path: &str) -> Result<Url, CirrusError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CirrusError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CirrusError::Api { status, body })
        }
    }
}

impl CirrusError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            CirrusError::Api { status, .. } => Some(classify_api_status(*status)),
            // Connection resets, closed sockets and timeouts surface here.
            CirrusError::Request(_) => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CirrusError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// An entry as the remote reports it: a file or folder inside a workspace.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    pub workspace_id: i64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EntryPage {
    pub items: Vec<RemoteEntry>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[derive(Debug, Deserialize)]
struct EntryPageResponse {
    #[serde(default)]
    items: Option<Vec<RemoteEntry>>,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    offset: u32,
    #[serde(default)]
    total: u32,
}

impl EntryPageResponse {
    fn page(self) -> Option<EntryPage> {
        Some(EntryPage {
            items: self.items?,
            limit: self.limit,
            offset: self.offset,
            total: self.total,
        })
    }
}

#[derive(Debug, Serialize)]
struct CreateFolderBody<'a> {
    workspace_id: i64,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct RenameBody<'a> {
    workspace_id: i64,
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct Ack {
    ok: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct SpaceUsage {
    pub used: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Workspace {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
}
