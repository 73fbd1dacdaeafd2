// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! HTTP implementation of [`AnalysisService`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::{
    AnalysisService, ByteStream, FileDescriptor, HistoryEntry, ModelDescriptor, QueryRequest,
    QueryResponse, ServiceError, SessionSummary, UploadAccepted, UploadJob,
};

/// Client for the analysis service's REST routes.
pub struct HttpService {
    /// Base URL without trailing slash, e.g. `http://localhost:8000`.
    base_url: String,
    client: reqwest::Client,
}

impl HttpService {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, ServiceError> {
        let base = base_url.trim_end_matches('/');
        reqwest::Url::parse(base)
            .map_err(|e| ServiceError::Request(format!("invalid base URL '{base}': {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ServiceError::Request(e.to_string()))?;
        Ok(Self { base_url: base.to_string(), client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// URL for a route whose last segments are caller data (file names,
    /// job ids).  Each segment is percent-encoded, so `#`, `?` and `/`
    /// stay inside it.
    fn segment_url(&self, segments: &[&str]) -> Result<reqwest::Url, ServiceError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ServiceError::Request(format!("invalid base URL '{}': {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| ServiceError::Request(format!("base URL '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send `req`, mapping non-2xx responses to [`ServiceError::Status`].
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, ServiceError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    debug!(status = status.as_u16(), "could not read error body: {e}");
                    String::new()
                }
            };
            return Err(ServiceError::from_status(status.as_u16(), &text));
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, ServiceError> {
        let resp = self.send(req).await?;
        let body = resp.bytes().await?;
        trace!(body = %String::from_utf8_lossy(&body), "response body");
        serde_json::from_slice(&body).map_err(|e| ServiceError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AnalysisService for HttpService {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ServiceError> {
        debug!(session = session_id, "fetching history");
        let req = self
            .client
            .get(self.url("/chat/history"))
            .query(&[("session_id", session_id)]);
        self.send_json(req).await
    }

    async fn clear_history(&self, session_id: &str) -> Result<(), ServiceError> {
        debug!(session = session_id, "clearing remote history");
        let req = self
            .client
            .delete(self.url("/chat/history"))
            .query(&[("session_id", session_id)]);
        self.send(req).await.map(|_| ())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ServiceError> {
        self.send_json(self.client.get(self.url("/chat/sessions"))).await
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryResponse, ServiceError> {
        debug!(session = %req.session_id, model = ?req.model, "sending query");
        self.send_json(self.client.post(self.url("/query")).json(req)).await
    }

    async fn query_stream(&self, req: &QueryRequest) -> Result<ByteStream, ServiceError> {
        debug!(session = %req.session_id, model = ?req.model, "opening query stream");
        let http_req = self
            .client
            .post(self.url("/query/stream"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(req);
        let resp = self.send(http_req).await?;
        let bytes = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ServiceError::from));
        Ok(Box::pin(bytes))
    }

    async fn upload(&self, path: &Path) -> Result<UploadAccepted, ServiceError> {
        let io_err = |e: std::io::Error| ServiceError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        let content = tokio::fs::read(path).await.map_err(io_err)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ServiceError::Request(format!("'{}' has no file name", path.display())))?;
        debug!(file = %filename, bytes = content.len(), "uploading file");

        let part = reqwest::multipart::Part::bytes(content).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);
        self.send_json(self.client.post(self.url("/upload")).multipart(form)).await
    }

    async fn upload_status(&self, job_id: &str) -> Result<UploadJob, ServiceError> {
        let url = self.segment_url(&["upload", "status", job_id])?;
        self.send_json(self.client.get(url)).await
    }

    async fn list_files(&self) -> Result<Vec<FileDescriptor>, ServiceError> {
        self.send_json(self.client.get(self.url("/files"))).await
    }

    async fn delete_file(&self, filename: &str) -> Result<(), ServiceError> {
        let url = self.segment_url(&["files", filename])?;
        self.send(self.client.delete(url)).await.map(|_| ())
    }

    async fn set_file_group(&self, filename: &str, group: &str) -> Result<(), ServiceError> {
        let url = self.segment_url(&["files", filename])?;
        let req = self.client.patch(url).query(&[("group", group)]);
        self.send(req).await.map(|_| ())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ServiceError> {
        self.send_json(self.client.get(self.url("/models"))).await
    }
}
