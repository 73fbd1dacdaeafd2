// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::{
    FileDescriptor, HistoryEntry, ModelDescriptor, QueryRequest, QueryResponse, ServiceError,
    SessionSummary, UploadAccepted, UploadJob,
};

/// Raw body of a streaming response, chunked however the transport delivers it.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ServiceError>> + Send>>;

/// The remote analysis service.
///
/// Every method is a single request/response.  Implementations do no
/// retrying; callers decide what a failure means.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Short identifier for status display (usually the base URL).
    fn name(&self) -> &str;

    /// `GET /chat/history`: chronological messages of a session.
    async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ServiceError>;

    /// `DELETE /chat/history`.
    async fn clear_history(&self, session_id: &str) -> Result<(), ServiceError>;

    /// `GET /chat/sessions`.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ServiceError>;

    /// `POST /query`: single-shot answer.
    async fn query(&self, req: &QueryRequest) -> Result<QueryResponse, ServiceError>;

    /// `POST /query/stream`: the raw event-stream body.  Decode it with
    /// [`crate::decode_stream`].
    async fn query_stream(&self, req: &QueryRequest) -> Result<ByteStream, ServiceError>;

    /// `POST /upload`: starts background ingestion of a local file.
    async fn upload(&self, path: &Path) -> Result<UploadAccepted, ServiceError>;

    /// `GET /upload/status/{job_id}`.
    async fn upload_status(&self, job_id: &str) -> Result<UploadJob, ServiceError>;

    /// `GET /files`.
    async fn list_files(&self) -> Result<Vec<FileDescriptor>, ServiceError>;

    /// `DELETE /files/{filename}`.
    async fn delete_file(&self, filename: &str) -> Result<(), ServiceError>;

    /// `PATCH /files/{filename}?group=`: assign the file to a group.
    async fn set_file_group(&self, filename: &str, group: &str) -> Result<(), ServiceError>;

    /// `GET /models`.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ServiceError>;
}
