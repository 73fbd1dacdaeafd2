// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::json;

use crate::decoder::encode_frame;
use crate::{
    AnalysisService, ByteStream, FileDescriptor, HistoryEntry, ModelDescriptor, QueryRequest,
    QueryResponse, Role, ServiceError, SessionSummary, StreamEvent, UploadAccepted, UploadJob,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deterministic service for tests and offline runs.  Answers every
/// question with `MOCK: <question>` and keeps history in memory.
#[derive(Default)]
pub struct MockService {
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
}

impl MockService {
    fn record(&self, req: &QueryRequest, answer: &str) {
        let mut history = lock(&self.history);
        let log = history.entry(req.session_id.clone()).or_default();
        log.push(HistoryEntry { role: Role::User, content: req.question.clone() });
        log.push(HistoryEntry { role: Role::Assistant, content: answer.to_string() });
    }
}

#[async_trait]
impl AnalysisService for MockService {
    fn name(&self) -> &str {
        "mock"
    }

    async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ServiceError> {
        Ok(lock(&self.history).get(session_id).cloned().unwrap_or_default())
    }

    async fn clear_history(&self, session_id: &str) -> Result<(), ServiceError> {
        lock(&self.history).remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ServiceError> {
        let mut ids: Vec<String> = lock(&self.history).keys().cloned().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .map(|session_id| SessionSummary { session_id, extra: Default::default() })
            .collect())
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryResponse, ServiceError> {
        let answer = format!("MOCK: {}", req.question);
        self.record(req, &answer);
        Ok(QueryResponse { answer, data: Default::default() })
    }

    async fn query_stream(&self, req: &QueryRequest) -> Result<ByteStream, ServiceError> {
        let answer = format!("MOCK: {}", req.question);
        self.record(req, &answer);
        Ok(StreamScript::answer(&["MOCK: ", req.question.as_str()], &answer).into_stream())
    }

    async fn upload(&self, path: &Path) -> Result<UploadAccepted, ServiceError> {
        Ok(UploadAccepted { job_id: format!("mock-{}", path.display()), message: None })
    }

    async fn upload_status(&self, job_id: &str) -> Result<UploadJob, ServiceError> {
        let mut job = UploadJob::queued(job_id);
        job.status = crate::JobStatus::Completed;
        job.progress = 100;
        Ok(job)
    }

    async fn list_files(&self) -> Result<Vec<FileDescriptor>, ServiceError> {
        Ok(Vec::new())
    }

    async fn delete_file(&self, _filename: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn set_file_group(&self, _filename: &str, _group: &str) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ServiceError> {
        Ok(Vec::new())
    }
}

/// Scripted body for one `query_stream` call.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// The stream opens and yields these chunks, then closes.
    Chunks(Vec<Result<Vec<u8>, ServiceError>>),
    /// Opening the stream fails.
    Fail(ServiceError),
    /// The stream opens and never yields (a hung transport).
    Hang,
}

impl StreamScript {
    /// One chunk per event.
    pub fn events(events: &[StreamEvent]) -> Self {
        Self::Chunks(events.iter().map(|e| Ok(encode_frame(e).into_bytes())).collect())
    }

    /// Token events for `tokens` followed by a `done` event carrying `answer`.
    pub fn answer(tokens: &[&str], answer: &str) -> Self {
        let mut events = vec![StreamEvent::new("status", json!("Analyzing data..."))];
        events.extend(tokens.iter().map(|t| StreamEvent::new("token", json!(t))));
        events.push(StreamEvent::new("done", json!({ "answer": answer })));
        Self::events(&events)
    }

    /// A raw body split into chunks of `size` bytes.
    pub fn raw(body: &[u8], size: usize) -> Self {
        Self::Chunks(body.chunks(size.max(1)).map(|c| Ok(c.to_vec())).collect())
    }

    fn into_stream(self) -> ByteStream {
        match self {
            StreamScript::Chunks(chunks) => Box::pin(stream::iter(chunks)),
            StreamScript::Fail(e) => Box::pin(stream::iter(vec![Err(e)])),
            StreamScript::Hang => Box::pin(stream::pending::<Result<Vec<u8>, ServiceError>>()),
        }
    }
}

/// A pre-scripted service.  Each query or status call pops the next scripted
/// result from the front of its queue so tests can specify exact sequences,
/// including failures, without network access.
///
/// When the status queue runs dry the last status is repeated, which models a
/// job that never reaches a terminal state.
#[derive(Default)]
pub struct ScriptedMockService {
    queries: Mutex<VecDeque<Result<QueryResponse, ServiceError>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    statuses: Mutex<VecDeque<Result<UploadJob, ServiceError>>>,
    last_status: Mutex<Option<Result<UploadJob, ServiceError>>>,
    upload_result: Mutex<Option<Result<UploadAccepted, ServiceError>>>,
    history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    history_delay: Mutex<Option<Duration>>,
    files: Mutex<Vec<FileDescriptor>>,
    sessions: Mutex<Vec<SessionSummary>>,
    /// Every `QueryRequest` seen, in call order.
    requests: Mutex<Vec<QueryRequest>>,
    status_polls: AtomicU32,
    session_list_calls: AtomicU32,
}

impl ScriptedMockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer(self, answer: impl Into<String>) -> Self {
        lock(&self.queries)
            .push_back(Ok(QueryResponse { answer: answer.into(), data: Default::default() }));
        self
    }

    pub fn with_response(self, response: QueryResponse) -> Self {
        lock(&self.queries).push_back(Ok(response));
        self
    }

    pub fn with_query_error(self, err: ServiceError) -> Self {
        lock(&self.queries).push_back(Err(err));
        self
    }

    pub fn with_stream(self, script: StreamScript) -> Self {
        lock(&self.streams).push_back(script);
        self
    }

    pub fn with_statuses(self, statuses: Vec<Result<UploadJob, ServiceError>>) -> Self {
        lock(&self.statuses).extend(statuses);
        self
    }

    pub fn with_upload_result(self, result: Result<UploadAccepted, ServiceError>) -> Self {
        *lock(&self.upload_result) = Some(result);
        self
    }

    pub fn with_history(self, session_id: &str, entries: Vec<HistoryEntry>) -> Self {
        lock(&self.history).insert(session_id.to_string(), entries);
        self
    }

    /// Make every `history` call wait `delay` before answering.
    pub fn with_history_delay(self, delay: Duration) -> Self {
        *lock(&self.history_delay) = Some(delay);
        self
    }

    pub fn with_files(self, files: Vec<FileDescriptor>) -> Self {
        *lock(&self.files) = files;
        self
    }

    pub fn with_sessions(self, ids: &[&str]) -> Self {
        *lock(&self.sessions) = ids
            .iter()
            .map(|id| SessionSummary { session_id: id.to_string(), extra: Default::default() })
            .collect();
        self
    }

    /// Number of `upload_status` calls served so far.
    pub fn status_polls(&self) -> u32 {
        self.status_polls.load(Ordering::SeqCst)
    }

    /// Number of `list_sessions` calls served so far.
    pub fn session_list_calls(&self) -> u32 {
        self.session_list_calls.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<QueryRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl AnalysisService for ScriptedMockService {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ServiceError> {
        let delay = *lock(&self.history_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(lock(&self.history).get(session_id).cloned().unwrap_or_default())
    }

    async fn clear_history(&self, session_id: &str) -> Result<(), ServiceError> {
        lock(&self.history).remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ServiceError> {
        self.session_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.sessions).clone())
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryResponse, ServiceError> {
        lock(&self.requests).push(req.clone());
        lock(&self.queries).pop_front().unwrap_or_else(|| {
            Ok(QueryResponse { answer: "[no more scripts]".into(), data: Default::default() })
        })
    }

    async fn query_stream(&self, req: &QueryRequest) -> Result<ByteStream, ServiceError> {
        lock(&self.requests).push(req.clone());
        let script = lock(&self.streams)
            .pop_front()
            .unwrap_or_else(|| StreamScript::answer(&[], "[no more scripts]"));
        match script {
            StreamScript::Fail(e) => Err(e),
            other => Ok(other.into_stream()),
        }
    }

    async fn upload(&self, path: &Path) -> Result<UploadAccepted, ServiceError> {
        lock(&self.upload_result).clone().unwrap_or_else(|| {
            Ok(UploadAccepted {
                job_id: format!("job-{}", path.display()),
                message: Some("File upload accepted and processing started".into()),
            })
        })
    }

    async fn upload_status(&self, job_id: &str) -> Result<UploadJob, ServiceError> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.statuses).pop_front();
        let mut last = lock(&self.last_status);
        match next {
            Some(result) => {
                *last = Some(result.clone());
                result
            }
            None => last.clone().unwrap_or_else(|| {
                Err(ServiceError::Status { status: 404, detail: format!("Job {job_id} not found") })
            }),
        }
    }

    async fn list_files(&self) -> Result<Vec<FileDescriptor>, ServiceError> {
        Ok(lock(&self.files).clone())
    }

    async fn delete_file(&self, filename: &str) -> Result<(), ServiceError> {
        let mut files = lock(&self.files);
        let before = files.len();
        files.retain(|f| f.filename != filename);
        if files.len() == before {
            return Err(ServiceError::Status {
                status: 404,
                detail: format!("File {filename} not found"),
            });
        }
        Ok(())
    }

    async fn set_file_group(&self, filename: &str, group: &str) -> Result<(), ServiceError> {
        for f in lock(&self.files).iter_mut().filter(|f| f.filename == filename) {
            f.group = Some(group.to_string());
        }
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ServiceError> {
        Ok(Vec::new())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
