// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ─── Conversation ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    /// The service stores its own turns as `"ai"`.
    #[serde(alias = "ai")]
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// Opaque structured data attached to an assistant answer: metrics, chart
/// series, generated-file references, code traces.  Stored and forwarded,
/// never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredPayload(Map<String, Value>);

impl StructuredPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an arbitrary JSON value.  Objects are taken as-is; anything else
    /// is stored under `"value"`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            Value::Null => Self::default(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                Self(map)
            }
        }
    }

    /// Set `key`, replacing any earlier value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Overlay every entry of `other` onto `self`; entries from `other` win.
    pub fn merge(&mut self, other: StructuredPayload) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// A single message in a session.
///
/// `order` is assigned by the conversation store when the message is
/// appended and is strictly increasing within a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StructuredPayload>,
    #[serde(default)]
    pub order: u64,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into(), data: None, order: 0 }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into(), data: None, order: 0 }
    }

    /// Empty assistant message inserted while an answer is pending.
    pub fn placeholder() -> Self {
        Self::assistant(String::new())
    }

    pub fn with_data(mut self, data: Option<StructuredPayload>) -> Self {
        self.data = data.filter(|d| !d.is_empty());
        self
    }
}

/// One entry of `GET /chat/history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl From<HistoryEntry> for Message {
    fn from(e: HistoryEntry) -> Self {
        Self { role: e.role, content: e.content, data: None, order: 0 }
    }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Body of `POST /query` and `POST /query/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filenames: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: session_id.into(),
            filename: None,
            filenames: None,
            group: None,
            model: None,
        }
    }
}

/// Response of `POST /query`, and the `data` of a stream's `done` event.
///
/// Everything except `answer` is kept verbatim as the structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(flatten)]
    pub data: StructuredPayload,
}

impl QueryResponse {
    pub fn into_message(self) -> Message {
        Message::assistant(self.answer).with_data(Some(self.data))
    }
}

// ─── Streaming ───────────────────────────────────────────────────────────────

/// One decoded frame of the response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl StreamEvent {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }

    pub fn event_kind(&self) -> EventKind {
        EventKind::parse(&self.kind)
    }

    /// The data as text: strings verbatim, everything else JSON-encoded.
    pub fn data_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Event kinds the analysis service emits on `/query/stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Progress note ("Analyzing data...").
    Status,
    /// A fragment of the answer text.
    Token,
    Thinking,
    Code,
    Metrics,
    /// Final answer; data is a full [`QueryResponse`].
    Done,
    /// Server-side failure; data is the message.
    Error,
    Other(String),
}

impl EventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "status" => Self::Status,
            "token" => Self::Token,
            "thinking" => Self::Thinking,
            "code" => Self::Code,
            "metrics" => Self::Metrics,
            "done" => Self::Done,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

// ─── Upload jobs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[serde(alias = "pending")]
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Response of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub job_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Response of `GET /upload/status/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub job_id: String,
    pub status: JobStatus,
    /// Percentage in `0..=100`; out-of-range values from the server are clamped.
    #[serde(default, deserialize_with = "clamp_progress")]
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl UploadJob {
    pub fn queued(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            message: None,
            result: None,
            error: None,
        }
    }
}

fn clamp_progress<'de, D: Deserializer<'de>>(d: D) -> Result<u8, D::Error> {
    let raw = f64::deserialize(d)?;
    Ok(raw.clamp(0.0, 100.0) as u8)
}

// ─── Catalogues ──────────────────────────────────────────────────────────────

/// An uploaded file as listed by `GET /files`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created_at: f64,
    #[serde(default)]
    pub group: Option<String>,
}

/// A model offered by `GET /models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub cost: String,
    #[serde(default)]
    pub enabled: bool,
}

/// A stored conversation as listed by `GET /chat/sessions`.
///
/// The server may answer with bare ids or with objects; object fields other
/// than the id are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSession")]
pub struct SessionSummary {
    pub session_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSession {
    Id(String),
    Object {
        #[serde(alias = "id")]
        session_id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl From<RawSession> for SessionSummary {
    fn from(raw: RawSession) -> Self {
        match raw {
            RawSession::Id(session_id) => Self { session_id, extra: Map::new() },
            RawSession::Object { session_id, extra } => Self { session_id, extra },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
