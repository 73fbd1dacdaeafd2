// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    /// The request could not be built; nothing was sent.
    #[error("request could not be built: {0}")]
    Request(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("could not read '{path}': {reason}")]
    Io { path: String, reason: String },
}

impl ServiceError {
    /// `true` when the failure happened before any byte went on the wire.
    pub fn is_pre_transport(&self) -> bool {
        matches!(self, ServiceError::Request(_) | ServiceError::Io { .. })
    }

    /// Build a [`ServiceError::Status`] from an HTTP error body.
    ///
    /// The service reports failures as `{"detail": "..."}`; when the body has
    /// that shape only the detail is kept, otherwise the raw text.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("detail").map(|d| match d {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }))
            .unwrap_or_else(|| body.trim().to_string());
        ServiceError::Status { status, detail }
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            ServiceError::Request(e.to_string())
        } else if e.is_decode() {
            ServiceError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ServiceError::Status { status: status.as_u16(), detail: e.to_string() }
        } else {
            ServiceError::Transport(e.to_string())
        }
    }
}
