// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub mention: MentionConfig,
}

/// Where the analysis service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the analysis service, without a trailing route.
    /// Routes such as `/query/stream` are appended to it.
    pub base_url: String,
    /// TCP connect timeout for every request.  Does not bound how long a
    /// response may take once the connection is established.
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Defaults applied to every conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Use `/query/stream` and render tokens as they arrive.  When `false`
    /// the single-shot `/query` route is used.
    #[serde(default = "default_true")]
    pub stream: bool,
    /// Session id used when none is given on the command line.
    pub default_session: String,
    /// Model id forwarded to the service.  `None` lets the server pick.
    pub model: Option<String>,
    /// Restrict questions to the files tagged with this group.
    pub group: Option<String>,
    /// Restrict questions to a single uploaded file.
    pub file: Option<String>,
    /// Abandon a turn that has not finished after this many seconds.
    ///
    /// Unset by default: a turn then waits on the transport for as long as
    /// the connection stays open.
    pub turn_timeout_secs: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stream: true,
            default_session: "default".into(),
            model: None,
            group: None,
            file: None,
            turn_timeout_secs: None,
        }
    }
}

impl QueryConfig {
    pub fn turn_timeout(&self) -> Option<Duration> {
        self.turn_timeout_secs.map(Duration::from_secs)
    }
}

/// Background ingestion polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Wait between two status polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Number of status polls before the job is reported as timed out.
    pub max_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self { poll_interval_ms: 1000, max_attempts: 60 }
    }
}

impl UploadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Inline `@reference` completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MentionConfig {
    pub trigger: char,
    pub max_candidates: usize,
    /// Synthetic entries offered next to uploaded files, e.g. report
    /// templates that the server understands by name.
    pub templates: Vec<String>,
}

impl Default for MentionConfig {
    fn default() -> Self {
        Self { trigger: '@', max_candidates: 5, templates: Vec::new() }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
