// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use tally_service::ServiceError;
use thiserror::Error;

/// Why `submit` refused to start a turn.  Neither case changes any state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("input is empty")]
    EmptyInput,
    #[error("a turn is already in flight for session '{session}'")]
    TurnInFlight { session: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HistoryError {
    #[error("a turn is already in flight for session '{session}'")]
    TurnInFlight { session: String },
    #[error("session '{session}' changed while its history was loading")]
    Changed { session: String },
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("session '{session}' has no messages")]
    EmptyConversation { session: String },
}

/// Why a dispatched turn did not reconcile.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TurnFailure {
    #[error(transparent)]
    Transport(#[from] ServiceError),
    /// The service reported an error event on the stream.
    #[error("{0}")]
    Remote(String),
    #[error("no answer after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("the service returned an empty answer")]
    EmptyResponse,
    #[error("request cancelled")]
    Cancelled,
}

impl TurnFailure {
    /// True when nothing reached the service, so the turn can be undone
    /// completely instead of leaving an error message behind.
    pub fn is_pre_transport(&self) -> bool {
        matches!(self, TurnFailure::Transport(e) if e.is_pre_transport())
    }
}

/// Terminal failure of an upload job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },
    #[error("job failed: {0}")]
    Failed(String),
    #[error("status check failed: {0}")]
    Transport(String),
}
