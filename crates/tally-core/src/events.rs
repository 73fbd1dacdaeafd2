// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tally_service::Message;

use crate::TurnFailure;

/// How far a failed turn was unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// The placeholder was replaced by a visible error message; the user's
    /// message stays.
    ErrorShown,
    /// Nothing reached the service, so the session is back at its
    /// pre-submit snapshot.
    Reverted,
}

/// Terminal result of one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Reconciled { message: Message },
    RolledBack { failure: TurnFailure, rollback: Rollback },
}

impl TurnOutcome {
    pub fn is_reconciled(&self) -> bool {
        matches!(self, TurnOutcome::Reconciled { .. })
    }

    /// The final assistant message, if the turn reconciled.
    pub fn message(&self) -> Option<&Message> {
        match self {
            TurnOutcome::Reconciled { message } => Some(message),
            TurnOutcome::RolledBack { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&TurnFailure> {
        match self {
            TurnOutcome::Reconciled { .. } => None,
            TurnOutcome::RolledBack { failure, .. } => Some(failure),
        }
    }
}

/// Events emitted while a turn runs.  A front end subscribes to these to
/// render the answer incrementally; the store holds the same state.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The user message and placeholder are in the store.
    Dispatched { session: String },
    /// Progress text from the service ("Analyzing data...").
    Status(String),
    /// A chunk of answer text.
    Delta(String),
    /// A payload key was set from a stream event.
    PayloadUpdated { key: String, value: Value },
    Reconciled(Message),
    RolledBack { failure: TurnFailure, rollback: Rollback },
}

/// Notified once per turn, after it reaches a terminal state.
#[async_trait]
pub trait TurnObserver: Send + Sync {
    async fn turn_completed(&self, session: &str, outcome: &TurnOutcome);
}
