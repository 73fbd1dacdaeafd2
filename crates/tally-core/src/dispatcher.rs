// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tally_config::QueryConfig;
use tally_service::{
    decode_stream, AnalysisService, EventKind, Message, QueryRequest, QueryResponse,
    StructuredPayload,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    ConversationStore, HistoryError, Rollback, Snapshot, SubmitError, TurnEvent, TurnFailure,
    TurnObserver, TurnOutcome,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the latest turn of a session stands.
///
/// ```text
/// Idle → Dispatched → Streaming | Awaiting → Reconciled | RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    /// User message and placeholder written; request not yet answered.
    Dispatched,
    /// The event stream is open and being applied to the placeholder.
    Streaming,
    /// Waiting on a single-shot response.
    Awaiting,
    Reconciled,
    RolledBack,
}

impl TurnState {
    pub fn is_pending(self) -> bool {
        matches!(self, TurnState::Dispatched | TurnState::Streaming | TurnState::Awaiting)
    }
}

/// Per-turn references forwarded to the service with the question.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnContext {
    pub file: Option<String>,
    pub files: Vec<String>,
    pub group: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Use `/query/stream` instead of `/query`.
    pub stream: bool,
    /// Roll a turn back when it has not finished in time.  `None` waits on
    /// the transport indefinitely.
    pub turn_timeout: Option<Duration>,
    /// Default context for `submit`.
    pub context: TurnContext,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { stream: true, turn_timeout: None, context: TurnContext::default() }
    }
}

impl DispatchOptions {
    pub fn from_config(cfg: &QueryConfig) -> Self {
        Self {
            stream: cfg.stream,
            turn_timeout: cfg.turn_timeout(),
            context: TurnContext {
                file: cfg.file.clone(),
                files: Vec::new(),
                group: cfg.group.clone(),
                model: cfg.model.clone(),
            },
        }
    }
}

/// Runs conversational turns against an [`AnalysisService`] and owns the
/// conversation store they write to.
///
/// Each turn is applied optimistically: the user message and an empty
/// assistant placeholder are stored before the request starts, the
/// placeholder is filled in as the answer arrives and is finally replaced in
/// place.  At most one turn per session is pending; sessions are independent.
pub struct QueryDispatcher {
    service: Arc<dyn AnalysisService>,
    options: DispatchOptions,
    store: Mutex<ConversationStore>,
    turns: Mutex<HashMap<String, TurnState>>,
    observer: Option<Arc<dyn TurnObserver>>,
}

impl QueryDispatcher {
    pub fn new(service: Arc<dyn AnalysisService>, options: DispatchOptions) -> Self {
        Self {
            service,
            options,
            store: Mutex::new(ConversationStore::new()),
            turns: Mutex::new(HashMap::new()),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn TurnObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    pub fn service(&self) -> &Arc<dyn AnalysisService> {
        &self.service
    }

    pub fn messages(&self, session: &str) -> Vec<Message> {
        lock(&self.store).messages(session).to_vec()
    }

    pub fn sessions(&self) -> Vec<String> {
        lock(&self.store).sessions().into_iter().map(str::to_string).collect()
    }

    pub fn state(&self, session: &str) -> TurnState {
        lock(&self.turns).get(session).copied().unwrap_or_default()
    }

    pub fn is_pending(&self, session: &str) -> bool {
        self.state(session).is_pending()
    }

    /// Run one turn with the default context.
    ///
    /// Returns `Err` only when the turn was refused; every dispatched turn
    /// ends in a [`TurnOutcome`], failures included.
    pub async fn submit(
        &self,
        session: &str,
        text: &str,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome, SubmitError> {
        let ctx = self.options.context.clone();
        self.submit_with(session, text, &ctx, events).await
    }

    pub async fn submit_with(
        &self,
        session: &str,
        text: &str,
        ctx: &TurnContext,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnOutcome, SubmitError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        let guard = self.begin(session, events.clone())?;

        let snapshot = {
            let mut store = lock(&self.store);
            let snap = store.snapshot(session);
            store.append(session, Message::user(text));
            store.append(session, Message::placeholder());
            snap
        };
        info!(session, stream = self.options.stream, "turn dispatched");
        emit(events.as_ref(), TurnEvent::Dispatched { session: session.to_string() }).await;

        let req = build_request(text, session, ctx);
        let result = match self.options.turn_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.run_turn(session, &req, events.as_ref())).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(session, timeout_secs = limit.as_secs(), "turn timed out");
                        Err(TurnFailure::TimedOut(limit))
                    }
                }
            }
            None => self.run_turn(session, &req, events.as_ref()).await,
        };

        let outcome = match result {
            Ok(message) => self.reconcile(session, message),
            Err(failure) => self.roll_back(session, &snapshot, failure),
        };
        let terminal = if outcome.is_reconciled() {
            TurnState::Reconciled
        } else {
            TurnState::RolledBack
        };
        guard.finish(terminal);

        let event = match &outcome {
            TurnOutcome::Reconciled { message } => TurnEvent::Reconciled(message.clone()),
            TurnOutcome::RolledBack { failure, rollback } => {
                TurnEvent::RolledBack { failure: failure.clone(), rollback: *rollback }
            }
        };
        emit(events.as_ref(), event).await;
        if let Some(observer) = &self.observer {
            observer.turn_completed(session, &outcome).await;
        }
        Ok(outcome)
    }

    /// Replace the in-memory conversation with the service's history.
    ///
    /// Refused with [`HistoryError::Changed`] when the session's log was
    /// written while the history was being fetched.
    pub async fn load_history(&self, session: &str) -> Result<usize, HistoryError> {
        self.ensure_idle(session)?;
        let version = lock(&self.store).version(session);
        let entries = self.service.history(session).await?;
        let n = self.with_idle_store(session, |store| {
            if store.version(session) != version {
                warn!(session, "conversation changed during history fetch, not loading");
                return Err(HistoryError::Changed { session: session.to_string() });
            }
            Ok(store.load(session, entries.into_iter().map(Message::from)))
        })??;
        info!(session, messages = n, "history loaded");
        Ok(n)
    }

    /// Delete the remote history, then the local copy.
    pub async fn clear_history(&self, session: &str) -> Result<(), HistoryError> {
        self.ensure_idle(session)?;
        self.service.clear_history(session).await?;
        self.with_idle_store(session, |store| store.clear(session))?;
        info!(session, "history cleared");
        Ok(())
    }

    // ── Turn bookkeeping ──────────────────────────────────────────────────────

    fn begin(
        &self,
        session: &str,
        events: Option<mpsc::Sender<TurnEvent>>,
    ) -> Result<TurnGuard<'_>, SubmitError> {
        let mut turns = lock(&self.turns);
        let state = turns.entry(session.to_string()).or_default();
        if state.is_pending() {
            debug!(session, state = ?state, "submit refused, turn in flight");
            return Err(SubmitError::TurnInFlight { session: session.to_string() });
        }
        *state = TurnState::Dispatched;
        Ok(TurnGuard { dispatcher: self, session: session.to_string(), events, finished: false })
    }

    fn set_state(&self, session: &str, state: TurnState) {
        lock(&self.turns).insert(session.to_string(), state);
    }

    fn ensure_idle(&self, session: &str) -> Result<(), HistoryError> {
        if self.is_pending(session) {
            return Err(HistoryError::TurnInFlight { session: session.to_string() });
        }
        Ok(())
    }

    /// Run `f` on the store while no turn for `session` can start.
    fn with_idle_store<R>(
        &self,
        session: &str,
        f: impl FnOnce(&mut ConversationStore) -> R,
    ) -> Result<R, HistoryError> {
        let turns = lock(&self.turns);
        if turns.get(session).is_some_and(|s| s.is_pending()) {
            return Err(HistoryError::TurnInFlight { session: session.to_string() });
        }
        let mut store = lock(&self.store);
        Ok(f(&mut store))
    }

    // ── Transport ─────────────────────────────────────────────────────────────

    async fn run_turn(
        &self,
        session: &str,
        req: &QueryRequest,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<Message, TurnFailure> {
        if self.options.stream {
            self.run_streaming(session, req, events).await
        } else {
            self.set_state(session, TurnState::Awaiting);
            let resp = self.service.query(req).await?;
            if resp.answer.trim().is_empty() && resp.data.is_empty() {
                return Err(TurnFailure::EmptyResponse);
            }
            Ok(resp.into_message())
        }
    }

    async fn run_streaming(
        &self,
        session: &str,
        req: &QueryRequest,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> Result<Message, TurnFailure> {
        let bytes = self.service.query_stream(req).await?;
        self.set_state(session, TurnState::Streaming);
        debug!(session, "stream open");

        let mut stream = decode_stream(bytes);
        let mut answer = String::new();
        let mut payload = StructuredPayload::new();
        let mut done: Option<Value> = None;

        while let Some(item) = stream.next().await {
            let event = item?;
            match event.event_kind() {
                EventKind::Token => {
                    let delta = event.data_text();
                    if delta.is_empty() {
                        continue;
                    }
                    answer.push_str(&delta);
                    self.update_placeholder(session, &answer, &payload);
                    emit(events, TurnEvent::Delta(delta)).await;
                }
                EventKind::Status => {
                    let text = event.data_text();
                    payload.insert("status", event.data);
                    self.update_placeholder(session, &answer, &payload);
                    emit(events, TurnEvent::Status(text)).await;
                }
                EventKind::Thinking | EventKind::Code | EventKind::Metrics => {
                    payload.insert(event.kind.clone(), event.data.clone());
                    self.update_placeholder(session, &answer, &payload);
                    emit(events, TurnEvent::PayloadUpdated { key: event.kind, value: event.data })
                        .await;
                }
                EventKind::Done => {
                    done = Some(event.data);
                    break;
                }
                EventKind::Error => {
                    let message = event.data_text();
                    warn!(session, error = %message, "service reported an error on the stream");
                    return Err(TurnFailure::Remote(message));
                }
                EventKind::Other(kind) => debug!(session, kind = %kind, "ignoring unknown stream event"),
            }
        }

        match done {
            Some(data) => {
                let resp = done_response(data);
                if !resp.answer.is_empty() {
                    answer = resp.answer;
                }
                payload.merge(resp.data);
            }
            None if answer.trim().is_empty() => return Err(TurnFailure::EmptyResponse),
            None => warn!(session, "stream ended without a done event, keeping streamed text"),
        }
        Ok(Message::assistant(answer).with_data(Some(payload)))
    }

    // ── Store writes ──────────────────────────────────────────────────────────

    fn update_placeholder(&self, session: &str, answer: &str, payload: &StructuredPayload) {
        let partial = Message::assistant(answer).with_data(Some(payload.clone()));
        if let Err(e) = lock(&self.store).replace_last(session, partial) {
            warn!(session, "could not update placeholder: {e}");
        }
    }

    fn reconcile(&self, session: &str, message: Message) -> TurnOutcome {
        let mut store = lock(&self.store);
        if let Err(e) = store.replace_last(session, message.clone()) {
            warn!(session, "could not reconcile turn: {e}");
        }
        let message = store.last(session).cloned().unwrap_or(message);
        info!(session, chars = message.content.len(), "turn reconciled");
        TurnOutcome::Reconciled { message }
    }

    fn roll_back(&self, session: &str, snapshot: &Snapshot, failure: TurnFailure) -> TurnOutcome {
        let mut store = lock(&self.store);
        let rollback = if failure.is_pre_transport() {
            let removed = store.restore(snapshot);
            warn!(session, removed, "turn reverted: {failure}");
            Rollback::Reverted
        } else {
            if let Err(e) = store.replace_last(session, error_message(&failure)) {
                warn!(session, "could not record turn error: {e}");
            }
            warn!(session, "turn rolled back: {failure}");
            Rollback::ErrorShown
        };
        TurnOutcome::RolledBack { failure, rollback }
    }
}

/// Marks the session's turn as pending for as long as it lives.
///
/// Dropping an unfinished guard (the submit future was cancelled) settles
/// the turn as rolled back.  Streamed text is kept; an empty placeholder
/// becomes an error message.  The event channel and the observer hear about
/// it like any other terminal transition.
struct TurnGuard<'a> {
    dispatcher: &'a QueryDispatcher,
    session: String,
    events: Option<mpsc::Sender<TurnEvent>>,
    finished: bool,
}

impl TurnGuard<'_> {
    fn finish(mut self, state: TurnState) {
        self.finished = true;
        self.dispatcher.set_state(&self.session, state);
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(session = %self.session, "turn abandoned before completion");
        self.dispatcher.set_state(&self.session, TurnState::RolledBack);
        {
            let mut store = lock(&self.dispatcher.store);
            let empty_placeholder = store
                .last(&self.session)
                .is_some_and(|m| m.role == tally_service::Role::Assistant && m.content.is_empty());
            if empty_placeholder {
                let _ = store.replace_last(&self.session, error_message(&TurnFailure::Cancelled));
            }
        }

        let failure = TurnFailure::Cancelled;
        let rollback = Rollback::ErrorShown;
        if let Some(tx) = self.events.take() {
            let _ = tx.try_send(TurnEvent::RolledBack { failure: failure.clone(), rollback });
        }
        let Some(observer) = self.dispatcher.observer.clone() else {
            return;
        };
        // Drop cannot await, so the notification runs on its own task.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let session = self.session.clone();
                let outcome = TurnOutcome::RolledBack { failure, rollback };
                handle.spawn(async move {
                    observer.turn_completed(&session, &outcome).await;
                });
            }
            Err(_) => debug!(session = %self.session, "no runtime, observer not notified"),
        }
    }
}

async fn emit(events: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

fn build_request(text: &str, session: &str, ctx: &TurnContext) -> QueryRequest {
    let mut req = QueryRequest::new(text, session);
    req.filename = ctx.file.clone();
    req.filenames = (!ctx.files.is_empty()).then(|| ctx.files.clone());
    req.group = ctx.group.clone();
    req.model = ctx.model.clone();
    req
}

/// The `done` event carries the full single-shot response; older servers
/// send just the answer text.
fn done_response(data: Value) -> QueryResponse {
    match data {
        Value::String(answer) => QueryResponse { answer, data: StructuredPayload::new() },
        Value::Null => QueryResponse { answer: String::new(), data: StructuredPayload::new() },
        other => serde_json::from_value(other.clone()).unwrap_or_else(|e| {
            warn!("unexpected done payload: {e}");
            QueryResponse { answer: String::new(), data: StructuredPayload::from_value(other) }
        }),
    }
}

fn error_message(failure: &TurnFailure) -> Message {
    let mut data = StructuredPayload::new();
    data.insert("error", json!(failure.to_string()));
    Message::assistant(format!("Error: {failure}")).with_data(Some(data))
}
