// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line-oriented chat front end.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use tally_core::{
    JobOutcome, JobPoller, QueryDispatcher, SubmitError, TurnEvent, TurnObserver, TurnOutcome,
};
use tally_input::{CandidateKind, MentionResolver};
use tally_service::{AnalysisService, Message, Role};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

const HELP: &str = "\
Commands:
  /upload <path>     upload a spreadsheet and wait for indexing
  /files             list uploaded files
  /history           reload and print this session's history
  /clear             delete this session's history
  /session [id|new]  show or switch the session
  /sessions          list sessions seen on the server
  /complete <text>   show reference completions for <text>
  /help              this help
  /quit              leave
Anything else is sent as a question.";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Empty,
    Question(String),
    Upload(PathBuf),
    Files,
    History,
    Clear,
    Session(Option<String>),
    Sessions,
    Complete(String),
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Question(line.to_string());
    };
    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (rest, ""),
    };
    match (cmd, arg) {
        ("upload", "") => Input::Unknown("/upload needs a path".into()),
        ("upload", path) => Input::Upload(tally_config::expand_path(path)),
        ("files", _) => Input::Files,
        ("history", _) => Input::History,
        ("clear", _) => Input::Clear,
        ("session", "") => Input::Session(None),
        ("session", id) => Input::Session(Some(id.to_string())),
        ("sessions", _) => Input::Sessions,
        ("complete", text) => Input::Complete(text.to_string()),
        ("help" | "?", _) => Input::Help,
        ("quit" | "exit" | "q", _) => Input::Quit,
        (other, _) => Input::Unknown(format!("unknown command /{other}")),
    }
}

/// Keeps the server's session list current after every turn.
pub struct SessionRefresh {
    service: Arc<dyn AnalysisService>,
    known: Mutex<Vec<String>>,
}

impl SessionRefresh {
    pub fn new(service: Arc<dyn AnalysisService>) -> Self {
        Self { service, known: Mutex::new(Vec::new()) }
    }

    pub fn known(&self) -> Vec<String> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TurnObserver for SessionRefresh {
    async fn turn_completed(&self, session: &str, _outcome: &TurnOutcome) {
        match self.service.list_sessions().await {
            Ok(list) => {
                let ids: Vec<String> = list.into_iter().map(|s| s.session_id).collect();
                debug!(session, sessions = ids.len(), "session list refreshed");
                *self.known.lock().unwrap_or_else(PoisonError::into_inner) = ids;
            }
            Err(e) => debug!(session, "session refresh failed: {e}"),
        }
    }
}

/// Print stream events as they arrive and return the streamed text.
async fn print_events(mut rx: mpsc::Receiver<TurnEvent>) -> String {
    let mut streamed = String::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            TurnEvent::Status(status) => eprintln!("[{status}]"),
            TurnEvent::Delta(delta) => {
                print!("{delta}");
                let _ = stdout.flush();
                streamed.push_str(&delta);
            }
            TurnEvent::PayloadUpdated { key, .. } => debug!(key = %key, "payload updated"),
            _ => {}
        }
    }
    streamed
}

/// Run one turn, echoing the answer to stdout as it streams in.
pub async fn run_turn(
    dispatcher: &QueryDispatcher,
    session: &str,
    text: &str,
    echo: bool,
) -> Result<TurnOutcome, SubmitError> {
    let (tx, rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        if echo {
            print_events(rx).await
        } else {
            drop(rx);
            String::new()
        }
    });
    let outcome = dispatcher.submit(session, text, Some(tx)).await;
    let streamed = printer.await.unwrap_or_default();

    if echo {
        match &outcome {
            Ok(TurnOutcome::Reconciled { message }) => {
                if streamed.is_empty() {
                    print!("{}", message.content);
                }
                println!();
                print_payload_keys(message);
            }
            Ok(TurnOutcome::RolledBack { failure, .. }) => {
                if !streamed.is_empty() {
                    println!();
                }
                eprintln!("error: {failure}");
            }
            Err(_) => {}
        }
    }
    outcome
}

fn print_payload_keys(message: &Message) {
    if let Some(data) = &message.data {
        let keys: Vec<&str> = data.keys().filter(|k| *k != "status").collect();
        if !keys.is_empty() {
            eprintln!("[data: {}]", keys.join(", "));
        }
    }
}

pub fn print_transcript(messages: &[Message]) {
    for m in messages {
        let who = match m.role {
            Role::User => "you",
            Role::Assistant => "tally",
        };
        println!("{who}> {}", m.content);
    }
}

pub fn print_job_outcome(outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Completed { job, attempts } => {
            println!("{}: indexed after {attempts} checks", job.job_id);
            if let Some(result) = &job.result {
                println!("{result}");
            }
        }
        other => {
            if let Some(err) = other.error() {
                eprintln!("upload failed: {err}");
            }
        }
    }
}

/// Forward upload progress to stderr until the poller finishes.
pub fn spawn_progress_printer() -> (mpsc::Sender<tally_core::JobProgress>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<tally_core::JobProgress>(16);
    let handle = tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            let message = p.message.unwrap_or_default();
            eprintln!("[{}] {:>3}% {message}", p.status, p.progress);
        }
    });
    (tx, handle)
}

/// Everything the interactive loop needs.
pub struct ChatContext {
    pub dispatcher: Arc<QueryDispatcher>,
    pub poller: JobPoller,
    pub resolver: MentionResolver,
    pub sessions: Arc<SessionRefresh>,
    pub session: String,
}

pub async fn run(mut ctx: ChatContext, interactive: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    if interactive {
        eprintln!("tally: session '{}' on {} (/help for commands)", ctx.session, ctx.dispatcher.service().name());
    }

    loop {
        if interactive {
            print!("{}> ", ctx.session);
            let _ = std::io::stdout().flush();
        }
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            break;
        };

        match parse_line(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Help => println!("{HELP}"),
            Input::Unknown(msg) => eprintln!("{msg}"),
            Input::Question(text) => {
                if let Err(e) = run_turn(&ctx.dispatcher, &ctx.session, &text, true).await {
                    eprintln!("{e}");
                }
            }
            Input::Upload(path) => {
                let (tx, printer) = spawn_progress_printer();
                let result = ctx.poller.upload_and_poll(&path, Some(tx)).await;
                let _ = printer.await;
                match result {
                    Ok(outcome) => print_job_outcome(&outcome),
                    Err(e) => eprintln!("upload of {} failed: {e}", path.display()),
                }
            }
            Input::Files => match ctx.dispatcher.service().list_files().await {
                Ok(files) => {
                    for f in &files {
                        println!("{}", crate::format_file(f));
                    }
                    ctx.resolver.set_catalogue(&files);
                }
                Err(e) => eprintln!("{e}"),
            },
            Input::History => match ctx.dispatcher.load_history(&ctx.session).await {
                Ok(_) => print_transcript(&ctx.dispatcher.messages(&ctx.session)),
                Err(e) => eprintln!("{e}"),
            },
            Input::Clear => match ctx.dispatcher.clear_history(&ctx.session).await {
                Ok(()) => println!("history of '{}' cleared", ctx.session),
                Err(e) => eprintln!("{e}"),
            },
            Input::Session(None) => println!("{}", ctx.session),
            Input::Session(Some(id)) => {
                ctx.session = if id == "new" { uuid::Uuid::new_v4().to_string() } else { id };
                println!("switched to session '{}'", ctx.session);
            }
            Input::Sessions => {
                for id in ctx.sessions.known() {
                    let marker = if id == ctx.session { "*" } else { " " };
                    println!("{marker} {id}");
                }
            }
            Input::Complete(text) => {
                match ctx.dispatcher.service().list_files().await {
                    Ok(files) => ctx.resolver.set_catalogue(&files),
                    Err(e) => debug!("file list unavailable, using cached catalogue: {e}"),
                }
                print_candidates(&mut ctx.resolver, &text);
            }
        }
    }
    Ok(())
}

pub fn print_candidates(resolver: &mut MentionResolver, text: &str) {
    let cursor = text.chars().count();
    let candidates = resolver.update(text, cursor);
    if candidates.is_empty() {
        println!("(no candidates)");
        return;
    }
    for c in candidates {
        let kind = match c.kind {
            CandidateKind::File => "file",
            CandidateKind::Template => "template",
        };
        println!("{:<32} {kind}", c.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_question() {
        assert_eq!(parse_line("  What is Q3 revenue?  "), Input::Question("What is Q3 revenue?".into()));
        assert_eq!(parse_line("   "), Input::Empty);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_line("/files"), Input::Files);
        assert_eq!(parse_line("/session"), Input::Session(None));
        assert_eq!(parse_line("/session q3"), Input::Session(Some("q3".into())));
        assert_eq!(parse_line("/complete compare @rev"), Input::Complete("compare @rev".into()));
        assert_eq!(parse_line("/upload data/revenue.csv"), Input::Upload(PathBuf::from("data/revenue.csv")));
        assert_eq!(parse_line("/q"), Input::Quit);
        assert!(matches!(parse_line("/upload"), Input::Unknown(_)));
        assert!(matches!(parse_line("/frobnicate"), Input::Unknown(_)));
    }
}
