// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inline `@reference` completion.
//!
//! While the user types `compare @rev`, the resolver detects the active
//! trigger left of the cursor, ranks the known files and templates against
//! the partial name and lets the caller move through the candidates.
//! Accepting one splices its name into the input in place of the trigger.
//!
//! All offsets are in characters, not bytes.

use std::collections::HashSet;

use tally_config::MentionConfig;
use tally_service::FileDescriptor;
use tracing::trace;

use crate::match_score;

/// An active reference trigger: the marker at `start`, the partial name
/// after it, and the cursor at `end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub start: usize,
    pub end: usize,
    pub query: String,
}

/// Find the trigger ending at `cursor`, if any.
///
/// The marker must begin the text or follow whitespace, and everything
/// between it and the cursor must be non-whitespace.  `me@corp` is
/// therefore not a trigger, and neither is `@rev ` once a space is typed.
pub fn detect_trigger(text: &str, cursor: usize, marker: char) -> Option<Trigger> {
    let chars: Vec<char> = text.chars().collect();
    let end = cursor.min(chars.len());

    let mut start = end;
    loop {
        if start == 0 {
            return None;
        }
        start -= 1;
        let c = chars[start];
        if c == marker {
            break;
        }
        if c.is_whitespace() {
            return None;
        }
    }
    if start > 0 && !chars[start - 1].is_whitespace() {
        return None;
    }

    Some(Trigger { start, end, query: chars[start + 1..end].iter().collect() })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    File,
    Template,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub kind: CandidateKind,
    /// Match score; higher is better.
    pub score: usize,
}

/// Result of accepting a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub text: String,
    /// Cursor position after the inserted separator.
    pub cursor: usize,
}

struct ActiveMention {
    trigger: Trigger,
    candidates: Vec<Candidate>,
    selected: usize,
}

pub struct MentionResolver {
    marker: char,
    max_candidates: usize,
    files: Vec<String>,
    /// Configured templates followed by group names from the catalogue.
    templates: Vec<String>,
    configured_templates: Vec<String>,
    active: Option<ActiveMention>,
}

impl MentionResolver {
    pub fn new(marker: char, max_candidates: usize) -> Self {
        Self {
            marker,
            max_candidates,
            files: Vec::new(),
            templates: Vec::new(),
            configured_templates: Vec::new(),
            active: None,
        }
    }

    pub fn from_config(cfg: &MentionConfig) -> Self {
        let mut resolver = Self::new(cfg.trigger, cfg.max_candidates);
        resolver.configured_templates = cfg.templates.clone();
        resolver.templates = cfg.templates.clone();
        resolver
    }

    pub fn marker(&self) -> char {
        self.marker
    }

    pub fn set_files(&mut self, files: impl IntoIterator<Item = String>) {
        self.files = files.into_iter().collect();
        self.active = None;
    }

    /// Take file names from `catalogue` and offer each distinct group as a
    /// template next to the configured ones.
    pub fn set_catalogue(&mut self, catalogue: &[FileDescriptor]) {
        self.set_files(catalogue.iter().map(|f| f.filename.clone()));
        let mut templates = self.configured_templates.clone();
        templates.extend(catalogue.iter().filter_map(|f| f.group.clone()));
        self.templates = templates;
    }

    /// Re-evaluate `text` with the cursor at `cursor`.  Returns the
    /// candidates to show; empty when no trigger is active or nothing
    /// matches.
    pub fn update(&mut self, text: &str, cursor: usize) -> &[Candidate] {
        let Some(trigger) = detect_trigger(text, cursor, self.marker) else {
            self.active = None;
            return &[];
        };
        let candidates = self.rank(&trigger.query);
        trace!(query = %trigger.query, matches = candidates.len(), "mention candidates");
        if candidates.is_empty() {
            self.active = None;
            return &[];
        }

        let selected = match &self.active {
            Some(prev) if prev.candidates == candidates => prev.selected,
            _ => 0,
        };
        let active = self.active.insert(ActiveMention { trigger, candidates, selected });
        &active.candidates
    }

    /// Candidates for `query`: files first, then templates not already
    /// present, deduplicated case-insensitively, ranked by score with ties
    /// kept in input order, and capped.
    pub fn rank(&self, query: &str) -> Vec<Candidate> {
        let entries = self
            .files
            .iter()
            .map(|n| (n, CandidateKind::File))
            .chain(self.templates.iter().map(|n| (n, CandidateKind::Template)));

        let mut seen = HashSet::new();
        let mut ranked: Vec<Candidate> = entries
            .filter(|(name, _)| seen.insert(name.to_lowercase()))
            .filter_map(|(name, kind)| {
                match_score(query, name).map(|score| Candidate { name: name.clone(), kind, score })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked.truncate(self.max_candidates);
        ranked
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn candidates(&self) -> &[Candidate] {
        self.active.as_ref().map(|a| a.candidates.as_slice()).unwrap_or(&[])
    }

    pub fn trigger(&self) -> Option<&Trigger> {
        self.active.as_ref().map(|a| &a.trigger)
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.selected)
    }

    pub fn selected(&self) -> Option<&Candidate> {
        self.active.as_ref().and_then(|a| a.candidates.get(a.selected))
    }

    /// Move the highlight down by one, wrapping at the end.
    pub fn select_next(&mut self) {
        if let Some(a) = &mut self.active {
            a.selected = (a.selected + 1) % a.candidates.len();
        }
    }

    /// Move the highlight up by one, wrapping at the start.
    pub fn select_prev(&mut self) {
        if let Some(a) = &mut self.active {
            a.selected = a.selected.checked_sub(1).unwrap_or(a.candidates.len() - 1);
        }
    }

    pub fn dismiss(&mut self) {
        self.active = None;
    }

    /// Splice the highlighted candidate into `text` and close the list.
    pub fn accept(&mut self, text: &str) -> Option<Splice> {
        let index = self.selected_index()?;
        self.accept_index(text, index)
    }

    /// Replace the trigger span (marker and partial name) with the name of
    /// candidate `index` plus a trailing space.  Text outside the span is
    /// untouched.  An out-of-range index leaves the list open.
    pub fn accept_index(&mut self, text: &str, index: usize) -> Option<Splice> {
        let active = self.active.as_ref()?;
        let candidate = active.candidates.get(index)?;
        let Trigger { start, end, .. } = active.trigger;
        if end > text.chars().count() {
            return None;
        }

        let before: String = text.chars().take(start).collect();
        let after: String = text.chars().skip(end).collect();
        let insert = format!("{} ", candidate.name);
        let cursor = start + insert.chars().count();
        self.active = None;
        Some(Splice { text: format!("{before}{insert}{after}"), cursor })
    }
}
