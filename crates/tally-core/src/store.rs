// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use tally_service::Message;

use crate::StoreError;

#[derive(Debug, Default)]
struct SessionLog {
    messages: Vec<Message>,
    /// Bumped on every mutation.
    version: u64,
}

/// Point-in-time marker for one session, taken before a speculative write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub session: String,
    len: usize,
    version: u64,
}

/// Ordered per-session message log.
///
/// Every appended message gets an `order` from one counter shared by all
/// sessions, so order values are strictly increasing within a session and
/// never reused.  Sessions never see each other's writes.
#[derive(Debug, Default)]
pub struct ConversationStore {
    sessions: HashMap<String, SessionLog>,
    next_order: u64,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of `session` in insertion order; empty for an unknown session.
    pub fn messages(&self, session: &str) -> &[Message] {
        self.sessions.get(session).map(|s| s.messages.as_slice()).unwrap_or(&[])
    }

    pub fn last(&self, session: &str) -> Option<&Message> {
        self.messages(session).last()
    }

    pub fn len(&self, session: &str) -> usize {
        self.messages(session).len()
    }

    pub fn is_empty(&self, session: &str) -> bool {
        self.len(session) == 0
    }

    pub fn version(&self, session: &str) -> u64 {
        self.sessions.get(session).map(|s| s.version).unwrap_or(0)
    }

    /// Known session ids, sorted.
    pub fn sessions(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.sessions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Append `message`, creating the session on first reference.
    pub fn append(&mut self, session: &str, mut message: Message) -> &[Message] {
        self.next_order += 1;
        message.order = self.next_order;
        let log = self.sessions.entry(session.to_string()).or_default();
        log.messages.push(message);
        log.version += 1;
        &log.messages
    }

    /// Replace the newest message in place.  The replacement inherits the
    /// position and `order` of the message it replaces.
    pub fn replace_last(&mut self, session: &str, mut message: Message) -> Result<(), StoreError> {
        let slot = self
            .sessions
            .get_mut(session)
            .filter(|log| !log.messages.is_empty())
            .and_then(|log| {
                log.version += 1;
                log.messages.last_mut()
            })
            .ok_or_else(|| StoreError::EmptyConversation { session: session.to_string() })?;
        message.order = slot.order;
        *slot = message;
        Ok(())
    }

    pub fn clear(&mut self, session: &str) {
        if let Some(log) = self.sessions.get_mut(session) {
            log.messages.clear();
            log.version += 1;
        }
    }

    /// Install `messages` as the whole log of `session`, replacing any
    /// in-memory copy.  Orders are reassigned in the given sequence.
    pub fn load(&mut self, session: &str, messages: impl IntoIterator<Item = Message>) -> usize {
        self.clear(session);
        for m in messages {
            self.append(session, m);
        }
        self.len(session)
    }

    pub fn snapshot(&self, session: &str) -> Snapshot {
        Snapshot {
            session: session.to_string(),
            len: self.len(session),
            version: self.version(session),
        }
    }

    /// Undo everything appended since `snap` was taken.  Returns the number
    /// of messages removed.
    ///
    /// Messages that existed at snapshot time are kept as they are now.
    pub fn restore(&mut self, snap: &Snapshot) -> usize {
        let Some(log) = self.sessions.get_mut(&snap.session) else {
            return 0;
        };
        if log.version == snap.version {
            return 0;
        }
        let removed = log.messages.len().saturating_sub(snap.len);
        log.messages.truncate(snap.len);
        log.version += 1;
        removed
    }
}
