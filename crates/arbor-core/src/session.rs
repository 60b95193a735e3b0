// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arbor_model::{short_id, Message};
use serde_json::Value;

struct SessionInner {
    messages: Vec<Message>,
    metadata: HashMap<String, Value>,
}

/// Append-only conversation log.
///
/// Cheap-clone handle: a run, its agent, and the manager all observe the
/// same log.  Mutated only by the turn loop for its run; cleared only on
/// explicit request.
#[derive(Clone)]
pub struct Session {
    id: Arc<str>,
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(short_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Arc::from(id.into()),
            inner: Arc::new(Mutex::new(SessionInner {
                messages: Vec::new(),
                metadata: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_message(&self, message: Message) {
        self.inner.lock().unwrap().messages.push(message);
    }

    /// Stable ordered snapshot of the log.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().messages.clear();
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().unwrap().metadata.insert(key.into(), value);
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.inner.lock().unwrap().metadata.clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn new_sessions_have_distinct_ids() {
        assert_ne!(Session::new().id(), Session::new().id());
    }

    #[test]
    fn messages_are_appended_in_order() {
        let s = Session::new();
        s.add_message(Message::user("one"));
        s.add_message(Message::assistant("two"));
        let msgs = s.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "one");
        assert_eq!(msgs[1].content, "two");
    }

    #[test]
    fn clones_share_the_same_log() {
        let a = Session::new();
        let b = a.clone();
        a.add_message(Message::user("hi"));
        assert_eq!(b.len(), 1);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn clear_empties_the_log() {
        let s = Session::new();
        s.add_message(Message::user("x"));
        s.clear();
        assert!(s.is_empty());
    }

    #[test]
    fn metadata_round_trips() {
        let s = Session::new();
        s.set_metadata("origin", json!("test"));
        assert_eq!(s.metadata()["origin"], "test");
    }
}
