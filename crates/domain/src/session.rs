//! Session Store (interface) — append-only journal of conversation entries,
//! keyed by session id (§4.D, §6).
//!
//! The durable backends this workspace actually ships (file-per-session
//! JSONL, in `sa-sessions`) implement this trait; a SQL-backed
//! implementation is an expected but out-of-scope external collaborator
//! (§1) reachable through the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent_state::AgentState;
use crate::error::Result;
use crate::message::Message;

/// One append-only journal record (§6 session entry format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unix epoch seconds.
    pub created_at: f64,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub is_compaction: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_flags: Option<u32>,
}

impl SessionEntry {
    pub fn delta(messages: Vec<Message>, created_at: f64) -> Self {
        Self {
            id: None,
            created_at,
            messages,
            is_compaction: false,
            user_id: None,
            post_id: None,
            channel_id: None,
            channel_flags: None,
        }
    }

    pub fn compaction(full_messages: Vec<Message>, created_at: f64) -> Self {
        Self {
            id: None,
            created_at,
            messages: full_messages,
            is_compaction: true,
            user_id: None,
            post_id: None,
            channel_id: None,
            channel_flags: None,
        }
    }

    /// Apply this entry to a state: compaction entries replace the message
    /// list wholesale, delta entries append.
    pub fn apply(&self, state: &mut AgentState) {
        if self.is_compaction {
            state.messages = self.messages.clone();
        } else {
            state.messages.extend(self.messages.iter().cloned());
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self, session_id: &str) -> Result<AgentState>;
    async fn append_session_entry(&self, session_id: &str, entry: SessionEntry) -> Result<()>;
    async fn session_entries(
        &self,
        session_id: &str,
        start: usize,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEntry>>;
    async fn session_entry_count(&self, session_id: &str) -> Result<usize>;

    /// Optional full-text search over stored sessions; backends that don't
    /// index content may return an empty result.
    async fn search_sessions(&self, _query: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Idempotent: deleting an already-absent session is not an error.
    async fn forget_session(&self, session_id: &str) -> Result<()>;
}

/// Rebuild an `AgentState` by replaying every entry for a session, in
/// append order (§8 invariant 5).
pub fn reconstruct_state(entries: &[SessionEntry], session_id: &str) -> AgentState {
    let mut state = AgentState::with_session_id(session_id);
    for entry in entries {
        entry.apply(&mut state);
    }
    state
}

/// In-memory `SessionStore`, the backend required by §4.D. Not durable
/// across process restarts; the file-per-session JSONL backend in
/// `sa-sessions` is the durable counterpart.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: parking_lot::Mutex<std::collections::HashMap<String, Vec<SessionEntry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load_session(&self, session_id: &str) -> Result<AgentState> {
        let entries = self.entries.lock();
        let list = entries.get(session_id).cloned().unwrap_or_default();
        Ok(reconstruct_state(&list, session_id))
    }

    async fn append_session_entry(&self, session_id: &str, entry: SessionEntry) -> Result<()> {
        self.entries.lock().entry(session_id.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn session_entries(
        &self,
        session_id: &str,
        start: usize,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEntry>> {
        let entries = self.entries.lock();
        let list = entries.get(session_id).cloned().unwrap_or_default();
        let end = match limit {
            Some(l) => (start + l).min(list.len()),
            None => list.len(),
        };
        Ok(if start >= list.len() { Vec::new() } else { list[start..end].to_vec() })
    }

    async fn session_entry_count(&self, session_id: &str) -> Result<usize> {
        Ok(self.entries.lock().get(session_id).map(Vec::len).unwrap_or(0))
    }

    async fn forget_session(&self, session_id: &str) -> Result<()> {
        self.entries.lock().remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_entries_append() {
        let mut state = AgentState::new();
        state.push(Message::user_text("hi"));
        let entry = SessionEntry::delta(vec![Message::user_text("second")], 0.0);
        entry.apply(&mut state);
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn compaction_entry_replaces_messages() {
        let mut state = AgentState::new();
        state.push(Message::user_text("old 1"));
        state.push(Message::user_text("old 2"));
        let summary = Message::CompactionSummary(crate::message::CompactionSummaryMessage {
            text: "summary".into(),
            tokens_before: 100,
            compacted_at: 0.0,
        });
        let entry = SessionEntry::compaction(
            vec![summary, Message::user_text("kept")],
            1.0,
        );
        entry.apply(&mut state);
        assert_eq!(state.messages.len(), 2);
        assert!(state.messages[0].is_compaction_summary());
    }

    #[test]
    fn reconstruct_state_replays_entries_in_order() {
        let entries = vec![
            SessionEntry::delta(vec![Message::user_text("a")], 0.0),
            SessionEntry::delta(vec![Message::user_text("b")], 1.0),
        ];
        let state = reconstruct_state(&entries, "sess-1");
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemorySessionStore::new();
        store
            .append_session_entry("s1", SessionEntry::delta(vec![Message::user_text("hi")], 0.0))
            .await
            .unwrap();
        let state = store.load_session("s1").await.unwrap();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(store.session_entry_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn forget_session_is_idempotent() {
        let store = InMemorySessionStore::new();
        store.forget_session("absent").await.unwrap();
        store
            .append_session_entry("s1", SessionEntry::delta(vec![Message::user_text("hi")], 0.0))
            .await
            .unwrap();
        store.forget_session("s1").await.unwrap();
        store.forget_session("s1").await.unwrap();
        assert_eq!(store.session_entry_count("s1").await.unwrap(), 0);
    }
}
