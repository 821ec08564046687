//! Durable, file-per-session JSONL backend for `sa_domain::session::SessionStore`
//! (§4.D). Each session gets a `<sessionId>.jsonl` file under the configured
//! base directory; every journal entry (delta or compaction) is appended as
//! one JSON line, mirroring the append-only transcript model in
//! `transcript.rs` but keyed to the canonical `SessionEntry` shape instead of
//! a flat role/content line.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use sa_domain::agent_state::AgentState;
use sa_domain::error::{Error, Result};
use sa_domain::session::{reconstruct_state, SessionEntry, SessionStore};

/// Durable `SessionStore`: one JSONL file per session id, with an in-memory
/// read cache populated lazily from disk on first access.
pub struct JsonlSessionStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Vec<SessionEntry>>>,
}

impl JsonlSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(Error::Io)?;
        Ok(Self { base_dir, cache: RwLock::new(HashMap::new()) })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{session_id}.jsonl"))
    }

    /// Load a session's entries from disk, skipping and warning on any
    /// malformed line rather than failing the whole read.
    fn read_from_disk(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "skipping malformed session entry");
                }
            }
        }
        Ok(entries)
    }

    fn entries_cached(&self, session_id: &str) -> Result<Vec<SessionEntry>> {
        if let Some(entries) = self.cache.read().get(session_id) {
            return Ok(entries.clone());
        }
        let entries = self.read_from_disk(session_id)?;
        self.cache.write().insert(session_id.to_string(), entries.clone());
        Ok(entries)
    }
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn load_session(&self, session_id: &str) -> Result<AgentState> {
        let entries = self.entries_cached(session_id)?;
        Ok(reconstruct_state(&entries, session_id))
    }

    async fn append_session_entry(&self, session_id: &str, entry: SessionEntry) -> Result<()> {
        let line = serde_json::to_string(&entry)?;
        let path = self.path_for(session_id);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::Io)?;
        writeln!(file, "{line}").map_err(Error::Io)?;

        let mut cache = self.cache.write();
        cache.entry(session_id.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn session_entries(
        &self,
        session_id: &str,
        start: usize,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEntry>> {
        let entries = self.entries_cached(session_id)?;
        if start >= entries.len() {
            return Ok(Vec::new());
        }
        let end = match limit {
            Some(l) => (start + l).min(entries.len()),
            None => entries.len(),
        };
        Ok(entries[start..end].to_vec())
    }

    async fn session_entry_count(&self, session_id: &str) -> Result<usize> {
        Ok(self.entries_cached(session_id)?.len())
    }

    async fn forget_session(&self, session_id: &str) -> Result<()> {
        self.cache.write().remove(session_id);
        let path = self.path_for(session_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::message::Message;

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sa-sessions-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let store = JsonlSessionStore::new(tempdir()).unwrap();
        store
            .append_session_entry("s1", SessionEntry::delta(vec![Message::user_text("hi")], 0.0))
            .await
            .unwrap();

        let state = store.load_session("s1").await.unwrap();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(store.session_entry_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn entries_survive_a_fresh_store_reading_the_same_directory() {
        let dir = tempdir();
        {
            let store = JsonlSessionStore::new(&dir).unwrap();
            store
                .append_session_entry("s1", SessionEntry::delta(vec![Message::user_text("hi")], 0.0))
                .await
                .unwrap();
        }

        let reopened = JsonlSessionStore::new(&dir).unwrap();
        let state = reopened.load_session("s1").await.unwrap();
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn compaction_entry_replaces_prior_messages_on_replay() {
        let store = JsonlSessionStore::new(tempdir()).unwrap();
        store
            .append_session_entry("s1", SessionEntry::delta(vec![Message::user_text("first")], 0.0))
            .await
            .unwrap();
        store
            .append_session_entry(
                "s1",
                SessionEntry::compaction(vec![Message::user_text("summary")], 1.0),
            )
            .await
            .unwrap();

        let state = store.load_session("s1").await.unwrap();
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn forget_session_removes_the_file_and_is_idempotent() {
        let store = JsonlSessionStore::new(tempdir()).unwrap();
        store
            .append_session_entry("s1", SessionEntry::delta(vec![Message::user_text("hi")], 0.0))
            .await
            .unwrap();

        store.forget_session("s1").await.unwrap();
        store.forget_session("s1").await.unwrap();
        assert_eq!(store.session_entry_count("s1").await.unwrap(), 0);
    }
}
