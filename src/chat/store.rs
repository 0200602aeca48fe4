use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Error, Result, anyhow};
use uuid::Uuid;

use super::db::KvStore;
use super::models::{ChatMetadata, Message, NEW_CHAT_TITLE, now_millis};
use super::title::TitleGenerator;

pub const SESSIONS_INDEX_KEY: &str = "sessions:index";

pub fn transcript_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataUpdate {
    pub title: Option<String>,
    pub date: Option<i64>,
}

/// Durable storage of session transcripts and the session index.
///
/// Reads never fail: missing or corrupt values are treated as empty
/// so a bad write can't brick the UI. Writes replace whole values.
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    titles: TitleGenerator,
    // Serializes read-modify-write of the index between tasks
    index_lock: Arc<Mutex<()>>,
    // Sessions with a title request in flight
    titling: Arc<Mutex<HashSet<String>>>,
}

/// Held while a session's title is being generated. Dropping it lets
/// a later exchange try again if the title didn't stick.
struct TitleClaim {
    titling: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for TitleClaim {
    fn drop(&mut self) {
        self.titling
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.session_id);
    }
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, titles: TitleGenerator) -> Self {
        Self {
            kv,
            titles,
            index_lock: Arc::new(Mutex::new(())),
            titling: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn new_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn load_transcript(&self, session_id: &str) -> Vec<Message> {
        let key = transcript_key(session_id);
        match self.kv.get(&key) {
            Ok(Some(data)) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed transcript {}: {}", key, e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("Failed to read transcript {}: {}", key, e);
                Vec::new()
            }
        }
    }

    pub fn save_transcript(&self, session_id: &str, messages: &[Message]) -> Result<(), Error> {
        let data = serde_json::to_string(messages)?;
        self.kv.set(&transcript_key(session_id), &data)
    }

    /// All sessions, most recently active first.
    pub fn list_sessions(&self) -> Vec<ChatMetadata> {
        let mut sessions: Vec<ChatMetadata> = match self.kv.get(SESSIONS_INDEX_KEY) {
            Ok(Some(data)) => serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed session index: {}", e);
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("Failed to read session index: {}", e);
                Vec::new()
            }
        };
        sessions.sort_by(|a, b| b.date.cmp(&a.date));
        sessions
    }

    pub fn find_session(&self, session_id: &str) -> Option<ChatMetadata> {
        self.list_sessions().into_iter().find(|s| s.id == session_id)
    }

    fn write_index(&self, mut sessions: Vec<ChatMetadata>) -> Result<Vec<ChatMetadata>, Error> {
        sessions.sort_by(|a, b| b.date.cmp(&a.date));
        self.kv
            .set(SESSIONS_INDEX_KEY, &serde_json::to_string(&sessions)?)?;
        Ok(sessions)
    }

    /// Creates the session's index entry on first call and updates it
    /// in place after that. Fields left as `None` keep their value.
    pub fn upsert_metadata(
        &self,
        session_id: &str,
        update: MetadataUpdate,
    ) -> Result<ChatMetadata, Error> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| anyhow!("session index lock poisoned"))?;

        let mut sessions = self.list_sessions();
        let entry = match sessions.iter().position(|s| s.id == session_id) {
            Some(idx) => {
                let meta = &mut sessions[idx];
                if let Some(title) = update.title {
                    meta.title = title;
                }
                if let Some(date) = update.date {
                    meta.date = date;
                }
                meta.clone()
            }
            None => {
                let meta = ChatMetadata {
                    id: session_id.to_string(),
                    title: update.title.unwrap_or_else(|| NEW_CHAT_TITLE.to_string()),
                    date: update.date.unwrap_or_else(now_millis),
                };
                sessions.push(meta.clone());
                meta
            }
        };
        self.write_index(sessions)?;
        Ok(entry)
    }

    /// Persists a transcript after an exchange and refreshes the
    /// session's index entry.
    ///
    /// `should_update_date` is set when a generation actually produced
    /// something (completed or failed) as opposed to being stopped or
    /// merely re-saved. Only then is the session bumped to the top of
    /// the list, and only then is a title generated, once, while the
    /// session still has the placeholder title.
    pub async fn save_history(
        &self,
        session_id: &str,
        messages: &[Message],
        should_update_date: bool,
        model_id: &str,
    ) -> Result<Vec<ChatMetadata>, Error> {
        if messages.is_empty() {
            return Ok(self.list_sessions());
        }

        self.save_transcript(session_id, messages)?;
        self.record_exchange(session_id, messages, should_update_date, model_id)
            .await
    }

    /// The metadata half of `save_history`, for callers that already
    /// persisted the transcript.
    pub async fn record_exchange(
        &self,
        session_id: &str,
        messages: &[Message],
        should_update_date: bool,
        model_id: &str,
    ) -> Result<Vec<ChatMetadata>, Error> {
        let (existing, claim) = self.claim_title(session_id, messages, should_update_date)?;

        let title = match &claim {
            Some(_) => Some(self.titles.generate_title(messages, model_id).await),
            None => None,
        };
        let date = (should_update_date || existing.is_none()).then(now_millis);

        // The index is re-read here, other sessions may have written
        // it while the title was being generated
        self.upsert_metadata(session_id, MetadataUpdate { title, date })?;
        drop(claim);
        Ok(self.list_sessions())
    }

    /// Reads the session's entry and, if it still needs a title and no
    /// other exchange is already generating one, claims the title for
    /// this exchange. Both happen under the index lock so the claim is
    /// only released once the generated title is in the index.
    fn claim_title(
        &self,
        session_id: &str,
        messages: &[Message],
        should_update_date: bool,
    ) -> Result<(Option<ChatMetadata>, Option<TitleClaim>), Error> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| anyhow!("session index lock poisoned"))?;

        let existing = self.find_session(session_id);
        let needs_title = messages.len() >= 2
            && should_update_date
            && existing.as_ref().is_none_or(|s| s.has_placeholder_title());
        if !needs_title {
            return Ok((existing, None));
        }

        let claimed = self
            .titling
            .lock()
            .map_err(|_| anyhow!("title claim lock poisoned"))?
            .insert(session_id.to_string());
        if !claimed {
            tracing::debug!("Title already being generated for session {}", session_id);
            return Ok((existing, None));
        }

        let claim = TitleClaim {
            titling: self.titling.clone(),
            session_id: session_id.to_string(),
        };
        Ok((existing, Some(claim)))
    }

    pub async fn generate_title(&self, messages: &[Message], model_id: &str) -> String {
        self.titles.generate_title(messages, model_id).await
    }

    pub fn delete_session(&self, session_id: &str) -> Result<Vec<ChatMetadata>, Error> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| anyhow!("session index lock poisoned"))?;

        self.kv.remove(&transcript_key(session_id))?;
        let sessions = self
            .list_sessions()
            .into_iter()
            .filter(|s| s.id != session_id)
            .collect();
        self.write_index(sessions)
    }

    pub fn delete_all_sessions(&self) -> Result<(), Error> {
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| anyhow!("session index lock poisoned"))?;

        for session in self.list_sessions() {
            self.kv.remove(&transcript_key(&session.id))?;
        }
        self.kv.set(SESSIONS_INDEX_KEY, "[]")
    }
}
