//! Test utilities for integration tests
#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use lmchat::chat::db::{KvStore, MemoryStore};
use lmchat::chat::{ChatEvent, GenerationManager, SessionStore, TitleGenerator};
use lmchat::openai::{ByteStream, CompletionBackend, CompletionRequest, Role};

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// An SSE frame carrying answer text.
pub fn content_frame(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "delta": { "content": text } }] })
    )
}

/// An SSE frame carrying reasoning text the way LM Studio sends it.
pub fn reasoning_frame(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "delta": { "reasoning_content": text } }] })
    )
}

/// What a scripted backend does with a request.
#[derive(Clone, Debug)]
pub enum Reply {
    /// Yields each chunk, waiting `delay` before every one, then either
    /// ends or fails with `error`.
    Chunks {
        chunks: Vec<String>,
        delay: Duration,
        error: Option<String>,
    },
    /// Headers arrive but no body ever does.
    Silent,
    /// The request itself fails, like a non-2xx status.
    Refused(String),
}

impl Reply {
    pub fn chunks<S: Into<String>>(chunks: impl IntoIterator<Item = S>) -> Self {
        Reply::Chunks {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            error: None,
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Reply::Chunks { chunks, error, .. } => Reply::Chunks {
                chunks,
                delay,
                error,
            },
            other => other,
        }
    }

    pub fn then_error(self, message: &str) -> Self {
        match self {
            Reply::Chunks { chunks, delay, .. } => Reply::Chunks {
                chunks,
                delay,
                error: Some(message.to_string()),
            },
            other => other,
        }
    }
}

/// Replies keyed by the text of the request's last message, so
/// concurrent sessions get deterministic streams regardless of task
/// scheduling. Every request is recorded.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<HashMap<String, Reply>>,
    fallback: Mutex<Option<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, last_message: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(last_message.to_string(), reply);
        self
    }

    pub fn otherwise(self, reply: Reply) -> Self {
        *self.fallback.lock().unwrap() = Some(reply);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream_completion(&self, request: &CompletionRequest) -> Result<ByteStream, Error> {
        self.requests.lock().unwrap().push(request.clone());

        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&last)
            .cloned()
            .or_else(|| self.fallback.lock().unwrap().clone())
            .ok_or_else(|| anyhow!("No scripted reply for {:?}", last))?;

        match reply {
            Reply::Refused(message) => Err(anyhow!(message)),
            Reply::Silent => Ok(Box::pin(
                futures_util::stream::pending::<Result<Vec<u8>, Error>>(),
            )),
            Reply::Chunks {
                chunks,
                delay,
                error,
            } => Ok(Box::pin(scripted_stream(chunks, delay, error))),
        }
    }
}

fn scripted_stream(
    chunks: Vec<String>,
    delay: Duration,
    error: Option<String>,
) -> impl Stream<Item = Result<Vec<u8>, Error>> + Send + 'static {
    async_stream::try_stream! {
        for chunk in chunks {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            yield chunk.into_bytes();
        }
        if let Some(message) = error {
            Err::<(), Error>(anyhow!(message))?;
        }
    }
}

/// Memory backed store that remembers every key written to it.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl KvStore for RecordingStore {
    fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.writes.lock().unwrap().push(key.to_string());
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.writes.lock().unwrap().push(key.to_string());
        self.inner.remove(key)
    }
}

/// Title backend that always answers with `title`.
pub fn title_backend(title: &str) -> ScriptedBackend {
    ScriptedBackend::new().otherwise(Reply::chunks([content_frame(title), DONE_FRAME.to_string()]))
}

pub struct Harness {
    pub manager: GenerationManager,
    pub store: SessionStore,
    pub kv: Arc<RecordingStore>,
    pub chat: Arc<ScriptedBackend>,
    pub titles: Arc<ScriptedBackend>,
    pub foreground: watch::Sender<Option<String>>,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
}

impl Harness {
    pub fn drain_events(&mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn show(&self, session_id: Option<&str>) {
        self.foreground.send_replace(session_id.map(str::to_string));
    }
}

/// Wires a manager to scripted chat and title backends over a
/// recording in-memory store.
pub fn harness(
    chat: ScriptedBackend,
    titles: ScriptedBackend,
    foreground: Option<&str>,
    idle_timeout: Duration,
) -> Harness {
    let chat = Arc::new(chat);
    let titles = Arc::new(titles);
    let kv = Arc::new(RecordingStore::default());
    let store = SessionStore::new(kv.clone(), TitleGenerator::new(titles.clone()));
    let (fg_tx, fg_rx) = watch::channel(foreground.map(str::to_string));
    let (tx, rx) = mpsc::unbounded_channel();
    let manager = GenerationManager::builder(chat.clone(), store.clone(), fg_rx, tx)
        .idle_timeout(idle_timeout)
        .build();

    Harness {
        manager,
        store,
        kv,
        chat,
        titles,
        foreground: fg_tx,
        events: rx,
    }
}

/// All user message text in a request, joined by newlines.
pub fn prompt_text(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n")
}
