use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::models::{ChatMetadata, Message, next_message_id};
use super::reasoning::ReasoningContent;
use super::store::SessionStore;
use super::submit::SubmitError;
use super::task::{GenerationOutcome, GenerationTask, TaskEvent};
use crate::openai::{CompletionBackend, CompletionRequest, decode_stream, with_idle_timeout};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything the UI layer needs to mirror generation progress. Only
/// the foreground session gets message and loading events; background
/// sessions are written straight to the store.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    MessageAppended {
        session_id: String,
        message: Message,
    },
    MessageUpdated {
        session_id: String,
        message: Message,
        content: ReasoningContent,
    },
    GenerationFinished {
        session_id: String,
        message: Message,
        outcome: GenerationOutcome,
    },
    LoadingChanged {
        session_id: String,
        loading: bool,
    },
    SessionsChanged {
        sessions: Vec<ChatMetadata>,
    },
}

impl ChatEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::MessageAppended { session_id, .. }
            | Self::MessageUpdated { session_id, .. }
            | Self::GenerationFinished { session_id, .. }
            | Self::LoadingChanged { session_id, .. } => Some(session_id),
            Self::SessionsChanged { .. } => None,
        }
    }
}

struct TaskHandle {
    assistant_message_id: String,
    cancel: CancellationToken,
    generation: u64,
}

/// Returned to whoever started a generation. Dropping it does not
/// cancel anything.
#[derive(Debug)]
pub struct GenerationHandle {
    pub session_id: String,
    pub assistant_message_id: String,
    join: JoinHandle<GenerationOutcome>,
}

impl GenerationHandle {
    /// Waits until the generation is finalized and persisted.
    pub async fn wait(self) -> GenerationOutcome {
        self.join
            .await
            .unwrap_or_else(|e| GenerationOutcome::Failed(e.to_string()))
    }
}

struct Inner {
    backend: Arc<dyn CompletionBackend>,
    store: SessionStore,
    tasks: Mutex<HashMap<String, TaskHandle>>,
    foreground: watch::Receiver<Option<String>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    idle_timeout: Duration,
    temperature: Option<f32>,
    next_generation: AtomicU64,
}

/// Owns every in-flight generation, at most one per session id.
///
/// The UI tells the manager which session is in the foreground via
/// the `watch` channel it owns. That is checked again on every chunk,
/// so switching sessions mid-stream moves output from UI events to
/// the store without dropping anything.
///
/// Use `GenerationManager::builder()` to construct one.
#[derive(Clone)]
pub struct GenerationManager {
    inner: Arc<Inner>,
}

impl GenerationManager {
    pub fn builder(
        backend: Arc<dyn CompletionBackend>,
        store: SessionStore,
        foreground: watch::Receiver<Option<String>>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> GenerationManagerBuilder {
        GenerationManagerBuilder {
            backend,
            store,
            foreground,
            events,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            temperature: None,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn foreground_session(&self) -> Option<String> {
        self.inner.foreground.borrow().clone()
    }

    fn is_foreground(&self, session_id: &str) -> bool {
        self.inner.foreground.borrow().as_deref() == Some(session_id)
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
        // Nothing panics while holding this lock
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_generating(&self, session_id: &str) -> bool {
        self.tasks().contains_key(session_id)
    }

    /// The assistant message currently being generated for a session.
    pub fn pending_message_id(&self, session_id: &str) -> Option<String> {
        self.tasks()
            .get(session_id)
            .map(|t| t.assistant_message_id.clone())
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.tasks().keys().cloned().collect()
    }

    fn emit(&self, event: ChatEvent) {
        // The UI may have gone away, generation still has to be
        // persisted so the result is ignored
        let _ = self.inner.events.send(event);
    }

    /// Signals the session's generation to stop. Returns false if
    /// nothing was running.
    pub fn stop(&self, session_id: &str) -> bool {
        match self.tasks().get(session_id) {
            Some(task) => {
                tracing::debug!("Stopping generation for session {}", session_id);
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Same as `start` with a fresh user message built from `user_text`.
    pub fn submit(
        &self,
        session_id: &str,
        prior_messages: Vec<Message>,
        user_text: &str,
        model_id: &str,
    ) -> Result<GenerationHandle, SubmitError> {
        self.start(session_id, prior_messages, Message::user(user_text), model_id)
    }

    /// Appends `user_message` to the session and starts streaming the
    /// assistant's reply in a background task.
    ///
    /// Rejected if the session already has a generation running.
    pub fn start(
        &self,
        session_id: &str,
        prior_messages: Vec<Message>,
        user_message: Message,
        model_id: &str,
    ) -> Result<GenerationHandle, SubmitError> {
        let session_id = session_id.to_string();
        let assistant_message_id = next_message_id();
        let cancel = CancellationToken::new();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        {
            let mut tasks = self.tasks();
            if tasks.contains_key(&session_id) {
                return Err(SubmitError::AlreadyGenerating(session_id));
            }
            tasks.insert(
                session_id.clone(),
                TaskHandle {
                    assistant_message_id: assistant_message_id.clone(),
                    cancel: cancel.clone(),
                    generation,
                },
            );
        }

        let mut transcript = prior_messages;
        transcript.push(user_message.clone());

        if self.is_foreground(&session_id) {
            self.emit(ChatEvent::MessageAppended {
                session_id: session_id.clone(),
                message: user_message,
            });
            self.emit(ChatEvent::MessageAppended {
                session_id: session_id.clone(),
                message: Message::assistant(&assistant_message_id, ""),
            });
            self.emit(ChatEvent::LoadingChanged {
                session_id: session_id.clone(),
                loading: true,
            });
        } else if let Err(e) = self.inner.store.save_transcript(&session_id, &transcript) {
            tracing::error!("Failed to save transcript for session {}: {}", session_id, e);
        }

        let request = CompletionRequest::streaming(
            model_id,
            transcript.iter().map(Message::to_request).collect(),
        )
        .with_temperature(self.inner.temperature);

        tracing::debug!(
            "Starting generation {} for session {} with model {}",
            assistant_message_id,
            session_id,
            model_id
        );

        let task = GenerationTask::new(&session_id, &assistant_message_id);
        let manager = self.clone();
        let model_id = model_id.to_string();
        let join = tokio::spawn(async move {
            manager
                .run(task, transcript, request, model_id, cancel, generation)
                .await
        });

        Ok(GenerationHandle {
            session_id,
            assistant_message_id,
            join,
        })
    }

    async fn run(
        self,
        mut task: GenerationTask,
        transcript: Vec<Message>,
        request: CompletionRequest,
        model_id: String,
        cancel: CancellationToken,
        generation: u64,
    ) -> GenerationOutcome {
        let ending = self.drive(&mut task, &transcript, &request, &cancel).await;
        task.apply(ending);
        self.finalize(task, transcript, &model_id, generation).await
    }

    /// Streams the response into `task` until it ends, fails or is
    /// cancelled, and returns the event that ended it.
    async fn drive(
        &self,
        task: &mut GenerationTask,
        transcript: &[Message],
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> TaskEvent {
        let idle_timeout = self.inner.idle_timeout;

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TaskEvent::Cancelled,
            result = timeout(idle_timeout, self.inner.backend.stream_completion(request)) => {
                match result {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(e)) => return TaskEvent::Failed(format!("{:#}", e)),
                    Err(_) => return TaskEvent::Failed("idle timeout".to_string()),
                }
            }
        };

        // The idle timer runs on raw reads, keep-alives reset it too
        let mut deltas = pin!(decode_stream(with_idle_timeout(bytes, idle_timeout)));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TaskEvent::Cancelled,
                next = deltas.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    task.apply(TaskEvent::Delta(delta));
                    self.publish_progress(task, transcript);
                }
                Some(Err(e)) => return TaskEvent::Failed(format!("{:#}", e)),
                None => return TaskEvent::StreamEnded,
            }
        }
    }

    /// Routes the latest text to the UI or, if the user has moved on to
    /// another session, to the store.
    fn publish_progress(&self, task: &GenerationTask, transcript: &[Message]) {
        let message = task.message();
        if self.is_foreground(&task.session_id) {
            self.emit(ChatEvent::MessageUpdated {
                session_id: task.session_id.clone(),
                message,
                content: task.state().content(),
            });
        } else {
            let mut messages = transcript.to_vec();
            messages.push(message);
            if let Err(e) = self.inner.store.save_transcript(&task.session_id, &messages) {
                tracing::error!(
                    "Failed to save background progress for session {}: {}",
                    task.session_id,
                    e
                );
            }
        }
    }

    async fn finalize(
        &self,
        task: GenerationTask,
        mut transcript: Vec<Message>,
        model_id: &str,
        generation: u64,
    ) -> GenerationOutcome {
        let session_id = task.session_id.clone();
        let outcome = task
            .state()
            .outcome()
            .unwrap_or_else(|| GenerationOutcome::Failed("generation did not finish".to_string()));
        match &outcome {
            GenerationOutcome::Failed(reason) => {
                tracing::error!("Generation failed for session {}: {}", session_id, reason)
            }
            _ => tracing::debug!("Generation {:?} for session {}", outcome, session_id),
        }

        let message = task.message();
        transcript.push(message.clone());

        // Always written, whether or not the user is looking. This also
        // covers a user message that never made it to the store.
        if let Err(e) = self.inner.store.save_transcript(&session_id, &transcript) {
            tracing::error!("Failed to save transcript for session {}: {}", session_id, e);
        }
        self.unregister(&session_id, generation);

        if self.is_foreground(&session_id) {
            self.emit(ChatEvent::GenerationFinished {
                session_id: session_id.clone(),
                message,
                outcome: outcome.clone(),
            });
            self.emit(ChatEvent::LoadingChanged {
                session_id: session_id.clone(),
                loading: false,
            });
        }

        match self
            .inner
            .store
            .record_exchange(
                &session_id,
                &transcript,
                outcome.should_update_date(),
                model_id,
            )
            .await
        {
            Ok(sessions) => self.emit(ChatEvent::SessionsChanged { sessions }),
            Err(e) => tracing::error!(
                "Failed to update metadata for session {}: {}",
                session_id,
                e
            ),
        }

        outcome
    }

    fn unregister(&self, session_id: &str, generation: u64) {
        let mut tasks = self.tasks();
        if tasks
            .get(session_id)
            .is_some_and(|t| t.generation == generation)
        {
            tasks.remove(session_id);
        }
    }
}

pub struct GenerationManagerBuilder {
    backend: Arc<dyn CompletionBackend>,
    store: SessionStore,
    foreground: watch::Receiver<Option<String>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    idle_timeout: Duration,
    temperature: Option<f32>,
}

impl GenerationManagerBuilder {
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn build(self) -> GenerationManager {
        GenerationManager {
            inner: Arc::new(Inner {
                backend: self.backend,
                store: self.store,
                tasks: Mutex::new(HashMap::new()),
                foreground: self.foreground,
                events: self.events,
                idle_timeout: self.idle_timeout,
                temperature: self.temperature,
                next_generation: AtomicU64::new(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::MemoryStore;
    use crate::chat::title::TitleGenerator;
    use crate::openai::{ByteStream, OpenAiClient};
    use anyhow::Error;
    use async_trait::async_trait;
    use futures_util::stream;

    /// Replies with a fixed SSE body to every request.
    struct StaticBackend(&'static str);

    #[async_trait]
    impl CompletionBackend for StaticBackend {
        async fn stream_completion(
            &self,
            _request: &CompletionRequest,
        ) -> Result<ByteStream, Error> {
            let chunks: Vec<Result<Vec<u8>, Error>> = vec![Ok(self.0.as_bytes().to_vec())];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    fn manager_with(
        backend: Arc<dyn CompletionBackend>,
        foreground: Option<&str>,
    ) -> (
        GenerationManager,
        watch::Sender<Option<String>>,
        mpsc::UnboundedReceiver<ChatEvent>,
    ) {
        let store = SessionStore::new(
            Arc::new(MemoryStore::new()),
            TitleGenerator::new(backend.clone()),
        );
        let (fg_tx, fg_rx) = watch::channel(foreground.map(str::to_string));
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = GenerationManager::builder(backend, store, fg_rx, tx)
            .idle_timeout(Duration::from_secs(5))
            .build();
        (manager, fg_tx, rx)
    }

    #[tokio::test]
    async fn test_foreground_generation_emits_events() {
        let backend = Arc::new(StaticBackend(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi!\"}}]}\n\ndata: [DONE]\n\n",
        ));
        let (manager, _fg, mut rx) = manager_with(backend, Some("s1"));

        let handle = manager.submit("s1", vec![], "Hello", "m").unwrap();
        let assistant_id = handle.assistant_message_id.clone();
        assert_eq!(handle.wait().await, GenerationOutcome::Completed);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(
            &events[0],
            ChatEvent::MessageAppended { message, .. } if message.content == "Hello"
        ));
        assert!(matches!(
            &events[1],
            ChatEvent::MessageAppended { message, .. } if message.id == assistant_id
        ));
        assert!(matches!(
            &events[2],
            ChatEvent::LoadingChanged { loading: true, .. }
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::GenerationFinished { message, outcome: GenerationOutcome::Completed, .. }
                if message.content == "Hi!"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ChatEvent::LoadingChanged { loading: false, .. }
        )));
        assert!(matches!(
            events.last().unwrap(),
            ChatEvent::SessionsChanged { .. }
        ));
        assert!(!manager.is_generating("s1"));
    }

    #[tokio::test]
    async fn test_rejects_second_submission_for_same_session() {
        let backend = Arc::new(StaticBackend(""));
        let (manager, _fg, _rx) = manager_with(backend, None);

        let first = manager.submit("s1", vec![], "one", "m").unwrap();
        let second = manager.submit("s1", vec![], "two", "m");
        assert_eq!(
            second.err(),
            Some(SubmitError::AlreadyGenerating("s1".to_string()))
        );
        first.wait().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_with_error_message() {
        let backend = Arc::new(OpenAiClient::new(
            "http://127.0.0.1:9",
            "",
            Duration::from_secs(2),
        ));
        let (manager, _fg, _rx) = manager_with(backend, None);

        let outcome = manager.submit("s1", vec![], "Hello", "m").unwrap().wait().await;

        assert!(matches!(outcome, GenerationOutcome::Failed(_)));
        let transcript = manager.store().load_transcript("s1");
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].content, "Hello");
        assert_eq!(transcript[1].content, "Error: Could not generate response.");
    }

    #[tokio::test]
    async fn test_stop_without_task() {
        let backend = Arc::new(StaticBackend(""));
        let (manager, _fg, _rx) = manager_with(backend, None);
        assert!(!manager.stop("nothing"));
    }
}
