use super::manager::{GenerationHandle, GenerationManager};
use super::models::Message;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("No model selected")]
    NoModelSelected,
    #[error("Message is empty")]
    EmptyInput,
    #[error("A response is already being generated for session {0}")]
    AlreadyGenerating(String),
}

/// What the UI hands over when the user hits send.
pub struct Submission<'a> {
    pub session_id: &'a str,
    pub prior_messages: Vec<Message>,
    /// The input box. Cleared once the submission is accepted.
    pub input: &'a mut String,
    pub model_id: &'a str,
}

/// Single entry point for sending a message.
#[derive(Clone)]
pub struct Submitter {
    manager: GenerationManager,
}

impl Submitter {
    pub fn new(manager: GenerationManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &GenerationManager {
        &self.manager
    }

    pub fn submit(&self, submission: Submission<'_>) -> Result<GenerationHandle, SubmitError> {
        // Copied before anything else happens, the user may switch
        // sessions while the request is in flight
        let session_id = submission.session_id.to_string();

        if submission.model_id.trim().is_empty() {
            return Err(SubmitError::NoModelSelected);
        }
        let text = submission.input.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        if self.manager.is_generating(&session_id) {
            return Err(SubmitError::AlreadyGenerating(session_id));
        }

        let user_message = Message::user(text);
        submission.input.clear();

        self.manager.start(
            &session_id,
            submission.prior_messages,
            user_message,
            submission.model_id,
        )
    }

    pub fn stop(&self, session_id: &str) -> bool {
        self.manager.stop(session_id)
    }

    /// Stops whatever is generating in the session the user is looking at.
    pub fn stop_foreground(&self) -> bool {
        match self.manager.foreground_session() {
            Some(session_id) => self.manager.stop(&session_id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::db::MemoryStore;
    use crate::chat::store::SessionStore;
    use crate::chat::title::TitleGenerator;
    use crate::openai::{ByteStream, CompletionBackend, CompletionRequest};
    use anyhow::Error;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    struct NeverBackend;

    #[async_trait]
    impl CompletionBackend for NeverBackend {
        async fn stream_completion(
            &self,
            _request: &CompletionRequest,
        ) -> Result<ByteStream, Error> {
            Ok(Box::pin(stream::pending::<Result<Vec<u8>, Error>>()))
        }
    }

    fn submitter() -> (Submitter, watch::Sender<Option<String>>) {
        let backend: Arc<dyn CompletionBackend> = Arc::new(NeverBackend);
        let store = SessionStore::new(
            Arc::new(MemoryStore::new()),
            TitleGenerator::new(backend.clone()),
        );
        let (fg_tx, fg_rx) = watch::channel(Some("s1".to_string()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = GenerationManager::builder(backend, store, fg_rx, tx).build();
        (Submitter::new(manager), fg_tx)
    }

    #[tokio::test]
    async fn test_rejects_missing_model() {
        let (submitter, _fg) = submitter();
        let mut input = "Hello".to_string();
        let result = submitter.submit(Submission {
            session_id: "s1",
            prior_messages: vec![],
            input: &mut input,
            model_id: " ",
        });
        assert_eq!(result.err(), Some(SubmitError::NoModelSelected));
        assert_eq!(input, "Hello");
    }

    #[tokio::test]
    async fn test_rejects_blank_input() {
        let (submitter, _fg) = submitter();
        let mut input = "  \n ".to_string();
        let result = submitter.submit(Submission {
            session_id: "s1",
            prior_messages: vec![],
            input: &mut input,
            model_id: "m",
        });
        assert_eq!(result.err(), Some(SubmitError::EmptyInput));
        assert!(!submitter.manager().is_generating("s1"));
    }

    #[tokio::test]
    async fn test_clears_input_and_rejects_resubmission() {
        let (submitter, _fg) = submitter();
        let mut input = "  Hello  ".to_string();
        let handle = submitter
            .submit(Submission {
                session_id: "s1",
                prior_messages: vec![],
                input: &mut input,
                model_id: "m",
            })
            .unwrap();
        assert_eq!(input, "");
        assert_eq!(handle.session_id, "s1");
        assert!(submitter.manager().is_generating("s1"));

        let mut again = "Hello again".to_string();
        let result = submitter.submit(Submission {
            session_id: "s1",
            prior_messages: vec![],
            input: &mut again,
            model_id: "m",
        });
        assert_eq!(
            result.err(),
            Some(SubmitError::AlreadyGenerating("s1".to_string()))
        );
        assert_eq!(again, "Hello again");

        assert!(submitter.stop_foreground());
        handle.wait().await;
        assert!(!submitter.manager().is_generating("s1"));
    }

    #[tokio::test]
    async fn test_stop_foreground_targets_visible_session() {
        let (submitter, fg) = submitter();
        let mut input = "Hello".to_string();
        let handle = submitter
            .submit(Submission {
                session_id: "s1",
                prior_messages: vec![],
                input: &mut input,
                model_id: "m",
            })
            .unwrap();

        fg.send_replace(Some("s2".to_string()));
        assert!(!submitter.stop_foreground());
        assert!(submitter.manager().is_generating("s1"));

        assert!(submitter.stop("s1"));
        let transcript = {
            handle.wait().await;
            submitter.manager().store().load_transcript("s1")
        };
        assert_eq!(transcript[1].content, "Generation was stopped.");
    }
}
