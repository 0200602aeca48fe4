use std::pin::pin;
use std::sync::{Arc, LazyLock};

use anyhow::{Error, Result};
use futures_util::StreamExt;
use regex::Regex;
use serde_json::json;

use super::models::{Message, NEW_CHAT_TITLE};
use crate::ai::prompt::{Prompt, templates};
use crate::openai::{
    CompletionBackend, CompletionRequest, RequestMessage, Role, StreamDelta, decode_stream,
};

const MAX_TITLE_CHARS: usize = 60;

// Models like to echo the trailing "Title:" from the prompt
static TITLE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^title:\s*").expect("Invalid title regex"));

/// Tidies up a raw model response into something usable as a session
/// title. Falls back to the placeholder when nothing is left.
pub fn clean_title(raw: &str) -> String {
    let stripped = TITLE_PREFIX.replace(raw.trim(), "");
    let title: String = stripped.trim().chars().take(MAX_TITLE_CHARS).collect();
    if title.is_empty() {
        NEW_CHAT_TITLE.to_string()
    } else {
        title
    }
}

/// Generates short session titles with a one-off completion request.
#[derive(Clone)]
pub struct TitleGenerator {
    backend: Arc<dyn CompletionBackend>,
}

impl TitleGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// Best effort: any failure yields the placeholder title.
    pub async fn generate_title(&self, messages: &[Message], model_id: &str) -> String {
        let Some(first_user_msg) = messages.iter().find(|m| m.role == Role::User) else {
            return NEW_CHAT_TITLE.to_string();
        };

        match self.request_title(&first_user_msg.content, model_id).await {
            Ok(raw) => {
                let title = clean_title(&raw);
                tracing::debug!("Generated title: {}", title);
                title
            }
            Err(e) => {
                tracing::error!("Error generating title: {}", e);
                NEW_CHAT_TITLE.to_string()
            }
        }
    }

    async fn request_title(&self, first_message: &str, model_id: &str) -> Result<String, Error> {
        let prompt = templates().render(
            &Prompt::ChatTitle.to_string(),
            &json!({ "first_message": first_message }),
        )?;
        let request = CompletionRequest::streaming(
            model_id,
            vec![RequestMessage::new(Role::User, &prompt)],
        );

        let bytes = self.backend.stream_completion(&request).await?;
        let mut deltas = pin!(decode_stream(bytes));
        let mut title = String::new();
        while let Some(delta) = deltas.next().await {
            // Reasoning models think out loud first, only the answer
            // is the title
            if let StreamDelta::Content(text) = delta? {
                title.push_str(&text);
            }
        }
        Ok(title)
    }
}
