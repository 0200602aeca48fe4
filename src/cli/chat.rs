use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Result, bail};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::{mpsc, watch};

use super::open_store;
use crate::chat::reasoning::ReasoningContent;
use crate::chat::{
    ChatEvent, GenerationManager, GenerationOutcome, Message, SessionStore, SubmitError,
    Submission, Submitter,
};
use crate::core::AppConfig;
use crate::openai::{CompletionBackend, OpenAiClient};

const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// Prints only the new part of a streaming message. Reasoning and
/// answer buffers only ever grow so byte offsets stay valid.
#[derive(Default)]
struct StreamPrinter {
    reasoning_len: usize,
    answer_len: usize,
}

impl StreamPrinter {
    fn printed_anything(&self) -> bool {
        self.reasoning_len > 0 || self.answer_len > 0
    }

    fn print(&mut self, content: &ReasoningContent) {
        let mut out = io::stdout().lock();

        if let Some(reasoning) = &content.reasoning {
            if self.reasoning_len == 0 {
                let _ = write!(out, "{}thinking: ", DIM);
            }
            let new = reasoning.get(self.reasoning_len..).unwrap_or_default();
            let _ = write!(out, "{}{}{}", DIM, new, RESET);
            self.reasoning_len = reasoning.len();
        }

        if !content.answer.is_empty() {
            if self.answer_len == 0 && self.reasoning_len > 0 {
                let _ = write!(out, "\n\n");
            }
            let new = content.answer.get(self.answer_len..).unwrap_or_default();
            let _ = write!(out, "{}", new);
            self.answer_len = content.answer.len();
        }

        let _ = out.flush();
    }
}

/// Mirrors the foreground session's messages the way a UI would.
fn apply_event(messages: &mut Vec<Message>, event: &ChatEvent) {
    match event {
        ChatEvent::MessageAppended { message, .. } => messages.push(message.clone()),
        ChatEvent::MessageUpdated { message, .. }
        | ChatEvent::GenerationFinished { message, .. } => {
            if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
                existing.content = message.content.clone();
            } else {
                messages.push(message.clone());
            }
        }
        ChatEvent::LoadingChanged { .. } | ChatEvent::SessionsChanged { .. } => {}
    }
}

pub async fn run(
    config: AppConfig,
    session_id: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let model = model.unwrap_or_else(|| config.default_model.clone());
    if model.trim().is_empty() {
        bail!("No model selected. Pass --model or set LMCHAT_MODEL");
    }

    let backend: Arc<dyn CompletionBackend> = Arc::new(OpenAiClient::from_config(&config));
    let store = open_store(&config, backend.clone())?;
    let session_id = session_id.unwrap_or_else(SessionStore::new_session_id);

    // This loop is the UI so it owns which session is in the foreground
    let (_foreground, foreground_rx) = watch::channel(Some(session_id.clone()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = GenerationManager::builder(backend, store.clone(), foreground_rx, tx)
        .idle_timeout(config.idle_timeout)
        .temperature(config.temperature)
        .build();
    let submitter = Submitter::new(manager);

    let mut messages = store.load_transcript(&session_id);
    println!("Session {} ({} messages) using {}", session_id, messages.len(), model);

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(">>> ");
        match readline {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                let mut input = line;
                let submission = Submission {
                    session_id: &session_id,
                    prior_messages: messages.clone(),
                    input: &mut input,
                    model_id: &model,
                };
                let handle = match submitter.submit(submission) {
                    Ok(handle) => handle,
                    Err(SubmitError::EmptyInput) => continue,
                    Err(e) => {
                        println!("Error: {}", e);
                        continue;
                    }
                };

                let mut printer = StreamPrinter::default();
                loop {
                    tokio::select! {
                        event = rx.recv() => {
                            let Some(event) = event else { break };
                            apply_event(&mut messages, &event);
                            match event {
                                ChatEvent::MessageUpdated { content, .. } => printer.print(&content),
                                ChatEvent::GenerationFinished { message, outcome, .. } => {
                                    match outcome {
                                        _ if !printer.printed_anything() => println!("{}", message.content),
                                        GenerationOutcome::Completed => println!(),
                                        GenerationOutcome::Aborted => println!("\n[Generation stopped]"),
                                        GenerationOutcome::Failed(reason) => {
                                            println!("\n[Connection interrupted: {}]", reason)
                                        }
                                    }
                                    break;
                                }
                                _ => {}
                            }
                        }
                        _ = tokio::signal::ctrl_c() => {
                            submitter.stop_foreground();
                        }
                    }
                }

                // Metadata and title are written after the message
                // is final, wait so the next turn sees them
                handle.wait().await;
                while let Ok(event) = rx.try_recv() {
                    apply_event(&mut messages, &event);
                }
            }
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}
