//! Per-generation state machine.
//!
//! `Generating` accumulates reasoning and answer text from stream
//! deltas. The stream ending, being cancelled or failing moves the
//! task to a terminal state which fixes the final message text.
//! Transitions are pure so they can be tested without a network.
use super::models::Message;
use super::reasoning::ReasoningContent;
use crate::openai::StreamDelta;

pub const STOPPED_MARKER: &str = "\n\n*[Generation stopped]*";
pub const STOPPED_EMPTY: &str = "Generation was stopped.";
pub const INTERRUPTED_MARKER: &str = "\n\n*[Connection interrupted]*";
pub const FAILED_EMPTY: &str = "Error: Could not generate response.";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamBuffers {
    pub reasoning: String,
    pub content: String,
}

impl StreamBuffers {
    pub fn is_empty(&self) -> bool {
        self.reasoning.is_empty() && self.content.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    Delta(StreamDelta),
    StreamEnded,
    Cancelled,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationState {
    Generating(StreamBuffers),
    Completed(StreamBuffers),
    Aborted(StreamBuffers),
    Failed {
        buffers: StreamBuffers,
        reason: String,
    },
}

impl Default for GenerationState {
    fn default() -> Self {
        Self::Generating(StreamBuffers::default())
    }
}

/// How a generation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Aborted,
    Failed(String),
}

impl GenerationOutcome {
    /// A stopped generation didn't produce anything worth re-sorting
    /// the session list for.
    pub fn should_update_date(&self) -> bool {
        !matches!(self, GenerationOutcome::Aborted)
    }
}

impl GenerationState {
    pub fn next(self, event: TaskEvent) -> Self {
        use GenerationState::*;

        match (self, event) {
            (Generating(mut buffers), TaskEvent::Delta(StreamDelta::Reasoning(text))) => {
                buffers.reasoning.push_str(&text);
                Generating(buffers)
            }
            (Generating(mut buffers), TaskEvent::Delta(StreamDelta::Content(text))) => {
                buffers.content.push_str(&text);
                Generating(buffers)
            }
            (Generating(buffers), TaskEvent::StreamEnded) => Completed(buffers),
            (Generating(buffers), TaskEvent::Cancelled) => Aborted(buffers),
            (Generating(buffers), TaskEvent::Failed(reason)) => Failed { buffers, reason },
            // Terminal states are final
            (state, event) => {
                tracing::trace!("Ignoring {:?} for finalized generation", event);
                state
            }
        }
    }

    pub fn buffers(&self) -> &StreamBuffers {
        match self {
            Self::Generating(b) | Self::Completed(b) | Self::Aborted(b) => b,
            Self::Failed { buffers, .. } => buffers,
        }
    }

    pub fn is_finalized(&self) -> bool {
        !matches!(self, Self::Generating(_))
    }

    pub fn outcome(&self) -> Option<GenerationOutcome> {
        match self {
            Self::Generating(_) => None,
            Self::Completed(_) => Some(GenerationOutcome::Completed),
            Self::Aborted(_) => Some(GenerationOutcome::Aborted),
            Self::Failed { reason, .. } => Some(GenerationOutcome::Failed(reason.clone())),
        }
    }

    pub fn content(&self) -> ReasoningContent {
        let buffers = self.buffers();
        ReasoningContent::from_parts(&buffers.reasoning, &buffers.content, self.is_finalized())
    }

    /// The message text for this state. Stopped and failed generations
    /// keep whatever was received and get a marker appended; the
    /// reasoning block is always closed before the marker.
    pub fn display_text(&self) -> String {
        let rendered = self.content().render();
        match self {
            Self::Generating(_) | Self::Completed(_) => rendered,
            Self::Aborted(buffers) if buffers.is_empty() => STOPPED_EMPTY.to_string(),
            Self::Aborted(_) => format!("{}{}", rendered, STOPPED_MARKER),
            Self::Failed { buffers, .. } if buffers.is_empty() => FAILED_EMPTY.to_string(),
            Self::Failed { .. } => format!("{}{}", rendered, INTERRUPTED_MARKER),
        }
    }
}

/// An in-flight generation for one session.
#[derive(Clone, Debug)]
pub struct GenerationTask {
    pub session_id: String,
    pub assistant_message_id: String,
    state: GenerationState,
}

impl GenerationTask {
    pub fn new(session_id: &str, assistant_message_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            assistant_message_id: assistant_message_id.to_string(),
            state: GenerationState::default(),
        }
    }

    pub fn apply(&mut self, event: TaskEvent) {
        let state = std::mem::take(&mut self.state);
        self.state = state.next(event);
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn message(&self) -> Message {
        Message::assistant(&self.assistant_message_id, &self.state.display_text())
    }
}
