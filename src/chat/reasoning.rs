//! Separates model "thinking" from the final answer.
//!
//! Assistant messages are stored as plain text where reasoning sits
//! inside a `<think>...</think>` block in front of the answer. While a
//! response is streaming the block may be open (no closing marker
//! yet). `ReasoningContent` is the structured form used everywhere in
//! the crate; the delimited string only exists at the storage and
//! display boundary.

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedReasoning {
    pub reasoning_content: String,
    pub main_content: String,
}

impl ParsedReasoning {
    /// The model is still reasoning and hasn't started answering.
    pub fn is_thinking(&self, finalized: bool) -> bool {
        !finalized && !self.reasoning_content.is_empty() && self.main_content.is_empty()
    }
}

/// Splits raw message text into reasoning and main content. Called at
/// stream-chunk frequency so it only does substring searches.
pub fn split_reasoning(content: &str) -> ParsedReasoning {
    if content.is_empty() {
        return ParsedReasoning::default();
    }

    let Some(open) = content.find(THINK_OPEN) else {
        return ParsedReasoning {
            reasoning_content: String::new(),
            main_content: content.to_string(),
        };
    };
    let inner_start = open + THINK_OPEN.len();

    match content[inner_start..].find(THINK_CLOSE) {
        Some(close_offset) => {
            let close = inner_start + close_offset;
            let after = close + THINK_CLOSE.len();
            let main = format!("{}{}", &content[..open], &content[after..]);
            ParsedReasoning {
                reasoning_content: content[inner_start..close].trim().to_string(),
                main_content: main.trim().to_string(),
            }
        }
        None => ParsedReasoning {
            reasoning_content: content[inner_start..].trim().to_string(),
            main_content: String::new(),
        },
    }
}

/// Structured assistant output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReasoningContent {
    pub reasoning: Option<String>,
    pub answer: String,
    /// Reasoning has started but its block is not closed yet
    pub reasoning_open: bool,
}

impl ReasoningContent {
    pub fn from_parts(reasoning: &str, answer: &str, finalized: bool) -> Self {
        let reasoning = (!reasoning.is_empty()).then(|| reasoning.to_string());
        let reasoning_open = reasoning.is_some() && answer.is_empty() && !finalized;
        Self {
            reasoning,
            answer: answer.to_string(),
            reasoning_open,
        }
    }

    /// Reads stored message text back into its structured form.
    pub fn parse(content: &str) -> Self {
        let has_close = content.contains(THINK_CLOSE);
        let parsed = split_reasoning(content);
        let reasoning = (!parsed.reasoning_content.is_empty()).then_some(parsed.reasoning_content);
        Self {
            reasoning_open: reasoning.is_some() && !has_close,
            reasoning,
            answer: parsed.main_content,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reasoning.is_none() && self.answer.is_empty()
    }

    pub fn is_thinking(&self) -> bool {
        self.reasoning_open
    }

    /// Produces the delimited text form. The block is left open only
    /// while reasoning is still streaming.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(reasoning) = &self.reasoning {
            out.push_str(THINK_OPEN);
            out.push_str(reasoning);
            if !self.reasoning_open {
                out.push_str(THINK_CLOSE);
            }
        }
        out.push_str(&self.answer);
        out
    }
}
