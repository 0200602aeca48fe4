//! Reusable prompts using Handlebars for templating. Handlebars adds
//! additional security controls since it can't do much out of the box
//! without registering your own helpers. User input is interpolated
//! into these prompts so strict mode stays on.

use std::fmt;

use handlebars::Handlebars;

#[derive(Debug)]
pub enum Prompt {
    ChatTitle,
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

const CHAT_TITLE_PROMPT: &str = r#"Generate a concise 5-word title for a chat. The user's first message was: "{{{first_message}}}".

Rules:
- Exactly 5 words or fewer
- Capture the main topic/intent
- Be descriptive but brief
- Only respond with the title, nothing else

Title:"#;

pub fn templates<'a>() -> Handlebars<'a> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry
        .register_template_string(&Prompt::ChatTitle.to_string(), CHAT_TITLE_PROMPT)
        .expect("Failed to register template");
    registry
}
