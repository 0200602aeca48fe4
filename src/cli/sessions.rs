use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{Local, TimeZone};

use super::open_store;
use crate::chat::reasoning::ReasoningContent;
use crate::chat::{ChatMetadata, SessionStore};
use crate::core::AppConfig;
use crate::openai::{OpenAiClient, Role};

fn store(config: &AppConfig) -> Result<SessionStore> {
    open_store(config, Arc::new(OpenAiClient::from_config(config)))
}

fn format_date(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn format_row(session: &ChatMetadata) -> String {
    format!("{}  {}  {}", format_date(session.date), session.id, session.title)
}

pub fn list(config: &AppConfig) -> Result<()> {
    let sessions = store(config)?.list_sessions();
    if sessions.is_empty() {
        println!("No saved sessions");
    }
    for session in sessions {
        println!("{}", format_row(&session));
    }
    Ok(())
}

pub fn show(config: &AppConfig, session_id: &str) -> Result<()> {
    let store = store(config)?;
    let Some(session) = store.find_session(session_id) else {
        bail!("Session {} not found", session_id);
    };

    println!("# {}\n", session.title);
    for message in store.load_transcript(session_id) {
        match message.role {
            Role::User => println!("> {}\n", message.content),
            Role::System => println!("[system] {}\n", message.content),
            Role::Assistant => {
                let content = ReasoningContent::parse(&message.content);
                if let Some(reasoning) = &content.reasoning {
                    println!("\x1b[2mthinking: {}\x1b[0m\n", reasoning.trim());
                }
                println!("{}\n", content.answer.trim());
            }
        }
    }
    Ok(())
}

pub fn delete(config: &AppConfig, session_id: Option<String>, all: bool) -> Result<()> {
    let store = store(config)?;
    match (session_id, all) {
        (_, true) => {
            store.delete_all_sessions()?;
            println!("Deleted all sessions");
        }
        (Some(id), false) => {
            store.delete_session(&id)?;
            println!("Deleted session {}", id);
        }
        (None, false) => bail!("Pass --id <session> or --all"),
    }
    Ok(())
}
