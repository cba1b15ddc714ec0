//! Prompt formatting for engines without a chat template.

use crate::request::{ChatMessage, ChatRole};

/// Format the recent history and the new prompt in the Zephyr-style chat
/// layout used by small local chat models.
///
/// Callers pass the already windowed history (see
/// [`OperationRequest::recent_history`](crate::OperationRequest::recent_history)).
/// System and unknown roles are dropped.
pub fn format_chat_prompt(history: &[ChatMessage], prompt: &str) -> String {
    let mut formatted = String::new();
    for message in history {
        let tag = match message.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::System | ChatRole::Other => continue,
        };
        formatted.push_str(&format!("<|{}|>\n{}</s>\n", tag, message.content));
    }
    formatted.push_str(&format!("<|user|>\n{}</s>\n<|assistant|>\n", prompt));
    formatted
}

/// Remove an echoed prompt from the front of a whole-sequence decode.
pub fn strip_prompt_echo(text: &str, prompt: &str) -> String {
    match text.strip_prefix(prompt) {
        Some(rest) if !prompt.is_empty() => rest.trim().to_string(),
        _ => text.to_string(),
    }
}
