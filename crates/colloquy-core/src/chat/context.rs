//! Request context assembly.
//!
//! Turns a session's accepted history, its system prompt and the new turn
//! into the ordered, role-tagged message list sent to the completion
//! endpoint. Everything here is pure: no I/O, no mutation, safe to call once
//! per candidate model in compare mode.

use colloquy_types::chat::{
    ImageAttachment, Message, MessageContent, MessageStatus, TextAttachment, TurnRequest,
};
use colloquy_types::llm::{ContentPart, MessageRole, RequestContent, RequestMessage};

const CONTEXT_HEADER: &str = "context:\n";
const CONTEXT_DELIMITER: &str = "---\n";

/// Build the request messages for `turn`.
///
/// Order: system prompt (when non-blank), then `history` oldest first, then
/// the turn itself unless it is a replay (`suppress_echo`), in which case the
/// already-committed user message at the end of `history` stands in for it.
pub fn build_context(
    turn: &TurnRequest,
    history: &[Message],
    system_prompt: &str,
) -> Vec<RequestMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    if !system_prompt.trim().is_empty() {
        messages.push(RequestMessage::text(MessageRole::System, system_prompt));
    }

    messages.extend(history.iter().filter_map(history_message));

    if !turn.suppress_echo {
        messages.push(RequestMessage {
            role: MessageRole::User,
            content: user_content(&turn.content, &turn.images, &turn.texts),
        });
    }

    messages
}

/// Request form of one history message, or `None` if it must not be replayed.
///
/// Error-status answers are UI artifacts, and empty assistant messages carry
/// nothing the model could use.
fn history_message(message: &Message) -> Option<RequestMessage> {
    if message.role == MessageRole::Assistant
        && (message.status == MessageStatus::Error || message.content.is_empty())
    {
        return None;
    }

    let content = if message.role == MessageRole::User && message.has_attachments() {
        user_content(&message.text(), &message.images, &message.texts)
    } else {
        match &message.content {
            MessageContent::Text(text) => RequestContent::Text(text.clone()),
            MessageContent::Parts(parts) => RequestContent::Parts(parts.clone()),
        }
    };

    Some(RequestMessage {
        role: message.role,
        content,
    })
}

/// Expand user text plus attachments into request content.
///
/// Without attachments the text goes out as a bare string. Otherwise a single
/// text part comes first -- text attachments framed ahead of the user text
/// under a `context:` block -- followed by one `image_url` part per image.
pub fn user_content(
    text: &str,
    images: &[ImageAttachment],
    texts: &[TextAttachment],
) -> RequestContent {
    if images.is_empty() && texts.is_empty() {
        return RequestContent::Text(text.to_string());
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    parts.push(ContentPart::text(frame_text_attachments(text, texts)));
    parts.extend(
        images
            .iter()
            .map(|image| ContentPart::image(image.url.clone(), image.detail)),
    );
    RequestContent::Parts(parts)
}

fn frame_text_attachments(text: &str, texts: &[TextAttachment]) -> String {
    if texts.is_empty() {
        return text.to_string();
    }

    let mut framed = String::from(CONTEXT_HEADER);
    framed.push_str(CONTEXT_DELIMITER);
    for attachment in texts {
        if let Some(name) = &attachment.name {
            framed.push_str("# ");
            framed.push_str(name);
            framed.push('\n');
        }
        framed.push_str(&attachment.content);
        if !attachment.content.ends_with('\n') {
            framed.push('\n');
        }
        framed.push_str(CONTEXT_DELIMITER);
    }
    framed.push('\n');
    framed.push_str(text);
    framed
}
