//! Session, message and turn types for Colloquy.
//!
//! A session is one ordered conversation. Its `messages` list is the main
//! history; in compare mode every model additionally gets a sub-ledger of
//! assistant replies keyed by model id.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;
pub use crate::llm::{ContentPart, ImageDetail, MessageRole, ModelConfig};
use crate::llm::Usage;

/// Name given to sessions until the first user message renames them.
pub const DEFAULT_SESSION_NAME: &str = "New chat";

/// Maximum number of characters taken from the first user message for a title.
const AUTO_TITLE_CHARS: usize = 40;

/// Opaque, unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message identifier, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery status of a message.
///
/// Transitions are monotonic: `Sending` may move to any terminal status,
/// terminal statuses never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Error,
    Canceled,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageStatus::Sending)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(self, MessageStatus::Sending) && next.is_terminal()
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageStatus::Sending => write!(f, "sending"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Error => write!(f, "error"),
            MessageStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "error" => Ok(MessageStatus::Error),
            "canceled" | "cancelled" => Ok(MessageStatus::Canceled),
            other => Err(format!("invalid message status: '{other}'")),
        }
    }
}

/// Message body: plain text or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the body; image parts contribute nothing.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// Image attached to a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

impl ImageAttachment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            detail: None,
        }
    }
}

/// Raw text blob attached to a user turn as extra context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextAttachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl TextAttachment {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            name: None,
            content: content.into(),
        }
    }

    pub fn named(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// Free-form facts recorded alongside a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Model that produced this message (assistant messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// User message this assistant message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Wall-clock latency from dispatch to settle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    /// Text that had streamed before an error ended the turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_content: Option<String>,
}

/// A single message in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    /// Images echoed from the turn that produced this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    /// Text blobs echoed from the turn that produced this message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub texts: Vec<TextAttachment>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// A freshly dispatched user message (status `Sending`).
    pub fn user(
        content: impl Into<String>,
        images: Vec<ImageAttachment>,
        texts: Vec<TextAttachment>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: MessageContent::Text(content.into()),
            created_at: Utc::now(),
            status: MessageStatus::Sending,
            images,
            texts,
            metadata: MessageMetadata::default(),
        }
    }

    /// A terminal assistant message.
    pub fn assistant(
        content: impl Into<String>,
        status: MessageStatus,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
            created_at: Utc::now(),
            status,
            images: Vec::new(),
            texts: Vec::new(),
            metadata,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::System,
            content: MessageContent::Text(content.into()),
            created_at: Utc::now(),
            status: MessageStatus::Sent,
            images: Vec::new(),
            texts: Vec::new(),
            metadata: MessageMetadata::default(),
        }
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }

    pub fn has_attachments(&self) -> bool {
        !self.images.is_empty() || !self.texts.is_empty()
    }

    /// Apply a status transition if it is legal. Returns whether it applied.
    pub fn transition(&mut self, next: MessageStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// Where a request's streaming buffer and committed answer live.
///
/// `Primary` is the single-model path writing into the main history;
/// `Model(id)` is one branch of a compare turn writing into that model's
/// sub-ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "slot", content = "model", rename_all = "snake_case")]
pub enum Slot {
    Primary,
    Model(String),
}

impl Slot {
    pub fn model(&self) -> Option<&str> {
        match self {
            Slot::Primary => None,
            Slot::Model(model) => Some(model),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Primary => write!(f, "primary"),
            Slot::Model(model) => write!(f, "{model}"),
        }
    }
}

/// Compare-mode settings of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareSettings {
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
}

/// Position of a message inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageLocation {
    Main(usize),
    Ledger { model: String, index: usize },
}

/// One ordered conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub model_config: ModelConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub compare: CompareSettings,
    /// Per-model assistant replies produced in compare mode.
    #[serde(default)]
    pub sub_ledgers: BTreeMap<String, Vec<Message>>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        model_config: ModelConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            name: name.into(),
            messages: Vec::new(),
            system_prompt: system_prompt.into(),
            model_config,
            created_at: now,
            updated_at: now,
            pinned: false,
            archived: false,
            compare: CompareSettings::default(),
            sub_ledgers: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Sub-ledger for `model`, empty if the model never answered.
    pub fn ledger(&self, model: &str) -> &[Message] {
        self.sub_ledgers
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Locate a message in the main history or any sub-ledger.
    pub fn find_message(&self, id: MessageId) -> Option<(MessageLocation, &Message)> {
        if let Some(index) = self.messages.iter().position(|m| m.id == id) {
            return Some((MessageLocation::Main(index), &self.messages[index]));
        }
        for (model, ledger) in &self.sub_ledgers {
            if let Some(index) = ledger.iter().position(|m| m.id == id) {
                return Some((
                    MessageLocation::Ledger {
                        model: model.clone(),
                        index,
                    },
                    &ledger[index],
                ));
            }
        }
        None
    }

    pub fn message_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            return Some(message);
        }
        self.sub_ledgers
            .values_mut()
            .flat_map(|ledger| ledger.iter_mut())
            .find(|m| m.id == id)
    }

    /// Accepted history as seen by the request for `slot`.
    ///
    /// For a compare branch, the model's own sub-ledger replies are
    /// interleaved right after the user message each one answers.
    pub fn history_for(&self, slot: &Slot) -> Vec<Message> {
        let Slot::Model(model) = slot else {
            return self.messages.clone();
        };
        let ledger = self.ledger(model);
        let mut history = Vec::with_capacity(self.messages.len() + ledger.len());
        for message in &self.messages {
            history.push(message.clone());
            if message.role == MessageRole::User {
                history.extend(
                    ledger
                        .iter()
                        .filter(|reply| reply.metadata.reply_to == Some(message.id))
                        .cloned(),
                );
            }
        }
        history
    }

    /// Rename from the first user message while the default name is in place.
    pub fn auto_title(&mut self, first_user_text: &str) {
        if self.name != DEFAULT_SESSION_NAME {
            return;
        }
        let title: String = first_user_text
            .lines()
            .next()
            .unwrap_or_default()
            .chars()
            .take(AUTO_TITLE_CHARS)
            .collect();
        let title = title.trim();
        if !title.is_empty() {
            self.name = title.to_string();
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            message_count: self.messages.len(),
            pinned: self.pinned,
            archived: self.archived,
            compare_enabled: self.compare.enabled,
            updated_at: self.updated_at,
        }
    }
}

/// Lightweight listing entry for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub message_count: usize,
    pub pinned: bool,
    pub archived: bool,
    pub compare_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// One user turn as dispatched by the UI. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnRequest {
    pub content: String,
    pub images: Vec<ImageAttachment>,
    pub texts: Vec<TextAttachment>,
    /// Overrides the session's model configuration for this turn only.
    pub model_config: Option<ModelConfig>,
    /// Reuse an already-committed user message instead of appending a new one.
    pub suppress_echo: bool,
}

impl TurnRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_text(mut self, text: TextAttachment) -> Self {
        self.texts.push(text);
        self
    }

    pub fn with_model_config(mut self, config: ModelConfig) -> Self {
        self.model_config = Some(config);
        self
    }

    pub fn has_attachments(&self) -> bool {
        !self.images.is_empty() || !self.texts.is_empty()
    }

    /// Rebuild the turn that produced `message`, flagged as a replay.
    pub fn replay_of(message: &Message) -> Self {
        Self {
            content: message.text(),
            images: message.images.clone(),
            texts: message.texts.clone(),
            model_config: None,
            suppress_echo: true,
        }
    }
}
