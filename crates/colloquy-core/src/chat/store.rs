//! Session store: the single owner of all chat state.
//!
//! `SessionStore` holds every session, the active-session pointer, the
//! defaults new sessions start from and the transient per-turn streaming
//! buffers. Every mutation goes through one of its methods and publishes a
//! `StoreEvent`. `SharedStore` puts it behind a mutex so the controller and
//! the UI can share it; the lock is never held across an `.await`.
//!
//! Per in-flight turn the state machine is
//! `sending -> streaming -> {committed | canceled | errored}`. A turn is
//! keyed by `(session, slot)`: a `Primary` turn excludes everything else in
//! the session, `Model(m)` turns only exclude another turn for `m`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use colloquy_types::chat::{
    Message, MessageContent, MessageId, MessageMetadata, MessageRole, MessageStatus, ModelConfig,
    Session, SessionId, SessionSummary, Slot, DEFAULT_SESSION_NAME,
};
use colloquy_types::config::GlobalConfig;
use colloquy_types::error::{ChatError, CompletionError};
use colloquy_types::event::StoreEvent;
use colloquy_types::llm::Completion;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event::EventBus;

/// Identifies one dispatch of a turn so that late callbacks from an older
/// dispatch of the same slot are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase of an in-flight turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    /// Dispatched, no delta received yet.
    Sending,
    /// At least one delta applied.
    Streaming,
}

/// How a turn ended, as reported by the controller.
#[derive(Debug, Clone)]
pub enum TurnSettlement {
    Completed(Completion),
    Failed(CompletionError),
    Canceled,
}

/// Result of committing a settled turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettledTurn {
    /// Committed assistant message; `None` when a cancel had nothing to keep.
    pub message_id: Option<MessageId>,
    pub status: Option<MessageStatus>,
}

/// Transient text shown while answers stream in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamContent {
    Single(String),
    PerModel(BTreeMap<String, String>),
}

/// Derived UI flags for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiState {
    /// A turn is dispatched and not yet settled.
    pub loading: bool,
    /// At least one in-flight turn has received a delta.
    pub streaming: bool,
    pub stream_content: StreamContent,
}

/// Prompt and model settings copied into every new session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDefaults {
    pub system_prompt: String,
    pub model_config: ModelConfig,
    pub compare_models: Vec<String>,
}

impl From<&GlobalConfig> for SessionDefaults {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            model_config: config.model.clone(),
            compare_models: config.compare_models.clone(),
        }
    }
}

struct InFlight {
    turn_id: TurnId,
    phase: TurnPhase,
    buffer: String,
    token: CancellationToken,
    reply_to: MessageId,
    model: String,
    started_at: Instant,
}

/// All sessions plus transient turn state.
pub struct SessionStore {
    sessions: HashMap<SessionId, Session>,
    active: Option<SessionId>,
    defaults: SessionDefaults,
    inflight: HashMap<SessionId, BTreeMap<Slot, InFlight>>,
    /// Session-level cancellation roots; branch tokens are children.
    roots: HashMap<SessionId, CancellationToken>,
    events: EventBus,
}

impl SessionStore {
    pub fn new(defaults: SessionDefaults, events: EventBus) -> Self {
        Self {
            sessions: HashMap::new(),
            active: None,
            defaults,
            inflight: HashMap::new(),
            roots: HashMap::new(),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    // --- Sessions ---

    /// Create a session from the current defaults and make it active.
    pub fn create_session(&mut self, name: Option<String>) -> SessionId {
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string());
        let mut session = Session::new(
            name,
            self.defaults.system_prompt.clone(),
            self.defaults.model_config.clone(),
        );
        session.compare.models = self.defaults.compare_models.clone();
        let id = session.id;
        self.sessions.insert(id, session);
        info!(session_id = %id, "session created");
        self.events.publish(StoreEvent::SessionCreated { session_id: id });
        self.activate(Some(id));
        id
    }

    /// Active session id, creating a session if none is active.
    pub fn ensure_active(&mut self) -> SessionId {
        match self.active {
            Some(id) if self.sessions.contains_key(&id) => id,
            _ => self.create_session(None),
        }
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.active.filter(|id| self.sessions.contains_key(id))
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active_session_id().and_then(|id| self.sessions.get(&id))
    }

    pub fn set_active(&mut self, id: SessionId) -> Result<(), ChatError> {
        if !self.sessions.contains_key(&id) {
            return Err(ChatError::SessionNotFound);
        }
        self.activate(Some(id));
        Ok(())
    }

    /// Delete a session, canceling its in-flight turns first.
    pub fn delete_session(&mut self, id: SessionId) -> Result<(), ChatError> {
        if !self.sessions.contains_key(&id) {
            return Err(ChatError::SessionNotFound);
        }
        if let Some(turns) = self.inflight.remove(&id) {
            for turn in turns.values() {
                turn.token.cancel();
            }
        }
        if let Some(root) = self.roots.remove(&id) {
            root.cancel();
        }
        self.sessions.remove(&id);
        info!(session_id = %id, "session deleted");
        self.events.publish(StoreEvent::SessionDeleted { session_id: id });
        if self.active == Some(id) {
            self.activate(None);
        }
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Session summaries: unarchived before archived, pinned first, then
    /// most recently updated.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self.sessions.values().map(Session::summary).collect();
        summaries.sort_by(|a, b| {
            a.archived
                .cmp(&b.archived)
                .then(b.pinned.cmp(&a.pinned))
                .then(b.updated_at.cmp(&a.updated_at))
        });
        summaries
    }

    /// Session containing `message_id`, searching main histories and sub-ledgers.
    pub fn session_of(&self, message_id: MessageId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.find_message(message_id).is_some())
            .map(|s| s.id)
    }

    pub fn rename_session(&mut self, id: SessionId, name: &str) -> Result<(), ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::InvalidEdit("session name cannot be empty".to_string()));
        }
        self.modify_session(id, |s| s.name = name.to_string())
    }

    pub fn set_pinned(&mut self, id: SessionId, pinned: bool) -> Result<(), ChatError> {
        self.modify_session(id, |s| s.pinned = pinned)
    }

    pub fn set_archived(&mut self, id: SessionId, archived: bool) -> Result<(), ChatError> {
        self.modify_session(id, |s| s.archived = archived)
    }

    /// Replace the session's system prompt. Already-sent messages are untouched.
    pub fn set_system_prompt(&mut self, id: SessionId, prompt: &str) -> Result<(), ChatError> {
        self.modify_session(id, |s| s.system_prompt = prompt.to_string())
    }

    pub fn set_model_config(&mut self, id: SessionId, config: ModelConfig) -> Result<(), ChatError> {
        self.modify_session(id, |s| s.model_config = config)
    }

    /// Switch compare mode. With an empty `models` list the session's
    /// existing list, then the configured defaults, are used.
    pub fn set_compare_mode(
        &mut self,
        id: SessionId,
        enabled: bool,
        models: Vec<String>,
    ) -> Result<(), ChatError> {
        let fallback = self.defaults.compare_models.clone();
        let session = self.session_mut(id)?;

        let mut chosen = if !models.is_empty() {
            models
        } else if !session.compare.models.is_empty() {
            session.compare.models.clone()
        } else {
            fallback
        };
        let mut seen = HashSet::new();
        chosen.retain(|m| !m.trim().is_empty() && seen.insert(m.clone()));

        if enabled && chosen.is_empty() {
            return Err(ChatError::NoCompareModels);
        }
        session.compare.enabled = enabled;
        session.compare.models = chosen;
        session.touch();
        debug!(session_id = %id, enabled, models = ?session.compare.models, "compare mode set");
        self.events.publish(StoreEvent::SessionUpdated { session_id: id });
        Ok(())
    }

    // --- Messages ---

    /// Append to the main history. The first user message names a session
    /// that still carries the default name.
    pub fn append_message(
        &mut self,
        id: SessionId,
        message: Message,
    ) -> Result<MessageId, ChatError> {
        let session = self.session_mut(id)?;
        let message_id = message.id;
        if message.role == MessageRole::User
            && !session.messages.iter().any(|m| m.role == MessageRole::User)
        {
            session.auto_title(&message.text());
        }
        session.messages.push(message);
        session.touch();
        self.events.publish(StoreEvent::MessageAppended {
            session_id: id,
            message_id,
            slot: Slot::Primary,
        });
        Ok(message_id)
    }

    /// Rewrite a message's content in place. Id, order and status stay.
    pub fn edit_message(
        &mut self,
        id: SessionId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::InvalidEdit("message content cannot be empty".to_string()));
        }
        let session = self.session_mut(id)?;
        let message = session
            .message_mut(message_id)
            .ok_or(ChatError::MessageNotFound)?;
        message.content = MessageContent::Text(content.to_string());
        session.touch();
        self.events.publish(StoreEvent::MessageUpdated {
            session_id: id,
            message_id,
        });
        Ok(())
    }

    /// Move a message to `status` if the transition is legal.
    ///
    /// Returns `Ok(false)` for an illegal (non-monotonic) transition.
    pub fn set_message_status(
        &mut self,
        id: SessionId,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Result<bool, ChatError> {
        let session = self.session_mut(id)?;
        let message = session
            .message_mut(message_id)
            .ok_or(ChatError::MessageNotFound)?;
        if !message.transition(status) {
            return Ok(false);
        }
        self.events.publish(StoreEvent::MessageUpdated {
            session_id: id,
            message_id,
        });
        Ok(true)
    }

    /// Cut the main history so that `message_id` is its last entry.
    ///
    /// Sub-ledger replies to removed messages go with them.
    pub fn truncate_after(&mut self, id: SessionId, message_id: MessageId) -> Result<(), ChatError> {
        if self.is_busy(id) {
            return Err(ChatError::TurnInFlight);
        }
        let session = self.session_mut(id)?;
        let index = session
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or(ChatError::MessageNotFound)?;
        session.messages.truncate(index + 1);

        let kept: HashSet<MessageId> =
            session.messages.iter().map(|m| m.id).collect();
        for ledger in session.sub_ledgers.values_mut() {
            ledger.retain(|m| m.metadata.reply_to.is_some_and(|to| kept.contains(&to)));
        }
        session.touch();
        self.events.publish(StoreEvent::HistoryTruncated {
            session_id: id,
            last_kept: message_id,
        });
        Ok(())
    }

    /// Drop sub-ledger replies to `reply_to`, for one model or all of them.
    pub fn remove_ledger_replies(
        &mut self,
        id: SessionId,
        model: Option<&str>,
        reply_to: MessageId,
    ) -> Result<usize, ChatError> {
        let session = self.session_mut(id)?;
        let mut removed = 0;
        for (ledger_model, ledger) in session.sub_ledgers.iter_mut() {
            if model.is_some_and(|m| m != ledger_model) {
                continue;
            }
            let before = ledger.len();
            ledger.retain(|m| m.metadata.reply_to != Some(reply_to));
            removed += before - ledger.len();
        }
        if removed > 0 {
            session.touch();
            self.events.publish(StoreEvent::SessionUpdated { session_id: id });
        }
        Ok(removed)
    }

    /// Committed answer to `reply_to` in `slot`'s history, if any.
    pub fn reply_for(
        &self,
        id: SessionId,
        slot: &Slot,
        reply_to: MessageId,
    ) -> Option<(MessageId, MessageStatus)> {
        let session = self.sessions.get(&id)?;
        let list = match slot {
            Slot::Primary => session.messages.as_slice(),
            Slot::Model(model) => session.ledger(model),
        };
        list.iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && m.metadata.reply_to == Some(reply_to))
            .map(|m| (m.id, m.status))
    }

    // --- Turns ---

    /// Register a dispatched turn for `slot` and hand out its cancel token.
    pub fn begin_turn(
        &mut self,
        id: SessionId,
        slot: Slot,
        reply_to: MessageId,
        model: &str,
    ) -> Result<(TurnId, CancellationToken), ChatError> {
        if !self.sessions.contains_key(&id) {
            return Err(ChatError::SessionNotFound);
        }
        if !self.slot_available(id, &slot) {
            return Err(ChatError::TurnInFlight);
        }

        let root = self
            .roots
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();
        let token = root.child_token();
        let turn_id = TurnId::new();
        self.inflight.entry(id).or_default().insert(
            slot.clone(),
            InFlight {
                turn_id,
                phase: TurnPhase::Sending,
                buffer: String::new(),
                token: token.clone(),
                reply_to,
                model: model.to_string(),
                started_at: Instant::now(),
            },
        );
        debug!(session_id = %id, %slot, %turn_id, "turn started");
        self.events.publish(StoreEvent::TurnStarted { session_id: id, slot });
        Ok((turn_id, token))
    }

    /// Append a streamed fragment to the turn's buffer.
    ///
    /// Ignored (returns `false`) once the turn was settled, superseded or
    /// canceled, so no mutation happens after the token fires.
    pub fn apply_delta(&mut self, id: SessionId, slot: &Slot, turn_id: TurnId, text: &str) -> bool {
        let Some(turn) = self
            .inflight
            .get_mut(&id)
            .and_then(|turns| turns.get_mut(slot))
        else {
            return false;
        };
        if turn.turn_id != turn_id || turn.token.is_cancelled() {
            return false;
        }
        if text.is_empty() {
            return true;
        }
        turn.buffer.push_str(text);
        turn.phase = TurnPhase::Streaming;
        self.events.publish(StoreEvent::Delta {
            session_id: id,
            slot: slot.clone(),
            text: text.to_string(),
        });
        true
    }

    /// Commit the terminal message for a turn and clear its buffer.
    ///
    /// Returns `None` when the turn is no longer tracked (already canceled
    /// and committed, or superseded); settling is idempotent.
    pub fn settle_turn(
        &mut self,
        id: SessionId,
        slot: &Slot,
        turn_id: TurnId,
        settlement: TurnSettlement,
    ) -> Option<SettledTurn> {
        let turns = self.inflight.get_mut(&id)?;
        if turns.get(slot).is_none_or(|t| t.turn_id != turn_id) {
            return None;
        }
        let turn = turns.remove(slot)?;
        if turns.is_empty() {
            self.inflight.remove(&id);
            self.roots.remove(&id);
        }

        let settlement = match settlement {
            TurnSettlement::Completed(_) if turn.token.is_cancelled() => TurnSettlement::Canceled,
            other => other,
        };
        let settled = self.commit(id, slot, turn, settlement);
        Some(settled)
    }

    /// Cancel every in-flight turn of a session and commit what streamed so far.
    ///
    /// Returns the ids of the canceled messages that were committed.
    pub fn cancel_turns(&mut self, id: SessionId) -> Vec<MessageId> {
        let Some(turns) = self.inflight.remove(&id) else {
            return Vec::new();
        };
        if let Some(root) = self.roots.remove(&id) {
            root.cancel();
        }

        let mut committed = Vec::new();
        let mut replies = HashSet::new();
        for (slot, turn) in turns {
            turn.token.cancel();
            replies.insert(turn.reply_to);
            if let Some(message_id) = self.commit(id, &slot, turn, TurnSettlement::Canceled).message_id {
                committed.push(message_id);
            }
        }
        for reply_to in replies {
            match self.set_message_status(id, reply_to, MessageStatus::Sent) {
                Ok(true) => {}
                Ok(false) => debug!(session_id = %id, message_id = %reply_to, "user message already settled"),
                Err(err) => warn!(session_id = %id, message_id = %reply_to, error = %err, "cannot settle user message"),
            }
        }
        info!(session_id = %id, committed = committed.len(), "turns canceled");
        committed
    }

    /// Whether a turn for `slot` could start now.
    pub fn slot_available(&self, id: SessionId, slot: &Slot) -> bool {
        let Some(turns) = self.inflight.get(&id) else {
            return true;
        };
        match slot {
            Slot::Primary => turns.is_empty(),
            Slot::Model(_) => !turns.contains_key(&Slot::Primary) && !turns.contains_key(slot),
        }
    }

    pub fn is_busy(&self, id: SessionId) -> bool {
        self.inflight.get(&id).is_some_and(|turns| !turns.is_empty())
    }

    pub fn in_flight_slots(&self, id: SessionId) -> Vec<Slot> {
        self.inflight
            .get(&id)
            .map(|turns| turns.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Loading/streaming flags and buffered text for a session.
    pub fn ui_state(&self, id: SessionId) -> UiState {
        let turns = self.inflight.get(&id);
        let loading = turns.is_some_and(|t| !t.is_empty());
        let streaming =
            turns.is_some_and(|t| t.values().any(|turn| turn.phase == TurnPhase::Streaming));

        let per_model = self.sessions.get(&id).is_some_and(|s| s.compare.enabled)
            || turns.is_some_and(|t| t.keys().any(|slot| matches!(slot, Slot::Model(_))));
        let stream_content = if per_model {
            StreamContent::PerModel(
                turns
                    .into_iter()
                    .flatten()
                    .filter_map(|(slot, turn)| {
                        slot.model().map(|m| (m.to_string(), turn.buffer.clone()))
                    })
                    .collect(),
            )
        } else {
            StreamContent::Single(
                turns
                    .and_then(|t| t.get(&Slot::Primary))
                    .map(|turn| turn.buffer.clone())
                    .unwrap_or_default(),
            )
        };

        UiState {
            loading,
            streaming,
            stream_content,
        }
    }

    // --- Internals ---

    fn session_mut(&mut self, id: SessionId) -> Result<&mut Session, ChatError> {
        self.sessions.get_mut(&id).ok_or(ChatError::SessionNotFound)
    }

    fn modify_session(
        &mut self,
        id: SessionId,
        apply: impl FnOnce(&mut Session),
    ) -> Result<(), ChatError> {
        let session = self.session_mut(id)?;
        apply(session);
        session.touch();
        self.events.publish(StoreEvent::SessionUpdated { session_id: id });
        Ok(())
    }

    fn activate(&mut self, id: Option<SessionId>) {
        if self.active != id {
            self.active = id;
            self.events.publish(StoreEvent::ActiveChanged { session_id: id });
        }
    }

    fn commit(
        &mut self,
        id: SessionId,
        slot: &Slot,
        turn: InFlight,
        settlement: TurnSettlement,
    ) -> SettledTurn {
        let mut metadata = MessageMetadata {
            model: Some(turn.model.clone()),
            reply_to: Some(turn.reply_to),
            response_ms: Some(turn.started_at.elapsed().as_millis() as u64),
            ..Default::default()
        };

        let message = match settlement {
            TurnSettlement::Completed(completion) => {
                debug!(
                    session_id = %id,
                    %slot,
                    finish_reason = ?completion.finish_reason,
                    usage = ?completion.usage,
                    "turn completed"
                );
                metadata.finish_reason = completion.finish_reason;
                metadata.usage = completion.usage;
                let text = if completion.text.is_empty() {
                    turn.buffer
                } else {
                    completion.text
                };
                Some(Message::assistant(text, MessageStatus::Sent, metadata))
            }
            TurnSettlement::Canceled | TurnSettlement::Failed(CompletionError::Aborted { .. }) => {
                info!(session_id = %id, %slot, kept = turn.buffer.len(), "turn canceled");
                (!turn.buffer.is_empty())
                    .then(|| Message::assistant(turn.buffer, MessageStatus::Canceled, metadata))
            }
            TurnSettlement::Failed(err) => {
                warn!(session_id = %id, %slot, error = %err, "turn failed");
                metadata.error_category = Some(err.category());
                metadata.partial_content = (!turn.buffer.is_empty()).then_some(turn.buffer);
                Some(Message::assistant(
                    err.user_message(),
                    MessageStatus::Error,
                    metadata,
                ))
            }
        };

        let Some(message) = message else {
            self.events.publish(StoreEvent::TurnSettled {
                session_id: id,
                slot: slot.clone(),
                status: None,
            });
            return SettledTurn {
                message_id: None,
                status: None,
            };
        };

        let message_id = message.id;
        let status = message.status;
        if let Some(session) = self.sessions.get_mut(&id) {
            match slot {
                Slot::Primary => session.messages.push(message),
                Slot::Model(model) => session
                    .sub_ledgers
                    .entry(model.clone())
                    .or_default()
                    .push(message),
            }
            session.touch();
            self.events.publish(StoreEvent::MessageAppended {
                session_id: id,
                message_id,
                slot: slot.clone(),
            });
        }
        self.events.publish(StoreEvent::TurnSettled {
            session_id: id,
            slot: slot.clone(),
            status: Some(status),
        });
        SettledTurn {
            message_id: Some(message_id),
            status: Some(status),
        }
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .field("active", &self.active)
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

/// Cloneable handle to a mutex-guarded `SessionStore`.
///
/// Closures passed to `read`/`update` run under the lock and must not block
/// or await. A poisoned lock is recovered rather than propagated.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<SessionStore>>,
    events: EventBus,
}

impl SharedStore {
    pub fn new(store: SessionStore) -> Self {
        let events = store.events().clone();
        Self {
            inner: Arc::new(Mutex::new(store)),
            events,
        }
    }

    /// Store with an empty session set, built from the global configuration.
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(SessionStore::new(
            SessionDefaults::from(config),
            EventBus::new(config.event_capacity),
        ))
    }

    pub fn read<R>(&self, f: impl FnOnce(&SessionStore) -> R) -> R {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut SessionStore) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore")
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::llm::Usage;

    fn store() -> SessionStore {
        SessionStore::new(SessionDefaults::default(), EventBus::new(64))
    }

    fn with_user(store: &mut SessionStore, text: &str) -> (SessionId, MessageId) {
        let id = store.ensure_active();
        let msg = store
            .append_message(id, Message::user(text, vec![], vec![]))
            .unwrap();
        (id, msg)
    }

    #[test]
    fn test_ensure_active_creates_once() {
        let mut store = store();
        assert!(store.active_session_id().is_none());
        let id = store.ensure_active();
        assert_eq!(store.ensure_active(), id);
        assert_eq!(store.list_sessions().len(), 1);
        assert_eq!(store.session(id).unwrap().name, DEFAULT_SESSION_NAME);
    }

    #[test]
    fn test_first_user_message_titles_session() {
        let mut store = store();
        let (id, _) = with_user(&mut store, "How do lifetimes work?\nmore");
        store
            .append_message(id, Message::user("second", vec![], vec![]))
            .unwrap();
        assert_eq!(store.session(id).unwrap().name, "How do lifetimes work?");
    }

    #[test]
    fn test_delete_active_clears_pointer() {
        let mut store = store();
        let id = store.create_session(Some("keep".to_string()));
        store.delete_session(id).unwrap();
        assert!(store.active_session_id().is_none());
        assert_eq!(store.delete_session(id), Err(ChatError::SessionNotFound));
    }

    #[test]
    fn test_list_sessions_order() {
        let mut store = store();
        let a = store.create_session(Some("a".to_string()));
        let b = store.create_session(Some("b".to_string()));
        let c = store.create_session(Some("c".to_string()));
        store.set_pinned(a, true).unwrap();
        store.set_archived(b, true).unwrap();

        let order: Vec<_> = store.list_sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(order, vec![a, c, b]);
    }

    #[test]
    fn test_compare_mode_needs_models() {
        let mut store = store();
        let id = store.ensure_active();
        assert_eq!(
            store.set_compare_mode(id, true, vec![]),
            Err(ChatError::NoCompareModels)
        );
        store
            .set_compare_mode(id, true, vec!["a".into(), "b".into(), "a".into()])
            .unwrap();
        let compare = &store.session(id).unwrap().compare;
        assert!(compare.enabled);
        assert_eq!(compare.models, vec!["a", "b"]);

        store.set_compare_mode(id, false, vec![]).unwrap();
        store.set_compare_mode(id, true, vec![]).unwrap();
        assert_eq!(store.session(id).unwrap().compare.models, vec!["a", "b"]);
    }

    #[test]
    fn test_edit_message_in_place() {
        let mut store = store();
        let (id, first) = with_user(&mut store, "one");
        let (_, second) = with_user(&mut store, "two");
        store.edit_message(id, first, "uno").unwrap();

        let session = store.session(id).unwrap();
        assert_eq!(session.messages[0].id, first);
        assert_eq!(session.messages[0].text(), "uno");
        assert_eq!(session.messages[0].status, MessageStatus::Sending);
        assert_eq!(session.messages[1].id, second);
        assert!(matches!(
            store.edit_message(id, first, "  "),
            Err(ChatError::InvalidEdit(_))
        ));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut store = store();
        let (id, msg) = with_user(&mut store, "hi");
        assert!(store.set_message_status(id, msg, MessageStatus::Sent).unwrap());
        assert!(!store.set_message_status(id, msg, MessageStatus::Error).unwrap());
        assert!(!store.set_message_status(id, msg, MessageStatus::Sending).unwrap());
        assert_eq!(
            store.session(id).unwrap().messages[0].status,
            MessageStatus::Sent
        );
    }

    #[test]
    fn test_turn_lifecycle_commits_sent_message() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        let (turn, _token) = store.begin_turn(id, Slot::Primary, user, "m").unwrap();

        let ui = store.ui_state(id);
        assert!(ui.loading && !ui.streaming);

        assert!(store.apply_delta(id, &Slot::Primary, turn, "Hi"));
        assert!(store.apply_delta(id, &Slot::Primary, turn, " there"));
        let ui = store.ui_state(id);
        assert!(ui.loading && ui.streaming);
        assert_eq!(ui.stream_content, StreamContent::Single("Hi there".to_string()));

        let settled = store
            .settle_turn(
                id,
                &Slot::Primary,
                turn,
                TurnSettlement::Completed(Completion {
                    text: "Hi there".to_string(),
                    finish_reason: Some("stop".to_string()),
                    usage: Some(Usage {
                        input_tokens: 3,
                        output_tokens: 2,
                    }),
                }),
            )
            .unwrap();
        assert_eq!(settled.status, Some(MessageStatus::Sent));

        let session = store.session(id).unwrap();
        let reply = session.messages.last().unwrap();
        assert_eq!(reply.text(), "Hi there");
        assert_eq!(reply.metadata.reply_to, Some(user));
        assert_eq!(reply.metadata.model.as_deref(), Some("m"));
        assert_eq!(reply.metadata.finish_reason.as_deref(), Some("stop"));

        let ui = store.ui_state(id);
        assert!(!ui.loading && !ui.streaming);
        assert_eq!(ui.stream_content, StreamContent::Single(String::new()));
        assert!(
            store
                .settle_turn(id, &Slot::Primary, turn, TurnSettlement::Canceled)
                .is_none()
        );
    }

    #[test]
    fn test_primary_turn_is_exclusive() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        store.begin_turn(id, Slot::Primary, user, "m").unwrap();
        assert_eq!(
            store.begin_turn(id, Slot::Primary, user, "m").unwrap_err(),
            ChatError::TurnInFlight
        );
        assert_eq!(
            store
                .begin_turn(id, Slot::Model("a".into()), user, "a")
                .unwrap_err(),
            ChatError::TurnInFlight
        );
    }

    #[test]
    fn test_model_turns_are_tracked_per_model() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        store.begin_turn(id, Slot::Model("a".into()), user, "a").unwrap();
        store.begin_turn(id, Slot::Model("b".into()), user, "b").unwrap();
        assert_eq!(
            store
                .begin_turn(id, Slot::Model("a".into()), user, "a")
                .unwrap_err(),
            ChatError::TurnInFlight
        );
        assert_eq!(
            store.begin_turn(id, Slot::Primary, user, "m").unwrap_err(),
            ChatError::TurnInFlight
        );
        assert_eq!(store.in_flight_slots(id).len(), 2);
    }

    #[test]
    fn test_cancel_commits_partial_and_ignores_late_deltas() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        let (turn, token) = store.begin_turn(id, Slot::Primary, user, "m").unwrap();
        store.apply_delta(id, &Slot::Primary, turn, "par");
        store.apply_delta(id, &Slot::Primary, turn, "tial");

        let committed = store.cancel_turns(id);
        assert_eq!(committed.len(), 1);
        assert!(token.is_cancelled());
        assert!(!store.apply_delta(id, &Slot::Primary, turn, "late"));
        assert!(
            store
                .settle_turn(
                    id,
                    &Slot::Primary,
                    turn,
                    TurnSettlement::Completed(Completion::default())
                )
                .is_none()
        );

        let session = store.session(id).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
        assert_eq!(session.messages[1].text(), "partial");
        assert_eq!(session.messages[1].status, MessageStatus::Canceled);
        assert!(!store.is_busy(id));
    }

    #[test]
    fn test_cancel_compare_turn_settles_shared_user_message_once() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        for model in ["a", "b", "c"] {
            let (turn, _) = store.begin_turn(id, Slot::Model(model.into()), user, model).unwrap();
            store.apply_delta(id, &Slot::Model(model.into()), turn, model);
        }
        let mut rx = store.events().subscribe();

        assert_eq!(store.cancel_turns(id).len(), 3);

        let mut user_updates = 0;
        while let Ok(event) = rx.try_recv() {
            if event
                == (StoreEvent::MessageUpdated {
                    session_id: id,
                    message_id: user,
                })
            {
                user_updates += 1;
            }
        }
        assert_eq!(user_updates, 1);
        assert_eq!(store.session(id).unwrap().messages[0].status, MessageStatus::Sent);
    }

    #[test]
    fn test_cancel_before_delta_commits_nothing() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        store.begin_turn(id, Slot::Primary, user, "m").unwrap();
        assert!(store.cancel_turns(id).is_empty());
        assert_eq!(store.session(id).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_failed_turn_commits_classified_error() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        let (turn, _) = store.begin_turn(id, Slot::Primary, user, "m").unwrap();
        store.apply_delta(id, &Slot::Primary, turn, "half");
        store.settle_turn(
            id,
            &Slot::Primary,
            turn,
            TurnSettlement::Failed(CompletionError::Http {
                status: 401,
                body: "bad key".to_string(),
            }),
        );

        let reply = store.session(id).unwrap().messages.last().unwrap().clone();
        assert_eq!(reply.status, MessageStatus::Error);
        assert!(reply.text().starts_with("Authentication failed"));
        assert_eq!(
            reply.metadata.error_category,
            Some(colloquy_types::error::ErrorCategory::Authentication)
        );
        assert_eq!(reply.metadata.partial_content.as_deref(), Some("half"));
    }

    #[test]
    fn test_model_slot_commits_into_sub_ledger() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "hello");
        store.set_compare_mode(id, true, vec!["a".into()]).unwrap();
        let slot = Slot::Model("a".into());
        let (turn, _) = store.begin_turn(id, slot.clone(), user, "a").unwrap();
        store.apply_delta(id, &slot, turn, "A says");

        let mut expected = BTreeMap::new();
        expected.insert("a".to_string(), "A says".to_string());
        assert_eq!(store.ui_state(id).stream_content, StreamContent::PerModel(expected));

        store.settle_turn(id, &slot, turn, TurnSettlement::Completed(Completion::default()));
        let session = store.session(id).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.ledger("a").len(), 1);
        assert_eq!(session.ledger("a")[0].text(), "A says");
        assert_eq!(
            store.reply_for(id, &slot, user).map(|(_, s)| s),
            Some(MessageStatus::Sent)
        );
    }

    #[test]
    fn test_truncate_drops_later_messages_and_their_ledger_replies() {
        let mut store = store();
        let (id, first) = with_user(&mut store, "one");
        let (_, second) = with_user(&mut store, "two");
        for (reply_to, text) in [(first, "r1"), (second, "r2")] {
            let slot = Slot::Model("a".into());
            let (turn, _) = store.begin_turn(id, slot.clone(), reply_to, "a").unwrap();
            store.apply_delta(id, &slot, turn, text);
            store.settle_turn(id, &slot, turn, TurnSettlement::Completed(Completion::default()));
        }

        store.truncate_after(id, first).unwrap();
        let session = store.session(id).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.ledger("a").len(), 1);
        assert_eq!(session.ledger("a")[0].text(), "r1");

        assert_eq!(store.remove_ledger_replies(id, Some("a"), first).unwrap(), 1);
        assert!(store.session(id).unwrap().ledger("a").is_empty());
    }

    #[test]
    fn test_truncate_refused_while_busy() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "one");
        store.begin_turn(id, Slot::Primary, user, "m").unwrap();
        assert_eq!(store.truncate_after(id, user), Err(ChatError::TurnInFlight));
    }

    #[test]
    fn test_delete_cancels_inflight_tokens() {
        let mut store = store();
        let (id, user) = with_user(&mut store, "one");
        let (_, token) = store.begin_turn(id, Slot::Primary, user, "m").unwrap();
        store.delete_session(id).unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let store = SharedStore::new(store());
        let mut rx = store.subscribe();
        let id = store.update(|s| s.create_session(None));

        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::SessionCreated { session_id: id }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreEvent::ActiveChanged {
                session_id: Some(id)
            }
        );
        assert_eq!(store.read(|s| s.active_session_id()), Some(id));
    }
}
