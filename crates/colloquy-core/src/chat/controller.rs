//! Turn orchestration: send, retry, compare fan-out and cancel.
//!
//! `TurnController` is the only component that talks to both the session
//! store and the completion client. Each branch of a turn (one per model in
//! compare mode) is registered with the store, streamed with its deltas
//! threaded into the store's buffer, and committed when the client settles.
//! Remote failures never surface as `Err`: they become error-status messages.

use std::sync::Arc;

use colloquy_types::chat::{
    Message, MessageId, MessageLocation, MessageRole, MessageStatus, SessionId, Slot, TurnRequest,
};
use colloquy_types::error::ChatError;
use colloquy_types::llm::ChatCompletionRequest;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};

use super::context::build_context;
use super::store::{SessionStore, SharedStore, TurnId, TurnSettlement};
use crate::llm::BoxCompletionClient;

/// How one branch of a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchOutcome {
    pub slot: Slot,
    /// Committed assistant message, `None` if a cancel had nothing to keep.
    pub message_id: Option<MessageId>,
    pub status: Option<MessageStatus>,
}

/// Result of a send or retry once every branch has settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub user_message_id: MessageId,
    pub branches: Vec<BranchOutcome>,
}

impl TurnOutcome {
    pub fn primary(&self) -> Option<&BranchOutcome> {
        self.branches.iter().find(|b| b.slot == Slot::Primary)
    }

    pub fn branch(&self, model: &str) -> Option<&BranchOutcome> {
        self.branches.iter().find(|b| b.slot.model() == Some(model))
    }
}

/// Whether the turn appends a new user message or replays a committed one.
enum Echo {
    Append,
    Reuse(MessageId),
}

/// A registered, not yet dispatched, request for one slot.
struct Branch {
    slot: Slot,
    turn_id: TurnId,
    token: CancellationToken,
    request: ChatCompletionRequest,
}

/// Drives turns against a completion client and commits results to the store.
#[derive(Clone)]
pub struct TurnController {
    store: SharedStore,
    client: Arc<BoxCompletionClient>,
}

impl TurnController {
    pub fn new(store: SharedStore, client: BoxCompletionClient) -> Self {
        Self {
            store,
            client: Arc::new(client),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn client_name(&self) -> &str {
        self.client.name()
    }

    /// Send a turn in the active session, creating one if needed.
    ///
    /// In compare mode the turn fans out to every compare model. With
    /// `suppress_echo` the last committed user message is replayed instead of
    /// appending a new one.
    pub async fn send_turn(&self, turn: TurnRequest) -> Result<TurnOutcome, ChatError> {
        let (session_id, user_message_id, branches) = self.store.update(|store| {
            let session_id = store.ensure_active();
            let session = store
                .session(session_id)
                .ok_or(ChatError::SessionNotFound)?;

            let echo = if turn.suppress_echo {
                let last_user = session
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .ok_or(ChatError::NothingToRetry)?;
                Echo::Reuse(last_user.id)
            } else {
                Echo::Append
            };
            let slots = if session.compare.enabled && !session.compare.models.is_empty() {
                session.compare.models.iter().cloned().map(Slot::Model).collect()
            } else {
                vec![Slot::Primary]
            };

            let (user_message_id, branches) = prepare(store, session_id, &turn, echo, slots)?;
            Ok::<_, ChatError>((session_id, user_message_id, branches))
        })?;

        Ok(self.run(session_id, user_message_id, branches).await)
    }

    /// Replay the turn that `message_id` belongs to.
    ///
    /// A main-history message steps back to the nearest user message at or
    /// before it, truncates everything after and re-runs the turn (across all
    /// compare models when compare mode is on). A sub-ledger message re-runs
    /// only that model's answer to its user message.
    pub async fn retry_turn(&self, message_id: MessageId) -> Result<TurnOutcome, ChatError> {
        let (session_id, user_message_id, branches) = self.store.update(|store| {
            let session_id = store
                .session_of(message_id)
                .ok_or(ChatError::MessageNotFound)?;
            if store.is_busy(session_id) {
                return Err(ChatError::TurnInFlight);
            }
            let session = store
                .session(session_id)
                .ok_or(ChatError::SessionNotFound)?;
            let (location, message) = session
                .find_message(message_id)
                .ok_or(ChatError::MessageNotFound)?;

            let (user, slots, ledger_model) = match location {
                MessageLocation::Main(index) => {
                    let user = session.messages[..=index]
                        .iter()
                        .rev()
                        .find(|m| m.role == MessageRole::User)
                        .cloned()
                        .ok_or(ChatError::NothingToRetry)?;
                    let slots = if session.compare.enabled && !session.compare.models.is_empty() {
                        session.compare.models.iter().cloned().map(Slot::Model).collect()
                    } else {
                        vec![Slot::Primary]
                    };
                    (user, slots, None)
                }
                MessageLocation::Ledger { model, .. } => {
                    let reply_to = message.metadata.reply_to.ok_or(ChatError::NothingToRetry)?;
                    let user = session
                        .messages
                        .iter()
                        .find(|m| m.id == reply_to)
                        .cloned()
                        .ok_or(ChatError::NothingToRetry)?;
                    (user, vec![Slot::Model(model.clone())], Some(model))
                }
            };

            store.truncate_after(session_id, user.id)?;
            store.remove_ledger_replies(session_id, ledger_model.as_deref(), user.id)?;
            debug!(session_id = %session_id, user_message_id = %user.id, "retrying turn");

            let turn = TurnRequest::replay_of(&user);
            let (user_message_id, branches) =
                prepare(store, session_id, &turn, Echo::Reuse(user.id), slots)?;
            Ok((session_id, user_message_id, branches))
        })?;

        Ok(self.run(session_id, user_message_id, branches).await)
    }

    /// Cancel every in-flight branch of the active session.
    ///
    /// Partial answers are committed as canceled messages before this
    /// returns; their ids are returned.
    pub fn cancel_active_turn(&self) -> Vec<MessageId> {
        self.store.update(|store| {
            store
                .active_session_id()
                .map(|id| store.cancel_turns(id))
                .unwrap_or_default()
        })
    }

    /// Rewrite a message in place. Does not resend.
    pub fn edit_message(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), ChatError> {
        self.store
            .update(|store| store.edit_message(session_id, message_id, content))
    }

    /// Switch compare mode on the active session, creating one if needed.
    pub fn toggle_compare_mode(
        &self,
        enabled: bool,
        models: Vec<String>,
    ) -> Result<SessionId, ChatError> {
        self.store.update(|store| {
            let id = store.ensure_active();
            store.set_compare_mode(id, enabled, models)?;
            Ok(id)
        })
    }

    async fn run(
        &self,
        session_id: SessionId,
        user_message_id: MessageId,
        branches: Vec<Branch>,
    ) -> TurnOutcome {
        // The user message counts as sent once its requests go out; failures
        // live on the assistant messages. A replayed message is already sent.
        match self
            .store
            .update(|store| store.set_message_status(session_id, user_message_id, MessageStatus::Sent))
        {
            Ok(true) => {}
            Ok(false) => debug!(session_id = %session_id, %user_message_id, "user message already settled"),
            Err(err) => debug!(session_id = %session_id, error = %err, "user message gone before dispatch"),
        }

        // Settle all: one branch failing never short-circuits its siblings.
        let outcomes = join_all(
            branches
                .into_iter()
                .map(|branch| self.run_branch(session_id, user_message_id, branch)),
        )
        .await;

        TurnOutcome {
            session_id,
            user_message_id,
            branches: outcomes,
        }
    }

    async fn run_branch(
        &self,
        session_id: SessionId,
        user_message_id: MessageId,
        branch: Branch,
    ) -> BranchOutcome {
        let Branch {
            slot,
            turn_id,
            token,
            request,
        } = branch;

        let span = info_span!(
            "gen_ai.chat",
            gen_ai.system = self.client.name(),
            gen_ai.request.model = %request.model,
            gen_ai.request.max_tokens = ?request.max_tokens,
            gen_ai.request.temperature = ?request.temperature,
            gen_ai.request.stream = request.stream,
            session_id = %session_id,
            %slot,
            %turn_id,
        );

        async {
            let store = &self.store;
            let delta_slot = slot.clone();
            let mut on_delta = |text: &str| {
                store.update(|s| s.apply_delta(session_id, &delta_slot, turn_id, text));
            };

            let result = self
                .client
                .send(&request, &token, Some(&mut on_delta))
                .await;
            let settlement = match result {
                Ok(completion) => TurnSettlement::Completed(completion),
                Err(err) if err.is_aborted() => TurnSettlement::Canceled,
                Err(err) => TurnSettlement::Failed(err),
            };

            let settled = self
                .store
                .update(|s| s.settle_turn(session_id, &slot, turn_id, settlement));
            let (message_id, status) = match settled {
                Some(settled) => (settled.message_id, settled.status),
                // Already committed by a cancel; report what it left behind.
                None => self
                    .store
                    .read(|s| s.reply_for(session_id, &slot, user_message_id))
                    .map_or((None, None), |(id, status)| (Some(id), Some(status))),
            };

            BranchOutcome {
                slot,
                message_id,
                status,
            }
        }
        .instrument(span)
        .await
    }
}

/// Register branches for `slots` and, for a new turn, append its user message.
///
/// Runs under the store lock so availability checks, the append and the
/// registrations happen atomically. Requests are built from the history as
/// it stood before the append.
fn prepare(
    store: &mut SessionStore,
    session_id: SessionId,
    turn: &TurnRequest,
    echo: Echo,
    slots: Vec<Slot>,
) -> Result<(MessageId, Vec<Branch>), ChatError> {
    if slots.iter().any(|slot| !store.slot_available(session_id, slot)) {
        return Err(ChatError::TurnInFlight);
    }
    let session = store
        .session(session_id)
        .ok_or(ChatError::SessionNotFound)?;

    let mut turn = turn.clone();
    let reuse = match echo {
        Echo::Reuse(id) => {
            turn.suppress_echo = true;
            Some(id)
        }
        Echo::Append => {
            turn.suppress_echo = false;
            None
        }
    };
    let base_config = turn
        .model_config
        .clone()
        .unwrap_or_else(|| session.model_config.clone());

    let mut requests = Vec::with_capacity(slots.len());
    for slot in slots {
        let mut history = session.history_for(&slot);
        if let Some(reuse_id) = reuse {
            let end = history
                .iter()
                .position(|m| m.id == reuse_id)
                .ok_or(ChatError::MessageNotFound)?;
            history.truncate(end + 1);
        }
        let config = match &slot {
            Slot::Primary => base_config.clone(),
            Slot::Model(model) => base_config.for_model(model.clone()),
        };
        let messages = build_context(&turn, &history, &session.system_prompt);
        requests.push((slot, ChatCompletionRequest::new(&config, messages)));
    }

    let user_message_id = match reuse {
        Some(id) => id,
        None => store.append_message(
            session_id,
            Message::user(turn.content.clone(), turn.images.clone(), turn.texts.clone()),
        )?,
    };

    let mut branches = Vec::with_capacity(requests.len());
    for (slot, request) in requests {
        let (turn_id, token) =
            store.begin_turn(session_id, slot.clone(), user_message_id, &request.model)?;
        branches.push(Branch {
            slot,
            turn_id,
            token,
            request,
        });
    }
    Ok((user_message_id, branches))
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use colloquy_types::chat::{ImageAttachment, DEFAULT_SESSION_NAME};
    use colloquy_types::error::CompletionError;
    use colloquy_types::event::StoreEvent;
    use colloquy_types::llm::{Completion, ContentPart, ModelConfig, RequestContent};
    use tokio::sync::{Notify, broadcast};

    use super::*;
    use crate::chat::store::SessionDefaults;
    use crate::event::EventBus;
    use crate::llm::{CompletionClient, DeltaSink};

    #[derive(Clone)]
    enum Step {
        Delta(&'static str),
        /// Park until the token fires, then report the abort.
        WaitForCancel,
        Fail(CompletionError),
        /// Park until notified, ignoring cancellation.
        Gate(Arc<Notify>),
    }

    #[derive(Clone, Default)]
    struct ScriptedClient {
        scripts: Arc<Mutex<HashMap<String, VecDeque<Vec<Step>>>>>,
        default: Vec<Step>,
        requests: Arc<Mutex<Vec<ChatCompletionRequest>>>,
    }

    impl ScriptedClient {
        fn new(default: Vec<Step>) -> Self {
            Self {
                default,
                ..Self::default()
            }
        }

        fn script(self, model: &str, steps: Vec<Step>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .entry(model.to_string())
                .or_default()
                .push_back(steps);
            self
        }

        fn requests(&self) -> Vec<ChatCompletionRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn steps_for(&self, model: &str) -> Vec<Step> {
            self.scripts
                .lock()
                .unwrap()
                .get_mut(model)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| self.default.clone())
        }
    }

    impl CompletionClient for ScriptedClient {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            request: &ChatCompletionRequest,
            cancel: &CancellationToken,
            mut on_delta: Option<DeltaSink<'_>>,
        ) -> Result<Completion, CompletionError> {
            self.requests.lock().unwrap().push(request.clone());
            let steps = self.steps_for(&request.model);

            let mut text = String::new();
            for step in steps {
                if cancel.is_cancelled() {
                    return Err(CompletionError::Aborted { partial: text });
                }
                match step {
                    Step::Delta(delta) => {
                        text.push_str(delta);
                        if let Some(sink) = on_delta.as_deref_mut() {
                            sink(delta);
                        }
                        tokio::task::yield_now().await;
                    }
                    Step::WaitForCancel => {
                        cancel.cancelled().await;
                        return Err(CompletionError::Aborted { partial: text });
                    }
                    Step::Fail(err) => return Err(err),
                    Step::Gate(gate) => gate.notified().await,
                }
            }
            Ok(Completion {
                text,
                finish_reason: Some("stop".to_string()),
                usage: None,
            })
        }
    }

    fn controller(client: ScriptedClient) -> TurnController {
        let store = SharedStore::new(SessionStore::new(
            SessionDefaults {
                system_prompt: "Be helpful.".to_string(),
                model_config: ModelConfig::default(),
                compare_models: Vec::new(),
            },
            EventBus::new(256),
        ));
        TurnController::new(store, BoxCompletionClient::new(client))
    }

    fn server_error() -> CompletionError {
        CompletionError::Http {
            status: 500,
            body: "internal".to_string(),
        }
    }

    async fn wait_for_deltas(rx: &mut broadcast::Receiver<StoreEvent>, count: usize) {
        let mut seen = 0;
        while seen < count {
            if let Ok(StoreEvent::Delta { .. }) = rx.recv().await {
                seen += 1;
            }
        }
    }

    async fn wait_for_turn_started(rx: &mut broadcast::Receiver<StoreEvent>) {
        loop {
            if let Ok(StoreEvent::TurnStarted { .. }) = rx.recv().await {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_send_commits_streamed_answer() {
        let client = ScriptedClient::new(vec![Step::Delta("Hi"), Step::Delta(" there")]);
        let ctl = controller(client.clone());

        let outcome = ctl.send_turn(TurnRequest::new("hello")).await.unwrap();
        let primary = outcome.primary().unwrap();
        assert_eq!(primary.status, Some(MessageStatus::Sent));

        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].text(), "hello");
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
        assert_eq!(session.messages[1].text(), "Hi there");
        assert_eq!(session.messages[1].status, MessageStatus::Sent);
        assert_eq!(session.messages[1].id, primary.message_id.unwrap());

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[0].role, MessageRole::System);

        let ui = ctl.store().read(|s| s.ui_state(outcome.session_id));
        assert!(!ui.loading && !ui.streaming);
    }

    #[tokio::test]
    async fn test_send_creates_session_lazily() {
        let ctl = controller(ScriptedClient::new(vec![Step::Delta("ok")]));
        assert!(ctl.store().read(|s| s.active_session_id()).is_none());

        let outcome = ctl.send_turn(TurnRequest::new("hello")).await.unwrap();

        let (active, name) = ctl.store().read(|s| {
            (
                s.active_session_id(),
                s.active_session().map(|session| session.name.clone()),
            )
        });
        assert_eq!(active, Some(outcome.session_id));
        assert_ne!(name.as_deref(), Some(DEFAULT_SESSION_NAME));
        assert_eq!(name.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_image_turn_sends_parts() {
        let client = ScriptedClient::new(vec![Step::Delta("a cat")]);
        let ctl = controller(client.clone());

        ctl.send_turn(
            TurnRequest::new("what is it?").with_image(ImageAttachment::new("https://x/cat.png")),
        )
        .await
        .unwrap();

        let request = client.requests().remove(0);
        match &request.messages.last().unwrap().content {
            RequestContent::Parts(parts) => {
                assert_eq!(parts[0], ContentPart::text("what is it?"));
                assert!(matches!(parts[1], ContentPart::ImageUrl { .. }));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_answer() {
        let ctl = controller(ScriptedClient::new(vec![
            Step::Delta("Hel"),
            Step::Delta("lo"),
            Step::WaitForCancel,
        ]));
        let mut rx = ctl.store().subscribe();

        let send = ctl.send_turn(TurnRequest::new("hi"));
        let cancel = async {
            wait_for_deltas(&mut rx, 2).await;
            ctl.cancel_active_turn()
        };
        let (outcome, canceled) = tokio::join!(send, cancel);
        let outcome = outcome.unwrap();

        assert_eq!(canceled.len(), 1);
        let primary = outcome.primary().unwrap();
        assert_eq!(primary.status, Some(MessageStatus::Canceled));
        assert_eq!(primary.message_id, Some(canceled[0]));

        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].text(), "Hello");
        assert_eq!(session.messages[1].status, MessageStatus::Canceled);
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
        assert!(!ctl.store().read(|s| s.is_busy(outcome.session_id)));
    }

    #[tokio::test]
    async fn test_cancel_before_first_delta_commits_nothing() {
        let ctl = controller(ScriptedClient::new(vec![Step::WaitForCancel]));
        let mut rx = ctl.store().subscribe();

        let send = ctl.send_turn(TurnRequest::new("hi"));
        let cancel = async {
            wait_for_turn_started(&mut rx).await;
            ctl.cancel_active_turn()
        };
        let (outcome, canceled) = tokio::join!(send, cancel);
        let outcome = outcome.unwrap();

        assert!(canceled.is_empty());
        assert_eq!(outcome.primary().unwrap().message_id, None);
        let len = ctl
            .store()
            .read(|s| s.session(outcome.session_id).map(|s| s.messages.len()));
        assert_eq!(len, Some(1));
    }

    #[tokio::test]
    async fn test_late_completion_after_cancel_changes_nothing() {
        let gate = Arc::new(Notify::new());
        let ctl = controller(ScriptedClient::new(vec![
            Step::Delta("a"),
            Step::Gate(gate.clone()),
        ]));
        let mut rx = ctl.store().subscribe();

        let send = ctl.send_turn(TurnRequest::new("hi"));
        let cancel = async {
            wait_for_deltas(&mut rx, 1).await;
            // let the client park on the gate first
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            let canceled = ctl.cancel_active_turn();
            gate.notify_one();
            canceled
        };
        let (outcome, canceled) = tokio::join!(send, cancel);
        let outcome = outcome.unwrap();

        assert_eq!(canceled.len(), 1);
        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].status, MessageStatus::Canceled);
        assert_eq!(session.messages[1].text(), "a");
    }

    #[tokio::test]
    async fn test_http_failure_commits_error_message() {
        let ctl = controller(ScriptedClient::new(vec![Step::Fail(server_error())]));

        let outcome = ctl.send_turn(TurnRequest::new("hi")).await.unwrap();

        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
        assert_eq!(session.messages[1].status, MessageStatus::Error);
        assert!(session.messages[1].text().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_second_send_while_in_flight_is_rejected() {
        let ctl = controller(ScriptedClient::new(vec![Step::WaitForCancel]));
        let mut rx = ctl.store().subscribe();

        let send = ctl.send_turn(TurnRequest::new("first"));
        let second = async {
            wait_for_turn_started(&mut rx).await;
            let result = ctl.send_turn(TurnRequest::new("second")).await;
            ctl.cancel_active_turn();
            result
        };
        let (first, second) = tokio::join!(send, second);

        assert_eq!(second.unwrap_err(), ChatError::TurnInFlight);
        let outcome = first.unwrap();
        let len = ctl
            .store()
            .read(|s| s.session(outcome.session_id).map(|s| s.messages.len()));
        assert_eq!(len, Some(1));
    }

    #[tokio::test]
    async fn test_retry_truncates_and_reuses_user_message() {
        let client = ScriptedClient::new(vec![Step::Delta("answer")]);
        let ctl = controller(client.clone());

        ctl.send_turn(TurnRequest::new("one")).await.unwrap();
        let second = ctl.send_turn(TurnRequest::new("two")).await.unwrap();
        let user_index = 2;

        let outcome = ctl.retry_turn(second.user_message_id).await.unwrap();
        assert_eq!(outcome.user_message_id, second.user_message_id);

        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), user_index + 2);
        assert_eq!(session.messages[user_index].id, second.user_message_id);
        assert_eq!(
            session
                .messages
                .iter()
                .filter(|m| m.role == MessageRole::User)
                .count(),
            2
        );

        let replay = client.requests().pop().unwrap();
        // system, one, answer, two
        assert_eq!(replay.messages.len(), 4);
        assert_eq!(
            replay.messages.last().unwrap().content,
            RequestContent::Text("two".to_string())
        );
    }

    #[tokio::test]
    async fn test_retry_from_assistant_steps_back_to_user() {
        let client = ScriptedClient::new(vec![Step::Fail(server_error())]);
        let ctl = controller(client.clone());

        let first = ctl.send_turn(TurnRequest::new("hi")).await.unwrap();
        let error_id = first.primary().unwrap().message_id.unwrap();

        let retried = ctl.retry_turn(error_id).await.unwrap();
        let session = ctl
            .store()
            .read(|s| s.session(retried.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_ne!(session.messages[1].id, error_id);
        // the failed answer is not replayed
        assert_eq!(client.requests().pop().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_successful_retry_after_failure_leaves_user_message_sent() {
        let model = ModelConfig::default().model;
        let client = ScriptedClient::new(vec![Step::Delta("ok")])
            .script(&model, vec![Step::Fail(server_error())]);
        let ctl = controller(client);

        let first = ctl.send_turn(TurnRequest::new("hi")).await.unwrap();
        assert_eq!(first.primary().unwrap().status, Some(MessageStatus::Error));

        let retried = ctl.retry_turn(first.user_message_id).await.unwrap();
        assert_eq!(retried.primary().unwrap().status, Some(MessageStatus::Sent));

        let session = ctl
            .store()
            .read(|s| s.session(retried.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
        assert_eq!(session.messages[1].text(), "ok");
        assert_eq!(session.messages[1].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_retry_unknown_message() {
        let ctl = controller(ScriptedClient::new(vec![]));
        assert_eq!(
            ctl.retry_turn(MessageId::new()).await.unwrap_err(),
            ChatError::MessageNotFound
        );
    }

    #[tokio::test]
    async fn test_suppress_echo_does_not_duplicate_user_message() {
        let client = ScriptedClient::new(vec![Step::Delta("ok")]);
        let ctl = controller(client.clone());

        ctl.send_turn(TurnRequest::new("hi")).await.unwrap();
        let replay = TurnRequest {
            suppress_echo: true,
            ..TurnRequest::new("hi")
        };
        let outcome = ctl.send_turn(replay).await.unwrap();

        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        let users = session
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .count();
        assert_eq!(users, 1);
        // system + the reused user message only
        assert_eq!(client.requests().pop().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_compare_isolates_failing_model() {
        let client = ScriptedClient::new(vec![])
            .script("a", vec![Step::Delta("from "), Step::Delta("A")])
            .script("b", vec![Step::Delta("partial B"), Step::Fail(server_error())])
            .script("c", vec![Step::Delta("from C")]);
        let ctl = controller(client.clone());
        ctl.toggle_compare_mode(true, vec!["a".into(), "b".into(), "c".into()])
            .unwrap();

        let outcome = ctl.send_turn(TurnRequest::new("compare")).await.unwrap();

        assert_eq!(outcome.branches.len(), 3);
        assert_eq!(outcome.branch("a").unwrap().status, Some(MessageStatus::Sent));
        assert_eq!(outcome.branch("b").unwrap().status, Some(MessageStatus::Error));
        assert_eq!(outcome.branch("c").unwrap().status, Some(MessageStatus::Sent));

        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
        assert_eq!(session.ledger("a").len(), 1);
        assert_eq!(session.ledger("a")[0].text(), "from A");
        assert_eq!(session.ledger("b").len(), 1);
        assert_eq!(session.ledger("b")[0].status, MessageStatus::Error);
        assert_eq!(
            session.ledger("b")[0].metadata.partial_content.as_deref(),
            Some("partial B")
        );
        assert_eq!(session.ledger("c")[0].text(), "from C");

        let mut models: Vec<_> = client.requests().into_iter().map(|r| r.model).collect();
        models.sort();
        assert_eq!(models, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_compare_cancel_stops_every_branch() {
        let ctl = controller(ScriptedClient::new(vec![
            Step::Delta("x"),
            Step::WaitForCancel,
        ]));
        ctl.toggle_compare_mode(true, vec!["a".into(), "b".into()])
            .unwrap();
        let mut rx = ctl.store().subscribe();

        let send = ctl.send_turn(TurnRequest::new("go"));
        let cancel = async {
            wait_for_deltas(&mut rx, 2).await;
            ctl.cancel_active_turn()
        };
        let (outcome, canceled) = tokio::join!(send, cancel);
        let outcome = outcome.unwrap();

        assert_eq!(canceled.len(), 2);
        for model in ["a", "b"] {
            assert_eq!(
                outcome.branch(model).unwrap().status,
                Some(MessageStatus::Canceled)
            );
        }
        let session = ctl
            .store()
            .read(|s| s.session(outcome.session_id).cloned())
            .unwrap();
        assert_eq!(session.ledger("a")[0].text(), "x");
        assert_eq!(session.ledger("b")[0].text(), "x");
    }

    #[tokio::test]
    async fn test_retry_single_compare_branch() {
        let client = ScriptedClient::new(vec![Step::Delta("fine")])
            .script("b", vec![Step::Fail(server_error())]);
        let ctl = controller(client.clone());
        ctl.toggle_compare_mode(true, vec!["a".into(), "b".into()])
            .unwrap();

        let first = ctl.send_turn(TurnRequest::new("q")).await.unwrap();
        let failed = first.branch("b").unwrap().message_id.unwrap();
        let kept_a = first.branch("a").unwrap().message_id.unwrap();
        let before = client.requests().len();

        let retried = ctl.retry_turn(failed).await.unwrap();
        assert_eq!(retried.branches.len(), 1);
        assert_eq!(retried.branch("b").unwrap().status, Some(MessageStatus::Sent));

        let requests = client.requests();
        assert_eq!(requests.len(), before + 1);
        assert_eq!(requests.last().unwrap().model, "b");

        let session = ctl
            .store()
            .read(|s| s.session(retried.session_id).cloned())
            .unwrap();
        assert_eq!(session.ledger("a").len(), 1);
        assert_eq!(session.ledger("a")[0].id, kept_a);
        assert_eq!(session.ledger("b").len(), 1);
        assert_eq!(session.ledger("b")[0].status, MessageStatus::Sent);
        assert_eq!(session.messages[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_compare_history_interleaves_own_replies() {
        let client = ScriptedClient::new(vec![])
            .script("a", vec![Step::Delta("A1")])
            .script("b", vec![Step::Delta("B1")]);
        let ctl = controller(client.clone());
        ctl.toggle_compare_mode(true, vec!["a".into(), "b".into()])
            .unwrap();

        ctl.send_turn(TurnRequest::new("first")).await.unwrap();
        ctl.send_turn(TurnRequest::new("second")).await.unwrap();

        let requests = client.requests();
        let second_a = requests
            .iter()
            .rev()
            .find(|r| r.model == "a")
            .unwrap();
        let texts: Vec<_> = second_a
            .messages
            .iter()
            .map(|m| match &m.content {
                RequestContent::Text(t) => t.clone(),
                RequestContent::Parts(_) => String::new(),
            })
            .collect();
        assert_eq!(texts, vec!["Be helpful.", "first", "A1", "second"]);
    }

    #[tokio::test]
    async fn test_edit_message_does_not_resend() {
        let client = ScriptedClient::new(vec![Step::Delta("ok")]);
        let ctl = controller(client.clone());
        let outcome = ctl.send_turn(TurnRequest::new("tpyo")).await.unwrap();

        ctl.edit_message(outcome.session_id, outcome.user_message_id, "typo")
            .unwrap();

        assert_eq!(client.requests().len(), 1);
        let text = ctl.store().read(|s| {
            s.session(outcome.session_id)
                .map(|session| session.messages[0].text())
        });
        assert_eq!(text.as_deref(), Some("typo"));
    }
}
