//! Main chat loop orchestration.
//!
//! Reads lines, dispatches slash commands against the session store and
//! runs turns through the [`TurnController`](colloquy_core::chat::TurnController)
//! while the renderer follows the store's events.

use std::io::Write;

use console::style;
use tracing::info;

use colloquy_types::chat::{MessageRole, SessionId, Slot, TurnRequest};
use colloquy_types::error::ChatError;

use crate::cli::turn::{PendingAttachments, drive_turn, read_context_file, turn_label};
use crate::state::AppState;

use super::banner::welcome_lines;
use super::commands::{self, ChatCommand, CompareArg};
use super::input::{self, ChatInput, InputEvent};
use super::renderer::ChatRenderer;

enum Flow {
    Continue,
    Exit,
}

/// Run the interactive chat loop until `/exit` or Ctrl+D.
pub async fn run_chat_loop(state: &AppState, start_in_compare: bool) -> anyhow::Result<()> {
    let controller = &state.controller;
    let store = state.store();

    let session_id = store.update(|s| s.ensure_active());
    if start_in_compare {
        controller.toggle_compare_mode(true, state.config.compare_models.clone())?;
    }

    let initial_name = session_name(state, session_id);
    let (mut chat_input, writer) = ChatInput::new(input::prompt(&initial_name, 0))
        .map_err(|e| anyhow::anyhow!("Failed to initialize input: {e}"))?;
    let mut renderer = ChatRenderer::new(writer, console::user_attended_stderr());

    let compare_models = store.read(|s| {
        s.session(session_id)
            .filter(|session| session.compare.enabled)
            .map(|session| session.compare.models.clone())
            .unwrap_or_default()
    });
    for line in welcome_lines(
        &state.config.endpoint,
        &state.config.model.model,
        &compare_models,
        &initial_name,
    ) {
        renderer.line(line);
    }

    let mut events = store.subscribe();
    let mut pending = PendingAttachments::default();

    loop {
        let active = store.update(|s| s.ensure_active());
        chat_input.update_prompt(&input::prompt(&session_name(state, active), pending.len()));

        let text = match chat_input.read_line().await {
            InputEvent::Eof => break,
            InputEvent::Interrupted => {
                renderer.note("Press Ctrl+D to exit, or keep chatting.");
                continue;
            }
            InputEvent::Line(text) if text.is_empty() => continue,
            InputEvent::Line(text) => text,
        };

        if let Some(command) = commands::parse(&text) {
            match handle_command(state, command, &mut chat_input, &mut renderer, &mut pending, &mut events).await? {
                Flow::Continue => continue,
                Flow::Exit => break,
            }
        }

        let turn = pending.attach_to(TurnRequest::new(text));
        let label = turn_label(store, active);
        renderer.begin_turn(active, &label);
        let result = drive_turn(
            controller,
            &mut events,
            &mut renderer,
            &mut chat_input,
            controller.send_turn(turn),
        )
        .await;
        renderer.finish_turn(store, &result);
    }

    renderer.blank();
    renderer.note("Session ended.");
    chat_input.flush();
    info!("chat loop finished");
    Ok(())
}

async fn handle_command<W: Write>(
    state: &AppState,
    command: ChatCommand,
    chat_input: &mut ChatInput,
    renderer: &mut ChatRenderer<W>,
    pending: &mut PendingAttachments,
    events: &mut tokio::sync::broadcast::Receiver<colloquy_types::event::StoreEvent>,
) -> anyhow::Result<Flow> {
    let controller = &state.controller;
    let store = state.store();
    let active = store.update(|s| s.ensure_active());

    match command {
        ChatCommand::Help => {
            renderer.blank();
            for line in commands::help_lines() {
                renderer.line(line);
            }
        }
        ChatCommand::Clear => chat_input.clear(),
        ChatCommand::Exit => return Ok(Flow::Exit),
        ChatCommand::New(name) => {
            let id = store.update(|s| s.create_session(name));
            renderer.note(format_args!("Started session '{}'.", session_name(state, id)));
        }
        ChatCommand::Sessions => {
            let (sessions, current) = store.read(|s| (s.list_sessions(), s.active_session_id()));
            renderer.print_sessions(&sessions, current);
        }
        ChatCommand::Switch(n) => {
            let target = store.read(|s| s.list_sessions().get(n - 1).map(|summary| summary.id));
            match target {
                Some(id) => {
                    store.update(|s| s.set_active(id))?;
                    renderer.note(format_args!("Switched to '{}'.", session_name(state, id)));
                }
                None => renderer.error(format_args!("No session number {n}. See /sessions.")),
            }
        }
        ChatCommand::History => {
            store.read(|s| {
                if let Some(session) = s.session(active) {
                    renderer.print_history(session);
                }
            });
        }
        ChatCommand::Retry { index, model } => {
            let target = match retry_target(state, active, index, model.as_deref()) {
                Ok(target) => target,
                Err(err) => {
                    renderer.error(err);
                    return Ok(Flow::Continue);
                }
            };
            let label = turn_label(store, active);
            renderer.begin_turn(active, &label);
            let result = drive_turn(
                controller,
                events,
                renderer,
                chat_input,
                controller.retry_turn(target),
            )
            .await;
            renderer.finish_turn(store, &result);
        }
        ChatCommand::Edit { index, text } => {
            let message_id = store.read(|s| {
                s.session(active)
                    .and_then(|session| session.messages.get(index - 1))
                    .map(|m| m.id)
            });
            let result = message_id
                .ok_or(ChatError::MessageNotFound)
                .and_then(|id| controller.edit_message(active, id, &text));
            match result {
                Ok(()) => renderer.note(format_args!("Message {index} edited. Use /retry {index} to resend.")),
                Err(err) => renderer.error(err),
            }
        }
        ChatCommand::Compare(arg) => {
            let result = match arg {
                CompareArg::Off => controller.toggle_compare_mode(false, Vec::new()),
                CompareArg::On => controller.toggle_compare_mode(true, Vec::new()),
                CompareArg::Models(models) => controller.toggle_compare_mode(true, models),
            };
            match result {
                Ok(id) => {
                    let (enabled, models) = store.read(|s| {
                        s.session(id)
                            .map(|session| (session.compare.enabled, session.compare.models.clone()))
                            .unwrap_or_default()
                    });
                    if enabled {
                        renderer.note(format_args!("Compare mode on: {}", models.join(", ")));
                    } else {
                        renderer.note("Compare mode off.");
                    }
                }
                Err(ChatError::NoCompareModels) => {
                    renderer.error("No compare models configured. Use /compare <model,model,...>.");
                }
                Err(err) => renderer.error(err),
            }
        }
        ChatCommand::System(prompt) => {
            store.update(|s| s.set_system_prompt(active, &prompt))?;
            renderer.note("System prompt updated for this session.");
        }
        ChatCommand::Model(model) => {
            store.update(|s| {
                let config = s
                    .session(active)
                    .map(|session| session.model_config.for_model(model.clone()))
                    .ok_or(ChatError::SessionNotFound)?;
                s.set_model_config(active, config)
            })?;
            renderer.note(format_args!("Model set to {model}."));
        }
        ChatCommand::Image(url) => {
            pending.push_image(url);
            renderer.note(format_args!("{} attachment(s) queued for the next message.", pending.len()));
        }
        ChatCommand::Context(path) => match read_context_file(&path).await {
            Ok(attachment) => {
                pending.push_text(attachment);
                renderer.note(format_args!("{} attachment(s) queued for the next message.", pending.len()));
            }
            Err(err) => renderer.error(format_args!("{err:#}")),
        },
        ChatCommand::Rename(name) => {
            store.update(|s| s.rename_session(active, &name))?;
            renderer.note(format_args!("Session renamed to '{name}'."));
        }
        ChatCommand::Pin => {
            let pinned = store.update(|s| {
                let pinned = !s.session(active).is_some_and(|session| session.pinned);
                s.set_pinned(active, pinned).map(|()| pinned)
            })?;
            renderer.note(if pinned { "Session pinned." } else { "Session unpinned." });
        }
        ChatCommand::Delete => {
            let name = session_name(state, active);
            store.update(|s| s.delete_session(active))?;
            let next = store.update(|s| s.ensure_active());
            renderer.note(format_args!(
                "Deleted '{name}'. Now in '{}'.",
                session_name(state, next)
            ));
        }
        ChatCommand::Unknown(text) => {
            renderer.line(format_args!(
                "{} Unknown command: {}. Type /help for available commands.",
                style("?").yellow().bold(),
                style(text).dim()
            ));
        }
    }
    Ok(Flow::Continue)
}

/// Resolve `/retry [n] [model]` to the message id the controller retries.
///
/// Without a model the main-history message is used (default: the last
/// one); with a model, that model's reply to the user message at or before
/// `n`.
fn retry_target(
    state: &AppState,
    session_id: SessionId,
    index: Option<usize>,
    model: Option<&str>,
) -> Result<colloquy_types::chat::MessageId, ChatError> {
    state.store().read(|s| {
        let session = s.session(session_id).ok_or(ChatError::SessionNotFound)?;
        let upto = match index {
            Some(n) if n > session.messages.len() => return Err(ChatError::MessageNotFound),
            Some(n) => n,
            None => session.messages.len(),
        };
        let candidates = &session.messages[..upto];

        match model {
            None => candidates.last().map(|m| m.id).ok_or(ChatError::NothingToRetry),
            Some(model) => {
                let user = candidates
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .ok_or(ChatError::NothingToRetry)?;
                s.reply_for(session_id, &Slot::Model(model.to_string()), user.id)
                    .map(|(id, _)| id)
                    .ok_or(ChatError::MessageNotFound)
            }
        }
    })
}

fn session_name(state: &AppState, id: SessionId) -> String {
    state
        .store()
        .read(|s| s.session(id).map(|session| session.name.clone()))
        .unwrap_or_default()
}
