//! Running one turn from the terminal: queued attachments, the render loop
//! and interrupt handling shared by `chat` and `ask`.

use std::future::Future;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{Instrument, Span, debug, field, info_span, warn};

use colloquy_core::chat::{SharedStore, TurnController, TurnOutcome};
use colloquy_observe::genai_attrs::{
    GEN_AI_OPERATION_NAME, GEN_AI_USAGE_INPUT_TOKENS, GEN_AI_USAGE_OUTPUT_TOKENS, operation_for,
};
use colloquy_types::chat::{ImageAttachment, SessionId, TextAttachment, TurnRequest};
use colloquy_types::error::ChatError;
use colloquy_types::event::StoreEvent;

use super::chat::input::{ChatInput, InputEvent};
use super::chat::renderer::ChatRenderer;

/// What the terminal asked for while a turn was running.
#[derive(Debug, PartialEq)]
pub enum Interrupt {
    Cancel,
    /// A line typed while the reply streams; not sent anywhere.
    Ignored(String),
}

/// Source of user interrupts during a turn.
pub trait InterruptSource {
    fn next_interrupt(&mut self) -> impl Future<Output = Interrupt>;
}

impl InterruptSource for ChatInput {
    async fn next_interrupt(&mut self) -> Interrupt {
        match self.read_line().await {
            InputEvent::Line(line) => Interrupt::Ignored(line),
            InputEvent::Interrupted | InputEvent::Eof => Interrupt::Cancel,
        }
    }
}

/// SIGINT, for non-interactive use.
pub struct CtrlC;

impl InterruptSource for CtrlC {
    async fn next_interrupt(&mut self) -> Interrupt {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Interrupt::Cancel,
            Err(err) => {
                warn!(error = %err, "could not listen for Ctrl+C");
                std::future::pending().await
            }
        }
    }
}

/// Drive `turn` to completion, rendering store events as they arrive.
///
/// The first interrupt cancels every in-flight branch of the active
/// session; the turn future then settles with what streamed so far.
pub async fn drive_turn<W: Write, S: InterruptSource>(
    controller: &TurnController,
    events: &mut broadcast::Receiver<StoreEvent>,
    renderer: &mut ChatRenderer<W>,
    interrupts: &mut S,
    turn: impl Future<Output = Result<TurnOutcome, ChatError>>,
) -> Result<TurnOutcome, ChatError> {
    let span = info_span!(
        "terminal_turn",
        gen_ai.operation.name = field::Empty,
        gen_ai.usage.input_tokens = field::Empty,
        gen_ai.usage.output_tokens = field::Empty,
    );
    let result = render_until_settled(controller, events, renderer, interrupts, turn)
        .instrument(span.clone())
        .await;
    if let Ok(outcome) = &result {
        record_usage(&span, controller.store(), outcome);
    }
    result
}

async fn render_until_settled<W: Write, S: InterruptSource>(
    controller: &TurnController,
    events: &mut broadcast::Receiver<StoreEvent>,
    renderer: &mut ChatRenderer<W>,
    interrupts: &mut S,
    turn: impl Future<Output = Result<TurnOutcome, ChatError>>,
) -> Result<TurnOutcome, ChatError> {
    let mut turn = std::pin::pin!(turn);
    let mut canceled = false;

    loop {
        tokio::select! {
            result = &mut turn => {
                while let Ok(event) = events.try_recv() {
                    renderer.on_event(&event);
                }
                return result;
            }
            event = events.recv() => match event {
                Ok(event) => renderer.on_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "renderer fell behind store events");
                }
                Err(RecvError::Closed) => return turn.await,
            },
            interrupt = interrupts.next_interrupt(), if !canceled => match interrupt {
                Interrupt::Cancel => {
                    let committed = controller.cancel_active_turn();
                    canceled = true;
                    debug!(committed = committed.len(), "turn canceled from terminal");
                }
                Interrupt::Ignored(line) => {
                    if !line.is_empty() {
                        renderer.note("A reply is still streaming; press Ctrl+C to cancel it.");
                    }
                }
            },
        }
    }
}

/// Total the usage reported by every committed branch onto `span`.
fn record_usage(span: &Span, store: &SharedStore, outcome: &TurnOutcome) {
    span.record(GEN_AI_OPERATION_NAME, operation_for(outcome.branches.len()));
    let (input, output) = store.read(|s| {
        let Some(session) = s.session(outcome.session_id) else {
            return (0, 0);
        };
        outcome
            .branches
            .iter()
            .filter_map(|b| b.message_id)
            .filter_map(|id| session.find_message(id))
            .filter_map(|(_, m)| m.metadata.usage.as_ref())
            .fold((0u64, 0u64), |(i, o), u| {
                (i + u64::from(u.input_tokens), o + u64::from(u.output_tokens))
            })
    });
    span.record(GEN_AI_USAGE_INPUT_TOKENS, input);
    span.record(GEN_AI_USAGE_OUTPUT_TOKENS, output);
}

/// Attachments queued for the next message.
#[derive(Debug, Default)]
pub struct PendingAttachments {
    images: Vec<ImageAttachment>,
    texts: Vec<TextAttachment>,
}

impl PendingAttachments {
    pub fn push_image(&mut self, url: impl Into<String>) {
        self.images.push(ImageAttachment::new(url));
    }

    pub fn push_text(&mut self, text: TextAttachment) {
        self.texts.push(text);
    }

    pub fn len(&self) -> usize {
        self.images.len() + self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move everything queued onto `turn`.
    pub fn attach_to(&mut self, mut turn: TurnRequest) -> TurnRequest {
        for image in self.images.drain(..) {
            turn = turn.with_image(image);
        }
        for text in self.texts.drain(..) {
            turn = turn.with_text(text);
        }
        turn
    }
}

/// Read a file as a named text attachment.
pub async fn read_context_file(path: &Path) -> anyhow::Result<TextAttachment> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read context file {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(TextAttachment::named(name, content))
}

/// Heading for single-model answers: the session's model, or "compare".
pub fn turn_label(store: &SharedStore, session_id: SessionId) -> String {
    store.read(|s| match s.session(session_id) {
        Some(session) if session.compare.enabled => "compare".to_string(),
        Some(session) => session.model_config.model.clone(),
        None => "assistant".to_string(),
    })
}
