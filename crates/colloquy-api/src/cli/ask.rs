//! `colloquy ask`: one question, one streamed answer on stdout.

use std::path::PathBuf;

use colloquy_types::chat::{MessageStatus, TurnRequest};

use crate::state::AppState;

use super::chat::renderer::ChatRenderer;
use super::turn::{CtrlC, PendingAttachments, drive_turn, read_context_file, turn_label};

/// Fails when no branch produced an answer, so scripts can check the exit code.
pub async fn run_ask(
    state: &AppState,
    prompt: String,
    images: Vec<String>,
    context: Vec<PathBuf>,
    compare: bool,
) -> anyhow::Result<()> {
    let mut pending = PendingAttachments::default();
    for url in images {
        pending.push_image(url);
    }
    for path in &context {
        pending.push_text(read_context_file(path).await?);
    }

    let controller = &state.controller;
    let store = state.store();
    let session_id = store.update(|s| s.create_session(None));
    if compare {
        controller.toggle_compare_mode(true, state.config.compare_models.clone())?;
    }

    let mut events = store.subscribe();
    let mut renderer = ChatRenderer::new(std::io::stdout(), console::user_attended_stderr());
    renderer.begin_turn(session_id, &turn_label(store, session_id));

    let turn = pending.attach_to(TurnRequest::new(prompt));
    let result = drive_turn(
        controller,
        &mut events,
        &mut renderer,
        &mut CtrlC,
        controller.send_turn(turn),
    )
    .await;
    renderer.finish_turn(store, &result);

    let outcome = result?;
    if outcome
        .branches
        .iter()
        .all(|b| b.status == Some(MessageStatus::Error))
    {
        anyhow::bail!("no answer was produced");
    }
    Ok(())
}
