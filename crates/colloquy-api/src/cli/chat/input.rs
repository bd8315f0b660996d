//! Async line input for the chat loop.
//!
//! Wraps `rustyline_async::Readline`. Output written through the returned
//! `SharedWriter` is only drawn while a `read_line` future is being polled,
//! so the loop keeps one polled during streaming too.

use rustyline_async::{Readline, ReadlineError, ReadlineEvent, SharedWriter};

use console::style;
use tracing::debug;

/// Events produced by the input handler.
#[derive(Debug, PartialEq)]
pub enum InputEvent {
    /// A submitted line, trimmed.
    Line(String),
    /// Ctrl+D.
    Eof,
    /// Ctrl+C.
    Interrupted,
}

pub struct ChatInput {
    rl: Readline,
}

impl ChatInput {
    /// Returns the input handler and the writer all chat output goes through.
    pub fn new(prompt: String) -> Result<(Self, SharedWriter), ReadlineError> {
        let (rl, stdout) = Readline::new(prompt)?;
        Ok((Self { rl }, stdout))
    }

    pub fn update_prompt(&mut self, prompt: &str) {
        if let Err(err) = self.rl.update_prompt(prompt) {
            debug!(error = %err, "could not redraw prompt");
        }
    }

    pub async fn read_line(&mut self) -> InputEvent {
        match self.rl.readline().await {
            Ok(ReadlineEvent::Line(line)) => {
                let line = line.trim().to_string();
                if !line.is_empty() {
                    let _ = self.rl.add_history_entry(line.clone());
                }
                InputEvent::Line(line)
            }
            Ok(ReadlineEvent::Eof) => InputEvent::Eof,
            Ok(ReadlineEvent::Interrupted) => InputEvent::Interrupted,
            Err(err) => {
                tracing::warn!(error = %err, "readline failed, ending input");
                InputEvent::Eof
            }
        }
    }

    /// Clear the terminal screen.
    pub fn clear(&mut self) {
        if let Err(err) = self.rl.clear() {
            debug!(error = %err, "could not clear screen");
        }
    }

    /// Restore the terminal before the process prints its last lines.
    pub fn flush(&mut self) {
        if let Err(err) = self.rl.flush() {
            debug!(error = %err, "could not flush input");
        }
    }
}

/// Prompt text; shows how many attachments wait for the next message.
pub fn prompt(session_name: &str, pending_attachments: usize) -> String {
    let name = style(session_name).dim();
    if pending_attachments == 0 {
        format!("  {name} {} ", style("You >").green().bold())
    } else {
        format!(
            "  {name} {} {} ",
            style(format!("[+{pending_attachments}]")).yellow(),
            style("You >").green().bold()
        )
    }
}
