//! Terminal output for chat turns.
//!
//! `ChatRenderer` follows the store's event stream: single-model deltas are
//! printed as they arrive, compare branches are tallied on a spinner and
//! printed one block per model once the turn settles. Answers are printed
//! raw; there is no markdown rendering.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use colloquy_core::chat::{SharedStore, TurnOutcome};
use colloquy_types::chat::{Message, MessageStatus, Session, SessionId, SessionSummary, Slot};
use colloquy_types::error::ChatError;
use colloquy_types::event::StoreEvent;
use colloquy_types::llm::MessageRole;

#[derive(Debug, Default)]
struct BranchProgress {
    chars: usize,
    settled: Option<MessageStatus>,
}

/// Writes turns, listings and notices to `W`.
pub struct ChatRenderer<W: Write> {
    out: W,
    spinner_enabled: bool,
    spinner: Option<ProgressBar>,
    session_id: Option<SessionId>,
    label: String,
    streaming_started: bool,
    branches: BTreeMap<String, BranchProgress>,
}

impl<W: Write> ChatRenderer<W> {
    pub fn new(out: W, spinner_enabled: bool) -> Self {
        Self {
            out,
            spinner_enabled,
            spinner: None,
            session_id: None,
            label: String::new(),
            streaming_started: false,
            branches: BTreeMap::new(),
        }
    }

    /// Print one indented line.
    pub fn line(&mut self, text: impl Display) {
        let _ = writeln!(self.out, "  {text}");
    }

    pub fn blank(&mut self) {
        let _ = writeln!(self.out);
    }

    pub fn note(&mut self, text: impl Display) {
        self.line(style(text).dim());
    }

    pub fn error(&mut self, text: impl Display) {
        self.line(format_args!("{} {text}", style("!").red().bold()));
    }

    /// Start following a turn of `session_id`; `label` heads single-model answers.
    pub fn begin_turn(&mut self, session_id: SessionId, label: &str) {
        self.session_id = Some(session_id);
        self.label = label.to_string();
        self.streaming_started = false;
        self.branches.clear();

        if self.spinner_enabled {
            let spinner = ProgressBar::new_spinner();
            if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
                spinner.set_style(template);
            }
            spinner.set_message("thinking...");
            spinner.enable_steady_tick(Duration::from_millis(80));
            self.spinner = Some(spinner);
        }
    }

    pub fn on_event(&mut self, event: &StoreEvent) {
        if event.session_id() != self.session_id || self.session_id.is_none() {
            return;
        }
        match event {
            StoreEvent::Delta {
                slot: Slot::Primary,
                text,
                ..
            } => {
                if !self.streaming_started {
                    self.stop_spinner();
                    let _ = write!(self.out, "\n  {} ", style(&self.label).cyan().bold());
                    self.streaming_started = true;
                }
                let _ = write!(self.out, "{text}");
                let _ = self.out.flush();
            }
            StoreEvent::Delta {
                slot: Slot::Model(model),
                text,
                ..
            } => {
                self.branches.entry(model.clone()).or_default().chars += text.chars().count();
                self.refresh_spinner();
            }
            StoreEvent::TurnStarted {
                slot: Slot::Model(model),
                ..
            } => {
                self.branches.entry(model.clone()).or_default();
                self.refresh_spinner();
            }
            StoreEvent::TurnSettled {
                slot: Slot::Model(model),
                status,
                ..
            } => {
                self.branches.entry(model.clone()).or_default().settled =
                    Some(status.unwrap_or(MessageStatus::Canceled));
                self.refresh_spinner();
            }
            _ => {}
        }
    }

    /// Print whatever the turn committed and stop following it.
    pub fn finish_turn(&mut self, store: &SharedStore, result: &Result<TurnOutcome, ChatError>) {
        self.stop_spinner();
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.blank();
                self.error(err);
                self.reset();
                return;
            }
        };

        let committed: Vec<(Slot, Option<Message>)> = store.read(|s| {
            let session = s.session(outcome.session_id);
            outcome
                .branches
                .iter()
                .map(|branch| {
                    let message = branch.message_id.and_then(|id| {
                        session
                            .and_then(|session| session.find_message(id))
                            .map(|(_, m)| m.clone())
                    });
                    (branch.slot.clone(), message)
                })
                .collect()
        });

        for (slot, message) in committed {
            match slot {
                Slot::Primary => self.finish_primary(message),
                Slot::Model(model) => self.print_branch(&model, message),
            }
        }
        self.blank();
        let _ = self.out.flush();
        self.reset();
    }

    fn finish_primary(&mut self, message: Option<Message>) {
        let Some(message) = message else {
            if self.streaming_started {
                self.blank();
            }
            self.blank();
            self.note("(canceled before any reply)");
            return;
        };

        if message.status == MessageStatus::Error {
            if self.streaming_started {
                self.blank();
            }
            self.blank();
            self.error(message.text());
            return;
        }

        if !self.streaming_started {
            let _ = write!(
                self.out,
                "\n  {} {}",
                style(&self.label).cyan().bold(),
                message.text()
            );
        }
        self.blank();
        self.blank();
        self.line(style(stats_footer(&message)).dim());
    }

    fn print_branch(&mut self, model: &str, message: Option<Message>) {
        self.blank();
        self.line(style(format!("-- {model} --")).cyan().bold());
        match message {
            None => self.note("(canceled before any reply)"),
            Some(message) if message.status == MessageStatus::Error => self.error(message.text()),
            Some(message) => {
                for text_line in message.text().lines() {
                    self.line(text_line);
                }
                self.line(style(stats_footer(&message)).dim());
            }
        }
    }

    /// Numbered main history; compare replies are listed under the user
    /// message they answer.
    pub fn print_history(&mut self, session: &Session) {
        self.blank();
        if session.messages.is_empty() {
            self.note("No messages yet.");
            return;
        }
        let models: Vec<&String> = session.sub_ledgers.keys().collect();
        for (index, message) in session.messages.iter().enumerate() {
            let who = match message.role {
                MessageRole::User => style("You").green().bold().to_string(),
                MessageRole::Assistant => style(
                    message
                        .metadata
                        .model
                        .clone()
                        .unwrap_or_else(|| "assistant".to_string()),
                )
                .cyan()
                .bold()
                .to_string(),
                MessageRole::System => style("System").bold().to_string(),
            };
            self.line(format_args!(
                "{:>3}. {who}{} {}",
                index + 1,
                status_suffix(message),
                preview(&message.text(), 100)
            ));
            for attachment in &message.images {
                self.note(format_args!("       [image] {}", attachment.url));
            }
            for attachment in &message.texts {
                let name = attachment.name.as_deref().unwrap_or("text");
                self.note(format_args!("       [context] {name}"));
            }

            if message.role == MessageRole::User {
                for model in &models {
                    for reply in session
                        .ledger(model)
                        .iter()
                        .filter(|m| m.metadata.reply_to == Some(message.id))
                    {
                        self.line(format_args!(
                            "       {}{} {}",
                            style(*model).cyan(),
                            status_suffix(reply),
                            preview(&reply.text(), 90)
                        ));
                    }
                }
            }
        }
        self.blank();
    }

    pub fn print_sessions(&mut self, sessions: &[SessionSummary], active: Option<SessionId>) {
        self.blank();
        if sessions.is_empty() {
            self.note("No sessions.");
            return;
        }
        for (index, summary) in sessions.iter().enumerate() {
            let marker = if Some(summary.id) == active { "*" } else { " " };
            let mut flags = Vec::new();
            if summary.pinned {
                flags.push("pinned");
            }
            if summary.archived {
                flags.push("archived");
            }
            if summary.compare_enabled {
                flags.push("compare");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            self.line(format_args!(
                "{marker} {:>2}. {} {}{}",
                index + 1,
                style(&summary.name).bold(),
                style(format!("({} messages)", summary.message_count)).dim(),
                style(flags).yellow()
            ));
        }
        self.blank();
    }

    fn refresh_spinner(&mut self) {
        let Some(spinner) = &self.spinner else {
            return;
        };
        let status: Vec<String> = self
            .branches
            .iter()
            .map(|(model, progress)| match progress.settled {
                Some(MessageStatus::Sent) => format!("{model} done"),
                Some(status) => format!("{model} {status}"),
                None => format!("{model} {}", progress.chars),
            })
            .collect();
        spinner.set_message(status.join(" \u{00b7} "));
    }

    fn stop_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }

    fn reset(&mut self) {
        self.session_id = None;
        self.streaming_started = false;
        self.branches.clear();
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// Format: "| {tokens} tokens . {time}s . {model}"
pub fn stats_footer(message: &Message) -> String {
    let mut parts = Vec::new();
    if let Some(usage) = &message.metadata.usage {
        parts.push(format!("{} tokens", usage.output_tokens));
    }
    if let Some(ms) = message.metadata.response_ms {
        parts.push(format!("{:.1}s", ms as f64 / 1000.0));
    }
    if let Some(model) = &message.metadata.model {
        parts.push(model.clone());
    }
    if message.status == MessageStatus::Canceled {
        parts.push("canceled".to_string());
    }
    if let Some(reason) = message.metadata.finish_reason.as_deref().filter(|r| *r == "length") {
        parts.push(format!("finish: {reason}"));
    }
    format!("| {}", parts.join(" \u{00b7} "))
}

fn status_suffix(message: &Message) -> String {
    match message.status {
        MessageStatus::Sent => String::new(),
        status => format!(" ({status})"),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    match flat.char_indices().nth(max_chars.saturating_sub(3)) {
        Some((idx, _)) if flat.chars().count() > max_chars => format!("{}...", &flat[..idx]),
        _ => flat,
    }
}
