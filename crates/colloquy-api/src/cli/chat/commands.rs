//! Slash command parsing for the chat loop.
//!
//! Commands start with `/`. Message numbers are the 1-based positions shown
//! by `/history`; session numbers are the positions shown by `/sessions`.

use std::path::PathBuf;

use console::style;

/// What `/compare` should do.
#[derive(Debug, PartialEq)]
pub enum CompareArg {
    /// Turn compare mode on with the session's (or configured) models.
    On,
    /// Turn compare mode on with exactly these models.
    Models(Vec<String>),
    Off,
}

/// Available slash commands in the chat loop.
#[derive(Debug, PartialEq)]
pub enum ChatCommand {
    Help,
    /// Clear the terminal screen.
    Clear,
    Exit,
    /// Start a new session, optionally named.
    New(Option<String>),
    Sessions,
    /// Make session number `n` active.
    Switch(usize),
    /// Show the active session's messages.
    History,
    /// Re-run the turn of message `index` (default: last), or only `model`'s
    /// branch of it in compare mode.
    Retry {
        index: Option<usize>,
        model: Option<String>,
    },
    /// Rewrite message `index` without resending it.
    Edit { index: usize, text: String },
    Compare(CompareArg),
    System(String),
    Model(String),
    /// Queue an image URL for the next message.
    Image(String),
    /// Queue a text file as context for the next message.
    Context(PathBuf),
    Rename(String),
    /// Toggle the pinned flag of the active session.
    Pin,
    /// Delete the active session.
    Delete,
    /// Unknown command or bad arguments; carries the text to show.
    Unknown(String),
}

/// Parse user input as a slash command.
///
/// Returns `None` if the input doesn't start with `/`.
pub fn parse(input: &str) -> Option<ChatCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (cmd, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd.to_lowercase(), rest.trim()),
        None => (trimmed.to_lowercase(), ""),
    };
    let arg = (!arg.is_empty()).then_some(arg);

    let command = match cmd.as_str() {
        "/help" | "/h" | "/?" => ChatCommand::Help,
        "/clear" | "/cls" => ChatCommand::Clear,
        "/exit" | "/quit" | "/q" => ChatCommand::Exit,
        "/new" => ChatCommand::New(arg.map(str::to_string)),
        "/sessions" | "/ls" => ChatCommand::Sessions,
        "/switch" => match arg.and_then(parse_number) {
            Some(n) => ChatCommand::Switch(n),
            None => usage("/switch <session number>"),
        },
        "/history" => ChatCommand::History,
        "/retry" => parse_retry(arg),
        "/edit" => parse_edit(arg),
        "/compare" => match arg {
            None => ChatCommand::Compare(CompareArg::On),
            Some(a) if a.eq_ignore_ascii_case("off") => ChatCommand::Compare(CompareArg::Off),
            Some(a) if a.eq_ignore_ascii_case("on") => ChatCommand::Compare(CompareArg::On),
            Some(a) => {
                let models = split_models(a);
                if models.is_empty() {
                    usage("/compare <model,model,...>|on|off")
                } else {
                    ChatCommand::Compare(CompareArg::Models(models))
                }
            }
        },
        "/system" => match arg {
            Some(prompt) => ChatCommand::System(prompt.to_string()),
            None => usage("/system <prompt>"),
        },
        "/model" => match arg {
            Some(model) => ChatCommand::Model(model.to_string()),
            None => usage("/model <model id>"),
        },
        "/image" | "/img" => match arg {
            Some(url) => ChatCommand::Image(url.to_string()),
            None => usage("/image <url>"),
        },
        "/context" | "/ctx" => match arg {
            Some(path) => ChatCommand::Context(PathBuf::from(path)),
            None => usage("/context <file>"),
        },
        "/rename" => match arg {
            Some(name) => ChatCommand::Rename(name.to_string()),
            None => usage("/rename <name>"),
        },
        "/pin" => ChatCommand::Pin,
        "/delete" => ChatCommand::Delete,
        other => ChatCommand::Unknown(other.to_string()),
    };
    Some(command)
}

fn usage(text: &str) -> ChatCommand {
    ChatCommand::Unknown(format!("usage: {text}"))
}

fn parse_number(text: &str) -> Option<usize> {
    text.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

fn split_models(text: &str) -> Vec<String> {
    text.split([',', ' '])
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_retry(arg: Option<&str>) -> ChatCommand {
    let Some(arg) = arg else {
        return ChatCommand::Retry {
            index: None,
            model: None,
        };
    };
    let mut words = arg.split_whitespace();
    let first = words.next().unwrap_or_default();
    let (index, model) = match parse_number(first) {
        Some(n) => (Some(n), words.next()),
        None => (None, Some(first)),
    };
    if words.next().is_some() {
        return usage("/retry [message number] [model]");
    }
    ChatCommand::Retry {
        index,
        model: model.map(str::to_string),
    }
}

fn parse_edit(arg: Option<&str>) -> ChatCommand {
    let parsed = arg.and_then(|a| {
        let (number, text) = a.split_once(char::is_whitespace)?;
        let text = text.trim();
        Some((parse_number(number)?, text)).filter(|(_, t)| !t.is_empty())
    });
    match parsed {
        Some((index, text)) => ChatCommand::Edit {
            index,
            text: text.to_string(),
        },
        None => usage("/edit <message number> <new text>"),
    }
}

const HELP: &[(&str, &str)] = &[
    ("/help", "Show this help message"),
    ("/exit", "End the chat session"),
    ("/clear", "Clear the screen"),
    ("/new [name]", "Start a new session"),
    ("/sessions", "List sessions"),
    ("/switch <n>", "Switch to session n"),
    ("/history", "Show messages of this session"),
    ("/retry [n] [model]", "Re-run message n (default: last), or one compare model"),
    ("/edit <n> <text>", "Rewrite message n (use /retry n to resend)"),
    ("/compare <a,b>|off", "Send each message to several models"),
    ("/system <prompt>", "Set this session's system prompt"),
    ("/model <id>", "Set this session's model"),
    ("/image <url>", "Attach an image to the next message"),
    ("/context <file>", "Attach a text file to the next message"),
    ("/rename <name>", "Rename this session"),
    ("/pin", "Pin or unpin this session"),
    ("/delete", "Delete this session"),
];

/// Help text listing all available commands, one entry per line.
pub fn help_lines() -> Vec<String> {
    let width = HELP.iter().map(|(cmd, _)| cmd.len()).max().unwrap_or(0);
    let mut lines = vec![style("Available commands:").bold().to_string(), String::new()];
    lines.extend(HELP.iter().map(|(cmd, text)| {
        format!("{}  {text}", style(format!("{cmd:<width$}")).cyan())
    }));
    lines.push(String::new());
    lines.push(
        style("Ctrl+C cancels a streaming reply (partial text is kept), Ctrl+D exits")
            .dim()
            .to_string(),
    );
    lines
}
