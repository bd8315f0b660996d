//! Interactive terminal chat.
//!
//! Streams answers as they arrive, shows a spinner until the first delta,
//! and offers slash commands for sessions, retry, edit and compare mode.
//! Entry point: `loop_runner::run_chat_loop`.

pub mod banner;
pub mod commands;
pub mod input;
pub mod loop_runner;
pub mod renderer;
