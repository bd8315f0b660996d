//! Shared domain types for Colloquy.
//!
//! This crate contains the types used across the Colloquy workspace:
//! sessions and messages, the chat-completion wire format, store events,
//! configuration, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod chat;
pub mod config;
pub mod error;
pub mod event;
pub mod llm;
