//! Chat session engine for Colloquy.
//!
//! This crate owns the session store, the context builder and the turn
//! controller, and defines the `CompletionClient` port the infrastructure
//! layer implements. It depends only on `colloquy-types` -- never on
//! `colloquy-infra` or any network crate.

pub mod chat;
pub mod event;
pub mod llm;
