//! Infrastructure layer for Colloquy.
//!
//! I/O adapters for the ports defined in `colloquy-core`: the HTTP completion
//! client with its transport decoder, and the config/data-dir loader.

pub mod config;
pub mod llm;
