//! Completion client abstractions.
//!
//! - `CompletionClient`: RPITIT trait implemented by transport adapters
//! - `BoxCompletionClient`: object-safe wrapper for runtime selection

pub mod box_client;
pub mod client;

pub use box_client::{BoxCompletionClient, CompletionClientDyn};
pub use client::{CompletionClient, DeltaSink};
