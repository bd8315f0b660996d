//! Chat sessions and turn orchestration.
//!
//! - `context`: pure request-message assembly
//! - `store`: the session store and its shared handle
//! - `controller`: send, retry, compare fan-out and cancel

pub mod context;
pub mod controller;
pub mod store;

pub use context::{build_context, user_content};
pub use controller::{BranchOutcome, TurnController, TurnOutcome};
pub use store::{
    SessionDefaults, SessionStore, SettledTurn, SharedStore, StreamContent, TurnId, TurnPhase,
    TurnSettlement, UiState,
};
