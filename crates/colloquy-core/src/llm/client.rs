//! CompletionClient trait definition.
//!
//! This is the port every completion transport implements. One call is one
//! network request; retries happen at the turn level, never in here.

use colloquy_types::error::CompletionError;
use colloquy_types::llm::{ChatCompletionRequest, Completion};
use tokio_util::sync::CancellationToken;

/// Callback receiving each decoded text delta.
///
/// Invoked synchronously in arrival order; the client does not read the
/// next chunk until the callback returns.
pub type DeltaSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Trait for chat-completion backends.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
/// Implementations live in colloquy-infra (e.g., `HttpCompletionClient`).
pub trait CompletionClient: Send + Sync {
    /// Human-readable client name (e.g., "http").
    fn name(&self) -> &str;

    /// Send one request and return the aggregated answer.
    ///
    /// When `on_delta` is supplied and the request streams, every delta is
    /// appended to the aggregate and passed to the sink before the next
    /// chunk is read. Once `cancel` fires the read loop stops at the next
    /// chunk boundary and returns `CompletionError::Aborted` carrying the
    /// text aggregated so far.
    fn send(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancellationToken,
        on_delta: Option<DeltaSink<'_>>,
    ) -> impl std::future::Future<Output = Result<Completion, CompletionError>> + Send;
}
