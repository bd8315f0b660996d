//! OpenTelemetry GenAI Semantic Convention attribute names.
//!
//! Usable as `Span::record` keys. Span field names written inline in
//! `info_span!` (the turn controller's `gen_ai.chat` span) use the same strings.

/// The name of the operation being performed (e.g., "chat").
pub const GEN_AI_OPERATION_NAME: &str = "gen_ai.operation.name";

/// The client serving the request (e.g., "http").
pub const GEN_AI_SYSTEM: &str = "gen_ai.system";

/// The model ID requested (e.g., "gpt-4o-mini").
pub const GEN_AI_REQUEST_MODEL: &str = "gen_ai.request.model";

pub const GEN_AI_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";

pub const GEN_AI_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";

/// The number of input tokens consumed, when the endpoint reports usage.
pub const GEN_AI_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";

/// The number of output tokens generated, when the endpoint reports usage.
pub const GEN_AI_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";

/// The finish reason reported for the response (e.g., "stop", "length").
pub const GEN_AI_RESPONSE_FINISH_REASONS: &str = "gen_ai.response.finish_reasons";

// --- Operation name values ---

/// Single-model chat turn.
pub const OP_CHAT: &str = "chat";

/// One user turn fanned out to several models.
pub const OP_COMPARE: &str = "compare";

/// Operation name for a turn with `branches` model branches.
pub fn operation_for(branches: usize) -> &'static str {
    if branches > 1 { OP_COMPARE } else { OP_CHAT }
}
