//! Global configuration types for Colloquy.
//!
//! `GlobalConfig` represents the top-level `config.toml`: where the
//! completion endpoint lives, how long to wait for it, and the default
//! prompt and model configuration new sessions start with.

use serde::{Deserialize, Serialize};

use crate::llm::ModelConfig;

/// Top-level configuration.
///
/// Loaded from `~/.colloquy/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Path appended to `endpoint` for chat completions.
    #[serde(default = "default_completions_path")]
    pub completions_path: String,

    /// Total request timeout, covering the whole streamed body.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Name of the environment variable holding the API token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// System prompt given to new sessions.
    #[serde(default)]
    pub system_prompt: String,

    /// Model configuration given to new sessions.
    #[serde(default)]
    pub model: ModelConfig,

    /// Models used when compare mode is switched on without an explicit list.
    #[serde(default)]
    pub compare_models: Vec<String>,

    /// Capacity of the store's broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_completions_path() -> String {
    "/chat/completions".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_api_key_env() -> String {
    "COLLOQUY_API_KEY".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            completions_path: default_completions_path(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            api_key_env: default_api_key_env(),
            system_prompt: String::new(),
            model: ModelConfig::default(),
            compare_models: Vec::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl GlobalConfig {
    /// Full URL of the chat-completions endpoint.
    pub fn completions_url(&self) -> String {
        format!(
            "{}/{}",
            self.endpoint.trim_end_matches('/'),
            self.completions_path.trim_start_matches('/')
        )
    }
}
