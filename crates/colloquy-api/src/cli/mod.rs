//! CLI command definitions for the `colloquy` binary.
//!
//! Uses clap derive macros for argument parsing. Model and endpoint flags
//! are global so they apply to both `chat` and `ask`.

pub mod ask;
pub mod chat;
pub mod config;
pub mod turn;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

use colloquy_types::config::GlobalConfig;

/// Chat with OpenAI-compatible models from the terminal.
#[derive(Parser)]
#[command(name = "colloquy", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Suppress all log output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(flatten)]
    pub model: ModelArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat session.
    Chat,

    /// Ask a single question and stream the answer to stdout.
    Ask {
        /// The question.
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// Attach an image by URL (repeatable).
        #[arg(long = "image", value_name = "URL")]
        images: Vec<String>,

        /// Attach a text file as context (repeatable).
        #[arg(long = "context", value_name = "FILE")]
        context: Vec<PathBuf>,
    },

    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration (file values plus flags) as TOML.
    Show,

    /// Print the path of the configuration file.
    Path,
}

/// Per-process overrides for values in `config.toml`.
#[derive(Args, Debug, Default, Clone)]
pub struct ModelArgs {
    /// Model id for new sessions.
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// System prompt for new sessions.
    #[arg(long, global = true)]
    pub system: Option<String>,

    #[arg(long, global = true)]
    pub temperature: Option<f32>,

    #[arg(long = "max-tokens", global = true)]
    pub max_tokens: Option<u32>,

    /// Base URL of the OpenAI-compatible API.
    #[arg(long, env = "COLLOQUY_ENDPOINT", global = true)]
    pub endpoint: Option<String>,

    /// Name of the environment variable holding the API token.
    #[arg(long = "api-key-env", env = "COLLOQUY_API_KEY_ENV", global = true)]
    pub api_key_env: Option<String>,

    /// Compare models, comma separated; turns compare mode on.
    #[arg(long, value_delimiter = ',', global = true)]
    pub compare: Vec<String>,

    /// Ask for a single JSON body instead of a streamed response.
    #[arg(long = "no-stream", global = true)]
    pub no_stream: bool,
}

impl ModelArgs {
    /// Overlay the flags that were given onto `config`.
    pub fn apply(&self, config: &mut GlobalConfig) {
        if let Some(model) = &self.model {
            config.model.model = model.clone();
        }
        if let Some(system) = &self.system {
            config.system_prompt = system.clone();
        }
        if let Some(temperature) = self.temperature {
            config.model.temperature = Some(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            config.model.max_tokens = Some(max_tokens);
        }
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(name) = &self.api_key_env {
            config.api_key_env = name.clone();
        }
        let compare: Vec<String> = self
            .compare
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if !compare.is_empty() {
            config.compare_models = compare;
        }
        if self.no_stream {
            config.model.stream = false;
        }
    }

    pub fn compare_enabled(&self) -> bool {
        self.compare.iter().any(|m| !m.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn test_model_args_override_config() {
        let cli = Cli::parse_from([
            "colloquy",
            "--model",
            "llama3",
            "--temperature",
            "0.1",
            "--compare",
            "a, b,,c",
            "--endpoint",
            "http://localhost:11434/v1",
            "chat",
        ]);
        let mut config = GlobalConfig::default();
        cli.model.apply(&mut config);

        assert_eq!(config.model.model, "llama3");
        assert_eq!(config.model.temperature, Some(0.1));
        assert_eq!(config.model.max_tokens, Some(2048));
        assert_eq!(config.compare_models, vec!["a", "b", "c"]);
        assert_eq!(config.endpoint, "http://localhost:11434/v1");
        assert!(cli.model.compare_enabled());
    }

    #[test]
    fn test_no_flags_leave_config_untouched() {
        let mut config = GlobalConfig::default();
        ModelArgs::default().apply(&mut config);
        assert_eq!(config, GlobalConfig::default());
    }

    #[test]
    fn test_ask_collects_prompt_words() {
        let cli = Cli::parse_from(["colloquy", "ask", "why", "is", "the", "sky", "blue", "--image", "http://x/y.png"]);
        match cli.command {
            Commands::Ask { prompt, images, .. } => {
                assert_eq!(prompt.join(" "), "why is the sky blue");
                assert_eq!(images, vec!["http://x/y.png"]);
            }
            _ => panic!("expected ask"),
        }
    }
}
