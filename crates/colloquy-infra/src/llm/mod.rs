//! Completion client over HTTP.
//!
//! [`sse`] decodes response bodies, [`streaming`] turns one POST into a
//! stream of [`StreamEvent`](colloquy_types::llm::StreamEvent)s, and
//! [`http_client`] implements the core
//! [`CompletionClient`](colloquy_core::llm::CompletionClient) port on top.
//! [`create_client`] builds the boxed client the controller runs on.

pub mod http_client;
pub mod sse;
pub mod streaming;

use secrecy::SecretString;

use colloquy_core::llm::BoxCompletionClient;
use colloquy_types::config::GlobalConfig;
use colloquy_types::error::ConfigError;

use self::http_client::HttpCompletionClient;

/// Create a [`BoxCompletionClient`] for the endpoint in `config`.
///
/// # Errors
///
/// Returns an error if the endpoint is not an http(s) URL or the HTTP
/// client cannot be constructed.
pub fn create_client(
    config: &GlobalConfig,
    api_key: Option<SecretString>,
) -> Result<BoxCompletionClient, ConfigError> {
    let client = HttpCompletionClient::from_config(config, api_key)?;
    tracing::debug!(url = %client.url(), "completion client ready");
    Ok(BoxCompletionClient::new(client))
}
