//! HttpCompletionClient -- [`CompletionClient`] over an OpenAI-compatible
//! chat-completions endpoint.
//!
//! One call is one POST. The cancellation token is checked at every chunk
//! boundary; once it fires the connection is dropped and the text received
//! so far is handed back inside `CompletionError::Aborted`.
//!
//! The API key is wrapped in [`secrecy::SecretString`] and only exposed when
//! the `Authorization` header is built.

use std::time::Duration;

use futures_util::StreamExt;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use colloquy_core::llm::{CompletionClient, DeltaSink};
use colloquy_types::config::GlobalConfig;
use colloquy_types::error::{CompletionError, ConfigError};
use colloquy_types::llm::{ChatCompletionRequest, Completion, StreamEvent};

use super::streaming::create_completion_stream;

/// Chat-completions client speaking HTTP.
pub struct HttpCompletionClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

// No Debug: keeps the key out of any formatted output.

impl HttpCompletionClient {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<SecretString>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidEndpoint(url));
        }
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    /// Build a client for the endpoint and timeouts in `config`.
    pub fn from_config(
        config: &GlobalConfig,
        api_key: Option<SecretString>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            config.completions_url(),
            api_key,
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CompletionClient for HttpCompletionClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancellationToken,
        mut on_delta: Option<DeltaSink<'_>>,
    ) -> Result<Completion, CompletionError> {
        if cancel.is_cancelled() {
            return Err(CompletionError::Aborted {
                partial: String::new(),
            });
        }

        let mut stream = create_completion_stream(
            &self.client,
            &self.url,
            request.clone(),
            self.api_key.as_ref(),
        );
        let mut completion = Completion::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(
                        model = %request.model,
                        received_bytes = completion.text.len(),
                        "completion aborted"
                    );
                    return Err(CompletionError::Aborted { partial: completion.text });
                }
                next = stream.next() => next,
            };

            let Some(event) = next else {
                return Ok(completion);
            };
            match event? {
                StreamEvent::TextDelta { text } => {
                    if let Some(sink) = on_delta.as_deref_mut() {
                        sink(&text);
                    }
                    completion.text.push_str(&text);
                }
                StreamEvent::Finish { reason } => completion.finish_reason = Some(reason),
                StreamEvent::Usage(usage) => completion.usage = Some(usage),
                StreamEvent::Done => return Ok(completion),
            }
        }
    }
}
