//! HTTP response body to [`StreamEvent`] adapter.
//!
//! Sends one chat-completion POST, checks the status, then picks a framing
//! from the response `Content-Type`:
//! - `application/json` (or a request with `stream: false`): one full body,
//!   surfaced as a single `TextDelta` followed by `Finish`/`Usage`/`Done`
//! - `text/event-stream`: events decoded by [`decode_event_stream`]
//! - anything else: newline-delimited JSON fed through [`NdjsonDecoder`]

use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use secrecy::{ExposeSecret, SecretString};

use colloquy_types::error::CompletionError;
use colloquy_types::llm::{ChatCompletionRequest, StreamEvent};

use super::sse::{NdjsonDecoder, decode_event_stream, decode_full_body};

/// Create the event stream for one completion request.
///
/// Dropping the returned stream drops the underlying connection.
pub fn create_completion_stream(
    client: &reqwest::Client,
    url: &str,
    body: ChatCompletionRequest,
    api_key: Option<&SecretString>,
) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, CompletionError>> + Send + 'static>> {
    let client = client.clone();
    let url = url.to_string();
    let bearer = api_key.map(|key| key.expose_secret().to_string());

    Box::pin(async_stream::try_stream! {
        let mut request = client.post(&url).json(&body);
        if let Some(token) = &bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        let response = if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %error_body, "completion endpoint error response");
            Err(CompletionError::Http {
                status: status.as_u16(),
                body: error_body,
            })?;
            unreachable!()
        } else {
            response
        };

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if !body.stream || content_type.starts_with("application/json") {
            let bytes = response.bytes().await.map_err(map_reqwest_error)?;
            let completion = decode_full_body(&bytes)?;
            if !completion.text.is_empty() {
                yield StreamEvent::TextDelta { text: completion.text };
            }
            if let Some(reason) = completion.finish_reason {
                yield StreamEvent::Finish { reason };
            }
            if let Some(usage) = completion.usage {
                yield StreamEvent::Usage(usage);
            }
            yield StreamEvent::Done;
            return;
        }

        tracing::debug!(content_type = %content_type, "decoding streamed completion");
        let byte_stream = response.bytes_stream().map(|chunk| chunk.map_err(map_reqwest_error));

        if content_type.starts_with("text/event-stream") {
            let mut events = std::pin::pin!(decode_event_stream(byte_stream));
            while let Some(event) = events.next().await {
                yield event?;
            }
            return;
        }

        let mut byte_stream = std::pin::pin!(byte_stream);
        let mut decoder = NdjsonDecoder::new();
        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                yield event;
            }
            if decoder.is_done() {
                return;
            }
        }
        for event in decoder.finish() {
            yield event;
        }
    })
}

/// Map a transport-level `reqwest` failure.
///
/// Status errors never reach here; non-2xx responses are turned into
/// `CompletionError::Http` before the body is read.
pub(crate) fn map_reqwest_error(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        CompletionError::Network(err.to_string())
    } else if err.is_decode() {
        CompletionError::Decode(err.to_string())
    } else {
        CompletionError::Unknown(err.to_string())
    }
}
