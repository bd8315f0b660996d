//! BoxCompletionClient -- object-safe dynamic dispatch wrapper for CompletionClient.
//!
//! 1. `CompletionClientDyn` is object-safe with a boxed future
//! 2. Blanket-impl `CompletionClientDyn` for all `T: CompletionClient`
//! 3. `BoxCompletionClient` wraps `Box<dyn CompletionClientDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use colloquy_types::error::CompletionError;
use colloquy_types::llm::{ChatCompletionRequest, Completion};
use tokio_util::sync::CancellationToken;

use super::client::{CompletionClient, DeltaSink};

/// Object-safe version of [`CompletionClient`] with a boxed future.
pub trait CompletionClientDyn: Send + Sync {
    fn name(&self) -> &str;

    fn send_boxed<'a>(
        &'a self,
        request: &'a ChatCompletionRequest,
        cancel: &'a CancellationToken,
        on_delta: Option<DeltaSink<'a>>,
    ) -> Pin<Box<dyn Future<Output = Result<Completion, CompletionError>> + Send + 'a>>;
}

impl<T: CompletionClient> CompletionClientDyn for T {
    fn name(&self) -> &str {
        CompletionClient::name(self)
    }

    fn send_boxed<'a>(
        &'a self,
        request: &'a ChatCompletionRequest,
        cancel: &'a CancellationToken,
        on_delta: Option<DeltaSink<'a>>,
    ) -> Pin<Box<dyn Future<Output = Result<Completion, CompletionError>> + Send + 'a>> {
        Box::pin(self.send(request, cancel, on_delta))
    }
}

/// Type-erased completion client.
///
/// `CompletionClient` uses RPITIT and cannot be a trait object directly;
/// this wrapper lets the controller hold any client behind one type.
pub struct BoxCompletionClient {
    inner: Box<dyn CompletionClientDyn>,
}

impl BoxCompletionClient {
    pub fn new<T: CompletionClient + 'static>(client: T) -> Self {
        Self {
            inner: Box::new(client),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Send one request. See [`CompletionClient::send`].
    pub async fn send<'a>(
        &'a self,
        request: &'a ChatCompletionRequest,
        cancel: &'a CancellationToken,
        on_delta: Option<DeltaSink<'a>>,
    ) -> Result<Completion, CompletionError> {
        self.inner.send_boxed(request, cancel, on_delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_types::llm::{MessageRole, ModelConfig, RequestMessage};

    struct EchoClient;

    impl CompletionClient for EchoClient {
        fn name(&self) -> &str {
            "echo"
        }

        async fn send(
            &self,
            request: &ChatCompletionRequest,
            _cancel: &CancellationToken,
            mut on_delta: Option<DeltaSink<'_>>,
        ) -> Result<Completion, CompletionError> {
            let text = request.model.clone();
            if let Some(sink) = on_delta.as_deref_mut() {
                sink(&text);
            }
            Ok(Completion {
                text,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn box_client_delegates_name_and_send() {
        let client = BoxCompletionClient::new(EchoClient);
        assert_eq!(client.name(), "echo");

        let request = ChatCompletionRequest::new(
            &ModelConfig::default().for_model("m1"),
            vec![RequestMessage::text(MessageRole::User, "hi")],
        );
        let mut seen = Vec::new();
        let mut sink = |d: &str| seen.push(d.to_string());
        let completion = client
            .send(&request, &CancellationToken::new(), Some(&mut sink))
            .await
            .unwrap();

        assert_eq!(completion.text, "m1");
        assert_eq!(seen, vec!["m1"]);
    }
}
