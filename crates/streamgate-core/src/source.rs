//! Token source abstractions.
//!
//! A token source is the upstream inference call seen as an ordered,
//! possibly unbounded sequence of text fragments. Sources are pulled one
//! fragment at a time; each pull may suspend until upstream data arrives.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

use crate::error::Result;
use crate::events::TurnMetadata;

/// Ordered sequence of text fragments produced by an inference call.
#[async_trait]
pub trait TokenSource: Send {
    /// Pull the next fragment.
    ///
    /// `Ok(None)` signals normal end of stream, `Err` an upstream failure.
    async fn next_fragment(&mut self) -> Result<Option<String>>;

    /// Metadata collected while streaming, read after a normal end.
    fn turn_metadata(&self) -> TurnMetadata {
        TurnMetadata::default()
    }
}

/// Boxed fragment stream accepted by [`StreamTokenSource`].
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Adapts any fragment stream into a [`TokenSource`].
pub struct StreamTokenSource {
    inner: FragmentStream,
    metadata: TurnMetadata,
}

impl StreamTokenSource {
    pub fn new(stream: impl Stream<Item = Result<String>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
            metadata: TurnMetadata::default(),
        }
    }

    /// Attach metadata reported once the stream ends.
    pub fn with_metadata(mut self, metadata: TurnMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
impl TokenSource for StreamTokenSource {
    async fn next_fragment(&mut self) -> Result<Option<String>> {
        self.inner.next().await.transpose()
    }

    fn turn_metadata(&self) -> TurnMetadata {
        self.metadata.clone()
    }
}

/// Parameters for opening a token source.
#[derive(Debug, Clone, Default)]
pub struct InferenceRequest {
    pub query: String,
    pub conversation_id: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
}

/// Backend selection seam: opens a token source for one request.
#[async_trait]
pub trait TokenSourceFactory: Send + Sync {
    /// Provider name, e.g. "openai".
    fn provider(&self) -> &str;

    /// Default model used when the request does not name one.
    fn model(&self) -> &str;

    /// Start the upstream call. Failures here happen before any event is
    /// emitted and are reported as [`StreamError::Backend`](crate::StreamError::Backend).
    async fn open(&self, request: &InferenceRequest) -> Result<Box<dyn TokenSource>>;
}
