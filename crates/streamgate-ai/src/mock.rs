//! Deterministic token sources for local runs and tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use streamgate_core::{
    InferenceRequest, Result, StreamError, TokenSource, TokenSourceFactory, TurnMetadata,
};
use tokio::time::{Duration, sleep};

/// Scripted behaviour of one pull.
#[derive(Debug, Clone)]
pub enum MockStepKind {
    /// Yield a fragment.
    Fragment(String),
    /// Fail with an upstream error.
    Error(String),
    /// Never produce anything again.
    Hang,
}

/// Scripted step with optional delay before it takes effect.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay_ms: u64,
    pub kind: MockStepKind,
}

impl MockStep {
    pub fn fragment(content: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Fragment(content.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Error(message.into()),
        }
    }

    pub fn hang() -> Self {
        Self {
            delay_ms: 0,
            kind: MockStepKind::Hang,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Token source replaying a fixed script, then ending normally.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTokenSource {
    script: VecDeque<MockStep>,
    metadata: TurnMetadata,
}

impl ScriptedTokenSource {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            script: VecDeque::from(steps),
            metadata: TurnMetadata::default(),
        }
    }

    /// One fragment step per value.
    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(fragments.into_iter().map(MockStep::fragment).collect())
    }

    pub fn with_metadata(mut self, metadata: TurnMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
impl TokenSource for ScriptedTokenSource {
    async fn next_fragment(&mut self) -> Result<Option<String>> {
        let Some(step) = self.script.pop_front() else {
            return Ok(None);
        };

        if step.delay_ms > 0 {
            sleep(Duration::from_millis(step.delay_ms)).await;
        }

        match step.kind {
            MockStepKind::Fragment(content) => Ok(Some(content)),
            MockStepKind::Error(message) => Err(StreamError::Upstream(message)),
            MockStepKind::Hang => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
        }
    }

    fn turn_metadata(&self) -> TurnMetadata {
        self.metadata.clone()
    }
}

/// Backend echoing the query back word by word.
#[derive(Debug, Clone)]
pub struct MockBackend {
    model: String,
    token_delay_ms: u64,
}

impl MockBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            token_delay_ms: 0,
        }
    }

    /// Pause between fragments, to make interrupts observable by hand.
    pub fn with_token_delay(mut self, delay_ms: u64) -> Self {
        self.token_delay_ms = delay_ms;
        self
    }

    /// Split `text` into fragments that keep their trailing whitespace.
    fn split_words(text: &str) -> Vec<String> {
        let mut fragments = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            current.push(ch);
            if ch.is_whitespace() {
                fragments.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            fragments.push(current);
        }
        fragments
    }
}

#[async_trait]
impl TokenSourceFactory for MockBackend {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn open(&self, request: &InferenceRequest) -> Result<Box<dyn TokenSource>> {
        let text = format!("mock-echo: {}", request.query);
        let steps = Self::split_words(&text)
            .into_iter()
            .map(|word| MockStep::fragment(word).with_delay(self.token_delay_ms))
            .collect::<Vec<_>>();
        let output_tokens = steps.len() as u64;
        let input_tokens = Self::split_words(&request.query).len() as u64;

        Ok(Box::new(ScriptedTokenSource::new(steps).with_metadata(
            TurnMetadata {
                input_tokens: Some(input_tokens),
                output_tokens: Some(output_tokens),
                ..Default::default()
            },
        )))
    }
}
