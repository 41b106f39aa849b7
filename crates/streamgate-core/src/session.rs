//! Streaming session orchestration.
//!
//! A session registers itself in the [`StreamInterruptRegistry`] before it
//! produces any output, then runs as its own tokio task: it emits `start`,
//! pulls fragments from the [`TokenSource`] and emits one `token` event per
//! fragment, and finally emits `end`. The task races every pull against the
//! session's cancellation signal, so an interrupt unwinds the loop at the
//! point where it would otherwise wait for upstream data.
//!
//! ```text
//! Created -> Registered -> Streaming -> Completed | Cancelled | Failed -> Deregistered
//! ```
//!
//! Deregistration happens exactly once on every terminal path, before the
//! event channel closes.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::events::{self, StreamEvent, TurnMetadata};
use crate::registry::{StreamHandle, StreamInterruptRegistry};
use crate::source::TokenSource;
use crate::transcript::{TranscriptRecord, TranscriptSink};

/// Default capacity of the per-session event channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 32;

/// Concatenation of every fragment emitted in one session.
#[derive(Debug, Default, Clone)]
pub struct TurnAccumulator {
    text: String,
    fragments: u64,
}

impl TurnAccumulator {
    pub fn push(&mut self, fragment: &str) {
        self.text.push_str(fragment);
        self.fragments += 1;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of fragments appended so far.
    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Terminal state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed(String),
    /// The consumer dropped the event stream before the session ended.
    Disconnected,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed(_) => "failed",
            SessionOutcome::Disconnected => "disconnected",
        }
    }
}

/// Everything the orchestrator needs to know about one request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub request_id: String,
    pub conversation_id: String,
    pub owner_id: String,
    pub query: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Remaining quota per limiter, reported in the `end` event.
    pub available_quotas: BTreeMap<String, u64>,
}

impl SessionRequest {
    pub fn new(
        request_id: impl Into<String>,
        conversation_id: impl Into<String>,
        owner_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            conversation_id: conversation_id.into(),
            owner_id: owner_id.into(),
            query: query.into(),
            provider: None,
            model: None,
            available_quotas: BTreeMap::new(),
        }
    }

    pub fn with_backend(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_available_quotas(mut self, quotas: BTreeMap<String, u64>) -> Self {
        self.available_quotas = quotas;
        self
    }
}

/// Starts streaming sessions and wires them into the registry.
#[derive(Clone)]
pub struct SessionOrchestrator {
    registry: Arc<StreamInterruptRegistry>,
    transcripts: Option<Arc<dyn TranscriptSink>>,
    channel_capacity: usize,
}

impl SessionOrchestrator {
    pub fn new(registry: Arc<StreamInterruptRegistry>) -> Self {
        Self {
            registry,
            transcripts: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_transcripts(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.transcripts = Some(sink);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<StreamInterruptRegistry> {
        &self.registry
    }

    /// Register a new session and spawn the task driving it.
    ///
    /// The session is visible in the registry when this returns, so an
    /// interrupt arriving right after stream start always finds it.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: SessionRequest, source: Box<dyn TokenSource>) -> SessionStream {
        let handle = StreamHandle::new();
        self.registry
            .register(&request.request_id, &request.owner_id, handle.clone());

        info!(
            request_id = %request.request_id,
            conversation_id = %request.conversation_id,
            user_id = %request.owner_id,
            "Streaming session registered"
        );

        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let request_id = request.request_id.clone();
        let conversation_id = request.conversation_id.clone();

        let task = SessionTask {
            registry: Arc::clone(&self.registry),
            transcripts: self.transcripts.clone(),
            request,
            handle,
            accumulator: TurnAccumulator::default(),
        };
        let join = tokio::spawn(task.run(source, sender));

        SessionStream {
            request_id,
            conversation_id,
            receiver,
            join,
        }
    }
}

/// Events of one running session, in emission order.
///
/// Yields `Err` once if the upstream source fails; the stream simply ends
/// after a cancellation, without an `end` event.
pub struct SessionStream {
    request_id: String,
    conversation_id: String,
    receiver: mpsc::Receiver<Result<StreamEvent>>,
    join: JoinHandle<SessionOutcome>,
}

impl SessionStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Stop consuming events and wait for the session's terminal state.
    pub async fn outcome(self) -> SessionOutcome {
        let SessionStream { receiver, join, .. } = self;
        drop(receiver);
        join.await.unwrap_or_else(|err| {
            SessionOutcome::Failed(format!("session task panicked: {}", err))
        })
    }

    /// Encode each event into its wire frame.
    pub fn into_frames(self) -> impl Stream<Item = Result<String>> + Send {
        futures::StreamExt::map(self, |event| event.and_then(|event| events::encode(&event)))
    }
}

impl Stream for SessionStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

enum Step {
    Continue,
    Stop(SessionOutcome),
}

struct SessionTask {
    registry: Arc<StreamInterruptRegistry>,
    transcripts: Option<Arc<dyn TranscriptSink>>,
    request: SessionRequest,
    handle: StreamHandle,
    accumulator: TurnAccumulator,
}

impl SessionTask {
    async fn run(
        mut self,
        mut source: Box<dyn TokenSource>,
        sender: mpsc::Sender<Result<StreamEvent>>,
    ) -> SessionOutcome {
        let registration = scopeguard::guard(
            (
                Arc::clone(&self.registry),
                self.request.request_id.clone(),
                self.handle.clone(),
            ),
            |(registry, request_id, handle)| {
                handle.mark_finished();
                registry.deregister(&request_id);
            },
        );

        let outcome = self.drive(source.as_mut(), &sender).await;
        self.handle.mark_finished();
        drop(registration);

        match &outcome {
            SessionOutcome::Completed => info!(
                request_id = %self.request.request_id,
                tokens = self.accumulator.fragments(),
                outcome = outcome.as_str(),
                "Streaming session finished"
            ),
            SessionOutcome::Failed(error) => warn!(
                request_id = %self.request.request_id,
                error = %error,
                outcome = outcome.as_str(),
                "Streaming session failed"
            ),
            _ => info!(
                request_id = %self.request.request_id,
                tokens = self.accumulator.fragments(),
                outcome = outcome.as_str(),
                "Streaming session stopped early"
            ),
        }

        self.hand_off_transcript(&outcome, source.turn_metadata());
        drop(sender);
        outcome
    }

    async fn drive(
        &mut self,
        source: &mut dyn TokenSource,
        sender: &mpsc::Sender<Result<StreamEvent>>,
    ) -> SessionOutcome {
        if self.handle.is_cancelled() {
            return SessionOutcome::Cancelled;
        }

        let start = StreamEvent::Start {
            conversation_id: self.request.conversation_id.clone(),
            request_id: self.request.request_id.clone(),
        };
        if let Step::Stop(outcome) = self.emit(sender, Ok(start)).await {
            return outcome;
        }

        let mut sequence_id: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.handle.cancelled() => return SessionOutcome::Cancelled,
                _ = sender.closed() => return SessionOutcome::Disconnected,
                next = source.next_fragment() => next,
            };

            match next {
                Ok(Some(fragment)) => {
                    let token = StreamEvent::Token {
                        id: sequence_id,
                        token: fragment.clone(),
                    };
                    if let Step::Stop(outcome) = self.emit(sender, Ok(token)).await {
                        return outcome;
                    }
                    self.accumulator.push(&fragment);
                    sequence_id += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    let message = err.to_string();
                    let err = match err {
                        StreamError::Upstream(_) => err,
                        other => StreamError::Upstream(other.to_string()),
                    };
                    // The consumer may already be gone; the failure is logged either way.
                    let _ = sender.send(Err(err)).await;
                    return SessionOutcome::Failed(message);
                }
            }
        }

        // Past this point an interrupt must report "not interrupted".
        self.handle.mark_finished();
        let end = StreamEvent::End {
            metadata: source.turn_metadata(),
            available_quotas: self.request.available_quotas.clone(),
        };
        match sender.send(Ok(end)).await {
            Ok(()) => SessionOutcome::Completed,
            Err(_) => SessionOutcome::Disconnected,
        }
    }

    /// Send one event unless the session is cancelled or the consumer left.
    async fn emit(
        &self,
        sender: &mpsc::Sender<Result<StreamEvent>>,
        event: Result<StreamEvent>,
    ) -> Step {
        tokio::select! {
            biased;
            _ = self.handle.cancelled() => Step::Stop(SessionOutcome::Cancelled),
            sent = sender.send(event) => match sent {
                Ok(()) => Step::Continue,
                Err(_) => Step::Stop(SessionOutcome::Disconnected),
            },
        }
    }

    fn hand_off_transcript(&mut self, outcome: &SessionOutcome, metadata: TurnMetadata) {
        let Some(sink) = self.transcripts.clone() else {
            return;
        };

        let interrupted = match outcome {
            SessionOutcome::Completed => false,
            SessionOutcome::Cancelled | SessionOutcome::Disconnected => {
                if !sink.accepts_partial() {
                    return;
                }
                true
            }
            SessionOutcome::Failed(_) => return,
        };

        let metadata = if interrupted {
            TurnMetadata {
                truncated: Some(true),
                ..TurnMetadata::default()
            }
        } else {
            metadata
        };

        let record = TranscriptRecord {
            user_id: self.request.owner_id.clone(),
            conversation_id: self.request.conversation_id.clone(),
            request_id: self.request.request_id.clone(),
            query: self.request.query.clone(),
            response: std::mem::take(&mut self.accumulator).into_text(),
            provider: self.request.provider.clone(),
            model: self.request.model.clone(),
            metadata,
            interrupted,
            timestamp: Utc::now(),
        };

        let request_id = self.request.request_id.clone();
        tokio::spawn(async move {
            match sink.store(record).await {
                Ok(()) => debug!(request_id = %request_id, "Transcript handed off"),
                Err(err) => warn!(
                    request_id = %request_id,
                    error = %err,
                    "Failed to store transcript"
                ),
            }
        });
    }
}
