//! Streamgate core - streaming session lifecycle for the inference gateway.
//!
//! This crate provides:
//! - [`StreamInterruptRegistry`]: which sessions are running and who owns them
//! - [`events`]: Server-Sent-Event wire encoding of stream events
//! - [`SessionOrchestrator`]: drives one streamed request from registration
//!   to deregistration
//! - [`interrupt_stream`]: transport-independent interrupt handling
//! - Collaborator seams: [`TokenSource`], [`TokenSourceFactory`], [`TranscriptSink`]

pub mod error;
pub mod events;
pub mod interrupt;
pub mod registry;
pub mod session;
pub mod source;
pub mod transcript;

pub use error::{Result, StreamError};
pub use events::{EVENT_STREAM_MEDIA_TYPE, ReferencedDocument, StreamEvent, TurnMetadata};
pub use interrupt::{
    InterruptResult, StreamingInterruptRequest, StreamingInterruptResponse, interrupt_stream,
};
pub use registry::{ActiveStream, CancelOutcome, StreamHandle, StreamInterruptRegistry};
pub use session::{
    SessionOrchestrator, SessionOutcome, SessionRequest, SessionStream, TurnAccumulator,
};
pub use source::{InferenceRequest, StreamTokenSource, TokenSource, TokenSourceFactory};
pub use transcript::{FileTranscriptSink, TranscriptRecord, TranscriptSink};
