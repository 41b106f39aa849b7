//! In-memory registry of interruptible streaming sessions.
//!
//! Every running session is registered under its request identifier
//! together with the identity that started it and the [`StreamHandle`]
//! driving it. A caller may only interrupt sessions it owns.
//!
//! All operations go through one mutex around the map. The lock is never
//! held across an await point and cancellation is delivered as a
//! non-blocking signal, so no operation waits for a session to stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

/// Cancellable handle of the unit of work producing one stream.
///
/// Clones share state: the registry keeps one clone, the session task
/// another.
#[derive(Debug, Clone, Default)]
pub struct StreamHandle {
    token: CancellationToken,
    finished: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the cancellation signal. Does not wait for the work to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record that the unit of work reached a terminal state on its own.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Whether the unit of work is in any terminal state.
    pub fn is_done(&self) -> bool {
        self.is_finished() || self.is_cancelled()
    }

    /// Resolves once [`StreamHandle::cancel`] has been called.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// One registered streaming session.
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub owner_id: String,
    pub handle: StreamHandle,
}

/// Outcome of an interrupt attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The signal was delivered to a running session.
    Cancelled,
    /// Nothing is registered under the identifier.
    NotFound,
    /// The session belongs to someone else.
    Forbidden,
    /// The session already reached a terminal state.
    AlreadyDone,
}

impl CancelOutcome {
    pub fn is_cancelled(self) -> bool {
        matches!(self, CancelOutcome::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::NotFound => "not_found",
            CancelOutcome::Forbidden => "forbidden",
            CancelOutcome::AlreadyDone => "already_done",
        }
    }
}

/// Registry of active streams keyed by request identifier.
#[derive(Debug, Default)]
pub struct StreamInterruptRegistry {
    streams: Mutex<HashMap<String, ActiveStream>>,
}

impl StreamInterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running session.
    ///
    /// Re-using an identifier silently replaces the previous record;
    /// identifier uniqueness is the caller's responsibility.
    pub fn register(&self, request_id: &str, owner_id: &str, handle: StreamHandle) {
        let previous = self.streams.lock().insert(
            request_id.to_string(),
            ActiveStream {
                owner_id: owner_id.to_string(),
                handle,
            },
        );
        if previous.is_some() {
            debug!(request_id = %request_id, "Replaced existing stream registration");
        }
    }

    /// Interrupt a session on behalf of `caller_id`.
    ///
    /// Lookup, ownership check and cancellation happen under one lock
    /// acquisition so a concurrent [`deregister`](Self::deregister) cannot
    /// slip in between the check and the signal.
    pub fn cancel_stream(&self, request_id: &str, caller_id: &str) -> CancelOutcome {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(request_id) else {
            return CancelOutcome::NotFound;
        };
        if stream.owner_id != caller_id {
            warn!(
                user_id = %caller_id,
                request_id = %request_id,
                "User attempted to interrupt a streaming request owned by another user"
            );
            return CancelOutcome::Forbidden;
        }
        if stream.handle.is_done() {
            return CancelOutcome::AlreadyDone;
        }
        stream.handle.cancel();
        CancelOutcome::Cancelled
    }

    /// Boolean form of [`cancel_stream`](Self::cancel_stream): `true` only
    /// when a cancellation signal reached a still-running session.
    pub fn cancel(&self, request_id: &str, caller_id: &str) -> bool {
        self.cancel_stream(request_id, caller_id).is_cancelled()
    }

    /// Remove a session once it reached a terminal state. No-op if absent.
    pub fn deregister(&self, request_id: &str) {
        if self.streams.lock().remove(request_id).is_some() {
            debug!(request_id = %request_id, "Stream deregistered");
        }
    }

    /// Snapshot of a registered session.
    pub fn lookup(&self, request_id: &str) -> Option<ActiveStream> {
        self.streams.lock().get(request_id).cloned()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every registered session, regardless of owner. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let streams = self.streams.lock();
        let mut cancelled = 0;
        for stream in streams.values() {
            if !stream.handle.is_done() {
                stream.handle.cancel();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(count = cancelled, "Cancelled active streams");
        }
        cancelled
    }
}
