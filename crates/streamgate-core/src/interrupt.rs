//! Interrupt request handling, independent of the transport.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::registry::{CancelOutcome, StreamInterruptRegistry};

/// Request to interrupt an active streaming request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamingInterruptRequest {
    pub request_id: String,
}

impl StreamingInterruptRequest {
    /// Request identifiers are UUIDs; anything else is rejected up front.
    pub fn validate(&self) -> Result<(), String> {
        Uuid::parse_str(&self.request_id)
            .map(|_| ())
            .map_err(|_| format!("Improper request ID {}", self.request_id))
    }
}

/// Body returned for an interrupt request that found a visible stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingInterruptResponse {
    pub request_id: String,
    pub interrupted: bool,
    pub message: String,
}

/// What the transport should render.
#[derive(Debug, Clone, PartialEq)]
pub enum InterruptResult {
    Interrupted(StreamingInterruptResponse),
    /// Known identifier, but not interruptible by this caller (wrong owner
    /// or already finished). The two cases are indistinguishable here.
    NotInterrupted(StreamingInterruptResponse),
    NotFound { request_id: String },
}

pub const INTERRUPTED_MESSAGE: &str = "Streaming request interrupted";
pub const NOT_INTERRUPTED_MESSAGE: &str =
    "Streaming request could not be interrupted; it is not active for this user";

/// Try to interrupt `request_id` on behalf of `caller_id`.
pub fn interrupt_stream(
    registry: &StreamInterruptRegistry,
    request_id: &str,
    caller_id: &str,
) -> InterruptResult {
    let outcome = registry.cancel_stream(request_id, caller_id);
    info!(
        request_id = %request_id,
        user_id = %caller_id,
        outcome = outcome.as_str(),
        "Interrupt request processed"
    );

    match outcome {
        CancelOutcome::Cancelled => InterruptResult::Interrupted(StreamingInterruptResponse {
            request_id: request_id.to_string(),
            interrupted: true,
            message: INTERRUPTED_MESSAGE.to_string(),
        }),
        CancelOutcome::NotFound => InterruptResult::NotFound {
            request_id: request_id.to_string(),
        },
        CancelOutcome::Forbidden | CancelOutcome::AlreadyDone => {
            InterruptResult::NotInterrupted(StreamingInterruptResponse {
                request_id: request_id.to_string(),
                interrupted: false,
                message: NOT_INTERRUPTED_MESSAGE.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StreamHandle;

    const REQUEST_ID: &str = "123e4567-e89b-12d3-a456-426614174003";

    #[test]
    fn test_validate_request_id() {
        let valid = StreamingInterruptRequest {
            request_id: REQUEST_ID.to_string(),
        };
        let invalid = StreamingInterruptRequest {
            request_id: "not-a-uuid".to_string(),
        };

        assert!(valid.validate().is_ok());
        assert_eq!(
            invalid.validate().unwrap_err(),
            "Improper request ID not-a-uuid"
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let parsed: Result<StreamingInterruptRequest, _> =
            serde_json::from_str(r#"{"request_id": "x", "user_id": "alice"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_interrupt_owned_stream() {
        let registry = StreamInterruptRegistry::new();
        let handle = StreamHandle::new();
        registry.register(REQUEST_ID, "alice", handle.clone());

        let result = interrupt_stream(&registry, REQUEST_ID, "alice");

        match result {
            InterruptResult::Interrupted(response) => {
                assert!(response.interrupted);
                assert_eq!(response.request_id, REQUEST_ID);
                assert_eq!(response.message, INTERRUPTED_MESSAGE);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_wrong_owner_and_finished_look_the_same() {
        let registry = StreamInterruptRegistry::new();
        registry.register(REQUEST_ID, "alice", StreamHandle::new());

        let foreign = interrupt_stream(&registry, REQUEST_ID, "bob");
        assert!(registry.cancel(REQUEST_ID, "alice"));
        let finished = interrupt_stream(&registry, REQUEST_ID, "alice");

        assert_eq!(foreign, finished);
        match foreign {
            InterruptResult::NotInterrupted(response) => {
                assert!(!response.interrupted);
                assert!(!response.message.contains("alice"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_request_is_not_found() {
        let registry = StreamInterruptRegistry::new();

        assert_eq!(
            interrupt_stream(&registry, REQUEST_ID, "alice"),
            InterruptResult::NotFound {
                request_id: REQUEST_ID.to_string()
            }
        );
    }
}
