use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EndpointId, TrackKind};

/// Errors surfaced by every huddle component. The enum is serializable so the
/// relay server can hand the exact variant back to a remote caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum HuddleError {
    #[error("a connect request to {target} is already pending")]
    AlreadyPending { target: EndpointId },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("the request expired before the decision arrived")]
    TooLate,
    #[error("{target} did not acknowledge before the deadline")]
    TargetUnreachable { target: EndpointId },
    #[error("permission to capture {kind} was denied")]
    PermissionDenied { kind: TrackKind },
    #[error("no {kind} capture device is available")]
    DeviceUnavailable { kind: TrackKind },
    #[error("transport failed: {0}")]
    TransportFailed(String),
    #[error("signaling relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
    #[error("{0} is closed")]
    Closed(String),
}

impl HuddleError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        HuddleError::InvalidState(message.into())
    }

    pub fn relay_unavailable(message: impl Into<String>) -> Self {
        HuddleError::RelayUnavailable(message.into())
    }

    pub fn transport(message: impl ToString) -> Self {
        HuddleError::TransportFailed(message.to_string())
    }

    /// Short machine-readable name, used as a metrics label and log field.
    pub fn code(&self) -> &'static str {
        match self {
            HuddleError::AlreadyPending { .. } => "already_pending",
            HuddleError::InvalidState(_) => "invalid_state",
            HuddleError::TooLate => "too_late",
            HuddleError::TargetUnreachable { .. } => "target_unreachable",
            HuddleError::PermissionDenied { .. } => "permission_denied",
            HuddleError::DeviceUnavailable { .. } => "device_unavailable",
            HuddleError::TransportFailed(_) => "transport_failed",
            HuddleError::RelayUnavailable(_) => "relay_unavailable",
            HuddleError::UnknownEndpoint(_) => "unknown_endpoint",
            HuddleError::InvalidSessionId(_) => "invalid_session_id",
            HuddleError::Closed(_) => "closed",
        }
    }
}

pub type HuddleResult<T> = Result<T, HuddleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_survive_the_wire() {
        let cases = vec![
            HuddleError::AlreadyPending {
                target: EndpointId::from("654321"),
            },
            HuddleError::TooLate,
            HuddleError::PermissionDenied {
                kind: TrackKind::Video,
            },
            HuddleError::RelayUnavailable("socket closed".into()),
        ];
        for err in cases {
            let json = serde_json::to_string(&err).unwrap();
            let back: HuddleError = serde_json::from_str(&json).unwrap();
            assert_eq!(back, err);
        }
    }

    #[test]
    fn wire_shape_is_code_and_detail() {
        let json = serde_json::to_value(HuddleError::TooLate).unwrap();
        assert_eq!(json, serde_json::json!({ "code": "too_late" }));

        let json = serde_json::to_value(HuddleError::UnknownEndpoint("x".into())).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "code": "unknown_endpoint", "detail": "x" })
        );
    }
}
