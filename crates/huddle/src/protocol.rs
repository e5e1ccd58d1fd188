//! JSON messages exchanged between [`RelayClient`](crate::relay::RelayClient)
//! and the `huddle-road` server over one WebSocket.
//!
//! Requests carry a `call_id` that the matching [`ServerMessage::Reply`]
//! echoes. Streams (slot subscriptions, roster changes, incoming requests)
//! are keyed by a client-chosen `subscription_id`.

use serde::{Deserialize, Serialize};

use crate::broker::{ConnectRequest, RequestId};
use crate::error::HuddleError;
use crate::relay::{MembershipChange, MeshMember};
use crate::signal::SignalingEnvelope;
use crate::types::{Endpoint, EndpointId, SessionId, Slot};

pub type CallId = u64;
pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a connection; binds it to an endpoint.
    Hello { endpoint: Endpoint },
    Publish {
        call_id: CallId,
        envelope: SignalingEnvelope,
    },
    Subscribe {
        call_id: CallId,
        subscription_id: SubscriptionId,
        session_id: SessionId,
        slot: Slot,
    },
    Unsubscribe { subscription_id: SubscriptionId },
    JoinMesh {
        call_id: CallId,
        subscription_id: SubscriptionId,
        mesh_id: SessionId,
        member: MeshMember,
    },
    LeaveMesh {
        call_id: CallId,
        mesh_id: SessionId,
    },
    /// Proposes a connection from the hello'd endpoint to `target_id`.
    Propose {
        call_id: CallId,
        target_id: EndpointId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Withdraws one proposal made on this connection.
    WithdrawRequest {
        call_id: CallId,
        request_id: RequestId,
    },
    /// The hello'd endpoint acknowledges its pending incoming request.
    Acknowledge { call_id: CallId },
    Decide { call_id: CallId, accept: bool },
    /// Withdraws every pending request made by the hello'd endpoint.
    Withdraw { call_id: CallId },
    WatchIncoming { subscription_id: SubscriptionId },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyBody {
    Done,
    Request { request: ConnectRequest },
    Roster { members: Vec<MeshMember> },
    Withdrawn { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        endpoint_id: EndpointId,
    },
    Reply {
        call_id: CallId,
        result: Result<ReplyBody, HuddleError>,
    },
    Delivered {
        subscription_id: SubscriptionId,
        envelope: SignalingEnvelope,
    },
    Membership {
        subscription_id: SubscriptionId,
        change: MembershipChange,
    },
    /// Status change of a request this connection proposed.
    RequestUpdate {
        request: ConnectRequest,
    },
    Incoming {
        subscription_id: SubscriptionId,
        request: Option<ConnectRequest>,
    },
    Pong,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalPayload;
    use crate::types::SessionDescription;

    #[test]
    fn client_messages_use_type_tag() {
        let message = ClientMessage::Propose {
            call_id: 7,
            target_id: EndpointId::from("654321"),
            timeout_ms: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "propose");
        assert_eq!(json["target_id"], "654321");
        assert!(json.get("timeout_ms").is_none());

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"decide","call_id":3,"accept":true}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Decide { call_id: 3, accept: true });
    }

    #[test]
    fn errors_survive_the_reply() {
        let reply = ServerMessage::Reply {
            call_id: 1,
            result: Err(HuddleError::AlreadyPending {
                target: EndpointId::from("654321"),
            }),
        };
        let text = serde_json::to_string(&reply).unwrap();
        let back: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn delivered_envelope_keeps_payload() {
        let envelope = SignalingEnvelope::description(
            SessionId::parse("s-1").unwrap(),
            EndpointId::from("a"),
            2,
            SessionDescription::offer("v=0"),
            true,
        );
        let message = ServerMessage::Delivered {
            subscription_id: 9,
            envelope,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "delivered");
        assert_eq!(json["envelope"]["slot"], "offer");
        let back: ServerMessage = serde_json::from_value(json).unwrap();
        let ServerMessage::Delivered { envelope, .. } = back else {
            panic!("expected delivered");
        };
        assert!(matches!(
            envelope.payload,
            SignalPayload::Description { ice_restart: true, .. }
        ));
    }
}
