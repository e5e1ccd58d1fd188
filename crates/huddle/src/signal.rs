use serde::{Deserialize, Serialize};

use crate::error::{HuddleError, HuddleResult};
use crate::types::{EndpointId, IceCandidate, SdpType, SessionDescription, SessionId, Slot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Description {
        description: SessionDescription,
        /// The description starts a new ICE generation.
        #[serde(default)]
        ice_restart: bool,
    },
    Candidate { candidate: IceCandidate },
    /// Sent by a responder that needs the initiator to start a new offer round.
    RenegotiationRequest { ice_restart: bool },
    Bye,
}

impl SignalPayload {
    pub fn label(&self) -> &'static str {
        match self {
            SignalPayload::Description { .. } => "description",
            SignalPayload::Candidate { .. } => "candidate",
            SignalPayload::RenegotiationRequest { .. } => "renegotiation_request",
            SignalPayload::Bye => "bye",
        }
    }
}

/// A single handshake message addressed to one slot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub session_id: SessionId,
    pub slot: Slot,
    pub from: EndpointId,
    /// Negotiation round. Starts at 1 with the first offer and increments on
    /// every re-offer. Candidates carry the round that started their ICE
    /// generation instead.
    pub round: u32,
    pub payload: SignalPayload,
}

impl SignalingEnvelope {
    pub fn description(
        session_id: SessionId,
        from: EndpointId,
        round: u32,
        description: SessionDescription,
        ice_restart: bool,
    ) -> Self {
        let slot = match description.sdp_type {
            SdpType::Offer => Slot::Offer,
            SdpType::Answer => Slot::Answer,
        };
        Self {
            session_id,
            slot,
            from,
            round,
            payload: SignalPayload::Description {
                description,
                ice_restart,
            },
        }
    }

    pub fn on_candidate_slot(
        session_id: SessionId,
        slot: Slot,
        from: EndpointId,
        round: u32,
        payload: SignalPayload,
    ) -> Self {
        Self {
            session_id,
            slot,
            from,
            round,
            payload,
        }
    }

    /// Checks that the payload may travel on the envelope's slot: description
    /// slots only carry a description of the matching type, candidate slots
    /// carry everything else.
    pub fn validate(&self) -> HuddleResult<()> {
        let ok = match (&self.slot, &self.payload) {
            (Slot::Offer, SignalPayload::Description { description, .. }) => {
                description.sdp_type == SdpType::Offer
            }
            (Slot::Answer, SignalPayload::Description { description, .. }) => {
                description.sdp_type == SdpType::Answer
            }
            (Slot::Offer | Slot::Answer, _) => false,
            (_, SignalPayload::Description { .. }) => false,
            _ => true,
        };
        if ok {
            Ok(())
        } else {
            Err(HuddleError::invalid_state(format!(
                "{} payload cannot be published to the {} slot",
                self.payload.label(),
                self.slot
            )))
        }
    }
}
