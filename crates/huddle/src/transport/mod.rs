//! Seam between the negotiation core and the media stack that owns the actual
//! peer connection.

#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::HuddleResult;
use crate::media::LocalTrack;
use crate::types::{EndpointId, IceCandidate, Role, SessionDescription, SessionId, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Checking,
    Connected,
    /// Path lost; may recover on its own or after an ICE restart.
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

/// Handle for one outbound sender created by [`PeerTransport::add_track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SenderId(pub u64);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sender-{}", self.0)
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self, ice_restart: bool) -> HuddleResult<SessionDescription>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> HuddleResult<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> HuddleResult<()>;

    /// Fails when no remote description has been applied yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> HuddleResult<()>;

    async fn add_track(&self, track: &LocalTrack) -> HuddleResult<SenderId>;

    /// Swaps the source of an existing sender. `Ok(false)` means the
    /// transport cannot do it without renegotiation.
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> HuddleResult<bool>;

    async fn remove_track(&self, sender: SenderId) -> HuddleResult<()>;

    /// Event stream of the transport; only the first caller gets it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &SessionId,
        local_id: &EndpointId,
        remote_id: &EndpointId,
        role: Role,
    ) -> HuddleResult<Arc<dyn PeerTransport>>;
}
