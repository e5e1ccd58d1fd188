//! Consent-gated peer-to-peer calls: a request broker for "may I connect?",
//! a slot-based signaling relay, the per-link negotiation state machine, full
//! mesh sessions and local media tracks.

pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod link;
pub mod media;
pub mod mesh;
pub mod metrics;
pub mod protocol;
pub mod relay;
pub mod signal;
pub mod sim;
pub mod transport;
pub mod types;

pub use broker::{
    ConnectRequest, ExpiryReason, RequestBroker, RequestHandle, RequestId, RequestOutcome,
    RequestStatus,
};
pub use config::HuddleConfig;
pub use directory::{Directory, DirectoryEntry, InMemoryDirectory};
pub use error::{HuddleError, HuddleResult};
pub use link::{FailureReason, LinkEvent, LinkParams, LinkState, LinkStatus, PeerLink};
pub use media::{
    CaptureConstraints, CaptureDevices, CaptureSource, LocalTrack, MediaTrackController,
    ReplaceOutcome, TrackBinding,
};
pub use mesh::{LeaveReason, MeshDeps, MeshEvent, MeshSession, MeshSnapshot};
pub use relay::{
    MemoryRelay, MembershipChange, MeshMember, RelayClient, Roster, SignalingRelay, Subscription,
};
pub use signal::{SignalPayload, SignalingEnvelope};
pub use transport::{PeerTransport, PeerTransportFactory, TransportEvent, TransportState};
pub use types::{
    Endpoint, EndpointId, IceCandidate, Role, SdpType, SessionDescription, SessionId, Slot,
    TrackId, TrackKind,
};
