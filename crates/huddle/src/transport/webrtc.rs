//! [`PeerTransport`] backed by a webrtc-rs peer connection.
//!
//! Outbound tracks are `TrackLocalStaticSample`s (Opus for audio, VP8 for
//! camera and screen); feeding them samples is up to the capture pipeline,
//! which gets the track through [`WebRtcTransport::sample_track`].
//!
//! The initiator opens a control data channel before its first offer, so an
//! offer made before any track is bound still carries ICE credentials and a
//! DTLS fingerprint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{HuddleError, HuddleResult};
use crate::media::LocalTrack;
use crate::transport::{
    PeerTransport, PeerTransportFactory, RemoteTrack, SenderId, TransportEvent, TransportState,
};
use crate::types::{
    EndpointId, IceCandidate, Role, SdpType, SessionDescription, SessionId, TrackKind,
};

const SCREEN_STREAM_PREFIX: &str = "screen-";
const CONTROL_CHANNEL_LABEL: &str = "huddle-control";

/// Builds one peer connection per link from a shared ICE server list.
pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        session_id: &SessionId,
        _local_id: &EndpointId,
        remote_id: &EndpointId,
        role: Role,
    ) -> HuddleResult<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(&self.ice_servers, role).await?;
        debug!(
            target = "huddle::transport",
            session_id = %session_id,
            remote = %remote_id,
            "webrtc peer connection created"
        );
        Ok(Arc::new(transport) as Arc<dyn PeerTransport>)
    }
}

struct Sender {
    rtp: Arc<RTCRtpSender>,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    control: Option<Arc<RTCDataChannel>>,
    senders: Mutex<HashMap<SenderId, Sender>>,
    next_sender: Mutex<u64>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebRtcTransport {
    pub async fn new(ice_servers: &[String], role: Role) -> HuddleResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(HuddleError::transport)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(HuddleError::transport)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(HuddleError::transport)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let tx = events_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(err) => {
                            warn!(target = "huddle::transport", error = %err, "bad local candidate")
                        }
                    }
                })
            }));
        }
        {
            let tx = events_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(TransportEvent::StateChanged(map_state(state)));
                })
            }));
        }
        {
            let tx = events_tx;
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let tx = tx.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        _ if track.stream_id().starts_with(SCREEN_STREAM_PREFIX) => {
                            TrackKind::Screen
                        }
                        _ => TrackKind::Video,
                    };
                    let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        kind,
                    }));
                })
            }));
        }

        let control = match role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let channel = pc
                    .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(HuddleError::transport)?;
                Some(channel)
            }
            // The responder learns the channel from the offer.
            Role::Responder => None,
        };

        Ok(Self {
            pc,
            control,
            senders: Mutex::new(HashMap::new()),
            next_sender: Mutex::new(0),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// The sample track behind `sender`, for writing encoded media.
    pub fn sample_track(&self, sender: SenderId) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders.lock().get(&sender).map(|s| s.track.clone())
    }

    fn sample_track_for(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        let (mime_type, stream_id) = match track.binding.kind {
            TrackKind::Audio => (MIME_TYPE_OPUS, format!("audio-{}", track.binding.id)),
            TrackKind::Video => (MIME_TYPE_VP8, format!("video-{}", track.binding.id)),
            TrackKind::Screen => (
                MIME_TYPE_VP8,
                format!("{SCREEN_STREAM_PREFIX}{}", track.binding.id),
            ),
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.binding.id.to_string(),
            stream_id,
        ))
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Connecting => TransportState::Checking,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
        _ => TransportState::New,
    }
}

fn to_rtc(description: SessionDescription) -> HuddleResult<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(HuddleError::transport)
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> HuddleResult<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(HuddleError::transport)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(HuddleError::transport)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> HuddleResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(HuddleError::transport)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(HuddleError::transport)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> HuddleResult<()> {
        self.pc
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(HuddleError::transport)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> HuddleResult<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(HuddleError::transport)
    }

    async fn add_track(&self, track: &LocalTrack) -> HuddleResult<SenderId> {
        let sample = Self::sample_track_for(track);
        let rtp = self
            .pc
            .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(HuddleError::transport)?;
        let id = {
            let mut next = self.next_sender.lock();
            *next += 1;
            SenderId(*next)
        };
        self.senders.lock().insert(
            id,
            Sender {
                rtp,
                kind: track.binding.kind,
                track: sample,
            },
        );
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> HuddleResult<bool> {
        let (rtp, kind) = {
            let senders = self.senders.lock();
            let entry = senders
                .get(&sender)
                .ok_or_else(|| HuddleError::invalid_state(format!("unknown {sender}")))?;
            (entry.rtp.clone(), entry.kind)
        };
        if kind != track.binding.kind {
            return Ok(false);
        }
        let sample = Self::sample_track_for(track);
        rtp.replace_track(Some(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(HuddleError::transport)?;
        if let Some(entry) = self.senders.lock().get_mut(&sender) {
            entry.track = sample;
        }
        Ok(true)
    }

    async fn remove_track(&self, sender: SenderId) -> HuddleResult<()> {
        let Some(entry) = self.senders.lock().remove(&sender) else {
            return Ok(());
        };
        self.pc
            .remove_track(&entry.rtp)
            .await
            .map_err(HuddleError::transport)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        self.senders.lock().clear();
        if let Some(control) = &self.control {
            let _ = control.close().await;
        }
        if let Err(err) = self.pc.close().await {
            debug!(target = "huddle::transport", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn trackless_offer_can_be_answered() {
        let initiator = WebRtcTransport::new(&[], Role::Initiator).await.unwrap();
        let responder = WebRtcTransport::new(&[], Role::Responder).await.unwrap();

        let offer = initiator.create_offer(false).await.unwrap();
        assert!(offer.sdp.contains("m=application"), "{}", offer.sdp);
        assert!(offer.sdp.contains("a=ice-ufrag:"));
        assert!(offer.sdp.contains("a=fingerprint:"));

        responder.set_remote_description(offer).await.unwrap();
        let answer = responder.create_answer().await.unwrap();
        assert!(answer.sdp.contains("m=application"));
        initiator.set_remote_description(answer).await.unwrap();

        initiator.close().await;
        responder.close().await;
    }
}
