//! Per-peer negotiation state machine.
//!
//! A [`PeerLink`] is a handle to an actor task that owns the transport, the
//! two inbound slot subscriptions and the candidate queue. Everything the
//! outside world learns about the link comes through the status watch and
//! the take-once event stream.

use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::HuddleConfig;
use crate::error::{HuddleError, HuddleResult};
use crate::media::{LocalTrack, ReplaceOutcome};
use crate::metrics::{ACTIVE_LINKS, LINK_TRANSITIONS};
use crate::relay::{SignalingRelay, Subscription};
use crate::signal::{SignalPayload, SignalingEnvelope};
use crate::transport::{PeerTransport, RemoteTrack, SenderId, TransportEvent, TransportState};
use crate::types::{EndpointId, IceCandidate, Role, SessionDescription, SessionId, TrackId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Offering,
    AwaitingAnswer,
    AwaitingRemoteCandidates,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    fn handshake_rank(self) -> Option<u8> {
        match self {
            LinkState::Idle => Some(0),
            LinkState::Offering => Some(1),
            LinkState::AwaitingAnswer => Some(2),
            LinkState::AwaitingRemoteCandidates => Some(3),
            LinkState::Connected => Some(4),
            _ => None,
        }
    }

    /// Forward moves along the handshake, the reconnect loop, and failure or
    /// close from anywhere not yet closed.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Closed, _) => false,
            (Failed, Closed) => true,
            (Failed, _) => false,
            (_, Failed | Closed) => true,
            (Connected, Reconnecting) | (Reconnecting, Connected) => true,
            (from, to) => match (from.handshake_rank(), to.handshake_rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::AwaitingAnswer => "awaiting_answer",
            LinkState::AwaitingRemoteCandidates => "awaiting_remote_candidates",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The path was lost and the reconnect attempt did not bring it back,
    /// or the transport reported a hard error.
    TransportFailed(String),
    /// The link never reached Connected.
    NegotiationTimedOut,
    /// The remote side said bye.
    RemoteLeft,
    RelayUnavailable(String),
}

impl FailureReason {
    pub fn to_error(&self) -> HuddleError {
        match self {
            FailureReason::TransportFailed(detail) => HuddleError::TransportFailed(detail.clone()),
            FailureReason::NegotiationTimedOut => {
                HuddleError::TransportFailed("negotiation timed out".into())
            }
            FailureReason::RemoteLeft => HuddleError::Closed("remote peer".into()),
            FailureReason::RelayUnavailable(detail) => HuddleError::RelayUnavailable(detail.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub round: u32,
    pub failure: Option<FailureReason>,
    pub local_tracks: Vec<TrackId>,
    pub remote_tracks: Vec<RemoteTrack>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    StateChanged {
        state: LinkState,
        failure: Option<FailureReason>,
    },
    Renegotiated {
        round: u32,
    },
    RemoteTrackAdded(RemoteTrack),
}

#[derive(Debug, Clone)]
pub struct LinkParams {
    pub session_id: SessionId,
    pub local_id: EndpointId,
    pub remote_id: EndpointId,
    pub role: Role,
}

enum LinkCommand {
    AddTrack {
        track: LocalTrack,
        reply: oneshot::Sender<HuddleResult<()>>,
    },
    ReplaceTrack {
        track: LocalTrack,
        reply: oneshot::Sender<HuddleResult<ReplaceOutcome>>,
    },
    RemoveTrack {
        track_id: TrackId,
        reply: oneshot::Sender<HuddleResult<()>>,
    },
    Renegotiate {
        ice_restart: bool,
        reply: oneshot::Sender<HuddleResult<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct LinkShared {
    params: LinkParams,
    commands: mpsc::UnboundedSender<LinkCommand>,
    status: watch::Receiver<LinkStatus>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

/// Handle to a running link. Clones share the same actor; the link closes
/// when `close` is called or every handle is gone.
#[derive(Clone)]
pub struct PeerLink {
    shared: Arc<LinkShared>,
}

impl PeerLink {
    /// Subscribes to the inbound slots and starts the actor. An initiator
    /// publishes its first offer immediately.
    pub async fn spawn(
        params: LinkParams,
        relay: Arc<dyn SignalingRelay>,
        transport: Arc<dyn PeerTransport>,
        config: &HuddleConfig,
    ) -> HuddleResult<PeerLink> {
        let transport_events = transport
            .take_events()
            .ok_or_else(|| HuddleError::invalid_state("transport events were already taken"))?;
        let descriptions = relay
            .subscribe(&params.session_id, params.role.remote_description_slot())
            .await?;
        let candidates = relay
            .subscribe(&params.session_id, params.role.remote_candidate_slot())
            .await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(LinkStatus {
            state: LinkState::Idle,
            round: 0,
            failure: None,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
        });

        let driver = LinkDriver {
            session_id: params.session_id.clone(),
            local_id: params.local_id.clone(),
            remote_id: params.remote_id.clone(),
            role: params.role,
            relay,
            transport,
            descriptions,
            candidates,
            transport_events,
            commands: commands_rx,
            status_tx,
            events_tx,
            state: LinkState::Idle,
            round: 0,
            local_ice_round: 0,
            remote_ice_round: None,
            remote_round: None,
            awaiting_answer: false,
            offer_restarted: false,
            renegotiation: None,
            queued: Vec::new(),
            senders: Vec::new(),
            remote_tracks: Vec::new(),
            failure: None,
            negotiation_deadline: Some(Instant::now() + config.negotiation_timeout),
            reconnect_deadline: None,
            negotiation_timeout: config.negotiation_timeout,
            reconnect_timeout: config.reconnect_timeout,
        };
        tokio::spawn(driver.run());

        Ok(PeerLink {
            shared: Arc::new(LinkShared {
                params,
                commands: commands_tx,
                status: status_rx,
                events: Mutex::new(Some(events_rx)),
            }),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.shared.params.session_id
    }

    pub fn local_id(&self) -> &EndpointId {
        &self.shared.params.local_id
    }

    pub fn remote_id(&self) -> &EndpointId {
        &self.shared.params.remote_id
    }

    pub fn role(&self) -> Role {
        self.shared.params.role
    }

    pub fn state(&self) -> LinkState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.shared.status.clone()
    }

    /// Event stream of the link; only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.shared.events.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_terminal()
    }

    /// Waits until `predicate` holds for the status, or the actor is gone.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&LinkStatus) -> bool) -> LinkStatus {
        let mut rx = self.shared.status.clone();
        let result = rx.wait_for(|status| predicate(status)).await.map(|status| status.clone());
        match result {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Resolves once the link is Connected; fails if it ends first.
    pub async fn connected(&self) -> HuddleResult<()> {
        let status = self
            .wait_until(|status| status.state == LinkState::Connected || status.state.is_terminal())
            .await;
        match status.state {
            LinkState::Connected => Ok(()),
            _ => Err(status
                .failure
                .map(|reason| reason.to_error())
                .unwrap_or_else(|| HuddleError::Closed("link".into()))),
        }
    }

    pub async fn add_track(&self, track: LocalTrack) -> HuddleResult<()> {
        self.request(|reply| LinkCommand::AddTrack { track, reply })
            .await?
    }

    /// Swaps the source of the sender bound to `track.binding.id`.
    pub async fn replace_track(&self, track: LocalTrack) -> HuddleResult<ReplaceOutcome> {
        self.request(|reply| LinkCommand::ReplaceTrack { track, reply })
            .await?
    }

    pub async fn remove_track(&self, track_id: &TrackId) -> HuddleResult<()> {
        let track_id = track_id.clone();
        self.request(|reply| LinkCommand::RemoveTrack { track_id, reply })
            .await?
    }

    /// Starts a new offer round on a connected link.
    pub async fn renegotiate(&self, ice_restart: bool) -> HuddleResult<()> {
        self.request(|reply| LinkCommand::Renegotiate { ice_restart, reply })
            .await?
    }

    /// Stops senders, says bye, unsubscribes and closes the transport.
    /// Returns once the link is Closed. Idempotent.
    pub async fn close(&self) {
        let _ = self.request(|reply| LinkCommand::Close { reply }).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LinkCommand,
    ) -> HuddleResult<T> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .commands
            .send(build(tx))
            .map_err(|_| HuddleError::Closed("link".into()))?;
        rx.await.map_err(|_| HuddleError::Closed("link".into()))
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("session_id", self.session_id())
            .field("remote_id", self.remote_id())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

struct LinkDriver {
    session_id: SessionId,
    local_id: EndpointId,
    remote_id: EndpointId,
    role: Role,
    relay: Arc<dyn SignalingRelay>,
    transport: Arc<dyn PeerTransport>,
    descriptions: Subscription<SignalingEnvelope>,
    candidates: Subscription<SignalingEnvelope>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    status_tx: watch::Sender<LinkStatus>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    state: LinkState,
    /// Current negotiation round.
    round: u32,
    /// Round that started the local ICE generation; tags outgoing candidates.
    local_ice_round: u32,
    /// Round that started the remote ICE generation, once its description is applied.
    remote_ice_round: Option<u32>,
    /// Last offer round applied by a responder.
    remote_round: Option<u32>,
    awaiting_answer: bool,
    offer_restarted: bool,
    /// A renegotiation that has to wait for the current one; the flag asks for an ICE restart.
    renegotiation: Option<bool>,
    queued: Vec<(u32, IceCandidate)>,
    senders: Vec<(TrackId, SenderId)>,
    remote_tracks: Vec<RemoteTrack>,
    failure: Option<FailureReason>,
    negotiation_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    negotiation_timeout: Duration,
    reconnect_timeout: Duration,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

impl LinkDriver {
    async fn run(mut self) {
        ACTIVE_LINKS.inc();
        info!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            role = %self.role,
            "peer link started"
        );
        if self.role == Role::Initiator {
            self.start_offer(false).await;
        }

        while !self.state.is_terminal() {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.shutdown().await,
                },
                envelope = self.descriptions.recv() => match envelope {
                    Some(envelope) => self.on_description(envelope).await,
                    None => {
                        self.fail(FailureReason::RelayUnavailable("description stream ended".into()))
                            .await
                    }
                },
                envelope = self.candidates.recv() => match envelope {
                    Some(envelope) => self.on_candidate_slot(envelope).await,
                    None => {
                        self.fail(FailureReason::RelayUnavailable("candidate stream ended".into()))
                            .await
                    }
                },
                Some(event) = self.transport_events.recv() => self.on_transport_event(event).await,
                _ = sleep_until_opt(deadline) => self.on_deadline().await,
            }
        }

        // Answer whatever was queued behind the final transition.
        while let Ok(command) = self.commands.try_recv() {
            self.reject(command);
        }
        ACTIVE_LINKS.dec();
        debug!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            "peer link task finished"
        );
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.negotiation_deadline, self.reconnect_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn reject(&self, command: LinkCommand) {
        let closed = || HuddleError::Closed("link".into());
        match command {
            LinkCommand::AddTrack { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            LinkCommand::ReplaceTrack { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            LinkCommand::RemoveTrack { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            LinkCommand::Renegotiate { reply, .. } => {
                let _ = reply.send(Err(closed()));
            }
            LinkCommand::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::AddTrack { track, reply } => {
                let result = self.add_track(track).await;
                let _ = reply.send(result);
            }
            LinkCommand::ReplaceTrack { track, reply } => {
                let result = self.replace_track(track).await;
                let _ = reply.send(result);
            }
            LinkCommand::RemoveTrack { track_id, reply } => {
                let result = self.remove_track(&track_id).await;
                let _ = reply.send(result);
            }
            LinkCommand::Renegotiate { ice_restart, reply } => {
                let result = if self.state == LinkState::Connected {
                    self.request_renegotiation(ice_restart).await;
                    Ok(())
                } else {
                    Err(HuddleError::invalid_state(format!(
                        "cannot renegotiate while {}",
                        self.state
                    )))
                };
                let _ = reply.send(result);
            }
            LinkCommand::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn add_track(&mut self, track: LocalTrack) -> HuddleResult<()> {
        if self.senders.iter().any(|(id, _)| id == &track.binding.id) {
            return Err(HuddleError::invalid_state(format!(
                "track {} is already bound to this link",
                track.binding.id
            )));
        }
        let sender = self.transport.add_track(&track).await?;
        self.senders.push((track.binding.id.clone(), sender));
        self.publish_status();
        self.tracks_changed().await;
        Ok(())
    }

    async fn replace_track(&mut self, track: LocalTrack) -> HuddleResult<ReplaceOutcome> {
        let index = self.sender_index(&track.binding.id)?;
        let sender = self.senders[index].1;
        if self.transport.replace_track(sender, &track).await? {
            return Ok(ReplaceOutcome::InPlace);
        }
        self.transport.remove_track(sender).await?;
        let replacement = self.transport.add_track(&track).await?;
        self.senders[index].1 = replacement;
        self.tracks_changed().await;
        Ok(ReplaceOutcome::Renegotiated)
    }

    async fn remove_track(&mut self, track_id: &TrackId) -> HuddleResult<()> {
        let index = self.sender_index(track_id)?;
        let (_, sender) = self.senders.remove(index);
        self.transport.remove_track(sender).await?;
        self.publish_status();
        self.tracks_changed().await;
        Ok(())
    }

    fn sender_index(&self, track_id: &TrackId) -> HuddleResult<usize> {
        self.senders
            .iter()
            .position(|(id, _)| id == track_id)
            .ok_or_else(|| {
                HuddleError::invalid_state(format!("track {track_id} is not bound to this link"))
            })
    }

    // Outbound tracks changed: renegotiate now, or remember to once the
    // current handshake settles. An answer cannot add media sections the
    // offer lacked, so a responder asks for a fresh offer even when its
    // tracks were bound before the first one arrived.
    async fn tracks_changed(&mut self) {
        match self.state {
            LinkState::Connected => self.request_renegotiation(false).await,
            _ => {
                self.renegotiation.get_or_insert(false);
            }
        }
    }

    async fn request_renegotiation(&mut self, ice_restart: bool) {
        match self.role {
            Role::Initiator => self.request_offer(ice_restart).await,
            Role::Responder => {
                let envelope = SignalingEnvelope::on_candidate_slot(
                    self.session_id.clone(),
                    self.role.candidate_slot(),
                    self.local_id.clone(),
                    self.round,
                    SignalPayload::RenegotiationRequest { ice_restart },
                );
                debug!(
                    target = "huddle::link",
                    session_id = %self.session_id,
                    remote = %self.remote_id,
                    ice_restart,
                    "asking initiator for a new offer"
                );
                if let Err(err) = self.relay.publish(envelope).await {
                    self.fail(FailureReason::RelayUnavailable(err.to_string())).await;
                }
            }
        }
    }

    async fn request_offer(&mut self, ice_restart: bool) {
        if self.awaiting_answer {
            if ice_restart && !self.offer_restarted {
                self.start_offer(true).await;
            } else if !ice_restart {
                self.renegotiation.get_or_insert(false);
            }
            return;
        }
        self.start_offer(ice_restart).await;
    }

    async fn start_offer(&mut self, ice_restart: bool) {
        self.round += 1;
        let fresh_ice = ice_restart || self.round == 1;
        if self.state == LinkState::Idle {
            self.set_state(LinkState::Offering);
        }
        let offer = match self.transport.create_offer(ice_restart).await {
            Ok(offer) => offer,
            Err(err) => {
                self.fail(FailureReason::TransportFailed(err.to_string())).await;
                return;
            }
        };
        if fresh_ice {
            self.local_ice_round = self.round;
        }
        self.offer_restarted = fresh_ice;
        self.awaiting_answer = true;
        if self.round > 1 {
            // Restarts are bounded by the reconnect window instead.
            self.negotiation_deadline =
                (!fresh_ice).then(|| Instant::now() + self.negotiation_timeout);
        }

        let envelope = SignalingEnvelope::description(
            self.session_id.clone(),
            self.local_id.clone(),
            self.round,
            offer,
            fresh_ice,
        );
        if let Err(err) = self.relay.publish(envelope).await {
            self.fail(FailureReason::RelayUnavailable(err.to_string())).await;
            return;
        }
        debug!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            round = self.round,
            ice_restart = fresh_ice,
            "offer published"
        );
        if self.state == LinkState::Offering {
            self.set_state(LinkState::AwaitingAnswer);
        }
        if self.round > 1 {
            let _ = self.events_tx.send(LinkEvent::Renegotiated { round: self.round });
        }
        self.publish_status();
    }

    async fn on_description(&mut self, envelope: SignalingEnvelope) {
        if envelope.from != self.remote_id {
            warn!(
                target = "huddle::link",
                session_id = %self.session_id,
                from = %envelope.from,
                "ignoring description from unexpected sender"
            );
            return;
        }
        let SignalPayload::Description {
            description,
            ice_restart,
        } = envelope.payload
        else {
            return;
        };
        match self.role {
            Role::Responder => self.on_remote_offer(envelope.round, description, ice_restart).await,
            Role::Initiator => self.on_remote_answer(envelope.round, description).await,
        }
    }

    async fn on_remote_offer(&mut self, round: u32, offer: SessionDescription, ice_restart: bool) {
        if self.remote_round.is_some_and(|applied| round <= applied) {
            debug!(
                target = "huddle::link",
                session_id = %self.session_id,
                round,
                "dropping stale offer"
            );
            return;
        }
        if let Err(err) = self.transport.set_remote_description(offer).await {
            self.fail(FailureReason::TransportFailed(err.to_string())).await;
            return;
        }
        self.remote_round = Some(round);
        self.round = round;
        if ice_restart {
            self.remote_ice_round = Some(round);
            self.local_ice_round = round;
        }
        self.flush_candidates().await;

        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.fail(FailureReason::TransportFailed(err.to_string())).await;
                return;
            }
        };
        let envelope = SignalingEnvelope::description(
            self.session_id.clone(),
            self.local_id.clone(),
            round,
            answer,
            ice_restart,
        );
        if let Err(err) = self.relay.publish(envelope).await {
            self.fail(FailureReason::RelayUnavailable(err.to_string())).await;
            return;
        }
        debug!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            round,
            "answer published"
        );
        if self.state == LinkState::Idle {
            self.set_state(LinkState::AwaitingRemoteCandidates);
        }
        if round > 1 {
            let _ = self.events_tx.send(LinkEvent::Renegotiated { round });
        }
        self.publish_status();
    }

    async fn on_remote_answer(&mut self, round: u32, answer: SessionDescription) {
        if !self.awaiting_answer || round != self.round {
            debug!(
                target = "huddle::link",
                session_id = %self.session_id,
                round,
                current = self.round,
                "dropping stale answer"
            );
            return;
        }
        if let Err(err) = self.transport.set_remote_description(answer).await {
            self.fail(FailureReason::TransportFailed(err.to_string())).await;
            return;
        }
        self.awaiting_answer = false;
        if self.offer_restarted {
            self.remote_ice_round = Some(round);
        }
        if self.state == LinkState::Connected {
            self.negotiation_deadline = None;
        }
        self.flush_candidates().await;
        if self.state == LinkState::AwaitingAnswer {
            self.set_state(LinkState::AwaitingRemoteCandidates);
        }
        if let Some(ice_restart) = self.renegotiation.take() {
            self.start_offer(ice_restart).await;
        }
    }

    async fn on_candidate_slot(&mut self, envelope: SignalingEnvelope) {
        if envelope.from != self.remote_id {
            warn!(
                target = "huddle::link",
                session_id = %self.session_id,
                from = %envelope.from,
                "ignoring candidate slot message from unexpected sender"
            );
            return;
        }
        match envelope.payload {
            SignalPayload::Candidate { candidate } => {
                self.on_remote_candidate(envelope.round, candidate).await
            }
            SignalPayload::RenegotiationRequest { ice_restart } if self.role == Role::Initiator => {
                if !self.state.is_terminal() {
                    self.request_offer(ice_restart).await;
                }
            }
            SignalPayload::Bye => self.fail(FailureReason::RemoteLeft).await,
            _ => {}
        }
    }

    async fn on_remote_candidate(&mut self, round: u32, candidate: IceCandidate) {
        match self.remote_ice_round {
            Some(current) if round == current => self.apply_candidate(candidate).await,
            Some(current) if round < current => {
                trace!(
                    target = "huddle::link",
                    session_id = %self.session_id,
                    round,
                    current,
                    "dropping candidate from an earlier ICE generation"
                );
            }
            _ => self.queued.push((round, candidate)),
        }
    }

    // Applies queued candidates of the current remote generation in arrival
    // order and keeps the ones that belong to a later generation.
    async fn flush_candidates(&mut self) {
        let Some(current) = self.remote_ice_round else {
            return;
        };
        let queued = std::mem::take(&mut self.queued);
        for (round, candidate) in queued {
            if round == current {
                self.apply_candidate(candidate).await;
            } else if round > current {
                self.queued.push((round, candidate));
            }
        }
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(err) = self.transport.add_ice_candidate(candidate).await {
            warn!(
                target = "huddle::link",
                session_id = %self.session_id,
                remote = %self.remote_id,
                error = %err,
                "failed to apply remote candidate"
            );
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let envelope = SignalingEnvelope::on_candidate_slot(
                    self.session_id.clone(),
                    self.role.candidate_slot(),
                    self.local_id.clone(),
                    self.local_ice_round,
                    SignalPayload::Candidate { candidate },
                );
                if let Err(err) = self.relay.publish(envelope).await {
                    self.fail(FailureReason::RelayUnavailable(err.to_string())).await;
                }
            }
            TransportEvent::StateChanged(state) => self.on_transport_state(state).await,
            TransportEvent::RemoteTrack(track) => {
                if !self.remote_tracks.contains(&track) {
                    self.remote_tracks.push(track.clone());
                    let _ = self.events_tx.send(LinkEvent::RemoteTrackAdded(track));
                    self.publish_status();
                }
            }
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        trace!(
            target = "huddle::link",
            session_id = %self.session_id,
            transport_state = ?state,
            link_state = %self.state,
            "transport state changed"
        );
        match (state, self.state) {
            (TransportState::Connected, LinkState::Connected) => {}
            (TransportState::Connected, current) if !current.is_terminal() => {
                self.negotiation_deadline = None;
                self.reconnect_deadline = None;
                self.set_state(LinkState::Connected);
                if let Some(ice_restart) = self.renegotiation.take() {
                    self.request_renegotiation(ice_restart).await;
                }
            }
            (TransportState::Disconnected | TransportState::Failed, LinkState::Connected) => {
                self.enter_reconnecting().await;
            }
            (TransportState::Failed, LinkState::Reconnecting) => {
                self.fail(FailureReason::TransportFailed("ice restart failed".into()))
                    .await;
            }
            (TransportState::Failed, _) => {
                self.fail(FailureReason::TransportFailed(
                    "transport failed before connecting".into(),
                ))
                .await;
            }
            (TransportState::Closed, _) => {
                self.fail(FailureReason::TransportFailed("transport closed".into()))
                    .await;
            }
            _ => {}
        }
    }

    async fn enter_reconnecting(&mut self) {
        warn!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            window_secs = self.reconnect_timeout.as_secs(),
            "path lost, attempting ICE restart"
        );
        self.set_state(LinkState::Reconnecting);
        self.reconnect_deadline = Some(Instant::now() + self.reconnect_timeout);
        self.request_renegotiation(true).await;
    }

    async fn on_deadline(&mut self) {
        let now = Instant::now();
        if self.negotiation_deadline.is_some_and(|deadline| now >= deadline) {
            self.negotiation_deadline = None;
            self.fail(FailureReason::NegotiationTimedOut).await;
            return;
        }
        if self.reconnect_deadline.is_some_and(|deadline| now >= deadline) {
            self.reconnect_deadline = None;
            if self.state == LinkState::Reconnecting {
                self.fail(FailureReason::TransportFailed("reconnect window elapsed".into()))
                    .await;
            }
        }
    }

    async fn fail(&mut self, reason: FailureReason) {
        if self.state.is_terminal() {
            return;
        }
        warn!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            reason = ?reason,
            "peer link failed"
        );
        self.failure = Some(reason);
        self.set_state(LinkState::Failed);
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if self.state == LinkState::Closed {
            return;
        }
        let senders = std::mem::take(&mut self.senders);
        for (_, sender) in senders {
            let _ = self.transport.remove_track(sender).await;
        }

        let say_bye = !matches!(
            self.failure,
            Some(FailureReason::RemoteLeft | FailureReason::RelayUnavailable(_))
        );
        if say_bye {
            let bye = SignalingEnvelope::on_candidate_slot(
                self.session_id.clone(),
                self.role.candidate_slot(),
                self.local_id.clone(),
                self.round,
                SignalPayload::Bye,
            );
            if let Err(err) = self.relay.publish(bye).await {
                debug!(
                    target = "huddle::link",
                    session_id = %self.session_id,
                    error = %err,
                    "bye not delivered"
                );
            }
        }

        self.descriptions.unsubscribe();
        self.candidates.unsubscribe();
        self.transport.close().await;
        self.queued.clear();
        self.negotiation_deadline = None;
        self.reconnect_deadline = None;
        self.set_state(LinkState::Closed);
    }

    fn set_state(&mut self, next: LinkState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(
                target = "huddle::link",
                session_id = %self.session_id,
                from = %self.state,
                to = %next,
                "ignoring invalid transition"
            );
            return false;
        }
        info!(
            target = "huddle::link",
            session_id = %self.session_id,
            remote = %self.remote_id,
            from = %self.state,
            to = %next,
            round = self.round,
            "link state changed"
        );
        self.state = next;
        LINK_TRANSITIONS
            .with_label_values(&[next.as_str(), self.role.as_str()])
            .inc();
        self.publish_status();
        let _ = self.events_tx.send(LinkEvent::StateChanged {
            state: next,
            failure: self.failure.clone(),
        });
        true
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(LinkStatus {
            state: self.state,
            round: self.round,
            failure: self.failure.clone(),
            local_tracks: self.senders.iter().map(|(id, _)| id.clone()).collect(),
            remote_tracks: self.remote_tracks.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_only_moves_forward() {
        use LinkState::*;
        assert!(Idle.can_transition_to(Offering));
        assert!(Idle.can_transition_to(AwaitingRemoteCandidates));
        assert!(AwaitingAnswer.can_transition_to(Connected));
        assert!(!AwaitingRemoteCandidates.can_transition_to(AwaitingAnswer));
        assert!(!Connected.can_transition_to(Offering));
        assert!(!Idle.can_transition_to(Reconnecting));
    }

    #[test]
    fn reconnect_loop_and_terminal_states() {
        use LinkState::*;
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Closed));
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Closed));
    }

    #[test]
    fn failure_reasons_map_to_errors() {
        assert_eq!(
            FailureReason::NegotiationTimedOut.to_error(),
            HuddleError::TransportFailed("negotiation timed out".into())
        );
        assert!(matches!(
            FailureReason::RelayUnavailable("gone".into()).to_error(),
            HuddleError::RelayUnavailable(_)
        ));
    }
}
