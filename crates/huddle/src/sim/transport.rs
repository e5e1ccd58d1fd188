use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{HuddleError, HuddleResult};
use crate::media::LocalTrack;
use crate::transport::{
    PeerTransport, PeerTransportFactory, RemoteTrack, SenderId, TransportEvent, TransportState,
};
use crate::types::{
    EndpointId, IceCandidate, Role, SdpType, SessionDescription, SessionId, TrackId, TrackKind,
};

const UFRAG_PREFIX: &str = "a=ice-ufrag:";
const TRACK_PREFIX: &str = "a=huddle-track:";

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Local candidates gathered per ICE generation.
    pub candidates_per_description: usize,
    /// Whether senders can swap their source without renegotiation.
    pub in_place_replace: bool,
    /// When false no transport ever finds a path.
    pub connect: bool,
    /// When true a path lost by `drop_path` never comes back.
    pub fail_restarts: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            candidates_per_description: 2,
            in_place_replace: true,
            connect: true,
            fail_restarts: false,
        }
    }
}

/// Deterministic stand-in for a real peer connection stack. A transport
/// reports Connected once both descriptions are applied and at least one
/// remote candidate of the current ICE generation arrived.
#[derive(Clone, Default)]
pub struct SimNetwork {
    transports: Arc<DashMap<(SessionId, EndpointId), Arc<SimTransport>>>,
    options: Arc<Mutex<SimOptions>>,
    next_serial: Arc<AtomicU64>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SimOptions) -> Self {
        Self {
            transports: Arc::default(),
            options: Arc::new(Mutex::new(options)),
            next_serial: Arc::default(),
        }
    }

    pub fn update_options(&self, update: impl FnOnce(&mut SimOptions)) {
        update(&mut self.options.lock());
    }

    pub fn transport(&self, session_id: &SessionId, endpoint: &EndpointId) -> Option<Arc<SimTransport>> {
        self.transports
            .get(&(session_id.clone(), endpoint.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Latest transport created for `endpoint` toward `remote`.
    pub fn transport_between(
        &self,
        endpoint: &EndpointId,
        remote: &EndpointId,
    ) -> Option<Arc<SimTransport>> {
        self.transports
            .iter()
            .filter(|entry| &entry.key().1 == endpoint && &entry.value().remote_id == remote)
            .max_by_key(|entry| entry.value().serial)
            .map(|entry| entry.value().clone())
    }

    /// Loses the path on both ends of the session.
    pub fn drop_path(&self, session_id: &SessionId) {
        for entry in self.transports.iter() {
            if &entry.key().0 == session_id {
                entry.value().drop_path();
            }
        }
    }
}

#[async_trait]
impl PeerTransportFactory for SimNetwork {
    async fn create(
        &self,
        session_id: &SessionId,
        local_id: &EndpointId,
        remote_id: &EndpointId,
        role: Role,
    ) -> HuddleResult<Arc<dyn PeerTransport>> {
        // Closed transports stay inspectable until the next one is created.
        self.transports.retain(|_, transport| !transport.is_closed());
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(SimTransport::new(
            session_id.clone(),
            local_id.clone(),
            remote_id.clone(),
            role,
            serial,
            self.options.clone(),
        ));
        self.transports
            .insert((session_id.clone(), local_id.clone()), transport.clone());
        Ok(transport as Arc<dyn PeerTransport>)
    }
}

#[derive(Default)]
struct SimState {
    generation: u32,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_ufrag: Option<String>,
    negotiating: bool,
    awaiting_restart: bool,
    remote_restarted: bool,
    remote_candidates: usize,
    connection: Option<TransportState>,
    applied_candidates: Vec<IceCandidate>,
    offers: u32,
    answers: u32,
    ice_restarts: u32,
    replacements: u32,
    next_sender: u64,
    senders: BTreeMap<SenderId, (TrackId, TrackKind)>,
    remote_tracks: HashSet<String>,
    closed: bool,
}

pub struct SimTransport {
    session_id: SessionId,
    local_id: EndpointId,
    remote_id: EndpointId,
    role: Role,
    serial: u64,
    options: Arc<Mutex<SimOptions>>,
    state: Mutex<SimState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl SimTransport {
    fn new(
        session_id: SessionId,
        local_id: EndpointId,
        remote_id: EndpointId,
        role: Role,
        serial: u64,
        options: Arc<Mutex<SimOptions>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            local_id,
            remote_id,
            role,
            serial,
            options,
            state: Mutex::new(SimState::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.state.lock().offers
    }

    pub fn answers_created(&self) -> u32 {
        self.state.lock().answers
    }

    pub fn ice_restarts(&self) -> u32 {
        self.state.lock().ice_restarts
    }

    pub fn replacements(&self) -> u32 {
        self.state.lock().replacements
    }

    pub fn sending(&self) -> Vec<TrackId> {
        self.state
            .lock()
            .senders
            .values()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn connection_state(&self) -> TransportState {
        self.state.lock().connection.unwrap_or(TransportState::New)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn drop_path(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.awaiting_restart = true;
        state.remote_candidates = 0;
        self.set_connection(&mut state, TransportState::Disconnected);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_connection(&self, state: &mut SimState, next: TransportState) {
        if state.connection == Some(next) {
            return;
        }
        state.connection = Some(next);
        self.emit(TransportEvent::StateChanged(next));
    }

    fn ufrag(&self, generation: u32) -> String {
        format!("{}-{}", self.local_id, generation)
    }

    fn render_sdp(&self, state: &SimState) -> String {
        let mut sdp = format!(
            "v=0\r\no=sim {} {} IN IP4 127.0.0.1\r\ns=huddle\r\n{UFRAG_PREFIX}{}\r\n",
            self.local_id,
            state.generation,
            self.ufrag(state.generation)
        );
        for (track, kind) in state.senders.values() {
            sdp.push_str(&format!("{TRACK_PREFIX}{kind}:{track}\r\n"));
        }
        sdp
    }

    fn gather_candidates(&self, state: &SimState) {
        let count = self.options.lock().candidates_per_description;
        let ufrag = self.ufrag(state.generation);
        for index in 0..count {
            self.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{index} 1 udp 2130706431 sim {ufrag} typ host"),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
        }
    }

    fn maybe_connect(&self, state: &mut SimState) {
        if state.closed || state.negotiating || state.local.is_none() || state.remote.is_none() {
            return;
        }
        if state.connection == Some(TransportState::Connected) || state.awaiting_restart {
            return;
        }
        let options = self.options.lock().clone();
        if !options.connect {
            return;
        }
        if options.candidates_per_description > 0 && state.remote_candidates == 0 {
            return;
        }
        let restarting = state.connection == Some(TransportState::Disconnected);
        if restarting && options.fail_restarts {
            self.set_connection(state, TransportState::Failed);
            return;
        }
        self.set_connection(state, TransportState::Checking);
        self.set_connection(state, TransportState::Connected);
    }

    fn start_generation(&self, state: &mut SimState) {
        state.generation += 1;
        if state.generation > 1 {
            state.ice_restarts += 1;
        }
        state.awaiting_restart = false;
        state.remote_candidates = 0;
    }
}

fn ufrag_of(sdp: &str) -> Option<&str> {
    sdp.lines().find_map(|line| line.strip_prefix(UFRAG_PREFIX))
}

fn tracks_of(sdp: &str) -> Vec<(String, TrackKind)> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix(TRACK_PREFIX))
        .filter_map(|rest| {
            let (kind, id) = rest.split_once(':')?;
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                "screen" => TrackKind::Screen,
                _ => return None,
            };
            Some((id.to_string(), kind))
        })
        .collect()
}

#[async_trait]
impl PeerTransport for SimTransport {
    async fn create_offer(&self, ice_restart: bool) -> HuddleResult<SessionDescription> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HuddleError::Closed("transport".into()));
        }
        let fresh_generation = ice_restart || state.generation == 0;
        if fresh_generation {
            self.start_generation(&mut state);
        }
        state.offers += 1;
        state.negotiating = true;
        let offer = SessionDescription::offer(self.render_sdp(&state));
        state.local = Some(offer.clone());
        if fresh_generation {
            self.gather_candidates(&state);
        }
        trace!(target = "huddle::sim", local = %self.local_id, ice_restart, "offer created");
        Ok(offer)
    }

    async fn create_answer(&self) -> HuddleResult<SessionDescription> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HuddleError::Closed("transport".into()));
        }
        let remote_is_offer = state
            .remote
            .as_ref()
            .is_some_and(|remote| remote.sdp_type == SdpType::Offer);
        if !state.negotiating || !remote_is_offer {
            return Err(HuddleError::transport("no remote offer to answer"));
        }
        let fresh_generation =
            state.generation == 0 || state.awaiting_restart || state.remote_restarted;
        state.remote_restarted = false;
        if fresh_generation {
            self.start_generation(&mut state);
        }
        state.answers += 1;
        state.negotiating = false;
        let answer = SessionDescription::answer(self.render_sdp(&state));
        state.local = Some(answer.clone());
        if fresh_generation {
            self.gather_candidates(&state);
        }
        self.maybe_connect(&mut state);
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> HuddleResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HuddleError::Closed("transport".into()));
        }
        match description.sdp_type {
            SdpType::Offer if state.negotiating => {
                return Err(HuddleError::transport("offer collision"));
            }
            SdpType::Answer if !state.negotiating => {
                return Err(HuddleError::transport("answer without a pending offer"));
            }
            _ => {}
        }
        let ufrag = ufrag_of(&description.sdp).map(str::to_string);
        if ufrag != state.remote_ufrag {
            state.remote_restarted = description.sdp_type == SdpType::Offer;
            state.remote_ufrag = ufrag;
            state.remote_candidates = 0;
        }
        for (id, kind) in tracks_of(&description.sdp) {
            if state.remote_tracks.insert(id.clone()) {
                self.emit(TransportEvent::RemoteTrack(RemoteTrack { id, kind }));
            }
        }
        state.negotiating = description.sdp_type == SdpType::Offer;
        state.remote = Some(description);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> HuddleResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HuddleError::Closed("transport".into()));
        }
        if state.remote.is_none() {
            return Err(HuddleError::transport(
                "remote description must be set before adding candidates",
            ));
        }
        let current = state
            .remote_ufrag
            .as_deref()
            .is_some_and(|ufrag| candidate.candidate.contains(&format!(" {ufrag} ")));
        if current {
            state.remote_candidates += 1;
        }
        state.applied_candidates.push(candidate);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> HuddleResult<SenderId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(HuddleError::Closed("transport".into()));
        }
        state.next_sender += 1;
        let sender = SenderId(state.next_sender);
        state
            .senders
            .insert(sender, (track.binding.id.clone(), track.binding.kind));
        Ok(sender)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> HuddleResult<bool> {
        let in_place = self.options.lock().in_place_replace;
        let mut state = self.state.lock();
        let Some((_, kind)) = state.senders.get(&sender).cloned() else {
            return Err(HuddleError::invalid_state(format!("unknown {sender}")));
        };
        if !in_place || kind != track.binding.kind {
            return Ok(false);
        }
        state.replacements += 1;
        Ok(true)
    }

    async fn remove_track(&self, sender: SenderId) -> HuddleResult<()> {
        self.state.lock().senders.remove(&sender);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.senders.clear();
        self.set_connection(&mut state, TransportState::Closed);
    }
}
