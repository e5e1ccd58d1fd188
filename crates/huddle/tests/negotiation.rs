use std::sync::Arc;
use std::time::Duration;

use huddle::sim::{SimCaptureDevices, SimNetwork, SimOptions};
use huddle::{
    CaptureConstraints, Endpoint, FailureReason, HuddleConfig, IceCandidate, LinkEvent,
    LinkParams, LinkState, MediaTrackController, MemoryRelay, PeerLink, PeerTransport,
    PeerTransportFactory, ReplaceOutcome, Role, SessionId, SignalPayload, SignalingEnvelope,
    SignalingRelay, Slot, TrackKind, TransportEvent,
};

struct Pair {
    relay: MemoryRelay,
    network: SimNetwork,
    session_id: SessionId,
    alice: Endpoint,
    bob: Endpoint,
}

impl Pair {
    fn new() -> Self {
        Self::with_options(SimOptions::default())
    }

    fn with_options(options: SimOptions) -> Self {
        init_tracing();
        Self {
            relay: MemoryRelay::new(),
            network: SimNetwork::with_options(options),
            session_id: SessionId::generate(),
            alice: Endpoint::new("alice", "Alice"),
            bob: Endpoint::new("bob", "Bob"),
        }
    }

    async fn initiator(&self) -> PeerLink {
        self.spawn(&self.alice, &self.bob, Role::Initiator).await
    }

    async fn responder(&self) -> PeerLink {
        self.spawn(&self.bob, &self.alice, Role::Responder).await
    }

    async fn spawn(&self, local: &Endpoint, remote: &Endpoint, role: Role) -> PeerLink {
        let transport = self
            .network
            .create(&self.session_id, &local.id, &remote.id, role)
            .await
            .unwrap();
        PeerLink::spawn(
            LinkParams {
                session_id: self.session_id.clone(),
                local_id: local.id.clone(),
                remote_id: remote.id.clone(),
                role,
            },
            Arc::new(self.relay.clone()) as Arc<dyn SignalingRelay>,
            transport,
            &HuddleConfig::default(),
        )
        .await
        .unwrap()
    }

    async fn connected(&self) -> (PeerLink, PeerLink) {
        let a = self.initiator().await;
        let b = self.responder().await;
        a.connected().await.unwrap();
        b.connected().await.unwrap();
        (a, b)
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

fn local_candidates(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
) -> Vec<IceCandidate> {
    let mut candidates = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TransportEvent::LocalCandidate(candidate) = event {
            candidates.push(candidate);
        }
    }
    candidates
}

fn drain_states(events: &mut tokio::sync::mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkState> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::StateChanged { state, .. } = event {
            states.push(state);
        }
    }
    states
}

#[test_timeout::tokio_timeout_test]
async fn offer_answer_round_trip_connects_both_sides() {
    let pair = Pair::new();
    let (a, b) = pair.connected().await;

    assert_eq!(a.status().round, 1);
    assert_eq!(b.status().round, 1);
    let a_transport = pair.network.transport(&pair.session_id, &pair.alice.id).unwrap();
    let b_transport = pair.network.transport(&pair.session_id, &pair.bob.id).unwrap();
    assert_eq!(a_transport.offers_created(), 1);
    assert_eq!(b_transport.answers_created(), 1);
    eventually(|| a_transport.applied_candidates().len() == 2).await;
    eventually(|| b_transport.applied_candidates().len() == 2).await;
}

#[test_timeout::tokio_timeout_test]
async fn early_candidates_are_applied_after_the_offer_in_publish_order() {
    let pair = Pair::with_options(SimOptions {
        candidates_per_description: 3,
        ..SimOptions::default()
    });
    let a = pair.initiator().await;
    eventually(|| pair.relay.waiting(&pair.session_id, Slot::CandidateA) == 3).await;
    assert_eq!(pair.relay.waiting(&pair.session_id, Slot::Offer), 1);

    let b = pair.responder().await;
    a.connected().await.unwrap();
    b.connected().await.unwrap();

    // Consumed values are cleared from the relay.
    assert_eq!(pair.relay.waiting(&pair.session_id, Slot::CandidateA), 0);
    assert_eq!(pair.relay.waiting(&pair.session_id, Slot::Offer), 0);

    let b_transport = pair.network.transport(&pair.session_id, &pair.bob.id).unwrap();
    eventually(|| b_transport.applied_candidates().len() == 3).await;
    let applied: Vec<String> = b_transport
        .applied_candidates()
        .into_iter()
        .map(|candidate| candidate.candidate)
        .collect();
    assert_eq!(applied.len(), 3);
    for (index, candidate) in applied.iter().enumerate() {
        assert!(
            candidate.starts_with(&format!("candidate:{index} ")),
            "{candidate} out of order"
        );
    }
}

// Paused clock: the sleep only completes once every task is idle, so the
// responder has taken the candidates before the offer is published.
#[test_timeout::tokio_timeout_test(30, paused)]
async fn candidates_before_the_offer_wait_for_it() {
    let pair = Pair::with_options(SimOptions {
        candidates_per_description: 3,
        ..SimOptions::default()
    });
    let b = pair.responder().await;
    let remote = pair
        .network
        .create(&pair.session_id, &pair.alice.id, &pair.bob.id, Role::Initiator)
        .await
        .unwrap();
    let mut remote_events = remote.take_events().unwrap();
    let offer = remote.create_offer(false).await.unwrap();
    let candidates = local_candidates(&mut remote_events);
    assert_eq!(candidates.len(), 3);

    for candidate in &candidates {
        pair.relay
            .publish(SignalingEnvelope::on_candidate_slot(
                pair.session_id.clone(),
                Slot::CandidateA,
                pair.alice.id.clone(),
                1,
                SignalPayload::Candidate {
                    candidate: candidate.clone(),
                },
            ))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pair.relay.waiting(&pair.session_id, Slot::CandidateA), 0);
    let b_transport = pair.network.transport(&pair.session_id, &pair.bob.id).unwrap();
    assert!(b_transport.applied_candidates().is_empty());
    assert_eq!(b.state(), LinkState::Idle);

    pair.relay
        .publish(SignalingEnvelope::description(
            pair.session_id.clone(),
            pair.alice.id.clone(),
            1,
            offer,
            true,
        ))
        .await
        .unwrap();
    eventually(|| b_transport.applied_candidates().len() == 3).await;
    assert_eq!(b_transport.applied_candidates(), candidates);
    assert_eq!(b.status().round, 1);
}

#[test_timeout::tokio_timeout_test]
async fn lost_path_recovers_through_ice_restart() {
    let pair = Pair::new();
    let (a, b) = pair.connected().await;
    let mut a_events = a.take_events().unwrap();
    drain_states(&mut a_events);

    pair.network.drop_path(&pair.session_id);
    let status = a
        .wait_until(|status| status.state == LinkState::Connected && status.round >= 2)
        .await;
    assert_eq!(status.state, LinkState::Connected);
    b.wait_until(|status| status.state == LinkState::Connected && status.round >= 2)
        .await;

    let a_transport = pair.network.transport(&pair.session_id, &pair.alice.id).unwrap();
    let b_transport = pair.network.transport(&pair.session_id, &pair.bob.id).unwrap();
    assert!(a_transport.ice_restarts() >= 1);
    assert!(b_transport.ice_restarts() >= 1);

    let states = drain_states(&mut a_events);
    assert_eq!(states, vec![LinkState::Reconnecting, LinkState::Connected]);
}

#[test_timeout::tokio_timeout_test]
async fn failed_restart_fails_the_link() {
    let pair = Pair::new();
    let (a, b) = pair.connected().await;
    pair.network.update_options(|options| options.fail_restarts = true);

    pair.network.drop_path(&pair.session_id);
    let a_status = a.wait_until(|status| status.state == LinkState::Closed).await;
    let b_status = b.wait_until(|status| status.state == LinkState::Closed).await;

    let failures = [a_status.failure, b_status.failure];
    assert!(failures.iter().all(Option::is_some));
    assert!(failures
        .iter()
        .flatten()
        .any(|failure| matches!(failure, FailureReason::TransportFailed(_))));
    assert!(pair
        .network
        .transport(&pair.session_id, &pair.alice.id)
        .unwrap()
        .is_closed());
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn reconnect_window_bounds_recovery() {
    let pair = Pair::new();
    let (a, _b) = pair.connected().await;
    pair.network.update_options(|options| options.connect = false);

    let start = tokio::time::Instant::now();
    pair.network.drop_path(&pair.session_id);
    let status = a.wait_until(|status| status.state.is_terminal()).await;
    assert!(status.failure.is_some());
    assert!(start.elapsed() <= HuddleConfig::default().reconnect_timeout + Duration::from_secs(1));
}

#[test_timeout::tokio_timeout_test(60, paused)]
async fn link_that_never_connects_times_out() {
    let pair = Pair::new();
    let a = pair.initiator().await;

    let start = tokio::time::Instant::now();
    let status = a.wait_until(|status| status.state == LinkState::Closed).await;
    assert_eq!(status.failure, Some(FailureReason::NegotiationTimedOut));
    assert!(start.elapsed() >= HuddleConfig::default().negotiation_timeout);
    assert!(a.connected().await.is_err());
}

#[test_timeout::tokio_timeout_test]
async fn binding_a_track_renegotiates_without_leaving_connected() {
    let pair = Pair::new();
    let a = pair.initiator().await;
    let mut a_events = a.take_events().unwrap();
    let b = pair.responder().await;
    a.connected().await.unwrap();
    b.connected().await.unwrap();

    let controller = MediaTrackController::new(Arc::new(SimCaptureDevices::new()));
    let track = controller
        .acquire(TrackKind::Audio, &CaptureConstraints::default())
        .await
        .unwrap();
    controller.bind(&track.id, &a).await.unwrap();

    let b_status = b
        .wait_until(|status| !status.remote_tracks.is_empty())
        .await;
    assert_eq!(b_status.remote_tracks[0].id, track.id.to_string());
    assert_eq!(b_status.remote_tracks[0].kind, TrackKind::Audio);
    assert_eq!(b_status.state, LinkState::Connected);
    assert_eq!(a.status().round, 2);
    assert_eq!(a.status().local_tracks, vec![track.id.clone()]);

    let states = drain_states(&mut a_events);
    assert_eq!(
        states,
        vec![
            LinkState::Offering,
            LinkState::AwaitingAnswer,
            LinkState::AwaitingRemoteCandidates,
            LinkState::Connected,
        ]
    );
    assert_eq!(controller.bound_links(&track.id), vec![pair.session_id.clone()]);
}

#[test_timeout::tokio_timeout_test]
async fn responder_track_change_asks_initiator_for_an_offer() {
    let pair = Pair::new();
    let (a, b) = pair.connected().await;

    let controller = MediaTrackController::new(Arc::new(SimCaptureDevices::new()));
    let track = controller
        .acquire(TrackKind::Video, &CaptureConstraints::default())
        .await
        .unwrap();
    controller.bind(&track.id, &b).await.unwrap();

    let a_status = a
        .wait_until(|status| !status.remote_tracks.is_empty())
        .await;
    assert_eq!(a_status.remote_tracks[0].kind, TrackKind::Video);
    assert_eq!(a_status.round, 2);
    let a_transport = pair.network.transport(&pair.session_id, &pair.alice.id).unwrap();
    assert_eq!(a_transport.offers_created(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn responder_tracks_bound_before_the_offer_get_their_own_round() {
    let pair = Pair::new();
    let b = pair.responder().await;
    let controller = MediaTrackController::new(Arc::new(SimCaptureDevices::new()));
    let track = controller
        .acquire(TrackKind::Video, &CaptureConstraints::default())
        .await
        .unwrap();
    controller.bind(&track.id, &b).await.unwrap();

    let a = pair.initiator().await;
    a.connected().await.unwrap();
    b.connected().await.unwrap();

    let a_status = a
        .wait_until(|status| status.round == 2 && status.state == LinkState::Connected)
        .await;
    assert!(a_status
        .remote_tracks
        .iter()
        .any(|remote| remote.id == track.id.to_string()));
    let a_transport = pair.network.transport(&pair.session_id, &pair.alice.id).unwrap();
    assert_eq!(a_transport.offers_created(), 2);
}

#[test_timeout::tokio_timeout_test(90, paused)]
async fn unanswered_renegotiation_times_out() {
    let pair = Pair::new();
    let remote = pair
        .network
        .create(&pair.session_id, &pair.bob.id, &pair.alice.id, Role::Responder)
        .await
        .unwrap();
    let mut remote_events = remote.take_events().unwrap();
    let mut offers = pair.relay.subscribe(&pair.session_id, Slot::Offer).await.unwrap();
    let _a_candidates = pair
        .relay
        .subscribe(&pair.session_id, Slot::CandidateA)
        .await
        .unwrap();

    let a = pair.initiator().await;
    let first = offers.recv().await.unwrap();
    let SignalPayload::Description { description, .. } = first.payload else {
        panic!("expected an offer, got {:?}", first.payload);
    };
    remote.set_remote_description(description).await.unwrap();
    let answer = remote.create_answer().await.unwrap();
    pair.relay
        .publish(SignalingEnvelope::description(
            pair.session_id.clone(),
            pair.bob.id.clone(),
            1,
            answer,
            true,
        ))
        .await
        .unwrap();
    for candidate in local_candidates(&mut remote_events) {
        pair.relay
            .publish(SignalingEnvelope::on_candidate_slot(
                pair.session_id.clone(),
                Slot::CandidateB,
                pair.bob.id.clone(),
                1,
                SignalPayload::Candidate { candidate },
            ))
            .await
            .unwrap();
    }
    a.connected().await.unwrap();

    let start = tokio::time::Instant::now();
    a.renegotiate(false).await.unwrap();
    let second = offers.recv().await.unwrap();
    assert_eq!(second.round, 2);

    let status = a.wait_until(|status| status.state.is_terminal()).await;
    assert_eq!(status.failure, Some(FailureReason::NegotiationTimedOut));
    assert!(start.elapsed() >= HuddleConfig::default().negotiation_timeout);
}

#[test_timeout::tokio_timeout_test]
async fn replace_prefers_in_place_and_falls_back_to_renegotiation() {
    let pair = Pair::new();
    let (a, _b) = pair.connected().await;
    let devices = Arc::new(SimCaptureDevices::new());
    devices.add_device(TrackKind::Video, "cam-1");
    let controller = MediaTrackController::new(devices.clone());
    let track = controller
        .acquire(TrackKind::Video, &CaptureConstraints::default())
        .await
        .unwrap();
    controller.bind(&track.id, &a).await.unwrap();
    a.wait_until(|status| status.round == 2 && status.state == LinkState::Connected)
        .await;

    let outcome = controller
        .replace(&track.id, &CaptureConstraints::device("cam-1"))
        .await
        .unwrap();
    assert_eq!(outcome, ReplaceOutcome::InPlace);
    assert_eq!(a.status().round, 2);
    let a_transport = pair.network.transport(&pair.session_id, &pair.alice.id).unwrap();
    assert_eq!(a_transport.replacements(), 1);

    pair.network
        .update_options(|options| options.in_place_replace = false);
    let outcome = controller
        .replace(&track.id, &CaptureConstraints::device("cam-0"))
        .await
        .unwrap();
    assert_eq!(outcome, ReplaceOutcome::Renegotiated);
    a.wait_until(|status| status.round == 3).await;
    assert_eq!(a_transport.sending(), vec![track.id.clone()]);
    assert_eq!(controller.binding(&track.id).unwrap().source_device_id, "cam-0");
}

#[test_timeout::tokio_timeout_test]
async fn close_says_bye_and_releases_everything() {
    let pair = Pair::new();
    let (a, b) = pair.connected().await;
    let controller = MediaTrackController::new(Arc::new(SimCaptureDevices::new()));
    let track = controller
        .acquire(TrackKind::Audio, &CaptureConstraints::default())
        .await
        .unwrap();
    controller.bind(&track.id, &a).await.unwrap();

    a.close().await;
    assert_eq!(a.state(), LinkState::Closed);
    assert_eq!(a.status().failure, None);
    let a_transport = pair.network.transport(&pair.session_id, &pair.alice.id).unwrap();
    assert!(a_transport.is_closed());
    assert!(a_transport.sending().is_empty());

    let b_status = b.wait_until(|status| status.state == LinkState::Closed).await;
    assert_eq!(b_status.failure, Some(FailureReason::RemoteLeft));
    assert!(controller.bound_links(&track.id).is_empty());

    // Closing again is harmless and commands now fail.
    a.close().await;
    assert!(a.renegotiate(false).await.is_err());
}
