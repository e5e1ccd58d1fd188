use std::sync::Arc;
use std::time::Duration;

use huddle::sim::SimNetwork;
use huddle::{
    Endpoint, HuddleConfig, HuddleError, LinkParams, LinkState, MeshDeps, MeshSession, PeerLink,
    PeerTransportFactory, RelayClient, RequestOutcome, RequestStatus, Role, Roster, SessionId,
    SignalingEnvelope, SignalPayload, SignalingRelay, Slot,
};
use huddle_road::config::RoadConfig;
use huddle_road::{router, RoadState};
use tokio::net::TcpListener;

async fn start_road() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(RoadState::new(&RoadConfig::default()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn connect(url: &str, id: &str, name: &str) -> RelayClient {
    RelayClient::connect(url, Endpoint::new(id, name), &HuddleConfig::default())
        .await
        .unwrap()
}

#[test_timeout::tokio_timeout_test]
async fn request_is_acknowledged_and_accepted_over_the_socket() {
    let url = start_road().await;
    let alice = connect(&url, "123456", "Alice").await;
    let bob = connect(&url, "654321", "Bob").await;
    let mut incoming = bob.incoming().unwrap();

    let mut request = alice
        .propose(&bob.endpoint().id, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(request.current().status, RequestStatus::Pending);

    let shown = incoming
        .wait_for(|request| request.is_some())
        .await
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(shown.requester_name, "Alice");
    assert_eq!(shown.id, request.id());

    let acked = bob.acknowledge().await.unwrap();
    assert!(acked.acknowledged);
    bob.decide(true).await.unwrap();

    assert_eq!(request.outcome().await.unwrap(), RequestOutcome::Accepted);
}

#[test_timeout::tokio_timeout_test]
async fn proposing_to_an_unknown_endpoint_fails() {
    let url = start_road().await;
    let alice = connect(&url, "123456", "Alice").await;
    let result = alice.propose(&"999999".into(), None).await;
    assert!(matches!(result, Err(HuddleError::UnknownEndpoint(_))));
}

#[test_timeout::tokio_timeout_test]
async fn second_request_to_a_busy_target_is_rejected() {
    let url = start_road().await;
    let alice = connect(&url, "alice", "Alice").await;
    let carol = connect(&url, "carol", "Carol").await;
    let bob = connect(&url, "bob", "Bob").await;

    let _first = alice.propose(&bob.endpoint().id, None).await.unwrap();
    let second = carol.propose(&bob.endpoint().id, None).await;
    assert!(matches!(second, Err(HuddleError::AlreadyPending { .. })));
}

#[test_timeout::tokio_timeout_test]
async fn requester_disconnect_withdraws_the_request() {
    let url = start_road().await;
    let alice = connect(&url, "alice", "Alice").await;
    let bob = connect(&url, "bob", "Bob").await;
    let mut incoming = bob.incoming().unwrap();

    let _request = alice.propose(&bob.endpoint().id, None).await.unwrap();
    incoming.wait_for(|request| request.is_some()).await.unwrap();
    alice.close();

    let settled = incoming
        .wait_for(|request| {
            request
                .as_ref()
                .map_or(true, |request| request.status != RequestStatus::Pending)
        })
        .await
        .unwrap()
        .clone();
    if let Some(request) = settled {
        assert_eq!(request.status, RequestStatus::Withdrawn);
    }
    assert!(matches!(
        bob.decide(true).await,
        Err(HuddleError::InvalidState(_))
    ));
}

#[test_timeout::tokio_timeout_test]
async fn dropping_a_remote_request_withdraws_it() {
    let url = start_road().await;
    let alice = connect(&url, "alice", "Alice").await;
    let bob = connect(&url, "bob", "Bob").await;
    let mut incoming = bob.incoming().unwrap();

    let mut request = alice.propose(&bob.endpoint().id, None).await.unwrap();
    let withdrawn = request.withdraw().await.unwrap();
    assert_eq!(withdrawn.status, RequestStatus::Withdrawn);
    drop(request);

    incoming
        .wait_for(|request| {
            request
                .as_ref()
                .map_or(true, |request| request.status == RequestStatus::Withdrawn)
        })
        .await
        .unwrap();
    // The target is free again.
    let again = alice.propose(&bob.endpoint().id, None).await.unwrap();
    assert_eq!(again.current().status, RequestStatus::Pending);
}

#[test_timeout::tokio_timeout_test]
async fn slots_deliver_in_order_across_clients() {
    let url = start_road().await;
    let alice = connect(&url, "alice", "Alice").await;
    let bob = connect(&url, "bob", "Bob").await;
    let session_id = SessionId::generate();

    for round in 1..=3 {
        alice
            .publish(SignalingEnvelope::on_candidate_slot(
                session_id.clone(),
                Slot::CandidateA,
                alice.endpoint().id.clone(),
                round,
                SignalPayload::Bye,
            ))
            .await
            .unwrap();
    }
    let mut subscription = bob.subscribe(&session_id, Slot::CandidateA).await.unwrap();
    for round in 1..=3 {
        let envelope = subscription.recv().await.unwrap();
        assert_eq!(envelope.round, round);
        assert_eq!(envelope.from, alice.endpoint().id);
    }

    // Publishing under another identity is refused.
    let forged = SignalingEnvelope::on_candidate_slot(
        session_id.clone(),
        Slot::CandidateB,
        "mallory".into(),
        1,
        SignalPayload::Bye,
    );
    assert!(bob.publish(forged).await.is_err());
}

#[test_timeout::tokio_timeout_test]
async fn links_negotiate_through_the_road() {
    let url = start_road().await;
    let alice = connect(&url, "alice", "Alice").await;
    let bob = connect(&url, "bob", "Bob").await;
    let network = SimNetwork::new();
    let session_id = SessionId::generate();

    let mut links = Vec::new();
    for (client, remote, role) in [
        (&alice, &bob, Role::Initiator),
        (&bob, &alice, Role::Responder),
    ] {
        let local_id = client.endpoint().id.clone();
        let remote_id = remote.endpoint().id.clone();
        let transport = network
            .create(&session_id, &local_id, &remote_id, role)
            .await
            .unwrap();
        let link = PeerLink::spawn(
            LinkParams {
                session_id: session_id.clone(),
                local_id,
                remote_id,
                role,
            },
            Arc::new(client.clone()) as Arc<dyn SignalingRelay>,
            transport,
            &HuddleConfig::default(),
        )
        .await
        .unwrap();
        links.push(link);
    }
    for link in &links {
        link.connected().await.unwrap();
    }

    links[0].close().await;
    let status = links[1]
        .wait_until(|status| status.state == LinkState::Closed)
        .await;
    assert_eq!(status.failure, Some(huddle::FailureReason::RemoteLeft));
}

#[test_timeout::tokio_timeout_test]
async fn mesh_forms_over_the_road() {
    let url = start_road().await;
    let network = SimNetwork::new();
    let mesh_id = SessionId::parse("road-mesh").unwrap();

    let mut sessions = Vec::new();
    for id in ["a", "b", "c"] {
        let client = connect(&url, id, id).await;
        let deps = MeshDeps {
            relay: Arc::new(client.clone()) as Arc<dyn SignalingRelay>,
            roster: Arc::new(client.clone()) as Arc<dyn Roster>,
            transports: Arc::new(network.clone()),
            config: HuddleConfig::default(),
            media: None,
        };
        let session = MeshSession::join(mesh_id.clone(), client.endpoint().clone(), deps)
            .await
            .unwrap();
        sessions.push((client, session));
    }

    for (_, session) in &sessions {
        let snapshot = session
            .wait_until(|snapshot| {
                snapshot.members.len() == 2
                    && snapshot.is_consistent()
                    && snapshot
                        .links
                        .iter()
                        .all(|link| link.state == LinkState::Connected)
            })
            .await;
        assert!(snapshot.is_consistent());
    }

    // A client that goes away leaves the roster on the road.
    let (client, session) = sessions.pop().unwrap();
    client.close();
    drop(session);
    for (_, session) in &sessions {
        session
            .wait_until(|snapshot| snapshot.members.len() == 1 && snapshot.is_consistent())
            .await;
    }
}
