use std::sync::Arc;

use huddle::sim::{SimCaptureDevices, SimNetwork};
use huddle::{
    CaptureConstraints, Endpoint, EndpointId, HuddleConfig, LeaveReason, LinkState,
    MediaTrackController, MemoryRelay, MeshDeps, MeshEvent, MeshSession, MeshSnapshot,
    PeerTransport, Roster, SessionId, SignalingRelay, TrackKind,
};

struct Fixture {
    relay: MemoryRelay,
    network: SimNetwork,
    mesh_id: SessionId,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        Self {
            relay: MemoryRelay::new(),
            network: SimNetwork::new(),
            mesh_id: SessionId::parse("standup").unwrap(),
        }
    }

    fn deps(&self, media: Option<Arc<MediaTrackController>>) -> MeshDeps {
        MeshDeps {
            relay: Arc::new(self.relay.clone()) as Arc<dyn SignalingRelay>,
            roster: Arc::new(self.relay.clone()) as Arc<dyn Roster>,
            transports: Arc::new(self.network.clone()),
            config: HuddleConfig::default(),
            media,
        }
    }

    async fn join(&self, id: &str) -> MeshSession {
        MeshSession::join(self.mesh_id.clone(), endpoint(id), self.deps(None))
            .await
            .unwrap()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn endpoint(id: &str) -> Endpoint {
    Endpoint::new(id, id.to_uppercase())
}

fn fully_connected(snapshot: &MeshSnapshot, others: usize) -> bool {
    snapshot.active
        && snapshot.members.len() == others
        && snapshot.is_consistent()
        && snapshot
            .links
            .iter()
            .all(|link| link.state == LinkState::Connected)
}

async fn converge(sessions: &[&MeshSession]) {
    let others = sessions.len() - 1;
    for session in sessions {
        let snapshot = session
            .wait_until(|snapshot| fully_connected(snapshot, others))
            .await;
        assert!(fully_connected(&snapshot, others), "{snapshot:?}");
    }
}

#[test_timeout::tokio_timeout_test]
async fn members_converge_to_a_full_mesh() {
    let fixture = Fixture::new();
    let a = fixture.join("a").await;
    let b = fixture.join("b").await;
    let c = fixture.join("c").await;
    let d = fixture.join("d").await;
    converge(&[&a, &b, &c, &d]).await;

    // The later joiner initiates toward every member already present.
    let snapshot = d.snapshot();
    assert!(snapshot
        .links
        .iter()
        .all(|link| link.role == huddle::Role::Initiator));
    let a_to_d = a.snapshot().link(&EndpointId::from("d")).cloned().unwrap();
    assert_eq!(a_to_d.role, huddle::Role::Responder);
    assert_eq!(
        Some(a_to_d.session_id),
        snapshot.link(&EndpointId::from("a")).map(|link| link.session_id.clone())
    );
    assert_eq!(fixture.relay.members(&fixture.mesh_id).len(), 4);
}

#[test_timeout::tokio_timeout_test]
async fn leaving_and_rejoining_keeps_the_mesh_consistent() {
    let fixture = Fixture::new();
    let a = fixture.join("a").await;
    let b = fixture.join("b").await;
    let c = fixture.join("c").await;
    let mut a_events = a.take_events().unwrap();
    converge(&[&a, &b, &c]).await;

    b.leave().await;
    assert!(!b.snapshot().active);
    assert!(b.snapshot().links.is_empty());
    converge(&[&a, &c]).await;
    assert!(a.link(&EndpointId::from("b")).is_none());

    let mut left = None;
    while let Ok(event) = a_events.try_recv() {
        if let MeshEvent::MemberLeft { member_id, reason } = event {
            left = Some((member_id, reason));
        }
    }
    let (member_id, reason) = left.unwrap();
    assert_eq!(member_id, EndpointId::from("b"));
    // Depending on which arrives first, the roster or the peer's bye.
    assert!(matches!(
        reason,
        LeaveReason::Left | LeaveReason::LinkClosed | LeaveReason::LinkFailed { .. }
    ));

    let b_again = fixture.join("b").await;
    converge(&[&a, &b_again, &c]).await;
    let old = b.snapshot();
    assert!(old.links.is_empty());
    let new_link = a.snapshot().link(&EndpointId::from("b")).cloned().unwrap();
    assert_eq!(new_link.role, huddle::Role::Responder);
    assert_eq!(fixture.relay.members(&fixture.mesh_id).len(), 3);
}

#[test_timeout::tokio_timeout_test]
async fn first_member_leaving_does_not_disturb_the_rest() {
    let fixture = Fixture::new();
    let a = fixture.join("a").await;
    let b = fixture.join("b").await;
    let c = fixture.join("c").await;
    converge(&[&a, &b, &c]).await;

    a.leave().await;
    converge(&[&b, &c]).await;
    let d = fixture.join("d").await;
    converge(&[&b, &c, &d]).await;
}

#[test_timeout::tokio_timeout_test]
async fn dropping_a_session_leaves_the_mesh() {
    let fixture = Fixture::new();
    let a = fixture.join("a").await;
    let b = fixture.join("b").await;
    converge(&[&a, &b]).await;

    drop(b);
    let snapshot = a.wait_until(|snapshot| snapshot.members.is_empty()).await;
    assert!(snapshot.links.is_empty());
    assert!(snapshot.active);
    while fixture.relay.members(&fixture.mesh_id).len() != 1 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

#[test_timeout::tokio_timeout_test]
async fn published_track_reaches_current_and_future_members() {
    let fixture = Fixture::new();
    let a_media = Arc::new(MediaTrackController::new(Arc::new(SimCaptureDevices::new())));
    let a = MeshSession::join(
        fixture.mesh_id.clone(),
        endpoint("a"),
        fixture.deps(Some(a_media.clone())),
    )
    .await
    .unwrap();
    let b = fixture.join("b").await;
    converge(&[&a, &b]).await;

    let track = a_media
        .acquire(TrackKind::Audio, &CaptureConstraints::default())
        .await
        .unwrap();
    a.publish_track(&track.id).await.unwrap();

    let c = fixture.join("c").await;
    converge(&[&a, &b, &c]).await;

    for member in [&b, &c] {
        let link = member.link(&EndpointId::from("a")).unwrap();
        let status = link
            .wait_until(|status| !status.remote_tracks.is_empty())
            .await;
        assert_eq!(status.remote_tracks[0].id, track.id.to_string());
        assert_eq!(status.remote_tracks[0].kind, TrackKind::Audio);
    }
    assert_eq!(a_media.bound_links(&track.id).len(), 2);

    a.unpublish_track(&track.id).await.unwrap();
    assert!(a_media.bound_links(&track.id).is_empty());
    for link in a.links() {
        assert!(link.status().local_tracks.is_empty());
    }
}

#[test_timeout::tokio_timeout_test]
async fn dying_link_does_not_block_publishing_to_the_rest() {
    let fixture = Fixture::new();
    let a_media = Arc::new(MediaTrackController::new(Arc::new(SimCaptureDevices::new())));
    let a = MeshSession::join(
        fixture.mesh_id.clone(),
        endpoint("a"),
        fixture.deps(Some(a_media.clone())),
    )
    .await
    .unwrap();
    let b = fixture.join("b").await;
    let c = fixture.join("c").await;
    converge(&[&a, &b, &c]).await;

    let track = a_media
        .acquire(TrackKind::Video, &CaptureConstraints::default())
        .await
        .unwrap();
    fixture
        .network
        .transport_between(&EndpointId::from("a"), &EndpointId::from("b"))
        .unwrap()
        .close()
        .await;
    a.publish_track(&track.id).await.unwrap();

    let to_c = a.link(&EndpointId::from("c")).unwrap().session_id().clone();
    assert!(a_media.bound_links(&track.id).contains(&to_c));
    let status = c
        .link(&EndpointId::from("a"))
        .unwrap()
        .wait_until(|status| !status.remote_tracks.is_empty())
        .await;
    assert_eq!(status.remote_tracks[0].id, track.id.to_string());

    let d = fixture.join("d").await;
    let status = d
        .link(&EndpointId::from("a"))
        .unwrap()
        .wait_until(|status| !status.remote_tracks.is_empty())
        .await;
    assert_eq!(status.remote_tracks[0].kind, TrackKind::Video);
}

#[test_timeout::tokio_timeout_test]
async fn publishing_an_unknown_track_fails() {
    let fixture = Fixture::new();
    let media = Arc::new(MediaTrackController::new(Arc::new(SimCaptureDevices::new())));
    let a = MeshSession::join(fixture.mesh_id.clone(), endpoint("a"), fixture.deps(Some(media)))
        .await
        .unwrap();
    let result = a.publish_track(&huddle::TrackId::from("nope")).await;
    assert!(matches!(result, Err(huddle::HuddleError::InvalidState(_))));
}

#[test_timeout::tokio_timeout_test]
async fn publishing_without_a_media_controller_fails() {
    let fixture = Fixture::new();
    let a = fixture.join("a").await;
    let result = a.publish_track(&huddle::TrackId::from("nope")).await;
    assert!(result.is_err());
}
