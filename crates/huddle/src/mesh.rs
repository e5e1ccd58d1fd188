//! Full-mesh sessions: one [`PeerLink`] per other member.
//!
//! The joiner is Initiator toward every member already present; members that
//! see the join on the roster build the Responder side. A pair's link session
//! id is derived from the mesh id, the initiator's incarnation and the
//! ordered pair, so both sides agree without talking to each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::HuddleConfig;
use crate::error::{HuddleError, HuddleResult};
use crate::link::{FailureReason, LinkEvent, LinkParams, LinkState, PeerLink};
use crate::media::MediaTrackController;
use crate::metrics::MESH_MEMBERS;
use crate::relay::{MembershipChange, MeshMember, Roster, SignalingRelay, Subscription};
use crate::transport::PeerTransportFactory;
use crate::types::{Endpoint, EndpointId, Role, SessionId, TrackId};

/// Everything a mesh needs to build links.
#[derive(Clone)]
pub struct MeshDeps {
    pub relay: Arc<dyn SignalingRelay>,
    pub roster: Arc<dyn Roster>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub config: HuddleConfig,
    /// Tracks published to the mesh are bound to every link through this controller.
    pub media: Option<Arc<MediaTrackController>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LeaveReason {
    /// The member left the roster.
    Left,
    /// The link to the member closed.
    LinkClosed,
    LinkFailed { failure: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    MemberJoined(MeshMember),
    MemberLeft {
        member_id: EndpointId,
        reason: LeaveReason,
    },
    LinkStateChanged {
        remote_id: EndpointId,
        state: LinkState,
    },
    LinkSetupFailed {
        remote_id: EndpointId,
        error: HuddleError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub remote_id: EndpointId,
    pub session_id: SessionId,
    pub role: Role,
    pub state: LinkState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSnapshot {
    /// Other members, in the order they became known.
    pub members: Vec<MeshMember>,
    pub links: Vec<LinkSummary>,
    pub active: bool,
}

impl MeshSnapshot {
    /// Exactly one link per other member and no link without a member.
    pub fn is_consistent(&self) -> bool {
        self.links.len() == self.members.len()
            && self.members.iter().all(|member| {
                self.links
                    .iter()
                    .filter(|link| &link.remote_id == member.id())
                    .count()
                    == 1
            })
    }

    pub fn link(&self, remote_id: &EndpointId) -> Option<&LinkSummary> {
        self.links.iter().find(|link| &link.remote_id == remote_id)
    }
}

enum MeshCommand {
    PublishTrack {
        track_id: TrackId,
        reply: oneshot::Sender<HuddleResult<()>>,
    },
    UnpublishTrack {
        track_id: TrackId,
        reply: oneshot::Sender<HuddleResult<()>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// A joined mesh. Dropping it leaves the mesh.
pub struct MeshSession {
    session_id: SessionId,
    local: MeshMember,
    commands: mpsc::UnboundedSender<MeshCommand>,
    snapshot: watch::Receiver<MeshSnapshot>,
    links: Arc<RwLock<HashMap<EndpointId, PeerLink>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
}

impl MeshSession {
    pub async fn join(
        session_id: SessionId,
        local: Endpoint,
        deps: MeshDeps,
    ) -> HuddleResult<MeshSession> {
        let member = MeshMember::new(local);
        let joined = deps.roster.join(&session_id, member.clone()).await?;
        info!(
            target = "huddle::mesh",
            session_id = %session_id,
            local = %member.id(),
            existing = joined.members.len(),
            "joined mesh"
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(MeshSnapshot {
            active: true,
            ..MeshSnapshot::default()
        });
        let links = Arc::new(RwLock::new(HashMap::new()));

        let mut driver = MeshDriver {
            session_id: session_id.clone(),
            local: member.clone(),
            deps,
            changes: joined.changes,
            roster_open: true,
            commands: commands_rx,
            link_events_tx,
            link_events: link_events_rx,
            events_tx,
            snapshot_tx,
            shared_links: links.clone(),
            peers: HashMap::new(),
            order: Vec::new(),
            published: Vec::new(),
            next_serial: 0,
        };
        for existing in joined.members {
            driver.add_member(existing, Role::Initiator).await;
        }
        driver.publish_snapshot();
        tokio::spawn(driver.run());

        Ok(MeshSession {
            session_id,
            local: member,
            commands: commands_tx,
            snapshot: snapshot_rx,
            links,
            events: Mutex::new(Some(events_rx)),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local(&self) -> &MeshMember {
        &self.local
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<MeshSnapshot> {
        self.snapshot.clone()
    }

    pub fn link(&self, remote_id: &EndpointId) -> Option<PeerLink> {
        self.links.read().get(remote_id).cloned()
    }

    pub fn links(&self) -> Vec<PeerLink> {
        self.links.read().values().cloned().collect()
    }

    /// Mesh event stream; only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events.lock().take()
    }

    /// Waits until `predicate` holds for the snapshot.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&MeshSnapshot) -> bool) -> MeshSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|snapshot| predicate(snapshot)).await.map(|s| s.clone());
        match result {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Sends the track on every current and future link of the mesh.
    pub async fn publish_track(&self, track_id: &TrackId) -> HuddleResult<()> {
        let track_id = track_id.clone();
        self.request(|reply| MeshCommand::PublishTrack { track_id, reply })
            .await?
    }

    pub async fn unpublish_track(&self, track_id: &TrackId) -> HuddleResult<()> {
        let track_id = track_id.clone();
        self.request(|reply| MeshCommand::UnpublishTrack { track_id, reply })
            .await?
    }

    /// Closes every link and leaves the roster. Idempotent.
    pub async fn leave(&self) {
        let _ = self.request(|reply| MeshCommand::Leave { reply }).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MeshCommand,
    ) -> HuddleResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| HuddleError::Closed("mesh session".into()))?;
        rx.await.map_err(|_| HuddleError::Closed("mesh session".into()))
    }
}

impl fmt::Debug for MeshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshSession")
            .field("session_id", &self.session_id)
            .field("local", self.local.id())
            .finish()
    }
}

struct PeerEntry {
    member: MeshMember,
    link: PeerLink,
    serial: u64,
}

struct MeshDriver {
    session_id: SessionId,
    local: MeshMember,
    deps: MeshDeps,
    changes: Subscription<MembershipChange>,
    roster_open: bool,
    commands: mpsc::UnboundedReceiver<MeshCommand>,
    link_events_tx: mpsc::UnboundedSender<(EndpointId, u64, LinkEvent)>,
    link_events: mpsc::UnboundedReceiver<(EndpointId, u64, LinkEvent)>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    snapshot_tx: watch::Sender<MeshSnapshot>,
    shared_links: Arc<RwLock<HashMap<EndpointId, PeerLink>>>,
    peers: HashMap<EndpointId, PeerEntry>,
    /// Member ids in the order they became known.
    order: Vec<EndpointId>,
    published: Vec<TrackId>,
    next_serial: u64,
}

impl MeshDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(MeshCommand::Leave { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                change = self.changes.recv(), if self.roster_open => match change {
                    Some(change) => self.on_membership(change).await,
                    None => {
                        warn!(
                            target = "huddle::mesh",
                            session_id = %self.session_id,
                            "roster stream ended; keeping current links"
                        );
                        self.roster_open = false;
                    }
                },
                Some((remote_id, serial, event)) = self.link_events.recv() => {
                    self.on_link_event(remote_id, serial, event).await
                }
            }
        }
        debug!(target = "huddle::mesh", session_id = %self.session_id, "mesh task finished");
    }

    async fn handle_command(&mut self, command: MeshCommand) {
        match command {
            MeshCommand::PublishTrack { track_id, reply } => {
                let result = self.publish_track(track_id).await;
                let _ = reply.send(result);
            }
            MeshCommand::UnpublishTrack { track_id, reply } => {
                let result = self.unpublish_track(&track_id).await;
                let _ = reply.send(result);
            }
            MeshCommand::Leave { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn publish_track(&mut self, track_id: TrackId) -> HuddleResult<()> {
        let media = self
            .deps
            .media
            .clone()
            .ok_or_else(|| HuddleError::invalid_state("mesh has no media controller"))?;
        if self.published.contains(&track_id) {
            return Ok(());
        }
        if media.binding(&track_id).is_none() {
            return Err(HuddleError::invalid_state(format!("unknown track {track_id}")));
        }
        // Members joining from now on get the track even if a bind below fails.
        self.published.push(track_id.clone());
        let mut first_error = None;
        for (remote_id, entry) in &self.peers {
            match media.bind(&track_id, &entry.link).await {
                Ok(()) => {}
                Err(HuddleError::Closed(_)) => debug!(
                    target = "huddle::mesh",
                    remote = %remote_id,
                    track = %track_id,
                    "skipping closed link"
                ),
                Err(err) => {
                    warn!(
                        target = "huddle::mesh",
                        remote = %remote_id,
                        track = %track_id,
                        error = %err,
                        "could not bind published track"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn unpublish_track(&mut self, track_id: &TrackId) -> HuddleResult<()> {
        let Some(media) = self.deps.media.clone() else {
            return Ok(());
        };
        self.published.retain(|published| published != track_id);
        let mut first_error = None;
        for (remote_id, entry) in &self.peers {
            if let Err(err) = media.unbind(track_id, &entry.link).await {
                warn!(
                    target = "huddle::mesh",
                    remote = %remote_id,
                    track = %track_id,
                    error = %err,
                    "could not unbind track"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn on_membership(&mut self, change: MembershipChange) {
        match change {
            MembershipChange::Joined { member } => {
                if member.id() == self.local.id() {
                    return;
                }
                if let Some(previous) = self.remove_peer(member.id()) {
                    debug!(
                        target = "huddle::mesh",
                        session_id = %self.session_id,
                        remote = %member.id(),
                        "member rejoined; replacing link"
                    );
                    previous.link.close().await;
                }
                let _ = self.events_tx.send(MeshEvent::MemberJoined(member.clone()));
                self.add_member(member, Role::Responder).await;
            }
            MembershipChange::Left { member_id } => {
                if let Some(previous) = self.remove_peer(&member_id) {
                    previous.link.close().await;
                    self.member_left(member_id, LeaveReason::Left);
                }
            }
        }
        self.publish_snapshot();
    }

    async fn add_member(&mut self, member: MeshMember, role: Role) {
        let remote_id = member.id().clone();
        let session_id = match role {
            Role::Initiator => SessionId::for_pair(
                &self.session_id,
                &self.local.incarnation,
                self.local.id(),
                &remote_id,
            ),
            Role::Responder => SessionId::for_pair(
                &self.session_id,
                &member.incarnation,
                &remote_id,
                self.local.id(),
            ),
        };
        let link = match self.spawn_link(session_id, &remote_id, role).await {
            Ok(link) => link,
            Err(err) => {
                warn!(
                    target = "huddle::mesh",
                    session_id = %self.session_id,
                    remote = %remote_id,
                    error = %err,
                    "could not set up link"
                );
                let _ = self.events_tx.send(MeshEvent::LinkSetupFailed {
                    remote_id,
                    error: err,
                });
                return;
            }
        };

        self.next_serial += 1;
        let serial = self.next_serial;
        if let Some(mut events) = link.take_events() {
            let forward = self.link_events_tx.clone();
            let remote = remote_id.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if forward.send((remote.clone(), serial, event)).is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(media) = self.deps.media.clone() {
            for track_id in &self.published {
                if let Err(err) = media.bind(track_id, &link).await {
                    warn!(
                        target = "huddle::mesh",
                        session_id = %self.session_id,
                        remote = %remote_id,
                        track = %track_id,
                        error = %err,
                        "could not bind published track"
                    );
                }
            }
        }

        info!(
            target = "huddle::mesh",
            session_id = %self.session_id,
            remote = %remote_id,
            role = %role,
            link = %link.session_id(),
            "link added"
        );
        self.shared_links.write().insert(remote_id.clone(), link.clone());
        self.order.push(remote_id.clone());
        self.peers.insert(
            remote_id,
            PeerEntry {
                member,
                link,
                serial,
            },
        );
        MESH_MEMBERS.inc();
    }

    async fn spawn_link(
        &self,
        session_id: SessionId,
        remote_id: &EndpointId,
        role: Role,
    ) -> HuddleResult<PeerLink> {
        let transport = self
            .deps
            .transports
            .create(&session_id, self.local.id(), remote_id, role)
            .await?;
        PeerLink::spawn(
            LinkParams {
                session_id,
                local_id: self.local.id().clone(),
                remote_id: remote_id.clone(),
                role,
            },
            self.deps.relay.clone(),
            transport,
            &self.deps.config,
        )
        .await
    }

    fn remove_peer(&mut self, remote_id: &EndpointId) -> Option<PeerEntry> {
        let entry = self.peers.remove(remote_id)?;
        self.shared_links.write().remove(remote_id);
        self.order.retain(|id| id != remote_id);
        MESH_MEMBERS.dec();
        Some(entry)
    }

    fn member_left(&self, member_id: EndpointId, reason: LeaveReason) {
        info!(
            target = "huddle::mesh",
            session_id = %self.session_id,
            remote = %member_id,
            reason = ?reason,
            "member left"
        );
        let _ = self.events_tx.send(MeshEvent::MemberLeft { member_id, reason });
    }

    async fn on_link_event(&mut self, remote_id: EndpointId, serial: u64, event: LinkEvent) {
        let current = self
            .peers
            .get(&remote_id)
            .is_some_and(|entry| entry.serial == serial);
        if !current {
            return;
        }
        let LinkEvent::StateChanged { state, failure } = event else {
            return;
        };
        let _ = self.events_tx.send(MeshEvent::LinkStateChanged {
            remote_id: remote_id.clone(),
            state,
        });
        if state.is_terminal() {
            self.remove_peer(&remote_id);
            let reason = match failure {
                Some(failure) => LeaveReason::LinkFailed { failure },
                None => LeaveReason::LinkClosed,
            };
            self.member_left(remote_id, reason);
        }
        self.publish_snapshot();
    }

    async fn shutdown(&mut self) {
        if !self.snapshot_tx.borrow().active {
            return;
        }
        let peers: Vec<PeerEntry> = self.peers.drain().map(|(_, entry)| entry).collect();
        MESH_MEMBERS.sub(peers.len() as i64);
        self.order.clear();
        self.shared_links.write().clear();
        join_all(peers.iter().map(|entry| entry.link.close())).await;

        if let Err(err) = self
            .deps
            .roster
            .leave(&self.session_id, self.local.id())
            .await
        {
            debug!(
                target = "huddle::mesh",
                session_id = %self.session_id,
                error = %err,
                "roster leave failed"
            );
        }
        self.changes.unsubscribe();
        self.roster_open = false;
        self.snapshot_tx.send_replace(MeshSnapshot::default());
        info!(
            target = "huddle::mesh",
            session_id = %self.session_id,
            local = %self.local.id(),
            "left mesh"
        );
    }

    fn publish_snapshot(&self) {
        let members = self
            .order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .map(|entry| entry.member.clone())
            .collect();
        let links = self
            .order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .map(|entry| LinkSummary {
                remote_id: entry.member.id().clone(),
                session_id: entry.link.session_id().clone(),
                role: entry.link.role(),
                state: entry.link.state(),
            })
            .collect();
        self.snapshot_tx.send_replace(MeshSnapshot {
            members,
            links,
            active: true,
        });
    }
}
