use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{MembershipChange, MeshMember, Roster, RosterJoin, SignalingRelay, Subscription};
use crate::error::{HuddleError, HuddleResult};
use crate::metrics::{RELAY_DELIVERED, RELAY_PUBLISHED};
use crate::signal::SignalingEnvelope;
use crate::types::{EndpointId, SessionId, Slot};

type SlotKey = (SessionId, Slot);

#[derive(Default)]
struct SlotState {
    waiting: VecDeque<SignalingEnvelope>,
    subscriber: Option<(u64, mpsc::UnboundedSender<SignalingEnvelope>)>,
}

impl SlotState {
    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.subscriber.is_none()
    }
}

#[derive(Default)]
struct RosterState {
    members: Vec<MeshMember>,
    watchers: Vec<RosterWatcher>,
}

struct RosterWatcher {
    id: u64,
    member_id: EndpointId,
    tx: mpsc::UnboundedSender<MembershipChange>,
}

impl RosterState {
    fn broadcast_except(&mut self, member_id: &EndpointId, change: &MembershipChange) {
        self.watchers.retain(|watcher| {
            if &watcher.member_id == member_id {
                return true;
            }
            watcher.tx.send(change.clone()).is_ok()
        });
    }
}

struct Inner {
    slots: DashMap<SlotKey, SlotState>,
    rosters: DashMap<SessionId, RosterState>,
    next_id: AtomicU64,
    online: AtomicBool,
}

/// In-process relay. Cloning shares the same slots, so one instance can serve
/// every endpoint of a test or of the relay server.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<Inner>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                rosters: DashMap::new(),
                next_id: AtomicU64::new(1),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// While offline every operation fails with `RelayUnavailable` and every
    /// open subscription ends.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if !online {
            for mut slot in self.inner.slots.iter_mut() {
                slot.subscriber = None;
            }
            for mut roster in self.inner.rosters.iter_mut() {
                roster.watchers.clear();
            }
        }
    }

    /// Number of envelopes waiting in a slot for a subscriber.
    pub fn waiting(&self, session_id: &SessionId, slot: Slot) -> usize {
        self.inner
            .slots
            .get(&(session_id.clone(), slot))
            .map(|state| state.waiting.len())
            .unwrap_or(0)
    }

    pub fn members(&self, mesh: &SessionId) -> Vec<MeshMember> {
        self.inner
            .rosters
            .get(mesh)
            .map(|roster| roster.members.clone())
            .unwrap_or_default()
    }

    fn ensure_online(&self) -> HuddleResult<()> {
        if self.inner.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HuddleError::relay_unavailable("in-memory relay is offline"))
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn release_slot(inner: &Weak<Inner>, key: &SlotKey, subscriber_id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(mut state) = inner.slots.get_mut(key) {
        if matches!(state.subscriber, Some((id, _)) if id == subscriber_id) {
            state.subscriber = None;
        }
    }
    inner.slots.remove_if(key, |_, state| state.is_idle());
}

fn release_watcher(inner: &Weak<Inner>, mesh: &SessionId, watcher_id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if let Some(mut roster) = inner.rosters.get_mut(mesh) {
        roster.watchers.retain(|watcher| watcher.id != watcher_id);
    };
}

#[async_trait]
impl SignalingRelay for MemoryRelay {
    async fn publish(&self, envelope: SignalingEnvelope) -> HuddleResult<()> {
        self.ensure_online()?;
        envelope.validate()?;

        let slot = envelope.slot;
        let key = (envelope.session_id.clone(), slot);
        let mut state = self.inner.slots.entry(key).or_default();
        RELAY_PUBLISHED.with_label_values(&[slot.as_str()]).inc();

        let envelope = match &state.subscriber {
            Some((_, tx)) => match tx.send(envelope) {
                Ok(()) => {
                    RELAY_DELIVERED.with_label_values(&[slot.as_str()]).inc();
                    return Ok(());
                }
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };
        // The subscriber went away without unsubscribing.
        if matches!(&state.subscriber, Some((_, tx)) if tx.is_closed()) {
            state.subscriber = None;
        }
        buffer(&mut state, envelope);
        Ok(())
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        slot: Slot,
    ) -> HuddleResult<Subscription<SignalingEnvelope>> {
        self.ensure_online()?;
        let id = self.next_id();
        let key = (session_id.clone(), slot);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.slots.entry(key.clone()).or_default();
            if state.subscriber.take().is_some() {
                debug!(
                    target = "huddle::relay",
                    session_id = %session_id,
                    slot = %slot,
                    "replacing previous slot subscriber"
                );
            }
            while let Some(envelope) = state.waiting.pop_front() {
                RELAY_DELIVERED.with_label_values(&[slot.as_str()]).inc();
                let _ = tx.send(envelope);
            }
            state.subscriber = Some((id, tx));
        }

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || release_slot(&inner, &key, id)))
    }
}

// Description slots keep only the newest value; candidate slots keep every
// value in publish order. An exact retry of the newest value is dropped.
fn buffer(state: &mut SlotState, envelope: SignalingEnvelope) {
    if state.waiting.back() == Some(&envelope) {
        trace!(target = "huddle::relay", slot = %envelope.slot, "dropping retried publish");
        return;
    }
    if !envelope.slot.is_candidate() {
        state.waiting.clear();
    }
    state.waiting.push_back(envelope);
}

#[async_trait]
impl Roster for MemoryRelay {
    async fn join(&self, mesh: &SessionId, member: MeshMember) -> HuddleResult<RosterJoin> {
        self.ensure_online()?;
        let id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let members = {
            let mut roster = self.inner.rosters.entry(mesh.clone()).or_default();
            let member_id = member.id().clone();
            let rejoined = roster.members.iter().any(|m| m.id() == &member_id);
            if rejoined {
                roster.members.retain(|m| m.id() != &member_id);
                roster.watchers.retain(|w| w.member_id != member_id);
                roster.broadcast_except(
                    &member_id,
                    &MembershipChange::Left {
                        member_id: member_id.clone(),
                    },
                );
            }
            let existing = roster.members.clone();
            roster.broadcast_except(
                &member_id,
                &MembershipChange::Joined {
                    member: member.clone(),
                },
            );
            roster.members.push(member);
            roster.watchers.push(RosterWatcher {
                id,
                member_id,
                tx,
            });
            existing
        };
        debug!(
            target = "huddle::relay",
            mesh = %mesh,
            existing = members.len(),
            "member joined roster"
        );

        let inner = Arc::downgrade(&self.inner);
        let mesh = mesh.clone();
        Ok(RosterJoin {
            members,
            changes: Subscription::new(rx, move || release_watcher(&inner, &mesh, id)),
        })
    }

    async fn leave(&self, mesh: &SessionId, member_id: &EndpointId) -> HuddleResult<()> {
        self.ensure_online()?;
        if let Some(mut roster) = self.inner.rosters.get_mut(mesh) {
            let before = roster.members.len();
            roster.members.retain(|m| m.id() != member_id);
            roster.watchers.retain(|w| &w.member_id != member_id);
            if roster.members.len() != before {
                roster.broadcast_except(
                    member_id,
                    &MembershipChange::Left {
                        member_id: member_id.clone(),
                    },
                );
            }
        }
        self.inner
            .rosters
            .remove_if(mesh, |_, roster| roster.members.is_empty());
        Ok(())
    }
}
