//! Signaling relay contract and its implementations.
//!
//! A relay exposes four slots per session. Values published to a slot are
//! delivered to the current subscriber at most once and then forgotten; a
//! value published while nobody listens waits in the slot until the next
//! subscriber takes it. The [`Roster`] half of the contract carries mesh
//! membership.

pub mod client;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::HuddleResult;
use crate::signal::SignalingEnvelope;
use crate::types::{Endpoint, EndpointId, SessionId, Slot};

pub use client::RelayClient;
pub use memory::MemoryRelay;

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// Stream of values delivered by a relay. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<CancelFn>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next delivered value; `None` once unsubscribed or the relay ended the stream.
    pub async fn recv(&mut self) -> Option<T> {
        if self.cancel.is_none() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        if self.cancel.is_none() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Stops delivery. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn publish(&self, envelope: SignalingEnvelope) -> HuddleResult<()>;

    /// Replaces any previous subscriber of the slot. Values already waiting in
    /// the slot are delivered to the new subscriber right away.
    async fn subscribe(
        &self,
        session_id: &SessionId,
        slot: Slot,
    ) -> HuddleResult<Subscription<SignalingEnvelope>>;
}

/// One member of a mesh roster. `incarnation` changes every time the
/// endpoint joins, so links built for an earlier join are never confused with
/// the current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMember {
    pub endpoint: Endpoint,
    pub incarnation: String,
}

impl MeshMember {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            incarnation: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.endpoint.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum MembershipChange {
    Joined { member: MeshMember },
    Left { member_id: EndpointId },
}

pub struct RosterJoin {
    /// Members already present when the join was committed, excluding the joiner.
    pub members: Vec<MeshMember>,
    /// Changes committed after `members` was taken, in commit order.
    pub changes: Subscription<MembershipChange>,
}

#[async_trait]
pub trait Roster: Send + Sync {
    async fn join(&self, mesh: &SessionId, member: MeshMember) -> HuddleResult<RosterJoin>;

    async fn leave(&self, mesh: &SessionId, member_id: &EndpointId) -> HuddleResult<()>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_runs_cancel_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let counter = calls.clone();
        let mut sub = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(7).unwrap();
        assert_eq!(sub.recv().await, Some(7));

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tx.send(8).is_err());
    }

    #[test]
    fn subscriptions_are_send_and_sync() {
        fn shareable<T: Send + Sync>() {}
        shareable::<Subscription<SignalingEnvelope>>();
        shareable::<Subscription<MembershipChange>>();
    }

    #[tokio::test]
    async fn recv_after_unsubscribe_yields_nothing() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let mut sub = Subscription::new(rx, || {});
        tx.send(1).unwrap();
        sub.unsubscribe();
        assert_eq!(sub.recv().await, None);
        assert_eq!(sub.try_recv(), None);
    }
}
