//! Consent protocol between a requester and a target endpoint.
//!
//! Every target has at most one pending [`ConnectRequest`]. The broker owns
//! the authoritative deadline: one task per request sleeps until the current
//! deadline and resolves the request under the same per-target lock that
//! `acknowledge` and `decide` take, so whichever commits first wins.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::HuddleConfig;
use crate::directory::Directory;
use crate::error::{HuddleError, HuddleResult};
use crate::metrics::{REQUESTS_PROPOSED, REQUEST_OUTCOMES};
use crate::types::{Endpoint, EndpointId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// The target never acknowledged the request.
    TargetUnreachable,
    /// The target acknowledged but did not decide in time.
    NoDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Expired(ExpiryReason),
    Withdrawn,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    pub fn outcome(self) -> Option<RequestOutcome> {
        match self {
            RequestStatus::Pending => None,
            RequestStatus::Accepted => Some(RequestOutcome::Accepted),
            RequestStatus::Rejected => Some(RequestOutcome::Declined),
            RequestStatus::Expired(ExpiryReason::TargetUnreachable) => Some(RequestOutcome::Offline),
            RequestStatus::Expired(ExpiryReason::NoDecision) => Some(RequestOutcome::NoResponse),
            RequestStatus::Withdrawn => Some(RequestOutcome::Withdrawn),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired(ExpiryReason::TargetUnreachable) => "expired_unreachable",
            RequestStatus::Expired(ExpiryReason::NoDecision) => "expired_no_decision",
            RequestStatus::Withdrawn => "withdrawn",
        }
    }
}

/// What the requester is told once its request is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Accepted,
    Declined,
    /// The target acknowledged but never decided.
    NoResponse,
    /// The target never acknowledged.
    Offline,
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub id: RequestId,
    pub requester_id: EndpointId,
    pub requester_name: String,
    pub target_id: EndpointId,
    pub status: RequestStatus,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
    /// Wall-clock mirror of the broker deadline currently in force.
    pub deadline: DateTime<Utc>,
}

impl ConnectRequest {
    /// Time left before the current deadline, for countdown displays.
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }

    /// `Ok` only for an accepted request; every other ending as the error a
    /// caller waiting to connect would surface.
    pub fn accepted(&self) -> HuddleResult<()> {
        match self.status {
            RequestStatus::Accepted => Ok(()),
            RequestStatus::Expired(ExpiryReason::TargetUnreachable) => {
                Err(HuddleError::TargetUnreachable {
                    target: self.target_id.clone(),
                })
            }
            RequestStatus::Expired(ExpiryReason::NoDecision) => Err(HuddleError::TooLate),
            RequestStatus::Rejected => Err(HuddleError::invalid_state(format!(
                "{} declined the request",
                self.target_id
            ))),
            RequestStatus::Withdrawn => Err(HuddleError::invalid_state("request was withdrawn")),
            RequestStatus::Pending => Err(HuddleError::invalid_state("request is still pending")),
        }
    }
}

struct ActiveRequest {
    record: ConnectRequest,
    status: watch::Sender<ConnectRequest>,
    deadline: Instant,
    // Bumped whenever the deadline moves; stale timer tasks exit on mismatch.
    timer_epoch: u64,
}

struct TargetSlot {
    active: Option<ActiveRequest>,
    incoming: watch::Sender<Option<ConnectRequest>>,
}

impl TargetSlot {
    fn new() -> Self {
        let (incoming, _) = watch::channel(None);
        Self {
            active: None,
            incoming,
        }
    }

    fn active_mut(&mut self, id: RequestId) -> Option<&mut ActiveRequest> {
        self.active.as_mut().filter(|active| active.record.id == id)
    }

    fn publish(&mut self) {
        if let Some(active) = &self.active {
            active.status.send_replace(active.record.clone());
            self.incoming.send_replace(Some(active.record.clone()));
        }
    }

    fn resolve(&mut self, status: RequestStatus) -> Option<ConnectRequest> {
        let active = self.active.as_mut()?;
        active.record.status = status;
        let record = active.record.clone();
        self.publish();
        REQUEST_OUTCOMES.with_label_values(&[status.label()]).inc();
        info!(
            target = "huddle::broker",
            request_id = %record.id,
            requester = %record.requester_id,
            target_id = %record.target_id,
            status = status.label(),
            "connect request resolved"
        );
        Some(record)
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.incoming.receiver_count() == 0
    }
}

struct BrokerInner {
    targets: DashMap<EndpointId, TargetSlot>,
    directory: Arc<dyn Directory>,
    request_timeout: Duration,
    decision_timeout: Duration,
}

impl BrokerInner {
    /// Returns the next wake-up if the request is still pending under `epoch`.
    fn on_deadline(&self, target: &EndpointId, id: RequestId, epoch: u64) -> Option<Instant> {
        let mut guard = self.targets.get_mut(target)?;
        let slot = &mut *guard;
        let active = slot.active_mut(id)?;
        if active.timer_epoch != epoch || active.record.status.is_terminal() {
            return None;
        }
        if Instant::now() < active.deadline {
            return Some(active.deadline);
        }
        let reason = if active.record.acknowledged {
            ExpiryReason::NoDecision
        } else {
            ExpiryReason::TargetUnreachable
        };
        slot.resolve(RequestStatus::Expired(reason));
        None
    }
}

/// Runs the request/consent protocol. Cloning shares the same state.
#[derive(Clone)]
pub struct RequestBroker {
    inner: Arc<BrokerInner>,
}

impl RequestBroker {
    pub fn new(directory: Arc<dyn Directory>, config: &HuddleConfig) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                targets: DashMap::new(),
                directory,
                request_timeout: config.request_timeout,
                decision_timeout: config.decision_timeout,
            }),
        }
    }

    /// Creates a pending request from `requester` to `target_id`. `timeout`
    /// overrides the configured acknowledgement window.
    pub async fn propose(
        &self,
        requester: &Endpoint,
        target_id: &EndpointId,
        timeout: Option<Duration>,
    ) -> HuddleResult<RequestHandle> {
        if &requester.id == target_id {
            return Err(HuddleError::invalid_state(
                "an endpoint cannot send a connect request to itself",
            ));
        }
        let entry = self.inner.directory.lookup(target_id).await;
        if !entry.exists {
            REQUESTS_PROPOSED
                .with_label_values(&["unknown_endpoint"])
                .inc();
            return Err(HuddleError::UnknownEndpoint(target_id.clone()));
        }

        let timeout = timeout.unwrap_or(self.inner.request_timeout);
        let now = Utc::now();
        let record = ConnectRequest {
            id: RequestId::generate(),
            requester_id: requester.id.clone(),
            requester_name: requester.display_name.clone(),
            target_id: target_id.clone(),
            status: RequestStatus::Pending,
            acknowledged: false,
            created_at: now,
            deadline: wall_deadline(now, timeout),
        };
        let deadline = instant_deadline(timeout);

        let status_rx = {
            let mut slot = self
                .inner
                .targets
                .entry(target_id.clone())
                .or_insert_with(TargetSlot::new);
            if let Some(active) = &slot.active {
                if !active.record.status.is_terminal() {
                    REQUESTS_PROPOSED
                        .with_label_values(&["already_pending"])
                        .inc();
                    return Err(HuddleError::AlreadyPending {
                        target: target_id.clone(),
                    });
                }
            }
            let (status_tx, status_rx) = watch::channel(record.clone());
            slot.active = Some(ActiveRequest {
                record: record.clone(),
                status: status_tx,
                deadline,
                timer_epoch: 0,
            });
            slot.incoming.send_replace(Some(record.clone()));
            status_rx
        };

        REQUESTS_PROPOSED.with_label_values(&["created"]).inc();
        info!(
            target = "huddle::broker",
            request_id = %record.id,
            requester = %record.requester_id,
            target_id = %target_id,
            reachable = entry.reachable,
            timeout_secs = timeout.as_secs(),
            "connect request proposed"
        );
        self.spawn_deadline(target_id.clone(), record.id, 0, deadline);

        Ok(RequestHandle {
            broker: self.clone(),
            target: target_id.clone(),
            id: record.id,
            status: status_rx,
            settled: false,
        })
    }

    /// The target signals it is alive and showing the request. The
    /// acknowledgement window is replaced by the decision window.
    pub fn acknowledge(&self, target_id: &EndpointId) -> HuddleResult<ConnectRequest> {
        let (record, epoch, deadline) = {
            let mut guard = self
                .inner
                .targets
                .get_mut(target_id)
                .ok_or_else(|| no_request(target_id))?;
            let slot = &mut *guard;
            let active = slot.active.as_mut().ok_or_else(|| no_request(target_id))?;
            match active.record.status {
                RequestStatus::Pending => {}
                RequestStatus::Expired(_) => return Err(HuddleError::TooLate),
                other => {
                    return Err(HuddleError::invalid_state(format!(
                        "request is already {}",
                        other.label()
                    )))
                }
            }
            if active.record.acknowledged {
                return Ok(active.record.clone());
            }
            active.record.acknowledged = true;
            active.deadline = Instant::now() + self.inner.decision_timeout;
            active.record.deadline = wall_deadline(Utc::now(), self.inner.decision_timeout);
            active.timer_epoch += 1;
            let snapshot = (active.record.clone(), active.timer_epoch, active.deadline);
            slot.publish();
            snapshot
        };

        debug!(
            target = "huddle::broker",
            request_id = %record.id,
            target_id = %target_id,
            "connect request acknowledged"
        );
        self.spawn_deadline(target_id.clone(), record.id, epoch, deadline);
        Ok(record)
    }

    /// Accepts or rejects the pending request addressed to `target_id`. Only
    /// the target itself may decide.
    pub fn decide(
        &self,
        target_id: &EndpointId,
        decider: &EndpointId,
        accept: bool,
    ) -> HuddleResult<ConnectRequest> {
        if decider != target_id {
            return Err(HuddleError::invalid_state(format!(
                "{decider} cannot decide a request addressed to {target_id}"
            )));
        }
        let mut guard = self
            .inner
            .targets
            .get_mut(target_id)
            .ok_or_else(|| no_request(target_id))?;
        let slot = &mut *guard;
        let status = slot
            .active
            .as_ref()
            .map(|active| active.record.status)
            .ok_or_else(|| no_request(target_id))?;
        match status {
            RequestStatus::Pending => {
                let next = if accept {
                    RequestStatus::Accepted
                } else {
                    RequestStatus::Rejected
                };
                slot.resolve(next).ok_or_else(|| no_request(target_id))
            }
            RequestStatus::Expired(_) => Err(HuddleError::TooLate),
            other => Err(HuddleError::invalid_state(format!(
                "request is already {}",
                other.label()
            ))),
        }
    }

    /// Withdraws every pending request sent by `requester_id`.
    pub fn withdraw(&self, requester_id: &EndpointId) -> HuddleResult<Vec<ConnectRequest>> {
        let mut withdrawn = Vec::new();
        for mut guard in self.inner.targets.iter_mut() {
            let slot = guard.value_mut();
            let owned_pending = slot.active.as_ref().is_some_and(|active| {
                &active.record.requester_id == requester_id && !active.record.status.is_terminal()
            });
            if owned_pending {
                if let Some(record) = slot.resolve(RequestStatus::Withdrawn) {
                    withdrawn.push(record);
                }
            }
        }
        if withdrawn.is_empty() {
            return Err(HuddleError::invalid_state(format!(
                "{requester_id} has no pending request"
            )));
        }
        Ok(withdrawn)
    }

    /// Current watch of the request addressed to `target_id`. Yields `None`
    /// when no request exists.
    pub fn incoming(&self, target_id: &EndpointId) -> watch::Receiver<Option<ConnectRequest>> {
        self.inner
            .targets
            .entry(target_id.clone())
            .or_insert_with(TargetSlot::new)
            .incoming
            .subscribe()
    }

    pub fn pending_for(&self, target_id: &EndpointId) -> Option<ConnectRequest> {
        self.inner
            .targets
            .get(target_id)
            .and_then(|slot| slot.active.as_ref().map(|active| active.record.clone()))
    }

    /// Withdraws the request `id` addressed to `target_id` if it is still pending.
    pub fn withdraw_request(
        &self,
        target_id: &EndpointId,
        id: RequestId,
    ) -> HuddleResult<ConnectRequest> {
        let mut guard = self
            .inner
            .targets
            .get_mut(target_id)
            .ok_or_else(|| no_request(target_id))?;
        let slot = &mut *guard;
        let status = slot
            .active_mut(id)
            .map(|active| active.record.status)
            .ok_or_else(|| no_request(target_id))?;
        if status.is_terminal() {
            return Err(HuddleError::invalid_state(format!(
                "request is already {}",
                status.label()
            )));
        }
        slot.resolve(RequestStatus::Withdrawn)
            .ok_or_else(|| no_request(target_id))
    }

    // Drops a terminal record once its requester has seen the outcome.
    fn clear(&self, target_id: &EndpointId, id: RequestId) {
        if let Some(mut guard) = self.inner.targets.get_mut(target_id) {
            let slot = &mut *guard;
            let terminal = slot
                .active_mut(id)
                .is_some_and(|active| active.record.status.is_terminal());
            if terminal {
                slot.active = None;
                slot.incoming.send_replace(None);
                debug!(
                    target = "huddle::broker",
                    request_id = %id,
                    target_id = %target_id,
                    "connect request cleared"
                );
            }
        }
        self.inner
            .targets
            .remove_if(target_id, |_, slot| slot.is_idle());
    }

    fn spawn_deadline(&self, target: EndpointId, id: RequestId, epoch: u64, at: Instant) {
        let inner: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut wake = at;
            loop {
                sleep_until(wake).await;
                let Some(broker) = inner.upgrade() else {
                    break;
                };
                match broker.on_deadline(&target, id, epoch) {
                    Some(next) => wake = next,
                    None => break,
                }
            }
        });
    }
}

fn no_request(target_id: &EndpointId) -> HuddleError {
    HuddleError::invalid_state(format!("no connect request for {target_id}"))
}

fn wall_deadline(from: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// Timeouts past what the clock can represent never fire.
fn instant_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Requester side of a connect request. Dropping the handle before the
/// request resolved withdraws it.
pub struct RequestHandle {
    broker: RequestBroker,
    target: EndpointId,
    id: RequestId,
    status: watch::Receiver<ConnectRequest>,
    settled: bool,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn target(&self) -> &EndpointId {
        &self.target
    }

    pub fn current(&self) -> ConnectRequest {
        self.status.borrow().clone()
    }

    /// Local countdown for display. The broker deadline is what counts.
    pub fn remaining(&self) -> Duration {
        self.status.borrow().remaining()
    }

    /// Waits for the next change of the request. The terminal record is
    /// returned exactly once; afterwards this yields `None`.
    pub async fn changed(&mut self) -> Option<ConnectRequest> {
        if self.settled {
            return None;
        }
        let result = self.status.changed().await;
        let record = self.status.borrow_and_update().clone();
        if record.status.is_terminal() {
            self.settle();
            return Some(record);
        }
        match result {
            Ok(()) => Some(record),
            Err(_) => {
                self.settled = true;
                None
            }
        }
    }

    /// Waits until the request resolves and returns the terminal record.
    pub async fn wait_terminal(&mut self) -> HuddleResult<ConnectRequest> {
        loop {
            if self.settled {
                let record = self.current();
                return if record.status.is_terminal() {
                    Ok(record)
                } else {
                    Err(HuddleError::Closed("request broker".into()))
                };
            }
            if let Some(record) = self.changed().await {
                if record.status.is_terminal() {
                    return Ok(record);
                }
            }
        }
    }

    pub async fn outcome(&mut self) -> HuddleResult<RequestOutcome> {
        let record = self.wait_terminal().await?;
        record
            .status
            .outcome()
            .ok_or_else(|| HuddleError::invalid_state("request has no outcome"))
    }

    /// Waits for the request to resolve; errors unless it was accepted.
    pub async fn accepted(&mut self) -> HuddleResult<()> {
        self.wait_terminal().await?.accepted()
    }

    pub fn withdraw(&mut self) -> HuddleResult<ConnectRequest> {
        let record = self.broker.withdraw_request(&self.target, self.id)?;
        self.status.borrow_and_update();
        self.settle();
        Ok(record)
    }

    fn settle(&mut self) {
        if !self.settled {
            self.settled = true;
            self.broker.clear(&self.target, self.id);
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if !self.status.borrow().status.is_terminal() {
            let _ = self.broker.withdraw_request(&self.target, self.id);
        }
        self.settle();
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("status", &self.status.borrow().status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;

    fn broker() -> (RequestBroker, Endpoint, Endpoint) {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = Endpoint::new("123456", "Alice");
        let bob = Endpoint::new("654321", "Bob");
        directory.register(&alice);
        directory.register(&bob);
        (
            RequestBroker::new(directory, &HuddleConfig::default()),
            alice,
            bob,
        )
    }

    #[tokio::test]
    async fn second_propose_is_already_pending() {
        let (broker, alice, bob) = broker();
        let carol = Endpoint::new("777", "Carol");
        let _first = broker.propose(&alice, &bob.id, None).await.unwrap();
        let err = broker.propose(&carol, &bob.id, None).await.unwrap_err();
        assert_eq!(
            err,
            HuddleError::AlreadyPending {
                target: bob.id.clone()
            }
        );
    }

    #[tokio::test]
    async fn unknown_targets_are_rejected() {
        let (broker, alice, _) = broker();
        let err = broker
            .propose(&alice, &"ghost".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HuddleError::UnknownEndpoint(_)));
    }

    #[tokio::test]
    async fn deciding_twice_is_invalid() {
        let (broker, alice, bob) = broker();
        let mut handle = broker.propose(&alice, &bob.id, None).await.unwrap();
        broker.decide(&bob.id, &bob.id, false).unwrap();
        assert!(matches!(
            broker.decide(&bob.id, &bob.id, true),
            Err(HuddleError::InvalidState(_))
        ));
        assert_eq!(handle.outcome().await.unwrap(), RequestOutcome::Declined);
        assert!(matches!(
            broker.decide(&bob.id, &bob.id, true),
            Err(HuddleError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn only_the_target_decides() {
        let (broker, alice, bob) = broker();
        let _handle = broker.propose(&alice, &bob.id, None).await.unwrap();
        assert!(matches!(
            broker.decide(&bob.id, &alice.id, true),
            Err(HuddleError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_handle_withdraws() {
        let (broker, alice, bob) = broker();
        let mut incoming = broker.incoming(&bob.id);
        let handle = broker.propose(&alice, &bob.id, None).await.unwrap();
        drop(handle);
        let seen = incoming.borrow_and_update().clone();
        assert!(seen.is_none());
        assert!(broker.pending_for(&bob.id).is_none());
        assert!(broker.propose(&alice, &bob.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn withdraw_covers_every_pending_request() {
        let directory = Arc::new(InMemoryDirectory::new());
        let alice = Endpoint::new("123456", "Alice");
        let bob = Endpoint::new("654321", "Bob");
        let carol = Endpoint::new("777", "Carol");
        for endpoint in [&alice, &bob, &carol] {
            directory.register(endpoint);
        }
        let broker = RequestBroker::new(directory, &HuddleConfig::default());

        let mut to_bob = broker.propose(&alice, &bob.id, None).await.unwrap();
        let mut to_carol = broker.propose(&alice, &carol.id, None).await.unwrap();
        let withdrawn = broker.withdraw(&alice.id).unwrap();
        assert_eq!(withdrawn.len(), 2);
        assert_eq!(to_bob.outcome().await.unwrap(), RequestOutcome::Withdrawn);
        assert_eq!(to_carol.outcome().await.unwrap(), RequestOutcome::Withdrawn);
        assert!(broker.withdraw(&alice.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_request_expires_without_decision() {
        let (broker, alice, bob) = broker();
        let mut handle = broker.propose(&alice, &bob.id, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(broker.acknowledge(&bob.id).unwrap().acknowledged);

        // The original 30s window no longer applies.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(handle.current().status, RequestStatus::Pending);

        assert_eq!(handle.outcome().await.unwrap(), RequestOutcome::NoResponse);
        assert!(matches!(
            broker.decide(&bob.id, &bob.id, true),
            Err(HuddleError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn decision_after_expiry_is_too_late() {
        let (broker, alice, bob) = broker();
        let _handle = broker.propose(&alice, &bob.id, None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(broker.decide(&bob.id, &bob.id, true), Err(HuddleError::TooLate));
        assert_eq!(broker.acknowledge(&bob.id), Err(HuddleError::TooLate));
    }
}
