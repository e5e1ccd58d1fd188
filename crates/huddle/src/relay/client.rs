//! WebSocket client for a `huddle-road` relay.
//!
//! One connection carries every call of the endpoint: slot publishes and
//! subscriptions, roster membership and the connect-request operations of the
//! broker running on the server.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace, warn};
use url::Url;

use crate::broker::{ConnectRequest, RequestId, RequestOutcome};
use crate::config::HuddleConfig;
use crate::error::{HuddleError, HuddleResult};
use crate::protocol::{CallId, ClientMessage, ReplyBody, ServerMessage, SubscriptionId};
use crate::relay::{MembershipChange, MeshMember, Roster, RosterJoin, SignalingRelay, Subscription};
use crate::signal::SignalingEnvelope;
use crate::types::{Endpoint, EndpointId, SessionId, Slot};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type Reply = Result<ReplyBody, HuddleError>;

enum StreamSink {
    Slot(mpsc::UnboundedSender<SignalingEnvelope>),
    Roster(mpsc::UnboundedSender<MembershipChange>),
    Incoming(watch::Sender<Option<ConnectRequest>>),
}

struct ClientInner {
    endpoint: Endpoint,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    pending: DashMap<CallId, oneshot::Sender<Reply>>,
    streams: DashMap<SubscriptionId, StreamSink>,
    requests: DashMap<RequestId, watch::Sender<ConnectRequest>>,
    welcome: Mutex<Option<oneshot::Sender<EndpointId>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    call_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(&self, message: ClientMessage) -> HuddleResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HuddleError::relay_unavailable("relay connection closed"));
        }
        self.send_tx
            .send(message)
            .map_err(|_| HuddleError::relay_unavailable("relay connection closed"))
    }

    async fn call(&self, build: impl FnOnce(CallId) -> ClientMessage) -> HuddleResult<ReplyBody> {
        let call_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        if let Err(err) = self.send(build(call_id)) {
            self.pending.remove(&call_id);
            return Err(err);
        }
        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(HuddleError::relay_unavailable("relay connection closed")),
            Err(_) => {
                self.pending.remove(&call_id);
                Err(HuddleError::relay_unavailable(format!(
                    "relay call timed out after {}s",
                    self.call_timeout.as_secs()
                )))
            }
        }
    }

    fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { endpoint_id } => {
                if let Some(tx) = self.welcome.lock().take() {
                    let _ = tx.send(endpoint_id);
                }
            }
            ServerMessage::Reply { call_id, result } => {
                // Register our own fresh proposals before the caller wakes so
                // no update can slip in between.
                if let Ok(ReplyBody::Request { request }) = &result {
                    if request.requester_id == self.endpoint.id && !request.status.is_terminal() {
                        self.requests
                            .entry(request.id)
                            .or_insert_with(|| watch::channel(request.clone()).0);
                    }
                }
                match self.pending.remove(&call_id) {
                    Some((_, tx)) => {
                        let _ = tx.send(result);
                    }
                    None => trace!(target = "huddle::relay", call_id, "reply for unknown call"),
                }
            }
            ServerMessage::Delivered {
                subscription_id,
                envelope,
            } => {
                if let Some(entry) = self.streams.get(&subscription_id) {
                    if let StreamSink::Slot(tx) = entry.value() {
                        let _ = tx.send(envelope);
                    }
                }
            }
            ServerMessage::Membership {
                subscription_id,
                change,
            } => {
                if let Some(entry) = self.streams.get(&subscription_id) {
                    if let StreamSink::Roster(tx) = entry.value() {
                        let _ = tx.send(change);
                    }
                }
            }
            ServerMessage::Incoming {
                subscription_id,
                request,
            } => {
                if let Some(entry) = self.streams.get(&subscription_id) {
                    if let StreamSink::Incoming(tx) = entry.value() {
                        tx.send_replace(request);
                    }
                }
            }
            ServerMessage::RequestUpdate { request } => {
                let terminal = request.status.is_terminal();
                if let Some(entry) = self.requests.get(&request.id) {
                    entry.value().send_replace(request.clone());
                }
                if terminal {
                    self.requests.remove(&request.id);
                }
            }
            ServerMessage::Pong => {}
            ServerMessage::Error { message } => {
                warn!(target = "huddle::relay", error = %message, "relay reported an error");
            }
        }
    }

    // Fails everything in flight once the socket is gone.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let calls: Vec<CallId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for call_id in calls {
            if let Some((_, tx)) = self.pending.remove(&call_id) {
                let _ = tx.send(Err(HuddleError::relay_unavailable("relay connection closed")));
            }
        }
        self.streams.clear();
        self.requests.clear();
        self.welcome.lock().take();
    }
}

/// Relay reached over a WebSocket. Cloning shares the connection.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Connects to `url` (an `http(s)` base or a `ws(s)` endpoint) and says
    /// hello as `endpoint`.
    pub async fn connect(url: &str, endpoint: Endpoint, config: &HuddleConfig) -> HuddleResult<Self> {
        let websocket_url = derive_websocket_url(url)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| HuddleError::relay_unavailable(format!("websocket connect failed: {err}")))?;
        debug!(target = "huddle::relay", url = %websocket_url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (welcome_tx, welcome_rx) = oneshot::channel();
        let inner = Arc::new(ClientInner {
            endpoint: endpoint.clone(),
            send_tx,
            pending: DashMap::new(),
            streams: DashMap::new(),
            requests: DashMap::new(),
            welcome: Mutex::new(Some(welcome_tx)),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            call_timeout: config.call_timeout,
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(target = "huddle::relay", error = %err, "failed to encode message")
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_inner = Arc::downgrade(&inner);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "huddle::relay", "relay websocket closed: {err}");
                            }
                            _ => warn!(target = "huddle::relay", "relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                let Some(inner) = reader_inner.upgrade() else {
                    break;
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => inner.handle_server_message(message),
                    Err(err) => {
                        warn!(target = "huddle::relay", error = %err, "unparseable relay message")
                    }
                }
            }
            if let Some(inner) = reader_inner.upgrade() {
                inner.shutdown();
            }
        });

        let heartbeat_inner = Arc::downgrade(&inner);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = heartbeat_inner.upgrade() else {
                    break;
                };
                if inner.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });
        inner.tasks.lock().extend([writer, reader, heartbeat]);

        inner.send(ClientMessage::Hello { endpoint })?;
        match tokio::time::timeout(config.call_timeout, welcome_rx).await {
            Ok(Ok(endpoint_id)) => {
                debug!(target = "huddle::relay", endpoint_id = %endpoint_id, "relay welcomed us");
                Ok(Self { inner })
            }
            Ok(Err(_)) => Err(HuddleError::relay_unavailable("relay closed before welcome")),
            Err(_) => Err(HuddleError::relay_unavailable("relay did not answer hello")),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Drops the connection. Pending calls fail with `RelayUnavailable` and
    /// every subscription ends.
    pub fn close(&self) {
        self.inner.shutdown();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Proposes a connection to `target_id` through the server's broker.
    pub async fn propose(
        &self,
        target_id: &EndpointId,
        timeout: Option<Duration>,
    ) -> HuddleResult<RemoteRequest> {
        let target_id = target_id.clone();
        let timeout_ms = timeout.map(timeout_millis);
        let body = self
            .inner
            .call(|call_id| ClientMessage::Propose {
                call_id,
                target_id,
                timeout_ms,
            })
            .await?;
        let ReplyBody::Request { request } = body else {
            return Err(unexpected_reply("propose"));
        };
        let status = match self.inner.requests.get(&request.id) {
            Some(entry) => entry.value().subscribe(),
            // Resolved before we looked; keep the record we were given.
            None => watch::channel(request.clone()).1,
        };
        Ok(RemoteRequest {
            client: self.clone(),
            id: request.id,
            target: request.target_id.clone(),
            status,
            settled: false,
        })
    }

    pub async fn acknowledge(&self) -> HuddleResult<ConnectRequest> {
        match self
            .inner
            .call(|call_id| ClientMessage::Acknowledge { call_id })
            .await?
        {
            ReplyBody::Request { request } => Ok(request),
            _ => Err(unexpected_reply("acknowledge")),
        }
    }

    pub async fn decide(&self, accept: bool) -> HuddleResult<ConnectRequest> {
        match self
            .inner
            .call(|call_id| ClientMessage::Decide { call_id, accept })
            .await?
        {
            ReplyBody::Request { request } => Ok(request),
            _ => Err(unexpected_reply("decide")),
        }
    }

    /// Withdraws every pending request this endpoint made.
    pub async fn withdraw(&self) -> HuddleResult<usize> {
        match self
            .inner
            .call(|call_id| ClientMessage::Withdraw { call_id })
            .await?
        {
            ReplyBody::Withdrawn { count } => Ok(count),
            _ => Err(unexpected_reply("withdraw")),
        }
    }

    /// Watch of the request addressed to this endpoint.
    pub fn incoming(&self) -> HuddleResult<watch::Receiver<Option<ConnectRequest>>> {
        let subscription_id = self.inner.next_id();
        let (tx, rx) = watch::channel(None);
        self.inner
            .streams
            .insert(subscription_id, StreamSink::Incoming(tx));
        if let Err(err) = self
            .inner
            .send(ClientMessage::WatchIncoming { subscription_id })
        {
            self.inner.streams.remove(&subscription_id);
            return Err(err);
        }
        Ok(rx)
    }

    fn cancel_stream(
        inner: Weak<ClientInner>,
        subscription_id: SubscriptionId,
    ) -> impl FnOnce() + Send + Sync {
        move || {
            if let Some(inner) = inner.upgrade() {
                if inner.streams.remove(&subscription_id).is_some() {
                    let _ = inner.send(ClientMessage::Unsubscribe { subscription_id });
                }
            }
        }
    }
}

#[async_trait]
impl SignalingRelay for RelayClient {
    async fn publish(&self, envelope: SignalingEnvelope) -> HuddleResult<()> {
        if envelope.from != self.inner.endpoint.id {
            return Err(HuddleError::invalid_state(format!(
                "cannot publish as {} over the connection of {}",
                envelope.from, self.inner.endpoint.id
            )));
        }
        match self
            .inner
            .call(|call_id| ClientMessage::Publish { call_id, envelope })
            .await?
        {
            ReplyBody::Done => Ok(()),
            _ => Err(unexpected_reply("publish")),
        }
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        slot: Slot,
    ) -> HuddleResult<Subscription<SignalingEnvelope>> {
        let subscription_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.streams.insert(subscription_id, StreamSink::Slot(tx));
        let session_id = session_id.clone();
        let result = self
            .inner
            .call(|call_id| ClientMessage::Subscribe {
                call_id,
                subscription_id,
                session_id,
                slot,
            })
            .await;
        if let Err(err) = result {
            self.inner.streams.remove(&subscription_id);
            return Err(err);
        }
        Ok(Subscription::new(
            rx,
            Self::cancel_stream(Arc::downgrade(&self.inner), subscription_id),
        ))
    }
}

#[async_trait]
impl Roster for RelayClient {
    async fn join(&self, mesh: &SessionId, member: MeshMember) -> HuddleResult<RosterJoin> {
        let subscription_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .streams
            .insert(subscription_id, StreamSink::Roster(tx));
        let mesh_id = mesh.clone();
        let result = self
            .inner
            .call(|call_id| ClientMessage::JoinMesh {
                call_id,
                subscription_id,
                mesh_id,
                member,
            })
            .await;
        let members = match result {
            Ok(ReplyBody::Roster { members }) => members,
            Ok(_) => {
                self.inner.streams.remove(&subscription_id);
                return Err(unexpected_reply("join_mesh"));
            }
            Err(err) => {
                self.inner.streams.remove(&subscription_id);
                return Err(err);
            }
        };
        Ok(RosterJoin {
            members,
            changes: Subscription::new(
                rx,
                Self::cancel_stream(Arc::downgrade(&self.inner), subscription_id),
            ),
        })
    }

    async fn leave(&self, mesh: &SessionId, member_id: &EndpointId) -> HuddleResult<()> {
        if member_id != &self.inner.endpoint.id {
            return Err(HuddleError::invalid_state(format!(
                "cannot remove {member_id} over the connection of {}",
                self.inner.endpoint.id
            )));
        }
        let mesh_id = mesh.clone();
        match self
            .inner
            .call(|call_id| ClientMessage::LeaveMesh { call_id, mesh_id })
            .await?
        {
            ReplyBody::Done => Ok(()),
            _ => Err(unexpected_reply("leave_mesh")),
        }
    }
}

impl fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayClient")
            .field("endpoint", &self.inner.endpoint.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Requester side of a connect request held by a remote broker. Mirrors
/// [`RequestHandle`](crate::broker::RequestHandle): dropping it before the
/// request resolved withdraws it.
pub struct RemoteRequest {
    client: RelayClient,
    id: RequestId,
    target: EndpointId,
    status: watch::Receiver<ConnectRequest>,
    settled: bool,
}

impl RemoteRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn target(&self) -> &EndpointId {
        &self.target
    }

    pub fn current(&self) -> ConnectRequest {
        self.status.borrow().clone()
    }

    pub fn remaining(&self) -> Duration {
        self.status.borrow().remaining()
    }

    /// Next change of the request; the terminal record is returned once.
    pub async fn changed(&mut self) -> Option<ConnectRequest> {
        if self.settled {
            return None;
        }
        if self.status.borrow().status.is_terminal() {
            self.settled = true;
            return Some(self.current());
        }
        let result = self.status.changed().await;
        let record = self.status.borrow_and_update().clone();
        if record.status.is_terminal() || result.is_err() {
            self.settled = true;
            return record.status.is_terminal().then_some(record);
        }
        Some(record)
    }

    pub async fn wait_terminal(&mut self) -> HuddleResult<ConnectRequest> {
        loop {
            if self.settled {
                let record = self.current();
                return if record.status.is_terminal() {
                    Ok(record)
                } else {
                    Err(HuddleError::relay_unavailable("request updates ended"))
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

    pub async fn accepted(&mut self) -> HuddleResult<()> {
        self.wait_terminal().await?.accepted()
    }

    pub async fn withdraw(&mut self) -> HuddleResult<ConnectRequest> {
        let request_id = self.id;
        let body = self
            .client
            .inner
            .call(|call_id| ClientMessage::WithdrawRequest {
                call_id,
                request_id,
            })
            .await?;
        self.settled = true;
        self.client.inner.requests.remove(&self.id);
        match body {
            ReplyBody::Request { request } => Ok(request),
            _ => Err(unexpected_reply("withdraw_request")),
        }
    }
}

impl Drop for RemoteRequest {
    fn drop(&mut self) {
        if self.settled || self.status.borrow().status.is_terminal() {
            return;
        }
        let call_id = self.client.inner.next_id();
        let _ = self.client.inner.send(ClientMessage::WithdrawRequest {
            call_id,
            request_id: self.id,
        });
        self.client.inner.requests.remove(&self.id);
    }
}

impl fmt::Debug for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRequest")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("status", &self.status.borrow().status)
            .finish()
    }
}

fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

fn unexpected_reply(call: &str) -> HuddleError {
    HuddleError::relay_unavailable(format!("unexpected reply to {call}"))
}

/// `http(s)://host[/base]` becomes `ws(s)://host[/base]/ws`; `ws(s)` urls are
/// used as given.
pub fn derive_websocket_url(raw: &str) -> HuddleResult<Url> {
    let base = Url::parse(raw)
        .map_err(|err| HuddleError::relay_unavailable(format!("invalid relay url {raw}: {err}")))?;
    match base.scheme() {
        "ws" | "wss" => Ok(base),
        "http" | "https" => {
            let mut ws = base.clone();
            ws.set_scheme(if base.scheme() == "https" { "wss" } else { "ws" })
                .map_err(|_| HuddleError::relay_unavailable("invalid websocket scheme"))?;
            let path = format!("{}/ws", base.path().trim_end_matches('/'));
            ws.set_path(&path);
            ws.set_query(None);
            ws.set_fragment(None);
            Ok(ws)
        }
        other => Err(HuddleError::relay_unavailable(format!(
            "unsupported relay url scheme {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_from_http_base() {
        assert_eq!(
            derive_websocket_url("https://relay.example.com").unwrap().as_str(),
            "wss://relay.example.com/ws"
        );
        assert_eq!(
            derive_websocket_url("http://127.0.0.1:8080/huddle/").unwrap().as_str(),
            "ws://127.0.0.1:8080/huddle/ws"
        );
        assert_eq!(
            derive_websocket_url("ws://127.0.0.1:8080/ws").unwrap().as_str(),
            "ws://127.0.0.1:8080/ws"
        );
        assert!(derive_websocket_url("ftp://example.com").is_err());
        assert!(derive_websocket_url("not a url").is_err());
    }

    #[test]
    fn request_timeouts_saturate_instead_of_wrapping() {
        assert_eq!(timeout_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(timeout_millis(Duration::MAX), u64::MAX);
    }
}
