use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use huddle::protocol::{ClientMessage, ReplyBody, ServerMessage, SubscriptionId};
use huddle::{
    Endpoint, HuddleError, HuddleResult, RequestHandle, RequestId, Roster, SessionId,
    SignalingRelay,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::RoadState;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RoadState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Everything one socket owns on the shared relay and broker.
struct Connection {
    state: RoadState,
    tx: mpsc::UnboundedSender<ServerMessage>,
    endpoint: Option<Endpoint>,
    pumps: HashMap<SubscriptionId, JoinHandle<()>>,
    meshes: HashSet<SessionId>,
    requests: HashMap<RequestId, (huddle::EndpointId, JoinHandle<()>)>,
}

async fn handle_socket(socket: WebSocket, state: RoadState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(target = "huddle_road", error = %err, "failed to encode message"),
            }
        }
    });

    let mut connection = Connection {
        state,
        tx,
        endpoint: None,
        pumps: HashMap::new(),
        meshes: HashSet::new(),
        requests: HashMap::new(),
    };

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(target = "huddle_road", error = %err, "websocket error");
                break;
            }
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => connection.handle(message).await,
            Err(err) => {
                warn!(target = "huddle_road", error = %err, "unparseable client message");
                let _ = connection.tx.send(ServerMessage::Error {
                    message: format!("invalid message: {err}"),
                });
            }
        }
    }

    connection.disconnect().await;
    writer.abort();
}

impl Connection {
    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Hello { endpoint } => self.hello(endpoint),
            ClientMessage::Ping => {
                let _ = self.tx.send(ServerMessage::Pong);
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                if let Some(pump) = self.pumps.remove(&subscription_id) {
                    pump.abort();
                }
            }
            ClientMessage::WatchIncoming { subscription_id } => {
                if let Err(err) = self.watch_incoming(subscription_id) {
                    let _ = self.tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    });
                }
            }
            ClientMessage::Publish { call_id, envelope } => {
                let result = self.publish(envelope).await;
                self.reply(call_id, result);
            }
            ClientMessage::Subscribe {
                call_id,
                subscription_id,
                session_id,
                slot,
            } => {
                let result = self.subscribe(subscription_id, session_id, slot).await;
                self.reply(call_id, result);
            }
            ClientMessage::JoinMesh {
                call_id,
                subscription_id,
                mesh_id,
                member,
            } => {
                let result = self.join_mesh(subscription_id, mesh_id, member).await;
                self.reply(call_id, result);
            }
            ClientMessage::LeaveMesh { call_id, mesh_id } => {
                let result = self.leave_mesh(mesh_id).await;
                self.reply(call_id, result);
            }
            ClientMessage::Propose {
                call_id,
                target_id,
                timeout_ms,
            } => match self.propose(target_id, timeout_ms).await {
                Ok(handle) => {
                    self.reply(
                        call_id,
                        Ok(ReplyBody::Request {
                            request: handle.current(),
                        }),
                    );
                    self.pump_request(handle);
                }
                Err(err) => self.reply(call_id, Err(err)),
            },
            ClientMessage::WithdrawRequest {
                call_id,
                request_id,
            } => {
                let result = self.withdraw_request(request_id);
                self.reply(call_id, result);
            }
            ClientMessage::Acknowledge { call_id } => {
                let result = self.endpoint_id().and_then(|id| {
                    self.state
                        .broker
                        .acknowledge(&id)
                        .map(|request| ReplyBody::Request { request })
                });
                self.reply(call_id, result);
            }
            ClientMessage::Decide { call_id, accept } => {
                let result = self.endpoint_id().and_then(|id| {
                    self.state
                        .broker
                        .decide(&id, &id, accept)
                        .map(|request| ReplyBody::Request { request })
                });
                self.reply(call_id, result);
            }
            ClientMessage::Withdraw { call_id } => {
                let result = self.endpoint_id().and_then(|id| {
                    self.state
                        .broker
                        .withdraw(&id)
                        .map(|withdrawn| ReplyBody::Withdrawn {
                            count: withdrawn.len(),
                        })
                });
                self.reply(call_id, result);
            }
        }
    }

    fn reply(&self, call_id: u64, result: HuddleResult<ReplyBody>) {
        if let Err(err) = &result {
            debug!(target = "huddle_road", call_id, code = err.code(), "call failed");
        }
        let _ = self.tx.send(ServerMessage::Reply { call_id, result });
    }

    fn endpoint(&self) -> HuddleResult<&Endpoint> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| HuddleError::invalid_state("say hello first"))
    }

    fn endpoint_id(&self) -> HuddleResult<huddle::EndpointId> {
        self.endpoint().map(|endpoint| endpoint.id.clone())
    }

    fn hello(&mut self, endpoint: Endpoint) {
        if let Some(current) = &self.endpoint {
            if current.id != endpoint.id {
                let _ = self.tx.send(ServerMessage::Error {
                    message: format!("connection already belongs to {}", current.id),
                });
                return;
            }
        }
        info!(
            target = "huddle_road",
            endpoint = %endpoint.id,
            name = %endpoint.display_name,
            "endpoint connected"
        );
        self.state.directory.register(&endpoint);
        let _ = self.tx.send(ServerMessage::Welcome {
            endpoint_id: endpoint.id.clone(),
        });
        self.endpoint = Some(endpoint);
    }

    async fn publish(&self, envelope: huddle::SignalingEnvelope) -> HuddleResult<ReplyBody> {
        let id = self.endpoint_id()?;
        if envelope.from != id {
            return Err(HuddleError::invalid_state(format!(
                "{id} cannot publish as {}",
                envelope.from
            )));
        }
        self.state.relay.publish(envelope).await?;
        Ok(ReplyBody::Done)
    }

    async fn subscribe(
        &mut self,
        subscription_id: SubscriptionId,
        session_id: SessionId,
        slot: huddle::Slot,
    ) -> HuddleResult<ReplyBody> {
        self.endpoint()?;
        let mut subscription = self.state.relay.subscribe(&session_id, slot).await?;
        let tx = self.tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                if tx
                    .send(ServerMessage::Delivered {
                        subscription_id,
                        envelope,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        if let Some(previous) = self.pumps.insert(subscription_id, pump) {
            previous.abort();
        }
        Ok(ReplyBody::Done)
    }

    async fn join_mesh(
        &mut self,
        subscription_id: SubscriptionId,
        mesh_id: SessionId,
        member: huddle::MeshMember,
    ) -> HuddleResult<ReplyBody> {
        let id = self.endpoint_id()?;
        if member.id() != &id {
            return Err(HuddleError::invalid_state(format!(
                "{id} cannot join as {}",
                member.id()
            )));
        }
        let joined = self.state.relay.join(&mesh_id, member).await?;
        let mut changes = joined.changes;
        let tx = self.tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                if tx
                    .send(ServerMessage::Membership {
                        subscription_id,
                        change,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        if let Some(previous) = self.pumps.insert(subscription_id, pump) {
            previous.abort();
        }
        info!(target = "huddle_road", endpoint = %id, mesh = %mesh_id, "joined mesh");
        self.meshes.insert(mesh_id);
        Ok(ReplyBody::Roster {
            members: joined.members,
        })
    }

    async fn leave_mesh(&mut self, mesh_id: SessionId) -> HuddleResult<ReplyBody> {
        let id = self.endpoint_id()?;
        self.state.relay.leave(&mesh_id, &id).await?;
        self.meshes.remove(&mesh_id);
        Ok(ReplyBody::Done)
    }

    async fn propose(
        &mut self,
        target_id: huddle::EndpointId,
        timeout_ms: Option<u64>,
    ) -> HuddleResult<RequestHandle> {
        let requester = self.endpoint()?.clone();
        self.state
            .broker
            .propose(&requester, &target_id, timeout_ms.map(Duration::from_millis))
            .await
    }

    // Forwards every status change to the requester. Aborting the pump drops
    // the handle, which withdraws a request that is still pending.
    fn pump_request(&mut self, mut handle: RequestHandle) {
        let id = handle.id();
        let target = handle.target().clone();
        let tx = self.tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(request) = handle.changed().await {
                if tx.send(ServerMessage::RequestUpdate { request }).is_err() {
                    break;
                }
            }
        });
        self.requests.retain(|_, (_, pump)| !pump.is_finished());
        self.requests.insert(id, (target, pump));
    }

    fn withdraw_request(&mut self, request_id: RequestId) -> HuddleResult<ReplyBody> {
        let (target, _) = self
            .requests
            .get(&request_id)
            .ok_or_else(|| HuddleError::invalid_state(format!("unknown request {request_id}")))?;
        let request = self.state.broker.withdraw_request(target, request_id)?;
        Ok(ReplyBody::Request { request })
    }

    fn watch_incoming(&mut self, subscription_id: SubscriptionId) -> HuddleResult<()> {
        let id = self.endpoint_id()?;
        let mut incoming = self.state.broker.incoming(&id);
        let tx = self.tx.clone();
        let pump = tokio::spawn(async move {
            loop {
                let request = incoming.borrow_and_update().clone();
                if tx
                    .send(ServerMessage::Incoming {
                        subscription_id,
                        request,
                    })
                    .is_err()
                {
                    break;
                }
                if incoming.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.pumps.insert(subscription_id, pump) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        for (_, pump) in self.pumps.drain() {
            pump.abort();
        }
        for (_, (_, pump)) in self.requests.drain() {
            pump.abort();
        }
        let Some(endpoint) = self.endpoint.take() else {
            return;
        };
        for mesh_id in self.meshes.drain() {
            if let Err(err) = self.state.relay.leave(&mesh_id, &endpoint.id).await {
                debug!(target = "huddle_road", mesh = %mesh_id, error = %err, "mesh leave failed");
            }
        }
        self.state.directory.set_reachable(&endpoint.id, false);
        info!(target = "huddle_road", endpoint = %endpoint.id, "endpoint disconnected");
    }
}
