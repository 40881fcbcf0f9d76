//! Cache node runtime.
//!
//! A node joins the coordinator, receives its neighbor list, waits for
//! activation and then serves location-tagged queries. Queries it is too busy
//! for are passed to a neighbor, at most `ttl` times per query.
//!
//! ```text
//! Initial --JOIN sent--> AwaitingData --ADD_TO_GRID--> AwaitingActivation
//!         --ACTIVATE--> Active --SHUTDOWN / close / violation--> Dead
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use geogrid_protocol::{
    bind_listener, tracing_sink, Message, MessageHandler, MessageKind, MessagingChannel,
    NeighborInfo, NodeAddress, QueryMessage, SharedSink, STATUS_NOT_SIGNUP, STATUS_OK,
    STATUS_PROTOCOL_VIOLATION,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::load::LoadTracker;
use crate::router::{QueryRouter, RouteDecision};
use crate::{lock, read, write};

/// Lifecycle state of a cache node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Initial,
    AwaitingData,
    AwaitingActivation,
    Active,
    Dead,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::AwaitingData => write!(f, "AwaitingData"),
            Self::AwaitingActivation => write!(f, "AwaitingActivation"),
            Self::Active => write!(f, "Active"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// How the node got into the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted during signup.
    Joined,
    /// Signup was over; the coordinator granted a growth slot.
    Subdivision,
}

/// Neighbor list as of a grid epoch.
#[derive(Debug, Default)]
struct NeighborSet {
    epoch: u64,
    list: Vec<NeighborInfo>,
}

struct NodeInner {
    config: NodeConfig,
    address: NodeAddress,
    state: watch::Sender<NodeState>,
    neighbors: RwLock<NeighborSet>,
    /// Outgoing channels, opened on first forward.
    neighbor_channels: tokio::sync::Mutex<HashMap<NodeAddress, MessagingChannel>>,
    client_channels: tokio::sync::Mutex<HashMap<NodeAddress, MessagingChannel>>,
    /// Channels opened by neighbors and clients.
    accepted: Mutex<Vec<MessagingChannel>>,
    coordinator: Mutex<Option<MessagingChannel>>,
    load: Mutex<LoadTracker>,
    router: Mutex<QueryRouter>,
    listener: Mutex<Option<TcpListener>>,
    sink: SharedSink,
}

/// A cache node. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheNode {
    inner: Arc<NodeInner>,
}

struct NodeHandler {
    inner: Arc<NodeInner>,
}

impl MessageHandler for NodeHandler {
    fn process_incoming(&self, _channel: &MessagingChannel, message: Message) -> Message {
        self.inner.process(message)
    }
}

impl CacheNode {
    /// Bind the node's listener. Nothing is sent until [`CacheNode::start`].
    pub fn bind(config: NodeConfig) -> Result<Self> {
        Self::bind_with_sink(config, tracing_sink())
    }

    pub fn bind_with_sink(config: NodeConfig, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(config.listen_addr)?;
        let port = listener.local_addr()?.port();
        let address = NodeAddress::new(config.advertise_host.clone(), port);

        let router = match config.routing_seed {
            Some(seed) => QueryRouter::seeded(config.load_threshold, config.propagation, seed),
            None => QueryRouter::new(config.load_threshold, config.propagation),
        };
        let (state, _) = watch::channel(NodeState::Initial);

        Ok(Self {
            inner: Arc::new(NodeInner {
                address,
                state,
                neighbors: RwLock::new(NeighborSet::default()),
                neighbor_channels: tokio::sync::Mutex::new(HashMap::new()),
                client_channels: tokio::sync::Mutex::new(HashMap::new()),
                accepted: Mutex::new(Vec::new()),
                coordinator: Mutex::new(None),
                load: Mutex::new(LoadTracker::new(config.load_limit, config.load_window)),
                router: Mutex::new(router),
                listener: Mutex::new(Some(listener)),
                sink,
                config,
            }),
        })
    }

    /// Address announced to the coordinator and neighbors.
    pub fn address(&self) -> &NodeAddress {
        &self.inner.address
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    /// Wait until the node reaches `target`, or dies.
    pub async fn wait_for_state(&self, target: NodeState) -> NodeState {
        let mut rx = self.inner.state.subscribe();
        let reached = rx
            .wait_for(|s| *s == target || *s == NodeState::Dead)
            .await
            .map(|s| *s);
        reached.unwrap_or(NodeState::Dead)
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        read(&self.inner.neighbors).list.clone()
    }

    /// Grid epoch of the current neighbor list.
    pub fn neighbor_epoch(&self) -> u64 {
        read(&self.inner.neighbors).epoch
    }

    /// Current load estimate.
    pub fn load(&self) -> f64 {
        lock(&self.inner.load).get_load()
    }

    /// Handler for channels whose peer talks to this node.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.inner.handler()
    }

    /// Feed one inbound message through the state machine.
    pub fn process(&self, message: Message) -> Message {
        self.inner.process(message)
    }

    /// Start listening, connect to the coordinator and JOIN.
    ///
    /// Returns once the coordinator answered. A refusal closes the node,
    /// unless scaling is on and the grid is already running, in which case
    /// the node asks to be added by subdivision.
    pub async fn start(&self) -> Result<Admission> {
        let inner = &self.inner;
        let listener = lock(&inner.listener)
            .take()
            .ok_or_else(|| Error::Config("node already started".into()))?;
        tokio::spawn(Arc::clone(inner).accept_loop(listener));
        if inner.config.scaling {
            tokio::spawn(Arc::clone(inner).report_load());
        }

        let coordinator = match MessagingChannel::connect(&inner.config.coordinator, inner.handler()).await {
            Ok(channel) => channel,
            Err(e) => {
                self.close().await;
                return Err(e.into());
            }
        };
        *lock(&inner.coordinator) = Some(coordinator.clone());

        // Before sending: ADD_TO_GRID may overtake the JOIN confirmation.
        if !inner.transition(NodeState::Initial, NodeState::AwaitingData) {
            return Err(Error::ProtocolViolation {
                state: inner.state(),
                kind: MessageKind::Join,
            });
        }
        info!(
            address = %inner.address,
            coordinator = %inner.config.coordinator,
            location = %inner.config.location,
            "Sending JOIN"
        );
        let join = Message::Join {
            address: inner.address.clone(),
            location: inner.config.location,
        };
        let reply = match coordinator.request(join).await {
            Ok(reply) => reply,
            Err(e) => {
                self.close().await;
                return Err(e.into());
            }
        };

        match reply {
            Message::Confirm { status: STATUS_OK, .. } => {
                info!(address = %inner.address, "Admitted to grid");
                Ok(Admission::Joined)
            }
            Message::Confirm {
                status: STATUS_NOT_SIGNUP,
                text,
            } if inner.config.scaling => {
                info!(address = %inner.address, reason = ?text, "Signup closed, requesting subdivision");
                let request = Message::SubdivisionRequest {
                    address: inner.address.clone(),
                    location: inner.config.location,
                };
                match coordinator.request(request).await {
                    Ok(reply) if reply.is_ack() => Ok(Admission::Subdivision),
                    Ok(reply) => {
                        self.close().await;
                        Err(rejection(&reply))
                    }
                    Err(e) => {
                        self.close().await;
                        Err(e.into())
                    }
                }
            }
            other => {
                let err = rejection(&other);
                warn!(address = %inner.address, "{}", err);
                self.close().await;
                Err(err)
            }
        }
    }

    /// Start, then serve until the node dies.
    pub async fn run(&self) -> Result<()> {
        let admission = self.start().await?;
        info!(address = %self.inner.address, ?admission, "Node started");
        self.wait_for_state(NodeState::Dead).await;
        self.close().await;
        Ok(())
    }

    /// Move to Dead and close every channel the node holds.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.mark_dead() {
            info!(address = %inner.address, "Node closed");
        }
        inner.release_peers().await;
        for channel in lock(&inner.accepted).drain(..) {
            channel.close();
        }
        if let Some(channel) = lock(&inner.coordinator).take() {
            channel.close();
        }
    }
}

fn rejection(reply: &Message) -> Error {
    match reply {
        Message::Confirm { status, text } => Error::AdmissionRejected {
            status: *status,
            reason: text.clone().unwrap_or_default(),
        },
        other => Error::AdmissionRejected {
            status: STATUS_PROTOCOL_VIOLATION,
            reason: format!("unexpected {} reply", other.kind()),
        },
    }
}

impl NodeInner {
    fn handler(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(NodeHandler {
            inner: Arc::clone(self),
        })
    }

    fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    fn transition(&self, from: NodeState, to: NodeState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Returns false if the node was already dead.
    fn mark_dead(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == NodeState::Dead {
                false
            } else {
                *state = NodeState::Dead;
                true
            }
        })
    }

    fn process(self: &Arc<Self>, message: Message) -> Message {
        let state = self.state();
        match message {
            Message::Shutdown => {
                info!(address = %self.address, %state, "Shutdown received");
                self.sink.write(&format!("{} shutting down", self.address));
                self.die();
                Message::ok()
            }
            Message::AddToGrid { epoch, neighbors } if state == NodeState::AwaitingData => {
                let count = neighbors.len();
                *write(&self.neighbors) = NeighborSet {
                    epoch,
                    list: neighbors,
                };
                if !self.transition(NodeState::AwaitingData, NodeState::AwaitingActivation) {
                    return self.violation(self.state(), MessageKind::AddToGrid);
                }
                info!(address = %self.address, epoch, neighbors = count, "Neighbor list received");
                Message::ok()
            }
            Message::Activate if state == NodeState::AwaitingActivation => {
                if !self.transition(NodeState::AwaitingActivation, NodeState::Active) {
                    return self.violation(self.state(), MessageKind::Activate);
                }
                info!(address = %self.address, "Node active");
                self.sink.write(&format!("{} active", self.address));
                Message::ok()
            }
            Message::QueryMessage(query) if state == NodeState::Active => {
                self.handle_query(query);
                Message::ok()
            }
            Message::SubdivisionCommit { epoch, neighbors } if state == NodeState::Active => {
                self.apply_commit(epoch, neighbors);
                Message::SubdivisionConfirm { epoch }
            }
            other => self.violation(state, other.kind()),
        }
    }

    fn violation(self: &Arc<Self>, state: NodeState, kind: MessageKind) -> Message {
        let err = Error::ProtocolViolation { state, kind };
        error!(address = %self.address, "{}", err);
        self.sink.write(&format!("{}: {err}", self.address));
        self.die();
        Message::confirm(STATUS_PROTOCOL_VIOLATION, err.to_string())
    }

    /// Dead from inside a handler: the reply still has to go out on the
    /// channel being served, so only outgoing channels are closed.
    fn die(self: &Arc<Self>) {
        if self.mark_dead() {
            warn!(address = %self.address, "Node is dead");
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.release_peers().await });
    }

    async fn release_peers(&self) {
        for (_, channel) in self.neighbor_channels.lock().await.drain() {
            channel.close();
        }
        for (_, channel) in self.client_channels.lock().await.drain() {
            channel.close();
        }
    }

    fn apply_commit(self: &Arc<Self>, epoch: u64, neighbors: Vec<NeighborInfo>) {
        let removed: Vec<NodeAddress> = {
            let mut set = write(&self.neighbors);
            if epoch <= set.epoch {
                debug!(address = %self.address, epoch, current = set.epoch, "Ignoring stale neighbor list");
                return;
            }
            let removed = set
                .list
                .iter()
                .filter(|old| !neighbors.iter().any(|n| n.address == old.address))
                .map(|old| old.address.clone())
                .collect();
            info!(address = %self.address, epoch, neighbors = neighbors.len(), "Neighbor list replaced");
            *set = NeighborSet {
                epoch,
                list: neighbors,
            };
            removed
        };

        if !removed.is_empty() {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let mut channels = inner.neighbor_channels.lock().await;
                for address in removed {
                    if let Some(channel) = channels.remove(&address) {
                        channel.close();
                    }
                }
            });
        }
    }

    fn handle_query(self: &Arc<Self>, mut query: QueryMessage) {
        let load = {
            let mut tracker = lock(&self.load);
            tracker.add_event();
            tracker.get_load()
        };
        let neighbors = read(&self.neighbors).list.clone();
        let decision = lock(&self.router).route(load, &mut query, &neighbors, &self.address);
        debug!(address = %self.address, id = query.id, load, ?decision, "Routing query");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            match decision {
                RouteDecision::Local => inner.deliver(query).await,
                RouteDecision::Forward(next) => inner.forward(next, query).await,
            }
        });
    }

    async fn forward(self: Arc<Self>, next: NodeAddress, query: QueryMessage) {
        if !self.config.fake_latency.is_zero() {
            tokio::time::sleep(self.config.fake_latency).await;
        }

        let id = query.id;
        let outcome = match self.neighbor_channel(&next).await {
            Ok(channel) => channel
                .request(Message::QueryMessage(query.clone()))
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(reply) if reply.is_ack() => {
                debug!(address = %self.address, id, %next, "Query forwarded");
                return;
            }
            Ok(reply) => {
                warn!(address = %self.address, id, %next, status = ?reply.status(), "Neighbor refused query, serving locally");
            }
            Err(e) => {
                warn!(address = %self.address, id, %next, "Forward failed, serving locally: {}", e);
                self.neighbor_channels.lock().await.remove(&next);
            }
        }
        // The failed hop stays on the path.
        self.deliver(query).await;
    }

    async fn neighbor_channel(self: &Arc<Self>, address: &NodeAddress) -> Result<MessagingChannel> {
        self.cached_channel(&self.neighbor_channels, address).await
    }

    /// Reuse a live channel from `cache` or open a new one. The map stays
    /// unlocked while connecting.
    async fn cached_channel(
        self: &Arc<Self>,
        cache: &tokio::sync::Mutex<HashMap<NodeAddress, MessagingChannel>>,
        address: &NodeAddress,
    ) -> Result<MessagingChannel> {
        if let Some(channel) = cache.lock().await.get(address) {
            if !channel.is_closed() {
                return Ok(channel.clone());
            }
        }

        let channel = MessagingChannel::connect(address, self.handler()).await?;
        let mut channels = cache.lock().await;
        match channels.get(address) {
            // Lost a race with another connect to the same peer.
            Some(existing) if !existing.is_closed() => {
                channel.close();
                Ok(existing.clone())
            }
            _ => {
                channels.insert(address.clone(), channel.clone());
                Ok(channel)
            }
        }
    }

    async fn deliver(self: Arc<Self>, query: QueryMessage) {
        let id = query.id;
        let client = query.client.clone();
        let hops = query.debug_path.len();
        let result = Message::QueryResult {
            id,
            debug_path: query.debug_path,
        };

        let delivered = if self.config.reuse_client_connections {
            self.deliver_cached(&client, result).await
        } else {
            match MessagingChannel::connect(&client, self.handler()).await {
                Ok(channel) => {
                    let reply = channel.request(result).await;
                    channel.close();
                    reply.map_err(Error::from)
                }
                Err(e) => Err(e.into()),
            }
        };

        match delivered {
            Ok(_) => {
                debug!(address = %self.address, id, %client, hops, "Query served");
                self.sink
                    .write(&format!("query {id} served by {} after {hops} hops", self.address));
            }
            Err(e) => warn!(address = %self.address, id, %client, "Failed to deliver result: {}", e),
        }
    }

    async fn deliver_cached(self: &Arc<Self>, client: &NodeAddress, result: Message) -> Result<Message> {
        let channel = self.cached_channel(&self.client_channels, client).await?;
        let reply = channel.request(result).await;
        if reply.is_err() {
            self.client_channels.lock().await.remove(client);
        }
        Ok(reply?)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut state = self.state.subscribe();
        info!(address = %self.address, "Node listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(address = %self.address, %peer, "Accepted connection");
                        match MessagingChannel::from_tcp(stream, self.handler()) {
                            Ok(channel) => {
                                let mut accepted = lock(&self.accepted);
                                accepted.retain(|c| !c.is_closed());
                                accepted.push(channel);
                            }
                            Err(e) => warn!(%peer, "Failed to set up channel: {}", e),
                        }
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = state.wait_for(|s| *s == NodeState::Dead) => break,
            }
        }
        debug!(address = %self.address, "Listener closed");
    }

    async fn report_load(self: Arc<Self>) {
        let mut state = self.state.subscribe();
        let mut ticker = tokio::time::interval(self.config.load_report_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.state() != NodeState::Active {
                        continue;
                    }
                    let load = lock(&self.load).get_load();
                    let coordinator = lock(&self.coordinator).clone();
                    if let Some(channel) = coordinator {
                        let report = Message::Load { address: self.address.clone(), load };
                        if let Err(e) = channel.notify(report) {
                            warn!(address = %self.address, "Load report failed: {}", e);
                        }
                    }
                }
                _ = state.wait_for(|s| *s == NodeState::Dead) => break,
            }
        }
    }
}
