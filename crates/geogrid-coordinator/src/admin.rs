//! The coordinator node.
//!
//! Accepts node connections, admits JOINs until capacity, then builds the
//! grid: every admitted node gets its neighbor list (ADD_TO_GRID) and, once
//! all of them acknowledged, an ACTIVATE. After that the coordinator only
//! collects load reports, grows the grid on SUBDIVISION_REQUEST and finally
//! broadcasts SHUTDOWN.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use geogrid_protocol::{
    bind_listener, tracing_sink, Message, MessageHandler, MessagingChannel, NodeAddress,
    SharedSink, STATUS_GROWTH_REJECTED, STATUS_NOT_SIGNUP, STATUS_PROTOCOL_VIOLATION,
};
use geogrid_topology::{Adjacency, Location};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::admission::{JoinRequest, JoinRequestManager};
use crate::config::AdminConfig;
use crate::error::Result;
use crate::grid::{Grid, NodeRecord};
use crate::lock;
use crate::state::{GridPhase, GridState, PhaseTracker};

/// Outcome of the initial grid build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Signup still open, or neighbor lists still being pushed.
    Pending,
    /// Every admitted node acknowledged its neighbors and was activated.
    Active,
    /// Some node did not acknowledge; the grid was not activated.
    Failed,
}

#[derive(Default)]
struct GrowthLedger {
    granted: usize,
    pending: HashSet<NodeAddress>,
}

struct AdminInner {
    config: AdminConfig,
    phase: PhaseTracker,
    admissions: JoinRequestManager<MessagingChannel>,
    grid: Mutex<Grid>,
    /// Channels of every node in the grid, signup and growth alike.
    members: Mutex<HashMap<NodeAddress, MessagingChannel>>,
    loads: Mutex<HashMap<NodeAddress, f64>>,
    growth: Mutex<GrowthLedger>,
    /// Held for the whole of one growth step.
    growth_serial: tokio::sync::Mutex<()>,
    activation: watch::Sender<Activation>,
    shutdown: watch::Sender<bool>,
    sink: SharedSink,
}

/// Grid coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdminNode {
    inner: Arc<AdminInner>,
}

struct AdminHandler {
    inner: Arc<AdminInner>,
}

impl MessageHandler for AdminHandler {
    fn process_incoming(&self, channel: &MessagingChannel, message: Message) -> Message {
        self.inner.process(channel, message)
    }
}

impl AdminNode {
    /// Create a coordinator using the adjacency named in `config`.
    pub fn new(config: AdminConfig) -> Self {
        let adjacency = config.adjacency.build();
        Self::with_collaborators(config, adjacency, tracing_sink())
    }

    /// Create a coordinator with an explicit adjacency and telemetry sink.
    pub fn with_collaborators(config: AdminConfig, adjacency: Box<dyn Adjacency>, sink: SharedSink) -> Self {
        let (activation, _) = watch::channel(Activation::Pending);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(AdminInner {
                admissions: JoinRequestManager::new(config.capacity),
                phase: PhaseTracker::new(),
                grid: Mutex::new(Grid::new(adjacency)),
                members: Mutex::new(HashMap::new()),
                loads: Mutex::new(HashMap::new()),
                growth: Mutex::new(GrowthLedger::default()),
                growth_serial: tokio::sync::Mutex::new(()),
                activation,
                shutdown,
                sink,
                config,
            }),
        }
    }

    /// Handler to attach to channels whose peer is a cache node.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(AdminHandler {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = bind_listener(self.inner.config.listen_addr)?;
        self.serve(listener).await
    }

    /// Accept node connections on `listener` until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut stopped = self.inner.shutdown.subscribe();
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            capacity = self.inner.admissions.capacity(),
            adjacency = %self.inner.config.adjacency,
            "Coordinator listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "Accepted node connection");
                        if let Err(e) = MessagingChannel::from_tcp(stream, self.handler()) {
                            tracing::warn!(%peer, "Failed to set up node channel: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept node connection: {}", e);
                    }
                },
                _ = stopped.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!("Coordinator stopped accepting connections");
        Ok(())
    }

    /// Broadcast SHUTDOWN to every known node and stop serving.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        let previous = inner.phase.advance(GridPhase::Shutdown)?;
        tracing::info!(%previous, "Shutting down grid");

        let mut targets = lock(&inner.members).clone();
        for (request, channel) in inner.admissions.entries() {
            targets.entry(request.address).or_insert(channel);
        }

        let failed = inner
            .push_all(
                targets
                    .iter()
                    .map(|(address, channel)| (address.clone(), channel.clone(), Message::Shutdown)),
            )
            .await;
        if failed > 0 {
            tracing::warn!(failed, "Some nodes did not acknowledge SHUTDOWN");
        }

        for channel in targets.values() {
            channel.close();
        }
        inner.shutdown.send_replace(true);
        inner.sink.write(&format!("grid shut down: {} nodes", targets.len()));
        Ok(())
    }

    pub fn phase(&self) -> GridPhase {
        self.inner.phase.current()
    }

    pub fn state(&self) -> GridState {
        GridState {
            phase: self.inner.phase.current(),
            capacity: self.inner.admissions.capacity(),
            admitted: self.inner.admissions.admitted(),
        }
    }

    pub fn activation(&self) -> Activation {
        *self.inner.activation.borrow()
    }

    /// Wait until the initial build either activated the grid or failed.
    pub async fn wait_activation(&self) -> Activation {
        let mut rx = self.inner.activation.subscribe();
        let outcome = rx.wait_for(|a| *a != Activation::Pending).await.map(|a| *a);
        outcome.unwrap_or(Activation::Failed)
    }

    /// Admitted join requests in admission order.
    pub fn admitted(&self) -> Vec<JoinRequest> {
        self.inner.admissions.requests()
    }

    /// Node records in insertion order, with their neighbor sets.
    pub fn records(&self) -> Vec<NodeRecord> {
        lock(&self.inner.grid).records()
    }

    pub fn grid_epoch(&self) -> u64 {
        lock(&self.inner.grid).epoch()
    }

    /// Latest load reported by each node.
    pub fn loads(&self) -> HashMap<NodeAddress, f64> {
        lock(&self.inner.loads).clone()
    }
}

impl AdminInner {
    fn process(self: &Arc<Self>, channel: &MessagingChannel, message: Message) -> Message {
        match message {
            Message::Join { address, location } => self.handle_join(channel, address, location),
            Message::Load { address, load } => {
                tracing::debug!(%address, load, "Load report");
                lock(&self.loads).insert(address, load);
                Message::ok()
            }
            Message::SubdivisionRequest { address, location } => {
                self.handle_subdivision(channel, address, location)
            }
            other => {
                tracing::warn!(peer = channel.peer(), kind = %other.kind(), "Unexpected message at coordinator");
                Message::confirm(
                    STATUS_PROTOCOL_VIOLATION,
                    format!("{} is not accepted by the coordinator", other.kind()),
                )
            }
        }
    }

    fn handle_join(self: &Arc<Self>, channel: &MessagingChannel, address: NodeAddress, location: Location) -> Message {
        let phase = self.phase.current();
        if phase != GridPhase::Signup {
            tracing::info!(%address, %phase, "JOIN outside signup");
            return Message::confirm(STATUS_NOT_SIGNUP, format!("coordinator is in {phase}"));
        }
        if !location.is_finite() {
            return Message::confirm(STATUS_PROTOCOL_VIOLATION, "location must be finite");
        }

        self.admit(channel, JoinRequest { address, location })
    }

    fn admit(self: &Arc<Self>, channel: &MessagingChannel, request: JoinRequest) -> Message {
        let JoinRequest { address, location } = request.clone();
        let admitted = match self.admissions.try_admit(request, channel.clone()) {
            Err(rejection) => {
                tracing::info!(%address, %rejection, "JOIN rejected");
                self.sink.write(&format!("join rejected: {address} ({rejection})"));
                return Message::confirm(rejection.status(), rejection.to_string());
            }
            Ok(admitted) => admitted,
        };

        // A shutdown that started after the phase check may have missed this node.
        if self.phase.current() == GridPhase::Shutdown {
            tracing::info!(%address, "JOIN admitted during shutdown, sending SHUTDOWN");
            let channel = channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.request(Message::Shutdown).await {
                    tracing::warn!(%address, "SHUTDOWN to late joiner failed: {}", e);
                }
                channel.close();
            });
            return Message::confirm(STATUS_NOT_SIGNUP, "coordinator is shutting down");
        }

        tracing::info!(
            %address,
            %location,
            count = admitted.count,
            capacity = self.admissions.capacity(),
            "Node admitted"
        );
        self.sink.write(&format!("node admitted: {address} at {location}"));

        if admitted.completes {
            match self.phase.advance(GridPhase::Running) {
                Ok(_) => {
                    let inner = Arc::clone(self);
                    tokio::spawn(async move { inner.build_and_activate().await });
                }
                Err(e) => tracing::warn!("Capacity reached but grid not built: {}", e),
            }
        }
        Message::ok()
    }

    async fn build_and_activate(self: Arc<Self>) {
        let entries = self.admissions.entries();
        let (epoch, pushes) = {
            let mut grid = lock(&self.grid);
            for (request, _) in &entries {
                grid.insert(request.address.clone(), request.location);
            }
            let epoch = grid.rebuild();
            let pushes: Vec<_> = entries
                .iter()
                .map(|(request, channel)| {
                    let neighbors = grid.neighbors_of(&request.address);
                    (request.address.clone(), channel.clone(), neighbors)
                })
                .collect();
            (epoch, pushes)
        };
        {
            let mut members = lock(&self.members);
            for (address, channel, _) in &pushes {
                members.insert(address.clone(), channel.clone());
            }
        }
        tracing::info!(nodes = pushes.len(), epoch, "Grid built, pushing neighbor lists");

        let failed = self
            .push_all(pushes.iter().map(|(address, channel, neighbors)| {
                let message = Message::AddToGrid {
                    epoch,
                    neighbors: neighbors.clone(),
                };
                (address.clone(), channel.clone(), message)
            }))
            .await;
        if failed > 0 {
            tracing::error!(failed, "Neighbor lists not acknowledged, grid not activated");
            self.sink.write(&format!("grid activation failed: {failed} nodes did not acknowledge"));
            self.activation.send_replace(Activation::Failed);
            return;
        }

        let failed = self
            .push_all(
                pushes
                    .iter()
                    .map(|(address, channel, _)| (address.clone(), channel.clone(), Message::Activate)),
            )
            .await;
        if failed > 0 {
            tracing::error!(failed, "ACTIVATE not acknowledged");
            self.activation.send_replace(Activation::Failed);
            return;
        }

        tracing::info!(nodes = pushes.len(), epoch, "Grid active");
        self.sink.write(&format!("grid activated: {} nodes, epoch {epoch}", pushes.len()));
        self.activation.send_replace(Activation::Active);
    }

    fn handle_subdivision(
        self: &Arc<Self>,
        channel: &MessagingChannel,
        address: NodeAddress,
        location: Location,
    ) -> Message {
        if *self.activation.borrow() != Activation::Active || self.phase.current() != GridPhase::Running {
            return Message::confirm(STATUS_GROWTH_REJECTED, "grid is not running");
        }
        if !location.is_finite() {
            return Message::confirm(STATUS_PROTOCOL_VIOLATION, "location must be finite");
        }

        {
            let mut growth = lock(&self.growth);
            if growth.pending.contains(&address) || lock(&self.grid).contains(&address) {
                return Message::confirm(STATUS_GROWTH_REJECTED, "address already in grid");
            }
            if growth.granted >= self.config.growth_limit {
                tracing::info!(%address, limit = self.config.growth_limit, "Growth budget exhausted");
                return Message::confirm(STATUS_GROWTH_REJECTED, "growth budget exhausted");
            }
            growth.granted += 1;
            growth.pending.insert(address.clone());
        }

        tracing::info!(%address, %location, "Growth granted");
        let inner = Arc::clone(self);
        let channel = channel.clone();
        tokio::spawn(async move { inner.grow(address, location, channel).await });
        Message::ok()
    }

    async fn grow(self: Arc<Self>, address: NodeAddress, location: Location, channel: MessagingChannel) {
        let _serial = self.growth_serial.lock().await;

        let updates = lock(&self.grid)
            .add_node(address.clone(), location)
            .unwrap_or_default();
        // The new node's own list comes first.
        let mut updates = updates.into_iter();
        match updates.next() {
            None => tracing::warn!(%address, "Growth skipped, address already in grid"),
            Some(own) => {
                lock(&self.members).insert(address.clone(), channel.clone());
                let epoch = own.epoch;
                let commits: Vec<_> = {
                    let members = lock(&self.members);
                    updates
                        .filter_map(|update| {
                            let target = members.get(&update.address)?.clone();
                            let commit = Message::SubdivisionCommit {
                                epoch: update.epoch,
                                neighbors: update.neighbors,
                            };
                            Some((update.address, target, commit))
                        })
                        .collect()
                };
                let affected = commits.len();

                // The new node is active before anyone can route to it.
                let own_list = Message::AddToGrid {
                    epoch,
                    neighbors: own.neighbors,
                };
                let mut failed = self.push_all([(address.clone(), channel.clone(), own_list)]).await;
                if failed == 0 {
                    failed = self
                        .push_all([(address.clone(), channel.clone(), Message::Activate)])
                        .await;
                }
                if failed == 0 {
                    failed = self.push_all(commits).await;
                }

                if failed == 0 {
                    tracing::info!(%address, epoch, affected, "Grid grew");
                    self.sink.write(&format!("grid grew: {address} added at epoch {epoch}"));
                } else {
                    tracing::error!(%address, epoch, failed, "Growth step not acknowledged");
                    self.sink.write(&format!("growth incomplete: {address} at epoch {epoch}"));
                }
            }
        }

        lock(&self.growth).pending.remove(&address);
    }

    /// Send each message as a request and wait for every reply.
    /// Returns how many were not acknowledged.
    async fn push_all(&self, pushes: impl IntoIterator<Item = (NodeAddress, MessagingChannel, Message)>) -> usize {
        let results = join_all(pushes.into_iter().map(|(address, channel, message)| async move {
            let kind = message.kind();
            match channel.request(message).await {
                Ok(reply) if reply.is_ack() => true,
                Ok(reply) => {
                    tracing::warn!(%address, %kind, status = ?reply.status(), "Push refused");
                    false
                }
                Err(e) => {
                    tracing::warn!(%address, %kind, "Push failed: {}", e);
                    false
                }
            }
        }))
        .await;
        results.into_iter().filter(|acked| !acked).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::tests::ChainAdjacency;
    use geogrid_protocol::{handler_fn, MemorySink, STATUS_DUPLICATE, STATUS_FULL, STATUS_OK};
    use geogrid_topology::NearestNeighbors;
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    fn config(capacity: usize) -> AdminConfig {
        AdminConfig::new("127.0.0.1:0".parse().unwrap(), NonZeroUsize::new(capacity).unwrap())
    }

    fn admin(config: AdminConfig) -> AdminNode {
        AdminNode::with_collaborators(config, Box::new(NearestNeighbors::default()), tracing_sink())
    }

    /// Acknowledges everything the way a healthy node would.
    fn ack(message: &Message) -> Message {
        match message {
            Message::SubdivisionCommit { epoch, .. } => Message::SubdivisionConfirm { epoch: *epoch },
            _ => Message::ok(),
        }
    }

    fn refuse_neighbors(message: &Message) -> Message {
        match message {
            Message::AddToGrid { .. } => Message::confirm(STATUS_PROTOCOL_VIOLATION, "no"),
            other => ack(other),
        }
    }

    /// A node connected to the coordinator over an in-memory pipe.
    struct FakeNode {
        address: NodeAddress,
        location: Location,
        channel: MessagingChannel,
        /// The coordinator's end of the pipe.
        link: MessagingChannel,
        received: mpsc::UnboundedReceiver<Message>,
    }

    impl FakeNode {
        fn connect(admin: &AdminNode, port: u16, reply: fn(&Message) -> Message) -> Self {
            let (tx, received) = mpsc::unbounded_channel();
            let handler = handler_fn(move |_, message| {
                let response = reply(&message);
                let _ = tx.send(message);
                response
            });
            let (a, b) = tokio::io::duplex(64 * 1024);
            let link = MessagingChannel::establish(a, format!("node-{port}"), admin.handler());
            Self {
                address: NodeAddress::new("127.0.0.1", port),
                location: Location::new(port as f64, 0.0),
                channel: MessagingChannel::establish(b, "coordinator", handler),
                link,
                received,
            }
        }

        async fn join(&self) -> Message {
            let join = Message::Join {
                address: self.address.clone(),
                location: self.location,
            };
            self.channel.request(join).await.unwrap()
        }

        async fn subdivide(&self) -> Message {
            let request = Message::SubdivisionRequest {
                address: self.address.clone(),
                location: self.location,
            };
            self.channel.request(request).await.unwrap()
        }

        async fn next(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(5), self.received.recv())
                .await
                .expect("timed out waiting for coordinator")
                .expect("handler dropped")
        }

        async fn assert_silent(&mut self) {
            let got = tokio::time::timeout(Duration::from_millis(100), self.received.recv()).await;
            assert!(got.is_err(), "unexpected message: {got:?}");
        }
    }

    #[tokio::test]
    async fn capacity_three_of_five_concurrent_joins() {
        let adjacency = ChainAdjacency::default();
        let seen = Arc::clone(&adjacency.seen);
        let admin = AdminNode::with_collaborators(config(3), Box::new(adjacency), tracing_sink());

        let mut nodes: Vec<_> = (1..=5).map(|p| FakeNode::connect(&admin, p, ack)).collect();
        let replies = join_all(nodes.iter().map(|n| n.join())).await;

        let statuses: Vec<_> = replies.iter().map(|r| r.status().unwrap()).collect();
        assert_eq!(statuses.iter().filter(|s| **s == STATUS_OK).count(), 3);
        // Late arrivals see either the full ledger or the closed signup.
        let refused = statuses
            .iter()
            .filter(|s| **s == STATUS_FULL || **s == STATUS_NOT_SIGNUP)
            .count();
        assert_eq!(refused, 2);

        assert_eq!(admin.wait_activation().await, Activation::Active);
        assert_eq!(admin.phase(), GridPhase::Running);
        assert_eq!(admin.state().admitted, 3);

        let admitted_locations: Vec<_> = admin.admitted().iter().map(|r| r.location).collect();
        let mut fed = seen.lock().unwrap().clone();
        fed.sort_by(|a, b| a.x.total_cmp(&b.x));
        let mut expected = admitted_locations.clone();
        expected.sort_by(|a, b| a.x.total_cmp(&b.x));
        assert_eq!(fed, expected);

        for (node, status) in nodes.iter_mut().zip(statuses) {
            if status == STATUS_OK {
                assert!(matches!(node.next().await, Message::AddToGrid { epoch: 1, .. }));
                assert_eq!(node.next().await, Message::Activate);
            } else {
                node.assert_silent().await;
            }
        }
    }

    #[tokio::test]
    async fn duplicate_join_is_rejected() {
        let admin = admin(config(2));
        let node = FakeNode::connect(&admin, 1, ack);

        assert_eq!(node.join().await.status(), Some(STATUS_OK));
        assert_eq!(node.join().await.status(), Some(STATUS_DUPLICATE));
        assert_eq!(admin.state().admitted, 1);
        assert_eq!(admin.activation(), Activation::Pending);
    }

    #[tokio::test]
    async fn join_after_signup_is_refused() {
        let admin = admin(config(1));
        let first = FakeNode::connect(&admin, 1, ack);
        let late = FakeNode::connect(&admin, 2, ack);

        assert_eq!(first.join().await.status(), Some(STATUS_OK));
        assert_eq!(admin.wait_activation().await, Activation::Active);
        assert_eq!(late.join().await.status(), Some(STATUS_NOT_SIGNUP));
    }

    #[tokio::test]
    async fn unacknowledged_neighbors_block_activation() {
        let admin = admin(config(2));
        let mut good = FakeNode::connect(&admin, 1, ack);
        let bad = FakeNode::connect(&admin, 2, refuse_neighbors);

        assert_eq!(good.join().await.status(), Some(STATUS_OK));
        assert_eq!(bad.join().await.status(), Some(STATUS_OK));
        assert_eq!(admin.wait_activation().await, Activation::Failed);

        assert!(matches!(good.next().await, Message::AddToGrid { .. }));
        good.assert_silent().await;
    }

    #[tokio::test]
    async fn load_reports_are_recorded() {
        let admin = admin(config(4));
        let node = FakeNode::connect(&admin, 9, ack);

        let report = Message::Load {
            address: node.address.clone(),
            load: 0.75,
        };
        assert!(node.channel.request(report).await.unwrap().is_ack());
        assert_eq!(admin.loads().get(&node.address), Some(&0.75));
    }

    #[tokio::test]
    async fn unexpected_message_is_a_protocol_violation() {
        let admin = admin(config(1));
        let node = FakeNode::connect(&admin, 1, ack);
        let reply = node.channel.request(Message::Activate).await.unwrap();
        assert_eq!(reply.status(), Some(STATUS_PROTOCOL_VIOLATION));
    }

    #[tokio::test]
    async fn subdivision_before_running_is_rejected() {
        let admin = admin(config(2).with_growth_limit(4));
        let node = FakeNode::connect(&admin, 1, ack);
        assert_eq!(node.subdivide().await.status(), Some(STATUS_GROWTH_REJECTED));
    }

    #[tokio::test]
    async fn growth_pushes_changed_neighbor_sets() {
        let sink = Arc::new(MemorySink::new());
        let admin = AdminNode::with_collaborators(
            config(2).with_growth_limit(1),
            Box::new(NearestNeighbors::default()),
            sink.clone(),
        );
        let mut a = FakeNode::connect(&admin, 1, ack);
        let mut b = FakeNode::connect(&admin, 2, ack);
        let mut c = FakeNode::connect(&admin, 3, ack);
        let d = FakeNode::connect(&admin, 4, ack);

        a.join().await;
        b.join().await;
        assert_eq!(admin.wait_activation().await, Activation::Active);
        for node in [&mut a, &mut b] {
            assert!(matches!(node.next().await, Message::AddToGrid { .. }));
            assert_eq!(node.next().await, Message::Activate);
        }

        // A member cannot grow the grid a second time.
        assert_eq!(a.subdivide().await.status(), Some(STATUS_GROWTH_REJECTED));

        assert!(c.subdivide().await.is_ack());
        match c.next().await {
            Message::AddToGrid { epoch, neighbors } => {
                assert_eq!(epoch, 2);
                assert_eq!(neighbors.len(), 2);
            }
            other => panic!("expected ADD_TO_GRID, got {other:?}"),
        }
        assert_eq!(c.next().await, Message::Activate);
        for node in [&mut a, &mut b] {
            match node.next().await {
                Message::SubdivisionCommit { epoch, neighbors } => {
                    assert_eq!(epoch, 2);
                    assert!(neighbors.iter().any(|n| n.address == c.address));
                }
                other => panic!("expected SUBDIVISION_COMMIT, got {other:?}"),
            }
        }

        assert_eq!(d.subdivide().await.status(), Some(STATUS_GROWTH_REJECTED));
        assert_eq!(admin.records().len(), 3);
        assert_eq!(admin.grid_epoch(), 2);
        assert_eq!(sink.count("grid grew"), 1);
    }

    #[tokio::test]
    async fn shutdown_reaches_every_node_once() {
        let admin = admin(config(1));
        let mut node = FakeNode::connect(&admin, 1, ack);
        node.join().await;
        assert_eq!(admin.wait_activation().await, Activation::Active);
        node.next().await;
        node.next().await;

        assert_ok!(admin.shutdown().await);
        assert_eq!(node.next().await, Message::Shutdown);
        assert_eq!(admin.phase(), GridPhase::Shutdown);
        assert_err!(admin.shutdown().await);
    }

    #[tokio::test]
    async fn admission_racing_shutdown_still_gets_shutdown() {
        let admin = admin(config(3));
        let mut node = FakeNode::connect(&admin, 1, ack);
        assert_ok!(admin.shutdown().await);

        // The JOIN passed its phase check just before shutdown began.
        let request = JoinRequest {
            address: node.address.clone(),
            location: node.location,
        };
        let reply = admin.inner.admit(&node.link, request);
        assert_eq!(reply.status(), Some(STATUS_NOT_SIGNUP));
        assert_eq!(node.next().await, Message::Shutdown);
        tokio::time::timeout(Duration::from_secs(5), node.link.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn serves_over_tcp_until_shutdown() {
        let admin = admin(config(2));
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = NodeAddress::from(listener.local_addr().unwrap());

        let server = {
            let admin = admin.clone();
            tokio::spawn(async move { admin.serve(listener).await })
        };

        let channel = MessagingChannel::connect(&addr, handler_fn(|_, m| ack(&m))).await.unwrap();
        let join = Message::Join {
            address: NodeAddress::new("127.0.0.1", 5001),
            location: Location::new(1.0, 2.0),
        };
        assert!(channel.request(join).await.unwrap().is_ack());
        assert_eq!(admin.state().admitted, 1);

        assert_ok!(admin.shutdown().await);
        let served = tokio::time::timeout(Duration::from_secs(5), server).await;
        assert!(matches!(served, Ok(Ok(Ok(())))));
    }
}
