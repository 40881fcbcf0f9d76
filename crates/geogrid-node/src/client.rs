//! Query client.
//!
//! Sends location-tagged queries into the grid and waits for the result,
//! which arrives on the client's own listener from whichever node served it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use geogrid_protocol::{
    bind_listener, Message, MessageHandler, MessagingChannel, NodeAddress, QueryMessage,
    STATUS_PROTOCOL_VIOLATION,
};
use geogrid_topology::Location;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lock;

/// A served query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub id: u64,
    /// Nodes that forwarded the query before it was served.
    pub debug_path: Vec<NodeAddress>,
}

impl QueryOutcome {
    pub fn hops(&self) -> usize {
        self.debug_path.len()
    }
}

struct ClientInner {
    address: NodeAddress,
    next_id: AtomicU64,
    waiting: Mutex<HashMap<u64, oneshot::Sender<Vec<NodeAddress>>>>,
    /// One channel per entry node.
    entries: tokio::sync::Mutex<HashMap<NodeAddress, MessagingChannel>>,
    stop: watch::Sender<bool>,
}

impl MessageHandler for ClientInner {
    fn process_incoming(&self, _channel: &MessagingChannel, message: Message) -> Message {
        match message {
            Message::QueryResult { id, debug_path } => match lock(&self.waiting).remove(&id) {
                Some(waiter) => {
                    debug!(id, hops = debug_path.len(), "Query result received");
                    let _ = waiter.send(debug_path);
                    Message::ok()
                }
                None => {
                    warn!(id, "Result for unknown query");
                    Message::confirm(STATUS_PROTOCOL_VIOLATION, format!("unknown query {id}"))
                }
            },
            other => Message::confirm(
                STATUS_PROTOCOL_VIOLATION,
                format!("{} is not accepted by a client", other.kind()),
            ),
        }
    }
}

/// Client that injects queries and collects their results.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    /// Bind the result listener. Must be called inside a Tokio runtime.
    pub fn bind(listen_addr: SocketAddr, advertise_host: impl Into<String>) -> Result<Self> {
        let listener = bind_listener(listen_addr)?;
        let address = NodeAddress::new(advertise_host, listener.local_addr()?.port());
        let (stop, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            address,
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
            entries: tokio::sync::Mutex::new(HashMap::new()),
            stop,
        });
        tokio::spawn(accept_results(Arc::clone(&inner), listener));
        Ok(Self { inner })
    }

    /// Where results are delivered.
    pub fn address(&self) -> &NodeAddress {
        &self.inner.address
    }

    /// Send a query to `entry` and wait for its result.
    pub async fn query(&self, entry: &NodeAddress, location: Location, ttl: u32) -> Result<QueryOutcome> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.waiting).insert(id, tx);

        let query = QueryMessage::new(id, location, self.inner.address.clone(), ttl);
        if let Err(e) = self.send(entry, query).await {
            lock(&self.inner.waiting).remove(&id);
            return Err(e);
        }

        let debug_path = rx
            .await
            .map_err(|_| Error::QueryRefused(format!("query {id} abandoned")))?;
        Ok(QueryOutcome { id, debug_path })
    }

    async fn send(&self, entry: &NodeAddress, query: QueryMessage) -> Result<()> {
        let channel = {
            let mut entries = self.inner.entries.lock().await;
            match entries.get(entry) {
                Some(channel) if !channel.is_closed() => channel.clone(),
                _ => {
                    let handler: Arc<dyn MessageHandler> = self.inner.clone();
                    let channel = MessagingChannel::connect(entry, handler).await?;
                    entries.insert(entry.clone(), channel.clone());
                    channel
                }
            }
        };

        let reply = channel.request(Message::QueryMessage(query)).await?;
        if reply.is_ack() {
            Ok(())
        } else {
            Err(Error::QueryRefused(format!(
                "{entry} answered status {:?}",
                reply.status()
            )))
        }
    }

    /// Stop listening and drop every entry channel. Waiting queries fail.
    pub async fn close(&self) {
        self.inner.stop.send_replace(true);
        for (_, channel) in self.inner.entries.lock().await.drain() {
            channel.close();
        }
        lock(&self.inner.waiting).clear();
    }
}

async fn accept_results(inner: Arc<ClientInner>, listener: TcpListener) {
    let mut stop = inner.stop.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler: Arc<dyn MessageHandler> = inner.clone();
                    if let Err(e) = MessagingChannel::from_tcp(stream, handler) {
                        warn!(%peer, "Failed to set up result channel: {}", e);
                    }
                }
                Err(e) => warn!("Accept error: {}", e),
            },
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }
}
